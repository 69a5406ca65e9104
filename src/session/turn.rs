//! The PROCESSING and SPEAKING half of a session
//!
//! Every collaborator call races the stop signal and is bounded by the
//! collaborator timeout. Whatever happens, the session ends in IDLE.

use std::future::Future;

use super::{SessionMachine, SessionState};
use crate::agent::{ConversationContext, Responder};
use crate::config::Config;
use crate::voice::{AudioClip, PlaybackOutcome, PlaybackSink, Synthesizer, Transcriber, Utterance};
use crate::{Error, Result};

/// External collaborators of one pipeline
pub struct Collaborators {
    pub transcriber: Box<dyn Transcriber>,
    pub responder: Box<dyn Responder>,
    pub synthesizer: Box<dyn Synthesizer>,
    pub playback: Box<dyn PlaybackSink>,
    pub context: ConversationContext,
    /// Spoken after an empty or failed turn
    pub apology: Option<String>,
    /// Lowercase phrases that end the turn without a reply
    pub stop_phrases: Vec<String>,
}

impl Collaborators {
    /// Bundle collaborators with the session settings from `config`
    #[must_use]
    pub fn new(
        config: &Config,
        transcriber: Box<dyn Transcriber>,
        responder: Box<dyn Responder>,
        synthesizer: Box<dyn Synthesizer>,
        playback: Box<dyn PlaybackSink>,
    ) -> Self {
        Self {
            transcriber,
            responder,
            synthesizer,
            playback,
            context: ConversationContext::from_config(&config.context),
            apology: config.session.apology.clone(),
            stop_phrases: config.session.stop_phrases.clone(),
        }
    }

    /// Whether the transcript contains a stop phrase as whole words
    #[must_use]
    pub fn is_stop_command(&self, transcript: &str) -> bool {
        contains_phrase(&self.stop_phrases, transcript)
    }
}

fn contains_phrase(phrases: &[String], transcript: &str) -> bool {
    let words = normalize_words(transcript);
    phrases.iter().any(|phrase| {
        let phrase = normalize_words(phrase);
        !phrase.is_empty()
            && words
                .windows(phrase.len())
                .any(|window| window == phrase.as_slice())
    })
}

fn normalize_words(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// How a turn ended
#[derive(Debug)]
pub enum TurnOutcome {
    /// The reply was spoken in full
    Responded { transcript: String, reply: String },
    /// Nothing was understood, or the reply was empty
    Empty,
    /// The user said a stop phrase
    StopCommand,
    /// A collaborator failed or timed out
    Failed(Error),
    /// The stop signal fired
    Cancelled,
}

enum Step<T> {
    Done(T),
    Failed(Error),
    Cancelled,
}

impl SessionMachine {
    /// Run the PROCESSING and SPEAKING states for a finalized utterance
    ///
    /// Always leaves the session in IDLE.
    pub async fn complete(
        &mut self,
        utterance: Utterance,
        collaborators: &mut Collaborators,
    ) -> TurnOutcome {
        let turn = self.turn_id();
        let outcome = self.run_turn(&utterance, collaborators).await;

        match &outcome {
            TurnOutcome::Responded { .. } => {
                tracing::info!(turn = ?turn, "turn complete");
            }
            TurnOutcome::StopCommand => {
                tracing::info!(turn = ?turn, "stop command heard");
            }
            TurnOutcome::Cancelled => {
                self.stop.take();
                tracing::info!(turn = ?turn, "turn cancelled");
            }
            TurnOutcome::Empty => {
                tracing::info!(turn = ?turn, "nothing to answer");
                self.apologize(collaborators).await;
            }
            TurnOutcome::Failed(e) => {
                tracing::warn!(turn = ?turn, error = %e, "turn failed");
                self.apologize(collaborators).await;
            }
        }

        self.finish_turn();
        outcome
    }

    /// Speak `text` outside a turn (startup greeting)
    ///
    /// # Errors
    ///
    /// Returns error if synthesis or playback fails
    pub async fn announce(&mut self, text: &str, collaborators: &mut Collaborators) -> Result<()> {
        let previous = self.state();
        let result = match self.speak(text, collaborators).await {
            Step::Done(_) | Step::Cancelled => Ok(()),
            Step::Failed(e) => Err(e),
        };
        self.stop.take();
        self.transition(previous);
        result
    }

    async fn run_turn(
        &mut self,
        utterance: &Utterance,
        collaborators: &mut Collaborators,
    ) -> TurnOutcome {
        let transcript = match self
            .guarded("transcription", collaborators.transcriber.transcribe(utterance))
            .await
        {
            Step::Done(text) => text,
            Step::Failed(e) => return TurnOutcome::Failed(e),
            Step::Cancelled => return TurnOutcome::Cancelled,
        };
        if transcript.trim().is_empty() {
            return TurnOutcome::Empty;
        }
        if collaborators.is_stop_command(&transcript) {
            return TurnOutcome::StopCommand;
        }

        let history = collaborators.context.recent();
        let reply = match self
            .guarded(
                "response",
                collaborators.responder.respond(&transcript, &history),
            )
            .await
        {
            Step::Done(reply) => reply,
            Step::Failed(e) => return TurnOutcome::Failed(e),
            Step::Cancelled => return TurnOutcome::Cancelled,
        };
        if reply.trim().is_empty() {
            return TurnOutcome::Empty;
        }

        match self.speak(&reply, collaborators).await {
            Step::Done(()) => {
                collaborators.context.push(transcript.clone(), reply.clone());
                TurnOutcome::Responded { transcript, reply }
            }
            Step::Failed(e) => TurnOutcome::Failed(e),
            Step::Cancelled => TurnOutcome::Cancelled,
        }
    }

    /// Synthesize and play `text`, in SPEAKING while audio renders
    async fn speak(&self, text: &str, collaborators: &mut Collaborators) -> Step<()> {
        let clip: AudioClip = match self
            .guarded("synthesis", collaborators.synthesizer.synthesize(text))
            .await
        {
            Step::Done(clip) => clip,
            Step::Failed(e) => return Step::Failed(e),
            Step::Cancelled => return Step::Cancelled,
        };

        self.transition(SessionState::Speaking);
        // Playback gets the clip length on top of the collaborator bound
        let limit = clip.duration() + self.timing.collaborator_timeout;
        let played = tokio::time::timeout(limit, collaborators.playback.play(&clip, &self.stop))
            .await;

        match played {
            Ok(Ok(PlaybackOutcome::Drained)) if !self.stop.is_requested() => Step::Done(()),
            Ok(Ok(_)) => Step::Cancelled,
            Ok(Err(e)) => Step::Failed(e),
            Err(_) => Step::Failed(Error::Timeout("playback")),
        }
    }

    async fn apologize(&mut self, collaborators: &mut Collaborators) {
        let Some(apology) = collaborators.apology.clone() else {
            return;
        };
        if self.stop.is_requested() {
            return;
        }
        if let Step::Failed(e) = self.speak(&apology, collaborators).await {
            tracing::warn!(error = %e, "could not speak apology");
        }
        self.stop.take();
    }

    /// Await a collaborator call, bounded by the timeout and the stop signal
    async fn guarded<T>(
        &self,
        stage: &'static str,
        call: impl Future<Output = Result<T>>,
    ) -> Step<T> {
        let step = tokio::select! {
            biased;
            () = self.stop.requested() => Step::Cancelled,
            result = tokio::time::timeout(self.timing.collaborator_timeout, call) => match result {
                Ok(Ok(value)) => Step::Done(value),
                Ok(Err(e)) => Step::Failed(e),
                Err(_) => Step::Failed(Error::Timeout(stage)),
            },
        };

        match step {
            Step::Done(_) if self.stop.is_requested() => Step::Cancelled,
            step => {
                if let Step::Failed(e) = &step {
                    tracing::debug!(stage, error = %e, "collaborator call failed");
                }
                step
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_phrases_match_whole_words() {
        let phrases: Vec<String> = ["stop", "para", "never mind"]
            .iter()
            .map(|p| (*p).to_string())
            .collect();

        assert!(contains_phrase(&phrases, "Stop."));
        assert!(contains_phrase(&phrases, "ok, para por favor"));
        assert!(contains_phrase(&phrases, "Never   mind!"));
        assert!(!contains_phrase(&phrases, "what are the parameters"));
        assert!(!contains_phrase(&phrases, "unstoppable"));
        assert!(!contains_phrase(&[], "stop"));
    }
}
