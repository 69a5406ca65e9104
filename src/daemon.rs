//! Daemon - the long-running voice pipeline
//!
//! Wires the frame source, ring buffer, session machine and collaborators
//! together and drives them until shutdown. Audio device streams are not
//! `Send`, so the pipeline runs on the task that owns them.

use std::future::Future;
use std::sync::Arc;

use crate::agent::ChatResponder;
use crate::session::{
    Collaborators, FrameOutcome, SessionMachine, SessionTiming, SharedSession, StopSignal,
    TurnOutcome,
};
use crate::voice::{
    CpalFrameSource, CpalPlayback, FrameReader, FrameSource, RingBuffer, SpeechToText,
    TextToSpeech, VoiceActivityDetector, Volume, WakeWordDetector,
};
use crate::{Config, Error, Result};

/// Counters reported when the pipeline stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub wake_words: u64,
    pub turns: u64,
    pub false_triggers: u64,
    pub cancelled: u64,
    pub frames_dropped: u64,
}

/// The consumer side: frames in, turns out
pub struct Pipeline {
    machine: SessionMachine,
    collaborators: Collaborators,
    reader: FrameReader,
    acknowledge: bool,
    summary: RunSummary,
}

impl Pipeline {
    #[must_use]
    pub fn new(
        machine: SessionMachine,
        collaborators: Collaborators,
        reader: FrameReader,
        acknowledge: bool,
    ) -> Self {
        Self {
            machine,
            collaborators,
            reader,
            acknowledge,
            summary: RunSummary::default(),
        }
    }

    /// Speak a greeting before listening starts
    #[allow(clippy::future_not_send)]
    pub async fn greet(&mut self, text: &str) {
        if let Err(e) = self.machine.announce(text, &mut self.collaborators).await {
            tracing::warn!(error = %e, "could not speak greeting");
        }
        self.reader.skip_to_latest();
    }

    /// Process frames until `shutdown` resolves
    ///
    /// With `once`, the wake word is skipped and the loop ends after the
    /// first capture episode.
    ///
    /// # Errors
    ///
    /// Returns configuration-class errors raised while processing frames
    #[allow(clippy::future_not_send)]
    pub async fn run(
        &mut self,
        shutdown: impl Future<Output = ()>,
        once: bool,
    ) -> Result<RunSummary> {
        tokio::pin!(shutdown);

        if once {
            self.machine.begin_capture();
            tracing::info!("listening for a single command");
        }

        loop {
            let frame = tokio::select! {
                biased;
                () = &mut shutdown => {
                    tracing::info!("shutdown requested");
                    break;
                }
                frame = self.reader.next() => frame,
            };

            let outcome = self.machine.on_frame(frame)?;
            self.collaborators.playback.release_cue();

            match outcome {
                FrameOutcome::WakeWord { keyword, .. } => {
                    self.summary.wake_words += 1;
                    tracing::debug!(
                        keyword = self.machine.detector().keyword_name(keyword).unwrap_or("?"),
                        "wake word accepted"
                    );
                    if self.acknowledge
                        && let Err(e) = self.collaborators.playback.cue()
                    {
                        tracing::warn!(error = %e, "acknowledgment cue failed");
                    }
                }
                FrameOutcome::Finalized(utterance) => {
                    let outcome = tokio::select! {
                        outcome = self.machine.complete(utterance, &mut self.collaborators) => outcome,
                        () = &mut shutdown => {
                            tracing::info!("shutdown requested during turn");
                            self.machine.cancel();
                            break;
                        }
                    };

                    match outcome {
                        TurnOutcome::Cancelled => {
                            self.summary.cancelled += 1;
                            self.reset_audio();
                        }
                        _ => self.summary.turns += 1,
                    }

                    // Audio captured while busy is stale
                    let skipped = self.reader.skip_to_latest();
                    if skipped > 0 {
                        tracing::debug!(frames = skipped, "skipped frames queued during turn");
                    }
                    if once {
                        break;
                    }
                }
                FrameOutcome::FalseTrigger => {
                    self.summary.false_triggers += 1;
                    if once {
                        break;
                    }
                }
                FrameOutcome::Cancelled => {
                    self.summary.cancelled += 1;
                    self.reset_audio();
                    if once {
                        break;
                    }
                }
                FrameOutcome::Idle | FrameOutcome::Capturing | FrameOutcome::Ignored => {}
            }
        }

        self.summary.frames_dropped = self.reader.dropped();
        Ok(self.summary)
    }

    /// Forget buffered audio after a stop so lookback never replays it
    fn reset_audio(&mut self) {
        self.reader.buffer().clear();
        let skipped = self.reader.skip_to_latest();
        tracing::debug!(frames = skipped, "audio buffer reset after stop");
    }

    /// Log wake word statistics
    pub fn log_stats(&self) {
        let stats = self.machine.detector().stats();
        tracing::info!(
            frames = stats.frames_processed,
            detections = stats.total_detections(),
            uptime_secs = stats.uptime.as_secs(),
            turns = self.summary.turns,
            false_triggers = self.summary.false_triggers,
            dropped = self.reader.dropped(),
            "wake word statistics"
        );
        for (keyword, count) in &stats.detections {
            tracing::info!(keyword = %keyword, detections = count, "keyword statistics");
        }
    }

    #[must_use]
    pub const fn machine(&self) -> &SessionMachine {
        &self.machine
    }

    #[must_use]
    pub const fn summary(&self) -> RunSummary {
        self.summary
    }
}

/// The harken daemon - microphone in, spoken replies out
pub struct Daemon {
    config: Config,
    once: bool,
}

impl Daemon {
    #[must_use]
    pub const fn new(config: Config) -> Self {
        Self {
            config,
            once: false,
        }
    }

    /// Skip the wake word and answer a single command
    #[must_use]
    pub fn once(mut self, once: bool) -> Self {
        self.once = once;
        self
    }

    /// Build the session machine for `config`
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a keyword model cannot be loaded or
    /// the VAD rejects the geometry
    pub fn build_machine(
        config: &Config,
        session: SharedSession,
        stop: StopSignal,
    ) -> Result<SessionMachine> {
        let spec = config.frame_spec();
        let detector = WakeWordDetector::from_config(&config.wake_word, spec)?;
        let vad = VoiceActivityDetector::webrtc(spec, config.vad.aggressiveness)?;
        SessionMachine::new(
            detector,
            vad,
            SessionTiming::from_config(config),
            session,
            stop,
        )
    }

    /// Build the HTTP collaborators and the speaker
    ///
    /// # Errors
    ///
    /// Returns error if an API key is missing or the output device fails
    pub fn build_collaborators(config: &Config) -> Result<Collaborators> {
        let transcriber = SpeechToText::from_config(&config.stt, &config.api_keys)?;
        let responder = ChatResponder::from_config(&config.llm, &config.api_keys);
        let synthesizer = TextToSpeech::from_config(&config.tts, &config.api_keys)?;
        let playback = CpalPlayback::new(
            config.audio.output_device.as_deref(),
            Volume::new(i64::from(config.audio.output_volume)),
        )?;

        Ok(Collaborators::new(
            config,
            Box::new(transcriber),
            Box::new(responder),
            Box::new(synthesizer),
            Box::new(playback),
        ))
    }

    /// Run until interrupted (or until one command is answered)
    ///
    /// # Errors
    ///
    /// Returns error if startup fails or a fatal error occurs
    #[allow(clippy::future_not_send)]
    pub async fn run(self) -> Result<RunSummary> {
        let config = self.config;
        if !self.once && config.wake_word.keywords.is_empty() {
            return Err(Error::Config(
                "wake_word.keywords must arm at least one keyword".to_string(),
            ));
        }

        let session = SharedSession::new();
        let stop = StopSignal::new();
        let machine = Self::build_machine(&config, session.clone(), stop.clone())?;
        let collaborators = Self::build_collaborators(&config)?;

        let buffer = Arc::new(RingBuffer::new(config.frame_spec(), config.audio.buffer)?);
        let mut source = CpalFrameSource::new(
            config.audio.input_device.as_deref(),
            Arc::clone(&buffer),
            session,
        )?;
        spawn_stop_listener(stop);

        let mut pipeline = Pipeline::new(
            machine,
            collaborators,
            buffer.reader(),
            config.session.acknowledge,
        );
        if let Some(greeting) = &config.session.greeting {
            pipeline.greet(greeting).await;
        }

        source.start()?;
        tracing::info!(
            keywords = config.wake_word.keywords.len(),
            sample_rate = config.frame_spec().sample_rate(),
            frame_ms = config.frame_spec().frame_duration_ms(),
            "harken ready"
        );

        let result = pipeline.run(shutdown_signal(), self.once).await;
        source.stop();
        pipeline.log_stats();
        result
    }
}

/// Resolve on Ctrl+C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "cannot listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

/// Map SIGUSR1 (hardware stop button) onto the stop signal
#[cfg(unix)]
fn spawn_stop_listener(stop: StopSignal) {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::user_defined1()) {
        Ok(mut usr1) => {
            tokio::spawn(async move {
                while usr1.recv().await.is_some() {
                    tracing::info!("stop requested (SIGUSR1)");
                    stop.trigger();
                }
            });
        }
        Err(e) => tracing::warn!(error = %e, "cannot listen for SIGUSR1"),
    }
}

#[cfg(not(unix))]
fn spawn_stop_listener(_stop: StopSignal) {}
