//! Session state shared between the pipeline, the frame source and playback
//!
//! The session state has a single writer (the [`SessionMachine`]) and is read
//! by the capture callback to enforce half-duplex operation. Both handles are
//! explicit values passed to each component; there is no process-wide global.

mod machine;
mod turn;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use tokio::sync::Notify;

pub use machine::{FrameOutcome, SessionMachine, SessionTiming};
pub use turn::{Collaborators, TurnOutcome};

/// Pipeline session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    /// Waiting for a wake word
    Idle = 0,
    /// Wake word heard; a new utterance is starting
    Listening = 1,
    /// Recording the utterance
    Capturing = 2,
    /// Waiting on transcription, response and synthesis
    Processing = 3,
    /// Playing the response; capture is suppressed
    Speaking = 4,
}

impl SessionState {
    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Listening,
            2 => Self::Capturing,
            3 => Self::Processing,
            4 => Self::Speaking,
            _ => Self::Idle,
        }
    }

    /// Whether captured audio must be dropped in this state
    #[must_use]
    pub const fn suppresses_capture(self) -> bool {
        matches!(self, Self::Speaking)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Capturing => "capturing",
            Self::Processing => "processing",
            Self::Speaking => "speaking",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cloneable handle to one pipeline's session state
#[derive(Debug, Clone)]
pub struct SharedSession(Arc<AtomicU8>);

impl SharedSession {
    #[must_use]
    pub fn new() -> Self {
        Self(Arc::new(AtomicU8::new(SessionState::Idle as u8)))
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Store a new state, returning the previous one
    pub(crate) fn set(&self, state: SessionState) -> SessionState {
        SessionState::from_u8(self.0.swap(state as u8, Ordering::AcqRel))
    }
}

impl Default for SharedSession {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
struct StopInner {
    requested: AtomicBool,
    notify: Notify,
}

/// User "stop" request, observable from any context
///
/// Triggering is sticky until the session machine consumes it.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<StopInner>);

impl StopSignal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop; wakes every pending [`Self::requested`] future
    pub fn trigger(&self) {
        self.0.requested.store(true, Ordering::Release);
        self.0.notify.notify_waiters();
    }

    #[must_use]
    pub fn is_requested(&self) -> bool {
        self.0.requested.load(Ordering::Acquire)
    }

    /// Consume a pending request; returns whether there was one
    pub fn take(&self) -> bool {
        self.0.requested.swap(false, Ordering::AcqRel)
    }

    /// Resolve once a stop has been requested
    pub async fn requested(&self) {
        loop {
            let notified = self.0.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_requested() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_starts_idle() {
        let session = SharedSession::new();
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.set(SessionState::Speaking), SessionState::Idle);
        assert!(session.state().suppresses_capture());
    }

    #[test]
    fn clones_share_state() {
        let session = SharedSession::new();
        let reader = session.clone();
        session.set(SessionState::Capturing);
        assert_eq!(reader.state(), SessionState::Capturing);
    }

    #[test]
    fn stop_is_sticky_until_taken() {
        let stop = StopSignal::new();
        assert!(!stop.take());
        stop.trigger();
        assert!(stop.is_requested());
        assert!(stop.take());
        assert!(!stop.is_requested());
    }

    #[tokio::test]
    async fn requested_resolves_after_trigger() {
        let stop = StopSignal::new();
        let mut waiter = tokio_test::task::spawn({
            let stop = stop.clone();
            async move { stop.requested().await }
        });
        tokio_test::assert_pending!(waiter.poll());

        stop.trigger();
        assert!(waiter.is_woken());
        tokio_test::assert_ready!(waiter.poll());
    }

    #[tokio::test]
    async fn requested_resolves_immediately_when_pending() {
        let stop = StopSignal::new();
        stop.trigger();
        tokio::time::timeout(std::time::Duration::from_millis(100), stop.requested())
            .await
            .expect("already requested");
    }
}
