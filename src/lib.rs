//! Harken - hands-free voice assistant pipeline
//!
//! This library provides the frame-driven core of the harken daemon:
//! - Microphone capture into fixed frames behind a bounded ring buffer
//! - Wake word detection over one or more keyword models
//! - Voice activity detection and utterance capture
//! - Transcription, reply and synthesis collaborators
//! - Half-duplex playback with a stop signal
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   frames   ┌──────────────┐
//! │ Frame source │──────────▶│ Ring buffer  │
//! │  (cpal)      │            └──────┬───────┘
//! └──────▲───────┘                   │ FrameReader
//!        │ session state             ▼
//!        │                  ┌──────────────────┐
//!        └──────────────────│ Session machine  │
//!                           │ wake word ▶ VAD  │
//!                           │ ▶ recorder       │
//!                           └────────┬─────────┘
//!                                    │ Utterance
//!                                    ▼
//!             ┌─────────────────────────────────────────┐
//!             │ Transcriber ▶ Responder ▶ Synthesizer  │
//!             │              ▶ Playback                │
//!             └─────────────────────────────────────────┘
//! ```

pub mod agent;
pub mod config;
pub mod daemon;
pub mod error;
pub mod session;
pub mod voice;

pub use config::Config;
pub use daemon::{Daemon, Pipeline, RunSummary};
pub use error::{Error, Result};
pub use session::{SessionState, SharedSession, StopSignal};
