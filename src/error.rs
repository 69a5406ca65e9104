//! Error types for the harken voice pipeline

use thiserror::Error;

/// Result type alias for harken operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the voice pipeline
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Sample rate not supported by the frame pipeline
    #[error("unsupported sample rate: {0} Hz (expected 8000, 16000, 32000 or 48000)")]
    UnsupportedSampleRate(u32),

    /// Frame duration not supported by the frame pipeline
    #[error("unsupported frame duration: {0} ms (expected 10, 20 or 30)")]
    UnsupportedFrameDuration(u32),

    /// A frame written to the ring buffer had the wrong length
    #[error("invalid frame size: expected {expected} samples, got {actual}")]
    InvalidFrameSize { expected: usize, actual: usize },

    /// A frame handed to a detector had the wrong length
    #[error("frame size mismatch: detector requires {expected} samples, got {actual}")]
    FrameSizeMismatch { expected: usize, actual: usize },

    /// Keyword model could not be loaded
    #[error("keyword model '{name}': {reason}")]
    KeywordModel { name: String, reason: String },

    /// Audio device error
    #[error("audio error: {0}")]
    Audio(String),

    /// Voice activity detection error
    #[error("vad error: {0}")]
    Vad(String),

    /// Speech-to-text error
    #[error("STT error: {0}")]
    Stt(String),

    /// Response generation error
    #[error("responder error: {0}")]
    Responder(String),

    /// Text-to-speech error
    #[error("TTS error: {0}")]
    Tts(String),

    /// Playback error
    #[error("playback error: {0}")]
    Playback(String),

    /// A collaborator call did not finish in time
    #[error("{0} timed out")]
    Timeout(&'static str),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// WAV encoding or decoding error
    #[error("wav error: {0}")]
    Wav(#[from] hound::Error),
}

impl Error {
    /// Whether this error belongs to the configuration class
    ///
    /// Configuration errors are fatal at startup; everything else is
    /// recovered by returning the session to idle
    #[must_use]
    pub const fn is_config(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::UnsupportedSampleRate(_)
                | Self::UnsupportedFrameDuration(_)
                | Self::InvalidFrameSize { .. }
                | Self::FrameSizeMismatch { .. }
                | Self::KeywordModel { .. }
                | Self::Toml(_)
        )
    }
}
