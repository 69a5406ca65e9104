//! Configuration file loading
//!
//! Supports `~/.config/harken/config.toml` as a persistent config source.
//! All fields are optional: the file is a partial overlay on top of defaults,
//! and keys this schema does not know are ignored.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::{Error, Result};

/// Top-level configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct ConfigFile {
    /// Audio device and framing
    #[serde(default)]
    pub audio: AudioFileConfig,

    /// Voice activity detection
    #[serde(default)]
    pub vad: VadFileConfig,

    /// Wake word keywords and sensitivity
    #[serde(default)]
    pub wake_word: WakeWordFileConfig,

    /// Session timing and spoken feedback
    #[serde(default)]
    pub session: SessionFileConfig,

    /// Recent conversation context handed to the responder
    #[serde(default)]
    pub context: ContextFileConfig,

    /// Speech-to-text collaborator
    #[serde(default)]
    pub stt: SttFileConfig,

    /// Text-to-speech collaborator
    #[serde(default)]
    pub tts: TtsFileConfig,

    /// Response collaborator (chat completions)
    #[serde(default)]
    pub llm: LlmFileConfig,

    /// API keys for external services
    #[serde(default)]
    pub api_keys: ApiKeysFileConfig,
}

/// Audio configuration
#[derive(Debug, Default, Deserialize)]
pub struct AudioFileConfig {
    /// Pipeline sample rate in Hz
    pub sample_rate: Option<u32>,

    /// Frame duration in milliseconds
    pub frame_duration_ms: Option<u32>,

    /// Seconds of audio kept in the capture ring buffer
    pub buffer_seconds: Option<f64>,

    /// Initial output volume (0-100)
    pub output_volume: Option<i64>,

    /// Input device name (system default when unset)
    pub input_device: Option<String>,

    /// Output device name (system default when unset)
    pub output_device: Option<String>,
}

/// Voice activity detection configuration
#[derive(Debug, Default, Deserialize)]
pub struct VadFileConfig {
    /// Aggressiveness level (0-3)
    pub aggressiveness: Option<u8>,

    /// Seconds of trailing silence that end an utterance
    pub silence_duration: Option<f64>,
}

/// Wake word configuration
#[derive(Debug, Default, Deserialize)]
pub struct WakeWordFileConfig {
    /// Default sensitivity for keywords without their own
    pub sensitivity: Option<f32>,

    /// Armed keywords
    #[serde(default)]
    pub keywords: Vec<KeywordFileConfig>,
}

/// A single armed keyword
#[derive(Debug, Deserialize)]
pub struct KeywordFileConfig {
    /// Keyword name, used in logs and detection results
    pub name: String,

    /// Model reference: a reference WAV or a directory of them
    pub model: PathBuf,

    /// Per-keyword sensitivity override
    pub sensitivity: Option<f32>,
}

/// Session configuration
#[derive(Debug, Default, Deserialize)]
pub struct SessionFileConfig {
    /// Maximum utterance length in seconds
    pub max_utterance_duration: Option<f64>,

    /// Seconds to wait for the first speech frame after the wake word
    pub initial_timeout: Option<f64>,

    /// Seconds allowed for each collaborator call
    pub collaborator_timeout: Option<f64>,

    /// Play an acknowledgment cue when the wake word fires
    pub acknowledge: Option<bool>,

    /// Spoken apology after a failed turn (empty disables)
    pub apology: Option<String>,

    /// Phrases that end the turn when heard
    pub stop_phrases: Option<Vec<String>>,

    /// Spoken once at startup
    pub greeting: Option<String>,
}

/// Conversation context configuration
#[derive(Debug, Default, Deserialize)]
pub struct ContextFileConfig {
    /// Exchanges kept for the responder
    pub max_history: Option<usize>,

    /// Seconds of inactivity after which the context is forgotten
    pub timeout_seconds: Option<u64>,
}

/// Speech-to-text configuration
#[derive(Debug, Default, Deserialize)]
pub struct SttFileConfig {
    /// Provider ("whisper" or "deepgram")
    pub provider: Option<String>,

    /// Model identifier (e.g. "whisper-1", "nova-2")
    pub model: Option<String>,

    /// Base URL override (OpenAI-compatible servers)
    pub base_url: Option<String>,

    /// Transcription language hint
    pub language: Option<String>,
}

/// Text-to-speech configuration
#[derive(Debug, Default, Deserialize)]
pub struct TtsFileConfig {
    /// Provider ("openai" or "elevenlabs")
    pub provider: Option<String>,

    /// Model identifier (e.g. "tts-1")
    pub model: Option<String>,

    /// Voice identifier (e.g. "alloy")
    pub voice: Option<String>,

    /// Speed multiplier
    pub speed: Option<f32>,

    /// Base URL override (OpenAI-compatible servers)
    pub base_url: Option<String>,
}

/// Response collaborator configuration
#[derive(Debug, Default, Deserialize)]
pub struct LlmFileConfig {
    /// Model identifier (e.g. "gpt-4o-mini")
    pub model: Option<String>,

    /// Chat completions base URL
    pub base_url: Option<String>,

    /// System prompt prepended to every exchange
    pub system_prompt: Option<String>,

    /// Maximum tokens per reply
    pub max_tokens: Option<u32>,

    /// Sampling temperature
    pub temperature: Option<f32>,
}

/// API keys configuration
#[derive(Debug, Default, Deserialize)]
pub struct ApiKeysFileConfig {
    pub openai: Option<String>,
    pub deepgram: Option<String>,
    pub elevenlabs: Option<String>,
}

/// Load and parse a configuration file
///
/// Files ending in `.json` are parsed as JSON, everything else as TOML.
///
/// # Errors
///
/// Returns error if the file cannot be read or parsed
pub fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("cannot read config file {}: {e}", path.display()))
    })?;

    let config = parse_config(&content, path)?;
    tracing::info!(path = %path.display(), "loaded config file");
    Ok(config)
}

/// Parse configuration text, choosing the format from the path extension
///
/// # Errors
///
/// Returns error if the text is not valid for its format
pub fn parse_config(content: &str, path: &Path) -> Result<ConfigFile> {
    let is_json = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"));

    if is_json {
        serde_json::from_str(content).map_err(|e| Error::Config(format!("invalid JSON config: {e}")))
    } else {
        Ok(toml::from_str(content)?)
    }
}

/// Return the config file path: `~/.config/harken/config.toml`
#[must_use]
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("harken").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_partial_toml() {
        let file = parse_config(
            r#"
            [audio]
            sample_rate = 16000

            [wake_word]
            sensitivity = 0.6

            [[wake_word.keywords]]
            name = "hey harken"
            model = "refs/hey_harken"
            "#,
            Path::new("config.toml"),
        )
        .unwrap();

        assert_eq!(file.audio.sample_rate, Some(16_000));
        assert_eq!(file.audio.frame_duration_ms, None);
        assert_eq!(file.wake_word.sensitivity, Some(0.6));
        assert_eq!(file.wake_word.keywords.len(), 1);
        assert_eq!(file.wake_word.keywords[0].name, "hey harken");
        assert!(file.wake_word.keywords[0].sensitivity.is_none());
    }

    #[test]
    fn ignores_unknown_keys() {
        let file = parse_config(
            r#"
            wifi_ssid = "home"

            [audio]
            channels = 2
            frame_duration_ms = 20

            [web_ui]
            port = 8080
            "#,
            Path::new("config.toml"),
        )
        .unwrap();

        assert_eq!(file.audio.frame_duration_ms, Some(20));
    }

    #[test]
    fn parses_json_by_extension() {
        let file = parse_config(
            r#"{ "vad": { "aggressiveness": 2, "silence_duration": 1.5 }, "context": { "max_history": 3 } }"#,
            Path::new("config.json"),
        )
        .unwrap();

        assert_eq!(file.vad.aggressiveness, Some(2));
        assert_eq!(file.vad.silence_duration, Some(1.5));
        assert_eq!(file.context.max_history, Some(3));
    }

    #[test]
    fn rejects_malformed_toml() {
        let err = parse_config("[audio\nsample_rate = ", Path::new("config.toml")).unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn missing_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config_file(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
