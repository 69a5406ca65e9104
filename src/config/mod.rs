//! Configuration management for the harken pipeline
//!
//! Values resolve with the precedence environment > file > default, then the
//! whole configuration is validated once. A configuration error is fatal at
//! startup: the pipeline never starts listening with a bad config.

pub mod file;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;

use crate::voice::FrameSpec;
use crate::{Error, Result};

use file::ConfigFile;

/// Default chat completions endpoint
pub const DEFAULT_LLM_BASE_URL: &str = "https://api.openai.com/v1";

/// Default system prompt for the responder
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful voice assistant. Answer in one or two \
     short spoken sentences without markdown, lists or emoji.";

/// Resolved harken configuration
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub audio: AudioConfig,
    pub vad: VadConfig,
    pub wake_word: WakeWordConfig,
    pub session: SessionConfig,
    pub context: ContextConfig,
    pub stt: SttConfig,
    pub tts: TtsConfig,
    pub llm: LlmConfig,
    #[serde(skip)]
    pub api_keys: ApiKeys,

    /// File the configuration was read from, if any
    pub source: Option<PathBuf>,
}

/// Audio devices and frame geometry
#[derive(Debug, Clone, Serialize)]
pub struct AudioConfig {
    #[serde(serialize_with = "serialize_frame_spec")]
    pub frame: FrameSpec,
    /// Lookback kept in the capture ring buffer
    pub buffer: Duration,
    pub output_volume: u8,
    pub input_device: Option<String>,
    pub output_device: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VadConfig {
    pub aggressiveness: u8,
    pub silence_duration: Duration,
}

/// Armed keywords
#[derive(Debug, Clone, Serialize)]
pub struct WakeWordConfig {
    /// Default sensitivity for keywords without their own
    pub sensitivity: f32,
    pub keywords: Vec<KeywordConfig>,
}

/// One armed keyword with its sensitivity resolved
#[derive(Debug, Clone, Serialize)]
pub struct KeywordConfig {
    pub name: String,
    /// Reference WAV file or directory of WAV files, absolute or relative
    /// to the config file
    pub model: PathBuf,
    pub sensitivity: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionConfig {
    pub max_utterance_duration: Duration,
    pub initial_timeout: Duration,
    pub collaborator_timeout: Duration,
    pub acknowledge: bool,
    /// Spoken after a failed turn; `None` only logs
    pub apology: Option<String>,
    pub stop_phrases: Vec<String>,
    pub greeting: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContextConfig {
    pub max_history: usize,
    pub timeout: Duration,
}

/// STT provider backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SttProvider {
    Whisper,
    Deepgram,
}

impl std::str::FromStr for SttProvider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "whisper" | "openai" => Ok(Self::Whisper),
            "deepgram" => Ok(Self::Deepgram),
            other => Err(Error::Config(format!("unknown STT provider '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SttConfig {
    pub provider: SttProvider,
    pub model: String,
    pub base_url: Option<String>,
    pub language: Option<String>,
}

/// TTS provider backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TtsProvider {
    OpenAi,
    ElevenLabs,
}

impl std::str::FromStr for TtsProvider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "elevenlabs" => Ok(Self::ElevenLabs),
            other => Err(Error::Config(format!("unknown TTS provider '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TtsConfig {
    pub provider: TtsProvider,
    pub model: String,
    pub voice: String,
    pub speed: f32,
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LlmConfig {
    pub model: String,
    pub base_url: String,
    pub system_prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// API keys for external services
#[derive(Debug, Clone, Default)]
pub struct ApiKeys {
    pub openai: Option<String>,
    pub deepgram: Option<String>,
    pub elevenlabs: Option<String>,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn serialize_frame_spec<S: serde::Serializer>(
    spec: &FrameSpec,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    use serde::ser::SerializeStruct;
    let mut state = serializer.serialize_struct("FrameSpec", 3)?;
    state.serialize_field("sample_rate", &spec.sample_rate())?;
    state.serialize_field("frame_duration_ms", &spec.frame_duration_ms())?;
    state.serialize_field("frame_len", &spec.frame_len())?;
    state.end()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            audio: AudioConfig {
                frame: FrameSpec::default(),
                buffer: Duration::from_secs(5),
                output_volume: 70,
                input_device: None,
                output_device: None,
            },
            vad: VadConfig {
                aggressiveness: 3,
                silence_duration: Duration::from_secs(2),
            },
            wake_word: WakeWordConfig {
                sensitivity: 0.5,
                keywords: Vec::new(),
            },
            session: SessionConfig {
                max_utterance_duration: Duration::from_secs(15),
                initial_timeout: Duration::from_secs(5),
                collaborator_timeout: Duration::from_secs(30),
                acknowledge: true,
                apology: Some("Sorry, I didn't catch that".to_string()),
                stop_phrases: vec!["stop".to_string(), "para".to_string()],
                greeting: None,
            },
            context: ContextConfig {
                max_history: 5,
                timeout: Duration::from_secs(60),
            },
            stt: SttConfig {
                provider: SttProvider::Whisper,
                model: "whisper-1".to_string(),
                base_url: None,
                language: None,
            },
            tts: TtsConfig {
                provider: TtsProvider::OpenAi,
                model: "tts-1".to_string(),
                voice: "alloy".to_string(),
                speed: 1.0,
                base_url: None,
            },
            llm: LlmConfig {
                model: "gpt-4o-mini".to_string(),
                base_url: DEFAULT_LLM_BASE_URL.to_string(),
                system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
                max_tokens: 256,
                temperature: 0.7,
            },
            api_keys: ApiKeys::default(),
            source: None,
        }
    }
}

impl Config {
    /// Load configuration from the process environment and config file
    ///
    /// The file is `path` if given, else `HARKEN_CONFIG`, else
    /// `~/.config/harken/config.toml`. An explicitly named file must exist;
    /// a missing default file means built-in defaults.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the file is unreadable, malformed or
    /// fails validation
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let explicit = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os("HARKEN_CONFIG").map(PathBuf::from));

        let path = match explicit {
            Some(path) => Some(path),
            None => file::config_file_path().filter(|p| p.exists()),
        };

        let fc = match &path {
            Some(path) => file::load_config_file(path)?,
            None => {
                tracing::debug!("no config file, using defaults");
                ConfigFile::default()
            }
        };

        let mut config = Self::from_file(fc, path.as_deref(), |key| std::env::var(key).ok())?;
        config.source = path;
        Ok(config)
    }

    /// Resolve a parsed file against defaults and an environment lookup
    ///
    /// Relative keyword model paths are resolved against the directory of
    /// `path`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if any value is invalid
    #[allow(clippy::too_many_lines)]
    pub fn from_file(
        fc: ConfigFile,
        path: Option<&Path>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let defaults = Self::default();
        let base_dir = path.and_then(Path::parent).map(Path::to_path_buf);

        // Audio (env > toml > default)
        let frame = FrameSpec::new(
            fc.audio
                .sample_rate
                .unwrap_or_else(|| defaults.audio.frame.sample_rate()),
            fc.audio
                .frame_duration_ms
                .unwrap_or_else(|| defaults.audio.frame.frame_duration_ms()),
        )?;
        let output_volume = fc
            .audio
            .output_volume
            .unwrap_or_else(|| i64::from(defaults.audio.output_volume));
        let output_volume = u8::try_from(output_volume)
            .ok()
            .filter(|v| *v <= 100)
            .ok_or_else(|| {
                Error::Config(format!(
                    "audio.output_volume must be between 0 and 100, got {output_volume}"
                ))
            })?;
        let audio = AudioConfig {
            frame,
            buffer: fc
                .audio
                .buffer_seconds
                .map(|s| seconds("audio.buffer_seconds", s))
                .transpose()?
                .unwrap_or(defaults.audio.buffer),
            output_volume,
            input_device: env("HARKEN_INPUT_DEVICE").or(fc.audio.input_device),
            output_device: env("HARKEN_OUTPUT_DEVICE").or(fc.audio.output_device),
        };

        let vad = VadConfig {
            aggressiveness: fc
                .vad
                .aggressiveness
                .unwrap_or(defaults.vad.aggressiveness),
            silence_duration: fc
                .vad
                .silence_duration
                .map(|s| seconds("vad.silence_duration", s))
                .transpose()?
                .unwrap_or(defaults.vad.silence_duration),
        };

        // Keywords inherit the section sensitivity unless they set their own
        let sensitivity = fc
            .wake_word
            .sensitivity
            .unwrap_or(defaults.wake_word.sensitivity);
        let keywords = fc
            .wake_word
            .keywords
            .into_iter()
            .map(|k| KeywordConfig {
                model: match &base_dir {
                    Some(dir) if k.model.is_relative() => dir.join(&k.model),
                    _ => k.model,
                },
                sensitivity: k.sensitivity.unwrap_or(sensitivity),
                name: k.name,
            })
            .collect();
        let wake_word = WakeWordConfig {
            sensitivity,
            keywords,
        };

        let s = fc.session;
        let session = SessionConfig {
            max_utterance_duration: s
                .max_utterance_duration
                .map(|v| seconds("session.max_utterance_duration", v))
                .transpose()?
                .unwrap_or(defaults.session.max_utterance_duration),
            initial_timeout: s
                .initial_timeout
                .map(|v| seconds("session.initial_timeout", v))
                .transpose()?
                .unwrap_or(defaults.session.initial_timeout),
            collaborator_timeout: s
                .collaborator_timeout
                .map(|v| seconds("session.collaborator_timeout", v))
                .transpose()?
                .unwrap_or(defaults.session.collaborator_timeout),
            acknowledge: s.acknowledge.unwrap_or(defaults.session.acknowledge),
            // An empty apology disables it
            apology: match s.apology {
                Some(text) if text.trim().is_empty() => None,
                Some(text) => Some(text),
                None => defaults.session.apology,
            },
            stop_phrases: s
                .stop_phrases
                .unwrap_or(defaults.session.stop_phrases)
                .into_iter()
                .map(|p| p.trim().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
            greeting: s.greeting.filter(|g| !g.trim().is_empty()),
        };

        let context = ContextConfig {
            max_history: fc
                .context
                .max_history
                .unwrap_or(defaults.context.max_history),
            timeout: fc
                .context
                .timeout_seconds
                .map_or(defaults.context.timeout, Duration::from_secs),
        };

        let stt = SttConfig {
            provider: env("HARKEN_STT_PROVIDER")
                .or(fc.stt.provider)
                .map(|p| p.parse())
                .transpose()?
                .unwrap_or(defaults.stt.provider),
            model: env("HARKEN_STT_MODEL")
                .or(fc.stt.model)
                .unwrap_or(defaults.stt.model),
            base_url: env("HARKEN_STT_BASE_URL").or(fc.stt.base_url),
            language: fc.stt.language,
        };

        let tts = TtsConfig {
            provider: env("HARKEN_TTS_PROVIDER")
                .or(fc.tts.provider)
                .map(|p| p.parse())
                .transpose()?
                .unwrap_or(defaults.tts.provider),
            model: env("HARKEN_TTS_MODEL")
                .or(fc.tts.model)
                .unwrap_or(defaults.tts.model),
            voice: env("HARKEN_TTS_VOICE")
                .or(fc.tts.voice)
                .unwrap_or(defaults.tts.voice),
            speed: fc.tts.speed.unwrap_or(defaults.tts.speed),
            base_url: env("HARKEN_TTS_BASE_URL").or(fc.tts.base_url),
        };

        let llm = LlmConfig {
            model: env("HARKEN_LLM_MODEL")
                .or(fc.llm.model)
                .unwrap_or(defaults.llm.model),
            base_url: env("HARKEN_LLM_BASE_URL")
                .or(fc.llm.base_url)
                .unwrap_or(defaults.llm.base_url),
            system_prompt: fc
                .llm
                .system_prompt
                .unwrap_or(defaults.llm.system_prompt),
            max_tokens: fc.llm.max_tokens.unwrap_or(defaults.llm.max_tokens),
            temperature: fc.llm.temperature.unwrap_or(defaults.llm.temperature),
        };

        // API keys (env > toml > None)
        let api_keys = ApiKeys {
            openai: env("OPENAI_API_KEY").or(fc.api_keys.openai),
            deepgram: env("DEEPGRAM_API_KEY").or(fc.api_keys.deepgram),
            elevenlabs: env("ELEVENLABS_API_KEY").or(fc.api_keys.elevenlabs),
        };

        let config = Self {
            audio,
            vad,
            wake_word,
            session,
            context,
            stt,
            tts,
            llm,
            api_keys,
            source: path.map(Path::to_path_buf),
        };
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges and keyword references
    ///
    /// # Errors
    ///
    /// Returns a configuration error describing the first invalid value
    pub fn validate(&self) -> Result<()> {
        if self.vad.aggressiveness > 3 {
            return Err(Error::Config(format!(
                "vad.aggressiveness must be 0-3, got {}",
                self.vad.aggressiveness
            )));
        }

        check_sensitivity("wake_word.sensitivity", self.wake_word.sensitivity)?;
        let mut names = HashSet::new();
        for keyword in &self.wake_word.keywords {
            if keyword.name.trim().is_empty() {
                return Err(Error::Config("wake_word keyword with empty name".to_string()));
            }
            if !names.insert(keyword.name.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate wake_word keyword '{}'",
                    keyword.name
                )));
            }
            check_sensitivity(
                &format!("sensitivity of keyword '{}'", keyword.name),
                keyword.sensitivity,
            )?;
            if !keyword.model.exists() {
                return Err(Error::KeywordModel {
                    name: keyword.name.clone(),
                    reason: format!("model {} does not exist", keyword.model.display()),
                });
            }
        }

        let frame = self.audio.frame.frame_duration();
        if self.audio.buffer < frame {
            return Err(Error::Config(
                "audio.buffer_seconds must hold at least one frame".to_string(),
            ));
        }
        for (key, value) in [
            ("vad.silence_duration", self.vad.silence_duration),
            (
                "session.max_utterance_duration",
                self.session.max_utterance_duration,
            ),
            ("session.initial_timeout", self.session.initial_timeout),
            (
                "session.collaborator_timeout",
                self.session.collaborator_timeout,
            ),
        ] {
            if value < frame {
                return Err(Error::Config(format!(
                    "{key} must be at least one frame ({} ms)",
                    frame.as_millis()
                )));
            }
        }

        if !(0.25..=4.0).contains(&self.tts.speed) {
            return Err(Error::Config(format!(
                "tts.speed must be between 0.25 and 4.0, got {}",
                self.tts.speed
            )));
        }
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            return Err(Error::Config(format!(
                "llm.temperature must be between 0.0 and 2.0, got {}",
                self.llm.temperature
            )));
        }

        Ok(())
    }

    /// Frame geometry shared by every pipeline stage
    #[must_use]
    pub const fn frame_spec(&self) -> FrameSpec {
        self.audio.frame
    }
}

fn seconds(key: &str, value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value)
        .ok()
        .filter(|d| !d.is_zero())
        .ok_or_else(|| Error::Config(format!("{key} must be a positive number of seconds")))
}

fn check_sensitivity(key: &str, value: f32) -> Result<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(Error::Config(format!("{key} must be between 0.0 and 1.0, got {value}")))
    }
}
