//! Configuration management for parley
//!
//! Values resolve in order env > toml > default.

pub mod file;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::voice::FRAME_SIZE;
use crate::{Error, Result};

/// Gemini Live bidirectional streaming endpoint
pub const DEFAULT_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Native-audio model used for live sessions
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash-native-audio-preview-12-2025";

/// Seconds to wait for the remote side to acknowledge setup
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// parley configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Remote session configuration
    pub live: LiveConfig,

    /// Audio configuration
    pub audio: AudioConfig,
}

/// Everything the transport needs to open a remote session
#[derive(Debug, Clone)]
pub struct LiveConfig {
    /// WebSocket endpoint
    pub endpoint: String,

    /// API key (from `GEMINI_API_KEY` / `API_KEY` env or the config file)
    pub api_key: Option<SecretString>,

    /// Model identifier
    pub model: String,

    /// Reply language
    pub language: Language,

    /// System instruction sent at setup
    pub system_instruction: String,

    /// Request assistant transcripts alongside audio
    pub output_transcription: bool,

    /// Request transcripts of the user's speech
    pub input_transcription: bool,

    /// How long `start()` waits for the session to open
    pub connect_timeout: Duration,
}

/// Audio configuration
#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// Samples per captured frame
    pub frame_size: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            frame_size: FRAME_SIZE,
        }
    }
}

/// Languages the assistant is asked to reply in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Language {
    /// Portuguese
    Pt,
    /// English
    #[default]
    En,
    /// Spanish
    Es,
}

impl Language {
    /// Short code ("pt", "en", "es")
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Pt => "pt",
            Self::En => "en",
            Self::Es => "es",
        }
    }

    /// English name used in prompts
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Pt => "Portuguese",
            Self::En => "English",
            Self::Es => "Spanish",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Language {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "pt" | "pt-br" | "portuguese" => Ok(Self::Pt),
            "en" | "english" => Ok(Self::En),
            "es" | "spanish" => Ok(Self::Es),
            other => Err(Error::Config(format!("unsupported language: {other}"))),
        }
    }
}

/// Default tutor instruction for `language`
#[must_use]
pub fn default_system_instruction(language: Language) -> String {
    format!(
        "You are a friendly science tutor holding a spoken conversation. \
         Solve math, physics, or chemistry problems. Always respond in {}.",
        language.name()
    )
}

impl LiveConfig {
    /// Defaults for `language` with no API key
    #[must_use]
    pub fn new(language: Language) -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            language,
            system_instruction: default_system_instruction(language),
            output_transcription: true,
            input_transcription: true,
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
        }
    }
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self::new(Language::default())
    }
}

impl Config {
    /// Load configuration from the process environment and the config file
    ///
    /// # Errors
    ///
    /// Returns error if a value is present but invalid
    pub fn load() -> Result<Self> {
        let fc = file::load_config_file();
        Self::from_sources(fc, |key| std::env::var(key).ok())
    }

    /// Resolve configuration from a parsed file and an environment lookup
    ///
    /// # Errors
    ///
    /// Returns error if a value is present but invalid
    pub fn from_sources(
        fc: file::ParleyConfigFile,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let language = env("PARLEY_LANGUAGE")
            .or(fc.live.language)
            .map(|s| s.parse::<Language>())
            .transpose()?
            .unwrap_or_default();

        let api_key = env("GEMINI_API_KEY")
            .or_else(|| env("API_KEY"))
            .or(fc.api_keys.gemini)
            .filter(|k| !k.trim().is_empty())
            .map(SecretString::from);

        let connect_timeout_secs = match env("PARLEY_CONNECT_TIMEOUT_SECS") {
            Some(raw) => Some(raw.parse::<u64>().map_err(|e| {
                Error::Config(format!("invalid PARLEY_CONNECT_TIMEOUT_SECS: {e}"))
            })?),
            None => fc.live.connect_timeout_secs,
        }
        .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS);

        let live = LiveConfig {
            endpoint: env("PARLEY_ENDPOINT")
                .or(fc.live.endpoint)
                .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            api_key,
            model: env("PARLEY_MODEL")
                .or(fc.live.model)
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            language,
            system_instruction: env("PARLEY_SYSTEM_INSTRUCTION")
                .or(fc.live.system_instruction)
                .unwrap_or_else(|| default_system_instruction(language)),
            output_transcription: fc.live.output_transcription.unwrap_or(true),
            input_transcription: fc.live.input_transcription.unwrap_or(true),
            connect_timeout: Duration::from_secs(connect_timeout_secs),
        };

        let frame_size = match env("PARLEY_FRAME_SIZE") {
            Some(raw) => Some(
                raw.parse::<usize>()
                    .map_err(|e| Error::Config(format!("invalid PARLEY_FRAME_SIZE: {e}")))?,
            ),
            None => fc.audio.frame_size,
        }
        .unwrap_or(FRAME_SIZE);

        if frame_size == 0 {
            return Err(Error::Config("frame size must be positive".to_string()));
        }

        Ok(Self {
            live,
            audio: AudioConfig { frame_size },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use std::collections::HashMap;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config =
            Config::from_sources(file::ParleyConfigFile::default(), env_from(&[])).unwrap();

        assert_eq!(config.live.model, DEFAULT_MODEL);
        assert_eq!(config.live.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(config.live.language, Language::En);
        assert!(config.live.api_key.is_none());
        assert!(config.live.output_transcription);
        assert!(config.live.input_transcription);
        assert_eq!(config.live.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.audio.frame_size, 4096);
        assert!(config.live.system_instruction.contains("English"));
    }

    #[test]
    fn test_env_overrides_file() {
        let mut fc = file::ParleyConfigFile::default();
        fc.live.model = Some("file-model".to_string());
        fc.live.language = Some("es".to_string());
        fc.audio.frame_size = Some(1024);

        let config = Config::from_sources(
            fc,
            env_from(&[("PARLEY_MODEL", "env-model"), ("PARLEY_FRAME_SIZE", "2048")]),
        )
        .unwrap();

        assert_eq!(config.live.model, "env-model");
        assert_eq!(config.live.language, Language::Es);
        assert_eq!(config.audio.frame_size, 2048);
        assert!(config.live.system_instruction.contains("Spanish"));
    }

    #[test]
    fn test_api_key_fallback_chain() {
        let mut fc = file::ParleyConfigFile::default();
        fc.api_keys.gemini = Some("from-file".to_string());

        let config = Config::from_sources(fc, env_from(&[("API_KEY", "from-env")])).unwrap();
        assert_eq!(config.live.api_key.unwrap().expose_secret(), "from-env");

        let config = Config::from_sources(
            file::ParleyConfigFile::default(),
            env_from(&[("GEMINI_API_KEY", "  ")]),
        )
        .unwrap();
        assert!(config.live.api_key.is_none());
    }

    #[test]
    fn test_rejects_zero_frame_size() {
        let err = Config::from_sources(
            file::ParleyConfigFile::default(),
            env_from(&[("PARLEY_FRAME_SIZE", "0")]),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_rejects_unknown_language() {
        let err = Config::from_sources(
            file::ParleyConfigFile::default(),
            env_from(&[("PARLEY_LANGUAGE", "klingon")]),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_language_parsing() {
        assert_eq!("PT".parse::<Language>().unwrap(), Language::Pt);
        assert_eq!(" english ".parse::<Language>().unwrap(), Language::En);
        assert_eq!(Language::Es.to_string(), "es");
    }
}
