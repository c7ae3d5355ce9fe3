//! TOML configuration file loading
//!
//! Supports `~/.config/parley/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct ParleyConfigFile {
    /// Remote session configuration
    #[serde(default)]
    pub live: LiveFileConfig,

    /// Audio configuration
    #[serde(default)]
    pub audio: AudioFileConfig,

    /// API keys for external services
    #[serde(default)]
    pub api_keys: ApiKeysFileConfig,
}

/// Remote session configuration
#[derive(Debug, Default, Deserialize)]
pub struct LiveFileConfig {
    /// WebSocket endpoint
    pub endpoint: Option<String>,

    /// Model identifier (e.g. "gemini-2.5-flash-native-audio-preview-12-2025")
    pub model: Option<String>,

    /// System instruction sent at setup
    pub system_instruction: Option<String>,

    /// Reply language ("pt", "en", "es")
    pub language: Option<String>,

    /// Request assistant transcripts alongside audio
    pub output_transcription: Option<bool>,

    /// Request transcripts of the user's speech
    pub input_transcription: Option<bool>,

    /// Seconds to wait for the remote session to open
    pub connect_timeout_secs: Option<u64>,
}

/// Audio configuration
#[derive(Debug, Default, Deserialize)]
pub struct AudioFileConfig {
    /// Samples per captured frame
    pub frame_size: Option<usize>,
}

/// API keys configuration
#[derive(Debug, Default, Deserialize)]
pub struct ApiKeysFileConfig {
    pub gemini: Option<String>,
}

/// Load the TOML config file from the standard path
///
/// Returns `ParleyConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> ParleyConfigFile {
    config_file_path().map_or_else(ParleyConfigFile::default, |path| load_from(&path))
}

/// Load a TOML config file from `path`, falling back to defaults
pub fn load_from(path: &Path) -> ParleyConfigFile {
    if !path.exists() {
        return ParleyConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                ParleyConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            ParleyConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/parley/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("parley").join("config.toml"))
}
