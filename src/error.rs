//! Error types for parley

use thiserror::Error;

/// Result type alias for parley operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in a voice session
#[derive(Debug, Error)]
pub enum Error {
    /// Microphone or speaker cannot be acquired (permission denied, no hardware)
    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Transport failed to open or dropped unexpectedly
    #[error("connection error: {0}")]
    Connection(String),

    /// Audio payload with invalid length or shape
    #[error("malformed audio: {0}")]
    MalformedAudio(String),

    /// A session is already connecting or active
    #[error("session already active")]
    AlreadyActive,

    /// The session reached its terminal state; build a new one
    #[error("session closed")]
    SessionClosed,

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
