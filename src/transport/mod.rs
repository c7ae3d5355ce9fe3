//! Transport adapters to the remote assistant
//!
//! A transport opens a bidirectional channel and hands back a
//! [`Connection`]: a [`TransportHandle`] for fire-and-forget outbound audio
//! and an ordered stream of inbound [`TransportEvent`]s.

mod gemini;
pub mod protocol;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

pub use gemini::GeminiLiveTransport;

use crate::Result;
use crate::config::LiveConfig;
use crate::voice::{AudioFrame, codec};

/// Who said a piece of transcript
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The person at the microphone
    User,
    /// The remote assistant
    Assistant,
}

impl Role {
    /// Lowercase role name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inbound event from the remote session, in send order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Setup acknowledged; the session is ready for audio
    Open,
    /// Base64 PCM at 24 kHz mono
    AudioChunk(String),
    /// A piece of transcript text
    TranscriptDelta {
        /// Transcribed text
        text: String,
        /// Speaker
        role: Role,
    },
    /// The remote side detected barge-in; drop pending playback
    Interrupted,
    /// The model finished its turn
    TurnComplete,
    /// The channel failed
    Error(String),
    /// The channel closed
    Closed,
}

/// One outbound audio frame ready for the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    /// MIME type including the sample rate
    pub mime_type: String,
    /// Base64 PCM bytes
    pub data: String,
}

impl RealtimeInput {
    /// Wrap a captured frame
    #[must_use]
    pub fn from_frame(frame: &AudioFrame) -> Self {
        Self {
            mime_type: frame.rate().mime_type(),
            data: codec::encode_base64(&frame.to_bytes()),
        }
    }
}

/// Outbound side of an open channel
pub trait TransportHandle: Send + Sync {
    /// Send one audio frame; never blocks, dropped if the channel is closed
    fn send_realtime_input(&self, input: RealtimeInput);

    /// Close the channel; idempotent
    fn close(&self);

    /// Check if the channel was closed
    fn is_closed(&self) -> bool;
}

/// An open channel to the remote session
pub struct Connection {
    /// Outbound handle
    pub handle: Arc<dyn TransportHandle>,
    /// Inbound events; ends after `Closed` or `Error`
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Opens channels to the remote assistant
#[async_trait]
pub trait Transport: Send + Sync {
    /// Transport name for logs
    fn name(&self) -> &'static str;

    /// Open a channel configured by `config`
    ///
    /// Returns once the channel exists; readiness arrives as
    /// [`TransportEvent::Open`] on the event stream.
    async fn connect(&self, config: &LiveConfig) -> Result<Connection>;
}
