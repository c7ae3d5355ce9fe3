//! parley - real-time voice conversations with a remote AI assistant
//!
//! This library provides the audio streaming engine behind a live voice
//! session:
//! - PCM encoding and base64 transport wrapping
//! - Microphone capture framed into fixed-size 16 kHz blocks
//! - Gap-free scheduled playback of 24 kHz speech with barge-in support
//! - A session state machine wiring both to a remote transport
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   frames   ┌──────────────┐  realtimeInput  ┌────────────┐
//! │   Capture    ├───────────►│              ├────────────────►│            │
//! │   Pipeline   │            │ VoiceSession │                 │ Transport  │
//! ├──────────────┤   frames   │ (state       │     events      │ (Gemini    │
//! │   Playback   │◄───────────┤  machine)    │◄────────────────┤  Live)     │
//! │   Scheduler  │            │              │                 │            │
//! └──────────────┘            └──────┬───────┘                 └────────────┘
//!                                    │ SessionEvent
//!                                    ▼
//!                                observers
//! ```

pub mod config;
pub mod error;
pub mod session;
pub mod transport;
pub mod voice;

pub use config::{AudioConfig, Config, Language, LiveConfig};
pub use error::{Error, Result};
pub use session::{SessionEvent, SessionState, Transcript, TranscriptEntry, VoiceSession};
pub use transport::{
    Connection, GeminiLiveTransport, RealtimeInput, Role, Transport, TransportEvent,
    TransportHandle,
};
pub use voice::{AudioFrame, CapturePipeline, PlaybackScheduler, SampleRate};
