//! Live voice session state machine
//!
//! ```text
//! Idle --start()--> Connecting --Open--> Active --stop()/Closed/Error--> Closed
//!   ^                   |
//!   +--- failure -------+
//! ```
//!
//! While `Active`, inbound audio is decoded into the [`PlaybackScheduler`],
//! transcript fragments are appended and broadcast, and `Interrupted` drops
//! pending playback without touching the connection. `Closed` is terminal.

mod transcript;

use std::fmt;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

pub use transcript::{Transcript, TranscriptEntry};

use crate::config::{AudioConfig, LiveConfig};
use crate::transport::{Connection, RealtimeInput, Transport, TransportEvent, TransportHandle};
use crate::voice::{
    AudioFrame, CapturePipeline, InputDevice, OutputDevice, PlaybackScheduler, SampleRate, codec,
};
use crate::{Error, Result};

/// Capacity of the observer broadcast channel
const EVENT_CAPACITY: usize = 256;

/// Lifecycle of one session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Not started
    Idle,
    /// Waiting for the remote side to open
    Connecting,
    /// Streaming audio both ways
    Active,
    /// Torn down; terminal
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Active => "active",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// What observers see
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// State transition
    StateChanged(SessionState),
    /// New transcript fragment
    Transcript(TranscriptEntry),
    /// Playback was cut off by barge-in
    Interrupted,
    /// The assistant finished its turn
    TurnComplete,
    /// An inbound chunk was dropped; playback continues
    AudioDropped(String),
    /// The session ended because of a failure
    Error(String),
}

/// One real-time voice conversation
pub struct VoiceSession {
    id: Uuid,
    state: SessionState,
    config: LiveConfig,
    transport: Arc<dyn Transport>,
    capture: CapturePipeline,
    playback: PlaybackScheduler,
    handle: Option<Arc<dyn TransportHandle>>,
    inbound: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    transcript: Transcript,
    observers: broadcast::Sender<SessionEvent>,
}

impl VoiceSession {
    /// Create an idle session owning the given devices
    #[must_use]
    pub fn new(
        config: LiveConfig,
        audio: &AudioConfig,
        transport: Arc<dyn Transport>,
        input: Box<dyn InputDevice>,
        output: Box<dyn OutputDevice>,
    ) -> Self {
        let (observers, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            id: Uuid::new_v4(),
            state: SessionState::Idle,
            config,
            transport,
            capture: CapturePipeline::new(input, audio.frame_size),
            playback: PlaybackScheduler::new(output),
            handle: None,
            inbound: None,
            transcript: Transcript::new(),
            observers,
        }
    }

    /// Session id used in logs
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Current state
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Transcript of the active session
    #[must_use]
    pub const fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    /// Playback scheduler, for inspection
    #[must_use]
    pub const fn playback(&self) -> &PlaybackScheduler {
        &self.playback
    }

    /// Subscribe to session events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.observers.subscribe()
    }

    /// Open the remote session and start streaming the microphone
    ///
    /// Waits until the transport reports the session open. On failure the
    /// session returns to `Idle` so the caller may try again. Cancel safe:
    /// dropping the future before it completes also returns to `Idle`.
    ///
    /// # Errors
    ///
    /// - `AlreadyActive` if connecting or active (state unchanged)
    /// - `SessionClosed` if this instance was already torn down
    /// - `Connection` if the transport fails, closes or times out before open
    /// - `DeviceUnavailable` if the microphone cannot be acquired
    pub async fn start(&mut self) -> Result<()> {
        match self.state {
            SessionState::Connecting | SessionState::Active => return Err(Error::AlreadyActive),
            SessionState::Closed => return Err(Error::SessionClosed),
            SessionState::Idle => {}
        }

        tracing::info!(
            session = %self.id,
            transport = self.transport.name(),
            model = %self.config.model,
            "starting voice session"
        );
        self.set_state(SessionState::Connecting);

        let mut guard = ConnectingGuard(self);
        guard.0.connect_and_open().await
    }

    /// Body of `start()` once the session is `Connecting`
    async fn connect_and_open(&mut self) -> Result<()> {
        let connected = self.transport.connect(&self.config).await;
        let Connection { handle, mut events } = match connected {
            Ok(connection) => connection,
            Err(e) => return Err(self.abort_start(None, connection_error(e))),
        };

        let opened = self.await_open(&mut events).await;
        if let Err(e) = opened {
            return Err(self.abort_start(Some(&handle), e));
        }

        let outbound = Arc::clone(&handle);
        let started = self.capture.start(move |frame: AudioFrame| {
            outbound.send_realtime_input(RealtimeInput::from_frame(&frame));
        });
        if let Err(e) = started {
            return Err(self.abort_start(Some(&handle), e));
        }

        self.handle = Some(handle);
        self.inbound = Some(events);
        self.set_state(SessionState::Active);

        tracing::info!(session = %self.id, "voice session active");
        Ok(())
    }

    /// Wait for `Open`, bounded by the connect timeout
    async fn await_open(&self, events: &mut mpsc::UnboundedReceiver<TransportEvent>) -> Result<()> {
        let wait = async {
            loop {
                match events.recv().await {
                    Some(TransportEvent::Open) => return Ok(()),
                    Some(TransportEvent::Error(reason)) => return Err(Error::Connection(reason)),
                    Some(TransportEvent::Closed) | None => {
                        return Err(Error::Connection(
                            "channel closed before the session opened".to_string(),
                        ));
                    }
                    Some(other) => {
                        tracing::debug!(
                            session = %self.id,
                            event = ?other,
                            "event before open ignored"
                        );
                    }
                }
            }
        };

        tokio::time::timeout(self.config.connect_timeout, wait)
            .await
            .unwrap_or_else(|_| {
                Err(Error::Connection(format!(
                    "session did not open within {:?}",
                    self.config.connect_timeout
                )))
            })
    }

    /// Undo a failed `start()` and return to `Idle`
    fn abort_start(&mut self, handle: Option<&Arc<dyn TransportHandle>>, error: Error) -> Error {
        if let Some(handle) = handle {
            handle.close();
        }
        tracing::warn!(session = %self.id, error = %error, "voice session failed to start");
        self.set_state(SessionState::Idle);
        error
    }

    /// Tear the session down; no-op unless connecting or active
    pub fn stop(&mut self) {
        match self.state {
            SessionState::Idle | SessionState::Closed => {
                tracing::debug!(session = %self.id, state = %self.state, "stop ignored");
            }
            SessionState::Connecting | SessionState::Active => self.teardown(None),
        }
    }

    /// Await and handle the next inbound event
    ///
    /// Returns `false` once the session is no longer active. Cancel safe.
    pub async fn process_next(&mut self) -> bool {
        if self.state != SessionState::Active {
            return false;
        }

        let event = match self.inbound.as_mut() {
            Some(inbound) => inbound.recv().await,
            None => return false,
        };
        self.handle_transport_event(event.unwrap_or(TransportEvent::Closed));

        self.state == SessionState::Active
    }

    /// Handle inbound events until the session closes
    pub async fn run(&mut self) {
        while self.process_next().await {}
    }

    /// Send one captured frame; dropped silently unless active
    pub fn send_frame(&self, frame: &AudioFrame) {
        match (&self.handle, self.state) {
            (Some(handle), SessionState::Active) => {
                handle.send_realtime_input(RealtimeInput::from_frame(frame));
            }
            _ => tracing::trace!(session = %self.id, "frame dropped, session not active"),
        }
    }

    /// Apply one inbound transport event
    ///
    /// Events arriving outside `Active` are ignored.
    pub fn handle_transport_event(&mut self, event: TransportEvent) {
        if self.state != SessionState::Active {
            tracing::trace!(
                session = %self.id,
                state = %self.state,
                event = ?event,
                "event ignored"
            );
            return;
        }

        match event {
            TransportEvent::Open => {}
            TransportEvent::AudioChunk(data) => self.play_chunk(&data),
            TransportEvent::TranscriptDelta { text, role } => {
                let entry = self.transcript.push(role, text).clone();
                tracing::debug!(
                    session = %self.id,
                    role = %entry.role,
                    text = %entry.text,
                    "transcript"
                );
                self.emit(SessionEvent::Transcript(entry));
            }
            TransportEvent::Interrupted => {
                self.playback.interrupt();
                self.emit(SessionEvent::Interrupted);
            }
            TransportEvent::TurnComplete => self.emit(SessionEvent::TurnComplete),
            TransportEvent::Closed => {
                tracing::info!(session = %self.id, "remote closed the session");
                self.teardown(None);
            }
            TransportEvent::Error(reason) => {
                tracing::error!(session = %self.id, error = %reason, "live session failed");
                self.teardown(Some(Error::Connection(reason)));
            }
        }
    }

    /// Decode and schedule one inbound chunk; malformed chunks are dropped
    fn play_chunk(&mut self, data: &str) {
        let result = codec::decode_base64(data)
            .and_then(|bytes| codec::decode(&bytes, SampleRate::Playback, 1))
            .and_then(|frame| self.playback.enqueue(frame));

        if let Err(e) = result {
            tracing::warn!(session = %self.id, error = %e, "dropping inbound audio chunk");
            self.emit(SessionEvent::AudioDropped(e.to_string()));
        }
    }

    /// Release capture, playback and transport; each is attempted
    fn teardown(&mut self, cause: Option<Error>) {
        if self.state == SessionState::Closed {
            return;
        }

        self.capture.stop();
        self.playback.reset();
        if let Some(handle) = self.handle.take() {
            handle.close();
        }
        self.inbound = None;
        self.transcript.clear();

        if let Some(cause) = cause {
            self.emit(SessionEvent::Error(cause.to_string()));
        }
        self.set_state(SessionState::Closed);
        tracing::info!(session = %self.id, "voice session closed");
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            tracing::debug!(session = %self.id, from = %self.state, to = %state, "state change");
            self.state = state;
            self.emit(SessionEvent::StateChanged(state));
        }
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.observers.send(event);
    }
}

/// Returns a session still `Connecting` to `Idle` when `start()` is dropped
/// mid-await
struct ConnectingGuard<'a>(&'a mut VoiceSession);

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        if self.0.state == SessionState::Connecting {
            tracing::warn!(session = %self.0.id, "voice session start cancelled");
            self.0.set_state(SessionState::Idle);
        }
    }
}

impl Drop for VoiceSession {
    fn drop(&mut self) {
        if matches!(self.state, SessionState::Connecting | SessionState::Active) {
            self.teardown(None);
        }
    }
}

fn connection_error(error: Error) -> Error {
    match error {
        Error::Connection(_) | Error::Config(_) => error,
        other => Error::Connection(other.to_string()),
    }
}
