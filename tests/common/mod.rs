//! Shared test utilities
//!
//! In-memory stand-ins for the transport and both audio devices.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use parley::voice::{InputDevice, OutputDevice, PlaybackId, SampleSink};
use parley::{
    AudioFrame, Connection, Error, LiveConfig, RealtimeInput, Result, SampleRate, Transport,
    TransportEvent, TransportHandle,
};

/// Short timeout so failure paths finish quickly
pub fn test_live_config() -> LiveConfig {
    LiveConfig {
        connect_timeout: Duration::from_millis(200),
        ..LiveConfig::default()
    }
}

/// Records everything sent through a connection
#[derive(Default)]
pub struct RecordingHandle {
    pub sent: Mutex<Vec<RealtimeInput>>,
    pub closed: AtomicBool,
    pub close_calls: Mutex<usize>,
}

impl RecordingHandle {
    pub fn sent(&self) -> Vec<RealtimeInput> {
        self.sent.lock().unwrap().clone()
    }
}

impl TransportHandle for RecordingHandle {
    fn send_realtime_input(&self, input: RealtimeInput) {
        if self.is_closed() {
            return;
        }
        self.sent.lock().unwrap().push(input);
    }

    fn close(&self) {
        *self.close_calls.lock().unwrap() += 1;
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// How the scripted transport behaves on connect
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum ConnectBehavior {
    /// Connect and immediately report `Open`
    Open,
    /// Fail to connect at all
    Refuse,
    /// Connect, then report an error before opening
    ErrorBeforeOpen,
    /// Connect and never open
    Hang,
}

/// A transport whose inbound side is driven by the test
pub struct ScriptedTransport {
    behavior: ConnectBehavior,
    pub handle: Arc<RecordingHandle>,
    inbound: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    pub connects: Mutex<usize>,
}

impl ScriptedTransport {
    pub fn new(behavior: ConnectBehavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            handle: Arc::new(RecordingHandle::default()),
            inbound: Mutex::new(None),
            connects: Mutex::new(0),
        })
    }

    /// Push an inbound event as if the remote sent it
    pub fn push(&self, event: TransportEvent) {
        let guard = self.inbound.lock().unwrap();
        let tx = guard.as_ref().expect("transport not connected");
        let _ = tx.send(event);
    }

    /// Drop the inbound sender, ending the event stream
    pub fn hang_up(&self) {
        self.inbound.lock().unwrap().take();
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn connect(&self, _config: &LiveConfig) -> Result<Connection> {
        *self.connects.lock().unwrap() += 1;
        if self.behavior == ConnectBehavior::Refuse {
            return Err(Error::Connection("connection refused".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        match self.behavior {
            ConnectBehavior::Open => {
                let _ = tx.send(TransportEvent::Open);
            }
            ConnectBehavior::ErrorBeforeOpen => {
                let _ = tx.send(TransportEvent::Error("API key not valid".to_string()));
            }
            ConnectBehavior::Hang | ConnectBehavior::Refuse => {}
        }
        *self.inbound.lock().unwrap() = Some(tx);

        Ok(Connection {
            handle: Arc::clone(&self.handle) as Arc<dyn TransportHandle>,
            events: rx,
        })
    }
}

/// A microphone the test feeds by hand
#[derive(Clone, Default)]
pub struct FakeInput {
    sink: Arc<Mutex<Option<SampleSink>>>,
    pub deny: bool,
    pub open: Arc<AtomicBool>,
}

impl FakeInput {
    pub fn denied() -> Self {
        Self {
            deny: true,
            ..Self::default()
        }
    }

    /// Deliver samples as one device callback; returns false if not open
    pub fn feed(&self, samples: &[f32]) -> bool {
        let mut guard = self.sink.lock().unwrap();
        match guard.as_mut() {
            Some(sink) => {
                sink(samples);
                true
            }
            None => false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

impl InputDevice for FakeInput {
    fn open(&mut self, sink: SampleSink) -> Result<()> {
        if self.deny {
            return Err(Error::DeviceUnavailable("permission denied".to_string()));
        }
        *self.sink.lock().unwrap() = Some(sink);
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn close(&mut self) {
        self.sink.lock().unwrap().take();
        self.open.store(false, Ordering::SeqCst);
    }
}

/// What the fake speaker was asked to do
#[derive(Default)]
pub struct OutputLog {
    /// Sample clock
    pub clock: u64,
    /// `(id, samples, start sample)` per scheduled frame
    pub scheduled: Vec<(PlaybackId, usize, u64)>,
    pub stopped: Vec<PlaybackId>,
    pub finished: Vec<PlaybackId>,
}

/// A 24 kHz speaker with a clock the test advances
#[derive(Clone, Default)]
pub struct FakeOutput {
    pub log: Arc<Mutex<OutputLog>>,
}

impl FakeOutput {
    pub fn advance(&self, by: Duration) {
        self.log.lock().unwrap().clock += SampleRate::Playback.samples_in(by);
    }

    pub fn now(&self) -> Duration {
        SampleRate::Playback.duration_of(self.log.lock().unwrap().clock)
    }

    /// `(id, samples, start time)` per scheduled frame
    pub fn scheduled(&self) -> Vec<(PlaybackId, usize, Duration)> {
        self.log
            .lock()
            .unwrap()
            .scheduled
            .iter()
            .map(|&(id, len, start)| (id, len, SampleRate::Playback.duration_of(start)))
            .collect()
    }

    /// Start positions in samples
    pub fn start_samples(&self) -> Vec<u64> {
        self.log
            .lock()
            .unwrap()
            .scheduled
            .iter()
            .map(|s| s.2)
            .collect()
    }

    pub fn stopped(&self) -> Vec<PlaybackId> {
        self.log.lock().unwrap().stopped.clone()
    }
}

impl OutputDevice for FakeOutput {
    fn sample_rate(&self) -> SampleRate {
        SampleRate::Playback
    }

    fn position(&self) -> u64 {
        self.log.lock().unwrap().clock
    }

    fn schedule(&mut self, id: PlaybackId, frame: &AudioFrame, start: u64) -> u64 {
        let mut log = self.log.lock().unwrap();
        let start = start.max(log.clock);
        log.scheduled.push((id, frame.len(), start));
        start
    }

    fn stop(&mut self, id: PlaybackId) {
        self.log.lock().unwrap().stopped.push(id);
    }

    fn take_finished(&mut self) -> Vec<PlaybackId> {
        std::mem::take(&mut self.log.lock().unwrap().finished)
    }
}

/// Base64 of `samples` silent 24 kHz PCM samples
pub fn silent_chunk(samples: usize) -> String {
    parley::voice::codec::encode_base64(&vec![0u8; samples * 2])
}

/// Generate sine wave audio samples
pub fn generate_sine_samples(
    rate: u32,
    frequency: f32,
    samples: usize,
    amplitude: f32,
) -> Vec<f32> {
    (0..samples)
        .map(|i| {
            let t = i as f32 / rate as f32;
            amplitude * (2.0 * std::f32::consts::PI * frequency * t).sin()
        })
        .collect()
}
