//! Audio playback to speakers
//!
//! [`PlaybackScheduler`] places decoded frames back to back on an
//! [`OutputDevice`] clock so that consecutive chunks play without gaps or
//! overlap, and can drop everything at once when the remote side barges in.

use std::collections::BTreeMap;
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::SampleRate as CpalRate;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

use super::codec::{AudioFrame, SampleRate};
use super::mixer::Mixer;
use crate::{Error, Result};

/// Sample rate for playback (matches the remote speech output)
pub const PLAYBACK_SAMPLE_RATE: u32 = SampleRate::Playback.hz();

/// Identifies one scheduled playback unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PlaybackId(pub u64);

/// A speaker with a monotonic sample clock that plays buffers at scheduled
/// positions
pub trait OutputDevice: Send {
    /// Rate the device plays at
    fn sample_rate(&self) -> SampleRate;

    /// Samples played since the device started
    fn position(&self) -> u64;

    /// Start playing `frame` at sample `start`; must not block
    ///
    /// If the device already played past `start` the frame starts at the
    /// current position instead. Returns the position it actually starts at.
    fn schedule(&mut self, id: PlaybackId, frame: &AudioFrame, start: u64) -> u64;

    /// Stop a scheduled or playing unit
    fn stop(&mut self, id: PlaybackId);

    /// Ids that played to completion since the last call
    fn take_finished(&mut self) -> Vec<PlaybackId>;
}

/// A frame owned by the scheduler until it finishes or is stopped
#[derive(Debug, Clone)]
pub struct PlaybackEntry {
    /// Decoded audio
    pub frame: AudioFrame,
    /// Device sample position the frame starts at
    pub start: u64,
}

impl PlaybackEntry {
    /// Device sample position the frame ends at
    #[must_use]
    pub fn end(&self) -> u64 {
        self.start + self.frame.len() as u64
    }

    /// Device time the frame starts at
    #[must_use]
    pub fn start_time(&self) -> Duration {
        self.frame.rate().duration_of(self.start)
    }
}

/// Schedules frames for ordered, gap-free playback
///
/// The timeline is kept in whole device samples so back-to-back frames never
/// drift apart; times are derived only when reported.
pub struct PlaybackScheduler {
    device: Box<dyn OutputDevice>,
    next_free: u64,
    next_id: u64,
    in_flight: BTreeMap<PlaybackId, PlaybackEntry>,
}

impl PlaybackScheduler {
    /// Create a scheduler that exclusively owns `device`
    #[must_use]
    pub fn new(device: Box<dyn OutputDevice>) -> Self {
        Self {
            device,
            next_free: 0,
            next_id: 0,
            in_flight: BTreeMap::new(),
        }
    }

    /// Schedule `frame` right after everything already queued, or now if idle
    ///
    /// Returns the device time the frame starts at.
    ///
    /// # Errors
    ///
    /// Returns `MalformedAudio` if the frame rate differs from the device rate
    pub fn enqueue(&mut self, frame: AudioFrame) -> Result<Duration> {
        let device_rate = self.device.sample_rate();
        if frame.rate() != device_rate {
            return Err(Error::MalformedAudio(format!(
                "frame at {} Hz on a {} Hz device",
                frame.rate().hz(),
                device_rate.hz()
            )));
        }

        self.reap_finished();

        let requested = self.next_free.max(self.device.position());
        let id = PlaybackId(self.next_id);
        self.next_id += 1;

        let start = self.device.schedule(id, &frame, requested);
        let entry = PlaybackEntry { frame, start };
        self.next_free = entry.end();
        let start_time = entry.start_time();
        self.in_flight.insert(id, entry);

        tracing::trace!(
            id = id.0,
            start,
            late = start.saturating_sub(requested),
            "frame scheduled"
        );
        Ok(start_time)
    }

    /// Stop everything scheduled and restart the timeline at the device clock
    pub fn interrupt(&mut self) {
        let stopped = self.in_flight.len();
        for id in std::mem::take(&mut self.in_flight).into_keys() {
            self.device.stop(id);
        }
        // Anything reported finished before the stop is stale now
        let _ = self.device.take_finished();
        self.next_free = self.device.position();

        tracing::debug!(stopped, "playback interrupted");
    }

    /// Silence all playback; used on session teardown
    pub fn reset(&mut self) {
        self.interrupt();
    }

    /// Units scheduled or still playing on the device clock
    ///
    /// Frames the device already played through are not counted even if the
    /// device has not reported them finished yet.
    #[must_use]
    pub fn pending(&self) -> usize {
        let position = self.device.position();
        self.in_flight
            .values()
            .filter(|entry| entry.end() > position)
            .count()
    }

    /// Device time the next enqueued frame would start at, at the earliest
    #[must_use]
    pub fn next_free_time(&self) -> Duration {
        self.device.sample_rate().duration_of(self.next_free)
    }

    /// Current device clock
    #[must_use]
    pub fn current_time(&self) -> Duration {
        self.device.sample_rate().duration_of(self.device.position())
    }

    fn reap_finished(&mut self) {
        for id in self.device.take_finished() {
            self.in_flight.remove(&id);
        }
    }
}

/// The default system speaker via cpal
///
/// A continuously running output stream renders a [`Mixer`]; the stream
/// lives on its own thread because it is not `Send`.
pub struct CpalOutput {
    mixer: Arc<Mutex<Mixer>>,
    shutdown: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl CpalOutput {
    /// Open the default output device at 24 kHz
    ///
    /// # Errors
    ///
    /// Returns `DeviceUnavailable` if no suitable output device exists
    pub fn open() -> Result<Self> {
        let mixer = Arc::new(Mutex::new(Mixer::new(PLAYBACK_SAMPLE_RATE)));
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<()>>();
        let (shutdown_tx, shutdown_rx) = std_mpsc::channel::<()>();

        let stream_mixer = Arc::clone(&mixer);
        let thread = std::thread::Builder::new()
            .name("parley-playback".to_string())
            .spawn(move || {
                let stream = match build_output_stream(stream_mixer) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                let _ = shutdown_rx.recv();
                drop(stream);
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                mixer,
                shutdown: Some(shutdown_tx),
                thread: Some(thread),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(Error::DeviceUnavailable(
                    "playback thread exited during startup".to_string(),
                ))
            }
        }
    }

    fn mixer(&self) -> MutexGuard<'_, Mixer> {
        self.mixer.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl OutputDevice for CpalOutput {
    fn sample_rate(&self) -> SampleRate {
        SampleRate::Playback
    }

    fn position(&self) -> u64 {
        self.mixer().position()
    }

    fn schedule(&mut self, id: PlaybackId, frame: &AudioFrame, start: u64) -> u64 {
        let samples = frame.to_mono_f32().into();
        self.mixer().schedule(id, start, samples)
    }

    fn stop(&mut self, id: PlaybackId) {
        self.mixer().stop(id);
    }

    fn take_finished(&mut self) -> Vec<PlaybackId> {
        self.mixer().take_finished()
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("playback thread panicked");
            }
        }
    }
}

fn device_error(e: impl std::fmt::Display) -> Error {
    Error::DeviceUnavailable(e.to_string())
}

/// Open and start the default output stream rendering `mixer`
fn build_output_stream(mixer: Arc<Mutex<Mixer>>) -> Result<cpal::Stream> {
    let host = cpal::default_host();

    let device = host
        .default_output_device()
        .ok_or_else(|| Error::DeviceUnavailable("no output device available".to_string()))?;

    let supports = |c: &cpal::SupportedStreamConfigRange, channels: u16| {
        c.channels() == channels
            && c.min_sample_rate() <= CpalRate(PLAYBACK_SAMPLE_RATE)
            && c.max_sample_rate() >= CpalRate(PLAYBACK_SAMPLE_RATE)
    };

    let supported_config = device
        .supported_output_configs()
        .map_err(device_error)?
        .find(|c| supports(c, 1))
        .or_else(|| {
            // Fallback: try stereo
            device
                .supported_output_configs()
                .ok()?
                .find(|c| supports(c, 2))
        })
        .ok_or_else(|| Error::DeviceUnavailable("no suitable output config found".to_string()))?;

    let config = supported_config
        .with_sample_rate(CpalRate(PLAYBACK_SAMPLE_RATE))
        .config();
    let channels = usize::from(config.channels);

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate = PLAYBACK_SAMPLE_RATE,
        channels,
        "audio playback initialized"
    );

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                mixer
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .render(data, channels);
            },
            |err| {
                tracing::error!(error = %err, "audio playback error");
            },
            None,
        )
        .map_err(device_error)?;

    stream.play().map_err(device_error)?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::codec::decode;

    /// Output device with a hand-driven sample clock
    #[derive(Default)]
    struct ManualOutput {
        clock: Arc<Mutex<u64>>,
        stopped: Arc<Mutex<Vec<PlaybackId>>>,
        finished: Arc<Mutex<Vec<PlaybackId>>>,
    }

    impl OutputDevice for ManualOutput {
        fn sample_rate(&self) -> SampleRate {
            SampleRate::Playback
        }

        fn position(&self) -> u64 {
            *self.clock.lock().unwrap()
        }

        fn schedule(&mut self, _id: PlaybackId, _frame: &AudioFrame, start: u64) -> u64 {
            start.max(self.position())
        }

        fn stop(&mut self, id: PlaybackId) {
            self.stopped.lock().unwrap().push(id);
        }

        fn take_finished(&mut self) -> Vec<PlaybackId> {
            std::mem::take(&mut *self.finished.lock().unwrap())
        }
    }

    /// Device that pretends its stream rendered `lag` samples between the
    /// clock read and the schedule call
    struct RacingOutput {
        clock: u64,
        lag: u64,
    }

    impl OutputDevice for RacingOutput {
        fn sample_rate(&self) -> SampleRate {
            SampleRate::Playback
        }

        fn position(&self) -> u64 {
            self.clock
        }

        fn schedule(&mut self, _id: PlaybackId, _frame: &AudioFrame, start: u64) -> u64 {
            self.clock += self.lag;
            start.max(self.clock)
        }

        fn stop(&mut self, _id: PlaybackId) {}

        fn take_finished(&mut self) -> Vec<PlaybackId> {
            Vec::new()
        }
    }

    fn frame(samples: usize) -> AudioFrame {
        decode(&vec![0; samples * 2], SampleRate::Playback, 1).unwrap()
    }

    #[test]
    fn test_back_to_back_frames_have_no_gap() {
        let mut scheduler = PlaybackScheduler::new(Box::new(ManualOutput::default()));
        let durations = [2400, 4800, 1200, 24_000];

        let mut previous: Option<(Duration, Duration)> = None;
        for samples in durations {
            let f = frame(samples);
            let duration = f.duration();
            let start = scheduler.enqueue(f).unwrap();
            if let Some((prev_start, prev_duration)) = previous {
                assert_eq!(start, prev_start + prev_duration);
            }
            previous = Some((start, duration));
        }
        assert_eq!(scheduler.pending(), durations.len());
    }

    #[test]
    fn test_long_run_stays_sample_exact() {
        let mut scheduler = PlaybackScheduler::new(Box::new(ManualOutput::default()));
        let f = frame(1001);

        for _ in 0..100_000 {
            scheduler.enqueue(f.clone()).unwrap();
        }

        let starts: Vec<u64> = scheduler.in_flight.values().map(|e| e.start).collect();
        assert!(starts.windows(2).all(|w| w[1] == w[0] + 1001));
        assert_eq!(scheduler.next_free, 100_000 * 1001);
    }

    #[test]
    fn test_late_frame_starts_at_clock() {
        let device = ManualOutput::default();
        let clock = Arc::clone(&device.clock);
        let mut scheduler = PlaybackScheduler::new(Box::new(device));

        scheduler.enqueue(frame(2400)).unwrap();
        *clock.lock().unwrap() = 5 * 24_000;
        let start = scheduler.enqueue(frame(2400)).unwrap();

        assert_eq!(start, Duration::from_secs(5));
    }

    #[test]
    fn test_timeline_follows_device_start() {
        let mut scheduler = PlaybackScheduler::new(Box::new(RacingOutput {
            clock: 1000,
            lag: 480,
        }));

        let start = scheduler.enqueue(frame(2400)).unwrap();

        assert_eq!(start, SampleRate::Playback.duration_of(1480));
        assert_eq!(scheduler.next_free, 1480 + 2400);
    }

    #[test]
    fn test_interrupt_stops_all_and_resets_timeline() {
        let device = ManualOutput::default();
        let clock = Arc::clone(&device.clock);
        let stopped = Arc::clone(&device.stopped);
        let mut scheduler = PlaybackScheduler::new(Box::new(device));

        scheduler.enqueue(frame(24_000)).unwrap();
        scheduler.enqueue(frame(24_000)).unwrap();
        assert_eq!(scheduler.next_free_time(), Duration::from_secs(2));

        *clock.lock().unwrap() = 7200;
        scheduler.interrupt();

        assert_eq!(scheduler.pending(), 0);
        assert_eq!(*stopped.lock().unwrap(), vec![PlaybackId(0), PlaybackId(1)]);

        let start = scheduler.enqueue(frame(2400)).unwrap();
        assert_eq!(start, Duration::from_millis(300));
    }

    #[test]
    fn test_finished_entries_are_reaped() {
        let device = ManualOutput::default();
        let finished = Arc::clone(&device.finished);
        let mut scheduler = PlaybackScheduler::new(Box::new(device));

        scheduler.enqueue(frame(2400)).unwrap();
        finished.lock().unwrap().push(PlaybackId(0));
        scheduler.enqueue(frame(2400)).unwrap();

        assert_eq!(scheduler.in_flight.len(), 1);
    }

    #[test]
    fn test_pending_excludes_played_frames() {
        let device = ManualOutput::default();
        let clock = Arc::clone(&device.clock);
        let mut scheduler = PlaybackScheduler::new(Box::new(device));

        scheduler.enqueue(frame(2400)).unwrap();
        scheduler.enqueue(frame(2400)).unwrap();
        assert_eq!(scheduler.pending(), 2);

        *clock.lock().unwrap() = 2400;
        assert_eq!(scheduler.pending(), 1);

        *clock.lock().unwrap() = 10_000;
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn test_rejects_capture_rate_frame() {
        let mut scheduler = PlaybackScheduler::new(Box::new(ManualOutput::default()));
        let capture = AudioFrame::from_f32(&[0.0; 16], SampleRate::Capture);

        assert!(matches!(
            scheduler.enqueue(capture),
            Err(Error::MalformedAudio(_))
        ));
        assert_eq!(scheduler.pending(), 0);
    }
}
