//! Audio capture from microphone
//!
//! [`CapturePipeline`] frames raw device callbacks into fixed-size 16 kHz
//! blocks and hands each one to a sink. The device itself sits behind
//! [`InputDevice`] so the pipeline can run without hardware.

use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate as CpalRate, StreamConfig};
use rubato::{FftFixedIn, Resampler};

use super::codec::{AudioFrame, SampleRate};
use crate::{Error, Result};

/// Sample rate for audio capture (16kHz for speech)
pub const SAMPLE_RATE: u32 = SampleRate::Capture.hz();

/// Default samples per captured frame
pub const FRAME_SIZE: usize = 4096;

/// Receives raw mono f32 samples at [`SAMPLE_RATE`] from a device callback
pub type SampleSink = Box<dyn FnMut(&[f32]) + Send + 'static>;

/// A microphone that can be opened exclusively and closed again
pub trait InputDevice: Send {
    /// Start delivering samples to `sink`
    ///
    /// # Errors
    ///
    /// Returns `DeviceUnavailable` if the device cannot be acquired
    fn open(&mut self, sink: SampleSink) -> Result<()>;

    /// Stop delivering samples and release the device
    fn close(&mut self);
}

/// Splits an arbitrary callback stream into fixed-size frames
#[derive(Debug)]
pub struct FrameAssembler {
    frame_size: usize,
    pending: Vec<f32>,
}

impl FrameAssembler {
    /// Create an assembler emitting frames of `frame_size` samples
    #[must_use]
    pub fn new(frame_size: usize) -> Self {
        Self {
            frame_size: frame_size.max(1),
            pending: Vec::with_capacity(frame_size),
        }
    }

    /// Append samples, returning every frame completed by them in order
    pub fn push(&mut self, samples: &[f32]) -> Vec<AudioFrame> {
        let mut frames = Vec::new();
        let mut rest = samples;

        while !rest.is_empty() {
            let needed = self.frame_size - self.pending.len();
            let take = needed.min(rest.len());
            self.pending.extend_from_slice(&rest[..take]);
            rest = &rest[take..];

            if self.pending.len() == self.frame_size {
                frames.push(AudioFrame::from_f32(&self.pending, SampleRate::Capture));
                self.pending.clear();
            }
        }

        frames
    }

    /// Samples waiting for the current frame to fill
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// Owns the input device for one session and frames its output
pub struct CapturePipeline {
    device: Box<dyn InputDevice>,
    frame_size: usize,
    running: bool,
}

impl CapturePipeline {
    /// Create a pipeline over `device` emitting `frame_size`-sample frames
    #[must_use]
    pub fn new(device: Box<dyn InputDevice>, frame_size: usize) -> Self {
        Self {
            device,
            frame_size,
            running: false,
        }
    }

    /// Start capturing; `on_frame` runs once per completed frame, in order
    ///
    /// # Errors
    ///
    /// Returns `DeviceUnavailable` if the microphone cannot be acquired
    pub fn start<F>(&mut self, mut on_frame: F) -> Result<()>
    where
        F: FnMut(AudioFrame) + Send + 'static,
    {
        if self.running {
            return Ok(());
        }

        let mut assembler = FrameAssembler::new(self.frame_size);
        self.device.open(Box::new(move |samples| {
            for frame in assembler.push(samples) {
                on_frame(frame);
            }
        }))?;
        self.running = true;

        tracing::debug!(frame_size = self.frame_size, "audio capture started");
        Ok(())
    }

    /// Stop capturing and release the device
    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.device.close();
        self.running = false;
        tracing::debug!("audio capture stopped");
    }

    /// Check if currently capturing
    #[must_use]
    pub const fn is_capturing(&self) -> bool {
        self.running
    }

    /// Samples per frame
    #[must_use]
    pub const fn frame_size(&self) -> usize {
        self.frame_size
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The default system microphone via cpal
///
/// The cpal stream lives on its own thread because it is not `Send`.
#[derive(Default)]
pub struct CpalInput {
    shutdown: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl CpalInput {
    /// Create an unopened input
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl InputDevice for CpalInput {
    fn open(&mut self, sink: SampleSink) -> Result<()> {
        if self.thread.is_some() {
            return Ok(());
        }

        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<()>>();
        let (shutdown_tx, shutdown_rx) = std_mpsc::channel::<()>();

        let thread = std::thread::Builder::new()
            .name("parley-capture".to_string())
            .spawn(move || {
                let stream = match build_input_stream(sink) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                // Blocks until close() or the sender is dropped
                let _ = shutdown_rx.recv();
                drop(stream);
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.shutdown = Some(shutdown_tx);
                self.thread = Some(thread);
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(Error::DeviceUnavailable(
                    "capture thread exited during startup".to_string(),
                ))
            }
        }
    }

    fn close(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("capture thread panicked");
            }
        }
    }
}

impl Drop for CpalInput {
    fn drop(&mut self) {
        self.close();
    }
}

fn device_error(e: impl std::fmt::Display) -> Error {
    Error::DeviceUnavailable(e.to_string())
}

/// Open and start the default input stream, feeding `sink`
fn build_input_stream(mut sink: SampleSink) -> Result<cpal::Stream> {
    let host = cpal::default_host();

    let device = host
        .default_input_device()
        .ok_or_else(|| Error::DeviceUnavailable("no input device available".to_string()))?;

    let native = device
        .supported_input_configs()
        .map_err(device_error)?
        .find(|c| {
            c.channels() == 1
                && c.min_sample_rate() <= CpalRate(SAMPLE_RATE)
                && c.max_sample_rate() >= CpalRate(SAMPLE_RATE)
        });

    let config: StreamConfig = match native {
        Some(supported) => supported.with_sample_rate(CpalRate(SAMPLE_RATE)).config(),
        None => device.default_input_config().map_err(device_error)?.config(),
    };

    let mut converter = InputConverter::new(config.sample_rate.0, config.channels)?;

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        device_rate = config.sample_rate.0,
        channels = config.channels,
        resampling = converter.is_resampling(),
        "audio capture initialized"
    );

    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let samples = converter.convert(data);
                if !samples.is_empty() {
                    sink(&samples);
                }
            },
            |err| {
                tracing::error!(error = %err, "audio capture error");
            },
            None,
        )
        .map_err(device_error)?;

    stream.play().map_err(device_error)?;
    Ok(stream)
}

/// Down-mixes and resamples device audio to 16 kHz mono
struct InputConverter {
    channels: usize,
    resampler: Option<FftFixedIn<f32>>,
    pending: Vec<f32>,
}

impl InputConverter {
    fn new(device_rate: u32, channels: u16) -> Result<Self> {
        let resampler = if device_rate == SAMPLE_RATE {
            None
        } else {
            let resampler = FftFixedIn::<f32>::new(
                device_rate as usize,
                SAMPLE_RATE as usize,
                1024,
                2,
                1,
            )
            .map_err(device_error)?;
            Some(resampler)
        };

        Ok(Self {
            channels: usize::from(channels.max(1)),
            resampler,
            pending: Vec::new(),
        })
    }

    const fn is_resampling(&self) -> bool {
        self.resampler.is_some()
    }

    fn convert(&mut self, data: &[f32]) -> Vec<f32> {
        let mono: Vec<f32> = if self.channels == 1 {
            data.to_vec()
        } else {
            #[allow(clippy::cast_precision_loss)]
            let divisor = self.channels as f32;
            data.chunks(self.channels)
                .map(|frame| frame.iter().sum::<f32>() / divisor)
                .collect()
        };

        let Some(resampler) = self.resampler.as_mut() else {
            return mono;
        };

        self.pending.extend_from_slice(&mono);
        let mut out = Vec::new();
        loop {
            let needed = resampler.input_frames_next();
            if self.pending.len() < needed {
                break;
            }
            let chunk: Vec<f32> = self.pending.drain(..needed).collect();
            match resampler.process(&[chunk], None) {
                Ok(mut channels) => {
                    if let Some(resampled) = channels.pop() {
                        out.extend(resampled);
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "resampling failed, dropping block");
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_assembler_emits_full_frames_only() {
        let mut assembler = FrameAssembler::new(4);

        assert!(assembler.push(&[0.1, 0.2, 0.3]).is_empty());
        assert_eq!(assembler.pending(), 3);

        let frames = assembler.push(&[0.4, 0.5, 0.6, 0.7, 0.8, 0.9]);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].len(), 4);
        assert_eq!(frames[1].len(), 4);
        assert_eq!(assembler.pending(), 1);
    }

    #[test]
    fn test_assembler_preserves_order() {
        let mut assembler = FrameAssembler::new(2);
        let samples = [0.0, 0.25, 0.5, 0.75];
        let frames = assembler.push(&samples);

        let flattened: Vec<i16> = frames.iter().flat_map(|f| f.samples().to_vec()).collect();
        let expected = AudioFrame::from_f32(&samples, SampleRate::Capture);
        assert_eq!(flattened, expected.samples());
    }

    #[derive(Default)]
    struct ManualInput {
        sink: Arc<Mutex<Option<SampleSink>>>,
        opens: usize,
        closes: usize,
    }

    impl InputDevice for ManualInput {
        fn open(&mut self, sink: SampleSink) -> Result<()> {
            self.opens += 1;
            *self.sink.lock().unwrap() = Some(sink);
            Ok(())
        }

        fn close(&mut self) {
            self.closes += 1;
            self.sink.lock().unwrap().take();
        }
    }

    struct DeniedInput;

    impl InputDevice for DeniedInput {
        fn open(&mut self, _sink: SampleSink) -> Result<()> {
            Err(Error::DeviceUnavailable("permission denied".to_string()))
        }

        fn close(&mut self) {}
    }

    #[test]
    fn test_pipeline_delivers_frames_in_order() {
        let sink = Arc::new(Mutex::new(None));
        let device = ManualInput {
            sink: Arc::clone(&sink),
            ..ManualInput::default()
        };
        let mut pipeline = CapturePipeline::new(Box::new(device), 3);

        let received = Arc::new(Mutex::new(Vec::new()));
        let received_clone = Arc::clone(&received);
        pipeline
            .start(move |frame| received_clone.lock().unwrap().push(frame))
            .unwrap();
        assert!(pipeline.is_capturing());

        {
            let mut guard = sink.lock().unwrap();
            let push = guard.as_mut().unwrap();
            push(&[0.1, 0.2]);
            push(&[0.3, 0.4, 0.5, 0.6, 0.7]);
        }

        let frames = received.lock().unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(
            frames[0],
            AudioFrame::from_f32(&[0.1, 0.2, 0.3], SampleRate::Capture)
        );
        assert_eq!(
            frames[1],
            AudioFrame::from_f32(&[0.4, 0.5, 0.6], SampleRate::Capture)
        );
    }

    #[test]
    fn test_stop_is_idempotent_and_safe_before_start() {
        let mut pipeline = CapturePipeline::new(Box::new(ManualInput::default()), FRAME_SIZE);
        pipeline.stop();
        pipeline.start(|_| {}).unwrap();
        pipeline.stop();
        pipeline.stop();
        assert!(!pipeline.is_capturing());
    }

    #[test]
    fn test_start_surfaces_device_unavailable() {
        let mut pipeline = CapturePipeline::new(Box::new(DeniedInput), FRAME_SIZE);
        let err = pipeline.start(|_| {}).unwrap_err();
        assert!(matches!(err, Error::DeviceUnavailable(_)));
        assert!(!pipeline.is_capturing());
    }

    #[test]
    fn test_converter_downmixes_stereo() {
        let mut converter = InputConverter::new(SAMPLE_RATE, 2).unwrap();
        assert!(!converter.is_resampling());
        let out = converter.convert(&[0.2, 0.4, -0.5, 0.5]);
        assert_eq!(out.len(), 2);
        assert!((out[0] - 0.3).abs() < f32::EPSILON);
        assert!(out[1].abs() < f32::EPSILON);
    }

    #[test]
    fn test_converter_resamples_to_capture_rate() {
        let mut converter = InputConverter::new(48_000, 1).unwrap();
        assert!(converter.is_resampling());

        let out = converter.convert(&vec![0.0; 48_000]);
        // One second in, roughly one second out, minus what is still buffered
        assert!(out.len() > 15_000 && out.len() <= 16_000);
    }
}
