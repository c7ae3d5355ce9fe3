//! PCM codec
//!
//! Converts between float samples and 16-bit little-endian PCM, and wraps the
//! PCM bytes in base64 for the transport. Everything here is pure.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

use crate::{Error, Result};

/// Scale between float samples and i16 PCM
const PCM_SCALE: f32 = 32767.0;

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Convert a sample position at `hz` to time, truncated to the nanosecond
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub const fn samples_to_duration(samples: u64, hz: u32) -> Duration {
    let hz = hz as u64;
    // Sub-second remainder is below one second, so it fits in u32 nanos
    Duration::new(samples / hz, ((samples % hz) * NANOS_PER_SEC / hz) as u32)
}

/// Sample rates supported at the transport boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleRate {
    /// Microphone capture (16 kHz)
    Capture,
    /// Synthesized speech playback (24 kHz)
    Playback,
}

impl SampleRate {
    /// Rate in Hz
    #[must_use]
    pub const fn hz(self) -> u32 {
        match self {
            Self::Capture => 16_000,
            Self::Playback => 24_000,
        }
    }

    /// Time covered by `samples` samples per channel
    #[must_use]
    pub const fn duration_of(self, samples: u64) -> Duration {
        samples_to_duration(samples, self.hz())
    }

    /// Whole samples per channel that fit in `duration`
    #[must_use]
    pub const fn samples_in(self, duration: Duration) -> u64 {
        let hz = self.hz() as u64;
        duration.as_secs() * hz + duration.subsec_nanos() as u64 * hz / NANOS_PER_SEC
    }

    /// MIME type tag used on the wire, e.g. `audio/pcm;rate=16000`
    #[must_use]
    pub fn mime_type(self) -> String {
        format!("audio/pcm;rate={}", self.hz())
    }
}

/// An immutable block of 16-bit PCM samples
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    samples: Arc<[i16]>,
    rate: SampleRate,
    channels: u16,
}

impl AudioFrame {
    /// Build a frame from already-quantized samples
    ///
    /// # Errors
    ///
    /// Returns `MalformedAudio` if `channels` is zero or the sample count is
    /// not a multiple of the channel count
    pub fn new(samples: Vec<i16>, rate: SampleRate, channels: u16) -> Result<Self> {
        if channels == 0 {
            return Err(Error::MalformedAudio("zero channels".to_string()));
        }
        if samples.len() % usize::from(channels) != 0 {
            return Err(Error::MalformedAudio(format!(
                "{} samples do not divide into {channels} channels",
                samples.len()
            )));
        }
        Ok(Self {
            samples: samples.into(),
            rate,
            channels,
        })
    }

    /// Quantize mono float samples into a frame
    #[must_use]
    pub fn from_f32(samples: &[f32], rate: SampleRate) -> Self {
        Self {
            samples: samples.iter().map(|&s| quantize(s)).collect(),
            rate,
            channels: 1,
        }
    }

    /// Raw samples
    #[must_use]
    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    /// Sample rate
    #[must_use]
    pub const fn rate(&self) -> SampleRate {
        self.rate
    }

    /// Channel count
    #[must_use]
    pub const fn channels(&self) -> u16 {
        self.channels
    }

    /// Number of samples per channel
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len() / usize::from(self.channels)
    }

    /// True if the frame holds no samples
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Playback duration
    #[must_use]
    pub fn duration(&self) -> Duration {
        self.rate.duration_of(self.len() as u64)
    }

    /// Little-endian PCM bytes
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        self.samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    /// Float samples in [-1.0, 1.0], interleaved as stored
    #[must_use]
    pub fn to_f32(&self) -> Vec<f32> {
        self.samples
            .iter()
            .map(|&s| (f32::from(s) / PCM_SCALE).max(-1.0))
            .collect()
    }

    /// Float samples averaged down to a single channel
    #[must_use]
    pub fn to_mono_f32(&self) -> Vec<f32> {
        let floats = self.to_f32();
        if self.channels == 1 {
            return floats;
        }
        let channels = usize::from(self.channels);
        #[allow(clippy::cast_precision_loss)]
        let divisor = channels as f32;
        floats
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / divisor)
            .collect()
    }
}

/// Quantize one float sample to i16, clamping instead of wrapping
#[allow(clippy::cast_possible_truncation)]
fn quantize(sample: f32) -> i16 {
    (sample * PCM_SCALE)
        .round()
        .clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16
}

/// Encode float samples as little-endian 16-bit PCM bytes
#[must_use]
pub fn encode(samples: &[f32], rate: SampleRate) -> Vec<u8> {
    AudioFrame::from_f32(samples, rate).to_bytes()
}

/// Decode little-endian 16-bit PCM bytes into a frame
///
/// # Errors
///
/// Returns `MalformedAudio` if the byte length is odd or the samples do not
/// divide evenly into `channels`
pub fn decode(bytes: &[u8], rate: SampleRate, channels: u16) -> Result<AudioFrame> {
    if bytes.len() % 2 != 0 {
        return Err(Error::MalformedAudio(format!(
            "odd PCM payload length: {} bytes",
            bytes.len()
        )));
    }

    let samples = bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect();

    AudioFrame::new(samples, rate, channels)
}

/// Wrap bytes for a text transport
#[must_use]
pub fn encode_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Unwrap a base64 transport payload
///
/// # Errors
///
/// Returns `MalformedAudio` if the payload is not valid base64
pub fn decode_base64(data: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(data)
        .map_err(|e| Error::MalformedAudio(format!("invalid base64 payload: {e}")))
}
