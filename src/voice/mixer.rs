//! Sample-accurate mixer behind the cpal output stream

use std::sync::Arc;
use std::time::Duration;

use super::codec::samples_to_duration;
use super::playback::PlaybackId;

/// One scheduled buffer
#[derive(Debug)]
struct Voice {
    id: PlaybackId,
    start: u64,
    samples: Arc<[f32]>,
}

impl Voice {
    fn end(&self) -> u64 {
        self.start + self.samples.len() as u64
    }
}

/// Renders scheduled mono buffers at their start offsets
///
/// The clock is the number of frames rendered so far.
#[derive(Debug)]
pub struct Mixer {
    rate: u32,
    position: u64,
    voices: Vec<Voice>,
    finished: Vec<PlaybackId>,
}

impl Mixer {
    /// Create a mixer running at `rate` frames per second
    #[must_use]
    pub const fn new(rate: u32) -> Self {
        Self {
            rate,
            position: 0,
            voices: Vec::new(),
            finished: Vec::new(),
        }
    }

    /// Frames rendered since the stream started
    #[must_use]
    pub const fn position(&self) -> u64 {
        self.position
    }

    /// Current position as time since the stream started
    #[must_use]
    pub const fn current_time(&self) -> Duration {
        samples_to_duration(self.position, self.rate)
    }

    /// Schedule `samples` to start at frame `start`
    ///
    /// A start the stream has already rendered past is moved up to the
    /// current position so the voice plays in full. Returns the frame the
    /// voice actually starts at.
    pub fn schedule(&mut self, id: PlaybackId, start: u64, samples: Arc<[f32]>) -> u64 {
        let start = start.max(self.position);
        self.voices.push(Voice { id, start, samples });
        start
    }

    /// Silence a voice immediately
    pub fn stop(&mut self, id: PlaybackId) {
        self.voices.retain(|v| v.id != id);
    }

    /// Take the ids of voices that played to the end
    pub fn take_finished(&mut self) -> Vec<PlaybackId> {
        std::mem::take(&mut self.finished)
    }

    /// Number of voices not yet finished
    #[must_use]
    pub fn active(&self) -> usize {
        self.voices.len()
    }

    /// Fill an interleaved output buffer and advance the clock
    #[allow(clippy::cast_possible_truncation)]
    pub fn render(&mut self, out: &mut [f32], channels: usize) {
        for frame in out.chunks_mut(channels.max(1)) {
            let position = self.position;
            let mut sample = 0.0;

            for voice in &self.voices {
                if position >= voice.start {
                    if let Some(s) = voice.samples.get((position - voice.start) as usize) {
                        sample += s;
                    }
                }
            }

            frame.fill(sample.clamp(-1.0, 1.0));
            self.position += 1;
        }

        let position = self.position;
        let finished = &mut self.finished;
        self.voices.retain(|voice| {
            let done = position >= voice.end();
            if done {
                finished.push(voice.id);
            }
            !done
        });
    }
}
