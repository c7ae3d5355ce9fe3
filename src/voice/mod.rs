//! Voice processing module
//!
//! Handles PCM encoding, microphone capture and scheduled playback.
//! The transport and session layers live in `transport` and `session`.

mod capture;
pub mod codec;
mod mixer;
mod playback;

pub use capture::{
    CapturePipeline, CpalInput, FRAME_SIZE, FrameAssembler, InputDevice, SAMPLE_RATE, SampleSink,
};
pub use codec::{AudioFrame, SampleRate};
pub use mixer::Mixer;
pub use playback::{
    CpalOutput, OutputDevice, PLAYBACK_SAMPLE_RATE, PlaybackEntry, PlaybackId, PlaybackScheduler,
};
