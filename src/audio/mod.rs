//! Audio capture, framing, buffering and playback

pub mod buffer;
pub mod capture;
pub mod device;
pub mod framer;
pub mod jitter;
pub mod meter;
pub mod playback;

pub use buffer::CaptureQueue;
pub use capture::AudioCapture;
pub use framer::{FrameAssembler, Framer};
pub use jitter::{JitterBuffer, PopOutcome, SharedJitter};
pub use meter::{LevelHandle, LevelMeter};
pub use playback::PlaybackDriver;

use std::time::Duration;

/// One fixed-duration block of PCM16 audio moving through the pipeline
///
/// Sequence numbers increase by one per frame and wrap at `u32::MAX`.
/// On the sender the timestamp is derived from the running sample count,
/// on the receiver it is stamped at arrival.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub sequence: u32,
    pub timestamp_us: u64,
    pub sample_rate: u32,
    pub channels: u8,
    pub samples: Vec<i16>,
}

impl AudioFrame {
    /// Samples per channel
    pub fn samples_per_channel(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    /// Wall-clock duration this frame covers
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(
            (self.samples_per_channel() as u64 * 1_000_000) / self.sample_rate as u64,
        )
    }
}
