//! Microphone capture into the lock-free hand-off queue
//!
//! The cpal callback copies each block into the [`CaptureQueue`] and does
//! nothing else. Conversion, downmixing and framing all happen on the
//! framer thread where blocking is harmless.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig};
use tracing::{info, warn};

use crate::audio::buffer::CaptureQueue;
use crate::config::AudioConfig;
use crate::constants::CAPTURE_QUEUE_BLOCKS;
use crate::error::{AudioError, Error, Result};

/// Owns the input stream and feeds the capture queue
pub struct AudioCapture {
    device: Device,
    stream_config: StreamConfig,
    sample_format: SampleFormat,
    stream: Option<Stream>,
    queue: Arc<CaptureQueue>,
    running: Arc<AtomicBool>,
    failed: Arc<AtomicBool>,
    samples_captured: Arc<AtomicU64>,
}

impl AudioCapture {
    /// Resolve the device and a capture format at the configured rate
    pub fn new(config: &AudioConfig) -> Result<Self> {
        let device = super::device::input_device(config.input_device.as_deref())?;
        let (stream_config, sample_format) =
            super::device::input_config(&device, config.sample_rate)?;

        Ok(Self {
            device,
            stream_config,
            sample_format,
            stream: None,
            queue: Arc::new(CaptureQueue::new(CAPTURE_QUEUE_BLOCKS)),
            running: Arc::new(AtomicBool::new(false)),
            failed: Arc::new(AtomicBool::new(false)),
            samples_captured: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn queue(&self) -> Arc<CaptureQueue> {
        Arc::clone(&self.queue)
    }

    /// Channel count the device actually delivers
    pub fn channels(&self) -> u16 {
        self.stream_config.channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.stream_config.sample_rate.0
    }

    pub fn samples_captured(&self) -> u64 {
        self.samples_captured.load(Ordering::Relaxed)
    }

    /// True once the stream has reported a fatal error, e.g. the device
    /// was unplugged
    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn start(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        self.running.store(true, Ordering::SeqCst);
        self.failed.store(false, Ordering::SeqCst);

        let queue = Arc::clone(&self.queue);
        let running = Arc::clone(&self.running);
        let samples = Arc::clone(&self.samples_captured);
        let failed = Arc::clone(&self.failed);
        let err_fn = move |err| {
            warn!("Capture stream error: {}", err);
            failed.store(true, Ordering::SeqCst);
        };

        let stream = match self.sample_format {
            SampleFormat::F32 => self
                .device
                .build_input_stream(
                    &self.stream_config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        if !running.load(Ordering::Relaxed) {
                            return;
                        }
                        samples.fetch_add(data.len() as u64, Ordering::Relaxed);
                        queue.push(data.to_vec());
                    },
                    err_fn,
                    None,
                )
                .map_err(|e| Error::Audio(AudioError::StreamError(e.to_string())))?,
            SampleFormat::I16 => self
                .device
                .build_input_stream(
                    &self.stream_config,
                    move |data: &[i16], _: &cpal::InputCallbackInfo| {
                        if !running.load(Ordering::Relaxed) {
                            return;
                        }
                        samples.fetch_add(data.len() as u64, Ordering::Relaxed);
                        let block = data.iter().map(|&s| s as f32 / 32768.0).collect();
                        queue.push(block);
                    },
                    err_fn,
                    None,
                )
                .map_err(|e| Error::Audio(AudioError::StreamError(e.to_string())))?,
            other => {
                return Err(Error::Audio(AudioError::UnsupportedFormat(format!(
                    "sample format {:?}",
                    other
                ))))
            }
        };

        stream
            .play()
            .map_err(|e| Error::Audio(AudioError::StreamError(e.to_string())))?;
        info!(
            "Capture started: {} Hz, {} ch",
            self.sample_rate(),
            self.channels()
        );
        self.stream = Some(stream);
        Ok(())
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if self.stream.take().is_some() {
            info!("Capture stopped");
        }
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Sine generator standing in for a microphone
///
/// Used by the sender's tone mode to verify the network path without a
/// working input device.
pub struct ToneGenerator {
    phase: f32,
    step: f32,
    amplitude: f32,
}

impl ToneGenerator {
    pub fn new(frequency: f32, sample_rate: u32, amplitude: f32) -> Self {
        Self {
            phase: 0.0,
            step: std::f32::consts::TAU * frequency / sample_rate as f32,
            amplitude,
        }
    }

    pub fn next_block(&mut self, len: usize) -> Vec<f32> {
        let mut block = Vec::with_capacity(len);
        for _ in 0..len {
            block.push(self.phase.sin() * self.amplitude);
            self.phase += self.step;
            if self.phase >= std::f32::consts::TAU {
                self.phase -= std::f32::consts::TAU;
            }
        }
        block
    }
}

/// Feed the capture queue with a paced test tone instead of a device
pub fn spawn_tone_capture(
    queue: Arc<CaptureQueue>,
    sample_rate: u32,
    block_len: usize,
    running: Arc<AtomicBool>,
) -> Result<JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name("capture-tone".to_string())
        .spawn(move || {
            let mut tone = ToneGenerator::new(440.0, sample_rate, 0.5);
            let pace = Duration::from_micros(
                (block_len as u64 * 1_000_000) / sample_rate as u64,
            );
            info!("Tone capture started: 440 Hz at {} Hz", sample_rate);
            while running.load(Ordering::Relaxed) {
                queue.push(tone.next_block(block_len));
                thread::sleep(pace);
            }
        })?;
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tone_block_length_and_bounds() {
        let mut tone = ToneGenerator::new(440.0, 48000, 0.5);
        let block = tone.next_block(960);
        assert_eq!(block.len(), 960);
        assert!(block.iter().all(|s| s.abs() <= 0.5 + f32::EPSILON));
    }

    #[test]
    fn test_tone_has_energy() {
        let mut tone = ToneGenerator::new(440.0, 48000, 0.5);
        let block = tone.next_block(4800);
        let energy: f32 = block.iter().map(|s| s * s).sum();
        assert!(energy > 1.0);
    }

    #[test]
    fn test_tone_is_continuous_across_blocks() {
        let mut tone = ToneGenerator::new(440.0, 48000, 0.5);
        let first = tone.next_block(100);
        let second = tone.next_block(100);
        let step = 0.5 * std::f32::consts::TAU * 440.0 / 48000.0;
        let jump = (second[0] - first[99]).abs();
        assert!(jump <= step * 1.5, "phase discontinuity at block edge");
    }

    #[test]
    fn test_tone_thread_fills_queue() {
        let queue = Arc::new(CaptureQueue::new(CAPTURE_QUEUE_BLOCKS));
        let running = Arc::new(AtomicBool::new(true));
        let handle =
            spawn_tone_capture(Arc::clone(&queue), 8000, 80, Arc::clone(&running)).unwrap();

        thread::sleep(Duration::from_millis(100));
        running.store(false, Ordering::SeqCst);
        handle.join().unwrap();

        assert!(queue.pushed_blocks() > 0);
    }
}
