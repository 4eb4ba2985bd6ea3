//! Turning capture blocks into fixed-duration wire frames
//!
//! Device callbacks deliver arbitrary block sizes in the device's channel
//! layout. The assembler folds those into the transport layout, converts
//! to PCM16 and slices off frames of exactly the configured duration.
//! Leftover samples stay pending for the next block; a partial frame at
//! shutdown is discarded.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::Sender;
use tracing::{debug, info, warn};

use crate::audio::buffer::CaptureQueue;
use crate::audio::meter::LevelMeter;
use crate::audio::AudioFrame;
use crate::error::Result;

/// Stateful block-to-frame converter
///
/// Pure and single-threaded, the worker in [`Framer`] drives it.
pub struct FrameAssembler {
    source_channels: u16,
    target_channels: u8,
    sample_rate: u32,
    frame_samples: usize,
    pending: VecDeque<f32>,
    carry: Vec<f32>,
    sequence: u32,
    emitted_samples: u64,
}

impl FrameAssembler {
    /// `frame_samples` is per channel of the transport layout
    pub fn new(
        source_channels: u16,
        target_channels: u8,
        sample_rate: u32,
        frame_samples: usize,
    ) -> Self {
        Self {
            source_channels: source_channels.max(1),
            target_channels: target_channels.max(1),
            sample_rate,
            frame_samples,
            pending: VecDeque::new(),
            carry: Vec::new(),
            sequence: 0,
            emitted_samples: 0,
        }
    }

    /// Fold one capture block in, returning every frame it completes
    pub fn push_block(&mut self, block: &[f32]) -> Vec<AudioFrame> {
        self.mix_in(block);

        let frame_len = self.frame_samples * self.target_channels as usize;
        let mut frames = Vec::new();
        while self.pending.len() >= frame_len {
            let samples: Vec<i16> = self
                .pending
                .drain(..frame_len)
                .map(convert_sample)
                .collect();

            let timestamp_us =
                (self.emitted_samples * 1_000_000) / self.sample_rate.max(1) as u64;
            frames.push(AudioFrame {
                sequence: self.sequence,
                timestamp_us,
                sample_rate: self.sample_rate,
                channels: self.target_channels,
                samples,
            });
            self.sequence = self.sequence.wrapping_add(1);
            self.emitted_samples += self.frame_samples as u64;
        }
        frames
    }

    /// Samples pending in the transport layout, short of a full frame
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn mix_in(&mut self, block: &[f32]) {
        let src = self.source_channels as usize;
        let dst = self.target_channels as usize;

        if src == dst {
            self.pending.extend(block.iter().copied());
            return;
        }

        // Device blocks are not guaranteed to end on a channel-group
        // boundary, so an incomplete group carries over to the next block.
        self.carry.extend_from_slice(block);
        let whole = (self.carry.len() / src) * src;
        for group in self.carry[..whole].chunks_exact(src) {
            let mono: f32 = group.iter().sum::<f32>() / src as f32;
            for _ in 0..dst {
                self.pending.push_back(mono);
            }
        }
        self.carry.drain(..whole);
    }
}

fn convert_sample(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * 32767.0).round() as i16
}

/// Worker thread popping the capture queue and emitting [`AudioFrame`]s
pub struct Framer {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    frames_produced: Arc<AtomicU64>,
    frames_dropped: Arc<AtomicU64>,
}

impl Framer {
    /// Spawn the framer thread
    ///
    /// Frames that the network side cannot accept in time are dropped
    /// here rather than letting backpressure reach the capture callback.
    pub fn spawn(
        queue: Arc<CaptureQueue>,
        sink: Sender<AudioFrame>,
        mut assembler: FrameAssembler,
        mut meter: LevelMeter,
    ) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let frames_produced = Arc::new(AtomicU64::new(0));
        let frames_dropped = Arc::new(AtomicU64::new(0));

        let thread_running = Arc::clone(&running);
        let thread_produced = Arc::clone(&frames_produced);
        let thread_dropped = Arc::clone(&frames_dropped);

        let handle = thread::Builder::new()
            .name("framer".to_string())
            .spawn(move || {
                info!("Framer started");
                while thread_running.load(Ordering::Relaxed) {
                    let block = match queue.pop() {
                        Some(block) => block,
                        None => {
                            thread::sleep(Duration::from_millis(2));
                            continue;
                        }
                    };

                    for frame in assembler.push_block(&block) {
                        meter.update(&frame.samples);
                        thread_produced.fetch_add(1, Ordering::Relaxed);
                        if let Err(e) = sink.try_send(frame) {
                            if e.is_disconnected() {
                                debug!("Frame sink closed, framer exiting");
                                thread_running.store(false, Ordering::SeqCst);
                                break;
                            }
                            let dropped =
                                thread_dropped.fetch_add(1, Ordering::Relaxed) + 1;
                            if dropped % 50 == 1 {
                                warn!("Network backlog, {} frames dropped", dropped);
                            }
                        }
                    }
                }
                info!("Framer stopped");
            })?;

        Ok(Self {
            running,
            handle: Some(handle),
            frames_produced,
            frames_dropped,
        })
    }

    pub fn frames_produced(&self) -> u64 {
        self.frames_produced.load(Ordering::Relaxed)
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped.load(Ordering::Relaxed)
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Framer {
    fn drop(&mut self) {
        self.stop();
    }
}
