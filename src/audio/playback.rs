//! Playback of the received stream into the output device
//!
//! The output callback drains the jitter buffer one frame at a time into a
//! small pending queue and fans samples out to the device's channel layout.
//! When the buffer has nothing ready the callback writes silence, it never
//! blocks waiting for the network.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig};
use tracing::{info, warn};

use crate::audio::jitter::{PopOutcome, SharedJitter};
use crate::audio::meter::{LevelHandle, LevelMeter};
use crate::config::AudioConfig;
use crate::error::{AudioError, Error, Result};

/// Playout counters shared with the audio callback
#[derive(Default)]
pub struct PlaybackStats {
    frames_played: AtomicU64,
    frames_concealed: AtomicU64,
    silent_refills: AtomicU64,
}

impl PlaybackStats {
    pub fn frames_played(&self) -> u64 {
        self.frames_played.load(Ordering::Relaxed)
    }

    pub fn frames_concealed(&self) -> u64 {
        self.frames_concealed.load(Ordering::Relaxed)
    }

    /// Refill attempts that found nothing to play
    pub fn silent_refills(&self) -> u64 {
        self.silent_refills.load(Ordering::Relaxed)
    }
}

/// Pulls frames from the jitter buffer and writes the device buffer
///
/// Kept separate from the cpal stream so the playout logic is testable
/// without an audio device.
struct Renderer {
    jitter: SharedJitter,
    meter: LevelMeter,
    stats: Arc<PlaybackStats>,
    pending: VecDeque<i16>,
    source_channels: usize,
    output_channels: usize,
}

impl Renderer {
    fn new(
        jitter: SharedJitter,
        meter: LevelMeter,
        stats: Arc<PlaybackStats>,
        source_channels: usize,
        output_channels: usize,
    ) -> Self {
        Self {
            jitter,
            meter,
            stats,
            pending: VecDeque::new(),
            source_channels: source_channels.max(1),
            output_channels: output_channels.max(1),
        }
    }

    fn refill(&mut self) {
        let outcome = self.jitter.lock().pop_next();
        match outcome {
            PopOutcome::Frame(frame) => {
                self.meter.update(&frame.samples);
                self.stats.frames_played.fetch_add(1, Ordering::Relaxed);
                self.pending.extend(frame.samples);
            }
            PopOutcome::Concealed(silence) => {
                self.meter.update(&silence);
                self.stats.frames_concealed.fetch_add(1, Ordering::Relaxed);
                self.pending.extend(silence);
            }
            PopOutcome::NotReady => {
                self.stats.silent_refills.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn render(&mut self, out: &mut [f32]) {
        let mut dried = false;
        for group in out.chunks_mut(self.output_channels) {
            if self.pending.len() < self.source_channels {
                if !dried {
                    self.refill();
                }
                if self.pending.len() < self.source_channels {
                    // One refill per callback pass once the buffer reports
                    // not ready, the rest of the buffer is silence
                    dried = true;
                    group.fill(0.0);
                    continue;
                }
            }

            let mut source = [0.0f32; 2];
            for slot in source.iter_mut().take(self.source_channels) {
                *slot = self.pending.pop_front().unwrap_or(0) as f32 / 32768.0;
            }

            if self.output_channels < self.source_channels {
                let mixed: f32 =
                    source.iter().take(self.source_channels).sum::<f32>()
                        / self.source_channels as f32;
                group.fill(mixed);
            } else {
                for (i, slot) in group.iter_mut().enumerate() {
                    *slot = source[i.min(self.source_channels - 1)];
                }
            }
        }
    }
}

/// Owns the output stream feeding the virtual cable
pub struct PlaybackDriver {
    device: Device,
    stream_config: StreamConfig,
    stream: Option<Stream>,
    jitter: SharedJitter,
    level: LevelHandle,
    stats: Arc<PlaybackStats>,
    running: Arc<AtomicBool>,
    failed: Arc<AtomicBool>,
    source_channels: u8,
}

impl PlaybackDriver {
    /// Resolve the output device at the configured rate
    pub fn new(config: &AudioConfig, jitter: SharedJitter) -> Result<Self> {
        let device = super::device::output_device(config.output_device.as_deref())?;
        let (stream_config, format) =
            super::device::output_config(&device, config.sample_rate)?;
        if format != SampleFormat::F32 {
            return Err(Error::Audio(AudioError::UnsupportedFormat(format!(
                "sample format {:?}",
                format
            ))));
        }

        let meter = LevelMeter::new();
        let level = meter.handle();
        let stats = Arc::new(PlaybackStats::default());

        Ok(Self {
            device,
            stream_config,
            stream: None,
            jitter,
            level,
            stats,
            running: Arc::new(AtomicBool::new(false)),
            failed: Arc::new(AtomicBool::new(false)),
            source_channels: config.channels,
        })
    }

    /// Meter view over what is actually being played
    pub fn level(&self) -> LevelHandle {
        self.level.clone()
    }

    pub fn stats(&self) -> Arc<PlaybackStats> {
        Arc::clone(&self.stats)
    }

    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn start(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        self.running.store(true, Ordering::SeqCst);
        self.failed.store(false, Ordering::SeqCst);

        let meter = LevelMeter::new();
        self.level = meter.handle();
        let mut renderer = Renderer::new(
            Arc::clone(&self.jitter),
            meter,
            Arc::clone(&self.stats),
            self.source_channels as usize,
            self.stream_config.channels as usize,
        );

        let running = Arc::clone(&self.running);
        let failed = Arc::clone(&self.failed);
        let err_fn = move |err| {
            warn!("Playback stream error: {}", err);
            failed.store(true, Ordering::SeqCst);
        };

        let stream = self
            .device
            .build_output_stream(
                &self.stream_config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    if !running.load(Ordering::Relaxed) {
                        data.fill(0.0);
                        return;
                    }
                    renderer.render(data);
                },
                err_fn,
                None,
            )
            .map_err(|e| Error::Audio(AudioError::StreamError(e.to_string())))?;

        stream
            .play()
            .map_err(|e| Error::Audio(AudioError::StreamError(e.to_string())))?;
        info!(
            "Playback started: {} Hz, {} ch",
            self.stream_config.sample_rate.0, self.stream_config.channels
        );
        self.stream = Some(stream);
        Ok(())
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if self.stream.take().is_some() {
            info!("Playback stopped");
        }
    }
}

impl Drop for PlaybackDriver {
    fn drop(&mut self) {
        self.stop();
    }
}
