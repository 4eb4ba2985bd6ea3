//! Signal level metering
//!
//! Levels are RMS over one frame, normalized to `0.0..=1.0` against full
//! scale PCM16 and smoothed with an exponential moving average so a VU
//! display neither flickers nor lags badly.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::constants::LEVEL_SMOOTHING;

/// Root-mean-square of a PCM16 block, normalized to `0.0..=1.0`
pub fn rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples
        .iter()
        .map(|&s| {
            let v = s as f64 / 32768.0;
            v * v
        })
        .sum();
    ((sum / samples.len() as f64).sqrt() as f32).clamp(0.0, 1.0)
}

struct Shared {
    level_bits: AtomicU32,
    updated_us: AtomicU64,
}

/// Cheap cloneable view onto the most recent meter reading
#[derive(Clone)]
pub struct LevelHandle {
    shared: Arc<Shared>,
}

impl LevelHandle {
    /// Smoothed level in `0.0..=1.0`
    pub fn level(&self) -> f32 {
        f32::from_bits(self.shared.level_bits.load(Ordering::Relaxed))
    }

    /// Microseconds since the epoch of the last update, zero if never updated
    pub fn updated_us(&self) -> u64 {
        self.shared.updated_us.load(Ordering::Relaxed)
    }
}

/// Owns the smoothing state, publishes through its [`LevelHandle`]
pub struct LevelMeter {
    smoothed: f32,
    shared: Arc<Shared>,
}

impl LevelMeter {
    pub fn new() -> Self {
        Self {
            smoothed: 0.0,
            shared: Arc::new(Shared {
                level_bits: AtomicU32::new(0),
                updated_us: AtomicU64::new(0),
            }),
        }
    }

    pub fn handle(&self) -> LevelHandle {
        LevelHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Fold one frame into the smoothed level and publish it
    pub fn update(&mut self, samples: &[i16]) -> f32 {
        let instant = rms(samples);
        self.smoothed += LEVEL_SMOOTHING * (instant - self.smoothed);
        self.publish();
        self.smoothed
    }

    fn publish(&self) {
        self.shared
            .level_bits
            .store(self.smoothed.to_bits(), Ordering::Relaxed);
        let now_us = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        self.shared.updated_us.store(now_us, Ordering::Relaxed);
    }
}

impl Default for LevelMeter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rms_of_silence_is_zero() {
        assert_eq!(rms(&[0; 960]), 0.0);
        assert_eq!(rms(&[]), 0.0);
    }

    #[test]
    fn test_rms_of_full_scale_square_wave() {
        let wave: Vec<i16> = (0..960)
            .map(|i| if i % 2 == 0 { i16::MIN } else { i16::MAX })
            .collect();
        let level = rms(&wave);
        assert!(level > 0.999, "full scale square should read ~1.0, got {level}");
        assert!(level <= 1.0);
    }

    #[test]
    fn test_meter_decays_monotonically_on_silence() {
        let mut meter = LevelMeter::new();
        let loud: Vec<i16> = vec![20000; 960];
        meter.update(&loud);

        let mut previous = meter.handle().level();
        assert!(previous > 0.0);
        for _ in 0..20 {
            let current = meter.update(&[0; 960]);
            assert!(current < previous, "level must fall on silence");
            previous = current;
        }
        assert!(previous < 0.001);
    }

    #[test]
    fn test_handle_sees_updates() {
        let mut meter = LevelMeter::new();
        let handle = meter.handle();
        assert_eq!(handle.level(), 0.0);
        assert_eq!(handle.updated_us(), 0);

        meter.update(&[10000; 960]);
        assert!(handle.level() > 0.0);
        assert!(handle.updated_us() > 0);
    }
}
