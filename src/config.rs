//! Configuration loading and validation
//!
//! Settings come from a TOML file, either an explicit path or the platform
//! config directory (`netmic.toml`). Every field has a default, so a missing
//! or empty file yields a fully working configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Top-level configuration for both the sender and the receiver
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub audio: AudioConfig,
    pub network: NetworkConfig,
    pub jitter: JitterConfig,
    pub session: SessionConfig,
}

/// Stream format and device selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Sample rate both ends must agree on
    pub sample_rate: u32,
    /// Channel count of the transported stream
    pub channels: u8,
    /// Frame duration in milliseconds
    pub frame_duration_ms: u32,
    /// Capture device name, `None` picks the system default
    pub input_device: Option<String>,
    /// Playback device name, typically the virtual cable input
    pub output_device: Option<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            channels: 1,
            frame_duration_ms: 20,
            input_device: None,
            output_device: None,
        }
    }
}

impl AudioConfig {
    /// Samples per frame per channel at the configured rate
    pub fn frame_samples(&self) -> usize {
        (self.sample_rate as usize * self.frame_duration_ms as usize) / 1000
    }

    pub fn frame_duration(&self) -> Duration {
        Duration::from_millis(self.frame_duration_ms as u64)
    }
}

/// Socket addressing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// UDP port the receiver listens on
    pub port: u16,
    /// Local address the receiver binds to
    pub bind_addr: String,
    /// Kernel socket buffer size for send and receive
    pub socket_buffer_bytes: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: 50005,
            bind_addr: "0.0.0.0".to_string(),
            socket_buffer_bytes: 262_144,
        }
    }
}

/// Jitter buffer tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JitterConfig {
    /// Frames buffered before playout starts
    pub target_depth: usize,
    /// Ticks to wait for a late frame before concealing it
    pub max_wait_ticks: u32,
    /// Ring capacity in frames, must be a power of two
    pub capacity: usize,
}

impl Default for JitterConfig {
    fn default() -> Self {
        Self {
            target_depth: 3,
            max_wait_ticks: 2,
            capacity: 16,
        }
    }
}

/// Session liveness and retry timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub heartbeat_interval_ms: u64,
    /// Silence longer than this means the peer is gone
    pub inactivity_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    pub handshake_retries: u32,
    /// Pause between reconnect attempts after a session drops
    pub reconnect_delay_ms: u64,
    /// Sender gives up after this long without any ack or heartbeat
    pub max_stall_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 1000,
            inactivity_timeout_ms: 3000,
            handshake_timeout_ms: 5000,
            handshake_retries: 3,
            reconnect_delay_ms: 2000,
            max_stall_ms: 15_000,
        }
    }
}

impl SessionConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_millis(self.inactivity_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn max_stall(&self) -> Duration {
        Duration::from_millis(self.max_stall_ms)
    }
}

impl Config {
    /// Load from an explicit path, or from the platform config directory,
    /// falling back to defaults when no file exists
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let candidate = match path {
            Some(p) => Some(p.to_path_buf()),
            None => Self::default_path(),
        };

        let config = match candidate {
            Some(p) if p.exists() => {
                info!("Loading configuration from {}", p.display());
                let raw = std::fs::read_to_string(&p)?;
                toml::from_str(&raw)
                    .map_err(|e| Error::Config(format!("{}: {}", p.display(), e)))?
            }
            Some(p) => {
                debug!("No config file at {}, using defaults", p.display());
                Self::default()
            }
            None => Self::default(),
        };

        config.validate()?;
        Ok(config)
    }

    fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "netmic").map(|dirs| dirs.config_dir().join("netmic.toml"))
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.audio.sample_rate < 8000 || self.audio.sample_rate > 192_000 {
            return Err(Error::Config(format!(
                "sample_rate {} outside 8000..=192000",
                self.audio.sample_rate
            )));
        }
        if self.audio.channels == 0 || self.audio.channels > 2 {
            return Err(Error::Config(format!(
                "channels must be 1 or 2, got {}",
                self.audio.channels
            )));
        }
        if self.audio.frame_duration_ms < 5 || self.audio.frame_duration_ms > 100 {
            return Err(Error::Config(format!(
                "frame_duration_ms {} outside 5..=100",
                self.audio.frame_duration_ms
            )));
        }
        let payload_bytes = self.audio.frame_samples() * self.audio.channels as usize * 2;
        if payload_bytes > crate::protocol::MAX_PAYLOAD_LEN {
            return Err(Error::Config(format!(
                "one frame is {} bytes, larger than a single datagram allows ({})",
                payload_bytes,
                crate::protocol::MAX_PAYLOAD_LEN
            )));
        }
        if !self.jitter.capacity.is_power_of_two() {
            return Err(Error::Config(format!(
                "jitter capacity {} is not a power of two",
                self.jitter.capacity
            )));
        }
        if self.jitter.target_depth == 0 || self.jitter.target_depth >= self.jitter.capacity {
            return Err(Error::Config(format!(
                "jitter target_depth {} must be between 1 and capacity {}",
                self.jitter.target_depth, self.jitter.capacity
            )));
        }
        if self.session.heartbeat_interval_ms == 0 {
            return Err(Error::Config("heartbeat_interval_ms must be nonzero".into()));
        }
        if self.session.inactivity_timeout_ms <= self.session.heartbeat_interval_ms {
            return Err(Error::Config(format!(
                "inactivity_timeout_ms {} must exceed heartbeat_interval_ms {}",
                self.session.inactivity_timeout_ms, self.session.heartbeat_interval_ms
            )));
        }
        if self.session.max_stall_ms <= self.session.inactivity_timeout_ms {
            return Err(Error::Config(format!(
                "max_stall_ms {} must exceed inactivity_timeout_ms {}",
                self.session.max_stall_ms, self.session.inactivity_timeout_ms
            )));
        }
        Ok(())
    }
}
