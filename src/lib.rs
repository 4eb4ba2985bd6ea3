//! NetMic - phone microphone to virtual audio cable over the LAN
//!
//! The crate is split into a capture/send half and a receive/playback half,
//! joined by a small UDP datagram protocol:
//!
//! ```text
//!  sender                                      receiver
//!  ------                                      --------
//!  microphone (cpal)                           UDP socket
//!      | f32 callback blocks                       | datagrams
//!      v                                           v
//!  capture queue (lock-free ring)             decode + validate
//!      |                                           |
//!      v                                           v
//!  framer: downmix, PCM16, 20 ms frames       jitter buffer (reorder,
//!      |                                        conceal, resync)
//!      v                                           |
//!  UDP send + heartbeats          ---->            v
//!                                              playback (cpal) -> virtual cable
//!                                                  |
//!                                                  v
//!                                              level meter -> UI / logs
//! ```
//!
//! A session controller on each side runs the handshake, watches liveness
//! and drives reconnects, exposing state snapshots to the binaries.

pub mod audio;
pub mod config;
pub mod error;
pub mod feedback;
pub mod network;
pub mod protocol;
pub mod session;

pub use config::Config;
pub use error::{Error, Result};

/// Shared tuning constants
pub mod constants {
    /// Default UDP port for handshake and audio
    pub const DEFAULT_PORT: u16 = 50005;

    /// Default stream sample rate in Hz
    pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

    /// Default transported channel count
    pub const DEFAULT_CHANNELS: u8 = 1;

    /// Default frame duration in milliseconds
    pub const DEFAULT_FRAME_DURATION_MS: u32 = 20;

    /// Receive buffer size, covers the largest possible UDP datagram
    pub const MAX_DATAGRAM_SIZE: usize = 65536;

    /// Capture ring capacity in callback blocks before the oldest is displaced
    pub const CAPTURE_QUEUE_BLOCKS: usize = 64;

    /// Smoothing coefficient for the level meter, higher tracks faster
    pub const LEVEL_SMOOTHING: f32 = 0.4;
}
