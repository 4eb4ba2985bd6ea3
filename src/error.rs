//! Error types for the microphone streaming pipeline

use thiserror::Error;

/// Main error type for the application
#[derive(Error, Debug)]
pub enum Error {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Audio subsystem errors
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),
}

/// Network errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Socket bind failed: {0}")]
    BindFailed(String),

    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),
}

/// Wire protocol errors; every variant maps to a discarded datagram
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Datagram too short: {0} bytes")]
    TooShort(usize),

    #[error("Bad magic marker")]
    BadMagic,

    #[error("Unknown packet type: {0}")]
    UnknownType(u8),

    #[error("Payload length mismatch: header says {declared}, got {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("Audio payload is not a whole number of 16-bit samples")]
    OddPayload,
}

/// Session lifecycle errors
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Handshake failed after {attempts} attempts")]
    HandshakeFailed { attempts: u32 },

    #[error("Sample format mismatch: peer offers {peer_rate} Hz / {peer_channels} ch")]
    FormatMismatch { peer_rate: u32, peer_channels: u8 },

    #[error("Peer silent for {silent_ms} ms, gave up reconnecting")]
    PeerLost { silent_ms: u64 },

    #[error("Session is closed")]
    Closed,
}

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, Error>;
