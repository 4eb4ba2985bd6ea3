//! UDP transport threads and socket plumbing

pub mod receiver;
pub mod sender;
pub mod udp;

pub use receiver::{AudioReceiver, ReceiverStats};
pub use sender::{AckListener, AudioSender, SenderStats};
pub use udp::{bind_receiver_socket, connect_sender_socket, UdpLink};

use std::net::SocketAddr;

/// Control packets surfaced from the receive threads to the session
/// controller
///
/// Audio never travels this way, it goes straight into the jitter buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetEvent {
    HandshakeRequest {
        from: SocketAddr,
        sample_rate: u32,
        channels: u8,
    },
    HandshakeAck {
        from: SocketAddr,
        sample_rate: u32,
        channels: u8,
    },
    Heartbeat {
        from: SocketAddr,
    },
    Goodbye {
        from: SocketAddr,
    },
}
