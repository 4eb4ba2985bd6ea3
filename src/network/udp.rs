//! Socket construction and the packet send seam

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info};

use crate::error::{Error, NetworkError, Result};
use crate::protocol::Packet;
use crate::session::ControlLink;

/// Read timeout on blocking sockets so receive loops can observe their
/// shutdown flag
pub const RECV_POLL: Duration = Duration::from_millis(200);

/// Bind the receiver's listening socket with enlarged kernel buffers
pub fn bind_receiver_socket(
    bind_addr: &str,
    port: u16,
    buffer_bytes: usize,
) -> Result<UdpSocket> {
    let ip: IpAddr = bind_addr
        .parse()
        .map_err(|e| Error::Network(NetworkError::BindFailed(format!("{}: {}", bind_addr, e))))?;
    let addr = SocketAddr::new(ip, port);

    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| Error::Network(NetworkError::BindFailed(e.to_string())))?;
    if let Err(e) = socket.set_recv_buffer_size(buffer_bytes) {
        debug!("Could not set receive buffer to {}: {}", buffer_bytes, e);
    }
    socket
        .bind(&addr.into())
        .map_err(|e| Error::Network(NetworkError::BindFailed(format!("{}: {}", addr, e))))?;

    let socket: UdpSocket = socket.into();
    socket
        .set_read_timeout(Some(RECV_POLL))
        .map_err(|e| Error::Network(NetworkError::BindFailed(e.to_string())))?;
    info!("Listening on {}", addr);
    Ok(socket)
}

/// Bind an ephemeral port and connect it to the receiver
pub fn connect_sender_socket(target: SocketAddr, buffer_bytes: usize) -> Result<UdpSocket> {
    let local = if target.is_ipv4() {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
    } else {
        SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
    };

    let socket = Socket::new(Domain::for_address(target), Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| Error::Network(NetworkError::ConnectFailed(e.to_string())))?;
    if let Err(e) = socket.set_send_buffer_size(buffer_bytes) {
        debug!("Could not set send buffer to {}: {}", buffer_bytes, e);
    }
    socket
        .bind(&local.into())
        .map_err(|e| Error::Network(NetworkError::ConnectFailed(e.to_string())))?;
    socket
        .connect(&target.into())
        .map_err(|e| Error::Network(NetworkError::ConnectFailed(format!("{}: {}", target, e))))?;

    let socket: UdpSocket = socket.into();
    socket
        .set_read_timeout(Some(RECV_POLL))
        .map_err(|e| Error::Network(NetworkError::ConnectFailed(e.to_string())))?;
    info!("Sending to {}", target);
    Ok(socket)
}

/// Sends control packets over a shared socket
///
/// The session controller talks through the [`ControlLink`] trait so its
/// logic can be driven by a fake in tests.
#[derive(Clone)]
pub struct UdpLink {
    socket: Arc<UdpSocket>,
}

impl UdpLink {
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        Self { socket }
    }
}

impl ControlLink for UdpLink {
    fn send_packet(&self, packet: &Packet, to: Option<SocketAddr>) -> Result<()> {
        let wire = packet.encode();
        let result = match to {
            Some(addr) => self.socket.send_to(&wire, addr),
            None => self.socket.send(&wire),
        };
        result.map_err(|e| Error::Network(NetworkError::SendFailed(e.to_string())))?;
        Ok(())
    }
}
