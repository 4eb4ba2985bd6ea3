//! Wire protocol for audio and control datagrams
//!
//! Every datagram carries exactly one packet: a fixed 16-byte header
//! followed by the payload. All header integers are little-endian, matching
//! the little-endian PCM16 payload encoding.
//!
//! ```text
//! offset  size  field
//!      0     4  magic marker "NMIC"
//!      4     1  packet type
//!      5     4  sequence        (AUDIO only, zero otherwise)
//!      9     4  sample rate     (HANDSHAKE*/AUDIO, zero otherwise)
//!     13     1  channel count   (HANDSHAKE*/AUDIO, zero otherwise)
//!     14     2  payload length in bytes
//!     16     -  payload: signed 16-bit little-endian samples (AUDIO)
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::constants::MAX_DATAGRAM_SIZE;
use crate::error::ProtocolError;

/// Magic marker at the start of every datagram
pub const MAGIC: [u8; 4] = *b"NMIC";

/// Fixed header length in bytes
pub const HEADER_LEN: usize = 16;

/// Largest payload a single datagram may carry
pub const MAX_PAYLOAD_LEN: usize = MAX_DATAGRAM_SIZE - HEADER_LEN;

/// Packet type discriminants as they appear on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    HandshakeRequest = 1,
    HandshakeAck = 2,
    Audio = 3,
    Heartbeat = 4,
    Goodbye = 5,
}

impl PacketType {
    fn from_wire(value: u8) -> Result<Self, ProtocolError> {
        match value {
            1 => Ok(Self::HandshakeRequest),
            2 => Ok(Self::HandshakeAck),
            3 => Ok(Self::Audio),
            4 => Ok(Self::Heartbeat),
            5 => Ok(Self::Goodbye),
            other => Err(ProtocolError::UnknownType(other)),
        }
    }
}

/// A decoded datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Sender offers a stream format and asks to pair
    HandshakeRequest { sample_rate: u32, channels: u8 },
    /// Receiver accepts, echoing the format it will play at
    HandshakeAck { sample_rate: u32, channels: u8 },
    /// One audio frame worth of PCM16 samples
    Audio {
        sequence: u32,
        sample_rate: u32,
        channels: u8,
        samples: Vec<i16>,
    },
    /// Keepalive while no audio is flowing
    Heartbeat,
    /// Orderly end of session
    Goodbye,
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::HandshakeRequest { .. } => PacketType::HandshakeRequest,
            Packet::HandshakeAck { .. } => PacketType::HandshakeAck,
            Packet::Audio { .. } => PacketType::Audio,
            Packet::Heartbeat => PacketType::Heartbeat,
            Packet::Goodbye => PacketType::Goodbye,
        }
    }

    /// Encode into a freshly allocated wire buffer
    pub fn encode(&self) -> Bytes {
        let payload_len = match self {
            Packet::Audio { samples, .. } => samples.len() * 2,
            _ => 0,
        };

        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload_len);
        buf.put_slice(&MAGIC);
        buf.put_u8(self.packet_type() as u8);

        match self {
            Packet::HandshakeRequest {
                sample_rate,
                channels,
            }
            | Packet::HandshakeAck {
                sample_rate,
                channels,
            } => {
                buf.put_u32_le(0);
                buf.put_u32_le(*sample_rate);
                buf.put_u8(*channels);
                buf.put_u16_le(0);
            }
            Packet::Audio {
                sequence,
                sample_rate,
                channels,
                samples,
            } => {
                buf.put_u32_le(*sequence);
                buf.put_u32_le(*sample_rate);
                buf.put_u8(*channels);
                buf.put_u16_le(payload_len as u16);
                for sample in samples {
                    buf.put_i16_le(*sample);
                }
            }
            Packet::Heartbeat | Packet::Goodbye => {
                buf.put_u32_le(0);
                buf.put_u32_le(0);
                buf.put_u8(0);
                buf.put_u16_le(0);
            }
        }

        buf.freeze()
    }

    /// Decode a received datagram
    ///
    /// Any malformed datagram yields a [`ProtocolError`]; callers discard
    /// the datagram and count it, they never treat this as fatal.
    pub fn decode(datagram: &[u8]) -> Result<Packet, ProtocolError> {
        if datagram.len() < HEADER_LEN {
            return Err(ProtocolError::TooShort(datagram.len()));
        }

        let mut buf = datagram;
        let mut magic = [0u8; 4];
        buf.copy_to_slice(&mut magic);
        if magic != MAGIC {
            return Err(ProtocolError::BadMagic);
        }

        let packet_type = PacketType::from_wire(buf.get_u8())?;
        let sequence = buf.get_u32_le();
        let sample_rate = buf.get_u32_le();
        let channels = buf.get_u8();
        let payload_len = buf.get_u16_le() as usize;

        if payload_len > MAX_PAYLOAD_LEN {
            return Err(ProtocolError::PayloadTooLarge(payload_len));
        }
        if buf.remaining() != payload_len {
            return Err(ProtocolError::LengthMismatch {
                declared: payload_len,
                actual: buf.remaining(),
            });
        }

        match packet_type {
            PacketType::HandshakeRequest => Ok(Packet::HandshakeRequest {
                sample_rate,
                channels,
            }),
            PacketType::HandshakeAck => Ok(Packet::HandshakeAck {
                sample_rate,
                channels,
            }),
            PacketType::Audio => {
                if payload_len % 2 != 0 {
                    return Err(ProtocolError::OddPayload);
                }
                let mut samples = Vec::with_capacity(payload_len / 2);
                while buf.remaining() >= 2 {
                    samples.push(buf.get_i16_le());
                }
                Ok(Packet::Audio {
                    sequence,
                    sample_rate,
                    channels,
                    samples,
                })
            }
            PacketType::Heartbeat => Ok(Packet::Heartbeat),
            PacketType::Goodbye => Ok(Packet::Goodbye),
        }
    }
}
