//! Receiver-side network thread
//!
//! One thread owns the listening socket: control packets are forwarded to
//! the session controller, audio goes straight into the jitter buffer with
//! an arrival timestamp. Malformed datagrams and format mismatches are
//! counted and dropped, a hostile or confused peer can never take the
//! receive loop down.

use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::audio::jitter::SharedJitter;
use crate::audio::AudioFrame;
use crate::constants::MAX_DATAGRAM_SIZE;
use crate::error::Result;
use crate::network::NetEvent;
use crate::protocol::Packet;

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Wire counters for the incoming side
#[derive(Default)]
pub struct ReceiverStats {
    packets_received: AtomicU64,
    bytes_received: AtomicU64,
    audio_frames: AtomicU64,
    malformed: AtomicU64,
    format_mismatches: AtomicU64,
    last_activity_us: AtomicU64,
}

impl ReceiverStats {
    pub fn packets_received(&self) -> u64 {
        self.packets_received.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn audio_frames(&self) -> u64 {
        self.audio_frames.load(Ordering::Relaxed)
    }

    pub fn malformed(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    pub fn format_mismatches(&self) -> u64 {
        self.format_mismatches.load(Ordering::Relaxed)
    }

    fn touch(&self) {
        self.last_activity_us.store(now_micros(), Ordering::Relaxed);
    }

    /// Time since the last valid packet, `None` before the first one
    pub fn idle_for(&self) -> Option<Duration> {
        let last = self.last_activity_us.load(Ordering::Relaxed);
        if last == 0 {
            return None;
        }
        Some(Duration::from_micros(now_micros().saturating_sub(last)))
    }
}

/// Thread feeding the jitter buffer from the listening socket
pub struct AudioReceiver {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    stats: Arc<ReceiverStats>,
}

impl AudioReceiver {
    pub fn spawn(
        socket: Arc<UdpSocket>,
        jitter: SharedJitter,
        events: UnboundedSender<NetEvent>,
        expected_rate: u32,
        expected_channels: u8,
    ) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(ReceiverStats::default());
        let expected_samples = jitter.lock().frame_len();

        let thread_running = Arc::clone(&running);
        let thread_stats = Arc::clone(&stats);

        let handle = thread::Builder::new()
            .name("net-recv".to_string())
            .spawn(move || {
                info!("Audio receiver started");
                let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
                while thread_running.load(Ordering::Relaxed) {
                    let (len, from) = match socket.recv_from(&mut buf) {
                        Ok(received) => received,
                        Err(e)
                            if e.kind() == std::io::ErrorKind::WouldBlock
                                || e.kind() == std::io::ErrorKind::TimedOut =>
                        {
                            continue;
                        }
                        Err(e) => {
                            debug!("Receive error: {}", e);
                            thread::sleep(Duration::from_millis(50));
                            continue;
                        }
                    };

                    let packet = match Packet::decode(&buf[..len]) {
                        Ok(packet) => packet,
                        Err(e) => {
                            let malformed =
                                thread_stats.malformed.fetch_add(1, Ordering::Relaxed) + 1;
                            if malformed % 50 == 1 {
                                warn!("Discarded malformed datagram from {}: {}", from, e);
                            }
                            continue;
                        }
                    };

                    thread_stats.packets_received.fetch_add(1, Ordering::Relaxed);
                    thread_stats
                        .bytes_received
                        .fetch_add(len as u64, Ordering::Relaxed);
                    thread_stats.touch();

                    let event = match packet {
                        Packet::Audio {
                            sequence,
                            sample_rate,
                            channels,
                            samples,
                        } => {
                            if sample_rate != expected_rate
                                || channels != expected_channels
                                || samples.len() != expected_samples
                            {
                                let mismatches = thread_stats
                                    .format_mismatches
                                    .fetch_add(1, Ordering::Relaxed)
                                    + 1;
                                if mismatches % 50 == 1 {
                                    warn!(
                                        "Dropping audio at {} Hz/{} ch/{} samples, \
                                         expected {} Hz/{} ch/{} samples",
                                        sample_rate,
                                        channels,
                                        samples.len(),
                                        expected_rate,
                                        expected_channels,
                                        expected_samples
                                    );
                                }
                                continue;
                            }
                            thread_stats.audio_frames.fetch_add(1, Ordering::Relaxed);
                            jitter.lock().insert(AudioFrame {
                                sequence,
                                timestamp_us: now_micros(),
                                sample_rate,
                                channels,
                                samples,
                            });
                            continue;
                        }
                        Packet::HandshakeRequest {
                            sample_rate,
                            channels,
                        } => NetEvent::HandshakeRequest {
                            from,
                            sample_rate,
                            channels,
                        },
                        Packet::Heartbeat => NetEvent::Heartbeat { from },
                        Packet::Goodbye => NetEvent::Goodbye { from },
                        Packet::HandshakeAck { .. } => {
                            debug!("Unexpected handshake ack on listening socket");
                            continue;
                        }
                    };

                    if events.send(event).is_err() {
                        debug!("Event channel closed, receiver exiting");
                        break;
                    }
                }
                info!("Audio receiver stopped");
            })?;

        Ok(Self {
            running,
            handle: Some(handle),
            stats,
        })
    }

    pub fn stats(&self) -> Arc<ReceiverStats> {
        Arc::clone(&self.stats)
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for AudioReceiver {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::jitter::JitterBuffer;
    use crate::config::JitterConfig;
    use crate::network::udp::bind_receiver_socket;

    fn setup() -> (AudioReceiver, SharedJitter, UdpSocket, std::net::SocketAddr) {
        let socket = Arc::new(bind_receiver_socket("127.0.0.1", 0, 65536).unwrap());
        let addr = socket.local_addr().unwrap();
        let jitter = JitterBuffer::new_shared(&JitterConfig::default(), 4);
        let (events_tx, _events_rx) = tokio::sync::mpsc::unbounded_channel();
        let receiver =
            AudioReceiver::spawn(socket, Arc::clone(&jitter), events_tx, 48000, 1).unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        (receiver, jitter, sender, addr)
    }

    fn wait_until(mut done: impl FnMut() -> bool) {
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !done() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_audio_lands_in_jitter_buffer() {
        let (mut receiver, jitter, sender, addr) = setup();

        sender
            .send_to(
                &Packet::Audio {
                    sequence: 5,
                    sample_rate: 48000,
                    channels: 1,
                    samples: vec![9, 9, 9, 9],
                }
                .encode(),
                addr,
            )
            .unwrap();

        wait_until(|| jitter.lock().depth() == 1);
        assert_eq!(jitter.lock().depth(), 1);
        assert_eq!(receiver.stats().audio_frames(), 1);
        assert!(receiver.stats().idle_for().is_some());
        receiver.stop();
    }

    #[test]
    fn test_malformed_is_counted_and_dropped() {
        let (mut receiver, jitter, sender, addr) = setup();

        sender.send_to(b"not a packet", addr).unwrap();
        sender.send_to(&[0u8; 3], addr).unwrap();

        wait_until(|| receiver.stats().malformed() == 2);
        assert_eq!(receiver.stats().malformed(), 2);
        assert_eq!(jitter.lock().depth(), 0);
        assert!(receiver.stats().idle_for().is_none());
        receiver.stop();
    }

    #[test]
    fn test_wrong_format_audio_is_rejected() {
        let (mut receiver, jitter, sender, addr) = setup();

        sender
            .send_to(
                &Packet::Audio {
                    sequence: 0,
                    sample_rate: 44100,
                    channels: 1,
                    samples: vec![1, 1],
                }
                .encode(),
                addr,
            )
            .unwrap();

        wait_until(|| receiver.stats().format_mismatches() == 1);
        assert_eq!(receiver.stats().format_mismatches(), 1);
        assert_eq!(jitter.lock().depth(), 0);
        receiver.stop();
    }

    #[test]
    fn test_wrong_length_audio_is_rejected() {
        let (mut receiver, jitter, sender, addr) = setup();

        sender
            .send_to(
                &Packet::Audio {
                    sequence: 0,
                    sample_rate: 48000,
                    channels: 1,
                    samples: vec![7; 6],
                }
                .encode(),
                addr,
            )
            .unwrap();

        wait_until(|| receiver.stats().format_mismatches() == 1);
        assert_eq!(receiver.stats().format_mismatches(), 1);
        assert_eq!(jitter.lock().depth(), 0);
        receiver.stop();
    }

    #[test]
    fn test_control_packets_become_events() {
        let socket = Arc::new(bind_receiver_socket("127.0.0.1", 0, 65536).unwrap());
        let addr = socket.local_addr().unwrap();
        let jitter = JitterBuffer::new_shared(&JitterConfig::default(), 4);
        let (events_tx, mut events_rx) = tokio::sync::mpsc::unbounded_channel();
        let mut receiver = AudioReceiver::spawn(socket, jitter, events_tx, 48000, 1).unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        let sender_addr = sender.local_addr().unwrap();
        sender
            .send_to(
                &Packet::HandshakeRequest {
                    sample_rate: 48000,
                    channels: 1,
                }
                .encode(),
                addr,
            )
            .unwrap();

        let mut event = None;
        wait_until(|| {
            event = events_rx.try_recv().ok();
            event.is_some()
        });
        assert_eq!(
            event,
            Some(NetEvent::HandshakeRequest {
                from: sender_addr,
                sample_rate: 48000,
                channels: 1
            })
        );
        receiver.stop();
    }
}
