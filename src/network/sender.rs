//! Sender-side network threads
//!
//! `AudioSender` drains framed audio onto the wire and falls back to
//! heartbeats whenever no frame shows up within one heartbeat interval,
//! so the receiver always sees traffic while the session is alive.
//! `AckListener` is the sender's control-plane ear, it decodes whatever
//! the receiver sends back and forwards it to the session controller.

use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::audio::AudioFrame;
use crate::constants::MAX_DATAGRAM_SIZE;
use crate::error::Result;
use crate::network::NetEvent;
use crate::protocol::Packet;

/// Wire counters for the outgoing side
#[derive(Default)]
pub struct SenderStats {
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
    heartbeats_sent: AtomicU64,
    send_errors: AtomicU64,
}

impl SenderStats {
    pub fn packets_sent(&self) -> u64 {
        self.packets_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn heartbeats_sent(&self) -> u64 {
        self.heartbeats_sent.load(Ordering::Relaxed)
    }

    pub fn send_errors(&self) -> u64 {
        self.send_errors.load(Ordering::Relaxed)
    }
}

/// Thread pushing audio frames and heartbeats to the connected receiver
pub struct AudioSender {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    stats: Arc<SenderStats>,
}

impl AudioSender {
    pub fn spawn(
        socket: Arc<UdpSocket>,
        frames: Receiver<AudioFrame>,
        heartbeat_interval: Duration,
    ) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(SenderStats::default());

        let thread_running = Arc::clone(&running);
        let thread_stats = Arc::clone(&stats);

        let handle = thread::Builder::new()
            .name("net-send".to_string())
            .spawn(move || {
                info!("Audio sender started");
                while thread_running.load(Ordering::Relaxed) {
                    let packet = match frames.recv_timeout(heartbeat_interval) {
                        Ok(frame) => Packet::Audio {
                            sequence: frame.sequence,
                            sample_rate: frame.sample_rate,
                            channels: frame.channels,
                            samples: frame.samples,
                        },
                        Err(RecvTimeoutError::Timeout) => {
                            thread_stats.heartbeats_sent.fetch_add(1, Ordering::Relaxed);
                            Packet::Heartbeat
                        }
                        Err(RecvTimeoutError::Disconnected) => {
                            debug!("Frame source closed, audio sender exiting");
                            break;
                        }
                    };

                    let wire = packet.encode();
                    match socket.send(&wire) {
                        Ok(sent) => {
                            thread_stats.packets_sent.fetch_add(1, Ordering::Relaxed);
                            thread_stats
                                .bytes_sent
                                .fetch_add(sent as u64, Ordering::Relaxed);
                        }
                        Err(e) => {
                            let errors =
                                thread_stats.send_errors.fetch_add(1, Ordering::Relaxed) + 1;
                            if errors % 50 == 1 {
                                warn!("Send failed ({} so far): {}", errors, e);
                            }
                        }
                    }
                }
                info!("Audio sender stopped");
            })?;

        Ok(Self {
            running,
            handle: Some(handle),
            stats,
        })
    }

    pub fn stats(&self) -> Arc<SenderStats> {
        Arc::clone(&self.stats)
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for AudioSender {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Thread decoding control replies on the sender's socket
pub struct AckListener {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl AckListener {
    pub fn spawn(socket: Arc<UdpSocket>, events: UnboundedSender<NetEvent>) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let thread_running = Arc::clone(&running);

        let handle = thread::Builder::new()
            .name("net-ctl".to_string())
            .spawn(move || {
                let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
                let mut malformed = 0u64;
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
                            debug!("Control receive error: {}", e);
                            thread::sleep(Duration::from_millis(50));
                            continue;
                        }
                    };

                    let event = match Packet::decode(&buf[..len]) {
                        Ok(Packet::HandshakeAck {
                            sample_rate,
                            channels,
                        }) => NetEvent::HandshakeAck {
                            from,
                            sample_rate,
                            channels,
                        },
                        Ok(Packet::Heartbeat) => NetEvent::Heartbeat { from },
                        Ok(Packet::Goodbye) => NetEvent::Goodbye { from },
                        Ok(other) => {
                            debug!("Unexpected {:?} on sender socket", other.packet_type());
                            continue;
                        }
                        Err(e) => {
                            malformed += 1;
                            if malformed % 50 == 1 {
                                warn!("Discarded malformed datagram from {}: {}", from, e);
                            }
                            continue;
                        }
                    };

                    if events.send(event).is_err() {
                        debug!("Event channel closed, control listener exiting");
                        break;
                    }
                }
            })?;

        Ok(Self {
            running,
            handle: Some(handle),
        })
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for AckListener {
    fn drop(&mut self) {
        self.stop();
    }
}
