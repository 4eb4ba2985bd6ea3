//! Session lifecycle control
//!
//! One controller task per process owns the handshake, liveness tracking
//! and reconnect policy. Network threads feed it [`NetEvent`]s, it answers
//! over a [`ControlLink`], and everyone else observes it through a watch
//! channel of [`SessionSnapshot`]s.
//!
//! The sender walks `Idle -> Handshaking -> Streaming`, drops into
//! `Reconnecting` when the receiver goes quiet for too long, and ends in
//! `Closed` (goodbye, stop, or a peer that never came back) or `Failed`
//! (handshake exhausted or formats disagree). The receiver sits in `Idle`
//! until a handshake arrives, streams while heartbeating its peer, and
//! falls back to `Idle` when the sender disappears so the next handshake
//! can start a fresh session.

use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audio::jitter::SharedJitter;
use crate::config::{AudioConfig, SessionConfig};
use crate::error::{Error, Result, SessionError};
use crate::network::{NetEvent, ReceiverStats};
use crate::protocol::Packet;

/// Controller tick driving all timeout checks
const TICK: Duration = Duration::from_millis(50);

/// Where a session currently stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Handshaking { attempt: u32 },
    Streaming,
    Reconnecting { attempt: u32 },
    Closed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, SessionState::Streaming)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::Handshaking { attempt } => write!(f, "handshaking (attempt {})", attempt),
            SessionState::Streaming => write!(f, "streaming"),
            SessionState::Reconnecting { attempt } => {
                write!(f, "reconnecting (attempt {})", attempt)
            }
            SessionState::Closed => write!(f, "closed"),
            SessionState::Failed => write!(f, "failed"),
        }
    }
}

fn transition_allowed(from: SessionState, to: SessionState) -> bool {
    use SessionState::*;
    matches!(
        (from, to),
        (Idle, Handshaking { .. })
            | (Idle, Streaming)
            | (Handshaking { .. }, Handshaking { .. })
            | (Handshaking { .. }, Streaming)
            | (Streaming, Reconnecting { .. })
            | (Streaming, Idle)
            | (Reconnecting { .. }, Reconnecting { .. })
            | (Reconnecting { .. }, Streaming)
    ) || (!from.is_terminal() && matches!(to, Closed | Failed))
}

/// Published view of the session for binaries and the status loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub session_id: Uuid,
    pub state: SessionState,
    pub peer: Option<SocketAddr>,
    pub since: DateTime<Utc>,
}

impl SessionSnapshot {
    fn initial(session_id: Uuid) -> Self {
        Self {
            session_id,
            state: SessionState::Idle,
            peer: None,
            since: Utc::now(),
        }
    }
}

/// Commands from the owning binary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    Stop,
}

/// Outbound control packets, implemented over UDP in production and by a
/// recording fake in tests
pub trait ControlLink: Send + Sync + 'static {
    /// `to` is `None` on a connected socket
    fn send_packet(&self, packet: &Packet, to: Option<SocketAddr>) -> Result<()>;
}

/// Cloneable handle for commanding and observing a session task
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
    snapshot: watch::Receiver<SessionSnapshot>,
}

impl SessionHandle {
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    /// Request an orderly shutdown, safe to call any number of times
    pub fn stop(&self) {
        if self.snapshot.borrow().state.is_terminal() {
            return;
        }
        let _ = self.commands.send(SessionCommand::Stop);
    }

    /// Wait until the session reaches `Closed` or `Failed`
    pub async fn wait_until_terminal(&mut self) -> SessionState {
        loop {
            let state = self.snapshot.borrow().state;
            if state.is_terminal() {
                return state;
            }
            if self.snapshot.changed().await.is_err() {
                return self.snapshot.borrow().state;
            }
        }
    }
}

/// Shared state-publication plumbing for both controller flavors
struct SessionCell {
    session_id: Uuid,
    state: SessionState,
    peer: Option<SocketAddr>,
    tx: watch::Sender<SessionSnapshot>,
}

impl SessionCell {
    fn new(session_id: Uuid, tx: watch::Sender<SessionSnapshot>) -> Self {
        Self {
            session_id,
            state: SessionState::Idle,
            peer: None,
            tx,
        }
    }

    fn set_state(&mut self, to: SessionState) {
        if self.state == to {
            return;
        }
        if !transition_allowed(self.state, to) {
            debug!("Ignoring transition {} -> {}", self.state, to);
            return;
        }
        info!("Session {}: {} -> {}", self.session_id, self.state, to);
        self.state = to;
        self.publish();
    }

    fn set_peer(&mut self, peer: Option<SocketAddr>) {
        if self.peer != peer {
            self.peer = peer;
            self.publish();
        }
    }

    fn publish(&self) {
        let _ = self.tx.send(SessionSnapshot {
            session_id: self.session_id,
            state: self.state,
            peer: self.peer,
            since: Utc::now(),
        });
    }
}

fn session_channels() -> (
    SessionHandle,
    mpsc::UnboundedReceiver<SessionCommand>,
    watch::Sender<SessionSnapshot>,
    Uuid,
) {
    let session_id = Uuid::new_v4();
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::initial(session_id));
    (
        SessionHandle {
            commands: commands_tx,
            snapshot: snapshot_rx,
        },
        commands_rx,
        snapshot_tx,
        session_id,
    )
}

/// Spawn the sender-side controller
///
/// The task resolves `Ok` on an orderly close and `Err` when the handshake
/// or reconnect policy gives up.
pub fn spawn_sender_session<L: ControlLink>(
    link: L,
    config: SessionConfig,
    audio: AudioConfig,
    events: mpsc::UnboundedReceiver<NetEvent>,
) -> (SessionHandle, JoinHandle<Result<()>>) {
    let (handle, commands, snapshot_tx, session_id) = session_channels();
    let task = tokio::spawn(run_sender(
        link,
        config,
        audio,
        events,
        commands,
        snapshot_tx,
        session_id,
    ));
    (handle, task)
}

async fn run_sender<L: ControlLink>(
    link: L,
    config: SessionConfig,
    audio: AudioConfig,
    mut events: mpsc::UnboundedReceiver<NetEvent>,
    mut commands: mpsc::UnboundedReceiver<SessionCommand>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    session_id: Uuid,
) -> Result<()> {
    let mut cell = SessionCell::new(session_id, snapshot_tx);
    info!(
        "Sender session {} offering {} Hz, {} ch",
        session_id, audio.sample_rate, audio.channels
    );

    let mut tick = tokio::time::interval(TICK);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let request = Packet::HandshakeRequest {
        sample_rate: audio.sample_rate,
        channels: audio.channels,
    };

    let mut attempt: u32 = 1;
    let mut next_request_at = Some(Instant::now());
    let mut request_deadline: Option<Instant> = None;
    let mut last_activity = Instant::now();

    cell.set_state(SessionState::Handshaking { attempt });

    loop {
        tokio::select! {
            _ = tick.tick() => {
                let now = Instant::now();
                match cell.state {
                    SessionState::Handshaking { .. } => {
                        if let Some(at) = next_request_at {
                            if now >= at {
                                if let Err(e) = link.send_packet(&request, None) {
                                    debug!("Handshake send failed: {}", e);
                                }
                                next_request_at = None;
                                request_deadline = Some(now + config.handshake_timeout());
                            }
                        }
                        if let Some(deadline) = request_deadline {
                            if now >= deadline {
                                if attempt >= config.handshake_retries {
                                    warn!("No answer after {} handshake attempts", attempt);
                                    cell.set_state(SessionState::Failed);
                                    return Err(Error::Session(SessionError::HandshakeFailed {
                                        attempts: attempt,
                                    }));
                                }
                                attempt += 1;
                                request_deadline = None;
                                cell.set_state(SessionState::Handshaking { attempt });
                                next_request_at = Some(now);
                            }
                        }
                    }
                    SessionState::Streaming => {
                        if last_activity.elapsed() >= config.inactivity_timeout() {
                            warn!(
                                "Receiver silent for {:?}, probing",
                                last_activity.elapsed()
                            );
                            attempt = 1;
                            cell.set_state(SessionState::Reconnecting { attempt });
                            if let Err(e) = link.send_packet(&request, None) {
                                debug!("Reconnect probe failed: {}", e);
                            }
                            next_request_at = Some(now + config.reconnect_delay());
                            request_deadline = None;
                        }
                    }
                    SessionState::Reconnecting { .. } => {
                        if last_activity.elapsed() >= config.max_stall() {
                            let silent_ms = last_activity.elapsed().as_millis() as u64;
                            warn!("Receiver gone for {} ms, closing", silent_ms);
                            cell.set_state(SessionState::Closed);
                            return Err(Error::Session(SessionError::PeerLost { silent_ms }));
                        }
                        if let Some(at) = next_request_at {
                            if now >= at {
                                attempt += 1;
                                cell.set_state(SessionState::Reconnecting { attempt });
                                if let Err(e) = link.send_packet(&request, None) {
                                    debug!("Reconnect probe failed: {}", e);
                                }
                                next_request_at = Some(now + config.reconnect_delay());
                            }
                        }
                    }
                    _ => {}
                }
            }

            maybe_event = events.recv() => {
                let event = match maybe_event {
                    Some(event) => event,
                    None => {
                        warn!("Network event channel closed");
                        cell.set_state(SessionState::Failed);
                        return Err(Error::Session(SessionError::Closed));
                    }
                };
                match event {
                    NetEvent::HandshakeAck { from, sample_rate, channels } => {
                        if sample_rate != audio.sample_rate || channels != audio.channels {
                            warn!(
                                "Receiver plays {} Hz/{} ch, we capture {} Hz/{} ch",
                                sample_rate, channels, audio.sample_rate, audio.channels
                            );
                            cell.set_state(SessionState::Failed);
                            return Err(Error::Session(SessionError::FormatMismatch {
                                peer_rate: sample_rate,
                                peer_channels: channels,
                            }));
                        }
                        last_activity = Instant::now();
                        if !cell.state.is_streaming() {
                            info!("Receiver {} accepted the stream", from);
                            cell.set_peer(Some(from));
                            cell.set_state(SessionState::Streaming);
                            attempt = 1;
                            next_request_at = None;
                            request_deadline = None;
                        }
                    }
                    NetEvent::Heartbeat { .. } => {
                        last_activity = Instant::now();
                    }
                    NetEvent::Goodbye { from } => {
                        info!("Receiver {} ended the session", from);
                        cell.set_state(SessionState::Closed);
                        return Ok(());
                    }
                    NetEvent::HandshakeRequest { from, .. } => {
                        debug!("Ignoring handshake request from {}", from);
                    }
                }
            }

            maybe_command = commands.recv() => {
                match maybe_command {
                    Some(SessionCommand::Stop) | None => {
                        if let Err(e) = link.send_packet(&Packet::Goodbye, None) {
                            debug!("Goodbye send failed: {}", e);
                        }
                        cell.set_state(SessionState::Closed);
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Spawn the receiver-side controller
pub fn spawn_receiver_session<L: ControlLink>(
    link: L,
    config: SessionConfig,
    audio: AudioConfig,
    jitter: SharedJitter,
    stats: std::sync::Arc<ReceiverStats>,
    events: mpsc::UnboundedReceiver<NetEvent>,
) -> (SessionHandle, JoinHandle<Result<()>>) {
    let (handle, commands, snapshot_tx, session_id) = session_channels();
    let task = tokio::spawn(run_receiver(
        link,
        config,
        audio,
        jitter,
        stats,
        events,
        commands,
        snapshot_tx,
        session_id,
    ));
    (handle, task)
}

#[allow(clippy::too_many_arguments)]
async fn run_receiver<L: ControlLink>(
    link: L,
    config: SessionConfig,
    audio: AudioConfig,
    jitter: SharedJitter,
    stats: std::sync::Arc<ReceiverStats>,
    mut events: mpsc::UnboundedReceiver<NetEvent>,
    mut commands: mpsc::UnboundedReceiver<SessionCommand>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    session_id: Uuid,
) -> Result<()> {
    let mut cell = SessionCell::new(session_id, snapshot_tx);
    info!(
        "Receiver session {} playing {} Hz, {} ch",
        session_id, audio.sample_rate, audio.channels
    );

    let mut tick = tokio::time::interval(TICK);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let ack = Packet::HandshakeAck {
        sample_rate: audio.sample_rate,
        channels: audio.channels,
    };

    let mut last_activity = Instant::now();
    let mut last_beat = Instant::now();

    loop {
        tokio::select! {
            _ = tick.tick() => {
                if cell.state.is_streaming() {
                    let event_idle = last_activity.elapsed();
                    let wire_idle = stats.idle_for().unwrap_or(event_idle);
                    if event_idle.min(wire_idle) >= config.inactivity_timeout() {
                        warn!(
                            "Sender silent for {:?}, waiting for a new handshake",
                            event_idle.min(wire_idle)
                        );
                        jitter.lock().reset();
                        cell.set_peer(None);
                        cell.set_state(SessionState::Idle);
                    } else if let Some(peer) = cell.peer {
                        // Return traffic for the sender's stall detector
                        if last_beat.elapsed() >= config.heartbeat_interval() {
                            if let Err(e) = link.send_packet(&Packet::Heartbeat, Some(peer)) {
                                debug!("Heartbeat send failed: {}", e);
                            }
                            last_beat = Instant::now();
                        }
                    }
                }
            }

            maybe_event = events.recv() => {
                let event = match maybe_event {
                    Some(event) => event,
                    None => {
                        warn!("Network event channel closed");
                        cell.set_state(SessionState::Failed);
                        return Err(Error::Session(SessionError::Closed));
                    }
                };
                last_activity = Instant::now();
                match event {
                    NetEvent::HandshakeRequest { from, sample_rate, channels } => {
                        if let Err(e) = link.send_packet(&ack, Some(from)) {
                            debug!("Ack send failed: {}", e);
                        }
                        if sample_rate != audio.sample_rate || channels != audio.channels {
                            warn!(
                                "Rejecting {}: offers {} Hz/{} ch, we play {} Hz/{} ch",
                                from, sample_rate, channels, audio.sample_rate, audio.channels
                            );
                            continue;
                        }
                        match cell.peer {
                            Some(peer) if peer == from => {
                                debug!("Repeated handshake from {}", from);
                            }
                            Some(peer) => {
                                warn!("New sender {} replaces {}", from, peer);
                                jitter.lock().reset();
                                cell.set_peer(Some(from));
                            }
                            None => {
                                info!("Sender {} connected", from);
                                cell.set_peer(Some(from));
                                cell.set_state(SessionState::Streaming);
                            }
                        }
                    }
                    NetEvent::Heartbeat { from } => {
                        debug!("Heartbeat from {}", from);
                    }
                    NetEvent::Goodbye { from } => {
                        if cell.peer == Some(from) {
                            info!("Sender {} said goodbye", from);
                            jitter.lock().reset();
                            cell.set_peer(None);
                            cell.set_state(SessionState::Idle);
                        }
                    }
                    NetEvent::HandshakeAck { from, .. } => {
                        debug!("Ignoring handshake ack from {}", from);
                    }
                }
            }

            maybe_command = commands.recv() => {
                match maybe_command {
                    Some(SessionCommand::Stop) | None => {
                        if let Some(peer) = cell.peer {
                            if let Err(e) = link.send_packet(&Packet::Goodbye, Some(peer)) {
                                debug!("Goodbye send failed: {}", e);
                            }
                        }
                        cell.set_state(SessionState::Closed);
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::jitter::JitterBuffer;
    use crate::audio::AudioFrame;
    use crate::config::JitterConfig;
    use crate::protocol::PacketType;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use tokio::sync::mpsc::unbounded_channel;
    use tokio::time::timeout;

    #[derive(Clone, Default)]
    struct FakeLink {
        sent: Arc<Mutex<Vec<(Packet, Option<SocketAddr>)>>>,
    }

    impl FakeLink {
        fn count(&self, packet_type: PacketType) -> usize {
            self.sent
                .lock()
                .iter()
                .filter(|(p, _)| p.packet_type() == packet_type)
                .count()
        }

        fn last_destination(&self, packet_type: PacketType) -> Option<SocketAddr> {
            self.sent
                .lock()
                .iter()
                .rev()
                .find(|(p, _)| p.packet_type() == packet_type)
                .and_then(|(_, to)| *to)
        }
    }

    impl ControlLink for FakeLink {
        fn send_packet(&self, packet: &Packet, to: Option<SocketAddr>) -> Result<()> {
            self.sent.lock().push((packet.clone(), to));
            Ok(())
        }
    }

    fn fast_config() -> SessionConfig {
        SessionConfig {
            heartbeat_interval_ms: 40,
            inactivity_timeout_ms: 200,
            handshake_timeout_ms: 100,
            handshake_retries: 2,
            reconnect_delay_ms: 40,
            max_stall_ms: 400,
        }
    }

    fn peer_addr() -> SocketAddr {
        "192.168.1.20:50005".parse().unwrap()
    }

    async fn wait_state(handle: &SessionHandle, wanted: impl Fn(SessionState) -> bool) {
        let mut rx = handle.watch();
        timeout(Duration::from_secs(2), async {
            loop {
                if wanted(rx.borrow_and_update().state) {
                    return;
                }
                rx.changed().await.expect("session task gone");
            }
        })
        .await
        .expect("timed out waiting for session state");
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("timed out waiting for condition");
    }

    #[test]
    fn test_transition_rules() {
        use SessionState::*;
        assert!(transition_allowed(Idle, Handshaking { attempt: 1 }));
        assert!(transition_allowed(Idle, Streaming));
        assert!(transition_allowed(Streaming, Reconnecting { attempt: 1 }));
        assert!(transition_allowed(Streaming, Closed));
        assert!(transition_allowed(Reconnecting { attempt: 2 }, Failed));

        assert!(!transition_allowed(Closed, Streaming));
        assert!(!transition_allowed(Failed, Handshaking { attempt: 1 }));
        assert!(!transition_allowed(Streaming, Handshaking { attempt: 1 }));
        assert!(!transition_allowed(Closed, Failed));
    }

    #[tokio::test]
    async fn test_sender_handshakes_then_streams() {
        let link = FakeLink::default();
        let (events_tx, events_rx) = unbounded_channel();
        let (handle, task) = spawn_sender_session(
            link.clone(),
            fast_config(),
            AudioConfig::default(),
            events_rx,
        );

        wait_for(|| link.count(PacketType::HandshakeRequest) >= 1).await;
        events_tx
            .send(NetEvent::HandshakeAck {
                from: peer_addr(),
                sample_rate: 48000,
                channels: 1,
            })
            .unwrap();

        wait_state(&handle, |s| s.is_streaming()).await;
        assert_eq!(handle.snapshot().peer, Some(peer_addr()));

        handle.stop();
        let result = task.await.unwrap();
        assert!(result.is_ok());
        assert_eq!(link.count(PacketType::Goodbye), 1);
        assert_eq!(handle.snapshot().state, SessionState::Closed);
    }

    #[tokio::test]
    async fn test_sender_gives_up_after_retries() {
        let link = FakeLink::default();
        let (_events_tx, events_rx) = unbounded_channel();
        let (handle, task) = spawn_sender_session(
            link.clone(),
            fast_config(),
            AudioConfig::default(),
            events_rx,
        );

        let result = task.await.unwrap();
        match result {
            Err(Error::Session(SessionError::HandshakeFailed { attempts })) => {
                assert_eq!(attempts, 2);
            }
            other => panic!("expected handshake failure, got {other:?}"),
        }
        assert_eq!(link.count(PacketType::HandshakeRequest), 2);
        assert_eq!(handle.snapshot().state, SessionState::Failed);
    }

    #[tokio::test]
    async fn test_sender_rejects_format_mismatch() {
        let link = FakeLink::default();
        let (events_tx, events_rx) = unbounded_channel();
        let (handle, task) = spawn_sender_session(
            link.clone(),
            fast_config(),
            AudioConfig::default(),
            events_rx,
        );

        wait_for(|| link.count(PacketType::HandshakeRequest) >= 1).await;
        events_tx
            .send(NetEvent::HandshakeAck {
                from: peer_addr(),
                sample_rate: 44100,
                channels: 1,
            })
            .unwrap();

        let result = task.await.unwrap();
        match result {
            Err(Error::Session(SessionError::FormatMismatch {
                peer_rate,
                peer_channels,
            })) => {
                assert_eq!(peer_rate, 44100);
                assert_eq!(peer_channels, 1);
            }
            other => panic!("expected format mismatch, got {other:?}"),
        }
        assert_eq!(handle.snapshot().state, SessionState::Failed);
    }

    #[tokio::test]
    async fn test_sender_reconnects_after_stall() {
        let link = FakeLink::default();
        let (events_tx, events_rx) = unbounded_channel();
        let (handle, task) = spawn_sender_session(
            link.clone(),
            fast_config(),
            AudioConfig::default(),
            events_rx,
        );

        wait_for(|| link.count(PacketType::HandshakeRequest) >= 1).await;
        events_tx
            .send(NetEvent::HandshakeAck {
                from: peer_addr(),
                sample_rate: 48000,
                channels: 1,
            })
            .unwrap();
        wait_state(&handle, |s| s.is_streaming()).await;

        // No heartbeats now, the stall detector must kick in
        wait_state(&handle, |s| matches!(s, SessionState::Reconnecting { .. })).await;

        events_tx
            .send(NetEvent::HandshakeAck {
                from: peer_addr(),
                sample_rate: 48000,
                channels: 1,
            })
            .unwrap();
        wait_state(&handle, |s| s.is_streaming()).await;

        handle.stop();
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_sender_closes_after_sustained_stall() {
        let link = FakeLink::default();
        let (events_tx, events_rx) = unbounded_channel();
        let (mut handle, task) = spawn_sender_session(
            link.clone(),
            fast_config(),
            AudioConfig::default(),
            events_rx,
        );

        wait_for(|| link.count(PacketType::HandshakeRequest) >= 1).await;
        events_tx
            .send(NetEvent::HandshakeAck {
                from: peer_addr(),
                sample_rate: 48000,
                channels: 1,
            })
            .unwrap();
        wait_state(&handle, |s| s.is_streaming()).await;

        // Total silence from here on: probe, then give up
        let final_state = timeout(Duration::from_secs(2), handle.wait_until_terminal())
            .await
            .unwrap();
        assert_eq!(final_state, SessionState::Closed);
        assert!(link.count(PacketType::HandshakeRequest) >= 2);
        match task.await.unwrap() {
            Err(Error::Session(SessionError::PeerLost { .. })) => {}
            other => panic!("expected peer loss, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_sender_heartbeats_keep_stream_alive() {
        let link = FakeLink::default();
        let (events_tx, events_rx) = unbounded_channel();
        let (handle, task) = spawn_sender_session(
            link.clone(),
            fast_config(),
            AudioConfig::default(),
            events_rx,
        );

        wait_for(|| link.count(PacketType::HandshakeRequest) >= 1).await;
        events_tx
            .send(NetEvent::HandshakeAck {
                from: peer_addr(),
                sample_rate: 48000,
                channels: 1,
            })
            .unwrap();
        wait_state(&handle, |s| s.is_streaming()).await;

        // Feed heartbeats for longer than the stall limit
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            events_tx
                .send(NetEvent::Heartbeat { from: peer_addr() })
                .unwrap();
        }
        assert!(handle.snapshot().state.is_streaming());

        handle.stop();
        assert!(task.await.unwrap().is_ok());
    }

    fn receiver_fixture() -> (SharedJitter, Arc<ReceiverStats>) {
        (
            JitterBuffer::new_shared(&JitterConfig::default(), 4),
            Arc::new(ReceiverStats::default()),
        )
    }

    fn test_frame(sequence: u32) -> AudioFrame {
        AudioFrame {
            sequence,
            timestamp_us: 0,
            sample_rate: 48000,
            channels: 1,
            samples: vec![0; 4],
        }
    }

    #[tokio::test]
    async fn test_receiver_accepts_matching_handshake() {
        let link = FakeLink::default();
        let (jitter, stats) = receiver_fixture();
        let (events_tx, events_rx) = unbounded_channel();
        let (handle, task) = spawn_receiver_session(
            link.clone(),
            fast_config(),
            AudioConfig::default(),
            jitter,
            stats,
            events_rx,
        );

        events_tx
            .send(NetEvent::HandshakeRequest {
                from: peer_addr(),
                sample_rate: 48000,
                channels: 1,
            })
            .unwrap();

        wait_state(&handle, |s| s.is_streaming()).await;
        assert_eq!(handle.snapshot().peer, Some(peer_addr()));
        assert_eq!(link.count(PacketType::HandshakeAck), 1);
        assert_eq!(
            link.last_destination(PacketType::HandshakeAck),
            Some(peer_addr())
        );

        handle.stop();
        assert!(task.await.unwrap().is_ok());
        assert_eq!(link.count(PacketType::Goodbye), 1);
    }

    #[tokio::test]
    async fn test_receiver_acks_but_stays_idle_on_mismatch() {
        let link = FakeLink::default();
        let (jitter, stats) = receiver_fixture();
        let (events_tx, events_rx) = unbounded_channel();
        let (handle, task) = spawn_receiver_session(
            link.clone(),
            fast_config(),
            AudioConfig::default(),
            jitter,
            stats,
            events_rx,
        );

        events_tx
            .send(NetEvent::HandshakeRequest {
                from: peer_addr(),
                sample_rate: 44100,
                channels: 2,
            })
            .unwrap();

        wait_for(|| link.count(PacketType::HandshakeAck) >= 1).await;
        assert_eq!(handle.snapshot().state, SessionState::Idle);
        assert_eq!(handle.snapshot().peer, None);

        handle.stop();
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_receiver_heartbeats_streaming_peer() {
        let link = FakeLink::default();
        let (jitter, stats) = receiver_fixture();
        let (events_tx, events_rx) = unbounded_channel();
        let (handle, task) = spawn_receiver_session(
            link.clone(),
            fast_config(),
            AudioConfig::default(),
            jitter,
            stats,
            events_rx,
        );

        events_tx
            .send(NetEvent::HandshakeRequest {
                from: peer_addr(),
                sample_rate: 48000,
                channels: 1,
            })
            .unwrap();
        wait_state(&handle, |s| s.is_streaming()).await;

        // Keep the link active long enough to observe several beats
        for _ in 0..6 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            events_tx
                .send(NetEvent::Heartbeat { from: peer_addr() })
                .unwrap();
        }
        assert!(link.count(PacketType::Heartbeat) >= 2);
        assert_eq!(
            link.last_destination(PacketType::Heartbeat),
            Some(peer_addr())
        );

        handle.stop();
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_receiver_drops_to_idle_on_inactivity() {
        let link = FakeLink::default();
        let (jitter, stats) = receiver_fixture();
        let (events_tx, events_rx) = unbounded_channel();
        let (handle, task) = spawn_receiver_session(
            link.clone(),
            fast_config(),
            AudioConfig::default(),
            Arc::clone(&jitter),
            stats,
            events_rx,
        );

        events_tx
            .send(NetEvent::HandshakeRequest {
                from: peer_addr(),
                sample_rate: 48000,
                channels: 1,
            })
            .unwrap();
        wait_state(&handle, |s| s.is_streaming()).await;

        for seq in 0..3 {
            jitter.lock().insert(test_frame(seq));
        }
        assert!(jitter.lock().depth() > 0);

        // Silence outlasts the inactivity timeout
        wait_state(&handle, |s| s == SessionState::Idle).await;
        assert_eq!(jitter.lock().depth(), 0);
        assert_eq!(handle.snapshot().peer, None);

        handle.stop();
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_receiver_takeover_resets_buffer() {
        let link = FakeLink::default();
        let (jitter, stats) = receiver_fixture();
        let (events_tx, events_rx) = unbounded_channel();
        let (handle, task) = spawn_receiver_session(
            link.clone(),
            fast_config(),
            AudioConfig::default(),
            Arc::clone(&jitter),
            stats,
            events_rx,
        );

        events_tx
            .send(NetEvent::HandshakeRequest {
                from: peer_addr(),
                sample_rate: 48000,
                channels: 1,
            })
            .unwrap();
        wait_state(&handle, |s| s.is_streaming()).await;

        for seq in 0..3 {
            jitter.lock().insert(test_frame(seq));
        }

        let newcomer: SocketAddr = "192.168.1.30:50005".parse().unwrap();
        events_tx
            .send(NetEvent::HandshakeRequest {
                from: newcomer,
                sample_rate: 48000,
                channels: 1,
            })
            .unwrap();

        wait_for(|| handle.snapshot().peer == Some(newcomer)).await;
        assert_eq!(jitter.lock().depth(), 0);
        assert!(handle.snapshot().state.is_streaming());

        handle.stop();
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_receiver_goodbye_returns_to_idle() {
        let link = FakeLink::default();
        let (jitter, stats) = receiver_fixture();
        let (events_tx, events_rx) = unbounded_channel();
        let (handle, task) = spawn_receiver_session(
            link.clone(),
            fast_config(),
            AudioConfig::default(),
            jitter,
            stats,
            events_rx,
        );

        events_tx
            .send(NetEvent::HandshakeRequest {
                from: peer_addr(),
                sample_rate: 48000,
                channels: 1,
            })
            .unwrap();
        wait_state(&handle, |s| s.is_streaming()).await;

        events_tx
            .send(NetEvent::Goodbye { from: peer_addr() })
            .unwrap();
        wait_state(&handle, |s| s == SessionState::Idle).await;

        // A new handshake starts a fresh stream
        events_tx
            .send(NetEvent::HandshakeRequest {
                from: peer_addr(),
                sample_rate: 48000,
                channels: 1,
            })
            .unwrap();
        wait_state(&handle, |s| s.is_streaming()).await;

        handle.stop();
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let link = FakeLink::default();
        let (jitter, stats) = receiver_fixture();
        let (events_tx, events_rx) = unbounded_channel();
        let (handle, task) = spawn_receiver_session(
            link.clone(),
            fast_config(),
            AudioConfig::default(),
            jitter,
            stats,
            events_rx,
        );

        events_tx
            .send(NetEvent::HandshakeRequest {
                from: peer_addr(),
                sample_rate: 48000,
                channels: 1,
            })
            .unwrap();
        wait_state(&handle, |s| s.is_streaming()).await;

        handle.stop();
        assert!(task.await.unwrap().is_ok());
        handle.stop();
        handle.stop();

        assert_eq!(link.count(PacketType::Goodbye), 1);
        assert_eq!(handle.snapshot().state, SessionState::Closed);
    }
}
