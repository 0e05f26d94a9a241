//! Per-connection peer record and handshake state machine.
//!
//! The record is shared (`Arc`) between the connection manager, the peer's
//! I/O task, and any in-flight handler; disconnect flips the state atomic
//! and the record is reclaimed only after the last reference drops.

use crate::net::message::Message;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnType {
    Full,
    Feeler,
    Manual,
    Anchor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum PeerState {
    Connecting = 0,
    AwaitingVersion = 1,
    AwaitingVerack = 2,
    Ready = 3,
    Disconnecting = 4,
    Disconnected = 5,
}

impl PeerState {
    fn from_u8(v: u8) -> PeerState {
        match v {
            0 => PeerState::Connecting,
            1 => PeerState::AwaitingVersion,
            2 => PeerState::AwaitingVerack,
            3 => PeerState::Ready,
            4 => PeerState::Disconnecting,
            _ => PeerState::Disconnected,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PeerPermissions {
    pub no_ban: bool,
    pub manual: bool,
}

/// What the remote told us in VERSION.
#[derive(Debug, Clone, Default)]
pub struct RemoteInfo {
    pub version: i32,
    pub services: u64,
    pub user_agent: String,
    pub start_height: i32,
    pub nonce: u64,
}

#[derive(Default)]
struct PingState {
    in_flight: Option<(u64, Instant)>,
    last_sent: Option<Instant>,
    last_rtt: Option<Duration>,
}

pub struct Peer {
    pub id: u64,
    pub addr: SocketAddr,
    pub direction: Direction,
    pub conn_type: ConnType,
    pub permissions: PeerPermissions,
    /// Nonce we place in our VERSION; used for self-connection detection.
    pub local_nonce: u64,
    state: AtomicU8,
    remote: Mutex<Option<RemoteInfo>>,
    misbehavior: AtomicU32,
    bytes_sent: AtomicU64,
    bytes_recv: AtomicU64,
    msgs_sent: AtomicU64,
    msgs_recv: AtomicU64,
    connected_at: Instant,
    last_recv: Mutex<Instant>,
    last_send: Mutex<Instant>,
    ping: Mutex<PingState>,
    send_tx: mpsc::Sender<Message>,
    disconnect_reason: Mutex<Option<String>>,
}

/// Snapshot for RPC getpeerinfo.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PeerStats {
    pub id: u64,
    pub addr: String,
    pub inbound: bool,
    pub conn_type: String,
    pub state: String,
    pub version: i32,
    pub user_agent: String,
    pub start_height: i32,
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub msgs_sent: u64,
    pub msgs_recv: u64,
    pub ping_ms: Option<u64>,
    pub misbehavior: u32,
    pub connected_secs: u64,
}

impl Peer {
    pub fn new(
        id: u64,
        addr: SocketAddr,
        direction: Direction,
        conn_type: ConnType,
        permissions: PeerPermissions,
    ) -> (std::sync::Arc<Peer>, mpsc::Receiver<Message>) {
        let (send_tx, send_rx) = mpsc::channel(1024);
        let initial = match direction {
            Direction::Inbound => PeerState::AwaitingVersion,
            Direction::Outbound => PeerState::Connecting,
        };
        let peer = std::sync::Arc::new(Peer {
            id,
            addr,
            direction,
            conn_type,
            permissions,
            local_nonce: rand::random(),
            state: AtomicU8::new(initial as u8),
            remote: Mutex::new(None),
            misbehavior: AtomicU32::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_recv: AtomicU64::new(0),
            msgs_sent: AtomicU64::new(0),
            msgs_recv: AtomicU64::new(0),
            connected_at: Instant::now(),
            last_recv: Mutex::new(Instant::now()),
            last_send: Mutex::new(Instant::now()),
            ping: Mutex::new(PingState::default()),
            send_tx,
            disconnect_reason: Mutex::new(None),
        });
        (peer, send_rx)
    }

    pub fn state(&self) -> PeerState {
        PeerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: PeerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.state() == PeerState::Ready
    }

    pub fn is_disconnecting(&self) -> bool {
        self.state() >= PeerState::Disconnecting
    }

    /// One-way transition into Disconnecting. Returns true for the caller
    /// that actually performed it.
    pub fn start_disconnect(&self, reason: &str) -> bool {
        loop {
            let cur = self.state.load(Ordering::Acquire);
            if cur >= PeerState::Disconnecting as u8 {
                return false;
            }
            if self
                .state
                .compare_exchange(
                    cur,
                    PeerState::Disconnecting as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                *self.disconnect_reason.lock() = Some(reason.to_string());
                return true;
            }
        }
    }

    pub fn disconnect_reason(&self) -> Option<String> {
        self.disconnect_reason.lock().clone()
    }

    /// Queue an outbound message. False means the writer is gone or
    /// hopelessly backlogged; the caller should disconnect.
    pub fn send(&self, msg: Message) -> bool {
        if self.is_disconnecting() {
            return false;
        }
        match self.send_tx.try_send(msg) {
            Ok(()) => {
                self.msgs_sent.fetch_add(1, Ordering::Relaxed);
                *self.last_send.lock() = Instant::now();
                true
            }
            Err(_) => false,
        }
    }

    pub fn set_remote(&self, info: RemoteInfo) {
        *self.remote.lock() = Some(info);
    }

    pub fn remote(&self) -> Option<RemoteInfo> {
        self.remote.lock().clone()
    }

    pub fn note_recv(&self, bytes: usize) {
        self.bytes_recv.fetch_add(bytes as u64, Ordering::Relaxed);
        *self.last_recv.lock() = Instant::now();
    }

    pub fn note_message_recv(&self) {
        self.msgs_recv.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_sent_bytes(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> Duration {
        self.last_recv.lock().elapsed()
    }

    pub fn connected_for(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Add to the misbehavior score; returns the new total.
    pub fn bump_misbehavior(&self, penalty: u32) -> u32 {
        self.misbehavior.fetch_add(penalty, Ordering::AcqRel) + penalty
    }

    pub fn misbehavior_score(&self) -> u32 {
        self.misbehavior.load(Ordering::Acquire)
    }

    // ---- ping bookkeeping ----

    /// Start a ping round if none is in flight. Returns the nonce to send.
    pub fn begin_ping(&self) -> Option<u64> {
        let mut ping = self.ping.lock();
        if ping.in_flight.is_some() {
            return None;
        }
        let nonce: u64 = rand::random();
        ping.in_flight = Some((nonce, Instant::now()));
        ping.last_sent = Some(Instant::now());
        Some(nonce)
    }

    /// True when the ping interval has elapsed since the last round.
    pub fn ping_due(&self, interval: Duration) -> bool {
        let ping = self.ping.lock();
        if ping.in_flight.is_some() {
            return false;
        }
        match ping.last_sent {
            Some(at) => at.elapsed() >= interval,
            None => true,
        }
    }

    /// Handle a PONG. `Ok(rtt)` on a matching nonce; `Err` on a mismatch
    /// or an unsolicited pong.
    pub fn complete_ping(&self, nonce: u64) -> Result<Duration, ()> {
        let mut ping = self.ping.lock();
        match ping.in_flight.take() {
            Some((expected, sent_at)) if expected == nonce => {
                let rtt = sent_at.elapsed();
                ping.last_rtt = Some(rtt);
                Ok(rtt)
            }
            other => {
                ping.in_flight = other;
                Err(())
            }
        }
    }

    /// Age of the outstanding ping, if any.
    pub fn ping_outstanding_for(&self) -> Option<Duration> {
        self.ping.lock().in_flight.map(|(_, at)| at.elapsed())
    }

    pub fn last_ping_rtt(&self) -> Option<Duration> {
        self.ping.lock().last_rtt
    }

    pub fn stats(&self) -> PeerStats {
        let remote = self.remote();
        PeerStats {
            id: self.id,
            addr: self.addr.to_string(),
            inbound: self.direction == Direction::Inbound,
            conn_type: format!("{:?}", self.conn_type).to_lowercase(),
            state: format!("{:?}", self.state()).to_lowercase(),
            version: remote.as_ref().map(|r| r.version).unwrap_or(0),
            user_agent: remote.as_ref().map(|r| r.user_agent.clone()).unwrap_or_default(),
            start_height: remote.as_ref().map(|r| r.start_height).unwrap_or(-1),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_recv: self.bytes_recv.load(Ordering::Relaxed),
            msgs_sent: self.msgs_sent.load(Ordering::Relaxed),
            msgs_recv: self.msgs_recv.load(Ordering::Relaxed),
            ping_ms: self.last_ping_rtt().map(|d| d.as_millis() as u64),
            misbehavior: self.misbehavior_score(),
            connected_secs: self.connected_for().as_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_peer(direction: Direction) -> std::sync::Arc<Peer> {
        let (peer, _rx) = Peer::new(
            1,
            "127.0.0.1:9590".parse().unwrap(),
            direction,
            ConnType::Full,
            PeerPermissions::default(),
        );
        peer
    }

    #[test]
    fn inbound_starts_awaiting_version() {
        assert_eq!(
            test_peer(Direction::Inbound).state(),
            PeerState::AwaitingVersion
        );
        assert_eq!(
            test_peer(Direction::Outbound).state(),
            PeerState::Connecting
        );
    }

    #[test]
    fn disconnect_is_one_way() {
        let peer = test_peer(Direction::Inbound);
        assert!(peer.start_disconnect("test"));
        assert!(!peer.start_disconnect("again"));
        assert_eq!(peer.disconnect_reason().as_deref(), Some("test"));
        assert!(peer.is_disconnecting());
        // sends are refused after disconnect starts
        assert!(!peer.send(Message::Verack));
    }

    #[test]
    fn ping_nonce_must_match() {
        let peer = test_peer(Direction::Outbound);
        let nonce = peer.begin_ping().unwrap();
        // a second round cannot start while one is in flight
        assert!(peer.begin_ping().is_none());
        assert!(peer.complete_ping(nonce.wrapping_add(1)).is_err());
        assert!(peer.complete_ping(nonce).is_ok());
        // cleared after completion
        assert!(peer.ping_outstanding_for().is_none());
    }

    #[test]
    fn misbehavior_accumulates() {
        let peer = test_peer(Direction::Inbound);
        assert_eq!(peer.bump_misbehavior(20), 20);
        assert_eq!(peer.bump_misbehavior(100), 120);
        assert_eq!(peer.misbehavior_score(), 120);
    }
}
