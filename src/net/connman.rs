//! Connection manager: peer lifecycle, caps, eviction, discouragement.
//!
//! Owns the live peer map and the per-peer I/O tasks. Message handlers run
//! synchronously on the owning peer's task; CPU-heavy header batches are
//! pushed to the worker pool by the sync layer before acceptance.

use crate::chain::chainstate::ChainstateManager;
use crate::chain::store::atomic_write;
use crate::constants::{
    ANCHOR_CONNECT_TIMEOUT_SECS, CONNECT_TIMEOUT_SECS, DISCOURAGEMENT_SECS,
    DISCOURAGEMENT_THRESHOLD, HANDSHAKE_TIMEOUT_SECS, INACTIVITY_TIMEOUT_SECS, MAX_ANCHOR_SLOTS,
    MAX_DISCOURAGED, MAX_INBOUND, MAX_OUTBOUND_FULL, MAX_USER_AGENT_LEN, MIN_PROTOCOL_VERSION,
    PENALTY_OVERSIZED, PING_INTERVAL_SECS, PING_TIMEOUT_SECS, PROTOCOL_VERSION, RECV_FLOOD_LIMIT,
};
use crate::errors::{ProtocolError, ResourceError, StorageError, WireError};
use crate::metrics;
use crate::net::addrman::AddrMan;
use crate::net::banlist::BanList;
use crate::net::message::{Message, NetAddress, TimedAddress, VersionMsg};
use crate::net::peer::{ConnType, Direction, Peer, PeerPermissions, PeerState, PeerStats, RemoteInfo};
use crate::net::sync::HeaderSync;
use crate::net::transport::{connect_tcp_with_timeout, Transport};
use crate::net::wire::{encode_frame, FrameHeader, FRAME_HEADER_SIZE};
use crate::timedata::{unix_now, TimeData};
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::collections::{HashSet, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub const PEERS_FILE: &str = "peers.json";
pub const ANCHORS_FILE: &str = "anchors.dat";

#[derive(Clone, Debug)]
pub struct NetConfig {
    pub listen: bool,
    pub port: u16,
    pub max_outbound: usize,
    pub max_inbound: usize,
    pub user_agent: String,
}

impl NetConfig {
    pub fn for_port(port: u16) -> Self {
        Self {
            listen: true,
            port,
            max_outbound: MAX_OUTBOUND_FULL,
            max_inbound: MAX_INBOUND,
            user_agent: format!("/coinbasechain:{}/", env!("CARGO_PKG_VERSION")),
        }
    }
}

struct Discouraged {
    until: VecDeque<(IpAddr, u64)>,
    set: HashSet<IpAddr>,
}

pub struct ConnMan {
    pub cfg: NetConfig,
    chainstate: Arc<ChainstateManager>,
    pub sync: HeaderSync,
    timedata: Arc<TimeData>,
    addrman: Mutex<AddrMan>,
    banlist: Mutex<BanList>,
    peers: DashMap<u64, Arc<Peer>>,
    next_peer_id: AtomicU64,
    outbound_nonces: Mutex<HashSet<u64>>,
    discouraged: Mutex<Discouraged>,
    pending_anchors: Mutex<Vec<SocketAddr>>,
    datadir: PathBuf,
    shutting_down: AtomicBool,
}

impl ConnMan {
    pub fn new(
        cfg: NetConfig,
        chainstate: Arc<ChainstateManager>,
        timedata: Arc<TimeData>,
        addrman: AddrMan,
        datadir: PathBuf,
    ) -> Arc<Self> {
        let banlist = BanList::load(&datadir);
        let sync = HeaderSync::new(Arc::clone(&chainstate));
        let anchors = load_anchors(&datadir);
        if !anchors.is_empty() {
            info!(count = anchors.len(), "anchor peers queued for reconnect");
        }
        Arc::new(Self {
            cfg,
            chainstate,
            sync,
            timedata,
            addrman: Mutex::new(addrman),
            banlist: Mutex::new(banlist),
            peers: DashMap::new(),
            next_peer_id: AtomicU64::new(1),
            outbound_nonces: Mutex::new(HashSet::new()),
            discouraged: Mutex::new(Discouraged {
                until: VecDeque::new(),
                set: HashSet::new(),
            }),
            pending_anchors: Mutex::new(anchors),
            datadir,
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn chainstate(&self) -> &Arc<ChainstateManager> {
        &self.chainstate
    }

    // ---- peer queries ----

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn get_peer(&self, id: u64) -> Option<Arc<Peer>> {
        self.peers.get(&id).map(|p| Arc::clone(&p))
    }

    pub fn find_peer_by_addr(&self, addr: &SocketAddr) -> Option<Arc<Peer>> {
        self.peers
            .iter()
            .find(|p| p.addr == *addr)
            .map(|p| Arc::clone(&p))
    }

    pub fn ready_peers(&self) -> Vec<Arc<Peer>> {
        self.peers
            .iter()
            .filter(|p| p.is_ready())
            .map(|p| Arc::clone(&p))
            .collect()
    }

    fn inbound_count(&self) -> usize {
        self.peers
            .iter()
            .filter(|p| p.direction == Direction::Inbound && !p.is_disconnecting())
            .count()
    }

    fn outbound_count(&self) -> usize {
        self.peers
            .iter()
            .filter(|p| {
                p.direction == Direction::Outbound
                    && !p.is_disconnecting()
                    && matches!(p.conn_type, ConnType::Full | ConnType::Anchor)
            })
            .count()
    }

    pub fn peer_stats(&self) -> Vec<PeerStats> {
        let mut stats: Vec<PeerStats> = self.peers.iter().map(|p| p.stats()).collect();
        stats.sort_by_key(|s| s.id);
        stats
    }

    // ---- connection setup ----

    /// Accept loop over a bound listener.
    pub async fn run_listener(self: Arc<Self>, listener: tokio::net::TcpListener) {
        loop {
            if self.shutting_down.load(Ordering::Acquire) {
                return;
            }
            match listener.accept().await {
                Ok((stream, addr)) => self.handle_inbound(stream, addr),
                Err(err) => {
                    warn!(%err, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Admission control + task spawn for one inbound connection.
    pub fn handle_inbound<T: Transport>(self: &Arc<Self>, transport: T, addr: SocketAddr) {
        if self.shutting_down.load(Ordering::Acquire) {
            return;
        }
        let ip = addr.ip();
        if self.banlist.lock().is_banned(&ip) {
            debug!(%addr, "dropping banned inbound");
            return;
        }
        if self.is_discouraged(&ip) {
            debug!(%addr, "dropping discouraged inbound");
            return;
        }
        if self.inbound_count() >= self.cfg.max_inbound && !self.evict_one_inbound() {
            debug!(%addr, "inbound slots full, no evictable peer");
            return;
        }
        self.spawn_peer(
            transport,
            addr,
            Direction::Inbound,
            ConnType::Full,
            PeerPermissions::default(),
        );
    }

    /// Dial an address and run the peer. Returns true once the task is
    /// spawned (not once the handshake finishes).
    pub async fn connect_outbound(
        self: &Arc<Self>,
        addr: SocketAddr,
        conn_type: ConnType,
    ) -> bool {
        if self.shutting_down.load(Ordering::Acquire) {
            return false;
        }
        if self.find_peer_by_addr(&addr).is_some() {
            return false;
        }
        if self.banlist.lock().is_banned(&addr.ip()) || self.is_discouraged(&addr.ip()) {
            return false;
        }
        self.addrman.lock().mark_attempt(&addr);
        let timeout = if conn_type == ConnType::Anchor {
            Duration::from_secs(ANCHOR_CONNECT_TIMEOUT_SECS)
        } else {
            Duration::from_secs(CONNECT_TIMEOUT_SECS)
        };
        let stream = match connect_tcp_with_timeout(addr, timeout).await {
            Ok(s) => s,
            Err(err) => {
                debug!(%addr, %err, "outbound connect failed");
                return false;
            }
        };
        let permissions = PeerPermissions {
            manual: conn_type == ConnType::Manual,
            no_ban: conn_type == ConnType::Manual,
        };
        self.spawn_peer(stream, addr, Direction::Outbound, conn_type, permissions);
        true
    }

    /// Create the peer record and start its I/O task. Shared by TCP and
    /// the in-memory test transport.
    pub fn spawn_peer<T: Transport>(
        self: &Arc<Self>,
        transport: T,
        addr: SocketAddr,
        direction: Direction,
        conn_type: ConnType,
        permissions: PeerPermissions,
    ) -> Arc<Peer> {
        let id = self.next_peer_id.fetch_add(1, Ordering::Relaxed);
        let (peer, send_rx) = Peer::new(id, addr, direction, conn_type, permissions);
        if direction == Direction::Outbound {
            self.outbound_nonces.lock().insert(peer.local_nonce);
        }
        self.peers.insert(id, Arc::clone(&peer));
        info!(peer = id, %addr, ?direction, ?conn_type, "peer connected");
        let cm = Arc::clone(self);
        let task_peer = Arc::clone(&peer);
        tokio::spawn(async move {
            cm.run_peer(task_peer, transport, send_rx).await;
        });
        peer
    }

    // ---- the per-peer I/O task ----

    async fn run_peer<T: Transport>(
        self: Arc<Self>,
        peer: Arc<Peer>,
        transport: T,
        mut send_rx: mpsc::Receiver<Message>,
    ) {
        let (mut read_half, mut write_half) = tokio::io::split(transport);

        // writer: drains the send queue until disconnect
        let writer_peer = Arc::clone(&peer);
        let magic = self.chainstate.params().magic;
        let writer = tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_millis(250));
            loop {
                tokio::select! {
                    msg = send_rx.recv() => {
                        let Some(msg) = msg else { break };
                        let frame = encode_frame(&magic, msg.command(), &msg.encode_payload());
                        if write_half.write_all(&frame).await.is_err() {
                            writer_peer.start_disconnect("write failed");
                            break;
                        }
                        writer_peer.note_sent_bytes(frame.len());
                    }
                    _ = tick.tick() => {
                        if writer_peer.is_disconnecting() {
                            break;
                        }
                    }
                }
            }
        });

        if peer.direction == Direction::Outbound {
            peer.set_state(PeerState::AwaitingVersion);
            self.send_version(&peer);
        }

        let mut buffer: Vec<u8> = Vec::new();
        let mut chunk = [0u8; 8192];
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                read = read_half.read(&mut chunk) => {
                    match read {
                        Ok(0) => {
                            peer.start_disconnect("connection closed by peer");
                            break;
                        }
                        Ok(n) => {
                            // flood cap applies to buffered, unprocessed bytes
                            if buffer.len() + n > RECV_FLOOD_LIMIT {
                                warn!(peer = peer.id, "receive buffer overflow");
                                peer.start_disconnect(
                                    &ResourceError::RecvFloodOverflow(buffer.len() + n)
                                        .to_string(),
                                );
                                break;
                            }
                            peer.note_recv(n);
                            buffer.extend_from_slice(&chunk[..n]);
                            if let Err(err) = self.process_buffer(&peer, &mut buffer) {
                                let penalty = match err {
                                    WireError::ContainerTooLarge { .. }
                                    | WireError::OversizedMessage(_) => PENALTY_OVERSIZED,
                                    _ => 0,
                                };
                                if penalty > 0 {
                                    self.punish(&peer, penalty, &err.to_string());
                                }
                                peer.start_disconnect(&err.to_string());
                                break;
                            }
                        }
                        Err(err) => {
                            peer.start_disconnect(&format!("read failed: {err}"));
                            break;
                        }
                    }
                }
                _ = tick.tick() => {
                    if peer.is_disconnecting() {
                        break;
                    }
                    self.run_peer_timers(&peer);
                    if peer.is_disconnecting() {
                        break;
                    }
                }
            }
        }

        peer.start_disconnect("connection closed");
        let _ = writer.await;
        self.finish_peer(&peer);
    }

    fn run_peer_timers(&self, peer: &Arc<Peer>) {
        let state = peer.state();
        if state < PeerState::Ready
            && peer.connected_for() > Duration::from_secs(HANDSHAKE_TIMEOUT_SECS)
        {
            peer.start_disconnect(&ProtocolError::HandshakeTimeout.to_string());
            return;
        }
        if state != PeerState::Ready {
            return;
        }
        if peer.idle_for() > Duration::from_secs(INACTIVITY_TIMEOUT_SECS) {
            peer.start_disconnect("inactivity");
            return;
        }
        if let Some(age) = peer.ping_outstanding_for() {
            if age > Duration::from_secs(PING_TIMEOUT_SECS) {
                peer.start_disconnect("ping timeout");
                return;
            }
        }
        if peer.ping_due(Duration::from_secs(PING_INTERVAL_SECS)) {
            if let Some(nonce) = peer.begin_ping() {
                peer.send(Message::Ping(nonce));
            }
        }
    }

    fn finish_peer(&self, peer: &Arc<Peer>) {
        self.peers.remove(&peer.id);
        if peer.direction == Direction::Outbound {
            self.outbound_nonces.lock().remove(&peer.local_nonce);
        }
        self.sync.on_peer_gone(peer.id);
        peer.set_state(PeerState::Disconnected);
        metrics::PEERS_CONNECTED.set(self.peer_count() as i64);
        info!(
            peer = peer.id,
            addr = %peer.addr,
            reason = peer.disconnect_reason().unwrap_or_default(),
            misbehavior = peer.misbehavior_score(),
            "peer disconnected"
        );
    }

    /// Extract and dispatch every complete frame in the buffer.
    fn process_buffer(
        self: &Arc<Self>,
        peer: &Arc<Peer>,
        buffer: &mut Vec<u8>,
    ) -> Result<(), WireError> {
        loop {
            if buffer.len() < FRAME_HEADER_SIZE {
                return Ok(());
            }
            let header_bytes: [u8; FRAME_HEADER_SIZE] = buffer[..FRAME_HEADER_SIZE]
                .try_into()
                .expect("sliced frame header");
            let frame = FrameHeader::decode(&header_bytes, &self.chainstate.params().magic)?;
            let total = FRAME_HEADER_SIZE + frame.length as usize;
            if buffer.len() < total {
                return Ok(());
            }
            let payload = &buffer[FRAME_HEADER_SIZE..total];
            frame.verify_checksum(payload)?;
            peer.note_message_recv();
            metrics::MESSAGES_RECEIVED.inc();
            match frame.command_str() {
                None => {
                    metrics::UNKNOWN_COMMANDS.inc();
                    debug!(peer = peer.id, "ignoring malformed command tag");
                }
                Some(command) => {
                    let msg = Message::decode(command, payload)?;
                    self.handle_message(peer, msg);
                }
            }
            buffer.drain(..total);
            if peer.is_disconnecting() {
                return Ok(());
            }
        }
    }

    // ---- message dispatch / handshake state machine ----

    fn send_version(&self, peer: &Arc<Peer>) {
        let tip = self.chainstate.tip();
        let local = SocketAddr::from(([0, 0, 0, 0], self.cfg.port));
        peer.send(Message::Version(VersionMsg {
            version: PROTOCOL_VERSION,
            services: 1,
            timestamp: unix_now() as i64,
            receiver: NetAddress::from_socket(&peer.addr, 0),
            sender: NetAddress::from_socket(&local, 1),
            nonce: peer.local_nonce,
            user_agent: self.cfg.user_agent.clone(),
            start_height: tip.height as i32,
            relay: true,
        }));
    }

    fn handle_message(self: &Arc<Self>, peer: &Arc<Peer>, msg: Message) {
        match peer.state() {
            PeerState::AwaitingVersion | PeerState::Connecting => match msg {
                Message::Version(v) => self.handle_version(peer, v),
                Message::Verack => {
                    peer.start_disconnect(&ProtocolError::VerackBeforeVersion.to_string());
                }
                Message::Unknown(cmd) => {
                    metrics::UNKNOWN_COMMANDS.inc();
                    debug!(peer = peer.id, %cmd, "unknown command before handshake");
                }
                other => {
                    peer.start_disconnect(&format!(
                        "{} before version",
                        other.command()
                    ));
                }
            },
            PeerState::AwaitingVerack => match msg {
                Message::Verack => {
                    peer.set_state(PeerState::Ready);
                    self.on_peer_ready(peer);
                }
                Message::Unknown(cmd) => {
                    metrics::UNKNOWN_COMMANDS.inc();
                    debug!(peer = peer.id, %cmd, "unknown command before handshake");
                }
                Message::Version(_) => {
                    peer.start_disconnect(&ProtocolError::DuplicateVersion.to_string());
                }
                other => {
                    peer.start_disconnect(&format!("{} before verack", other.command()));
                }
            },
            PeerState::Ready => self.handle_ready_message(peer, msg),
            PeerState::Disconnecting | PeerState::Disconnected => {}
        }
    }

    fn handle_version(self: &Arc<Self>, peer: &Arc<Peer>, v: VersionMsg) {
        if self.outbound_nonces.lock().contains(&v.nonce) {
            info!(peer = peer.id, "self connection detected");
            peer.start_disconnect(&ProtocolError::SelfConnection.to_string());
            return;
        }
        if v.version < MIN_PROTOCOL_VERSION {
            peer.start_disconnect(&ProtocolError::UnsupportedVersion(v.version).to_string());
            return;
        }
        if v.user_agent.len() > MAX_USER_AGENT_LEN {
            peer.start_disconnect(&ProtocolError::UserAgentTooLong(v.user_agent.len()).to_string());
            return;
        }
        self.timedata
            .add_sample(peer.addr.ip(), v.timestamp - unix_now() as i64);
        peer.set_remote(RemoteInfo {
            version: v.version,
            services: v.services,
            user_agent: v.user_agent,
            start_height: v.start_height,
            nonce: v.nonce,
        });
        if peer.direction == Direction::Inbound {
            self.send_version(peer);
        }
        peer.send(Message::Verack);
        peer.set_state(PeerState::AwaitingVerack);
    }

    fn on_peer_ready(self: &Arc<Self>, peer: &Arc<Peer>) {
        metrics::PEERS_CONNECTED.set(self.peer_count() as i64);
        if peer.direction == Direction::Outbound {
            self.addrman.lock().mark_good(&peer.addr);
        }
        if peer.conn_type == ConnType::Feeler {
            // a feeler only proves the address is alive
            peer.start_disconnect("feeler complete");
            return;
        }
        if peer.direction == Direction::Outbound {
            peer.send(Message::GetAddr);
        }
        self.sync.on_peer_ready(peer);
    }

    fn handle_ready_message(self: &Arc<Self>, peer: &Arc<Peer>, msg: Message) {
        match msg {
            Message::Version(_) => {
                debug!(peer = peer.id, "ignoring duplicate version");
            }
            Message::Verack => {
                debug!(peer = peer.id, "ignoring duplicate verack");
            }
            Message::Ping(nonce) => {
                peer.send(Message::Pong(nonce));
            }
            Message::Pong(nonce) => {
                if peer.complete_ping(nonce).is_err() {
                    peer.start_disconnect("pong nonce mismatch");
                }
            }
            Message::Addr(entries) => {
                let now = unix_now();
                let mut addrman = self.addrman.lock();
                let added = addrman.add_many(entries.iter().map(|e| {
                    // clamp nonsense timestamps to "old"
                    let when = if (e.time as u64) > now + 600 { 0 } else { e.time as u64 };
                    (e.addr.socket_addr(), e.addr.services, when)
                }));
                debug!(peer = peer.id, total = entries.len(), added, "addr gossip");
            }
            Message::GetAddr => {
                let sample = {
                    let addrman = self.addrman.lock();
                    addrman.sample(crate::constants::MAX_ADDR_PER_MSG as usize, &mut rand::thread_rng())
                };
                let entries: Vec<TimedAddress> = sample
                    .into_iter()
                    .map(|info| TimedAddress {
                        time: info.last_seen.min(u32::MAX as u64) as u32,
                        addr: NetAddress::from_socket(&info.addr, info.services),
                    })
                    .collect();
                peer.send(Message::Addr(entries));
            }
            Message::Inv(items) => {
                self.sync.on_inv(peer, &items);
            }
            Message::GetHeaders(req) => {
                self.sync.on_getheaders(peer, &req);
            }
            Message::Headers(headers) => {
                self.sync.on_headers(self, peer, headers);
            }
            Message::Unknown(cmd) => {
                metrics::UNKNOWN_COMMANDS.inc();
                debug!(peer = peer.id, %cmd, "unknown command ignored");
            }
        }
    }

    // ---- misbehavior / discouragement ----

    /// Apply a penalty. Crossing the threshold discourages and disconnects
    /// unless the peer holds no_ban (score still accrues for the logs).
    pub fn punish(&self, peer: &Arc<Peer>, penalty: u32, reason: &str) -> bool {
        let score = peer.bump_misbehavior(penalty);
        warn!(peer = peer.id, penalty, score, reason, "peer misbehaving");
        if score < DISCOURAGEMENT_THRESHOLD {
            return false;
        }
        if peer.permissions.no_ban {
            debug!(peer = peer.id, "no_ban peer over threshold; keeping");
            return false;
        }
        self.discourage(peer.addr.ip());
        metrics::PEERS_DISCOURAGED.inc();
        peer.start_disconnect(&format!("misbehavior: {reason}"));
        true
    }

    pub fn discourage(&self, ip: IpAddr) {
        let mut d = self.discouraged.lock();
        if d.set.len() >= MAX_DISCOURAGED {
            if let Some((old, _)) = d.until.pop_front() {
                d.set.remove(&old);
            }
        }
        if d.set.insert(ip) {
            d.until.push_back((ip, unix_now() + DISCOURAGEMENT_SECS));
        }
    }

    pub fn is_discouraged(&self, ip: &IpAddr) -> bool {
        let mut d = self.discouraged.lock();
        let now = unix_now();
        while let Some(&(front, until)) = d.until.front() {
            if until <= now {
                d.until.pop_front();
                d.set.remove(&front);
            } else {
                break;
            }
        }
        d.set.contains(ip)
    }

    pub fn disconnect_peer(&self, peer: &Arc<Peer>, reason: &str) {
        peer.start_disconnect(reason);
    }

    /// Pick and disconnect one evictable inbound peer. Protects manual and
    /// no_ban peers; prefers evicting the youngest, slowest, worst-scored.
    fn evict_one_inbound(&self) -> bool {
        let victim = self
            .peers
            .iter()
            .filter(|p| {
                p.direction == Direction::Inbound
                    && !p.permissions.manual
                    && !p.permissions.no_ban
                    && !p.is_disconnecting()
            })
            .map(|p| Arc::clone(&p))
            .max_by_key(|p| {
                (
                    p.misbehavior_score(),
                    std::cmp::Reverse(p.connected_for()),
                    p.last_ping_rtt().unwrap_or(Duration::MAX),
                    p.id,
                )
            });
        match victim {
            Some(peer) => {
                info!(peer = peer.id, "evicting inbound peer for a new connection");
                peer.start_disconnect("evicted");
                true
            }
            None => false,
        }
    }

    // ---- outbound maintenance ----

    /// Periodic upkeep: keep outbound slots filled (anchors first), rotate
    /// sync peers, expire orphans, occasionally probe a stored address
    /// with a feeler.
    pub async fn maintenance(self: Arc<Self>) {
        let mut tick = tokio::time::interval(Duration::from_secs(5));
        let mut ticks: u64 = 0;
        loop {
            tick.tick().await;
            if self.shutting_down.load(Ordering::Acquire) {
                return;
            }
            ticks += 1;
            self.fill_outbound_slots().await;
            if ticks % 24 == 0 {
                let candidate = {
                    let addrman = self.addrman.lock();
                    addrman.select(&mut rand::thread_rng())
                };
                if let Some(info) = candidate {
                    self.connect_outbound(info.addr, ConnType::Feeler).await;
                }
            }
            self.sync.maintain(&self);
            self.chainstate.expire_orphans();
            metrics::ORPHAN_POOL_SIZE.set(self.chainstate.orphan_count() as i64);
        }
    }

    async fn fill_outbound_slots(self: &Arc<Self>) {
        // anchors are always attempted first, in saved order
        while self.outbound_count() < self.cfg.max_outbound {
            let anchor = {
                let mut pending = self.pending_anchors.lock();
                if pending.is_empty() {
                    None
                } else {
                    Some(pending.remove(0))
                }
            };
            match anchor {
                Some(addr) => {
                    self.connect_outbound(addr, ConnType::Anchor).await;
                }
                None => break,
            }
        }
        let mut attempts = 0;
        while self.outbound_count() < self.cfg.max_outbound && attempts < 2 {
            attempts += 1;
            let candidate = {
                let addrman = self.addrman.lock();
                addrman.select(&mut rand::thread_rng())
            };
            match candidate {
                Some(info) => {
                    self.connect_outbound(info.addr, ConnType::Full).await;
                }
                None => {
                    self.bootstrap_from_seeds().await;
                    return;
                }
            }
        }
    }

    /// Fixed seeds, consulted only when the address tables are empty and
    /// no anchors are pending.
    async fn bootstrap_from_seeds(self: &Arc<Self>) {
        if !self.addrman.lock().is_empty() || !self.pending_anchors.lock().is_empty() {
            return;
        }
        let seeds = self.chainstate.params().fixed_seeds;
        if seeds.is_empty() {
            return;
        }
        let mut resolved: Vec<SocketAddr> = Vec::new();
        for seed in seeds {
            if let Ok(addrs) = tokio::net::lookup_host(*seed).await {
                resolved.extend(addrs);
            }
        }
        resolved.shuffle(&mut rand::thread_rng());
        let now = unix_now();
        let mut addrman = self.addrman.lock();
        for addr in resolved {
            addrman.add(addr, 1, now);
        }
        info!(known = addrman.len(), "bootstrapped addresses from fixed seeds");
    }

    // ---- persistence ----

    pub fn save_addrman(&self) -> Result<(), StorageError> {
        let snapshot = self.addrman.lock().snapshot();
        let bytes = serde_json::to_vec(&snapshot)
            .map_err(|e| StorageError::CorruptPeers(e.to_string()))?;
        atomic_write(&self.datadir.join(PEERS_FILE), &bytes)?;
        Ok(())
    }

    pub fn save_banlist(&self) -> Result<(), StorageError> {
        self.banlist.lock().save()
    }

    /// Persist the 2-3 best outbound peers: longest-lived, clean record.
    pub fn save_anchors(&self) -> Result<(), StorageError> {
        let mut outbound: Vec<Arc<Peer>> = self
            .peers
            .iter()
            .filter(|p| {
                p.direction == Direction::Outbound
                    && p.is_ready()
                    && p.misbehavior_score() == 0
                    && matches!(p.conn_type, ConnType::Full | ConnType::Anchor)
            })
            .map(|p| Arc::clone(&p))
            .collect();
        outbound.sort_by_key(|p| std::cmp::Reverse(p.connected_for()));
        let anchors: Vec<SocketAddr> = outbound
            .iter()
            .take(MAX_ANCHOR_SLOTS)
            .map(|p| p.addr)
            .collect();
        let bytes = bincode::serialize(&anchors)
            .map_err(|e| StorageError::CorruptPeers(e.to_string()))?;
        atomic_write(&self.datadir.join(ANCHORS_FILE), &bytes)?;
        info!(count = anchors.len(), "anchors saved");
        Ok(())
    }

    pub fn addrman_len(&self) -> usize {
        self.addrman.lock().len()
    }

    pub fn add_known_address(&self, addr: SocketAddr) {
        self.addrman.lock().add(addr, 1, unix_now());
    }

    pub fn ban(&self, ip: IpAddr, duration_secs: u64) {
        self.banlist.lock().ban(ip, duration_secs);
    }

    // ---- shutdown ----

    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        if let Err(err) = self.save_anchors() {
            warn!(%err, "failed to save anchors");
        }
        if let Err(err) = self.save_addrman() {
            warn!(%err, "failed to save peers");
        }
        if let Err(err) = self.save_banlist() {
            warn!(%err, "failed to save ban list");
        }
        for peer in self.peers.iter() {
            peer.start_disconnect("shutting down");
        }
        // give peer tasks a moment to unwind
        for _ in 0..20 {
            if self.peers.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

/// Load the anchor list written at the last graceful shutdown. Absence is
/// normal; corruption is logged and ignored.
pub fn load_anchors(datadir: &Path) -> Vec<SocketAddr> {
    let path = datadir.join(ANCHORS_FILE);
    let bytes = match std::fs::read(&path) {
        Ok(b) => b,
        Err(_) => return Vec::new(),
    };
    match bincode::deserialize::<Vec<SocketAddr>>(&bytes) {
        Ok(anchors) => anchors.into_iter().take(MAX_ANCHOR_SLOTS).collect(),
        Err(err) => {
            warn!(%err, "anchors file unreadable; ignoring");
            Vec::new()
        }
    }
}

/// Load the address manager snapshot. Corruption is recoverable: start
/// with empty tables.
pub fn load_addrman(datadir: &Path) -> AddrMan {
    let path = datadir.join(PEERS_FILE);
    let bytes = match std::fs::read(&path) {
        Ok(b) => b,
        Err(_) => return AddrMan::new(),
    };
    match serde_json::from_slice(&bytes) {
        Ok(snapshot) => AddrMan::from_snapshot(snapshot),
        Err(err) => {
            warn!(%err, "peers file unreadable; starting fresh");
            AddrMan::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recv_flood_boundary() {
        // exactly at the cap is accepted, one byte over is not
        let current = RECV_FLOOD_LIMIT - 10;
        assert!(current + 10 <= RECV_FLOOD_LIMIT);
        assert!(current + 11 > RECV_FLOOD_LIMIT);
    }

    #[test]
    fn anchors_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let anchors: Vec<SocketAddr> =
            vec!["10.0.0.1:9590".parse().unwrap(), "10.0.0.2:9590".parse().unwrap()];
        let bytes = bincode::serialize(&anchors).unwrap();
        atomic_write(&dir.path().join(ANCHORS_FILE), &bytes).unwrap();
        assert_eq!(load_anchors(dir.path()), anchors);
    }

    #[test]
    fn missing_or_corrupt_anchor_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_anchors(dir.path()).is_empty());
        std::fs::write(dir.path().join(ANCHORS_FILE), b"garbage").unwrap();
        // bincode may or may not parse garbage as an empty vec; either way
        // the result is bounded by the anchor slot count
        assert!(load_anchors(dir.path()).len() <= MAX_ANCHOR_SLOTS);
    }

    #[test]
    fn corrupt_peers_file_recovers() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(PEERS_FILE), b"]]]]").unwrap();
        assert!(load_addrman(dir.path()).is_empty());
    }
}
