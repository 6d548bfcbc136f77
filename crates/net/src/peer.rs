//! A single outbound peer: framing, handshake, liveness, request tracking.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use ltcspv_consensus::constants::{MIN_PROTOCOL_VERSION, NODE_NETWORK, PROTOCOL_VERSION};
use ltcspv_consensus::params::ChainConfig;
use ltcspv_consensus::Hash256;
use ltcspv_primitives::hash::hash_to_hex;
use ltcspv_primitives::{Block, BlockHeader, Transaction};
use ltcspv_wire::{
    frame_message, FrameReader, GetHeadersMessage, InventoryItem, Message, NetAddress,
    VersionMessage, INV_TX,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

use crate::cancel::CancelToken;
use crate::error::NetError;

const USER_AGENT: &str = concat!("/ltcspv:", env!("CARGO_PKG_VERSION"), "/");

pub const PING_INTERVAL: Duration = Duration::from_secs(2);
pub const PONG_TIMEOUT: Duration = Duration::from_secs(20);
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

pub const DEPENDENCY_DEPTH_LIMIT: usize = 1_000;
pub const DEPENDENCY_WALL_CLOCK: Duration = Duration::from_secs(60);

const CODEC_STRIKE_LIMIT: usize = 3;
const CODEC_STRIKE_WINDOW: Duration = Duration::from_secs(60);
const PING_SAMPLE_WINDOW: usize = 10;
const OUTBOUND_QUEUE: usize = 64;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PeerState {
    Connecting,
    Handshaking,
    Ready,
    Closing,
    Closed,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DisconnectReason {
    Timeout,
    ProtocolViolation,
    Io,
    Requested,
    Cancelled,
}

/// Notifications a connection pushes up to its owner.
#[derive(Debug)]
pub enum PeerEvent {
    Ready {
        addr: SocketAddr,
    },
    Disconnected {
        addr: SocketAddr,
        reason: DisconnectReason,
    },
    Inv {
        addr: SocketAddr,
        items: Vec<InventoryItem>,
    },
    GetData {
        addr: SocketAddr,
        items: Vec<InventoryItem>,
    },
    Addresses {
        addr: SocketAddr,
        addresses: Vec<SocketAddr>,
    },
    /// An unsolicited transaction, e.g. a bloom-filter match.
    Transaction {
        addr: SocketAddr,
        tx: Transaction,
    },
    /// An unsolicited block delivery.
    Block {
        addr: SocketAddr,
        block: Box<Block>,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
enum RequestKey {
    Headers,
    Tx(Hash256),
    Block(Hash256),
    MempoolInv,
}

pub struct PeerConnection {
    addr: SocketAddr,
    magic: [u8; 4],
    state: Mutex<PeerState>,
    outbound: mpsc::Sender<Message>,
    inflight: Mutex<HashMap<RequestKey, oneshot::Sender<Message>>>,
    remote_version: Mutex<Option<VersionMessage>>,
    got_verack: AtomicBool,
    negotiated_version: AtomicI32,
    best_height: AtomicI32,
    services: AtomicU64,
    ping_samples: Mutex<VecDeque<Duration>>,
    pending_pings: Mutex<HashMap<u64, Instant>>,
    last_pong: Mutex<Instant>,
    connected_at: Instant,
    codec_strikes: Mutex<VecDeque<Instant>>,
    disconnect_reason: Mutex<Option<DisconnectReason>>,
    cancel: CancelToken,
    events: mpsc::Sender<PeerEvent>,
}

impl PeerConnection {
    /// Dials `addr` and starts the reader, writer, and liveness tasks. The
    /// handshake runs in the background; the owner hears `PeerEvent::Ready`
    /// once both sides exchanged `version` and `verack`.
    pub async fn connect(
        addr: SocketAddr,
        config: &ChainConfig,
        start_height: i32,
        relay: bool,
        events: mpsc::Sender<PeerEvent>,
        cancel: CancelToken,
    ) -> Result<Arc<Self>, NetError> {
        let stream = tokio::select! {
            _ = cancel.cancelled() => return Err(NetError::Cancelled),
            connected = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)) => match connected {
                Ok(Ok(stream)) => stream,
                Ok(Err(err)) => return Err(NetError::Io(err.to_string())),
                Err(_) => return Err(NetError::PeerTimeout),
            },
        };
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);

        let now = Instant::now();
        let connection = Arc::new(Self {
            addr,
            magic: config.message_start,
            state: Mutex::new(PeerState::Handshaking),
            outbound,
            inflight: Mutex::new(HashMap::new()),
            remote_version: Mutex::new(None),
            got_verack: AtomicBool::new(false),
            negotiated_version: AtomicI32::new(PROTOCOL_VERSION),
            best_height: AtomicI32::new(-1),
            services: AtomicU64::new(0),
            ping_samples: Mutex::new(VecDeque::with_capacity(PING_SAMPLE_WINDOW)),
            pending_pings: Mutex::new(HashMap::new()),
            last_pong: Mutex::new(now),
            connected_at: now,
            codec_strikes: Mutex::new(VecDeque::new()),
            disconnect_reason: Mutex::new(None),
            cancel,
            events,
        });

        tokio::spawn(Arc::clone(&connection).write_loop(write_half, outbound_rx));
        tokio::spawn(Arc::clone(&connection).read_loop(read_half));
        tokio::spawn(Arc::clone(&connection).liveness_loop());

        connection
            .send(Message::Version(connection.local_version(start_height, relay)))
            .await?;
        Ok(connection)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn state(&self) -> PeerState {
        *self.state.lock().expect("peer state lock")
    }

    pub fn is_ready(&self) -> bool {
        self.state() == PeerState::Ready
    }

    pub fn best_height(&self) -> i32 {
        self.best_height.load(Ordering::Relaxed)
    }

    pub fn services(&self) -> u64 {
        self.services.load(Ordering::Relaxed)
    }

    /// Serving-only peers (no `NODE_NETWORK`) cannot drive header download.
    pub fn is_download_capable(&self) -> bool {
        self.services() & NODE_NETWORK != 0
    }

    pub fn negotiated_version(&self) -> i32 {
        self.negotiated_version.load(Ordering::Relaxed)
    }

    pub fn user_agent(&self) -> Option<String> {
        self.remote_version
            .lock()
            .expect("version lock")
            .as_ref()
            .map(|version| version.user_agent.clone())
    }

    pub fn mean_ping(&self) -> Option<Duration> {
        let samples = self.ping_samples.lock().expect("ping lock");
        if samples.is_empty() {
            return None;
        }
        let total: Duration = samples.iter().sum();
        Some(total / samples.len() as u32)
    }

    /// Queues a message on the single writer, preserving send order.
    pub async fn send(&self, message: Message) -> Result<(), NetError> {
        if matches!(self.state(), PeerState::Closing | PeerState::Closed) {
            return Err(NetError::Closed);
        }
        self.outbound
            .send(message)
            .await
            .map_err(|_| NetError::Closed)
    }

    /// Requests the connection be torn down; tasks unwind asynchronously.
    pub fn close(&self, reason: DisconnectReason) {
        {
            let mut stored = self.disconnect_reason.lock().expect("reason lock");
            stored.get_or_insert(reason);
        }
        {
            let mut state = self.state.lock().expect("peer state lock");
            if matches!(*state, PeerState::Closing | PeerState::Closed) {
                return;
            }
            *state = PeerState::Closing;
        }
        self.cancel.cancel();
    }

    /// Fetches headers following the locator; completes on `headers`.
    pub async fn request_headers(
        &self,
        locator: Vec<Hash256>,
        stop: Hash256,
    ) -> Result<Vec<BlockHeader>, NetError> {
        let request = Message::GetHeaders(GetHeadersMessage {
            version: self.negotiated_version(),
            locator,
            stop,
        });
        match self.roundtrip(RequestKey::Headers, request).await? {
            Message::Headers(headers) => Ok(headers),
            _ => Err(NetError::Protocol("unexpected headers completion")),
        }
    }

    /// Fetches one transaction; `Ok(None)` means the peer answered
    /// `notfound` (usually: already confirmed).
    pub async fn request_transaction(
        &self,
        txid: Hash256,
    ) -> Result<Option<Transaction>, NetError> {
        let request = Message::GetData(vec![InventoryItem::tx(txid)]);
        match self.roundtrip(RequestKey::Tx(txid), request).await? {
            Message::Tx(tx) => Ok(Some(tx)),
            Message::NotFound(_) => Ok(None),
            _ => Err(NetError::Protocol("unexpected tx completion")),
        }
    }

    /// Fetches one full block; `Ok(None)` on `notfound`.
    pub async fn request_block(&self, hash: Hash256) -> Result<Option<Block>, NetError> {
        let request = Message::GetData(vec![InventoryItem::block(hash)]);
        match self.roundtrip(RequestKey::Block(hash), request).await? {
            Message::Block(block) => Ok(Some(*block)),
            Message::NotFound(_) => Ok(None),
            _ => Err(NetError::Protocol("unexpected block completion")),
        }
    }

    /// Breadth-first download of `tx`'s unconfirmed ancestors.
    ///
    /// Returns dependencies children-first. A `notfound` ancestor is taken
    /// as confirmed and skipped. Bounded by depth and wall clock; hitting a
    /// bound fails with the partial result and keeps the connection usable.
    pub async fn download_dependencies(
        &self,
        tx: &Transaction,
    ) -> Result<Vec<Transaction>, NetError> {
        let deadline = Instant::now() + DEPENDENCY_WALL_CLOCK;
        let mut seen: HashSet<Hash256> = HashSet::new();
        seen.insert(tx.txid());
        let mut results: Vec<Transaction> = Vec::new();

        let mut frontier: Vec<Hash256> = Vec::new();
        for outpoint in tx.spent_outpoints() {
            if seen.insert(outpoint.txid) {
                frontier.push(outpoint.txid);
            }
        }

        let mut depth = 0usize;
        while !frontier.is_empty() {
            depth += 1;
            if depth > DEPENDENCY_DEPTH_LIMIT {
                return Err(NetError::DependencyLimit(results));
            }
            let mut next = Vec::new();
            for txid in frontier {
                if Instant::now() >= deadline {
                    return Err(NetError::DependencyLimit(results));
                }
                match self.request_transaction(txid).await? {
                    Some(parent) => {
                        for outpoint in parent.spent_outpoints() {
                            if seen.insert(outpoint.txid) {
                                next.push(outpoint.txid);
                            }
                        }
                        results.push(parent);
                    }
                    // Confirmed in a block; the walk ends here.
                    None => {}
                }
            }
            frontier = next;
        }
        Ok(results)
    }

    /// Probes the peer's mempool for `txid` and downloads it on a hit.
    pub async fn mempool_transaction(&self, txid: Hash256) -> Result<Transaction, NetError> {
        let advertised = match self.roundtrip(RequestKey::MempoolInv, Message::Mempool).await? {
            Message::Inv(items) => items,
            _ => return Err(NetError::Protocol("unexpected mempool completion")),
        };
        if !advertised
            .iter()
            .any(|item| item.kind == INV_TX && item.hash == txid)
        {
            return Err(NetError::NotInMempool);
        }
        self.request_transaction(txid)
            .await?
            .ok_or(NetError::NotInMempool)
    }

    async fn roundtrip(&self, key: RequestKey, request: Message) -> Result<Message, NetError> {
        let (done, wait) = oneshot::channel();
        {
            let mut inflight = self.inflight.lock().expect("inflight lock");
            if inflight.contains_key(&key) {
                return Err(NetError::Protocol("duplicate inflight request"));
            }
            inflight.insert(key, done);
        }

        if let Err(err) = self.send(request).await {
            self.inflight.lock().expect("inflight lock").remove(&key);
            return Err(err);
        }

        let outcome = tokio::select! {
            response = wait => response.map_err(|_| NetError::Closed),
            _ = self.cancel.cancelled() => Err(NetError::Cancelled),
            _ = tokio::time::sleep(REQUEST_TIMEOUT) => Err(NetError::PeerTimeout),
        };
        if outcome.is_err() {
            self.inflight.lock().expect("inflight lock").remove(&key);
        }
        outcome
    }

    fn complete(&self, key: RequestKey, message: Message) -> bool {
        let sender = self.inflight.lock().expect("inflight lock").remove(&key);
        match sender {
            Some(sender) => sender.send(message).is_ok(),
            None => false,
        }
    }

    fn local_version(&self, start_height: i32, relay: bool) -> VersionMessage {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_secs() as i64)
            .unwrap_or(0);
        VersionMessage {
            version: PROTOCOL_VERSION,
            services: 0,
            timestamp,
            receiver: NetAddress::from_socket_addr(self.addr, NODE_NETWORK),
            sender: NetAddress::unroutable(),
            nonce: rand::random(),
            user_agent: USER_AGENT.to_string(),
            start_height,
            relay,
        }
    }

    async fn write_loop(self: Arc<Self>, mut half: OwnedWriteHalf, mut rx: mpsc::Receiver<Message>) {
        loop {
            let message = tokio::select! {
                _ = self.cancel.cancelled() => break,
                message = rx.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };
            let bytes = frame_message(self.magic, &message);
            match timeout(SEND_TIMEOUT, half.write_all(&bytes)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    log_debug!("peer {} write failed: {err}", self.addr);
                    self.close(DisconnectReason::Io);
                    break;
                }
                Err(_) => {
                    self.close(DisconnectReason::Timeout);
                    break;
                }
            }
        }
        let _ = half.shutdown().await;
    }

    async fn read_loop(self: Arc<Self>, mut half: OwnedReadHalf) {
        let mut frames = FrameReader::new(self.magic);
        let mut buf = vec![0u8; 16 * 1024];
        let reason = 'read: loop {
            let n = tokio::select! {
                _ = self.cancel.cancelled() => {
                    break 'read self.stored_reason(DisconnectReason::Cancelled);
                }
                read = half.read(&mut buf) => match read {
                    Ok(0) => break 'read DisconnectReason::Io,
                    Ok(n) => n,
                    Err(_) => break 'read DisconnectReason::Io,
                },
            };
            frames.feed(&buf[..n]);
            loop {
                match frames.next_frame() {
                    Ok(Some((command, payload))) => {
                        match Message::decode_payload(&command, &payload) {
                            Ok(message) => {
                                if let Some(reason) = self.handle_message(message).await {
                                    break 'read reason;
                                }
                            }
                            Err(err) => {
                                log_debug!("peer {} sent bad {command}: {err}", self.addr);
                                if self.codec_strike() {
                                    break 'read DisconnectReason::ProtocolViolation;
                                }
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        log_debug!("peer {} framing error: {err}", self.addr);
                        if self.codec_strike() {
                            break 'read DisconnectReason::ProtocolViolation;
                        }
                    }
                }
            }
        };
        self.shutdown(reason).await;
    }

    async fn liveness_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(PING_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            match self.state() {
                PeerState::Handshaking => {
                    if self.connected_at.elapsed() > HANDSHAKE_TIMEOUT {
                        self.close(DisconnectReason::Timeout);
                        return;
                    }
                }
                PeerState::Ready => {
                    let overdue = {
                        let last_pong = self.last_pong.lock().expect("pong lock");
                        last_pong.elapsed() > PONG_TIMEOUT
                    };
                    if overdue {
                        log_debug!("peer {} pong timeout", self.addr);
                        self.close(DisconnectReason::Timeout);
                        return;
                    }
                    let nonce: u64 = rand::random();
                    self.pending_pings
                        .lock()
                        .expect("ping lock")
                        .insert(nonce, Instant::now());
                    if self.send(Message::Ping(nonce)).await.is_err() {
                        return;
                    }
                }
                _ => return,
            }
        }
    }

    async fn handle_message(&self, message: Message) -> Option<DisconnectReason> {
        match message {
            Message::Version(version) => {
                if version.version < MIN_PROTOCOL_VERSION {
                    log_info!(
                        "peer {} speaks obsolete protocol {}",
                        self.addr,
                        version.version
                    );
                    return Some(DisconnectReason::ProtocolViolation);
                }
                self.negotiated_version
                    .store(PROTOCOL_VERSION.min(version.version), Ordering::Relaxed);
                self.best_height.store(version.start_height, Ordering::Relaxed);
                self.services.store(version.services, Ordering::Relaxed);
                *self.remote_version.lock().expect("version lock") = Some(version);
                if self.send(Message::Verack).await.is_err() {
                    return Some(DisconnectReason::Io);
                }
                self.maybe_ready().await;
            }
            Message::Verack => {
                self.got_verack.store(true, Ordering::Relaxed);
                self.maybe_ready().await;
            }
            Message::Ping(nonce) => {
                if self.send(Message::Pong(nonce)).await.is_err() {
                    return Some(DisconnectReason::Io);
                }
            }
            Message::Pong(nonce) => {
                let sent = self
                    .pending_pings
                    .lock()
                    .expect("ping lock")
                    .remove(&nonce);
                if let Some(sent) = sent {
                    let mut samples = self.ping_samples.lock().expect("ping lock");
                    if samples.len() == PING_SAMPLE_WINDOW {
                        samples.pop_front();
                    }
                    samples.push_back(sent.elapsed());
                }
                *self.last_pong.lock().expect("pong lock") = Instant::now();
            }
            Message::Inv(items) => {
                // A pending mempool probe consumes the inventory; it still
                // flows up so the group can react to announcements.
                self.complete(RequestKey::MempoolInv, Message::Inv(items.clone()));
                self.emit(PeerEvent::Inv {
                    addr: self.addr,
                    items,
                })
                .await;
            }
            Message::Headers(headers) => {
                if !self.complete(RequestKey::Headers, Message::Headers(headers)) {
                    log_debug!("peer {} sent unsolicited headers", self.addr);
                }
            }
            Message::Tx(tx) => {
                let txid = tx.txid();
                if !self.complete(RequestKey::Tx(txid), Message::Tx(tx.clone())) {
                    self.emit(PeerEvent::Transaction {
                        addr: self.addr,
                        tx,
                    })
                    .await;
                }
            }
            Message::Block(block) => {
                let hash = block.header.hash();
                if !self.complete(RequestKey::Block(hash), Message::Block(block.clone())) {
                    self.emit(PeerEvent::Block {
                        addr: self.addr,
                        block,
                    })
                    .await;
                }
            }
            Message::NotFound(items) => {
                for item in items {
                    log_debug!(
                        "peer {} notfound {} {}",
                        self.addr,
                        item.kind,
                        hash_to_hex(&item.hash)
                    );
                    let completed = self
                        .complete(RequestKey::Tx(item.hash), Message::NotFound(vec![item]))
                        || self.complete(RequestKey::Block(item.hash), Message::NotFound(vec![item]));
                    if !completed {
                        log_debug!("peer {} notfound without request", self.addr);
                    }
                }
            }
            Message::GetData(items) => {
                self.emit(PeerEvent::GetData {
                    addr: self.addr,
                    items,
                })
                .await;
            }
            Message::Addr(addresses) => {
                let usable: Vec<SocketAddr> = addresses
                    .iter()
                    .map(|entry| entry.address.socket_addr())
                    .filter(|addr| addr.port() != 0 && !addr.ip().is_unspecified())
                    .collect();
                if !usable.is_empty() {
                    self.emit(PeerEvent::Addresses {
                        addr: self.addr,
                        addresses: usable,
                    })
                    .await;
                }
            }
            Message::Reject(reject) => {
                log_debug!(
                    "peer {} rejected {} ({:#04x}): {}",
                    self.addr,
                    reject.message,
                    reject.code,
                    reject.reason
                );
            }
            // We are an outbound SPV client; serving requests is out of scope.
            Message::GetHeaders(_)
            | Message::GetAddr
            | Message::Mempool
            | Message::FilterLoad(_)
            | Message::FilterAdd(_)
            | Message::FilterClear
            | Message::Unknown { .. } => {}
        }
        None
    }

    async fn maybe_ready(&self) {
        let has_version = self.remote_version.lock().expect("version lock").is_some();
        if !has_version || !self.got_verack.load(Ordering::Relaxed) {
            return;
        }
        {
            let mut state = self.state.lock().expect("peer state lock");
            if *state != PeerState::Handshaking {
                return;
            }
            *state = PeerState::Ready;
        }
        *self.last_pong.lock().expect("pong lock") = Instant::now();
        log_info!(
            "peer {} ready, version {}, height {}",
            self.addr,
            self.negotiated_version(),
            self.best_height()
        );
        // Keep the address pool warm.
        let _ = self.send(Message::GetAddr).await;
        self.emit(PeerEvent::Ready { addr: self.addr }).await;
    }

    fn codec_strike(&self) -> bool {
        let mut strikes = self.codec_strikes.lock().expect("strike lock");
        let now = Instant::now();
        strikes.push_back(now);
        while let Some(first) = strikes.front() {
            if now.duration_since(*first) > CODEC_STRIKE_WINDOW {
                strikes.pop_front();
            } else {
                break;
            }
        }
        strikes.len() >= CODEC_STRIKE_LIMIT
    }

    fn stored_reason(&self, fallback: DisconnectReason) -> DisconnectReason {
        self.disconnect_reason
            .lock()
            .expect("reason lock")
            .unwrap_or(fallback)
    }

    async fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event).await;
    }

    async fn shutdown(&self, reason: DisconnectReason) {
        let reason = {
            let mut stored = self.disconnect_reason.lock().expect("reason lock");
            *stored.get_or_insert(reason)
        };
        {
            let mut state = self.state.lock().expect("peer state lock");
            if *state == PeerState::Closed {
                return;
            }
            *state = PeerState::Closing;
        }
        self.cancel.cancel();

        // Fail every inflight future; dropping the senders wakes the waiters
        // with a Closed error.
        self.inflight.lock().expect("inflight lock").clear();
        self.pending_pings.lock().expect("ping lock").clear();

        *self.state.lock().expect("peer state lock") = PeerState::Closed;
        log_debug!("peer {} closed: {:?}", self.addr, reason);
        self.emit(PeerEvent::Disconnected {
            addr: self.addr,
            reason,
        })
        .await;
    }
}
