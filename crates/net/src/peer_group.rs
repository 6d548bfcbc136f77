//! The connection pool: discovery, download election, broadcast, shutdown.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use ltcspv_chain::{ChainEngine, ChainError};
use ltcspv_consensus::params::ChainConfig;
use ltcspv_consensus::Hash256;
use ltcspv_primitives::Transaction;
use ltcspv_wire::{BloomFilter, InventoryItem, Message, INV_BLOCK, INV_TX};
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::cancel::CancelToken;
use crate::discovery::PeerDiscovery;
use crate::error::NetError;
use crate::peer::{DisconnectReason, PeerConnection, PeerEvent};
use crate::peer_book::{PeerBook, BAD_CHAIN_BAN_SECS};

const EVENT_QUEUE: usize = 256;
const MAINTENANCE_TICK: Duration = Duration::from_secs(1);
const SYNC_POLL: Duration = Duration::from_secs(10);
const BROADCAST_TIMEOUT: Duration = Duration::from_secs(60);
const DISCOVERY_RETRY_MAX: Duration = Duration::from_secs(60);
/// How long discovery may fail before the condition is surfaced.
const DISCOVERY_SURFACE_AFTER: Duration = Duration::from_secs(10 * 60);

#[derive(Clone, Debug)]
pub struct PeerGroupConfig {
    /// Connections the group tries to keep open.
    pub target_connections: usize,
    /// Peers a broadcast announces to, capped by how many are ready.
    pub broadcast_peers: usize,
    /// Download peer re-election deadline with no header progress.
    pub stall_timeout: Duration,
    /// Ban length for a peer that served an invalid chain.
    pub ban_secs: u64,
}

impl Default for PeerGroupConfig {
    fn default() -> Self {
        Self {
            target_connections: 4,
            broadcast_peers: 2,
            stall_timeout: Duration::from_secs(60),
            ban_secs: BAD_CHAIN_BAN_SECS,
        }
    }
}

struct BroadcastEntry {
    tx: Transaction,
    done: Option<oneshot::Sender<SocketAddr>>,
}

type PeerList = Arc<Vec<Arc<PeerConnection>>>;
type TransactionHandler = Arc<dyn Fn(SocketAddr, Transaction) + Send + Sync>;

/// Maintains outbound connections and coordinates header download,
/// transaction broadcast, and bloom-filter distribution across them.
pub struct PeerGroup {
    chain_config: ChainConfig,
    group_config: PeerGroupConfig,
    engine: Arc<ChainEngine>,
    discoveries: Mutex<Vec<Arc<dyn PeerDiscovery>>>,
    address_pool: Mutex<Vec<SocketAddr>>,
    connecting: Mutex<HashSet<SocketAddr>>,
    // Copy-on-write so broadcast iterates without holding a lock.
    peers: RwLock<PeerList>,
    peer_book: Arc<PeerBook>,
    bloom: Mutex<Option<BloomFilter>>,
    ready_watch: watch::Sender<usize>,
    download_peer: Mutex<Option<SocketAddr>>,
    sync_progress: Mutex<Instant>,
    sync_nudge: Notify,
    broadcasts: Mutex<HashMap<Hash256, BroadcastEntry>>,
    tx_handler: Mutex<Option<TransactionHandler>>,
    events_tx: mpsc::Sender<PeerEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<PeerEvent>>>,
    network_unavailable: AtomicBool,
    cancel: CancelToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    self_ref: std::sync::Weak<PeerGroup>,
}

impl PeerGroup {
    pub fn new(chain_config: ChainConfig, engine: Arc<ChainEngine>) -> Arc<Self> {
        Self::with_config(chain_config, engine, PeerGroupConfig::default())
    }

    pub fn with_config(
        chain_config: ChainConfig,
        engine: Arc<ChainEngine>,
        group_config: PeerGroupConfig,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let (ready_watch, _) = watch::channel(0usize);
        Arc::new_cyclic(|self_ref| Self {
            chain_config,
            group_config,
            engine,
            discoveries: Mutex::new(Vec::new()),
            address_pool: Mutex::new(Vec::new()),
            connecting: Mutex::new(HashSet::new()),
            peers: RwLock::new(Arc::new(Vec::new())),
            peer_book: Arc::new(PeerBook::new()),
            bloom: Mutex::new(None),
            ready_watch,
            download_peer: Mutex::new(None),
            sync_progress: Mutex::new(Instant::now()),
            sync_nudge: Notify::new(),
            broadcasts: Mutex::new(HashMap::new()),
            tx_handler: Mutex::new(None),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            network_unavailable: AtomicBool::new(false),
            cancel: CancelToken::new(),
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        })
    }

    fn arc(&self) -> Arc<Self> {
        self.self_ref.upgrade().expect("peer group alive")
    }

    pub fn peer_book(&self) -> &Arc<PeerBook> {
        &self.peer_book
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn add_discovery(&self, discovery: Box<dyn PeerDiscovery>) {
        self.discoveries
            .lock()
            .expect("discovery lock")
            .push(Arc::from(discovery));
    }

    pub fn add_address(&self, addr: SocketAddr) {
        let mut pool = self.address_pool.lock().expect("pool lock");
        if !pool.contains(&addr) {
            pool.push(addr);
        }
    }

    /// Registers the embedder's sink for bloom-matched transactions.
    pub fn set_transaction_handler(&self, handler: TransactionHandler) {
        *self.tx_handler.lock().expect("handler lock") = Some(handler);
    }

    /// Whether discovery has failed continuously for over ten minutes.
    pub fn is_network_unavailable(&self) -> bool {
        self.network_unavailable.load(Ordering::Relaxed)
    }

    pub fn connected_peers(&self) -> Vec<Arc<PeerConnection>> {
        self.peers.read().expect("peer list lock").iter().cloned().collect()
    }

    pub fn ready_peers(&self) -> Vec<Arc<PeerConnection>> {
        self.peers
            .read()
            .expect("peer list lock")
            .iter()
            .filter(|peer| peer.is_ready())
            .cloned()
            .collect()
    }

    pub fn download_peer(&self) -> Option<SocketAddr> {
        *self.download_peer.lock().expect("download lock")
    }

    /// Starts the manager task. Idempotent.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let events = self
            .events_rx
            .lock()
            .expect("events lock")
            .take()
            .expect("events receiver unclaimed");
        let group = self.arc();
        let handle = tokio::spawn(group.run(events));
        self.tasks.lock().expect("task lock").push(handle);
        log_info!(
            "peer group started for {} (target {} connections)",
            self.chain_config.id(),
            self.group_config.target_connections
        );
    }

    /// Resolves once at least `n` peers are Ready.
    pub async fn wait_for_peers(&self, n: usize) -> Result<(), NetError> {
        let mut ready = self.ready_watch.subscribe();
        tokio::select! {
            _ = self.cancel.cancelled() => Err(NetError::Cancelled),
            result = ready.wait_for(|count| *count >= n) => {
                result.map(|_| ()).map_err(|_| NetError::Closed)
            }
        }
    }

    /// Announces `tx` to `min(ready, broadcast_peers)` peers and completes
    /// once at least one of them fetches it with `getdata`.
    pub async fn broadcast_transaction(&self, tx: Transaction) -> Result<(), NetError> {
        let txid = tx.txid();
        let (done, wait) = oneshot::channel();
        self.broadcasts.lock().expect("broadcast lock").insert(
            txid,
            BroadcastEntry {
                tx,
                done: Some(done),
            },
        );

        let ready = self.ready_peers();
        if ready.is_empty() {
            self.broadcasts.lock().expect("broadcast lock").remove(&txid);
            return Err(NetError::NetworkUnavailable);
        }
        let fanout = ready.len().min(self.group_config.broadcast_peers.max(1));
        for peer in ready.iter().take(fanout) {
            let _ = peer
                .send(Message::Inv(vec![InventoryItem::tx(txid)]))
                .await;
        }

        let outcome = tokio::select! {
            relayed = wait => relayed.map_err(|_| NetError::Closed),
            _ = self.cancel.cancelled() => Err(NetError::Cancelled),
            _ = tokio::time::sleep(BROADCAST_TIMEOUT) => Err(NetError::PeerTimeout),
        };
        match outcome {
            Ok(relayed_by) => {
                log_info!("transaction relayed via {relayed_by}");
                Ok(())
            }
            Err(err) => {
                self.broadcasts.lock().expect("broadcast lock").remove(&txid);
                Err(err)
            }
        }
    }

    /// Installs the filter and pushes `filterload` to every Ready peer.
    ///
    /// Each connection writes through one ordered queue, so a `getdata`
    /// issued after this call can never overtake the new filter.
    pub async fn set_bloom_filter(&self, filter: BloomFilter) {
        *self.bloom.lock().expect("bloom lock") = Some(filter.clone());
        for peer in self.ready_peers() {
            let _ = peer.send(Message::FilterLoad(filter.clone())).await;
        }
    }

    /// Cancels all work, closes every connection, and joins the tasks with
    /// a five second deadline before aborting the stragglers.
    pub async fn stop(&self) {
        log_info!("peer group stopping");
        self.cancel.cancel();
        for peer in self.connected_peers() {
            peer.close(DisconnectReason::Requested);
        }

        let handles: Vec<JoinHandle<()>> = self.tasks.lock().expect("task lock").drain(..).collect();
        let deadline = Instant::now() + Duration::from_secs(5);
        for handle in handles {
            let abort = handle.abort_handle();
            let remaining = deadline.saturating_duration_since(Instant::now());
            if timeout(remaining, handle).await.is_err() {
                abort.abort();
            }
        }

        *self.peers.write().expect("peer list lock") = Arc::new(Vec::new());
        let _ = self.ready_watch.send(0);
    }

    async fn run(self: Arc<Self>, mut events: mpsc::Receiver<PeerEvent>) {
        let mut ticker = tokio::time::interval(MAINTENANCE_TICK);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut discovery_failing_since: Option<Instant> = None;
        let mut discovery_backoff = Duration::from_secs(1);
        let mut next_discovery = Instant::now();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
                _ = ticker.tick() => {
                    self.maintain(
                        &mut discovery_failing_since,
                        &mut discovery_backoff,
                        &mut next_discovery,
                    )
                    .await;
                }
            }
        }
    }

    async fn maintain(
        &self,
        discovery_failing_since: &mut Option<Instant>,
        discovery_backoff: &mut Duration,
        next_discovery: &mut Instant,
    ) {
        self.prune_closed();

        let pool_size = self.address_pool.lock().expect("pool lock").len();
        if pool_size < self.group_config.target_connections && Instant::now() >= *next_discovery {
            match self.discover_addresses().await {
                Ok(found) => {
                    if found > 0 {
                        log_debug!("discovery found {found} address(es)");
                    }
                    *discovery_failing_since = None;
                    *discovery_backoff = Duration::from_secs(1);
                    self.network_unavailable.store(false, Ordering::Relaxed);
                    *next_discovery = Instant::now() + Duration::from_secs(30);
                }
                Err(_) => {
                    let since = discovery_failing_since.get_or_insert_with(Instant::now);
                    if since.elapsed() > DISCOVERY_SURFACE_AFTER
                        && !self.network_unavailable.swap(true, Ordering::Relaxed)
                    {
                        log_error!(
                            "no discovery source has produced an address for {}s",
                            since.elapsed().as_secs()
                        );
                    }
                    *next_discovery = Instant::now() + *discovery_backoff;
                    *discovery_backoff = (*discovery_backoff * 2).min(DISCOVERY_RETRY_MAX);
                }
            }
        }

        self.fill_connections().await;
        self.check_download_stall();
        if self.download_peer().is_none() {
            self.elect_download_peer(None);
        }
    }

    async fn discover_addresses(&self) -> Result<usize, NetError> {
        // Snapshot the sources so none of them runs under the lock.
        let sources: Vec<Arc<dyn PeerDiscovery>> =
            self.discoveries.lock().expect("discovery lock").clone();
        let mut found = 0usize;
        let mut any_ok = false;
        for source in sources {
            match source.discover().await {
                Ok(addresses) => {
                    any_ok = true;
                    log_debug!("{} yielded {} address(es)", source.source(), addresses.len());
                    let mut pool = self.address_pool.lock().expect("pool lock");
                    for addr in addresses {
                        if !pool.contains(&addr) {
                            pool.push(addr);
                            found += 1;
                        }
                    }
                }
                Err(err) => log_debug!("{} failed: {err}", source.source()),
            }
        }
        // Explicitly added addresses count as a source too.
        if !self.address_pool.lock().expect("pool lock").is_empty() {
            any_ok = true;
        }
        if any_ok {
            Ok(found)
        } else {
            Err(NetError::NetworkUnavailable)
        }
    }

    async fn fill_connections(&self) {
        let open = self.peers.read().expect("peer list lock").len();
        let connecting = self.connecting.lock().expect("connecting lock").len();
        let target = self.group_config.target_connections;
        if open + connecting >= target {
            return;
        }
        let mut wanted = target - open - connecting;

        let candidates: Vec<SocketAddr> = {
            let pool = self.address_pool.lock().expect("pool lock");
            pool.iter().copied().collect()
        };
        let connected: HashSet<SocketAddr> = self
            .connected_peers()
            .iter()
            .map(|peer| peer.addr())
            .collect();

        for addr in candidates {
            if wanted == 0 {
                break;
            }
            if connected.contains(&addr) {
                continue;
            }
            if !self.peer_book.may_connect(addr) {
                continue;
            }
            {
                let mut connecting = self.connecting.lock().expect("connecting lock");
                if !connecting.insert(addr) {
                    continue;
                }
            }
            wanted -= 1;
            let group = self.arc();
            tokio::spawn(async move {
                group.connect_to(addr).await;
            });
        }
    }

    async fn connect_to(self: Arc<Self>, addr: SocketAddr) {
        let start_height = self
            .engine
            .chain_head()
            .map(|head| head.height as i32)
            .unwrap_or(0);
        let relay = self.bloom.lock().expect("bloom lock").is_none();
        let result = PeerConnection::connect(
            addr,
            &self.chain_config,
            start_height,
            relay,
            self.events_tx.clone(),
            self.cancel.child(),
        )
        .await;
        self.connecting.lock().expect("connecting lock").remove(&addr);
        match result {
            Ok(peer) => {
                let mut peers = self.peers.write().expect("peer list lock");
                let mut next: Vec<Arc<PeerConnection>> = peers.iter().cloned().collect();
                next.push(peer);
                *peers = Arc::new(next);
            }
            Err(err) => {
                log_debug!("connect to {addr} failed: {err}");
                self.peer_book.record_failure(addr);
            }
        }
    }

    fn prune_closed(&self) {
        let mut peers = self.peers.write().expect("peer list lock");
        if peers
            .iter()
            .any(|peer| matches!(peer.state(), crate::peer::PeerState::Closed))
        {
            let next: Vec<Arc<PeerConnection>> = peers
                .iter()
                .filter(|peer| !matches!(peer.state(), crate::peer::PeerState::Closed))
                .cloned()
                .collect();
            *peers = Arc::new(next);
        }
        drop(peers);
        self.publish_ready_count();
    }

    fn publish_ready_count(&self) {
        let count = self.ready_peers().len();
        let _ = self.ready_watch.send(count);
    }

    async fn handle_event(&self, event: PeerEvent) {
        match event {
            PeerEvent::Ready { addr } => {
                self.peer_book.record_success(addr);
                self.publish_ready_count();
                let filter = self.bloom.lock().expect("bloom lock").clone();
                if let Some(filter) = filter {
                    if let Some(peer) = self.peer_by_addr(addr) {
                        let _ = peer.send(Message::FilterLoad(filter)).await;
                    }
                }
                if self.download_peer().is_none() {
                    self.elect_download_peer(None);
                }
            }
            PeerEvent::Disconnected { addr, reason } => {
                log_debug!("peer {addr} disconnected: {reason:?}");
                if reason != DisconnectReason::Requested {
                    self.peer_book.record_failure(addr);
                }
                self.prune_closed();
                let was_download = self.download_peer() == Some(addr);
                if was_download {
                    *self.download_peer.lock().expect("download lock") = None;
                    self.elect_download_peer(Some(addr));
                }
            }
            PeerEvent::Inv { addr, items } => {
                let has_block = items.iter().any(|item| item.kind == INV_BLOCK);
                if has_block && self.download_peer() == Some(addr) {
                    self.sync_nudge.notify_waiters();
                }
            }
            PeerEvent::GetData { addr, items } => {
                self.serve_broadcasts(addr, items).await;
            }
            PeerEvent::Addresses { addr, addresses } => {
                let mut pool = self.address_pool.lock().expect("pool lock");
                let mut added = 0usize;
                for candidate in addresses {
                    if !pool.contains(&candidate) {
                        pool.push(candidate);
                        added += 1;
                    }
                }
                if added > 0 {
                    log_debug!("learned {added} address(es) from {addr}");
                }
            }
            PeerEvent::Transaction { addr, tx } => {
                let handler = self.tx_handler.lock().expect("handler lock").clone();
                if let Some(handler) = handler {
                    handler(addr, tx);
                }
            }
            PeerEvent::Block { .. } => {
                // Full unsolicited blocks are not part of filtered delivery.
            }
        }
    }

    async fn serve_broadcasts(&self, addr: SocketAddr, items: Vec<InventoryItem>) {
        for item in items {
            if item.kind != INV_TX {
                continue;
            }
            let (tx, done) = {
                let mut broadcasts = self.broadcasts.lock().expect("broadcast lock");
                match broadcasts.get_mut(&item.hash) {
                    Some(entry) => (entry.tx.clone(), entry.done.take()),
                    None => continue,
                }
            };
            if let Some(peer) = self.peer_by_addr(addr) {
                let _ = peer.send(Message::Tx(tx)).await;
            }
            if let Some(done) = done {
                let _ = done.send(addr);
            }
        }
    }

    fn peer_by_addr(&self, addr: SocketAddr) -> Option<Arc<PeerConnection>> {
        self.peers
            .read()
            .expect("peer list lock")
            .iter()
            .find(|peer| peer.addr() == addr)
            .cloned()
    }

    fn check_download_stall(&self) {
        let Some(current) = self.download_peer() else {
            return;
        };
        let stalled = {
            let progress = self.sync_progress.lock().expect("progress lock");
            progress.elapsed() > self.group_config.stall_timeout
        };
        if stalled {
            log_warn!("download peer {current} stalled, re-electing");
            self.peer_book.record_failure(current);
            *self.download_peer.lock().expect("download lock") = None;
            self.elect_download_peer(Some(current));
        }
    }

    /// Picks the Ready, download-capable peer with the greatest advertised
    /// height (ties: lowest mean ping) and starts header sync on it.
    fn elect_download_peer(&self, exclude: Option<SocketAddr>) {
        let candidates: Vec<Arc<PeerConnection>> = self
            .ready_peers()
            .into_iter()
            .filter(|peer| peer.is_download_capable())
            .filter(|peer| Some(peer.addr()) != exclude)
            .filter(|peer| !self.peer_book.is_banned(peer.addr()))
            .collect();

        let elected = candidates.into_iter().max_by_key(|peer| {
            let ping = peer
                .mean_ping()
                .map(|ping| ping.as_millis())
                .unwrap_or(u128::MAX);
            (peer.best_height(), std::cmp::Reverse(ping))
        });
        let Some(peer) = elected else {
            return;
        };

        {
            let mut download = self.download_peer.lock().expect("download lock");
            if download.is_some() {
                return;
            }
            *download = Some(peer.addr());
        }
        *self.sync_progress.lock().expect("progress lock") = Instant::now();
        log_info!(
            "download peer elected: {} (height {})",
            peer.addr(),
            peer.best_height()
        );

        let group = self.arc();
        let handle = tokio::spawn(async move {
            group.sync_headers(peer).await;
        });
        self.tasks.lock().expect("task lock").push(handle);
    }

    /// Streams headers from the elected peer into the chain engine until
    /// the peer stops being the download peer or fails.
    async fn sync_headers(self: Arc<Self>, peer: Arc<PeerConnection>) {
        let addr = peer.addr();
        loop {
            if self.cancel.is_cancelled()
                || self.download_peer() != Some(addr)
                || !peer.is_ready()
            {
                return;
            }

            let locator = match self.engine.block_locator() {
                Ok(locator) => locator,
                Err(err) => {
                    log_error!("cannot build locator: {err}");
                    return;
                }
            };

            let headers = match peer.request_headers(locator, [0u8; 32]).await {
                Ok(headers) => headers,
                Err(NetError::Cancelled) | Err(NetError::Closed) => return,
                Err(NetError::PeerTimeout) => {
                    log_warn!("download peer {addr} timed out");
                    peer.close(DisconnectReason::Timeout);
                    return;
                }
                Err(err) => {
                    log_warn!("download peer {addr} failed: {err}");
                    peer.close(DisconnectReason::Io);
                    return;
                }
            };

            if headers.is_empty() {
                // Synced; wait for an announcement or poll again.
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    _ = self.sync_nudge.notified() => {}
                    _ = tokio::time::sleep(SYNC_POLL) => {}
                }
                continue;
            }

            let count = headers.len();
            for header in headers {
                match self.engine.add_header(header) {
                    Ok(_) => {}
                    Err(ChainError::Verification(err)) => {
                        log_warn!("download peer {addr} served bad header: {err}");
                        self.peer_book.record_failure(addr);
                        self.peer_book.ban_for(addr, self.group_config.ban_secs);
                        peer.close(DisconnectReason::ProtocolViolation);
                        return;
                    }
                    Err(err) => {
                        // Storage faults are fatal to the engine; stop
                        // feeding it and surface through the logs.
                        log_error!("chain engine rejected headers fatally: {err}");
                        return;
                    }
                }
            }
            *self.sync_progress.lock().expect("progress lock") = Instant::now();
            log_debug!("accepted {count} header(s) from {addr}");
        }
    }
}
