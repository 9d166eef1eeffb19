// Live torrent: connections, dispatch and piece verification.
//
// One task per peer connection, one dispatcher task and one discovery task
// per torrent. Piece bookkeeping lives in `locked`; the connection table in
// `peers`. Neither lock is ever held across I/O or while taking the other.

use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use backon::{ExponentialBuilder, Retryable};
use bytes::Bytes;
use kraken_core::{
    Digest, PeerId,
    lengths::{Lengths, ValidPieceIndex},
    metainfo::MetaInfo,
};
use parking_lot::{Mutex, RwLock};
use peer_protocol::{Handshake, Message, MessageDeserializeError, PieceRef};
use tokio::{
    sync::{Notify, mpsc::unbounded_channel},
    time::Instant,
};
use tracing::{debug, error_span, info, trace, warn};

use crate::{
    config::SchedulerConfig,
    connstate::ConnPermit,
    discovery::PeerInfo,
    error::{Error, Result, TorrentFailure},
    peer_connection::{
        HandshakeFramed, PeerConnection, PeerConnectionHandler, PeerConnectionOptions,
        WriterRequest,
    },
    type_aliases::BF,
};

use super::{
    ManagedTorrentShared, PeerStats, TorrentState, TorrentStats,
    dispatcher::Dispatcher,
    peer::{LivePeer, PeerConnState, PeerCounters},
};

const MIN_DISPATCH_TICK: Duration = Duration::from_millis(10);

pub(crate) struct TorrentStateLocked {
    dispatcher: Dispatcher,
    // Stalled requests per connection.
    strikes: HashMap<PeerId, u32>,
}

pub(crate) struct TorrentStateLive {
    shared: Arc<ManagedTorrentShared>,
    meta: MetaInfo,
    lengths: Lengths,

    locked: RwLock<TorrentStateLocked>,
    peers: RwLock<HashMap<PeerId, LivePeer>>,
    // Outgoing connections waiting for a slot.
    pending: Mutex<HashSet<PeerId>>,

    last_progress: Mutex<Instant>,
    last_peer_activity: Mutex<Instant>,
    downloaded_bytes: AtomicU64,

    dispatch_notify: Notify,
}

impl TorrentStateLive {
    pub fn new(
        shared: Arc<ManagedTorrentShared>,
        meta: MetaInfo,
        lengths: Lengths,
        have: BF,
    ) -> Arc<Self> {
        let now = Instant::now();
        Arc::new(Self {
            shared,
            meta,
            lengths,
            locked: RwLock::new(TorrentStateLocked {
                dispatcher: Dispatcher::new(have),
                strikes: HashMap::new(),
            }),
            peers: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashSet::new()),
            last_progress: Mutex::new(now),
            last_peer_activity: Mutex::new(now),
            downloaded_bytes: AtomicU64::new(0),
            dispatch_notify: Notify::new(),
        })
    }

    fn digest(&self) -> Digest {
        self.shared.digest
    }

    pub fn metainfo(&self) -> &MetaInfo {
        &self.meta
    }

    pub fn is_complete(&self) -> bool {
        self.locked.read().dispatcher.is_complete()
    }

    pub fn num_peers(&self) -> usize {
        self.peers.read().len()
    }

    pub fn idle_for(&self) -> Duration {
        if self.num_peers() > 0 {
            return Duration::ZERO;
        }
        self.last_peer_activity.lock().elapsed()
    }

    pub fn start(self: &Arc<Self>) {
        let token = self.shared.loops_token.clone();
        self.shared.spawn(
            error_span!(parent: None, "dispatcher", digest = %self.digest()),
            token.clone(),
            self.clone().task_dispatcher(),
        );
        self.shared.spawn(
            error_span!(parent: None, "discovery", digest = %self.digest()),
            token,
            self.clone().task_discover_peers(),
        );
    }

    fn our_handshake(&self) -> Handshake {
        let mut have = self.locked.read().dispatcher.have().clone();
        have.set_uninitialized(false);
        Handshake::new(
            self.digest(),
            self.shared.ctx.peer_id,
            self.lengths.total_pieces(),
            Bytes::from(have.into_vec()),
        )
    }

    fn notify_dispatcher(&self) {
        self.dispatch_notify.notify_one();
    }

    fn send_to(&self, peer_id: &PeerId, req: WriterRequest) -> bool {
        self.peers
            .read()
            .get(peer_id)
            .map(|p| p.send(req))
            .unwrap_or(false)
    }

    fn broadcast(&self, msg: Message) {
        for p in self.peers.read().values() {
            p.send(WriterRequest::Message(msg.clone()));
        }
    }

    /// Asks every connection to close cleanly.
    pub fn disconnect_all(&self) {
        for p in self.peers.read().values() {
            p.send(WriterRequest::Disconnect(Ok(())));
        }
    }

    /// Drops every connection entry, releasing its slot.
    pub fn clear_peers(&self) {
        let peers = std::mem::take(&mut *self.peers.write());
        self.pending.lock().clear();
        drop(peers);
    }

    fn is_known_peer(&self, peer_id: &PeerId) -> bool {
        self.peers.read().contains_key(peer_id) || self.pending.lock().contains(peer_id)
    }

    fn new_connection(
        self: &Arc<Self>,
        peer_id: PeerId,
        addr: SocketAddr,
        outgoing: bool,
        permit: ConnPermit,
        cfg: &SchedulerConfig,
    ) -> (
        PeerConnection<PeerHandler>,
        tokio::sync::mpsc::UnboundedReceiver<WriterRequest>,
    ) {
        let (tx, rx) = unbounded_channel();
        let peer = LivePeer::new(addr, outgoing, tx.clone(), permit);
        let counters = peer.counters.clone();
        self.peers.write().insert(peer_id, peer);
        *self.last_peer_activity.lock() = Instant::now();

        let handler = PeerHandler {
            live: self.clone(),
            peer_id,
            tx,
            counters: counters.clone(),
        };
        let conn = PeerConnection::new(
            addr,
            self.digest(),
            self.shared.ctx.peer_id,
            handler,
            PeerConnectionOptions::from(cfg),
            self.shared.ctx.spawner,
            counters,
        );
        (conn, rx)
    }

    /// Takes over a connection whose handshake the listener already read.
    pub fn add_incoming_peer(
        self: &Arc<Self>,
        addr: SocketAddr,
        handshake: Handshake,
        framed: HandshakeFramed,
    ) -> Result<()> {
        let peer_id = handshake.peer_id;
        let cfg = self.shared.ctx.config();
        let permit = self
            .shared
            .ctx
            .connstate
            .try_reserve(self.digest(), peer_id, &cfg)?;
        let (conn, rx) = self.new_connection(peer_id, addr, false, permit, &cfg);
        let this = self.clone();
        self.shared.spawn(
            error_span!(parent: None, "peer", digest = %self.digest(), %addr, outgoing = false),
            self.shared.cancellation_token.clone(),
            async move {
                let res = conn.manage_peer_incoming(rx, framed, handshake).await;
                this.on_peer_died(peer_id, res);
                Ok(())
            },
        );
        Ok(())
    }

    fn spawn_outgoing_peer(self: &Arc<Self>, info: PeerInfo) {
        self.pending.lock().insert(info.peer_id);
        self.shared.spawn(
            error_span!(parent: None, "peer", digest = %self.digest(), addr = %info.addr, outgoing = true),
            self.shared.cancellation_token.clone(),
            self.clone().task_manage_outgoing_peer(info),
        );
    }

    /// Reserves a connection slot, retrying with backoff while capacity is exhausted.
    async fn reserve_with_backoff(&self, peer_id: PeerId) -> Result<ConnPermit> {
        let ctx = &self.shared.ctx;
        let digest = self.digest();
        let stall_timeout = ctx.config().stall_timeout;
        let reserve = (|| async move { ctx.connstate.try_reserve(digest, peer_id, &ctx.config()) })
            .retry(
                ExponentialBuilder::new()
                    .without_max_times()
                    .with_jitter()
                    .with_min_delay(Duration::from_millis(50))
                    .with_max_delay(Duration::from_secs(5)),
            )
            .when(|e| matches!(e, Error::CapacityExceeded))
            .notify(|_, retry_in| trace!(?retry_in, "connection capacity exceeded, retrying"));
        match tokio::time::timeout(stall_timeout, reserve).await {
            Ok(r) => r,
            Err(_) => Err(Error::CapacityExceeded),
        }
    }

    async fn task_manage_outgoing_peer(self: Arc<Self>, info: PeerInfo) -> anyhow::Result<()> {
        let peer_id = info.peer_id;
        let permit = self
            .shared
            .loops_token
            .run_until_cancelled(self.reserve_with_backoff(peer_id))
            .await;
        let permit = match permit {
            Some(Ok(permit)) => permit,
            Some(Err(e)) => {
                self.pending.lock().remove(&peer_id);
                debug!("not connecting: {e:#}");
                return Ok(());
            }
            None => {
                self.pending.lock().remove(&peer_id);
                return Ok(());
            }
        };
        let cfg = self.shared.ctx.config();
        let (conn, rx) = self.new_connection(peer_id, info.addr, true, permit, &cfg);
        self.pending.lock().remove(&peer_id);
        let res = conn.manage_peer_outgoing(peer_id, rx).await;
        self.on_peer_died(peer_id, res);
        Ok(())
    }

    fn on_peer_died(&self, peer_id: PeerId, res: Result<()>) {
        let peer = self.peers.write().remove(&peer_id);
        let freed = {
            let mut g = self.locked.write();
            g.strikes.remove(&peer_id);
            g.dispatcher.remove_peer(&peer_id)
        };
        match &res {
            Ok(()) | Err(Error::Disconnect) => debug!(%peer_id, "peer disconnected"),
            Err(e) => {
                debug!(%peer_id, "peer died: {e:#}");
                if let Some(cause) = e.blacklist_cause() {
                    let cfg = self.shared.ctx.config();
                    self.shared.ctx.connstate.report(
                        self.digest(),
                        peer_id,
                        cause,
                        &cfg.blacklist,
                    );
                }
            }
        }
        if !freed.is_empty() {
            debug!(%peer_id, ?freed, "freed requests of dead peer");
        }
        if self.peers.read().is_empty() {
            *self.last_peer_activity.lock() = Instant::now();
        }
        // Releases the connection slot.
        drop(peer);
        self.notify_dispatcher();
    }

    async fn task_discover_peers(self: Arc<Self>) -> anyhow::Result<()> {
        let ctx = &self.shared.ctx;
        let digest = self.digest();
        let mut first = true;
        loop {
            if self.is_complete() {
                return Ok(());
            }
            let cfg = ctx.config();
            let connected = self.num_peers() + self.pending.lock().len();
            if connected < cfg.max_conns_per_torrent {
                match ctx.discovery.find_peers(&digest).await {
                    Ok(found) => {
                        let mut found: Vec<PeerInfo> = found
                            .into_iter()
                            .filter(|p| p.peer_id != ctx.peer_id)
                            .collect();
                        // Seeders first when the budget can't take everyone.
                        found.sort_by_key(|p| !p.complete);
                        if first
                            && found.is_empty()
                            && self.locked.read().dispatcher.have().not_any()
                        {
                            self.shared.fail(TorrentFailure::NotFound);
                            return Ok(());
                        }
                        first = false;
                        let mut budget = cfg.max_conns_per_torrent - connected;
                        for info in found {
                            if budget == 0 {
                                break;
                            }
                            if self.is_known_peer(&info.peer_id)
                                || ctx.connstate.is_blacklisted(&digest, &info.peer_id)
                            {
                                continue;
                            }
                            trace!(peer_id = %info.peer_id, addr = %info.addr, "connecting");
                            self.spawn_outgoing_peer(info);
                            budget -= 1;
                        }
                    }
                    Err(e) => warn!("error finding peers: {e:#}"),
                }
            }
            tokio::time::sleep(cfg.discovery_interval).await;
        }
    }

    async fn task_dispatcher(self: Arc<Self>) -> anyhow::Result<()> {
        loop {
            let cfg = self.shared.ctx.config();
            let tick = (cfg.request_timeout.min(cfg.stall_timeout) / 4).max(MIN_DISPATCH_TICK);
            tokio::select! {
                _ = self.dispatch_notify.notified() => {},
                _ = tokio::time::sleep(tick) => {},
            }
            if self.is_complete() {
                return Ok(());
            }
            let since_progress = self.last_progress.lock().elapsed();
            if since_progress > cfg.stall_timeout {
                warn!(?since_progress, "no progress, giving up");
                self.shared.fail(TorrentFailure::Timeout);
                return Ok(());
            }
            self.handle_expired_requests(&cfg);
            self.request_pieces(&cfg);
        }
    }

    fn handle_expired_requests(&self, cfg: &SchedulerConfig) {
        let now = Instant::now();
        let mut reissue = Vec::new();
        let mut close = HashSet::new();
        {
            let mut g = self.locked.write();
            for (index, peer_id) in g.dispatcher.expired_requests(now, cfg.request_timeout) {
                let alt = g.dispatcher.reassign_expired(index, &peer_id, now);
                let strikes = g.strikes.entry(peer_id).or_default();
                *strikes += 1;
                debug!(piece = index, %peer_id, strikes = *strikes, reissued_to = ?alt, "request timed out");
                if *strikes >= cfg.max_request_timeouts {
                    close.insert(peer_id);
                }
                match alt {
                    Some(alt) => reissue.push((alt, index)),
                    None => {
                        close.insert(peer_id);
                    }
                }
            }
        }
        for (alt, index) in reissue {
            let piece = PieceRef {
                digest: self.digest(),
                index,
            };
            self.send_to(&alt, WriterRequest::Message(Message::PieceRequest(piece)));
        }
        for peer_id in close {
            self.send_to(&peer_id, WriterRequest::Disconnect(Err(Error::RequestTimeout)));
        }
    }

    fn request_pieces(&self, cfg: &SchedulerConfig) {
        let active: Vec<PeerId> = self
            .peers
            .read()
            .iter()
            .filter(|(_, p)| p.state == PeerConnState::Active)
            .map(|(id, _)| *id)
            .collect();
        if active.is_empty() {
            return;
        }
        let now = Instant::now();
        let mut requests = Vec::new();
        {
            let mut g = self.locked.write();
            for peer_id in active {
                let pieces = g.dispatcher.next_requests(
                    &peer_id,
                    cfg.pipeline_limit,
                    cfg.piece_selection,
                    now,
                );
                if !pieces.is_empty() {
                    requests.push((peer_id, pieces));
                }
            }
        }
        for (peer_id, pieces) in requests {
            trace!(%peer_id, ?pieces, "requesting");
            for index in pieces {
                let piece = PieceRef {
                    digest: self.digest(),
                    index,
                };
                self.send_to(&peer_id, WriterRequest::Message(Message::PieceRequest(piece)));
            }
        }
    }

    fn on_piece_payload(
        &self,
        peer_id: PeerId,
        index: ValidPieceIndex,
        payload: Bytes,
        counters: &PeerCounters,
    ) -> Result<()> {
        if !self
            .locked
            .write()
            .dispatcher
            .on_piece_received(&peer_id, index.get())
        {
            trace!(piece = index.get(), "ignoring piece we didn't ask for");
            return Ok(());
        }

        let ctx = &self.shared.ctx;
        let digest = self.digest();
        let len = payload.len() as u64;
        let valid = len == self.lengths.piece_length(index) as u64
            && ctx
                .spawner
                .spawn_block_in_place(|| ctx.store.verify_piece(&digest, index, &payload));
        if !valid {
            warn!(piece = index.get(), %peer_id, "piece failed verification");
            self.locked
                .write()
                .dispatcher
                .on_hash_mismatch(&peer_id, index.get());
            self.notify_dispatcher();
            return Err(Error::HashMismatch(index.get()));
        }

        ctx.spawner
            .spawn_block_in_place(|| ctx.store.write_piece(&digest, index, payload))
            .map_err(Error::Store)?;

        let complete = {
            let mut g = self.locked.write();
            if !g.dispatcher.mark_verified(index.get()) {
                return Ok(());
            }
            g.dispatcher.is_complete()
        };
        *self.last_progress.lock() = Instant::now();
        self.downloaded_bytes.fetch_add(len, Ordering::Relaxed);
        counters.on_piece_received();
        debug!(piece = index.get(), %peer_id, "piece verified");

        self.broadcast(Message::AnnouncePiece(index.get()));
        if complete {
            self.on_completed();
        } else {
            self.notify_dispatcher();
        }
        Ok(())
    }

    pub fn on_completed(&self) {
        if self.shared.mark_complete() {
            info!(digest = %self.digest(), "torrent complete");
        }
        *self.last_peer_activity.lock() = Instant::now();

        // Nothing to exchange with peers that are complete too.
        let peer_ids: Vec<PeerId> = self.peers.read().keys().copied().collect();
        let complete_peers: Vec<PeerId> = {
            let g = self.locked.read();
            peer_ids
                .into_iter()
                .filter(|p| g.dispatcher.peer_has_everything(p))
                .collect()
        };
        for peer_id in complete_peers {
            self.send_to(&peer_id, WriterRequest::Disconnect(Ok(())));
        }
    }

    pub fn stats(&self, state: TorrentState) -> TorrentStats {
        let mut peers: Vec<PeerStats> = self
            .peers
            .read()
            .iter()
            .map(|(peer_id, p)| PeerStats {
                peer_id: *peer_id,
                addr: p.addr,
                state: p.state,
                outgoing: p.outgoing,
                bytes_sent: p.counters.bytes_sent.load(Ordering::Relaxed),
                bytes_received: p.counters.bytes_received.load(Ordering::Relaxed),
                pieces_received: p.counters.pieces_received.load(Ordering::Relaxed),
                pieces_uploaded: p.counters.pieces_uploaded.load(Ordering::Relaxed),
                payload_uploaded: p.counters.payload_uploaded.load(Ordering::Relaxed),
                outstanding_requests: 0,
                connected_for: p.connected_at.elapsed(),
                idle: p.counters.last_received().elapsed(),
            })
            .collect();
        let have_pieces = {
            let g = self.locked.read();
            for p in peers.iter_mut() {
                p.outstanding_requests = g.dispatcher.outstanding(&p.peer_id);
            }
            g.dispatcher.have().count_ones() as u32
        };
        TorrentStats {
            digest: self.digest(),
            state,
            total_pieces: self.lengths.total_pieces(),
            have_pieces,
            length: self.meta.length,
            downloaded_bytes: self.downloaded_bytes.load(Ordering::Relaxed),
            peers,
        }
    }
}

pub(crate) struct PeerHandler {
    live: Arc<TorrentStateLive>,
    peer_id: PeerId,
    tx: tokio::sync::mpsc::UnboundedSender<WriterRequest>,
    counters: Arc<PeerCounters>,
}

impl PeerHandler {
    fn protocol_error(msg: &str) -> Error {
        Error::Protocol(MessageDeserializeError::Other(anyhow::anyhow!(
            msg.to_owned()
        )))
    }

    fn on_piece_request(&self, piece: PieceRef) {
        let live = &self.live;
        let index = (piece.digest == live.digest())
            .then(|| live.lengths.validate_piece_index(piece.index))
            .flatten()
            .filter(|idx| live.locked.read().dispatcher.have()[idx.get() as usize]);
        let req = match index {
            Some(index) => WriterRequest::ServePiece(index),
            None => WriterRequest::Message(Message::PieceNotFound(piece)),
        };
        let _ = self.tx.send(req);
    }
}

impl PeerConnectionHandler for PeerHandler {
    fn on_connected(&self, connection_time: Duration) {
        trace!(?connection_time, "connected");
    }

    fn our_handshake(&self) -> Handshake {
        self.live.our_handshake()
    }

    fn on_handshake(&self, handshake: &Handshake) -> Result<()> {
        let live = &self.live;
        if handshake.num_pieces != live.lengths.total_pieces() {
            return Err(Error::InvalidHandshake(anyhow::anyhow!(
                "peer has {} pieces, expected {}",
                handshake.num_pieces,
                live.lengths.total_pieces()
            )));
        }
        let bitfield = BF::from_vec(handshake.bitfield.to_vec());
        let both_complete = {
            let mut g = live.locked.write();
            g.dispatcher.add_peer(self.peer_id, bitfield);
            g.dispatcher.is_complete() && g.dispatcher.peer_has_everything(&self.peer_id)
        };
        if both_complete {
            return Err(Error::Disconnect);
        }
        if let Some(p) = live.peers.write().get_mut(&self.peer_id) {
            p.state = PeerConnState::Active;
        }
        live.notify_dispatcher();
        Ok(())
    }

    fn on_received_message(&self, msg: Message) -> Result<()> {
        let live = &self.live;
        match msg {
            Message::KeepAlive => {}
            Message::PieceRequest(piece) => self.on_piece_request(piece),
            Message::PiecePayload { piece, payload } => {
                if piece.digest != live.digest() {
                    return Err(Self::protocol_error("payload for another digest"));
                }
                let index = live
                    .lengths
                    .validate_piece_index(piece.index)
                    .ok_or_else(|| Self::protocol_error("payload for invalid piece"))?;
                live.on_piece_payload(self.peer_id, index, payload, &self.counters)?;
            }
            Message::PieceNotFound(piece) => {
                if piece.digest == live.digest() {
                    live.locked
                        .write()
                        .dispatcher
                        .on_not_found(&self.peer_id, piece.index);
                    live.notify_dispatcher();
                }
            }
            Message::AnnouncePiece(index) => {
                let (changed, both_complete) = {
                    let mut g = live.locked.write();
                    let changed = g.dispatcher.on_peer_has(&self.peer_id, index);
                    (
                        changed,
                        g.dispatcher.is_complete()
                            && g.dispatcher.peer_has_everything(&self.peer_id),
                    )
                };
                if both_complete {
                    return Err(Error::Disconnect);
                }
                if changed {
                    live.notify_dispatcher();
                }
            }
        }
        Ok(())
    }

    fn read_piece(&self, index: ValidPieceIndex) -> Result<Option<Bytes>> {
        self.live
            .shared
            .ctx
            .store
            .read_piece(&self.live.digest(), index)
            .map_err(Error::Store)
    }
}
