use std::{
    collections::HashMap,
    net::{Ipv4Addr, SocketAddr},
    path::Path,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::Context;
use arc_swap::ArcSwap;
use kraken_core::{
    Digest, PeerId,
    peer_id::{KRAKEN_CLIENT_CODE, generate_azureus_style},
    spawn_utils::{BlockingSpawner, spawn_with_cancel},
};
use parking_lot::RwLock;
use peer_protocol::Handshake;
use tokio::{
    net::TcpListener,
    sync::{
        mpsc::{UnboundedReceiver, unbounded_channel},
        oneshot,
    },
    time::Instant,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error_span, info, warn};

use crate::{
    blob::write_blob,
    config::SchedulerConfig,
    connstate::{BlacklistedConn, ConnStateTracker},
    discovery::PeerDiscovery,
    error::{Error, Result, TorrentFailure},
    peer_connection::HandshakeFramed,
    piece_store::PieceStore,
    torrent::{ManagedTorrent, TorrentContext, TorrentId, TorrentStats, TorrentStatus},
};

// How long force-closed tasks get to unwind after the drain deadline.
const FORCE_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

pub struct SchedulerOptions {
    /// Where to accept peer connections. Port 0 picks a free one.
    pub listen_addr: SocketAddr,
    /// Random if not set.
    pub peer_id: Option<PeerId>,
    pub spawner: Option<BlockingSpawner>,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            listen_addr: (Ipv4Addr::LOCALHOST, 0).into(),
            peer_id: None,
            spawner: None,
        }
    }
}

#[derive(Debug)]
pub(crate) enum SchedulerEvent {
    Probe(oneshot::Sender<()>),
    TorrentDone { digest: Digest, id: TorrentId },
}

pub struct Scheduler {
    peer_id: PeerId,
    listen_addr: SocketAddr,
    ctx: Arc<TorrentContext>,

    torrents: RwLock<HashMap<Digest, Arc<ManagedTorrent>>>,
    next_id: AtomicUsize,
    stopped: AtomicBool,

    cancellation_token: CancellationToken,
    tasks: TaskTracker,
}

impl Scheduler {
    pub async fn new(
        config: SchedulerConfig,
        store: Arc<dyn PieceStore>,
        discovery: Arc<dyn PeerDiscovery>,
        opts: SchedulerOptions,
    ) -> anyhow::Result<Arc<Self>> {
        let peer_id = opts
            .peer_id
            .unwrap_or_else(|| generate_azureus_style(KRAKEN_CLIENT_CODE, (0, 1, 0, 0)));
        let listener = TcpListener::bind(opts.listen_addr)
            .await
            .with_context(|| format!("error binding {}", opts.listen_addr))?;
        let listen_addr = listener.local_addr()?;
        info!(%listen_addr, %peer_id, "listening for incoming peer connections");

        let (events_tx, events_rx) = unbounded_channel();
        let ctx = Arc::new(TorrentContext {
            peer_id,
            store,
            discovery,
            connstate: ConnStateTracker::new(),
            config: Arc::new(ArcSwap::from_pointee(config.sanitized())),
            spawner: opts
                .spawner
                .unwrap_or_else(BlockingSpawner::from_current_runtime),
            events: events_tx,
        });

        let scheduler = Arc::new(Self {
            peer_id,
            listen_addr,
            ctx,
            torrents: RwLock::new(HashMap::new()),
            next_id: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
            cancellation_token: CancellationToken::new(),
            tasks: TaskTracker::new(),
        });

        scheduler.spawn(
            error_span!(parent: None, "scheduler_event_loop"),
            Self::task_event_loop(Arc::downgrade(&scheduler), events_rx),
        );
        scheduler.spawn(
            error_span!(parent: None, "listener", addr = %listen_addr),
            crate::listen::task_listener(Arc::downgrade(&scheduler), listener),
        );
        Ok(scheduler)
    }

    pub(crate) fn spawn(
        &self,
        span: tracing::Span,
        fut: impl std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    ) {
        spawn_with_cancel(
            span,
            self.cancellation_token.clone(),
            self.tasks.track_future(fut),
        );
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub fn config(&self) -> Arc<SchedulerConfig> {
        self.ctx.config()
    }

    pub(crate) fn handshake_timeout(&self) -> Duration {
        self.ctx.config().handshake_timeout
    }

    /// Open connections across all torrents.
    pub fn num_connections(&self) -> usize {
        self.ctx.connstate.num_active()
    }

    pub fn num_connections_for(&self, digest: &Digest) -> usize {
        self.ctx.connstate.num_active_for(digest)
    }

    pub fn stats(&self, digest: &Digest) -> Option<TorrentStats> {
        let t = self.torrents.read().get(digest).cloned();
        t.map(|t| t.stats())
    }

    pub fn all_stats(&self) -> Vec<TorrentStats> {
        let torrents: Vec<_> = self.torrents.read().values().cloned().collect();
        let mut stats: Vec<_> = torrents.iter().map(|t| t.stats()).collect();
        stats.sort_by_key(|s| s.digest);
        stats
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn next_id(&self) -> TorrentId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn get_live_torrent(&self, digest: &Digest) -> Option<Arc<ManagedTorrent>> {
        self.torrents
            .read()
            .get(digest)
            .filter(|t| !t.is_failed())
            .cloned()
    }

    fn get_or_create(&self, digest: Digest) -> Result<Arc<ManagedTorrent>> {
        if self.is_stopped() {
            return Err(Error::ShuttingDown);
        }
        if let Some(t) = self.get_live_torrent(&digest) {
            return Ok(t);
        }
        let t = {
            let mut g = self.torrents.write();
            if self.is_stopped() {
                return Err(Error::ShuttingDown);
            }
            if let Some(t) = g.get(&digest)
                && !t.is_failed()
            {
                return Ok(t.clone());
            }
            let t = ManagedTorrent::new(
                self.next_id(),
                digest,
                self.ctx.clone(),
                &self.cancellation_token,
            );
            if let Some(old) = g.insert(digest, t.clone()) {
                old.release();
            }
            t
        };
        info!(%digest, id = t.id(), "added torrent");
        t.start();
        Ok(t)
    }

    /// Downloads the blob and writes it to `dest`.
    ///
    /// Concurrent calls for the same digest share one torrent and see the same outcome.
    pub async fn download(&self, digest: Digest, dest: &Path) -> Result<()> {
        let t = self.get_or_create(digest)?;
        let mut rx = t.subscribe();
        let status = rx
            .wait_for(|s| !matches!(s, TorrentStatus::Running))
            .await
            .map(|s| s.clone());
        match status {
            Err(_) => return Err(Error::ShuttingDown),
            Ok(TorrentStatus::Failed(f)) => return Err(f.into()),
            Ok(_) => {}
        }
        // Removed between completion and now.
        let meta = t.metainfo().ok_or(Error::Cancelled)?;
        if let Err(e) = write_blob(&*self.ctx.store, self.ctx.spawner, &meta, dest).await {
            // The store may have lost the blob to a concurrent remove.
            if t.live().is_none() {
                debug!(%digest, "torrent removed while writing blob: {e:#}");
                return Err(Error::Cancelled);
            }
            return Err(e.into());
        }
        info!(%digest, ?dest, "download complete");
        Ok(())
    }

    /// Cancels the torrent and drops the local copy. Succeeds if there is no such torrent.
    pub async fn remove_torrent(&self, digest: Digest) -> Result<()> {
        let removed = self.torrents.write().remove(&digest);
        if let Some(t) = removed {
            t.cancel(TorrentFailure::Cancelled);
            if !t.wait_for_tasks(self.ctx.config().drain_timeout).await {
                warn!(%digest, "torrent tasks didn't finish in time");
            }
            t.release();
            info!(%digest, "removed torrent");
        } else {
            debug!(%digest, "no torrent to remove");
        }
        let store = &self.ctx.store;
        self.ctx
            .spawner
            .spawn_block_in_place(|| store.remove(&digest))
            .map_err(Error::Store)
    }

    /// Installs a new config. Running torrents pick it up at their next decision.
    pub fn reload(&self, config: SchedulerConfig) {
        self.ctx.config.store(Arc::new(config.sanitized()));
        info!("config reloaded");
    }

    /// Round-trips a no-op event through the event loop.
    pub async fn probe(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.ctx
            .events
            .send(SchedulerEvent::Probe(tx))
            .map_err(|_| Error::Unresponsive)?;
        match tokio::time::timeout(self.ctx.config().probe_timeout, rx).await {
            Ok(Ok(())) => Ok(()),
            _ => Err(Error::Unresponsive),
        }
    }

    pub fn blacklist_snapshot(&self) -> Result<Vec<BlacklistedConn>> {
        Ok(self.ctx.connstate.snapshot())
    }

    /// Fails every pending download, closes every connection and waits for the torrents to
    /// release their resources. Connections still open after the drain timeout are dropped.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let torrents: Vec<_> = self.torrents.write().drain().map(|(_, t)| t).collect();
        info!(torrents = torrents.len(), "stopping");

        for t in &torrents {
            t.begin_drain(TorrentFailure::ShuttingDown);
        }
        let drain_timeout = self.ctx.config().drain_timeout;
        let drained =
            futures::future::join_all(torrents.iter().map(|t| t.wait_for_tasks(drain_timeout)))
                .await;
        let stragglers = drained.iter().filter(|ok| !**ok).count();
        if stragglers > 0 {
            warn!(stragglers, "drain timeout expired, force-closing connections");
        }

        self.cancellation_token.cancel();
        futures::future::join_all(
            torrents
                .iter()
                .map(|t| t.wait_for_tasks(FORCE_CLOSE_TIMEOUT)),
        )
        .await;
        for t in &torrents {
            t.release();
        }
        self.tasks.close();
        if tokio::time::timeout(FORCE_CLOSE_TIMEOUT, self.tasks.wait())
            .await
            .is_err()
        {
            warn!("scheduler tasks didn't finish in time");
        }
        info!(connections = self.num_connections(), "stopped");
    }

    /// Hands a connection that sent its handshake to the torrent for its digest. Blobs we
    /// hold in full get a seeding torrent on demand.
    pub(crate) fn attach_incoming(
        &self,
        addr: SocketAddr,
        handshake: Handshake,
        framed: HandshakeFramed,
    ) -> Result<()> {
        if self.is_stopped() {
            return Err(Error::ShuttingDown);
        }
        let digest = handshake.digest;
        let t = match self.get_live_torrent(&digest) {
            Some(t) => t,
            None => self.try_create_seeder(digest)?.ok_or(Error::NotFound)?,
        };
        let live = t
            .live()
            .ok_or_else(|| anyhow::anyhow!("torrent is not ready for connections"))?;
        live.add_incoming_peer(addr, handshake, framed)
    }

    fn try_create_seeder(&self, digest: Digest) -> Result<Option<Arc<ManagedTorrent>>> {
        let store = &self.ctx.store;
        let found = self.ctx.spawner.spawn_block_in_place(|| {
            let Some(meta) = store.metainfo(&digest) else {
                return Ok(None);
            };
            store.have_pieces(&digest).map(|have| Some((meta, have)))
        });
        let Some((meta, mut have)) = found.map_err(Error::Store)? else {
            return Ok(None);
        };
        let lengths = meta.lengths().map_err(anyhow::Error::from)?;
        have.resize(lengths.total_pieces() as usize, false);
        if !have.all() {
            return Ok(None);
        }

        let t = {
            let mut g = self.torrents.write();
            if self.is_stopped() {
                return Err(Error::ShuttingDown);
            }
            if let Some(t) = g.get(&digest)
                && !t.is_failed()
            {
                return Ok(Some(t.clone()));
            }
            let t = ManagedTorrent::new_seeding(
                self.next_id(),
                meta,
                lengths,
                have,
                self.ctx.clone(),
                &self.cancellation_token,
            );
            if let Some(old) = g.insert(digest, t.clone()) {
                old.release();
            }
            t
        };
        info!(%digest, id = t.id(), "seeding");
        Ok(Some(t))
    }

    fn on_event(&self, event: SchedulerEvent) {
        match event {
            SchedulerEvent::Probe(tx) => {
                let _ = tx.send(());
            }
            SchedulerEvent::TorrentDone { digest, id } => {
                let removed = {
                    let mut g = self.torrents.write();
                    match g.get(&digest) {
                        Some(t) if t.id() == id => g.remove(&digest),
                        _ => None,
                    }
                };
                if let Some(t) = removed {
                    debug!(%digest, id, "dropping finished torrent");
                    t.release();
                }
            }
        }
    }

    fn sweep(&self) {
        let cfg = self.ctx.config();
        let purged = self.ctx.connstate.sweep(&cfg.blacklist);
        if purged > 0 {
            debug!(purged, "purged expired blacklist entries");
        }

        let torrents: Vec<Arc<ManagedTorrent>> = self.torrents.read().values().cloned().collect();
        let candidates: Vec<(Digest, TorrentId)> = torrents
            .iter()
            .filter(|t| t.is_idle_seeder(cfg.seeder_idle_timeout))
            .map(|t| (t.digest(), t.id()))
            .collect();
        if candidates.is_empty() {
            return;
        }
        let idle: Vec<Arc<ManagedTorrent>> = {
            let mut g = self.torrents.write();
            candidates
                .iter()
                .filter_map(|(digest, id)| match g.get(digest) {
                    Some(t) if t.id() == *id => g.remove(digest),
                    _ => None,
                })
                .collect()
        };
        for t in idle {
            info!(digest = %t.digest(), "evicting idle seeder");
            t.cancel(TorrentFailure::Cancelled);
            t.release();
        }
    }

    async fn task_event_loop(
        this: Weak<Self>,
        mut rx: UnboundedReceiver<SchedulerEvent>,
    ) -> anyhow::Result<()> {
        let mut next_sweep = match this.upgrade() {
            Some(s) => Instant::now() + s.ctx.config().sweep_interval,
            None => return Ok(()),
        };
        loop {
            tokio::select! {
                event = rx.recv() => {
                    let Some(event) = event else {
                        return Ok(());
                    };
                    let Some(this) = this.upgrade() else {
                        return Ok(());
                    };
                    this.on_event(event);
                }
                _ = tokio::time::sleep_until(next_sweep) => {
                    let Some(this) = this.upgrade() else {
                        return Ok(());
                    };
                    this.sweep();
                    next_sweep = Instant::now() + this.ctx.config().sweep_interval;
                }
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.cancellation_token.cancel();
    }
}
