// A torrent is one download (or seed) of one digest.
//
// ManagedTorrent is the registry entry. It resolves the metainfo, then hands
// over to TorrentStateLive, which owns the connections and the dispatcher.
// Every caller waiting for the blob watches the same status channel.

pub(crate) mod dispatcher;
pub(crate) mod live;
pub(crate) mod peer;

use std::{net::SocketAddr, sync::Arc, time::Duration};

use arc_swap::ArcSwap;
use backon::{ExponentialBuilder, Retryable};
use kraken_core::{
    Digest, PeerId,
    lengths::Lengths,
    metainfo::MetaInfo,
    spawn_utils::{BlockingSpawner, spawn_with_cancel},
};
use parking_lot::RwLock;
use serde::Serialize;
use serde_with::{DurationMilliSeconds, serde_as};
use tokio::sync::{mpsc::UnboundedSender, watch};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error_span, info, warn};

use crate::{
    config::SchedulerConfig,
    connstate::ConnStateTracker,
    error::TorrentFailure,
    scheduler::SchedulerEvent,
    type_aliases::{BF, PeerDiscoveryRef, PieceStoreRef},
};

pub use peer::PeerConnState;

use self::live::TorrentStateLive;

pub type TorrentId = usize;

#[derive(Debug, Clone)]
pub enum TorrentStatus {
    Running,
    Complete,
    Failed(TorrentFailure),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TorrentState {
    Initializing,
    Downloading,
    Seeding,
    Failed,
}

#[serde_as]
#[derive(Debug, Clone, Serialize)]
pub struct PeerStats {
    pub peer_id: PeerId,
    pub addr: SocketAddr,
    pub state: PeerConnState,
    pub outgoing: bool,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub pieces_received: u32,
    pub pieces_uploaded: u32,
    pub payload_uploaded: u64,
    pub outstanding_requests: usize,
    #[serde_as(as = "DurationMilliSeconds")]
    pub connected_for: Duration,
    #[serde_as(as = "DurationMilliSeconds")]
    pub idle: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct TorrentStats {
    pub digest: Digest,
    pub state: TorrentState,
    pub total_pieces: u32,
    pub have_pieces: u32,
    pub length: u64,
    pub downloaded_bytes: u64,
    pub peers: Vec<PeerStats>,
}

/// Everything torrents share with the scheduler.
pub(crate) struct TorrentContext {
    pub peer_id: PeerId,
    pub store: PieceStoreRef,
    pub discovery: PeerDiscoveryRef,
    pub connstate: Arc<ConnStateTracker>,
    pub config: Arc<ArcSwap<SchedulerConfig>>,
    pub spawner: BlockingSpawner,
    pub events: UnboundedSender<SchedulerEvent>,
}

impl TorrentContext {
    /// The config snapshot for the next decision.
    pub fn config(&self) -> Arc<SchedulerConfig> {
        self.config.load_full()
    }
}

pub(crate) struct ManagedTorrentShared {
    pub id: TorrentId,
    pub digest: Digest,
    pub ctx: Arc<TorrentContext>,
    status_tx: watch::Sender<TorrentStatus>,
    /// Cancels everything, connections included.
    pub cancellation_token: CancellationToken,
    /// Child of `cancellation_token`. Cancels discovery, dispatch and connection attempts only.
    pub loops_token: CancellationToken,
    pub tasks: TaskTracker,
}

impl ManagedTorrentShared {
    pub fn status(&self) -> TorrentStatus {
        self.status_tx.borrow().clone()
    }

    // Only a running torrent changes its status.
    fn transition(&self, to: TorrentStatus) -> bool {
        self.status_tx.send_if_modified(|s| {
            if matches!(s, TorrentStatus::Running) {
                *s = to;
                return true;
            }
            false
        })
    }

    pub fn mark_complete(&self) -> bool {
        self.transition(TorrentStatus::Complete)
    }

    /// Releases waiters with the failure and stops the torrent. The scheduler drops it from
    /// the registry.
    pub fn fail(&self, failure: TorrentFailure) {
        if !self.transition(TorrentStatus::Failed(failure.clone())) {
            return;
        }
        warn!(digest = %self.digest, ?failure, "torrent failed");
        self.cancellation_token.cancel();
        let _ = self.ctx.events.send(SchedulerEvent::TorrentDone {
            digest: self.digest,
            id: self.id,
        });
    }

    pub fn spawn(
        &self,
        span: tracing::Span,
        token: CancellationToken,
        fut: impl std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    ) {
        spawn_with_cancel(span, token, self.tasks.track_future(fut));
    }
}

enum ManagedTorrentState {
    Initializing,
    Live(Arc<TorrentStateLive>),
    Stopped,
}

pub(crate) struct ManagedTorrent {
    pub shared: Arc<ManagedTorrentShared>,
    state: RwLock<ManagedTorrentState>,
}

impl ManagedTorrent {
    fn new_with_state(
        id: TorrentId,
        digest: Digest,
        ctx: Arc<TorrentContext>,
        parent_token: &CancellationToken,
        status: TorrentStatus,
    ) -> Self {
        let cancellation_token = parent_token.child_token();
        let loops_token = cancellation_token.child_token();
        let (status_tx, _) = watch::channel(status);
        ManagedTorrent {
            shared: Arc::new(ManagedTorrentShared {
                id,
                digest,
                ctx,
                status_tx,
                cancellation_token,
                loops_token,
                tasks: TaskTracker::new(),
            }),
            state: RwLock::new(ManagedTorrentState::Initializing),
        }
    }

    pub fn new(
        id: TorrentId,
        digest: Digest,
        ctx: Arc<TorrentContext>,
        parent_token: &CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self::new_with_state(
            id,
            digest,
            ctx,
            parent_token,
            TorrentStatus::Running,
        ))
    }

    /// A torrent for a blob we have in full. It is live right away.
    pub fn new_seeding(
        id: TorrentId,
        meta: MetaInfo,
        lengths: Lengths,
        have: BF,
        ctx: Arc<TorrentContext>,
        parent_token: &CancellationToken,
    ) -> Arc<Self> {
        let t = Self::new_with_state(id, meta.digest, ctx, parent_token, TorrentStatus::Complete);
        let live = TorrentStateLive::new(t.shared.clone(), meta, lengths, have);
        *t.state.write() = ManagedTorrentState::Live(live.clone());
        live.on_completed();
        Arc::new(t)
    }

    pub fn digest(&self) -> Digest {
        self.shared.digest
    }

    pub fn id(&self) -> TorrentId {
        self.shared.id
    }

    pub fn status(&self) -> TorrentStatus {
        self.shared.status()
    }

    pub fn subscribe(&self) -> watch::Receiver<TorrentStatus> {
        self.shared.status_tx.subscribe()
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status(), TorrentStatus::Failed(_))
    }

    pub fn live(&self) -> Option<Arc<TorrentStateLive>> {
        match &*self.state.read() {
            ManagedTorrentState::Live(l) => Some(l.clone()),
            _ => None,
        }
    }

    pub fn metainfo(&self) -> Option<MetaInfo> {
        self.live().map(|l| l.metainfo().clone())
    }

    pub fn start(self: &Arc<Self>) {
        let span = error_span!(parent: None, "torrent", digest = %self.digest());
        self.shared.spawn(
            span,
            self.shared.loops_token.clone(),
            self.clone().task_initialize(),
        );
    }

    async fn resolve_metainfo(&self, cfg: &SchedulerConfig) -> Result<MetaInfo, TorrentFailure> {
        let ctx = &self.shared.ctx;
        let digest = self.digest();
        let local = ctx
            .spawner
            .spawn_block_in_place(|| ctx.store.metainfo(&digest));
        if let Some(meta) = local {
            debug!("using local metainfo");
            return Ok(meta);
        }
        let fetch = (|| ctx.discovery.get_metainfo(&digest))
            .retry(
                ExponentialBuilder::new()
                    .without_max_times()
                    .with_jitter()
                    .with_min_delay(Duration::from_millis(100))
                    .with_max_delay(cfg.discovery_interval),
            )
            .notify(|err, retry_in| debug!(?retry_in, "error fetching metainfo: {err:#}"));
        match tokio::time::timeout(cfg.stall_timeout, fetch).await {
            Err(_) => Err(TorrentFailure::Timeout),
            Ok(Err(e)) => Err(TorrentFailure::Other(Arc::new(e))),
            Ok(Ok(None)) => Err(TorrentFailure::NotFound),
            Ok(Ok(Some(meta))) => Ok(meta),
        }
    }

    async fn task_initialize(self: Arc<Self>) -> anyhow::Result<()> {
        let cfg = self.shared.ctx.config();
        let meta = match self.resolve_metainfo(&cfg).await {
            Ok(meta) => meta,
            Err(failure) => {
                self.shared.fail(failure);
                return Ok(());
            }
        };
        if meta.digest != self.digest() {
            self.shared.fail(TorrentFailure::Other(Arc::new(anyhow::anyhow!(
                "metainfo is for another digest: {}",
                meta.digest
            ))));
            return Ok(());
        }
        let lengths = match meta.lengths() {
            Ok(l) => l,
            Err(e) => {
                self.shared
                    .fail(TorrentFailure::Other(Arc::new(anyhow::anyhow!(
                        "invalid metainfo: {e:#}"
                    ))));
                return Ok(());
            }
        };

        let ctx = &self.shared.ctx;
        let have = ctx.spawner.spawn_block_in_place(|| {
            ctx.store.create(&meta)?;
            ctx.store.have_pieces(&meta.digest)
        });
        let mut have = match have {
            Ok(have) => have,
            Err(e) => {
                self.shared.fail(TorrentFailure::Other(Arc::new(e)));
                return Ok(());
            }
        };
        have.resize(lengths.total_pieces() as usize, false);
        info!(
            pieces = lengths.total_pieces(),
            have = have.count_ones(),
            length = meta.length,
            "initialized"
        );

        let live = TorrentStateLive::new(self.shared.clone(), meta, lengths, have);
        {
            let mut g = self.state.write();
            if matches!(*g, ManagedTorrentState::Stopped) {
                return Ok(());
            }
            *g = ManagedTorrentState::Live(live.clone());
        }
        if live.is_complete() {
            live.on_completed();
        } else {
            live.start();
        }
        Ok(())
    }

    /// Fails the waiters (if still running) and kills every task of the torrent.
    pub fn cancel(&self, failure: TorrentFailure) {
        self.shared.transition(TorrentStatus::Failed(failure));
        self.shared.cancellation_token.cancel();
    }

    /// First step of a graceful shutdown: stop making decisions and ask every connection
    /// to close.
    pub fn begin_drain(&self, failure: TorrentFailure) {
        self.shared.transition(TorrentStatus::Failed(failure));
        self.shared.loops_token.cancel();
        if let Some(live) = self.live() {
            live.disconnect_all();
        }
    }

    /// Returns false if the tasks didn't finish in time.
    pub async fn wait_for_tasks(&self, timeout: Duration) -> bool {
        self.shared.tasks.close();
        tokio::time::timeout(timeout, self.shared.tasks.wait())
            .await
            .is_ok()
    }

    /// Drops all state, releasing connection slots still held.
    pub fn release(&self) {
        let prev = std::mem::replace(&mut *self.state.write(), ManagedTorrentState::Stopped);
        if let ManagedTorrentState::Live(live) = prev {
            live.clear_peers();
        }
    }

    /// A complete torrent nobody has been connected to for `idle_timeout`.
    pub fn is_idle_seeder(&self, idle_timeout: Duration) -> bool {
        matches!(self.status(), TorrentStatus::Complete)
            && self.live().is_some_and(|l| l.idle_for() >= idle_timeout)
    }

    pub fn stats(&self) -> TorrentStats {
        let state = match (self.status(), self.live().is_some()) {
            (TorrentStatus::Failed(_), _) => TorrentState::Failed,
            (TorrentStatus::Complete, _) => TorrentState::Seeding,
            (TorrentStatus::Running, true) => TorrentState::Downloading,
            (TorrentStatus::Running, false) => TorrentState::Initializing,
        };
        match self.live() {
            Some(live) => live.stats(state),
            None => TorrentStats {
                digest: self.digest(),
                state,
                total_pieces: 0,
                have_pieces: 0,
                length: 0,
                downloaded_bytes: 0,
                peers: Vec::new(),
            },
        }
    }
}
