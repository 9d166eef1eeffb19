use std::{
    sync::{Arc, mpsc},
    time::Duration,
};

use anyhow::bail;
use bytes::Bytes;
use kraken_core::{Digest, PeerId, hash_id::Id32, lengths::ValidPieceIndex, metainfo::MetaInfo};
use parking_lot::Mutex;
use tokio::time::{Instant, timeout};

use crate::{
    BF, BlacklistCause, BlacklistConfig, BlacklistPolicy, Error, InMemoryPieceStore, PeerInfo,
    PieceStore, Scheduler, SchedulerConfig, SchedulerOptions, StaticPeerDiscovery, TorrentState,
    tests::{
        fake_peer::{Behavior, FakePeer, FakePeerOpts},
        test_util::{fast_config, random_blob, setup_test_logging, wait_until},
    },
};

const PIECE_LENGTH: u32 = 1024;

async fn new_scheduler(config: SchedulerConfig, discovery: Arc<StaticPeerDiscovery>) -> Arc<Scheduler> {
    Scheduler::new(
        config,
        Arc::new(InMemoryPieceStore::new()),
        discovery,
        SchedulerOptions::default(),
    )
    .await
    .unwrap()
}

fn blob_and_meta(len: usize) -> (Bytes, MetaInfo) {
    let blob = random_blob(len);
    let meta = MetaInfo::from_blob(&blob, PIECE_LENGTH).unwrap();
    (blob, meta)
}

fn discovery_with(peers: Vec<PeerInfo>, meta: &MetaInfo) -> Arc<StaticPeerDiscovery> {
    let discovery = Arc::new(StaticPeerDiscovery::new(peers));
    discovery.add_metainfo(meta.clone());
    discovery
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stalled_requests_are_reissued_and_peer_blacklisted() {
    setup_test_logging();

    let (blob, meta) = blob_and_meta(PIECE_LENGTH as usize * 4 - 100);
    let digest = meta.digest;
    assert_eq!(meta.total_pieces(), 4);

    // p1 has pieces 1 and 2 but never answers. p2 starts with 0 and 3 and gets 1 and 2
    // shortly after.
    let p1 = FakePeer::start(
        "p1",
        FakePeerOpts {
            have: vec![1, 2],
            ..FakePeerOpts::seeder(&meta, &blob, Behavior::IgnoreRequests)
        },
    )
    .await;
    let p2 = FakePeer::start(
        "p2",
        FakePeerOpts {
            have: vec![0, 3],
            announce_later: vec![1, 2],
            announce_after: Duration::from_millis(100),
            ..FakePeerOpts::seeder(&meta, &blob, Behavior::Serve)
        },
    )
    .await;

    let scheduler = new_scheduler(fast_config(), discovery_with(vec![p1.info(), p2.info()], &meta)).await;
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("blob");

    timeout(Duration::from_secs(10), scheduler.download(digest, &dest))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(std::fs::read(&dest).unwrap(), blob);

    let mut p1_requests = p1.requests();
    p1_requests.sort();
    p1_requests.dedup();
    assert_eq!(p1_requests, vec![1, 2]);
    let p2_requests = p2.requests();
    assert!(p2_requests.contains(&1), "{p2_requests:?}");
    assert!(p2_requests.contains(&2), "{p2_requests:?}");

    wait_until(
        || {
            let snapshot = scheduler.blacklist_snapshot()?;
            match snapshot.iter().find(|e| e.peer_id == p1.peer_id) {
                Some(e) if e.cause == BlacklistCause::RequestTimeout && e.digest == digest => Ok(()),
                other => bail!("p1 not blacklisted for request timeouts: {other:?}"),
            }
        },
        Duration::from_secs(5),
    )
    .await
    .unwrap();
    assert!(
        scheduler
            .blacklist_snapshot()
            .unwrap()
            .iter()
            .all(|e| e.peer_id != p2.peer_id)
    );

    scheduler.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_downloads_share_one_torrent() {
    setup_test_logging();

    let (blob, meta) = blob_and_meta(10_000);
    let digest = meta.digest;
    let peer = FakePeer::start("seeder", FakePeerOpts::seeder(&meta, &blob, Behavior::Serve)).await;
    let scheduler = new_scheduler(fast_config(), discovery_with(vec![peer.info()], &meta)).await;
    let dir = tempfile::tempdir().unwrap();

    let downloads = (0..5).map(|i| {
        let scheduler = scheduler.clone();
        let dest = dir.path().join(format!("blob-{i}"));
        async move { scheduler.download(digest, &dest).await.map(|_| dest) }
    });
    let results = timeout(
        Duration::from_secs(10),
        futures::future::join_all(downloads),
    )
    .await
    .unwrap();

    for dest in results {
        assert_eq!(std::fs::read(dest.unwrap()).unwrap(), blob);
    }
    assert_eq!(scheduler.all_stats().len(), 1);
    assert_eq!(peer.connections(), 1);

    let stats = scheduler.stats(&digest).unwrap();
    assert_eq!(stats.state, TorrentState::Seeding);
    assert_eq!(stats.have_pieces, stats.total_pieces);
    assert_eq!(stats.downloaded_bytes, blob.len() as u64);

    scheduler.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_remove_torrent_cancels_waiters() {
    setup_test_logging();

    let (blob, meta) = blob_and_meta(5_000);
    let digest = meta.digest;
    let peer = FakePeer::start(
        "stuck",
        FakePeerOpts::seeder(&meta, &blob, Behavior::IgnoreRequests),
    )
    .await;
    let config = SchedulerConfig {
        request_timeout: Duration::from_secs(10),
        ..fast_config()
    };
    let scheduler = new_scheduler(config, discovery_with(vec![peer.info()], &meta)).await;
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("blob");

    let download = tokio::spawn({
        let scheduler = scheduler.clone();
        let dest = dest.clone();
        async move { scheduler.download(digest, &dest).await }
    });

    wait_until(
        || {
            if scheduler.num_connections_for(&digest) == 1 {
                return Ok(());
            }
            bail!("not connected yet")
        },
        Duration::from_secs(5),
    )
    .await
    .unwrap();

    scheduler.remove_torrent(digest).await.unwrap();
    let res = timeout(Duration::from_secs(5), download)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(res, Err(Error::Cancelled)), "{res:?}");
    assert_eq!(scheduler.num_connections(), 0);
    assert!(scheduler.stats(&digest).is_none());
    assert!(!dest.exists());

    // Removing again is fine.
    scheduler.remove_torrent(digest).await.unwrap();
    scheduler.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stop_force_closes_after_drain_timeout() {
    setup_test_logging();

    let (blob, meta) = blob_and_meta(5_000);
    let digest = meta.digest;
    // Never finishes the handshake, so its connection can't drain.
    let peer = FakePeer::start("silent", FakePeerOpts::seeder(&meta, &blob, Behavior::Silent)).await;
    let config = SchedulerConfig {
        handshake_timeout: Duration::from_secs(30),
        drain_timeout: Duration::from_millis(300),
        ..fast_config()
    };
    let scheduler = new_scheduler(config, discovery_with(vec![peer.info()], &meta)).await;
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("blob");

    let download = tokio::spawn({
        let scheduler = scheduler.clone();
        let dest = dest.clone();
        async move { scheduler.download(digest, &dest).await }
    });

    wait_until(
        || {
            if scheduler.num_connections() == 1 && peer.connections() == 1 {
                return Ok(());
            }
            bail!("not connected yet")
        },
        Duration::from_secs(5),
    )
    .await
    .unwrap();

    let started = Instant::now();
    scheduler.stop().await;
    assert!(started.elapsed() < Duration::from_secs(3), "{:?}", started.elapsed());

    let res = timeout(Duration::from_secs(5), download)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(res, Err(Error::ShuttingDown)), "{res:?}");
    assert_eq!(scheduler.num_connections(), 0);

    assert!(matches!(
        scheduler.download(digest, &dest).await,
        Err(Error::ShuttingDown)
    ));
    assert!(matches!(scheduler.probe().await, Err(Error::Unresponsive)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reload_applies_to_running_download() {
    setup_test_logging();

    let (blob, meta) = blob_and_meta(5_000);
    let digest = meta.digest;
    let peer = FakePeer::start(
        "stuck",
        FakePeerOpts::seeder(&meta, &blob, Behavior::IgnoreRequests),
    )
    .await;
    let config = SchedulerConfig {
        request_timeout: Duration::from_secs(10),
        stall_timeout: Duration::from_secs(60),
        ..fast_config()
    };
    let scheduler = new_scheduler(config.clone(), discovery_with(vec![peer.info()], &meta)).await;
    let dir = tempfile::tempdir().unwrap();

    let download = tokio::spawn({
        let scheduler = scheduler.clone();
        let dest = dir.path().join("blob");
        async move { scheduler.download(digest, &dest).await }
    });
    wait_until(
        || {
            if scheduler.num_connections_for(&digest) == 1 {
                return Ok(());
            }
            bail!("not connected yet")
        },
        Duration::from_secs(5),
    )
    .await
    .unwrap();

    scheduler.probe().await.unwrap();
    scheduler.reload(SchedulerConfig {
        stall_timeout: Duration::from_millis(200),
        ..config
    });
    assert_eq!(scheduler.config().stall_timeout, Duration::from_millis(200));

    let res = timeout(Duration::from_secs(5), download)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(res, Err(Error::Timeout)), "{res:?}");

    // Failed torrents leave the registry.
    wait_until(
        || {
            if scheduler.stats(&digest).is_none() {
                return Ok(());
            }
            bail!("torrent still registered")
        },
        Duration::from_secs(5),
    )
    .await
    .unwrap();
    scheduler.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_not_found() {
    setup_test_logging();

    let (_, meta) = blob_and_meta(5_000);
    let digest = meta.digest;
    let scheduler = new_scheduler(fast_config(), discovery_with(vec![], &meta)).await;
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("blob");

    // Known blob, nobody to get it from.
    let res = timeout(Duration::from_secs(5), scheduler.download(digest, &dest))
        .await
        .unwrap();
    assert!(matches!(res, Err(Error::NotFound)), "{res:?}");

    // Unknown blob.
    let (_, unknown) = blob_and_meta(100);
    let res = timeout(
        Duration::from_secs(5),
        scheduler.download(unknown.digest, &dest),
    )
    .await
    .unwrap();
    assert!(matches!(res, Err(Error::NotFound)), "{res:?}");
    assert!(!dest.exists());

    scheduler.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_corrupt_peer_is_blacklisted() {
    setup_test_logging();

    let (blob, meta) = blob_and_meta(8_000);
    let digest = meta.digest;
    let bad = FakePeer::start("bad", FakePeerOpts::seeder(&meta, &blob, Behavior::Corrupt)).await;
    let good = FakePeer::start("good", FakePeerOpts::seeder(&meta, &blob, Behavior::Serve)).await;

    let discovery = discovery_with(vec![bad.info()], &meta);
    let scheduler = new_scheduler(fast_config(), discovery.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("blob");

    let download = tokio::spawn({
        let scheduler = scheduler.clone();
        let dest = dest.clone();
        async move { scheduler.download(digest, &dest).await }
    });

    wait_until(
        || {
            let snapshot = scheduler.blacklist_snapshot()?;
            match snapshot.iter().find(|e| e.peer_id == bad.peer_id) {
                Some(e) if e.cause == BlacklistCause::HashMismatch => Ok(()),
                other => bail!("not blacklisted yet: {other:?}"),
            }
        },
        Duration::from_secs(5),
    )
    .await
    .unwrap();

    discovery.add_peer(good.info());
    timeout(Duration::from_secs(10), download)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(std::fs::read(&dest).unwrap(), blob);
    // Not retried while blacklisted.
    assert_eq!(bad.connections(), 1);

    scheduler.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_schedulers_seed_to_each_other() {
    setup_test_logging();

    let blob = random_blob(20_000);
    let origin_store = Arc::new(InMemoryPieceStore::new());
    let meta = origin_store.insert_blob(&blob, PIECE_LENGTH).unwrap();
    let digest = meta.digest;

    let origin = Scheduler::new(
        SchedulerConfig {
            seeder_idle_timeout: Duration::from_millis(300),
            sweep_interval: Duration::from_millis(50),
            ..fast_config()
        },
        origin_store,
        Arc::new(StaticPeerDiscovery::new(vec![])),
        SchedulerOptions::default(),
    )
    .await
    .unwrap();
    let origin_info = PeerInfo {
        peer_id: origin.peer_id(),
        addr: origin.listen_addr(),
        complete: true,
    };

    let first = new_scheduler(fast_config(), discovery_with(vec![origin_info], &meta)).await;
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("first");
    timeout(Duration::from_secs(10), first.download(digest, &dest))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(std::fs::read(&dest).unwrap(), blob);

    // The second agent only knows the first one, which seeds what it downloaded.
    let first_info = PeerInfo {
        peer_id: first.peer_id(),
        addr: first.listen_addr(),
        complete: true,
    };
    let second = new_scheduler(fast_config(), discovery_with(vec![first_info], &meta)).await;
    let dest = dir.path().join("second");
    timeout(Duration::from_secs(10), second.download(digest, &dest))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(std::fs::read(&dest).unwrap(), blob);

    // Nobody talks to the origin anymore, so its seeding torrent goes away.
    wait_until(
        || {
            if origin.stats(&digest).is_none() {
                return Ok(());
            }
            bail!("origin still seeding")
        },
        Duration::from_secs(5),
    )
    .await
    .unwrap();

    for s in [origin, first, second] {
        s.probe().await.unwrap();
        s.stop().await;
        assert_eq!(s.num_connections(), 0);
    }
}

async fn wait_blacklisted(scheduler: &Scheduler, peer_id: PeerId, cause: BlacklistCause) {
    wait_until(
        || {
            let snapshot = scheduler.blacklist_snapshot()?;
            match snapshot.iter().find(|e| e.peer_id == peer_id) {
                Some(e) if e.cause == cause => Ok(()),
                other => bail!("{peer_id} not blacklisted for {cause:?}: {other:?}"),
            }
        },
        Duration::from_secs(5),
    )
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_handshake_failures_are_blacklisted() {
    setup_test_logging();

    let (blob, meta) = blob_and_meta(5_000);
    let digest = meta.digest;
    let silent = FakePeer::start("silent", FakePeerOpts::seeder(&meta, &blob, Behavior::Silent)).await;
    let other_blob = FakePeer::start(
        "other_blob",
        FakePeerOpts::seeder(&meta, &blob, Behavior::WrongDigest),
    )
    .await;
    // Announced under one id, answers with another.
    let impostor = FakePeer::start("impostor", FakePeerOpts::seeder(&meta, &blob, Behavior::Serve)).await;
    let announced_id = PeerId::new([7; 20]);
    let impostor_info = PeerInfo {
        peer_id: announced_id,
        ..impostor.info()
    };

    let config = SchedulerConfig {
        handshake_timeout: Duration::from_millis(200),
        ..fast_config()
    };
    let scheduler = new_scheduler(
        config,
        discovery_with(vec![silent.info(), other_blob.info(), impostor_info], &meta),
    )
    .await;
    let dir = tempfile::tempdir().unwrap();
    let download = tokio::spawn({
        let scheduler = scheduler.clone();
        let dest = dir.path().join("blob");
        async move { scheduler.download(digest, &dest).await }
    });

    for peer_id in [silent.peer_id, other_blob.peer_id, announced_id] {
        wait_blacklisted(&scheduler, peer_id, BlacklistCause::HandshakeFailure).await;
    }
    assert!(
        scheduler
            .blacklist_snapshot()
            .unwrap()
            .iter()
            .all(|e| e.digest == digest && !e.remaining.is_zero())
    );
    assert!(!download.is_finished());
    wait_until(
        || {
            if scheduler.num_connections() == 0 {
                return Ok(());
            }
            bail!("connections still open")
        },
        Duration::from_secs(5),
    )
    .await
    .unwrap();
    // Each of them got exactly one chance.
    for p in [&silent, &other_blob, &impostor] {
        assert_eq!(p.connections(), 1);
    }

    scheduler.stop().await;
    let res = timeout(Duration::from_secs(5), download)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(res, Err(Error::ShuttingDown)), "{res:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_quiet_peer_closed_on_idle_timeout() {
    setup_test_logging();

    let (blob, meta) = blob_and_meta(5_000);
    let digest = meta.digest;
    // Completes the handshake, then never sends another byte.
    let quiet = FakePeer::start("quiet", FakePeerOpts::seeder(&meta, &blob, Behavior::IgnoreRequests)).await;
    let config = SchedulerConfig {
        idle_timeout: Duration::from_millis(300),
        request_timeout: Duration::from_secs(10),
        blacklist: BlacklistConfig {
            idle_timeout: BlacklistPolicy {
                ttl: Duration::from_secs(30),
                min_offenses: 1,
            },
            ..Default::default()
        },
        ..fast_config()
    };
    let scheduler = new_scheduler(config, discovery_with(vec![quiet.info()], &meta)).await;
    let dir = tempfile::tempdir().unwrap();
    let download = tokio::spawn({
        let scheduler = scheduler.clone();
        let dest = dir.path().join("blob");
        async move { scheduler.download(digest, &dest).await }
    });

    wait_blacklisted(&scheduler, quiet.peer_id, BlacklistCause::IdleTimeout).await;
    wait_until(
        || {
            if scheduler.num_connections_for(&digest) == 0 {
                return Ok(());
            }
            bail!("still connected")
        },
        Duration::from_secs(5),
    )
    .await
    .unwrap();
    assert_eq!(quiet.connections(), 1);

    scheduler.remove_torrent(digest).await.unwrap();
    let res = timeout(Duration::from_secs(5), download)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(res, Err(Error::Cancelled)), "{res:?}");
    scheduler.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reload_keeps_active_connection() {
    setup_test_logging();

    let (blob, meta) = blob_and_meta(PIECE_LENGTH as usize * 8);
    let digest = meta.digest;
    let peer = FakePeer::start(
        "slow",
        FakePeerOpts {
            serve_delay: Duration::from_millis(100),
            ..FakePeerOpts::seeder(&meta, &blob, Behavior::Serve)
        },
    )
    .await;
    let config = SchedulerConfig {
        request_timeout: Duration::from_secs(5),
        stall_timeout: Duration::from_secs(20),
        ..fast_config()
    };
    let scheduler = new_scheduler(config.clone(), discovery_with(vec![peer.info()], &meta)).await;
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("blob");

    let download = tokio::spawn({
        let scheduler = scheduler.clone();
        let dest = dest.clone();
        async move { scheduler.download(digest, &dest).await }
    });
    wait_until(
        || match scheduler.stats(&digest) {
            Some(s) if s.have_pieces > 0 && s.have_pieces < s.total_pieces => Ok(()),
            other => bail!("not mid-transfer: {other:?}"),
        },
        Duration::from_secs(5),
    )
    .await
    .unwrap();

    let reloaded = SchedulerConfig {
        pipeline_limit: 1,
        request_timeout: Duration::from_secs(4),
        idle_timeout: Duration::from_secs(3),
        ..config
    };
    scheduler.reload(reloaded.clone());
    assert_eq!(*scheduler.config(), reloaded.sanitized());

    timeout(Duration::from_secs(10), download)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(std::fs::read(&dest).unwrap(), blob);
    // Same connection from start to finish.
    assert_eq!(peer.connections(), 1);
    let stats = scheduler.stats(&digest).unwrap();
    assert_eq!(stats.have_pieces, stats.total_pieces);
    assert!(scheduler.blacklist_snapshot().unwrap().is_empty());

    scheduler.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_seeders_preferred_when_budget_is_tight() {
    setup_test_logging();

    let (blob, meta) = blob_and_meta(5_000);
    let digest = meta.digest;
    let partial = FakePeer::start(
        "partial",
        FakePeerOpts {
            have: vec![0],
            ..FakePeerOpts::seeder(&meta, &blob, Behavior::IgnoreRequests)
        },
    )
    .await;
    let seeder = FakePeer::start("seeder", FakePeerOpts::seeder(&meta, &blob, Behavior::Serve)).await;
    assert!(!partial.info().complete);
    assert!(seeder.info().complete);

    let config = SchedulerConfig {
        max_conns_per_torrent: 1,
        ..fast_config()
    };
    let scheduler = new_scheduler(
        config,
        discovery_with(vec![partial.info(), seeder.info()], &meta),
    )
    .await;
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("blob");
    timeout(Duration::from_secs(10), scheduler.download(digest, &dest))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(std::fs::read(&dest).unwrap(), blob);
    assert_eq!(partial.connections(), 0);
    assert_eq!(seeder.connections(), 1);

    scheduler.stop().await;
}

type Gate = (mpsc::SyncSender<()>, mpsc::Receiver<()>);

/// Holds the first read of piece 1 until told to go on.
struct GatedStore {
    inner: InMemoryPieceStore,
    gate: Mutex<Option<Gate>>,
}

impl PieceStore for GatedStore {
    fn metainfo(&self, digest: &Digest) -> Option<MetaInfo> {
        self.inner.metainfo(digest)
    }

    fn piece_hash(&self, digest: &Digest, index: ValidPieceIndex) -> Option<Id32> {
        self.inner.piece_hash(digest, index)
    }

    fn create(&self, meta: &MetaInfo) -> anyhow::Result<()> {
        self.inner.create(meta)
    }

    fn have_pieces(&self, digest: &Digest) -> anyhow::Result<BF> {
        self.inner.have_pieces(digest)
    }

    fn read_piece(&self, digest: &Digest, index: ValidPieceIndex) -> anyhow::Result<Option<Bytes>> {
        if index.get() == 1
            && let Some((reached, go)) = self.gate.lock().take()
        {
            reached.send(())?;
            go.recv()?;
        }
        self.inner.read_piece(digest, index)
    }

    fn write_piece(
        &self,
        digest: &Digest,
        index: ValidPieceIndex,
        data: Bytes,
    ) -> anyhow::Result<()> {
        self.inner.write_piece(digest, index, data)
    }

    fn remove(&self, digest: &Digest) -> anyhow::Result<()> {
        self.inner.remove(digest)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_remove_while_writing_blob_cancels() {
    setup_test_logging();

    let blob = random_blob(PIECE_LENGTH as usize * 3);
    let (reached_tx, reached_rx) = mpsc::sync_channel(1);
    let (go_tx, go_rx) = mpsc::sync_channel(1);
    let store = Arc::new(GatedStore {
        inner: InMemoryPieceStore::new(),
        gate: Mutex::new(Some((reached_tx, go_rx))),
    });
    let digest = store.inner.insert_blob(&blob, PIECE_LENGTH).unwrap().digest;

    let scheduler = Scheduler::new(
        fast_config(),
        store.clone(),
        Arc::new(StaticPeerDiscovery::new(vec![])),
        SchedulerOptions::default(),
    )
    .await
    .unwrap();
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("blob");

    // The blob is local, so the download goes straight to writing it out.
    let download = tokio::spawn({
        let scheduler = scheduler.clone();
        let dest = dest.clone();
        async move { scheduler.download(digest, &dest).await }
    });
    tokio::task::spawn_blocking(move || reached_rx.recv())
        .await
        .unwrap()
        .unwrap();

    scheduler.remove_torrent(digest).await.unwrap();
    assert!(!store.inner.contains(&digest));
    go_tx.send(()).unwrap();

    let res = timeout(Duration::from_secs(5), download)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(res, Err(Error::Cancelled)), "{res:?}");
    assert!(!dest.exists());
    scheduler.stop().await;
}
