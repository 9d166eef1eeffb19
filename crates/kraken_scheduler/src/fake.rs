//! In-memory [`TorrentScheduler`] for testing code that drives a scheduler.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use bytes::Bytes;
use kraken_core::Digest;
use parking_lot::Mutex;

use crate::{
    api::{ReloadableScheduler, TorrentScheduler},
    config::SchedulerConfig,
    connstate::BlacklistedConn,
    error::{Error, Result, TorrentFailure},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeCall {
    Download(Digest, PathBuf),
    RemoveTorrent(Digest),
    Probe,
    BlacklistSnapshot,
    Reload,
    Stop,
}

#[derive(Default)]
struct FakeSchedulerLocked {
    blobs: HashMap<Digest, Bytes>,
    failures: HashMap<Digest, TorrentFailure>,
    blacklist: Vec<BlacklistedConn>,
    config: SchedulerConfig,
    unresponsive: bool,
    stopped: bool,
    calls: Vec<FakeCall>,
}

/// Serves blobs registered with [`FakeScheduler::add_blob`], fails the ones registered
/// with [`FakeScheduler::fail_download`] and records every call.
#[derive(Default)]
pub struct FakeScheduler {
    locked: Mutex<FakeSchedulerLocked>,
}

impl FakeScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_blob(&self, blob: impl Into<Bytes>) -> Digest {
        let blob = blob.into();
        let digest = Digest::sha256(&blob);
        self.locked.lock().blobs.insert(digest, blob);
        digest
    }

    pub fn fail_download(&self, digest: Digest, failure: TorrentFailure) {
        self.locked.lock().failures.insert(digest, failure);
    }

    pub fn set_unresponsive(&self, unresponsive: bool) {
        self.locked.lock().unresponsive = unresponsive;
    }

    pub fn set_blacklist(&self, entries: Vec<BlacklistedConn>) {
        self.locked.lock().blacklist = entries;
    }

    /// The last config passed to [`ReloadableScheduler::reload`].
    pub fn config(&self) -> SchedulerConfig {
        self.locked.lock().config.clone()
    }

    pub fn calls(&self) -> Vec<FakeCall> {
        self.locked.lock().calls.clone()
    }

    fn record(&self, call: FakeCall) {
        self.locked.lock().calls.push(call);
    }
}

#[async_trait]
impl TorrentScheduler for FakeScheduler {
    async fn download(&self, digest: Digest, dest: &Path) -> Result<()> {
        let blob = {
            let mut g = self.locked.lock();
            g.calls.push(FakeCall::Download(digest, dest.to_owned()));
            if g.stopped {
                return Err(Error::ShuttingDown);
            }
            if let Some(f) = g.failures.get(&digest) {
                return Err(f.clone().into());
            }
            g.blobs.get(&digest).cloned().ok_or(Error::NotFound)?
        };
        tokio::fs::write(dest, &blob)
            .await
            .map_err(|e| Error::Anyhow(e.into()))
    }

    async fn remove_torrent(&self, digest: Digest) -> Result<()> {
        let mut g = self.locked.lock();
        g.calls.push(FakeCall::RemoveTorrent(digest));
        g.blobs.remove(&digest);
        Ok(())
    }

    async fn probe(&self) -> Result<()> {
        let unresponsive = {
            let mut g = self.locked.lock();
            g.calls.push(FakeCall::Probe);
            g.unresponsive || g.stopped
        };
        if unresponsive {
            return Err(Error::Unresponsive);
        }
        Ok(())
    }

    fn blacklist_snapshot(&self) -> Result<Vec<BlacklistedConn>> {
        let mut g = self.locked.lock();
        g.calls.push(FakeCall::BlacklistSnapshot);
        Ok(g.blacklist.clone())
    }

    async fn stop(&self) {
        let mut g = self.locked.lock();
        g.calls.push(FakeCall::Stop);
        g.stopped = true;
    }
}

impl ReloadableScheduler for FakeScheduler {
    fn reload(&self, config: SchedulerConfig) {
        self.record(FakeCall::Reload);
        self.locked.lock().config = config.sanitized();
    }
}
