use std::path::Path;

use async_trait::async_trait;
use kraken_core::Digest;

use crate::{
    config::SchedulerConfig, connstate::BlacklistedConn, error::Result, scheduler::Scheduler,
};

/// What the rest of the agent sees of the scheduler.
#[async_trait]
pub trait TorrentScheduler: Send + Sync {
    /// Blocks until the blob is fully written to `dest`, or fails.
    async fn download(&self, digest: Digest, dest: &Path) -> Result<()>;

    /// Cancels the download (waiters get [`crate::Error::Cancelled`]). Removing an unknown
    /// digest succeeds.
    async fn remove_torrent(&self, digest: Digest) -> Result<()>;

    /// Fails with [`crate::Error::Unresponsive`] if the event loop doesn't answer within the
    /// probe timeout.
    async fn probe(&self) -> Result<()>;

    fn blacklist_snapshot(&self) -> Result<Vec<BlacklistedConn>>;

    async fn stop(&self);
}

pub trait ReloadableScheduler: TorrentScheduler {
    /// Never blocks on running torrents. Out of range values are clamped.
    fn reload(&self, config: SchedulerConfig);
}

#[async_trait]
impl TorrentScheduler for Scheduler {
    async fn download(&self, digest: Digest, dest: &Path) -> Result<()> {
        Scheduler::download(self, digest, dest).await
    }

    async fn remove_torrent(&self, digest: Digest) -> Result<()> {
        Scheduler::remove_torrent(self, digest).await
    }

    async fn probe(&self) -> Result<()> {
        Scheduler::probe(self).await
    }

    fn blacklist_snapshot(&self) -> Result<Vec<BlacklistedConn>> {
        Scheduler::blacklist_snapshot(self)
    }

    async fn stop(&self) {
        Scheduler::stop(self).await
    }
}

impl ReloadableScheduler for Scheduler {
    fn reload(&self, config: SchedulerConfig) {
        Scheduler::reload(self, config)
    }
}
