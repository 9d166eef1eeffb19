//!
//! Torrent scheduler of the kraken p2p blob distribution agent.
//!
//! Blobs are addressed by their SHA-256 digest and transferred in fixed-size pieces between
//! agents. For every digest being downloaded the scheduler runs one torrent: it finds peers
//! through [`PeerDiscovery`], connects to them, requests pieces rarest-first, verifies every
//! piece before writing it to the [`PieceStore`] and serves the pieces it has to anyone who
//! asks. Misbehaving peers are blacklisted per digest for a while.
//!
//! # Quick usage example
//!
//! ```no_run
//! use std::sync::Arc;
//! use kraken_scheduler::*;
//!
//! # async fn run(digest: kraken_core::Digest) -> anyhow::Result<()> {
//! let scheduler = Scheduler::new(
//!     SchedulerConfig::default(),
//!     Arc::new(InMemoryPieceStore::new()),
//!     Arc::new(StaticPeerDiscovery::new(vec![])),
//!     SchedulerOptions::default(),
//! )
//! .await?;
//! scheduler.download(digest, "/tmp/blob".as_ref()).await?;
//! scheduler.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod api;
mod blob;
pub mod config;
pub mod connstate;
pub mod discovery;
pub mod error;
pub mod fake;
mod listen;
mod peer_connection;
pub mod piece_store;
mod scheduler;
mod torrent;
mod type_aliases;

pub use api::{ReloadableScheduler, TorrentScheduler};
pub use config::{BlacklistConfig, BlacklistPolicy, PieceSelectionPolicy, SchedulerConfig};
pub use connstate::{BlacklistCause, BlacklistedConn};
pub use discovery::{PeerDiscovery, PeerInfo, StaticPeerDiscovery};
pub use error::{Error, Result, TorrentFailure};
pub use fake::FakeScheduler;
pub use piece_store::{InMemoryPieceStore, PieceStore};
pub use scheduler::{Scheduler, SchedulerOptions};
pub use torrent::{PeerConnState, PeerStats, TorrentState, TorrentStats};
pub use type_aliases::BF;

#[cfg(test)]
mod tests;

/// The cargo version of kraken-scheduler.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
