// Connection accounting and blacklisting.
//
// Knows nothing about the wire. Every outgoing or incoming connection takes a
// ConnPermit before its first byte; dropping the permit frees the slot.
// Failures are reported here and may turn into a temporary ban for the
// (digest, peer) pair.

use std::{
    collections::{HashMap, HashSet, VecDeque, hash_map::Entry},
    sync::Arc,
    time::Duration,
};

use kraken_core::{Digest, PeerId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_with::{DurationMilliSeconds, serde_as};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::{
    config::{BlacklistConfig, SchedulerConfig},
    error::{Error, Result},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlacklistCause {
    HandshakeFailure,
    IdleTimeout,
    NetworkError,
    HashMismatch,
    RequestTimeout,
}

/// A point-in-time view of one blacklist entry.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlacklistedConn {
    pub digest: Digest,
    pub peer_id: PeerId,
    pub cause: BlacklistCause,
    #[serde_as(as = "DurationMilliSeconds")]
    pub remaining: Duration,
}

type ConnKey = (Digest, PeerId);

#[derive(Debug, Clone, Copy)]
struct BlacklistEntry {
    cause: BlacklistCause,
    expires_at: Instant,
}

#[derive(Default)]
struct ConnStateLocked {
    active: HashMap<Digest, HashSet<PeerId>>,
    num_active: usize,
    blacklist: HashMap<ConnKey, BlacklistEntry>,
    offenses: HashMap<ConnKey, VecDeque<Instant>>,
}

impl ConnStateLocked {
    // Removes the entry if it expired.
    fn check_blacklisted(&mut self, key: &ConnKey, now: Instant) -> bool {
        match self.blacklist.entry(*key) {
            Entry::Occupied(e) if e.get().expires_at <= now => {
                e.remove();
                false
            }
            Entry::Occupied(_) => true,
            Entry::Vacant(_) => false,
        }
    }
}

#[derive(Default)]
pub struct ConnStateTracker {
    locked: RwLock<ConnStateLocked>,
}

/// Holds one connection slot for a (digest, peer) pair until dropped.
pub struct ConnPermit {
    tracker: Arc<ConnStateTracker>,
    digest: Digest,
    peer_id: PeerId,
}

impl std::fmt::Debug for ConnPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnPermit")
            .field("digest", &self.digest)
            .field("peer_id", &self.peer_id)
            .finish()
    }
}

impl Drop for ConnPermit {
    fn drop(&mut self) {
        self.tracker.release(&self.digest, &self.peer_id)
    }
}

fn ttl_for_offense(base: Duration, repeats: u32, max_ttl: Duration) -> Duration {
    let factor = 1u32.checked_shl(repeats).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(max_ttl)
}

impl ConnStateTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Reserves a slot, or explains why the connection must not be opened. Never blocks
    /// on capacity.
    pub fn try_reserve(
        self: &Arc<Self>,
        digest: Digest,
        peer_id: PeerId,
        config: &SchedulerConfig,
    ) -> Result<ConnPermit> {
        let now = Instant::now();
        let mut g = self.locked.write();
        if g.check_blacklisted(&(digest, peer_id), now) {
            return Err(Error::Blacklisted);
        }
        let per_torrent = g.active.get(&digest).map(|s| s.len()).unwrap_or(0);
        if g
            .active
            .get(&digest)
            .is_some_and(|peers| peers.contains(&peer_id))
        {
            return Err(Error::AlreadyConnected);
        }
        if per_torrent >= config.max_conns_per_torrent || g.num_active >= config.max_global_conns
        {
            return Err(Error::CapacityExceeded);
        }
        g.active.entry(digest).or_default().insert(peer_id);
        g.num_active += 1;
        Ok(ConnPermit {
            tracker: self.clone(),
            digest,
            peer_id,
        })
    }

    fn release(&self, digest: &Digest, peer_id: &PeerId) {
        let mut g = self.locked.write();
        let removed = match g.active.get_mut(digest) {
            Some(peers) => {
                let removed = peers.remove(peer_id);
                if peers.is_empty() {
                    g.active.remove(digest);
                }
                removed
            }
            None => false,
        };
        if removed {
            g.num_active -= 1;
        }
    }

    pub fn is_blacklisted(&self, digest: &Digest, peer_id: &PeerId) -> bool {
        let key = (*digest, *peer_id);
        let now = Instant::now();
        {
            let g = self.locked.read();
            match g.blacklist.get(&key) {
                None => return false,
                Some(e) if e.expires_at > now => return true,
                Some(_) => {}
            }
        }
        self.locked.write().check_blacklisted(&key, now)
    }

    /// Records a failed connection. Returns the ban duration if the peer got blacklisted.
    pub fn report(
        &self,
        digest: Digest,
        peer_id: PeerId,
        cause: BlacklistCause,
        config: &BlacklistConfig,
    ) -> Option<Duration> {
        let now = Instant::now();
        let key = (digest, peer_id);
        let policy = config.policy(cause);

        let mut g = self.locked.write();
        let history = g.offenses.entry(key).or_default();
        while history
            .front()
            .is_some_and(|t| now.duration_since(*t) > config.offense_window)
        {
            history.pop_front();
        }
        history.push_back(now);
        let count = history.len() as u32;

        if count < policy.min_offenses {
            debug!(%digest, %peer_id, ?cause, count, "offense recorded");
            return None;
        }
        let ttl = ttl_for_offense(policy.ttl, count - policy.min_offenses, config.max_ttl);
        let expires_at = now + ttl;
        let entry = g.blacklist.entry(key).or_insert(BlacklistEntry { cause, expires_at });
        if entry.expires_at <= expires_at {
            *entry = BlacklistEntry { cause, expires_at };
        }
        info!(%digest, %peer_id, ?cause, ?ttl, "blacklisted peer");
        Some(ttl)
    }

    /// Drops expired entries and forgotten offenses.
    pub fn sweep(&self, config: &BlacklistConfig) -> usize {
        let now = Instant::now();
        let mut g = self.locked.write();
        let before = g.blacklist.len();
        g.blacklist.retain(|_, e| e.expires_at > now);
        g.offenses.retain(|_, h| {
            h.retain(|t| now.duration_since(*t) <= config.offense_window);
            !h.is_empty()
        });
        let removed = before - g.blacklist.len();
        if removed > 0 {
            debug!(removed, "swept expired blacklist entries");
        }
        removed
    }

    pub fn snapshot(&self) -> Vec<BlacklistedConn> {
        let now = Instant::now();
        let mut v: Vec<BlacklistedConn> = self
            .locked
            .read()
            .blacklist
            .iter()
            .filter(|(_, e)| e.expires_at > now)
            .map(|((digest, peer_id), e)| BlacklistedConn {
                digest: *digest,
                peer_id: *peer_id,
                cause: e.cause,
                remaining: e.expires_at - now,
            })
            .collect();
        v.sort_by(|a, b| (a.digest, a.peer_id).cmp(&(b.digest, b.peer_id)));
        v
    }

    pub fn num_active(&self) -> usize {
        self.locked.read().num_active
    }

    pub fn num_active_for(&self, digest: &Digest) -> usize {
        self.locked
            .read()
            .active
            .get(digest)
            .map(|s| s.len())
            .unwrap_or(0)
    }
}
