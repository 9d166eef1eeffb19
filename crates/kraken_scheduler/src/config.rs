use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::{DurationMilliSeconds, serde_as};

use crate::connstate::BlacklistCause;

/// Order in which missing pieces are requested.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PieceSelectionPolicy {
    /// Pieces held by the fewest connected peers first, lowest index on ties.
    #[default]
    RarestFirst,
    Sequential,
}

#[serde_as]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlacklistPolicy {
    #[serde_as(as = "DurationMilliSeconds")]
    pub ttl: Duration,
    /// Offenses within the window needed before the peer is blacklisted.
    pub min_offenses: u32,
}

impl BlacklistPolicy {
    const fn new(ttl: Duration, min_offenses: u32) -> Self {
        Self { ttl, min_offenses }
    }
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlacklistConfig {
    pub handshake_failure: BlacklistPolicy,
    pub idle_timeout: BlacklistPolicy,
    pub network_error: BlacklistPolicy,
    pub hash_mismatch: BlacklistPolicy,
    pub request_timeout: BlacklistPolicy,

    /// Offenses older than this are forgotten.
    #[serde_as(as = "DurationMilliSeconds")]
    pub offense_window: Duration,

    #[serde_as(as = "DurationMilliSeconds")]
    pub max_ttl: Duration,
}

impl Default for BlacklistConfig {
    fn default() -> Self {
        Self {
            handshake_failure: BlacklistPolicy::new(Duration::from_secs(30), 1),
            idle_timeout: BlacklistPolicy::new(Duration::from_secs(30), 2),
            network_error: BlacklistPolicy::new(Duration::from_secs(30), 2),
            hash_mismatch: BlacklistPolicy::new(Duration::from_secs(300), 1),
            request_timeout: BlacklistPolicy::new(Duration::from_secs(60), 1),
            offense_window: Duration::from_secs(600),
            max_ttl: Duration::from_secs(3600),
        }
    }
}

impl BlacklistConfig {
    pub fn policy(&self, cause: BlacklistCause) -> BlacklistPolicy {
        match cause {
            BlacklistCause::HandshakeFailure => self.handshake_failure,
            BlacklistCause::IdleTimeout => self.idle_timeout,
            BlacklistCause::NetworkError => self.network_error,
            BlacklistCause::HashMismatch => self.hash_mismatch,
            BlacklistCause::RequestTimeout => self.request_timeout,
        }
    }
}

/// Tunables of the scheduler. Installed as a whole and swapped atomically on reload.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub max_global_conns: usize,
    pub max_conns_per_torrent: usize,
    /// Outstanding piece requests per connection.
    pub pipeline_limit: usize,

    #[serde_as(as = "DurationMilliSeconds")]
    pub connect_timeout: Duration,
    #[serde_as(as = "DurationMilliSeconds")]
    pub handshake_timeout: Duration,
    #[serde_as(as = "DurationMilliSeconds")]
    pub idle_timeout: Duration,
    #[serde_as(as = "DurationMilliSeconds")]
    pub keep_alive_interval: Duration,
    #[serde_as(as = "DurationMilliSeconds")]
    pub request_timeout: Duration,
    /// Stalled requests a connection may accumulate before it is closed.
    pub max_request_timeouts: u32,
    #[serde_as(as = "DurationMilliSeconds")]
    pub stall_timeout: Duration,
    #[serde_as(as = "DurationMilliSeconds")]
    pub discovery_interval: Duration,

    pub blacklist: BlacklistConfig,
    pub piece_selection: PieceSelectionPolicy,

    #[serde_as(as = "DurationMilliSeconds")]
    pub drain_timeout: Duration,
    #[serde_as(as = "DurationMilliSeconds")]
    pub probe_timeout: Duration,
    #[serde_as(as = "DurationMilliSeconds")]
    pub seeder_idle_timeout: Duration,
    #[serde_as(as = "DurationMilliSeconds")]
    pub sweep_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_global_conns: 300,
            max_conns_per_torrent: 10,
            pipeline_limit: 3,
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(60),
            keep_alive_interval: Duration::from_secs(15),
            request_timeout: Duration::from_secs(10),
            max_request_timeouts: 2,
            stall_timeout: Duration::from_secs(300),
            discovery_interval: Duration::from_secs(5),
            blacklist: BlacklistConfig::default(),
            piece_selection: PieceSelectionPolicy::default(),
            drain_timeout: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(3),
            seeder_idle_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

const MIN_TIMEOUT: Duration = Duration::from_millis(10);
const MAX_PIPELINE_LIMIT: usize = 256;

fn at_least(d: Duration, min: Duration) -> Duration {
    d.max(min)
}

impl SchedulerConfig {
    /// Clamps every value into a range the scheduler can operate with.
    pub fn sanitized(mut self) -> Self {
        self.max_global_conns = self.max_global_conns.max(1);
        self.max_conns_per_torrent = self.max_conns_per_torrent.clamp(1, self.max_global_conns);
        self.pipeline_limit = self.pipeline_limit.clamp(1, MAX_PIPELINE_LIMIT);
        self.max_request_timeouts = self.max_request_timeouts.max(1);

        self.connect_timeout = at_least(self.connect_timeout, MIN_TIMEOUT);
        self.handshake_timeout = at_least(self.handshake_timeout, MIN_TIMEOUT);
        self.idle_timeout = at_least(self.idle_timeout, MIN_TIMEOUT);
        self.request_timeout = at_least(self.request_timeout, MIN_TIMEOUT);
        self.stall_timeout = at_least(self.stall_timeout, MIN_TIMEOUT);
        self.discovery_interval = at_least(self.discovery_interval, MIN_TIMEOUT);
        self.drain_timeout = at_least(self.drain_timeout, MIN_TIMEOUT);
        self.probe_timeout = at_least(self.probe_timeout, MIN_TIMEOUT);
        self.sweep_interval = at_least(self.sweep_interval, MIN_TIMEOUT);

        // The remote side must hear from us before its idle timer fires.
        self.keep_alive_interval = self
            .keep_alive_interval
            .clamp(MIN_TIMEOUT / 2, self.idle_timeout / 2);

        let b = &mut self.blacklist;
        b.max_ttl = at_least(b.max_ttl, MIN_TIMEOUT);
        b.offense_window = at_least(b.offense_window, MIN_TIMEOUT);
        let max_ttl = b.max_ttl;
        for p in [
            &mut b.handshake_failure,
            &mut b.idle_timeout,
            &mut b.network_error,
            &mut b.hash_mismatch,
            &mut b.request_timeout,
        ] {
            p.ttl = p.ttl.min(max_ttl);
            p.min_offenses = p.min_offenses.max(1);
        }
        self
    }
}
