use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU32, AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::{sync::mpsc::UnboundedSender, time::Instant};

use crate::{connstate::ConnPermit, peer_connection::WriterRequest};

#[derive(Debug)]
pub(crate) struct PeerCounters {
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub pieces_received: AtomicU32,
    pub pieces_uploaded: AtomicU32,
    /// Piece payload bytes served, framing excluded.
    pub payload_uploaded: AtomicU64,
    last_received: Mutex<Instant>,
}

impl Default for PeerCounters {
    fn default() -> Self {
        Self {
            bytes_sent: Default::default(),
            bytes_received: Default::default(),
            pieces_received: Default::default(),
            pieces_uploaded: Default::default(),
            payload_uploaded: Default::default(),
            last_received: Mutex::new(Instant::now()),
        }
    }
}

impl PeerCounters {
    pub fn on_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn on_received(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
        *self.last_received.lock() = Instant::now();
    }

    pub fn on_piece_uploaded(&self, bytes: u64) {
        self.pieces_uploaded.fetch_add(1, Ordering::Relaxed);
        self.payload_uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn on_piece_received(&self) {
        self.pieces_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn last_received(&self) -> Instant {
        *self.last_received.lock()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerConnState {
    Connecting,
    Active,
}

/// A connection owned by the torrent. Dropping it frees the connection slot.
pub(crate) struct LivePeer {
    pub addr: SocketAddr,
    pub state: PeerConnState,
    pub outgoing: bool,
    pub tx: UnboundedSender<WriterRequest>,
    pub counters: Arc<PeerCounters>,
    pub connected_at: Instant,
    _permit: ConnPermit,
}

impl LivePeer {
    pub fn new(
        addr: SocketAddr,
        outgoing: bool,
        tx: UnboundedSender<WriterRequest>,
        permit: ConnPermit,
    ) -> Self {
        Self {
            addr,
            state: PeerConnState::Connecting,
            outgoing,
            tx,
            counters: Default::default(),
            connected_at: Instant::now(),
            _permit: permit,
        }
    }

    /// Fails silently if the connection is already gone.
    pub fn send(&self, req: WriterRequest) -> bool {
        self.tx.send(req).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_counters() {
        let c = PeerCounters::default();
        c.on_piece_uploaded(1024);
        c.on_piece_uploaded(100);
        c.on_sent(1200);
        assert_eq!(c.pieces_uploaded.load(Ordering::Relaxed), 2);
        assert_eq!(c.payload_uploaded.load(Ordering::Relaxed), 1124);
        assert_eq!(c.bytes_sent.load(Ordering::Relaxed), 1200);
    }
}
