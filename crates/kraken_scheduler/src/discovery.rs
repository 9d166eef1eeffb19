use std::{collections::HashMap, net::SocketAddr};

use async_trait::async_trait;
use kraken_core::{Digest, PeerId, metainfo::MetaInfo};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub addr: SocketAddr,
    /// The peer holds the whole blob.
    #[serde(default)]
    pub complete: bool,
}

/// Where peers (and the metainfo of a blob) come from. In production this is the tracker.
#[async_trait]
pub trait PeerDiscovery: Send + Sync {
    /// Candidate peers for `digest`. Called repeatedly; an empty result is not an error.
    async fn find_peers(&self, digest: &Digest) -> anyhow::Result<Vec<PeerInfo>>;

    /// `None` if nobody knows the blob.
    async fn get_metainfo(&self, digest: &Digest) -> anyhow::Result<Option<MetaInfo>>;
}

/// A fixed peer list shared by every digest, plus explicitly registered metainfo.
#[derive(Default)]
pub struct StaticPeerDiscovery {
    peers: RwLock<Vec<PeerInfo>>,
    metainfo: RwLock<HashMap<Digest, MetaInfo>>,
}

impl StaticPeerDiscovery {
    pub fn new(peers: Vec<PeerInfo>) -> Self {
        Self {
            peers: RwLock::new(peers),
            metainfo: Default::default(),
        }
    }

    pub fn add_peer(&self, peer: PeerInfo) {
        let mut g = self.peers.write();
        g.retain(|p| p.peer_id != peer.peer_id);
        g.push(peer);
    }

    pub fn remove_peer(&self, peer_id: &PeerId) {
        self.peers.write().retain(|p| p.peer_id != *peer_id);
    }

    pub fn add_metainfo(&self, meta: MetaInfo) {
        self.metainfo.write().insert(meta.digest, meta);
    }
}

#[async_trait]
impl PeerDiscovery for StaticPeerDiscovery {
    async fn find_peers(&self, _digest: &Digest) -> anyhow::Result<Vec<PeerInfo>> {
        Ok(self.peers.read().clone())
    }

    async fn get_metainfo(&self, digest: &Digest) -> anyhow::Result<Option<MetaInfo>> {
        Ok(self.metainfo.read().get(digest).cloned())
    }
}
