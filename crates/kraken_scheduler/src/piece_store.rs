use std::collections::HashMap;

use bytes::Bytes;
use kraken_core::{Digest, hash_id::Id32, lengths::ValidPieceIndex, metainfo::MetaInfo};
use parking_lot::RwLock;

use crate::type_aliases::BF;

/// Piece-level access to local blob data.
///
/// Calls are synchronous and may block; the scheduler runs them through
/// [`kraken_core::spawn_utils::BlockingSpawner`] and never holds its own locks across them.
pub trait PieceStore: Send + Sync {
    /// Description of a blob this store knows about, complete or not.
    fn metainfo(&self, digest: &Digest) -> Option<MetaInfo>;

    /// Expected hash of one piece.
    fn piece_hash(&self, digest: &Digest, index: ValidPieceIndex) -> Option<Id32>;

    /// Prepares storage for a blob about to be downloaded. Must be idempotent.
    fn create(&self, meta: &MetaInfo) -> anyhow::Result<()>;

    /// Which pieces of the blob are present and verified.
    fn have_pieces(&self, digest: &Digest) -> anyhow::Result<BF>;

    /// `None` if the piece is not present.
    fn read_piece(&self, digest: &Digest, index: ValidPieceIndex) -> anyhow::Result<Option<Bytes>>;

    fn write_piece(&self, digest: &Digest, index: ValidPieceIndex, data: Bytes)
    -> anyhow::Result<()>;

    /// Checks the data against the piece hash of the blob's metainfo.
    fn verify_piece(&self, digest: &Digest, index: ValidPieceIndex, data: &[u8]) -> bool {
        self.piece_hash(digest, index)
            .is_some_and(|expected| Id32::sha256(data) == expected)
    }

    fn remove(&self, digest: &Digest) -> anyhow::Result<()>;
}

struct StoredBlob {
    meta: MetaInfo,
    pieces: Vec<Option<Bytes>>,
}

/// Keeps everything in memory. Used by the agent and in tests.
#[derive(Default)]
pub struct InMemoryPieceStore {
    blobs: RwLock<HashMap<Digest, StoredBlob>>,
}

impl InMemoryPieceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a complete blob split into `piece_length` pieces.
    pub fn insert_blob(&self, blob: &[u8], piece_length: u32) -> anyhow::Result<MetaInfo> {
        let meta = MetaInfo::from_blob(blob, piece_length)?;
        let lengths = meta.lengths()?;
        let pieces = lengths
            .iter_piece_infos()
            .map(|p| {
                let start = lengths.piece_offset(p.piece_index) as usize;
                Some(Bytes::copy_from_slice(&blob[start..start + p.len as usize]))
            })
            .collect();
        self.blobs.write().insert(
            meta.digest,
            StoredBlob {
                meta: meta.clone(),
                pieces,
            },
        );
        Ok(meta)
    }

    pub fn contains(&self, digest: &Digest) -> bool {
        self.blobs.read().contains_key(digest)
    }
}

impl PieceStore for InMemoryPieceStore {
    fn metainfo(&self, digest: &Digest) -> Option<MetaInfo> {
        self.blobs.read().get(digest).map(|b| b.meta.clone())
    }

    fn piece_hash(&self, digest: &Digest, index: ValidPieceIndex) -> Option<Id32> {
        self.blobs
            .read()
            .get(digest)
            .and_then(|b| b.meta.piece_hash(index).copied())
    }

    fn create(&self, meta: &MetaInfo) -> anyhow::Result<()> {
        let lengths = meta.lengths()?;
        self.blobs
            .write()
            .entry(meta.digest)
            .or_insert_with(|| StoredBlob {
                meta: meta.clone(),
                pieces: vec![None; lengths.total_pieces() as usize],
            });
        Ok(())
    }

    fn have_pieces(&self, digest: &Digest) -> anyhow::Result<BF> {
        let g = self.blobs.read();
        let blob = g
            .get(digest)
            .ok_or_else(|| anyhow::anyhow!("blob {digest} not in store"))?;
        Ok(blob.pieces.iter().map(|p| p.is_some()).collect())
    }

    fn read_piece(&self, digest: &Digest, index: ValidPieceIndex) -> anyhow::Result<Option<Bytes>> {
        Ok(self
            .blobs
            .read()
            .get(digest)
            .and_then(|b| b.pieces.get(index.get() as usize).cloned().flatten()))
    }

    fn write_piece(
        &self,
        digest: &Digest,
        index: ValidPieceIndex,
        data: Bytes,
    ) -> anyhow::Result<()> {
        let mut g = self.blobs.write();
        let blob = g
            .get_mut(digest)
            .ok_or_else(|| anyhow::anyhow!("blob {digest} not in store"))?;
        let slot = blob
            .pieces
            .get_mut(index.get() as usize)
            .ok_or_else(|| anyhow::anyhow!("piece {index} out of range"))?;
        *slot = Some(data);
        Ok(())
    }

    fn remove(&self, digest: &Digest) -> anyhow::Result<()> {
        self.blobs.write().remove(digest);
        Ok(())
    }
}
