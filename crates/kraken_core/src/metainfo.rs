use serde::{Deserialize, Serialize};

use crate::{
    Digest,
    error::Error,
    hash_id::Id32,
    lengths::{Lengths, ValidPieceIndex},
};

/// Everything needed to download and verify a blob piece by piece.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaInfo {
    pub digest: Digest,
    pub length: u64,
    pub piece_length: u32,
    pub piece_hashes: Vec<Id32>,
}

impl MetaInfo {
    /// Split `blob` into pieces of `piece_length` and hash them.
    pub fn from_blob(blob: &[u8], piece_length: u32) -> Result<Self, Error> {
        let lengths = Lengths::new(blob.len() as u64, piece_length)?;
        let piece_hashes = lengths
            .iter_piece_infos()
            .map(|p| {
                let start = lengths.piece_offset(p.piece_index) as usize;
                Id32::sha256(&blob[start..start + p.len as usize])
            })
            .collect();
        Ok(Self {
            digest: Id32::sha256(blob),
            length: blob.len() as u64,
            piece_length,
            piece_hashes,
        })
    }

    /// Checks that the piece hashes cover the blob exactly.
    pub fn lengths(&self) -> Result<Lengths, Error> {
        let lengths = Lengths::new(self.length, self.piece_length)?;
        if lengths.total_pieces() as usize != self.piece_hashes.len() {
            return Err(Error::PieceHashCountMismatch {
                expected: lengths.total_pieces(),
                actual: self.piece_hashes.len(),
            });
        }
        Ok(lengths)
    }

    pub fn piece_hash(&self, index: ValidPieceIndex) -> Option<&Id32> {
        self.piece_hashes.get(index.get() as usize)
    }

    pub fn total_pieces(&self) -> u32 {
        self.piece_hashes.len() as u32
    }
}
