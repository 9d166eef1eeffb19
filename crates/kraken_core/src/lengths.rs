use crate::error::Error;

pub const fn ceil_div_u64(a: u64, b: u64) -> u64 {
    a.div_ceil(b)
}

pub const fn last_element_size_u64(total: u64, piece_size: u64) -> u64 {
    let rem = total % piece_size;
    if rem == 0 {
        return piece_size;
    }
    rem
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceInfo {
    pub piece_index: ValidPieceIndex,
    pub len: u32,
}

/// Piece arithmetic for one blob.
///
/// Every piece has `piece_length` bytes except the last one, which holds the remainder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lengths {
    total_length: u64,
    piece_length: u32,
    last_piece_id: u32,
    last_piece_length: u32,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValidPieceIndex(u32);

impl std::fmt::Display for ValidPieceIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Debug for ValidPieceIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl ValidPieceIndex {
    pub const fn get(&self) -> u32 {
        self.0
    }
}

impl Lengths {
    pub fn new(total_length: u64, piece_length: u32) -> Result<Self, Error> {
        if total_length == 0 {
            return Err(Error::ZeroLength);
        }
        if piece_length == 0 {
            return Err(Error::ZeroPieceLength);
        }
        let total_pieces = ceil_div_u64(total_length, piece_length as u64);
        if total_pieces > u32::MAX as u64 {
            return Err(Error::TooManyPieces(total_pieces, piece_length));
        }
        Ok(Self {
            total_length,
            piece_length,
            last_piece_id: (total_pieces - 1) as u32,
            last_piece_length: last_element_size_u64(total_length, piece_length as u64) as u32,
        })
    }

    pub const fn piece_bitfield_bytes(&self) -> usize {
        ceil_div_u64(self.total_pieces() as u64, 8) as usize
    }

    pub const fn total_length(&self) -> u64 {
        self.total_length
    }

    pub const fn validate_piece_index(&self, index: u32) -> Option<ValidPieceIndex> {
        if index > self.last_piece_id {
            return None;
        }
        Some(ValidPieceIndex(index))
    }

    pub const fn default_piece_length(&self) -> u32 {
        self.piece_length
    }

    pub const fn last_piece_id(&self) -> ValidPieceIndex {
        ValidPieceIndex(self.last_piece_id)
    }

    pub const fn total_pieces(&self) -> u32 {
        self.last_piece_id + 1
    }

    pub const fn piece_length(&self, index: ValidPieceIndex) -> u32 {
        if index.0 == self.last_piece_id {
            return self.last_piece_length;
        }
        self.piece_length
    }

    pub const fn piece_offset(&self, index: ValidPieceIndex) -> u64 {
        index.0 as u64 * self.piece_length as u64
    }

    pub fn iter_piece_infos(&self) -> impl Iterator<Item = PieceInfo> + use<> {
        let last_id = self.last_piece_id;
        let last_len = self.last_piece_length;
        let pl = self.piece_length;
        (0..self.total_pieces()).map(move |idx| PieceInfo {
            piece_index: ValidPieceIndex(idx),
            len: if idx == last_id { last_len } else { pl },
        })
    }

    pub fn iter_piece_indices(&self) -> impl Iterator<Item = ValidPieceIndex> + use<> {
        (0..self.total_pieces()).map(ValidPieceIndex)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_multiple() {
        let l = Lengths::new(4 * 1024 * 1024, 1024 * 1024).unwrap();
        assert_eq!(l.total_pieces(), 4);
        assert_eq!(l.piece_length(l.last_piece_id()), 1024 * 1024);
        assert_eq!(l.piece_bitfield_bytes(), 1);
    }

    #[test]
    fn test_last_piece_remainder() {
        let l = Lengths::new(10, 4).unwrap();
        assert_eq!(l.total_pieces(), 3);
        let infos = l.iter_piece_infos().map(|p| p.len).collect::<Vec<_>>();
        assert_eq!(infos, vec![4, 4, 2]);
        assert_eq!(l.piece_offset(l.validate_piece_index(2).unwrap()), 8);
        assert!(l.validate_piece_index(3).is_none());
    }

    #[test]
    fn test_single_piece_blob() {
        let l = Lengths::new(1, 1024).unwrap();
        assert_eq!(l.total_pieces(), 1);
        assert_eq!(l.piece_length(l.last_piece_id()), 1);
    }

    #[test]
    fn test_zero_lengths_rejected() {
        assert!(matches!(Lengths::new(0, 16), Err(Error::ZeroLength)));
        assert!(matches!(Lengths::new(16, 0), Err(Error::ZeroPieceLength)));
    }
}
