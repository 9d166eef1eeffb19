#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("blob with 0 length can't be split into pieces")]
    ZeroLength,
    #[error("piece length must be greater than 0")]
    ZeroPieceLength,
    #[error("invalid piece index {0}")]
    InvalidPieceIndex(u32),
    #[error("blob has {actual} piece hashes, expected {expected}")]
    PieceHashCountMismatch { expected: u32, actual: usize },
    #[error("blob has too many pieces ({0}) for piece length {1}")]
    TooManyPieces(u64, u32),
}
