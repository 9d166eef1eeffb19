use std::sync::Arc;

pub type BF = bitvec::vec::BitVec<u8, bitvec::order::Msb0>;

pub(crate) type PieceStoreRef = Arc<dyn crate::piece_store::PieceStore>;
pub(crate) type PeerDiscoveryRef = Arc<dyn crate::discovery::PeerDiscovery>;
