pub mod error;
pub mod hash_id;
pub mod lengths;
pub mod metainfo;
pub mod peer_id;
pub mod spawn_utils;

pub use error::Error;
pub use hash_id::{Id20, Id32};

/// Content address of a blob. Two torrents are the same swarm iff their digests are equal.
pub type Digest = Id32;

/// Identifier of an agent on the network.
pub type PeerId = Id20;
