//! Consensus-wide constants and per-network parameters.

pub mod constants;
pub mod params;

pub use constants::*;
pub use params::{ChainParams, Network};

/// An opaque 256-bit digest (block hashes, txids, sidechain ids, anchors,
/// nullifiers, cert data hashes).
pub type Hash256 = [u8; 32];

/// The all-zero digest, used as the "unset" sentinel throughout.
pub const NULL_HASH: Hash256 = [0u8; 32];

pub fn hash_is_null(hash: &Hash256) -> bool {
    *hash == NULL_HASH
}
