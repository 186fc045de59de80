use zephyrd_consensus::{hash_is_null, Hash256, NULL_HASH};

/// Reference to a transaction output.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct OutPoint {
    pub hash: Hash256,
    pub index: u32,
}

impl OutPoint {
    pub fn new(hash: Hash256, index: u32) -> Self {
        Self { hash, index }
    }

    /// The null prevout used by coinbase inputs.
    pub fn null() -> Self {
        Self {
            hash: NULL_HASH,
            index: u32::MAX,
        }
    }

    pub fn is_null(&self) -> bool {
        hash_is_null(&self.hash) && self.index == u32::MAX
    }
}
