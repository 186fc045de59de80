//! Incremental note-commitment tree backing the shielded-pool anchors.
//!
//! Fixed depth, append-only. Only the frontier is kept: the two lowest
//! leaves plus one optional node per filled level.

use std::sync::OnceLock;

use sha2::{Digest, Sha256};
use zephyrd_consensus::Hash256;
use zephyrd_primitives::encoding::{DecodeError, Decoder, Encoder};

use crate::error::ChainstateError;

pub const TREE_DEPTH: usize = 29;

fn combine(left: &Hash256, right: &Hash256) -> Hash256 {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    out
}

fn empty_roots() -> &'static [Hash256; TREE_DEPTH + 1] {
    static ROOTS: OnceLock<[Hash256; TREE_DEPTH + 1]> = OnceLock::new();
    ROOTS.get_or_init(|| {
        let mut roots = [[0u8; 32]; TREE_DEPTH + 1];
        for level in 1..=TREE_DEPTH {
            roots[level] = combine(&roots[level - 1], &roots[level - 1]);
        }
        roots
    })
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CommitmentTree {
    left: Option<Hash256>,
    right: Option<Hash256>,
    parents: Vec<Option<Hash256>>,
}

impl CommitmentTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Root of a tree with no commitments.
    pub fn empty_root() -> Hash256 {
        empty_roots()[TREE_DEPTH]
    }

    pub fn append(&mut self, commitment: Hash256) -> Result<(), ChainstateError> {
        if self.left.is_none() {
            self.left = Some(commitment);
            return Ok(());
        }
        if self.right.is_none() {
            self.right = Some(commitment);
            return Ok(());
        }

        let left = self.left.take().unwrap_or_default();
        let right = self.right.take().unwrap_or_default();
        let mut carry = combine(&left, &right);
        self.left = Some(commitment);

        for level in 0..TREE_DEPTH - 1 {
            if level < self.parents.len() {
                if let Some(parent) = self.parents[level].take() {
                    carry = combine(&parent, &carry);
                } else {
                    self.parents[level] = Some(carry);
                    return Ok(());
                }
            } else {
                self.parents.push(Some(carry));
                return Ok(());
            }
        }
        Err(ChainstateError::Inconsistent("commitment tree is full"))
    }

    pub fn root(&self) -> Hash256 {
        let empties = empty_roots();
        let left = self.left.unwrap_or(empties[0]);
        let right = self.right.unwrap_or(empties[0]);
        let mut root = combine(&left, &right);
        for level in 0..TREE_DEPTH - 1 {
            root = match self.parents.get(level).copied().flatten() {
                Some(parent) => combine(&parent, &root),
                None => combine(&root, &empties[level + 1]),
            };
        }
        root
    }

    pub fn dynamic_memory_usage(&self) -> usize {
        self.parents.capacity() * std::mem::size_of::<Option<Hash256>>()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        write_optional_hash(&mut encoder, &self.left);
        write_optional_hash(&mut encoder, &self.right);
        encoder.write_compact_size(self.parents.len() as u64);
        for parent in &self.parents {
            write_optional_hash(&mut encoder, parent);
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let left = read_optional_hash(&mut decoder)?;
        let right = read_optional_hash(&mut decoder)?;
        let count = decoder.read_compact_size()? as usize;
        let mut parents = Vec::with_capacity(count);
        for _ in 0..count {
            parents.push(read_optional_hash(&mut decoder)?);
        }
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            left,
            right,
            parents,
        })
    }
}

fn write_optional_hash(encoder: &mut Encoder, hash: &Option<Hash256>) {
    match hash {
        Some(hash) => {
            encoder.write_u8(1);
            encoder.write_bytes(hash);
        }
        None => encoder.write_u8(0),
    }
}

fn read_optional_hash(decoder: &mut Decoder<'_>) -> Result<Option<Hash256>, DecodeError> {
    if decoder.read_bool()? {
        Ok(Some(decoder.read_fixed::<32>()?))
    } else {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_tree_has_the_empty_root() {
        assert_eq!(CommitmentTree::new().root(), CommitmentTree::empty_root());
    }

    #[test]
    fn append_changes_the_root() {
        let mut tree = CommitmentTree::new();
        let before = tree.root();
        tree.append([1u8; 32]).expect("append");
        let after_one = tree.root();
        assert_ne!(before, after_one);
        tree.append([2u8; 32]).expect("append");
        assert_ne!(after_one, tree.root());
    }

    #[test]
    fn append_order_matters() {
        let mut a = CommitmentTree::new();
        let mut b = CommitmentTree::new();
        a.append([1u8; 32]).expect("append");
        a.append([2u8; 32]).expect("append");
        b.append([2u8; 32]).expect("append");
        b.append([1u8; 32]).expect("append");
        assert_ne!(a.root(), b.root());
    }

    #[test]
    fn codec_roundtrip() {
        let mut tree = CommitmentTree::new();
        for i in 0..7u8 {
            tree.append([i; 32]).expect("append");
        }
        let decoded = CommitmentTree::decode(&tree.encode()).expect("decode");
        assert_eq!(decoded, tree);
        assert_eq!(decoded.root(), tree.root());
    }
}
