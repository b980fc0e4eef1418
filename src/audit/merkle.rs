//! Merkle Tree for Root Anchors
//!
//! Binary Merkle tree over an ordered list of record hashes. Leaves and
//! interior nodes are domain separated; an odd level is padded with the
//! neutral element (32 zero bytes) rather than a duplicate of its last node.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::audit::hash::{self, DigestBytes, HashError};

const LEAF_TAG: u8 = 0x00;
const NODE_TAG: u8 = 0x01;

/// Padding element for odd levels
pub const NEUTRAL_ELEMENT: DigestBytes = [0u8; 32];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MerkleError {
    #[error("Cannot build Merkle tree from empty leaves")]
    Empty,

    #[error("Invalid leaf hash: {0}")]
    InvalidLeaf(#[from] HashError),

    #[error("Leaf index {index} out of range for {leaf_count} leaves")]
    IndexOutOfRange { index: usize, leaf_count: usize },
}

/// Which side of the running hash a sibling sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Left,
    Right,
}

/// One step of an inclusion path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    pub side: Side,
    pub hash: String,
}

/// Merkle tree, stored level by level (level 0 = hashed leaves)
#[derive(Debug, Clone)]
pub struct MerkleTree {
    levels: Vec<Vec<DigestBytes>>,
}

impl MerkleTree {
    /// Build a tree over record hashes in chain order
    pub fn build(record_hashes: &[String]) -> Result<Self, MerkleError> {
        if record_hashes.is_empty() {
            return Err(MerkleError::Empty);
        }

        let leaves = record_hashes
            .iter()
            .map(|h| hash::decode_digest(h).map(|d| leaf_node(&d)))
            .collect::<Result<Vec<_>, _>>()?;

        let mut levels = vec![leaves];
        while levels.last().map_or(0, Vec::len) > 1 {
            let current = &levels[levels.len() - 1];
            let next: Vec<DigestBytes> = current
                .chunks(2)
                .map(|pair| match pair {
                    [left, right] => interior_node(left, right),
                    [single] => interior_node(single, &NEUTRAL_ELEMENT),
                    _ => unreachable!("chunks(2) yields one or two nodes"),
                })
                .collect();
            levels.push(next);
        }

        Ok(Self { levels })
    }

    pub fn root(&self) -> String {
        hash::encode_digest(&self.levels[self.levels.len() - 1][0])
    }

    pub fn leaf_count(&self) -> usize {
        self.levels[0].len()
    }

    /// Sibling path from the leaf at `index` up to the root
    pub fn inclusion_path(&self, index: usize) -> Result<Vec<ProofStep>, MerkleError> {
        if index >= self.leaf_count() {
            return Err(MerkleError::IndexOutOfRange {
                index,
                leaf_count: self.leaf_count(),
            });
        }

        let mut path = Vec::with_capacity(self.levels.len() - 1);
        let mut idx = index;
        for level in &self.levels[..self.levels.len() - 1] {
            let (sibling_idx, side) = if idx % 2 == 0 {
                (idx + 1, Side::Right)
            } else {
                (idx - 1, Side::Left)
            };
            let sibling = level.get(sibling_idx).copied().unwrap_or(NEUTRAL_ELEMENT);
            path.push(ProofStep {
                side,
                hash: hash::encode_digest(&sibling),
            });
            idx /= 2;
        }

        Ok(path)
    }
}

/// Merkle root over record hashes
pub fn compute_merkle_root(record_hashes: &[String]) -> Result<String, MerkleError> {
    Ok(MerkleTree::build(record_hashes)?.root())
}

/// Recompute a root by walking `path` from a record hash
pub fn root_from_path(record_hash: &str, path: &[ProofStep]) -> Result<String, HashError> {
    let mut current = leaf_node(&hash::decode_digest(record_hash)?);
    for step in path {
        let sibling = hash::decode_digest(&step.hash)?;
        current = match step.side {
            Side::Left => interior_node(&sibling, &current),
            Side::Right => interior_node(&current, &sibling),
        };
    }
    Ok(hash::encode_digest(&current))
}

pub fn verify_inclusion(record_hash: &str, path: &[ProofStep], root_hash: &str) -> Result<bool, HashError> {
    Ok(root_from_path(record_hash, path)? == root_hash)
}

/// Number of path steps a tree with `leaf_count` leaves produces
pub fn expected_path_len(leaf_count: usize) -> usize {
    let mut len = 0;
    let mut width = leaf_count;
    while width > 1 {
        width = (width + 1) / 2;
        len += 1;
    }
    len
}

fn leaf_node(digest: &DigestBytes) -> DigestBytes {
    let mut hasher = Sha256::new();
    hasher.update([LEAF_TAG]);
    hasher.update(digest);
    hasher.finalize().into()
}

fn interior_node(left: &DigestBytes, right: &DigestBytes) -> DigestBytes {
    let mut hasher = Sha256::new();
    hasher.update([NODE_TAG]);
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::hash::sha256_hex;

    fn leaves(count: usize) -> Vec<String> {
        (0..count).map(|i| sha256_hex(format!("event-{}", i).as_bytes())).collect()
    }

    #[test]
    fn test_empty_tree_is_rejected() {
        assert_eq!(MerkleTree::build(&[]).unwrap_err(), MerkleError::Empty);
    }

    #[test]
    fn test_single_leaf_root_is_leaf_node() {
        let hashes = leaves(1);
        let tree = MerkleTree::build(&hashes).unwrap();
        assert_eq!(tree.inclusion_path(0).unwrap(), vec![]);
        assert!(verify_inclusion(&hashes[0], &[], &tree.root()).unwrap());
        assert_ne!(tree.root(), hashes[0]);
    }

    #[test]
    fn test_every_leaf_proves_for_assorted_sizes() {
        for count in [1, 2, 3, 4, 5, 7, 8, 13] {
            let hashes = leaves(count);
            let tree = MerkleTree::build(&hashes).unwrap();
            for index in 0..count {
                let path = tree.inclusion_path(index).unwrap();
                assert!(
                    verify_inclusion(&hashes[index], &path, &tree.root()).unwrap(),
                    "leaf {} of {}",
                    index,
                    count
                );
                assert_eq!(path.len(), expected_path_len(count));
            }
        }
    }

    #[test]
    fn test_odd_level_uses_neutral_padding() {
        let hashes = leaves(3);
        let mut duplicated = hashes.clone();
        duplicated.push(hashes[2].clone());

        // Padding with the neutral element must not equal duplicating the last leaf.
        assert_ne!(
            compute_merkle_root(&hashes).unwrap(),
            compute_merkle_root(&duplicated).unwrap()
        );
        let path = MerkleTree::build(&hashes).unwrap().inclusion_path(2).unwrap();
        assert_eq!(path[0].hash, hash::encode_digest(&NEUTRAL_ELEMENT));
        assert_eq!(path[0].side, Side::Right);
    }

    #[test]
    fn test_root_depends_on_order() {
        let hashes = leaves(4);
        let mut swapped = hashes.clone();
        swapped.swap(1, 2);
        assert_ne!(
            compute_merkle_root(&hashes).unwrap(),
            compute_merkle_root(&swapped).unwrap()
        );
    }

    #[test]
    fn test_tampered_path_fails() {
        let hashes = leaves(6);
        let tree = MerkleTree::build(&hashes).unwrap();
        let mut path = tree.inclusion_path(4).unwrap();
        path[1].side = match path[1].side {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
        };
        assert!(!verify_inclusion(&hashes[4], &path, &tree.root()).unwrap());
    }

    #[test]
    fn test_index_out_of_range() {
        let tree = MerkleTree::build(&leaves(2)).unwrap();
        assert!(matches!(
            tree.inclusion_path(2),
            Err(MerkleError::IndexOutOfRange { index: 2, leaf_count: 2 })
        ));
    }

    #[test]
    fn test_expected_path_len() {
        assert_eq!(expected_path_len(1), 0);
        assert_eq!(expected_path_len(2), 1);
        assert_eq!(expected_path_len(3), 2);
        assert_eq!(expected_path_len(4), 2);
        assert_eq!(expected_path_len(5), 3);
    }
}
