//! Merkle tree primitive for the audit trail
//!
//! Binary SHA-256 Merkle tree over arbitrary leaf content. Leaves and inner
//! nodes are domain separated (`0x00` / `0x01` prefix). When the number of
//! leaves is not a power of two, the last leaf hash is duplicated to complete
//! the tree.
//!
//! The tree keeps its leaf content next to the node hashes so that a stored
//! tree can be read back (`leaves()`) and searched for membership without any
//! other record.

pub mod bucket;

pub use bucket::{data_in_storage_tree, PoolId, StorageBucket};

use crate::error::{AuditError, AuditResult};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};
use std::fmt;

const LEAF_PREFIX: u8 = 0x00;
const NODE_PREFIX: u8 = 0x01;

/// 32-byte SHA-256 digest, serialized as lowercase hex
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Digest([u8; 32]);

impl Digest {
    pub fn zero() -> Self {
        Self([0u8; 32])
    }

    /// Hash of leaf content
    pub fn leaf(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update([LEAF_PREFIX]);
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    /// Hash of an inner node from its two children
    pub fn combine(left: &Digest, right: &Digest) -> Self {
        let mut hasher = Sha256::new();
        hasher.update([NODE_PREFIX]);
        hasher.update(left.0);
        hasher.update(right.0);
        Self(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(bytes))
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Digest::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Leaf content of a Merkle tree
pub trait Content {
    /// Bytes committed to by the leaf
    fn content_bytes(&self) -> &[u8];

    fn content_hash(&self) -> Digest {
        Digest::leaf(self.content_bytes())
    }
}

/// Merkle tree holding its leaves and all node hashes
///
/// Nodes are stored in level order: padded leaf hashes first, then each
/// internal level, root last.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MerkleTree<C> {
    leaves: Vec<C>,
    nodes: Vec<Digest>,
}

impl<C: Content> MerkleTree<C> {
    /// Build a tree over `contents`
    ///
    /// Fails with `Construction` when `contents` is empty.
    pub fn build(contents: Vec<C>) -> AuditResult<Self> {
        if contents.is_empty() {
            return Err(AuditError::Construction(
                "cannot build a merkle tree without leaves".to_string(),
            ));
        }

        let hashes: Vec<Digest> = contents.iter().map(Content::content_hash).collect();
        let nodes = build_nodes(&hashes);

        Ok(Self {
            leaves: contents,
            nodes,
        })
    }

    pub fn root(&self) -> Digest {
        self.nodes.last().copied().unwrap_or_else(Digest::zero)
    }

    pub fn leaves(&self) -> &[C] {
        &self.leaves
    }

    pub fn leaf_count(&self) -> usize {
        self.leaves.len()
    }

    /// Recompute every node from the leaf content and compare
    ///
    /// Returns false for a tree whose stored hashes do not match its leaves,
    /// e.g. a record that was altered after it was written.
    pub fn verify(&self) -> bool {
        if self.leaves.is_empty() {
            return false;
        }
        let hashes: Vec<Digest> = self.leaves.iter().map(Content::content_hash).collect();
        build_nodes(&hashes) == self.nodes
    }

    /// Generate a Merkle proof for the leaf at `leaf_index`
    pub fn proof(&self, leaf_index: usize) -> Option<MerkleProof> {
        if leaf_index >= self.leaves.len() {
            return None;
        }

        let n = self.leaves.len().next_power_of_two();
        if self.nodes.len() != 2 * n - 1 {
            return None;
        }

        let mut proof_hashes = Vec::new();
        let mut proof_positions = Vec::new();

        let mut idx = leaf_index;
        let mut level_start = 0;
        let mut level_size = n;

        while level_size > 1 {
            let sibling_idx = if idx % 2 == 0 { idx + 1 } else { idx - 1 };
            proof_hashes.push(self.nodes[level_start + sibling_idx]);
            proof_positions.push(idx % 2 == 0); // true = sibling is on right

            idx /= 2;
            level_start += level_size;
            level_size /= 2;
        }

        Some(MerkleProof {
            leaf_index,
            leaf_hash: self.nodes[leaf_index],
            proof_hashes,
            proof_positions,
        })
    }

    /// Membership check: first leaf matching `predicate`, with its proof
    ///
    /// The proof is checked against the root and against the leaf's own
    /// content hash before membership is reported.
    pub fn membership<F>(&self, predicate: F) -> (bool, Option<MerkleProof>)
    where
        F: Fn(&C) -> bool,
    {
        let Some(index) = self.leaves.iter().position(|leaf| predicate(leaf)) else {
            return (false, None);
        };

        match self.proof(index) {
            Some(proof)
                if proof.leaf_hash == self.leaves[index].content_hash()
                    && proof.verify(&self.root()) =>
            {
                (true, Some(proof))
            }
            _ => (false, None),
        }
    }
}

fn build_nodes(leaf_hashes: &[Digest]) -> Vec<Digest> {
    let n = leaf_hashes.len().next_power_of_two();
    let mut nodes = Vec::with_capacity(2 * n - 1);

    nodes.extend_from_slice(leaf_hashes);
    if let Some(last) = leaf_hashes.last().copied() {
        while nodes.len() < n {
            nodes.push(last);
        }
    }

    let mut level_start = 0;
    let mut level_size = n;

    while level_size > 1 {
        let next_level_size = level_size / 2;
        for i in 0..next_level_size {
            let left = nodes[level_start + 2 * i];
            let right = nodes[level_start + 2 * i + 1];
            nodes.push(Digest::combine(&left, &right));
        }
        level_start += level_size;
        level_size = next_level_size;
    }

    nodes
}

/// Inclusion proof for one leaf
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    pub leaf_index: usize,
    pub leaf_hash: Digest,
    /// Sibling hashes along the path to root
    pub proof_hashes: Vec<Digest>,
    /// Position of each sibling (true = right, false = left)
    pub proof_positions: Vec<bool>,
}

impl MerkleProof {
    pub fn compute_root(&self) -> Digest {
        let mut current = self.leaf_hash;

        for (sibling, is_right) in self.proof_hashes.iter().zip(self.proof_positions.iter()) {
            current = if *is_right {
                Digest::combine(&current, sibling)
            } else {
                Digest::combine(sibling, &current)
            };
        }

        current
    }

    pub fn verify(&self, root: &Digest) -> bool {
        self.proof_hashes.len() == self.proof_positions.len() && &self.compute_root() == root
    }
}
