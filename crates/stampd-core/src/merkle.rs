//! Batch aggregate: a binary SHA-256 Merkle tree over digests in canonical
//! (submission) order.
//!
//! Construction rules, which external verifiers must reproduce exactly:
//! - leaves are the 32-byte digest values, not re-hashed;
//! - an interior node is `SHA-256(left || right)`;
//! - an odd trailing node at any level is paired with itself;
//! - a single-digest batch has the digest itself as its root.
//!
//! Self-pairing makes `[a, b, c]` and `[a, b, c, c]` share a root. Batches
//! never hold the same digest twice, so the ambiguity cannot arise from
//! stored data.

use crate::error::{AggregateError, ErrorCode};
use crate::hash::sha256_pair;

/// Which side of the running hash a proof sibling sits on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProofStep {
    pub sibling: [u8; 32],
    pub side: Side,
}

/// Leaf-to-root path proving one digest's membership in a batch root.
/// Regenerated on demand from the batch members, never persisted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InclusionProof {
    pub index: usize,
    pub leaf: [u8; 32],
    pub steps: Vec<ProofStep>,
}

impl InclusionProof {
    /// Fold the path from the leaf up to the root it implies.
    pub fn root(&self) -> [u8; 32] {
        self.steps.iter().fold(self.leaf, |acc, step| match step.side {
            Side::Left => sha256_pair(&step.sibling, &acc),
            Side::Right => sha256_pair(&acc, &step.sibling),
        })
    }

    pub fn verify(&self, root: &[u8; 32]) -> bool {
        self.root() == *root
    }
}

/// All levels of the tree, leaves first. Kept in memory only for as long as
/// a caller needs several proofs out of the same batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AggregateTree {
    levels: Vec<Vec<[u8; 32]>>,
}

impl AggregateTree {
    pub fn build(digests: &[[u8; 32]]) -> Result<Self, AggregateError> {
        if digests.is_empty() {
            return Err(AggregateError::new(
                ErrorCode::AggErrEmpty,
                "aggregate: empty digest list",
            ));
        }

        let mut levels = vec![digests.to_vec()];
        while let Some(level) = levels.last() {
            if level.len() == 1 {
                break;
            }
            let next = next_level(level);
            levels.push(next);
        }
        Ok(Self { levels })
    }

    pub fn root(&self) -> [u8; 32] {
        // build() guarantees a non-empty top level.
        self.levels
            .last()
            .and_then(|top| top.first())
            .copied()
            .unwrap_or([0u8; 32])
    }

    pub fn len(&self) -> usize {
        self.levels.first().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn proof(&self, index: usize) -> Result<InclusionProof, AggregateError> {
        if index >= self.len() {
            return Err(AggregateError::new(
                ErrorCode::AggErrIndexOutOfRange,
                "aggregate: proof index out of range",
            ));
        }

        let mut steps = Vec::with_capacity(self.levels.len().saturating_sub(1));
        let mut idx = index;
        for level in &self.levels[..self.levels.len() - 1] {
            let step = if idx % 2 == 0 {
                // Odd promotion rule: a missing right sibling is the node itself.
                let sibling = level.get(idx + 1).copied().unwrap_or(level[idx]);
                ProofStep {
                    sibling,
                    side: Side::Right,
                }
            } else {
                ProofStep {
                    sibling: level[idx - 1],
                    side: Side::Left,
                }
            };
            steps.push(step);
            idx /= 2;
        }

        Ok(InclusionProof {
            index,
            leaf: self.levels[0][index],
            steps,
        })
    }
}

fn next_level(level: &[[u8; 32]]) -> Vec<[u8; 32]> {
    level
        .chunks(2)
        .map(|pair| {
            let left = &pair[0];
            let right = pair.get(1).unwrap_or(left);
            sha256_pair(left, right)
        })
        .collect()
}

/// Root over `digests` in the given order.
pub fn merkle_root(digests: &[[u8; 32]]) -> Result<[u8; 32], AggregateError> {
    AggregateTree::build(digests).map(|tree| tree.root())
}

/// Inclusion proof for `digests[index]`.
pub fn merkle_proof(digests: &[[u8; 32]], index: usize) -> Result<InclusionProof, AggregateError> {
    AggregateTree::build(digests)?.proof(index)
}
