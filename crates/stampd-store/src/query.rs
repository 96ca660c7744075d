//! Client-facing reads: digest status with inclusion proofs, the latest
//! confirmed anchor, and per-flush collections.

use std::collections::HashMap;

use stampd_core::{AggregateTree, BatchState, InclusionProof};

use crate::db::Store;
use crate::error::{integrity, StoreError};
use crate::keys::BatchRecord;

/// Ledger-facing view of a batch, without its member list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchInfo {
    pub root: [u8; 32],
    pub state: BatchState,
    pub flushed_at: i64,
    pub tx_id: Option<String>,
    pub chain_height: Option<i64>,
    pub chain_time: Option<i64>,
}

impl From<&BatchRecord> for BatchInfo {
    fn from(rec: &BatchRecord) -> Self {
        Self {
            root: rec.root,
            state: rec.state,
            flushed_at: rec.flushed_at,
            tx_id: rec.tx_id.clone(),
            chain_height: rec.chain_height,
            chain_time: rec.chain_time,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DigestStatus {
    NotFound,
    Pending {
        submitted_at: i64,
    },
    Anchored {
        submitted_at: i64,
        batch: BatchInfo,
        proof: InclusionProof,
    },
}

/// Digests closed into one batch at one flush time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Collection {
    pub flushed_at: i64,
    pub batch: BatchInfo,
    pub digests: Vec<[u8; 32]>,
}

impl Store {
    pub fn lookup_status(&self, digest: &[u8; 32]) -> Result<DigestStatus, StoreError> {
        let mut out = self.get_many(std::slice::from_ref(digest))?;
        out.pop()
            .ok_or_else(|| integrity("lookup: no status for requested digest"))
    }

    /// Status of each digest, in request order. Digests sharing a batch share
    /// one tree build.
    pub fn get_many(&self, digests: &[[u8; 32]]) -> Result<Vec<DigestStatus>, StoreError> {
        let mut trees: HashMap<[u8; 32], (BatchRecord, AggregateTree)> = HashMap::new();
        let mut out = Vec::with_capacity(digests.len());
        for digest in digests {
            let Some(rec) = self.get_digest(digest)? else {
                out.push(DigestStatus::NotFound);
                continue;
            };
            let Some(root) = rec.batch else {
                out.push(DigestStatus::Pending {
                    submitted_at: rec.submitted_at,
                });
                continue;
            };
            if !trees.contains_key(&root) {
                let batch = self
                    .get_batch(&root)?
                    .ok_or(StoreError::BatchNotFound { root })?;
                let tree = AggregateTree::build(&batch.members)?;
                trees.insert(root, (batch, tree));
            }
            let Some((batch, tree)) = trees.get(&root) else {
                continue;
            };
            let index = batch
                .members
                .iter()
                .position(|m| m == digest)
                .ok_or_else(|| {
                    integrity(format!(
                        "digest {} not among members of batch {}",
                        hex::encode(digest),
                        hex::encode(root)
                    ))
                })?;
            out.push(DigestStatus::Anchored {
                submitted_at: rec.submitted_at,
                batch: BatchInfo::from(batch),
                proof: tree.proof(index)?,
            });
        }
        Ok(out)
    }

    /// Most recently closed batch that the ledger has confirmed.
    pub fn last_anchor(&self) -> Result<Option<BatchInfo>, StoreError> {
        self.find_latest_batch(|b| (b.state == BatchState::Confirmed).then(|| BatchInfo::from(b)))
    }

    /// Batches closed at each of `flush_times`, with their members. Times
    /// with no batch are skipped.
    pub fn collections(&self, flush_times: &[i64]) -> Result<Vec<Collection>, StoreError> {
        let mut out = Vec::new();
        for &t in flush_times {
            for root in self.batch_roots_flushed_at(t)? {
                let batch = self
                    .get_batch(&root)?
                    .ok_or(StoreError::BatchNotFound { root })?;
                out.push(Collection {
                    flushed_at: t,
                    batch: BatchInfo::from(&batch),
                    digests: batch.members,
                });
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_many_mixes_states_and_proves_members() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open(&dir.path().join("stampd.redb")).expect("open");
        for (i, d) in [[1u8; 32], [2u8; 32], [3u8; 32]].iter().enumerate() {
            store.put(d, i as i64).expect("put");
        }
        let wb = store.begin_write().expect("begin");
        let members = wb.pending_since(10).expect("pending");
        let root = wb.create_batch(&members, 10).expect("create");
        wb.assign_batch(&root, &members).expect("assign");
        wb.commit().expect("commit");
        store.put(&[4u8; 32], 11).expect("put");

        let statuses = store
            .get_many(&[[3u8; 32], [4u8; 32], [9u8; 32], [1u8; 32]])
            .expect("get_many");
        assert_eq!(statuses[1], DigestStatus::Pending { submitted_at: 11 });
        assert_eq!(statuses[2], DigestStatus::NotFound);
        for status in [&statuses[0], &statuses[3]] {
            match status {
                DigestStatus::Anchored { batch, proof, .. } => {
                    assert_eq!(batch.root, root);
                    assert_eq!(batch.state, BatchState::Unsubmitted);
                    assert!(proof.verify(&root));
                }
                other => panic!("expected anchored, got {other:?}"),
            }
        }
        assert_eq!(store.last_anchor().expect("last"), None);
        assert_eq!(store.collections(&[10]).expect("collections")[0].digests, members);
        assert!(store.collections(&[11]).expect("collections").is_empty());
    }
}
