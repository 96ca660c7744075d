//! DigestStore: durable, idempotent record of submitted digests.

use tracing::debug;

use crate::db::{Store, WriteBatch};
use crate::error::{integrity, StoreError};
use crate::keys::DigestRecord;

/// Outcome of submitting one digest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PutResult {
    pub digest: [u8; 32],
    /// The digest was already stored; nothing was written for it.
    pub already_existed: bool,
    /// Submission time of the stored row (the original one for duplicates).
    pub submitted_at: i64,
    pub batch: Option<[u8; 32]>,
}

impl Store {
    /// Insert `digest` if absent. Resubmitting a known digest, pending or
    /// batched, returns its existing state instead of an error.
    pub fn put(&self, digest: &[u8; 32], now: i64) -> Result<PutResult, StoreError> {
        let mut results = self.put_many(std::slice::from_ref(digest), now)?;
        results
            .pop()
            .ok_or_else(|| integrity("put: no result for submitted digest"))
    }

    /// Insert every digest in one transaction. Duplicates inside `digests`
    /// are reported as already existing after their first occurrence.
    pub fn put_many(&self, digests: &[[u8; 32]], now: i64) -> Result<Vec<PutResult>, StoreError> {
        let wb = self.begin_write()?;
        let mut results = Vec::with_capacity(digests.len());
        for digest in digests {
            results.push(wb.put_if_absent(digest, now)?);
        }
        wb.commit()?;
        let fresh = results.iter().filter(|r| !r.already_existed).count();
        debug!(submitted = digests.len(), fresh, "stored digests");
        Ok(results)
    }

    /// Unbatched digests submitted at or before `cutoff`, in submission order.
    pub fn pending_since(&self, cutoff: i64) -> Result<Vec<[u8; 32]>, StoreError> {
        let mut seqs = Vec::new();
        self.iter_pending(|seq, digest| {
            seqs.push((seq, digest));
            Ok(())
        })?;
        let mut out = Vec::with_capacity(seqs.len());
        for (seq, digest) in seqs {
            let rec = self.get_digest(&digest)?.ok_or_else(|| {
                integrity(format!(
                    "pending seq {seq} names unknown digest {}",
                    hex::encode(digest)
                ))
            })?;
            if rec.submitted_at <= cutoff {
                out.push(digest);
            }
        }
        Ok(out)
    }

    /// Stored state of `digest`, including its batch if it has one.
    pub fn lookup(&self, digest: &[u8; 32]) -> Result<Option<DigestRecord>, StoreError> {
        self.get_digest(digest)
    }

    /// Assign `digests` to the existing batch `root` in a transaction of
    /// its own. All or nothing.
    pub fn assign_batch(&self, root: &[u8; 32], digests: &[[u8; 32]]) -> Result<(), StoreError> {
        let wb = self.begin_write()?;
        wb.assign_batch(root, digests)?;
        wb.commit()
    }
}

impl WriteBatch {
    pub fn put_if_absent(&self, digest: &[u8; 32], now: i64) -> Result<PutResult, StoreError> {
        if let Some(existing) = self.get_digest(digest)? {
            return Ok(PutResult {
                digest: *digest,
                already_existed: true,
                submitted_at: existing.submitted_at,
                batch: existing.batch,
            });
        }
        let seq = self.next_seq()?;
        self.put_digest(
            digest,
            &DigestRecord {
                seq,
                submitted_at: now,
                batch: None,
            },
        )?;
        self.put_pending(seq, digest)?;
        Ok(PutResult {
            digest: *digest,
            already_existed: false,
            submitted_at: now,
            batch: None,
        })
    }

    /// Pending digests with `submitted_at <= cutoff`, in submission order,
    /// as seen by this transaction.
    pub fn pending_since(&self, cutoff: i64) -> Result<Vec<[u8; 32]>, StoreError> {
        let mut out = Vec::new();
        for (seq, digest) in self.pending()? {
            let rec = self.get_digest(&digest)?.ok_or_else(|| {
                integrity(format!(
                    "pending seq {seq} names unknown digest {}",
                    hex::encode(digest)
                ))
            })?;
            if rec.submitted_at <= cutoff {
                out.push(digest);
            }
        }
        Ok(out)
    }

    /// Mark `digests` as members of batch `root`. Fails without partial
    /// effect (once the caller drops the batch) if the batch is missing or
    /// any digest is unknown or already batched.
    pub fn assign_batch(&self, root: &[u8; 32], digests: &[[u8; 32]]) -> Result<(), StoreError> {
        if self.get_batch(root)?.is_none() {
            return Err(StoreError::BatchNotFound { root: *root });
        }
        for digest in digests {
            let mut rec = self.get_digest(digest)?.ok_or_else(|| {
                integrity(format!("assign: unknown digest {}", hex::encode(digest)))
            })?;
            if let Some(existing) = rec.batch {
                return Err(integrity(format!(
                    "assign: digest {} already in batch {}",
                    hex::encode(digest),
                    hex::encode(existing)
                )));
            }
            if !self.delete_pending(rec.seq)? {
                return Err(integrity(format!(
                    "assign: digest {} missing from pending index",
                    hex::encode(digest)
                )));
            }
            rec.batch = Some(*root);
            self.put_digest(digest, &rec)?;
        }
        Ok(())
    }
}
