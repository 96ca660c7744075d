//! AnchorStore: batches, their aggregate roots and ledger submission state.

use std::collections::HashSet;

use stampd_core::{merkle_root, BatchState};
use tracing::{info, warn};

use crate::db::{Store, WriteBatch};
use crate::error::{integrity, StoreError};
use crate::keys::BatchRecord;

impl WriteBatch {
    /// Aggregate `members` and persist the batch as `Unsubmitted`.
    /// Returns the new root. Member assignment is the caller's job and
    /// belongs in the same write batch.
    pub fn create_batch(
        &self,
        members: &[[u8; 32]],
        flushed_at: i64,
    ) -> Result<[u8; 32], StoreError> {
        let root = merkle_root(members)?;
        let mut seen = HashSet::with_capacity(members.len());
        for member in members {
            if !seen.insert(*member) {
                return Err(integrity(format!(
                    "create batch: duplicate member {}",
                    hex::encode(member)
                )));
            }
        }
        if let Some(existing) = self.get_batch(&root)? {
            warn!(
                root = %hex::encode(root),
                existing_members = existing.members.len(),
                members = members.len(),
                "aggregate root already stored; refusing to merge"
            );
            return Err(StoreError::DuplicateRoot { root });
        }
        self.put_batch(&BatchRecord::new(root, flushed_at, members.to_vec()))?;
        self.put_flush_index(flushed_at, &root)?;
        Ok(root)
    }

    /// Load `root`, check the move to `to` is legal, apply `update` and write
    /// the record back.
    fn transition<F>(&self, root: &[u8; 32], to: BatchState, update: F) -> Result<BatchRecord, StoreError>
    where
        F: FnOnce(&mut BatchRecord),
    {
        let mut rec = self
            .get_batch(root)?
            .ok_or(StoreError::BatchNotFound { root: *root })?;
        if !rec.state.can_transition_to(to) {
            return Err(StoreError::InvalidTransition {
                root: *root,
                from: rec.state,
                to,
            });
        }
        rec.state = to;
        update(&mut rec);
        self.put_batch(&rec)?;
        Ok(rec)
    }

    pub fn mark_submitted(&self, root: &[u8; 32], tx_id: &str) -> Result<(), StoreError> {
        self.transition(root, BatchState::Submitted, |rec| {
            rec.tx_id = Some(tx_id.to_string());
            rec.failure = None;
        })?;
        Ok(())
    }

    /// Record ledger confirmation. Repeating an identical confirmation is a
    /// no-op; a different height or time is a `ConflictingConfirmation`.
    pub fn mark_confirmed(&self, root: &[u8; 32], height: i64, time: i64) -> Result<(), StoreError> {
        let rec = self
            .get_batch(root)?
            .ok_or(StoreError::BatchNotFound { root: *root })?;
        if rec.state == BatchState::Confirmed {
            let stored = (rec.chain_height.unwrap_or_default(), rec.chain_time.unwrap_or_default());
            if stored == (height, time) {
                return Ok(());
            }
            warn!(
                root = %hex::encode(root),
                stored_height = stored.0,
                height,
                "ledger reports a different confirmation"
            );
            return Err(StoreError::ConflictingConfirmation {
                root: *root,
                stored_height: stored.0,
                stored_time: stored.1,
                height,
                time,
            });
        }
        self.transition(root, BatchState::Confirmed, |rec| {
            rec.chain_height = Some(height);
            rec.chain_time = Some(time);
        })?;
        Ok(())
    }

    pub fn mark_failed(&self, root: &[u8; 32], reason: &str) -> Result<(), StoreError> {
        self.transition(root, BatchState::Failed, |rec| {
            rec.failure = Some(reason.to_string());
        })?;
        Ok(())
    }

    /// Move a `Failed` batch back to `Unsubmitted`. The stale tx id is
    /// cleared; the failure reason stays until the next submission succeeds.
    pub fn retry_failed(&self, root: &[u8; 32]) -> Result<(), StoreError> {
        self.transition(root, BatchState::Unsubmitted, |rec| {
            rec.tx_id = None;
        })?;
        Ok(())
    }
}

impl Store {
    /// `CreateBatch` on its own transaction. The flush cycle instead calls
    /// [`WriteBatch::create_batch`] together with member assignment.
    pub fn create_batch(&self, members: &[[u8; 32]], flushed_at: i64) -> Result<[u8; 32], StoreError> {
        let wb = self.begin_write()?;
        let root = wb.create_batch(members, flushed_at)?;
        wb.commit()?;
        info!(root = %hex::encode(root), members = members.len(), "batch created");
        Ok(root)
    }

    pub fn mark_submitted(&self, root: &[u8; 32], tx_id: &str) -> Result<(), StoreError> {
        let wb = self.begin_write()?;
        wb.mark_submitted(root, tx_id)?;
        wb.commit()
    }

    pub fn mark_confirmed(&self, root: &[u8; 32], height: i64, time: i64) -> Result<(), StoreError> {
        let wb = self.begin_write()?;
        wb.mark_confirmed(root, height, time)?;
        wb.commit()
    }

    pub fn mark_failed(&self, root: &[u8; 32], reason: &str) -> Result<(), StoreError> {
        let wb = self.begin_write()?;
        wb.mark_failed(root, reason)?;
        wb.commit()
    }

    pub fn retry_failed(&self, root: &[u8; 32]) -> Result<(), StoreError> {
        let wb = self.begin_write()?;
        wb.retry_failed(root)?;
        wb.commit()
    }

    /// Batches in `Submitted` or `Failed` state, oldest flush first.
    pub fn unconfirmed(&self) -> Result<Vec<[u8; 32]>, StoreError> {
        self.roots_in_flush_order(BatchState::is_unconfirmed)
    }

    /// Batches persisted but never handed to the ledger, oldest flush first.
    pub fn unsubmitted(&self) -> Result<Vec<[u8; 32]>, StoreError> {
        self.roots_in_flush_order(|s| s == BatchState::Unsubmitted)
    }

    pub(crate) fn roots_in_flush_order<P>(&self, keep: P) -> Result<Vec<[u8; 32]>, StoreError>
    where
        P: Fn(BatchState) -> bool,
    {
        let mut out = Vec::new();
        for (_, root) in self.batch_roots_by_flush()? {
            let rec = self
                .get_batch(&root)?
                .ok_or_else(|| integrity(format!("flush index names unknown batch {}", hex::encode(root))))?;
            if keep(rec.state) {
                out.push(root);
            }
        }
        Ok(out)
    }
}
