//! Reconciler: re-derive every batch root, cross-check digest and batch
//! rows, flag stuck pending digests and chase unconfirmed batches on the
//! ledger.
//!
//! The only writes it performs are ledger-driven state advances, the same
//! ones a flush tick would make.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use stampd_core::{merkle_root, BatchState, ErrorCode};
use stampd_ledger::{Confirmation, LedgerClient, LedgerError};
use tracing::{debug, error, info, warn};

use crate::db::Store;
use crate::error::StoreError;

#[derive(Clone, Debug, Default)]
pub struct FsckOptions {
    /// Log every batch as it is checked.
    pub verbose: bool,
    /// Log batch roots and member digests.
    pub print_hashes: bool,
    /// Check local consistency only; do not query the ledger.
    pub skip_ledger: bool,
    /// Pending digests older than this are reported as stuck.
    /// `None` disables the check.
    pub stuck_after: Option<Duration>,
}

/// One problem found by a reconcile pass or a flush cycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FsckFinding {
    pub code: ErrorCode,
    /// Batch root or digest the finding is about.
    pub subject: Option<[u8; 32]>,
    pub detail: String,
}

impl FsckFinding {
    pub(crate) fn new(code: ErrorCode, subject: [u8; 32], detail: impl Into<String>) -> Self {
        Self {
            code,
            subject: Some(subject),
            detail: detail.into(),
        }
    }

    pub(crate) fn from_error(subject: Option<[u8; 32]>, err: &StoreError) -> Self {
        Self {
            code: err.code(),
            subject,
            detail: err.to_string(),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct FsckReport {
    pub batches_checked: usize,
    pub digests_checked: usize,
    pub pending: usize,
    pub findings: Vec<FsckFinding>,
    /// Batches this pass moved to `Confirmed`.
    pub confirmed: Vec<[u8; 32]>,
    /// Batches the ledger rejected during this pass, now `Failed`.
    pub failed: Vec<[u8; 32]>,
    pub still_unconfirmed: usize,
    pub ledger_errors: usize,
}

impl FsckReport {
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }

    pub fn count(&self, code: ErrorCode) -> usize {
        self.findings.iter().filter(|f| f.code == code).count()
    }
}

/// Result of polling the ledger for every `Submitted` batch.
#[derive(Debug, Default)]
pub(crate) struct ConfirmationProgress {
    pub confirmed: Vec<[u8; 32]>,
    pub failed: Vec<[u8; 32]>,
    pub still_unconfirmed: usize,
    pub ledger_errors: usize,
    pub anomalies: Vec<FsckFinding>,
}

/// Query the ledger for each `Submitted` batch and advance what it reports.
/// `Failed` batches are left for the submit path to retry.
pub(crate) fn advance_confirmations(
    store: &Store,
    ledger: &dyn LedgerClient,
) -> Result<ConfirmationProgress, StoreError> {
    let mut progress = ConfirmationProgress::default();
    for root in store.unconfirmed()? {
        let Some(rec) = store.get_batch(&root)? else {
            continue;
        };
        if rec.state != BatchState::Submitted {
            continue;
        }
        let Some(tx_id) = rec.tx_id.as_deref() else {
            progress.anomalies.push(FsckFinding::new(
                ErrorCode::StoreErrIntegrity,
                root,
                "submitted batch has no transaction id",
            ));
            continue;
        };
        match ledger.query(tx_id) {
            Ok(Confirmation::Confirmed { height, timestamp }) => {
                match store.mark_confirmed(&root, height, timestamp) {
                    Ok(()) => {
                        info!(root = %hex::encode(root), tx_id, height, timestamp, "batch confirmed");
                        progress.confirmed.push(root);
                    }
                    Err(e) if e.is_unavailable() => return Err(e),
                    Err(e) => progress.anomalies.push(FsckFinding::from_error(Some(root), &e)),
                }
            }
            Ok(Confirmation::Unconfirmed) => {
                debug!(root = %hex::encode(root), tx_id, "batch not yet confirmed");
                progress.still_unconfirmed += 1;
            }
            Err(e @ LedgerError::Unavailable(_)) => {
                warn!(root = %hex::encode(root), tx_id, error = %e, "ledger query failed; will retry");
                progress.ledger_errors += 1;
                progress.still_unconfirmed += 1;
            }
            Err(e @ LedgerError::Rejected(_)) => {
                warn!(root = %hex::encode(root), tx_id, error = %e, "ledger dropped transaction; batch will be resubmitted");
                progress.ledger_errors += 1;
                store.mark_failed(&root, &e.to_string())?;
                progress.failed.push(root);
            }
        }
    }
    Ok(progress)
}

/// Walk the whole store. `ledger` is consulted unless it is `None` or
/// `opts.skip_ledger` is set.
pub fn run_fsck(
    store: &Store,
    ledger: Option<&dyn LedgerClient>,
    now: i64,
    opts: &FsckOptions,
) -> Result<FsckReport, StoreError> {
    let mut report = FsckReport::default();

    // ── Batches: root re-derivation and member back-references ──────
    let mut roots = HashSet::new();
    let mut batches = Vec::new();
    store.iter_batches(|rec| {
        batches.push(rec);
        Ok(())
    })?;
    for rec in &batches {
        report.batches_checked += 1;
        roots.insert(rec.root);
        if opts.verbose {
            info!(
                root = %hex::encode(rec.root),
                state = %rec.state,
                members = rec.members.len(),
                "checking batch"
            );
        }
        if opts.print_hashes {
            for member in &rec.members {
                info!(root = %hex::encode(rec.root), member = %hex::encode(member), "batch member");
            }
        }
        let derived = merkle_root(&rec.members).ok();
        if derived != Some(rec.root) {
            error!(root = %hex::encode(rec.root), "stored root does not match members");
            report.findings.push(FsckFinding::from_error(
                Some(rec.root),
                &StoreError::CorruptBatch { root: rec.root },
            ));
        }
        for member in &rec.members {
            match store.get_digest(member)? {
                None => report.findings.push(FsckFinding::new(
                    ErrorCode::FsckErrOrphanDigest,
                    *member,
                    format!("member of batch {} has no digest row", hex::encode(rec.root)),
                )),
                Some(d) if d.batch != Some(rec.root) => report.findings.push(FsckFinding::new(
                    ErrorCode::FsckErrOrphanDigest,
                    *member,
                    format!(
                        "member of batch {} but digest row points at {}",
                        hex::encode(rec.root),
                        d.batch.map(hex::encode).unwrap_or_else(|| "pending".into())
                    ),
                )),
                Some(_) => {}
            }
        }
    }

    // ── Digests: foreign keys, pending index, stuck digests ─────────
    let mut pending_index = HashMap::new();
    store.iter_pending(|seq, digest| {
        pending_index.insert(seq, digest);
        Ok(())
    })?;
    let stuck_secs = opts
        .stuck_after
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX));
    let mut findings = Vec::new();
    store.iter_digests(|digest, rec| {
        report.digests_checked += 1;
        match rec.batch {
            Some(root) if !roots.contains(&root) => findings.push(FsckFinding::new(
                ErrorCode::FsckErrOrphanDigest,
                digest,
                format!("references missing batch {}", hex::encode(root)),
            )),
            Some(_) => {
                if pending_index.get(&rec.seq) == Some(&digest) {
                    findings.push(FsckFinding::new(
                        ErrorCode::FsckErrOrphanDigest,
                        digest,
                        "batched digest still in pending index",
                    ));
                }
            }
            None => {
                report.pending += 1;
                if pending_index.remove(&rec.seq) != Some(digest) {
                    findings.push(FsckFinding::new(
                        ErrorCode::FsckErrOrphanDigest,
                        digest,
                        format!("pending digest missing from pending index at seq {}", rec.seq),
                    ));
                }
                if let Some(limit) = stuck_secs {
                    let age = now.saturating_sub(rec.submitted_at);
                    if age > limit {
                        warn!(digest = %hex::encode(digest), age_secs = age, "digest stuck in pending");
                        findings.push(FsckFinding::new(
                            ErrorCode::FsckErrStuckDigest,
                            digest,
                            format!("pending for {age}s"),
                        ));
                    }
                }
            }
        }
        Ok(())
    })?;
    report.findings.append(&mut findings);
    for (seq, digest) in pending_index {
        // A batched digest still indexed under its own seq was reported above.
        let stale = match store.get_digest(&digest)? {
            Some(rec) => rec.batch.is_none() || rec.seq != seq,
            None => true,
        };
        if stale {
            report.findings.push(FsckFinding::new(
                ErrorCode::FsckErrOrphanDigest,
                digest,
                format!("pending index entry {seq} has no matching digest row"),
            ));
        }
    }

    // ── Ledger ──────────────────────────────────────────────────────
    if let Some(ledger) = ledger.filter(|_| !opts.skip_ledger) {
        let progress = advance_confirmations(store, ledger)?;
        report.confirmed = progress.confirmed;
        report.failed = progress.failed;
        report.still_unconfirmed = progress.still_unconfirmed;
        report.ledger_errors = progress.ledger_errors;
        report.findings.extend(progress.anomalies);
    }

    info!(
        batches = report.batches_checked,
        digests = report.digests_checked,
        pending = report.pending,
        findings = report.findings.len(),
        confirmed = report.confirmed.len(),
        "fsck finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{BatchRecord, DigestRecord};

    fn open_tmp() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open(&dir.path().join("stampd.redb")).expect("open");
        (dir, store)
    }

    #[test]
    fn test_fsck_clean_store() {
        let (_dir, store) = open_tmp();
        store.put(&[1u8; 32], 10).expect("put");
        store.put(&[2u8; 32], 11).expect("put");
        let wb = store.begin_write().expect("begin");
        let members = wb.pending_since(20).expect("pending");
        let root = wb.create_batch(&members, 20).expect("create");
        wb.assign_batch(&root, &members).expect("assign");
        wb.commit().expect("commit");
        store.put(&[3u8; 32], 30).expect("put");

        let report = run_fsck(&store, None, 40, &FsckOptions::default()).expect("fsck");
        assert!(report.is_clean(), "{:?}", report.findings);
        assert_eq!(report.batches_checked, 1);
        assert_eq!(report.digests_checked, 3);
        assert_eq!(report.pending, 1);
    }

    #[test]
    fn test_fsck_reports_orphan_digest() {
        let (_dir, store) = open_tmp();
        let wb = store.begin_write().expect("begin");
        wb.put_digest(
            &[5u8; 32],
            &DigestRecord {
                seq: 0,
                submitted_at: 1,
                batch: Some([0xee; 32]),
            },
        )
        .expect("digest");
        // Batch whose member has no digest row.
        wb.put_batch(&BatchRecord::new([6u8; 32], 1, vec![[6u8; 32]]))
            .expect("batch");
        wb.commit().expect("commit");

        let report = run_fsck(&store, None, 2, &FsckOptions::default()).expect("fsck");
        assert_eq!(report.count(ErrorCode::FsckErrOrphanDigest), 2);
        assert_eq!(report.count(ErrorCode::FsckErrCorruptBatch), 0);
    }
}
