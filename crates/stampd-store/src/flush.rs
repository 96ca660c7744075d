//! FlushEngine: closes pending digests into batches and anchors them.
//!
//! One cycle, run under the flush gate:
//!
//! 1. snapshot pending digests; if there are none no batch is created;
//! 2. create the batch and assign its members in a single write
//!    transaction, bumping the flush commit counter;
//! 3. submit every `Unsubmitted` batch, retrying `Failed` ones first;
//! 4. poll the ledger for every `Submitted` batch.
//!
//! A tick arriving while a cycle is running is dropped, never queued.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use stampd_core::constants::{DEFAULT_FLUSH_PERIOD_SECS, DEFAULT_STUCK_MULTIPLE};
use stampd_core::BatchState;
use stampd_ledger::LedgerClient;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::db::Store;
use crate::digests::PutResult;
use crate::error::StoreError;
use crate::fsck::{advance_confirmations, run_fsck, FsckFinding, FsckOptions, FsckReport};
use crate::query::Collection;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlushConfig {
    pub period: Duration,
    /// Pending digests older than `stuck_multiple * period` are stuck.
    pub stuck_multiple: u32,
    pub enable_collections: bool,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(DEFAULT_FLUSH_PERIOD_SECS),
            stuck_multiple: DEFAULT_STUCK_MULTIPLE,
            enable_collections: false,
        }
    }
}

impl FlushConfig {
    pub fn stuck_after(&self) -> Duration {
        self.period.saturating_mul(self.stuck_multiple)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FlushPhase {
    Idle = 0,
    Collecting = 1,
    Building = 2,
    Submitting = 3,
    AwaitingConfirmation = 4,
}

impl FlushPhase {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Collecting,
            2 => Self::Building,
            3 => Self::Submitting,
            4 => Self::AwaitingConfirmation,
            _ => Self::Idle,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FlushPhase::Idle => "idle",
            FlushPhase::Collecting => "collecting",
            FlushPhase::Building => "building",
            FlushPhase::Submitting => "submitting",
            FlushPhase::AwaitingConfirmation => "awaiting-confirmation",
        }
    }
}

/// Resets the published phase to `Idle` on every exit path, unwinding
/// included.
struct PhaseGuard<'a>(&'a AtomicU8);

impl<'a> PhaseGuard<'a> {
    fn enter(phase: &'a AtomicU8) -> Self {
        phase.store(FlushPhase::Collecting as u8, Ordering::SeqCst);
        Self(phase)
    }

    fn set(&self, phase: FlushPhase) {
        self.0.store(phase as u8, Ordering::SeqCst);
    }
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        self.0.store(FlushPhase::Idle as u8, Ordering::SeqCst);
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Another cycle holds the gate; this tick was dropped.
    Busy,
    /// The engine has been drained for shutdown.
    Closed,
    Completed(FlushSummary),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FlushSummary {
    pub flushed_at: i64,
    /// Batch closed by this cycle, if any digests were pending.
    pub batch: Option<[u8; 32]>,
    pub digests: usize,
    /// Flush commit counter after this cycle's batch.
    pub commit: Option<u64>,
    pub submitted: Vec<[u8; 32]>,
    pub failed: Vec<[u8; 32]>,
    pub confirmed: Vec<[u8; 32]>,
    pub still_unconfirmed: usize,
    pub ledger_errors: usize,
    pub anomalies: Vec<FsckFinding>,
}

/// Owns the flush gate and every collaborator a cycle needs.
pub struct FlushEngine {
    store: Arc<Store>,
    ledger: Arc<dyn LedgerClient>,
    clock: Arc<dyn Clock>,
    cfg: FlushConfig,
    gate: Mutex<()>,
    closed: AtomicBool,
    phase: AtomicU8,
}

impl FlushEngine {
    pub fn new(
        store: Arc<Store>,
        ledger: Arc<dyn LedgerClient>,
        clock: Arc<dyn Clock>,
        cfg: FlushConfig,
    ) -> Self {
        Self {
            store,
            ledger,
            clock,
            cfg,
            gate: Mutex::new(()),
            closed: AtomicBool::new(false),
            phase: AtomicU8::new(FlushPhase::Idle as u8),
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn config(&self) -> &FlushConfig {
        &self.cfg
    }

    pub fn phase(&self) -> FlushPhase {
        FlushPhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Submit a digest. Never waits on the flush gate.
    pub fn put(&self, digest: &[u8; 32]) -> Result<PutResult, StoreError> {
        self.store.put(digest, self.clock.now())
    }

    pub fn put_many(&self, digests: &[[u8; 32]]) -> Result<Vec<PutResult>, StoreError> {
        self.store.put_many(digests, self.clock.now())
    }

    /// Run one flush cycle unless one is already running.
    pub fn flush(&self) -> Result<FlushOutcome, StoreError> {
        if self.is_closed() {
            return Ok(FlushOutcome::Closed);
        }
        let Some(_gate) = self.gate.try_lock() else {
            warn!(phase = self.phase().as_str(), "flush already in progress; tick dropped");
            return Ok(FlushOutcome::Busy);
        };
        if self.is_closed() {
            return Ok(FlushOutcome::Closed);
        }
        let phase = PhaseGuard::enter(&self.phase);
        let summary = self.run_cycle(&phase)?;
        Ok(FlushOutcome::Completed(summary))
    }

    /// Wait for any running cycle to finish, then refuse new ones. Callers
    /// drop the store only after this returns.
    pub fn drain(&self) {
        let _gate = self.gate.lock();
        self.closed.store(true, Ordering::SeqCst);
        info!("flush engine drained");
    }

    /// Reconcile the store. Holds the flush gate so it never interleaves
    /// with a cycle.
    pub fn fsck(&self, opts: &FsckOptions) -> Result<FsckReport, StoreError> {
        let _gate = self.gate.lock();
        let mut opts = opts.clone();
        if opts.stuck_after.is_none() {
            opts.stuck_after = Some(self.cfg.stuck_after());
        }
        run_fsck(&self.store, Some(&*self.ledger), self.clock.now(), &opts)
    }

    /// Digests of the batches closed at each of `flush_times`.
    pub fn get_timestamps(&self, flush_times: &[i64]) -> Result<Vec<Collection>, StoreError> {
        if !self.cfg.enable_collections {
            return Err(StoreError::CollectionsDisabled);
        }
        self.store.collections(flush_times)
    }

    fn run_cycle(&self, phase: &PhaseGuard<'_>) -> Result<FlushSummary, StoreError> {
        let now = self.clock.now();
        let mut summary = FlushSummary {
            flushed_at: now,
            ..FlushSummary::default()
        };

        match self.close_batch(now, phase) {
            Ok(Some((root, digests, commit))) => {
                summary.batch = Some(root);
                summary.digests = digests;
                summary.commit = Some(commit);
            }
            Ok(None) => debug!(flushed_at = now, "no pending digests; no batch this tick"),
            Err(e) if e.is_unavailable() => return Err(e),
            Err(e) => {
                error!(code = %e.code(), error = %e, "batch closure aborted; digests stay pending");
                summary.anomalies.push(FsckFinding::from_error(None, &e));
            }
        }

        phase.set(FlushPhase::Submitting);
        self.submit_outstanding(&mut summary)?;

        phase.set(FlushPhase::AwaitingConfirmation);
        let progress = advance_confirmations(&self.store, &*self.ledger)?;
        summary.confirmed = progress.confirmed;
        summary.failed.extend(progress.failed);
        summary.still_unconfirmed = progress.still_unconfirmed;
        summary.ledger_errors += progress.ledger_errors;
        summary.anomalies.extend(progress.anomalies);

        info!(
            flushed_at = now,
            digests = summary.digests,
            submitted = summary.submitted.len(),
            failed = summary.failed.len(),
            confirmed = summary.confirmed.len(),
            unconfirmed = summary.still_unconfirmed,
            "flush cycle complete"
        );
        Ok(summary)
    }

    /// Steps 1 and 2: one write transaction covers the pending snapshot,
    /// batch creation, member assignment and the commit counter.
    fn close_batch(
        &self,
        now: i64,
        phase: &PhaseGuard<'_>,
    ) -> Result<Option<([u8; 32], usize, u64)>, StoreError> {
        let wb = self.store.begin_write()?;
        let members = wb.pending_since(now)?;
        if members.is_empty() {
            return Ok(None);
        }
        phase.set(FlushPhase::Building);
        let root = wb.create_batch(&members, now)?;
        wb.assign_batch(&root, &members)?;
        let commit = wb.bump_flush_commit()?;
        wb.commit()?;
        info!(
            root = %hex::encode(root),
            members = members.len(),
            commit,
            "batch closed"
        );
        Ok(Some((root, members.len(), commit)))
    }

    /// Submit batches that have not reached the ledger: ones left
    /// `Unsubmitted` (this cycle's, or a crash between closure and submit)
    /// and `Failed` ones, which are retried every tick.
    fn submit_outstanding(&self, summary: &mut FlushSummary) -> Result<(), StoreError> {
        let outstanding = self
            .store
            .roots_in_flush_order(|s| matches!(s, BatchState::Unsubmitted | BatchState::Failed))?;
        for root in outstanding {
            let Some(rec) = self.store.get_batch(&root)? else {
                continue;
            };
            if rec.state == BatchState::Failed {
                debug!(root = %hex::encode(root), reason = ?rec.failure, "retrying failed batch");
                self.store.retry_failed(&root)?;
            }
            match self.ledger.submit(&root) {
                Ok(tx_id) => {
                    self.store.mark_submitted(&root, &tx_id)?;
                    info!(root = %hex::encode(root), %tx_id, "batch submitted");
                    summary.submitted.push(root);
                }
                Err(e) => {
                    warn!(root = %hex::encode(root), code = %e.code(), error = %e, "ledger submit failed; retry next tick");
                    self.store.mark_failed(&root, &e.to_string())?;
                    summary.ledger_errors += 1;
                    summary.failed.push(root);
                }
            }
        }
        Ok(())
    }
}
