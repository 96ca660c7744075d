use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use stampd_core::{merkle_root, BatchState, ErrorCode};
use stampd_ledger::{Confirmation, LedgerClient, LedgerError, MemLedger};
use stampd_store::{
    dump, restore, run_fsck, BatchRecord, DigestStatus, FlushConfig, FlushEngine, FlushOutcome,
    FlushPhase, FlushSummary, FsckOptions, ManualClock, Store, StoreError,
};

const A: [u8; 32] = [0xaa; 32];
const B: [u8; 32] = [0xbb; 32];
const C: [u8; 32] = [0xcc; 32];
const D: [u8; 32] = [0xdd; 32];

struct Harness {
    _dir: tempfile::TempDir,
    ledger: Arc<MemLedger>,
    clock: Arc<ManualClock>,
    engine: FlushEngine,
}

fn harness_with(cfg: FlushConfig) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(Store::open(&dir.path().join("stampd.redb")).expect("open"));
    let ledger = Arc::new(MemLedger::new());
    let clock = Arc::new(ManualClock::new(1_000));
    let engine = FlushEngine::new(store, ledger.clone(), clock.clone(), cfg);
    Harness {
        _dir: dir,
        ledger,
        clock,
        engine,
    }
}

fn harness() -> Harness {
    harness_with(FlushConfig::default())
}

fn completed(outcome: FlushOutcome) -> FlushSummary {
    match outcome {
        FlushOutcome::Completed(summary) => summary,
        other => panic!("expected completed flush, got {other:?}"),
    }
}

fn state_of(engine: &FlushEngine, root: &[u8; 32]) -> BatchRecord {
    engine
        .store()
        .get_batch(root)
        .expect("get batch")
        .expect("batch present")
}

#[test]
fn abc_batch_is_submitted_then_confirmed() {
    let h = harness();
    for d in [A, B, C] {
        h.engine.put(&d).expect("put");
        h.clock.advance(1);
    }

    h.clock.set(3_610);
    let first = completed(h.engine.flush().expect("flush"));
    let root = merkle_root(&[A, B, C]).expect("root");
    assert_eq!(first.batch, Some(root));
    assert_eq!(first.digests, 3);
    assert_eq!(first.commit, Some(1));
    assert_eq!(first.submitted, vec![root]);
    assert_eq!(first.still_unconfirmed, 1);

    let rec = state_of(&h.engine, &root);
    assert_eq!(rec.state, BatchState::Submitted);
    assert_eq!(rec.tx_id.as_deref(), Some("tx1"));
    assert_eq!(rec.members, vec![A, B, C]);
    assert_eq!(rec.flushed_at, 3_610);

    assert!(h.ledger.confirm("tx1", 100, 3_700));
    h.clock.set(7_210);
    let second = completed(h.engine.flush().expect("flush"));
    assert_eq!(second.batch, None);
    assert_eq!(second.confirmed, vec![root]);

    let rec = state_of(&h.engine, &root);
    assert_eq!(rec.state, BatchState::Confirmed);
    assert_eq!((rec.chain_height, rec.chain_time), (Some(100), Some(3_700)));

    match h.engine.store().lookup_status(&B).expect("lookup") {
        DigestStatus::Anchored { batch, proof, .. } => {
            assert_eq!(batch.root, root);
            assert_eq!(batch.chain_height, Some(100));
            assert!(proof.verify(&root));
        }
        other => panic!("expected anchored, got {other:?}"),
    }
    let last = h.engine.store().last_anchor().expect("last anchor");
    assert_eq!(last.map(|b| b.root), Some(root));
    assert_eq!(h.ledger.submit_calls(), 1);
}

#[test]
fn empty_window_creates_no_batch() {
    let h = harness();
    let summary = completed(h.engine.flush().expect("flush"));
    assert_eq!(summary.batch, None);
    assert_eq!(h.engine.store().counts().expect("counts").batches, 0);
    assert_eq!(h.engine.store().flush_commit().expect("commit"), 0);
    assert_eq!(h.ledger.submit_calls(), 0);
}

#[test]
fn resubmitted_digest_keeps_its_batch() {
    let h = harness();
    h.engine.put(&A).expect("put");
    let root = completed(h.engine.flush().expect("flush"))
        .batch
        .expect("batch");

    let again = h.engine.put(&A).expect("put again");
    assert!(again.already_existed);
    assert_eq!(again.batch, Some(root));
    assert_eq!(h.engine.store().counts().expect("counts").digests, 1);

    let next = completed(h.engine.flush().expect("flush"));
    assert_eq!(next.batch, None);
    assert_eq!(h.engine.store().counts().expect("counts").batches, 1);
}

#[test]
fn crash_between_create_and_assign_leaves_nothing_behind() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("stampd.redb");
    let orphan_root;
    {
        let store = Store::open(&path).expect("open");
        store.put(&A, 1).expect("put");
        store.put(&B, 2).expect("put");
        let wb = store.begin_write().expect("begin");
        let members = wb.pending_since(10).expect("pending");
        orphan_root = wb.create_batch(&members, 10).expect("create");
        // Process dies before assignment and commit.
        drop(wb);
    }

    let store = Arc::new(Store::open(&path).expect("reopen"));
    assert_eq!(store.get_batch(&orphan_root).expect("get"), None);
    assert_eq!(store.pending_since(10).expect("pending"), vec![A, B]);
    let report = run_fsck(&store, None, 10, &FsckOptions::default()).expect("fsck");
    assert!(report.is_clean(), "{:?}", report.findings);

    let engine = FlushEngine::new(
        store.clone(),
        Arc::new(MemLedger::new()),
        Arc::new(ManualClock::new(20)),
        FlushConfig::default(),
    );
    let root = completed(engine.flush().expect("flush")).batch.expect("batch");
    assert_eq!(root, orphan_root);
    for d in [A, B] {
        assert_eq!(store.lookup(&d).expect("lookup").expect("row").batch, Some(root));
    }
    let report = run_fsck(&store, None, 20, &FsckOptions::default()).expect("fsck");
    assert!(report.is_clean(), "{:?}", report.findings);
}

#[test]
fn failed_submission_is_retried_next_tick() {
    let h = harness();
    h.ledger.fail_next_submits(1);
    h.engine.put(&A).expect("put");

    let first = completed(h.engine.flush().expect("flush"));
    let root = first.batch.expect("batch");
    assert_eq!(first.failed, vec![root]);
    assert_eq!(first.ledger_errors, 1);
    let rec = state_of(&h.engine, &root);
    assert_eq!(rec.state, BatchState::Failed);
    assert!(rec.failure.is_some());

    h.clock.advance(3_600);
    let second = completed(h.engine.flush().expect("flush"));
    assert_eq!(second.submitted, vec![root]);
    let rec = state_of(&h.engine, &root);
    assert_eq!(rec.state, BatchState::Submitted);
    assert_eq!(rec.tx_id.as_deref(), Some("tx1"));
    assert_eq!(rec.failure, None);
}

#[test]
fn dropped_transaction_is_resubmitted() {
    let h = harness();
    h.engine.put(&A).expect("put");
    let root = completed(h.engine.flush().expect("flush"))
        .batch
        .expect("batch");

    // Transient query failure: batch stays submitted.
    h.ledger.fail_next_queries(1);
    let summary = completed(h.engine.flush().expect("flush"));
    assert_eq!(summary.ledger_errors, 1);
    assert_eq!(state_of(&h.engine, &root).state, BatchState::Submitted);

    assert!(h.ledger.drop_tx("tx1"));
    let summary = completed(h.engine.flush().expect("flush"));
    assert_eq!(summary.failed, vec![root]);
    assert_eq!(state_of(&h.engine, &root).state, BatchState::Failed);

    let summary = completed(h.engine.flush().expect("flush"));
    assert_eq!(summary.submitted, vec![root]);
    assert_eq!(state_of(&h.engine, &root).tx_id.as_deref(), Some("tx2"));

    assert!(h.ledger.confirm("tx2", 7, 42));
    let summary = completed(h.engine.flush().expect("flush"));
    assert_eq!(summary.confirmed, vec![root]);
}

/// Ledger whose `submit` parks until the test releases it.
struct GatedLedger {
    inner: MemLedger,
    entered: Mutex<mpsc::Sender<()>>,
    release: Mutex<mpsc::Receiver<()>>,
}

impl LedgerClient for GatedLedger {
    fn submit(&self, root: &[u8; 32]) -> Result<String, LedgerError> {
        let _ = self.entered.lock().unwrap().send(());
        let _ = self.release.lock().unwrap().recv();
        self.inner.submit(root)
    }

    fn query(&self, tx_id: &str) -> Result<Confirmation, LedgerError> {
        self.inner.query(tx_id)
    }
}

#[test]
fn concurrent_tick_is_dropped() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(Store::open(&dir.path().join("stampd.redb")).expect("open"));
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let ledger = Arc::new(GatedLedger {
        inner: MemLedger::new(),
        entered: Mutex::new(entered_tx),
        release: Mutex::new(release_rx),
    });
    let engine = Arc::new(FlushEngine::new(
        store.clone(),
        ledger,
        Arc::new(ManualClock::new(100)),
        FlushConfig::default(),
    ));
    for d in [A, B, C] {
        engine.put(&d).expect("put");
    }

    let worker = {
        let engine = engine.clone();
        thread::spawn(move || engine.flush())
    };
    entered_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("first flush reached submit");
    assert_eq!(engine.phase(), FlushPhase::Submitting);

    assert_eq!(engine.flush().expect("second flush"), FlushOutcome::Busy);
    // Submission does not wait on the gate.
    engine.put(&D).expect("put during flush");

    release_tx.send(()).expect("release");
    let first = completed(worker.join().expect("join").expect("flush"));
    assert_eq!(first.digests, 3);
    assert_eq!(store.counts().expect("counts").batches, 1);
    assert_eq!(store.pending_since(100).expect("pending"), vec![D]);
    assert_eq!(engine.phase(), FlushPhase::Idle);
}

#[test]
fn drain_waits_for_running_cycle() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(Store::open(&dir.path().join("stampd.redb")).expect("open"));
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let ledger = Arc::new(GatedLedger {
        inner: MemLedger::new(),
        entered: Mutex::new(entered_tx),
        release: Mutex::new(release_rx),
    });
    let engine = Arc::new(FlushEngine::new(
        store.clone(),
        ledger,
        Arc::new(ManualClock::new(100)),
        FlushConfig::default(),
    ));
    engine.put(&A).expect("put");

    let worker = {
        let engine = engine.clone();
        thread::spawn(move || engine.flush())
    };
    entered_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("flush reached submit");
    let drainer = {
        let engine = engine.clone();
        thread::spawn(move || engine.drain())
    };
    release_tx.send(()).expect("release");
    drainer.join().expect("drain");

    let first = completed(worker.join().expect("join").expect("flush"));
    assert_eq!(first.submitted.len(), 1);
    assert_eq!(engine.flush().expect("flush"), FlushOutcome::Closed);
}

#[test]
fn dump_and_restore_preserve_everything() {
    let h = harness();
    for d in [A, B, C] {
        h.engine.put(&d).expect("put");
    }
    let root = completed(h.engine.flush().expect("flush"))
        .batch
        .expect("batch");
    assert!(h.ledger.confirm("tx1", 100, 5_000));
    completed(h.engine.flush().expect("flush"));
    h.engine.put(&D).expect("put pending");

    let mut out = Vec::new();
    let stats = dump(h.engine.store(), &mut out, false).expect("dump");
    assert_eq!((stats.batches, stats.digests), (1, 4));
    let text = String::from_utf8(out.clone()).expect("utf8");
    assert!(text.lines().next().expect("first line").contains(r#""kind":"batch""#));

    let dir = tempfile::tempdir().expect("tempdir");
    let target = Store::open(&dir.path().join("restored.redb")).expect("open");
    let restored = restore(&target, out.as_slice(), true, "restored.redb").expect("restore");
    assert_eq!(restored, stats);

    let mut again = Vec::new();
    dump(&target, &mut again, false).expect("dump restored");
    assert_eq!(again, out);
    assert_eq!(target.flush_commit().expect("commit"), 1);
    assert_eq!(target.pending_since(i64::MAX).expect("pending"), vec![D]);
    let next = target.put(&[0xee; 32], 9_999).expect("put after restore");
    assert!(!next.already_existed);
    assert_eq!(target.lookup(&[0xee; 32]).expect("lookup").expect("row").seq, 4);
    assert_eq!(target.last_anchor().expect("last").map(|b| b.root), Some(root));

    let mut human = Vec::new();
    dump(&target, &mut human, true).expect("human dump");
    let human = String::from_utf8(human).expect("utf8");
    assert!(human.contains(&hex::encode(root)));
    assert!(human.contains("batch=pending"));
}

#[test]
fn restore_rejects_tampered_batch() {
    let h = harness();
    for d in [A, B] {
        h.engine.put(&d).expect("put");
    }
    completed(h.engine.flush().expect("flush"));
    let mut out = Vec::new();
    dump(h.engine.store(), &mut out, false).expect("dump");
    let tampered = String::from_utf8(out)
        .expect("utf8")
        .replacen(&hex::encode(B), &hex::encode(C), 1);

    let dir = tempfile::tempdir().expect("tempdir");
    let target = Store::open(&dir.path().join("restored.redb")).expect("open");
    let err = restore(&target, tampered.as_bytes(), false, "restored.redb").unwrap_err();
    assert_eq!(err.code(), ErrorCode::FsckErrCorruptBatch);
    assert_eq!(target.counts().expect("counts").digests, 0);
    assert_eq!(target.counts().expect("counts").batches, 0);
}

#[test]
fn fsck_reports_corrupt_batch_and_stuck_digest() {
    let h = harness_with(FlushConfig {
        period: Duration::from_secs(60),
        stuck_multiple: 2,
        enable_collections: false,
    });
    h.engine.put(&A).expect("put");
    let wb = h.engine.store().begin_write().expect("begin");
    wb.put_batch(&BatchRecord::new([0x77; 32], 5, vec![B, C]))
        .expect("bogus batch");
    wb.put_flush_index(5, &[0x77; 32]).expect("index");
    wb.commit().expect("commit");

    h.clock.advance(121);
    let report = h
        .engine
        .fsck(&FsckOptions {
            verbose: true,
            print_hashes: true,
            ..FsckOptions::default()
        })
        .expect("fsck");
    assert_eq!(report.count(ErrorCode::FsckErrCorruptBatch), 1);
    assert_eq!(report.count(ErrorCode::FsckErrStuckDigest), 1);
    // B and C are listed as members but were never submitted.
    assert_eq!(report.count(ErrorCode::FsckErrOrphanDigest), 2);

    let opts = FsckOptions {
        stuck_after: Some(Duration::from_secs(3_600)),
        ..FsckOptions::default()
    };
    let report = h.engine.fsck(&opts).expect("fsck");
    assert_eq!(report.count(ErrorCode::FsckErrStuckDigest), 0);
}

#[test]
fn fsck_advances_confirmations() {
    let h = harness();
    h.engine.put(&A).expect("put");
    let root = completed(h.engine.flush().expect("flush"))
        .batch
        .expect("batch");
    assert!(h.ledger.confirm("tx1", 9, 99));

    let skipped = h
        .engine
        .fsck(&FsckOptions {
            skip_ledger: true,
            ..FsckOptions::default()
        })
        .expect("fsck");
    assert!(skipped.confirmed.is_empty());
    assert_eq!(state_of(&h.engine, &root).state, BatchState::Submitted);

    let report = h.engine.fsck(&FsckOptions::default()).expect("fsck");
    assert!(report.is_clean(), "{:?}", report.findings);
    assert_eq!(report.confirmed, vec![root]);
    assert_eq!(state_of(&h.engine, &root).state, BatchState::Confirmed);
}

#[test]
fn collections_require_opt_in() {
    let h = harness();
    h.engine.put(&A).expect("put");
    completed(h.engine.flush().expect("flush"));
    let err = h.engine.get_timestamps(&[1_000]).unwrap_err();
    assert!(matches!(err, StoreError::CollectionsDisabled));
    assert_eq!(err.code(), ErrorCode::StoreErrCollectionsDisabled);

    let h = harness_with(FlushConfig {
        enable_collections: true,
        ..FlushConfig::default()
    });
    h.engine.put(&A).expect("put");
    h.engine.put(&B).expect("put");
    completed(h.engine.flush().expect("flush"));
    let collections = h.engine.get_timestamps(&[1_000, 2_000]).expect("collections");
    assert_eq!(collections.len(), 1);
    assert_eq!(collections[0].flushed_at, 1_000);
    assert_eq!(collections[0].digests, vec![A, B]);
}
