//! Drives `FlushEngine::flush` on a fixed cadence aligned to the wall clock.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use stampd_store::{FlushEngine, FlushOutcome};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

/// Time from `now_unix` until the next `k * period + offset` instant. An
/// instant that is exactly now counts as already passed.
pub fn next_tick_delay(now_unix: u64, period: Duration, offset: Duration) -> Duration {
    let period = period.as_secs().max(1);
    let offset = offset.as_secs() % period;
    let into = now_unix % period;
    let wait = if into < offset {
        offset - into
    } else {
        period - into + offset
    };
    Duration::from_secs(wait)
}

pub struct Scheduler {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Scheduler {
    /// Start ticking at the next period boundary plus `offset`.
    pub fn spawn(engine: Arc<FlushEngine>, period: Duration, offset: Duration) -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let first = next_tick_delay(now, period, offset);
        info!(
            period_secs = period.as_secs(),
            first_tick_in_secs = first.as_secs(),
            "scheduler started"
        );
        Self::spawn_after(engine, first, period)
    }

    /// Start ticking after `first`, then every `period`. Late ticks are
    /// skipped rather than bunched up.
    pub fn spawn_after(engine: Arc<FlushEngine>, first: Duration, period: Duration) -> Self {
        let (stop, mut stopped) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + first, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if !run_tick(engine.clone()).await {
                            break;
                        }
                    }
                    changed = stopped.changed() => {
                        if changed.is_err() || *stopped.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("scheduler stopped");
        });
        Self { stop, handle }
    }

    /// Stop ticking and wait for an in-flight tick to return.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.handle.await {
            error!(error = %e, "scheduler task ended abnormally");
        }
    }
}

/// Run one flush on the blocking pool. Returns false once the engine is
/// closed.
async fn run_tick(engine: Arc<FlushEngine>) -> bool {
    match tokio::task::spawn_blocking(move || engine.flush()).await {
        Ok(Ok(FlushOutcome::Completed(summary))) => {
            debug!(
                batch = ?summary.batch.map(hex::encode),
                digests = summary.digests,
                "scheduled flush done"
            );
            true
        }
        Ok(Ok(FlushOutcome::Busy)) => true,
        Ok(Ok(FlushOutcome::Closed)) => false,
        Ok(Err(e)) => {
            error!(code = %e.code(), error = %e, "scheduled flush failed; retrying next tick");
            true
        }
        Err(e) => {
            error!(error = %e, "flush task panicked");
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stampd_ledger::MemLedger;
    use stampd_store::{FlushConfig, ManualClock, Store};

    #[test]
    fn next_tick_aligns_to_period_plus_offset() {
        let hour = Duration::from_secs(3_600);
        let ten = Duration::from_secs(10);
        assert_eq!(next_tick_delay(7_200, hour, ten), Duration::from_secs(10));
        assert_eq!(next_tick_delay(7_205, hour, ten), Duration::from_secs(5));
        assert_eq!(next_tick_delay(7_210, hour, ten), hour);
        assert_eq!(next_tick_delay(7_211, hour, ten), Duration::from_secs(3_599));
        assert_eq!(
            next_tick_delay(5, Duration::ZERO, Duration::ZERO),
            Duration::from_secs(1)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn scheduled_ticks_close_batches_until_shutdown() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(Store::open(&dir.path().join("stampd.redb")).expect("open"));
        let engine = Arc::new(FlushEngine::new(
            store.clone(),
            Arc::new(MemLedger::new()),
            Arc::new(ManualClock::new(50)),
            FlushConfig::default(),
        ));
        engine.put(&[1u8; 32]).expect("put");

        let scheduler = Scheduler::spawn_after(
            engine.clone(),
            Duration::from_millis(10),
            Duration::from_millis(50),
        );
        let deadline = Instant::now() + Duration::from_secs(10);
        while store.counts().expect("counts").batches == 0 {
            assert!(Instant::now() < deadline, "no batch closed before deadline");
            time::sleep(Duration::from_millis(10)).await;
        }
        scheduler.shutdown().await;

        let drained = engine.clone();
        tokio::task::spawn_blocking(move || drained.drain())
            .await
            .expect("drain");
        assert_eq!(engine.flush().expect("flush"), FlushOutcome::Closed);
        assert_eq!(store.counts().expect("counts").batches, 1);
    }
}
