use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::debug;

use crate::{Confirmation, LedgerClient, LedgerError};

/// Development-only ledger held in memory.
/// Transaction ids are `tx1`, `tx2`, ... in submission order. Failures and
/// confirmations are scripted by the caller.
#[derive(Debug, Default)]
pub struct MemLedger {
    inner: Mutex<MemLedgerState>,
}

#[derive(Debug, Default)]
struct MemLedgerState {
    next_tx: u64,
    txs: HashMap<String, MemTx>,
    order: Vec<String>,
    fail_submits: u32,
    fail_queries: u32,
    submit_calls: u64,
    query_calls: u64,
}

#[derive(Debug, Clone)]
struct MemTx {
    root: [u8; 32],
    confirmation: Confirmation,
    dropped: bool,
}

impl MemLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` submissions fail with `LedgerError::Unavailable`.
    pub fn fail_next_submits(&self, n: u32) {
        self.inner.lock().fail_submits = n;
    }

    /// The next `n` queries fail with `LedgerError::Unavailable`.
    pub fn fail_next_queries(&self, n: u32) {
        self.inner.lock().fail_queries = n;
    }

    /// Mark `tx_id` as mined. Returns false for an unknown id.
    pub fn confirm(&self, tx_id: &str, height: i64, timestamp: i64) -> bool {
        let mut st = self.inner.lock();
        match st.txs.get_mut(tx_id) {
            Some(tx) => {
                tx.confirmation = Confirmation::Confirmed { height, timestamp };
                true
            }
            None => false,
        }
    }

    /// Forget `tx_id` as if the ledger evicted it; later queries are rejected.
    pub fn drop_tx(&self, tx_id: &str) -> bool {
        let mut st = self.inner.lock();
        match st.txs.get_mut(tx_id) {
            Some(tx) => {
                tx.dropped = true;
                true
            }
            None => false,
        }
    }

    /// Roots in the order they were accepted.
    pub fn submitted_roots(&self) -> Vec<[u8; 32]> {
        let st = self.inner.lock();
        st.order
            .iter()
            .filter_map(|id| st.txs.get(id).map(|tx| tx.root))
            .collect()
    }

    pub fn submit_calls(&self) -> u64 {
        self.inner.lock().submit_calls
    }

    pub fn query_calls(&self) -> u64 {
        self.inner.lock().query_calls
    }
}

impl LedgerClient for MemLedger {
    fn submit(&self, root: &[u8; 32]) -> Result<String, LedgerError> {
        let mut st = self.inner.lock();
        st.submit_calls += 1;
        if st.fail_submits > 0 {
            st.fail_submits -= 1;
            return Err(LedgerError::Unavailable("mem ledger: scripted submit failure".into()));
        }
        st.next_tx += 1;
        let tx_id = format!("tx{}", st.next_tx);
        st.txs.insert(
            tx_id.clone(),
            MemTx {
                root: *root,
                confirmation: Confirmation::Unconfirmed,
                dropped: false,
            },
        );
        st.order.push(tx_id.clone());
        debug!(%tx_id, "mem ledger accepted commitment");
        Ok(tx_id)
    }

    fn query(&self, tx_id: &str) -> Result<Confirmation, LedgerError> {
        let mut st = self.inner.lock();
        st.query_calls += 1;
        if st.fail_queries > 0 {
            st.fail_queries -= 1;
            return Err(LedgerError::Unavailable("mem ledger: scripted query failure".into()));
        }
        match st.txs.get(tx_id) {
            Some(tx) if tx.dropped => Err(LedgerError::Rejected(format!("{tx_id} dropped"))),
            Some(tx) => Ok(tx.confirmation),
            None => Err(LedgerError::Rejected(format!("{tx_id} unknown"))),
        }
    }
}
