//! Ledger capability interface for the stampd anchoring engine.
//!
//! The engine depends only on this narrow interface: broadcast a batch root,
//! and later ask whether that broadcast has been confirmed.

use stampd_core::ErrorCode;

#[cfg(feature = "dev-mem")]
mod mem;
#[cfg(feature = "dev-mem")]
pub use mem::MemLedger;

/// Ledger-side confirmation of a submitted commitment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Confirmation {
    Unconfirmed,
    Confirmed { height: i64, timestamp: i64 },
}

/// Every variant is retryable from the engine's point of view; they differ
/// only in whether the transaction id handed out earlier is still worth
/// polling.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    /// Network failure, timeout or node unavailable.
    #[error("ledger unavailable: {0}")]
    Unavailable(String),
    /// The ledger definitively dropped the transaction; resubmit.
    #[error("ledger rejected transaction: {0}")]
    Rejected(String),
}

impl LedgerError {
    pub fn code(&self) -> ErrorCode {
        match self {
            LedgerError::Unavailable(_) => ErrorCode::LedgerErrUnavailable,
            LedgerError::Rejected(_) => ErrorCode::LedgerErrRejected,
        }
    }
}

/// Blocking ledger client. Implementations bound each call with their own
/// timeout and report a timeout as `LedgerError::Unavailable`.
pub trait LedgerClient: Send + Sync {
    /// Broadcast a commitment to `root`, returning the ledger transaction id.
    fn submit(&self, root: &[u8; 32]) -> Result<String, LedgerError>;

    fn query(&self, tx_id: &str) -> Result<Confirmation, LedgerError>;
}

impl<T: LedgerClient + ?Sized> LedgerClient for std::sync::Arc<T> {
    fn submit(&self, root: &[u8; 32]) -> Result<String, LedgerError> {
        (**self).submit(root)
    }

    fn query(&self, tx_id: &str) -> Result<Confirmation, LedgerError> {
        (**self).query(tx_id)
    }
}
