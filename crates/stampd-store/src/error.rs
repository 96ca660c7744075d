use stampd_core::{AggregateError, BatchState, ErrorCode};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The redb file could not be read or written. Fail fast; callers retry
    /// with backoff.
    #[error("storage unavailable ({context}): {source}")]
    StorageUnavailable {
        context: &'static str,
        source: redb::Error,
    },

    /// Unexpected constraint violation or undecodable row.
    #[error("integrity error: {0}")]
    Integrity(String),

    #[error("duplicate root {}: another member set already aggregates to it", hex::encode(.root))]
    DuplicateRoot { root: [u8; 32] },

    #[error(
        "conflicting confirmation for {}: stored {stored_height}@{stored_time}, ledger reports {height}@{time}",
        hex::encode(.root)
    )]
    ConflictingConfirmation {
        root: [u8; 32],
        stored_height: i64,
        stored_time: i64,
        height: i64,
        time: i64,
    },

    #[error("batch {} cannot move from {from} to {to}", hex::encode(.root))]
    InvalidTransition {
        root: [u8; 32],
        from: BatchState,
        to: BatchState,
    },

    #[error("batch {} not found", hex::encode(.root))]
    BatchNotFound { root: [u8; 32] },

    #[error("corrupt batch {}: members do not aggregate to the stored root", hex::encode(.root))]
    CorruptBatch { root: [u8; 32] },

    #[error("collection queries are disabled")]
    CollectionsDisabled,

    #[error("restore target {0} is not empty")]
    RestoreNotEmpty(String),

    #[error("malformed restore stream: {0}")]
    RestoreFormat(String),

    #[error("aggregate: {0}")]
    Aggregate(#[from] AggregateError),

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn code(&self) -> ErrorCode {
        match self {
            StoreError::StorageUnavailable { .. } | StoreError::Io(_) => {
                ErrorCode::StoreErrUnavailable
            }
            StoreError::Integrity(_) => ErrorCode::StoreErrIntegrity,
            StoreError::DuplicateRoot { .. } => ErrorCode::StoreErrDuplicateRoot,
            StoreError::ConflictingConfirmation { .. } => {
                ErrorCode::StoreErrConflictingConfirmation
            }
            StoreError::InvalidTransition { .. } => ErrorCode::StoreErrInvalidTransition,
            StoreError::BatchNotFound { .. } => ErrorCode::StoreErrNotFound,
            StoreError::CorruptBatch { .. } => ErrorCode::FsckErrCorruptBatch,
            StoreError::CollectionsDisabled => ErrorCode::StoreErrCollectionsDisabled,
            StoreError::RestoreNotEmpty(_) => ErrorCode::RestoreErrNotEmpty,
            StoreError::RestoreFormat(_) => ErrorCode::RestoreErrFormat,
            StoreError::Aggregate(e) => e.code,
        }
    }

    /// The storage layer itself failed. Anything else is a data anomaly the
    /// flush cycle can log and step past.
    pub fn is_unavailable(&self) -> bool {
        self.code() == ErrorCode::StoreErrUnavailable
    }
}

/// Adapter for `map_err`: tags any redb error with the operation that hit it.
pub(crate) fn storage<E: Into<redb::Error>>(context: &'static str) -> impl FnOnce(E) -> StoreError {
    move |e| StoreError::StorageUnavailable {
        context,
        source: e.into(),
    }
}

pub(crate) fn integrity(msg: impl Into<String>) -> StoreError {
    StoreError::Integrity(msg.into())
}
