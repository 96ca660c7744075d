use core::fmt;

/// Stable error codes shared by every stampd crate. Operators and log
/// scrapers match on `as_str()`, so the strings never change once released.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    AggErrEmpty,
    AggErrIndexOutOfRange,

    StoreErrUnavailable,
    StoreErrIntegrity,
    StoreErrDuplicateRoot,
    StoreErrConflictingConfirmation,
    StoreErrInvalidTransition,
    StoreErrNotFound,
    StoreErrCollectionsDisabled,

    LedgerErrUnavailable,
    LedgerErrRejected,

    FsckErrCorruptBatch,
    FsckErrStuckDigest,
    FsckErrOrphanDigest,

    RestoreErrNotEmpty,
    RestoreErrFormat,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::AggErrEmpty => "AGG_ERR_EMPTY",
            ErrorCode::AggErrIndexOutOfRange => "AGG_ERR_INDEX_OUT_OF_RANGE",

            ErrorCode::StoreErrUnavailable => "STORE_ERR_UNAVAILABLE",
            ErrorCode::StoreErrIntegrity => "STORE_ERR_INTEGRITY",
            ErrorCode::StoreErrDuplicateRoot => "STORE_ERR_DUPLICATE_ROOT",
            ErrorCode::StoreErrConflictingConfirmation => "STORE_ERR_CONFLICTING_CONFIRMATION",
            ErrorCode::StoreErrInvalidTransition => "STORE_ERR_INVALID_TRANSITION",
            ErrorCode::StoreErrNotFound => "STORE_ERR_NOT_FOUND",
            ErrorCode::StoreErrCollectionsDisabled => "STORE_ERR_COLLECTIONS_DISABLED",

            ErrorCode::LedgerErrUnavailable => "LEDGER_ERR_UNAVAILABLE",
            ErrorCode::LedgerErrRejected => "LEDGER_ERR_REJECTED",

            ErrorCode::FsckErrCorruptBatch => "FSCK_ERR_CORRUPT_BATCH",
            ErrorCode::FsckErrStuckDigest => "FSCK_ERR_STUCK_DIGEST",
            ErrorCode::FsckErrOrphanDigest => "FSCK_ERR_ORPHAN_DIGEST",

            ErrorCode::RestoreErrNotEmpty => "RESTORE_ERR_NOT_EMPTY",
            ErrorCode::RestoreErrFormat => "RESTORE_ERR_FORMAT",
        }
    }

    /// Whether the caller may retry the failed operation later without
    /// operator intervention.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ErrorCode::StoreErrUnavailable
                | ErrorCode::LedgerErrUnavailable
                | ErrorCode::LedgerErrRejected
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AggregateError {
    pub code: ErrorCode,
    pub msg: &'static str,
}

impl AggregateError {
    pub fn new(code: ErrorCode, msg: &'static str) -> Self {
        Self { code, msg }
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.msg.is_empty() {
            write!(f, "{}", self.code.as_str())
        } else {
            write!(f, "{}: {}", self.code.as_str(), self.msg)
        }
    }
}

impl std::error::Error for AggregateError {}
