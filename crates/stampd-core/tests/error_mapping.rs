use stampd_core::ErrorCode;

#[test]
fn error_code_as_str_covers_all_variants() {
    // Intentionally list every variant: operators grep logs for these strings,
    // so a rename here must be deliberate.
    let cases: &[(ErrorCode, &str)] = &[
        (ErrorCode::AggErrEmpty, "AGG_ERR_EMPTY"),
        (ErrorCode::AggErrIndexOutOfRange, "AGG_ERR_INDEX_OUT_OF_RANGE"),
        (ErrorCode::StoreErrUnavailable, "STORE_ERR_UNAVAILABLE"),
        (ErrorCode::StoreErrIntegrity, "STORE_ERR_INTEGRITY"),
        (ErrorCode::StoreErrDuplicateRoot, "STORE_ERR_DUPLICATE_ROOT"),
        (
            ErrorCode::StoreErrConflictingConfirmation,
            "STORE_ERR_CONFLICTING_CONFIRMATION",
        ),
        (
            ErrorCode::StoreErrInvalidTransition,
            "STORE_ERR_INVALID_TRANSITION",
        ),
        (ErrorCode::StoreErrNotFound, "STORE_ERR_NOT_FOUND"),
        (
            ErrorCode::StoreErrCollectionsDisabled,
            "STORE_ERR_COLLECTIONS_DISABLED",
        ),
        (ErrorCode::LedgerErrUnavailable, "LEDGER_ERR_UNAVAILABLE"),
        (ErrorCode::LedgerErrRejected, "LEDGER_ERR_REJECTED"),
        (ErrorCode::FsckErrCorruptBatch, "FSCK_ERR_CORRUPT_BATCH"),
        (ErrorCode::FsckErrStuckDigest, "FSCK_ERR_STUCK_DIGEST"),
        (ErrorCode::FsckErrOrphanDigest, "FSCK_ERR_ORPHAN_DIGEST"),
        (ErrorCode::RestoreErrNotEmpty, "RESTORE_ERR_NOT_EMPTY"),
        (ErrorCode::RestoreErrFormat, "RESTORE_ERR_FORMAT"),
    ];

    for (code, want) in cases {
        assert_eq!(code.as_str(), *want);
        assert_eq!(code.to_string(), *want);
    }
}

#[test]
fn only_availability_errors_are_transient() {
    assert!(ErrorCode::StoreErrUnavailable.is_transient());
    assert!(ErrorCode::LedgerErrUnavailable.is_transient());
    assert!(ErrorCode::LedgerErrRejected.is_transient());

    assert!(!ErrorCode::StoreErrIntegrity.is_transient());
    assert!(!ErrorCode::StoreErrDuplicateRoot.is_transient());
    assert!(!ErrorCode::StoreErrConflictingConfirmation.is_transient());
    assert!(!ErrorCode::FsckErrCorruptBatch.is_transient());
}
