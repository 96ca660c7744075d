pub const DIGEST_BYTES: usize = 32;

/// Default batch closure cadence.
pub const DEFAULT_FLUSH_PERIOD_SECS: u64 = 60 * 60;
/// Flushes fire this many seconds past the period boundary.
pub const DEFAULT_FLUSH_OFFSET_SECS: u64 = 10;
/// Pending digests older than `stuck_multiple * flush_period` are reported by fsck.
pub const DEFAULT_STUCK_MULTIPLE: u32 = 24;
