//! `stampd-store`: persistence and the anchoring engine for stampd.
//!
//! Provides a redb-backed KV store with canonical byte layouts, the digest
//! and batch stores built on it, the flush engine that closes and anchors
//! batches, the fsck reconciler, and dump/restore.

pub mod anchors;
pub mod clock;
pub mod db;
pub mod digests;
pub mod dump;
pub mod error;
pub mod flush;
pub mod fsck;
pub mod keys;
pub mod query;

pub use clock::{Clock, ManualClock, SystemClock};
pub use db::{Store, StoreCounts, WriteBatch};
pub use digests::PutResult;
pub use dump::{dump, restore, DumpRecord, DumpStats};
pub use error::StoreError;
pub use flush::{FlushConfig, FlushEngine, FlushOutcome, FlushPhase, FlushSummary};
pub use fsck::{run_fsck, FsckFinding, FsckOptions, FsckReport};
pub use keys::{BatchRecord, DigestRecord};
pub use query::{BatchInfo, Collection, DigestStatus};
