//! redb-backed persistent storage for stampd.
//!
//! Wraps five logical tables:
//! - `digests_by_value`  digest -> DigestRecord
//! - `pending_by_seq`    seq -> digest, only while unbatched
//! - `batches_by_root`   root -> BatchRecord
//! - `batches_by_flush`  flushed_at || root -> ()
//! - `meta`              counters

use std::path::Path;

use redb::{
    Database, ReadTransaction, ReadableTable, ReadableTableMetadata, TableDefinition,
    WriteTransaction,
};

use crate::error::{integrity, storage, StoreError};
use crate::keys::{
    decode_batch_record, decode_digest_key, decode_digest_record, decode_flush_key,
    encode_batch_record, encode_digest_record, encode_flush_key, encode_seq_key,
    flush_key_prefix, BatchRecord, DigestRecord,
};

// ---------------------------------------------------------------------------
// Table definitions (fixed key/value byte slices)
// ---------------------------------------------------------------------------

const DIGESTS_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("digests_by_value");
const PENDING_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("pending_by_seq");
const BATCHES_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("batches_by_root");
const FLUSH_INDEX_TABLE: TableDefinition<&[u8], &[u8]> =
    TableDefinition::new("batches_by_flush");
const META_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("meta");

const META_NEXT_SEQ: &[u8] = b"next_seq";
const META_FLUSH_COMMIT: &[u8] = b"flush_commit";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StoreCounts {
    pub digests: u64,
    pub pending: u64,
    pub batches: u64,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct Store {
    db: Database,
}

impl Store {
    /// Open (or create) a redb database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let db = Database::create(path).map_err(storage("redb open"))?;
        // Ensure all tables exist by opening a write transaction.
        let tx = db.begin_write().map_err(storage("redb begin_write"))?;
        tx.open_table(DIGESTS_TABLE)
            .map_err(storage("create digests table"))?;
        tx.open_table(PENDING_TABLE)
            .map_err(storage("create pending table"))?;
        tx.open_table(BATCHES_TABLE)
            .map_err(storage("create batches table"))?;
        tx.open_table(FLUSH_INDEX_TABLE)
            .map_err(storage("create flush index table"))?;
        tx.open_table(META_TABLE)
            .map_err(storage("create meta table"))?;
        tx.commit().map_err(storage("redb commit"))?;
        Ok(Self { db })
    }

    /// Begin a redb write transaction. Caller uses the returned `WriteBatch`
    /// to stage mutations, then calls `commit()`. Dropping it uncommitted
    /// discards every staged write.
    pub fn begin_write(&self) -> Result<WriteBatch, StoreError> {
        let tx = self.db.begin_write().map_err(storage("begin_write"))?;
        Ok(WriteBatch { tx })
    }

    fn begin_read(&self) -> Result<ReadTransaction, StoreError> {
        self.db.begin_read().map_err(storage("begin_read"))
    }

    // ── Digests ─────────────────────────────────────────────────────────

    pub fn get_digest(&self, digest: &[u8; 32]) -> Result<Option<DigestRecord>, StoreError> {
        let tx = self.begin_read()?;
        let table = tx
            .open_table(DIGESTS_TABLE)
            .map_err(storage("open digests"))?;
        let value = table
            .get(digest.as_slice())
            .map_err(storage("get digest"))?;
        match value {
            Some(guard) => Ok(Some(decode_digest_record(guard.value()).map_err(integrity)?)),
            None => Ok(None),
        }
    }

    /// Iterate all digest rows in digest-value order.
    pub fn iter_digests<F>(&self, mut f: F) -> Result<(), StoreError>
    where
        F: FnMut([u8; 32], DigestRecord) -> Result<(), StoreError>,
    {
        let tx = self.begin_read()?;
        let table = tx
            .open_table(DIGESTS_TABLE)
            .map_err(storage("open digests"))?;
        let iter = table.iter().map_err(storage("digests iter"))?;
        for result in iter {
            let (key_guard, val_guard) = result.map_err(storage("digests next"))?;
            let digest = decode_digest_key(key_guard.value()).map_err(integrity)?;
            let rec = decode_digest_record(val_guard.value()).map_err(integrity)?;
            f(digest, rec)?;
        }
        Ok(())
    }

    /// Iterate pending digests in submission order.
    pub fn iter_pending<F>(&self, mut f: F) -> Result<(), StoreError>
    where
        F: FnMut(u64, [u8; 32]) -> Result<(), StoreError>,
    {
        let tx = self.begin_read()?;
        let table = tx
            .open_table(PENDING_TABLE)
            .map_err(storage("open pending"))?;
        let iter = table.iter().map_err(storage("pending iter"))?;
        for result in iter {
            let (key_guard, val_guard) = result.map_err(storage("pending next"))?;
            let seq = decode_seq_key(key_guard.value())?;
            let digest = decode_digest_key(val_guard.value()).map_err(integrity)?;
            f(seq, digest)?;
        }
        Ok(())
    }

    // ── Batches ─────────────────────────────────────────────────────────

    pub fn get_batch(&self, root: &[u8; 32]) -> Result<Option<BatchRecord>, StoreError> {
        let tx = self.begin_read()?;
        let table = tx
            .open_table(BATCHES_TABLE)
            .map_err(storage("open batches"))?;
        let value = table.get(root.as_slice()).map_err(storage("get batch"))?;
        match value {
            Some(guard) => Ok(Some(
                decode_batch_record(root, guard.value()).map_err(integrity)?,
            )),
            None => Ok(None),
        }
    }

    /// Iterate all batches in root order.
    pub fn iter_batches<F>(&self, mut f: F) -> Result<(), StoreError>
    where
        F: FnMut(BatchRecord) -> Result<(), StoreError>,
    {
        let tx = self.begin_read()?;
        let table = tx
            .open_table(BATCHES_TABLE)
            .map_err(storage("open batches"))?;
        let iter = table.iter().map_err(storage("batches iter"))?;
        for result in iter {
            let (key_guard, val_guard) = result.map_err(storage("batches next"))?;
            let root = decode_digest_key(key_guard.value()).map_err(integrity)?;
            f(decode_batch_record(&root, val_guard.value()).map_err(integrity)?)?;
        }
        Ok(())
    }

    /// Batch roots in flush order, oldest first.
    pub fn batch_roots_by_flush(&self) -> Result<Vec<(i64, [u8; 32])>, StoreError> {
        let tx = self.begin_read()?;
        let table = tx
            .open_table(FLUSH_INDEX_TABLE)
            .map_err(storage("open flush index"))?;
        let mut out = Vec::new();
        for result in table.iter().map_err(storage("flush index iter"))? {
            let (key_guard, _) = result.map_err(storage("flush index next"))?;
            out.push(decode_flush_key(key_guard.value()).map_err(integrity)?);
        }
        Ok(out)
    }

    /// Roots of the batches cut at exactly `flushed_at`.
    pub fn batch_roots_flushed_at(&self, flushed_at: i64) -> Result<Vec<[u8; 32]>, StoreError> {
        let tx = self.begin_read()?;
        let table = tx
            .open_table(FLUSH_INDEX_TABLE)
            .map_err(storage("open flush index"))?;
        let start = flush_key_prefix(flushed_at);
        let mut out = Vec::new();
        for result in table
            .range(start.as_slice()..)
            .map_err(storage("flush index range"))?
        {
            let (key_guard, _) = result.map_err(storage("flush index next"))?;
            let (t, root) = decode_flush_key(key_guard.value()).map_err(integrity)?;
            if t != flushed_at {
                break;
            }
            out.push(root);
        }
        Ok(out)
    }

    /// Walk batches newest-first until `f` returns `Some`.
    pub fn find_latest_batch<F, T>(&self, mut f: F) -> Result<Option<T>, StoreError>
    where
        F: FnMut(&BatchRecord) -> Option<T>,
    {
        let tx = self.begin_read()?;
        let index = tx
            .open_table(FLUSH_INDEX_TABLE)
            .map_err(storage("open flush index"))?;
        let batches = tx
            .open_table(BATCHES_TABLE)
            .map_err(storage("open batches"))?;
        for result in index.iter().map_err(storage("flush index iter"))?.rev() {
            let (key_guard, _) = result.map_err(storage("flush index next"))?;
            let (_, root) = decode_flush_key(key_guard.value()).map_err(integrity)?;
            let Some(guard) = batches.get(root.as_slice()).map_err(storage("get batch"))? else {
                continue;
            };
            let rec = decode_batch_record(&root, guard.value()).map_err(integrity)?;
            if let Some(found) = f(&rec) {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    // ── Meta ────────────────────────────────────────────────────────────

    /// Number of flushes that produced a batch.
    pub fn flush_commit(&self) -> Result<u64, StoreError> {
        let tx = self.begin_read()?;
        let table = tx.open_table(META_TABLE).map_err(storage("open meta"))?;
        read_meta_u64(&table, META_FLUSH_COMMIT)
    }

    pub fn counts(&self) -> Result<StoreCounts, StoreError> {
        let tx = self.begin_read()?;
        let digests = tx
            .open_table(DIGESTS_TABLE)
            .map_err(storage("open digests"))?;
        let pending = tx
            .open_table(PENDING_TABLE)
            .map_err(storage("open pending"))?;
        let batches = tx
            .open_table(BATCHES_TABLE)
            .map_err(storage("open batches"))?;
        Ok(StoreCounts {
            digests: digests.len().map_err(storage("digests len"))?,
            pending: pending.len().map_err(storage("pending len"))?,
            batches: batches.len().map_err(storage("batches len"))?,
        })
    }
}

// ---------------------------------------------------------------------------
// WriteBatch: wraps a redb WriteTransaction for atomic multi-table writes
// ---------------------------------------------------------------------------

pub struct WriteBatch {
    tx: WriteTransaction,
}

impl WriteBatch {
    pub fn get_digest(&self, digest: &[u8; 32]) -> Result<Option<DigestRecord>, StoreError> {
        let table = self
            .tx
            .open_table(DIGESTS_TABLE)
            .map_err(storage("open digests"))?;
        let value = table
            .get(digest.as_slice())
            .map_err(storage("get digest"))?;
        match value {
            Some(guard) => Ok(Some(decode_digest_record(guard.value()).map_err(integrity)?)),
            None => Ok(None),
        }
    }

    pub fn put_digest(&self, digest: &[u8; 32], rec: &DigestRecord) -> Result<(), StoreError> {
        let mut table = self
            .tx
            .open_table(DIGESTS_TABLE)
            .map_err(storage("open digests"))?;
        let value = encode_digest_record(rec);
        table
            .insert(digest.as_slice(), value.as_slice())
            .map_err(storage("put digest"))?;
        Ok(())
    }

    pub fn put_pending(&self, seq: u64, digest: &[u8; 32]) -> Result<(), StoreError> {
        let mut table = self
            .tx
            .open_table(PENDING_TABLE)
            .map_err(storage("open pending"))?;
        table
            .insert(encode_seq_key(seq).as_slice(), digest.as_slice())
            .map_err(storage("put pending"))?;
        Ok(())
    }

    /// Remove a pending-index entry. Returns false if it was not there.
    pub fn delete_pending(&self, seq: u64) -> Result<bool, StoreError> {
        let mut table = self
            .tx
            .open_table(PENDING_TABLE)
            .map_err(storage("open pending"))?;
        let removed = table
            .remove(encode_seq_key(seq).as_slice())
            .map_err(storage("delete pending"))?;
        Ok(removed.is_some())
    }

    /// Pending (seq, digest) pairs in submission order.
    pub fn pending(&self) -> Result<Vec<(u64, [u8; 32])>, StoreError> {
        let table = self
            .tx
            .open_table(PENDING_TABLE)
            .map_err(storage("open pending"))?;
        let mut out = Vec::new();
        for result in table.iter().map_err(storage("pending iter"))? {
            let (key_guard, val_guard) = result.map_err(storage("pending next"))?;
            let seq = decode_seq_key(key_guard.value())?;
            let digest = decode_digest_key(val_guard.value()).map_err(integrity)?;
            out.push((seq, digest));
        }
        Ok(out)
    }

    pub fn get_batch(&self, root: &[u8; 32]) -> Result<Option<BatchRecord>, StoreError> {
        let table = self
            .tx
            .open_table(BATCHES_TABLE)
            .map_err(storage("open batches"))?;
        let value = table.get(root.as_slice()).map_err(storage("get batch"))?;
        match value {
            Some(guard) => Ok(Some(
                decode_batch_record(root, guard.value()).map_err(integrity)?,
            )),
            None => Ok(None),
        }
    }

    pub fn put_batch(&self, rec: &BatchRecord) -> Result<(), StoreError> {
        let mut table = self
            .tx
            .open_table(BATCHES_TABLE)
            .map_err(storage("open batches"))?;
        let value = encode_batch_record(rec);
        table
            .insert(rec.root.as_slice(), value.as_slice())
            .map_err(storage("put batch"))?;
        Ok(())
    }

    pub fn put_flush_index(&self, flushed_at: i64, root: &[u8; 32]) -> Result<(), StoreError> {
        let mut table = self
            .tx
            .open_table(FLUSH_INDEX_TABLE)
            .map_err(storage("open flush index"))?;
        let empty: &[u8] = &[];
        table
            .insert(encode_flush_key(flushed_at, root).as_slice(), empty)
            .map_err(storage("put flush index"))?;
        Ok(())
    }

    /// Allocate the next submission sequence number.
    pub fn next_seq(&self) -> Result<u64, StoreError> {
        let seq = self.meta_u64(META_NEXT_SEQ)?;
        self.set_meta_u64(META_NEXT_SEQ, seq + 1)?;
        Ok(seq)
    }

    /// Raise the sequence counter so future allocations start after `seq`.
    pub fn reserve_seq_through(&self, seq: u64) -> Result<(), StoreError> {
        if self.meta_u64(META_NEXT_SEQ)? <= seq {
            self.set_meta_u64(META_NEXT_SEQ, seq + 1)?;
        }
        Ok(())
    }

    pub fn bump_flush_commit(&self) -> Result<u64, StoreError> {
        let commit = self.meta_u64(META_FLUSH_COMMIT)? + 1;
        self.set_meta_u64(META_FLUSH_COMMIT, commit)?;
        Ok(commit)
    }

    pub fn set_flush_commit(&self, commit: u64) -> Result<(), StoreError> {
        self.set_meta_u64(META_FLUSH_COMMIT, commit)
    }

    /// True when no digest and no batch has ever been stored.
    pub fn is_empty(&self) -> Result<bool, StoreError> {
        let digests = self
            .tx
            .open_table(DIGESTS_TABLE)
            .map_err(storage("open digests"))?;
        let batches = self
            .tx
            .open_table(BATCHES_TABLE)
            .map_err(storage("open batches"))?;
        Ok(digests.is_empty().map_err(storage("digests is_empty"))?
            && batches.is_empty().map_err(storage("batches is_empty"))?)
    }

    fn meta_u64(&self, key: &[u8]) -> Result<u64, StoreError> {
        let table = self
            .tx
            .open_table(META_TABLE)
            .map_err(storage("open meta"))?;
        read_meta_u64(&table, key)
    }

    fn set_meta_u64(&self, key: &[u8], value: u64) -> Result<(), StoreError> {
        let mut table = self
            .tx
            .open_table(META_TABLE)
            .map_err(storage("open meta"))?;
        table
            .insert(key, value.to_le_bytes().as_slice())
            .map_err(storage("put meta"))?;
        Ok(())
    }

    /// Commit the write batch atomically.
    pub fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().map_err(storage("commit"))
    }
}

fn read_meta_u64<T>(table: &T, key: &[u8]) -> Result<u64, StoreError>
where
    T: ReadableTable<&'static [u8], &'static [u8]>,
{
    let value = table.get(key).map_err(storage("get meta"))?;
    let Some(guard) = value else {
        return Ok(0);
    };
    let raw: [u8; 8] = guard
        .value()
        .try_into()
        .map_err(|_| integrity("meta counter: expected 8 bytes"))?;
    Ok(u64::from_le_bytes(raw))
}

fn decode_seq_key(data: &[u8]) -> Result<u64, StoreError> {
    let raw: [u8; 8] = data
        .try_into()
        .map_err(|_| integrity(format!("seq key: expected 8 bytes, got {}", data.len())))?;
    Ok(u64::from_be_bytes(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_tmp() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open(&dir.path().join("stampd.redb")).expect("open");
        (dir, store)
    }

    #[test]
    fn test_uncommitted_write_batch_is_discarded() {
        let (_dir, store) = open_tmp();
        {
            let wb = store.begin_write().expect("begin");
            let seq = wb.next_seq().expect("seq");
            wb.put_digest(
                &[7u8; 32],
                &DigestRecord {
                    seq,
                    submitted_at: 1,
                    batch: None,
                },
            )
            .expect("put");
            wb.put_pending(seq, &[7u8; 32]).expect("pending");
            // dropped without commit
        }
        assert_eq!(store.get_digest(&[7u8; 32]).expect("get"), None);
        assert_eq!(store.counts().expect("counts"), StoreCounts::default());
    }

    #[test]
    fn test_seq_counter_persists_across_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("stampd.redb");
        {
            let store = Store::open(&path).expect("open");
            let wb = store.begin_write().expect("begin");
            assert_eq!(wb.next_seq().expect("seq"), 0);
            assert_eq!(wb.next_seq().expect("seq"), 1);
            wb.commit().expect("commit");
        }
        let store = Store::open(&path).expect("reopen");
        let wb = store.begin_write().expect("begin");
        assert_eq!(wb.next_seq().expect("seq"), 2);
        wb.reserve_seq_through(10).expect("reserve");
        assert_eq!(wb.next_seq().expect("seq"), 11);
    }

    #[test]
    fn test_flush_index_lookup_by_time() {
        let (_dir, store) = open_tmp();
        let wb = store.begin_write().expect("begin");
        for (t, root) in [(100, [1u8; 32]), (100, [2u8; 32]), (200, [3u8; 32])] {
            wb.put_batch(&BatchRecord::new(root, t, vec![root]))
                .expect("batch");
            wb.put_flush_index(t, &root).expect("index");
        }
        wb.commit().expect("commit");

        assert_eq!(
            store.batch_roots_flushed_at(100).expect("at 100"),
            vec![[1u8; 32], [2u8; 32]]
        );
        assert!(store.batch_roots_flushed_at(150).expect("at 150").is_empty());
        let latest = store
            .find_latest_batch(|b| Some(b.root))
            .expect("latest");
        assert_eq!(latest, Some([3u8; 32]));
    }
}
