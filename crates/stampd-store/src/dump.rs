//! Administrative export and import.
//!
//! The machine format is JSON lines: every batch record first, in flush
//! order, then every digest record. Restore reads the same stream into an
//! empty store inside one write transaction and re-derives every root.

use std::collections::{HashMap, HashSet};
use std::io::{BufRead, Write};

use serde::{Deserialize, Serialize};
use stampd_core::{merkle_root, BatchState};
use tracing::info;

use crate::db::Store;
use crate::error::StoreError;
use crate::keys::{BatchRecord, DigestRecord};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DumpRecord {
    Batch(BatchDump),
    Digest(DigestDump),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchDump {
    pub root: String,
    pub state: String,
    pub flushed_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_height: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    pub members: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestDump {
    pub digest: String,
    pub seq: u64,
    pub submitted_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch: Option<String>,
}

impl From<&BatchRecord> for BatchDump {
    fn from(rec: &BatchRecord) -> Self {
        Self {
            root: hex::encode(rec.root),
            state: rec.state.as_str().to_string(),
            flushed_at: rec.flushed_at,
            tx_id: rec.tx_id.clone(),
            chain_height: rec.chain_height,
            chain_time: rec.chain_time,
            failure: rec.failure.clone(),
            members: rec.members.iter().map(hex::encode).collect(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DumpStats {
    pub batches: u64,
    pub digests: u64,
}

/// Write every batch and digest to `out`.
pub fn dump(store: &Store, out: &mut dyn Write, human: bool) -> Result<DumpStats, StoreError> {
    let mut stats = DumpStats::default();
    for (_, root) in store.batch_roots_by_flush()? {
        let Some(rec) = store.get_batch(&root)? else {
            continue;
        };
        if human {
            write_batch_text(out, &rec)?;
        } else {
            write_json_line(out, &DumpRecord::Batch(BatchDump::from(&rec)))?;
        }
        stats.batches += 1;
    }
    store.iter_digests(|digest, rec| {
        if human {
            writeln!(
                out,
                "digest {} seq={:<8} submitted_at={:<12} batch={}",
                hex::encode(digest),
                rec.seq,
                rec.submitted_at,
                rec.batch.map(hex::encode).unwrap_or_else(|| "pending".into())
            )?;
        } else {
            let record = DumpRecord::Digest(DigestDump {
                digest: hex::encode(digest),
                seq: rec.seq,
                submitted_at: rec.submitted_at,
                batch: rec.batch.map(hex::encode),
            });
            write_json_line(out, &record)?;
        }
        stats.digests += 1;
        Ok(())
    })?;
    out.flush()?;
    Ok(stats)
}

fn write_json_line(out: &mut dyn Write, record: &DumpRecord) -> Result<(), StoreError> {
    serde_json::to_writer(&mut *out, record).map_err(std::io::Error::from)?;
    out.write_all(b"\n")?;
    Ok(())
}

fn write_batch_text(out: &mut dyn Write, rec: &BatchRecord) -> Result<(), StoreError> {
    writeln!(
        out,
        "batch  {} state={:<11} flushed_at={:<12} members={}",
        hex::encode(rec.root),
        rec.state.as_str(),
        rec.flushed_at,
        rec.members.len()
    )?;
    if let Some(tx_id) = &rec.tx_id {
        writeln!(out, "       tx={tx_id}")?;
    }
    if let (Some(height), Some(time)) = (rec.chain_height, rec.chain_time) {
        writeln!(out, "       confirmed height={height} chain_time={time}")?;
    }
    if let Some(reason) = &rec.failure {
        writeln!(out, "       last_failure={reason}")?;
    }
    for member in &rec.members {
        writeln!(out, "       member {}", hex::encode(member))?;
    }
    Ok(())
}

/// Load a dump stream into an empty store. Nothing is written unless the
/// whole stream validates.
pub fn restore<R: BufRead>(
    store: &Store,
    input: R,
    verbose: bool,
    target: &str,
) -> Result<DumpStats, StoreError> {
    let wb = store.begin_write()?;
    if !wb.is_empty()? {
        return Err(StoreError::RestoreNotEmpty(target.to_string()));
    }
    if verbose {
        info!(target_store = target, "restore started");
    }

    let mut stats = DumpStats::default();
    // root -> members not yet matched by a digest record
    let mut unclaimed: HashMap<[u8; 32], HashSet<[u8; 32]>> = HashMap::new();
    let mut seen_digests = HashSet::new();
    let mut seen_seqs = HashSet::new();

    for (lineno, line) in input.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let lineno = lineno + 1;
        let record: DumpRecord = serde_json::from_str(&line)
            .map_err(|e| StoreError::RestoreFormat(format!("line {lineno}: {e}")))?;
        match record {
            DumpRecord::Batch(b) => {
                if stats.digests > 0 {
                    return Err(format_err(lineno, "batch record after digest records"));
                }
                let rec = batch_from_dump(&b, lineno)?;
                if merkle_root(&rec.members).ok() != Some(rec.root) {
                    return Err(StoreError::CorruptBatch { root: rec.root });
                }
                let members: HashSet<[u8; 32]> = rec.members.iter().copied().collect();
                if members.len() != rec.members.len() {
                    return Err(format_err(lineno, "batch lists a member twice"));
                }
                if unclaimed.insert(rec.root, members).is_some() {
                    return Err(format_err(lineno, "duplicate batch root"));
                }
                wb.put_batch(&rec)?;
                wb.put_flush_index(rec.flushed_at, &rec.root)?;
                stats.batches += 1;
            }
            DumpRecord::Digest(d) => {
                let digest = parse_hash(&d.digest, lineno)?;
                let batch = d.batch.as_deref().map(|s| parse_hash(s, lineno)).transpose()?;
                if !seen_digests.insert(digest) {
                    return Err(format_err(lineno, "duplicate digest"));
                }
                if !seen_seqs.insert(d.seq) {
                    return Err(format_err(lineno, "duplicate sequence number"));
                }
                if let Some(root) = batch {
                    let claimed = unclaimed
                        .get_mut(&root)
                        .map(|m| m.remove(&digest))
                        .unwrap_or(false);
                    if !claimed {
                        return Err(format_err(
                            lineno,
                            "digest references a batch that does not list it",
                        ));
                    }
                } else {
                    wb.put_pending(d.seq, &digest)?;
                }
                wb.put_digest(
                    &digest,
                    &DigestRecord {
                        seq: d.seq,
                        submitted_at: d.submitted_at,
                        batch,
                    },
                )?;
                wb.reserve_seq_through(d.seq)?;
                stats.digests += 1;
                if verbose && stats.digests % 10_000 == 0 {
                    info!(target_store = target, digests = stats.digests, "restore progress");
                }
            }
        }
    }

    if let Some((root, missing)) = unclaimed.iter().find(|(_, m)| !m.is_empty()) {
        return Err(StoreError::RestoreFormat(format!(
            "batch {} has {} members with no digest record",
            hex::encode(root),
            missing.len()
        )));
    }
    wb.set_flush_commit(stats.batches)?;
    wb.commit()?;
    if verbose {
        info!(
            target_store = target,
            batches = stats.batches,
            digests = stats.digests,
            "restore complete"
        );
    }
    Ok(stats)
}

fn batch_from_dump(b: &BatchDump, lineno: usize) -> Result<BatchRecord, StoreError> {
    let state: BatchState = b.state.parse().map_err(|e: String| format_err(lineno, &e))?;
    let members = b
        .members
        .iter()
        .map(|m| parse_hash(m, lineno))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(BatchRecord {
        root: parse_hash(&b.root, lineno)?,
        state,
        flushed_at: b.flushed_at,
        tx_id: b.tx_id.clone(),
        chain_height: b.chain_height,
        chain_time: b.chain_time,
        failure: b.failure.clone(),
        members,
    })
}

fn parse_hash(s: &str, lineno: usize) -> Result<[u8; 32], StoreError> {
    let raw = hex::decode(s).map_err(|e| format_err(lineno, &format!("bad hex {s:?}: {e}")))?;
    raw.try_into()
        .map_err(|_| format_err(lineno, &format!("{s:?} is not 32 bytes")))
}

fn format_err(lineno: usize, msg: &str) -> StoreError {
    StoreError::RestoreFormat(format!("line {lineno}: {msg}"))
}
