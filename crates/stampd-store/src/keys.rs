//! Canonical byte encoding and decoding for KV table keys and values.
//!
//! Sequence numbers and flush-index keys are big-endian so that redb's
//! lexicographic key order is numeric order; every other integer is
//! little-endian.

use stampd_core::BatchState;

// ---------------------------------------------------------------------------
// Digest record: seq[8 BE] || submitted_at[8 LE] || has_batch[1] || root[32]?
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DigestRecord {
    /// Submission order, unique across the store.
    pub seq: u64,
    pub submitted_at: i64,
    /// Root of the owning batch; `None` while pending.
    pub batch: Option<[u8; 32]>,
}

pub fn encode_digest_record(rec: &DigestRecord) -> Vec<u8> {
    let mut buf = Vec::with_capacity(17 + 32);
    buf.extend_from_slice(&rec.seq.to_be_bytes());
    buf.extend_from_slice(&rec.submitted_at.to_le_bytes());
    match &rec.batch {
        Some(root) => {
            buf.push(1);
            buf.extend_from_slice(root);
        }
        None => buf.push(0),
    }
    buf
}

pub fn decode_digest_record(data: &[u8]) -> Result<DigestRecord, String> {
    let mut r = Reader::new(data, "digest record");
    let seq = u64::from_be_bytes(r.array()?);
    let submitted_at = i64::from_le_bytes(r.array()?);
    let batch = match r.u8()? {
        0 => None,
        1 => Some(r.array()?),
        v => return Err(format!("digest record: invalid batch flag {v}")),
    };
    r.finish()?;
    Ok(DigestRecord {
        seq,
        submitted_at,
        batch,
    })
}

// ---------------------------------------------------------------------------
// Batch record:
//   state[1] || flushed_at[8] || opt_str(tx_id) || opt_i64(chain_height) ||
//   opt_i64(chain_time) || opt_str(failure) || n[4] || member[32]*n
// The root is the table key and is not repeated in the value.
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchRecord {
    pub root: [u8; 32],
    pub state: BatchState,
    /// When the scheduler cut the batch.
    pub flushed_at: i64,
    pub tx_id: Option<String>,
    pub chain_height: Option<i64>,
    pub chain_time: Option<i64>,
    /// Last submission failure, kept until the batch is retried.
    pub failure: Option<String>,
    /// Member digests in canonical (submission) order.
    pub members: Vec<[u8; 32]>,
}

impl BatchRecord {
    pub fn new(root: [u8; 32], flushed_at: i64, members: Vec<[u8; 32]>) -> Self {
        Self {
            root,
            state: BatchState::Unsubmitted,
            flushed_at,
            tx_id: None,
            chain_height: None,
            chain_time: None,
            failure: None,
            members,
        }
    }
}

pub fn encode_batch_record(rec: &BatchRecord) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64 + rec.members.len() * 32);
    buf.push(rec.state as u8);
    buf.extend_from_slice(&rec.flushed_at.to_le_bytes());
    put_opt_str(&mut buf, rec.tx_id.as_deref());
    put_opt_i64(&mut buf, rec.chain_height);
    put_opt_i64(&mut buf, rec.chain_time);
    put_opt_str(&mut buf, rec.failure.as_deref());
    buf.extend_from_slice(&(rec.members.len() as u32).to_le_bytes());
    for member in &rec.members {
        buf.extend_from_slice(member);
    }
    buf
}

pub fn decode_batch_record(root: &[u8; 32], data: &[u8]) -> Result<BatchRecord, String> {
    let mut r = Reader::new(data, "batch record");
    let state = BatchState::from_u8(r.u8()?)?;
    let flushed_at = i64::from_le_bytes(r.array()?);
    let tx_id = r.opt_str()?;
    let chain_height = r.opt_i64()?;
    let chain_time = r.opt_i64()?;
    let failure = r.opt_str()?;
    let n = u32::from_le_bytes(r.array()?) as usize;
    if r.remaining() != n * 32 {
        return Err(format!(
            "batch record: {n} members need {} bytes, have {}",
            n * 32,
            r.remaining()
        ));
    }
    let mut members = Vec::with_capacity(n);
    for _ in 0..n {
        members.push(r.array()?);
    }
    Ok(BatchRecord {
        root: *root,
        state,
        flushed_at,
        tx_id,
        chain_height,
        chain_time,
        failure,
        members,
    })
}

// ---------------------------------------------------------------------------
// Index keys
// ---------------------------------------------------------------------------

pub fn encode_seq_key(seq: u64) -> [u8; 8] {
    seq.to_be_bytes()
}

/// flushed_at (sign bit flipped, BE) || root. Sorts by flush time, then root.
pub fn encode_flush_key(flushed_at: i64, root: &[u8; 32]) -> [u8; 40] {
    let mut buf = [0u8; 40];
    buf[..8].copy_from_slice(&order_preserving_i64(flushed_at));
    buf[8..].copy_from_slice(root);
    buf
}

pub fn decode_flush_key(data: &[u8]) -> Result<(i64, [u8; 32]), String> {
    if data.len() != 40 {
        return Err(format!("flush key: expected 40 bytes, got {}", data.len()));
    }
    let mut t = [0u8; 8];
    t.copy_from_slice(&data[..8]);
    let flushed_at = (u64::from_be_bytes(t) ^ (1 << 63)) as i64;
    let mut root = [0u8; 32];
    root.copy_from_slice(&data[8..]);
    Ok((flushed_at, root))
}

/// Lower bound of all flush keys at `flushed_at`.
pub fn flush_key_prefix(flushed_at: i64) -> [u8; 8] {
    order_preserving_i64(flushed_at)
}

fn order_preserving_i64(v: i64) -> [u8; 8] {
    ((v as u64) ^ (1 << 63)).to_be_bytes()
}

pub fn decode_digest_key(data: &[u8]) -> Result<[u8; 32], String> {
    data.try_into()
        .map_err(|_| format!("digest key: expected 32 bytes, got {}", data.len()))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn put_opt_str(buf: &mut Vec<u8>, v: Option<&str>) {
    match v {
        Some(s) => {
            // Ledger ids and failure reasons are short; clamp on a char
            // boundary rather than write a length that does not fit.
            let mut end = s.len().min(u16::MAX as usize);
            while !s.is_char_boundary(end) {
                end -= 1;
            }
            let bytes = &s.as_bytes()[..end];
            buf.push(1);
            buf.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
            buf.extend_from_slice(bytes);
        }
        None => buf.push(0),
    }
}

fn put_opt_i64(buf: &mut Vec<u8>, v: Option<i64>) {
    match v {
        Some(x) => {
            buf.push(1);
            buf.extend_from_slice(&x.to_le_bytes());
        }
        None => buf.push(0),
    }
}

struct Reader<'a> {
    data: &'a [u8],
    off: usize,
    what: &'static str,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8], what: &'static str) -> Self {
        Self { data, off: 0, what }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], String> {
        if self.off + n > self.data.len() {
            return Err(format!("{}: truncated at offset {}", self.what, self.off));
        }
        let out = &self.data[self.off..self.off + n];
        self.off += n;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], String> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, String> {
        Ok(self.take(1)?[0])
    }

    fn opt_i64(&mut self) -> Result<Option<i64>, String> {
        match self.u8()? {
            0 => Ok(None),
            1 => Ok(Some(i64::from_le_bytes(self.array()?))),
            v => Err(format!("{}: invalid option flag {v}", self.what)),
        }
    }

    fn opt_str(&mut self) -> Result<Option<String>, String> {
        match self.u8()? {
            0 => Ok(None),
            1 => {
                let len = u16::from_le_bytes(self.array()?) as usize;
                let bytes = self.take(len)?;
                String::from_utf8(bytes.to_vec())
                    .map(Some)
                    .map_err(|e| format!("{}: {e}", self.what))
            }
            v => Err(format!("{}: invalid option flag {v}", self.what)),
        }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.off
    }

    fn finish(&self) -> Result<(), String> {
        if self.remaining() != 0 {
            return Err(format!(
                "{}: {} trailing bytes",
                self.what,
                self.remaining()
            ));
        }
        Ok(())
    }
}
