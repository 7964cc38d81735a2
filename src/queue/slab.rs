//! On-disk slab and ack-log formats for the durable action queue.
//!
//! A slab is an append-only run of framed records:
//! `[payload len: u32 LE][record id: u64 LE][crc32(payload): u32 LE][payload]`
//! where the payload is a format-version byte followed by the
//! bincode-encoded action. The ack log is a run of
//! `[record id: u64 LE][crc32(id): u32 LE]` entries. Torn tails are detected
//! by framing overrun or crc mismatch and truncated away on open.

use snafu::prelude::*;
use std::collections::HashSet;
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::error::{CorruptRecordSnafu, QueueError, SlabIoSnafu};
use crate::position::Action;

/// Format tag carried as the first payload byte.
pub const FORMAT_VERSION: u8 = 1;

/// Frame header: payload length + record id + payload crc.
pub const FRAME_HEADER_LEN: usize = 4 + 8 + 4;

/// Upper bound on a single record; larger lengths are treated as corruption.
const MAX_RECORD_LEN: u32 = 1 << 30;

/// Ack-log entry: record id + crc.
pub const ACK_ENTRY_LEN: usize = 8 + 4;

/// Slab filename, e.g. `journal-000003.slab`.
pub fn slab_filename(topic: &str, index: u64) -> String {
    format!("{topic}-{index:06}.slab")
}

/// Ack-log filename for a topic.
pub fn ack_filename(topic: &str) -> String {
    format!("{topic}.ack")
}

/// Scan `dir` for slab files belonging to `topic`, ordered by index.
pub fn find_slabs(dir: &Path, topic: &str) -> Vec<(u64, PathBuf)> {
    let prefix = format!("{topic}-");

    let mut slabs: Vec<(u64, PathBuf)> = std::fs::read_dir(dir)
        .ok()
        .into_iter()
        .flatten()
        .filter_map(|entry| {
            let entry = entry.ok()?;
            let name = entry.file_name().into_string().ok()?;
            let without_ext = name.strip_suffix(".slab")?;
            let idx: u64 = without_ext.strip_prefix(&prefix)?.parse().ok()?;
            Some((idx, entry.path()))
        })
        .collect();

    slabs.sort_by_key(|(idx, _)| *idx);
    slabs
}

/// Encode an action payload: version byte + bincode body.
pub fn encode_payload(action: &Action) -> Result<Vec<u8>, QueueError> {
    let body = bincode::encode_to_vec(action, bincode::config::standard()).map_err(|e| {
        QueueError::Encode {
            message: e.to_string(),
        }
    })?;
    let mut payload = Vec::with_capacity(1 + body.len());
    payload.push(FORMAT_VERSION);
    payload.extend_from_slice(&body);
    Ok(payload)
}

/// Decode an action payload written by [`encode_payload`].
pub fn decode_payload(id: u64, payload: &[u8]) -> Result<Action, QueueError> {
    let (&version, body) = payload.split_first().ok_or(QueueError::CorruptRecord {
        id,
        message: "empty payload".to_string(),
    })?;
    ensure!(
        version == FORMAT_VERSION,
        CorruptRecordSnafu {
            id,
            message: format!("unknown format version {version}"),
        }
    );
    let (action, _) = bincode::decode_from_slice(body, bincode::config::standard()).map_err(
        |e| QueueError::CorruptRecord {
            id,
            message: e.to_string(),
        },
    )?;
    Ok(action)
}

/// Assemble a full frame for appending to a slab.
pub fn frame_record(id: u64, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&id.to_le_bytes());
    frame.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// One record recovered from a slab.
#[derive(Debug, Clone)]
pub struct ScannedRecord {
    pub id: u64,
    pub payload: Vec<u8>,
    /// False when the payload crc did not match; the record is still
    /// delivered so the consumer can observe and skip it.
    pub crc_ok: bool,
}

/// Records recovered from one slab plus the length of its intact prefix.
#[derive(Debug)]
pub struct SlabScan {
    pub records: Vec<ScannedRecord>,
    pub valid_len: u64,
}

/// Read every intact record from a slab. Scanning stops at the first torn
/// frame; the caller truncates the file to `valid_len` before reusing it.
pub fn scan_slab(path: &Path) -> Result<SlabScan, QueueError> {
    let mut file = std::fs::File::open(path).context(SlabIoSnafu { path })?;
    let mut data = Vec::new();
    file.read_to_end(&mut data).context(SlabIoSnafu { path })?;

    let mut records = Vec::new();
    let mut offset = 0usize;

    while data.len() - offset >= FRAME_HEADER_LEN {
        let len = u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap());
        let id = u64::from_le_bytes(data[offset + 4..offset + 12].try_into().unwrap());
        let crc = u32::from_le_bytes(data[offset + 12..offset + 16].try_into().unwrap());

        if len > MAX_RECORD_LEN {
            break;
        }
        let body_start = offset + FRAME_HEADER_LEN;
        let body_end = body_start + len as usize;
        if body_end > data.len() {
            break;
        }

        let payload = data[body_start..body_end].to_vec();
        let crc_ok = crc32fast::hash(&payload) == crc;
        records.push(ScannedRecord {
            id,
            payload,
            crc_ok,
        });
        offset = body_end;
    }

    Ok(SlabScan {
        records,
        valid_len: offset as u64,
    })
}

/// Assemble one ack-log entry.
pub fn frame_ack(id: u64) -> [u8; ACK_ENTRY_LEN] {
    let mut entry = [0u8; ACK_ENTRY_LEN];
    entry[..8].copy_from_slice(&id.to_le_bytes());
    entry[8..].copy_from_slice(&crc32fast::hash(&id.to_le_bytes()).to_le_bytes());
    entry
}

/// Read the set of acked record ids, stopping at a torn or corrupt tail.
pub fn read_acks(path: &Path) -> Result<HashSet<u64>, QueueError> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashSet::new()),
        Err(e) => return Err(QueueError::SlabIo {
            path: path.to_path_buf(),
            source: e,
        }),
    };

    let mut acked = HashSet::new();
    for entry in data.chunks_exact(ACK_ENTRY_LEN) {
        let id = u64::from_le_bytes(entry[..8].try_into().unwrap());
        let crc = u32::from_le_bytes(entry[8..].try_into().unwrap());
        if crc32fast::hash(&entry[..8]) != crc {
            break;
        }
        acked.insert(id);
    }
    Ok(acked)
}
