//! ContainerV2 write-ahead log — entry codec, sequence discovery, replay.
//!
//! The log is a circular array of 4 KiB sectors inside the fixed log region.
//! One entry = one header sector, descriptor slots (32 B each, 126 fit into
//! the header sector), then one data sector per data descriptor:
//!
//! ```text
//! Header sector:
//!   0..4    "loge"
//!   4..8    checksum        CRC-32C over the whole entry, field zeroed
//!   8..12   entry_length    multiple of 4096
//!  12..16   tail            log-relative offset of the sequence head
//!  16..24   sequence_number
//!  24..28   descriptor_count
//!  32..48   log_guid        must match the active header's log_guid
//!  48..56   flushed_file_offset
//!  56..64   last_file_offset
//!
//! "zero" descriptor:  4 reserved, zero_length u64, file_offset u64, sequence u64
//! "desc" descriptor:  trailing 4 B, leading 8 B, file_offset u64, sequence u64
//! "data" sector:      sequence_high u32, 4084 payload bytes, sequence_low u32
//! ```
//!
//! A data descriptor's 4 KiB payload is reconstructed from its 8 leading
//! bytes, the matching data sector's 4084 bytes, and its 4 trailing bytes;
//! the split sequence number cross-checks that header and data sector belong
//! to the same entry.
//!
//! Discovery scans every 4 KiB boundary for a header whose GUID matches and
//! whose CRC validates, then follows `entry_length` (with wrap-around)
//! collecting strictly increasing sequence numbers; a candidate sequence is
//! valid only if its head entry's tail points back at its first entry.

use log::{debug, warn};

use crate::device::{write_zeroes, BlockDevice};
use crate::error::{Error, Result};

use super::layout::{crc32c, is_zero_guid, VhdxGuid, VhdxHeader, LOG_SECTOR_SIZE};

pub const LOG_ENTRY_MAGIC: &[u8; 4] = b"loge";
const DESC_MAGIC: &[u8; 4] = b"desc";
const ZERO_MAGIC: &[u8; 4] = b"zero";
const DATA_MAGIC: &[u8; 4] = b"data";

/// Descriptors that fit into the header sector.
pub const MAX_DESCRIPTORS_PER_ENTRY: usize = 126;
const DATA_SECTOR_PAYLOAD: usize = LOG_SECTOR_SIZE - 12;

// ── Decoded entry ────────────────────────────────────────────────────────────

pub struct LogEntry {
    pub sequence: u64,
    pub entry_length: u32,
    pub tail: u32,
    pub flushed_file_offset: u64,
    pub last_file_offset: u64,
    pub zeros: Vec<(u64, u64)>,
    pub writes: Vec<(u64, Vec<u8>)>,
}

/// Read exactly `buf.len()` bytes, reporting end-of-device as `false`
/// instead of an error (scanning walks off the end routinely).
fn try_read_exact(dev: &mut dyn BlockDevice, mut off: u64, mut buf: &mut [u8]) -> Result<bool> {
    while !buf.is_empty() {
        match dev.read_at(off, buf)? {
            0 => return Ok(false),
            n => {
                buf = &mut buf[n..];
                off += n as u64;
            }
        }
    }
    Ok(true)
}

/// Read and fully validate one log entry at absolute offset `off`.
/// Returns `None` for anything that is not a valid entry of this log.
pub fn read_entry(
    dev: &mut dyn BlockDevice,
    log_guid: &VhdxGuid,
    log_length: u32,
    off: u64,
) -> Result<Option<LogEntry>> {
    let mut head = vec![0u8; LOG_SECTOR_SIZE];
    if !try_read_exact(dev, off, &mut head)? {
        return Ok(None);
    }

    if &head[0..4] != LOG_ENTRY_MAGIC {
        return Ok(None);
    }
    if &head[32..48] != log_guid {
        return Ok(None);
    }

    let entry_length = u32::from_le_bytes(head[8..12].try_into().unwrap());
    if entry_length < LOG_SECTOR_SIZE as u32
        || entry_length % LOG_SECTOR_SIZE as u32 != 0
        || entry_length > log_length
    {
        return Ok(None);
    }

    let mut entry = vec![0u8; entry_length as usize];
    if !try_read_exact(dev, off, &mut entry)? {
        return Ok(None);
    }

    let stored_crc = u32::from_le_bytes(entry[4..8].try_into().unwrap());
    entry[4..8].fill(0);
    if crc32c(&entry) != stored_crc {
        debug!("log entry at {off} has a wrong checksum");
        return Ok(None);
    }

    let sequence = u64::from_le_bytes(entry[16..24].try_into().unwrap());
    let descriptor_count = u32::from_le_bytes(entry[24..28].try_into().unwrap()) as usize;
    let tail = u32::from_le_bytes(entry[12..16].try_into().unwrap());
    let flushed_file_offset = u64::from_le_bytes(entry[48..56].try_into().unwrap());
    let last_file_offset = u64::from_le_bytes(entry[56..64].try_into().unwrap());

    // Data sectors follow the descriptor sectors.
    let mut data_off = LOG_SECTOR_SIZE;
    if descriptor_count > MAX_DESCRIPTORS_PER_ENTRY {
        let extra = descriptor_count - MAX_DESCRIPTORS_PER_ENTRY;
        data_off += extra.div_ceil(128) * LOG_SECTOR_SIZE;
    }
    if 64 + descriptor_count * 32 > entry.len().min(data_off) {
        return Ok(None);
    }

    let (low, high) = (sequence as u32, (sequence >> 32) as u32);

    let mut zeros = Vec::new();
    let mut writes = Vec::new();

    for i in 0..descriptor_count {
        let d = 64 + i * 32;
        let desc = &entry[d..d + 32];
        let desc_seq = u64::from_le_bytes(desc[24..32].try_into().unwrap());
        if desc_seq != sequence {
            warn!("log descriptor sequence number wrong at {off}");
            return Ok(None);
        }

        if &desc[0..4] == ZERO_MAGIC {
            let zero_length = u64::from_le_bytes(desc[8..16].try_into().unwrap());
            let file_offset = u64::from_le_bytes(desc[16..24].try_into().unwrap());
            zeros.push((file_offset, zero_length));
        } else if &desc[0..4] == DESC_MAGIC {
            if data_off + LOG_SECTOR_SIZE > entry.len() {
                warn!("log entry at {off} is missing a data sector");
                return Ok(None);
            }
            let sector = &entry[data_off..data_off + LOG_SECTOR_SIZE];
            data_off += LOG_SECTOR_SIZE;

            if &sector[0..4] != DATA_MAGIC {
                warn!("log data sector signature wrong at {off}");
                return Ok(None);
            }
            if u32::from_le_bytes(sector[4..8].try_into().unwrap()) != high
                || u32::from_le_bytes(sector[4092..4096].try_into().unwrap()) != low
            {
                warn!("log data sector split sequence number wrong at {off}");
                return Ok(None);
            }

            let file_offset = u64::from_le_bytes(desc[16..24].try_into().unwrap());
            let mut payload = Vec::with_capacity(LOG_SECTOR_SIZE);
            payload.extend_from_slice(&desc[8..16]); // leading 8
            payload.extend_from_slice(&sector[8..8 + DATA_SECTOR_PAYLOAD]);
            payload.extend_from_slice(&desc[4..8]); // trailing 4
            debug_assert_eq!(payload.len(), LOG_SECTOR_SIZE);
            writes.push((file_offset, payload));
        } else {
            warn!("unknown log descriptor signature at {off}");
            return Ok(None);
        }
    }

    Ok(Some(LogEntry {
        sequence,
        entry_length,
        tail,
        flushed_file_offset,
        last_file_offset,
        zeros,
        writes,
    }))
}

// ── Sequence discovery ───────────────────────────────────────────────────────

pub struct LogSequence {
    /// Absolute offsets of the entries, in replay order.
    pub offsets: Vec<u64>,
    pub max_sequence: u64,
}

fn scan_from(
    dev: &mut dyn BlockDevice,
    header: &VhdxHeader,
    off: &mut u64,
) -> Result<LogSequence> {
    let log_start = header.log_offset;
    let log_length = header.log_length as u64;

    let mut seq = LogSequence {
        offsets: Vec::new(),
        max_sequence: 0,
    };
    let mut expected = 0u64;

    loop {
        let entry = read_entry(dev, &header.log_guid, header.log_length, *off)?;
        let Some(entry) = entry else {
            if expected == 0 {
                *off += LOG_SECTOR_SIZE as u64;
            }
            return validate(dev, header, seq);
        };

        if expected != 0 && entry.sequence != expected {
            return validate(dev, header, seq);
        }

        seq.offsets.push(*off);
        seq.max_sequence = entry.sequence;

        *off = (*off + entry.entry_length as u64 - log_start) % log_length + log_start;
        expected = entry.sequence + 1;
    }
}

/// A candidate sequence is only valid if the head's tail points back at its
/// first entry.
fn validate(
    dev: &mut dyn BlockDevice,
    header: &VhdxHeader,
    mut seq: LogSequence,
) -> Result<LogSequence> {
    if seq.offsets.is_empty() {
        return Ok(seq);
    }
    let head_off = *seq.offsets.last().unwrap();
    let head = read_entry(dev, &header.log_guid, header.log_length, head_off)?;
    match head {
        Some(head) if header.log_offset + head.tail as u64 == seq.offsets[0] => Ok(seq),
        _ => {
            seq.offsets.clear();
            seq.max_sequence = 0;
            Ok(seq)
        }
    }
}

/// Scan the whole log region and return the best (highest-sequence) valid
/// sequence.
pub fn find_sequence(dev: &mut dyn BlockDevice, header: &VhdxHeader) -> Result<LogSequence> {
    let mut best = LogSequence {
        offsets: Vec::new(),
        max_sequence: 0,
    };

    let mut off = header.log_offset;
    let end = header.log_offset + header.log_length as u64;
    while off < end {
        let scan_start = off;
        let candidate = scan_from(dev, header, &mut off)?;
        if candidate.max_sequence > best.max_sequence {
            best = candidate;
        }
        // A wrapped walk can leave the cursor at or before the scan start.
        if off <= scan_start {
            off = scan_start + LOG_SECTOR_SIZE as u64;
        }
    }

    Ok(best)
}

// ── Replay ───────────────────────────────────────────────────────────────────

/// Apply the active log to the backing device.  Returns the next sequence
/// number to emit.  The caller clears `log_guid` and rotates the header
/// afterwards; `sync()` is issued here, before that happens.
pub fn replay(dev: &mut dyn BlockDevice, header: &VhdxHeader) -> Result<u64> {
    debug_assert!(!is_zero_guid(&header.log_guid));

    let seq = find_sequence(dev, header)?;
    if seq.offsets.is_empty() {
        return Err(Error::LogReplayFailed(
            "no valid log sequence found".to_string(),
        ));
    }

    let head_off = *seq.offsets.last().unwrap();
    let head = read_entry(dev, &header.log_guid, header.log_length, head_off)?
        .ok_or_else(|| Error::LogReplayFailed("head entry vanished during replay".to_string()))?;

    let dev_size = dev.size()?;
    if dev_size < head.flushed_file_offset {
        return Err(Error::LogReplayFailed(format!(
            "device smaller than the log's flushed size: {} < {}",
            dev_size, head.flushed_file_offset
        )));
    }

    let mut last_sequence = 0u64;
    for &off in &seq.offsets {
        let entry = read_entry(dev, &header.log_guid, header.log_length, off)?
            .ok_or_else(|| Error::LogReplayFailed(format!("log entry at {off} vanished")))?;

        for &(file_offset, zero_length) in &entry.zeros {
            write_zeroes(dev, file_offset, zero_length)?;
        }
        for (file_offset, payload) in &entry.writes {
            dev.write_all_at(*file_offset, payload)?;
        }

        last_sequence = entry.sequence;
    }

    // The head entry may record a growth the crash interrupted.
    if dev.size()? < head.last_file_offset {
        dev.resize(head.last_file_offset, true)?;
    }

    dev.sync()?;
    Ok(last_sequence + 1)
}

// ── Append ───────────────────────────────────────────────────────────────────

/// Journalling cursor for the current log generation.
#[derive(Debug, Clone, Copy)]
pub struct LogCursor {
    /// Log-relative write position.
    pub pos: u64,
    /// Log-relative position of the generation's first entry (the tail).
    pub start: u64,
    pub next_sequence: u64,
}

impl LogCursor {
    pub fn fresh(next_sequence: u64) -> Self {
        Self {
            pos: 0,
            start: 0,
            next_sequence,
        }
    }
}

pub enum AppendOutcome {
    Written,
    /// The entry does not fit; the caller must durably flush and restart the
    /// log before retrying.
    Full,
}

/// Append one data entry journalling `data` (4 KiB-sector multiple, at most
/// 126 sectors) destined for `file_offset`.
pub fn append_entry(
    dev: &mut dyn BlockDevice,
    header: &VhdxHeader,
    cursor: &mut LogCursor,
    file_offset: u64,
    data: &[u8],
    flushed_file_offset: u64,
    last_file_offset: u64,
) -> Result<AppendOutcome> {
    assert!(data.len() % LOG_SECTOR_SIZE == 0);
    let sector_count = data.len() / LOG_SECTOR_SIZE;
    assert!(sector_count >= 1 && sector_count <= MAX_DESCRIPTORS_PER_ENTRY);

    let entry_length = LOG_SECTOR_SIZE * (1 + sector_count);
    if cursor.pos + entry_length as u64 > header.log_length as u64 {
        return Ok(AppendOutcome::Full);
    }

    let sequence = cursor.next_sequence;
    let (low, high) = (sequence as u32, (sequence >> 32) as u32);

    let mut entry = vec![0u8; entry_length];
    entry[0..4].copy_from_slice(LOG_ENTRY_MAGIC);
    entry[8..12].copy_from_slice(&(entry_length as u32).to_le_bytes());
    entry[12..16].copy_from_slice(&(cursor.start as u32).to_le_bytes());
    entry[16..24].copy_from_slice(&sequence.to_le_bytes());
    entry[24..28].copy_from_slice(&(sector_count as u32).to_le_bytes());
    entry[32..48].copy_from_slice(&header.log_guid);
    entry[48..56].copy_from_slice(&flushed_file_offset.to_le_bytes());
    entry[56..64].copy_from_slice(&last_file_offset.max(flushed_file_offset).to_le_bytes());

    for i in 0..sector_count {
        let sector = &data[i * LOG_SECTOR_SIZE..(i + 1) * LOG_SECTOR_SIZE];

        let d = 64 + i * 32;
        entry[d..d + 4].copy_from_slice(DESC_MAGIC);
        entry[d + 4..d + 8].copy_from_slice(&sector[LOG_SECTOR_SIZE - 4..]);
        entry[d + 8..d + 16].copy_from_slice(&sector[..8]);
        entry[d + 16..d + 24]
            .copy_from_slice(&(file_offset + (i * LOG_SECTOR_SIZE) as u64).to_le_bytes());
        entry[d + 24..d + 32].copy_from_slice(&sequence.to_le_bytes());

        let s = LOG_SECTOR_SIZE * (1 + i);
        entry[s..s + 4].copy_from_slice(DATA_MAGIC);
        entry[s + 4..s + 8].copy_from_slice(&high.to_le_bytes());
        entry[s + 8..s + 8 + DATA_SECTOR_PAYLOAD]
            .copy_from_slice(&sector[8..8 + DATA_SECTOR_PAYLOAD]);
        entry[s + 4092..s + 4096].copy_from_slice(&low.to_le_bytes());
    }

    let crc = crc32c(&entry);
    entry[4..8].copy_from_slice(&crc.to_le_bytes());

    dev.write_all_at(header.log_offset + cursor.pos, &entry)?;
    cursor.pos += entry_length as u64;
    cursor.next_sequence += 1;

    Ok(AppendOutcome::Written)
}
