//! End-to-end image backup sessions against an in-memory client stream,
//! including checksum-retry behaviour, reconnects and the produced
//! artefacts.

use std::io;
use std::path::Path;

use sha2::{Digest, Sha256};

use fsimage::backup::{
    BackupConfig, ImageBackup, ImageSource, BLOCK_CHECKSUM, BLOCK_EMPTY, BLOCK_END, BLOCK_PING,
};
use fsimage::container::ImageContainer;
use fsimage::progress::{CancelToken, NullProgress};
use fsimage::{ClientBitmap, Error, FilesystemSource};
use tempfile::tempdir;

const MIB: u64 = 1024 * 1024;
const BLOCK_SIZE: u32 = MIB as u32;

/// Deterministic per-block fill so content checks are trivial.
fn block_payload(block: i64) -> Vec<u8> {
    let tag = (block as u8).wrapping_mul(31).wrapping_add(7);
    vec![tag; BLOCK_SIZE as usize]
}

fn preamble_bytes(total_blocks: i64, flags: u8) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&BLOCK_SIZE.to_le_bytes());
    out.extend_from_slice(&(total_blocks as u64 * BLOCK_SIZE as u64).to_le_bytes());
    out.extend_from_slice(&total_blocks.to_le_bytes());
    out.push(flags);
    out.extend_from_slice(&77i32.to_le_bytes()); // shadow id
    let digest = Sha256::digest(&out);
    out.extend_from_slice(&digest);
    out
}

/// Scripted client: serves the framed stream, optionally corrupting the
/// checksum record of one chunk, optionally dropping the connection once.
struct ScriptedClient {
    total_blocks: i64,
    skip_blocks: Vec<i64>,
    persistent: bool,
    with_bitmap: Option<Vec<u8>>,
    corrupt_chunk_end: i64,
    corrupt_remaining: u32,
    disconnect_after: Option<usize>,
    data: Vec<u8>,
    pos: usize,
}

impl ScriptedClient {
    fn new(total_blocks: i64, persistent: bool) -> Self {
        let mut c = Self {
            total_blocks,
            skip_blocks: Vec::new(),
            persistent,
            with_bitmap: None,
            corrupt_chunk_end: -1,
            corrupt_remaining: 0,
            disconnect_after: None,
            data: Vec::new(),
            pos: 0,
        };
        c.build(0, true);
        c
    }

    fn rebuild_all(&mut self) {
        self.build(0, true);
    }

    fn build(&mut self, start_block: i64, with_preamble: bool) {
        let mut out = Vec::new();
        if with_preamble {
            let mut flags = 0u8;
            if self.persistent {
                flags |= 0x01;
            }
            if self.with_bitmap.is_some() {
                flags |= 0x02;
            }
            out.extend_from_slice(&preamble_bytes(self.total_blocks, flags));
            if let Some(bm) = &self.with_bitmap {
                out.extend_from_slice(bm);
            }
        }

        for block in start_block..self.total_blocks {
            if self.skip_blocks.contains(&block) {
                out.extend_from_slice(&BLOCK_EMPTY.to_le_bytes());
                out.extend_from_slice(&block.to_le_bytes());
                continue;
            }
            if block % 23 == 11 {
                out.extend_from_slice(&BLOCK_PING.to_le_bytes());
            }

            out.extend_from_slice(&block.to_le_bytes());
            let payload = block_payload(block);
            out.extend_from_slice(&payload);

            // Checksum record closing this one-block chunk.
            let chunk_end = block + 1;
            let mut digest: [u8; 32] = Sha256::digest(&payload).into();
            if chunk_end == self.corrupt_chunk_end && self.corrupt_remaining > 0 {
                self.corrupt_remaining -= 1;
                digest[0] ^= 0xFF;
            }
            out.extend_from_slice(&BLOCK_CHECKSUM.to_le_bytes());
            out.extend_from_slice(&chunk_end.to_le_bytes());
            out.extend_from_slice(&digest);
        }

        out.extend_from_slice(&BLOCK_END.to_le_bytes());
        self.data = out;
        self.pos = 0;
    }
}

impl ImageSource for ScriptedClient {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(limit) = self.disconnect_after {
            if self.pos >= limit {
                self.disconnect_after = None;
                return Ok(0);
            }
        }
        let mut end = self.data.len();
        if let Some(limit) = self.disconnect_after {
            end = end.min(limit);
        }
        if self.pos >= end {
            return Ok(0);
        }
        let n = buf.len().min(end - self.pos);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    fn reconnect(&mut self, continue_block: i64) -> io::Result<bool> {
        if !self.persistent {
            return Ok(false);
        }
        self.build(continue_block, false);
        Ok(true)
    }
}

fn expected_hash_file(total_blocks: i64, skip: &[i64]) -> Vec<u8> {
    let mut out = Vec::new();
    for block in 0..total_blocks {
        let payload = if skip.contains(&block) {
            vec![0u8; BLOCK_SIZE as usize]
        } else {
            block_payload(block)
        };
        let digest: [u8; 32] = Sha256::digest(&payload).into();
        out.extend_from_slice(&digest);
    }
    out
}

fn read_sibling(image: &Path, suffix: &str) -> Vec<u8> {
    let mut p = image.as_os_str().to_owned();
    p.push(suffix);
    std::fs::read(std::path::PathBuf::from(p)).unwrap()
}

#[test]
fn full_backup_end_to_end() {
    let dir = tempdir().unwrap();
    let image = dir.path().join("image.vhdx");

    let mut client = ScriptedClient::new(64, true);
    let mut session = ImageBackup::new(BackupConfig::new(&image));
    let summary = session
        .run(&mut client, &mut NullProgress, &CancelToken::new())
        .unwrap();

    assert_eq!(summary.blocks_written, 64);
    assert_eq!(summary.hash_errors, 0);

    // Hash file: one 32-byte entry per MiB chunk.
    let hash = read_sibling(&image, ".hash");
    assert_eq!(hash.len(), 64 * 32);
    assert_eq!(hash, expected_hash_file(64, &[]));

    // The sync marker only appears after a committed backup.
    assert!(dir.path().join("image.vhdx.sync").exists());

    // Content survives a round trip through the container.
    let mut cont = fsimage::container::open(&image, true).unwrap();
    for block in [0i64, 17, 63] {
        let mut buf = vec![0u8; BLOCK_SIZE as usize];
        cont.read_at(block as u64 * MIB, &mut buf).unwrap();
        assert_eq!(buf, block_payload(block), "block {block}");
    }
    cont.finish().unwrap();
}

#[test]
fn checksum_mismatch_retries_then_succeeds() {
    let dir = tempdir().unwrap();
    let image = dir.path().join("image.vhdx");

    let mut client = ScriptedClient::new(64, true);
    client.corrupt_chunk_end = 17;
    client.corrupt_remaining = 2;
    client.rebuild_all();

    let mut session = ImageBackup::new(BackupConfig::new(&image));
    let summary = session
        .run(&mut client, &mut NullProgress, &CancelToken::new())
        .unwrap();

    assert_eq!(summary.hash_errors, 2);
    assert_eq!(summary.reconnects, 2);

    let hash = read_sibling(&image, ".hash");
    assert_eq!(hash, expected_hash_file(64, &[]));

    let mut cont = fsimage::container::open(&image, true).unwrap();
    let mut buf = vec![0u8; BLOCK_SIZE as usize];
    cont.read_at(16 * MIB, &mut buf).unwrap();
    assert_eq!(buf, block_payload(16));
    cont.finish().unwrap();
}

#[test]
fn persistent_checksum_mismatch_surfaces_after_ten_retries() {
    let dir = tempdir().unwrap();
    let image = dir.path().join("image.vhdx");

    let mut client = ScriptedClient::new(64, true);
    client.corrupt_chunk_end = 17;
    client.corrupt_remaining = u32::MAX;
    client.rebuild_all();

    let mut session = ImageBackup::new(BackupConfig::new(&image));
    let err = session
        .run(&mut client, &mut NullProgress, &CancelToken::new())
        .unwrap_err();

    // The resume point is the start of the last verified chunk (block 15 for
    // the chunk the record at boundary 16 confirmed).
    match err {
        Error::StreamChecksum { block } => assert_eq!(block, 15),
        other => panic!("expected StreamChecksum, got {other}"),
    }
    assert!(!dir.path().join("image.vhdx.sync").exists());
}

#[test]
fn disconnect_resumes_on_persistent_stream() {
    let dir = tempdir().unwrap();
    let image = dir.path().join("image.vhdx");

    let mut client = ScriptedClient::new(32, true);
    client.disconnect_after = Some(9 * MIB as usize); // mid block ~8
    let mut session = ImageBackup::new(BackupConfig::new(&image));
    let summary = session
        .run(&mut client, &mut NullProgress, &CancelToken::new())
        .unwrap();

    assert_eq!(summary.reconnects, 1);
    let hash = read_sibling(&image, ".hash");
    assert_eq!(hash, expected_hash_file(32, &[]));
}

#[test]
fn disconnect_fails_non_persistent_stream() {
    let dir = tempdir().unwrap();
    let image = dir.path().join("image.vhdx");

    let mut client = ScriptedClient::new(16, false);
    client.disconnect_after = Some(3 * MIB as usize);
    let mut session = ImageBackup::new(BackupConfig::new(&image));
    assert!(session
        .run(&mut client, &mut NullProgress, &CancelToken::new())
        .is_err());
    assert!(!dir.path().join("image.vhdx.sync").exists());
}

#[test]
fn client_bitmap_phase_persists_artefact() {
    let dir = tempdir().unwrap();
    let image = dir.path().join("image.vhdx");

    let total_blocks = 16i64;
    let bits = vec![0b1010_1010u8; (total_blocks as usize).div_ceil(8)];
    let blob = ClientBitmap::serialize(BLOCK_SIZE, &bits);

    let mut client = ScriptedClient::new(total_blocks, true);
    client.with_bitmap = Some(blob.clone());
    client.rebuild_all();

    let mut session = ImageBackup::new(BackupConfig::new(&image));
    session
        .run(&mut client, &mut NullProgress, &CancelToken::new())
        .unwrap();

    let artefact = read_sibling(&image, ".cbitmap");
    assert_eq!(artefact, blob);
    let parsed = ClientBitmap::parse(&artefact).unwrap();
    assert!(parsed.has_block(1));
    assert!(!parsed.has_block(0));
}

#[test]
fn empty_block_records_record_zero_hashes() {
    let dir = tempdir().unwrap();
    let image = dir.path().join("image.vhdx");

    let mut client = ScriptedClient::new(16, true);
    client.skip_blocks = vec![3, 4, 9];
    client.rebuild_all();

    let mut session = ImageBackup::new(BackupConfig::new(&image));
    session
        .run(&mut client, &mut NullProgress, &CancelToken::new())
        .unwrap();

    let hash = read_sibling(&image, ".hash");
    assert_eq!(hash, expected_hash_file(16, &[3, 4, 9]));

    let mut cont = fsimage::container::open(&image, true).unwrap();
    let mut buf = vec![0u8; BLOCK_SIZE as usize];
    cont.read_at(3 * MIB, &mut buf).unwrap();
    assert!(buf.iter().all(|&b| b == 0));
    cont.read_at(5 * MIB, &mut buf).unwrap();
    assert_eq!(buf, block_payload(5));
    cont.finish().unwrap();
}

#[test]
fn incremental_backup_layers_over_parent() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("base.vhdx");
    let incr = dir.path().join("incr.vhdx");

    // Full backup first.
    let mut client = ScriptedClient::new(16, true);
    let mut session = ImageBackup::new(BackupConfig::new(&base));
    session
        .run(&mut client, &mut NullProgress, &CancelToken::new())
        .unwrap();

    // Incremental: only blocks 2 and 7 changed; the rest arrive as gaps.
    let mut client = ScriptedClient::new(16, true);
    client.data.clear();
    {
        let mut out = Vec::new();
        out.extend_from_slice(&preamble_bytes(16, 0x01));
        for block in [2i64, 7] {
            out.extend_from_slice(&block.to_le_bytes());
            let mut payload = block_payload(block);
            payload.iter_mut().for_each(|b| *b ^= 0xFF);
            out.extend_from_slice(&payload);
            let digest: [u8; 32] = Sha256::digest(&payload).into();
            out.extend_from_slice(&BLOCK_CHECKSUM.to_le_bytes());
            out.extend_from_slice(&(block + 1).to_le_bytes());
            out.extend_from_slice(&digest);
        }
        out.extend_from_slice(&BLOCK_END.to_le_bytes());
        client.data = out;
        client.pos = 0;
    }

    let mut config = BackupConfig::new(&incr);
    config.parent_path = Some(base.clone());
    let mut session = ImageBackup::new(config);
    session
        .run(&mut client, &mut NullProgress, &CancelToken::new())
        .unwrap();

    // Unchanged chunks carry the parent's hash entries.
    let base_hash = read_sibling(&base, ".hash");
    let incr_hash = read_sibling(&incr, ".hash");
    assert_eq!(incr_hash.len(), 16 * 32);
    assert_eq!(&incr_hash[0..32], &base_hash[0..32]);
    assert_ne!(&incr_hash[2 * 32..3 * 32], &base_hash[2 * 32..3 * 32]);
    assert_eq!(&incr_hash[5 * 32..6 * 32], &base_hash[5 * 32..6 * 32]);

    // Reads resolve changed blocks locally, the rest through the parent.
    let mut cont = fsimage::container::open(&incr, true).unwrap();
    let mut buf = vec![0u8; BLOCK_SIZE as usize];
    cont.read_at(2 * MIB, &mut buf).unwrap();
    let mut expect = block_payload(2);
    expect.iter_mut().for_each(|b| *b ^= 0xFF);
    assert_eq!(buf, expect);

    cont.read_at(5 * MIB, &mut buf).unwrap();
    assert_eq!(buf, block_payload(5));
    cont.finish().unwrap();
}
