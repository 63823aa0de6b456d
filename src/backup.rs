//! Image backup session — drives a full or incremental image backup from a
//! framed client byte stream into a container.
//!
//! # Stream framing (all numeric fields little-endian)
//!
//! ```text
//! Preamble:
//!   block_size      u32      client transfer block size
//!   virtual_size    u64      payload volume size in bytes
//!   expected_blocks i64      blocks the client intends to send (negative:
//!                            change-tracking upper bound)
//!   flags           u8       bit 0 = persistent across reconnects
//!                            bit 1 = client bitmap follows
//!   shadow_id       i32      snapshot descriptor
//!   digest          [32]     SHA-256 over the preceding 25 bytes
//!
//! Optional bitmap phase: a complete client bitmap file (see
//! `fs::client_bitmap`), magic through trailing SHA-256.
//!
//! Streaming phase, repeated:
//!   block_no        i64
//!     ≥ 0    data block; `block_size` payload bytes follow
//!     −123   end of image
//!     −124   client error; remaining buffered bytes are the message
//!     −125   ping
//!     −126   checksum record { chunk_end_block i64, sha256 [32] }
//!     −127   empty block record { block_no i64 }
//! ```
//!
//! # Hash file
//!
//! Every `hash_chunk_blocks` client blocks close a rolling SHA-256 that is
//! appended to the sibling `.hash` file; a full image of N chunks yields an
//! N×32-byte file.  Gaps are filled with the zero-chunk hash (full backup)
//! or copied from the parent's hash file (incremental).  A checksum record
//! that disagrees rewinds to the last verified chunk and reconnects; after
//! ten consecutive failures the session surfaces `StreamChecksum`.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use byteorder::{LittleEndian, ReadBytesExt};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use log::{error, info, warn};
use sha2::{Digest, Sha256};

use crate::container::{self, CreateParams, ImageContainer};
use crate::error::{Error, Result};
use crate::fs::{ClientBitmap, FilesystemSource, FsNtfs};
use crate::device::VolumeView;
use crate::progress::{wall_clock_ms, CancelToken, EtaTracker, ProgressListener};

// ── Protocol constants ───────────────────────────────────────────────────────

pub const BLOCK_END: i64 = -123;
pub const BLOCK_CLIENT_ERROR: i64 = -124;
pub const BLOCK_PING: i64 = -125;
pub const BLOCK_CHECKSUM: i64 = -126;
pub const BLOCK_EMPTY: i64 = -127;

const SHA_SIZE: usize = 32;
const MAX_HASH_ERRORS: u32 = 10;

/// Hash chunk target in bytes; the chunk is at least one client block.
const HASH_CHUNK_BYTES: u64 = 512 * 1024;

/// Receive timeout before the first byte of a stream.
pub const FIRST_BYTE_TIMEOUT: Duration = Duration::from_secs(30 * 60);
/// Receive timeout between bytes once the stream is flowing.
pub const INTER_BYTE_TIMEOUT: Duration = Duration::from_secs(2 * 60);

// ── Collaborator-facing types ────────────────────────────────────────────────

/// Transport the session pulls image bytes from.  Timeouts are the
/// transport's duty (`FIRST_BYTE_TIMEOUT` / `INTER_BYTE_TIMEOUT`).
pub trait ImageSource: Send {
    /// Blocking read; `Ok(0)` means the peer disconnected.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Re-establish the stream so the client resumes at `continue_block`.
    /// `Ok(false)` means reconnecting is not possible.
    fn reconnect(&mut self, continue_block: i64) -> io::Result<bool>;
}

#[derive(Debug, Clone)]
pub struct BackupConfig {
    /// Container artefact path; `.hash`, `.cbitmap`, `.mbr` and `.sync`
    /// siblings derive from it.
    pub image_path: PathBuf,
    /// Previous backup's container for an incremental run.
    pub parent_path: Option<PathBuf>,
    /// Materialise a full image out of the differencing result.
    pub synthetic_full: bool,
    /// Trim filesystem-free ranges after the stream completes.
    pub trim_unused: bool,
    pub compress: bool,
    pub fast_mode: bool,
    /// Master boot record / partition data placed ahead of the volume.
    pub mbr: Option<Vec<u8>>,
}

impl BackupConfig {
    pub fn new(image_path: impl Into<PathBuf>) -> Self {
        Self {
            image_path: image_path.into(),
            parent_path: None,
            synthetic_full: false,
            trim_unused: false,
            compress: false,
            fast_mode: false,
            mbr: None,
        }
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut p = self.image_path.as_os_str().to_owned();
        p.push(suffix);
        PathBuf::from(p)
    }
}

#[derive(Debug, Default)]
pub struct BackupSummary {
    pub blocks_written: u64,
    pub bytes_received: u64,
    pub hash_errors: u32,
    pub reconnects: u32,
}

// ── Stream reader ────────────────────────────────────────────────────────────

/// Outcome of an exact read: either the bytes arrived or the peer went away
/// mid-stream (recoverable for persistent streams).
enum Pull {
    Data,
    Disconnected,
}

struct StreamReader<'a> {
    src: &'a mut dyn ImageSource,
    buf: Vec<u8>,
    pos: usize,
    len: usize,
    pub bytes_received: u64,
}

impl<'a> StreamReader<'a> {
    fn new(src: &'a mut dyn ImageSource) -> Self {
        Self {
            src,
            buf: vec![0u8; 64 * 1024],
            pos: 0,
            len: 0,
            bytes_received: 0,
        }
    }

    fn reset(&mut self) {
        self.pos = 0;
        self.len = 0;
    }

    fn pull_exact(&mut self, out: &mut [u8]) -> Result<Pull> {
        let mut done = 0usize;
        while done < out.len() {
            if self.pos == self.len {
                let n = self
                    .src
                    .read(&mut self.buf)
                    .map_err(|e| Error::io("read from image stream", e))?;
                if n == 0 {
                    return Ok(Pull::Disconnected);
                }
                self.pos = 0;
                self.len = n;
                self.bytes_received += n as u64;
            }
            let take = (self.len - self.pos).min(out.len() - done);
            out[done..done + take].copy_from_slice(&self.buf[self.pos..self.pos + take]);
            self.pos += take;
            done += take;
        }
        Ok(Pull::Data)
    }

    /// Whatever is already buffered, consumed (the -124 error message).
    fn drain_buffered(&mut self) -> Vec<u8> {
        let out = self.buf[self.pos..self.len].to_vec();
        self.pos = self.len;
        out
    }
}

// ── Preamble ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Preamble {
    block_size: u32,
    virtual_size: u64,
    expected_blocks: i64,
    persistent: bool,
    with_bitmap: bool,
    shadow_id: i32,
}

fn parse_preamble(raw: &[u8; 25 + SHA_SIZE]) -> Result<Preamble> {
    let mut digest = Sha256::new();
    digest.update(&raw[..25]);
    if digest.finalize().as_slice() != &raw[25..] {
        return Err(Error::StreamChecksum { block: -1 });
    }

    let mut rd = &raw[..25];
    let block_size = rd.read_u32::<LittleEndian>().unwrap();
    let virtual_size = rd.read_u64::<LittleEndian>().unwrap();
    let expected_blocks = rd.read_i64::<LittleEndian>().unwrap();
    let flags = rd.read_u8().unwrap();
    let shadow_id = rd.read_i32::<LittleEndian>().unwrap();

    if block_size == 0 || block_size == 0xFFFF_FFFF {
        return Err(Error::corrupt(format!(
            "client refused the image request (block_size {block_size:#x})"
        )));
    }
    if virtual_size == 0 || virtual_size % block_size as u64 != 0 {
        return Err(Error::corrupt(format!(
            "virtual size {virtual_size} not divisible by block size {block_size}"
        )));
    }

    Ok(Preamble {
        block_size,
        virtual_size,
        expected_blocks,
        persistent: flags & 0x01 != 0,
        with_bitmap: flags & 0x02 != 0,
        shadow_id,
    })
}

// ── Writer thread ────────────────────────────────────────────────────────────

enum WriterCmd {
    Write { offset: u64, data: Vec<u8> },
    Trim { start: u64, end: u64 },
    Finish { make_full: bool, trim_unused: bool, fs_offset: u64 },
}

struct WriterHandle {
    tx: Sender<WriterCmd>,
    pool: Receiver<Vec<u8>>,
    has_error: Arc<AtomicBool>,
    join: thread::JoinHandle<Result<()>>,
}

impl WriterHandle {
    /// The engine borrows buffers from a reusable pool instead of
    /// allocating one per block.
    fn get_buffer(&self, block_size: usize) -> Vec<u8> {
        match self.pool.try_recv() {
            Ok(mut b) => {
                b.resize(block_size, 0);
                b
            }
            Err(_) => vec![0u8; block_size],
        }
    }

    fn failed(&self) -> bool {
        self.has_error.load(Ordering::Relaxed)
    }
}

fn spawn_writer(
    mut container: Box<dyn ImageContainer>,
    cbitmap_path: PathBuf,
    cancel: CancelToken,
) -> WriterHandle {
    let (tx, rx): (Sender<WriterCmd>, Receiver<WriterCmd>) = bounded(8);
    let (pool_tx, pool_rx) = unbounded::<Vec<u8>>();
    let has_error = Arc::new(AtomicBool::new(false));
    let has_error2 = has_error.clone();

    let join = thread::spawn(move || -> Result<()> {
        let mut result = Ok(());
        for cmd in rx.iter() {
            if result.is_err() {
                // Drain remaining commands so the sender never blocks.
                continue;
            }
            let step = match cmd {
                WriterCmd::Write { offset, data } => {
                    let r = container.write_at(offset, &data).map(|_| ());
                    let _ = pool_tx.send(data);
                    r
                }
                WriterCmd::Trim { start, end } => container.trim(start, end),
                WriterCmd::Finish {
                    make_full,
                    trim_unused,
                    fs_offset,
                } => {
                    let mut r = Ok(());
                    if make_full {
                        info!("synthesising full image from the differencing result");
                        let mut sink = crate::container::NullSink;
                        r = container.make_full(fs_offset, &mut sink, &cancel);
                    }
                    if r.is_ok() && trim_unused {
                        r = trim_free_ranges(container.as_mut(), fs_offset, &cbitmap_path, &cancel);
                    }
                    if r.is_ok() {
                        r = container.finish();
                    }
                    r
                }
            };
            if let Err(e) = step {
                error!("image writer failed: {e}");
                has_error2.store(true, Ordering::Relaxed);
                result = Err(e);
            }
        }
        result
    });

    WriterHandle {
        tx,
        pool: pool_rx,
        has_error,
        join,
    }
}

/// Trim every filesystem-free run of the payload volume.
fn trim_free_ranges(
    container: &mut dyn ImageContainer,
    fs_offset: u64,
    cbitmap_path: &Path,
    cancel: &CancelToken,
) -> Result<()> {
    let source: Box<dyn FilesystemSource> = match ClientBitmap::open(cbitmap_path) {
        Ok(cb) => Box::new(cb),
        Err(e) => {
            warn!("client bitmap unavailable for trim ({e}); using the NTFS bitmap");
            let mut view = VolumeView::new(container, fs_offset);
            match FsNtfs::parse(&mut view) {
                Ok(fs) => Box::new(fs),
                Err(e) => {
                    warn!("no usable bitmap source, skipping trim: {e}");
                    return Ok(());
                }
            }
        }
    };

    let fs_block = source.block_size();
    let volume_size = container.virtual_size().saturating_sub(fs_offset);
    let n_blocks = (volume_size / fs_block) as i64;

    let mut free_start: Option<i64> = None;
    for i in 0..=n_blocks {
        cancel.check()?;
        let free = i < n_blocks && !source.has_block(i);
        match (free, free_start) {
            (true, None) => free_start = Some(i),
            (false, Some(start)) => {
                container.trim(
                    fs_offset + start as u64 * fs_block,
                    fs_offset + i as u64 * fs_block,
                )?;
                free_start = None;
            }
            _ => {}
        }
    }
    Ok(())
}

// ── Hash chunk bookkeeping ───────────────────────────────────────────────────

struct HashState {
    chunk_blocks: i64,
    block_size: u32,
    ctx: Sha256,
    hash_file: File,
    parent_hash_file: Option<File>,
    zero_block: Vec<u8>,
    zero_chunk_hash: [u8; SHA_SIZE],
    last_chunk_hash: [u8; SHA_SIZE],
    warned_parent_hash: bool,
}

impl HashState {
    fn new(
        chunk_blocks: i64,
        block_size: u32,
        hash_file: File,
        parent_hash_file: Option<File>,
    ) -> Self {
        let zero_block = vec![0u8; block_size as usize];
        let mut ctx = Sha256::new();
        for _ in 0..chunk_blocks {
            ctx.update(&zero_block);
        }
        let zero_chunk_hash: [u8; SHA_SIZE] = ctx.finalize().into();

        Self {
            chunk_blocks,
            block_size,
            ctx: Sha256::new(),
            hash_file,
            parent_hash_file,
            zero_block,
            zero_chunk_hash,
            last_chunk_hash: [0u8; SHA_SIZE],
            warned_parent_hash: false,
        }
    }

    fn write_entry(&mut self, digest: [u8; SHA_SIZE]) -> Result<()> {
        self.last_chunk_hash = digest;
        self.hash_file
            .write_all(&digest)
            .map_err(|e| Error::io("write hash file", e))
    }

    fn finish_chunk(&mut self) -> Result<()> {
        let digest: [u8; SHA_SIZE] = std::mem::replace(&mut self.ctx, Sha256::new())
            .finalize()
            .into();
        self.write_entry(digest)
    }

    /// Account one gap block as zeros in the rolling hash.
    fn update_zero_block(&mut self) {
        self.ctx.update(&self.zero_block);
    }

    fn parent_chunk_hash(&mut self, chunk_index: i64) -> [u8; SHA_SIZE] {
        let Some(f) = &mut self.parent_hash_file else {
            return self.zero_chunk_hash;
        };
        let mut digest = [0u8; SHA_SIZE];
        let seek_ok = f
            .seek(SeekFrom::Start(chunk_index as u64 * SHA_SIZE as u64))
            .is_ok();
        if !seek_ok || f.read_exact(&mut digest).is_err() {
            if !self.warned_parent_hash {
                warn!(
                    "reading the parent hash file failed (volume may have grown); \
                     recording the zero-chunk hash"
                );
                self.warned_parent_hash = true;
            }
            return self.zero_chunk_hash;
        }
        digest
    }

    /// Rewind the hash file to the chunk containing `block` after a
    /// checksum retry.
    fn rewind_to(&mut self, block: i64) -> Result<()> {
        self.ctx = Sha256::new();
        self.hash_file
            .seek(SeekFrom::Start(
                (block / self.chunk_blocks) as u64 * SHA_SIZE as u64,
            ))
            .map_err(|e| Error::io("seek hash file", e))?;
        Ok(())
    }
}

// ── Session ──────────────────────────────────────────────────────────────────

pub struct ImageBackup {
    config: BackupConfig,
}

enum StreamEvent {
    Completed,
    Disconnected,
    HashError,
}

impl ImageBackup {
    pub fn new(config: BackupConfig) -> Self {
        Self { config }
    }

    /// Run the whole session: preamble, optional bitmap, streaming,
    /// finalisation.  Returns once every artefact is durable (the `.sync`
    /// marker exists) or with the first unrecoverable error.
    pub fn run(
        &mut self,
        source: &mut dyn ImageSource,
        progress: &mut dyn ProgressListener,
        cancel: &CancelToken,
    ) -> Result<BackupSummary> {
        let mut reader = StreamReader::new(source);

        // ── Preamble ─────────────────────────────────────────────────────────
        let mut raw = [0u8; 25 + SHA_SIZE];
        match reader.pull_exact(&mut raw)? {
            Pull::Data => {}
            Pull::Disconnected => {
                return Err(Error::io(
                    "client disconnected before the preamble",
                    io::Error::from(io::ErrorKind::UnexpectedEof),
                ))
            }
        }
        let preamble = parse_preamble(&raw)?;
        info!(
            "image stream: block_size={} virtual_size={} expected_blocks={} \
             persistent={} bitmap={} shadow_id={}",
            preamble.block_size,
            preamble.virtual_size,
            preamble.expected_blocks,
            preamble.persistent,
            preamble.with_bitmap,
            preamble.shadow_id
        );

        let block_size = preamble.block_size;
        let total_blocks = (preamble.virtual_size / block_size as u64) as i64;
        let hash_chunk_blocks = (HASH_CHUNK_BYTES / block_size as u64).max(1) as i64;

        let mbr_offset = match &self.config.mbr {
            Some(_) => crate::vhdx::layout::MB,
            None => 0,
        };

        // ── Bitmap phase ─────────────────────────────────────────────────────
        if preamble.with_bitmap {
            let bitmap_bytes = (total_blocks as u64).div_ceil(8) as usize;
            let mut blob = vec![0u8; 8 + 4 + bitmap_bytes + SHA_SIZE];
            match reader.pull_exact(&mut blob)? {
                Pull::Data => {}
                Pull::Disconnected => {
                    return Err(Error::io(
                        "client disconnected during the bitmap phase",
                        io::Error::from(io::ErrorKind::UnexpectedEof),
                    ))
                }
            }
            // Verify before persisting; a bad digest kills the session.
            ClientBitmap::parse(&blob)?;
            std::fs::write(self.config.sibling(".cbitmap"), &blob)
                .map_err(|e| Error::io("write client bitmap artefact", e))?;
        }

        // ── Container and artefacts ──────────────────────────────────────────
        let params = CreateParams {
            virtual_size: mbr_offset + preamble.virtual_size,
            block_size: 1024 * 1024,
            fast_mode: self.config.fast_mode,
            compress: self.config.compress,
        };
        let mut cont: Box<dyn ImageContainer> = match &self.config.parent_path {
            Some(parent) => container::create_diff(&self.config.image_path, parent, &params)?,
            None => container::create(&self.config.image_path, &params)?,
        };

        if let Some(mbr) = &self.config.mbr {
            cont.write_at(0, mbr)?;
            std::fs::write(self.config.sibling(".mbr"), mbr)
                .map_err(|e| Error::io("write mbr artefact", e))?;
        }

        let hash_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(self.config.sibling(".hash"))
            .map_err(|e| Error::io("open hash file", e))?;
        let parent_hash_file = match &self.config.parent_path {
            Some(p) => {
                let mut ph = p.as_os_str().to_owned();
                ph.push(".hash");
                Some(File::open(PathBuf::from(ph)).map_err(|e| Error::io("open parent hash file", e))?)
            }
            None => None,
        };

        let mut hash = HashState::new(hash_chunk_blocks, block_size, hash_file, parent_hash_file);
        let has_parent = self.config.parent_path.is_some();

        let writer = spawn_writer(cont, self.config.sibling(".cbitmap"), cancel.clone());

        // ── Streaming with reconnect/retry ───────────────────────────────────
        let mut summary = BackupSummary::default();
        let mut st = StreamState {
            nextblock: 0,
            last_verified_block: 0,
            num_hash_errors: 0,
            blocks_written: 0,
            mbr_offset,
            block_size,
            total_blocks,
            has_parent,
            expected_blocks: preamble.expected_blocks,
            eta: EtaTracker::new(),
            last_progress: Instant::now() - Duration::from_secs(2),
            last_speed_bytes: 0,
        };
        progress.set_total(total_blocks as u64 * block_size as u64);

        let result = loop {
            let event = st.pump(&mut reader, &writer, &mut hash, progress, cancel);
            match event {
                Err(e) => break Err(e),
                Ok(StreamEvent::Completed) => break Ok(()),
                Ok(StreamEvent::Disconnected) | Ok(StreamEvent::HashError) => {
                    if !preamble.persistent {
                        break Err(Error::io(
                            "client disconnected and the stream is not persistent",
                            io::Error::from(io::ErrorKind::ConnectionAborted),
                        ));
                    }
                    if st.num_hash_errors > MAX_HASH_ERRORS {
                        break Err(Error::StreamChecksum {
                            block: st.last_verified_block,
                        });
                    }

                    // Resume from a chunk boundary the peer has verified.
                    let mut continue_block = st.nextblock;
                    if continue_block % hash_chunk_blocks != 0 {
                        continue_block = (continue_block / hash_chunk_blocks) * hash_chunk_blocks;
                    } else if continue_block != st.last_verified_block + hash_chunk_blocks
                        && continue_block != st.last_verified_block
                    {
                        continue_block =
                            ((continue_block / hash_chunk_blocks) - 1) * hash_chunk_blocks;
                    }
                    let continue_block = continue_block.max(0);

                    match reader.src.reconnect(continue_block) {
                        Ok(true) => {
                            summary.reconnects += 1;
                            reader.reset();
                            hash.rewind_to(continue_block)?;
                            st.nextblock = continue_block;
                            info!("reconnected; resuming at block {continue_block}");
                        }
                        Ok(false) => {
                            break Err(Error::io(
                                "stream reconnect refused",
                                io::Error::from(io::ErrorKind::ConnectionAborted),
                            ))
                        }
                        Err(e) => break Err(Error::io("stream reconnect", e)),
                    }
                }
            }
        };

        summary.blocks_written = st.blocks_written;
        summary.bytes_received = reader.bytes_received;
        summary.hash_errors = st.num_hash_errors;

        // ── Finalisation ─────────────────────────────────────────────────────
        match result {
            Ok(()) => {
                progress.set_pc_done(100);
                progress.set_eta(-1, wall_clock_ms());
                progress.set_speed(0.0);

                writer
                    .tx
                    .send(WriterCmd::Finish {
                        make_full: self.config.synthetic_full && has_parent,
                        trim_unused: self.config.trim_unused,
                        fs_offset: mbr_offset,
                    })
                    .ok();
                drop(writer.tx);
                writer
                    .join
                    .join()
                    .map_err(|_| Error::corrupt("image writer thread panicked"))??;

                hash.hash_file
                    .sync_data()
                    .map_err(|e| Error::io("sync hash file", e))?;

                // The `.sync` marker is created only after everything is on
                // disk; its presence marks a committed backup.
                File::create(self.config.sibling(".sync"))
                    .map_err(|e| Error::io("create sync marker", e))?;

                Ok(summary)
            }
            Err(e) => {
                drop(writer.tx);
                let _ = writer.join.join();
                Err(e)
            }
        }
    }
}

// ── Streaming state machine ──────────────────────────────────────────────────

struct StreamState {
    nextblock: i64,
    last_verified_block: i64,
    num_hash_errors: u32,
    blocks_written: u64,
    mbr_offset: u64,
    block_size: u32,
    total_blocks: i64,
    has_parent: bool,
    expected_blocks: i64,
    eta: EtaTracker,
    last_progress: Instant,
    last_speed_bytes: u64,
}

impl StreamState {
    /// Pump the stream until completion, disconnect, or a checksum retry.
    fn pump(
        &mut self,
        reader: &mut StreamReader<'_>,
        writer: &WriterHandle,
        hash: &mut HashState,
        progress: &mut dyn ProgressListener,
        cancel: &CancelToken,
    ) -> Result<StreamEvent> {
        let chunk = hash.chunk_blocks;

        loop {
            cancel.check()?;
            if progress.report_stopped() {
                return Err(Error::Cancelled);
            }
            if writer.failed() {
                return Err(Error::corrupt("image writer reported an error"));
            }

            let mut head = [0u8; 8];
            match reader.pull_exact(&mut head)? {
                Pull::Data => {}
                Pull::Disconnected => return Ok(StreamEvent::Disconnected),
            }
            let block_no = i64::from_le_bytes(head);

            match block_no {
                n if n >= 0 => {
                    let mut data = writer.get_buffer(self.block_size as usize);
                    match reader.pull_exact(&mut data)? {
                        Pull::Data => {}
                        Pull::Disconnected => return Ok(StreamEvent::Disconnected),
                    }

                    if self.nextblock <= n {
                        self.advance_to(n, None, writer, hash)?;

                        hash.ctx.update(&data);
                        writer
                            .tx
                            .send(WriterCmd::Write {
                                offset: self.mbr_offset + n as u64 * self.block_size as u64,
                                data,
                            })
                            .map_err(|_| Error::corrupt("image writer is gone"))?;

                        self.nextblock = n + 1;
                        self.blocks_written += 1;

                        if self.nextblock % chunk == 0 {
                            hash.finish_chunk()?;
                        }

                        self.report_progress(progress, reader.bytes_received);
                    } else if self.nextblock - n > chunk {
                        warn!(
                            "block sent out of sequence: expected >= {}, got {n}; retrying",
                            self.nextblock - chunk - 1
                        );
                        self.num_hash_errors += 1;
                        self.nextblock = self.last_verified_block;
                        hash.rewind_to(self.nextblock)?;
                        return Ok(StreamEvent::HashError);
                    }
                    // A duplicate inside the current chunk window is ignored.
                }
                BLOCK_END => {
                    if self.nextblock <= self.total_blocks {
                        self.advance_to(self.total_blocks, None, writer, hash)?;
                        if self.nextblock % chunk != 0 {
                            hash.finish_chunk()?;
                        }
                    }
                    return Ok(StreamEvent::Completed);
                }
                BLOCK_CLIENT_ERROR | -1 => {
                    let msg_bytes = reader.drain_buffered();
                    let msg = String::from_utf8_lossy(&msg_bytes);
                    let msg = msg.split("|#|").next().unwrap_or_default().trim();
                    return Err(Error::corrupt(if msg.is_empty() {
                        "client reported an error".to_string()
                    } else {
                        format!("client reported an error: {msg}")
                    }));
                }
                BLOCK_PING => {}
                BLOCK_CHECKSUM => {
                    let mut rec = [0u8; 8 + SHA_SIZE];
                    match reader.pull_exact(&mut rec)? {
                        Pull::Data => {}
                        Pull::Disconnected => return Ok(StreamEvent::Disconnected),
                    }
                    let hblock = i64::from_le_bytes(rec[0..8].try_into().unwrap());
                    let digest: [u8; SHA_SIZE] = rec[8..].try_into().unwrap();

                    if (self.nextblock < hblock
                        || (hblock == self.total_blocks && self.nextblock % chunk != 0))
                        && hblock > 0
                    {
                        if self.nextblock < hblock {
                            self.advance_to(hblock - 1, None, writer, hash)?;
                            hash.update_zero_block();
                            self.nextblock = hblock;
                        }
                        if (self.nextblock % chunk == 0 || hblock == self.total_blocks)
                            && self.nextblock != 0
                        {
                            hash.finish_chunk()?;
                        }
                    }

                    if hash.last_chunk_hash != digest {
                        self.num_hash_errors += 1;
                        warn!(
                            "checksum for image chunk ending at block {hblock} is wrong \
                             (attempt {}); rewinding to block {}",
                            self.num_hash_errors, self.last_verified_block
                        );
                        self.nextblock = self.last_verified_block;
                        hash.rewind_to(self.nextblock)?;
                        return Ok(StreamEvent::HashError);
                    }

                    self.last_verified_block = if hblock >= chunk { hblock - chunk } else { hblock };
                }
                BLOCK_EMPTY => {
                    let mut rec = [0u8; 8];
                    match reader.pull_exact(&mut rec)? {
                        Pull::Data => {}
                        Pull::Disconnected => return Ok(StreamEvent::Disconnected),
                    }
                    let empty_block = i64::from_le_bytes(rec);
                    self.advance_to(empty_block + chunk, Some(empty_block), writer, hash)?;
                }
                other => {
                    return Err(Error::corrupt(format!(
                        "unknown stream record {other} at block {}",
                        self.nextblock
                    )));
                }
            }
        }
    }

    /// Advance the expected-block cursor to `target`, filling hash entries
    /// for the gap: the zero-chunk hash for a full backup or an empty-block
    /// record, the parent's entry for untouched incremental chunks.
    fn advance_to(
        &mut self,
        target: i64,
        empty_start: Option<i64>,
        writer: &WriterHandle,
        hash: &mut HashState,
    ) -> Result<()> {
        if self.nextblock >= target {
            return Ok(());
        }
        let chunk = hash.chunk_blocks;

        if target - self.nextblock >= chunk {
            // Pad the open chunk to its boundary with zero blocks.
            if self.nextblock % chunk != 0 {
                let pad_start = self.nextblock;
                while self.nextblock % chunk != 0 {
                    hash.update_zero_block();
                    self.nextblock += 1;
                }
                hash.finish_chunk()?;
                self.trim_gap(pad_start, self.nextblock, writer)?;
            }

            // Whole chunks: one hash entry each, no data.
            while target - self.nextblock >= chunk {
                let entry = if !self.has_parent || Some(self.nextblock) == empty_start {
                    hash.zero_chunk_hash
                } else {
                    hash.parent_chunk_hash(self.nextblock / chunk)
                };
                hash.write_entry(entry)?;
                if Some(self.nextblock) == empty_start {
                    self.trim_gap(self.nextblock, self.nextblock + chunk, writer)?;
                }
                self.nextblock += chunk;
            }
        }

        // Remaining partial gap: zero blocks into the rolling hash.
        let pad_start = self.nextblock;
        while self.nextblock < target {
            hash.update_zero_block();
            self.nextblock += 1;
            if self.nextblock % chunk == 0 {
                hash.finish_chunk()?;
            }
        }
        if empty_start.is_some() {
            self.trim_gap(pad_start, self.nextblock, writer)?;
        }

        Ok(())
    }

    /// Empty-block ranges in an incremental run are dropped from the child
    /// so reads resolve to zero blocks rather than stale parent data.
    fn trim_gap(&self, start_block: i64, end_block: i64, writer: &WriterHandle) -> Result<()> {
        if !self.has_parent || start_block >= end_block {
            return Ok(());
        }
        writer
            .tx
            .send(WriterCmd::Trim {
                start: self.mbr_offset + start_block as u64 * self.block_size as u64,
                end: self.mbr_offset + end_block as u64 * self.block_size as u64,
            })
            .map_err(|_| Error::corrupt("image writer is gone"))
    }

    fn report_progress(&mut self, progress: &mut dyn ProgressListener, bytes_received: u64) {
        let elapsed = self.last_progress.elapsed();
        if elapsed < Duration::from_secs(1) {
            return;
        }
        let speed =
            (bytes_received - self.last_speed_bytes) as f64 / elapsed.as_secs_f64().max(0.001);
        self.last_speed_bytes = bytes_received;
        self.last_progress = Instant::now();

        let rel_blocks = if self.has_parent && self.expected_blocks >= 0 {
            self.nextblock
        } else {
            self.blocks_written as i64
        };
        let denom = if self.has_parent && self.expected_blocks >= 0 {
            self.total_blocks
        } else {
            self.expected_blocks.unsigned_abs().max(1) as i64
        };

        progress.set_done(rel_blocks as u64 * self.block_size as u64);
        progress.set_pc_done(((rel_blocks as f64 / denom.max(1) as f64) * 100.0 + 0.5) as u32);
        progress.set_speed(speed);

        let remaining = (denom - rel_blocks).max(0);
        if let Some(eta_ms) = self.eta.update(rel_blocks, remaining) {
            progress.set_eta(eta_ms, wall_clock_ms());
        }
    }
}
