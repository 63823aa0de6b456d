//! ContainerV2 — log-journalled sparse differencing container.
//!
//! See `layout` for the region map and structures, `log` for the journal.
//!
//! # Consistency protocol
//!
//! Two header slots alternate: every persistent header update writes the
//! inactive slot with `sequence_number + 1`, syncs, then toggles.  While
//! `log_guid` in the active header is non-zero the on-disk BAT and payload
//! may be stale and only log replay makes the file consistent again; a
//! read-only open of such a file is refused.
//!
//! A write-path flush orders its steps so that any crash is repaired by
//! replay: payload data is synced first, then the dirty BAT pages are
//! journalled and synced, and only then written in place.  A full sync
//! additionally retires the journal (`log_guid = 0`) through a header
//! rotation.
//!
//! Sector bitmaps live in their own 1 MiB blocks, one per chunk of
//! `chunk_ratio` payload blocks, cached in memory once touched and flushed
//! ahead of the BAT during sync.

pub mod layout;
pub mod log;

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use ::log::{info, warn};

use crate::bitmap::{BitmapView, BitmapViewMut, LsbFirst};
use crate::compressed::{is_compressed, CompressedFile};
use crate::container::{CreateParams, ImageContainer, MakeFullSink};
use crate::device::{BlockDevice, FileDevice, VolumeView};
use crate::error::{Error, Result};
use crate::fs::{ClientBitmap, FilesystemSource, FsNtfs};
use crate::progress::CancelToken;

use self::layout::{
    format_guid, is_zero_guid, parse_guid, random_guid, BatEntry, BatGeometry, Metadata,
    ParentLocatorMeta, RegionTable, VhdxHeader, FILE_ID_MAGIC, HEADER1_OFFSET, HEADER2_OFFSET,
    HEADER_SIZE, LOG_SECTOR_SIZE, MB, PAYLOAD_BLOCK_FULLY_PRESENT, PAYLOAD_BLOCK_NOT_PRESENT,
    PAYLOAD_BLOCK_PARTIALLY_PRESENT, PAYLOAD_BLOCK_UNDEFINED, PAYLOAD_BLOCK_UNMAPPED,
    PAYLOAD_BLOCK_ZERO, REGION_TABLE_A_OFFSET, REGION_TABLE_B_OFFSET, REGION_TABLE_SIZE,
    ZERO_GUID,
};
use self::log::{append_entry, replay, AppendOutcome, LogCursor};

const CREATOR: &str = "fsimage vhdx engine";

/// Backing-file growth is amortised in ~100 MiB steps.
const ALLOCATE_ADD_SIZE: u64 = 100 * MB;

const DEFAULT_SECTOR_SIZE: u32 = 512;

pub struct VhdxFile {
    dev: Box<dyn BlockDevice>,
    path: PathBuf,
    read_only: bool,
    fast_mode: bool,
    finished: bool,

    header: VhdxHeader,
    /// Header slot the next rotation writes to.
    inactive_header_offset: u64,
    regions: RegionTable,
    meta: Metadata,

    geometry: BatGeometry,
    virtual_size: u64,
    block_size: u32,
    sector_size: u32,

    bat: Vec<BatEntry>,
    data_write_guid_updated: bool,

    // Internal guards (see the concurrency contract): journal cursor, dirty
    // BAT entries, sector-bitmap cache and its dirty set, allocator cursor.
    log_cursor: Mutex<LogCursor>,
    pending_bat_entries: Mutex<BTreeSet<u64>>,
    sector_bitmaps: Mutex<HashMap<u64, Vec<u8>>>,
    pending_sector_bitmaps: Mutex<BTreeSet<u64>>,
    next_payload_pos: Mutex<u64>,

    /// Size the backing file has been resized to.
    allocated_size: u64,
    /// Backing size as of the last durable sync.
    flushed_size: u64,

    parent: Option<Box<VhdxFile>>,
}

// ── Construction ─────────────────────────────────────────────────────────────

impl VhdxFile {
    fn open_device(
        path: &Path,
        read_only: bool,
        create: bool,
        compress: bool,
    ) -> Result<Box<dyn BlockDevice>> {
        if create {
            let file = FileDevice::create(path)?;
            if compress {
                Ok(Box::new(CompressedFile::create(Box::new(file))?))
            } else {
                Ok(Box::new(file))
            }
        } else {
            let mut file = FileDevice::open(path, read_only)?;
            if is_compressed(&mut file)? {
                Ok(Box::new(CompressedFile::open(Box::new(file), read_only)?))
            } else {
                Ok(Box::new(file))
            }
        }
    }

    pub fn create(path: &Path, params: &CreateParams) -> Result<Self> {
        Self::create_inner(path, params, None)
    }

    pub fn create_diff(path: &Path, parent_path: &Path, params: &CreateParams) -> Result<Self> {
        let parent = Box::new(VhdxFile::open(parent_path, true)?);
        Self::create_inner(path, params, Some((parent, parent_path.to_owned())))
    }

    fn create_inner(
        path: &Path,
        params: &CreateParams,
        parent: Option<(Box<VhdxFile>, PathBuf)>,
    ) -> Result<Self> {
        let (block_size, sector_size, virtual_size) = match &parent {
            Some((p, _)) => (p.block_size, p.sector_size, p.virtual_size),
            None => {
                let bs = params.block_size.max(MB as u32);
                assert!(
                    bs as u64 % MB == 0,
                    "block size must be a MiB multiple for this container format"
                );
                (bs, DEFAULT_SECTOR_SIZE, params.virtual_size)
            }
        };
        if virtual_size == 0 || virtual_size % sector_size as u64 != 0 {
            return Err(Error::corrupt(format!(
                "virtual size {virtual_size} not divisible by sector size {sector_size}"
            )));
        }

        let geometry = BatGeometry::new(block_size, sector_size);
        let bat_length = geometry.bat_length(virtual_size);
        let regions = RegionTable::new(bat_length);

        let mut header = VhdxHeader::new();
        let mut meta = Metadata::new(block_size, sector_size, virtual_size);

        if let Some((p, parent_path)) = &parent {
            meta.has_parent = true;
            let file_name = parent_path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default();
            meta.parent_locator = Some(ParentLocatorMeta {
                parent_linkage: Some(format_guid(&p.header.data_write_guid)),
                relative_path: Some(format!(".\\{file_name}")),
                volume_path: None,
                absolute_win32_path: Some(parent_path.to_string_lossy().replace('/', "\\")),
            });
        }

        let mut dev = Self::open_device(path, false, true, params.compress)?;

        dev.write_all_at(0, &layout::build_file_identifier(CREATOR))?;
        let header_raw = header.serialize();
        dev.write_all_at(HEADER1_OFFSET, &header_raw)?;
        dev.write_all_at(HEADER2_OFFSET, &header_raw)?;

        let region_raw = regions.serialize();
        dev.write_all_at(REGION_TABLE_A_OFFSET, &region_raw)?;
        dev.write_all_at(REGION_TABLE_B_OFFSET, &region_raw)?;

        dev.write_all_at(regions.metadata.file_offset, &meta.serialize())?;

        let bat_end = regions.bat.file_offset + regions.bat.length as u64;
        dev.resize(bat_end + ALLOCATE_ADD_SIZE, false)?;
        let allocated_size = dev.size()?;

        // Both header slots carry sequence 1; rotate into slot A first.
        header.sequence_number = 1;

        // The in-memory BAT mirrors the whole MiB-rounded region, so the
        // trailing sector-bitmap entries of a partial chunk are addressable.
        let region_entries = bat_length as usize / 8;

        Ok(Self {
            dev,
            path: path.to_owned(),
            read_only: false,
            fast_mode: params.fast_mode,
            finished: false,
            header,
            inactive_header_offset: HEADER1_OFFSET,
            regions,
            meta,
            geometry,
            virtual_size,
            block_size,
            sector_size,
            bat: vec![BatEntry::default(); region_entries],
            data_write_guid_updated: true,
            log_cursor: Mutex::new(LogCursor::fresh(1)),
            pending_bat_entries: Mutex::new(BTreeSet::new()),
            sector_bitmaps: Mutex::new(HashMap::new()),
            pending_sector_bitmaps: Mutex::new(BTreeSet::new()),
            next_payload_pos: Mutex::new(bat_end),
            allocated_size,
            // Nothing is durable yet; the first flush must sync payload data
            // before any BAT page reaches the journal.
            flushed_size: 0,
            parent: parent.map(|(p, _)| p),
        })
    }

    pub fn open(path: &Path, read_only: bool) -> Result<Self> {
        let mut dev = Self::open_device(path, read_only, false, false)?;

        let mut ident = [0u8; 8];
        dev.read_exact_at(0, &mut ident)?;
        if &ident != FILE_ID_MAGIC {
            return Err(Error::corrupt("file identifier magic wrong"));
        }

        // Active header = valid CRC with the greatest sequence number.
        let mut slot_a = [0u8; HEADER_SIZE];
        dev.read_exact_at(HEADER1_OFFSET, &mut slot_a)?;
        let mut slot_b = [0u8; HEADER_SIZE];
        dev.read_exact_at(HEADER2_OFFSET, &mut slot_b)?;

        let parsed_a = VhdxHeader::parse(&slot_a)
            .map_err(|e| warn!("header slot A invalid: {e}"))
            .ok();
        let parsed_b = VhdxHeader::parse(&slot_b)
            .map_err(|e| warn!("header slot B invalid: {e}"))
            .ok();

        let (header, inactive_header_offset) = match (parsed_a, parsed_b) {
            (Some(a), Some(b)) => {
                if b.sequence_number > a.sequence_number {
                    (b, HEADER1_OFFSET)
                } else {
                    (a, HEADER2_OFFSET)
                }
            }
            (Some(a), None) => (a, HEADER2_OFFSET),
            (None, Some(b)) => (b, HEADER1_OFFSET),
            (None, None) => return Err(Error::corrupt("both headers are invalid")),
        };

        let mut region_raw = vec![0u8; REGION_TABLE_SIZE];
        dev.read_exact_at(REGION_TABLE_A_OFFSET, &mut region_raw)?;
        let regions = match RegionTable::parse(&region_raw) {
            Ok(r) => r,
            Err(e) => {
                warn!("region table copy A invalid ({e}), trying copy B");
                dev.read_exact_at(REGION_TABLE_B_OFFSET, &mut region_raw)?;
                RegionTable::parse(&region_raw)?
            }
        };

        let mut bat_raw = vec![0u8; regions.bat.length as usize];
        dev.read_exact_at(regions.bat.file_offset, &mut bat_raw)?;

        let mut meta_raw = vec![0u8; regions.metadata.length as usize];
        dev.read_exact_at(regions.metadata.file_offset, &mut meta_raw)?;
        let meta = Metadata::parse(&meta_raw)?;

        let block_size = meta.block_size;
        let sector_size = meta.logical_sector_size;
        let virtual_size = meta.virtual_size;
        let geometry = BatGeometry::new(block_size, sector_size);

        let needed_entries = geometry.total_entries(virtual_size) as usize;
        if needed_entries * 8 > bat_raw.len() {
            return Err(Error::corrupt("BAT region smaller than the disk needs"));
        }
        let bat: Vec<BatEntry> = bat_raw
            .chunks_exact(8)
            .map(|c| BatEntry(u64::from_le_bytes(c.try_into().unwrap())))
            .collect();

        let parent = if meta.has_parent {
            Some(Box::new(Self::open_parent(path, &meta)?))
        } else {
            None
        };

        let mut this = Self {
            dev,
            path: path.to_owned(),
            read_only,
            fast_mode: false,
            finished: read_only,
            header,
            inactive_header_offset,
            regions,
            meta,
            geometry,
            virtual_size,
            block_size,
            sector_size,
            bat,
            data_write_guid_updated: false,
            log_cursor: Mutex::new(LogCursor::fresh(1)),
            pending_bat_entries: Mutex::new(BTreeSet::new()),
            sector_bitmaps: Mutex::new(HashMap::new()),
            pending_sector_bitmaps: Mutex::new(BTreeSet::new()),
            next_payload_pos: Mutex::new(0),
            allocated_size: 0,
            flushed_size: 0,
            parent,
        };

        if !is_zero_guid(&this.header.log_guid) {
            if read_only {
                return Err(Error::ReadOnly(
                    "container has pending log entries; replay requires read-write open",
                ));
            }
            info!("replaying journal of \"{}\"", path.display());
            let next_sequence = replay(this.dev.as_mut(), &this.header)?;
            this.log_cursor.get_mut().unwrap().next_sequence = next_sequence;
            this.header.log_guid = ZERO_GUID;
            this.update_header()?;

            // Replay rewrote BAT pages on disk; reload our copy.
            let mut bat_raw = vec![0u8; this.regions.bat.length as usize];
            this.dev
                .read_exact_at(this.regions.bat.file_offset, &mut bat_raw)?;
            this.bat = bat_raw
                .chunks_exact(8)
                .map(|c| BatEntry(u64::from_le_bytes(c.try_into().unwrap())))
                .collect();
        }

        this.calc_next_payload_pos();
        this.allocated_size = this.dev.size()?;
        this.flushed_size = this.allocated_size;

        if !read_only {
            this.header.file_write_guid = random_guid();
            if !this.fast_mode {
                this.update_header()?;
            }
        }

        Ok(this)
    }

    fn open_parent(child_path: &Path, meta: &Metadata) -> Result<VhdxFile> {
        let locator = meta
            .parent_locator
            .as_ref()
            .ok_or_else(|| Error::corrupt("parent flagged but no parent locator present"))?;
        let linkage = locator
            .parent_linkage
            .as_deref()
            .ok_or_else(|| Error::corrupt("parent locator misses parent_linkage"))?;
        let linkage_guid = parse_guid(linkage)?;
        if is_zero_guid(&linkage_guid) {
            return Err(Error::corrupt("parent linkage GUID is zero"));
        }

        let mut tried = Vec::new();
        let mut candidates: Vec<PathBuf> = Vec::new();
        if let Some(abs) = &locator.absolute_win32_path {
            candidates.push(PathBuf::from(abs.replace('\\', "/")));
        }
        if let Some(rel) = &locator.relative_path {
            let rel = rel.replace('\\', "/");
            let rel = rel.strip_prefix("./").unwrap_or(&rel);
            let base = child_path.parent().unwrap_or_else(|| Path::new(""));
            candidates.push(base.join(rel));
        }

        for candidate in candidates {
            tried.push(candidate.to_string_lossy().into_owned());
            if !candidate.exists() {
                continue;
            }
            let parent = VhdxFile::open(&candidate, true)?;
            if parent.header.data_write_guid != linkage_guid {
                return Err(Error::ParentMismatch {
                    expected: format_guid(&linkage_guid),
                    found: format_guid(&parent.header.data_write_guid),
                });
            }
            return Ok(parent);
        }

        Err(Error::ParentMissing(tried))
    }

    // ── Accessors ────────────────────────────────────────────────────────────

    pub fn data_write_guid(&self) -> &[u8; 16] {
        &self.header.data_write_guid
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn parent(&self) -> Option<&VhdxFile> {
        self.parent.as_deref()
    }

    pub fn sector_size(&self) -> u32 {
        self.sector_size
    }

    pub fn bat_entry(&self, block: u64) -> BatEntry {
        self.bat[self.geometry.bat_index(block) as usize]
    }

    /// BAT entry of the sector-bitmap block covering `block`'s chunk.
    pub fn bitmap_bat_entry(&self, block: u64) -> BatEntry {
        self.bat[self.geometry.bitmap_bat_index(block) as usize]
    }

    // ── Header rotation ──────────────────────────────────────────────────────

    /// Write the in-memory header to the inactive slot with a bumped
    /// sequence number, sync, toggle slots.
    fn update_header(&mut self) -> Result<()> {
        self.header.sequence_number += 1;
        let raw = self.header.serialize();
        self.dev.write_all_at(self.inactive_header_offset, &raw)?;
        self.dev.sync()?;
        self.inactive_header_offset = if self.inactive_header_offset == HEADER1_OFFSET {
            HEADER2_OFFSET
        } else {
            HEADER1_OFFSET
        };
        Ok(())
    }

    // ── Allocation ───────────────────────────────────────────────────────────

    fn calc_next_payload_pos(&mut self) {
        let mut next = MB;
        next = next.max(self.regions.bat.file_offset + self.regions.bat.length as u64);
        next = next.max(self.header.log_offset + self.header.log_length as u64);
        next = next.max(self.regions.metadata.file_offset + self.regions.metadata.length as u64);

        for entry in &self.bat {
            if entry.is_present() {
                next = next.max(entry.file_offset() + self.block_size as u64);
            }
        }

        *self.next_payload_pos.get_mut().unwrap() = next;
    }

    /// Allocate a fresh 1 MiB-aligned payload region for the BAT entry at
    /// `bat_index`, marking it fully present and dirty.
    fn allocate_bat_block_full(&mut self, bat_index: u64) -> Result<()> {
        let new_pos = {
            let mut next = self.next_payload_pos.lock().unwrap();
            let pos = *next;
            *next += self.block_size as u64;
            pos
        };
        debug_assert_eq!(new_pos % MB, 0);

        if new_pos + self.block_size as u64 > self.allocated_size {
            self.allocated_size = new_pos + self.block_size as u64 + ALLOCATE_ADD_SIZE;
            self.dev.resize(self.allocated_size, false)?;
        }

        self.bat[bat_index as usize] =
            BatEntry::new(PAYLOAD_BLOCK_FULLY_PRESENT, new_pos / MB);
        self.pending_bat_entries.lock().unwrap().insert(bat_index);
        Ok(())
    }

    fn mark_bat_dirty(&self, bat_index: u64) {
        self.pending_bat_entries.lock().unwrap().insert(bat_index);
    }

    // ── Sector bitmaps ───────────────────────────────────────────────────────

    /// Load (or create zeroed) the cached bitmap block for `bitmap_index`.
    /// `file_offset_mb == None` means the block is fresh and starts zeroed.
    fn with_sector_bitmap<R>(
        &mut self,
        bitmap_index: u64,
        file_offset_mb: Option<u64>,
        f: impl FnOnce(&mut Vec<u8>) -> R,
    ) -> Result<R> {
        {
            let mut cache = self.sector_bitmaps.lock().unwrap();
            if let Some(buf) = cache.get_mut(&bitmap_index) {
                return Ok(f(buf));
            }
        }

        let mut buf = vec![0u8; self.block_size as usize];
        if let Some(mb) = file_offset_mb {
            self.dev.read_exact_at(mb * MB, &mut buf)?;
        }

        let mut cache = self.sector_bitmaps.lock().unwrap();
        let slot = cache.entry(bitmap_index).or_insert(buf);
        Ok(f(slot))
    }

    fn is_sector_set(&mut self, pos: u64) -> Result<bool> {
        let block = pos / self.block_size as u64;
        let bitmap_index = self.geometry.bitmap_bat_index(block);
        let entry = self.bat[bitmap_index as usize];
        if entry.state() != PAYLOAD_BLOCK_FULLY_PRESENT {
            return Err(Error::corrupt(format!(
                "sector bitmap entry {bitmap_index} not fully present (state {})",
                entry.state()
            )));
        }

        let bit = self.geometry.sector_bitmap_bit(pos);
        self.with_sector_bitmap(bitmap_index, Some(entry.file_offset_mb()), |buf| {
            BitmapView::<LsbFirst>::new(buf).get(bit)
        })
    }

    /// Set the sector bits for `[start, end)` (byte positions), allocating
    /// the chunk's bitmap block if needed.
    fn set_sector_range(&mut self, start: u64, end: u64) -> Result<()> {
        let block = start / self.block_size as u64;
        let bitmap_index = self.geometry.bitmap_bat_index(block);
        let entry = self.bat[bitmap_index as usize];

        let file_offset_mb = match entry.state() {
            PAYLOAD_BLOCK_FULLY_PRESENT => Some(entry.file_offset_mb()),
            PAYLOAD_BLOCK_NOT_PRESENT => {
                self.allocate_bat_block_full(bitmap_index)?;
                None
            }
            other => {
                return Err(Error::corrupt(format!(
                    "sector bitmap entry {bitmap_index} in wrong state {other}"
                )))
            }
        };

        let first_bit = self.geometry.sector_bitmap_bit(start);
        let bits = (end - start).div_ceil(self.sector_size as u64);
        self.with_sector_bitmap(bitmap_index, file_offset_mb, |buf| {
            BitmapViewMut::<LsbFirst>::new(buf).set_range(first_bit, first_bit + bits, true);
        })?;

        self.pending_sector_bitmaps
            .lock()
            .unwrap()
            .insert(bitmap_index);
        Ok(())
    }

    fn clear_sector_range(&mut self, start: u64, end: u64) -> Result<()> {
        let block = start / self.block_size as u64;
        let bitmap_index = self.geometry.bitmap_bat_index(block);
        let entry = self.bat[bitmap_index as usize];
        if entry.state() != PAYLOAD_BLOCK_FULLY_PRESENT {
            return Ok(());
        }

        let first_bit = self.geometry.sector_bitmap_bit(start);
        let bits = (end - start) / self.sector_size as u64;
        self.with_sector_bitmap(bitmap_index, Some(entry.file_offset_mb()), |buf| {
            BitmapViewMut::<LsbFirst>::new(buf).set_range(first_bit, first_bit + bits, false);
        })?;

        self.pending_sector_bitmaps
            .lock()
            .unwrap()
            .insert(bitmap_index);
        Ok(())
    }

    // ── Journal ──────────────────────────────────────────────────────────────

    /// Journal `data` destined for `file_offset`.  Returns true when the log
    /// is full and the caller must durably flush and retry.
    fn log_write(&mut self, file_offset: u64, data: &[u8]) -> Result<bool> {
        if is_zero_guid(&self.header.log_guid) {
            self.header.log_guid = random_guid();
            let next_sequence = self.log_cursor.get_mut().unwrap().next_sequence;
            *self.log_cursor.get_mut().unwrap() = LogCursor::fresh(next_sequence);
            self.update_header()?;
        }

        let mut cursor = *self.log_cursor.get_mut().unwrap();
        let outcome = append_entry(
            self.dev.as_mut(),
            &self.header,
            &mut cursor,
            file_offset,
            data,
            self.flushed_size,
            self.flushed_size,
        )?;
        *self.log_cursor.get_mut().unwrap() = cursor;

        Ok(matches!(outcome, AppendOutcome::Full))
    }

    /// Durably retire the current log generation after its protected state
    /// has been flushed.
    fn retire_log(&mut self) -> Result<()> {
        self.dev.sync()?;
        self.flushed_size = self.dev.size()?;
        self.header.log_guid = ZERO_GUID;
        self.update_header()
    }

    // ── BAT persistence ──────────────────────────────────────────────────────

    /// Serialize the 4 KiB BAT page containing `entry_index`.
    fn bat_page(&self, page: u64) -> Vec<u8> {
        let entries_per_page = LOG_SECTOR_SIZE / 8;
        let mut buf = vec![0u8; LOG_SECTOR_SIZE];
        let first = page as usize * entries_per_page;
        for i in 0..entries_per_page {
            if let Some(entry) = self.bat.get(first + i) {
                buf[i * 8..(i + 1) * 8].copy_from_slice(&entry.0.to_le_bytes());
            }
        }
        buf
    }

    fn flush_pending_sector_bitmaps(&mut self) -> Result<()> {
        let pending: Vec<u64> = {
            let mut p = self.pending_sector_bitmaps.lock().unwrap();
            let v = p.iter().copied().collect();
            p.clear();
            v
        };

        for bitmap_index in pending {
            let entry = self.bat[bitmap_index as usize];
            if entry.state() != PAYLOAD_BLOCK_FULLY_PRESENT {
                return Err(Error::corrupt(format!(
                    "pending sector bitmap {bitmap_index} not fully present at sync"
                )));
            }
            let buf = {
                let cache = self.sector_bitmaps.lock().unwrap();
                cache
                    .get(&bitmap_index)
                    .cloned()
                    .ok_or_else(|| Error::corrupt("pending sector bitmap missing from cache"))?
            };
            self.dev.write_all_at(entry.file_offset(), &buf)?;
        }
        Ok(())
    }

    /// The flush protocol of the write path (see the module docs).  With
    /// `full` the journal is retired and the header rotated afterwards.
    fn sync_int(&mut self, full: bool) -> Result<()> {
        self.flush_pending_sector_bitmaps()?;

        let pending: Vec<u64> = {
            let p = self.pending_bat_entries.lock().unwrap();
            p.iter().copied().collect()
        };

        let pages: BTreeSet<u64> = pending
            .iter()
            .map(|&idx| idx * 8 / LOG_SECTOR_SIZE as u64)
            .collect();

        if !self.fast_mode && !pages.is_empty() {
            // Data first: everything the BAT pages will reference must be
            // durable before the journal mentions them.
            let dev_size = self.dev.size()?;
            if self.flushed_size != dev_size {
                self.dev.sync()?;
                self.flushed_size = dev_size;
            }

            let mut remaining: Vec<u64> = pages.iter().copied().collect();
            while !remaining.is_empty() {
                let mut logged = Vec::new();
                let mut log_full = false;
                for &page in &remaining {
                    let data = self.bat_page(page);
                    let file_offset = self.regions.bat.file_offset + page * LOG_SECTOR_SIZE as u64;
                    if self.log_write(file_offset, &data)? {
                        log_full = true;
                        break;
                    }
                    logged.push(page);
                }

                self.dev.sync()?;
                self.flushed_size = self.dev.size()?;

                // Journalled pages may now be written in place.
                for &page in &logged {
                    let data = self.bat_page(page);
                    self.dev.write_all_at(
                        self.regions.bat.file_offset + page * LOG_SECTOR_SIZE as u64,
                        &data,
                    )?;
                }

                remaining.retain(|p| !logged.contains(p));
                if log_full {
                    // Journal exhausted mid-flush: retire it and restart a
                    // fresh generation for the remainder.
                    self.retire_log()?;
                }
            }
        } else {
            for &page in &pages {
                let data = self.bat_page(page);
                self.dev.write_all_at(
                    self.regions.bat.file_offset + page * LOG_SECTOR_SIZE as u64,
                    &data,
                )?;
            }
        }

        self.pending_bat_entries.lock().unwrap().clear();

        if self.fast_mode {
            self.dev.sync()?;
            self.flushed_size = self.dev.size()?;
        }

        if full && !self.fast_mode {
            self.dev.sync()?;
            self.flushed_size = self.dev.size()?;
            if !is_zero_guid(&self.header.log_guid) {
                self.header.log_guid = ZERO_GUID;
                self.update_header()?;
            }
        }

        Ok(())
    }

    // ── Sector presence ──────────────────────────────────────────────────────

    fn has_sector_local(&mut self, pos: u64) -> Result<bool> {
        let block = pos / self.block_size as u64;
        let entry = self.bat[self.geometry.bat_index(block) as usize];
        match entry.state() {
            PAYLOAD_BLOCK_FULLY_PRESENT => Ok(true),
            PAYLOAD_BLOCK_PARTIALLY_PRESENT => self.is_sector_set(pos),
            _ => Ok(false),
        }
    }
}

// ── ImageContainer ───────────────────────────────────────────────────────────

impl ImageContainer for VhdxFile {
    fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        if pos >= self.virtual_size {
            return Ok(0);
        }
        let len = buf.len().min((self.virtual_size - pos) as usize);
        let bs = self.block_size as u64;

        let mut done = 0usize;
        while done < len {
            let abs = pos + done as u64;
            let block = abs / bs;
            let within = abs % bs;
            let entry = self.bat[self.geometry.bat_index(block) as usize];

            match entry.state() {
                PAYLOAD_BLOCK_FULLY_PRESENT => {
                    let n = ((bs - within) as usize).min(len - done);
                    self.dev
                        .read_exact_at(entry.file_offset() + within, &mut buf[done..done + n])?;
                    done += n;
                }
                PAYLOAD_BLOCK_PARTIALLY_PRESENT => {
                    if self.parent.is_none() {
                        return Err(Error::corrupt(
                            "partially present block without a parent container",
                        ));
                    }
                    let ss = self.sector_size as u64;
                    let n = ((ss - abs % ss) as usize).min(len - done);
                    if self.is_sector_set(abs)? {
                        self.dev
                            .read_exact_at(entry.file_offset() + within, &mut buf[done..done + n])?;
                    } else {
                        let parent = self.parent.as_mut().unwrap();
                        read_fully_or_zero(parent.as_mut(), abs, &mut buf[done..done + n])?;
                    }
                    done += n;
                }
                PAYLOAD_BLOCK_NOT_PRESENT => {
                    let n = ((bs - within) as usize).min(len - done);
                    match &mut self.parent {
                        Some(parent) => {
                            read_fully_or_zero(parent.as_mut(), abs, &mut buf[done..done + n])?
                        }
                        None => buf[done..done + n].fill(0),
                    }
                    done += n;
                }
                PAYLOAD_BLOCK_UNDEFINED | PAYLOAD_BLOCK_ZERO | PAYLOAD_BLOCK_UNMAPPED => {
                    let n = ((bs - within) as usize).min(len - done);
                    buf[done..done + n].fill(0);
                    done += n;
                }
                other => {
                    return Err(Error::corrupt(format!("unknown BAT entry state {other}")));
                }
            }
        }

        Ok(done)
    }

    fn write_at(&mut self, pos: u64, buf: &[u8]) -> Result<usize> {
        if self.read_only {
            return Err(Error::ReadOnly("container opened read-only"));
        }
        if pos + buf.len() as u64 > self.virtual_size {
            return Err(Error::OutOfRange {
                pos,
                len: buf.len() as u64,
                virtual_size: self.virtual_size,
            });
        }

        // First write of this session: the content diverges from whatever the
        // data_write_guid previously identified.
        if !self.data_write_guid_updated {
            self.header.data_write_guid = random_guid();
            self.data_write_guid_updated = true;
            if !self.fast_mode {
                self.update_header()?;
            }
        }

        let bs = self.block_size as u64;
        let mut done = 0usize;
        while done < buf.len() {
            let abs = pos + done as u64;
            let block = abs / bs;
            let within = abs % bs;
            let n = ((bs - within) as usize).min(buf.len() - done);
            let bat_index = self.geometry.bat_index(block);
            let entry = self.bat[bat_index as usize];

            match entry.state() {
                PAYLOAD_BLOCK_FULLY_PRESENT => {
                    self.dev
                        .write_all_at(entry.file_offset() + within, &buf[done..done + n])?;
                }
                PAYLOAD_BLOCK_PARTIALLY_PRESENT => {
                    if self.parent.is_none() {
                        return Err(Error::corrupt(
                            "partially present block without a parent container",
                        ));
                    }
                    self.set_sector_range(abs, abs + n as u64)?;
                    self.dev
                        .write_all_at(entry.file_offset() + within, &buf[done..done + n])?;
                }
                PAYLOAD_BLOCK_NOT_PRESENT
                | PAYLOAD_BLOCK_UNDEFINED
                | PAYLOAD_BLOCK_ZERO
                | PAYLOAD_BLOCK_UNMAPPED => {
                    self.allocate_bat_block_full(bat_index)?;
                    if self.parent.is_some() {
                        let e = self.bat[bat_index as usize].with_state(PAYLOAD_BLOCK_PARTIALLY_PRESENT);
                        self.bat[bat_index as usize] = e;
                        self.mark_bat_dirty(bat_index);
                        self.set_sector_range(abs, abs + n as u64)?;
                    }
                    let entry = self.bat[bat_index as usize];
                    self.dev
                        .write_all_at(entry.file_offset() + within, &buf[done..done + n])?;
                }
                other => {
                    return Err(Error::corrupt(format!("unknown BAT entry state {other}")));
                }
            }

            done += n;
        }

        Ok(buf.len())
    }

    fn virtual_size(&self) -> u64 {
        self.virtual_size
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn has_sector(&mut self, pos: u64) -> Result<bool> {
        if pos >= self.virtual_size {
            return Ok(false);
        }
        if self.has_sector_local(pos)? {
            return Ok(true);
        }
        match &mut self.parent {
            Some(p) => p.has_sector(pos),
            None => Ok(false),
        }
    }

    fn this_has_sector(&mut self, pos: u64) -> Result<bool> {
        if pos >= self.virtual_size {
            return Ok(false);
        }
        self.has_sector_local(pos)
    }

    fn used_size(&mut self) -> Result<u64> {
        let mut used = 0u64;
        let blocks = self.geometry.data_blocks(self.virtual_size);
        for block in 0..blocks {
            let entry = self.bat[self.geometry.bat_index(block) as usize];
            if entry.is_present() {
                used += self.block_size as u64;
            }
        }
        Ok(used)
    }

    fn sync(&mut self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        self.sync_int(false)
    }

    fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        if !self.read_only {
            self.sync_int(true)?;
        }
        if let Some(p) = &mut self.parent {
            p.finish()?;
        }
        self.dev.finish()?;
        self.finished = true;
        Ok(())
    }

    fn trim(&mut self, start: u64, end: u64) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly("container opened read-only"));
        }
        if end > self.virtual_size {
            return Err(Error::OutOfRange {
                pos: start,
                len: end.saturating_sub(start),
                virtual_size: self.virtual_size,
            });
        }

        let bs = self.block_size as u64;
        let ss = self.sector_size as u64;
        let mut pos = start;

        while pos < end {
            let block = pos / bs;
            let bat_index = self.geometry.bat_index(block);
            let entry = self.bat[bat_index as usize];

            // Whole block covered: reduce it to an explicit zero block.
            if pos % bs == 0 && pos + bs <= end {
                match entry.state() {
                    PAYLOAD_BLOCK_NOT_PRESENT if self.parent.is_none() => {}
                    PAYLOAD_BLOCK_ZERO => {}
                    _ => {
                        self.bat[bat_index as usize] = entry.with_state(PAYLOAD_BLOCK_ZERO);
                        self.mark_bat_dirty(bat_index);
                    }
                }
                pos += bs;
                continue;
            }

            let upto = end.min((block + 1) * bs);
            match entry.state() {
                PAYLOAD_BLOCK_FULLY_PRESENT => {
                    // Partially covered full block: zero the covered bytes.
                    let zeros = vec![0u8; (upto - pos) as usize];
                    self.dev
                        .write_all_at(entry.file_offset() + pos % bs, &zeros)?;
                }
                PAYLOAD_BLOCK_PARTIALLY_PRESENT => {
                    let mut p = pos;
                    while p < upto {
                        let sector_start = p - p % ss;
                        let sector_end = sector_start + ss;
                        if p == sector_start && sector_end <= upto {
                            // Full sectors: drop authority, reads fall back to
                            // the parent.
                            let run_end = upto - (upto % ss);
                            self.clear_sector_range(sector_start, run_end)?;
                            p = run_end;
                        } else {
                            if self.is_sector_set(p)? {
                                let zero_end = upto.min(sector_end);
                                let zeros = vec![0u8; (zero_end - p) as usize];
                                self.dev
                                    .write_all_at(entry.file_offset() + p % bs, &zeros)?;
                            }
                            p = sector_end.min(upto);
                        }
                    }
                }
                _ => {}
            }
            pos = upto;
        }

        Ok(())
    }

    fn make_full(
        &mut self,
        fs_offset: u64,
        sink: &mut dyn MakeFullSink,
        cancel: &CancelToken,
    ) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly("container opened read-only"));
        }

        let cbitmap_path = {
            let mut p = self.path.as_os_str().to_owned();
            p.push(".cbitmap");
            PathBuf::from(p)
        };
        let source: Box<dyn FilesystemSource> = match ClientBitmap::open(&cbitmap_path) {
            Ok(cb) => Box::new(cb),
            Err(e) => {
                warn!("client bitmap unavailable ({e}); falling back to the NTFS bitmap");
                let mut view = VolumeView::new(self, fs_offset);
                Box::new(FsNtfs::parse(&mut view)?)
            }
        };

        let fs_block = source.block_size();
        let ss = self.sector_size as u64;
        let volume_size = self.virtual_size.saturating_sub(fs_offset);
        let n_fs_blocks = (volume_size / fs_block) as i64;
        let fs_blocks_per_container_block = (self.block_size as u64 / fs_block).max(1) as i64;

        let mut sector_buf = vec![0u8; ss as usize];

        let mut fs_block_idx: i64 = 0;
        while fs_block_idx < n_fs_blocks {
            cancel.check()?;

            let group_end = (fs_block_idx + fs_blocks_per_container_block).min(n_fs_blocks);
            let group_used = (fs_block_idx..group_end).any(|i| source.has_block(i));

            if group_used {
                let start = fs_offset + fs_block_idx as u64 * fs_block;
                let end = (start + self.block_size as u64)
                    .min(fs_offset + n_fs_blocks as u64 * fs_block);
                let mut p = start;
                while p < end {
                    if !self.this_has_sector(p)? && self.has_sector(p)? {
                        self.read_at(p, &mut sector_buf)?;
                        self.write_at(p, &sector_buf)?;
                        sink.wrote_sector(p, &sector_buf)?;
                    }
                    p += ss;
                }
            } else {
                let start = fs_block_idx as u64 * fs_block;
                let end = (start + self.block_size as u64).min(n_fs_blocks as u64 * fs_block);
                sink.empty_block(start, end)?;
            }

            fs_block_idx = group_end;
        }

        // Without a parent, partially-present blocks make no sense: every
        // still-unset sector would read as an error.  Promote them; sectors
        // never written anywhere read as zeros from the sparse payload.
        let blocks = self.geometry.data_blocks(self.virtual_size);
        for block in 0..blocks {
            let bat_index = self.geometry.bat_index(block);
            let entry = self.bat[bat_index as usize];
            if entry.state() == PAYLOAD_BLOCK_PARTIALLY_PRESENT {
                self.bat[bat_index as usize] = entry.with_state(PAYLOAD_BLOCK_FULLY_PRESENT);
                self.mark_bat_dirty(bat_index);
            }
        }

        self.parent = None;
        self.meta.has_parent = false;
        self.meta.parent_locator = None;
        let meta_raw = self.meta.serialize();
        self.dev
            .write_all_at(self.regions.metadata.file_offset, &meta_raw)?;

        Ok(())
    }
}

fn read_fully_or_zero(parent: &mut VhdxFile, pos: u64, buf: &mut [u8]) -> Result<()> {
    let mut done = 0usize;
    while done < buf.len() {
        let n = parent.read_at(pos + done as u64, &mut buf[done..])?;
        if n == 0 {
            buf[done..].fill(0);
            break;
        }
        done += n;
    }
    Ok(())
}

impl Drop for VhdxFile {
    fn drop(&mut self) {
        if !self.finished && !self.read_only {
            if let Err(e) = self.finish() {
                warn!("container finish on drop failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::layout::crc32c;

    #[test]
    fn crc_helper_matches_bitwise_reference() {
        // Bit-by-bit Castagnoli, as the format specification defines it.
        fn reference(data: &[u8]) -> u32 {
            let mut crc: u32 = 0xFFFF_FFFF;
            for &b in data {
                crc ^= b as u32;
                for _ in 0..8 {
                    let mask = (crc & 1).wrapping_neg();
                    crc = (crc >> 1) ^ (0x82F6_3B78 & mask);
                }
            }
            !crc
        }

        let data: Vec<u8> = (0u8..=255).collect();
        assert_eq!(crc32c(&data), reference(&data));
    }
}
