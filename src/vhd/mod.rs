//! ContainerV1 — fixed-block sparse differencing container.
//!
//! File shape (see `layout` for the bit-exact structures):
//!
//! ```text
//! [ 512 B footer copy ]
//! [ 1024 B dynamic header ]
//! [ BAT: max_table_entries × 4 B, sector padded ]
//! [ parent locator strings, sector padded (differencing only) ]
//! [ payload block = [ sector bitmap ‖ block_size bytes ] ]*
//! [ 512 B trailing footer ]
//! ```
//!
//! A BAT entry holds the sector offset of its block's bitmap, or
//! `0xFFFFFFFF` when the block is not present.  Bit `i` of a block bitmap
//! (MSB first) marks sector `i` authoritative in this file; unset sectors
//! resolve through the parent chain, or as zeros without a parent.
//!
//! One block bitmap is cached at a time.  In fast mode dirty bitmaps are
//! written back only on block switch and at finish; otherwise after every
//! write batch.  The trailing footer and the BAT are rewritten whenever a
//! write allocated new blocks (at finish in fast mode).

pub mod layout;

use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::bitmap::{BitmapView, BitmapViewMut, MsbFirst};
use crate::compressed::{is_compressed, CompressedFile};
use crate::container::{CreateParams, ImageContainer, MakeFullSink};
use crate::device::{BlockDevice, FileDevice, VolumeView};
use crate::error::{Error, Result};
use crate::fs::{ClientBitmap, FilesystemSource, FsNtfs};
use crate::progress::CancelToken;

use self::layout::{
    encode_utf16be, encode_utf16le, DynamicHeader, ParentLocator, VhdFooter, BAT_ENTRY_UNUSED,
    DISK_TYPE_DIFFERENCING, DISK_TYPE_DYNAMIC, DYNAMIC_HEADER_SIZE, FOOTER_SIZE, PLAT_CODE_W2KU,
    PLAT_CODE_W2RU,
};

pub const SECTOR_SIZE: u32 = 512;

const DEF_DYNAMIC_HEADER_OFFSET: u64 = 512;
const DEF_BAT_OFFSET: u64 = 512 + 1024;

fn round_up(v: u64, multiple: u64) -> u64 {
    v.div_ceil(multiple) * multiple
}

pub struct VhdFile {
    dev: Box<dyn BlockDevice>,
    path: PathBuf,
    read_only: bool,
    fast_mode: bool,

    footer: VhdFooter,
    header: DynamicHeader,
    virtual_size: u64,
    block_size: u32,

    bat: Vec<u32>,
    bat_offset: u64,
    dynamic_header_offset: u64,

    /// Next free payload position (sector aligned); also where the trailing
    /// footer lives.
    next_block_offset: u64,

    /// Bytes of one block's sector bitmap, sector padded.
    bitmap_size: u32,
    cached_block: Option<u64>,
    bitmap: Vec<u8>,
    bitmap_data_offset: u64,
    bitmap_dirty: bool,

    /// A write allocated blocks since the footer/BAT were last persisted.
    layout_dirty: bool,

    parent: Option<Box<VhdFile>>,
    finished: bool,
}

// ── Construction ─────────────────────────────────────────────────────────────

impl VhdFile {
    fn bitmap_size_for(block_size: u32) -> u32 {
        let bits_bytes = (block_size / SECTOR_SIZE).div_ceil(8);
        round_up(bits_bytes as u64, SECTOR_SIZE as u64) as u32
    }

    fn open_device(path: &Path, read_only: bool, create: bool, compress: bool) -> Result<Box<dyn BlockDevice>> {
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

    /// Create a fresh dynamic container.
    pub fn create(path: &Path, params: &CreateParams) -> Result<Self> {
        let dev = Self::open_device(path, false, true, params.compress)?;

        let block_size = params.block_size;
        let virtual_size = params.virtual_size;
        let bat_entries = virtual_size.div_ceil(block_size as u64) as u32;

        let footer = VhdFooter::new(virtual_size, DISK_TYPE_DYNAMIC, DEF_DYNAMIC_HEADER_OFFSET);
        let header = DynamicHeader::new(DEF_BAT_OFFSET, bat_entries, block_size);
        let bat = vec![BAT_ENTRY_UNUSED; bat_entries as usize];

        let next_block_offset = round_up(
            DEF_BAT_OFFSET + bat_entries as u64 * 4,
            SECTOR_SIZE as u64,
        );

        let mut this = Self {
            dev,
            path: path.to_owned(),
            read_only: false,
            fast_mode: params.fast_mode,
            footer,
            header,
            virtual_size,
            block_size,
            bat,
            bat_offset: DEF_BAT_OFFSET,
            dynamic_header_offset: DEF_DYNAMIC_HEADER_OFFSET,
            next_block_offset,
            bitmap_size: Self::bitmap_size_for(block_size),
            cached_block: None,
            bitmap: vec![0u8; Self::bitmap_size_for(block_size) as usize],
            bitmap_data_offset: 0,
            bitmap_dirty: false,
            layout_dirty: false,
            parent: None,
            finished: false,
        };

        this.write_layout()?;
        Ok(this)
    }

    /// Create a differencing child of `parent_path`.  Size and block size
    /// are inherited from the parent.
    pub fn create_diff(path: &Path, parent_path: &Path, params: &CreateParams) -> Result<Self> {
        let parent = Box::new(VhdFile::open(parent_path, true)?);

        let block_size = parent.block_size;
        let virtual_size = parent.virtual_size;
        let bat_entries = virtual_size.div_ceil(block_size as u64) as u32;

        let footer = VhdFooter::new(
            virtual_size,
            DISK_TYPE_DIFFERENCING,
            DEF_DYNAMIC_HEADER_OFFSET,
        );

        let mut header = DynamicHeader::new(DEF_BAT_OFFSET, bat_entries, block_size);
        header.parent_uid = parent.footer.uid;
        header.parent_timestamp = parent.footer.timestamp;

        let parent_file_name = parent_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        header.parent_unicode_name = encode_utf16be(&format!("./{parent_file_name}"));

        // Locator payloads, sector padded, placed right after the BAT.
        let abs_payload = encode_utf16le(&parent_path.to_string_lossy());
        let rel_payload = encode_utf16le(&format!(".\\{parent_file_name}"));

        let mut cursor = round_up(DEF_BAT_OFFSET + bat_entries as u64 * 4, SECTOR_SIZE as u64);
        let abs_offset = cursor;
        let abs_space = round_up(abs_payload.len() as u64, SECTOR_SIZE as u64) as u32;
        cursor += abs_space as u64;
        let rel_offset = cursor;
        let rel_space = round_up(rel_payload.len() as u64, SECTOR_SIZE as u64) as u32;
        cursor += rel_space as u64;

        header.parent_locators[0] = ParentLocator {
            platform_code: PLAT_CODE_W2KU,
            data_space: abs_space,
            data_length: abs_payload.len() as u32,
            data_offset: abs_offset,
        };
        header.parent_locators[1] = ParentLocator {
            platform_code: PLAT_CODE_W2RU,
            data_space: rel_space,
            data_length: rel_payload.len() as u32,
            data_offset: rel_offset,
        };

        let mut dev = Self::open_device(path, false, true, params.compress)?;
        dev.write_all_at(abs_offset, &abs_payload)?;
        dev.write_all_at(rel_offset, &rel_payload)?;

        let mut this = Self {
            dev,
            path: path.to_owned(),
            read_only: false,
            fast_mode: params.fast_mode,
            footer,
            header,
            virtual_size,
            block_size,
            bat: vec![BAT_ENTRY_UNUSED; bat_entries as usize],
            bat_offset: DEF_BAT_OFFSET,
            dynamic_header_offset: DEF_DYNAMIC_HEADER_OFFSET,
            next_block_offset: cursor,
            bitmap_size: Self::bitmap_size_for(block_size),
            cached_block: None,
            bitmap: vec![0u8; Self::bitmap_size_for(block_size) as usize],
            bitmap_data_offset: 0,
            bitmap_dirty: false,
            layout_dirty: false,
            parent: Some(parent),
            finished: false,
        };

        this.write_layout()?;
        Ok(this)
    }

    /// Open an existing container.
    pub fn open(path: &Path, read_only: bool) -> Result<Self> {
        let mut dev = Self::open_device(path, read_only, false, false)?;

        let dev_size = dev.size()?;
        if dev_size < (FOOTER_SIZE + DYNAMIC_HEADER_SIZE) as u64 {
            return Err(Error::corrupt("container file too small"));
        }

        // Trailing footer first; the duplicate at offset 0 recovers an
        // interrupted commit.
        let mut raw_footer = [0u8; FOOTER_SIZE];
        dev.read_exact_at(dev_size - FOOTER_SIZE as u64, &mut raw_footer)?;
        let footer = match VhdFooter::parse(&raw_footer) {
            Ok(f) => f,
            Err(e) => {
                warn!("trailing footer invalid ({e}), falling back to the copy at offset 0");
                dev.read_exact_at(0, &mut raw_footer)?;
                VhdFooter::parse(&raw_footer)?
            }
        };

        let dynamic_header_offset = footer.data_offset;
        let mut raw_header = [0u8; DYNAMIC_HEADER_SIZE];
        dev.read_exact_at(dynamic_header_offset, &mut raw_header)?;
        let header = DynamicHeader::parse(&raw_header)?;

        let bat_offset = header.table_offset;
        let bat_entries = header.max_table_entries;
        let block_size = header.block_size;
        if block_size == 0 || block_size % SECTOR_SIZE != 0 {
            return Err(Error::corrupt("block size invalid"));
        }
        if (bat_entries as u64) < footer.current_size.div_ceil(block_size as u64) {
            return Err(Error::corrupt("BAT too small for current size"));
        }

        let mut bat_raw = vec![0u8; bat_entries as usize * 4];
        dev.read_exact_at(bat_offset, &mut bat_raw)?;
        let bat: Vec<u32> = bat_raw
            .chunks_exact(4)
            .map(|c| u32::from_be_bytes(c.try_into().unwrap()))
            .collect();

        let parent = if footer.disk_type == DISK_TYPE_DIFFERENCING {
            Some(Box::new(Self::open_parent(path, &header)?))
        } else {
            None
        };

        let next_block_offset = round_up(dev_size - FOOTER_SIZE as u64, SECTOR_SIZE as u64);

        Ok(Self {
            dev,
            path: path.to_owned(),
            read_only,
            fast_mode: false,
            virtual_size: footer.current_size,
            block_size,
            footer,
            header,
            bat,
            bat_offset,
            dynamic_header_offset,
            next_block_offset,
            bitmap_size: Self::bitmap_size_for(block_size),
            cached_block: None,
            bitmap: vec![0u8; Self::bitmap_size_for(block_size) as usize],
            bitmap_data_offset: 0,
            bitmap_dirty: false,
            layout_dirty: false,
            parent,
            finished: read_only,
        })
    }

    /// Resolve the parent by the recorded name: relative to the child's
    /// directory first (including `../` traversal), then as recorded.
    fn open_parent(child_path: &Path, header: &DynamicHeader) -> Result<VhdFile> {
        let recorded = header.parent_name().replace('\\', "/");
        let mut tried = Vec::new();

        let mut base = child_path.parent().map(Path::to_owned).unwrap_or_default();
        let mut rel = recorded.as_str();
        while let Some(stripped) = rel.strip_prefix("../") {
            base = base.parent().map(Path::to_owned).unwrap_or_default();
            rel = stripped;
        }
        let rel = rel.strip_prefix("./").unwrap_or(rel);

        let candidate = base.join(rel);
        tried.push(candidate.to_string_lossy().into_owned());
        let path = if candidate.exists() {
            candidate
        } else {
            let absolute = PathBuf::from(&recorded);
            tried.push(recorded.clone());
            if absolute.exists() {
                absolute
            } else {
                return Err(Error::ParentMissing(tried));
            }
        };

        info!("opening parent container at \"{}\"", path.display());
        let parent = VhdFile::open(&path, true)?;

        if parent.footer.uid != header.parent_uid {
            return Err(Error::ParentMismatch {
                expected: hex::encode(header.parent_uid),
                found: hex::encode(parent.footer.uid),
            });
        }
        if parent.footer.timestamp != header.parent_timestamp {
            warn!(
                "parent timestamp mismatch (expected {}, found {}); parent was modified? \
                 continuing anyway",
                header.parent_timestamp, parent.footer.timestamp
            );
        }

        Ok(parent)
    }

    pub fn uid(&self) -> &[u8; 16] {
        &self.footer.uid
    }

    pub fn timestamp(&self) -> u32 {
        self.footer.timestamp
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn parent(&self) -> Option<&VhdFile> {
        self.parent.as_deref()
    }

    pub fn is_differencing(&self) -> bool {
        self.footer.disk_type == DISK_TYPE_DIFFERENCING
    }

    pub fn parent_uid_recorded(&self) -> &[u8; 16] {
        &self.header.parent_uid
    }

    pub fn bat_entry(&self, block: u64) -> u32 {
        self.bat[block as usize]
    }

    // ── Layout persistence ───────────────────────────────────────────────────

    fn write_layout(&mut self) -> Result<()> {
        let footer_raw = self.footer.serialize();
        self.dev.write_all_at(0, &footer_raw)?;
        let header_raw = self.header.serialize();
        self.dev
            .write_all_at(self.dynamic_header_offset, &header_raw)?;
        self.write_bat()?;
        self.write_trailing_footer()?;
        Ok(())
    }

    fn write_bat(&mut self) -> Result<()> {
        let mut raw = Vec::with_capacity(self.bat.len() * 4);
        for &e in &self.bat {
            raw.extend_from_slice(&e.to_be_bytes());
        }
        self.dev.write_all_at(self.bat_offset, &raw)
    }

    fn write_trailing_footer(&mut self) -> Result<()> {
        let raw = self.footer.serialize();
        self.dev.write_all_at(self.next_block_offset, &raw)
    }

    // ── Block bitmap cache ───────────────────────────────────────────────────

    fn flush_cached_bitmap(&mut self) -> Result<()> {
        if self.bitmap_dirty {
            let offset = self.bitmap_data_offset;
            let bitmap = std::mem::take(&mut self.bitmap);
            let res = self.dev.write_all_at(offset, &bitmap);
            self.bitmap = bitmap;
            res?;
            self.bitmap_dirty = false;
        }
        Ok(())
    }

    /// Make `block`'s bitmap the cached one.  Returns false if the block is
    /// not present in this file.
    fn load_bitmap(&mut self, block: u64) -> Result<bool> {
        if self.cached_block == Some(block) {
            return Ok(true);
        }
        let bat_ref = self.bat[block as usize];
        if bat_ref == BAT_ENTRY_UNUSED {
            return Ok(false);
        }

        self.flush_cached_bitmap()?;

        let data_offset = bat_ref as u64 * SECTOR_SIZE as u64;
        let mut bitmap = std::mem::take(&mut self.bitmap);
        let res = self.dev.read_exact_at(data_offset, &mut bitmap);
        self.bitmap = bitmap;
        res?;

        self.cached_block = Some(block);
        self.bitmap_data_offset = data_offset;
        Ok(true)
    }

    /// Append a fresh block: zeroed bitmap becomes the cached one.
    fn allocate_block(&mut self, block: u64) -> Result<u64> {
        debug_assert_eq!(self.bat[block as usize], BAT_ENTRY_UNUSED);

        self.flush_cached_bitmap()?;

        let data_offset = self.next_block_offset;
        self.next_block_offset += self.bitmap_size as u64 + self.block_size as u64;

        self.bitmap.fill(0);
        self.cached_block = Some(block);
        self.bitmap_data_offset = data_offset;
        self.bitmap_dirty = false;

        // The zeroed bitmap must exist on disk before any sector write.
        let bitmap = std::mem::take(&mut self.bitmap);
        let res = self.dev.write_all_at(data_offset, &bitmap);
        self.bitmap = bitmap;
        res?;

        self.bat[block as usize] = (data_offset / SECTOR_SIZE as u64) as u32;
        self.layout_dirty = true;
        Ok(data_offset)
    }

    fn read_parent_or_zero(&mut self, pos: u64, buf: &mut [u8]) -> Result<()> {
        match &mut self.parent {
            Some(p) => {
                let mut done = 0usize;
                while done < buf.len() {
                    let n = p.read_at(pos + done as u64, &mut buf[done..])?;
                    if n == 0 {
                        // Past the parent's size: missing parent data is zero.
                        buf[done..].fill(0);
                        break;
                    }
                    done += n;
                }
                Ok(())
            }
            None => {
                buf.fill(0);
                Ok(())
            }
        }
    }

    /// Length of the run of sectors starting at `sector` whose bitmap bit
    /// equals `state`, capped to `max_sectors`.
    fn sector_run(&self, sector: u64, state: bool, max_sectors: u64) -> u64 {
        let view = BitmapView::<MsbFirst>::new(&self.bitmap);
        let mut run = 1u64;
        while run < max_sectors && view.get(sector + run) == state {
            run += 1;
        }
        run
    }

    // ── Trim / make_full internals ───────────────────────────────────────────

    fn trim_block(&mut self, block: u64, start: u64, end: u64) -> Result<()> {
        if !self.load_bitmap(block)? {
            // Nothing stored here; reads already fall through.
            return Ok(());
        }

        let block_base = block * self.block_size as u64;
        let data_offset = self.bitmap_data_offset;
        let ss = SECTOR_SIZE as u64;

        let mut pos = start;
        while pos < end {
            let sector = (pos - block_base) / ss;
            let sector_start = block_base + sector * ss;
            let sector_end = sector_start + ss;
            let covered_start = pos.max(sector_start);
            let covered_end = end.min(sector_end);

            let bit_set = BitmapView::<MsbFirst>::new(&self.bitmap).get(sector);

            if covered_start == sector_start && covered_end == sector_end {
                // Whole sector trimmed: future reads fall through to the
                // parent (or zeros); zero the stale payload as well.
                if bit_set {
                    let mut bm = BitmapViewMut::<MsbFirst>::new(&mut self.bitmap);
                    bm.set(sector, false);
                    self.bitmap_dirty = true;
                    let zeros = vec![0u8; ss as usize];
                    self.dev.write_all_at(
                        data_offset + self.bitmap_size as u64 + sector * ss,
                        &zeros,
                    )?;
                }
            } else if bit_set {
                // Partial sector: the rest of the sector stays live, so only
                // the covered range is zeroed and the bit stays set.
                let zeros = vec![0u8; (covered_end - covered_start) as usize];
                self.dev.write_all_at(
                    data_offset + self.bitmap_size as u64 + (covered_start - block_base),
                    &zeros,
                )?;
            }

            pos = sector_end;
        }

        if !self.fast_mode {
            self.flush_cached_bitmap()?;
        }
        Ok(())
    }
}

// ── ImageContainer ───────────────────────────────────────────────────────────

impl ImageContainer for VhdFile {
    fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        if pos >= self.virtual_size {
            return Ok(0);
        }
        let len = buf.len().min((self.virtual_size - pos) as usize);
        let bs = self.block_size as u64;
        let ss = SECTOR_SIZE as u64;

        let mut done = 0usize;
        while done < len {
            let abs = pos + done as u64;
            let block = abs / bs;
            let within = abs % bs;
            let chunk = ((bs - within) as usize).min(len - done);

            if !self.load_bitmap(block)? {
                self.read_parent_or_zero(abs, &mut buf[done..done + chunk])?;
                done += chunk;
                continue;
            }

            let data_offset = self.bitmap_data_offset;
            let mut cur = 0usize;
            while cur < chunk {
                let in_block = within + cur as u64;
                let sector = in_block / ss;
                let in_sector = in_block % ss;

                let view = BitmapView::<MsbFirst>::new(&self.bitmap);
                let state = view.get(sector);

                // Extend over same-state sectors for one device call.
                let remaining = (chunk - cur) as u64;
                let max_sectors = (in_sector + remaining).div_ceil(ss);
                let run_sectors = self.sector_run(sector, state, max_sectors);
                let n = ((run_sectors * ss - in_sector) as usize).min(chunk - cur);

                if state {
                    self.dev.read_exact_at(
                        data_offset + self.bitmap_size as u64 + in_block,
                        &mut buf[done + cur..done + cur + n],
                    )?;
                } else {
                    self.read_parent_or_zero(abs + cur as u64, &mut buf[done + cur..done + cur + n])?;
                }
                cur += n;
            }

            done += chunk;
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

        let bs = self.block_size as u64;
        let ss = SECTOR_SIZE as u64;

        let mut done = 0usize;
        while done < buf.len() {
            let abs = pos + done as u64;
            let block = abs / bs;
            let within = abs % bs;
            let chunk = ((bs - within) as usize).min(buf.len() - done);

            if !self.load_bitmap(block)? {
                self.allocate_block(block)?;
            }
            let data_offset = self.bitmap_data_offset;

            let mut cur = 0usize;
            while cur < chunk {
                let in_block = within + cur as u64;
                let sector = in_block / ss;
                let in_sector = in_block % ss;
                let n = ((ss - in_sector) as usize).min(chunk - cur);

                let was_set = BitmapView::<MsbFirst>::new(&self.bitmap).get(sector);

                if n < ss as usize && !was_set {
                    // Partial write into a sector we do not own yet: merge
                    // with the parent's content so the rest stays correct.
                    let sector_base = abs + cur as u64 - in_sector;
                    let mut merged = vec![0u8; ss as usize];
                    self.read_parent_or_zero(sector_base, &mut merged)?;
                    merged[in_sector as usize..in_sector as usize + n]
                        .copy_from_slice(&buf[done + cur..done + cur + n]);
                    self.dev.write_all_at(
                        data_offset + self.bitmap_size as u64 + sector * ss,
                        &merged,
                    )?;
                } else {
                    self.dev.write_all_at(
                        data_offset + self.bitmap_size as u64 + in_block,
                        &buf[done + cur..done + cur + n],
                    )?;
                }

                let mut bm = BitmapViewMut::<MsbFirst>::new(&mut self.bitmap);
                if bm.set(sector, true) {
                    self.bitmap_dirty = true;
                }
                cur += n;
            }

            if !self.fast_mode {
                self.flush_cached_bitmap()?;
            }
            done += chunk;
        }

        if self.layout_dirty && !self.fast_mode {
            self.write_trailing_footer()?;
            self.write_bat()?;
            self.layout_dirty = false;
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
        if self.this_has_sector(pos)? {
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
        let block = pos / self.block_size as u64;
        if !self.load_bitmap(block)? {
            return Ok(false);
        }
        let sector = (pos % self.block_size as u64) / SECTOR_SIZE as u64;
        Ok(BitmapView::<MsbFirst>::new(&self.bitmap).get(sector))
    }

    fn used_size(&mut self) -> Result<u64> {
        let used = self
            .bat
            .iter()
            .filter(|&&e| e != BAT_ENTRY_UNUSED)
            .count() as u64;
        Ok(used * self.block_size as u64)
    }

    fn sync(&mut self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        self.flush_cached_bitmap()?;
        if self.layout_dirty {
            self.write_trailing_footer()?;
            self.write_bat()?;
            self.layout_dirty = false;
        }
        self.dev.sync()
    }

    fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        if !self.read_only {
            self.sync()?;
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
                len: end - start,
                virtual_size: self.virtual_size,
            });
        }

        let bs = self.block_size as u64;
        let mut pos = start;
        while pos < end {
            let block = pos / bs;
            let block_end = (block + 1) * bs;
            let upto = end.min(block_end);
            self.trim_block(block, pos, upto)?;
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

        // Prefer the client-shipped bitmap; fall back to parsing NTFS out of
        // the image itself.
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
        let ss = SECTOR_SIZE as u64;
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
                let mut pos = start;
                while pos < end {
                    if !self.this_has_sector(pos)? && self.has_sector(pos)? {
                        self.read_at(pos, &mut sector_buf)?;
                        self.write_at(pos, &sector_buf)?;
                        sink.wrote_sector(pos, &sector_buf)?;
                    }
                    pos += ss;
                }
            } else {
                let start = fs_block_idx as u64 * fs_block;
                let end = (start + self.block_size as u64).min(n_fs_blocks as u64 * fs_block);
                sink.empty_block(start, end)?;
            }

            fs_block_idx = group_end;
        }

        // Detach the parent and rewrite the layout as a plain dynamic disk.
        self.parent = None;
        self.footer.disk_type = DISK_TYPE_DYNAMIC;
        self.header.parent_uid = [0u8; 16];
        self.header.parent_timestamp = 0;
        self.header.parent_unicode_name = Vec::new();
        self.header.parent_locators = [ParentLocator::default(); 8];

        info!("writing non-differencing headers after make_full");
        let footer_raw = self.footer.serialize();
        self.dev.write_all_at(0, &footer_raw)?;
        let header_raw = self.header.serialize();
        self.dev
            .write_all_at(self.dynamic_header_offset, &header_raw)?;
        self.write_bat()?;
        self.write_trailing_footer()?;
        self.layout_dirty = false;
        Ok(())
    }
}

impl Drop for VhdFile {
    fn drop(&mut self) {
        if !self.finished && !self.read_only {
            if let Err(e) = self.finish() {
                warn!("container finish on drop failed: {e}");
            }
        }
    }
}
