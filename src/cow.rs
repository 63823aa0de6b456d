//! ContainerV3 — raw copy-on-write container.
//!
//! The simplest of the three formats: the payload is a plain sparse file of
//! exactly `virtual_size` bytes, and presence is tracked in a sidecar
//! `<image>.bitmap` file — an MSB-first bit per 4 KiB block, no header, no
//! checksum.  There is no in-file metadata at all; reads are plain reads
//! (never-written ranges are sparse zeros) and writes mark their blocks in
//! the bitmap.
//!
//! Differencing works at the filesystem layer, not in the format: the
//! snapshot collaborator clones the parent's raw file (reflink/snapshot)
//! before the child is opened, so [`RawCowFile::create_diff`] expects the
//! raw file to already exist and seeds the child's bitmap from the
//! parent's.  Consequently there is no parent chain at read time and
//! `make_full` has nothing to do — the clone is already full.
//!
//! Trimming clears the affected bitmap bits and writes explicit zeros over
//! the range (the documented fallback for hole punching).

use std::fs;
use std::path::{Path, PathBuf};

use log::warn;

use crate::bitmap::{BitmapView, BitmapViewMut, MsbFirst};
use crate::container::{ImageContainer, MakeFullSink};
use crate::device::{write_zeroes, BlockDevice, FileDevice};
use crate::error::{Error, Result};
use crate::progress::CancelToken;

/// Presence-tracking granularity of the sidecar bitmap.
pub const COW_BLOCK_SIZE: u32 = 4096;

fn bitmap_path(path: &Path) -> PathBuf {
    let mut p = path.as_os_str().to_owned();
    p.push(".bitmap");
    PathBuf::from(p)
}

fn bitmap_len_for(virtual_size: u64) -> usize {
    virtual_size
        .div_ceil(COW_BLOCK_SIZE as u64)
        .div_ceil(8) as usize
}

pub struct RawCowFile {
    dev: FileDevice,
    path: PathBuf,
    read_only: bool,
    virtual_size: u64,

    bitmap: Vec<u8>,
    bitmap_dirty: bool,
    finished: bool,
}

impl RawCowFile {
    /// Create a fresh raw container: the file is truncated to
    /// `virtual_size` (sparse) and the bitmap starts all-clear.
    pub fn create(path: &Path, virtual_size: u64) -> Result<Self> {
        let mut dev = FileDevice::create(path)?;
        dev.resize(virtual_size, false)?;

        Ok(Self {
            dev,
            path: path.to_owned(),
            read_only: false,
            virtual_size,
            bitmap: vec![0u8; bitmap_len_for(virtual_size)],
            bitmap_dirty: true,
            finished: false,
        })
    }

    /// Open the child of `parent_path`.  The raw file must already exist —
    /// the snapshot collaborator clones it from the parent before the
    /// backup starts — and the child inherits the parent's bitmap (its own
    /// sidecar takes precedence when a previous session left one).
    pub fn create_diff(path: &Path, parent_path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::corrupt(format!(
                "raw cow child \"{}\" does not exist; it must be snapshotted from the parent first",
                path.display()
            )));
        }

        let virtual_size = fs::metadata(parent_path)
            .map_err(|e| Error::io("stat raw cow parent", e))?
            .len();

        let own_bitmap = bitmap_path(path);
        let bitmap = if own_bitmap.exists() {
            Self::load_bitmap(&own_bitmap, virtual_size)?
        } else {
            Self::load_bitmap(&bitmap_path(parent_path), virtual_size)?
        };

        let mut dev = FileDevice::open(path, false)?;
        if dev.size()? != virtual_size {
            dev.resize(virtual_size, true)?;
        }

        Ok(Self {
            dev,
            path: path.to_owned(),
            read_only: false,
            virtual_size,
            bitmap,
            bitmap_dirty: true,
            finished: false,
        })
    }

    /// Open an existing raw container.  A read-only open requires the
    /// bitmap sidecar; a read-write open without one starts all-clear.
    pub fn open(path: &Path, read_only: bool) -> Result<Self> {
        let mut dev = FileDevice::open(path, read_only)?;
        let virtual_size = dev.size()?;

        let sidecar = bitmap_path(path);
        let bitmap = if sidecar.exists() {
            Self::load_bitmap(&sidecar, virtual_size)?
        } else if read_only {
            return Err(Error::corrupt(format!(
                "raw cow bitmap \"{}\" is missing",
                sidecar.display()
            )));
        } else {
            vec![0u8; bitmap_len_for(virtual_size)]
        };

        Ok(Self {
            dev,
            path: path.to_owned(),
            read_only,
            virtual_size,
            bitmap,
            bitmap_dirty: false,
            finished: read_only,
        })
    }

    fn load_bitmap(path: &Path, virtual_size: u64) -> Result<Vec<u8>> {
        let mut bitmap = fs::read(path).map_err(|e| Error::io("read raw cow bitmap", e))?;
        // A grown volume gets fresh all-clear tail bits.
        let needed = bitmap_len_for(virtual_size);
        if bitmap.len() < needed {
            bitmap.resize(needed, 0);
        }
        Ok(bitmap)
    }

    fn save_bitmap(&mut self) -> Result<()> {
        fs::write(bitmap_path(&self.path), &self.bitmap)
            .map_err(|e| Error::io("write raw cow bitmap", e))?;
        self.bitmap_dirty = false;
        Ok(())
    }

    /// Mark every block touched by `[start, end)`.
    fn set_block_range(&mut self, start: u64, end: u64, value: bool) {
        let bs = COW_BLOCK_SIZE as u64;
        let first = start / bs;
        let last = end.div_ceil(bs);
        BitmapViewMut::<MsbFirst>::new(&mut self.bitmap).set_range(first, last, value);
        self.bitmap_dirty = true;
    }

    fn block_is_set(&self, pos: u64) -> bool {
        BitmapView::<MsbFirst>::new(&self.bitmap).get(pos / COW_BLOCK_SIZE as u64)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

// ── ImageContainer ───────────────────────────────────────────────────────────

impl ImageContainer for RawCowFile {
    fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        if pos >= self.virtual_size {
            return Ok(0);
        }
        let len = buf.len().min((self.virtual_size - pos) as usize);
        self.dev.read_exact_at(pos, &mut buf[..len])?;
        Ok(len)
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

        self.dev.write_all_at(pos, buf)?;
        self.set_block_range(pos, pos + buf.len() as u64, true);
        Ok(buf.len())
    }

    fn virtual_size(&self) -> u64 {
        self.virtual_size
    }

    fn block_size(&self) -> u32 {
        COW_BLOCK_SIZE
    }

    fn has_sector(&mut self, pos: u64) -> Result<bool> {
        if pos >= self.virtual_size {
            return Ok(false);
        }
        Ok(self.block_is_set(pos))
    }

    fn this_has_sector(&mut self, pos: u64) -> Result<bool> {
        // The filesystem-level clone has no runtime parent: local presence
        // is all there is.
        self.has_sector(pos)
    }

    fn used_size(&mut self) -> Result<u64> {
        let set = BitmapView::<MsbFirst>::new(&self.bitmap).count_set();
        Ok(set * COW_BLOCK_SIZE as u64)
    }

    fn sync(&mut self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        if self.bitmap_dirty {
            self.save_bitmap()?;
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
        if start >= end {
            return Ok(());
        }

        // Explicit zero-writes instead of hole punching, then drop the
        // fully covered blocks from the bitmap.
        write_zeroes(&mut self.dev, start, end - start)?;

        let bs = COW_BLOCK_SIZE as u64;
        let first_full = start.div_ceil(bs);
        let last_full = end / bs;
        if first_full < last_full {
            BitmapViewMut::<MsbFirst>::new(&mut self.bitmap).set_range(
                first_full,
                last_full,
                false,
            );
            self.bitmap_dirty = true;
        }
        Ok(())
    }

    fn make_full(
        &mut self,
        _fs_offset: u64,
        _sink: &mut dyn MakeFullSink,
        _cancel: &CancelToken,
    ) -> Result<()> {
        // The snapshot clone already carries the full content; nothing to
        // materialise.
        if self.read_only {
            return Err(Error::ReadOnly("container opened read-only"));
        }
        Ok(())
    }
}

impl Drop for RawCowFile {
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
    use super::*;

    #[test]
    fn bitmap_sizing() {
        assert_eq!(bitmap_len_for(0), 0);
        assert_eq!(bitmap_len_for(4096), 1);
        assert_eq!(bitmap_len_for(8 * 4096), 1);
        assert_eq!(bitmap_len_for(9 * 4096), 2);
        assert_eq!(bitmap_len_for(4097), 1);
    }
}
