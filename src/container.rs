//! Shared surface of the container formats.
//!
//! The backup session, the filesystem readers and the mount server all drive
//! a container through [`ImageContainer`]; which of the three on-disk
//! formats backs it is decided once, at open/create time, from the file
//! extension.

use std::path::Path;

use crate::error::{Error, Result};
use crate::progress::CancelToken;

/// A sparse virtual volume: read/write in payload byte space, plus the
/// maintenance operations the backup pipeline needs.
pub trait ImageContainer: Send {
    /// Read up to `buf.len()` bytes of the virtual volume at `pos`.  Reads
    /// past `virtual_size` are clamped; a short return at the end is normal.
    fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> Result<usize>;

    /// Write `buf` at `pos`.  Writes past `virtual_size` fail with
    /// [`Error::OutOfRange`].
    fn write_at(&mut self, pos: u64, buf: &[u8]) -> Result<usize>;

    fn virtual_size(&self) -> u64;

    fn block_size(&self) -> u32;

    /// True if `pos` resolves to stored data anywhere along the parent chain.
    fn has_sector(&mut self, pos: u64) -> Result<bool>;

    /// True if `pos` is authoritative in *this* container, ignoring parents.
    fn this_has_sector(&mut self, pos: u64) -> Result<bool>;

    /// Bytes of allocated payload (block granularity).
    fn used_size(&mut self) -> Result<u64>;

    /// Flush caches and make previous writes recoverable.
    fn sync(&mut self) -> Result<()>;

    /// Full durability: everything flushed, journal retired, headers final.
    /// Must be called before dropping a written container.
    fn finish(&mut self) -> Result<()>;

    /// Mark `[start, end)` as unused: subsequent reads fall through to the
    /// parent, or return zeros where no parent exists.
    fn trim(&mut self, start: u64, end: u64) -> Result<()>;

    /// Materialise every filesystem-used sector of the payload volume at
    /// `fs_offset` into this container, then detach the parent link.
    ///
    /// The used-cluster source is the sibling `.cbitmap` file when present,
    /// otherwise the volume's own NTFS bitmap.  `sink` observes each copied
    /// sector and each skipped (free) block range; `cancel` is polled between
    /// blocks.
    fn make_full(
        &mut self,
        fs_offset: u64,
        sink: &mut dyn MakeFullSink,
        cancel: &CancelToken,
    ) -> Result<()>;
}

/// Observer for [`ImageContainer::make_full`].
pub trait MakeFullSink {
    /// A sector was copied from the parent chain into this container.
    fn wrote_sector(&mut self, pos: u64, data: &[u8]) -> Result<()>;

    /// `[start, end)` of the payload volume is free space and was skipped.
    fn empty_block(&mut self, start: u64, end: u64) -> Result<()>;
}

/// Sink that discards all notifications.
pub struct NullSink;

impl MakeFullSink for NullSink {
    fn wrote_sector(&mut self, _pos: u64, _data: &[u8]) -> Result<()> {
        Ok(())
    }
    fn empty_block(&mut self, _start: u64, _end: u64) -> Result<()> {
        Ok(())
    }
}

// ── Format dispatch ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Vhd,
    Vhdx,
    /// Raw sparse file + sidecar bitmap; copy-on-write happens at the
    /// filesystem layer (reflink/snapshot), not in the format.
    RawCow,
}

impl ImageFormat {
    /// Decide the format from the file name.  `.vhdz` / `.vhdxz` are the
    /// compressed spellings; `.raw` is the copy-on-write raw file.
    pub fn from_path(path: &Path) -> Option<ImageFormat> {
        let name = path.file_name()?.to_str()?;
        let name = name.strip_suffix(".tmp").unwrap_or(name);
        if name.ends_with(".vhdx") || name.ends_with(".vhdxz") {
            Some(ImageFormat::Vhdx)
        } else if name.ends_with(".vhd") || name.ends_with(".vhdz") {
            Some(ImageFormat::Vhd)
        } else if name.ends_with(".raw") {
            Some(ImageFormat::RawCow)
        } else {
            None
        }
    }

    /// True when the spelling implies the compressed wrapper.
    pub fn compressed_by_name(path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        let name = name.strip_suffix(".tmp").unwrap_or(name);
        name.ends_with(".vhdz") || name.ends_with(".vhdxz")
    }
}

/// Creation parameters shared by the container formats.  The raw
/// copy-on-write format only honours `virtual_size`: its block size is
/// fixed and it is never compressed.
#[derive(Debug, Clone)]
pub struct CreateParams {
    pub virtual_size: u64,
    pub block_size: u32,
    /// Defer bitmap/BAT writeback until block switch or finish.
    pub fast_mode: bool,
    /// Wrap the backing file in the compressed device.
    pub compress: bool,
}

impl Default for CreateParams {
    fn default() -> Self {
        Self {
            virtual_size: 0,
            block_size: 2 * 1024 * 1024,
            fast_mode: false,
            compress: false,
        }
    }
}

/// Open an existing container read-only or read-write.
pub fn open(path: &Path, read_only: bool) -> Result<Box<dyn ImageContainer>> {
    match ImageFormat::from_path(path) {
        Some(ImageFormat::Vhd) => Ok(Box::new(crate::vhd::VhdFile::open(path, read_only)?)),
        Some(ImageFormat::Vhdx) => Ok(Box::new(crate::vhdx::VhdxFile::open(path, read_only)?)),
        Some(ImageFormat::RawCow) => Ok(Box::new(crate::cow::RawCowFile::open(path, read_only)?)),
        None => Err(Error::corrupt(format!(
            "unrecognised container extension: {}",
            path.display()
        ))),
    }
}

/// Create a fresh container without a parent.
pub fn create(path: &Path, params: &CreateParams) -> Result<Box<dyn ImageContainer>> {
    match ImageFormat::from_path(path) {
        Some(ImageFormat::Vhd) => Ok(Box::new(crate::vhd::VhdFile::create(path, params)?)),
        Some(ImageFormat::Vhdx) => Ok(Box::new(crate::vhdx::VhdxFile::create(path, params)?)),
        Some(ImageFormat::RawCow) => Ok(Box::new(crate::cow::RawCowFile::create(
            path,
            params.virtual_size,
        )?)),
        None => Err(Error::corrupt(format!(
            "unrecognised container extension: {}",
            path.display()
        ))),
    }
}

/// Create a differencing child of `parent_path`.
pub fn create_diff(
    path: &Path,
    parent_path: &Path,
    params: &CreateParams,
) -> Result<Box<dyn ImageContainer>> {
    match ImageFormat::from_path(path) {
        Some(ImageFormat::Vhd) => Ok(Box::new(crate::vhd::VhdFile::create_diff(
            path,
            parent_path,
            params,
        )?)),
        Some(ImageFormat::Vhdx) => Ok(Box::new(crate::vhdx::VhdxFile::create_diff(
            path,
            parent_path,
            params,
        )?)),
        Some(ImageFormat::RawCow) => Ok(Box::new(crate::cow::RawCowFile::create_diff(
            path,
            parent_path,
        )?)),
        None => Err(Error::corrupt(format!(
            "unrecognised container extension: {}",
            path.display()
        ))),
    }
}
