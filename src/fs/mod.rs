//! Filesystem-aware used-block sources.
//!
//! Incremental image backup only needs one question answered: which clusters
//! of the payload volume hold data?  Three sources can answer it:
//!
//! - [`ntfs::FsNtfs`] parses the volume's own NTFS structures and returns
//!   the exact `$Bitmap`.
//! - [`client_bitmap::ClientBitmap`] trusts a bitmap file the client
//!   computed and shipped alongside the image.
//! - [`FsUnknown`] knows nothing and claims every block is used.
//!
//! `has_block` returning true may be conservative (over-approximate);
//! returning false is authoritative — the engine will drop that range.

pub mod client_bitmap;
pub mod ntfs;

use log::warn;

pub use client_bitmap::ClientBitmap;
pub use ntfs::FsNtfs;

/// Used-cluster oracle for one volume.
pub trait FilesystemSource {
    /// Allocation unit the bitmap is expressed in, in bytes.
    fn block_size(&self) -> u64;

    /// Total payload volume size in bytes.
    fn volume_size(&self) -> u64;

    /// Whether block `index` holds data.  True may over-approximate.
    fn has_block(&self, index: i64) -> bool;
}

/// Fallback source for unrecognised filesystems: every block is used.
pub struct FsUnknown {
    volume_size: u64,
    sector_size: u64,
}

impl FsUnknown {
    /// `sector_size` defaults to the host's logical sector size (512).
    pub fn new(volume_size: u64) -> Self {
        Self {
            volume_size,
            sector_size: 512,
        }
    }

    pub fn with_sector_size(volume_size: u64, sector_size: u64) -> Self {
        Self {
            volume_size,
            sector_size,
        }
    }
}

impl FilesystemSource for FsUnknown {
    fn block_size(&self) -> u64 {
        self.sector_size
    }

    fn volume_size(&self) -> u64 {
        self.volume_size
    }

    fn has_block(&self, _index: i64) -> bool {
        true
    }
}

/// Identify the payload volume's filesystem and return its used-block
/// source.  Only NTFS is parsed; anything else degrades to the
/// conservative all-ones source.
pub fn detect<V: ntfs::ReadVolume>(vol: &mut V) -> Box<dyn FilesystemSource> {
    let size = vol.size();
    match FsNtfs::parse(vol) {
        Ok(fs) => Box::new(fs),
        Err(e) => {
            warn!("filesystem not recognised ({e}); treating every block as used");
            Box::new(FsUnknown::new(size))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_falls_back_to_unknown() {
        let not_ntfs = vec![0u8; 4096];
        let src = detect(&mut not_ntfs.as_slice());
        assert_eq!(src.block_size(), 512);
        assert_eq!(src.volume_size(), 4096);
        assert!(src.has_block(3));
    }
}
