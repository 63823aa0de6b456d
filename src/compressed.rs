//! Transparently compressed backing file.
//!
//! Sits *below* the container engine: the engine sees an ordinary
//! [`BlockDevice`] while the bytes on disk are zstd-compressed blocks.
//!
//! # On-disk layout (all numeric fields little-endian)
//!
//! ```text
//! [ 4096 B header ]
//!   0..24   magic          = "URBACKUP COMPRESSED FILE"
//!   24..28  version        = 1 (u32)
//!   28..32  block_size     (u32, default 512 KiB)
//!   32..40  uncompressed_size (u64)
//!   40..48  index_offset   (u64; 0 until finish())
//!   48..52  header CRC-32C over bytes 0..48 (u32)
//! [ compressed blocks, append-only ]
//! [ block index: per block { data_offset u64, comp_len u32 },
//!   then CRC-32C over all index bytes ]
//! ```
//!
//! Rewriting a block appends a fresh copy and repoints its index entry; the
//! stale copy stays as dead space.  The index lives only in memory until
//! [`CompressedFile::finish`], which writes it, patches the header and
//! syncs — writers must call it before drop or the file will not reopen.

use log::warn;

use crate::device::BlockDevice;
use crate::error::{Error, Result};
use crate::vhdx::layout::crc32c;

pub const COMPRESSED_MAGIC: &[u8; 24] = b"URBACKUP COMPRESSED FILE";
const HEADER_SIZE: u64 = 4096;
const VERSION: u32 = 1;
const DEFAULT_BLOCK_SIZE: u32 = 512 * 1024;
const ZSTD_LEVEL: i32 = 3;

/// Index sentinel: block has never been written (reads as zeros).
const BLOCK_UNSET: u64 = u64::MAX;

/// Probe a device for the compressed-file magic.
pub fn is_compressed(dev: &mut dyn BlockDevice) -> Result<bool> {
    let mut magic = [0u8; 24];
    match dev.read_at(0, &mut magic) {
        Ok(24) => Ok(&magic == COMPRESSED_MAGIC),
        Ok(_) => Ok(false),
        Err(e) => Err(e),
    }
}

struct IndexEntry {
    data_offset: u64,
    comp_len: u32,
}

pub struct CompressedFile {
    inner: Box<dyn BlockDevice>,
    block_size: u32,
    uncompressed_size: u64,
    /// block number → on-disk location; `BLOCK_UNSET` offset = never written.
    index: Vec<IndexEntry>,
    next_data_pos: u64,
    read_only: bool,
    finished: bool,

    // Single-block cache, write-back.
    cached_block: Option<u64>,
    cache: Vec<u8>,
    cache_dirty: bool,
}

impl CompressedFile {
    /// Wrap a fresh (empty) device for writing.
    pub fn create(inner: Box<dyn BlockDevice>) -> Result<Self> {
        Self::create_with_block_size(inner, DEFAULT_BLOCK_SIZE)
    }

    pub fn create_with_block_size(mut inner: Box<dyn BlockDevice>, block_size: u32) -> Result<Self> {
        assert!(block_size.is_power_of_two() && block_size >= 4096);
        let header = Self::build_header(block_size, 0, 0);
        inner.write_all_at(0, &header)?;
        Ok(Self {
            inner,
            block_size,
            uncompressed_size: 0,
            index: Vec::new(),
            next_data_pos: HEADER_SIZE,
            read_only: false,
            finished: false,
            cached_block: None,
            cache: vec![0u8; block_size as usize],
            cache_dirty: false,
        })
    }

    /// Open an existing compressed file.
    pub fn open(mut inner: Box<dyn BlockDevice>, read_only: bool) -> Result<Self> {
        let mut header = [0u8; 52];
        inner.read_exact_at(0, &mut header)?;

        if &header[0..24] != COMPRESSED_MAGIC {
            return Err(Error::corrupt("compressed file magic wrong"));
        }
        let stored_crc = u32::from_le_bytes(header[48..52].try_into().unwrap());
        if crc32c(&header[..48]) != stored_crc {
            return Err(Error::corrupt("compressed file header checksum wrong"));
        }
        let version = u32::from_le_bytes(header[24..28].try_into().unwrap());
        if version != VERSION {
            return Err(Error::corrupt(format!(
                "compressed file version not supported: {version}"
            )));
        }

        let block_size = u32::from_le_bytes(header[28..32].try_into().unwrap());
        let uncompressed_size = u64::from_le_bytes(header[32..40].try_into().unwrap());
        let index_offset = u64::from_le_bytes(header[40..48].try_into().unwrap());
        if block_size < 4096 || !block_size.is_power_of_two() {
            return Err(Error::corrupt("compressed file block size invalid"));
        }
        if index_offset == 0 {
            return Err(Error::corrupt(
                "compressed file was not finished (no block index)",
            ));
        }

        let block_count = uncompressed_size.div_ceil(block_size as u64) as usize;
        let mut index_buf = vec![0u8; block_count * 12 + 4];
        inner.read_exact_at(index_offset, &mut index_buf)?;

        let idx_crc = u32::from_le_bytes(index_buf[block_count * 12..].try_into().unwrap());
        if crc32c(&index_buf[..block_count * 12]) != idx_crc {
            return Err(Error::corrupt("compressed file index checksum wrong"));
        }

        let mut index = Vec::with_capacity(block_count);
        for chunk in index_buf[..block_count * 12].chunks_exact(12) {
            index.push(IndexEntry {
                data_offset: u64::from_le_bytes(chunk[0..8].try_into().unwrap()),
                comp_len: u32::from_le_bytes(chunk[8..12].try_into().unwrap()),
            });
        }

        Ok(Self {
            inner,
            block_size,
            uncompressed_size,
            index,
            next_data_pos: index_offset,
            read_only,
            finished: read_only,
            cached_block: None,
            cache: vec![0u8; block_size as usize],
            cache_dirty: false,
        })
    }

    fn build_header(block_size: u32, uncompressed_size: u64, index_offset: u64) -> Vec<u8> {
        let mut header = vec![0u8; HEADER_SIZE as usize];
        header[0..24].copy_from_slice(COMPRESSED_MAGIC);
        header[24..28].copy_from_slice(&VERSION.to_le_bytes());
        header[28..32].copy_from_slice(&block_size.to_le_bytes());
        header[32..40].copy_from_slice(&uncompressed_size.to_le_bytes());
        header[40..48].copy_from_slice(&index_offset.to_le_bytes());
        let crc = crc32c(&header[..48]);
        header[48..52].copy_from_slice(&crc.to_le_bytes());
        header
    }

    fn load_block(&mut self, block: u64) -> Result<()> {
        if self.cached_block == Some(block) {
            return Ok(());
        }
        self.flush_cache()?;

        let entry = self.index.get(block as usize);
        match entry {
            Some(e) if e.data_offset != BLOCK_UNSET => {
                let mut comp = vec![0u8; e.comp_len as usize];
                let offset = e.data_offset;
                self.inner.read_exact_at(offset, &mut comp)?;
                let raw = zstd::bulk::decompress(&comp, self.block_size as usize)
                    .map_err(|e| Error::io("decompress block", e))?;
                if raw.len() != self.block_size as usize {
                    return Err(Error::corrupt(format!(
                        "compressed block {block} inflated to {} bytes, expected {}",
                        raw.len(),
                        self.block_size
                    )));
                }
                self.cache.copy_from_slice(&raw);
            }
            _ => self.cache.fill(0),
        }
        self.cached_block = Some(block);
        Ok(())
    }

    fn flush_cache(&mut self) -> Result<()> {
        let Some(block) = self.cached_block else {
            return Ok(());
        };
        if !self.cache_dirty {
            return Ok(());
        }

        let comp = zstd::bulk::compress(&self.cache, ZSTD_LEVEL)
            .map_err(|e| Error::io("compress block", e))?;
        let data_offset = self.next_data_pos;
        self.inner.write_all_at(data_offset, &comp)?;
        self.next_data_pos += comp.len() as u64;

        let idx = block as usize;
        if idx >= self.index.len() {
            self.index.resize_with(idx + 1, || IndexEntry {
                data_offset: BLOCK_UNSET,
                comp_len: 0,
            });
        }
        self.index[idx] = IndexEntry {
            data_offset,
            comp_len: comp.len() as u32,
        };
        self.cache_dirty = false;
        Ok(())
    }

    /// Flush buffers, write the block index, patch the header and sync.
    /// Required before drop when writing.
    pub fn finish(&mut self) -> Result<()> {
        if self.finished || self.read_only {
            return Ok(());
        }
        self.flush_cache()?;

        let block_count = self.uncompressed_size.div_ceil(self.block_size as u64) as usize;
        if self.index.len() < block_count {
            self.index.resize_with(block_count, || IndexEntry {
                data_offset: BLOCK_UNSET,
                comp_len: 0,
            });
        }

        let index_offset = self.next_data_pos;
        let mut index_buf = Vec::with_capacity(block_count * 12 + 4);
        for e in self.index.iter().take(block_count) {
            index_buf.extend_from_slice(&e.data_offset.to_le_bytes());
            index_buf.extend_from_slice(&e.comp_len.to_le_bytes());
        }
        let idx_crc = crc32c(&index_buf);
        index_buf.extend_from_slice(&idx_crc.to_le_bytes());
        self.inner.write_all_at(index_offset, &index_buf)?;

        let header = Self::build_header(self.block_size, self.uncompressed_size, index_offset);
        self.inner.write_all_at(0, &header)?;
        self.inner.sync()?;
        self.finished = true;
        Ok(())
    }
}

impl Drop for CompressedFile {
    fn drop(&mut self) {
        if !self.finished && !self.read_only {
            warn!("compressed file dropped without finish(); data will not reopen");
        }
    }
}

impl BlockDevice for CompressedFile {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if offset >= self.uncompressed_size {
            return Ok(0);
        }
        let len = buf.len().min((self.uncompressed_size - offset) as usize);

        let mut done = 0usize;
        while done < len {
            let pos = offset + done as u64;
            let block = pos / self.block_size as u64;
            let within = (pos % self.block_size as u64) as usize;
            let n = (self.block_size as usize - within).min(len - done);

            self.load_block(block)?;
            buf[done..done + n].copy_from_slice(&self.cache[within..within + n]);
            done += n;
        }
        Ok(done)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<usize> {
        if self.read_only {
            return Err(Error::ReadOnly("compressed file opened read-only"));
        }

        let mut done = 0usize;
        while done < buf.len() {
            let pos = offset + done as u64;
            let block = pos / self.block_size as u64;
            let within = (pos % self.block_size as u64) as usize;
            let n = (self.block_size as usize - within).min(buf.len() - done);

            self.load_block(block)?;
            self.cache[within..within + n].copy_from_slice(&buf[done..done + n]);
            self.cache_dirty = true;
            done += n;
        }

        let end = offset + buf.len() as u64;
        if end > self.uncompressed_size {
            self.uncompressed_size = end;
        }
        Ok(done)
    }

    fn size(&mut self) -> Result<u64> {
        Ok(self.uncompressed_size)
    }

    fn resize(&mut self, new_size: u64, _keep_contents: bool) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly("compressed file opened read-only"));
        }
        if new_size < self.uncompressed_size {
            let keep_blocks = new_size.div_ceil(self.block_size as u64) as usize;
            self.index.truncate(keep_blocks);
            if let Some(b) = self.cached_block {
                if b as usize >= keep_blocks {
                    self.cached_block = None;
                    self.cache_dirty = false;
                }
            }
        }
        self.uncompressed_size = new_size;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.flush_cache()?;
        self.inner.sync()
    }

    fn finish(&mut self) -> Result<()> {
        CompressedFile::finish(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::FileDevice;
    use tempfile::tempdir;

    fn device(path: &std::path::Path) -> Box<dyn BlockDevice> {
        Box::new(FileDevice::create(path).unwrap())
    }

    #[test]
    fn roundtrip_through_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.z");

        {
            let mut cf = CompressedFile::create(device(&path)).unwrap();
            cf.write_all_at(0, b"hello").unwrap();
            cf.write_all_at(700_000, &[0xAA; 1000]).unwrap();
            cf.finish().unwrap();
        }

        let mut raw = FileDevice::open(&path, true).unwrap();
        assert!(is_compressed(&mut raw).unwrap());

        let mut cf = CompressedFile::open(Box::new(raw), true).unwrap();
        assert_eq!(cf.size().unwrap(), 701_000);
        let mut buf = [0u8; 5];
        cf.read_exact_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        let mut buf = [0u8; 1000];
        cf.read_exact_at(700_000, &mut buf).unwrap();
        assert_eq!(buf, [0xAA; 1000]);
        // Never-written gap reads as zeros.
        let mut buf = [7u8; 16];
        cf.read_exact_at(600_000, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 16]);
    }

    #[test]
    fn unfinished_file_does_not_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.z");
        {
            let mut cf = CompressedFile::create(device(&path)).unwrap();
            cf.write_all_at(0, b"data").unwrap();
            cf.finished = true; // suppress the drop warning; simulate a crash
        }
        let raw = FileDevice::open(&path, true).unwrap();
        assert!(CompressedFile::open(Box::new(raw), true).is_err());
    }
}
