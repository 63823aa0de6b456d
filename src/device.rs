//! Random-access byte stores backing the container engine.
//!
//! Everything the engine touches on disk goes through [`BlockDevice`]: a
//! plain host file ([`FileDevice`]), a transparently compressed file
//! (`CompressedFile`), or — for the filesystem readers — a window into an
//! open container ([`VolumeView`]).
//!
//! Writes past `size()` grow the device.  `resize(_, false)` may leave
//! trailing bytes undefined; reads of never-written ranges on a grown
//! `FileDevice` return zeros (sparse file semantics on every supported OS).

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use crate::container::ImageContainer;
use crate::error::{Error, Result};

// ── BlockDevice ──────────────────────────────────────────────────────────────

/// Abstract random-access byte store with explicit durability.
pub trait BlockDevice: Send {
    /// Read up to `buf.len()` bytes at `offset`.  Returns bytes read; 0 means
    /// end of device.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Write `buf` at `offset`, growing the device if needed.  Returns bytes
    /// written.
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<usize>;

    fn size(&mut self) -> Result<u64>;

    /// Grow or shrink to `new_size`.  With `keep_contents == false` trailing
    /// bytes are undefined.
    fn resize(&mut self, new_size: u64, keep_contents: bool) -> Result<()>;

    /// Make all previous writes durable.
    fn sync(&mut self) -> Result<()>;

    /// Commit any wrapper metadata and flush.  Devices with internal
    /// buffering (the compressed file) must be finished before drop when
    /// written; for plain devices this is `sync`.
    fn finish(&mut self) -> Result<()> {
        self.sync()
    }

    /// Read exactly `buf.len()` bytes or fail.
    fn read_exact_at(&mut self, mut offset: u64, mut buf: &mut [u8]) -> Result<()> {
        while !buf.is_empty() {
            match self.read_at(offset, buf)? {
                0 => {
                    return Err(Error::corrupt(format!(
                        "unexpected end of device at offset {offset}"
                    )))
                }
                n => {
                    buf = &mut buf[n..];
                    offset += n as u64;
                }
            }
        }
        Ok(())
    }

    /// Write all of `buf` or fail.
    fn write_all_at(&mut self, mut offset: u64, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            match self.write_at(offset, buf)? {
                0 => {
                    return Err(Error::io(
                        "write returned zero",
                        io::Error::new(io::ErrorKind::WriteZero, "device refused write"),
                    ))
                }
                n => {
                    buf = &buf[n..];
                    offset += n as u64;
                }
            }
        }
        Ok(())
    }
}

/// Zero-fill `len` bytes at `offset` in 64 KiB chunks.
pub fn write_zeroes(dev: &mut dyn BlockDevice, mut offset: u64, mut len: u64) -> Result<()> {
    const CHUNK: usize = 64 * 1024;
    let buf = [0u8; CHUNK];
    while len > 0 {
        let n = (len as usize).min(CHUNK);
        dev.write_all_at(offset, &buf[..n])?;
        offset += n as u64;
        len -= n as u64;
    }
    Ok(())
}

// ── FileDevice ───────────────────────────────────────────────────────────────

/// A host file with positioned I/O.  The only direct syscall surface of the
/// engine.
pub struct FileDevice {
    file: File,
    path: PathBuf,
}

impl FileDevice {
    pub fn open<P: AsRef<Path>>(path: P, read_only: bool) -> Result<Self> {
        let path = path.as_ref().to_owned();
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(&path)
            .map_err(|e| Error::io("open device file", e))?;
        Ok(Self { file, path })
    }

    /// Open read-write, creating the file if it does not exist.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_owned();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .map_err(|e| Error::io("create device file", e))?;
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    #[cfg(unix)]
    fn raw_read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        use std::os::unix::fs::FileExt;
        self.file.read_at(buf, offset)
    }

    #[cfg(unix)]
    fn raw_write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<usize> {
        use std::os::unix::fs::FileExt;
        self.file.write_at(buf, offset)
    }

    #[cfg(windows)]
    fn raw_read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        use std::os::windows::fs::FileExt;
        self.file.seek_read(buf, offset)
    }

    #[cfg(windows)]
    fn raw_write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<usize> {
        use std::os::windows::fs::FileExt;
        self.file.seek_write(buf, offset)
    }
}

impl BlockDevice for FileDevice {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.raw_read_at(offset, buf)
            .map_err(|e| Error::io("read from device file", e))
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<usize> {
        self.raw_write_at(offset, buf)
            .map_err(|e| Error::io("write to device file", e))
    }

    fn size(&mut self) -> Result<u64> {
        Ok(self
            .file
            .metadata()
            .map_err(|e| Error::io("stat device file", e))?
            .len())
    }

    fn resize(&mut self, new_size: u64, _keep_contents: bool) -> Result<()> {
        self.file
            .set_len(new_size)
            .map_err(|e| Error::io("resize device file", e))
    }

    fn sync(&mut self) -> Result<()> {
        self.file
            .sync_data()
            .map_err(|e| Error::io("sync device file", e))
    }
}

// ── VolumeView ───────────────────────────────────────────────────────────────

/// Read-only window into an open container at a fixed byte offset.
///
/// The filesystem readers parse the payload volume through this view, so the
/// partition base (typically right after the MBR) maps to view offset 0.
pub struct VolumeView<'a> {
    inner: &'a mut dyn ImageContainer,
    base: u64,
}

impl<'a> VolumeView<'a> {
    pub fn new(inner: &'a mut dyn ImageContainer, base: u64) -> Self {
        Self { inner, base }
    }

    pub fn size(&self) -> u64 {
        self.inner.virtual_size().saturating_sub(self.base)
    }

    pub fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut done = 0usize;
        while done < buf.len() {
            let n = self
                .inner
                .read_at(self.base + offset + done as u64, &mut buf[done..])?;
            if n == 0 {
                return Err(Error::corrupt(format!(
                    "unexpected end of volume at offset {}",
                    offset + done as u64
                )));
            }
            done += n;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn file_device_grows_on_write_and_reads_sparse_zeros() {
        let dir = tempdir().unwrap();
        let mut dev = FileDevice::create(&dir.path().join("d.bin")).unwrap();

        dev.write_all_at(100_000, b"far out").unwrap();
        assert_eq!(dev.size().unwrap(), 100_007);

        let mut gap = [0xAAu8; 32];
        dev.read_exact_at(50_000, &mut gap).unwrap();
        assert_eq!(gap, [0u8; 32]);

        let mut tail = [0u8; 7];
        dev.read_exact_at(100_000, &mut tail).unwrap();
        assert_eq!(&tail, b"far out");

        dev.resize(64, false).unwrap();
        assert_eq!(dev.size().unwrap(), 64);
        assert_eq!(dev.read_at(100, &mut [0u8; 4]).unwrap(), 0);
    }

    #[test]
    fn zero_fill_helper_covers_uneven_lengths() {
        let dir = tempdir().unwrap();
        let mut dev = FileDevice::create(&dir.path().join("z.bin")).unwrap();
        dev.write_all_at(0, &[0xFFu8; 200_000]).unwrap();

        write_zeroes(&mut dev, 1_000, 150_123).unwrap();

        let mut buf = vec![0xEEu8; 200_000];
        dev.read_exact_at(0, &mut buf).unwrap();
        assert!(buf[..1_000].iter().all(|&b| b == 0xFF));
        assert!(buf[1_000..151_123].iter().all(|&b| b == 0));
        assert!(buf[151_123..].iter().all(|&b| b == 0xFF));
    }
}
