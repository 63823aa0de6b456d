//! Client-supplied used-block bitmap file.
//!
//! # On-disk layout
//!
//! ```text
//! Offset  Size  Field
//!    0      8   magic        = "UrBBMM8C"
//!    8      4   block_size   (LE u32)
//!   12      N   bitmap bytes (LSB first within each byte)
//! 12+N     32   SHA-256 over block_size bytes ‖ bitmap bytes
//! ```
//!
//! The digest covers the raw on-disk `block_size` field and the bitmap, in
//! that order, and is verified on open; a mismatch rejects the file.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::bitmap::{BitmapView, LsbFirst};
use crate::error::{Error, Result};
use crate::fs::FilesystemSource;

pub const CLIENT_BITMAP_MAGIC: &[u8; 8] = b"UrBBMM8C";
const SHA_SIZE: usize = 32;

pub struct ClientBitmap {
    block_size: u32,
    bits: Vec<u8>,
}

impl ClientBitmap {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file =
            File::open(path.as_ref()).map_err(|e| Error::io("open client bitmap", e))?;
        let mut raw = Vec::new();
        file.read_to_end(&mut raw)
            .map_err(|e| Error::io("read client bitmap", e))?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() < 8 + 4 + SHA_SIZE {
            return Err(Error::corrupt("client bitmap file too small"));
        }
        if &raw[0..8] != CLIENT_BITMAP_MAGIC {
            return Err(Error::corrupt("client bitmap magic wrong"));
        }

        let block_size = u32::from_le_bytes(raw[8..12].try_into().unwrap());
        let bits_end = raw.len() - SHA_SIZE;
        let bits = raw[12..bits_end].to_vec();

        let mut hasher = Sha256::new();
        hasher.update(&raw[8..12]);
        hasher.update(&bits);
        let digest = hasher.finalize();

        if digest.as_slice() != &raw[bits_end..] {
            return Err(Error::corrupt("client bitmap checksum wrong"));
        }

        if block_size == 0 {
            return Err(Error::corrupt("client bitmap block size is zero"));
        }

        Ok(Self { block_size, bits })
    }

    /// Serialize a bitmap into the on-disk form, digest included.  Used by
    /// the backup session to persist the received bitmap, and by tests.
    pub fn serialize(block_size: u32, bits: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + 4 + bits.len() + SHA_SIZE);
        out.extend_from_slice(CLIENT_BITMAP_MAGIC);
        out.extend_from_slice(&block_size.to_le_bytes());
        out.extend_from_slice(bits);
        let mut hasher = Sha256::new();
        hasher.update(block_size.to_le_bytes());
        hasher.update(bits);
        out.extend_from_slice(&hasher.finalize());
        out
    }

    pub fn bitmap_bytes(&self) -> &[u8] {
        &self.bits
    }
}

impl FilesystemSource for ClientBitmap {
    fn block_size(&self) -> u64 {
        self.block_size as u64
    }

    fn volume_size(&self) -> u64 {
        self.bits.len() as u64 * 8 * self.block_size as u64
    }

    fn has_block(&self, index: i64) -> bool {
        if index < 0 {
            return true;
        }
        let view = BitmapView::<LsbFirst>::new(&self.bits);
        if index as u64 >= view.bit_capacity() {
            // Past the shipped bitmap: claim used rather than drop data.
            return true;
        }
        view.get(index as u64)
    }
}
