//! ContainerV1 on-disk structures — footer and dynamic header.
//!
//! # On-disk layout (all multi-byte fields big-endian)
//!
//! ```text
//! Footer (512 bytes, one copy at offset 0, one trailing):
//! Offset  Size  Field
//!    0      8   cookie            = "conectix"
//!    8      4   features          = 0x00000002
//!   12      4   format_version    = 0x00010000
//!   16      8   data_offset       → dynamic header
//!   24      4   timestamp         seconds since 2000-01-01 UTC
//!   28      4   creator_application = "vpc "
//!   32      4   creator_version   = 0x00050003
//!   36      4   creator_os        = "Wi2k"
//!   40      8   original_size
//!   48      8   current_size
//!   56      4   disk_geometry     CHS, encoded from size
//!   60      4   disk_type         3 = dynamic, 4 = differencing
//!   64      4   checksum
//!   68     16   uid
//!   84      1   saved_state
//!   85    427   reserved
//!
//! Dynamic header (1024 bytes at `data_offset`):
//!    0      8   cookie            = "cxsparse"
//!    8      8   data_offset       = 0xFFFFFFFFFFFFFFFF
//!   16      8   table_offset      → BAT
//!   24      4   header_version    = 0x00010000
//!   28      4   max_table_entries
//!   32      4   block_size
//!   36      4   checksum
//!   40     16   parent_uid
//!   56      4   parent_timestamp
//!   60      4   reserved
//!   64    512   parent unicode name (UTF-16BE, NUL terminated)
//!  576    192   8 × parent locator {code, space, length, reserved, offset:u64}
//!  768    256   reserved
//! ```
//!
//! # Checksums
//!
//! Both structures use the summed-byte checksum: zero the checksum field,
//! sum every byte into a u32, byte-swap, complement.  Interpreted as a
//! big-endian field on disk this is simply `!sum`.

use chrono::Utc;
use uuid::Uuid;

use crate::error::{Error, Result};

pub const FOOTER_COOKIE: &[u8; 8] = b"conectix";
pub const DYNAMIC_COOKIE: &[u8; 8] = b"cxsparse";
pub const FOOTER_SIZE: usize = 512;
pub const DYNAMIC_HEADER_SIZE: usize = 1024;

pub const DISK_TYPE_DYNAMIC: u32 = 3;
pub const DISK_TYPE_DIFFERENCING: u32 = 4;

pub const BAT_ENTRY_UNUSED: u32 = 0xFFFF_FFFF;

/// Parent locator platform codes.
pub const PLAT_CODE_W2KU: u32 = 0x5732_6B75; // absolute Windows path
pub const PLAT_CODE_W2RU: u32 = 0x5732_7275; // relative Windows path

/// Seconds between the Unix epoch and 2000-01-01 00:00:00 UTC.
const EPOCH_2000_OFFSET: i64 = 946_684_800;

/// Summed-byte checksum over `data` with `[checksum_at, checksum_at+4)`
/// treated as zero.
pub fn byte_sum_checksum(data: &[u8], checksum_at: usize) -> u32 {
    let mut sum: u32 = 0;
    for (i, b) in data.iter().enumerate() {
        if (checksum_at..checksum_at + 4).contains(&i) {
            continue;
        }
        sum = sum.wrapping_add(*b as u32);
    }
    !sum
}

/// CHS geometry per the published VHD algorithm; saturates at
/// 65535×16×255 sectors, silently truncating larger disks.
pub fn chs_geometry(disk_size: u64) -> u32 {
    let mut total_sectors = disk_size / 512;
    if total_sectors > 65535 * 16 * 255 {
        total_sectors = 65535 * 16 * 255;
    }

    let (cylinder_times_heads, heads, sectors_per_track);
    if total_sectors >= 65535 * 16 * 63 {
        sectors_per_track = 255u32;
        heads = 16u32;
        cylinder_times_heads = (total_sectors / sectors_per_track as u64) as u32;
    } else {
        let mut spt = 17u32;
        let mut cth = (total_sectors / spt as u64) as u32;
        let mut h = ((cth + 1023) / 1024).max(4);

        if cth >= h * 1024 || h > 16 {
            spt = 31;
            h = 16;
            cth = (total_sectors / spt as u64) as u32;
        }
        if cth >= h * 1024 {
            spt = 63;
            h = 16;
            cth = (total_sectors / spt as u64) as u32;
        }
        sectors_per_track = spt;
        heads = h;
        cylinder_times_heads = cth;
    }

    let cylinders = (cylinder_times_heads / heads) as u16;
    ((cylinders as u32) << 16) | (heads << 8) | sectors_per_track
}

/// Current time in the footer's epoch.
pub fn vhd_timestamp_now() -> u32 {
    (Utc::now().timestamp() - EPOCH_2000_OFFSET).max(0) as u32
}

// ── Footer ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct VhdFooter {
    pub data_offset: u64,
    pub timestamp: u32,
    pub original_size: u64,
    pub current_size: u64,
    pub disk_type: u32,
    pub uid: [u8; 16],
}

impl VhdFooter {
    pub fn new(virtual_size: u64, disk_type: u32, dynamic_header_offset: u64) -> Self {
        Self {
            data_offset: dynamic_header_offset,
            timestamp: vhd_timestamp_now(),
            original_size: virtual_size,
            current_size: virtual_size,
            disk_type,
            uid: *Uuid::new_v4().as_bytes(),
        }
    }

    pub fn serialize(&self) -> [u8; FOOTER_SIZE] {
        let mut buf = [0u8; FOOTER_SIZE];
        buf[0..8].copy_from_slice(FOOTER_COOKIE);
        buf[8..12].copy_from_slice(&0x0000_0002u32.to_be_bytes());
        buf[12..16].copy_from_slice(&0x0001_0000u32.to_be_bytes());
        buf[16..24].copy_from_slice(&self.data_offset.to_be_bytes());
        buf[24..28].copy_from_slice(&self.timestamp.to_be_bytes());
        buf[28..32].copy_from_slice(b"vpc ");
        buf[32..36].copy_from_slice(&0x0005_0003u32.to_be_bytes());
        buf[36..40].copy_from_slice(&0x5769_326Bu32.to_be_bytes()); // "Wi2k"
        buf[40..48].copy_from_slice(&self.original_size.to_be_bytes());
        buf[48..56].copy_from_slice(&self.current_size.to_be_bytes());
        buf[56..60].copy_from_slice(&chs_geometry(self.current_size).to_be_bytes());
        buf[60..64].copy_from_slice(&self.disk_type.to_be_bytes());
        buf[68..84].copy_from_slice(&self.uid);
        // saved_state and reserved stay zero.

        let checksum = byte_sum_checksum(&buf, 64);
        buf[64..68].copy_from_slice(&checksum.to_be_bytes());
        buf
    }

    pub fn parse(buf: &[u8; FOOTER_SIZE]) -> Result<Self> {
        if &buf[0..8] != FOOTER_COOKIE {
            return Err(Error::corrupt("footer cookie wrong"));
        }
        let stored = u32::from_be_bytes(buf[64..68].try_into().unwrap());
        if byte_sum_checksum(buf, 64) != stored {
            return Err(Error::corrupt("footer checksum wrong"));
        }
        let format_version = u32::from_be_bytes(buf[12..16].try_into().unwrap());
        if format_version != 0x0001_0000 {
            return Err(Error::corrupt(format!(
                "unrecognised footer format version {format_version:#010x}"
            )));
        }
        let disk_type = u32::from_be_bytes(buf[60..64].try_into().unwrap());
        if disk_type != DISK_TYPE_DYNAMIC && disk_type != DISK_TYPE_DIFFERENCING {
            return Err(Error::corrupt(format!("unsupported disk type {disk_type}")));
        }

        Ok(Self {
            data_offset: u64::from_be_bytes(buf[16..24].try_into().unwrap()),
            timestamp: u32::from_be_bytes(buf[24..28].try_into().unwrap()),
            original_size: u64::from_be_bytes(buf[40..48].try_into().unwrap()),
            current_size: u64::from_be_bytes(buf[48..56].try_into().unwrap()),
            disk_type,
            uid: buf[68..84].try_into().unwrap(),
        })
    }
}

// ── Parent locator ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct ParentLocator {
    pub platform_code: u32,
    pub data_space: u32,
    pub data_length: u32,
    pub data_offset: u64,
}

// ── Dynamic header ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DynamicHeader {
    pub table_offset: u64,
    pub max_table_entries: u32,
    pub block_size: u32,
    pub parent_uid: [u8; 16],
    pub parent_timestamp: u32,
    /// UTF-16BE parent name, already NUL terminated, at most 512 bytes.
    pub parent_unicode_name: Vec<u8>,
    pub parent_locators: [ParentLocator; 8],
}

impl DynamicHeader {
    pub fn new(table_offset: u64, max_table_entries: u32, block_size: u32) -> Self {
        Self {
            table_offset,
            max_table_entries,
            block_size,
            parent_uid: [0u8; 16],
            parent_timestamp: 0,
            parent_unicode_name: Vec::new(),
            parent_locators: [ParentLocator::default(); 8],
        }
    }

    pub fn serialize(&self) -> [u8; DYNAMIC_HEADER_SIZE] {
        let mut buf = [0u8; DYNAMIC_HEADER_SIZE];
        buf[0..8].copy_from_slice(DYNAMIC_COOKIE);
        buf[8..16].copy_from_slice(&u64::MAX.to_be_bytes());
        buf[16..24].copy_from_slice(&self.table_offset.to_be_bytes());
        buf[24..28].copy_from_slice(&0x0001_0000u32.to_be_bytes());
        buf[28..32].copy_from_slice(&self.max_table_entries.to_be_bytes());
        buf[32..36].copy_from_slice(&self.block_size.to_be_bytes());
        buf[40..56].copy_from_slice(&self.parent_uid);
        buf[56..60].copy_from_slice(&self.parent_timestamp.to_be_bytes());

        let name_len = self.parent_unicode_name.len().min(512);
        buf[64..64 + name_len].copy_from_slice(&self.parent_unicode_name[..name_len]);

        for (i, loc) in self.parent_locators.iter().enumerate() {
            let at = 576 + i * 24;
            buf[at..at + 4].copy_from_slice(&loc.platform_code.to_be_bytes());
            buf[at + 4..at + 8].copy_from_slice(&loc.data_space.to_be_bytes());
            buf[at + 8..at + 12].copy_from_slice(&loc.data_length.to_be_bytes());
            buf[at + 16..at + 24].copy_from_slice(&loc.data_offset.to_be_bytes());
        }

        let checksum = byte_sum_checksum(&buf, 36);
        buf[36..40].copy_from_slice(&checksum.to_be_bytes());
        buf
    }

    pub fn parse(buf: &[u8; DYNAMIC_HEADER_SIZE]) -> Result<Self> {
        if &buf[0..8] != DYNAMIC_COOKIE {
            return Err(Error::corrupt("dynamic header cookie wrong"));
        }
        let stored = u32::from_be_bytes(buf[36..40].try_into().unwrap());
        if byte_sum_checksum(buf, 36) != stored {
            return Err(Error::corrupt("dynamic header checksum wrong"));
        }

        let mut locators = [ParentLocator::default(); 8];
        for (i, loc) in locators.iter_mut().enumerate() {
            let at = 576 + i * 24;
            *loc = ParentLocator {
                platform_code: u32::from_be_bytes(buf[at..at + 4].try_into().unwrap()),
                data_space: u32::from_be_bytes(buf[at + 4..at + 8].try_into().unwrap()),
                data_length: u32::from_be_bytes(buf[at + 8..at + 12].try_into().unwrap()),
                data_offset: u64::from_be_bytes(buf[at + 16..at + 24].try_into().unwrap()),
            };
        }

        Ok(Self {
            table_offset: u64::from_be_bytes(buf[16..24].try_into().unwrap()),
            max_table_entries: u32::from_be_bytes(buf[28..32].try_into().unwrap()),
            block_size: u32::from_be_bytes(buf[32..36].try_into().unwrap()),
            parent_uid: buf[40..56].try_into().unwrap(),
            parent_timestamp: u32::from_be_bytes(buf[56..60].try_into().unwrap()),
            parent_unicode_name: buf[64..576].to_vec(),
            parent_locators: locators,
        })
    }

    /// Decode the stored parent name back to a string (up to the first NUL).
    pub fn parent_name(&self) -> String {
        let units: Vec<u16> = self
            .parent_unicode_name
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .take_while(|&u| u != 0)
            .collect();
        String::from_utf16_lossy(&units)
    }
}

/// Encode a parent file name as NUL-terminated UTF-16BE.
pub fn encode_utf16be(name: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(name.len() * 2 + 2);
    for unit in name.encode_utf16() {
        out.extend_from_slice(&unit.to_be_bytes());
    }
    out.extend_from_slice(&[0, 0]);
    out
}

/// Encode as UTF-16LE without terminator (parent locator payload form).
pub fn encode_utf16le(name: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(name.len() * 2);
    for unit in name.encode_utf16() {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn footer_roundtrip() {
        let footer = VhdFooter::new(4 * 1024 * 1024, DISK_TYPE_DYNAMIC, 512);
        let raw = footer.serialize();
        let parsed = VhdFooter::parse(&raw).unwrap();
        assert_eq!(parsed.current_size, 4 * 1024 * 1024);
        assert_eq!(parsed.disk_type, DISK_TYPE_DYNAMIC);
        assert_eq!(parsed.uid, footer.uid);
    }

    #[test]
    fn footer_detects_bit_flip() {
        let raw = VhdFooter::new(1024 * 1024, DISK_TYPE_DYNAMIC, 512).serialize();
        for &at in &[9usize, 25, 50, 70] {
            let mut bad = raw;
            bad[at] ^= 0x01;
            assert!(VhdFooter::parse(&bad).is_err(), "flip at {at} not caught");
        }
    }

    #[test]
    fn dynamic_header_roundtrip_with_parent() {
        let mut hdr = DynamicHeader::new(1536, 4, 1024 * 1024);
        hdr.parent_uid = [7u8; 16];
        hdr.parent_timestamp = 1234;
        hdr.parent_unicode_name = encode_utf16be("base.vhd");
        hdr.parent_locators[0] = ParentLocator {
            platform_code: PLAT_CODE_W2KU,
            data_space: 512,
            data_length: 16,
            data_offset: 4096,
        };
        let raw = hdr.serialize();
        let parsed = DynamicHeader::parse(&raw).unwrap();
        assert_eq!(parsed.parent_name(), "base.vhd");
        assert_eq!(parsed.parent_uid, [7u8; 16]);
        assert_eq!(parsed.parent_locators[0].platform_code, PLAT_CODE_W2KU);
        assert_eq!(parsed.parent_locators[0].data_offset, 4096);
    }

    #[test]
    fn chs_saturates() {
        // Well past the CHS limit: geometry must clamp, not overflow.
        let g = chs_geometry(3 * 1024 * 1024 * 1024 * 1024);
        let cylinders = g >> 16;
        let heads = (g >> 8) & 0xFF;
        let spt = g & 0xFF;
        assert_eq!((cylinders, heads, spt), (65535, 16, 255));
    }

    #[test]
    fn chs_small_disk() {
        let g = chs_geometry(4 * 1024 * 1024);
        let heads = (g >> 8) & 0xFF;
        let spt = g & 0xFF;
        assert_eq!(heads, 4);
        assert_eq!(spt, 17);
    }
}
