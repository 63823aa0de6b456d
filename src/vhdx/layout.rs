//! ContainerV2 on-disk structures — headers, region table, metadata, BAT.
//!
//! All multi-byte fields are little-endian; every integrity field is
//! CRC-32C (Castagnoli) computed over the structure with its checksum field
//! zeroed.
//!
//! # Fixed region map (1 MiB-aligned file)
//!
//! ```text
//! Offset    Size    Region
//! 0         64 KiB  file identifier ("vhdxfile" + UTF-16LE creator)
//! 64 KiB    64 KiB  header slot A
//! 128 KiB   64 KiB  header slot B
//! 192 KiB   64 KiB  region table copy A
//! 256 KiB   64 KiB  region table copy B
//! 1 MiB      1 MiB  log (offset/length recorded in the header)
//! 2 MiB      1 MiB  metadata region
//! 3 MiB      var.   BAT (length recorded in the region table)
//! …                 payload and sector-bitmap blocks, 1 MiB-aligned
//! ```
//!
//! # BAT structure
//!
//! 64-bit packed entries: 3-bit state, 17 reserved bits, 44-bit MiB file
//! offset.  `chunk_ratio` payload entries are followed by one sector-bitmap
//! entry, repeating; `chunk_ratio = 8388608 × sector_size / block_size`, so
//! one bitmap block covers 2^23 sector bits.

use crc::{Crc, CRC_32_ISCSI};
use uuid::Uuid;

use crate::error::{Error, Result};

/// CRC-32C, polynomial 0x1EDC6F41 (reflected 0x82F63B78).
const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

pub fn crc32c(data: &[u8]) -> u32 {
    CASTAGNOLI.checksum(data)
}

// ── Region map constants ─────────────────────────────────────────────────────

pub const FILE_ID_SIZE: usize = 64 * 1024;
pub const HEADER1_OFFSET: u64 = 64 * 1024;
pub const HEADER2_OFFSET: u64 = 128 * 1024;
pub const REGION_TABLE_A_OFFSET: u64 = 192 * 1024;
pub const REGION_TABLE_B_OFFSET: u64 = 256 * 1024;
pub const REGION_TABLE_SIZE: usize = 64 * 1024;
pub const HEADER_SIZE: usize = 4096;

pub const MB: u64 = 1024 * 1024;
pub const LOG_OFFSET: u64 = MB;
pub const LOG_LENGTH: u32 = MB as u32;
pub const META_REGION_OFFSET: u64 = 2 * MB;
pub const META_REGION_LENGTH: u32 = MB as u32;
pub const BAT_REGION_OFFSET: u64 = 3 * MB;

pub const LOG_SECTOR_SIZE: usize = 4096;

/// One sector bitmap block covers this many sector bits.
pub const SECTOR_BITS_PER_CHUNK: u64 = 8_388_608;

// ── GUIDs ────────────────────────────────────────────────────────────────────

pub type VhdxGuid = [u8; 16];

/// Swap a GUID between textual field order and the on-disk mixed-endian
/// form (first three fields little-endian).
pub const fn reorder_guid(g: VhdxGuid) -> VhdxGuid {
    [
        g[3], g[2], g[1], g[0], g[5], g[4], g[7], g[6], g[8], g[9], g[10], g[11], g[12], g[13],
        g[14], g[15],
    ]
}

pub const ZERO_GUID: VhdxGuid = [0u8; 16];

pub fn is_zero_guid(g: &VhdxGuid) -> bool {
    g == &ZERO_GUID
}

pub fn random_guid() -> VhdxGuid {
    *Uuid::new_v4().as_bytes()
}

/// {CAA16737-FA36-4D43-B3B6-33F0AA44E76B}
pub const FILE_PARAMETERS_GUID: VhdxGuid = reorder_guid([
    0xCA, 0xA1, 0x67, 0x37, 0xFA, 0x36, 0x4D, 0x43, 0xB3, 0xB6, 0x33, 0xF0, 0xAA, 0x44, 0xE7,
    0x6B,
]);
/// {2FA54224-CD1B-4876-B211-5DBED83BF4B8}
pub const VIRTUAL_DISK_SIZE_GUID: VhdxGuid = reorder_guid([
    0x2F, 0xA5, 0x42, 0x24, 0xCD, 0x1B, 0x48, 0x76, 0xB2, 0x11, 0x5D, 0xBE, 0xD8, 0x3B, 0xF4,
    0xB8,
]);
/// {8141BF1D-A96F-4709-BA47-F233A8FAAB5F}
pub const LOGICAL_SECTOR_SIZE_GUID: VhdxGuid = reorder_guid([
    0x81, 0x41, 0xBF, 0x1D, 0xA9, 0x6F, 0x47, 0x09, 0xBA, 0x47, 0xF2, 0x33, 0xA8, 0xFA, 0xAB,
    0x5F,
]);
/// {CDA348C7-445D-4471-9CC9-E9885251C556}
pub const PHYSICAL_SECTOR_SIZE_GUID: VhdxGuid = reorder_guid([
    0xCD, 0xA3, 0x48, 0xC7, 0x44, 0x5D, 0x44, 0x71, 0x9C, 0xC9, 0xE9, 0x88, 0x52, 0x51, 0xC5,
    0x56,
]);
/// {BECA12AB-B2E6-4523-93EF-C309E000C746}
pub const PAGE83_DATA_GUID: VhdxGuid = reorder_guid([
    0xBE, 0xCA, 0x12, 0xAB, 0xB2, 0xE6, 0x45, 0x23, 0x93, 0xEF, 0xC3, 0x09, 0xE0, 0x00, 0xC7,
    0x46,
]);
/// {A8D35F2D-B30B-454D-ABF7-D3D84834AB0C}
pub const PARENT_LOCATOR_GUID: VhdxGuid = reorder_guid([
    0xA8, 0xD3, 0x5F, 0x2D, 0xB3, 0x0B, 0x45, 0x4D, 0xAB, 0xF7, 0xD3, 0xD8, 0x48, 0x34, 0xAB,
    0x0C,
]);
/// {B04AEFB7-D19E-4A81-B789-25B8E9445913} — VHDX parent locator type
pub const VHDX_PARENT_LOCATOR_TYPE_GUID: VhdxGuid = reorder_guid([
    0xB0, 0x4A, 0xEF, 0xB7, 0xD1, 0x9E, 0x4A, 0x81, 0xB7, 0x89, 0x25, 0xB8, 0xE9, 0x44, 0x59,
    0x13,
]);
/// {8B7CA206-4790-4B9A-B8FE-575F050F886E} — metadata region
pub const METADATA_REGION_GUID: VhdxGuid = reorder_guid([
    0x8B, 0x7C, 0xA2, 0x06, 0x47, 0x90, 0x4B, 0x9A, 0xB8, 0xFE, 0x57, 0x5F, 0x05, 0x0F, 0x88,
    0x6E,
]);
/// {2DC27766-F623-4200-9D64-115E9BFD4A08} — BAT region
pub const BAT_REGION_GUID: VhdxGuid = reorder_guid([
    0x2D, 0xC2, 0x77, 0x66, 0xF6, 0x23, 0x42, 0x00, 0x9D, 0x64, 0x11, 0x5E, 0x9B, 0xFD, 0x4A,
    0x08,
]);

/// Braced textual form, e.g. `{CAA16737-FA36-4D43-B3B6-33F0AA44E76B}`.
pub fn format_guid(g: &VhdxGuid) -> String {
    let t = reorder_guid(*g);
    let mut out = String::with_capacity(38);
    out.push('{');
    for (i, b) in t.iter().enumerate() {
        out.push_str(&format!("{b:02X}"));
        if matches!(i, 3 | 5 | 7 | 9) {
            out.push('-');
        }
    }
    out.push('}');
    out
}

/// Parse the braced textual form back into the on-disk byte order.
pub fn parse_guid(s: &str) -> Result<VhdxGuid> {
    let s = s.trim();
    if !s.starts_with('{') || !s.ends_with('}') {
        return Err(Error::corrupt(format!("GUID not braced: {s}")));
    }
    let hexchars: String = s[1..s.len() - 1]
        .chars()
        .filter(|c| c.is_ascii_hexdigit())
        .collect();
    if hexchars.len() != 32 {
        return Err(Error::corrupt(format!("GUID length wrong: {s}")));
    }
    let mut g = [0u8; 16];
    for i in 0..16 {
        g[i] = u8::from_str_radix(&hexchars[i * 2..i * 2 + 2], 16)
            .map_err(|_| Error::corrupt(format!("GUID hex invalid: {s}")))?;
    }
    Ok(reorder_guid(g))
}

// ── File identifier ──────────────────────────────────────────────────────────

pub const FILE_ID_MAGIC: &[u8; 8] = b"vhdxfile";

pub fn build_file_identifier(creator: &str) -> Vec<u8> {
    let mut buf = vec![0u8; FILE_ID_SIZE];
    buf[0..8].copy_from_slice(FILE_ID_MAGIC);
    let mut at = 8;
    for unit in creator.encode_utf16().take(256) {
        buf[at..at + 2].copy_from_slice(&unit.to_le_bytes());
        at += 2;
    }
    buf
}

// ── Header ───────────────────────────────────────────────────────────────────

pub const HEADER_MAGIC: &[u8; 4] = b"head";

#[derive(Debug, Clone)]
pub struct VhdxHeader {
    pub sequence_number: u64,
    pub file_write_guid: VhdxGuid,
    pub data_write_guid: VhdxGuid,
    pub log_guid: VhdxGuid,
    pub log_version: u16,
    pub version: u16,
    pub log_length: u32,
    pub log_offset: u64,
}

impl VhdxHeader {
    pub fn new() -> Self {
        Self {
            sequence_number: 1,
            file_write_guid: random_guid(),
            data_write_guid: random_guid(),
            log_guid: ZERO_GUID,
            log_version: 0,
            version: 1,
            log_length: LOG_LENGTH,
            log_offset: LOG_OFFSET,
        }
    }

    pub fn serialize(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(HEADER_MAGIC);
        // checksum at 4..8, filled last
        buf[8..16].copy_from_slice(&self.sequence_number.to_le_bytes());
        buf[16..32].copy_from_slice(&self.file_write_guid);
        buf[32..48].copy_from_slice(&self.data_write_guid);
        buf[48..64].copy_from_slice(&self.log_guid);
        buf[64..66].copy_from_slice(&self.log_version.to_le_bytes());
        buf[66..68].copy_from_slice(&self.version.to_le_bytes());
        buf[68..72].copy_from_slice(&self.log_length.to_le_bytes());
        buf[72..80].copy_from_slice(&self.log_offset.to_le_bytes());

        let crc = crc32c(&buf);
        buf[4..8].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    pub fn parse(buf: &[u8; HEADER_SIZE]) -> Result<Self> {
        if &buf[0..4] != HEADER_MAGIC {
            return Err(Error::corrupt("header magic wrong"));
        }
        let stored = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        let mut copy = *buf;
        copy[4..8].fill(0);
        if crc32c(&copy) != stored {
            return Err(Error::corrupt("header checksum wrong"));
        }
        Ok(Self {
            sequence_number: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            file_write_guid: buf[16..32].try_into().unwrap(),
            data_write_guid: buf[32..48].try_into().unwrap(),
            log_guid: buf[48..64].try_into().unwrap(),
            log_version: u16::from_le_bytes(buf[64..66].try_into().unwrap()),
            version: u16::from_le_bytes(buf[66..68].try_into().unwrap()),
            log_length: u32::from_le_bytes(buf[68..72].try_into().unwrap()),
            log_offset: u64::from_le_bytes(buf[72..80].try_into().unwrap()),
        })
    }
}

impl Default for VhdxHeader {
    fn default() -> Self {
        Self::new()
    }
}

// ── Region table ─────────────────────────────────────────────────────────────

pub const REGION_TABLE_MAGIC: &[u8; 4] = b"regi";

#[derive(Debug, Clone, Copy)]
pub struct RegionEntry {
    pub guid: VhdxGuid,
    pub file_offset: u64,
    pub length: u32,
    pub required: bool,
}

#[derive(Debug, Clone)]
pub struct RegionTable {
    pub metadata: RegionEntry,
    pub bat: RegionEntry,
}

impl RegionTable {
    pub fn new(bat_length: u32) -> Self {
        Self {
            metadata: RegionEntry {
                guid: METADATA_REGION_GUID,
                file_offset: META_REGION_OFFSET,
                length: META_REGION_LENGTH,
                required: true,
            },
            bat: RegionEntry {
                guid: BAT_REGION_GUID,
                file_offset: BAT_REGION_OFFSET,
                length: bat_length,
                required: true,
            },
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = vec![0u8; REGION_TABLE_SIZE];
        buf[0..4].copy_from_slice(REGION_TABLE_MAGIC);
        // checksum at 4..8
        buf[8..12].copy_from_slice(&2u32.to_le_bytes());

        for (i, entry) in [&self.metadata, &self.bat].into_iter().enumerate() {
            let at = 16 + i * 32;
            buf[at..at + 16].copy_from_slice(&entry.guid);
            buf[at + 16..at + 24].copy_from_slice(&entry.file_offset.to_le_bytes());
            buf[at + 24..at + 28].copy_from_slice(&entry.length.to_le_bytes());
            buf[at + 28..at + 32]
                .copy_from_slice(&(if entry.required { 1u32 } else { 0 }).to_le_bytes());
        }

        let crc = crc32c(&buf);
        buf[4..8].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() != REGION_TABLE_SIZE {
            return Err(Error::corrupt("region table size wrong"));
        }
        if &buf[0..4] != REGION_TABLE_MAGIC {
            return Err(Error::corrupt("region table magic wrong"));
        }
        let stored = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        let mut copy = buf.to_vec();
        copy[4..8].fill(0);
        if crc32c(&copy) != stored {
            return Err(Error::corrupt("region table checksum wrong"));
        }

        let entry_count = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        if entry_count as usize > (REGION_TABLE_SIZE - 16) / 32 {
            return Err(Error::corrupt("region table entry count not plausible"));
        }

        let mut metadata = None;
        let mut bat = None;
        for i in 0..entry_count as usize {
            let at = 16 + i * 32;
            let entry = RegionEntry {
                guid: buf[at..at + 16].try_into().unwrap(),
                file_offset: u64::from_le_bytes(buf[at + 16..at + 24].try_into().unwrap()),
                length: u32::from_le_bytes(buf[at + 24..at + 28].try_into().unwrap()),
                required: u32::from_le_bytes(buf[at + 28..at + 32].try_into().unwrap()) & 1 != 0,
            };
            if entry.guid == METADATA_REGION_GUID {
                if metadata.replace(entry).is_some() {
                    return Err(Error::corrupt("metadata region listed twice"));
                }
            } else if entry.guid == BAT_REGION_GUID {
                if bat.replace(entry).is_some() {
                    return Err(Error::corrupt("BAT region listed twice"));
                }
            } else if entry.required {
                return Err(Error::corrupt(format!(
                    "unknown required region {}",
                    format_guid(&entry.guid)
                )));
            }
        }

        match (metadata, bat) {
            (Some(metadata), Some(bat)) => Ok(Self { metadata, bat }),
            _ => Err(Error::corrupt("region table misses a required entry")),
        }
    }
}

// ── BAT entries ──────────────────────────────────────────────────────────────

pub const PAYLOAD_BLOCK_NOT_PRESENT: u8 = 0;
pub const PAYLOAD_BLOCK_UNDEFINED: u8 = 1;
pub const PAYLOAD_BLOCK_ZERO: u8 = 2;
pub const PAYLOAD_BLOCK_UNMAPPED: u8 = 3;
pub const PAYLOAD_BLOCK_FULLY_PRESENT: u8 = 6;
pub const PAYLOAD_BLOCK_PARTIALLY_PRESENT: u8 = 7;

/// Packed 64-bit BAT entry: `State:3, Reserved:17, FileOffsetMB:44`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatEntry(pub u64);

impl BatEntry {
    pub fn new(state: u8, file_offset_mb: u64) -> Self {
        Self((state as u64 & 0x7) | (file_offset_mb << 20))
    }

    #[inline]
    pub fn state(self) -> u8 {
        (self.0 & 0x7) as u8
    }

    #[inline]
    pub fn file_offset_mb(self) -> u64 {
        self.0 >> 20
    }

    #[inline]
    pub fn file_offset(self) -> u64 {
        self.file_offset_mb() * MB
    }

    pub fn with_state(self, state: u8) -> Self {
        Self((self.0 & !0x7) | (state as u64 & 0x7))
    }

    pub fn is_present(self) -> bool {
        matches!(
            self.state(),
            PAYLOAD_BLOCK_FULLY_PRESENT | PAYLOAD_BLOCK_PARTIALLY_PRESENT
        )
    }
}

/// Geometry shared by the BAT index helpers.
#[derive(Debug, Clone, Copy)]
pub struct BatGeometry {
    pub block_size: u32,
    pub sector_size: u32,
    pub chunk_ratio: u64,
}

impl BatGeometry {
    pub fn new(block_size: u32, sector_size: u32) -> Self {
        Self {
            block_size,
            sector_size,
            chunk_ratio: SECTOR_BITS_PER_CHUNK * sector_size as u64 / block_size as u64,
        }
    }

    pub fn data_blocks(&self, virtual_size: u64) -> u64 {
        virtual_size.div_ceil(self.block_size as u64)
    }

    /// BAT index of payload block `block`.
    pub fn bat_index(&self, block: u64) -> u64 {
        block + block / self.chunk_ratio
    }

    /// BAT index of the sector-bitmap entry covering payload block `block`.
    pub fn bitmap_bat_index(&self, block: u64) -> u64 {
        let chunk = block / self.chunk_ratio;
        chunk * (self.chunk_ratio + 1) + self.chunk_ratio
    }

    /// BAT entries a disk of `virtual_size` bytes addresses.  The last
    /// chunk's sector-bitmap entry sits past the payload entries even when
    /// the chunk is partial, so the count runs to whichever index is
    /// greater.
    pub fn total_entries(&self, virtual_size: u64) -> u64 {
        let last_block = self.data_blocks(virtual_size).saturating_sub(1);
        self.bat_index(last_block).max(self.bitmap_bat_index(last_block)) + 1
    }

    /// BAT region length, rounded up to 1 MiB.
    pub fn bat_length(&self, virtual_size: u64) -> u32 {
        let bytes = self.total_entries(virtual_size) * 8;
        (bytes.div_ceil(MB) * MB) as u32
    }

    /// Bit index of `pos` within its chunk's sector bitmap block.
    pub fn sector_bitmap_bit(&self, pos: u64) -> u64 {
        (pos / self.sector_size as u64) % SECTOR_BITS_PER_CHUNK
    }
}

// ── Metadata region ──────────────────────────────────────────────────────────

pub const METADATA_MAGIC: &[u8; 8] = b"metadata";
const META_ITEMS_OFFSET: u32 = 64 * 1024;

/// Parent locator key/value pairs, textual form.
#[derive(Debug, Clone, Default)]
pub struct ParentLocatorMeta {
    pub parent_linkage: Option<String>,
    pub relative_path: Option<String>,
    pub volume_path: Option<String>,
    pub absolute_win32_path: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Metadata {
    pub block_size: u32,
    pub leave_blocks_allocated: bool,
    pub has_parent: bool,
    pub virtual_size: u64,
    pub logical_sector_size: u32,
    pub physical_sector_size: u32,
    pub page83_data: VhdxGuid,
    pub parent_locator: Option<ParentLocatorMeta>,
}

impl Metadata {
    pub fn new(block_size: u32, sector_size: u32, virtual_size: u64) -> Self {
        Self {
            block_size,
            leave_blocks_allocated: false,
            has_parent: false,
            virtual_size,
            logical_sector_size: sector_size,
            physical_sector_size: sector_size,
            page83_data: random_guid(),
            parent_locator: None,
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        struct Item {
            guid: VhdxGuid,
            is_virtual_disk: bool,
            payload: Vec<u8>,
        }

        let mut items = vec![
            Item {
                guid: FILE_PARAMETERS_GUID,
                is_virtual_disk: false,
                payload: {
                    let mut p = Vec::with_capacity(8);
                    p.extend_from_slice(&self.block_size.to_le_bytes());
                    let mut flags = 0u32;
                    if self.leave_blocks_allocated {
                        flags |= 1;
                    }
                    if self.has_parent {
                        flags |= 2;
                    }
                    p.extend_from_slice(&flags.to_le_bytes());
                    p
                },
            },
            Item {
                guid: VIRTUAL_DISK_SIZE_GUID,
                is_virtual_disk: true,
                payload: self.virtual_size.to_le_bytes().to_vec(),
            },
            Item {
                guid: LOGICAL_SECTOR_SIZE_GUID,
                is_virtual_disk: true,
                payload: self.logical_sector_size.to_le_bytes().to_vec(),
            },
            Item {
                guid: PHYSICAL_SECTOR_SIZE_GUID,
                is_virtual_disk: true,
                payload: self.physical_sector_size.to_le_bytes().to_vec(),
            },
            Item {
                guid: PAGE83_DATA_GUID,
                is_virtual_disk: true,
                payload: self.page83_data.to_vec(),
            },
        ];

        if let Some(pl) = &self.parent_locator {
            let pairs: Vec<(&str, &String)> = [
                ("parent_linkage", pl.parent_linkage.as_ref()),
                ("relative_path", pl.relative_path.as_ref()),
                ("volume_path", pl.volume_path.as_ref()),
                ("absolute_win32_path", pl.absolute_win32_path.as_ref()),
            ]
            .into_iter()
            .filter_map(|(k, v)| v.map(|v| (k, v)))
            .collect();

            let mut payload = Vec::new();
            payload.extend_from_slice(&VHDX_PARENT_LOCATOR_TYPE_GUID);
            payload.extend_from_slice(&0u16.to_le_bytes());
            payload.extend_from_slice(&(pairs.len() as u16).to_le_bytes());

            let entries_at = payload.len();
            payload.resize(entries_at + pairs.len() * 12, 0);

            let mut blobs = Vec::new();
            let blob_base = payload.len();
            for (i, (key, value)) in pairs.iter().enumerate() {
                let key_utf16 = utf16le_bytes(key);
                let value_utf16 = utf16le_bytes(value);
                let key_offset = (blob_base + blobs.len()) as u32;
                blobs.extend_from_slice(&key_utf16);
                let value_offset = (blob_base + blobs.len()) as u32;
                blobs.extend_from_slice(&value_utf16);

                let at = entries_at + i * 12;
                payload[at..at + 4].copy_from_slice(&key_offset.to_le_bytes());
                payload[at + 4..at + 8].copy_from_slice(&value_offset.to_le_bytes());
                payload[at + 8..at + 10]
                    .copy_from_slice(&(key_utf16.len() as u16).to_le_bytes());
                payload[at + 10..at + 12]
                    .copy_from_slice(&(value_utf16.len() as u16).to_le_bytes());
            }
            payload.extend_from_slice(&blobs);

            items.push(Item {
                guid: PARENT_LOCATOR_GUID,
                is_virtual_disk: false,
                payload,
            });
        }

        let payload_len: usize = items.iter().map(|i| i.payload.len()).sum();
        let mut buf = vec![0u8; META_ITEMS_OFFSET as usize + payload_len];
        buf[0..8].copy_from_slice(METADATA_MAGIC);
        buf[10..12].copy_from_slice(&(items.len() as u16).to_le_bytes());

        let mut payload_at = META_ITEMS_OFFSET;
        for (i, item) in items.iter().enumerate() {
            let at = 32 + i * 32;
            buf[at..at + 16].copy_from_slice(&item.guid);
            buf[at + 16..at + 20].copy_from_slice(&payload_at.to_le_bytes());
            buf[at + 20..at + 24].copy_from_slice(&(item.payload.len() as u32).to_le_bytes());
            let mut flags = 0u32;
            if item.is_virtual_disk {
                flags |= 2;
            }
            flags |= 4; // IsRequired
            buf[at + 24..at + 28].copy_from_slice(&flags.to_le_bytes());

            buf[payload_at as usize..payload_at as usize + item.payload.len()]
                .copy_from_slice(&item.payload);
            payload_at += item.payload.len() as u32;
        }

        buf
    }

    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < 64 * 1024 {
            return Err(Error::corrupt("metadata region too small"));
        }
        if &buf[0..8] != METADATA_MAGIC {
            return Err(Error::corrupt("metadata magic wrong"));
        }

        let entry_count = u16::from_le_bytes(buf[10..12].try_into().unwrap()) as usize;
        if 32 + entry_count * 32 > buf.len() {
            return Err(Error::corrupt("metadata table not large enough"));
        }

        let mut block_size = 0u32;
        let mut leave_blocks_allocated = false;
        let mut has_parent = false;
        let mut virtual_size = 0u64;
        let mut logical_sector_size = 0u32;
        let mut physical_sector_size = 0u32;
        let mut page83_data = ZERO_GUID;
        let mut parent_locator = None;

        for i in 0..entry_count {
            let at = 32 + i * 32;
            let item_id: VhdxGuid = buf[at..at + 16].try_into().unwrap();
            let offset = u32::from_le_bytes(buf[at + 16..at + 20].try_into().unwrap()) as usize;
            let length = u32::from_le_bytes(buf[at + 20..at + 24].try_into().unwrap()) as usize;
            let flags = u32::from_le_bytes(buf[at + 24..at + 28].try_into().unwrap());

            if offset < META_ITEMS_OFFSET as usize || offset + length > buf.len() {
                return Err(Error::corrupt(format!(
                    "metadata item range wrong: {offset}+{length}"
                )));
            }
            let payload = &buf[offset..offset + length];

            if item_id == FILE_PARAMETERS_GUID {
                if payload.len() < 8 {
                    return Err(Error::corrupt("file parameters item too small"));
                }
                block_size = u32::from_le_bytes(payload[0..4].try_into().unwrap());
                let fp_flags = u32::from_le_bytes(payload[4..8].try_into().unwrap());
                leave_blocks_allocated = fp_flags & 1 != 0;
                has_parent = fp_flags & 2 != 0;
            } else if item_id == VIRTUAL_DISK_SIZE_GUID {
                if payload.len() < 8 {
                    return Err(Error::corrupt("virtual disk size item too small"));
                }
                virtual_size = u64::from_le_bytes(payload[0..8].try_into().unwrap());
            } else if item_id == LOGICAL_SECTOR_SIZE_GUID {
                if payload.len() < 4 {
                    return Err(Error::corrupt("logical sector size item too small"));
                }
                logical_sector_size = u32::from_le_bytes(payload[0..4].try_into().unwrap());
            } else if item_id == PHYSICAL_SECTOR_SIZE_GUID {
                if payload.len() < 4 {
                    return Err(Error::corrupt("physical sector size item too small"));
                }
                physical_sector_size = u32::from_le_bytes(payload[0..4].try_into().unwrap());
            } else if item_id == PAGE83_DATA_GUID {
                if payload.len() < 16 {
                    return Err(Error::corrupt("page83 item too small"));
                }
                page83_data = payload[0..16].try_into().unwrap();
            } else if item_id == PARENT_LOCATOR_GUID {
                parent_locator = Some(Self::parse_parent_locator(payload)?);
            } else if flags & 4 != 0 {
                return Err(Error::corrupt(format!(
                    "required metadata item {} not supported",
                    format_guid(&item_id)
                )));
            }
        }

        if logical_sector_size == 0 || physical_sector_size == 0 || block_size == 0
            || virtual_size == 0
        {
            return Err(Error::corrupt(format!(
                "metadata incomplete: sector_size={logical_sector_size} \
                 physical_sector_size={physical_sector_size} block_size={block_size} \
                 virtual_size={virtual_size}"
            )));
        }

        Ok(Self {
            block_size,
            leave_blocks_allocated,
            has_parent,
            virtual_size,
            logical_sector_size,
            physical_sector_size,
            page83_data,
            parent_locator,
        })
    }

    fn parse_parent_locator(payload: &[u8]) -> Result<ParentLocatorMeta> {
        if payload.len() < 20 {
            return Err(Error::corrupt("parent locator item too small"));
        }
        let locator_type: VhdxGuid = payload[0..16].try_into().unwrap();
        if locator_type != VHDX_PARENT_LOCATOR_TYPE_GUID {
            return Err(Error::corrupt(format!(
                "unknown parent locator type {}",
                format_guid(&locator_type)
            )));
        }

        let count = u16::from_le_bytes(payload[18..20].try_into().unwrap()) as usize;
        let mut meta = ParentLocatorMeta::default();
        for i in 0..count {
            let at = 20 + i * 12;
            if at + 12 > payload.len() {
                return Err(Error::corrupt("parent locator entries truncated"));
            }
            let key_offset =
                u32::from_le_bytes(payload[at..at + 4].try_into().unwrap()) as usize;
            let value_offset =
                u32::from_le_bytes(payload[at + 4..at + 8].try_into().unwrap()) as usize;
            let key_len =
                u16::from_le_bytes(payload[at + 8..at + 10].try_into().unwrap()) as usize;
            let value_len =
                u16::from_le_bytes(payload[at + 10..at + 12].try_into().unwrap()) as usize;

            if key_offset + key_len > payload.len() || value_offset + value_len > payload.len() {
                return Err(Error::corrupt("parent locator key/value range wrong"));
            }

            let key = utf16le_string(&payload[key_offset..key_offset + key_len]);
            let value = utf16le_string(&payload[value_offset..value_offset + value_len]);

            match key.as_str() {
                "parent_linkage" => meta.parent_linkage = Some(value),
                "relative_path" => meta.relative_path = Some(value),
                "volume_path" => meta.volume_path = Some(value),
                "absolute_win32_path" => meta.absolute_win32_path = Some(value),
                _ => {}
            }
        }

        Ok(meta)
    }
}

fn utf16le_bytes(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len() * 2);
    for unit in s.encode_utf16() {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out
}

fn utf16le_string(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    String::from_utf16_lossy(&units)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc32c_known_vector() {
        // RFC 3720 test vector: 32 zero bytes.
        assert_eq!(crc32c(&[0u8; 32]), 0x8A91_36AA);
    }

    #[test]
    fn header_roundtrip_and_tamper() {
        let hdr = VhdxHeader::new();
        let raw = hdr.serialize();
        let parsed = VhdxHeader::parse(&raw).unwrap();
        assert_eq!(parsed.sequence_number, 1);
        assert_eq!(parsed.log_offset, LOG_OFFSET);
        assert_eq!(parsed.file_write_guid, hdr.file_write_guid);

        for &at in &[0usize, 9, 20, 70, 4000] {
            let mut bad = raw;
            bad[at] ^= 0x40;
            assert!(VhdxHeader::parse(&bad).is_err(), "flip at {at} not caught");
        }
    }

    #[test]
    fn region_table_roundtrip_and_tamper() {
        let rt = RegionTable::new(4 * MB as u32);
        let raw = rt.serialize();
        let parsed = RegionTable::parse(&raw).unwrap();
        assert_eq!(parsed.bat.file_offset, BAT_REGION_OFFSET);
        assert_eq!(parsed.bat.length, 4 * MB as u32);
        assert_eq!(parsed.metadata.file_offset, META_REGION_OFFSET);

        let mut bad = raw.clone();
        bad[17] ^= 0x01;
        assert!(RegionTable::parse(&bad).is_err());
    }

    #[test]
    fn bat_entry_packing() {
        let e = BatEntry::new(PAYLOAD_BLOCK_FULLY_PRESENT, 123);
        assert_eq!(e.state(), PAYLOAD_BLOCK_FULLY_PRESENT);
        assert_eq!(e.file_offset_mb(), 123);
        assert_eq!(e.file_offset(), 123 * MB);
        let z = e.with_state(PAYLOAD_BLOCK_ZERO);
        assert_eq!(z.state(), PAYLOAD_BLOCK_ZERO);
        assert_eq!(z.file_offset_mb(), 123);
    }

    #[test]
    fn bat_geometry_interleave() {
        // 1 MiB blocks, 512 B sectors → 4096 blocks per chunk.
        let g = BatGeometry::new(MB as u32, 512);
        assert_eq!(g.chunk_ratio, 4096);
        assert_eq!(g.bat_index(0), 0);
        assert_eq!(g.bat_index(4095), 4095);
        assert_eq!(g.bitmap_bat_index(0), 4096);
        assert_eq!(g.bat_index(4096), 4097);
        assert_eq!(g.bitmap_bat_index(4096), 8193);
        // Even a partial first chunk addresses its bitmap entry at 4096.
        assert_eq!(g.total_entries(8 * MB), 4097);
        assert_eq!(g.total_entries(8 * 1024 * MB), 8192 + 2);
        assert_eq!(g.bat_length(8 * MB), MB as u32);
    }

    #[test]
    fn guid_text_roundtrip() {
        let s = format_guid(&FILE_PARAMETERS_GUID);
        assert_eq!(s, "{CAA16737-FA36-4D43-B3B6-33F0AA44E76B}");
        assert_eq!(parse_guid(&s).unwrap(), FILE_PARAMETERS_GUID);
    }

    #[test]
    fn metadata_roundtrip_with_parent() {
        let mut md = Metadata::new(MB as u32, 512, 64 * MB);
        md.has_parent = true;
        md.parent_locator = Some(ParentLocatorMeta {
            parent_linkage: Some("{CAA16737-FA36-4D43-B3B6-33F0AA44E76B}".into()),
            relative_path: Some(".\\base.vhdx".into()),
            volume_path: None,
            absolute_win32_path: Some("C:\\images\\base.vhdx".into()),
        });

        let mut raw = md.serialize();
        raw.resize(META_REGION_LENGTH as usize, 0);
        let parsed = Metadata::parse(&raw).unwrap();
        assert_eq!(parsed.block_size, MB as u32);
        assert_eq!(parsed.virtual_size, 64 * MB);
        assert!(parsed.has_parent);
        let pl = parsed.parent_locator.unwrap();
        assert_eq!(
            pl.parent_linkage.as_deref(),
            Some("{CAA16737-FA36-4D43-B3B6-33F0AA44E76B}")
        );
        assert_eq!(pl.relative_path.as_deref(), Some(".\\base.vhdx"));
        assert_eq!(pl.absolute_win32_path.as_deref(), Some("C:\\images\\base.vhdx"));
    }
}
