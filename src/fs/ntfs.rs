//! NTFS used-cluster reader.
//!
//! Walks just enough of the volume to obtain `$Bitmap`:
//!
//! 1. Boot record at offset 0 — magic `"NTFS"` at byte 3, sector size,
//!    cluster size, `$MFT` start LCN.
//! 2. `$MFT` record 0 — fix-up patched, its non-resident `$DATA` run-list
//!    maps the MFT itself.
//! 3. Record 6 (`$Bitmap`) — located through that run-list, fix-up patched,
//!    its `$DATA` run-list is read cluster by cluster into memory.
//!
//! Every record is a fixed-length byte buffer with accessor functions; no
//! field is trusted before its enclosing length is checked.  A fix-up
//! sentinel mismatch means the record is torn and the volume is rejected.

use log::{debug, warn};

use crate::bitmap::{BitmapView, LsbFirst};
use crate::device::VolumeView;
use crate::error::{Error, Result};
use crate::fs::FilesystemSource;

const MFT_RECORD_BITMAP: u64 = 6;
const ATTR_TYPE_DATA: u32 = 0x80;
const ATTR_TYPE_END: u32 = 0xFFFF_FFFF;

/// Byte source the parser reads the payload volume through.
pub trait ReadVolume {
    fn size(&self) -> u64;
    fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;
}

impl ReadVolume for VolumeView<'_> {
    fn size(&self) -> u64 {
        VolumeView::size(self)
    }
    fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        VolumeView::read_exact_at(self, offset, buf)
    }
}

impl ReadVolume for &[u8] {
    fn size(&self) -> u64 {
        self.len() as u64
    }
    fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let start = offset as usize;
        let end = start
            .checked_add(buf.len())
            .filter(|&e| e <= self.len())
            .ok_or_else(|| Error::corrupt("read past end of volume buffer"))?;
        buf.copy_from_slice(&self[start..end]);
        Ok(())
    }
}

// ── Boot record ──────────────────────────────────────────────────────────────

struct BootRecord {
    bytes_per_sector: u32,
    sectors_per_cluster: u32,
    number_of_sectors: u64,
    mft_lcn: u64,
    clusters_per_mft_record: i8,
}

impl BootRecord {
    fn parse(buf: &[u8; 512]) -> Result<Self> {
        if &buf[3..7] != b"NTFS" {
            return Err(Error::corrupt("NTFS magic wrong"));
        }
        let bytes_per_sector = u16::from_le_bytes(buf[11..13].try_into().unwrap()) as u32;
        if !matches!(bytes_per_sector, 512 | 1024 | 2048 | 4096) {
            return Err(Error::corrupt(format!(
                "NTFS bytes per sector not supported: {bytes_per_sector}"
            )));
        }
        let sectors_per_cluster = buf[13] as u32;
        if sectors_per_cluster == 0 {
            return Err(Error::corrupt("NTFS sectors per cluster is zero"));
        }
        Ok(Self {
            bytes_per_sector,
            sectors_per_cluster,
            number_of_sectors: u64::from_le_bytes(buf[40..48].try_into().unwrap()),
            mft_lcn: u64::from_le_bytes(buf[48..56].try_into().unwrap()),
            clusters_per_mft_record: buf[64] as i8,
        })
    }
}

// ── File record ──────────────────────────────────────────────────────────────

/// One MFT file record, fix-up patched on construction.
struct FileRecord {
    data: Vec<u8>,
}

impl FileRecord {
    fn parse(mut data: Vec<u8>, sector_size: u32) -> Result<Self> {
        if data.len() < 42 {
            return Err(Error::corrupt("MFT record too small"));
        }

        let usa_offset = u16::from_le_bytes(data[4..6].try_into().unwrap()) as usize;
        let usa_count = u16::from_le_bytes(data[6..8].try_into().unwrap()) as usize;
        let fixups_size = usa_count * 2;
        if usa_offset + fixups_size > data.len() {
            return Err(Error::corrupt("MFT fix-up array out of bounds"));
        }

        apply_fixups(&mut data, sector_size as usize, usa_offset, fixups_size)?;

        if &data[0..4] != b"FILE" {
            return Err(Error::corrupt("MFT record magic wrong"));
        }

        Ok(Self { data })
    }

    fn attribute_offset(&self) -> usize {
        u16::from_le_bytes(self.data[20..22].try_into().unwrap()) as usize
    }

    /// Find the unnamed `$DATA` attribute; returns its byte range within the
    /// record.
    fn find_data_attribute(&self) -> Result<&[u8]> {
        let mut pos = self.attribute_offset();
        loop {
            if pos + 16 > self.data.len() {
                return Err(Error::corrupt("MFT attribute walk out of bounds"));
            }
            let attr_type = u32::from_le_bytes(self.data[pos..pos + 4].try_into().unwrap());
            if attr_type == ATTR_TYPE_END {
                return Err(Error::corrupt("MFT $DATA attribute not found"));
            }
            let length = u32::from_le_bytes(self.data[pos + 4..pos + 8].try_into().unwrap()) as usize;
            if length == 0 || pos + length > self.data.len() {
                return Err(Error::corrupt("MFT attribute length invalid"));
            }
            if attr_type == ATTR_TYPE_DATA {
                return Ok(&self.data[pos..pos + length]);
            }
            pos += length;
        }
    }
}

/// Each `sector_size` sub-sector must end in the two update-sequence sentinel
/// bytes; replace them with the stored originals or report the record torn.
fn apply_fixups(
    data: &mut [u8],
    sector_size: usize,
    usa_offset: usize,
    fixups_size: usize,
) -> Result<()> {
    let num_fixups = data.len() / sector_size;
    if fixups_size < 2 || num_fixups > (fixups_size - 2) / 2 {
        return Err(Error::corrupt("MFT fix-up count wrong"));
    }

    let usn = [data[usa_offset], data[usa_offset + 1]];

    for t in 0..num_fixups {
        let end = (t + 1) * sector_size;
        if data[end - 2] != usn[0] || data[end - 1] != usn[1] {
            return Err(Error::corrupt(
                "MFT record torn: fix-up sentinel mismatch".to_string(),
            ));
        }
        let fix = usa_offset + 2 + t * 2;
        data[end - 2] = data[fix];
        data[end - 1] = data[fix + 1];
    }

    Ok(())
}

// ── Non-resident attribute + run-list ────────────────────────────────────────

struct NonResidentData {
    starting_vcn: u64,
    last_vcn: u64,
    real_size: u64,
    runs: Runlist,
}

fn parse_nonresident_data(attr: &[u8]) -> Result<NonResidentData> {
    if attr.len() < 64 {
        return Err(Error::corrupt("$DATA attribute too small"));
    }
    if attr[8] != 1 {
        return Err(Error::corrupt("$DATA attribute is resident"));
    }
    let compression_unit = u16::from_le_bytes(attr[34..36].try_into().unwrap());
    if compression_unit != 0 {
        return Err(Error::corrupt("$DATA run-list is compressed"));
    }

    let run_offset = u16::from_le_bytes(attr[32..34].try_into().unwrap()) as usize;
    if run_offset >= attr.len() {
        return Err(Error::corrupt("$DATA run offset out of bounds"));
    }

    Ok(NonResidentData {
        starting_vcn: u64::from_le_bytes(attr[16..24].try_into().unwrap()),
        last_vcn: u64::from_le_bytes(attr[24..32].try_into().unwrap()),
        real_size: u64::from_le_bytes(attr[48..56].try_into().unwrap()),
        runs: Runlist::decode(&attr[run_offset..])?,
    })
}

/// Decoded NTFS run-list: (cluster_count, Option<lcn>) per run, `None`
/// marking a sparse run.
pub struct Runlist {
    runs: Vec<(u64, Option<u64>)>,
}

impl Runlist {
    pub fn decode(mut data: &[u8]) -> Result<Self> {
        let mut runs = Vec::new();
        let mut lcn: i64 = 0;

        while let Some(&header) = data.first() {
            if header == 0 {
                break;
            }
            let offset_size = (header >> 4) as usize;
            let length_size = (header & 0x0F) as usize;
            if length_size == 0 || offset_size > 8 || length_size > 8 {
                return Err(Error::corrupt("run-list header invalid"));
            }
            if data.len() < 1 + length_size + offset_size {
                return Err(Error::corrupt("run-list truncated"));
            }

            let mut length: u64 = 0;
            for (i, &b) in data[1..1 + length_size].iter().enumerate() {
                length |= (b as u64) << (8 * i);
            }

            if offset_size == 0 {
                runs.push((length, None));
            } else {
                // Sign-extended little-endian delta against the previous LCN.
                let off_bytes = &data[1 + length_size..1 + length_size + offset_size];
                let mut delta: i64 = 0;
                for (i, &b) in off_bytes.iter().enumerate() {
                    delta |= (b as i64) << (8 * i);
                }
                let shift = 64 - 8 * offset_size as u32;
                delta = (delta << shift) >> shift;

                lcn += delta;
                if lcn < 0 {
                    return Err(Error::corrupt("run-list LCN went negative"));
                }
                runs.push((length, Some(lcn as u64)));
            }

            data = &data[1 + length_size + offset_size..];
        }

        Ok(Self { runs })
    }

    /// Map a virtual cluster number to its logical cluster number; `None`
    /// for sparse or out-of-range clusters.
    pub fn lcn(&self, vcn: u64) -> Option<u64> {
        let mut coffset = 0u64;
        for &(length, lcn) in &self.runs {
            if vcn < coffset + length {
                return lcn.map(|l| l + (vcn - coffset));
            }
            coffset += length;
        }
        None
    }

    pub fn size_in_clusters(&self) -> u64 {
        self.runs.iter().map(|&(len, _)| len).sum()
    }
}

// ── FsNtfs ───────────────────────────────────────────────────────────────────

pub struct FsNtfs {
    cluster_size: u32,
    drive_size: u64,
    bitmap: Vec<u8>,
}

impl FsNtfs {
    pub fn parse<V: ReadVolume>(vol: &mut V) -> Result<Self> {
        let mut boot_buf = [0u8; 512];
        vol.read_exact_at(0, &mut boot_buf)?;
        let br = BootRecord::parse(&boot_buf)?;

        let sector_size = br.bytes_per_sector;
        let cluster_size = sector_size * br.sectors_per_cluster;
        let drive_size = br.number_of_sectors * sector_size as u64;

        let mft_record_size = if br.clusters_per_mft_record < 0 {
            1u32 << (-br.clusters_per_mft_record as u32)
        } else {
            br.clusters_per_mft_record as u32 * cluster_size
        };
        if mft_record_size < sector_size || mft_record_size > 64 * 1024 {
            return Err(Error::corrupt(format!(
                "MFT record size not plausible: {mft_record_size}"
            )));
        }

        debug!(
            "ntfs: sector_size={sector_size} cluster_size={cluster_size} \
             mft_lcn={} record_size={mft_record_size}",
            br.mft_lcn
        );

        // $MFT record 0 maps the MFT itself.
        let mut record_buf = vec![0u8; mft_record_size as usize];
        vol.read_exact_at(br.mft_lcn * cluster_size as u64, &mut record_buf)?;
        let mft = FileRecord::parse(record_buf, sector_size)?;
        let mft_data = parse_nonresident_data(mft.find_data_attribute()?)?;

        // Record 6 is $Bitmap; locate it through the MFT's own run-list.
        let bitmap_rec_pos = MFT_RECORD_BITMAP * mft_record_size as u64;
        let bitmap_vcn = bitmap_rec_pos / cluster_size as u64;
        let bitmap_lcn = mft_data
            .runs
            .lcn(bitmap_vcn)
            .ok_or_else(|| Error::corrupt("cannot map $Bitmap record VCN to LCN"))?;
        let bitmap_rec_offset =
            bitmap_lcn * cluster_size as u64 + bitmap_rec_pos % cluster_size as u64;

        let mut record_buf = vec![0u8; mft_record_size as usize];
        vol.read_exact_at(bitmap_rec_offset, &mut record_buf)?;
        let bitmap_rec = FileRecord::parse(record_buf, sector_size)?;
        let bitmap_data = parse_nonresident_data(bitmap_rec.find_data_attribute()?)?;

        // Pull the whole volume bitmap into memory, cluster by cluster.
        let real_size = bitmap_data.real_size as usize;
        let mut bitmap = Vec::with_capacity(real_size);
        let mut cluster_buf = vec![0u8; cluster_size as usize];
        for vcn in bitmap_data.starting_vcn..=bitmap_data.last_vcn {
            if bitmap.len() >= real_size {
                break;
            }
            let lcn = bitmap_data
                .runs
                .lcn(vcn)
                .ok_or_else(|| Error::corrupt("cannot map $Bitmap data VCN to LCN"))?;
            vol.read_exact_at(lcn * cluster_size as u64, &mut cluster_buf)?;
            let take = (real_size - bitmap.len()).min(cluster_size as usize);
            bitmap.extend_from_slice(&cluster_buf[..take]);
        }

        if bitmap.len() < real_size {
            warn!(
                "ntfs: $Bitmap short read: got {} of {real_size} bytes",
                bitmap.len()
            );
        }

        Ok(Self {
            cluster_size,
            drive_size,
            bitmap,
        })
    }

    pub fn bitmap_bytes(&self) -> &[u8] {
        &self.bitmap
    }
}

impl FilesystemSource for FsNtfs {
    fn block_size(&self) -> u64 {
        self.cluster_size as u64
    }

    fn volume_size(&self) -> u64 {
        self.drive_size
    }

    fn has_block(&self, index: i64) -> bool {
        if index < 0 {
            return false;
        }
        let view = BitmapView::<LsbFirst>::new(&self.bitmap);
        if index as u64 >= view.bit_capacity() {
            return false;
        }
        view.get(index as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runlist_positive_and_negative_deltas() {
        // run 1: 4 clusters at LCN 100; run 2: 2 clusters at LCN 100-30=70.
        let data = [0x11, 0x04, 0x64, 0x11, 0x02, 0xE2, 0x00];
        let rl = Runlist::decode(&data).unwrap();
        assert_eq!(rl.size_in_clusters(), 6);
        assert_eq!(rl.lcn(0), Some(100));
        assert_eq!(rl.lcn(3), Some(103));
        assert_eq!(rl.lcn(4), Some(70));
        assert_eq!(rl.lcn(5), Some(71));
        assert_eq!(rl.lcn(6), None);
    }

    #[test]
    fn runlist_sparse_run() {
        // 3 clusters at 10, then a 5-cluster sparse hole, then 1 at 12.
        let data = [0x11, 0x03, 0x0A, 0x01, 0x05, 0x11, 0x01, 0x02, 0x00];
        let rl = Runlist::decode(&data).unwrap();
        assert_eq!(rl.lcn(2), Some(12));
        assert_eq!(rl.lcn(4), None);
        assert_eq!(rl.lcn(8), Some(12));
    }

    #[test]
    fn fixups_detect_torn_record() {
        let mut rec = vec![0u8; 1024];
        rec[0..4].copy_from_slice(b"FILE");
        // usa at 40: usn=0xBEEF, two fix-up slots.
        rec[4..6].copy_from_slice(&40u16.to_le_bytes());
        rec[6..8].copy_from_slice(&3u16.to_le_bytes());
        rec[40..42].copy_from_slice(&[0xEF, 0xBE]);
        rec[42..44].copy_from_slice(&[0x11, 0x22]);
        rec[44..46].copy_from_slice(&[0x33, 0x44]);
        // Sentinels at the end of both 512-byte sub-sectors.
        rec[510..512].copy_from_slice(&[0xEF, 0xBE]);
        rec[1022..1024].copy_from_slice(&[0xEF, 0xBE]);

        let fixed = FileRecord::parse(rec.clone(), 512).unwrap();
        assert_eq!(&fixed.data[510..512], &[0x11, 0x22]);
        assert_eq!(&fixed.data[1022..1024], &[0x33, 0x44]);

        // Corrupt one sentinel: the record must be rejected.
        rec[510] = 0x00;
        assert!(FileRecord::parse(rec, 512).is_err());
    }
}
