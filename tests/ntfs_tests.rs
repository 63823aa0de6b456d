//! NTFS reader integration test against a synthesized minimal volume:
//! a boot record, a two-cluster MFT whose record 0 maps itself, and a
//! `$Bitmap` record whose `$DATA` run points at a one-cluster bitmap.

use fsimage::fs::ntfs::FsNtfs;
use fsimage::fs::FilesystemSource;

const SECTOR: usize = 512;
const CLUSTER: usize = 4096;
const MFT_RECORD: usize = 1024;
const MFT_LCN: u64 = 4;
const BITMAP_LCN: u64 = 8;

/// Build one fix-up-protected MFT record carrying a single attribute list.
fn file_record(attributes: &[u8]) -> Vec<u8> {
    let mut rec = vec![0u8; MFT_RECORD];
    rec[0..4].copy_from_slice(b"FILE");
    rec[4..6].copy_from_slice(&48u16.to_le_bytes()); // update sequence array
    rec[6..8].copy_from_slice(&3u16.to_le_bytes()); // usn + 2 fix-up slots
    rec[20..22].copy_from_slice(&64u16.to_le_bytes()); // first attribute

    rec[64..64 + attributes.len()].copy_from_slice(attributes);
    let term = 64 + attributes.len();
    rec[term..term + 4].copy_from_slice(&0xFFFF_FFFFu32.to_le_bytes());

    // Fix-ups: stash each sub-sector's trailing bytes, stamp the sentinel.
    let usn = [0xAA, 0x55];
    rec[48..50].copy_from_slice(&usn);
    for t in 0..MFT_RECORD / SECTOR {
        let end = (t + 1) * SECTOR;
        let fix = 50 + t * 2;
        rec[fix] = rec[end - 2];
        rec[fix + 1] = rec[end - 1];
        rec[end - 2] = usn[0];
        rec[end - 1] = usn[1];
    }
    rec
}

/// Non-resident unnamed `$DATA` attribute with the given run-list.
fn data_attribute(runlist: &[u8], last_vcn: u64, real_size: u64) -> Vec<u8> {
    let run_len = runlist.len().div_ceil(8) * 8;
    let length = 64 + run_len;
    let mut attr = vec![0u8; length];
    attr[0..4].copy_from_slice(&0x80u32.to_le_bytes());
    attr[4..8].copy_from_slice(&(length as u32).to_le_bytes());
    attr[8] = 1; // non-resident
    attr[24..32].copy_from_slice(&last_vcn.to_le_bytes());
    attr[32..34].copy_from_slice(&64u16.to_le_bytes()); // run offset
    attr[40..48].copy_from_slice(&real_size.next_multiple_of(CLUSTER as u64).to_le_bytes());
    attr[48..56].copy_from_slice(&real_size.to_le_bytes());
    attr[56..64].copy_from_slice(&real_size.to_le_bytes());
    attr[64..64 + runlist.len()].copy_from_slice(runlist);
    attr
}

fn build_volume() -> Vec<u8> {
    let volume_size = 32 * 1024 * 1024usize;
    let mut vol = vec![0u8; volume_size];

    // Boot record.
    vol[3..7].copy_from_slice(b"NTFS");
    vol[11..13].copy_from_slice(&(SECTOR as u16).to_le_bytes());
    vol[13] = (CLUSTER / SECTOR) as u8;
    vol[40..48].copy_from_slice(&((volume_size / SECTOR) as u64).to_le_bytes());
    vol[48..56].copy_from_slice(&MFT_LCN.to_le_bytes());
    vol[64] = (-10i8) as u8; // 2^10 = 1024-byte MFT records

    // $MFT record 0: the MFT itself, two clusters at MFT_LCN.
    let mft_runs = [0x11, 0x02, MFT_LCN as u8, 0x00];
    let mft_rec = file_record(&data_attribute(&mft_runs, 1, 2 * CLUSTER as u64));
    let mft_base = MFT_LCN as usize * CLUSTER;
    vol[mft_base..mft_base + MFT_RECORD].copy_from_slice(&mft_rec);

    // Record 6: $Bitmap, one data cluster at BITMAP_LCN.
    let bitmap_runs = [0x11, 0x01, BITMAP_LCN as u8, 0x00];
    let total_clusters = volume_size / CLUSTER;
    let bitmap_bytes = total_clusters / 8;
    let bitmap_rec = file_record(&data_attribute(&bitmap_runs, 0, bitmap_bytes as u64));
    let rec6 = mft_base + 6 * MFT_RECORD;
    vol[rec6..rec6 + MFT_RECORD].copy_from_slice(&bitmap_rec);

    // Volume bitmap: metadata clusters 0..16 and one 8 MiB file at
    // clusters 100..2148 are in use; everything else is free.
    let bitmap_base = BITMAP_LCN as usize * CLUSTER;
    for cluster in (0..16usize).chain(100..2148) {
        vol[bitmap_base + cluster / 8] |= 1 << (cluster % 8);
    }

    vol
}

#[test]
fn parses_cluster_size_and_file_bitmap() {
    let vol = build_volume();
    let fs = FsNtfs::parse(&mut vol.as_slice()).unwrap();

    assert_eq!(fs.block_size(), CLUSTER as u64);
    assert_eq!(fs.volume_size(), 32 * 1024 * 1024);

    for cluster in 100..2148i64 {
        assert!(fs.has_block(cluster), "file cluster {cluster} must be used");
    }
    assert!(!fs.has_block(2148), "cluster past the file must be free");
    assert!(!fs.has_block(50));
    assert!(fs.has_block(0));
}

#[test]
fn rejects_wrong_magic() {
    let mut vol = build_volume();
    vol[3] = b'X';
    assert!(FsNtfs::parse(&mut vol.as_slice()).is_err());
}

#[test]
fn rejects_torn_mft_record() {
    let mut vol = build_volume();
    // Break the fix-up sentinel of record 0's second sub-sector.
    let mft_base = MFT_LCN as usize * CLUSTER;
    vol[mft_base + 2 * SECTOR - 1] ^= 0xFF;
    assert!(FsNtfs::parse(&mut vol.as_slice()).is_err());
}

#[test]
fn unknown_filesystem_claims_everything_used() {
    let fs = fsimage::FsUnknown::new(1024 * 1024);
    assert_eq!(fs.block_size(), 512);
    assert!(fs.has_block(0));
    assert!(fs.has_block(5000));
}
