//! ContainerV2 integration tests: random-write round-trips, differencing,
//! header rotation, journal replay, crash recovery, CRC coverage.

use std::collections::HashMap;

use fsimage::container::{CreateParams, ImageContainer};
use fsimage::device::{BlockDevice, FileDevice};
use fsimage::vhdx::layout::{
    BatEntry, VhdxHeader, HEADER1_OFFSET, HEADER2_OFFSET, HEADER_SIZE, MB,
    PAYLOAD_BLOCK_FULLY_PRESENT, PAYLOAD_BLOCK_NOT_PRESENT, PAYLOAD_BLOCK_PARTIALLY_PRESENT,
    PAYLOAD_BLOCK_ZERO,
};
use fsimage::vhdx::log::{append_entry, find_sequence, replay, LogCursor};
use fsimage::vhdx::VhdxFile;
use fsimage::Error;
use tempfile::tempdir;

fn params(virtual_size: u64) -> CreateParams {
    CreateParams {
        virtual_size,
        block_size: MB as u32,
        fast_mode: false,
        compress: false,
    }
}

/// Small deterministic generator so the write pattern is reproducible.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.0 >> 11
    }
}

#[test]
fn random_sector_writes_read_back() {
    // Last-writer-wins over a lot of random sector-aligned writes.
    let dir = tempdir().unwrap();
    let path = dir.path().join("rand.vhdx");

    let virtual_size = 8 * MB;
    let sectors = virtual_size / 512;
    let mut latest: HashMap<u64, u8> = HashMap::new();
    let mut rng = Lcg(0x5eed);

    {
        let mut vhdx = VhdxFile::create(&path, &params(virtual_size)).unwrap();
        for _ in 0..20_000 {
            let sector = rng.next() % sectors;
            let tag = (rng.next() & 0xFF) as u8;
            let buf = [tag; 512];
            vhdx.write_at(sector * 512, &buf).unwrap();
            latest.insert(sector, tag);
        }
        vhdx.sync().unwrap();
        vhdx.finish().unwrap();
    }

    let mut vhdx = VhdxFile::open(&path, true).unwrap();
    let mut buf = [0u8; 512];
    for (&sector, &tag) in &latest {
        vhdx.read_at(sector * 512, &mut buf).unwrap();
        assert!(
            buf.iter().all(|&b| b == tag),
            "sector {sector} lost its last write"
        );
    }
}

#[test]
fn fresh_container_reads_all_zero() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("zero.vhdx");
    let mut vhdx = VhdxFile::create(&path, &params(8 * MB)).unwrap();

    let mut buf = vec![0x55u8; 100_000];
    assert_eq!(vhdx.read_at(5 * MB - 77, &mut buf).unwrap(), 100_000);
    assert!(buf.iter().all(|&b| b == 0));
    vhdx.finish().unwrap();
}

#[test]
fn differencing_chain_and_partial_blocks() {
    let dir = tempdir().unwrap();
    let parent_path = dir.path().join("base.vhdx");
    let child_path = dir.path().join("incr.vhdx");

    {
        let mut parent = VhdxFile::create(&parent_path, &params(8 * MB)).unwrap();
        parent.write_at(0, b"parent data").unwrap();
        parent.write_at(3 * MB, &[0x99u8; 2048]).unwrap();
        parent.finish().unwrap();
    }

    {
        let mut child =
            VhdxFile::create_diff(&child_path, &parent_path, &CreateParams::default()).unwrap();
        child.write_at(3 * MB + 512, &[0x11u8; 512]).unwrap();
        child.finish().unwrap();
    }

    let mut child = VhdxFile::open(&child_path, true).unwrap();

    // Parent linkage recorded as the parent's data-write GUID.
    {
        let parent = VhdxFile::open(&parent_path, true).unwrap();
        assert_eq!(
            child.parent().unwrap().data_write_guid(),
            parent.data_write_guid()
        );
    }

    let mut buf = [0u8; 11];
    child.read_at(0, &mut buf).unwrap();
    assert_eq!(&buf, b"parent data");

    // Sector 1 of the touched block is the child's, its neighbours the
    // parent's.
    let mut buf = [0u8; 2048];
    child.read_at(3 * MB, &mut buf).unwrap();
    assert!(buf[..512].iter().all(|&b| b == 0x99));
    assert!(buf[512..1024].iter().all(|&b| b == 0x11));
    assert!(buf[1024..].iter().all(|&b| b == 0x99));
}

#[test]
fn partially_present_implies_bitmap_block_present() {
    let dir = tempdir().unwrap();
    let parent_path = dir.path().join("base.vhdx");
    let child_path = dir.path().join("incr.vhdx");

    {
        let mut parent = VhdxFile::create(&parent_path, &params(8 * MB)).unwrap();
        parent.write_at(0, &[1u8; 512]).unwrap();
        parent.finish().unwrap();
    }

    let mut child =
        VhdxFile::create_diff(&child_path, &parent_path, &CreateParams::default()).unwrap();
    child.write_at(2 * MB, &[2u8; 512]).unwrap();
    child.sync().unwrap();

    let entry = child.bat_entry(2);
    assert_eq!(entry.state(), PAYLOAD_BLOCK_PARTIALLY_PRESENT);
    let bitmap_entry = child.bitmap_bat_entry(2);
    assert_eq!(bitmap_entry.state(), PAYLOAD_BLOCK_FULLY_PRESENT);
    assert!(bitmap_entry.file_offset() > 0);
    child.finish().unwrap();
}

#[test]
fn header_rotation_keeps_one_valid_maximum() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("rot.vhdx");

    {
        let mut vhdx = VhdxFile::create(&path, &params(4 * MB)).unwrap();
        for i in 0..5u64 {
            vhdx.write_at(i * 512, &[i as u8 + 1; 512]).unwrap();
            vhdx.sync().unwrap();
        }
        vhdx.finish().unwrap();
    }

    let mut dev = FileDevice::open(&path, true).unwrap();
    let mut a = [0u8; HEADER_SIZE];
    dev.read_exact_at(HEADER1_OFFSET, &mut a).unwrap();
    let mut b = [0u8; HEADER_SIZE];
    dev.read_exact_at(HEADER2_OFFSET, &mut b).unwrap();

    let pa = VhdxHeader::parse(&a);
    let pb = VhdxHeader::parse(&b);
    // At least one header valid; if both, sequence numbers differ.
    match (pa, pb) {
        (Ok(ha), Ok(hb)) => {
            assert_ne!(ha.sequence_number, hb.sequence_number);
            let active = if ha.sequence_number > hb.sequence_number {
                ha
            } else {
                hb
            };
            assert_eq!(active.log_guid, [0u8; 16]);
        }
        (Ok(ha), Err(_)) => assert_eq!(ha.log_guid, [0u8; 16]),
        (Err(_), Ok(hb)) => assert_eq!(hb.log_guid, [0u8; 16]),
        (Err(_), Err(_)) => panic!("both headers invalid after clean finish"),
    }
}

#[test]
fn tampered_active_header_falls_back_to_other_slot() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("tamper.vhdx");

    {
        let mut vhdx = VhdxFile::create(&path, &params(4 * MB)).unwrap();
        vhdx.write_at(0, &[7u8; 512]).unwrap();
        vhdx.finish().unwrap();
    }

    // Flip one byte in each header in turn; a single bad slot must not kill
    // the container, two must.
    {
        use std::os::unix::fs::FileExt;
        let f = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        f.write_at(&[0xFF], HEADER1_OFFSET + 100).unwrap();

        let vhdx = VhdxFile::open(&path, true).unwrap();
        drop(vhdx);

        f.write_at(&[0xFF], HEADER2_OFFSET + 100).unwrap();
        match VhdxFile::open(&path, true) {
            Err(Error::Corrupt(_)) => {}
            other => panic!("expected Corrupt, got {other:?}", other = other.err()),
        }
    }
}

#[test]
fn trim_reduces_full_blocks_to_zero_state() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("trim.vhdx");

    let mut vhdx = VhdxFile::create(&path, &params(8 * MB)).unwrap();
    vhdx.write_at(MB, &[0xAAu8; 2 * MB as usize]).unwrap();
    assert_eq!(vhdx.bat_entry(1).state(), PAYLOAD_BLOCK_FULLY_PRESENT);

    vhdx.trim(MB, 2 * MB).unwrap();
    assert_eq!(vhdx.bat_entry(1).state(), PAYLOAD_BLOCK_ZERO);
    assert_eq!(vhdx.bat_entry(2).state(), PAYLOAD_BLOCK_FULLY_PRESENT);

    let mut buf = vec![0xEEu8; 4096];
    vhdx.read_at(MB, &mut buf).unwrap();
    assert!(buf.iter().all(|&b| b == 0));
    vhdx.read_at(2 * MB, &mut buf).unwrap();
    assert!(buf.iter().all(|&b| b == 0xAA));

    // Partial coverage of a fully-present block zeroes in place.
    vhdx.trim(2 * MB, 2 * MB + 4096).unwrap();
    assert_eq!(vhdx.bat_entry(2).state(), PAYLOAD_BLOCK_FULLY_PRESENT);
    vhdx.read_at(2 * MB, &mut buf).unwrap();
    assert!(buf.iter().all(|&b| b == 0));
    vhdx.finish().unwrap();
}

#[test]
fn unsynced_write_lost_after_truncation_but_consistent() {
    // Write without sync, then cut the file back to the end of the static
    // regions: the write was never journalled, so it reads as zero after a
    // clean reopen, and the container is consistent (no pending log).
    let dir = tempdir().unwrap();
    let path = dir.path().join("crash.vhdx");

    let static_end;
    {
        let mut vhdx = VhdxFile::create(&path, &params(8 * MB)).unwrap();
        static_end = 3 * MB + MB; // regions + 1 MiB BAT for this geometry
        vhdx.write_at(0, &[0xDDu8; 512]).unwrap();
        std::mem::forget(vhdx); // simulated crash: no sync, no finish
    }

    let f = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
    f.set_len(static_end).unwrap();
    drop(f);

    let mut vhdx = VhdxFile::open(&path, false).unwrap();
    let mut buf = [0u8; 512];
    vhdx.read_at(0, &mut buf).unwrap();
    assert_eq!(buf, [0u8; 512]);
    assert_eq!(vhdx.bat_entry(0).state(), PAYLOAD_BLOCK_NOT_PRESENT);
    vhdx.finish().unwrap();

    // After the clean finish the active header carries no log GUID.
    let mut dev = FileDevice::open(&path, true).unwrap();
    let mut a = [0u8; HEADER_SIZE];
    dev.read_exact_at(HEADER1_OFFSET, &mut a).unwrap();
    let mut b = [0u8; HEADER_SIZE];
    dev.read_exact_at(HEADER2_OFFSET, &mut b).unwrap();
    let active = [VhdxHeader::parse(&a).ok(), VhdxHeader::parse(&b).ok()]
        .into_iter()
        .flatten()
        .max_by_key(|h| h.sequence_number)
        .unwrap();
    assert_eq!(active.log_guid, [0u8; 16]);
}

#[test]
fn torn_bat_page_is_repaired_by_replay() {
    // sync() journals the BAT pages but leaves the log open.  Tearing the
    // on-disk BAT afterwards models a crash between the in-place BAT write
    // and the next rotation; replay on reopen must repair it.
    let dir = tempdir().unwrap();
    let path = dir.path().join("torn.vhdx");

    let bat_offset = 3 * MB;
    {
        let mut vhdx = VhdxFile::create(&path, &params(8 * MB)).unwrap();
        vhdx.write_at(2 * MB + 7, b"needs the BAT").unwrap();
        vhdx.sync().unwrap();
        std::mem::forget(vhdx); // crash before finish: log stays open
    }

    {
        use std::os::unix::fs::FileExt;
        let f = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        f.write_at(&[0u8; 4096], bat_offset).unwrap(); // tear the BAT page
    }

    // Read-only open must refuse the dirty container.
    match VhdxFile::open(&path, true) {
        Err(Error::ReadOnly(_)) => {}
        other => panic!("expected ReadOnly, got {:?}", other.err()),
    }

    let mut vhdx = VhdxFile::open(&path, false).unwrap();
    let mut buf = [0u8; 13];
    vhdx.read_at(2 * MB + 7, &mut buf).unwrap();
    assert_eq!(&buf, b"needs the BAT");
    vhdx.finish().unwrap();
}

#[test]
fn log_replay_is_idempotent() {
    // Drive the journal directly: two entries against a scratch device,
    // replayed twice, must give the same bytes and the same next sequence.
    let dir = tempdir().unwrap();
    let path = dir.path().join("log.bin");

    let mut dev = FileDevice::create(&path).unwrap();
    dev.resize(4 * MB, false).unwrap();

    let mut header = VhdxHeader::new();
    header.log_guid = [9u8; 16];

    let mut cursor = LogCursor::fresh(1);
    let payload_a = vec![0xA1u8; 4096];
    let payload_b = vec![0xB2u8; 4096];
    append_entry(&mut dev, &header, &mut cursor, 3 * MB, &payload_a, 4 * MB, 4 * MB).unwrap();
    append_entry(
        &mut dev,
        &header,
        &mut cursor,
        3 * MB + 4096,
        &payload_b,
        4 * MB,
        4 * MB,
    )
    .unwrap();

    let seq = find_sequence(&mut dev, &header).unwrap();
    assert_eq!(seq.offsets.len(), 2);
    assert_eq!(seq.max_sequence, 2);

    let next = replay(&mut dev, &header).unwrap();
    assert_eq!(next, 3);
    let mut first = vec![0u8; 8192];
    dev.read_exact_at(3 * MB, &mut first).unwrap();

    let next = replay(&mut dev, &header).unwrap();
    assert_eq!(next, 3);
    let mut second = vec![0u8; 8192];
    dev.read_exact_at(3 * MB, &mut second).unwrap();

    assert_eq!(first, second);
    assert!(first[..4096].iter().all(|&b| b == 0xA1));
    assert!(first[4096..].iter().all(|&b| b == 0xB2));
}

#[test]
fn tampered_log_entry_stops_the_sequence() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("logcut.bin");

    let mut dev = FileDevice::create(&path).unwrap();
    dev.resize(4 * MB, false).unwrap();

    let mut header = VhdxHeader::new();
    header.log_guid = [4u8; 16];

    let mut cursor = LogCursor::fresh(10);
    for i in 0..3u64 {
        let payload = vec![i as u8 + 1; 4096];
        append_entry(
            &mut dev,
            &header,
            &mut cursor,
            3 * MB + i * 4096,
            &payload,
            4 * MB,
            4 * MB,
        )
        .unwrap();
    }

    // Corrupt the second entry (each entry is 2 sectors here).
    let second_entry = header.log_offset + 2 * 4096;
    dev.write_all_at(second_entry + 100, &[0xFF]).unwrap();

    let seq = find_sequence(&mut dev, &header).unwrap();
    assert_eq!(seq.offsets.len(), 1, "sequence must stop at the torn entry");
    assert_eq!(seq.max_sequence, 10);
}

#[test]
fn bat_entry_packing_survives_container_roundtrip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("pack.vhdx");

    {
        let mut vhdx = VhdxFile::create(&path, &params(8 * MB)).unwrap();
        vhdx.write_at(7 * MB, &[0x42u8; 512]).unwrap();
        vhdx.finish().unwrap();
    }

    let vhdx = VhdxFile::open(&path, true).unwrap();
    let entry: BatEntry = vhdx.bat_entry(7);
    assert_eq!(entry.state(), PAYLOAD_BLOCK_FULLY_PRESENT);
    assert_eq!(entry.file_offset() % MB, 0);
    assert!(entry.file_offset() >= 4 * MB);
}
