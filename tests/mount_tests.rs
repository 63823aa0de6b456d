//! Mount server protocol test: export a finished container read-only and
//! read it back over the local endpoint.

use std::net::{Ipv4Addr, SocketAddr};
use std::thread;

use fsimage::container::{CreateParams, ImageContainer};
use fsimage::mount::{MountClient, MountServer, INFO_FLAG_READ_ONLY};
use fsimage::VhdFile;
use tempfile::tempdir;

const MIB: u64 = 1024 * 1024;

#[test]
fn info_and_range_reads_over_the_wire() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("export.vhd");

    {
        let mut vhd = VhdFile::create(
            &path,
            &CreateParams {
                virtual_size: 4 * MIB,
                block_size: MIB as u32,
                fast_mode: false,
                compress: false,
            },
        )
        .unwrap();
        vhd.write_at(MIB, b"browsable bytes").unwrap();
        vhd.finish().unwrap();
    }

    let server =
        MountServer::bind(&path, SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).unwrap();
    let addr = server.local_addr().unwrap();
    let serving = thread::spawn(move || server.serve(Some(1)));

    let mut client = MountClient::connect(addr).unwrap();

    let (size, sector_size, flags) = client.info().unwrap();
    assert_eq!(size, 4 * MIB);
    assert_eq!(sector_size, 512);
    assert_eq!(flags & INFO_FLAG_READ_ONLY, INFO_FLAG_READ_ONLY);

    let data = client.read(MIB, 15).unwrap();
    assert_eq!(&data, b"browsable bytes");

    // Sparse range reads as zeros; reads past the end are clamped.
    let data = client.read(2 * MIB, 4096).unwrap();
    assert!(data.iter().all(|&b| b == 0));
    let data = client.read(4 * MIB - 4, 4096).unwrap();
    assert_eq!(data.len(), 4);

    client.close().unwrap();
    serving.join().unwrap().unwrap();
}
