//! Read-only export of a container over a local endpoint.
//!
//! The OS image-mount service connects and speaks a minimal request/response
//! protocol; every worker connection owns its own read-only container
//! handle, so concurrent readers never share engine state.
//!
//! # Wire protocol (little-endian)
//!
//! ```text
//! request:  code u32          1 = Info, 2 = Read, 3 = Close
//!   Read:   offset u64, length u32   (length capped at 32 MiB)
//!
//! response (Info):  size u64, sector_size u32, flags u32 (bit 0 = read-only)
//! response (Read):  status u32 (0 = ok), length u32, payload
//! ```
//!
//! Short reads at the end of the device return the clamped length; reads
//! past the end return a zero-length payload.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::thread;

use log::{debug, info, warn};

use crate::container::{self, ImageContainer};
use crate::error::{Error, Result};

pub const REQ_INFO: u32 = 1;
pub const REQ_READ: u32 = 2;
pub const REQ_CLOSE: u32 = 3;

pub const INFO_FLAG_READ_ONLY: u32 = 0x1;

/// Largest single read a client may request.
pub const MAX_READ_LEN: u32 = 32 * 1024 * 1024;

pub struct MountServer {
    container_path: PathBuf,
    sector_size: u32,
    listener: TcpListener,
}

impl MountServer {
    /// Bind a local endpoint for `container_path`.  The container is opened
    /// once here to validate it and learn its sector size; each connection
    /// re-opens its own handle.
    pub fn bind(container_path: &Path, addr: SocketAddr) -> Result<Self> {
        let mut probe = container::open(container_path, true)?;
        let sector_size = probe_sector_size(container_path);
        probe.finish()?;

        let listener =
            TcpListener::bind(addr).map_err(|e| Error::io("bind mount endpoint", e))?;
        info!(
            "serving \"{}\" read-only at {}",
            container_path.display(),
            listener.local_addr().map_err(|e| Error::io("local addr", e))?
        );

        Ok(Self {
            container_path: container_path.to_owned(),
            sector_size,
            listener,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| Error::io("local addr", e))
    }

    /// Accept and serve connections until `limit` connections completed
    /// (`None` = forever).  Each connection runs on its own thread with its
    /// own container handle.
    pub fn serve(&self, limit: Option<usize>) -> Result<()> {
        let mut served = 0usize;
        let mut workers = Vec::new();

        while limit.map_or(true, |l| served < l) {
            let (stream, peer) = self
                .listener
                .accept()
                .map_err(|e| Error::io("accept mount connection", e))?;
            debug!("mount connection from {peer}");
            served += 1;

            let path = self.container_path.clone();
            let sector_size = self.sector_size;
            workers.push(thread::spawn(move || {
                if let Err(e) = serve_connection(stream, &path, sector_size) {
                    warn!("mount worker ended with error: {e}");
                }
            }));
        }

        for w in workers {
            let _ = w.join();
        }
        Ok(())
    }
}

fn probe_sector_size(path: &Path) -> u32 {
    match crate::container::ImageFormat::from_path(path) {
        Some(crate::container::ImageFormat::Vhdx) => {
            match crate::vhdx::VhdxFile::open(path, true) {
                Ok(f) => f.sector_size(),
                Err(_) => 512,
            }
        }
        _ => 512,
    }
}

fn serve_connection(mut stream: TcpStream, path: &Path, sector_size: u32) -> Result<()> {
    let mut cont = container::open(path, true)?;
    let size = cont.virtual_size();

    loop {
        let mut code_buf = [0u8; 4];
        match stream.read_exact(&mut code_buf) {
            Ok(()) => {}
            Err(_) => break, // peer closed
        }

        match u32::from_le_bytes(code_buf) {
            REQ_INFO => {
                let mut resp = [0u8; 16];
                resp[0..8].copy_from_slice(&size.to_le_bytes());
                resp[8..12].copy_from_slice(&sector_size.to_le_bytes());
                resp[12..16].copy_from_slice(&INFO_FLAG_READ_ONLY.to_le_bytes());
                stream
                    .write_all(&resp)
                    .map_err(|e| Error::io("write info response", e))?;
            }
            REQ_READ => {
                let mut req = [0u8; 12];
                stream
                    .read_exact(&mut req)
                    .map_err(|e| Error::io("read read-request body", e))?;
                let offset = u64::from_le_bytes(req[0..8].try_into().unwrap());
                let length = u32::from_le_bytes(req[8..12].try_into().unwrap());

                if length > MAX_READ_LEN {
                    stream
                        .write_all(&1u32.to_le_bytes())
                        .map_err(|e| Error::io("write read status", e))?;
                    stream
                        .write_all(&0u32.to_le_bytes())
                        .map_err(|e| Error::io("write read length", e))?;
                    continue;
                }

                let want = (length as u64).min(size.saturating_sub(offset)) as usize;
                let mut data = vec![0u8; want];
                let mut status = 0u32;
                let mut got = 0usize;
                while got < want {
                    match cont.read_at(offset + got as u64, &mut data[got..]) {
                        Ok(0) => break,
                        Ok(n) => got += n,
                        Err(e) => {
                            warn!("mount read at {offset} failed: {e}");
                            status = 1;
                            break;
                        }
                    }
                }
                data.truncate(got);

                stream
                    .write_all(&status.to_le_bytes())
                    .map_err(|e| Error::io("write read status", e))?;
                stream
                    .write_all(&(data.len() as u32).to_le_bytes())
                    .map_err(|e| Error::io("write read length", e))?;
                stream
                    .write_all(&data)
                    .map_err(|e| Error::io("write read payload", e))?;
            }
            REQ_CLOSE => break,
            other => {
                warn!("unknown mount request code {other}");
                break;
            }
        }
    }

    cont.finish()?;
    Ok(())
}

/// Client-side convenience used by the mount service integration (and the
/// tests): fetch size/sector-size, then read a range.
pub struct MountClient {
    stream: TcpStream,
}

impl MountClient {
    pub fn connect(addr: SocketAddr) -> Result<Self> {
        let stream =
            TcpStream::connect(addr).map_err(|e| Error::io("connect to mount endpoint", e))?;
        Ok(Self { stream })
    }

    pub fn info(&mut self) -> Result<(u64, u32, u32)> {
        self.stream
            .write_all(&REQ_INFO.to_le_bytes())
            .map_err(|e| Error::io("send info request", e))?;
        let mut resp = [0u8; 16];
        self.stream
            .read_exact(&mut resp)
            .map_err(|e| Error::io("read info response", e))?;
        Ok((
            u64::from_le_bytes(resp[0..8].try_into().unwrap()),
            u32::from_le_bytes(resp[8..12].try_into().unwrap()),
            u32::from_le_bytes(resp[12..16].try_into().unwrap()),
        ))
    }

    pub fn read(&mut self, offset: u64, length: u32) -> Result<Vec<u8>> {
        let mut req = [0u8; 16];
        req[0..4].copy_from_slice(&REQ_READ.to_le_bytes());
        req[4..12].copy_from_slice(&offset.to_le_bytes());
        req[12..16].copy_from_slice(&length.to_le_bytes());
        self.stream
            .write_all(&req)
            .map_err(|e| Error::io("send read request", e))?;

        let mut head = [0u8; 8];
        self.stream
            .read_exact(&mut head)
            .map_err(|e| Error::io("read read-response head", e))?;
        let status = u32::from_le_bytes(head[0..4].try_into().unwrap());
        let len = u32::from_le_bytes(head[4..8].try_into().unwrap());
        if status != 0 {
            return Err(Error::corrupt(format!("mount server read error {status}")));
        }

        let mut data = vec![0u8; len as usize];
        self.stream
            .read_exact(&mut data)
            .map_err(|e| Error::io("read read-response payload", e))?;
        Ok(data)
    }

    pub fn close(mut self) -> Result<()> {
        self.stream
            .write_all(&REQ_CLOSE.to_le_bytes())
            .map_err(|e| Error::io("send close request", e))
    }
}
