//! # fsimage — sparse virtual-disk image engine
//!
//! Engine guarantees (frozen on disk):
//! - ContainerV1 is the Microsoft-compatible fixed-block sparse format:
//!   big-endian fields, summed-byte checksums, duplicate footer, per-block
//!   MSB-first sector bitmaps, parent chains by uid + timestamp
//! - ContainerV2 is the log-journalled format: little-endian fields,
//!   CRC-32C on every integrity field, dual rotated headers, tri-state BAT,
//!   LSB-first chunk sector bitmaps, parent chains by data-write GUID
//! - ContainerV3 is the raw copy-on-write format: a plain sparse file of
//!   the full virtual size plus an MSB-first sidecar bitmap; differencing
//!   is delegated to filesystem snapshots of the raw file
//! - While a ContainerV2 header carries a non-zero log GUID the file is
//!   dirty; only log replay followed by a header rotation clears it, and a
//!   read-only open of a dirty file is refused
//! - A write is durable only after a full sync: sector bitmaps flushed,
//!   dirty BAT pages journalled and written, backing file synced, header
//!   rotated with a zero log GUID
//! - The engine never deletes backups; retention is the caller's job
//!
//! The crate is the storage core of a client/server image backup system:
//! the backup session ([`backup::ImageBackup`]) streams client blocks into
//! a container, verifies per-chunk SHA-256 checksums against the client's
//! records, and leaves behind the `.hash`/`.cbitmap`/`.mbr`/`.sync`
//! artefacts the surrounding pipeline expects.  [`mount::MountServer`]
//! exports any finished container read-only for browsing.

pub mod backup;
pub mod bitmap;
pub mod compressed;
pub mod container;
pub mod cow;
pub mod device;
pub mod error;
pub mod fs;
pub mod mount;
pub mod progress;
pub mod vhd;
pub mod vhdx;

// Flat re-exports for the most common types.
pub use backup::{BackupConfig, BackupSummary, ImageBackup, ImageSource};
pub use bitmap::{BitmapView, BitmapViewMut, LsbFirst, MsbFirst};
pub use compressed::{is_compressed, CompressedFile, COMPRESSED_MAGIC};
pub use container::{CreateParams, ImageContainer, ImageFormat, MakeFullSink, NullSink};
pub use cow::RawCowFile;
pub use device::{BlockDevice, FileDevice, VolumeView};
pub use error::{Error, Result};
pub use fs::{ClientBitmap, FilesystemSource, FsNtfs, FsUnknown};
pub use mount::{MountClient, MountServer};
pub use progress::{CancelToken, NullProgress, ProgressListener};
pub use vhd::VhdFile;
pub use vhdx::VhdxFile;
