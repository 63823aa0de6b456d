//! Crate-wide error type.
//!
//! Torn on-disk states are recovered locally (duplicate footer, header
//! rotation, log replay) and never surface here.  Checksum failures on read
//! are fatal to that call: the engine never substitutes data from an
//! unverified source.

use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Underlying read/write/resize/sync failure, with the OS error attached.
    #[error("I/O error: {context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: io::Error,
    },

    /// Signature or checksum mismatch that cannot be repaired — both headers
    /// bad, unreadable BAT, invalid region table, bad magic.
    #[error("corrupt container: {0}")]
    Corrupt(String),

    /// Log entries exist but cannot be applied.
    #[error("log replay failed: {0}")]
    LogReplayFailed(String),

    /// Parent link GUID disagrees with the actual parent.
    #[error("parent link mismatch: expected {expected}, found {found}")]
    ParentMismatch { expected: String, found: String },

    /// Parent file cannot be found at any recorded path.
    #[error("parent container not found (tried {0:?})")]
    ParentMissing(Vec<String>),

    /// Caller request crosses the virtual size.
    #[error("request at {pos}+{len} crosses virtual size {virtual_size}")]
    OutOfRange {
        pos: u64,
        len: u64,
        virtual_size: u64,
    },

    /// Write attempted on a read-only handle, including when a pending log
    /// would have to be replayed first.
    #[error("container is read-only: {0}")]
    ReadOnly(&'static str),

    /// Ingress SHA-256 verification failed past the retry budget.
    #[error("stream checksum verification failed at block {block}")]
    StreamChecksum { block: i64 },

    /// Collaborator requested stop.
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    pub(crate) fn io(context: &'static str, source: io::Error) -> Self {
        Error::Io { context, source }
    }

    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        Error::Corrupt(msg.into())
    }
}

impl From<io::Error> for Error {
    fn from(source: io::Error) -> Self {
        Error::Io {
            context: "file operation",
            source,
        }
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io { source, .. } => source,
            other => io::Error::new(io::ErrorKind::Other, other.to_string()),
        }
    }
}
