//! # Error Taxonomy
//!
//! A single `thiserror`-derived enum, a `Result` alias, and `From` impls at
//! every boundary that produces an error this crate didn't define itself.
//! The categories follow §7 directly — each FUSE callback converts a
//! `WimError` to a `libc::c_int` at the last moment via the terminal
//! `impl From<WimError> for i32` below.

use std::io;

pub type WimResult<R> = Result<R, WimError>;

/// Errors that can occur while servicing a mounted WIM image.
///
/// Every error carries at least a category tag, per §7; no error is silently
/// swallowed. The `Staging` variant additionally carries a `secondary` error:
/// design note (c) in §9 flags that a staging-file `close` failure occurring
/// right after a failed `write` must not be conflated with the original
/// write error, so both are kept.
#[derive(Debug, thiserror::Error)]
pub enum WimError {
    #[error("no such file or directory")]
    NotFound,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("directory not empty")]
    NotEmpty,
    #[error("file exists")]
    Exists,
    #[error("permission denied")]
    Permission,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("offset beyond end of file")]
    Overflow,
    #[error("out of memory")]
    OutOfMemory,
    #[error("staging I/O error: {source}")]
    Staging {
        #[source]
        source: io::Error,
        secondary: Option<io::Error>,
    },
    #[error("archive read/decompression error: {0}")]
    ArchiveRead(String),
    #[error("commit failed: {0}")]
    Commit(String),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("broken invariant: {0}")]
    Invariant(String),
}

/// Unmount-handshake failures (§6, §7): both sides of the two-process commit
/// handshake must be able to distinguish *why* the protocol failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("failed to open or create a message queue")]
    Queue,
    #[error("failed to fork the unmount driver")]
    Fork,
    #[error("the `fusermount`/`umount` command failed")]
    Fusermount,
    #[error("timed out waiting for the peer")]
    Timeout,
}

impl WimError {
    pub fn staging(source: io::Error) -> Self {
        WimError::Staging {
            source,
            secondary: None,
        }
    }

    pub fn staging_with_secondary(source: io::Error, secondary: io::Error) -> Self {
        WimError::Staging {
            source,
            secondary: Some(secondary),
        }
    }
}

impl From<io::Error> for WimError {
    fn from(e: io::Error) -> Self {
        WimError::staging(e)
    }
}

/// Maps a `WimError` onto the `libc` errno `FilesystemMT` callbacks must
/// return. This is the single place that performs that translation, so the
/// front-end never constructs a raw `libc::c_int` itself.
impl From<WimError> for libc::c_int {
    fn from(e: WimError) -> Self {
        match e {
            WimError::NotFound => libc::ENOENT,
            WimError::NotADirectory => libc::ENOTDIR,
            WimError::IsADirectory => libc::EISDIR,
            WimError::NotEmpty => libc::ENOTEMPTY,
            WimError::Exists => libc::EEXIST,
            WimError::Permission => libc::EACCES,
            WimError::InvalidArgument => libc::EINVAL,
            WimError::Overflow => libc::EOVERFLOW,
            WimError::OutOfMemory => libc::ENOMEM,
            WimError::Staging { source, .. } => source.raw_os_error().unwrap_or(libc::EIO),
            WimError::ArchiveRead(_) => libc::EIO,
            WimError::Commit(_) => libc::EIO,
            WimError::Protocol(_) => libc::EPROTO,
            WimError::Invariant(_) => libc::EIO,
        }
    }
}
