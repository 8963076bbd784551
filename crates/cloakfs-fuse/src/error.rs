//! Error handling and errno mapping for the VFS layer.
//!
//! Callbacks are implemented against [`FsResult`]; the trait boundary
//! converts to the negative errno channel the multiplexer expects via
//! [`FsError::to_errno`]. Backing-store errors propagate their errno
//! verbatim; errors with no OS code collapse to `EIO`.

use std::io;

use cloakfs_core::{CryptoError, KeyServiceError};
use libc::c_int;
use thiserror::Error;

use crate::paths::PathError;

/// Errors a filesystem callback can produce.
#[derive(Error, Debug)]
pub enum FsError {
    /// Path translation failed before any syscall was attempted.
    #[error("path translation failed: {0}")]
    Path(#[from] PathError),

    /// A syscall on the backing store failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The cipher reported a fault.
    #[error("cipher failure: {0}")]
    Crypto(#[from] CryptoError),

    /// The file key could not be obtained.
    #[error("file key unavailable: {0}")]
    Key(#[from] KeyServiceError),

    /// The multiplexer handed back an unknown file handle.
    #[error("invalid file handle: {0}")]
    InvalidHandle(u64),
}

impl FsError {
    /// Converts this error to the errno reported to the multiplexer.
    pub fn to_errno(&self) -> c_int {
        match self {
            FsError::Path(e) => e.to_errno(),
            FsError::Io(e) => io_error_to_errno(e),
            FsError::Crypto(CryptoError::Io(e)) => io_error_to_errno(e),
            FsError::Crypto(_) => libc::EIO,
            FsError::Key(_) => libc::EACCES,
            FsError::InvalidHandle(_) => libc::EBADF,
        }
    }
}

/// Maps an `io::Error` to its errno, defaulting to `EIO` when the error
/// carries no OS code.
pub fn io_error_to_errno(e: &io::Error) -> c_int {
    e.raw_os_error().unwrap_or(libc::EIO)
}

/// Result type for filesystem callbacks.
pub type FsResult<T> = Result<T, FsError>;
