//! Error taxonomy for key/IV cache operations.

use std::io;
use std::path::Path;

use thiserror::Error;

/// Top-level error type for key/IV cache operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Caller supplied an unusable argument (empty password, bad strength).
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Readiness gate or retry budget was exhausted.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The process may not read or write a path.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Persisted data could not be unprotected or deserialized.
    #[error("Corrupt or unprotectable data: {0}")]
    Corrupt(String),

    /// Transient I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Cryptographic operation failed.
    #[error("Cryptographic error: {0}")]
    Crypto(String),
}

impl Error {
    /// Classify an I/O error raised while touching `path`.
    ///
    /// Permission failures become [`Error::PermissionDenied`] so callers can
    /// fall back; everything else stays a transient [`Error::Io`].
    pub fn from_io(err: io::Error, path: &Path) -> Self {
        match err.kind() {
            io::ErrorKind::PermissionDenied => {
                Error::PermissionDenied(format!("{}: {}", path.display(), err))
            }
            _ => Error::Io(err),
        }
    }

    /// Whether the failed operation may succeed if attempted again.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Io(_))
    }

    /// Whether this error reports denied access.
    pub fn is_permission_denied(&self) -> bool {
        match self {
            Error::PermissionDenied(_) => true,
            Error::Io(err) => err.kind() == io::ErrorKind::PermissionDenied,
            _ => false,
        }
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
