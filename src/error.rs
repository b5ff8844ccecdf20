//! Error types for range locking.

use std::io;

use thiserror::Error;

/// Failure to acquire or release a range lock.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// The host OS family has no range lock backend. Raised before any
    /// native call is made.
    #[error("range locks are not supported on {os}")]
    PlatformUnsupported { os: &'static str },

    /// The OS rejected a lock or unlock request. `code` is the raw OS error
    /// number (`errno` on Linux, `GetLastError` on Windows).
    #[error("range lock request failed (os error {code})")]
    Lock { code: i32 },
}

/// Result type alias for range lock operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// The OS error number, if the OS reported one.
    #[inline]
    pub fn code(&self) -> Option<i32> {
        match *self {
            Error::Lock { code } => Some(code),
            Error::PlatformUnsupported { .. } => None,
        }
    }

    #[inline]
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Error::PlatformUnsupported { .. })
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::Lock {
            code: err.raw_os_error().unwrap_or_default(),
        }
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> io::Error {
        match err {
            Error::Lock { code } => io::Error::from_raw_os_error(code),
            Error::PlatformUnsupported { .. } => io::Error::new(io::ErrorKind::Unsupported, err),
        }
    }
}
