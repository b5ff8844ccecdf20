//! Selects the native backend for the host OS family.
//!
//! Selection happens once, when a [`RangeLock`](crate::RangeLock) is built.
//! The chosen [`Backend`] is stored in the guard and never re-checked.

use std::fmt;
use std::fs::File;

use crate::error::{Error, Result};
use crate::ByteRange;

#[cfg(target_os = "linux")]
use crate::linux::OfdLock;
#[cfg(windows)]
use crate::windows::OverlappedLock;

/// OS family a range lock is requested for.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Platform {
    Linux,
    Windows,
    /// Any other family, carrying its name as reported by the OS.
    Unsupported(&'static str),
}

impl Platform {
    /// The OS family of the running host.
    #[inline]
    pub fn current() -> Platform {
        Platform::from_os(std::env::consts::OS)
    }

    /// Maps an OS family name (as in `std::env::consts::OS`) to a platform.
    pub fn from_os(os: &'static str) -> Platform {
        match os {
            "linux" => Platform::Linux,
            "windows" => Platform::Windows,
            other => Platform::Unsupported(other),
        }
    }

    pub fn name(&self) -> &'static str {
        match *self {
            Platform::Linux => "linux",
            Platform::Windows => "windows",
            Platform::Unsupported(os) => os,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Capability shared by the native backends.
///
/// State machine: unlocked, then locked, then released. `unlock` on a
/// backend that is not holding a lock does nothing and succeeds.
pub(crate) trait LockBackend {
    /// Requests an exclusive lock on `range`. With `wait` the call blocks
    /// until the OS grants or rejects it. Without `wait` a contended range
    /// returns `Ok(false)`.
    fn lock(&mut self, range: ByteRange, wait: bool) -> Result<bool>;

    /// Releases the held range, at most once.
    fn unlock(&mut self) -> Result<()>;

    fn is_locked(&self) -> bool;
}

/// The backends compiled into this build.
#[derive(Debug)]
pub(crate) enum Backend {
    #[cfg(target_os = "linux")]
    Linux(OfdLock),
    #[cfg(windows)]
    Windows(OverlappedLock),
}

impl Backend {
    /// Builds an unlocked backend for `platform` over `file`.
    #[cfg_attr(not(any(target_os = "linux", windows)), allow(unused_variables))]
    pub(crate) fn select(platform: Platform, file: &File) -> Result<Backend> {
        match platform {
            #[cfg(target_os = "linux")]
            Platform::Linux => {
                use std::os::unix::io::AsRawFd;
                Ok(Backend::Linux(OfdLock::new(file.as_raw_fd())))
            }
            #[cfg(windows)]
            Platform::Windows => {
                use std::os::windows::io::AsRawHandle;
                Ok(Backend::Windows(OverlappedLock::new(file.as_raw_handle())))
            }
            other => Err(Error::PlatformUnsupported { os: other.name() }),
        }
    }

    pub(crate) fn platform(&self) -> Platform {
        match *self {
            #[cfg(target_os = "linux")]
            Backend::Linux(_) => Platform::Linux,
            #[cfg(windows)]
            Backend::Windows(_) => Platform::Windows,
        }
    }
}

impl LockBackend for Backend {
    fn lock(&mut self, range: ByteRange, wait: bool) -> Result<bool> {
        match *self {
            #[cfg(target_os = "linux")]
            Backend::Linux(ref mut lock) => lock.lock(range, wait),
            #[cfg(windows)]
            Backend::Windows(ref mut lock) => lock.lock(range, wait),
        }
    }

    fn unlock(&mut self) -> Result<()> {
        match *self {
            #[cfg(target_os = "linux")]
            Backend::Linux(ref mut lock) => lock.unlock(),
            #[cfg(windows)]
            Backend::Windows(ref mut lock) => lock.unlock(),
        }
    }

    fn is_locked(&self) -> bool {
        match *self {
            #[cfg(target_os = "linux")]
            Backend::Linux(ref lock) => lock.is_locked(),
            #[cfg(windows)]
            Backend::Windows(ref lock) => lock.is_locked(),
        }
    }
}
