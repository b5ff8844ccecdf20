//! Blocking, exclusive, advisory locks on a byte range of an open file.
//!
//! On Linux the lock is an open file description lock (`F_OFD_SETLKW`); on
//! Windows it is an overlapped `LockFileEx` request. Both are advisory: they
//! only exclude other callers that also ask for a lock.
//!
//! # Examples
//!
//! ```
//! use std::io::{Seek, SeekFrom, Write};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let file = tempfile::tempfile()?;
//!
//! let _lock = range_lock::lock(&file, 1, 1)?;
//! let mut f = &file;
//! f.seek(SeekFrom::Start(1))?;
//! f.write_all(b"A")?;
//! // the range will be unlocked when the lock goes out of scope
//! # Ok(())
//! # }
//! ```
//!
//! Release can also be explicit, which surfaces the unlock result instead of
//! leaving it to `Drop`:
//!
//! ```
//! use range_lock::RangeLock;
//!
//! # fn main() -> Result<(), range_lock::Error> {
//! let file = tempfile::tempfile().expect("scratch file");
//!
//! let lock = RangeLock::new(&file, 0, 64)?;
//! assert!(lock.is_locked());
//! assert_eq!(lock.range(), 0..64);
//! lock.unlock()?;
//! # Ok(())
//! # }
//! ```
//!
//! Anything that can `Deref` to a file can be locked. This works with
//! `Arc<File>`, so the lock can move to another thread:
//!
//! ```
//! use range_lock::RangeLock;
//! use std::fs::File;
//! use std::sync::Arc;
//! use std::thread;
//!
//! # fn main() -> Result<(), range_lock::Error> {
//! let file = Arc::new(tempfile::tempfile().expect("scratch file"));
//!
//! let lock: RangeLock<Arc<File>> = range_lock::lock(file.clone(), 0, 8)?;
//! thread::spawn(move || drop(lock)).join().expect("unlocking thread");
//!
//! // free again
//! assert!(range_lock::try_lock(file, 0, 8)?.is_some());
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::fs::File;
use std::ops::{Deref, Range};

mod error;
mod platform;

cfg_if::cfg_if! {
    if #[cfg(windows)] {
        mod windows;
    } else if #[cfg(target_os = "linux")] {
        mod linux;
    } else {
        // No backend; every request fails with `PlatformUnsupported`
    }
}

pub use self::error::{Error, Result};
pub use self::platform::Platform;

use self::platform::{Backend, LockBackend};

/// A contiguous half-open span `[start, start + len)` of file offsets.
///
/// Neither field is validated; the OS decides what a negative start or a
/// zero length means.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct ByteRange {
    pub start: i64,
    pub len: i64,
}

impl ByteRange {
    #[inline]
    pub fn new(start: i64, len: i64) -> ByteRange {
        ByteRange { start, len }
    }

    /// One past the last byte, saturating at `i64::MAX`.
    #[inline]
    pub fn end(&self) -> i64 {
        self.start.saturating_add(self.len)
    }
}

impl From<ByteRange> for Range<i64> {
    fn from(range: ByteRange) -> Range<i64> {
        range.start..range.end()
    }
}

/// Locks `[start, start + len)` of `file`, blocking until the range is free.
///
/// Shorthand for [`RangeLock::new`].
pub fn lock<T: Deref<Target = File>>(file: T, start: i64, len: i64) -> Result<RangeLock<T>> {
    RangeLock::new(file, start, len)
}

/// Makes one non-blocking attempt to lock `[start, start + len)` of `file`.
///
/// Returns `Ok(None)` when another holder has an overlapping range.
pub fn try_lock<T: Deref<Target = File>>(
    file: T,
    start: i64,
    len: i64,
) -> Result<Option<RangeLock<T>>> {
    RangeLock::try_with_platform(Platform::current(), file, ByteRange::new(start, len))
}

/// An exclusive lock on a byte range, released when dropped.
///
/// The file is borrowed through `T` for as long as the lock lives. Release
/// happens at most once: either through [`release`](RangeLock::release) /
/// [`unlock`](RangeLock::unlock), or from `Drop` if neither was called.
#[must_use = "if unused the range lock will immediately unlock"]
pub struct RangeLock<T: Deref<Target = File>> {
    range: ByteRange,
    backend: Backend,
    file: T,
}

impl<T> fmt::Debug for RangeLock<T>
where
    T: Deref<Target = File>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RangeLock({}, {})", self.range.start, self.range.len)
    }
}

impl<T> RangeLock<T>
where
    T: Deref<Target = File>,
{
    /// Locks `[start, start + len)` of `file` on the host platform.
    ///
    /// Blocks the calling thread until the OS grants the lock or reports an
    /// error. There is no timeout.
    pub fn new(file: T, start: i64, len: i64) -> Result<Self> {
        Self::with_platform(Platform::current(), file, start, len)
    }

    /// Like [`new`](RangeLock::new), but dispatches on `platform` instead of
    /// the host. A platform with no backend in this build fails with
    /// [`Error::PlatformUnsupported`] before any native call.
    pub fn with_platform(platform: Platform, file: T, start: i64, len: i64) -> Result<Self> {
        let range = ByteRange::new(start, len);
        let mut backend = Backend::select(platform, &file)?;
        backend.lock(range, true)?;
        Ok(RangeLock {
            range,
            backend,
            file,
        })
    }

    fn try_with_platform(platform: Platform, file: T, range: ByteRange) -> Result<Option<Self>> {
        let mut backend = Backend::select(platform, &file)?;
        if !backend.lock(range, false)? {
            tracing::debug!(%platform, ?range, "range is held elsewhere");
            return Ok(None);
        }
        Ok(Some(RangeLock {
            range,
            backend,
            file,
        }))
    }

    /// Releases the range. Calls after the first, and the eventual drop,
    /// do nothing.
    pub fn release(&mut self) -> Result<()> {
        self.backend.unlock()
    }

    /// Releases the range and gives up the guard.
    pub fn unlock(mut self) -> Result<()> {
        self.release()
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.backend.is_locked()
    }

    #[inline]
    pub fn platform(&self) -> Platform {
        self.backend.platform()
    }

    #[inline]
    pub fn byte_range(&self) -> ByteRange {
        self.range
    }

    #[inline]
    pub fn range(&self) -> Range<i64> {
        self.range.into()
    }

    #[inline]
    pub fn start(&self) -> i64 {
        self.range.start
    }

    #[inline]
    pub fn len(&self) -> i64 {
        self.range.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.range.len == 0
    }
}

impl<T> Deref for RangeLock<T>
where
    T: Deref<Target = File>,
{
    type Target = T;

    fn deref(&self) -> &T {
        &self.file
    }
}

impl<T> Drop for RangeLock<T>
where
    T: Deref<Target = File>,
{
    fn drop(&mut self) {
        if let Err(err) = self.backend.unlock() {
            tracing::warn!(range = ?self.range, %err, "failed to release range lock on drop");
        }
    }
}
