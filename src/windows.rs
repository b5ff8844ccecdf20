//! Overlapped `LockFileEx` range locks.
//!
//! A lock request carries a manual-reset event in its `OVERLAPPED`. When the
//! request is queued behind another holder the call returns
//! `ERROR_IO_PENDING` and the calling thread waits on the event until the OS
//! grants the range. There is no way to cancel that wait.

use std::io::{self, Error as IoError};
use std::mem::MaybeUninit;
use std::os::windows::io::RawHandle;
use std::ptr;

use winapi::shared::minwindef::{DWORD, FALSE, TRUE};
use winapi::shared::winerror::{ERROR_IO_PENDING, ERROR_LOCK_VIOLATION};
use winapi::um::fileapi::{LockFileEx, UnlockFileEx};
use winapi::um::handleapi::CloseHandle;
use winapi::um::ioapiset::{CancelIoEx, GetOverlappedResult};
use winapi::um::minwinbase::{LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY, OVERLAPPED};
use winapi::um::synchapi::{CreateEventW, ResetEvent, WaitForSingleObject};
use winapi::um::winbase::{INFINITE, WAIT_OBJECT_0};
use winapi::um::winnt::HANDLE;

use crate::error::Result;
use crate::platform::LockBackend;
use crate::ByteRange;

/// Splits a 64-bit value into its low and high 32-bit halves.
#[inline]
fn split(value: i64) -> (DWORD, DWORD) {
    let value = value as u64;
    ((value & 0xffffffff) as DWORD, (value >> 32) as DWORD)
}

fn overlapped_at(start: i64) -> OVERLAPPED {
    let mut ov: OVERLAPPED = unsafe { MaybeUninit::zeroed().assume_init() };
    let (low, high) = split(start);
    let s = unsafe { ov.u.s_mut() };
    s.Offset = low;
    s.OffsetHigh = high;
    ov
}

/// Owned manual-reset event, closed on drop.
struct Event(HANDLE);

impl Event {
    fn manual_reset() -> io::Result<Event> {
        let handle = unsafe { CreateEventW(ptr::null_mut(), TRUE, FALSE, ptr::null()) };
        if handle.is_null() {
            Err(IoError::last_os_error())
        } else {
            Ok(Event(handle))
        }
    }

    fn wait(&self) -> io::Result<()> {
        match unsafe { WaitForSingleObject(self.0, INFINITE) } {
            WAIT_OBJECT_0 => Ok(()),
            _ => Err(IoError::last_os_error()),
        }
    }

    fn reset(&self) -> io::Result<()> {
        if unsafe { ResetEvent(self.0) } == 0 {
            Err(IoError::last_os_error())
        } else {
            Ok(())
        }
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        unsafe {
            CloseHandle(self.0);
        }
    }
}

fn flock(file: HANDLE, flags: DWORD, range: ByteRange) -> io::Result<bool> {
    let event = Event::manual_reset()?;
    let mut ov = overlapped_at(range.start);
    ov.hEvent = event.0;
    let (low, high) = split(range.len);

    let rc = unsafe { LockFileEx(file, flags, 0, low, high, &mut ov) };
    if rc != 0 {
        return Ok(true);
    }

    let err = IoError::last_os_error();
    match err.raw_os_error().map(|code| code as DWORD) {
        Some(ERROR_IO_PENDING) => {}
        Some(ERROR_LOCK_VIOLATION) if flags & LOCKFILE_FAIL_IMMEDIATELY != 0 => return Ok(false),
        _ => return Err(err),
    }

    tracing::trace!(?range, "lock request pending, waiting for completion");
    if let Err(err) = event.wait() {
        withdraw(file, &mut ov, range);
        return Err(err);
    }

    let mut transferred: DWORD = 0;
    let rc = unsafe { GetOverlappedResult(file, &mut ov, &mut transferred, FALSE) };
    if rc == 0 {
        return Err(IoError::last_os_error());
    }
    if let Err(err) = event.reset() {
        let _ = funlock(file, range);
        return Err(err);
    }
    Ok(true)
}

/// Cancels a pending lock request and blocks until the kernel no longer
/// references `ov`. A grant that raced the cancel is unlocked again.
fn withdraw(file: HANDLE, ov: &mut OVERLAPPED, range: ByteRange) {
    let mut transferred: DWORD = 0;
    let granted = unsafe {
        CancelIoEx(file, ov);
        GetOverlappedResult(file, ov, &mut transferred, TRUE) != 0
    };
    if granted {
        let _ = funlock(file, range);
    }
}

fn funlock(file: HANDLE, range: ByteRange) -> io::Result<()> {
    let mut ov = overlapped_at(range.start);
    let (low, high) = split(range.len);

    let rc = unsafe { UnlockFileEx(file, 0, low, high, &mut ov) };
    if rc == 0 {
        Err(IoError::last_os_error())
    } else {
        Ok(())
    }
}

/// Exclusive `LockFileEx` lock on one range of a borrowed handle.
#[derive(Debug)]
pub(crate) struct OverlappedLock {
    handle: HANDLE,
    /// `None` until a lock is granted, and again once it is released.
    held: Option<ByteRange>,
}

// SAFETY: the handle is borrowed from a `File`, which is itself `Send`; the
// backend only passes it to thread-agnostic kernel calls.
unsafe impl Send for OverlappedLock {}

impl OverlappedLock {
    /// An unlocked backend over `handle`. The handle is not owned.
    pub(crate) fn new(handle: RawHandle) -> OverlappedLock {
        OverlappedLock {
            handle: handle as HANDLE,
            held: None,
        }
    }
}

impl LockBackend for OverlappedLock {
    fn lock(&mut self, range: ByteRange, wait: bool) -> Result<bool> {
        let mut flags = LOCKFILE_EXCLUSIVE_LOCK;
        if !wait {
            flags |= LOCKFILE_FAIL_IMMEDIATELY;
        }
        if flock(self.handle, flags, range)? {
            tracing::debug!(?range, "acquired LockFileEx lock");
            self.held = Some(range);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn unlock(&mut self) -> Result<()> {
        let range = match self.held.take() {
            Some(range) => range,
            None => return Ok(()),
        };
        funlock(self.handle, range)?;
        tracing::debug!(?range, "released LockFileEx lock");
        Ok(())
    }

    #[inline]
    fn is_locked(&self) -> bool {
        self.held.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs::{File, OpenOptions};
    use std::os::windows::fs::OpenOptionsExt;
    use std::os::windows::io::AsRawHandle;
    use std::path::Path;
    use std::sync::mpsc::{self, RecvTimeoutError};
    use std::thread;
    use std::time::Duration;

    use winapi::um::winbase::FILE_FLAG_OVERLAPPED;

    fn range(start: i64, len: i64) -> ByteRange {
        ByteRange { start, len }
    }

    fn open(path: &Path, flags: DWORD) -> File {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .custom_flags(flags)
            .open(path)
            .unwrap()
    }

    #[test]
    fn splits_into_halves() {
        assert_eq!(split(0), (0, 0));
        assert_eq!(split(1), (1, 0));
        assert_eq!(split(0x1_0000_0002), (2, 1));
        assert_eq!(split(-1), (0xffffffff, 0xffffffff));
    }

    #[test]
    fn lock_then_unlock() {
        let file = tempfile::tempfile().unwrap();
        let mut lock = OverlappedLock::new(file.as_raw_handle());
        assert_eq!(lock.lock(range(1, 1), true), Ok(true));
        assert!(lock.is_locked());
        assert_eq!(lock.unlock(), Ok(()));
        assert!(!lock.is_locked());
        assert_eq!(lock.unlock(), Ok(()));
    }

    #[test]
    fn invalid_handle_reports_error() {
        let mut lock = OverlappedLock::new(ptr::null_mut());
        let err = lock.lock(range(0, 1), true).unwrap_err();
        assert!(matches!(err.code(), Some(code) if code != 0));
        assert!(!lock.is_locked());
        assert_eq!(lock.unlock(), Ok(()));
    }

    #[test]
    fn separate_handles_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("overlapped");
        let open = || {
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)
                .unwrap()
        };
        let (a, b) = (open(), open());

        let mut first = OverlappedLock::new(a.as_raw_handle());
        assert_eq!(first.lock(range(0, 8), true), Ok(true));

        let mut second = OverlappedLock::new(b.as_raw_handle());
        assert_eq!(second.lock(range(4, 1), false), Ok(false));
        assert_eq!(second.lock(range(8, 8), false), Ok(true));

        first.unlock().unwrap();
        second.unlock().unwrap();
        assert_eq!(second.lock(range(4, 1), false), Ok(true));
        second.unlock().unwrap();
    }

    #[test]
    fn pending_request_completes_after_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pending");
        let a = open(&path, 0);

        let mut first = OverlappedLock::new(a.as_raw_handle());
        assert_eq!(first.lock(range(0, 8), true), Ok(true));

        let (done_tx, done_rx) = mpsc::channel();
        let waiter_path = path.clone();
        let waiter = thread::spawn(move || {
            // overlapped handles make LockFileEx report ERROR_IO_PENDING
            let b = open(&waiter_path, FILE_FLAG_OVERLAPPED);
            let mut second = OverlappedLock::new(b.as_raw_handle());
            let granted = second.lock(range(2, 1), true);
            done_tx.send(granted).unwrap();
            second.unlock().unwrap();
        });

        assert_eq!(
            done_rx.recv_timeout(Duration::from_millis(200)),
            Err(RecvTimeoutError::Timeout)
        );
        first.unlock().unwrap();
        assert_eq!(done_rx.recv_timeout(Duration::from_secs(5)), Ok(Ok(true)));
        waiter.join().unwrap();
    }

    #[test]
    fn withdrawn_request_is_not_granted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("withdrawn");
        let a = open(&path, 0);
        let b = open(&path, FILE_FLAG_OVERLAPPED);

        let mut first = OverlappedLock::new(a.as_raw_handle());
        assert_eq!(first.lock(range(0, 8), true), Ok(true));

        let handle = b.as_raw_handle() as HANDLE;
        let event = Event::manual_reset().unwrap();
        let mut ov = overlapped_at(0);
        ov.hEvent = event.0;
        let rc = unsafe { LockFileEx(handle, LOCKFILE_EXCLUSIVE_LOCK, 0, 8, 0, &mut ov) };
        assert_eq!(rc, 0);
        assert_eq!(
            IoError::last_os_error().raw_os_error(),
            Some(ERROR_IO_PENDING as i32)
        );

        withdraw(handle, &mut ov, range(0, 8));
        first.unlock().unwrap();

        // the cancelled request left nothing behind on b
        let mut second = OverlappedLock::new(b.as_raw_handle());
        assert_eq!(second.lock(range(0, 8), false), Ok(true));
        second.unlock().unwrap();
    }
}
