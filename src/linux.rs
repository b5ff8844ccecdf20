//! Open file description (OFD) range locks via `fcntl`.
//!
//! OFD locks belong to the open file description rather than the process, so
//! two `open` calls on the same path conflict with each other even inside one
//! process, and threads sharing one descriptor share its locks.

use libc::{
    fcntl, off_t, EACCES, EOVERFLOW, F_OFD_SETLK, F_OFD_SETLKW, F_UNLCK, F_WRLCK, SEEK_SET,
};

use std::convert::TryFrom;
use std::io::{self, ErrorKind};
use std::mem;
use std::os::raw::{c_int, c_short};
use std::os::unix::io::RawFd;

use crate::error::{Error, Result};
use crate::platform::LockBackend;
use crate::ByteRange;

/// Narrows an offset to `off_t`. On targets with a 32-bit `off_t` an offset
/// that does not fit fails with `EOVERFLOW` instead of wrapping.
fn to_off(value: i64) -> io::Result<off_t> {
    off_t::try_from(value).map_err(|_| io::Error::from_raw_os_error(EOVERFLOW))
}

fn flck(fd: RawFd, op: c_int, typ: c_short, range: ByteRange) -> io::Result<()> {
    // zeroed so any arch-specific padding fields are initialized; l_pid must
    // be 0 for OFD requests
    let mut lock: libc::flock = unsafe { mem::zeroed() };
    lock.l_type = typ;
    lock.l_whence = SEEK_SET as c_short;
    lock.l_start = to_off(range.start)?;
    lock.l_len = to_off(range.len)?;
    lock.l_pid = 0;

    loop {
        let rc = unsafe { fcntl(fd, op, &lock) };
        if rc == -1 {
            let err = io::Error::last_os_error();
            if err.kind() != ErrorKind::Interrupted {
                break Err(err);
            }
        } else {
            break Ok(());
        }
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == ErrorKind::WouldBlock || err.raw_os_error() == Some(EACCES)
}

/// Exclusive OFD lock on one range of a borrowed descriptor.
#[derive(Debug)]
pub(crate) struct OfdLock {
    fd: RawFd,
    /// `None` until a lock is granted, and again once it is released.
    held: Option<ByteRange>,
}

impl OfdLock {
    /// An unlocked backend over `fd`. The descriptor is not owned.
    pub(crate) fn new(fd: RawFd) -> OfdLock {
        OfdLock { fd, held: None }
    }
}

impl LockBackend for OfdLock {
    fn lock(&mut self, range: ByteRange, wait: bool) -> Result<bool> {
        let op = match wait {
            true => F_OFD_SETLKW,
            false => F_OFD_SETLK,
        };
        if wait {
            tracing::trace!(fd = self.fd, ?range, "waiting for OFD lock");
        }
        match flck(self.fd, op, F_WRLCK as c_short, range) {
            Ok(()) => {
                tracing::debug!(fd = self.fd, ?range, "acquired OFD lock");
                self.held = Some(range);
                Ok(true)
            }
            Err(err) if !wait && is_contended(&err) => Ok(false),
            Err(err) => Err(Error::from(err)),
        }
    }

    fn unlock(&mut self) -> Result<()> {
        let range = match self.held.take() {
            Some(range) => range,
            None => return Ok(()),
        };
        flck(self.fd, F_OFD_SETLK, F_UNLCK as c_short, range)?;
        tracing::debug!(fd = self.fd, ?range, "released OFD lock");
        Ok(())
    }

    #[inline]
    fn is_locked(&self) -> bool {
        self.held.is_some()
    }
}
