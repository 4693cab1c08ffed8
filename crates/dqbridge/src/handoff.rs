//! # Connection Handoff
//!
//! Turns a connection object into a descriptor the engine can adopt:
//! extract the OS descriptor, duplicate it with close-on-exec set, then drop
//! the original connection. The duplicate is returned as an `OwnedFd`, so it
//! stays closed-on-drop until the caller moves it into native code with
//! `into_raw_fd`.

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};

use dqbridge_core::HandoffError;
use tracing::debug;

/// A connection that can expose its OS descriptor.
///
/// Not every connection abstraction has one; implementations without a
/// descriptor return [`HandoffError::Unsupported`].
pub trait HandoffConn: Send {
    /// Borrow the underlying descriptor
    fn descriptor(&self) -> Result<BorrowedFd<'_>, HandoffError>;
}

macro_rules! impl_handoff_conn {
    ($($ty:ty),* $(,)?) => {
        $(
            impl HandoffConn for $ty {
                fn descriptor(&self) -> Result<BorrowedFd<'_>, HandoffError> {
                    Ok(self.as_fd())
                }
            }
        )*
    };
}

impl_handoff_conn!(
    std::net::TcpStream,
    std::os::unix::net::UnixStream,
    tokio::net::TcpStream,
    tokio::net::UnixStream,
    OwnedFd,
);

impl<T: HandoffConn + ?Sized> HandoffConn for Box<T> {
    fn descriptor(&self) -> Result<BorrowedFd<'_>, HandoffError> {
        (**self).descriptor()
    }
}

/// Duplicate `conn`'s descriptor and close `conn`.
///
/// # Returns
/// The close-on-exec duplicate. The original connection is dropped on every
/// path, success or failure.
///
/// # Errors
/// - `Unsupported` / `Extract`: the connection has no usable descriptor
/// - `Duplicate`: `fcntl(F_DUPFD_CLOEXEC)` failed
pub fn handoff<C: HandoffConn>(conn: C) -> Result<OwnedFd, HandoffError> {
    let duplicate = {
        let fd = conn.descriptor()?;
        dup_cloexec(fd).map_err(HandoffError::Duplicate)?
    };

    debug!(fd = duplicate.as_raw_fd(), "duplicated connection descriptor");
    drop(conn);
    Ok(duplicate)
}

/// Duplicate `fd` onto the lowest free descriptor with `FD_CLOEXEC` set.
pub fn dup_cloexec(fd: BorrowedFd<'_>) -> io::Result<OwnedFd> {
    // SAFETY: fcntl on a borrowed, open descriptor; no memory is passed.
    let raw = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_DUPFD_CLOEXEC, 0) };
    if raw < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fcntl returned a fresh descriptor nobody else owns
    Ok(unsafe { OwnedFd::from_raw_fd(raw) })
}

/// Whether `fd` has close-on-exec set
pub fn has_cloexec(fd: BorrowedFd<'_>) -> io::Result<bool> {
    // SAFETY: fcntl(F_GETFD) only reads descriptor flags
    let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(flags & libc::FD_CLOEXEC != 0)
}
