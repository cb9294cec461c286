//! Trigger objects: kernel-pollable wakeups passed around as fds.
//!
//! A trigger is a Unix socketpair. The owning participant polls and drains
//! the wait end; everyone else (peers, or the owner kicking itself) writes
//! a byte to the signal end. The broker creates the pair, keeps both ends,
//! and distributes duplicates — closing its ends when the participant is
//! removed, which readers observe as EOF and treat as "roster changed".

use std::io::{self, ErrorKind};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

/// Both ends of a participant's wakeup channel.
pub struct TriggerPair {
    wait: OwnedFd,
    signal: OwnedFd,
}

impl TriggerPair {
    /// Create a connected, nonblocking socketpair.
    pub fn new() -> io::Result<Self> {
        let mut fds = [0i32; 2];
        let sock_type = libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC;
        let ret = unsafe { libc::socketpair(libc::AF_UNIX, sock_type, 0, fds.as_mut_ptr()) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: socketpair just returned two valid, unowned descriptors.
        let (wait, signal) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        Ok(Self { wait, signal })
    }

    /// End polled and drained by the owning participant.
    pub fn wait_fd(&self) -> BorrowedFd<'_> {
        self.wait.as_fd()
    }

    /// End written by anyone who wants to wake the owner.
    pub fn signal_fd(&self) -> BorrowedFd<'_> {
        self.signal.as_fd()
    }
}

/// Wake whoever is polling the other end of `fd`.
///
/// A full socket buffer means a wakeup is already pending, and a broken
/// pipe means the participant is gone and a roster refresh is coming;
/// neither is an error worth surfacing.
pub fn signal(fd: BorrowedFd<'_>) {
    let buf = [1u8];
    let ret = unsafe {
        libc::send(
            fd.as_raw_fd(),
            buf.as_ptr() as *const libc::c_void,
            1,
            libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL,
        )
    };
    if ret < 0 {
        let err = io::Error::last_os_error();
        match err.kind() {
            ErrorKind::WouldBlock | ErrorKind::BrokenPipe | ErrorKind::ConnectionReset => {}
            _ => tracing::debug!(fd = fd.as_raw_fd(), error = %err, "trigger signal failed"),
        }
    }
}

/// Drain pending wakeups without blocking. Returns whether any were read.
pub fn drain(fd: BorrowedFd<'_>) -> bool {
    let mut buf = [0u8; 64];
    let mut drained = false;
    loop {
        let ret = unsafe {
            libc::recv(
                fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                libc::MSG_DONTWAIT,
            )
        };
        if ret > 0 {
            drained = true;
            continue;
        }
        if ret == 0 {
            // EOF: the broker closed its ends; the owner will refresh.
            return drained;
        }
        let err = io::Error::last_os_error();
        if err.kind() != ErrorKind::WouldBlock {
            tracing::debug!(fd = fd.as_raw_fd(), error = %err, "trigger drain failed");
        }
        return drained;
    }
}

/// Block until `fd` is readable (a wakeup arrived or the peer closed).
pub fn wait_readable(fd: RawFd) -> io::Result<()> {
    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    loop {
        let ret = unsafe { libc::poll(&mut pollfd, 1, -1) };
        if ret == 1 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != ErrorKind::Interrupted {
            return Err(err);
        }
    }
}
