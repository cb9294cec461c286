//! `SCM_RIGHTS` descriptor passing over Unix domain sockets.
//!
//! The broker sends each response's descriptors as a run of single-fd
//! ancillary messages immediately after the response frame; the response
//! body says how many to expect. The broker side is async (tokio), the
//! client side blocking — both speak the same thing on the wire.
//!
//! Sending never consumes the sender's descriptor: the receiver gets a
//! fresh one referring to the same kernel object.

use std::io::{self, ErrorKind};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use passfd::FdPassingExt;
use tokio::io::Interest;

/// Send one descriptor over a blocking Unix stream.
pub fn send_fd(stream: &std::os::unix::net::UnixStream, fd: RawFd) -> io::Result<()> {
    stream.as_raw_fd().send_fd(fd)
}

/// Receive one descriptor from a blocking Unix stream.
pub fn recv_fd(stream: &std::os::unix::net::UnixStream) -> io::Result<OwnedFd> {
    let raw = stream.as_raw_fd().recv_fd()?;
    // SAFETY: recv_fd returned a fresh descriptor we now own.
    Ok(unsafe { OwnedFd::from_raw_fd(raw) })
}

/// Receive `count` descriptors from a blocking Unix stream, in order.
pub fn recv_fds(stream: &std::os::unix::net::UnixStream, count: usize) -> io::Result<Vec<OwnedFd>> {
    let mut fds = Vec::with_capacity(count);
    for _ in 0..count {
        fds.push(recv_fd(stream)?);
    }
    Ok(fds)
}

/// Send one descriptor over a tokio Unix stream.
pub async fn send_fd_async(stream: &tokio::net::UnixStream, fd: RawFd) -> io::Result<()> {
    loop {
        stream.writable().await?;
        match stream.try_io(Interest::WRITABLE, || stream.as_raw_fd().send_fd(fd)) {
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => continue,
            other => return other,
        }
    }
}

/// Send a run of descriptors over a tokio Unix stream, in order.
pub async fn send_fds_async(stream: &tokio::net::UnixStream, fds: &[RawFd]) -> io::Result<()> {
    for &fd in fds {
        send_fd_async(stream, fd).await?;
    }
    Ok(())
}

/// Receive one descriptor from a tokio Unix stream.
pub async fn recv_fd_async(stream: &tokio::net::UnixStream) -> io::Result<OwnedFd> {
    loop {
        stream.readable().await?;
        match stream.try_io(Interest::READABLE, || stream.as_raw_fd().recv_fd()) {
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => continue,
            // SAFETY: recv_fd returned a fresh descriptor we now own.
            Ok(raw) => return Ok(unsafe { OwnedFd::from_raw_fd(raw) }),
            Err(e) => return Err(e),
        }
    }
}
