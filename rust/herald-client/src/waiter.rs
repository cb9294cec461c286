//! Pluggable wait capability.
//!
//! The library never decides how to sleep. The default waiter parks the
//! thread in a single-fd `poll`; anything cooperative — a coroutine
//! scheduler, a bigger poll set with timeouts — can be injected per
//! handle without the rest of the library changing.

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd};

/// How a publisher or subscriber blocks on its poll descriptor.
pub trait Waiter {
    /// Block until `fd` is readable. A cancelled wait must simply return;
    /// it never alters slot ownership.
    fn wait(&self, fd: BorrowedFd<'_>) -> io::Result<()>;
}

/// The default waiter: a blocking, unbounded single-fd `poll`.
#[derive(Debug, Default, Clone, Copy)]
pub struct PollWaiter;

impl Waiter for PollWaiter {
    fn wait(&self, fd: BorrowedFd<'_>) -> io::Result<()> {
        herald_shm::trigger::wait_readable(fd.as_raw_fd())
    }
}
