//! Anonymous memory-backed shared regions.
//!
//! The broker creates every shared object with `memfd_create` so that the
//! only handle to it is a file descriptor it can hand out over the control
//! socket; there is nothing on the filesystem to leak or clean up. Clients
//! map the received descriptor with `MAP_SHARED`.

use std::ffi::CString;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};

use crate::region::Region;

/// A shared memory region backed by an anonymous memfd.
#[derive(Debug)]
pub struct MemfdRegion {
    ptr: *mut u8,
    len: usize,
    fd: OwnedFd,
}

impl MemfdRegion {
    /// Create a new region of `size` bytes.
    ///
    /// The `name` only shows up in `/proc/<pid>/fd` for debugging; it does
    /// not name a filesystem object.
    pub fn create(name: &str, size: usize) -> io::Result<Self> {
        if size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "size must be > 0",
            ));
        }

        let c_name = CString::new(name.replace('\0', "_"))
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "bad memfd name"))?;
        let raw = unsafe { libc::memfd_create(c_name.as_ptr(), libc::MFD_CLOEXEC) };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let ret = unsafe { libc::ftruncate(fd.as_raw_fd(), size as libc::off_t) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        Self::map(fd, size)
    }

    /// Map an existing region from a descriptor received over the control
    /// socket. The object's size determines the mapping size.
    pub fn from_fd(fd: OwnedFd) -> io::Result<Self> {
        let mut stat = unsafe { std::mem::zeroed::<libc::stat>() };
        let ret = unsafe { libc::fstat(fd.as_raw_fd(), &mut stat) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        let size = stat.st_size as usize;
        if size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "shared object is empty",
            ));
        }
        Self::map(fd, size)
    }

    fn map(fd: OwnedFd, size: usize) -> io::Result<Self> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            ptr: ptr as *mut u8,
            len: size,
            fd,
        })
    }

    /// Get a `Region` view of this mapping.
    #[inline]
    pub fn region(&self) -> Region {
        // SAFETY: the mapping is valid for the lifetime of MemfdRegion.
        unsafe { Region::from_raw(self.ptr, self.len) }
    }

    /// Size of the mapping in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the mapping is empty (never true for a live region).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The backing descriptor, for passing to another process.
    #[inline]
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl Drop for MemfdRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
        }
    }
}

// SAFETY: the mapping stays valid until drop; cross-process synchronization
// is handled by the structures stored inside.
unsafe impl Send for MemfdRegion {}
unsafe impl Sync for MemfdRegion {}
