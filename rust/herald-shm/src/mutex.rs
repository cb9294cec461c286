//! Robust process-shared mutex embedded in shared memory.
//!
//! The channel control block carries one of these. `PTHREAD_PROCESS_SHARED`
//! lets any mapping of the block lock it; `PTHREAD_MUTEX_ROBUST` means a
//! holder that dies does not wedge the channel — the next locker is handed
//! the lock with [`LockRecovery::OwnerDied`] and must restore the protected
//! invariants before calling [`SharedMutex::make_consistent`].

use core::cell::UnsafeCell;
use std::io;

/// Outcome of a successful lock acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockRecovery {
    /// Normal acquisition.
    Clean,
    /// The previous holder died while holding the lock. The caller now
    /// holds it and must repair shared state, then mark the mutex
    /// consistent before unlocking.
    OwnerDied,
}

/// A robust, process-shared pthread mutex.
///
/// Lives inside a shared mapping; never construct one on the heap.
#[repr(C)]
pub struct SharedMutex {
    inner: UnsafeCell<libc::pthread_mutex_t>,
}

impl SharedMutex {
    /// Initialize the mutex in place.
    ///
    /// # Safety
    ///
    /// `this` must point into a freshly-created shared mapping, before any
    /// other process can observe it, and must not already hold an
    /// initialized mutex.
    pub unsafe fn init(this: *mut Self) -> io::Result<()> {
        unsafe {
            let mut attr = std::mem::zeroed::<libc::pthread_mutexattr_t>();
            check(libc::pthread_mutexattr_init(&mut attr))?;
            check(libc::pthread_mutexattr_setpshared(
                &mut attr,
                libc::PTHREAD_PROCESS_SHARED,
            ))?;
            check(libc::pthread_mutexattr_setrobust(
                &mut attr,
                libc::PTHREAD_MUTEX_ROBUST,
            ))?;
            let ret = check(libc::pthread_mutex_init((*this).inner.get(), &attr));
            libc::pthread_mutexattr_destroy(&mut attr);
            ret
        }
    }

    /// Lock the mutex, blocking until it is available.
    pub fn lock(&self) -> io::Result<LockRecovery> {
        let ret = unsafe { libc::pthread_mutex_lock(self.inner.get()) };
        match ret {
            0 => Ok(LockRecovery::Clean),
            libc::EOWNERDEAD => Ok(LockRecovery::OwnerDied),
            err => Err(io::Error::from_raw_os_error(err)),
        }
    }

    /// Mark the mutex consistent after an [`LockRecovery::OwnerDied`]
    /// acquisition. Must be called while holding the lock.
    pub fn make_consistent(&self) -> io::Result<()> {
        check(unsafe { libc::pthread_mutex_consistent(self.inner.get()) })
    }

    /// Unlock the mutex. Must be called by the holder.
    pub fn unlock(&self) {
        let ret = unsafe { libc::pthread_mutex_unlock(self.inner.get()) };
        debug_assert_eq!(ret, 0, "pthread_mutex_unlock failed: {ret}");
    }
}

fn check(ret: libc::c_int) -> io::Result<()> {
    if ret == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(ret))
    }
}

// SAFETY: pthread process-shared mutexes are made for concurrent access
// from multiple threads and processes.
unsafe impl Send for SharedMutex {}
unsafe impl Sync for SharedMutex {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mmap::MemfdRegion;

    fn shared_mutex() -> (MemfdRegion, *mut SharedMutex) {
        let map = MemfdRegion::create("herald-mutex-test", 4096).unwrap();
        let ptr = map.region().as_ptr() as *mut SharedMutex;
        unsafe { SharedMutex::init(ptr).unwrap() };
        (map, ptr)
    }

    #[test]
    fn lock_unlock() {
        let (_map, ptr) = shared_mutex();
        let mutex = unsafe { &*ptr };
        assert_eq!(mutex.lock().unwrap(), LockRecovery::Clean);
        mutex.unlock();
        assert_eq!(mutex.lock().unwrap(), LockRecovery::Clean);
        mutex.unlock();
    }

    #[test]
    fn dead_holder_is_recovered() {
        let (_map, ptr) = shared_mutex();
        let mutex = unsafe { &*ptr };

        // A thread takes the lock and exits without releasing it, like a
        // crashed process would.
        std::thread::scope(|scope| {
            scope
                .spawn(|| {
                    assert_eq!(mutex.lock().unwrap(), LockRecovery::Clean);
                })
                .join()
                .unwrap();
        });

        assert_eq!(mutex.lock().unwrap(), LockRecovery::OwnerDied);
        mutex.make_consistent().unwrap();
        mutex.unlock();

        // Fully usable again after recovery.
        assert_eq!(mutex.lock().unwrap(), LockRecovery::Clean);
        mutex.unlock();
    }
}
