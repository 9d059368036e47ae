//! Cross-runtime reference-count mutex
//!
//! Both runtimes mutate reference counts on the same memory blocks, so both
//! must take the same critical section. On Unix this is a plain
//! `pthread_mutex_t` whose address is handed to the foreign runtime at init.

use super::guard::ArcMutexGuard;
use std::cell::UnsafeCell;
use std::ffi::c_void;

#[cfg(not(unix))]
use parking_lot::lock_api::RawMutex as _;

#[cfg(unix)]
type RawLock = libc::pthread_mutex_t;

#[cfg(not(unix))]
type RawLock = parking_lot::RawMutex;

/// Process-wide mutex guarding every reference-count mutation
///
/// The lock lives in its own heap allocation so its address stays stable for
/// the lifetime of the process; the foreign side locks it through that
/// address.
pub struct ArcMutex {
    raw: Box<UnsafeCell<RawLock>>,
}

// SAFETY: the inner lock is only touched through the platform mutex API,
// which is thread-safe by construction.
unsafe impl Send for ArcMutex {}
unsafe impl Sync for ArcMutex {}

impl ArcMutex {
    /// Create a new unlocked mutex
    #[cfg(unix)]
    pub fn new() -> Self {
        Self {
            raw: Box::new(UnsafeCell::new(libc::PTHREAD_MUTEX_INITIALIZER)),
        }
    }

    /// Create a new unlocked mutex
    #[cfg(not(unix))]
    pub fn new() -> Self {
        Self {
            raw: Box::new(UnsafeCell::new(parking_lot::RawMutex::INIT)),
        }
    }

    /// Acquire the lock, returning a guard that releases it on drop
    pub fn lock(&self) -> ArcMutexGuard<'_> {
        self.raw_lock();
        ArcMutexGuard::new(self)
    }

    /// Run `f` while holding the lock
    pub fn synchronize<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.lock();
        f()
    }

    /// Address handed to the foreign runtime
    pub fn as_ptr(&self) -> *mut c_void {
        self.raw.get() as *mut c_void
    }

    #[cfg(unix)]
    pub(crate) fn raw_lock(&self) {
        let rc = unsafe { libc::pthread_mutex_lock(self.raw.get()) };
        if rc != 0 {
            log::error!("pthread_mutex_lock failed with code {}", rc);
        }
    }

    #[cfg(unix)]
    pub(crate) fn raw_unlock(&self) {
        let rc = unsafe { libc::pthread_mutex_unlock(self.raw.get()) };
        if rc != 0 {
            log::error!("pthread_mutex_unlock failed with code {}", rc);
        }
    }

    #[cfg(not(unix))]
    pub(crate) fn raw_lock(&self) {
        unsafe { (*self.raw.get()).lock() }
    }

    #[cfg(not(unix))]
    pub(crate) fn raw_unlock(&self) {
        unsafe { (*self.raw.get()).unlock() }
    }

    /// Lock the mutex behind a raw address obtained from [`ArcMutex::as_ptr`]
    ///
    /// # Safety
    ///
    /// `ptr` must come from `as_ptr` on a live `ArcMutex`.
    pub unsafe fn lock_raw(ptr: *mut c_void) {
        #[cfg(unix)]
        {
            libc::pthread_mutex_lock(ptr as *mut libc::pthread_mutex_t);
        }
        #[cfg(not(unix))]
        {
            (*(ptr as *const parking_lot::RawMutex)).lock();
        }
    }

    /// Unlock the mutex behind a raw address obtained from [`ArcMutex::as_ptr`]
    ///
    /// # Safety
    ///
    /// `ptr` must come from `as_ptr` on a live `ArcMutex` that the calling
    /// thread currently holds.
    pub unsafe fn unlock_raw(ptr: *mut c_void) {
        #[cfg(unix)]
        {
            libc::pthread_mutex_unlock(ptr as *mut libc::pthread_mutex_t);
        }
        #[cfg(not(unix))]
        {
            (*(ptr as *const parking_lot::RawMutex)).unlock();
        }
    }
}

impl Default for ArcMutex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
impl Drop for ArcMutex {
    fn drop(&mut self) {
        unsafe {
            libc::pthread_mutex_destroy(self.raw.get());
        }
    }
}
