//! RAII guard for automatic mutex unlock

use crate::sync::ArcMutex;

/// RAII guard for [`ArcMutex`] (auto-unlocks on drop)
///
/// The guard keeps the critical section scoped, so an early return or a panic
/// inside a reference-count update never leaves the foreign runtime locked out.
pub struct ArcMutexGuard<'a> {
    mutex: &'a ArcMutex,
}

impl<'a> ArcMutexGuard<'a> {
    /// The caller must already hold the lock.
    pub(crate) fn new(mutex: &'a ArcMutex) -> Self {
        Self { mutex }
    }
}

impl Drop for ArcMutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.raw_unlock();
    }
}
