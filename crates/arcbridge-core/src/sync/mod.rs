//! Synchronization shared with the foreign runtime
//!
//! Reference counts live in memory both runtimes can touch, so every count
//! update goes through one process-wide critical section that the foreign
//! side receives by address when a library is initialized.

mod guard;
mod mutex;

pub use guard::ArcMutexGuard;
pub use mutex::ArcMutex;
