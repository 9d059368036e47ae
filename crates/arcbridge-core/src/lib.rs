//! arcbridge core runtime
//!
//! This crate provides the host half of a bridge to a compiled foreign
//! runtime reached through a C boundary:
//! - Reference-counted values in memory shared by both runtimes
//! - A cross-runtime mutex guarding every reference-count update
//! - A call reactor serializing foreign calls onto one thread
//! - GC pacing for the foreign collector
//! - Call sites that build, attach and dispatch foreign operations

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod callsite;
pub mod memory;
pub mod reactor;
pub mod sync;
pub mod types;

pub use callsite::{CallSite, CallSiteState, LibraryBuilder};
pub use memory::{BlockPtr, Heap, HeapStats};
pub use reactor::{
    CallDescriptor, CallerId, DispatchMode, ErrorCallback, ForeignLibrary, InitContext, Reactor,
    ReactorMode, ReactorOptions, ReactorStats, ResultCallback,
};
pub use sync::{ArcMutex, ArcMutexGuard};
pub use types::{HostProc, Layout, RawValue, Type, TypeRef, Value};

use std::backtrace::{Backtrace, BacktraceStatus};
use std::fmt;

/// Crate version, reported across the C boundary
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Exception raised on the foreign side
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignError {
    /// Exception class name reported by the foreign runtime
    pub kind: String,
    /// Exception message
    pub message: String,
    /// Foreign frames, followed by the host caller's frames once re-raised
    pub backtrace: Vec<String>,
}

impl ForeignError {
    /// Create an error without a backtrace
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            backtrace: Vec::new(),
        }
    }

    /// Attach foreign frames
    pub fn with_backtrace(mut self, backtrace: Vec<String>) -> Self {
        self.backtrace = backtrace;
        self
    }

    /// Append the current host call stack (when backtraces are enabled)
    pub fn with_caller_backtrace(mut self) -> Self {
        let host = Backtrace::capture();
        if host.status() == BacktraceStatus::Captured {
            self.backtrace.extend(
                host.to_string()
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .map(String::from),
            );
        }
        self
    }
}

impl fmt::Display for ForeignError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ForeignError {}

/// Bridge errors
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Value does not fit the declared type
    #[error("cannot cast {value} to {ty}")]
    InvalidCast {
        /// Target type
        ty: String,
        /// Offending value
        value: String,
    },

    /// Call from a thread other than the single-thread-mode owner
    #[error("single thread mode is enabled; reactor is owned by {owner}, called from {caller}")]
    SingleThreadViolation {
        /// Owning thread
        owner: String,
        /// Calling thread
        caller: String,
    },

    /// Exception re-raised from the foreign side
    #[error("{0}")]
    Foreign(#[from] ForeignError),

    /// Reactor is stopped or stopped while the call was pending
    #[error("reactor is stopped")]
    ReactorStopped,

    /// Wrong number of arguments
    #[error("{operation} expects {expected} arguments, got {found}")]
    ArityMismatch {
        /// Operation name
        operation: String,
        /// Declared arity
        expected: usize,
        /// Supplied arguments
        found: usize,
    },

    /// Index outside `-len..len`
    #[error("index {index} out of bounds for length {len}")]
    IndexOutOfBounds {
        /// Requested index
        index: isize,
        /// Container length
        len: usize,
    },

    /// Unknown NamedTuple field
    #[error("no such field: {0}")]
    NoSuchField(String),

    /// Operation applied to a value of the wrong type
    #[error("expected {expected}, found {found}")]
    TypeMismatch {
        /// What the operation needs
        expected: String,
        /// Actual type
        found: String,
    },

    /// Proc invocation failed
    #[error("proc call failed: {0}")]
    ProcFailed(String),

    /// Foreign library could not be built or loaded
    #[error("library load failed: {0}")]
    LibraryLoad(String),

    /// Reactor thread could not be spawned
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Bridge result
pub type BridgeResult<T> = Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_foreign_error_display() {
        let err = ForeignError::new("RuntimeError", "Exception");
        assert_eq!(err.to_string(), "RuntimeError: Exception");
        assert_eq!(BridgeError::from(err).to_string(), "RuntimeError: Exception");
    }

    #[test]
    fn test_caller_backtrace_keeps_foreign_frames() {
        let err = ForeignError::new("E", "m")
            .with_backtrace(vec!["lib.cr:1".to_string()])
            .with_caller_backtrace();
        assert_eq!(err.backtrace[0], "lib.cr:1");
    }
}
