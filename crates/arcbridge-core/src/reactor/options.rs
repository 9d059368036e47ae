//! Reactor configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Options for creating a [`crate::Reactor`]
///
/// Every GC threshold may be disabled with `None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReactorOptions {
    /// Run calls on the attaching thread instead of a worker thread
    pub single_thread_mode: bool,

    /// Run the foreign GC after this many operations
    pub gc_op_threshold: Option<u64>,

    /// Run the foreign GC after this much wall time
    pub gc_interval_ms: Option<u64>,

    /// Run the foreign GC after this many allocated bytes
    pub gc_byte_threshold: Option<usize>,

    /// Delay between yields while async jobs are outstanding
    pub poll_interval_us: u64,

    /// How long `stop` keeps servicing outstanding yields
    pub shutdown_timeout_ms: u64,
}

impl Default for ReactorOptions {
    fn default() -> Self {
        Self {
            single_thread_mode: false,
            gc_op_threshold: Some(10_000),
            gc_interval_ms: Some(1_000),
            gc_byte_threshold: Some(64 * 1024 * 1024), // 64 MB
            poll_interval_us: 500,
            shutdown_timeout_ms: 2_000,
        }
    }
}

impl ReactorOptions {
    /// Defaults with single-thread mode enabled
    pub fn single_threaded() -> Self {
        Self {
            single_thread_mode: true,
            ..Self::default()
        }
    }

    /// Defaults with every GC threshold disabled
    pub fn without_gc_pacing() -> Self {
        Self {
            gc_op_threshold: None,
            gc_interval_ms: None,
            gc_byte_threshold: None,
            ..Self::default()
        }
    }

    /// GC wall-time threshold
    pub fn gc_interval(&self) -> Option<Duration> {
        self.gc_interval_ms.map(Duration::from_millis)
    }

    /// Delay between yields
    pub fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.poll_interval_us)
    }

    /// Drain timeout for `stop`
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = ReactorOptions::default();
        assert!(!options.single_thread_mode);
        assert_eq!(options.gc_op_threshold, Some(10_000));
        assert_eq!(options.gc_interval(), Some(Duration::from_secs(1)));
        assert_eq!(options.poll_interval(), Duration::from_micros(500));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let options: ReactorOptions =
            serde_json::from_str(r#"{"single_thread_mode": true, "gc_interval_ms": null}"#).unwrap();
        assert!(options.single_thread_mode);
        assert_eq!(options.gc_interval_ms, None);
        assert_eq!(options.gc_op_threshold, Some(10_000));
        assert_eq!(options.shutdown_timeout_ms, 2_000);
    }
}
