//! GC pacing for the foreign collector
//!
//! The foreign collector only runs when the reactor asks it to. The pacer
//! counts operations, wall time and allocated bytes since the last run; once
//! any enabled threshold is reached a run is due before the next operation.

use super::options::ReactorOptions;
use std::time::{Duration, Instant};

/// Threshold tracker
#[derive(Debug)]
pub struct GcPacer {
    ops: u64,
    since: Instant,
    pending: bool,
    op_threshold: Option<u64>,
    interval: Option<Duration>,
    byte_threshold: Option<usize>,
}

impl GcPacer {
    /// Create a pacer from reactor options
    pub fn new(options: &ReactorOptions) -> Self {
        Self {
            ops: 0,
            since: Instant::now(),
            pending: false,
            op_threshold: options.gc_op_threshold,
            interval: options.gc_interval(),
            byte_threshold: options.gc_byte_threshold,
        }
    }

    fn threshold_reached(&self, bytes: usize) -> bool {
        self.op_threshold.map_or(false, |n| self.ops >= n)
            || self.interval.map_or(false, |t| self.since.elapsed() >= t)
            || self.byte_threshold.map_or(false, |b| bytes >= b)
    }

    /// Count one finished operation
    pub fn record_op(&mut self, bytes: usize) {
        self.ops += 1;
        if self.threshold_reached(bytes) {
            self.pending = true;
        }
    }

    /// Whether a run is due before the next operation
    pub fn should_collect(&self, bytes: usize) -> bool {
        self.pending || (self.ops > 0 && self.threshold_reached(bytes))
    }

    /// Reset every counter after a run
    pub fn reset(&mut self) {
        self.ops = 0;
        self.since = Instant::now();
        self.pending = false;
    }

    /// Operations since the last run
    pub fn ops_since_gc(&self) -> u64 {
        self.ops
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(ops: Option<u64>, ms: Option<u64>, bytes: Option<usize>) -> ReactorOptions {
        ReactorOptions {
            gc_op_threshold: ops,
            gc_interval_ms: ms,
            gc_byte_threshold: bytes,
            ..ReactorOptions::default()
        }
    }

    #[test]
    fn test_op_threshold() {
        let mut pacer = GcPacer::new(&options(Some(3), None, None));
        for _ in 0..2 {
            pacer.record_op(0);
            assert!(!pacer.should_collect(0));
        }
        pacer.record_op(0);
        assert!(pacer.should_collect(0));
        pacer.reset();
        assert!(!pacer.should_collect(0));
        assert_eq!(pacer.ops_since_gc(), 0);
    }

    #[test]
    fn test_byte_threshold() {
        let mut pacer = GcPacer::new(&options(None, None, Some(1024)));
        pacer.record_op(100);
        assert!(!pacer.should_collect(100));
        pacer.record_op(2048);
        assert!(pacer.should_collect(2048));
    }

    #[test]
    fn test_interval_threshold() {
        let mut pacer = GcPacer::new(&options(None, Some(10), None));
        pacer.record_op(0);
        std::thread::sleep(Duration::from_millis(15));
        assert!(pacer.should_collect(0));
    }

    #[test]
    fn test_disabled_never_collects() {
        let mut pacer = GcPacer::new(&options(None, None, None));
        for _ in 0..100 {
            pacer.record_op(usize::MAX);
        }
        assert!(!pacer.should_collect(usize::MAX));
    }
}
