//! Shared allocator for ref-counted blocks
//!
//! Blocks are allocated with the C allocator so the foreign runtime can free
//! what the host allocated and vice versa. The heap also owns the process-wide
//! refcount mutex, the live-object trace table used by tests, the byte hint
//! consumed by GC pacing, and the registry that keeps host closures alive.

use crate::sync::ArcMutex;
use crate::types::ProcRegistry;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use std::alloc::{handle_alloc_error, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

static GLOBAL_HEAP: Lazy<Heap> = Lazy::new(Heap::new);

/// Allocation counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Total allocations since process start
    pub allocations: u64,

    /// Total frees since process start
    pub frees: u64,

    /// Bytes allocated since the last GC hint reset
    pub bytes_since_gc: usize,
}

/// Process-wide allocator state shared with the foreign runtime
pub struct Heap {
    /// Mutex guarding every refcount update (handed to foreign code at init)
    arc_mutex: ArcMutex,

    /// Whether allocations are recorded in `live`
    trace: AtomicBool,

    /// Live allocations (address -> size) while tracing is on
    live: DashMap<usize, usize>,

    /// Bytes allocated since the foreign GC last ran
    bytes_since_gc: AtomicUsize,

    allocations: AtomicU64,
    frees: AtomicU64,

    /// Host closures reachable from Proc blocks
    procs: ProcRegistry,
}

impl Heap {
    fn new() -> Self {
        Self {
            arc_mutex: ArcMutex::new(),
            trace: AtomicBool::new(false),
            live: DashMap::new(),
            bytes_since_gc: AtomicUsize::new(0),
            allocations: AtomicU64::new(0),
            frees: AtomicU64::new(0),
            procs: ProcRegistry::new(),
        }
    }

    /// The single heap shared by every value in the process
    pub fn global() -> &'static Heap {
        &GLOBAL_HEAP
    }

    /// The refcount mutex
    pub fn arc_mutex(&self) -> &ArcMutex {
        &self.arc_mutex
    }

    /// Registry of host closures wrapped by Proc values
    pub fn procs(&self) -> &ProcRegistry {
        &self.procs
    }

    /// Allocate `size` zeroed bytes
    ///
    /// Zero-sized requests still return a unique, freeable pointer.
    pub fn malloc(&self, size: usize) -> NonNull<u8> {
        let size = size.max(1);
        let raw = unsafe { libc::calloc(size, 1) } as *mut u8;
        let ptr = match NonNull::new(raw) {
            Some(ptr) => ptr,
            None => handle_alloc_error(Layout::from_size_align(size, 1).unwrap_or(Layout::new::<u8>())),
        };

        self.allocations.fetch_add(1, Ordering::Relaxed);
        self.gc_hint(size);
        if self.trace.load(Ordering::Acquire) {
            self.live.insert(ptr.as_ptr() as usize, size);
        }
        ptr
    }

    /// Free a pointer returned by [`Heap::malloc`] (or by the foreign allocator)
    ///
    /// # Safety
    ///
    /// `ptr` must be a live allocation from the C allocator and must not be
    /// used afterwards.
    pub unsafe fn free(&self, ptr: NonNull<u8>) {
        self.live.remove(&(ptr.as_ptr() as usize));
        self.frees.fetch_add(1, Ordering::Relaxed);
        libc::free(ptr.as_ptr() as *mut libc::c_void);
    }

    /// Start or stop recording live allocations
    ///
    /// Stopping clears the table.
    pub fn trace_live_objects(&self, enabled: bool) {
        self.trace.store(enabled, Ordering::Release);
        if !enabled {
            self.live.clear();
        }
    }

    /// Whether live allocations are being recorded
    pub fn is_tracing(&self) -> bool {
        self.trace.load(Ordering::Acquire)
    }

    /// Number of traced allocations not yet freed
    pub fn live_objects(&self) -> usize {
        self.live.len()
    }

    /// Bytes held by traced allocations not yet freed
    pub fn live_bytes(&self) -> usize {
        self.live.iter().map(|entry| *entry.value()).sum()
    }

    /// Add to the allocation byte hint
    pub fn gc_hint(&self, bytes: usize) {
        self.bytes_since_gc.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Bytes allocated since the last [`Heap::gc_hint_reset`]
    pub fn gc_bytes_seen(&self) -> usize {
        self.bytes_since_gc.load(Ordering::Relaxed)
    }

    /// Called after the foreign GC has run
    pub fn gc_hint_reset(&self) {
        self.bytes_since_gc.store(0, Ordering::Relaxed);
    }

    /// Snapshot of the allocation counters
    pub fn stats(&self) -> HeapStats {
        HeapStats {
            allocations: self.allocations.load(Ordering::Relaxed),
            frees: self.frees.load(Ordering::Relaxed),
            bytes_since_gc: self.gc_bytes_seen(),
        }
    }
}
