//! State shared by the reactor handle, its worker and the foreign callbacks

use super::callbacks::{ErrorCallback, ResultCallback};
use super::library::{library_key, ForeignLibrary, InitContext};
use super::options::ReactorOptions;
use super::pacing::GcPacer;
use super::slots::{CallerId, Outcome, WaitRegistry, WaitSlot};
use crate::memory::Heap;
use crate::types::{TypeRef, Value};
use crate::{BridgeError, ForeignError};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

/// Reactor counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReactorStats {
    /// Caller-submitted operations processed
    pub operations: u64,
    /// Foreign GC runs
    pub gc_runs: u64,
    /// Async dispatches
    pub async_calls: u64,
    /// Poll dispatches
    pub polls: u64,
}

#[derive(Default)]
struct Counters {
    operations: AtomicU64,
    gc_runs: AtomicU64,
    async_calls: AtomicU64,
    polls: AtomicU64,
}

/// Interpret a poll operation's return value as an outstanding-job count
fn outstanding(value: &Value) -> usize {
    match value.get().as_i64() {
        Some(n) if n > 0 => n as usize,
        Some(_) => 0,
        None => {
            log::warn!("poll operation returned {}, treating as drained", value.ty());
            0
        }
    }
}

/// Registries and counters of one reactor run
pub struct ReactorState {
    pub(crate) options: ReactorOptions,
    pub(crate) registry: Arc<WaitRegistry>,
    callbacks: DashMap<TypeRef, ResultCallback>,
    error_callback: ErrorCallback,
    libraries: RwLock<Vec<Arc<dyn ForeignLibrary>>>,
    pacer: Mutex<GcPacer>,
    counters: Counters,
}

impl ReactorState {
    pub(crate) fn new(options: ReactorOptions) -> Arc<Self> {
        let registry = WaitRegistry::new();
        Arc::new(Self {
            pacer: Mutex::new(GcPacer::new(&options)),
            options,
            callbacks: DashMap::new(),
            error_callback: ErrorCallback::new(registry.clone()),
            registry,
            libraries: RwLock::new(Vec::new()),
            counters: Counters::default(),
        })
    }

    /// Result callback for `return_type`, created once per type
    pub fn result_callback(&self, return_type: &TypeRef) -> ResultCallback {
        self.callbacks
            .entry(return_type.clone())
            .or_insert_with(|| ResultCallback::new(return_type.clone(), self.registry.clone()))
            .clone()
    }

    /// The single error callback
    pub fn error_callback(&self) -> ErrorCallback {
        self.error_callback.clone()
    }

    pub(crate) fn stats(&self) -> ReactorStats {
        ReactorStats {
            operations: self.counters.operations.load(Ordering::Relaxed),
            gc_runs: self.counters.gc_runs.load(Ordering::Relaxed),
            async_calls: self.counters.async_calls.load(Ordering::Relaxed),
            polls: self.counters.polls.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn is_attached(&self, lib: &Arc<dyn ForeignLibrary>) -> bool {
        let key = library_key(lib);
        self.libraries.read().iter().any(|l| library_key(l) == key)
    }

    /// Run a library's init entry point and remember it
    pub(crate) fn attach(&self, lib: &Arc<dyn ForeignLibrary>) -> Result<(), ForeignError> {
        if self.is_attached(lib) {
            return Ok(());
        }
        let ctx = InitContext {
            error_callback: self.error_callback(),
            mutex: Heap::global().arc_mutex(),
        };
        lib.init(&ctx)?;
        self.libraries.write().push(lib.clone());
        log::info!("attached foreign library {}", lib.name());
        Ok(())
    }

    /// Run the foreign collector on every attached library
    pub(crate) fn run_gc(&self) {
        let libraries = self.libraries.read().clone();
        for lib in &libraries {
            lib.collect_garbage();
        }
        self.counters.gc_runs.fetch_add(1, Ordering::Relaxed);
        Heap::global().gc_hint_reset();
        self.pacer.lock().reset();
        log::debug!("ran foreign GC on {} libraries", libraries.len());
    }

    /// Run a due GC before a counted operation
    pub(crate) fn before_op(&self) {
        let due = self.pacer.lock().should_collect(Heap::global().gc_bytes_seen());
        if due {
            self.run_gc();
        }
    }

    /// Count a finished operation
    pub(crate) fn after_op(&self) {
        self.counters.operations.fetch_add(1, Ordering::Relaxed);
        self.pacer.lock().record_op(Heap::global().gc_bytes_seen());
    }

    pub(crate) fn count_async(&self) {
        self.counters.async_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_poll(&self) {
        self.counters.polls.fetch_add(1, Ordering::Relaxed);
    }

    /// Run a blocking operation for `caller`, storing the outcome in `slot`
    pub(crate) fn invoke_blocking(
        &self,
        lib: &Arc<dyn ForeignLibrary>,
        operation: &str,
        args: &[Value],
        return_type: &TypeRef,
        caller: CallerId,
        slot: &WaitSlot,
    ) {
        let result = {
            let _serving = self.registry.enter(caller);
            lib.call(operation, args, return_type)
        };
        match result {
            Ok(value) => {
                slot.complete_if_empty(Ok(value));
            }
            Err(e) => slot.complete(Err(BridgeError::Foreign(e))),
        }
    }

    /// Start an async operation for `caller`
    pub(crate) fn invoke_async(
        &self,
        lib: &Arc<dyn ForeignLibrary>,
        operation: &str,
        args: &[Value],
        return_type: &TypeRef,
        caller: CallerId,
        slot: &WaitSlot,
    ) {
        self.count_async();
        let on_result = self.result_callback(return_type);
        let _serving = self.registry.enter(caller);
        if let Err(e) = lib.call_async(operation, args, caller, on_result) {
            slot.complete(Err(BridgeError::Foreign(e)));
        }
    }

    /// Run a poll operation, returning its outstanding-job count
    pub(crate) fn invoke_poll(
        &self,
        lib: &Arc<dyn ForeignLibrary>,
        operation: &str,
        args: &[Value],
        return_type: &TypeRef,
        caller: CallerId,
    ) -> Result<usize, ForeignError> {
        self.count_poll();
        let _serving = self.registry.enter(caller);
        lib.call(operation, args, return_type).map(|v| outstanding(&v))
    }

    /// Yield until `lib` reports no outstanding jobs
    pub(crate) fn drain(&self, lib: &Arc<dyn ForeignLibrary>) {
        while lib.yield_now() > 0 {
            thread::sleep(self.options.poll_interval());
        }
    }

    /// Execute a call on the current thread (single-thread mode and
    /// re-entrant calls from the worker)
    pub(crate) fn execute_direct(
        &self,
        lib: &Arc<dyn ForeignLibrary>,
        operation: &str,
        args: Vec<Value>,
        return_type: &TypeRef,
        mode: super::DispatchMode,
        pace: bool,
    ) -> Outcome {
        use super::DispatchMode;

        let (caller, slot) = self.registry.slot_for_current();
        if pace {
            self.before_op();
        }

        let outcome = match mode {
            DispatchMode::Blocking => {
                slot.reset();
                self.invoke_blocking(lib, operation, &args, return_type, caller, &slot);
                slot.wait()
            }
            DispatchMode::Async => {
                slot.reset();
                self.invoke_async(lib, operation, &args, return_type, caller, &slot);
                self.await_slot(lib, operation, caller, &slot)
            }
            DispatchMode::Poll => self
                .invoke_poll(lib, operation, &args, return_type, caller)
                .map(|count| {
                    if count > 0 {
                        self.drain(lib);
                    }
                    Value::nil()
                })
                .map_err(BridgeError::Foreign),
        };

        if pace {
            self.after_op();
        }
        outcome
    }

    /// Yield on the current thread until an async result lands in `slot`
    fn await_slot(
        &self,
        lib: &Arc<dyn ForeignLibrary>,
        operation: &str,
        caller: CallerId,
        slot: &WaitSlot,
    ) -> Outcome {
        let mut idle_rounds = 0;
        loop {
            if let Some(outcome) = slot.try_take() {
                return outcome;
            }
            let remaining = {
                let _serving = self.registry.enter(caller);
                lib.yield_now()
            };
            if slot.has_outcome() {
                continue;
            }
            if remaining == 0 {
                idle_rounds += 1;
                if idle_rounds > 1 {
                    slot.clear();
                    return Err(BridgeError::Foreign(ForeignError::new(
                        "AsyncError",
                        format!("{} finished without delivering a result", operation),
                    )));
                }
            } else {
                idle_rounds = 0;
                thread::sleep(self.options.poll_interval());
            }
        }
    }
}
