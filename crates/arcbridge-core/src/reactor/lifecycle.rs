//! Reactor handle and lifecycle
//!
//! ```text
//! stopped --start()--------------------> running (worker thread)
//! stopped --init_single_thread_mode()--> running (single thread)
//! running --stop()---------------------> stopped
//! ```

use super::library::{CallDescriptor, DispatchMode, ForeignLibrary};
use super::options::ReactorOptions;
use super::slots::{CallerId, Outcome, WaitSlot};
use super::state::{ReactorState, ReactorStats};
use super::work::{worker_state, WorkItem, Worker};
use crate::types::{cast, RawValue, Value};
use crate::{BridgeError, BridgeResult};
use crossbeam::channel::{self, Sender};
use parking_lot::RwLock;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

/// Observable reactor state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactorMode {
    /// Not accepting work
    Stopped,
    /// Calls run on the pinned owner thread
    SingleThread,
    /// Calls run on the worker thread
    Worker,
}

enum Lifecycle {
    Stopped,
    SingleThread {
        owner: ThreadId,
        state: Arc<ReactorState>,
    },
    Running {
        tx: Sender<WorkItem>,
        handle: JoinHandle<()>,
        state: Arc<ReactorState>,
    },
}

/// Where a call from the current thread goes
enum Route {
    /// Run on this thread; `pace` applies GC pacing
    Direct { state: Arc<ReactorState>, pace: bool },
    /// Queue for the worker
    Queue {
        tx: Sender<WorkItem>,
        state: Arc<ReactorState>,
    },
}

/// Serializes every foreign call onto one execution context
pub struct Reactor {
    options: ReactorOptions,
    lifecycle: RwLock<Lifecycle>,
}

impl Reactor {
    /// Create a stopped reactor
    pub fn new(options: ReactorOptions) -> Self {
        Self {
            options,
            lifecycle: RwLock::new(Lifecycle::Stopped),
        }
    }

    /// Options this reactor was created with
    pub fn options(&self) -> &ReactorOptions {
        &self.options
    }

    /// Current mode
    pub fn mode(&self) -> ReactorMode {
        match &*self.lifecycle.read() {
            Lifecycle::Stopped => ReactorMode::Stopped,
            Lifecycle::SingleThread { .. } => ReactorMode::SingleThread,
            Lifecycle::Running { .. } => ReactorMode::Worker,
        }
    }

    /// Whether the reactor accepts work
    pub fn is_running(&self) -> bool {
        self.mode() != ReactorMode::Stopped
    }

    /// Spawn the worker thread; no-op when already running
    pub fn start(&self) -> BridgeResult<()> {
        let mut lifecycle = self.lifecycle.write();
        if !matches!(*lifecycle, Lifecycle::Stopped) {
            return Ok(());
        }

        let state = ReactorState::new(self.options.clone());
        let (tx, rx) = channel::unbounded();
        let worker = Worker::new(state.clone(), rx);
        let handle = thread::Builder::new()
            .name("arcbridge-reactor".to_string())
            .spawn(move || worker.run())?;

        *lifecycle = Lifecycle::Running { tx, handle, state };
        log::info!("reactor started in worker mode");
        Ok(())
    }

    /// Pin the calling thread as the only permitted caller
    pub fn init_single_thread_mode(&self) -> BridgeResult<()> {
        let mut lifecycle = self.lifecycle.write();
        let caller = thread::current().id();
        match &*lifecycle {
            Lifecycle::Stopped => {}
            Lifecycle::SingleThread { owner, .. } if *owner == caller => return Ok(()),
            Lifecycle::SingleThread { owner, .. } => {
                return Err(BridgeError::SingleThreadViolation {
                    owner: format!("{:?}", owner),
                    caller: format!("{:?}", caller),
                })
            }
            Lifecycle::Running { .. } => {
                log::warn!("single thread mode requested while the worker is running");
                return Ok(());
            }
        }

        *lifecycle = Lifecycle::SingleThread {
            owner: caller,
            state: ReactorState::new(self.options.clone()),
        };
        log::info!("reactor started in single thread mode on {:?}", caller);
        Ok(())
    }

    /// Drain queued work, join the worker and wake abandoned callers
    pub fn stop(&self) {
        let previous = std::mem::replace(&mut *self.lifecycle.write(), Lifecycle::Stopped);
        let state = match previous {
            Lifecycle::Stopped => return,
            Lifecycle::SingleThread { state, .. } => state,
            Lifecycle::Running { tx, handle, state } => {
                if tx.send(WorkItem::Halt).is_err() {
                    log::warn!("reactor worker exited before halt");
                }
                drop(tx);
                if handle.thread().id() == thread::current().id() {
                    log::warn!("reactor stopped from its own worker; not joining");
                } else {
                    join_with_timeout(handle, self.options.shutdown_timeout() + Duration::from_secs(1));
                }
                state
            }
        };

        let woken = state.registry.abandon_pending();
        log::info!("reactor stopped ({} waiting callers woken)", woken);
    }

    /// Decide where a call from this thread runs
    fn route(&self) -> BridgeResult<Route> {
        match &*self.lifecycle.read() {
            Lifecycle::Stopped => Err(BridgeError::ReactorStopped),
            Lifecycle::SingleThread { owner, state } => {
                let caller = thread::current().id();
                if *owner != caller {
                    return Err(BridgeError::SingleThreadViolation {
                        owner: format!("{:?}", owner),
                        caller: format!("{:?}", caller),
                    });
                }
                Ok(Route::Direct {
                    state: state.clone(),
                    pace: true,
                })
            }
            Lifecycle::Running { tx, state, .. } => match worker_state() {
                Some(current) if Arc::ptr_eq(&current, state) => Ok(Route::Direct {
                    state: current,
                    pace: false,
                }),
                _ => Ok(Route::Queue {
                    tx: tx.clone(),
                    state: state.clone(),
                }),
            },
        }
    }

    /// Submit `build(caller_slot)` and wait for its outcome
    fn submit(
        tx: &Sender<WorkItem>,
        state: &Arc<ReactorState>,
        build: impl FnOnce(CallerId, Arc<WaitSlot>) -> WorkItem,
    ) -> Outcome {
        let (caller, slot) = state.registry.slot_for_current();
        slot.reset();
        if tx.send(build(caller, slot.clone())).is_err() {
            slot.clear();
            return Err(BridgeError::ReactorStopped);
        }
        slot.wait()
    }

    /// Run one foreign operation and wait for its result
    ///
    /// Arguments are checked and cast before any shared memory is allocated.
    pub fn schedule_work(&self, call: &CallDescriptor, args: Vec<RawValue>) -> BridgeResult<Value> {
        if args.len() != call.arg_types.len() {
            return Err(BridgeError::ArityMismatch {
                operation: call.operation.clone(),
                expected: call.arg_types.len(),
                found: args.len(),
            });
        }
        let prepared = call
            .arg_types
            .iter()
            .zip(&args)
            .map(|(ty, raw)| cast(ty, raw))
            .collect::<BridgeResult<Vec<_>>>()?;
        let route = self.route()?;
        let values: Vec<Value> = call
            .arg_types
            .iter()
            .zip(prepared)
            .map(|(ty, c)| Value::from_cast(ty.clone(), c))
            .collect();

        let outcome = match route {
            Route::Direct { state, pace } => state.execute_direct(
                &call.receiver,
                &call.operation,
                values,
                &call.return_type,
                call.mode,
                pace,
            ),
            Route::Queue { tx, state } => {
                let lib = call.receiver.clone();
                let operation = call.operation.clone();
                let return_type = call.return_type.clone();
                let mode = call.mode;
                Self::submit(&tx, &state, move |caller, slot| match mode {
                    DispatchMode::Blocking => WorkItem::Call {
                        lib,
                        operation,
                        args: values,
                        return_type,
                        caller,
                        slot,
                    },
                    DispatchMode::Async => WorkItem::AsyncCall {
                        lib,
                        operation,
                        args: values,
                        return_type,
                        caller,
                        slot,
                    },
                    DispatchMode::Poll => WorkItem::Poll {
                        lib,
                        operation,
                        args: values,
                        return_type,
                        caller,
                        slot,
                    },
                })
            }
        };

        outcome.map_err(|e| match e {
            BridgeError::Foreign(foreign) => BridgeError::Foreign(foreign.with_caller_backtrace()),
            other => other,
        })
    }

    /// Start the reactor if needed and run `lib`'s init entry point
    ///
    /// Attaching the same library twice is a no-op.
    pub fn attach(&self, lib: Arc<dyn ForeignLibrary>) -> BridgeResult<()> {
        if !self.is_running() {
            if self.options.single_thread_mode {
                self.init_single_thread_mode()?;
            } else {
                self.start()?;
            }
        }

        match self.route()? {
            Route::Direct { state, .. } => state.attach(&lib).map_err(BridgeError::Foreign),
            Route::Queue { tx, state } => {
                if state.is_attached(&lib) {
                    return Ok(());
                }
                Self::submit(&tx, &state, move |_, slot| WorkItem::Init { lib, slot }).map(|_| ())
            }
        }
    }

    /// Whether `lib` has been initialized on this reactor run
    pub fn is_attached(&self, lib: &Arc<dyn ForeignLibrary>) -> bool {
        match &*self.lifecycle.read() {
            Lifecycle::Stopped => false,
            Lifecycle::SingleThread { state, .. } | Lifecycle::Running { state, .. } => state.is_attached(lib),
        }
    }

    /// Block until `lib` reports no outstanding jobs
    pub fn await_outstanding(&self, lib: &Arc<dyn ForeignLibrary>) -> BridgeResult<()> {
        match self.route()? {
            Route::Direct { state, .. } => {
                state.drain(lib);
                Ok(())
            }
            Route::Queue { tx, state } => {
                let lib = lib.clone();
                Self::submit(&tx, &state, move |_, slot| WorkItem::Await { lib, slot }).map(|_| ())
            }
        }
    }

    /// Let `lib`'s scheduler advance without waiting
    pub fn yield_now(&self, lib: &Arc<dyn ForeignLibrary>) -> BridgeResult<()> {
        match self.route()? {
            Route::Direct { .. } => {
                lib.yield_now();
                Ok(())
            }
            Route::Queue { tx, .. } => tx
                .send(WorkItem::Yield { lib: lib.clone() })
                .map_err(|_| BridgeError::ReactorStopped),
        }
    }

    /// Run the foreign GC on every attached library and reset pacing
    pub fn collect_garbage(&self) -> BridgeResult<()> {
        match self.route()? {
            Route::Direct { state, .. } => {
                state.run_gc();
                Ok(())
            }
            Route::Queue { tx, state } => {
                Self::submit(&tx, &state, |_, slot| WorkItem::Gc { slot: Some(slot) }).map(|_| ())
            }
        }
    }

    /// Counters of the current run (zero when stopped)
    pub fn stats(&self) -> ReactorStats {
        match &*self.lifecycle.read() {
            Lifecycle::Stopped => ReactorStats::default(),
            Lifecycle::SingleThread { state, .. } | Lifecycle::Running { state, .. } => state.stats(),
        }
    }

    /// Shared state of the current run
    pub fn state(&self) -> Option<Arc<ReactorState>> {
        match &*self.lifecycle.read() {
            Lifecycle::Stopped => None,
            Lifecycle::SingleThread { state, .. } | Lifecycle::Running { state, .. } => Some(state.clone()),
        }
    }
}

impl Default for Reactor {
    fn default() -> Self {
        Self::new(ReactorOptions::default())
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Join a thread with timeout, detach if stuck
fn join_with_timeout(handle: JoinHandle<()>, timeout: Duration) {
    let start = Instant::now();
    loop {
        if handle.is_finished() {
            let _ = handle.join();
            return;
        }
        if start.elapsed() > timeout {
            log::warn!("reactor worker did not exit within {:?}; detaching", timeout);
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::{InitContext, ResultCallback};
    use crate::types::{Type, TypeRef};
    use crate::ForeignError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Echo {
        inits: AtomicUsize,
    }

    impl ForeignLibrary for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn init(&self, _ctx: &InitContext) -> Result<(), ForeignError> {
            self.inits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn call(&self, operation: &str, args: &[Value], return_type: &TypeRef) -> Result<Value, ForeignError> {
            match operation {
                "echo" => Value::new(return_type.clone(), args[0].get())
                    .map_err(|e| ForeignError::new("ArgumentError", e.to_string())),
                other => Err(ForeignError::new("NoMethodError", other)),
            }
        }

        fn call_async(
            &self,
            operation: &str,
            _args: &[Value],
            _caller: CallerId,
            _on_result: ResultCallback,
        ) -> Result<(), ForeignError> {
            Err(ForeignError::new("NoMethodError", operation))
        }

        fn yield_now(&self) -> usize {
            0
        }
    }

    fn echo_call(lib: &Arc<dyn ForeignLibrary>) -> CallDescriptor {
        CallDescriptor::new(lib.clone(), "echo", vec![Type::Int32.into_ref()], Type::Int32.into_ref())
    }

    #[test]
    fn test_stopped_reactor_rejects_work() {
        let reactor = Reactor::default();
        let lib: Arc<dyn ForeignLibrary> = Arc::new(Echo::default());
        assert_eq!(reactor.mode(), ReactorMode::Stopped);
        let err = reactor.schedule_work(&echo_call(&lib), vec![RawValue::Int(1)]).unwrap_err();
        assert!(matches!(err, BridgeError::ReactorStopped));
    }

    #[test]
    fn test_worker_round_trip() {
        let reactor = Reactor::default();
        let echo = Arc::new(Echo::default());
        let lib: Arc<dyn ForeignLibrary> = echo.clone();
        reactor.attach(lib.clone()).unwrap();
        reactor.attach(lib.clone()).unwrap();
        assert_eq!(echo.inits.load(Ordering::SeqCst), 1);
        assert_eq!(reactor.mode(), ReactorMode::Worker);

        let value = reactor.schedule_work(&echo_call(&lib), vec![RawValue::Int(42)]).unwrap();
        assert_eq!(value.get(), RawValue::Int(42));
        assert_eq!(reactor.stats().operations, 1);

        reactor.stop();
        assert!(!reactor.is_running());
        assert_eq!(reactor.stats(), ReactorStats::default());
    }

    #[test]
    fn test_arity_checked_before_dispatch() {
        let reactor = Reactor::default();
        let lib: Arc<dyn ForeignLibrary> = Arc::new(Echo::default());
        let err = reactor.schedule_work(&echo_call(&lib), vec![]).unwrap_err();
        assert!(matches!(err, BridgeError::ArityMismatch { expected: 1, found: 0, .. }));
    }

    #[test]
    fn test_single_thread_mode_runs_inline() {
        let reactor = Reactor::new(ReactorOptions::single_threaded());
        let lib: Arc<dyn ForeignLibrary> = Arc::new(Echo::default());
        reactor.attach(lib.clone()).unwrap();
        assert_eq!(reactor.mode(), ReactorMode::SingleThread);
        let value = reactor.schedule_work(&echo_call(&lib), vec![RawValue::Int(7)]).unwrap();
        assert_eq!(value.get(), RawValue::Int(7));
    }
}
