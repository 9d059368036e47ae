//! Work items and the worker loop
//!
//! The worker is the only thread that runs foreign code while the reactor is
//! in worker mode. It takes items from one FIFO channel and interleaves them
//! with delayed yields kept in a min-heap (one yield chain per library).

use super::library::{library_key, ForeignLibrary};
use super::slots::{CallerId, WaitSlot};
use super::state::ReactorState;
use crate::types::{TypeRef, Value};
use crate::{BridgeError, ForeignError};
use crossbeam::channel::{Receiver, RecvTimeoutError, TryRecvError};
use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

/// One unit of work for the reactor thread
pub(crate) enum WorkItem {
    /// Blocking call
    Call {
        lib: Arc<dyn ForeignLibrary>,
        operation: String,
        args: Vec<Value>,
        return_type: TypeRef,
        caller: CallerId,
        slot: Arc<WaitSlot>,
    },
    /// Async call; completion arrives through the result callback
    AsyncCall {
        lib: Arc<dyn ForeignLibrary>,
        operation: String,
        args: Vec<Value>,
        return_type: TypeRef,
        caller: CallerId,
        slot: Arc<WaitSlot>,
    },
    /// Operation returning an outstanding-job count
    Poll {
        lib: Arc<dyn ForeignLibrary>,
        operation: String,
        args: Vec<Value>,
        return_type: TypeRef,
        caller: CallerId,
        slot: Arc<WaitSlot>,
    },
    /// Wait for a library's outstanding jobs to drain
    Await {
        lib: Arc<dyn ForeignLibrary>,
        slot: Arc<WaitSlot>,
    },
    /// Start a yield chain without waiting
    Yield { lib: Arc<dyn ForeignLibrary> },
    /// Run the foreign GC now
    Gc { slot: Option<Arc<WaitSlot>> },
    /// Run a library's init entry point
    Init {
        lib: Arc<dyn ForeignLibrary>,
        slot: Arc<WaitSlot>,
    },
    /// Stop after draining
    Halt,
}

impl WorkItem {
    fn slot(&self) -> Option<Arc<WaitSlot>> {
        match self {
            WorkItem::Call { slot, .. }
            | WorkItem::AsyncCall { slot, .. }
            | WorkItem::Poll { slot, .. }
            | WorkItem::Await { slot, .. }
            | WorkItem::Init { slot, .. } => Some(slot.clone()),
            WorkItem::Gc { slot } => slot.clone(),
            WorkItem::Yield { .. } | WorkItem::Halt => None,
        }
    }
}

/// Timer entry for a library's next yield (min-heap by due time)
struct DelayedYield {
    due: Instant,
    key: usize,
}

impl Ord for DelayedYield {
    fn cmp(&self, other: &Self) -> Ordering {
        other.due.cmp(&self.due) // reverse for min-heap
    }
}

impl PartialOrd for DelayedYield {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for DelayedYield {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due
    }
}

impl Eq for DelayedYield {}

/// Active yield chain of one library
struct Chain {
    lib: Arc<dyn ForeignLibrary>,
    waiters: Vec<Arc<WaitSlot>>,
}

thread_local! {
    static WORKER_STATE: RefCell<Option<Arc<ReactorState>>> = const { RefCell::new(None) };
}

/// State of the reactor whose worker is the current thread, if any
pub(crate) fn worker_state() -> Option<Arc<ReactorState>> {
    WORKER_STATE.try_with(|s| s.borrow().clone()).ok().flatten()
}

pub(crate) struct Worker {
    state: Arc<ReactorState>,
    rx: Receiver<WorkItem>,
    delayed: BinaryHeap<DelayedYield>,
    chains: FxHashMap<usize, Chain>,
}

impl Worker {
    pub(crate) fn new(state: Arc<ReactorState>, rx: Receiver<WorkItem>) -> Self {
        Self {
            state,
            rx,
            delayed: BinaryHeap::new(),
            chains: FxHashMap::default(),
        }
    }

    /// Main loop; returns after a halt has been drained
    pub(crate) fn run(mut self) {
        WORKER_STATE.with(|s| *s.borrow_mut() = Some(self.state.clone()));
        log::debug!("reactor worker started");

        loop {
            let next = match self.delayed.peek() {
                Some(entry) => {
                    let timeout = entry.due.saturating_duration_since(Instant::now());
                    self.rx.recv_timeout(timeout)
                }
                None => self.rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };

            match next {
                Ok(WorkItem::Halt) => break,
                Ok(item) => self.handle(item),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            self.run_due_yields();
        }

        self.drain();
        WORKER_STATE.with(|s| *s.borrow_mut() = None);
        log::debug!("reactor worker stopped");
    }

    /// Finish queued work, then service yields until none remain or the
    /// shutdown timeout elapses
    fn drain(&mut self) {
        loop {
            match self.rx.try_recv() {
                Ok(WorkItem::Halt) => {}
                Ok(item) => self.handle(item),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }

        let deadline = Instant::now() + self.state.options.shutdown_timeout();
        while let Some(entry) = self.delayed.peek() {
            let now = Instant::now();
            if now >= deadline {
                log::warn!("reactor stopped with {} yield chains outstanding", self.chains.len());
                break;
            }
            if entry.due > now {
                std::thread::sleep(entry.due.min(deadline) - now);
            }
            self.run_due_yields();
        }

        for (_, chain) in self.chains.drain() {
            for waiter in chain.waiters {
                waiter.complete_if_empty(Err(BridgeError::ReactorStopped));
            }
        }
    }

    /// Run one item, containing panics from foreign code
    fn handle(&mut self, item: WorkItem) {
        let slot = item.slot();
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.dispatch(item)));
        if result.is_err() {
            log::error!("work item panicked; reactor continues");
            if let Some(slot) = slot {
                slot.complete_if_empty(Err(BridgeError::Foreign(ForeignError::new(
                    "Panic",
                    "foreign operation panicked",
                ))));
            }
        }
    }

    fn dispatch(&mut self, item: WorkItem) {
        let state = self.state.clone();
        match item {
            WorkItem::Call {
                lib,
                operation,
                args,
                return_type,
                caller,
                slot,
            } => {
                state.before_op();
                state.invoke_blocking(&lib, &operation, &args, &return_type, caller, &slot);
                state.after_op();
            }
            WorkItem::AsyncCall {
                lib,
                operation,
                args,
                return_type,
                caller,
                slot,
            } => {
                state.before_op();
                state.invoke_async(&lib, &operation, &args, &return_type, caller, &slot);
                self.ensure_chain(&lib, None);
                state.after_op();
            }
            WorkItem::Poll {
                lib,
                operation,
                args,
                return_type,
                caller,
                slot,
            } => {
                state.before_op();
                match state.invoke_poll(&lib, &operation, &args, &return_type, caller) {
                    Ok(0) => {
                        slot.complete_if_empty(Ok(Value::nil()));
                    }
                    Ok(_) => self.ensure_chain(&lib, Some(slot)),
                    Err(e) => slot.complete(Err(BridgeError::Foreign(e))),
                }
                state.after_op();
            }
            WorkItem::Await { lib, slot } => self.ensure_chain(&lib, Some(slot)),
            WorkItem::Yield { lib } => self.ensure_chain(&lib, None),
            WorkItem::Gc { slot } => {
                state.run_gc();
                if let Some(slot) = slot {
                    slot.complete_if_empty(Ok(Value::nil()));
                }
            }
            WorkItem::Init { lib, slot } => match state.attach(&lib) {
                Ok(()) => {
                    slot.complete_if_empty(Ok(Value::nil()));
                }
                Err(e) => slot.complete(Err(BridgeError::Foreign(e))),
            },
            WorkItem::Halt => {}
        }
    }

    /// Join or start the yield chain of `lib`
    fn ensure_chain(&mut self, lib: &Arc<dyn ForeignLibrary>, waiter: Option<Arc<WaitSlot>>) {
        let key = library_key(lib);
        if !self.chains.contains_key(&key) {
            self.chains.insert(
                key,
                Chain {
                    lib: lib.clone(),
                    waiters: Vec::new(),
                },
            );
            self.delayed.push(DelayedYield {
                due: Instant::now(),
                key,
            });
        }
        if let (Some(waiter), Some(chain)) = (waiter, self.chains.get_mut(&key)) {
            chain.waiters.push(waiter);
        }
    }

    fn run_due_yields(&mut self) {
        let now = Instant::now();
        while self.delayed.peek().map_or(false, |entry| entry.due <= now) {
            if let Some(entry) = self.delayed.pop() {
                self.probe(entry.key);
            }
        }
    }

    /// Yield once; end the chain at zero outstanding jobs, otherwise re-arm
    fn probe(&mut self, key: usize) {
        let lib = match self.chains.get(&key) {
            Some(chain) => chain.lib.clone(),
            None => return,
        };

        let outstanding = match panic::catch_unwind(AssertUnwindSafe(|| lib.yield_now())) {
            Ok(n) => n,
            Err(_) => {
                log::error!("yield on {} panicked; ending its chain", lib.name());
                0
            }
        };

        if outstanding == 0 {
            if let Some(chain) = self.chains.remove(&key) {
                for waiter in chain.waiters {
                    waiter.complete_if_empty(Ok(Value::nil()));
                }
            }
        } else {
            self.delayed.push(DelayedYield {
                due: Instant::now() + self.state.options.poll_interval(),
                key,
            });
        }
    }
}
