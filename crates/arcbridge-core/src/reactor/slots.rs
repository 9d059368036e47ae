//! Per-caller wait slots
//!
//! Every host thread that submits work gets a [`CallerId`] and one
//! [`WaitSlot`] per reactor. The foreign side only ever sees the id; results
//! and errors are routed back through the [`WaitRegistry`]. Slots are removed
//! when their thread exits.

use crate::types::Value;
use crate::BridgeError;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Result of one call
pub type Outcome = Result<Value, BridgeError>;

static NEXT_CALLER_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a host thread as seen by the foreign side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallerId(u64);

impl CallerId {
    /// Sentinel meaning "whichever caller the reactor is currently running"
    pub const CURRENT_CONTEXT: CallerId = CallerId(0);

    /// Id of the calling thread
    pub fn current() -> Self {
        THREAD_SLOTS
            .try_with(|slots| slots.id)
            .unwrap_or_else(|_| CallerId(NEXT_CALLER_ID.fetch_add(1, Ordering::Relaxed)))
    }

    /// Get the raw ID value
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Create from raw value
    pub fn from_u64(id: u64) -> Self {
        Self(id)
    }

    /// Whether this is [`CallerId::CURRENT_CONTEXT`]
    pub fn is_current_context(&self) -> bool {
        self.0 == 0
    }
}

/// Thread-local record of the registries holding this thread's slot
struct ThreadSlots {
    id: CallerId,
    registries: RefCell<Vec<Weak<WaitRegistry>>>,
}

impl Drop for ThreadSlots {
    fn drop(&mut self) {
        for registry in self.registries.get_mut().drain(..) {
            if let Some(registry) = registry.upgrade() {
                registry.slots.remove(&self.id);
            }
        }
    }
}

thread_local! {
    static THREAD_SLOTS: ThreadSlots = ThreadSlots {
        id: CallerId(NEXT_CALLER_ID.fetch_add(1, Ordering::Relaxed)),
        registries: RefCell::new(Vec::new()),
    };
}

#[derive(Default)]
struct SlotState {
    outcome: Option<Outcome>,
    pending: bool,
}

/// Mutex, condition variable and result slot of one caller
#[derive(Default)]
pub struct WaitSlot {
    state: Mutex<SlotState>,
    ready: Condvar,
}

impl WaitSlot {
    /// Create an idle slot
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the slot for a new call, discarding any stale outcome
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.outcome = None;
        state.pending = true;
    }

    /// Store an outcome, replacing any earlier one, and wake the waiter
    pub fn complete(&self, outcome: Outcome) {
        let mut state = self.state.lock();
        state.outcome = Some(outcome);
        self.ready.notify_all();
    }

    /// Store an outcome unless one is already present
    ///
    /// Returns whether the outcome was stored.
    pub fn complete_if_empty(&self, outcome: Outcome) -> bool {
        let mut state = self.state.lock();
        if state.outcome.is_some() {
            return false;
        }
        state.outcome = Some(outcome);
        self.ready.notify_all();
        true
    }

    /// Block until an outcome is stored, then take it
    pub fn wait(&self) -> Outcome {
        let mut state = self.state.lock();
        loop {
            if let Some(outcome) = state.outcome.take() {
                state.pending = false;
                return outcome;
            }
            self.ready.wait(&mut state);
        }
    }

    /// Take the outcome if one is stored
    pub fn try_take(&self) -> Option<Outcome> {
        let mut state = self.state.lock();
        let outcome = state.outcome.take();
        if outcome.is_some() {
            state.pending = false;
        }
        outcome
    }

    /// Whether an outcome is stored
    pub fn has_outcome(&self) -> bool {
        self.state.lock().outcome.is_some()
    }

    /// Whether a caller is waiting and nothing has been stored yet
    pub fn is_pending(&self) -> bool {
        let state = self.state.lock();
        state.pending && state.outcome.is_none()
    }

    /// Disarm the slot without an outcome
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.outcome = None;
        state.pending = false;
    }
}

/// Wait slots of every caller, plus the caller currently being served
#[derive(Default)]
pub struct WaitRegistry {
    slots: DashMap<CallerId, Arc<WaitSlot>>,
    current: AtomicU64,
}

impl WaitRegistry {
    /// Create an empty registry
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Slot of the calling thread, created on first use
    pub fn slot_for_current(self: &Arc<Self>) -> (CallerId, Arc<WaitSlot>) {
        let id = CallerId::current();
        if let Some(slot) = self.slots.get(&id) {
            return (id, slot.value().clone());
        }

        let slot = Arc::new(WaitSlot::new());
        self.slots.insert(id, slot.clone());
        let weak = Arc::downgrade(self);
        let _ = THREAD_SLOTS.try_with(|slots| slots.registries.borrow_mut().push(weak));
        (id, slot)
    }

    /// Resolve [`CallerId::CURRENT_CONTEXT`] to the caller being served
    pub fn resolve(&self, caller: CallerId) -> CallerId {
        if caller.is_current_context() {
            CallerId(self.current.load(Ordering::Acquire))
        } else {
            caller
        }
    }

    /// Slot registered for `caller` (after resolving the sentinel)
    pub fn get(&self, caller: CallerId) -> Option<Arc<WaitSlot>> {
        let caller = self.resolve(caller);
        self.slots.get(&caller).map(|slot| slot.value().clone())
    }

    /// Mark `caller` as the one being served
    ///
    /// Dropping the guard restores an outer caller; at the top level the
    /// caller stays current, so exceptions raised later from inside a yield
    /// still reach it.
    pub fn enter(&self, caller: CallerId) -> CurrentCallerGuard<'_> {
        let previous = self.current.swap(caller.as_u64(), Ordering::AcqRel);
        CurrentCallerGuard {
            registry: self,
            previous,
        }
    }

    /// Caller being served, or the last one served when idle
    /// (`CURRENT_CONTEXT` before the first call)
    pub fn current(&self) -> CallerId {
        CallerId(self.current.load(Ordering::Acquire))
    }

    /// Number of registered slots
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no slots are registered
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Wake every caller still waiting with `ReactorStopped`
    pub(crate) fn abandon_pending(&self) -> usize {
        let mut woken = 0;
        for entry in self.slots.iter() {
            if entry.value().is_pending() {
                entry.value().complete_if_empty(Err(BridgeError::ReactorStopped));
                woken += 1;
            }
        }
        woken
    }
}

/// Restores the outer caller of a nested call on drop
pub struct CurrentCallerGuard<'a> {
    registry: &'a WaitRegistry,
    previous: u64,
}

impl Drop for CurrentCallerGuard<'_> {
    fn drop(&mut self) {
        if self.previous != 0 {
            self.registry.current.store(self.previous, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_caller_ids_are_per_thread() {
        let here = CallerId::current();
        assert_eq!(here, CallerId::current());
        let there = thread::spawn(CallerId::current).join().unwrap();
        assert_ne!(here, there);
        assert!(!here.is_current_context());
    }

    #[test]
    fn test_wait_receives_completion_from_other_thread() {
        let slot = Arc::new(WaitSlot::new());
        slot.reset();
        let completer = slot.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            completer.complete(Ok(Value::nil()));
        });
        assert!(slot.wait().unwrap().is_nil());
        assert!(!slot.is_pending());
        handle.join().unwrap();
    }

    #[test]
    fn test_error_wins_over_later_result() {
        let slot = WaitSlot::new();
        slot.reset();
        slot.complete(Err(BridgeError::ReactorStopped));
        assert!(!slot.complete_if_empty(Ok(Value::nil())));
        assert!(matches!(slot.wait(), Err(BridgeError::ReactorStopped)));
    }

    #[test]
    fn test_current_context_resolution() {
        let registry = WaitRegistry::new();
        let (id, _slot) = registry.slot_for_current();
        {
            let _guard = registry.enter(id);
            assert_eq!(registry.resolve(CallerId::CURRENT_CONTEXT), id);
            assert!(registry.get(CallerId::CURRENT_CONTEXT).is_some());
        }
        assert_eq!(registry.current(), id);
        assert_eq!(registry.resolve(CallerId::CURRENT_CONTEXT), id);
    }

    #[test]
    fn test_nested_caller_restores_outer() {
        let registry = WaitRegistry::new();
        assert_eq!(registry.current(), CallerId::CURRENT_CONTEXT);
        let outer = CallerId::from_u64(7);
        let inner = CallerId::from_u64(8);
        let _outer = registry.enter(outer);
        {
            let _inner = registry.enter(inner);
            assert_eq!(registry.current(), inner);
        }
        assert_eq!(registry.current(), outer);
    }

    #[test]
    fn test_slots_pruned_on_thread_exit() {
        let registry = WaitRegistry::new();
        let remote = registry.clone();
        thread::spawn(move || {
            remote.slot_for_current();
            assert_eq!(remote.len(), 1);
        })
        .join()
        .unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_abandon_pending() {
        let registry = WaitRegistry::new();
        let (_, slot) = registry.slot_for_current();
        slot.reset();
        assert_eq!(registry.abandon_pending(), 1);
        assert!(matches!(slot.wait(), Err(BridgeError::ReactorStopped)));
    }
}
