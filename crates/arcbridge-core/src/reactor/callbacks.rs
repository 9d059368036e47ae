//! Callbacks the foreign side uses to report results and exceptions

use super::slots::{CallerId, WaitRegistry};
use crate::types::{TypeRef, Value};
use crate::{BridgeError, ForeignError};
use std::fmt;
use std::sync::Arc;

/// Delivers async results of one return type
#[derive(Clone)]
pub struct ResultCallback {
    return_type: TypeRef,
    registry: Arc<WaitRegistry>,
}

impl ResultCallback {
    pub(crate) fn new(return_type: TypeRef, registry: Arc<WaitRegistry>) -> Self {
        Self {
            return_type,
            registry,
        }
    }

    /// Return type this callback decodes
    pub fn return_type(&self) -> &TypeRef {
        &self.return_type
    }

    /// Hand `value` to the caller waiting under `caller`
    pub fn deliver(&self, caller: CallerId, value: Value) {
        match self.registry.get(caller) {
            Some(slot) => {
                if !slot.complete_if_empty(Ok(value)) {
                    log::debug!("result for caller {} arrived after an error", caller.as_u64());
                }
            }
            None => log::warn!("dropping result for unknown caller {}", caller.as_u64()),
        }
    }

    /// Decode the element in `slot` (reference transferred) and deliver it
    ///
    /// # Safety
    ///
    /// `slot` must hold one element of the return type, as for
    /// [`Value::decode_owned`].
    pub unsafe fn deliver_raw(&self, caller: CallerId, slot: *const u8) {
        let value = Value::decode_owned(self.return_type.clone(), slot);
        self.deliver(caller, value);
    }
}

impl fmt::Debug for ResultCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResultCallback({})", self.return_type)
    }
}

/// Routes foreign exceptions to the caller that triggered them
#[derive(Clone)]
pub struct ErrorCallback {
    registry: Arc<WaitRegistry>,
}

impl ErrorCallback {
    pub(crate) fn new(registry: Arc<WaitRegistry>) -> Self {
        Self { registry }
    }

    /// Report an exception; `backtrace` is a JSON array of frames
    ///
    /// Caller 0 means the caller currently being served.
    pub fn raise(&self, kind: &str, message: &str, backtrace: &str, caller: CallerId) {
        let frames = if backtrace.trim().is_empty() {
            Vec::new()
        } else {
            serde_json::from_str::<Vec<String>>(backtrace).unwrap_or_else(|e| {
                log::warn!("unparseable foreign backtrace ({}), keeping it verbatim", e);
                vec![backtrace.to_string()]
            })
        };
        self.raise_error(ForeignError::new(kind, message).with_backtrace(frames), caller);
    }

    /// Report an already-built exception
    pub fn raise_error(&self, error: ForeignError, caller: CallerId) {
        let resolved = self.registry.resolve(caller);
        match self.registry.get(resolved) {
            Some(slot) => slot.complete(Err(BridgeError::Foreign(error))),
            None => log::error!(
                "dropping foreign exception for unknown caller {}: {}",
                resolved.as_u64(),
                error
            ),
        }
    }
}

impl fmt::Debug for ErrorCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ErrorCallback")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RawValue, Type};

    #[test]
    fn test_deliver_to_registered_caller() {
        let registry = WaitRegistry::new();
        let (id, slot) = registry.slot_for_current();
        slot.reset();
        let callback = ResultCallback::new(Type::Int32.into_ref(), registry.clone());
        callback.deliver(id, Value::new(Type::Int32.into_ref(), 9).unwrap());
        assert_eq!(slot.wait().unwrap().get(), RawValue::Int(9));
    }

    #[test]
    fn test_deliver_raw_takes_ownership() {
        let registry = WaitRegistry::new();
        let (id, slot) = registry.slot_for_current();
        slot.reset();
        let ty = Type::String.into_ref();
        let callback = ResultCallback::new(ty.clone(), registry.clone());
        let ptr = Value::new(ty, "done").unwrap().into_raw_ptr().unwrap();
        let cell = (ptr as usize as u64).to_ne_bytes();
        unsafe { callback.deliver_raw(id, cell.as_ptr()) };
        let value = slot.wait().unwrap();
        assert_eq!(value.ref_count(), Some(1));
        assert_eq!(value.get(), RawValue::from("done"));
    }

    #[test]
    fn test_raise_parses_backtrace() {
        let registry = WaitRegistry::new();
        let (id, slot) = registry.slot_for_current();
        slot.reset();
        let callback = ErrorCallback::new(registry.clone());
        callback.raise("RuntimeError", "Exception", r#"["a.cr:1","b.cr:2"]"#, id);
        match slot.wait() {
            Err(BridgeError::Foreign(e)) => {
                assert_eq!(e.kind, "RuntimeError");
                assert_eq!(e.backtrace, vec!["a.cr:1", "b.cr:2"]);
            }
            other => panic!("unexpected outcome: {:?}", other.map(|v| v.get())),
        }
    }

    #[test]
    fn test_raise_with_current_context() {
        let registry = WaitRegistry::new();
        let (id, slot) = registry.slot_for_current();
        slot.reset();
        let callback = ErrorCallback::new(registry.clone());
        {
            let _serving = registry.enter(id);
            callback.raise("ArgumentError", "bad", "", CallerId::CURRENT_CONTEXT);
        }
        assert!(matches!(slot.wait(), Err(BridgeError::Foreign(e)) if e.kind == "ArgumentError"));
    }

    #[test]
    fn test_unknown_caller_is_dropped() {
        let registry = WaitRegistry::new();
        let callback = ErrorCallback::new(registry);
        callback.raise("RuntimeError", "lost", "[]", CallerId::from_u64(u64::MAX));
    }
}
