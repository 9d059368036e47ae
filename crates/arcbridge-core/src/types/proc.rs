//! Host closures callable from foreign code
//!
//! A Proc block stores a C function pointer and a context address. Host
//! closures all share [`proc_trampoline`]; the context is the address of a
//! [`ProcEntry`] kept alive in the heap's [`ProcRegistry`] until the block is
//! released.
//!
//! Calling convention: `args` is packed like a Tuple payload of the argument
//! types and stays owned by the caller; `ret` is one zeroed slot of the return
//! type whose reference (if any) is transferred to the caller.

use super::cast::{cast, Cast};
use super::codec::{self, Depth};
use super::raw::{HostProc, RawValue};
use super::{Type, TypeRef, Value};
use crate::memory::{read_ptr, BlockPtr, Heap};
use crate::{BridgeError, BridgeResult};
use dashmap::DashMap;
use std::ffi::c_void;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Signature stored in every Proc block
pub type ProcFn = unsafe extern "C" fn(ctx: *const c_void, args: *const u8, ret: *mut u8);

/// A registered host closure and its signature
pub struct ProcEntry {
    pub(crate) callable: HostProc,
    pub(crate) arg_types: Vec<TypeRef>,
    pub(crate) ret: TypeRef,
}

/// Live host closures, keyed by context address
#[derive(Default)]
pub struct ProcRegistry {
    entries: DashMap<usize, Arc<ProcEntry>>,
}

impl ProcRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, callable: HostProc, arg_types: Vec<TypeRef>, ret: TypeRef) -> usize {
        let entry = Arc::new(ProcEntry {
            callable,
            arg_types,
            ret,
        });
        let ctx = Arc::as_ptr(&entry) as usize;
        self.entries.insert(ctx, entry);
        ctx
    }

    pub(crate) fn get(&self, ctx: usize) -> Option<Arc<ProcEntry>> {
        self.entries.get(&ctx).map(|entry| entry.value().clone())
    }

    pub(crate) fn unregister(&self, ctx: usize) {
        self.entries.remove(&ctx);
    }

    /// Number of live closures
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no closures are live
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Entry point of every host closure
///
/// Panics and unstorable return values are logged and leave `ret` zeroed.
///
/// # Safety
///
/// `ctx` must come from a Proc block; `args` and `ret` must follow the
/// calling convention for the registered signature.
pub unsafe extern "C" fn proc_trampoline(ctx: *const c_void, args: *const u8, ret: *mut u8) {
    let entry = match Heap::global().procs().get(ctx as usize) {
        Some(entry) => entry,
        None => {
            log::error!("proc context {:p} is not registered", ctx);
            return;
        }
    };
    if args.is_null() && !entry.arg_types.is_empty() {
        log::error!("proc called with null arguments");
        return;
    }

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        let offsets = Type::field_offsets(&entry.arg_types);
        let decoded: Vec<RawValue> = entry
            .arg_types
            .iter()
            .zip(offsets)
            .map(|(ty, offset)| codec::fetch_single(ty, args.add(offset), Depth::Shallow))
            .collect();
        let out = entry.callable.call(&decoded);
        let prepared = cast(&entry.ret, &out)?;
        if !ret.is_null() {
            codec::write_single(&entry.ret, ret, prepared);
        }
        Ok::<(), BridgeError>(())
    }));

    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::error!("proc returned an unstorable value: {}", e),
        Err(_) => log::error!("host proc panicked"),
    }
}

impl Value {
    /// Invoke a Proc value (host or foreign)
    pub fn call(&self, args: &[RawValue]) -> BridgeResult<Value> {
        let (arg_types, ret_ty) = match &**self.ty() {
            Type::Proc(arg_types, ret_ty) => (arg_types, ret_ty),
            other => {
                return Err(BridgeError::TypeMismatch {
                    expected: "Proc".to_string(),
                    found: other.to_string(),
                })
            }
        };
        if args.len() != arg_types.len() {
            return Err(BridgeError::ArityMismatch {
                operation: self.ty().to_string(),
                expected: arg_types.len(),
                found: args.len(),
            });
        }
        let prepared = arg_types
            .iter()
            .zip(args)
            .map(|(ty, arg)| cast(ty, arg))
            .collect::<BridgeResult<Vec<Cast>>>()?;

        let block = self
            .block()
            .ok_or_else(|| BridgeError::ProcFailed("proc has no block".to_string()))?;
        let (fn_ptr, ctx) = unsafe { (read_ptr(block.payload()), read_ptr(block.payload().add(8))) };
        if fn_ptr.is_null() {
            return Err(BridgeError::ProcFailed("proc has no function pointer".to_string()));
        }
        // SAFETY: Proc blocks only ever store a `ProcFn`.
        let func: ProcFn = unsafe { std::mem::transmute::<*mut u8, ProcFn>(fn_ptr) };

        let offsets = Type::field_offsets(arg_types);
        let size: usize = arg_types.iter().map(|t| t.refsize()).sum();
        let mut args_buf = vec![0u8; size.max(1)];
        let mut ret_buf = vec![0u8; ret_ty.refsize().max(8)];

        unsafe {
            for ((ty, offset), item) in arg_types.iter().zip(&offsets).zip(prepared) {
                codec::write_single(ty, args_buf.as_mut_ptr().add(*offset), item);
            }

            func(ctx as *const c_void, args_buf.as_ptr(), ret_buf.as_mut_ptr());

            for (ty, offset) in arg_types.iter().zip(&offsets) {
                if ty.is_ref_counted() {
                    if let Some(arg) = BlockPtr::from_raw(read_ptr(args_buf.as_ptr().add(*offset))) {
                        codec::release(ty, arg);
                    }
                }
            }

            if ret_ty.is_ref_counted() && read_ptr(ret_buf.as_ptr()).is_null() {
                return Err(BridgeError::ProcFailed(format!("proc returned no {}", ret_ty)));
            }
            Ok(Value::decode_owned(ret_ty.clone(), ret_buf.as_ptr()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adder() -> Value {
        let ty = Type::proc(
            vec![Type::Int32.into_ref(), Type::Int32.into_ref()],
            Type::Int32.into_ref(),
        );
        let add = HostProc::new(|args| {
            let a = args[0].as_i64().unwrap_or(0);
            let b = args[1].as_i64().unwrap_or(0);
            RawValue::Int(a + b)
        });
        Value::new(ty, add).unwrap()
    }

    #[test]
    fn test_call_through_trampoline() {
        let proc = adder();
        let out = proc.call(&[2.into(), 40.into()]).unwrap();
        assert_eq!(out.get(), RawValue::Int(42));
    }

    #[test]
    fn test_call_arity_mismatch() {
        let proc = adder();
        assert!(matches!(
            proc.call(&[1.into()]),
            Err(BridgeError::ArityMismatch { expected: 2, found: 1, .. })
        ));
    }

    #[test]
    fn test_string_round_trip() {
        let ty = Type::proc(vec![Type::String.into_ref()], Type::String.into_ref());
        let shout = HostProc::new(|args| {
            let s = args[0].resolve();
            RawValue::Str(s.as_str().unwrap_or_default().to_uppercase())
        });
        let proc = Value::new(ty, shout).unwrap();
        let out = proc.call(&["hey".into()]).unwrap();
        assert_eq!(out.ref_count(), Some(1));
        assert_eq!(out.get(), RawValue::from("HEY"));
    }

    #[test]
    fn test_panicking_closure_is_contained() {
        let ty = Type::proc(vec![], Type::String.into_ref());
        let boom = HostProc::new(|_| panic!("boom"));
        let proc = Value::new(ty, boom).unwrap();
        assert!(matches!(proc.call(&[]), Err(BridgeError::ProcFailed(_))));
    }

    #[test]
    fn test_registry_entry_removed_on_release() {
        let ty = Type::proc(vec![], Type::Nil.into_ref());
        let proc = Value::new(ty, HostProc::new(|_| RawValue::Nil)).unwrap();
        let ctx = unsafe { read_ptr(proc.block().unwrap().payload().add(8)) } as usize;
        assert!(Heap::global().procs().get(ctx).is_some());
        drop(proc);
        assert!(Heap::global().procs().get(ctx).is_none());
    }

    #[test]
    fn test_get_returns_host_closure() {
        let callable = HostProc::new(|_| RawValue::Nil);
        let ty = Type::proc(vec![], Type::Nil.into_ref());
        let proc = Value::new(ty, callable.clone()).unwrap();
        assert_eq!(proc.get(), RawValue::Proc(callable));
    }
}
