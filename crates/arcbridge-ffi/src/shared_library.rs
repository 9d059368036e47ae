//! [`ForeignLibrary`] backed by a shared object
//!
//! Symbols follow one convention, all prefixed with the library's prefix:
//!
//! ```text
//! {prefix}init(name, on_error, error_ctx, mutex)
//! {prefix}yield() -> int                      outstanding async jobs
//! {prefix}gc()                                optional
//! {prefix}{op}(args, ret)                     blocking operation
//! {prefix}{op}_async(args, caller_id, on_result, result_ctx)
//! ```
//!
//! `args` is packed like a Tuple payload of the argument types and stays
//! owned by the host; `ret` is one zeroed slot of the return type whose
//! reference is transferred to the host.

use crate::loader::{Library, LoadError};
use crate::{arcbridge_deliver_result, arcbridge_raise_error, ErrorFn, ResultFn};
use arcbridge_core::{CallerId, ErrorCallback, ForeignError, ForeignLibrary, InitContext, ResultCallback, Type, TypeRef, Value};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::ffi::{c_void, CString};
use std::os::raw::{c_char, c_int};
use std::path::Path;

type InitFn = unsafe extern "C" fn(name: *const c_char, on_error: ErrorFn, error_ctx: *const c_void, mutex: *mut c_void);
type YieldFn = unsafe extern "C" fn() -> c_int;
type GcFn = unsafe extern "C" fn();
type CallFn = unsafe extern "C" fn(args: *const u8, ret: *mut u8);
type AsyncFn = unsafe extern "C" fn(args: *const u8, caller_id: u64, on_result: ResultFn, result_ctx: *const c_void);

/// Packed argument buffer; releases the references it holds on drop
struct ArgBuffer {
    bytes: Vec<u8>,
    slots: Vec<(TypeRef, usize)>,
}

impl ArgBuffer {
    fn pack(args: &[Value]) -> Self {
        let types: Vec<TypeRef> = args.iter().map(|v| v.ty().clone()).collect();
        let offsets = Type::field_offsets(&types);
        let size = types.iter().map(|t| t.refsize()).sum::<usize>();
        let mut bytes = vec![0u8; size.max(8)];
        for (value, &offset) in args.iter().zip(&offsets) {
            unsafe { value.encode_into(bytes.as_mut_ptr().add(offset)) };
        }
        Self {
            bytes,
            slots: types.into_iter().zip(offsets).collect(),
        }
    }

    fn as_ptr(&self) -> *const u8 {
        self.bytes.as_ptr()
    }
}

impl Drop for ArgBuffer {
    fn drop(&mut self) {
        for (ty, offset) in self.slots.drain(..) {
            drop(unsafe { Value::decode_owned(ty, self.bytes.as_ptr().add(offset)) });
        }
    }
}

fn missing_operation(e: LoadError) -> ForeignError {
    ForeignError::new("NoMethodError", e.to_string())
}

/// A foreign library loaded from a shared object
pub struct SharedLibrary {
    library: Library,
    name: String,
    prefix: String,
    yield_fn: YieldFn,
    gc_fn: Option<GcFn>,
    /// Contexts handed to `{prefix}init`; boxed so their addresses stay fixed
    error_contexts: Mutex<Vec<Box<ErrorCallback>>>,
    operations: Mutex<FxHashMap<String, usize>>,
}

impl SharedLibrary {
    /// Open `path` and resolve the entry points under `prefix`
    ///
    /// `{prefix}init` and `{prefix}yield` are required; operations are
    /// resolved on first use.
    pub fn open<P: AsRef<Path>>(path: P, prefix: &str) -> Result<Self, LoadError> {
        let library = Library::open(path)?;
        library.symbol_address(&format!("{}init", prefix))?;
        let yield_fn: YieldFn = unsafe { library.get(&format!("{}yield", prefix))? };
        let gc_fn: Option<GcFn> = unsafe { library.get(&format!("{}gc", prefix)).ok() };

        let name = Path::new(library.path())
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| library.path().to_string());

        Ok(Self {
            library,
            name,
            prefix: prefix.to_string(),
            yield_fn,
            gc_fn,
            error_contexts: Mutex::new(Vec::new()),
            operations: Mutex::new(FxHashMap::default()),
        })
    }

    /// Symbol prefix
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn operation(&self, symbol: String) -> Result<usize, LoadError> {
        if let Some(&address) = self.operations.lock().get(&symbol) {
            return Ok(address);
        }
        let address = self.library.symbol_address(&symbol)? as usize;
        self.operations.lock().insert(symbol, address);
        Ok(address)
    }
}

impl ForeignLibrary for SharedLibrary {
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&self, ctx: &InitContext) -> Result<(), ForeignError> {
        let init: InitFn = unsafe { self.library.get(&format!("{}init", self.prefix)) }
            .map_err(|e| ForeignError::new("LoadError", e.to_string()))?;
        let name = CString::new(self.name.as_str()).map_err(|e| ForeignError::new("ArgumentError", e.to_string()))?;

        let error_ctx = Box::new(ctx.error_callback.clone());
        let error_ptr = &*error_ctx as *const ErrorCallback as *const c_void;
        self.error_contexts.lock().push(error_ctx);

        unsafe { init(name.as_ptr(), arcbridge_raise_error, error_ptr, ctx.mutex.as_ptr()) };
        Ok(())
    }

    fn call(&self, operation: &str, args: &[Value], return_type: &TypeRef) -> Result<Value, ForeignError> {
        let address = self
            .operation(format!("{}{}", self.prefix, operation))
            .map_err(missing_operation)?;
        let function: CallFn = unsafe { std::mem::transmute(address) };

        let packed = ArgBuffer::pack(args);
        let mut ret = vec![0u8; return_type.refsize().max(8)];
        unsafe {
            function(packed.as_ptr(), ret.as_mut_ptr());
            Ok(Value::decode_owned(return_type.clone(), ret.as_ptr()))
        }
    }

    fn call_async(
        &self,
        operation: &str,
        args: &[Value],
        caller: CallerId,
        on_result: ResultCallback,
    ) -> Result<(), ForeignError> {
        let address = self
            .operation(format!("{}{}_async", self.prefix, operation))
            .map_err(missing_operation)?;
        let function: AsyncFn = unsafe { std::mem::transmute(address) };

        let packed = ArgBuffer::pack(args);
        let result_ctx = Box::into_raw(Box::new(on_result)) as *const c_void;
        unsafe { function(packed.as_ptr(), caller.as_u64(), arcbridge_deliver_result, result_ctx) };
        Ok(())
    }

    fn yield_now(&self) -> usize {
        let outstanding = unsafe { (self.yield_fn)() };
        outstanding.max(0) as usize
    }

    fn collect_garbage(&self) {
        if let Some(gc) = self.gc_fn {
            unsafe { gc() };
        }
    }
}

impl std::fmt::Debug for SharedLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedLibrary")
            .field("path", &self.library.path())
            .field("prefix", &self.prefix)
            .finish()
    }
}
