//! C ABI for the foreign runtime
//!
//! This crate exposes the entry points a compiled foreign library calls back
//! into, and a [`SharedLibrary`] that drives such a library through the
//! reactor. The API follows these principles:
//! - ABI-stable (uses only C-compatible types)
//! - Error handling via out-parameters
//! - Opaque pointers for host objects
//! - Callback contexts are owned by the host; one-shot contexts are consumed
//!   by the call that receives them

pub mod loader;
pub mod shared_library;

pub use loader::{Library, LoadError};
pub use shared_library::SharedLibrary;

use arcbridge_core::{ArcMutex, BlockPtr, CallerId, ErrorCallback, Heap, ResultCallback};
use std::ffi::{c_void, CStr, CString};
use std::os::raw::{c_char, c_int};
use std::ptr::{self, NonNull};

// ============================================================================
// Callback signatures
// ============================================================================

/// Error callback handed to `{prefix}init`
pub type ErrorFn = unsafe extern "C" fn(
    ctx: *const c_void,
    kind: *const c_char,
    message: *const c_char,
    backtrace: *const c_char,
    caller_id: u64,
);

/// Result callback handed to every `{prefix}{op}_async`
pub type ResultFn = unsafe extern "C" fn(ctx: *const c_void, caller_id: u64, slot: *const u8);

/// Error information
#[repr(C)]
pub struct ArcbridgeError {
    message: *mut c_char,
}

/// Convert Rust string to C string (caller must free)
fn rust_to_c_string(s: &str) -> *mut c_char {
    match CString::new(s.replace('\0', " ")) {
        Ok(c_str) => c_str.into_raw(),
        Err(_) => ptr::null_mut(),
    }
}

/// Set error out-parameter
unsafe fn set_error(error_out: *mut *mut ArcbridgeError, message: &str) {
    log::warn!("C boundary error: {}", message);
    if !error_out.is_null() {
        *error_out = Box::into_raw(Box::new(ArcbridgeError {
            message: rust_to_c_string(message),
        }));
    }
}

unsafe fn c_str_or_empty<'a>(s: *const c_char) -> std::borrow::Cow<'a, str> {
    if s.is_null() {
        std::borrow::Cow::Borrowed("")
    } else {
        CStr::from_ptr(s).to_string_lossy()
    }
}

// ============================================================================
// Allocator
// ============================================================================

/// Allocate `size` zeroed bytes from the shared heap
///
/// # Safety
/// The returned pointer must be released with `arcbridge_free()`.
#[no_mangle]
pub unsafe extern "C" fn arcbridge_alloc(size: usize) -> *mut u8 {
    Heap::global().malloc(size).as_ptr()
}

/// Free memory from `arcbridge_alloc()` (NULL is ignored)
///
/// # Safety
/// `ptr` must not be used after this call.
#[no_mangle]
pub unsafe extern "C" fn arcbridge_free(ptr: *mut u8) {
    if let Some(ptr) = NonNull::new(ptr) {
        Heap::global().free(ptr);
    }
}

// ============================================================================
// Reference counts
// ============================================================================

/// Lock the reference-count mutex passed to `{prefix}init`
///
/// # Safety
/// `mutex` must be the pointer received at init.
#[no_mangle]
pub unsafe extern "C" fn arcbridge_mutex_lock(mutex: *mut c_void) {
    if mutex.is_null() {
        log::error!("arcbridge_mutex_lock called with NULL");
        return;
    }
    ArcMutex::lock_raw(mutex);
}

/// Unlock the reference-count mutex
///
/// # Safety
/// The calling thread must hold `mutex`.
#[no_mangle]
pub unsafe extern "C" fn arcbridge_mutex_unlock(mutex: *mut c_void) {
    if mutex.is_null() {
        log::error!("arcbridge_mutex_unlock called with NULL");
        return;
    }
    ArcMutex::unlock_raw(mutex);
}

/// Current reference count of a block
///
/// # Returns
/// * The count, or 0 for a NULL block (check error parameter)
///
/// # Safety
/// `block` must be a live reference-counted block.
#[no_mangle]
pub unsafe extern "C" fn arcbridge_ref_count(block: *const u8, error: *mut *mut ArcbridgeError) -> u32 {
    match BlockPtr::from_raw(block as *mut u8) {
        Some(block) => block.ref_count(),
        None => {
            set_error(error, "arcbridge_ref_count: NULL block");
            0
        }
    }
}

/// Take one more reference to a block
///
/// # Returns
/// * 0 on success
/// * -1 for a NULL block (check error parameter)
///
/// # Safety
/// `block` must be a live reference-counted block.
#[no_mangle]
pub unsafe extern "C" fn arcbridge_retain(block: *mut u8, error: *mut *mut ArcbridgeError) -> c_int {
    match BlockPtr::from_raw(block) {
        Some(block) => {
            block.retain();
            0
        }
        None => {
            set_error(error, "arcbridge_retain: NULL block");
            -1
        }
    }
}

// ============================================================================
// Callbacks
// ============================================================================

/// Deliver an async result; consumes the one-shot `ctx`
///
/// # Safety
/// - `ctx` must be the `result_ctx` passed to `{prefix}{op}_async`, used once
/// - `slot` must hold one element of the operation's return type whose
///   reference is transferred to the host
#[no_mangle]
pub unsafe extern "C" fn arcbridge_deliver_result(ctx: *const c_void, caller_id: u64, slot: *const u8) {
    if ctx.is_null() || slot.is_null() {
        log::error!("arcbridge_deliver_result called with NULL context or slot");
        return;
    }
    let callback = Box::from_raw(ctx as *mut ResultCallback);
    callback.deliver_raw(CallerId::from_u64(caller_id), slot);
}

/// Report a foreign exception
///
/// `backtrace` is a JSON array of frame strings; caller 0 means the caller
/// currently being served.
///
/// # Safety
/// - `ctx` must be the `error_ctx` passed to `{prefix}init`
/// - string arguments must be NULL or NUL-terminated
#[no_mangle]
pub unsafe extern "C" fn arcbridge_raise_error(
    ctx: *const c_void,
    kind: *const c_char,
    message: *const c_char,
    backtrace: *const c_char,
    caller_id: u64,
) {
    if ctx.is_null() {
        log::error!("arcbridge_raise_error called with NULL context");
        return;
    }
    let callback = &*(ctx as *const ErrorCallback);
    callback.raise(
        &c_str_or_empty(kind),
        &c_str_or_empty(message),
        &c_str_or_empty(backtrace),
        CallerId::from_u64(caller_id),
    );
}

// ============================================================================
// Errors and version
// ============================================================================

/// Message of an error from an out-parameter
///
/// # Safety
/// The returned string is owned by `error` and lives until
/// `arcbridge_error_free()`.
#[no_mangle]
pub unsafe extern "C" fn arcbridge_error_message(error: *const ArcbridgeError) -> *const c_char {
    if error.is_null() {
        return ptr::null();
    }
    (*error).message
}

/// Free an error (NULL is ignored)
///
/// # Safety
/// `error` must not be used after this call.
#[no_mangle]
pub unsafe extern "C" fn arcbridge_error_free(error: *mut ArcbridgeError) {
    if error.is_null() {
        return;
    }
    let error = Box::from_raw(error);
    if !error.message.is_null() {
        drop(CString::from_raw(error.message));
    }
}

/// Version string (static, must not be freed)
#[no_mangle]
pub extern "C" fn arcbridge_version() -> *const c_char {
    static VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "\0");
    VERSION.as_ptr() as *const c_char
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use arcbridge_core::{Type, Value};

    #[test]
    fn test_alloc_free() {
        unsafe {
            let ptr = arcbridge_alloc(32);
            assert!(!ptr.is_null());
            assert_eq!(*ptr.add(31), 0);
            arcbridge_free(ptr);
            arcbridge_free(ptr::null_mut());
        }
    }

    #[test]
    fn test_retain_and_ref_count() {
        let value = Value::new(Type::String.into_ref(), "shared").unwrap();
        let block = value.address().unwrap() as *mut u8;
        unsafe {
            let mut error: *mut ArcbridgeError = ptr::null_mut();
            assert_eq!(arcbridge_retain(block, &mut error), 0);
            assert_eq!(arcbridge_ref_count(block, &mut error), 2);
            assert!(error.is_null());
            drop(Value::from_owned_ptr(Type::String.into_ref(), block).unwrap());
        }
        assert_eq!(value.ref_count(), Some(1));
    }

    #[test]
    fn test_null_block_sets_error() {
        unsafe {
            let mut error: *mut ArcbridgeError = ptr::null_mut();
            assert_eq!(arcbridge_retain(ptr::null_mut(), &mut error), -1);
            assert!(!error.is_null());
            let message = CStr::from_ptr(arcbridge_error_message(error)).to_str().unwrap();
            assert!(message.contains("NULL block"));
            arcbridge_error_free(error);
        }
    }

    #[test]
    fn test_mutex_round_trip() {
        let mutex = Heap::global().arc_mutex().as_ptr();
        unsafe {
            arcbridge_mutex_lock(mutex);
            arcbridge_mutex_unlock(mutex);
        }
        drop(Heap::global().arc_mutex().lock());
    }

    #[test]
    fn test_version() {
        let version = unsafe { CStr::from_ptr(arcbridge_version()) }.to_str().unwrap();
        assert_eq!(version, arcbridge_core::VERSION);
    }
}
