//! Shared-object loading
//!
//! Thin `dlopen`/`dlsym` wrapper. The handle stays open for the lifetime of
//! the [`Library`]; symbols must not outlive it.

use std::ffi::{c_void, CStr, CString};
use std::path::Path;
use thiserror::Error;

/// Errors from opening a library or resolving a symbol
#[derive(Debug, Error)]
pub enum LoadError {
    /// Library file missing or rejected by the dynamic loader
    #[error("cannot open {path}: {reason}")]
    NotFound {
        /// Path that was attempted
        path: String,
        /// Loader message
        reason: String,
    },

    /// Symbol missing from the library
    #[error("symbol {symbol} not found in {library}")]
    SymbolNotFound {
        /// Symbol name
        symbol: String,
        /// Library path
        library: String,
    },

    /// Path or symbol name not representable as a C string
    #[error("invalid name: {0}")]
    InvalidName(String),

    /// Dynamic loading is not available on this platform
    #[error("dynamic loading is not supported on this platform")]
    Unsupported,
}

impl From<LoadError> for arcbridge_core::BridgeError {
    fn from(e: LoadError) -> Self {
        arcbridge_core::BridgeError::LibraryLoad(e.to_string())
    }
}

/// An open shared object
pub struct Library {
    handle: *mut c_void,
    path: String,
}

// dlopen handles may be used from any thread
unsafe impl Send for Library {}
unsafe impl Sync for Library {}

impl Library {
    /// Open the shared object at `path` (`RTLD_NOW | RTLD_LOCAL`)
    #[cfg(unix)]
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, LoadError> {
        let path = path.as_ref().to_string_lossy().into_owned();
        let c_path = CString::new(path.as_str()).map_err(|e| LoadError::InvalidName(e.to_string()))?;

        let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL) };
        if handle.is_null() {
            return Err(LoadError::NotFound {
                reason: last_dl_error().unwrap_or_else(|| "unknown error".to_string()),
                path,
            });
        }

        log::debug!("opened shared library {}", path);
        Ok(Library { handle, path })
    }

    /// Dynamic loading needs `dlopen`
    #[cfg(not(unix))]
    pub fn open<P: AsRef<Path>>(_path: P) -> Result<Self, LoadError> {
        Err(LoadError::Unsupported)
    }

    /// Address of `name`
    pub fn symbol_address(&self, name: &str) -> Result<*mut c_void, LoadError> {
        let c_name = CString::new(name).map_err(|e| LoadError::InvalidName(e.to_string()))?;
        let symbol = self.lookup(&c_name);
        if symbol.is_null() {
            return Err(LoadError::SymbolNotFound {
                symbol: name.to_string(),
                library: self.path.clone(),
            });
        }
        Ok(symbol)
    }

    #[cfg(unix)]
    fn lookup(&self, name: &CStr) -> *mut c_void {
        unsafe {
            libc::dlerror();
            let symbol = libc::dlsym(self.handle, name.as_ptr());
            match last_dl_error() {
                Some(_) => std::ptr::null_mut(),
                None => symbol,
            }
        }
    }

    #[cfg(not(unix))]
    fn lookup(&self, _name: &CStr) -> *mut c_void {
        std::ptr::null_mut()
    }

    /// Resolve `name` as a function pointer of type `T`
    ///
    /// # Safety
    ///
    /// `T` must be a function pointer type matching the symbol's signature,
    /// and the result must not be used after the library is dropped.
    pub unsafe fn get<T: Copy>(&self, name: &str) -> Result<T, LoadError> {
        let symbol = self.symbol_address(name)?;
        Ok(std::mem::transmute_copy(&symbol))
    }

    /// Whether `name` is exported
    pub fn has_symbol(&self, name: &str) -> bool {
        self.symbol_address(name).is_ok()
    }

    /// Path this library was opened from
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Drop for Library {
    fn drop(&mut self) {
        #[cfg(unix)]
        unsafe {
            libc::dlclose(self.handle);
        }
    }
}

#[cfg(unix)]
fn last_dl_error() -> Option<String> {
    let err = unsafe { libc::dlerror() };
    if err.is_null() {
        None
    } else {
        Some(unsafe { CStr::from_ptr(err) }.to_string_lossy().into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_not_found() {
        match Library::open("/nonexistent/libmissing.so") {
            Err(LoadError::NotFound { path, .. }) => assert_eq!(path, "/nonexistent/libmissing.so"),
            Err(LoadError::Unsupported) => {}
            other => panic!("unexpected result: {:?}", other.map(|l| l.path().to_string())),
        }
    }

    #[test]
    fn test_invalid_name() {
        assert!(matches!(Library::open("bad\0path"), Err(LoadError::InvalidName(_)) | Err(LoadError::Unsupported)));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_resolve_libc_symbol() {
        let lib = Library::open("libc.so.6").unwrap();
        assert!(lib.has_symbol("strlen"));
        assert!(matches!(
            lib.symbol_address("arcbridge_definitely_missing"),
            Err(LoadError::SymbolNotFound { .. })
        ));

        type StrlenFn = unsafe extern "C" fn(*const std::os::raw::c_char) -> usize;
        let strlen: StrlenFn = unsafe { lib.get("strlen").unwrap() };
        assert_eq!(unsafe { strlen(b"arc\0".as_ptr() as *const _) }, 3);
    }
}
