//! Foreign libraries and call descriptors

use super::callbacks::{ErrorCallback, ResultCallback};
use super::slots::CallerId;
use crate::sync::ArcMutex;
use crate::types::{TypeRef, Value};
use crate::ForeignError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// What a library receives from [`ForeignLibrary::init`]
pub struct InitContext {
    /// Where foreign exceptions are reported
    pub error_callback: ErrorCallback,
    /// Mutex guarding every reference-count update
    pub mutex: &'static ArcMutex,
}

/// A linked foreign library
///
/// Every method is only ever invoked from the reactor's execution context.
pub trait ForeignLibrary: Send + Sync {
    /// Library name, for logging
    fn name(&self) -> &str;

    /// Called once when the library is attached
    fn init(&self, ctx: &InitContext) -> Result<(), ForeignError>;

    /// Run `operation` to completion
    ///
    /// Exceptions may be returned directly or reported through the error
    /// callback; a reported exception takes precedence over the return value.
    fn call(&self, operation: &str, args: &[Value], return_type: &TypeRef) -> Result<Value, ForeignError>;

    /// Start `operation` without waiting for it
    ///
    /// The library must eventually deliver exactly one result (through
    /// `on_result`) or one exception (through the error callback) for `caller`.
    fn call_async(
        &self,
        operation: &str,
        args: &[Value],
        caller: CallerId,
        on_result: ResultCallback,
    ) -> Result<(), ForeignError>;

    /// Let the foreign scheduler advance; returns the outstanding job count
    fn yield_now(&self) -> usize;

    /// Run the foreign collector
    fn collect_garbage(&self) {}
}

/// Stable identity of a library handle
pub(crate) fn library_key(lib: &Arc<dyn ForeignLibrary>) -> usize {
    Arc::as_ptr(lib) as *const () as usize
}

/// How a call waits for its result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// The reactor runs the operation to completion
    #[default]
    Blocking,
    /// The reactor starts the operation; the result arrives by callback
    Async,
    /// The operation returns an outstanding-job count; the caller waits until
    /// yields report zero
    Poll,
}

/// One exposed foreign operation
#[derive(Clone)]
pub struct CallDescriptor {
    /// Library implementing the operation
    pub receiver: Arc<dyn ForeignLibrary>,
    /// Operation name
    pub operation: String,
    /// Argument types, in order
    pub arg_types: Vec<TypeRef>,
    /// Return type
    pub return_type: TypeRef,
    /// Dispatch strategy
    pub mode: DispatchMode,
}

impl CallDescriptor {
    /// Blocking call descriptor
    pub fn new(
        receiver: Arc<dyn ForeignLibrary>,
        operation: impl Into<String>,
        arg_types: Vec<TypeRef>,
        return_type: TypeRef,
    ) -> Self {
        Self {
            receiver,
            operation: operation.into(),
            arg_types,
            return_type,
            mode: DispatchMode::Blocking,
        }
    }

    /// Change the dispatch strategy
    pub fn with_mode(mut self, mode: DispatchMode) -> Self {
        self.mode = mode;
        self
    }
}

impl fmt::Debug for CallDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallDescriptor")
            .field("receiver", &self.receiver.name())
            .field("operation", &self.operation)
            .field("arg_types", &self.arg_types)
            .field("return_type", &self.return_type)
            .field("mode", &self.mode)
            .finish()
    }
}
