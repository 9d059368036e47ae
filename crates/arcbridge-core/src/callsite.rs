//! Call sites for exposed foreign operations
//!
//! A call site starts out uncompiled. The first invocation builds its
//! library, the next step attaches it to the reactor, and from then on every
//! invocation is a plain dispatch:
//!
//! ```text
//! Uncompiled --build--> Compiled --attach--> Attached --invoke--> ...
//!      ^                                        |
//!      +------------------invalidate------------+
//! ```
//!
//! If the reactor was restarted since the last attach, the call site falls
//! back to `Compiled` and attaches again.

use crate::reactor::{CallDescriptor, DispatchMode, ForeignLibrary, Reactor};
use crate::types::{RawValue, TypeRef, Value};
use crate::BridgeResult;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// Produces the library behind a call site
pub trait LibraryBuilder: Send + Sync {
    /// Build (compile, load) the library
    fn build(&self) -> BridgeResult<Arc<dyn ForeignLibrary>>;
}

impl<F> LibraryBuilder for F
where
    F: Fn() -> BridgeResult<Arc<dyn ForeignLibrary>> + Send + Sync,
{
    fn build(&self) -> BridgeResult<Arc<dyn ForeignLibrary>> {
        self()
    }
}

/// Progress of a call site
#[derive(Clone)]
pub enum CallSiteState {
    /// Library not built yet
    Uncompiled,
    /// Library built but not initialized on the reactor
    Compiled(Arc<dyn ForeignLibrary>),
    /// Library initialized; invocations dispatch directly
    Attached(Arc<dyn ForeignLibrary>),
}

impl CallSiteState {
    /// State name, for logging
    pub fn name(&self) -> &'static str {
        match self {
            CallSiteState::Uncompiled => "uncompiled",
            CallSiteState::Compiled(_) => "compiled",
            CallSiteState::Attached(_) => "attached",
        }
    }
}

impl fmt::Debug for CallSiteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Proxy for one foreign operation
pub struct CallSite {
    builder: Arc<dyn LibraryBuilder>,
    operation: String,
    arg_types: Vec<TypeRef>,
    return_type: TypeRef,
    mode: DispatchMode,
    state: Mutex<CallSiteState>,
}

impl CallSite {
    /// Create an uncompiled call site
    pub fn new(
        builder: Arc<dyn LibraryBuilder>,
        operation: impl Into<String>,
        arg_types: Vec<TypeRef>,
        return_type: TypeRef,
        mode: DispatchMode,
    ) -> Self {
        Self {
            builder,
            operation: operation.into(),
            arg_types,
            return_type,
            mode,
            state: Mutex::new(CallSiteState::Uncompiled),
        }
    }

    /// Operation name
    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Current state
    pub fn state(&self) -> CallSiteState {
        self.state.lock().clone()
    }

    /// Name of the current state
    pub fn state_name(&self) -> &'static str {
        self.state.lock().name()
    }

    /// Drop the built library; the next invocation rebuilds it
    pub fn invalidate(&self) {
        *self.state.lock() = CallSiteState::Uncompiled;
    }

    /// Advance the state machine until the library is attached to `reactor`
    fn ready(&self, reactor: &Reactor) -> BridgeResult<Arc<dyn ForeignLibrary>> {
        let mut state = self.state.lock();
        loop {
            let next = match &*state {
                CallSiteState::Uncompiled => {
                    let lib = self.builder.build()?;
                    log::debug!("built {} for {}", lib.name(), self.operation);
                    CallSiteState::Compiled(lib)
                }
                CallSiteState::Compiled(lib) => {
                    reactor.attach(lib.clone())?;
                    CallSiteState::Attached(lib.clone())
                }
                CallSiteState::Attached(lib) if reactor.is_attached(lib) => return Ok(lib.clone()),
                CallSiteState::Attached(lib) => CallSiteState::Compiled(lib.clone()),
            };
            *state = next;
        }
    }

    /// Invoke the operation on `reactor`
    pub fn invoke(&self, reactor: &Reactor, args: Vec<RawValue>) -> BridgeResult<Value> {
        let lib = self.ready(reactor)?;
        let call = CallDescriptor::new(lib, self.operation.clone(), self.arg_types.clone(), self.return_type.clone())
            .with_mode(self.mode);
        reactor.schedule_work(&call, args)
    }
}

impl fmt::Debug for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallSite")
            .field("operation", &self.operation)
            .field("mode", &self.mode)
            .field("state", &*self.state.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::{CallerId, InitContext, ReactorOptions, ResultCallback};
    use crate::types::Type;
    use crate::{BridgeError, ForeignError};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Negate;

    impl ForeignLibrary for Negate {
        fn name(&self) -> &str {
            "negate"
        }

        fn init(&self, _ctx: &InitContext) -> Result<(), ForeignError> {
            Ok(())
        }

        fn call(&self, _operation: &str, args: &[Value], return_type: &TypeRef) -> Result<Value, ForeignError> {
            let n = args[0].get().as_i64().unwrap_or(0);
            Value::new(return_type.clone(), -n).map_err(|e| ForeignError::new("ArgumentError", e.to_string()))
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

    fn counting_builder(builds: Arc<AtomicUsize>) -> Arc<dyn LibraryBuilder> {
        Arc::new(move || -> BridgeResult<Arc<dyn ForeignLibrary>> {
            builds.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(Negate))
        })
    }

    fn negate_site(builder: Arc<dyn LibraryBuilder>) -> CallSite {
        CallSite::new(
            builder,
            "negate",
            vec![Type::Int32.into_ref()],
            Type::Int32.into_ref(),
            DispatchMode::Blocking,
        )
    }

    #[test]
    fn test_first_invoke_builds_and_attaches() {
        let builds = Arc::new(AtomicUsize::new(0));
        let site = negate_site(counting_builder(builds.clone()));
        let reactor = Reactor::new(ReactorOptions::single_threaded());
        assert_eq!(site.state_name(), "uncompiled");

        assert_eq!(site.invoke(&reactor, vec![RawValue::Int(5)]).unwrap().get(), RawValue::Int(-5));
        assert_eq!(site.state_name(), "attached");
        site.invoke(&reactor, vec![RawValue::Int(6)]).unwrap();
        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_invalidate_rebuilds() {
        let builds = Arc::new(AtomicUsize::new(0));
        let site = negate_site(counting_builder(builds.clone()));
        let reactor = Reactor::new(ReactorOptions::single_threaded());
        site.invoke(&reactor, vec![RawValue::Int(1)]).unwrap();
        site.invalidate();
        assert_eq!(site.state_name(), "uncompiled");
        site.invoke(&reactor, vec![RawValue::Int(1)]).unwrap();
        assert_eq!(builds.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_reattach_after_restart() {
        let builds = Arc::new(AtomicUsize::new(0));
        let site = negate_site(counting_builder(builds.clone()));
        let reactor = Reactor::default();
        site.invoke(&reactor, vec![RawValue::Int(2)]).unwrap();
        reactor.stop();
        assert_eq!(site.invoke(&reactor, vec![RawValue::Int(3)]).unwrap().get(), RawValue::Int(-3));
        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_build_failure_keeps_uncompiled() {
        let builder: Arc<dyn LibraryBuilder> =
            Arc::new(|| -> BridgeResult<Arc<dyn ForeignLibrary>> { Err(BridgeError::LibraryLoad("missing".into())) });
        let site = negate_site(builder);
        let reactor = Reactor::new(ReactorOptions::single_threaded());
        assert!(matches!(
            site.invoke(&reactor, vec![RawValue::Int(1)]),
            Err(BridgeError::LibraryLoad(_))
        ));
        assert_eq!(site.state_name(), "uncompiled");
    }
}
