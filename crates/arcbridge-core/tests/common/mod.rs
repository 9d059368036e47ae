//! Fake foreign library shared by the integration tests

#![allow(dead_code)]

use arcbridge_core::{
    CallDescriptor, CallerId, DispatchMode, ErrorCallback, ForeignError, ForeignLibrary, InitContext,
    RawValue, ResultCallback, Type, TypeRef, Value,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

enum Completion {
    Deliver(ResultCallback),
    Raise,
    /// Raise for whichever caller the reactor considers current
    RaiseUnattributed,
}

struct Job {
    due: Instant,
    caller: CallerId,
    completion: Completion,
}

/// Library whose operations sleep, add and fail on request
///
/// Async jobs and poll timers only advance inside `yield_now`, the way a
/// cooperative foreign scheduler would.
#[derive(Default)]
pub struct Sleeper {
    jobs: Mutex<Vec<Job>>,
    timers: Mutex<Vec<Instant>>,
    errors: Mutex<Option<ErrorCallback>>,
    events: Mutex<Vec<String>>,
    inits: AtomicUsize,
}

impl Sleeper {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub fn clear_events(&self) {
        self.events.lock().clear();
    }

    pub fn inits(&self) -> usize {
        self.inits.load(Ordering::SeqCst)
    }

    fn record(&self, event: &str) {
        self.events.lock().push(event.to_string());
    }

    fn raise_reported(&self, kind: &str, message: &str, caller: CallerId) {
        if let Some(errors) = self.errors.lock().clone() {
            errors.raise(kind, message, r#"["sleeper.cr:20"]"#, caller);
        }
    }
}

fn seconds(args: &[Value]) -> Duration {
    let secs = args.first().and_then(|v| v.get().as_f64()).unwrap_or(0.0);
    Duration::from_secs_f64(secs)
}

fn argument_error(e: impl ToString) -> ForeignError {
    ForeignError::new("ArgumentError", e.to_string())
}

impl ForeignLibrary for Sleeper {
    fn name(&self) -> &str {
        "sleeper"
    }

    fn init(&self, ctx: &InitContext) -> Result<(), ForeignError> {
        self.inits.fetch_add(1, Ordering::SeqCst);
        *self.errors.lock() = Some(ctx.error_callback.clone());
        Ok(())
    }

    fn call(&self, operation: &str, args: &[Value], return_type: &TypeRef) -> Result<Value, ForeignError> {
        self.record("op");
        match operation {
            "sleep" => {
                thread::sleep(seconds(args));
                Ok(Value::nil())
            }
            "add" => {
                let sum: i64 = args.iter().filter_map(|v| v.get().as_i64()).sum();
                Value::new(return_type.clone(), sum).map_err(argument_error)
            }
            "double_all" => {
                let items = match args[0].to_native() {
                    RawValue::Array(items) => items,
                    other => return Err(argument_error(format!("expected an array, got {}", other.kind()))),
                };
                let doubled: Vec<i64> = items.iter().filter_map(|v| v.as_i64()).map(|n| n * 2).collect();
                Value::new(return_type.clone(), doubled).map_err(argument_error)
            }
            "start_timers" => {
                let count = args[0].get().as_i64().unwrap_or(0);
                let due = Instant::now() + seconds(&args[1..]);
                self.timers.lock().extend((0..count).map(|_| due));
                Value::new(return_type.clone(), count).map_err(argument_error)
            }
            "fail" => Err(ForeignError::new("RuntimeError", "Exception").with_backtrace(vec!["sleeper.cr:10".into()])),
            "fail_via_callback" => {
                self.raise_reported("ArgumentError", "reported", CallerId::CURRENT_CONTEXT);
                Ok(Value::nil())
            }
            other => Err(ForeignError::new("NoMethodError", format!("undefined method {}", other))),
        }
    }

    fn call_async(
        &self,
        operation: &str,
        args: &[Value],
        caller: CallerId,
        on_result: ResultCallback,
    ) -> Result<(), ForeignError> {
        self.record("op");
        let completion = match operation {
            "sleep" => Completion::Deliver(on_result),
            "fail" => Completion::Raise,
            "fail_unattributed" => Completion::RaiseUnattributed,
            other => return Err(ForeignError::new("NoMethodError", format!("undefined method {}", other))),
        };
        self.jobs.lock().push(Job {
            due: Instant::now() + seconds(args),
            caller,
            completion,
        });
        Ok(())
    }

    fn yield_now(&self) -> usize {
        let now = Instant::now();
        let due: Vec<Job> = {
            let mut jobs = self.jobs.lock();
            let (due, pending): (Vec<Job>, Vec<Job>) = jobs.drain(..).partition(|job| job.due <= now);
            *jobs = pending;
            due
        };
        for job in due {
            match job.completion {
                Completion::Deliver(on_result) => on_result.deliver(job.caller, Value::nil()),
                Completion::Raise => self.raise_reported("RuntimeError", "Exception", job.caller),
                Completion::RaiseUnattributed => {
                    self.raise_reported("RuntimeError", "Exception", CallerId::CURRENT_CONTEXT)
                }
            }
        }

        let mut timers = self.timers.lock();
        timers.retain(|due| *due > now);
        timers.len() + self.jobs.lock().len()
    }

    fn collect_garbage(&self) {
        self.record("gc");
    }
}

pub fn sleep_call(lib: &Arc<Sleeper>, mode: DispatchMode) -> CallDescriptor {
    CallDescriptor::new(lib.clone(), "sleep", vec![Type::Float64.into_ref()], Type::Nil.into_ref()).with_mode(mode)
}

pub fn add_call(lib: &Arc<Sleeper>) -> CallDescriptor {
    CallDescriptor::new(
        lib.clone(),
        "add",
        vec![Type::Int32.into_ref(), Type::Int32.into_ref()],
        Type::Int32.into_ref(),
    )
}

pub fn as_library(lib: &Arc<Sleeper>) -> Arc<dyn ForeignLibrary> {
    lib.clone()
}
