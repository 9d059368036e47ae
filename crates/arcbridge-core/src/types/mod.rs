//! Type descriptors and shared values
//!
//! - [`Type`]: shape descriptor (sizes, layout, children)
//! - [`RawValue`]: what host code passes in and gets back
//! - [`Value`]: owning handle to a value in shared memory
//!
//! Values are encoded in place; there is no serialized form.

mod cast;
mod codec;
mod proc;
mod raw;
mod ty;
mod value;

pub use proc::{proc_trampoline, ProcEntry, ProcFn, ProcRegistry};
pub use raw::{secs_to_time, time_to_secs, HostProc, RawValue};
pub use ty::{Layout, Type, TypeRef};
pub use value::Value;

pub(crate) use cast::cast;
