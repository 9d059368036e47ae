//! Call reactor
//!
//! Foreign code is not thread-safe, so every call into a [`ForeignLibrary`]
//! runs on one execution context: a dedicated worker thread, or the pinned
//! owner thread in single-thread mode. Host threads submit
//! [`CallDescriptor`]s through [`Reactor::schedule_work`] and block on a
//! per-thread [`WaitSlot`] until the result or a foreign exception arrives.
//!
//! Three dispatch modes are supported:
//! - blocking: the operation runs to completion on the reactor
//! - async: the operation is started, the result is delivered later through a
//!   [`ResultCallback`] while the reactor keeps yielding to the foreign scheduler
//! - poll: the operation returns an outstanding-job count and the caller is
//!   woken once yields report zero
//!
//! The reactor also paces the foreign garbage collector (see [`GcPacer`]).

mod callbacks;
mod library;
mod lifecycle;
mod options;
mod pacing;
mod slots;
mod state;
mod work;

pub use callbacks::{ErrorCallback, ResultCallback};
pub use library::{CallDescriptor, DispatchMode, ForeignLibrary, InitContext};
pub use lifecycle::{Reactor, ReactorMode};
pub use options::ReactorOptions;
pub use pacing::GcPacer;
pub use slots::{CallerId, CurrentCallerGuard, Outcome, WaitRegistry, WaitSlot};
pub use state::{ReactorState, ReactorStats};
