//! Thread-confined graphics work execution.
//!
//! Graphics contexts are bound to a single OS thread, but applications want
//! to upload, query and free GPU resources from anywhere. This crate provides
//! the machinery in between:
//!
//! - [`thread`]: the [`OwningThread`] that holds a native context and runs
//!   [work units](unit) in strict FIFO order, with blocking
//!   [`submit`](OwningThread::submit), non-blocking
//!   [`schedule`](OwningThread::schedule) and per-cycle tasks.
//! - [`fence`]: [`CompletionFence`], a future-like marker for GPU completion
//!   backed by a per-thread pool of recyclable native fences.
//! - [`reclaim`]: deletion of native resources when their host-side handles
//!   become unreachable, plus idle eviction with transparent rehydration.
//! - [`rotation`]: front/back and N-slot rotation for resources reused
//!   across cycles.
//!
//! ```rust,ignore
//! use glthread::{Command, OwningThread, Query, Settings};
//!
//! let thread = OwningThread::spawn("gl", &Settings::default(), || Ok(MyGl::new()?))?;
//!
//! thread.schedule(Command::new("clear", |ctx| {
//!     ctx.native::<MyGl>().ok_or("wrong backend")?.clear();
//!     Ok(())
//! }))?;
//!
//! let fence = thread.fence()?;
//! fence.get()?;
//! ```

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod errors;
pub mod fence;
pub mod reclaim;
pub mod rotation;
pub mod settings;
pub mod thread;
pub mod unit;

pub use errors::{Error, Result, UnitError, UnitPanic, UnitResult};
pub use fence::CompletionFence;
pub use reclaim::{
    IdleManaged, IdlePolicy, IdleReclaim, IdleReclaimer, ManagedHandle, NativeHandle, NativeResource, Reclaimer,
    deletion_unit,
};
pub use rotation::{DoubleBuffered, RotatingSlots, SlotsSnapshot};
pub use settings::Settings;
pub use thread::{Confined, CycleTaskId, NativeContext, OwningThread, RawFence, ThreadContext, WeakOwningThread};
pub use unit::{Command, Query, WorkUnit};
