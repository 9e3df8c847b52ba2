//! Native Resource Reclamation
//!
//! Two independent engines return native resources to their owning thread:
//!
//! - [`Reclaimer`]: reachability-based. When every [`ManagedHandle`] clone is
//!   dropped, a background sweep enqueues one deletion unit on the owning
//!   thread.
//! - [`IdleReclaimer`]: idle-based. An [`IdleManaged`] wrapper evicts its
//!   instance after a period of disuse and restores it on the next access.
//!
//! Neither sweep touches a native handle directly; both only build and
//! enqueue work units.

mod handle;
mod idle;
mod reachability;
mod sweep;

pub use handle::{ManagedHandle, NativeHandle, NativeResource, deletion_unit};
pub use idle::{IdleManaged, IdlePolicy, IdleReclaim, IdleReclaimer};
pub use reachability::Reclaimer;
