//! Managed Native Handles
//!
//! Ties the lifetime of a native resource to the reachability of its
//! host-side handles instead of an explicit close call.
//!
//! # Design Principles
//! - A [`ManagedHandle`] is the host object: cloneable, dereferences to the
//!   resource, and carries a liveness token.
//! - The [`Reclaimer`](crate::reclaim::Reclaimer) keeps only a weak reference
//!   to that token. Once every clone is dropped the token dies, and the next
//!   sweep turns the entry into a deletion unit on the owning thread.
//! - Deletion units re-check [`NativeResource::is_valid`] right before
//!   releasing, so an explicit [`ManagedHandle::delete`] racing the sweep is
//!   harmless.

use std::borrow::Cow;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::errors::{Result, UnitResult};
use crate::thread::{OwningThread, ThreadContext};
use crate::unit::Command;

/// A native resource that can be released on its owning thread.
pub trait NativeResource: Send + Sync + 'static {
    /// Whether the native handle is still live.
    fn is_valid(&self) -> bool;

    /// Releases the native handle.
    ///
    /// Only called on the owning thread, and only after `is_valid` returned
    /// `true` within the same unit.
    fn release(&self, ctx: &mut ThreadContext) -> UnitResult<()>;
}

/// Builds the unit that deletes `resource` on its owning thread.
///
/// Running it against an already-released resource is a no-op.
pub fn deletion_unit<T: NativeResource + ?Sized>(resource: Arc<T>) -> Command {
    Command::new(deletion_label::<T>(), move |ctx| {
        if !resource.is_valid() {
            log::debug!("Skipping delete of {}: already released", std::any::type_name::<T>());
            return Ok(());
        }
        resource.release(ctx)
    })
}

pub(crate) fn deletion_label<T: ?Sized>() -> Cow<'static, str> {
    Cow::Owned(format!("delete {}", std::any::type_name::<T>()))
}

/// Atomic cell holding a raw native name; `0` means "no handle".
///
/// `take` clears the cell and hands out the previous value exactly once,
/// which makes it a ready-made validity flag for [`NativeResource`] impls.
#[derive(Debug, Default)]
pub struct NativeHandle {
    raw: AtomicU64,
}

impl NativeHandle {
    #[must_use]
    pub fn new(raw: u64) -> Self {
        Self {
            raw: AtomicU64::new(raw),
        }
    }

    /// The raw name, if still held.
    #[inline]
    #[must_use]
    pub fn get(&self) -> Option<u64> {
        match self.raw.load(Ordering::Acquire) {
            0 => None,
            raw => Some(raw),
        }
    }

    #[inline]
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.get().is_some()
    }

    /// Clears the cell, returning the raw name if it was still held.
    #[inline]
    pub fn take(&self) -> Option<u64> {
        match self.raw.swap(0, Ordering::AcqRel) {
            0 => None,
            raw => Some(raw),
        }
    }
}

/// Token whose strong count tracks the host-side handles.
#[derive(Debug)]
pub(crate) struct Liveness;

/// Host-side handle to a native resource owned by an [`OwningThread`].
pub struct ManagedHandle<T: NativeResource> {
    resource: Arc<T>,
    thread: OwningThread,
    liveness: Arc<Liveness>,
}

impl<T: NativeResource> ManagedHandle<T> {
    pub(crate) fn new(resource: Arc<T>, thread: OwningThread, liveness: Arc<Liveness>) -> Self {
        Self {
            resource,
            thread,
            liveness,
        }
    }

    /// The thread that owns the native resource.
    #[inline]
    #[must_use]
    pub fn thread(&self) -> &OwningThread {
        &self.thread
    }

    /// Deletes the native resource now, blocking until it is gone.
    pub fn delete(&self) -> Result<()> {
        self.thread.submit(deletion_unit(Arc::clone(&self.resource)))
    }

    /// Queues deletion of the native resource without waiting.
    pub fn delete_later(&self) -> Result<()> {
        self.thread.schedule(deletion_unit(Arc::clone(&self.resource)))
    }
}

impl<T: NativeResource> Clone for ManagedHandle<T> {
    fn clone(&self) -> Self {
        Self {
            resource: Arc::clone(&self.resource),
            thread: self.thread.clone(),
            liveness: Arc::clone(&self.liveness),
        }
    }
}

impl<T: NativeResource> Deref for ManagedHandle<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.resource
    }
}

impl<T: NativeResource + fmt::Debug> fmt::Debug for ManagedHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedHandle")
            .field("resource", &self.resource)
            .field("thread", &self.thread.name())
            .finish()
    }
}
