use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;
use std::thread::ThreadId;

use parking_lot::Mutex;

use crate::errors::{Error, Result};
use crate::thread::OwningThread;

/// A value that may only be touched on one owning thread.
///
/// The handle itself can be shared freely; every access checks the calling
/// thread first and fails with [`Error::AffinityViolation`] before the value
/// is reached.
pub struct Confined<T> {
    owner: ThreadId,
    owner_name: Arc<str>,
    value: Mutex<T>,
}

impl<T> Confined<T> {
    /// Confines `value` to `thread`.
    pub fn new(thread: &OwningThread, value: T) -> Self {
        Self {
            owner: thread.id(),
            owner_name: thread.shared_name(),
            value: Mutex::new(value),
        }
    }

    /// Runs `f` on the value if called from the owning thread.
    pub fn with<R>(&self, operation: impl Into<Cow<'static, str>>, f: impl FnOnce(&mut T) -> R) -> Result<R> {
        let actual = std::thread::current().id();
        if actual != self.owner {
            return Err(Error::AffinityViolation {
                operation: operation.into(),
                owner: self.owner_name.to_string(),
                expected: self.owner,
                actual,
            });
        }
        Ok(f(&mut self.value.lock()))
    }

    /// Identity of the thread the value is confined to.
    #[inline]
    #[must_use]
    pub fn owner(&self) -> ThreadId {
        self.owner
    }
}

impl<T> fmt::Debug for Confined<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Confined")
            .field("owner", &self.owner)
            .field("owner_name", &self.owner_name)
            .finish_non_exhaustive()
    }
}
