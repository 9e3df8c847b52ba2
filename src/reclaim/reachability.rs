//! Reachability Reclamation
//!
//! The [`Reclaimer`] keeps an explicit liveness registry: one entry per
//! managed resource, holding a weak reference to the handles' liveness token,
//! the resource itself, and a weak reference to its owning thread.
//!
//! A low-priority background sweep (every `sweep_interval`, 60 s by default)
//! walks the registry. An entry whose token no longer upgrades is removed and
//! converted into exactly one deletion unit, scheduled on the entry's owning
//! thread. The sweep never calls native code itself.

use std::borrow::Cow;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use slotmap::{SlotMap, new_key_type};

use crate::errors::{Result, UnitResult};
use crate::reclaim::handle::{Liveness, ManagedHandle, NativeResource, deletion_label, deletion_unit};
use crate::reclaim::sweep::SweepThread;
use crate::settings::Settings;
use crate::thread::{OwningThread, ThreadContext, WeakOwningThread};
use crate::unit::Query;

new_key_type! {
    struct EntryKey;
}

struct Entry {
    liveness: Weak<Liveness>,
    resource: Arc<dyn NativeResource>,
    thread: WeakOwningThread,
    label: Cow<'static, str>,
}

#[derive(Default)]
struct Registry {
    entries: Mutex<SlotMap<EntryKey, Entry>>,
    enqueued: AtomicU64,
}

impl Registry {
    /// Converts every unreachable entry into a scheduled deletion unit.
    fn sweep(&self) -> usize {
        // Collect under the lock, schedule outside it.
        let dead: Vec<Entry> = {
            let mut entries = self.entries.lock();
            let keys: Vec<EntryKey> = entries
                .iter()
                .filter(|(_, entry)| entry.liveness.strong_count() == 0)
                .map(|(key, _)| key)
                .collect();
            keys.into_iter().filter_map(|key| entries.remove(key)).collect()
        };

        let mut enqueued = 0;
        for entry in dead {
            let Some(thread) = entry.thread.upgrade() else {
                log::debug!("Dropping '{}': owning thread already stopped", entry.label);
                continue;
            };
            match thread.schedule(deletion_unit(entry.resource)) {
                Ok(()) => enqueued += 1,
                Err(e) => log::warn!("Could not enqueue '{}': {}", entry.label, e),
            }
        }

        if enqueued > 0 {
            self.enqueued.fetch_add(enqueued as u64, Ordering::Relaxed);
            log::debug!("Reachability sweep enqueued {enqueued} deletion(s)");
        }
        enqueued
    }
}

/// Reclaims native resources whose host-side handles were all dropped.
pub struct Reclaimer {
    registry: Arc<Registry>,
    _sweeper: SweepThread,
}

impl Reclaimer {
    /// Creates a reclaimer with its background sweep thread.
    pub fn new(settings: &Settings) -> Result<Self> {
        settings.validate()?;
        let registry = Arc::new(Registry::default());
        let swept = Arc::clone(&registry);
        let sweeper = SweepThread::spawn("glthread-reclaim", settings.sweep_interval, move || {
            swept.sweep();
        })?;
        Ok(Self {
            registry,
            _sweeper: sweeper,
        })
    }

    /// Builds a resource on `thread` and places it under reachability tracking.
    pub fn manage<T, F>(&self, thread: &OwningThread, constructor: F) -> Result<ManagedHandle<T>>
    where
        T: NativeResource,
        F: FnOnce(&mut ThreadContext) -> UnitResult<T> + Send + 'static,
    {
        let label = format!("create {}", std::any::type_name::<T>());
        let resource = thread.submit(Query::new(label, constructor))?;
        Ok(self.adopt(thread, resource))
    }

    /// Places an already-built resource under reachability tracking.
    pub fn adopt<T: NativeResource>(&self, thread: &OwningThread, resource: T) -> ManagedHandle<T> {
        let resource = Arc::new(resource);
        let liveness = Arc::new(Liveness);

        self.registry.entries.lock().insert(Entry {
            liveness: Arc::downgrade(&liveness),
            resource: Arc::clone(&resource) as Arc<dyn NativeResource>,
            thread: thread.downgrade(),
            label: deletion_label::<T>(),
        });

        ManagedHandle::new(resource, thread.clone(), liveness)
    }

    /// Runs one sweep now and returns the number of deletions enqueued.
    pub fn sweep_now(&self) -> usize {
        self.registry.sweep()
    }

    /// Number of resources still tracked.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.registry.entries.lock().len()
    }

    /// Total deletions enqueued by sweeps so far.
    #[must_use]
    pub fn enqueued(&self) -> u64 {
        self.registry.enqueued.load(Ordering::Relaxed)
    }
}

impl Drop for Reclaimer {
    fn drop(&mut self) {
        // Final pass so handles dropped just before shutdown are not leaked.
        self.registry.sweep();
        let remaining = self.registry.entries.lock().len();
        if remaining > 0 {
            log::debug!("Reclaimer dropped with {remaining} live resource(s) untracked");
        }
    }
}

impl fmt::Debug for Reclaimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reclaimer")
            .field("tracked", &self.tracked())
            .field("enqueued", &self.enqueued())
            .finish_non_exhaustive()
    }
}
