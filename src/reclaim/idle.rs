//! Idle Reclamation & Rehydration
//!
//! Some resources are cheap to rebuild but expensive to keep around: glyph
//! atlases, cached render targets, staging buffers. An [`IdleManaged`]
//! wrapper evicts its instance once it has gone unused for longer than its
//! [`IdlePolicy`] allows, and rebuilds it transparently on the next access.
//!
//! # Entry Lifecycle
//!
//! ```text
//!          get()                       check: idle > timeout
//!   ┌──────────────┐   ┌──────────────────────────────────────┐
//!   ▼              │   │                                      ▼
//! Resident ────────┘ ──┘                                   Evicted
//!   ▲       (check: still fresh → keep monitoring)            │
//!   └──────────────── get(): restore + re-arm ────────────────┘
//! ```
//!
//! - Each entry has its own lock. A check and its cleanup hold it, so an
//!   entry is never checked while its own cleanup runs and a caller never
//!   sees a half-evicted instance.
//! - A restore runs without the lock. Concurrent callers wait on the entry's
//!   condvar for the first restore to land, except the resource's owning
//!   thread, which never parks: a foreign restore may be queued behind the
//!   unit it is running. If both finish, the later instance is cleaned up.
//! - On the owning thread, use [`IdleManaged::get_in`]; plain `get` cannot
//!   submit to the thread it runs on.
//! - Evicted entries leave the sweep list; a restore puts them back.
//! - Whether a resource kind participates at all is an explicit decision
//!   ([`IdleReclaim::idle_policy`]), not a silent default.

use std::fmt;
use std::sync::{Arc, Weak};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::errors::{Error, Result, UnitError, UnitResult};
use crate::reclaim::handle::{NativeResource, deletion_unit};
use crate::reclaim::sweep::SweepThread;
use crate::settings::Settings;
use crate::thread::{OwningThread, ThreadContext, WeakOwningThread};
use crate::unit::Query;

/// When an idle-managed resource may be evicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdlePolicy {
    /// Never evicted; the wrapper only provides lazy restore.
    Disabled,
    /// Evicted once unused for the given duration.
    After(Duration),
}

/// Per-kind opt-in for idle reclamation of native resources.
///
/// There is deliberately no default: every resource kind states whether it
/// can be evicted and after how long.
pub trait IdleReclaim: NativeResource + Sized {
    fn idle_policy(settings: &Settings) -> IdlePolicy;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CheckOutcome {
    Keep,
    Evicted,
    Disarmed,
}

trait IdleCheck: Send + Sync {
    fn check(&self, now: Instant) -> CheckOutcome;
}

#[derive(Default)]
struct IdleRegistry {
    entries: Mutex<Vec<Weak<dyn IdleCheck>>>,
}

impl IdleRegistry {
    fn register(&self, entry: Weak<dyn IdleCheck>) {
        self.entries.lock().push(entry);
    }

    /// Checks every armed entry once. Returns the number evicted.
    fn check_all(&self, now: Instant) -> usize {
        // Detach the list so restores can re-register while cleanups run.
        let snapshot = std::mem::take(&mut *self.entries.lock());

        let mut evicted = 0;
        let mut kept = Vec::with_capacity(snapshot.len());
        for weak in snapshot {
            let Some(entry) = weak.upgrade() else {
                continue;
            };
            match entry.check(now) {
                CheckOutcome::Keep => kept.push(weak),
                CheckOutcome::Evicted => evicted += 1,
                CheckOutcome::Disarmed => {}
            }
        }

        self.entries.lock().extend(kept);
        if evicted > 0 {
            log::debug!("Idle check evicted {evicted} resource(s)");
        }
        evicted
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

/// Periodically evicts idle resources.
pub struct IdleReclaimer {
    registry: Arc<IdleRegistry>,
    settings: Settings,
    _sweeper: SweepThread,
}

impl IdleReclaimer {
    /// Creates the reclaimer and its check thread (every `idle_check_interval`).
    pub fn new(settings: &Settings) -> Result<Self> {
        settings.validate()?;
        let registry = Arc::new(IdleRegistry::default());
        let checked = Arc::clone(&registry);
        let sweeper = SweepThread::spawn("glthread-idle", settings.idle_check_interval, move || {
            checked.check_all(Instant::now());
        })?;
        Ok(Self {
            registry,
            settings: settings.clone(),
            _sweeper: sweeper,
        })
    }

    /// Wraps `instance` with an idle policy.
    ///
    /// `cleanup` runs when the instance is evicted (or the wrapper dropped
    /// while resident) and must tolerate an already-released instance.
    /// `restore` rebuilds the instance on the first access after eviction.
    pub fn make_managed<T, C, R>(&self, instance: T, policy: IdlePolicy, cleanup: C, restore: R) -> IdleManaged<T>
    where
        T: Send + Sync + 'static,
        C: Fn(Arc<T>) + Send + Sync + 'static,
        R: Fn() -> UnitResult<T> + Send + Sync + 'static,
    {
        self.wrap(instance, policy, Box::new(cleanup), Restore::Local(Box::new(restore)), None)
    }

    /// Wraps a native resource owned by `thread`.
    ///
    /// The policy comes from the resource kind. Eviction schedules the
    /// deletion unit on `thread`. Restore runs `restore` there: from other
    /// threads [`IdleManaged::get`] submits it and blocks until it finishes,
    /// on the owning thread [`IdleManaged::get_in`] runs it inline.
    pub fn make_managed_native<T, R>(&self, thread: &OwningThread, instance: T, restore: R) -> IdleManaged<T>
    where
        T: IdleReclaim,
        R: Fn(&mut ThreadContext) -> UnitResult<T> + Send + Sync + 'static,
    {
        let policy = T::idle_policy(&self.settings);

        let cleanup_thread = thread.downgrade();
        let cleanup = move |instance: Arc<T>| {
            let Some(thread) = cleanup_thread.upgrade() else {
                log::debug!("Evicted {} after its owning thread stopped", std::any::type_name::<T>());
                return;
            };
            if let Err(e) = thread.schedule(deletion_unit(instance)) {
                log::warn!("Could not enqueue idle eviction: {e}");
            }
        };

        let restore = Restore::Native {
            owner: thread.id(),
            thread: thread.downgrade(),
            factory: Arc::new(restore),
        };

        self.wrap(
            instance,
            policy,
            Box::new(cleanup),
            restore,
            Some(Box::new(|instance: &T| instance.is_valid())),
        )
    }

    fn wrap<T: Send + Sync + 'static>(
        &self,
        instance: T,
        policy: IdlePolicy,
        cleanup: Box<dyn Fn(Arc<T>) + Send + Sync>,
        restore: Restore<T>,
        validate: Option<Box<dyn Fn(&T) -> bool + Send + Sync>>,
    ) -> IdleManaged<T> {
        let entry = Arc::new(IdleEntry {
            state: Mutex::new(IdleState {
                instance: Some(Arc::new(instance)),
                last_access: Instant::now(),
                armed: false,
                restoring: 0,
                evictions: 0,
                restores: 0,
            }),
            restored: Condvar::new(),
            policy,
            cleanup,
            restore,
            validate,
            registry: Arc::downgrade(&self.registry),
        });
        let managed = IdleManaged { entry };
        {
            let mut state = managed.entry.state.lock();
            state.armed = managed.arm();
        }
        managed
    }

    /// Runs one check pass now and returns the number of evictions.
    pub fn check_now(&self) -> usize {
        self.registry.check_all(Instant::now())
    }

    /// Number of entries currently monitored.
    #[must_use]
    pub fn monitored(&self) -> usize {
        self.registry.len()
    }
}

impl fmt::Debug for IdleReclaimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdleReclaimer")
            .field("monitored", &self.monitored())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

// ─── Entries ──────────────────────────────────────────────────────────────────

/// How an evicted instance is rebuilt.
enum Restore<T> {
    /// Runs on whichever thread calls `get`.
    Local(Box<dyn Fn() -> UnitResult<T> + Send + Sync>),
    /// Runs on the owning thread of a native resource.
    Native {
        owner: ThreadId,
        thread: WeakOwningThread,
        factory: Arc<dyn Fn(&mut ThreadContext) -> UnitResult<T> + Send + Sync>,
    },
}

impl<T: Send + 'static> Restore<T> {
    fn owned_by_current_thread(&self) -> bool {
        matches!(self, Self::Native { owner, .. } if *owner == std::thread::current().id())
    }

    fn run(&self, ctx: Option<&mut ThreadContext>) -> UnitResult<T> {
        match self {
            Self::Local(restore) => restore(),
            Self::Native { owner, thread, factory } => {
                if let Some(ctx) = ctx
                    && ctx.thread_id() == *owner
                {
                    return factory(ctx);
                }
                let thread = thread
                    .upgrade()
                    .ok_or_else(|| UnitError::from("owning thread has stopped"))?;
                let factory = Arc::clone(factory);
                let label = format!("restore {}", std::any::type_name::<T>());
                Ok(thread.submit(Query::new(label, move |ctx: &mut ThreadContext| factory(ctx)))?)
            }
        }
    }
}

struct IdleState<T> {
    instance: Option<Arc<T>>,
    last_access: Instant,
    armed: bool,
    /// Restores currently running without the lock.
    restoring: u32,
    evictions: u64,
    restores: u64,
}

struct IdleEntry<T> {
    state: Mutex<IdleState<T>>,
    /// Signalled whenever a restore finishes, successfully or not.
    restored: Condvar,
    policy: IdlePolicy,
    cleanup: Box<dyn Fn(Arc<T>) + Send + Sync>,
    restore: Restore<T>,
    validate: Option<Box<dyn Fn(&T) -> bool + Send + Sync>>,
    registry: Weak<IdleRegistry>,
}

/// Marks a restore in flight; clears the mark and wakes waiters on drop,
/// including when the factory panics.
struct Restoring<'a, T> {
    entry: &'a IdleEntry<T>,
}

impl<T> Drop for Restoring<'_, T> {
    fn drop(&mut self) {
        self.entry.state.lock().restoring -= 1;
        self.entry.restored.notify_all();
    }
}

impl<T: Send + Sync + 'static> IdleCheck for IdleEntry<T> {
    fn check(&self, now: Instant) -> CheckOutcome {
        let IdlePolicy::After(timeout) = self.policy else {
            return CheckOutcome::Disarmed;
        };

        let mut state = self.state.lock();
        if state.instance.is_none() {
            state.armed = false;
            return CheckOutcome::Disarmed;
        }
        if now.saturating_duration_since(state.last_access) < timeout {
            return CheckOutcome::Keep;
        }

        state.armed = false;
        state.evictions += 1;
        if let Some(instance) = state.instance.take() {
            (self.cleanup)(instance);
        }
        CheckOutcome::Evicted
    }
}

impl<T> Drop for IdleEntry<T> {
    fn drop(&mut self) {
        if let Some(instance) = self.state.get_mut().instance.take() {
            (self.cleanup)(instance);
        }
    }
}

/// A resource that is evicted when idle and rebuilt on demand.
pub struct IdleManaged<T> {
    entry: Arc<IdleEntry<T>>,
}

impl<T: Send + Sync + 'static> IdleManaged<T> {
    /// Returns the instance, restoring it first if it was evicted.
    ///
    /// A failing restore, or one producing an invalid instance, is reported
    /// as [`Error::StaleRestore`]; the wrapper stays evicted and the next
    /// call tries again. Restoring a native resource from its own owning
    /// thread fails this way too; use [`get_in`](Self::get_in) there.
    pub fn get(&self) -> Result<Arc<T>> {
        self.acquire(None)
    }

    /// Like [`get`](Self::get), for code already running on a unit.
    ///
    /// When `ctx` belongs to the resource's owning thread, a native restore
    /// runs inline instead of being submitted.
    pub fn get_in(&self, ctx: &mut ThreadContext) -> Result<Arc<T>> {
        self.acquire(Some(ctx))
    }

    fn acquire(&self, ctx: Option<&mut ThreadContext>) -> Result<Arc<T>> {
        let entry = &*self.entry;
        let on_owner = entry.restore.owned_by_current_thread();
        {
            let mut state = entry.state.lock();
            state.last_access = Instant::now();
            loop {
                if let Some(instance) = &state.instance {
                    return Ok(Arc::clone(instance));
                }
                // The owning thread must not park behind a restore queued on it.
                if state.restoring == 0 || on_owner {
                    break;
                }
                entry.restored.wait(&mut state);
            }
            state.restoring += 1;
        }
        let _restoring = Restoring { entry };

        let fresh = entry.restore.run(ctx).map_err(|source| Error::StaleRestore { source })?;
        if let Some(validate) = &entry.validate
            && !validate(&fresh)
        {
            // The rejected instance still needs its cleanup.
            (entry.cleanup)(Arc::new(fresh));
            return Err(Error::StaleRestore {
                source: "restore produced an invalid instance".into(),
            });
        }

        let mut state = entry.state.lock();
        if let Some(existing) = &state.instance {
            // Lost the race to a concurrent restore.
            let existing = Arc::clone(existing);
            drop(state);
            (entry.cleanup)(Arc::new(fresh));
            return Ok(existing);
        }

        let fresh = Arc::new(fresh);
        state.instance = Some(Arc::clone(&fresh));
        state.restores += 1;
        if !state.armed {
            state.armed = self.arm();
        }
        Ok(fresh)
    }

    /// `true` while an instance is held (not evicted).
    #[must_use]
    pub fn is_resident(&self) -> bool {
        self.entry.state.lock().instance.is_some()
    }

    /// Number of evictions so far.
    #[must_use]
    pub fn evictions(&self) -> u64 {
        self.entry.state.lock().evictions
    }

    /// Number of restores so far.
    #[must_use]
    pub fn restores(&self) -> u64 {
        self.entry.state.lock().restores
    }

    #[must_use]
    pub fn policy(&self) -> IdlePolicy {
        self.entry.policy
    }

    /// Registers the entry with the idle check. Caller holds the state lock.
    fn arm(&self) -> bool {
        if self.entry.policy == IdlePolicy::Disabled {
            return false;
        }
        let Some(registry) = self.entry.registry.upgrade() else {
            return false;
        };
        let weak: Weak<dyn IdleCheck> = Arc::downgrade(&self.entry) as Weak<dyn IdleCheck>;
        registry.register(weak);
        true
    }
}

impl<T> Clone for IdleManaged<T> {
    fn clone(&self) -> Self {
        Self {
            entry: Arc::clone(&self.entry),
        }
    }
}

impl<T> fmt::Debug for IdleManaged<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.entry.state.lock();
        f.debug_struct("IdleManaged")
            .field("policy", &self.entry.policy)
            .field("resident", &state.instance.is_some())
            .field("evictions", &state.evictions)
            .field("restores", &state.restores)
            .finish()
    }
}
