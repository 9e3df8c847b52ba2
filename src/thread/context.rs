//! Owning-Thread State
//!
//! [`ThreadContext`] is everything that lives on an owning thread: the native
//! context supplied by the graphics layer, the outstanding-fence pool, the
//! per-cycle task list and the cycle counter. It is created on the owning
//! thread and never leaves it; work units receive it as `&mut ThreadContext`.
//!
//! The graphics layer plugs in through [`NativeContext`]. Its fence
//! primitives default to "fencing unavailable", in which case every fence
//! behaves as already satisfied.

use std::any::Any;
use std::borrow::Cow;
use std::sync::Arc;
use std::thread::ThreadId;

use smallvec::SmallVec;

use crate::errors::UnitResult;
use crate::fence::{FencePool, FenceState};

/// Raw native fence object as handed out by the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RawFence(pub u64);

/// The native graphics context owned by an [`OwningThread`].
///
/// Implementations do not need to be `Send`: the context is constructed on
/// the owning thread by the factory passed to [`OwningThread::spawn`] and is
/// never moved off it.
///
/// [`OwningThread`]: crate::thread::OwningThread
/// [`OwningThread::spawn`]: crate::thread::OwningThread::spawn
pub trait NativeContext: Any {
    /// Inserts a fence after all previously issued native commands.
    ///
    /// `None` means fences are unsupported; callers then treat every fence
    /// as already satisfied.
    fn create_fence(&mut self) -> Option<RawFence> {
        None
    }

    /// Non-blocking check whether `fence` has been reached by the GPU.
    fn poll_fence(&mut self, fence: RawFence) -> bool {
        let _ = fence;
        true
    }

    /// Releases a fence object.
    fn delete_fence(&mut self, fence: RawFence) {
        let _ = fence;
    }
}

/// Identifies a task registered with [`OwningThread::on_cycle`].
///
/// [`OwningThread::on_cycle`]: crate::thread::OwningThread::on_cycle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CycleTaskId(pub(crate) u64);

pub(crate) type CycleTask = Box<dyn FnMut(&mut ThreadContext) -> UnitResult<()> + Send>;

struct CycleEntry {
    id: CycleTaskId,
    label: Cow<'static, str>,
    task: CycleTask,
}

/// State confined to an owning thread.
pub struct ThreadContext {
    name: Arc<str>,
    thread_id: ThreadId,
    native: Box<dyn NativeContext>,
    fences: FencePool,
    /// Fences polled once per cycle on behalf of async waiters.
    watched_fences: Vec<Arc<FenceState>>,
    cycle_tasks: SmallVec<[CycleEntry; 4]>,
    cycle: u64,
}

impl ThreadContext {
    pub(crate) fn new(name: Arc<str>, native: Box<dyn NativeContext>, fence_pool_threshold: usize) -> Self {
        Self {
            name,
            thread_id: std::thread::current().id(),
            native,
            fences: FencePool::new(fence_pool_threshold),
            watched_fences: Vec::new(),
            cycle_tasks: SmallVec::new(),
            cycle: 0,
        }
    }

    /// Name of the owning thread.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Identity of the owning thread.
    #[inline]
    #[must_use]
    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    /// Number of completed cycles.
    #[inline]
    #[must_use]
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Downcasts the native context to the backend's concrete type.
    pub fn native<C: NativeContext>(&mut self) -> Option<&mut C> {
        let any: &mut dyn Any = &mut *self.native;
        any.downcast_mut::<C>()
    }

    /// The native context as a trait object.
    pub fn native_dyn(&mut self) -> &mut dyn NativeContext {
        &mut *self.native
    }

    /// Number of native fences still armed in this thread's pool.
    ///
    /// Fences already released by a waiter are not counted, even before the
    /// next sweep drops them from the pool.
    #[must_use]
    pub fn outstanding_fences(&self) -> usize {
        self.fences.armed()
    }

    // ─── Fences ───────────────────────────────────────────────────────────────

    pub(crate) fn insert_fence(&mut self, state: Arc<FenceState>) {
        self.fences.insert(&mut *self.native, state);
    }

    pub(crate) fn poll_fence(&mut self, state: &FenceState) -> bool {
        state.poll_release(&mut *self.native)
    }

    /// Polls `state` now and, if unsatisfied, once per cycle until it is.
    pub(crate) fn watch_fence(&mut self, state: Arc<FenceState>) {
        if !state.poll_release(&mut *self.native) {
            self.watched_fences.push(state);
        }
    }

    // ─── Cycles ───────────────────────────────────────────────────────────────

    pub(crate) fn add_cycle_task(&mut self, id: CycleTaskId, label: Cow<'static, str>, task: CycleTask) {
        self.cycle_tasks.push(CycleEntry { id, label, task });
    }

    pub(crate) fn remove_cycle_task(&mut self, id: CycleTaskId) -> bool {
        let before = self.cycle_tasks.len();
        self.cycle_tasks.retain(|entry| entry.id != id);
        before != self.cycle_tasks.len()
    }

    /// Runs one cycle: watched fences are polled, then every cycle task runs
    /// in registration order.
    pub(crate) fn run_cycle(&mut self) {
        self.cycle += 1;

        if !self.watched_fences.is_empty() {
            let native = &mut *self.native;
            self.watched_fences.retain(|state| !state.poll_release(native));
        }

        // Tasks get `&mut self`, so the list is detached while they run.
        let mut tasks = std::mem::take(&mut self.cycle_tasks);
        for entry in &mut tasks {
            if let Err(e) = (entry.task)(self) {
                log::warn!("Cycle task '{}' on '{}' failed: {}", entry.label, self.name, e);
            }
        }
        // Tasks registered during this cycle landed in the fresh list.
        tasks.append(&mut self.cycle_tasks);
        self.cycle_tasks = tasks;
    }

    /// Releases every fence still held; called as the thread exits.
    pub(crate) fn teardown(&mut self) {
        let native = &mut *self.native;
        self.fences.release_all(native);
        for state in self.watched_fences.drain(..) {
            state.release_now(native);
        }
        self.cycle_tasks.clear();
    }
}
