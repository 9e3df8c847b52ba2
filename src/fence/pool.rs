//! Outstanding Fence Pool
//!
//! Every fence an owning thread creates is remembered here until it has been
//! observed as satisfied. Callers routinely create fences and never wait on
//! them, so before each new fence the pool checks its size against the
//! threshold and, when over it, sweeps: satisfied handles are released and
//! dropped, the rest keep their place in the queue.
//!
//! The pool lives inside the [`ThreadContext`](crate::thread::ThreadContext),
//! so sweeping and creation only ever happen inside units on the owning
//! thread and cannot race graphics submission.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::fence::FenceState;
use crate::thread::NativeContext;

pub(crate) struct FencePool {
    outstanding: VecDeque<Arc<FenceState>>,
    threshold: usize,
    /// Set once the backend has reported that it cannot create fences.
    unavailable: bool,
}

impl FencePool {
    pub(crate) fn new(threshold: usize) -> Self {
        Self {
            outstanding: VecDeque::new(),
            threshold,
            unavailable: false,
        }
    }

    /// Entries held, including ones already released but not yet swept.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.outstanding.len()
    }

    /// Entries whose native fence is still armed.
    pub(crate) fn armed(&self) -> usize {
        self.outstanding.iter().filter(|state| !state.is_done()).count()
    }

    /// Arms `state` with a fresh native fence, sweeping first if the pool is
    /// over its threshold.
    pub(crate) fn insert(&mut self, native: &mut dyn NativeContext, state: Arc<FenceState>) {
        if self.outstanding.len() > self.threshold {
            self.sweep(native);
        }

        if let Some(raw) = native.create_fence() {
            state.arm(raw);
            self.outstanding.push_back(state);
        } else {
            if !self.unavailable {
                log::info!("Native fences unavailable; all fences report as already satisfied");
                self.unavailable = true;
            }
            state.mark_released();
        }
    }

    /// Releases satisfied fences and keeps the rest. Returns the number released.
    pub(crate) fn sweep(&mut self, native: &mut dyn NativeContext) -> usize {
        let before = self.outstanding.len();
        self.outstanding.retain(|state| !state.poll_release(native));
        let released = before - self.outstanding.len();
        log::debug!(
            "Fence pool swept: released {released}, {} still pending (threshold {})",
            self.outstanding.len(),
            self.threshold
        );
        released
    }

    /// Deletes every remaining fence without waiting; used at thread exit.
    pub(crate) fn release_all(&mut self, native: &mut dyn NativeContext) {
        for state in self.outstanding.drain(..) {
            state.release_now(native);
        }
    }
}
