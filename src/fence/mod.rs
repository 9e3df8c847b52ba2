//! Completion Fences
//!
//! A [`CompletionFence`] answers "has the GPU finished everything queued
//! before this point?". Creating one schedules a marker insertion on the
//! owning thread and returns immediately; waiting never parks the owning
//! thread on the GPU. Instead the caller repeatedly submits a cheap,
//! non-blocking poll unit until the marker is reached.
//!
//! # Fence Lifecycle
//!
//! ```text
//!   Pending ──(insert unit runs)──► Armed(raw) ──(poll == signalled)──► Released
//!      │                                                                  ▲
//!      └────────(backend has no fences)───────────────────────────────────┘
//! ```
//!
//! The raw handle is deleted exactly once, on the transition into
//! `Released`, whichever observer gets there first: a blocking `get`, an
//! async waiter's per-cycle poll, a pool sweep, or thread teardown. After
//! that every operation is a no-op.
//!
//! A backend without native fences degrades to "always satisfied", so
//! callers never need a separate code path.

mod pool;

pub(crate) use pool::FencePool;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures::task::AtomicWaker;
use parking_lot::Mutex;

use crate::errors::{Error, Result};
use crate::thread::{NativeContext, OwningThread, RawFence};
use crate::unit::{Command, Query};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FenceSlot {
    Pending,
    Armed(RawFence),
    Released,
}

const WAIT_IDLE: u8 = 0;
const WAIT_STARTED: u8 = 1;
const WAIT_CANCELLED: u8 = 2;

/// Shared between the caller-side [`CompletionFence`] and the owning thread.
pub(crate) struct FenceState {
    slot: Mutex<FenceSlot>,
    done: AtomicBool,
    wait: AtomicU8,
    watching: AtomicBool,
    waker: AtomicWaker,
}

impl FenceState {
    pub(crate) fn new() -> Self {
        Self {
            slot: Mutex::new(FenceSlot::Pending),
            done: AtomicBool::new(false),
            wait: AtomicU8::new(WAIT_IDLE),
            watching: AtomicBool::new(false),
            waker: AtomicWaker::new(),
        }
    }

    #[inline]
    pub(crate) fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub(crate) fn arm(&self, raw: RawFence) {
        let mut slot = self.slot.lock();
        if *slot == FenceSlot::Pending {
            *slot = FenceSlot::Armed(raw);
        }
    }

    /// Marks the fence satisfied without a native handle.
    pub(crate) fn mark_released(&self) {
        *self.slot.lock() = FenceSlot::Released;
        self.finish();
    }

    /// Non-blocking poll; releases the native handle the first time the fence
    /// is seen as signalled. Returns whether the fence is satisfied.
    pub(crate) fn poll_release(&self, native: &mut dyn NativeContext) -> bool {
        let mut slot = self.slot.lock();
        match *slot {
            FenceSlot::Released => true,
            FenceSlot::Pending => false,
            FenceSlot::Armed(raw) => {
                if !native.poll_fence(raw) {
                    return false;
                }
                native.delete_fence(raw);
                *slot = FenceSlot::Released;
                drop(slot);
                self.finish();
                true
            }
        }
    }

    /// Deletes the native handle without polling it.
    pub(crate) fn release_now(&self, native: &mut dyn NativeContext) {
        let mut slot = self.slot.lock();
        if let FenceSlot::Armed(raw) = *slot {
            native.delete_fence(raw);
        }
        *slot = FenceSlot::Released;
        drop(slot);
        self.finish();
    }

    fn finish(&self) {
        self.done.store(true, Ordering::Release);
        self.waker.wake();
    }
}

/// Future-like marker for GPU completion of previously queued work.
///
/// Cloning shares the same underlying fence.
#[derive(Clone)]
pub struct CompletionFence {
    thread: OwningThread,
    state: Arc<FenceState>,
}

impl CompletionFence {
    /// Schedules a fence insertion after every unit currently queued on
    /// `thread`. Does not block.
    pub fn insert(thread: &OwningThread) -> Result<Self> {
        let state = Arc::new(FenceState::new());
        let armed = Arc::clone(&state);
        thread.schedule(Command::new("insert fence", move |ctx| {
            ctx.insert_fence(armed);
            Ok(())
        }))?;
        Ok(Self {
            thread: thread.clone(),
            state,
        })
    }

    /// `true` once the native handle has been released, either because the
    /// fence was observed as satisfied or because the backend has no fences.
    #[inline]
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.state.is_done()
    }

    /// `true` after a successful [`cancel`](Self::cancel).
    #[inline]
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.state.wait.load(Ordering::Acquire) == WAIT_CANCELLED
    }

    /// Blocks until the fence is satisfied.
    pub fn get(&self) -> Result<()> {
        self.wait(None)
    }

    /// Blocks until the fence is satisfied or `timeout` elapses.
    pub fn get_timeout(&self, timeout: Duration) -> Result<()> {
        self.wait(Some(timeout))
    }

    /// Stops future waits. Returns `false` once a wait has started or the
    /// fence is already satisfied; the GPU work itself always completes.
    pub fn cancel(&self) -> bool {
        if self.is_done() {
            return false;
        }
        self.state
            .wait
            .compare_exchange(WAIT_IDLE, WAIT_CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Marks a wait as started; fails if the fence was cancelled first.
    fn begin_wait(&self) -> Result<()> {
        match self.state.wait.compare_exchange(
            WAIT_IDLE,
            WAIT_STARTED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) | Err(WAIT_STARTED) => Ok(()),
            Err(_) => Err(Error::Cancelled),
        }
    }

    fn wait(&self, timeout: Option<Duration>) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if self.is_done() {
            return Ok(());
        }
        if self.thread.is_owning_thread() {
            return Err(Error::Reentrant("fence wait".into()));
        }
        self.begin_wait()?;

        let deadline = timeout.map(|t| Instant::now() + t);
        let poll_interval = self.thread.settings().fence_poll_interval;

        loop {
            let state = Arc::clone(&self.state);
            let satisfied = self.thread.submit(Query::new("poll fence", move |ctx| {
                Ok(ctx.poll_fence(&state))
            }))?;
            if satisfied {
                return Ok(());
            }

            let pause = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::Timeout(timeout.unwrap_or_default()));
                    }
                    poll_interval.min(deadline - now)
                }
                None => poll_interval,
            };
            std::thread::sleep(pause);
        }
    }
}

impl Future for CompletionFence {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.is_cancelled() {
            return Poll::Ready(Err(Error::Cancelled));
        }
        if self.is_done() {
            return Poll::Ready(Ok(()));
        }
        if let Err(e) = self.begin_wait() {
            return Poll::Ready(Err(e));
        }

        self.state.waker.register(cx.waker());
        // Completion may have raced the registration.
        if self.is_done() {
            return Poll::Ready(Ok(()));
        }

        if !self.state.watching.swap(true, Ordering::AcqRel) {
            let state = Arc::clone(&self.state);
            let scheduled = self.thread.schedule(Command::new("watch fence", move |ctx| {
                ctx.watch_fence(state);
                Ok(())
            }));
            if let Err(e) = scheduled {
                return Poll::Ready(Err(e));
            }
        }
        Poll::Pending
    }
}

impl fmt::Debug for CompletionFence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionFence")
            .field("thread", &self.thread.name())
            .field("slot", &*self.state.slot.lock())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
