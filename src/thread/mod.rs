//! Owning Thread
//!
//! An [`OwningThread`] is a dedicated OS thread holding one native graphics
//! context. Every native operation for that context runs there; other threads
//! only ever hand it [work units](crate::unit).
//!
//! # Queue Model
//!
//! ```text
//!   caller A ── submit(u1) ──┐                      ┌──────────────────────┐
//!   caller B ── schedule(u2) ┼─► FIFO (flume) ────► │ owning thread loop   │
//!   sweeper  ── schedule(u3) ┘                      │  u1 → u2 → u3 → ...  │
//!                                                   │  every cycle_interval│
//!                                                   │   → cycle tasks      │
//!                                                   └──────────────────────┘
//! ```
//!
//! - [`OwningThread::submit`] blocks until the unit has run and hands back
//!   its result (or its failure as [`Error::SubmissionFailure`]).
//! - [`OwningThread::schedule`] returns immediately; failures are logged and
//!   never stop later units.
//! - [`OwningThread::on_cycle`] registers recurring per-cycle work, e.g.
//!   "once per displayed frame".
//!
//! All three share a single queue, so execution order equals arrival order
//! across every submitting thread. Panics inside a unit are caught and
//! reported like any other failure; the thread keeps running.
//!
//! # Lifecycle
//!
//! Handles are cheap clones. The thread stops when [`OwningThread::shutdown`]
//! is called or the last handle is dropped; units queued before the stop
//! request still run, fences still held are released, then the native context
//! is dropped on its own thread.

mod confined;
mod context;

pub use confined::Confined;
pub use context::{CycleTaskId, NativeContext, RawFence, ThreadContext};

use std::borrow::Cow;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use flume::{RecvTimeoutError, Sender};
use parking_lot::Mutex;

use crate::errors::{Error, Result, UnitError, UnitPanic, UnitResult};
use crate::fence::CompletionFence;
use crate::settings::Settings;
use crate::unit::{Query, WorkUnit};

pub(crate) type Job = Box<dyn FnOnce(&mut ThreadContext) + Send>;

enum Message {
    Run(Job),
    Shutdown,
}

struct Inner {
    name: Arc<str>,
    thread_id: ThreadId,
    sender: Sender<Message>,
    closed: AtomicBool,
    join: Mutex<Option<JoinHandle<()>>>,
    next_cycle_task: AtomicU64,
    settings: Settings,
}

/// Handle to a thread that owns a native graphics context.
#[derive(Clone)]
pub struct OwningThread {
    inner: Arc<Inner>,
}

/// Non-owning handle; does not keep the thread alive.
#[derive(Clone)]
pub struct WeakOwningThread {
    inner: Weak<Inner>,
}

impl OwningThread {
    /// Spawns a new owning thread.
    ///
    /// `factory` runs on the new thread and builds the native context there.
    /// This call blocks until the factory has returned, so a failing factory
    /// surfaces here as [`Error::ContextInit`].
    pub fn spawn<C, F>(name: impl Into<String>, settings: &Settings, factory: F) -> Result<Self>
    where
        C: NativeContext,
        F: FnOnce() -> UnitResult<C> + Send + 'static,
    {
        settings.validate()?;

        let name: Arc<str> = Arc::from(name.into());
        let (sender, receiver) = flume::unbounded::<Message>();
        let (ready_tx, ready_rx) = flume::bounded::<std::result::Result<(), UnitError>>(1);

        let thread_name = Arc::clone(&name);
        let cycle_interval = settings.cycle_interval;
        let fence_pool_threshold = settings.fence_pool_threshold;

        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let native = match factory() {
                    Ok(native) => native,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let mut ctx = ThreadContext::new(thread_name, Box::new(native), fence_pool_threshold);
                let _ = ready_tx.send(Ok(()));
                run_loop(&receiver, &mut ctx, cycle_interval);
            })?;

        let thread_id = handle.thread().id();
        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(source)) => {
                let _ = handle.join();
                return Err(Error::ContextInit {
                    thread: name.to_string(),
                    source,
                });
            }
            Err(_) => {
                let _ = handle.join();
                return Err(Error::ContextInit {
                    thread: name.to_string(),
                    source: "context factory panicked".into(),
                });
            }
        }

        log::info!("Owning thread '{name}' started");

        Ok(Self {
            inner: Arc::new(Inner {
                name,
                thread_id,
                sender,
                closed: AtomicBool::new(false),
                join: Mutex::new(Some(handle)),
                next_cycle_task: AtomicU64::new(1),
                settings: settings.clone(),
            }),
        })
    }

    /// Thread name given at spawn time.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub(crate) fn shared_name(&self) -> Arc<str> {
        Arc::clone(&self.inner.name)
    }

    /// Identity of the owning thread, fixed at construction.
    #[inline]
    #[must_use]
    pub fn id(&self) -> ThreadId {
        self.inner.thread_id
    }

    /// Settings the thread was spawned with.
    #[inline]
    #[must_use]
    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    /// Returns `true` when called from the owning thread itself.
    #[inline]
    #[must_use]
    pub fn is_owning_thread(&self) -> bool {
        std::thread::current().id() == self.inner.thread_id
    }

    /// Returns `true` once shutdown has been requested.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Fails with [`Error::AffinityViolation`] unless called on the owning thread.
    pub fn check_affinity(&self, operation: impl Into<Cow<'static, str>>) -> Result<()> {
        let actual = std::thread::current().id();
        if actual == self.inner.thread_id {
            return Ok(());
        }
        Err(Error::AffinityViolation {
            operation: operation.into(),
            owner: self.inner.name.to_string(),
            expected: self.inner.thread_id,
            actual,
        })
    }

    #[must_use]
    pub fn downgrade(&self) -> WeakOwningThread {
        WeakOwningThread {
            inner: Arc::downgrade(&self.inner),
        }
    }

    // ========================================================================
    // Submission
    // ========================================================================

    /// Runs `unit` on the owning thread and blocks until it has finished.
    pub fn submit<U: WorkUnit>(&self, unit: U) -> Result<U::Output> {
        if self.is_owning_thread() {
            return Err(Error::Reentrant(unit.label()));
        }

        let (reply_tx, reply_rx) = flume::bounded(1);
        self.send(Box::new(move |ctx: &mut ThreadContext| {
            let _ = reply_tx.send(execute(unit, ctx));
        }))?;

        // The reply sender is dropped unanswered only if the thread exited
        // before reaching the unit.
        reply_rx.recv().map_err(|_| self.closed_error())?
    }

    /// Queues `unit` without waiting for it.
    ///
    /// A failure is logged with the unit's label; later units still run.
    pub fn schedule<U: WorkUnit>(&self, unit: U) -> Result<()> {
        self.send(Box::new(move |ctx: &mut ThreadContext| {
            if let Err(e) = execute(unit, ctx) {
                log::error!("Scheduled unit on '{}' failed: {}", ctx.name(), e);
            }
        }))
    }

    /// Registers `task` to run once per cycle until cancelled.
    ///
    /// A failing task is logged and stays registered.
    pub fn on_cycle<F>(&self, label: impl Into<Cow<'static, str>>, task: F) -> Result<CycleTaskId>
    where
        F: FnMut(&mut ThreadContext) -> UnitResult<()> + Send + 'static,
    {
        let id = CycleTaskId(self.inner.next_cycle_task.fetch_add(1, Ordering::Relaxed));
        let label = label.into();
        self.send(Box::new(move |ctx: &mut ThreadContext| ctx.add_cycle_task(id, label, Box::new(task))))?;
        Ok(id)
    }

    /// Unregisters a cycle task. Takes effect before the next cycle.
    pub fn cancel_cycle_task(&self, id: CycleTaskId) -> Result<()> {
        self.send(Box::new(move |ctx: &mut ThreadContext| {
            if !ctx.remove_cycle_task(id) {
                log::debug!("Cycle task {id:?} on '{}' was not registered", ctx.name());
            }
        }))
    }

    /// Inserts a completion fence after everything queued so far.
    pub fn fence(&self) -> Result<CompletionFence> {
        CompletionFence::insert(self)
    }

    /// Number of native fences still armed in this thread's pool.
    pub fn outstanding_fences(&self) -> Result<usize> {
        self.submit(Query::new("count outstanding fences", |ctx| Ok(ctx.outstanding_fences())))
    }

    /// Stops the thread after the units already queued, then joins it.
    ///
    /// Calling it from a unit on the owning thread only requests the stop.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    pub(crate) fn send(&self, job: Job) -> Result<()> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        self.inner
            .sender
            .send(Message::Run(job))
            .map_err(|_| self.closed_error())
    }

    fn closed_error(&self) -> Error {
        Error::ThreadClosed(self.inner.name.to_string())
    }
}

impl fmt::Debug for OwningThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwningThread")
            .field("name", &self.inner.name)
            .field("thread_id", &self.inner.thread_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl WeakOwningThread {
    /// Upgrades to a strong handle if the thread is still running.
    #[must_use]
    pub fn upgrade(&self) -> Option<OwningThread> {
        self.inner
            .upgrade()
            .map(|inner| OwningThread { inner })
            .filter(|thread| !thread.is_closed())
    }
}

impl fmt::Debug for WeakOwningThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakOwningThread").finish_non_exhaustive()
    }
}

impl Inner {
    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.sender.send(Message::Shutdown);

        if std::thread::current().id() == self.thread_id {
            // Joining ourselves would deadlock; the loop exits after this unit.
            return;
        }
        if let Some(handle) = self.join.lock().take()
            && handle.join().is_err()
        {
            log::error!("Owning thread '{}' panicked during shutdown", self.name);
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// Owning-thread side
// ============================================================================

fn run_loop(receiver: &flume::Receiver<Message>, ctx: &mut ThreadContext, cycle_interval: Duration) {
    let mut next_cycle = Instant::now() + cycle_interval;

    loop {
        // A saturated queue must not starve the per-cycle work.
        if Instant::now() >= next_cycle {
            ctx.run_cycle();
            next_cycle = Instant::now() + cycle_interval;
        }

        match receiver.recv_deadline(next_cycle) {
            Ok(Message::Run(job)) => job(ctx),
            Ok(Message::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
    }

    ctx.teardown();
    log::info!("Owning thread '{}' stopped after {} cycles", ctx.name(), ctx.cycle());
}

/// Runs a unit, turning both failures and panics into `SubmissionFailure`.
fn execute<U: WorkUnit>(unit: U, ctx: &mut ThreadContext) -> Result<U::Output> {
    let label = unit.label();
    match catch_unwind(AssertUnwindSafe(|| unit.execute(ctx))) {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(source)) => Err(Error::submission(label, source)),
        Err(payload) => Err(Error::submission(label, Box::new(UnitPanic::from_payload(&*payload)))),
    }
}
