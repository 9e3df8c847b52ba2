//! Work Units
//!
//! A work unit is the only way native work reaches an [`OwningThread`]. There
//! are two kinds:
//!
//! - [`Command`]: side effects only, no result.
//! - [`Query<T>`]: side effects plus a typed result.
//!
//! Units are built on any thread, moved into the owning thread's queue, and
//! executed there exactly once with exclusive access to the
//! [`ThreadContext`]. Aggregates ([`Command::then`], [`Command::batch`],
//! [`Query::after`], [`Query::collect`]) run their parts back to back inside a
//! single queue slot, so no other submitter can interleave between them.
//!
//! ```rust,ignore
//! let upload = Command::new("upload vertices", move |ctx| {
//!     let gl = ctx.native::<MyGl>().ok_or("wrong backend")?;
//!     gl.buffer_data(vbo, &vertices);
//!     Ok(())
//! });
//! let count = Query::new("read draw count", |ctx| Ok(ctx.cycle()));
//!
//! thread.submit(upload.then(Command::new("flush", |_| Ok(()))))?;
//! let cycle = thread.submit(count)?;
//! ```
//!
//! [`OwningThread`]: crate::thread::OwningThread

use std::borrow::Cow;
use std::fmt;

use crate::errors::{Error, UnitError, UnitResult};
use crate::thread::ThreadContext;

/// Something that can run on an owning thread.
pub trait WorkUnit: Send + 'static {
    /// Value handed back to a blocking submitter.
    type Output: Send + 'static;

    /// Human-readable name used in logs and errors.
    fn label(&self) -> Cow<'static, str>;

    /// Runs the unit. Only ever called on the owning thread.
    fn execute(self, ctx: &mut ThreadContext) -> UnitResult<Self::Output>;
}

type Body<T> = Box<dyn FnOnce(&mut ThreadContext) -> UnitResult<T> + Send>;

// ─── Command ──────────────────────────────────────────────────────────────────

/// A unit of native work without a result.
pub struct Command {
    label: Cow<'static, str>,
    body: Body<()>,
}

impl Command {
    /// Wraps a closure as a command.
    pub fn new<F>(label: impl Into<Cow<'static, str>>, body: F) -> Self
    where
        F: FnOnce(&mut ThreadContext) -> UnitResult<()> + Send + 'static,
    {
        Self {
            label: label.into(),
            body: Box::new(body),
        }
    }

    /// A command that does nothing.
    #[must_use]
    pub fn noop() -> Self {
        Self::new("noop", |_| Ok(()))
    }

    /// Runs `self`, then `next`, in the same queue slot.
    ///
    /// If `self` fails, `next` is skipped.
    #[must_use]
    pub fn then(self, next: Command) -> Command {
        let label = format!("{} > {}", self.label, next.label);
        Command::new(label, move |ctx| {
            run_part(self, ctx)?;
            run_part(next, ctx)
        })
    }

    /// Runs every command in order in the same queue slot, stopping at the
    /// first failure.
    pub fn batch(label: impl Into<Cow<'static, str>>, commands: impl IntoIterator<Item = Command>) -> Command {
        let commands: Vec<Command> = commands.into_iter().collect();
        Command::new(label, move |ctx| {
            for command in commands {
                run_part(command, ctx)?;
            }
            Ok(())
        })
    }
}

impl WorkUnit for Command {
    type Output = ();

    fn label(&self) -> Cow<'static, str> {
        self.label.clone()
    }

    fn execute(self, ctx: &mut ThreadContext) -> UnitResult<()> {
        (self.body)(ctx)
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command").field("label", &self.label).finish_non_exhaustive()
    }
}

// ─── Query ────────────────────────────────────────────────────────────────────

/// A unit of native work that produces a value.
pub struct Query<T> {
    label: Cow<'static, str>,
    body: Body<T>,
}

impl<T: Send + 'static> Query<T> {
    /// Wraps a closure as a query.
    pub fn new<F>(label: impl Into<Cow<'static, str>>, body: F) -> Self
    where
        F: FnOnce(&mut ThreadContext) -> UnitResult<T> + Send + 'static,
    {
        Self {
            label: label.into(),
            body: Box::new(body),
        }
    }

    /// Transforms the result on the owning thread.
    #[must_use]
    pub fn map<U, F>(self, f: F) -> Query<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let label = self.label.clone();
        Query::new(label, move |ctx| (self.body)(ctx).map(f))
    }

    /// Runs `command` first, then this query, in the same queue slot.
    #[must_use]
    pub fn after(self, command: Command) -> Query<T> {
        let label = format!("{} > {}", command.label, self.label);
        Query::new(label, move |ctx| {
            run_part(command, ctx)?;
            run_part(self, ctx)
        })
    }

    /// Runs every query in order and gathers the results.
    pub fn collect(label: impl Into<Cow<'static, str>>, queries: impl IntoIterator<Item = Query<T>>) -> Query<Vec<T>> {
        let queries: Vec<Query<T>> = queries.into_iter().collect();
        Query::new(label, move |ctx| {
            let mut results = Vec::with_capacity(queries.len());
            for query in queries {
                results.push(run_part(query, ctx)?);
            }
            Ok(results)
        })
    }

    /// Drops the result, keeping only the side effects.
    #[must_use]
    pub fn into_command(self) -> Command {
        let label = self.label.clone();
        Command::new(label, move |ctx| (self.body)(ctx).map(drop))
    }
}

impl<T: Send + 'static> WorkUnit for Query<T> {
    type Output = T;

    fn label(&self) -> Cow<'static, str> {
        self.label.clone()
    }

    fn execute(self, ctx: &mut ThreadContext) -> UnitResult<T> {
        (self.body)(ctx)
    }
}

impl<T> fmt::Debug for Query<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query").field("label", &self.label).finish_non_exhaustive()
    }
}

/// Runs one part of an aggregate, tagging a failure with the part's label so
/// the outer `SubmissionFailure` still names the unit that actually failed.
fn run_part<U: WorkUnit>(unit: U, ctx: &mut ThreadContext) -> UnitResult<U::Output> {
    let label = unit.label();
    unit.execute(ctx)
        .map_err(|source| Box::new(Error::submission(label, source)) as UnitError)
}
