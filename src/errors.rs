//! Error Types
//!
//! This module defines the error types used throughout the crate.
//!
//! # Overview
//!
//! The main error type [`Error`] covers all failure modes including:
//! - Thread-affinity violations (native calls off the owning thread)
//! - Work units that failed while executing on the owning thread
//! - Fence waits that timed out or were cancelled
//! - Rehydration factories that produced an unusable instance
//!
//! # Usage
//!
//! All public APIs return [`Result<T>`] which is an alias for `std::result::Result<T, Error>`.
//!
//! Work units themselves report failures as [`UnitError`], a boxed error that
//! any backend error type converts into with `?`. The owning thread wraps it in
//! [`Error::SubmissionFailure`] so the original cause stays reachable through
//! [`std::error::Error::source`].
//!
//! ```rust,ignore
//! use glthread::{Command, Error};
//!
//! let result = thread.submit(Command::new("upload", |_ctx| Err("out of memory".into())));
//! if let Err(Error::SubmissionFailure { label, source }) = result {
//!     log::error!("{label} failed: {source}");
//! }
//! ```

use std::borrow::Cow;
use std::thread::ThreadId;
use std::time::Duration;

use thiserror::Error;

/// Failure type produced by a work unit body.
pub type UnitError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type produced by a work unit body.
pub type UnitResult<T> = std::result::Result<T, UnitError>;

/// The main error type for the crate.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Thread Confinement Errors
    // ========================================================================
    /// A native operation was attempted off the thread that owns the context.
    #[error("Affinity violation: '{operation}' must run on thread '{owner}' ({expected:?}), called from {actual:?}")]
    AffinityViolation {
        /// What was attempted
        operation: Cow<'static, str>,
        /// Name of the owning thread
        owner: String,
        /// Identity of the owning thread
        expected: ThreadId,
        /// Identity of the calling thread
        actual: ThreadId,
    },

    /// A blocking call was made from the owning thread itself.
    #[error("Blocking call '{0}' issued from its own owning thread would deadlock")]
    Reentrant(Cow<'static, str>),

    /// The owning thread has shut down and no longer accepts work.
    #[error("Owning thread '{0}' has shut down")]
    ThreadClosed(String),

    /// The native context factory failed on the new thread.
    #[error("Failed to initialize native context on '{thread}': {source}")]
    ContextInit {
        /// Name of the thread being spawned
        thread: String,
        /// Underlying failure
        #[source]
        source: UnitError,
    },

    // ========================================================================
    // Execution Errors
    // ========================================================================
    /// A unit failed (or panicked) while executing on the owning thread.
    #[error("Work unit '{label}' failed: {source}")]
    SubmissionFailure {
        /// Label of the failed unit
        label: Cow<'static, str>,
        /// The original failure
        #[source]
        source: UnitError,
    },

    // ========================================================================
    // Fence Errors
    // ========================================================================
    /// The native fencing feature is not available on this context.
    ///
    /// Fence operations never surface this variant to callers; it is what
    /// the backend reports internally before fences degrade to satisfied.
    #[error("Native fences are not supported by this context")]
    FenceUnavailable,

    /// A bounded wait elapsed before the fence was satisfied.
    #[error("Fence wait timed out after {0:?}")]
    Timeout(Duration),

    /// The fence was cancelled before a wait started.
    #[error("Fence wait was cancelled")]
    Cancelled,

    // ========================================================================
    // Reclamation Errors
    // ========================================================================
    /// A rehydration factory failed or produced an invalid instance.
    #[error("Failed to restore evicted resource: {source}")]
    StaleRestore {
        /// Why the restore was rejected
        #[source]
        source: UnitError,
    },

    // ========================================================================
    // Construction & Configuration Errors
    // ========================================================================
    /// A rotating slot set needs at least two slots.
    #[error("Rotating slot set needs at least 2 slots, got {0}")]
    InvalidSlotCount(usize),

    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// JSON configuration parsing error.
    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Thread spawn error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl Error {
    /// Wraps a unit failure with the label of the unit that produced it.
    pub(crate) fn submission(label: Cow<'static, str>, source: UnitError) -> Self {
        Error::SubmissionFailure { label, source }
    }

    /// Returns `true` for [`Error::AffinityViolation`].
    #[inline]
    #[must_use]
    pub fn is_affinity_violation(&self) -> bool {
        matches!(self, Error::AffinityViolation { .. })
    }
}

/// Error carried by [`Error::SubmissionFailure`] when a unit panicked.
#[derive(Error, Debug)]
#[error("panicked: {0}")]
pub struct UnitPanic(pub String);

impl UnitPanic {
    pub(crate) fn from_payload(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "<non-string panic payload>".to_string()
        };
        UnitPanic(message)
    }
}

/// Alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;
