//! Once-only shutdown, and the errors collected while shutting down.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::error::{Error, ErrorSet};

/// What started a shutdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cause {
    /// The cancellation signal fired.
    Cancelled,

    /// A task failed or exited unexpectedly.
    Failed(String),
}

/// A latch which lets exactly one caller run the shutdown sequence, however many
/// triggers race, and which records every error seen along the way.
#[derive(Debug, Default)]
pub struct ShutdownGuard {
    triggered: AtomicBool,
    cause: Mutex<Option<Cause>>,
    errors: Mutex<ErrorSet>,
}

impl ShutdownGuard {
    /// A guard which has not been triggered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Trigger shutdown. Returns `true` for exactly one caller, which must then run the
    /// shutdown sequence.
    pub fn trigger(&self, cause: Cause) -> bool {
        let won = self
            .triggered
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            tracing::debug!(?cause, "shutdown triggered");
            *self.cause.lock() = Some(cause);
        }
        won
    }

    /// Whether shutdown has been triggered.
    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::Acquire)
    }

    /// The cause of the trigger which won.
    pub fn cause(&self) -> Option<Cause> {
        self.cause.lock().clone()
    }

    /// Record an error.
    pub fn record(&self, error: Error) {
        self.errors.lock().push(error);
    }

    /// Take every error recorded so far.
    pub fn take_errors(&self) -> ErrorSet {
        std::mem::take(&mut *self.errors.lock())
    }
}
