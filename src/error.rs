//! Errors reported by the orchestrator, and the set used to report several at once.

use std::fmt;
use std::io;

use crate::demux::DemuxError;
use crate::matcher::DuplicateProtocol;
use crate::BoxError;

/// An error from running multiplexed engines.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The listening socket could not be bound. Nothing was started.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// The requested address, as given.
        addr: String,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// An IO error outside of binding or serving.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// Two engines were registered under the same protocol name.
    #[error(transparent)]
    Protocol(#[from] DuplicateProtocol),

    /// The demultiplexer stopped accepting connections.
    #[error("demultiplexer: {0}")]
    Demux(#[from] DemuxError),

    /// An engine's serve loop failed.
    #[error("engine {name} failed: {source}")]
    Engine {
        /// The engine's protocol name.
        name: String,
        /// The engine's error.
        #[source]
        source: BoxError,
    },

    /// An engine failed to close cleanly.
    #[error("engine {name} failed to close: {source}")]
    Close {
        /// The engine's protocol name.
        name: String,
        /// The engine's error.
        #[source]
        source: BoxError,
    },

    /// An engine did not finish closing before the shutdown timeout.
    #[error("engine {name} did not close within the shutdown timeout")]
    CloseTimeout {
        /// The engine's protocol name.
        name: String,
    },

    /// A task was still running at the shutdown timeout, and was aborted.
    #[error("{name} was still running at the shutdown timeout and was aborted")]
    Aborted {
        /// The task's name.
        name: String,
    },

    /// A task panicked.
    #[error("{name} panicked: {source}")]
    Task {
        /// The task's name.
        name: String,
        /// The join error carrying the panic.
        #[source]
        source: tokio::task::JoinError,
    },

    /// Several independent failures, reported together.
    #[error("{0}")]
    Joined(ErrorSet),
}

impl Error {
    /// Whether this error is the expected consequence of a shutdown already in progress,
    /// i.e. something observed its listener being closed.
    pub fn is_listener_closed(&self) -> bool {
        match self {
            Error::Demux(error) => error.is_closed(),
            Error::Engine { source, .. } => source
                .downcast_ref::<DemuxError>()
                .is_some_and(DemuxError::is_closed),
            _ => false,
        }
    }

    /// The individual errors, flattening [`Error::Joined`].
    pub fn errors(&self) -> Vec<&Error> {
        match self {
            Error::Joined(set) => set.iter().flat_map(Error::errors).collect(),
            other => vec![other],
        }
    }
}

/// An ordered collection of independent failures.
///
/// Nothing recorded here masks anything else: every error is kept and displayed.
#[derive(Debug, Default)]
pub struct ErrorSet {
    errors: Vec<Error>,
}

impl ErrorSet {
    /// An empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an error.
    pub fn push(&mut self, error: Error) {
        self.errors.push(error);
    }

    /// Whether no error has been recorded.
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Number of recorded errors.
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// The first error recorded.
    pub fn first(&self) -> Option<&Error> {
        self.errors.first()
    }

    /// Iterate over recorded errors in the order they were recorded.
    pub fn iter(&self) -> std::slice::Iter<'_, Error> {
        self.errors.iter()
    }

    /// `Ok(())` when empty, otherwise the whole set as [`Error::Joined`].
    pub fn into_result(self) -> Result<(), Error> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(Error::Joined(self))
        }
    }
}

impl fmt::Display for ErrorSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, error) in self.errors.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{error}")?;
        }
        Ok(())
    }
}

impl IntoIterator for ErrorSet {
    type Item = Error;
    type IntoIter = std::vec::IntoIter<Error>;

    fn into_iter(self) -> Self::IntoIter {
        self.errors.into_iter()
    }
}

impl<'a> IntoIterator for &'a ErrorSet {
    type Item = &'a Error;
    type IntoIter = std::slice::Iter<'a, Error>;

    fn into_iter(self) -> Self::IntoIter {
        self.errors.iter()
    }
}

impl Extend<Error> for ErrorSet {
    fn extend<T: IntoIterator<Item = Error>>(&mut self, iter: T) {
        self.errors.extend(iter)
    }
}
