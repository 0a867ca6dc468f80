//! Hyperplex
//!
//! Serve several wire protocols from a single listening socket.
//!
//! Connections accepted on the one physical socket are sniffed by a [`Demux`](demux::Demux),
//! classified against an ordered set of protocol signatures ([`Protocols`]), and handed to the
//! engine registered for that protocol. The peeked bytes are rewound, so each engine reads the
//! connection from its very first byte.
//!
//! The [`Orchestrator`] owns the socket and runs the demultiplexer and every [`Engine`]
//! concurrently, shutting all of them down together (exactly once) when cancelled or when any
//! of them fails, and reporting every failure it saw as one joined error.
//!
//! ```no_run
//! # use hyperplex::{engine::HyperEngine, matcher, shutdown, Orchestrator};
//! # async fn run(rpc: HyperEngine, web: HyperEngine) -> Result<(), hyperplex::Error> {
//! let orchestrator = Orchestrator::builder()
//!     .engine("rpc", matcher::http2(), rpc)
//!     .engine("http", matcher::http1(), web)
//!     .build()?;
//!
//! orchestrator.start("0.0.0.0:8080", shutdown::signal()).await
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod body;
pub mod demux;
pub mod engine;
pub mod error;
pub mod health;
pub mod lifecycle;
pub mod matcher;
mod rewind;
pub mod server;
pub mod shutdown;

pub use self::demux::{Demux, MuxStream};
pub use self::engine::Engine;
pub use self::error::{Error, ErrorSet};
pub use self::lifecycle::Orchestrator;
pub use self::matcher::Protocols;
pub use self::shutdown::Shutdown;

/// A boxed, thread-safe error, used at the seams between the multiplexer and its engines.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A boxed future, used where engines are stored behind trait objects.
pub use futures_core::future::BoxFuture;
