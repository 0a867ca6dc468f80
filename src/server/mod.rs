//! An HTTP server which accepts connections from any [`Accept`] source, such as a
//! [`DerivedListener`](crate::demux::DerivedListener), and serves each one with a
//! [`tower::Service`] on hyper.
//!
//! Shutdown is graceful: when the signal resolves the server stops accepting, asks every
//! open connection to finish its in-flight requests, and returns once they have.

use std::fmt;
use std::future::{poll_fn, Future};
use std::pin::{pin, Pin};
use std::task::{Context, Poll};

use hyper::body::Incoming;
use hyper::server::conn::{http1, http2};
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinSet;
use tracing::{debug, trace, Instrument as _};

use crate::shutdown::{Shutdown, Signalled};
use crate::BoxError;

/// An async source of new connections.
pub trait Accept {
    /// The connection type for this acceptor
    type Conn: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// The error type for this acceptor
    type Error: Into<BoxError>;

    /// Poll for a new connection
    fn poll_accept(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<Self::Conn, Self::Error>>;
}

/// The HTTP version spoken on accepted connections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// HTTP/1.1 only, with upgrades.
    Http1,

    /// HTTP/2 with prior knowledge only. gRPC uses this.
    Http2,

    /// Either, detected per connection.
    #[default]
    Auto,
}

/// A server that accepts connections and runs each of them using a [`tower::Service`].
pub struct Server<A, S> {
    incoming: A,
    service: S,
    protocol: Protocol,
}

impl<A, S> fmt::Debug for Server<A, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("protocol", &self.protocol)
            .finish()
    }
}

impl<A, S> Server<A, S> {
    /// Create a new server. The service is cloned for each connection.
    pub fn new(incoming: A, service: S) -> Self {
        Self {
            incoming,
            service,
            protocol: Protocol::default(),
        }
    }

    /// Set the HTTP version to serve.
    pub fn with_protocol(self, protocol: Protocol) -> Self {
        Self { protocol, ..self }
    }
}

impl<A, S, B> Server<A, S>
where
    A: Accept + Unpin,
    S: tower::Service<http::Request<Incoming>, Response = http::Response<B>>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
    S::Error: Into<BoxError>,
    B: http_body::Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<BoxError>,
{
    /// Serve connections until `signal` resolves, then drain open connections.
    ///
    /// Returns an error if the acceptor fails; open connections are still drained first.
    pub async fn serve_with_graceful_shutdown<F>(self, signal: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        let Server {
            mut incoming,
            service,
            protocol,
        } = self;

        let closing = Shutdown::new();
        let mut connections = JoinSet::new();
        let mut signal = pin!(signal);

        let result = loop {
            tokio::select! {
                biased;
                () = &mut signal => {
                    debug!("received shutdown signal");
                    break Ok(());
                }
                accepted = poll_fn(|cx| Pin::new(&mut incoming).poll_accept(cx)) => match accepted {
                    Ok(stream) => {
                        trace!("accepted connection");
                        let span = tracing::span!(tracing::Level::TRACE, "connection", ?protocol);
                        let conn = serve_connection(
                            protocol,
                            stream,
                            service.clone(),
                            closing.signalled(),
                        );
                        connections.spawn(
                            async move {
                                if let Err(error) = conn.await {
                                    debug!("connection error: {error}");
                                }
                                debug!("connection closed");
                            }
                            .instrument(span),
                        );
                    }
                    Err(error) => break Err(ServerError::accept(error)),
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        };

        closing.trigger();
        while connections.join_next().await.is_some() {}
        debug!("all connections closed");

        result
    }
}

macro_rules! drive {
    ($conn:expr, $closing:expr) => {{
        let mut conn = pin!($conn);
        let mut closing = $closing;
        tokio::select! {
            rv = conn.as_mut() => rv.map_err(Into::into),
            () = &mut closing => {
                debug!("connection received shutdown signal");
                conn.as_mut().graceful_shutdown();
                conn.await.map_err(Into::into)
            }
        }
    }};
}

async fn serve_connection<IO, S, B>(
    protocol: Protocol,
    stream: IO,
    service: S,
    closing: Signalled,
) -> Result<(), BoxError>
where
    IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    S: tower::Service<http::Request<Incoming>, Response = http::Response<B>>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
    S::Error: Into<BoxError>,
    B: http_body::Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<BoxError>,
{
    let io = TokioIo::new(stream);
    let service = TowerToHyperService::new(service);

    match protocol {
        Protocol::Http1 => {
            let mut builder = http1::Builder::new();
            builder.timer(TokioTimer::new());
            drive!(builder.serve_connection(io, service).with_upgrades(), closing)
        }
        Protocol::Http2 => {
            let mut builder = http2::Builder::new(TokioExecutor::new());
            builder.timer(TokioTimer::new());
            drive!(builder.serve_connection(io, service), closing)
        }
        Protocol::Auto => {
            let mut builder = auto::Builder::new(TokioExecutor::new());
            builder.http1().timer(TokioTimer::new());
            builder.http2().timer(TokioTimer::new());
            drive!(builder.serve_connection_with_upgrades(io, service), closing)
        }
    }
}

/// An error that can occur when serving connections.
///
/// This error is only returned at the end of the server. Individual connection's
/// errors are logged and discarded.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Accept Error
    #[error("accept error: {0}")]
    Accept(#[source] BoxError),
}

impl ServerError {
    fn accept<A>(error: A) -> Self
    where
        A: Into<BoxError>,
    {
        let boxed = error.into();
        debug!("accept error: {}", boxed);
        Self::Accept(boxed)
    }

    /// The error reported by the acceptor.
    pub fn into_inner(self) -> BoxError {
        match self {
            ServerError::Accept(error) => error,
        }
    }
}
