//! The listener engines receive.

use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use super::{DemuxError, DerivedListener, MuxStream};

/// A derived listener which engines may close freely.
///
/// Engines usually close their listener as part of stopping. Several engines share one
/// physical socket, so closing a `SharedListener` does nothing: the socket is closed only
/// through the [`ListenerHandle`](super::ListenerHandle) the orchestrator owns. The
/// listener still reports [`DemuxError::Closed`] once the demultiplexer stops.
#[derive(Debug)]
pub struct SharedListener {
    inner: DerivedListener,
}

impl SharedListener {
    /// Wrap a derived listener.
    pub fn new(inner: DerivedListener) -> Self {
        Self { inner }
    }

    /// The protocol this listener yields.
    pub fn protocol(&self) -> &str {
        self.inner.protocol()
    }

    /// The address of the shared physical socket.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr()
    }

    /// Wait for the next connection of this protocol.
    pub async fn accept(&mut self) -> Result<MuxStream, DemuxError> {
        self.inner.accept().await
    }

    /// Poll for the next connection of this protocol.
    pub fn poll_accept(&mut self, cx: &mut Context<'_>) -> Poll<Result<MuxStream, DemuxError>> {
        self.inner.poll_accept(cx)
    }

    /// Does nothing. The shared socket outlives any one engine.
    pub fn close(&self) {
        tracing::trace!(protocol = %self.protocol(), "ignoring close of shared listener");
    }
}

impl From<DerivedListener> for SharedListener {
    fn from(inner: DerivedListener) -> Self {
        Self::new(inner)
    }
}

impl crate::server::Accept for SharedListener {
    type Conn = MuxStream;
    type Error = DemuxError;

    fn poll_accept(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<Self::Conn, Self::Error>> {
        self.get_mut().inner.poll_accept(cx)
    }
}
