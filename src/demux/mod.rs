//! Demultiplex one listening socket into one listener per protocol.
//!
//! [`Demux`] owns the physical [`TcpListener`]. Every accepted connection is classified in its
//! own task: upgraded to TLS when configured, sniffed until the [`Protocols`] registry can
//! decide, then wrapped so the sniffed bytes are replayed, and queued on the matching
//! [`DerivedListener`]. Connections which match nothing are reset.
//!
//! The socket is closed only through the [`ListenerHandle`], which the owner of the
//! demultiplexer keeps. Derived listeners can be closed independently without affecting
//! the socket or each other.

use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, trace, warn, Instrument as _};

use crate::matcher::{Decision, Protocols};
use crate::rewind::Rewind;
use crate::shutdown::{Shutdown, Signalled};

mod shared;

pub use self::shared::SharedListener;

const DEFAULT_CLASSIFY_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_BACKLOG: usize = 128;

/// An error from the demultiplexer or one of its derived listeners.
#[derive(Debug, thiserror::Error)]
pub enum DemuxError {
    /// The listener was closed. During shutdown this is expected.
    #[error("listener closed")]
    Closed,

    /// Accepting from the physical socket failed.
    #[error("accept error: {0}")]
    Accept(#[source] io::Error),
}

impl DemuxError {
    /// Whether this error only reports that the listener was closed.
    pub fn is_closed(&self) -> bool {
        matches!(self, DemuxError::Closed)
    }
}

/// Settings for the demultiplexer.
#[derive(Debug, Clone)]
pub struct Config {
    classify_timeout: Duration,
    backlog: usize,

    #[cfg(feature = "tls")]
    tls: Option<Arc<rustls::ServerConfig>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            classify_timeout: DEFAULT_CLASSIFY_TIMEOUT,
            backlog: DEFAULT_BACKLOG,
            #[cfg(feature = "tls")]
            tls: None,
        }
    }
}

impl Config {
    /// Maximum time from accept until a connection is classified, including any TLS handshake.
    ///
    /// Connections which have not sent enough bytes to be classified by then are closed.
    /// Defaults to 10 seconds.
    pub fn with_classify_timeout(mut self, timeout: Duration) -> Self {
        self.classify_timeout = timeout;
        self
    }

    /// Number of classified connections each derived listener queues before
    /// classification tasks wait for the engine to accept. Defaults to 128.
    pub fn with_backlog(mut self, backlog: usize) -> Self {
        self.backlog = backlog.max(1);
        self
    }

    /// Upgrade every accepted connection to TLS before classification.
    #[cfg(feature = "tls")]
    pub fn with_tls(mut self, config: Arc<rustls::ServerConfig>) -> Self {
        self.tls = Some(config);
        self
    }

    /// The classification timeout.
    pub fn classify_timeout(&self) -> Duration {
        self.classify_timeout
    }
}

struct Routes {
    protocols: Protocols,
    senders: Vec<mpsc::Sender<MuxStream>>,
    config: Config,
}

/// Accepts connections from a physical socket and routes them to derived listeners.
pub struct Demux {
    listener: TcpListener,
    routes: Arc<Routes>,
    closing: Shutdown,
}

impl fmt::Debug for Demux {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Demux")
            .field("listener", &self.listener)
            .field("protocols", &self.routes.protocols)
            .finish()
    }
}

impl Demux {
    /// Demultiplex an already bound listener.
    ///
    /// Returns the demultiplexer, the handle which closes the socket, and one derived
    /// listener per registered protocol, in registration order.
    pub fn new(
        listener: TcpListener,
        protocols: Protocols,
        config: Config,
    ) -> io::Result<(Demux, ListenerHandle, Vec<DerivedListener>)> {
        let local_addr = listener.local_addr()?;
        let closing = Shutdown::new();

        let mut senders = Vec::with_capacity(protocols.len());
        let mut listeners = Vec::with_capacity(protocols.len());
        for protocol in protocols.shared_names() {
            let (tx, rx) = mpsc::channel(config.backlog);
            senders.push(tx);
            listeners.push(DerivedListener::new(protocol, local_addr, rx));
        }

        let demux = Demux {
            listener,
            routes: Arc::new(Routes {
                protocols,
                senders,
                config,
            }),
            closing: closing.clone(),
        };

        let handle = ListenerHandle {
            local_addr,
            closing,
        };

        Ok((demux, handle, listeners))
    }

    /// Bind a new TCP socket and demultiplex it.
    pub async fn bind<A: ToSocketAddrs>(
        addr: A,
        protocols: Protocols,
        config: Config,
    ) -> io::Result<(Demux, ListenerHandle, Vec<DerivedListener>)> {
        let listener = TcpListener::bind(addr).await?;
        Self::new(listener, protocols, config)
    }

    /// Accept and classify connections until the socket is closed.
    ///
    /// Running out of file descriptors or buffers pauses accepting for a while, doubling
    /// from 10ms up to 1s, rather than stopping. Closing the socket still takes effect
    /// during a pause.
    ///
    /// Returns [`DemuxError::Closed`] once the [`ListenerHandle`] closes the socket, or
    /// [`DemuxError::Accept`] if accepting fails in a way that cannot be retried. Either
    /// way, the socket is closed, every classification in flight has been cancelled, and
    /// every derived listener will report itself closed once its queue is drained.
    pub async fn serve(self) -> Result<(), DemuxError> {
        let Demux {
            listener,
            routes,
            closing,
        } = self;

        let mut classifying = JoinSet::new();
        let mut closed = closing.signalled();
        let mut backoff = Backoff::default();
        let mut resume: Option<Instant> = None;

        let result = loop {
            tokio::select! {
                biased;
                () = &mut closed => {
                    debug!("demultiplexer closed");
                    break Err(DemuxError::Closed);
                }
                () = tokio::time::sleep_until(resume.unwrap_or_else(Instant::now)),
                    if resume.is_some() =>
                {
                    resume = None;
                }
                accepted = listener.accept(), if resume.is_none() => match accepted {
                    Ok((stream, remote)) => {
                        backoff.reset();
                        trace!(%remote, "accepted connection");
                        let span = tracing::span!(tracing::Level::TRACE, "connection", %remote);
                        let routes = routes.clone();
                        classifying.spawn(classify(stream, remote, routes).instrument(span));
                    }
                    Err(error) => match AcceptFailure::of(&error) {
                        AcceptFailure::Transient => {
                            debug!(%error, "transient accept error");
                        }
                        AcceptFailure::Exhausted => {
                            let delay = backoff.next();
                            warn!(%error, ?delay, "accept failed, pausing");
                            resume = Some(Instant::now() + delay);
                        }
                        AcceptFailure::Fatal => {
                            warn!(%error, "accept failed");
                            break Err(DemuxError::Accept(error));
                        }
                    },
                },
                Some(finished) = classifying.join_next(), if !classifying.is_empty() => {
                    if let Err(error) = finished {
                        if error.is_panic() {
                            warn!(%error, "classification task panicked");
                        }
                    }
                }
            }
        };

        drop(listener);
        classifying.shutdown().await;
        result
    }
}

/// How the accept loop reacts to an error from the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcceptFailure {
    /// Only the connection being accepted is affected. Accept again immediately.
    Transient,
    /// The process or the system is out of descriptors or buffers. Pause, then accept again.
    Exhausted,
    /// The socket itself is broken.
    Fatal,
}

impl AcceptFailure {
    fn of(error: &io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock => return AcceptFailure::Transient,
            io::ErrorKind::TimedOut | io::ErrorKind::OutOfMemory => {
                return AcceptFailure::Exhausted
            }
            _ => {}
        }

        #[cfg(unix)]
        if matches!(
            error.raw_os_error(),
            Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)
        ) {
            return AcceptFailure::Exhausted;
        }

        AcceptFailure::Fatal
    }
}

const BACKOFF_MIN: Duration = Duration::from_millis(10);
const BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Doubling pause between accepts while resources are exhausted.
#[derive(Debug)]
struct Backoff {
    next: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self { next: BACKOFF_MIN }
    }
}

impl Backoff {
    fn next(&mut self) -> Duration {
        let delay = self.next;
        self.next = (delay * 2).min(BACKOFF_MAX);
        delay
    }

    fn reset(&mut self) {
        self.next = BACKOFF_MIN;
    }
}

async fn classify(stream: TcpStream, remote: SocketAddr, routes: Arc<Routes>) {
    let deadline = Instant::now() + routes.config.classify_timeout;

    let mut stream = match tokio::time::timeout_at(deadline, upgrade(stream, &routes.config)).await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(error)) => {
            debug!(%error, "handshake failed");
            return;
        }
        Err(_) => {
            debug!("handshake timed out");
            return;
        }
    };

    let limit = routes.protocols.max_prefix_len();
    let sniffed =
        tokio::time::timeout_at(deadline, sniff(&mut stream, &routes.protocols, limit)).await;

    match sniffed {
        Ok(Ok((prefix, Decision::Matched(index)))) => {
            let Some(protocol) = routes.protocols.shared_name(index) else {
                return;
            };
            trace!(%protocol, sniffed = prefix.len(), "classified connection");
            let conn = MuxStream {
                inner: Rewind::new(stream, prefix.freeze()),
                remote_addr: remote,
                protocol: protocol.clone(),
            };
            if routes.senders[index].send(conn).await.is_err() {
                debug!(%protocol, "listener closed, dropping connection");
            }
        }
        Ok(Ok((prefix, _))) => {
            debug!(sniffed = prefix.len(), "no protocol matched");
            stream.reset();
        }
        Ok(Err(error)) => {
            debug!(%error, "read failed during classification");
            stream.reset();
        }
        Err(_) => {
            debug!("classification timed out");
            stream.reset();
        }
    }
}

async fn sniff(
    stream: &mut Stream,
    protocols: &Protocols,
    limit: usize,
) -> io::Result<(BytesMut, Decision)> {
    let mut buf = BytesMut::with_capacity(limit);
    loop {
        let decision = protocols.decide(&buf);
        if decision != Decision::Undecided || buf.len() >= limit {
            return Ok((buf, decision));
        }

        buf.reserve(limit - buf.len());
        if stream.read_buf(&mut buf).await? == 0 {
            return Ok((buf, decision));
        }
    }
}

#[cfg(feature = "tls")]
async fn upgrade(stream: TcpStream, config: &Config) -> io::Result<Stream> {
    match &config.tls {
        Some(tls) => {
            let stream = tokio_rustls::TlsAcceptor::from(tls.clone())
                .accept(stream)
                .await?;
            Ok(Stream::Tls(Box::new(stream)))
        }
        None => Ok(Stream::Tcp(stream)),
    }
}

#[cfg(not(feature = "tls"))]
async fn upgrade(stream: TcpStream, _: &Config) -> io::Result<Stream> {
    Ok(Stream::Tcp(stream))
}

/// The close side of the physical socket.
///
/// Closing consumes the handle, so the socket is closed at most once.
#[derive(Debug)]
pub struct ListenerHandle {
    local_addr: SocketAddr,
    closing: Shutdown,
}

impl ListenerHandle {
    /// The address the socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Close the physical socket.
    ///
    /// The demultiplexer's serve loop stops accepting, drops the socket and returns
    /// [`DemuxError::Closed`].
    pub fn close(self) {
        debug!(address = %self.local_addr, "closing listener");
        self.closing.trigger();
    }
}

/// A protocol-scoped view of the connections accepted by a [`Demux`].
///
/// Yields only connections classified as its protocol. It does not own the socket.
pub struct DerivedListener {
    protocol: Arc<str>,
    local_addr: SocketAddr,
    incoming: mpsc::Receiver<MuxStream>,
    closing: Shutdown,
    closed: Option<Signalled>,
}

impl fmt::Debug for DerivedListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DerivedListener")
            .field("protocol", &self.protocol)
            .field("local_addr", &self.local_addr)
            .field("closed", &self.closed.is_none())
            .finish()
    }
}

impl DerivedListener {
    fn new(
        protocol: Arc<str>,
        local_addr: SocketAddr,
        incoming: mpsc::Receiver<MuxStream>,
    ) -> Self {
        let closing = Shutdown::new();
        let closed = Some(closing.signalled());
        Self {
            protocol,
            local_addr,
            incoming,
            closing,
            closed,
        }
    }

    /// The protocol this listener yields.
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// The address of the shared physical socket.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// A handle which closes this listener from another task.
    pub fn closer(&self) -> DerivedCloser {
        DerivedCloser(self.closing.clone())
    }

    /// Stop yielding connections. The physical socket is unaffected.
    ///
    /// Connections already queued for this listener are dropped.
    pub fn close(&mut self) {
        self.closing.trigger();
        self.shut();
    }

    fn shut(&mut self) {
        if self.closed.take().is_some() {
            trace!(protocol = %self.protocol, "derived listener closed");
        }
        self.incoming.close();
        while self.incoming.try_recv().is_ok() {}
    }

    /// Poll for the next connection of this protocol.
    pub fn poll_accept(&mut self, cx: &mut Context<'_>) -> Poll<Result<MuxStream, DemuxError>> {
        match self.closed.as_mut() {
            None => return Poll::Ready(Err(DemuxError::Closed)),
            Some(closed) => {
                if Pin::new(closed).poll(cx).is_ready() {
                    self.shut();
                    return Poll::Ready(Err(DemuxError::Closed));
                }
            }
        }

        match ready!(self.incoming.poll_recv(cx)) {
            Some(stream) => Poll::Ready(Ok(stream)),
            None => {
                self.closed = None;
                Poll::Ready(Err(DemuxError::Closed))
            }
        }
    }

    /// Wait for the next connection of this protocol.
    ///
    /// Returns [`DemuxError::Closed`] once this listener or the demultiplexer is closed.
    pub async fn accept(&mut self) -> Result<MuxStream, DemuxError> {
        std::future::poll_fn(|cx| self.poll_accept(cx)).await
    }
}

impl crate::server::Accept for DerivedListener {
    type Conn = MuxStream;
    type Error = DemuxError;

    fn poll_accept(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<Self::Conn, Self::Error>> {
        self.get_mut().poll_accept(cx)
    }
}

/// Closes a [`DerivedListener`] from another task, waking any pending accept.
#[derive(Debug, Clone)]
pub struct DerivedCloser(Shutdown);

impl DerivedCloser {
    /// Close the derived listener. The physical socket is unaffected.
    pub fn close(&self) {
        self.0.trigger();
    }
}

#[derive(Debug)]
enum Stream {
    Tcp(TcpStream),
    #[cfg(feature = "tls")]
    Tls(Box<tokio_rustls::server::TlsStream<TcpStream>>),
}

impl Stream {
    fn tcp(&self) -> &TcpStream {
        match self {
            Stream::Tcp(stream) => stream,
            #[cfg(feature = "tls")]
            Stream::Tls(stream) => stream.get_ref().0,
        }
    }

    /// Drop the connection so the peer sees a reset rather than an orderly close.
    fn reset(self) {
        if let Err(error) = socket2::SockRef::from(self.tcp()).set_linger(Some(Duration::ZERO)) {
            trace!(%error, "unable to set linger for reset");
        }
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            Stream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Stream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            Stream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Stream::Tcp(stream) => Pin::new(stream).poll_write_vectored(cx, bufs),
            #[cfg(feature = "tls")]
            Stream::Tls(stream) => Pin::new(stream.as_mut()).poll_write_vectored(cx, bufs),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(feature = "tls")]
            Stream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            Stream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }

    fn is_write_vectored(&self) -> bool {
        match self {
            Stream::Tcp(stream) => stream.is_write_vectored(),
            #[cfg(feature = "tls")]
            Stream::Tls(stream) => stream.is_write_vectored(),
        }
    }
}

/// A classified connection.
///
/// Reads start with the bytes consumed during classification, so the consumer sees the
/// connection exactly as the peer sent it.
#[derive(Debug)]
pub struct MuxStream {
    inner: Rewind<Stream>,
    remote_addr: SocketAddr,
    protocol: Arc<str>,
}

impl MuxStream {
    /// The peer's address.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// The protocol this connection was classified as.
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Whether the connection was upgraded to TLS before classification.
    pub fn is_tls(&self) -> bool {
        match self.inner.get_ref() {
            Stream::Tcp(_) => false,
            #[cfg(feature = "tls")]
            Stream::Tls(_) => true,
        }
    }

    /// The negotiated ALPN protocol, for TLS connections.
    #[cfg(feature = "tls")]
    pub fn alpn_protocol(&self) -> Option<&[u8]> {
        match self.inner.get_ref() {
            Stream::Tcp(_) => None,
            Stream::Tls(stream) => stream.get_ref().1.alpn_protocol(),
        }
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher;

    static_assertions::assert_impl_all!(MuxStream: Send, Unpin);
    static_assertions::assert_impl_all!(DerivedListener: Send, Unpin);
    static_assertions::assert_impl_all!(Demux: Send);

    async fn demux(protocols: Protocols) -> (Demux, ListenerHandle, Vec<DerivedListener>) {
        Demux::bind("127.0.0.1:0", protocols, Config::default())
            .await
            .unwrap()
    }

    #[test]
    fn descriptor_exhaustion_pauses_accepting() {
        #[cfg(unix)]
        for code in [libc::EMFILE, libc::ENFILE, libc::ENOBUFS, libc::ENOMEM] {
            let error = io::Error::from_raw_os_error(code);
            assert_eq!(AcceptFailure::of(&error), AcceptFailure::Exhausted, "{error}");
        }

        let timed_out = io::Error::from(io::ErrorKind::TimedOut);
        assert_eq!(AcceptFailure::of(&timed_out), AcceptFailure::Exhausted);

        let reset = io::Error::from(io::ErrorKind::ConnectionReset);
        assert_eq!(AcceptFailure::of(&reset), AcceptFailure::Transient);

        let denied = io::Error::from(io::ErrorKind::PermissionDenied);
        assert_eq!(AcceptFailure::of(&denied), AcceptFailure::Fatal);
    }

    #[test]
    fn backoff_doubles_up_to_a_second() {
        let mut backoff = Backoff::default();
        let delays: Vec<_> = (0..9).map(|_| backoff.next()).collect();
        assert_eq!(delays[0], Duration::from_millis(10));
        assert_eq!(delays[1], Duration::from_millis(20));
        assert_eq!(delays[6], Duration::from_millis(640));
        assert_eq!(delays[7], Duration::from_secs(1));
        assert_eq!(delays[8], Duration::from_secs(1));

        backoff.reset();
        assert_eq!(backoff.next(), Duration::from_millis(10));
    }

    #[tokio::test]
    async fn derived_listeners_follow_registration_order() {
        let protocols = Protocols::new()
            .with("rpc", matcher::http2())
            .unwrap()
            .with("http", matcher::http1())
            .unwrap();
        let (_, handle, listeners) = demux(protocols).await;

        let names: Vec<_> = listeners.iter().map(|l| l.protocol().to_owned()).collect();
        assert_eq!(names, vec!["rpc", "http"]);
        assert!(listeners
            .iter()
            .all(|l| l.local_addr() == handle.local_addr()));
    }

    #[tokio::test]
    async fn closer_wakes_pending_accept() {
        let protocols = Protocols::new().with("any", matcher::any()).unwrap();
        let (_demux, _handle, mut listeners) = demux(protocols).await;
        let mut listener = listeners.pop().unwrap();
        let closer = listener.closer();

        let accept = tokio::spawn(async move { listener.accept().await });
        tokio::task::yield_now().await;
        closer.close();

        let result = tokio::time::timeout(Duration::from_secs(1), accept)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(DemuxError::Closed)));
    }

    #[tokio::test]
    async fn handle_stops_serve() {
        let protocols = Protocols::new().with("any", matcher::any()).unwrap();
        let (demux, handle, mut listeners) = demux(protocols).await;

        let serve = tokio::spawn(demux.serve());
        handle.close();

        let result = tokio::time::timeout(Duration::from_secs(1), serve)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(DemuxError::Closed)));

        let accepted = listeners[0].accept().await;
        assert!(matches!(accepted, Err(DemuxError::Closed)));
    }
}
