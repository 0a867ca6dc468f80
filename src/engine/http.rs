//! HTTP and RPC engines, serving any [`tower::Service`] with hyper.

use std::fmt;

use bytes::Bytes;
use hyper::body::Incoming;
use tokio::sync::watch;
use tower::util::BoxCloneSyncService;
use tower::{ServiceBuilder, ServiceExt as _};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;

use super::Engine;
use crate::body::{Body, Request, Response};
use crate::demux::SharedListener;
use crate::health::{HealthLayer, Probe, ServingFlag};
use crate::server::{Protocol, Server, ServerError};
use crate::shutdown::Shutdown;
use crate::{BoxError, BoxFuture};

/// An [`Engine`] which serves HTTP over hyper.
///
/// Requests are logged with [`TraceLayer`], and health probes are answered ahead of the
/// wrapped service. A handler which panics is answered with `500 Internal Server Error`
/// instead of dropping the connection.
///
/// Closing the engine stops accepting and lets open connections finish their in-flight
/// requests.
pub struct HyperEngine {
    service: BoxCloneSyncService<Request, Response, BoxError>,
    protocol: Protocol,
    probe: Probe,
    serving: ServingFlag,
    closing: Shutdown,
    stopped: watch::Sender<bool>,
}

impl fmt::Debug for HyperEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HyperEngine")
            .field("protocol", &self.protocol)
            .field("probe", &self.probe)
            .field("serving", &self.serving.get())
            .finish()
    }
}

impl HyperEngine {
    fn new<S, B>(service: S, protocol: Protocol, probe: Probe) -> Self
    where
        S: tower::Service<Request, Response = http::Response<B>> + Clone + Send + Sync + 'static,
        S::Future: Send + 'static,
        S::Error: Into<BoxError>,
        B: http_body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let service = service
            .map_response(|response: http::Response<B>| response.map(Body::new))
            .map_err(|error: S::Error| -> BoxError { error.into() });
        let (stopped, _) = watch::channel(true);

        Self {
            service: BoxCloneSyncService::new(service),
            protocol,
            probe,
            serving: ServingFlag::default(),
            closing: Shutdown::new(),
            stopped,
        }
    }

    /// An HTTP engine. HTTP/1.1 and HTTP/2 are both accepted, and `GET /healthz` is answered.
    pub fn http<S, B>(service: S) -> Self
    where
        S: tower::Service<Request, Response = http::Response<B>> + Clone + Send + Sync + 'static,
        S::Future: Send + 'static,
        S::Error: Into<BoxError>,
        B: http_body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        Self::new(service, Protocol::Auto, Probe::Http)
    }

    /// An RPC engine. Only HTTP/2 with prior knowledge is accepted, which is how gRPC clients
    /// connect, and the gRPC health check is answered.
    pub fn rpc<S, B>(service: S) -> Self
    where
        S: tower::Service<Request, Response = http::Response<B>> + Clone + Send + Sync + 'static,
        S::Future: Send + 'static,
        S::Error: Into<BoxError>,
        B: http_body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        Self::new(service, Protocol::Http2, Probe::Grpc)
    }

    /// Override the HTTP version served.
    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }
}

impl Engine for HyperEngine {
    fn start_with_listener(
        &self,
        shutdown: Shutdown,
        listener: SharedListener,
    ) -> BoxFuture<'_, Result<(), BoxError>> {
        Box::pin(async move {
            self.stopped.send_replace(false);
            tracing::info!(
                protocol = %listener.protocol(),
                address = %listener.local_addr(),
                "engine listening"
            );

            let service = ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CatchPanicLayer::new())
                .map_request(|req: http::Request<Incoming>| req.map(Body::from))
                .layer(HealthLayer::new(self.probe, self.serving.clone()))
                .service(self.service.clone());

            let serving = self.serving.clone();
            let closing = self.closing.signalled();
            let cancelled = shutdown.signalled();
            let signal = async move {
                tokio::select! {
                    () = closing => {},
                    () = cancelled => serving.set(false),
                }
            };

            let result = Server::new(listener, service)
                .with_protocol(self.protocol)
                .serve_with_graceful_shutdown(signal)
                .await;

            self.stopped.send_replace(true);
            tracing::debug!("engine stopped");
            result.map_err(ServerError::into_inner)
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), BoxError>> {
        Box::pin(async move {
            self.closing.trigger();
            let mut stopped = self.stopped.subscribe();
            // The sender lives as long as `self`, so this only returns once stopped.
            let _ = stopped.wait_for(|stopped| *stopped).await;
            Ok(())
        })
    }

    fn set_serving(&self, serving: bool) {
        self.serving.set(serving);
    }
}
