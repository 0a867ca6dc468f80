//! Engine health: the serving flags the orchestrator flips, and the probes which expose them.
//!
//! Every registered engine gets a [`ServingFlag`]. The orchestrator marks it serving when the
//! engine starts and not serving as the very first step of shutdown, before the socket is
//! closed, so load balancers stop routing new traffic while in-flight requests drain.

use std::convert::Infallible;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::future::{self, Either, Ready};
use http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use http_body::Frame;
use parking_lot::RwLock;

use crate::body::{Body, Request, Response};

/// The path of the HTTP health probe.
pub const HTTP_HEALTH_PATH: &str = "/healthz";

/// The path of the gRPC health checking protocol's `Check` method.
pub const GRPC_HEALTH_CHECK_PATH: &str = "/grpc.health.v1.Health/Check";

/// `grpc.health.v1.HealthCheckResponse.ServingStatus`
const GRPC_SERVING: u8 = 1;
const GRPC_NOT_SERVING: u8 = 2;

/// A shared, atomically updated serving status.
#[derive(Debug, Clone, Default)]
pub struct ServingFlag(Arc<AtomicBool>);

impl ServingFlag {
    /// A flag with the given initial status.
    pub fn new(serving: bool) -> Self {
        Self(Arc::new(AtomicBool::new(serving)))
    }

    /// Whether the engine is serving.
    pub fn get(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Update the status.
    pub fn set(&self, serving: bool) {
        self.0.store(serving, Ordering::Release);
    }
}

/// The serving status of every engine, by protocol name.
#[derive(Clone, Default)]
pub struct HealthRegistry {
    engines: Arc<RwLock<Vec<(Arc<str>, ServingFlag)>>>,
}

impl fmt::Debug for HealthRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.snapshot())
            .finish()
    }
}

impl HealthRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `flag` under `name`, replacing any flag already registered under that name.
    pub fn register(&self, name: impl Into<Arc<str>>, flag: ServingFlag) {
        let name = name.into();
        let mut engines = self.engines.write();
        match engines.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = flag,
            None => engines.push((name, flag)),
        }
    }

    /// The serving status of an engine, or `None` if no engine has that name.
    pub fn is_serving(&self, name: &str) -> Option<bool> {
        self.engines
            .read()
            .iter()
            .find(|(n, _)| &**n == name)
            .map(|(_, flag)| flag.get())
    }

    /// Every engine's serving status, in registration order.
    pub fn snapshot(&self) -> Vec<(String, bool)> {
        self.engines
            .read()
            .iter()
            .map(|(name, flag)| (name.to_string(), flag.get()))
            .collect()
    }
}

/// Which health probe an engine answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Probe {
    /// `GET /healthz`, answered `200 OK` or `503 Service Unavailable`.
    Http,

    /// The gRPC health checking protocol's unary `Check`.
    Grpc,
}

impl Probe {
    fn matches(&self, req: &Request) -> bool {
        match self {
            Probe::Http => req.method() == Method::GET && req.uri().path() == HTTP_HEALTH_PATH,
            Probe::Grpc => {
                req.method() == Method::POST && req.uri().path() == GRPC_HEALTH_CHECK_PATH
            }
        }
    }

    fn respond(&self, serving: bool) -> Response {
        match self {
            Probe::Http => {
                let (status, body) = if serving {
                    (StatusCode::OK, "ok")
                } else {
                    (StatusCode::SERVICE_UNAVAILABLE, "not serving")
                };
                let mut response = Response::new(Body::from(body));
                *response.status_mut() = status;
                response.headers_mut().insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("text/plain; charset=utf-8"),
                );
                response
            }
            Probe::Grpc => {
                let status = if serving {
                    GRPC_SERVING
                } else {
                    GRPC_NOT_SERVING
                };

                // Uncompressed length-prefixed message holding field 1 (status) as a varint.
                let message = Bytes::copy_from_slice(&[0, 0, 0, 0, 2, 0x08, status]);
                let mut trailers = HeaderMap::new();
                trailers.insert("grpc-status", HeaderValue::from_static("0"));

                let frames = futures_util::stream::iter([
                    Ok::<_, Infallible>(Frame::data(message)),
                    Ok(Frame::trailers(trailers)),
                ]);

                let body = Body::new(http_body_util::StreamBody::new(frames));
                let mut response = Response::new(body);
                response.headers_mut().insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("application/grpc"),
                );
                response
            }
        }
    }
}

/// Layer which answers health probes ahead of the wrapped service.
#[derive(Debug, Clone)]
pub struct HealthLayer {
    probe: Probe,
    serving: ServingFlag,
}

impl HealthLayer {
    /// Answer `probe` from `serving`.
    pub fn new(probe: Probe, serving: ServingFlag) -> Self {
        Self { probe, serving }
    }
}

impl<S> tower::Layer<S> for HealthLayer {
    type Service = HealthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        HealthService {
            inner,
            probe: self.probe,
            serving: self.serving.clone(),
        }
    }
}

/// Service which answers health probes, and passes every other request through.
#[derive(Debug, Clone)]
pub struct HealthService<S> {
    inner: S,
    probe: Probe,
    serving: ServingFlag,
}

impl<S> tower::Service<Request> for HealthService<S>
where
    S: tower::Service<Request, Response = Response>,
{
    type Response = Response;
    type Error = S::Error;
    type Future = Either<Ready<Result<Response, S::Error>>, S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        if self.probe.matches(&req) {
            tracing::trace!(probe = ?self.probe, "answering health probe");
            Either::Left(future::ready(Ok(self.probe.respond(self.serving.get()))))
        } else {
            Either::Right(self.inner.call(req))
        }
    }
}
