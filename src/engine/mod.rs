//! The contract between the orchestrator and the protocol engines it runs.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::ToSocketAddrs;

use crate::demux::SharedListener;
use crate::health::ServingFlag;
use crate::shutdown::Shutdown;
use crate::{BoxError, BoxFuture};

mod http;

pub use self::http::HyperEngine;

/// A protocol server which can be run on a shared listener.
///
/// Engines are started once, and closed at most once, by the
/// [`Orchestrator`](crate::Orchestrator).
pub trait Engine: Send + Sync + 'static {
    /// Serve connections from `listener` until the engine is closed.
    ///
    /// `shutdown` is triggered when the whole server is shutting down. The future resolves
    /// when the engine has stopped. Returning early, with or without an error, shuts the
    /// whole server down.
    fn start_with_listener(
        &self,
        shutdown: Shutdown,
        listener: SharedListener,
    ) -> BoxFuture<'_, Result<(), BoxError>>;

    /// Stop accepting, drain in-flight work, and resolve once the engine has stopped.
    fn close(&self) -> BoxFuture<'_, Result<(), BoxError>>;

    /// Report whether the engine should be considered healthy.
    fn set_serving(&self, serving: bool);
}

impl<E> Engine for Arc<E>
where
    E: Engine + ?Sized,
{
    fn start_with_listener(
        &self,
        shutdown: Shutdown,
        listener: SharedListener,
    ) -> BoxFuture<'_, Result<(), BoxError>> {
        (**self).start_with_listener(shutdown, listener)
    }

    fn close(&self) -> BoxFuture<'_, Result<(), BoxError>> {
        (**self).close()
    }

    fn set_serving(&self, serving: bool) {
        (**self).set_serving(serving)
    }
}

/// The lifecycle state the orchestrator keeps for one engine.
#[derive(Debug)]
pub struct EngineState {
    name: Arc<str>,
    running: AtomicBool,
    serving: ServingFlag,
}

impl EngineState {
    fn new(name: Arc<str>) -> Self {
        Self {
            name,
            running: AtomicBool::new(false),
            serving: ServingFlag::default(),
        }
    }

    /// The protocol name the engine is registered under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the engine's serve future is still running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Whether the engine was last marked as serving.
    pub fn is_serving(&self) -> bool {
        self.serving.get()
    }

    pub(crate) fn serving_flag(&self) -> ServingFlag {
        self.serving.clone()
    }
}

struct Running<'a>(&'a EngineState);

impl<'a> Running<'a> {
    fn enter(state: &'a EngineState) -> Self {
        state.running.store(true, Ordering::Release);
        Self(state)
    }
}

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.0.running.store(false, Ordering::Release);
    }
}

/// Drives one [`Engine`] on behalf of the orchestrator, keeping its [`EngineState`] current.
#[derive(Clone)]
pub struct Adapter {
    engine: Arc<dyn Engine>,
    state: Arc<EngineState>,
}

impl fmt::Debug for Adapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Adapter")
            .field("state", &self.state)
            .finish()
    }
}

impl Adapter {
    /// Adapt `engine`, registered under `name`.
    pub fn new<E: Engine>(name: impl Into<Arc<str>>, engine: E) -> Self {
        Self {
            engine: Arc::new(engine),
            state: Arc::new(EngineState::new(name.into())),
        }
    }

    /// The protocol name the engine is registered under.
    pub fn name(&self) -> &str {
        self.state.name()
    }

    /// The engine's lifecycle state.
    pub fn state(&self) -> Arc<EngineState> {
        self.state.clone()
    }

    /// Run the engine. The state reports it running until this future completes or is dropped.
    pub async fn start(
        &self,
        shutdown: Shutdown,
        listener: SharedListener,
    ) -> Result<(), BoxError> {
        let _running = Running::enter(&self.state);
        tracing::debug!(engine = %self.name(), "starting engine");
        self.engine.start_with_listener(shutdown, listener).await
    }

    /// Close the engine.
    pub async fn close(&self) -> Result<(), BoxError> {
        tracing::debug!(engine = %self.name(), "closing engine");
        self.engine.close().await
    }

    /// Mark the engine serving or not serving.
    pub fn set_serving(&self, serving: bool) {
        self.state.serving.set(serving);
        self.engine.set_serving(serving);
    }
}

/// Serve a single engine on `addr`, accepting every connection, until `signal` resolves.
///
/// This is the orchestrator with one catch-all protocol, so the engine gets the same
/// lifecycle as in a multiplexed server.
pub async fn serve_on<A, E, F>(addr: A, engine: E, signal: F) -> Result<(), crate::Error>
where
    A: ToSocketAddrs + fmt::Debug,
    E: Engine,
    F: Future<Output = ()> + Send + 'static,
{
    crate::Orchestrator::builder()
        .engine("default", crate::matcher::any(), engine)
        .build()?
        .start(addr, signal)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    static_assertions::assert_obj_safe!(Engine);
    static_assertions::assert_impl_all!(Adapter: Send, Sync, Clone);

    struct Noop;

    impl Engine for Noop {
        fn start_with_listener(
            &self,
            _: Shutdown,
            _: SharedListener,
        ) -> BoxFuture<'_, Result<(), BoxError>> {
            Box::pin(async { Ok(()) })
        }

        fn close(&self) -> BoxFuture<'_, Result<(), BoxError>> {
            Box::pin(async { Ok(()) })
        }

        fn set_serving(&self, _: bool) {}
    }

    #[test]
    fn adapter_tracks_serving() {
        let adapter = Adapter::new("noop", Arc::new(Noop));
        let state = adapter.state();
        assert_eq!(state.name(), "noop");
        assert!(!state.is_serving());
        assert!(!state.is_running());

        adapter.set_serving(true);
        assert!(state.is_serving());
        adapter.set_serving(false);
        assert!(!state.is_serving());
    }
}
