//! Run several engines on one socket, and shut them all down together.
//!
//! The [`Orchestrator`] binds the socket, runs the [`Demux`] serve loop and every engine as
//! separate tasks, and waits. Shutdown starts when the cancellation signal fires, or when the
//! demultiplexer or any engine exits on its own. It runs exactly once:
//!
//! 1. every engine is marked not serving,
//! 2. every engine is closed, each bounded by the shutdown timeout,
//! 3. the physical socket is closed.
//!
//! Every task is then joined. Tasks still running a further shutdown timeout after the
//! socket closed are aborted. All failures are collected and returned together.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{FuturesUnordered, StreamExt as _};
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::task::{AbortHandle, JoinError};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn, Instrument as _};

use crate::demux::{self, Demux, ListenerHandle, SharedListener};
use crate::engine::{Adapter, Engine, EngineState};
use crate::error::Error;
use crate::health::HealthRegistry;
use crate::matcher::{Detect, Protocols};
use crate::shutdown::{self, Shutdown};
use crate::BoxFuture;

pub mod guard;

use self::guard::{Cause, ShutdownGuard};

const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

type StopMonitor = Box<dyn FnOnce(Shutdown) -> BoxFuture<'static, ()> + Send>;

/// Configures an [`Orchestrator`].
pub struct Builder {
    protocols: Protocols,
    engines: Vec<Adapter>,
    config: demux::Config,
    shutdown_timeout: Duration,
    monitors: Vec<StopMonitor>,
    error: Option<Error>,
}

impl fmt::Debug for Builder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builder")
            .field("protocols", &self.protocols)
            .field("config", &self.config)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .field("monitors", &self.monitors.len())
            .finish()
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            protocols: Protocols::new(),
            engines: Vec::new(),
            config: demux::Config::default(),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            monitors: Vec::new(),
            error: None,
        }
    }
}

impl Builder {
    /// Register an engine for the protocol `name`, recognised by `detector`.
    ///
    /// Engines registered earlier take precedence when detectors overlap. Registering a
    /// name twice is an error, reported by [`Builder::build`].
    pub fn engine<D, E>(mut self, name: impl Into<String>, detector: D, engine: E) -> Self
    where
        D: Detect,
        E: Engine,
    {
        if self.error.is_some() {
            return self;
        }

        let name = name.into();
        match self.protocols.register(name.clone(), detector) {
            Ok(_) => self.engines.push(Adapter::new(name, engine)),
            Err(duplicate) => self.error = Some(duplicate.into()),
        }
        self
    }

    /// How long a connection may take to be classified. Defaults to 10 seconds.
    pub fn classify_timeout(mut self, timeout: Duration) -> Self {
        self.config = self.config.with_classify_timeout(timeout);
        self
    }

    /// Classified connections queued per engine. Defaults to 128.
    pub fn backlog(mut self, backlog: usize) -> Self {
        self.config = self.config.with_backlog(backlog);
        self
    }

    /// How long shutdown may take before remaining work is aborted. Defaults to 30 seconds.
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Terminate TLS on every connection before it is classified.
    #[cfg(feature = "tls")]
    pub fn tls(mut self, config: Arc<rustls::ServerConfig>) -> Self {
        self.config = self.config.with_tls(config);
        self
    }

    /// Run `monitor` alongside the engines.
    ///
    /// It receives the cancellation token, and is joined before the orchestrator returns,
    /// so it can wait for shutdown and release resources.
    pub fn stop_monitor<F, Fut>(mut self, monitor: F) -> Self
    where
        F: FnOnce(Shutdown) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.monitors
            .push(Box::new(move |shutdown| Box::pin(monitor(shutdown))));
        self
    }

    /// Finish configuration.
    pub fn build(self) -> Result<Orchestrator, Error> {
        if let Some(error) = self.error {
            return Err(error);
        }

        let health = HealthRegistry::new();
        for engine in &self.engines {
            health.register(engine.name(), engine.state().serving_flag());
        }

        Ok(Orchestrator {
            protocols: self.protocols,
            engines: self.engines,
            config: self.config,
            shutdown_timeout: self.shutdown_timeout,
            monitors: self.monitors,
            health,
            cancel: Shutdown::new(),
        })
    }
}

/// Runs every registered engine on one shared socket.
pub struct Orchestrator {
    protocols: Protocols,
    engines: Vec<Adapter>,
    config: demux::Config,
    shutdown_timeout: Duration,
    monitors: Vec<StopMonitor>,
    health: HealthRegistry,
    cancel: Shutdown,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("protocols", &self.protocols)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .field("health", &self.health)
            .finish()
    }
}

impl Orchestrator {
    /// Configure a new orchestrator.
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// The serving status of every engine.
    pub fn health(&self) -> HealthRegistry {
        self.health.clone()
    }

    /// The lifecycle state of every engine, in registration order.
    pub fn engines(&self) -> Vec<Arc<EngineState>> {
        self.engines.iter().map(Adapter::state).collect()
    }

    /// A token which shuts the orchestrator down when triggered, like the start signal does.
    pub fn shutdown_handle(&self) -> Shutdown {
        self.cancel.clone()
    }

    /// Bind `addr` and serve until `signal` resolves, or until the demultiplexer or an
    /// engine stops.
    ///
    /// If the address cannot be bound, nothing is started and [`Error::Bind`] is returned.
    /// Otherwise this returns once every task has finished: `Ok(())` for a clean shutdown,
    /// or [`Error::Joined`] with every failure observed.
    pub async fn start<A, F>(self, addr: A, signal: F) -> Result<(), Error>
    where
        A: ToSocketAddrs + fmt::Debug,
        F: Future<Output = ()> + Send + 'static,
    {
        let requested = format!("{addr:?}");
        let listener = TcpListener::bind(addr).await.map_err(|source| Error::Bind {
            addr: requested,
            source,
        })?;
        self.serve(listener, signal).await
    }

    /// [`Orchestrator::start`], shutting down on `SIGINT` or `SIGTERM`.
    pub async fn start_with_signals<A>(self, addr: A) -> Result<(), Error>
    where
        A: ToSocketAddrs + fmt::Debug,
    {
        self.start(addr, shutdown::signal()).await
    }

    /// Serve on an already bound listener. See [`Orchestrator::start`].
    pub async fn serve<F>(self, listener: TcpListener, signal: F) -> Result<(), Error>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Orchestrator {
            protocols,
            engines,
            config,
            shutdown_timeout,
            monitors,
            cancel,
            ..
        } = self;

        let (demux, handle, listeners) = Demux::new(listener, protocols, config)?;
        info!(address = %handle.local_addr(), engines = engines.len(), "listening");

        let guard = ShutdownGuard::new();
        let mut tasks = Tasks::default();

        tasks.spawn(
            Kind::Demux,
            "demux",
            async move { demux.serve().await.map_err(Error::from) },
        );

        for (engine, listener) in engines.iter().zip(listeners) {
            engine.set_serving(true);

            let engine = engine.clone();
            let shutdown = cancel.clone();
            let name = engine.name().to_owned();
            let span = tracing::info_span!("engine", name = %name);
            tasks.spawn(
                Kind::Engine,
                name.clone(),
                async move {
                    engine
                        .start(shutdown, SharedListener::new(listener))
                        .await
                        .map_err(|source| Error::Engine { name, source })
                }
                .instrument(span),
            );
        }

        for (index, monitor) in monitors.into_iter().enumerate() {
            let monitor = monitor(cancel.clone());
            tasks.spawn(Kind::Monitor, format!("stop monitor {index}"), async move {
                monitor.await;
                Ok(())
            });
        }

        {
            let cancel = cancel.clone();
            let stopping = cancel.signalled();
            tasks.spawn(Kind::Signal, "signal", async move {
                tokio::select! {
                    () = signal => {
                        if cancel.trigger() {
                            info!("shutdown signal received");
                        }
                    }
                    () = stopping => {}
                }
                Ok(())
            });
        }

        let mut handle = Some(handle);
        let mut cancelled = cancel.signalled();
        let mut deadline: Option<Instant> = None;

        while !tasks.is_empty() {
            tokio::select! {
                () = &mut cancelled, if !guard.is_triggered() => {
                    if guard.trigger(Cause::Cancelled) {
                        let closing = Instant::now() + shutdown_timeout;
                        shut_down(&engines, &mut handle, &guard, closing).await;
                        deadline = Some(Instant::now() + shutdown_timeout);
                    }
                }
                Some((task, result)) = tasks.next() => {
                    match result {
                        Ok(Ok(())) => trace!(task = %task.name, "task finished"),
                        Ok(Err(error)) if error.is_listener_closed() => {
                            debug!(task = %task.name, "listener closed");
                        }
                        Ok(Err(error)) => {
                            error!(task = %task.name, %error, "task failed");
                            guard.record(error);
                        }
                        Err(join) if join.is_cancelled() => {
                            guard.record(Error::Aborted { name: task.name.clone() });
                        }
                        Err(join) => {
                            error!(task = %task.name, "task panicked");
                            guard.record(Error::Task { name: task.name.clone(), source: join });
                        }
                    }

                    if task.kind.is_critical() && guard.trigger(Cause::Failed(task.name.clone())) {
                        warn!(task = %task.name, "stopped unexpectedly, shutting down");
                        cancel.trigger();
                        let closing = Instant::now() + shutdown_timeout;
                        shut_down(&engines, &mut handle, &guard, closing).await;
                        deadline = Some(Instant::now() + shutdown_timeout);
                    }
                }
                () = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)),
                    if deadline.is_some() =>
                {
                    warn!(remaining = tasks.len(), "shutdown timeout elapsed, aborting tasks");
                    tasks.abort_all();
                    deadline = None;
                }
            }
        }

        info!("shutdown complete");
        guard.take_errors().into_result()
    }
}

async fn shut_down(
    engines: &[Adapter],
    handle: &mut Option<ListenerHandle>,
    guard: &ShutdownGuard,
    deadline: Instant,
) {
    info!("shutting down");

    for engine in engines {
        engine.set_serving(false);
    }

    let closing = engines.iter().map(|engine| async move {
        match tokio::time::timeout_at(deadline, engine.close()).await {
            Ok(Ok(())) => None,
            Ok(Err(source)) => Some(Error::Close {
                name: engine.name().to_owned(),
                source,
            }),
            Err(_) => Some(Error::CloseTimeout {
                name: engine.name().to_owned(),
            }),
        }
    });

    for error in futures_util::future::join_all(closing)
        .await
        .into_iter()
        .flatten()
    {
        warn!(%error, "engine did not close cleanly");
        guard.record(error);
    }

    if let Some(handle) = handle.take() {
        handle.close();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Demux,
    Engine,
    Monitor,
    Signal,
}

impl Kind {
    /// Whether this task stopping on its own brings the server down.
    fn is_critical(self) -> bool {
        matches!(self, Kind::Demux | Kind::Engine)
    }
}

#[derive(Debug)]
struct Task {
    kind: Kind,
    name: String,
}

type Finished = (Task, Result<Result<(), Error>, JoinError>);

/// Named tasks, aborted if dropped before they finish.
#[derive(Default)]
struct Tasks {
    running: FuturesUnordered<BoxFuture<'static, Finished>>,
    aborts: Vec<AbortHandle>,
}

impl Tasks {
    fn spawn<F>(&mut self, kind: Kind, name: impl Into<String>, future: F)
    where
        F: Future<Output = Result<(), Error>> + Send + 'static,
    {
        let task = Task {
            kind,
            name: name.into(),
        };
        let handle = tokio::spawn(future);
        self.aborts.push(handle.abort_handle());
        self.running
            .push(Box::pin(async move { (task, handle.await) }));
    }

    fn is_empty(&self) -> bool {
        self.running.is_empty()
    }

    fn len(&self) -> usize {
        self.running.len()
    }

    async fn next(&mut self) -> Option<Finished> {
        self.running.next().await
    }

    fn abort_all(&self) {
        for handle in &self.aborts {
            handle.abort();
        }
    }
}

impl Drop for Tasks {
    fn drop(&mut self) {
        self.abort_all();
    }
}
