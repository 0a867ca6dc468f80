use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hyperplex::demux::SharedListener;
use hyperplex::{matcher, BoxError, BoxFuture, Engine, Error, Orchestrator, Shutdown};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::TcpStream;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Start(&'static str),
    SetServing(&'static str, bool),
    Close(&'static str),
    Stop(&'static str),
}

#[derive(Debug, Clone, Default)]
struct Log(Arc<Mutex<Vec<Event>>>);

impl Log {
    fn push(&self, event: Event) {
        self.0.lock().push(event);
    }

    fn events(&self) -> Vec<Event> {
        self.0.lock().clone()
    }

    fn position(&self, event: &Event) -> Option<usize> {
        self.0.lock().iter().position(|e| e == event)
    }
}

/// An engine which writes its name to every connection, and records what the
/// orchestrator asks of it.
struct Recording {
    name: &'static str,
    log: Log,
    closing: Shutdown,
    closes: Arc<AtomicUsize>,
    fail_after: Option<Duration>,
    hang_on_close: bool,
}

impl Recording {
    fn new(name: &'static str, log: &Log) -> Self {
        Self {
            name,
            log: log.clone(),
            closing: Shutdown::new(),
            closes: Arc::new(AtomicUsize::new(0)),
            fail_after: None,
            hang_on_close: false,
        }
    }

    fn failing_after(mut self, delay: Duration) -> Self {
        self.fail_after = Some(delay);
        self
    }

    fn hanging_on_close(mut self) -> Self {
        self.hang_on_close = true;
        self
    }

    fn closes(&self) -> Arc<AtomicUsize> {
        self.closes.clone()
    }
}

impl Engine for Recording {
    fn start_with_listener(
        &self,
        _: Shutdown,
        mut listener: SharedListener,
    ) -> BoxFuture<'_, Result<(), BoxError>> {
        Box::pin(async move {
            self.log.push(Event::Start(self.name));
            let fail = async {
                match self.fail_after {
                    Some(delay) => tokio::time::sleep(delay).await,
                    None => std::future::pending().await,
                }
            };
            tokio::pin!(fail);

            let result = loop {
                tokio::select! {
                    () = self.closing.signalled() => break Ok(()),
                    () = &mut fail => break Err("boom".into()),
                    accepted = listener.accept() => match accepted {
                        Ok(mut conn) => {
                            let _ = conn.write_all(self.name.as_bytes()).await;
                        }
                        Err(error) => break Err(error.into()),
                    },
                }
            };

            // Engines close their own listener when they stop; it must not close the socket.
            listener.close();
            self.log.push(Event::Stop(self.name));
            result
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), BoxError>> {
        Box::pin(async move {
            self.closes.fetch_add(1, Ordering::SeqCst);
            self.log.push(Event::Close(self.name));
            if self.hang_on_close {
                std::future::pending::<()>().await;
            }
            self.closing.trigger();
            Ok(())
        })
    }

    fn set_serving(&self, serving: bool) {
        self.log.push(Event::SetServing(self.name, serving));
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

async fn free_addr() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().to_string()
}

#[tokio::test]
async fn cancel_shuts_every_engine_down_once() {
    init_tracing();
    let log = Log::default();
    let rpc = Recording::new("rpc", &log);
    let http = Recording::new("http", &log);
    let (rpc_closes, http_closes) = (rpc.closes(), http.closes());

    let orchestrator = Orchestrator::builder()
        .engine("rpc", matcher::prefix(&[0xAA, 0xBB, 0xCC][..]), rpc)
        .engine("http", matcher::http1(), http)
        .build()
        .unwrap();
    let states = orchestrator.engines();
    let health = orchestrator.health();

    let started = Instant::now();
    orchestrator
        .start(
            ("127.0.0.1", 0),
            tokio::time::sleep(Duration::from_millis(100)),
        )
        .await
        .expect("clean shutdown");
    assert!(started.elapsed() < Duration::from_secs(5));

    for name in ["rpc", "http"] {
        let serving_off = log
            .position(&Event::SetServing(name, false))
            .expect("marked not serving");
        let close = log.position(&Event::Close(name)).expect("closed");
        assert!(serving_off < close, "{name}: {:?}", log.events());
        assert!(log.position(&Event::Stop(name)).is_some());
    }

    assert_eq!(rpc_closes.load(Ordering::SeqCst), 1);
    assert_eq!(http_closes.load(Ordering::SeqCst), 1);
    assert!(states.iter().all(|state| !state.is_running()));
    assert_eq!(health.is_serving("rpc"), Some(false));
    assert_eq!(health.is_serving("http"), Some(false));
}

#[tokio::test]
async fn connections_reach_their_engine() {
    init_tracing();
    let log = Log::default();
    let addr = free_addr().await;

    let orchestrator = Orchestrator::builder()
        .engine("rpc", matcher::prefix(&[0xAA, 0xBB, 0xCC][..]), Recording::new("rpc", &log))
        .engine("http", matcher::http1(), Recording::new("http", &log))
        .build()
        .unwrap();
    let cancel = orchestrator.shutdown_handle();
    let health = orchestrator.health();
    let running = tokio::spawn(orchestrator.start(addr.clone(), std::future::pending()));

    let mut client = loop {
        match TcpStream::connect(&addr).await {
            Ok(stream) => break stream,
            Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
        }
    };
    // Only the signature, so the engine leaves nothing unread when it hangs up.
    client.write_all(b"GET ").await.unwrap();
    let mut reply = String::new();
    client.read_to_string(&mut reply).await.unwrap();
    assert_eq!(reply, "http");
    assert_eq!(health.is_serving("http"), Some(true));

    cancel.trigger();
    running.await.unwrap().expect("clean shutdown");
}

#[tokio::test]
async fn failing_engine_brings_everything_down() {
    init_tracing();
    let log = Log::default();
    let good = Recording::new("good", &log);
    let good_closes = good.closes();

    let orchestrator = Orchestrator::builder()
        .engine("good", matcher::http1(), good)
        .engine(
            "bad",
            matcher::any(),
            Recording::new("bad", &log).failing_after(Duration::from_millis(50)),
        )
        .build()
        .unwrap();

    let error = tokio::time::timeout(
        Duration::from_secs(5),
        orchestrator.start("127.0.0.1:0", std::future::pending()),
    )
    .await
    .expect("shutdown completes")
    .unwrap_err();

    let errors = error.errors();
    assert_eq!(errors.len(), 1, "{error}");
    assert!(matches!(errors[0], Error::Engine { name, .. } if name == "bad"));
    assert!(error.to_string().contains("boom"));

    assert_eq!(good_closes.load(Ordering::SeqCst), 1);
    assert!(log.position(&Event::Stop("good")).is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_cancel_and_failure_close_once() {
    init_tracing();
    for _ in 0..20 {
        let log = Log::default();
        let a = Recording::new("a", &log).failing_after(Duration::from_millis(20));
        let b = Recording::new("b", &log);
        let (a_closes, b_closes) = (a.closes(), b.closes());

        let orchestrator = Orchestrator::builder()
            .engine("a", matcher::prefix("A"), a)
            .engine("b", matcher::prefix("B"), b)
            .build()
            .unwrap();

        let cancel = orchestrator.shutdown_handle();
        let racers: Vec<_> = (0..3)
            .map(|_| {
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    cancel.trigger();
                })
            })
            .collect();

        let _ = tokio::time::timeout(
            Duration::from_secs(5),
            orchestrator.start("127.0.0.1:0", std::future::pending()),
        )
        .await
        .expect("shutdown completes");

        for racer in racers {
            racer.await.unwrap();
        }
        assert_eq!(a_closes.load(Ordering::SeqCst), 1);
        assert_eq!(b_closes.load(Ordering::SeqCst), 1);
    }
}

#[tokio::test]
async fn stop_monitors_are_joined() {
    init_tracing();
    let log = Log::default();
    let released = Arc::new(AtomicBool::new(false));

    let flag = released.clone();
    let orchestrator = Orchestrator::builder()
        .engine("any", matcher::any(), Recording::new("any", &log))
        .stop_monitor(move |shutdown| async move {
            shutdown.signalled().await;
            tokio::time::sleep(Duration::from_millis(20)).await;
            flag.store(true, Ordering::SeqCst);
        })
        .build()
        .unwrap();

    orchestrator
        .start("127.0.0.1:0", tokio::time::sleep(Duration::from_millis(20)))
        .await
        .unwrap();
    assert!(released.load(Ordering::SeqCst));
}

#[tokio::test]
async fn bind_failure_starts_nothing() {
    init_tracing();
    let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = taken.local_addr().unwrap();
    let log = Log::default();

    let orchestrator = Orchestrator::builder()
        .engine("any", matcher::any(), Recording::new("any", &log))
        .build()
        .unwrap();

    let error = orchestrator
        .start(("127.0.0.1", addr.port()), std::future::pending())
        .await
        .unwrap_err();
    assert!(matches!(error, Error::Bind { .. }), "{error}");
    assert!(error.to_string().contains(&addr.port().to_string()), "{error}");
    assert!(log.events().is_empty());
}

#[tokio::test]
async fn hanging_close_is_bounded() {
    init_tracing();
    let log = Log::default();

    let orchestrator = Orchestrator::builder()
        .engine(
            "stuck",
            matcher::any(),
            Recording::new("stuck", &log).hanging_on_close(),
        )
        .shutdown_timeout(Duration::from_millis(100))
        .build()
        .unwrap();
    let states = orchestrator.engines();

    let started = Instant::now();
    let error = orchestrator
        .start("127.0.0.1:0", async {})
        .await
        .unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(5));

    let errors = error.errors();
    assert!(errors
        .iter()
        .any(|e| matches!(e, Error::CloseTimeout { name } if name == "stuck")));
    assert!(!states[0].is_running());
}

#[tokio::test]
async fn single_engine_serve() {
    init_tracing();
    let log = Log::default();
    let addr = free_addr().await;

    let serving = tokio::spawn(hyperplex::engine::serve_on(
        addr.clone(),
        Recording::new("solo", &log),
        tokio::time::sleep(Duration::from_millis(500)),
    ));

    let mut client = loop {
        match TcpStream::connect(&addr).await {
            Ok(stream) => break stream,
            Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
        }
    };
    let mut reply = String::new();
    client.read_to_string(&mut reply).await.unwrap();
    assert_eq!(reply, "solo");

    serving.await.unwrap().unwrap();
}
