//! One port, two protocols.
//!
//! Serves an HTTP echo service and an HTTP/2 "rpc" echo service from the same address, and
//! shuts both down together on ctrl-c.
//!
//! ```text
//! cargo run --example mux -- --address 127.0.0.1:8080
//! curl -d hello http://127.0.0.1:8080/
//! curl --http2-prior-knowledge -d hello http://127.0.0.1:8080/
//! curl http://127.0.0.1:8080/healthz
//! ```

use std::time::Duration;

use clap::Parser;
use http_body_util::BodyExt as _;
use hyperplex::body::{Body, Request, Response};
use hyperplex::engine::HyperEngine;
use hyperplex::{matcher, BoxError, Orchestrator};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(version, about = "Serve HTTP and HTTP/2 rpc traffic from one socket")]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    address: String,

    /// Seconds to wait for engines to drain on shutdown
    #[arg(long, default_value_t = 30)]
    shutdown_timeout: u64,
}

async fn echo(tag: &'static str, req: Request) -> Result<Response, BoxError> {
    let (parts, body) = req.into_parts();
    tracing::info!(method = %parts.method, path = %parts.uri.path(), "{tag} request");

    let data = body.collect().await?.to_bytes();
    let mut reply = format!("{tag}: ").into_bytes();
    reply.extend_from_slice(&data);
    reply.push(b'\n');
    Ok(Response::new(Body::from(bytes::Bytes::from(reply))))
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();

    let rpc = HyperEngine::rpc(tower::service_fn(|req| echo("rpc", req)));
    let http = HyperEngine::http(tower::service_fn(|req| echo("http", req)));

    let orchestrator = Orchestrator::builder()
        .engine("rpc", matcher::http2(), rpc)
        .engine("http", matcher::http1(), http)
        .shutdown_timeout(Duration::from_secs(args.shutdown_timeout))
        .stop_monitor(|shutdown| async move {
            shutdown.signalled().await;
            tracing::info!("draining connections");
        })
        .build()?;

    orchestrator.start_with_signals(args.address).await?;
    Ok(())
}
