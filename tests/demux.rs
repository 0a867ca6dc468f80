use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use hyperplex::demux::{Config, Demux, DemuxError, DerivedListener, ListenerHandle};
use hyperplex::matcher::{self, Protocols};
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

const RPC_MAGIC: &[u8] = &[0xAA, 0xBB, 0xCC];

struct Running {
    addr: SocketAddr,
    handle: ListenerHandle,
    listeners: Vec<DerivedListener>,
    serve: JoinHandle<Result<(), DemuxError>>,
}

async fn run(protocols: Protocols, config: Config) -> Running {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let (demux, handle, listeners) = Demux::bind("127.0.0.1:0", protocols, config)
        .await
        .expect("bind demux");
    Running {
        addr: handle.local_addr(),
        handle,
        listeners,
        serve: tokio::spawn(demux.serve()),
    }
}

fn rpc_and_http() -> Protocols {
    Protocols::new()
        .with("rpc", matcher::prefix(RPC_MAGIC))
        .unwrap()
        .with("http", matcher::http1())
        .unwrap()
}

async fn accept(listener: &mut DerivedListener) -> hyperplex::MuxStream {
    tokio::time::timeout(Duration::from_secs(5), listener.accept())
        .await
        .expect("connection classified in time")
        .expect("listener open")
}

async fn expect_reset(client: &mut TcpStream) {
    let mut buf = [0u8; 16];
    let result = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .expect("server drops the connection");
    match result {
        Err(error) => assert_eq!(error.kind(), io::ErrorKind::ConnectionReset),
        Ok(n) => panic!("expected a reset, read {n} bytes"),
    }
}

#[tokio::test]
async fn routes_by_signature() {
    let Running {
        addr,
        handle,
        mut listeners,
        serve,
    } = run(rpc_and_http(), Config::default()).await;

    let mut rpc_client = TcpStream::connect(addr).await.unwrap();
    rpc_client.write_all(&[0xAA, 0xBB, 0xCC, 0x01, 0x02]).await.unwrap();

    let mut http_client = TcpStream::connect(addr).await.unwrap();
    http_client
        .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();

    let mut junk_client = TcpStream::connect(addr).await.unwrap();
    junk_client.write_all(b"XX").await.unwrap();

    let mut rpc = accept(&mut listeners[0]).await;
    assert_eq!(rpc.protocol(), "rpc");
    let mut buf = [0u8; 5];
    rpc.read_exact(&mut buf).await.unwrap();
    assert_eq!(buf, [0xAA, 0xBB, 0xCC, 0x01, 0x02]);

    let mut http = accept(&mut listeners[1]).await;
    assert_eq!(http.protocol(), "http");
    let mut buf = [0u8; 6];
    http.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"GET / ");

    expect_reset(&mut junk_client).await;

    // Classified connections are ordinary duplex streams.
    rpc.write_all(b"pong").await.unwrap();
    let mut buf = [0u8; 4];
    rpc_client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"pong");

    handle.close();
    let result = serve.await.unwrap();
    assert!(matches!(result, Err(DemuxError::Closed)));
}

#[tokio::test]
async fn prefix_is_transparent_for_large_payloads() {
    let Running {
        addr,
        handle,
        mut listeners,
        serve,
    } = run(rpc_and_http(), Config::default()).await;

    let payload: Vec<u8> = RPC_MAGIC
        .iter()
        .copied()
        .chain((0..256 * 1024).map(|i| (i % 251) as u8))
        .collect();

    let expected = payload.clone();
    let client = tokio::spawn(async move {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(&payload).await.unwrap();
        stream.shutdown().await.unwrap();
    });

    let mut conn = accept(&mut listeners[0]).await;
    let mut received = Vec::new();
    conn.read_to_end(&mut received).await.unwrap();
    assert_eq!(received.len(), expected.len());
    assert!(received == expected, "payload differs after classification");

    client.await.unwrap();
    handle.close();
    let _ = serve.await.unwrap();
}

#[tokio::test]
async fn earlier_registration_wins() {
    let protocols = Protocols::new()
        .with("long", matcher::prefix("GET "))
        .unwrap()
        .with("short", matcher::prefix("GE"))
        .unwrap();
    let Running {
        addr,
        handle,
        mut listeners,
        serve,
    } = run(protocols, Config::default()).await;

    let mut a = TcpStream::connect(addr).await.unwrap();
    a.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
    let conn = accept(&mut listeners[0]).await;
    assert_eq!(conn.protocol(), "long");

    let mut b = TcpStream::connect(addr).await.unwrap();
    b.write_all(b"GEX").await.unwrap();
    let conn = accept(&mut listeners[1]).await;
    assert_eq!(conn.protocol(), "short");

    handle.close();
    let _ = serve.await.unwrap();
}

#[tokio::test]
async fn closing_one_listener_keeps_the_socket() {
    let Running {
        addr,
        handle,
        mut listeners,
        serve,
    } = run(rpc_and_http(), Config::default()).await;

    let mut http = listeners.pop().unwrap();
    http.close();
    assert!(matches!(http.accept().await, Err(DemuxError::Closed)));

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(RPC_MAGIC).await.unwrap();
    let conn = accept(&mut listeners[0]).await;
    assert_eq!(conn.protocol(), "rpc");
    assert!(!serve.is_finished());

    handle.close();
    assert!(matches!(serve.await.unwrap(), Err(DemuxError::Closed)));
}

#[tokio::test]
async fn slow_prefix_times_out() {
    let config = Config::default().with_classify_timeout(Duration::from_millis(100));
    let Running {
        addr,
        handle,
        mut listeners,
        serve,
    } = run(rpc_and_http(), config).await;

    // A strict prefix of the rpc signature never resolves on its own.
    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(&RPC_MAGIC[..1]).await.unwrap();
    expect_reset(&mut client).await;

    // Classification of one slow peer does not hold up others.
    let mut stalled = TcpStream::connect(addr).await.unwrap();
    stalled.write_all(b"G").await.unwrap();
    let mut fast = TcpStream::connect(addr).await.unwrap();
    fast.write_all(b"POST /x HTTP/1.1\r\n\r\n").await.unwrap();
    let conn = accept(&mut listeners[1]).await;
    assert_eq!(conn.protocol(), "http");

    handle.close();
    let _ = serve.await.unwrap();
}

#[tokio::test]
async fn closed_demux_closes_derived_listeners() {
    let Running {
        handle,
        mut listeners,
        serve,
        ..
    } = run(rpc_and_http(), Config::default()).await;

    let mut rpc = listeners.remove(0);
    let waiting = tokio::spawn(async move { rpc.accept().await });

    handle.close();
    assert!(serve.await.unwrap().unwrap_err().is_closed());

    let accepted = tokio::time::timeout(Duration::from_secs(1), waiting)
        .await
        .expect("pending accept is released")
        .unwrap();
    assert!(matches!(accepted, Err(DemuxError::Closed)));
}
