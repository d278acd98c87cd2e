//! Lifecycle of the loopback test server

use std::time::Duration;

use axum::{routing::get, Router};
use reqbench::{BenchConfig, EphemeralServer};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

fn hello_router() -> Router {
    Router::new().route("/", get(|| async { "Hello World!" }))
}

async fn get_root(stream: &mut TcpStream) -> String {
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    String::from_utf8(raw).unwrap()
}

#[tokio::test]
async fn answers_on_its_base_url() {
    let _ = env_logger::builder().is_test(true).try_init();
    let server = EphemeralServer::start(hello_router()).await.unwrap();

    let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
    let response = get_root(&mut stream).await;

    assert!(response.starts_with("HTTP/1.1 200 OK"), "{response}");
    assert!(response.ends_with("Hello World!"), "{response}");
    server.close().await.unwrap();
}

#[tokio::test]
async fn refuses_connections_after_close() {
    let server = EphemeralServer::start(hello_router()).await.unwrap();
    let addr = server.local_addr();
    server.close().await.unwrap();

    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn close_drains_idle_keep_alive_connections() {
    let server = EphemeralServer::start(hello_router()).await.unwrap();

    let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: test\r\n\r\n")
        .await
        .unwrap();
    let mut buf = [0u8; 512];
    let n = stream.read(&mut buf).await.unwrap();
    assert!(n > 0);

    // The connection stays open and idle; shutdown must not wait on it.
    tokio::time::timeout(Duration::from_secs(2), server.close())
        .await
        .expect("close timed out")
        .unwrap();
    let mut rest = Vec::new();
    let drained = tokio::time::timeout(Duration::from_secs(2), stream.read_to_end(&mut rest)).await;
    assert!(drained.is_ok(), "server kept the idle connection open");
}

#[tokio::test]
async fn dropped_server_stops_serving() {
    let server = EphemeralServer::start(hello_router()).await.unwrap();
    let addr = server.local_addr();
    drop(server);

    let mut refused = false;
    for _ in 0..50 {
        if TcpStream::connect(addr).await.is_err() {
            refused = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(refused);
}

#[tokio::test]
async fn stalled_client_is_cut_by_read_timeout() {
    let config = BenchConfig {
        read_timeout: 1,
        ..BenchConfig::default()
    };
    let server = EphemeralServer::start_with(&config, hello_router())
        .await
        .unwrap();

    let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
    stream.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();

    let mut buf = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut buf)).await;
    assert!(read.is_ok(), "connection was not closed by the server");
    server.close().await.unwrap();
}
