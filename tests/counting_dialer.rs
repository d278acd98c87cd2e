//! Byte accounting and forced teardown of instrumented connections

use std::{io, sync::Arc};

use async_trait::async_trait;
use reqbench::{run, ByteTally, CountingDialer, Dial, RunSpec};
use tokio::io::{duplex, split, AsyncReadExt, AsyncWriteExt, DuplexStream};

/// In-memory peer that echoes everything back.
struct Echo;

#[async_trait]
impl Dial for Echo {
    type Conn = DuplexStream;

    async fn dial(&self, _addr: &str) -> io::Result<DuplexStream> {
        let (client, server) = duplex(64 * 1024);
        tokio::spawn(async move {
            let (mut read, mut write) = split(server);
            let _ = tokio::io::copy(&mut read, &mut write).await;
        });
        Ok(client)
    }
}

struct Refused;

#[async_trait]
impl Dial for Refused {
    type Conn = DuplexStream;

    async fn dial(&self, addr: &str) -> io::Result<DuplexStream> {
        Err(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            format!("{addr} refused"),
        ))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn counters_equal_iterations_times_payload() {
    const PAYLOAD: usize = 37;
    const ITERATIONS: usize = 100;

    let dialer = Arc::new(CountingDialer::new(Echo));
    dialer.reset_counters();

    let dialer_w = Arc::clone(&dialer);
    let result = run(RunSpec::new(ITERATIONS, 8), move |_| {
        let dialer = Arc::clone(&dialer_w);
        async move {
            let mut conn = dialer.dial("echo").await?;
            conn.write_all(&[7u8; PAYLOAD]).await?;
            let mut buf = [0u8; PAYLOAD];
            conn.read_exact(&mut buf).await?;
            Ok(())
        }
    })
    .await
    .unwrap();

    let tally = dialer.tally();
    assert_eq!(
        tally,
        ByteTally {
            sent: (ITERATIONS * PAYLOAD) as u64,
            received: (ITERATIONS * PAYLOAD) as u64,
        }
    );
    assert_eq!(result.per_op(tally.sent), PAYLOAD as f64);
}

#[tokio::test]
async fn reset_isolates_runs() {
    let dialer = Arc::new(CountingDialer::new(Echo));
    let mut conn = dialer.dial("echo").await.unwrap();
    conn.write_all(b"first run").await.unwrap();
    assert_eq!(dialer.tally().sent, 9);

    dialer.reset_counters();
    conn.write_all(b"2nd").await.unwrap();
    assert_eq!(dialer.tally().sent, 3);
}

#[tokio::test]
async fn close_all_closes_every_registered_connection() {
    let dialer = CountingDialer::new(Echo);
    let mut conns = Vec::new();
    for _ in 0..3 {
        conns.push(dialer.dial("echo").await.unwrap());
    }
    assert_eq!(dialer.registered(), 3);

    assert_eq!(dialer.close_all(), 3);
    assert_eq!(dialer.registered(), 0);

    for conn in &mut conns {
        assert!(conn.is_closed());
        let mut buf = [0u8; 8];
        assert_eq!(conn.read(&mut buf).await.unwrap(), 0);
        let err = conn.write_all(b"late").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}

#[tokio::test]
async fn close_all_wakes_pending_reads() {
    let dialer = CountingDialer::new(Echo);
    let mut conn = dialer.dial("echo").await.unwrap();

    let reader = tokio::spawn(async move {
        let mut buf = [0u8; 8];
        conn.read(&mut buf).await
    });
    tokio::task::yield_now().await;

    assert_eq!(dialer.close_all(), 1);
    assert_eq!(reader.await.unwrap().unwrap(), 0);
}

#[tokio::test]
async fn close_all_without_connections_is_a_noop() {
    let dialer = CountingDialer::new(Echo);
    assert_eq!(dialer.close_all(), 0);
    assert_eq!(dialer.close_all(), 0);
    assert_eq!(dialer.registered(), 0);
}

#[tokio::test]
async fn dial_errors_pass_through_unregistered() {
    let dialer = CountingDialer::new(Refused);
    let err = dialer.dial("127.0.0.1:9").await.err().unwrap();

    assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    assert_eq!(err.to_string(), "127.0.0.1:9 refused");
    assert_eq!(dialer.registered(), 0);
    assert_eq!(dialer.tally(), ByteTally::default());
}
