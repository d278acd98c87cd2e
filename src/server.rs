use std::{
    io,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    time::Duration,
};

use axum::Router;
use hyper::server::conn::http1;
use hyper_util::{
    rt::{TokioIo, TokioTimer},
    server::graceful::GracefulShutdown,
    service::TowerToHyperService,
};
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle};

use crate::{config::BenchConfig, error::BenchError, logging::BenchLogger};

/// Loopback addresses tried in order when binding a test server.
pub const BIND_CANDIDATES: [SocketAddr; 2] = [
    SocketAddr::new(std::net::IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
    SocketAddr::new(std::net::IpAddr::V6(Ipv6Addr::LOCALHOST), 0),
];

/// Consecutive non-connection accept failures tolerated before the serve
/// loop gives up.
const MAX_ACCEPT_RETRIES: u32 = 8;
const ACCEPT_BACKOFF_BASE: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// HTTP/1 test server on a free loopback port.
///
/// Requests may be sent as soon as [`EphemeralServer::start`] returns: the
/// listener is bound by then, and connections queue until the background serve
/// loop accepts them.
pub struct EphemeralServer {
    url: String,
    addr: SocketAddr,
    stop: Option<oneshot::Sender<()>>,
    serve: Option<JoinHandle<Result<(), BenchError>>>,
}

impl EphemeralServer {
    pub async fn start(router: Router) -> Result<Self, BenchError> {
        Self::start_with(&BenchConfig::default(), router).await
    }

    pub async fn start_with(config: &BenchConfig, router: Router) -> Result<Self, BenchError> {
        let listener = bind_first(&BIND_CANDIDATES).await?;
        let addr = listener.local_addr()?;
        let url = format!("http://{addr}");

        let (stop_tx, stop_rx) = oneshot::channel();
        let serve = tokio::spawn(serve(
            listener,
            router,
            stop_rx,
            config.read_timeout(),
            config.shutdown_grace(),
        ));
        BenchLogger::server_listening(&url);

        Ok(Self {
            url,
            addr,
            stop: Some(stop_tx),
            serve: Some(serve),
        })
    }

    /// Base URL of the form `http://ip:port`, without a trailing slash.
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// False once the serve loop has exited, whether by `close` or by failure.
    pub fn is_serving(&self) -> bool {
        self.serve
            .as_ref()
            .is_some_and(|serve| !serve.is_finished())
    }

    /// Stops accepting, drains open connections and waits for the serve loop
    /// to exit. Any failure of the serve loop surfaces here.
    pub async fn close(mut self) -> Result<(), BenchError> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        let Some(serve) = self.serve.take() else {
            return Ok(());
        };
        let outcome = serve
            .await
            .map_err(|err| BenchError::Shutdown(err.to_string()))?;
        BenchLogger::server_stopped(&self.url);
        outcome
    }
}

impl Drop for EphemeralServer {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

pub(crate) async fn bind_first(candidates: &[SocketAddr]) -> Result<TcpListener, BenchError> {
    let mut attempts = Vec::with_capacity(candidates.len());
    for addr in candidates {
        match TcpListener::bind(addr).await {
            Ok(listener) => return Ok(listener),
            Err(err) => {
                BenchLogger::bind_candidate_failed(addr, &err);
                attempts.push((*addr, err));
            }
        }
    }
    Err(BenchError::Bind { attempts })
}

async fn serve(
    listener: TcpListener,
    router: Router,
    mut stop: oneshot::Receiver<()>,
    read_timeout: Duration,
    grace: Duration,
) -> Result<(), BenchError> {
    let mut builder = http1::Builder::new();
    builder
        .timer(TokioTimer::new())
        .header_read_timeout(read_timeout);
    let service = TowerToHyperService::new(router);
    let graceful = GracefulShutdown::new();

    let mut failures = 0;
    let accepted: io::Result<()> = 'accept: loop {
        tokio::select! {
            _ = &mut stop => break Ok(()),
            res = listener.accept() => {
                let (stream, peer) = match res {
                    Ok(accepted) => {
                        failures = 0;
                        accepted
                    }
                    Err(err) => match accept_failure(&err, failures) {
                        AcceptFailure::Skip => {
                            BenchLogger::accept_skipped(&err);
                            continue;
                        }
                        AcceptFailure::Retry(delay) => {
                            failures += 1;
                            BenchLogger::accept_backoff(&err, delay);
                            tokio::select! {
                                _ = &mut stop => break 'accept Ok(()),
                                _ = tokio::time::sleep(delay) => continue,
                            }
                        }
                        AcceptFailure::Fatal => break Err(err),
                    },
                };
                let conn = builder.serve_connection(TokioIo::new(stream), service.clone());
                let conn = graceful.watch(conn);
                tokio::spawn(async move {
                    if let Err(err) = conn.await {
                        BenchLogger::serve_connection_error(&peer, &err);
                    }
                });
            }
        }
    };
    drop(listener);

    let drained = tokio::time::timeout(grace, graceful.shutdown()).await;
    if let Err(err) = accepted {
        BenchLogger::serve_failed(&err);
        return Err(BenchError::Serve(err));
    }
    drained.map_err(|_| BenchError::Shutdown(format!("connections still open after {grace:?}")))
}

#[derive(Debug, PartialEq, Eq)]
enum AcceptFailure {
    /// The failure belongs to one peer; keep accepting.
    Skip,
    /// Likely transient (e.g. out of file descriptors); wait and try again.
    Retry(Duration),
    Fatal,
}

fn accept_failure(err: &io::Error, failures: u32) -> AcceptFailure {
    match err.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock => AcceptFailure::Skip,
        _ if failures >= MAX_ACCEPT_RETRIES => AcceptFailure::Fatal,
        _ => AcceptFailure::Retry(
            ACCEPT_BACKOFF_BASE
                .saturating_mul(1 << failures)
                .min(ACCEPT_BACKOFF_MAX),
        ),
    }
}
