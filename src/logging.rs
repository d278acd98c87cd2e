use std::{fmt::Display, io, net::SocketAddr, time::Duration};

use log::{debug, error, info, warn};

pub struct BenchLogger;

impl BenchLogger {
    pub fn run_started(iterations: usize, concurrency: usize) {
        debug!("Run started: iterations={iterations} concurrency={concurrency}");
    }

    pub fn run_finished(iterations: usize, elapsed: Duration, ops_per_sec: f64) {
        debug!(
            "Run finished: iterations={} elapsed={:?} ops/sec={:.2}",
            iterations, elapsed, ops_per_sec
        );
    }

    pub fn run_aborted(dispatched: usize, err: &dyn Display) {
        error!("Run aborted after dispatching {dispatched} iterations: {err}");
    }

    pub fn tcp_nodelay_failed(err: &io::Error) {
        error!("Failed to set TCP_NODELAY: {err}");
    }

    pub fn connection_dialed(id: u64, peer: &str) {
        debug!("Dialed connection #{id} to {peer}");
    }

    pub fn close_failed(peer: &str, err: &io::Error) {
        debug!("failed to close connection to {peer}: {err}");
    }

    pub fn connections_closed(closed: usize) {
        debug!("Closed {closed} instrumented connections");
    }

    pub fn bind_candidate_failed(addr: &SocketAddr, err: &io::Error) {
        debug!("Could not bind {addr}: {err}");
    }

    pub fn server_listening(url: &str) {
        info!("Test server listening on {url}");
    }

    pub fn serve_connection_error(peer: &SocketAddr, err: &dyn Display) {
        debug!("Test server connection {peer} ended with error: {err}");
    }

    pub fn accept_skipped(err: &io::Error) {
        debug!("Test server dropped a failed accept: {err}");
    }

    pub fn accept_backoff(err: &io::Error, delay: Duration) {
        warn!("Test server accept failed, retrying in {delay:?}: {err}");
    }

    pub fn serve_failed(err: &io::Error) {
        error!("Test server stopped serving: {err}");
    }

    pub fn server_stopped(url: &str) {
        info!("Test server {url} stopped");
    }
}
