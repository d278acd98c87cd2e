//! Concurrency-bounded micro-benchmarks for request/response workloads.
//!
//! [`runner::run`] drives a fixed number of units of work with a hard cap on
//! how many are in flight, timing the window from the first dispatch to the
//! last completion. [`HttpBench`] runs HTTP round trips through a client whose
//! connections are dialed by a [`CountingDialer`], so every byte written and
//! read on the wire is attributed to the run. [`EphemeralServer`] provides a
//! loopback target, and [`handler_calls`] benchmarks a handler in-process.

pub mod alloc;
pub mod client;
pub mod config;
pub mod error;
pub mod handler;
pub(crate) mod logging;
pub mod runner;
pub mod server;
pub mod transport;

pub use client::{BenchRequest, BenchResponse, HttpBench};
pub use config::{BenchConfig, BenchConfigLoadError};
pub use error::BenchError;
pub use handler::{handler_calls, handler_calls_with};
pub use runner::{run, RunResult, RunSpec};
pub use server::EphemeralServer;
pub use transport::{ByteCounters, ByteTally, CountingConn, CountingDialer, Dial, TcpDialer};
