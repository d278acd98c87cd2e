use std::{env, path::PathBuf};

use anyhow::Context;
use axum::{body::Body, http::StatusCode, routing::get, Router};
use hyper::{Request, Uri};
use serde::Serialize;

use reqbench::{
    alloc::CountingAllocator, handler_calls_with, BenchConfig, EphemeralServer, HttpBench,
    RunResult,
};

#[global_allocator]
static GLOBAL: CountingAllocator = CountingAllocator::system();

const HELLO: &str = "Hello World!";

struct Args {
    config: Option<PathBuf>,
    iterations: Option<usize>,
    concurrency: Option<usize>,
    json: bool,
}

#[derive(Serialize)]
struct Report {
    round_trips: RunResult,
    handler_calls: RunResult,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    env_logger::init();

    let args = parse_args()?;
    let mut config = match &args.config {
        Some(path) => BenchConfig::load(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => BenchConfig::default(),
    };
    if let Some(iterations) = args.iterations {
        config.iterations = iterations;
    }
    if let Some(concurrency) = args.concurrency {
        config.concurrency = concurrency;
    }

    if !args.json {
        println!(
            "config: iterations={} concurrency={} idle_timeout={}ms",
            config.iterations, config.concurrency, config.idle_timeout
        );
    }

    let app = Router::new().route("/", get(|| async { HELLO }));
    let server = EphemeralServer::start_with(&config, app.clone()).await?;
    let url: Uri = server.url().parse()?;

    let bench = HttpBench::from_config(&config);
    let round_trips = bench
        .round_trips(
            config.run_spec(),
            move |_, req| *req.uri_mut() = url.clone(),
            |_, resp| resp.status() == StatusCode::OK && resp.body() == HELLO.as_bytes(),
        )
        .await;
    bench.shutdown();
    server.close().await?;
    let round_trips = round_trips?;

    let handler_calls = handler_calls_with(
        config.run_spec(),
        config.body_preview,
        app,
        |_| Request::new(Body::empty()),
        |_, resp| resp.status() == StatusCode::OK,
    )
    .await?;

    if args.json {
        let report = Report {
            round_trips,
            handler_calls,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        report("round trips", &round_trips);
        report("handler calls", &handler_calls);
    }

    Ok(())
}

fn parse_args() -> anyhow::Result<Args> {
    let mut parsed = Args {
        config: None,
        iterations: None,
        concurrency: None,
        json: false,
    };

    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                let value = args.next().context("--config requires a value")?;
                parsed.config = Some(PathBuf::from(value));
            }
            "--iterations" => {
                let value = args.next().context("--iterations requires a value")?;
                parsed.iterations = Some(value.parse()?);
            }
            "--concurrency" => {
                let value = args.next().context("--concurrency requires a value")?;
                parsed.concurrency = Some(value.parse()?);
            }
            "--json" => parsed.json = true,
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            other => return Err(anyhow::anyhow!("unknown arg: {other}")),
        }
    }

    if parsed.concurrency == Some(0) {
        return Err(anyhow::anyhow!("concurrency must be > 0"));
    }

    Ok(parsed)
}

fn print_help() {
    let defaults = BenchConfig::default();
    println!("hello_bench options:");
    println!("  --config <path>        TOML settings file");
    println!("  --iterations <n>       (default {})", defaults.iterations);
    println!("  --concurrency <n>      (default {})", defaults.concurrency);
    println!("  --json                 print the report as JSON");
}

fn report(name: &str, result: &RunResult) {
    println!("{name}:");
    println!("  ops: {}", result.iterations);
    println!("  duration: {:.3}s", result.elapsed.as_secs_f64());
    println!("  ops/sec: {:.2}", result.ops_per_sec);
    for (unit, value) in &result.metrics {
        println!("  {unit}: {value:.2}");
    }
}
