use std::{
    collections::BTreeMap,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::FutureExt;
use serde::{Serialize, Serializer};
use tokio::{
    sync::Semaphore,
    task::{JoinError, JoinSet},
    time::Instant,
};

use crate::{alloc, error::BenchError, logging::BenchLogger};

/// How many units of work to run and how many may be in flight at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSpec {
    pub iterations: usize,
    pub concurrency: usize,
}

impl RunSpec {
    pub const fn new(iterations: usize, concurrency: usize) -> Self {
        Self {
            iterations,
            concurrency,
        }
    }

    fn validate(&self) -> Result<(), BenchError> {
        if self.concurrency == 0 {
            return Err(BenchError::InvalidConcurrency);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub iterations: usize,
    pub concurrency: usize,
    #[serde(rename = "elapsed_secs", serialize_with = "as_secs")]
    pub elapsed: Duration,
    pub ops_per_sec: f64,
    /// Extra per-run figures keyed by unit, e.g. `B:sent/op`.
    pub metrics: BTreeMap<String, f64>,
}

fn as_secs<S>(elapsed: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(elapsed.as_secs_f64())
}

impl RunResult {
    fn new(spec: RunSpec, elapsed: Duration) -> Self {
        let secs = elapsed.as_secs_f64();
        let ops_per_sec = if spec.iterations == 0 || secs == 0.0 {
            0.0
        } else {
            spec.iterations as f64 / secs
        };
        Self {
            iterations: spec.iterations,
            concurrency: spec.concurrency,
            elapsed,
            ops_per_sec,
            metrics: BTreeMap::new(),
        }
    }

    pub fn report_metric(&mut self, unit: impl Into<String>, value: f64) {
        self.metrics.insert(unit.into(), value);
    }

    pub fn metric(&self, unit: &str) -> Option<f64> {
        self.metrics.get(unit).copied()
    }

    /// Averages `total` over the iterations of the run.
    pub fn per_op(&self, total: u64) -> f64 {
        if self.iterations == 0 {
            return 0.0;
        }
        total as f64 / self.iterations as f64
    }
}

/// Runs `work(0..iterations)` with at most `concurrency` invocations in flight.
///
/// The timer starts right before index 0 is dispatched and stops once every
/// dispatched unit has completed. The first unit that fails halts dispatch;
/// units already in flight are awaited before its error is returned.
pub async fn run<F, Fut>(spec: RunSpec, work: F) -> Result<RunResult, BenchError>
where
    F: Fn(usize) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BenchError>> + Send + 'static,
{
    spec.validate()?;
    BenchLogger::run_started(spec.iterations, spec.concurrency);

    let work = Arc::new(work);
    let permits = Arc::new(Semaphore::new(
        spec.concurrency.min(Semaphore::MAX_PERMITS),
    ));
    let halted = Arc::new(AtomicBool::new(false));
    let mut tasks = JoinSet::new();
    let mut failure = None;
    let mut dispatched = 0;

    let allocs_before = alloc::snapshot();
    let start = Instant::now();

    for i in 0..spec.iterations {
        let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
            break;
        };
        if halted.load(Ordering::Acquire) {
            break;
        }

        let work = Arc::clone(&work);
        let halted = Arc::clone(&halted);
        tasks.spawn(async move {
            let outcome = match AssertUnwindSafe(async { work(i).await })
                .catch_unwind()
                .await
            {
                Ok(outcome) => outcome,
                Err(_) => Err(BenchError::Panicked { iteration: i }),
            };
            if outcome.is_err() {
                halted.store(true, Ordering::Release);
            }
            drop(permit);
            outcome
        });
        dispatched += 1;

        while let Some(joined) = tasks.try_join_next() {
            settle(joined, &mut failure);
        }
    }

    while let Some(joined) = tasks.join_next().await {
        settle(joined, &mut failure);
    }

    let elapsed = start.elapsed();
    let allocs = alloc::snapshot().since(allocs_before);

    if let Some(err) = failure {
        BenchLogger::run_aborted(dispatched, &err);
        return Err(err);
    }

    let mut result = RunResult::new(spec, elapsed);
    if alloc::is_installed() {
        result.report_metric("allocs/op", result.per_op(allocs.allocations));
        result.report_metric("B/op", result.per_op(allocs.bytes));
    }
    BenchLogger::run_finished(spec.iterations, elapsed, result.ops_per_sec);
    Ok(result)
}

fn settle(joined: Result<Result<(), BenchError>, JoinError>, failure: &mut Option<BenchError>) {
    let err = match joined {
        Ok(Ok(())) => return,
        Ok(Err(err)) => err,
        Err(join) => BenchError::Io(join.into()),
    };
    if failure.is_none() {
        *failure = Some(err);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn never_exceeds_concurrency_ceiling() {
        for concurrency in [1, 3, 7, 32] {
            let in_flight = Arc::new(AtomicUsize::new(0));
            let peak = Arc::new(AtomicUsize::new(0));

            let (in_flight_w, peak_w) = (Arc::clone(&in_flight), Arc::clone(&peak));
            let result = run(RunSpec::new(200, concurrency), move |_| {
                let in_flight = Arc::clone(&in_flight_w);
                let peak = Arc::clone(&peak_w);
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await
            .unwrap();

            assert_eq!(result.iterations, 200);
            assert_eq!(in_flight.load(Ordering::SeqCst), 0);
            let peak = peak.load(Ordering::SeqCst);
            assert!(peak >= 1 && peak <= concurrency, "peak {peak} > {concurrency}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn throughput_follows_elapsed_window() {
        let result = run(RunSpec::new(100, 10), |_| async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(())
        })
        .await
        .unwrap();

        assert!(result.elapsed >= Duration::from_millis(100));
        assert!(result.elapsed < Duration::from_millis(150));
        let expected = 100.0 / result.elapsed.as_secs_f64();
        assert!((result.ops_per_sec - expected).abs() < 1e-6);
        assert!((result.ops_per_sec - 1000.0).abs() < 50.0);
    }

    #[tokio::test]
    async fn every_index_runs_exactly_once() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_w = Arc::clone(&seen);
        run(RunSpec::new(64, 5), move |i| {
            let seen = Arc::clone(&seen_w);
            async move {
                seen.lock().unwrap().push(i);
                Ok(())
            }
        })
        .await
        .unwrap();

        let mut seen = seen.lock().unwrap().clone();
        seen.sort_unstable();
        assert_eq!(seen, (0..64).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn failure_stops_dispatch() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_w = Arc::clone(&calls);
        let err = run(RunSpec::new(1000, 1), move |i| {
            calls_w.fetch_add(1, Ordering::SeqCst);
            async move {
                if i == 5 {
                    return Err(BenchError::unexpected(i, 500, b"nope", 16));
                }
                Ok(())
            }
        })
        .await
        .unwrap_err();

        assert_eq!(err.iteration(), Some(5));
        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_waits_for_in_flight_units() {
        let finished = Arc::new(AtomicUsize::new(0));
        let finished_w = Arc::clone(&finished);
        let err = run(RunSpec::new(100, 4), move |i| {
            let finished = Arc::clone(&finished_w);
            async move {
                if i == 0 {
                    return Err(BenchError::unexpected(0, 418, b"", 16));
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
                finished.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await
        .unwrap_err();

        assert_eq!(err.iteration(), Some(0));
        assert_eq!(finished.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn panicking_unit_is_reported() {
        let err = run(RunSpec::new(10, 2), |i| async move {
            if i == 3 {
                panic!("unit 3 blew up");
            }
            Ok(())
        })
        .await
        .unwrap_err();

        assert!(matches!(err, BenchError::Panicked { iteration: 3 }));
    }

    #[tokio::test]
    async fn zero_concurrency_is_rejected() {
        let err = run(RunSpec::new(10, 0), |_| async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, BenchError::InvalidConcurrency));
    }

    #[tokio::test]
    async fn zero_iterations_report_no_throughput() {
        let result = run(RunSpec::new(0, 4), |_| async { Ok(()) }).await.unwrap();
        assert_eq!(result.iterations, 0);
        assert_eq!(result.ops_per_sec, 0.0);
        assert_eq!(result.per_op(100), 0.0);
    }

    #[tokio::test]
    async fn no_alloc_metrics_without_counting_global_allocator() {
        let result = run(RunSpec::new(10, 2), |i| async move {
            std::hint::black_box(vec![i; 16]);
            Ok(())
        })
        .await
        .unwrap();
        assert!(result.metric("allocs/op").is_none());
        assert!(result.metric("B/op").is_none());
    }

    #[test]
    fn per_op_uses_float_division() {
        let result = RunResult::new(RunSpec::new(3, 1), Duration::from_secs(1));
        assert!((result.per_op(10) - 10.0 / 3.0).abs() < f64::EPSILON);
        assert_eq!(result.ops_per_sec, 3.0);
    }
}
