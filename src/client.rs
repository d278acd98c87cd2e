use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Request, Response};
use hyper_util::{
    client::legacy::Client,
    rt::{TokioExecutor, TokioTimer},
};

use crate::{
    config::BenchConfig,
    error::BenchError,
    runner::{self, RunResult, RunSpec},
    transport::{ByteTally, CountingConnector, CountingDialer, Dial, TcpDialer},
};

pub type BenchRequest = Request<Full<Bytes>>;
pub type BenchResponse = Response<Bytes>;

/// Client-side benchmark context: an HTTP client whose every connection is
/// dialed through one [`CountingDialer`].
///
/// Create one per benchmark scope so byte totals never leak between
/// unrelated benchmarks.
pub struct HttpBench<D: Dial = TcpDialer> {
    dialer: Arc<CountingDialer<D>>,
    client: Client<CountingConnector<D>, Full<Bytes>>,
    body_preview: usize,
}

impl HttpBench<TcpDialer> {
    pub fn new() -> Self {
        Self::from_config(&BenchConfig::default())
    }

    pub fn from_config(config: &BenchConfig) -> Self {
        Self::with_dialer(TcpDialer::new().with_nodelay(config.nodelay), config)
    }
}

impl Default for HttpBench<TcpDialer> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Dial> HttpBench<D> {
    pub fn with_dialer(dial: D, config: &BenchConfig) -> Self {
        let dialer = Arc::new(CountingDialer::new(dial));
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(config.idle_timeout())
            .pool_timer(TokioTimer::new())
            .build(CountingConnector::new(Arc::clone(&dialer)));
        Self {
            dialer,
            client,
            body_preview: config.body_preview,
        }
    }

    pub fn dialer(&self) -> &CountingDialer<D> {
        &self.dialer
    }

    pub fn tally(&self) -> ByteTally {
        self.dialer.tally()
    }

    /// Sends `spec.iterations` requests, at most `spec.concurrency` at a time.
    ///
    /// Each iteration starts from an empty `GET` request that `setup` fills in;
    /// its URI must be absolute. A request that cannot be sent fails the run
    /// with [`BenchError::Transport`]; a response rejected by `is_valid` fails
    /// it with [`BenchError::UnexpectedResult`]. The result carries
    /// `B:sent/op` and `B:rcvd/op` measured on the wire.
    pub async fn round_trips<S, V>(
        &self,
        spec: RunSpec,
        setup: S,
        is_valid: V,
    ) -> Result<RunResult, BenchError>
    where
        S: Fn(usize, &mut BenchRequest) + Send + Sync + 'static,
        V: Fn(usize, &BenchResponse) -> bool + Send + Sync + 'static,
    {
        self.dialer.reset_counters();

        let client = self.client.clone();
        let setup = Arc::new(setup);
        let is_valid = Arc::new(is_valid);
        let preview = self.body_preview;

        let mut result = runner::run(spec, move |i| {
            let client = client.clone();
            let setup = Arc::clone(&setup);
            let is_valid = Arc::clone(&is_valid);
            async move {
                let mut request = Request::new(Full::new(Bytes::new()));
                setup(i, &mut request);

                let response = client
                    .request(request)
                    .await
                    .map_err(|err| BenchError::transport(i, err))?;
                let (parts, body) = response.into_parts();
                let body = body
                    .collect()
                    .await
                    .map_err(|err| BenchError::transport(i, err))?
                    .to_bytes();
                let response = Response::from_parts(parts, body);

                if !is_valid(i, &response) {
                    return Err(BenchError::unexpected(
                        i,
                        response.status().as_u16(),
                        response.body(),
                        preview,
                    ));
                }
                Ok(())
            }
        })
        .await?;

        let tally = self.dialer.tally();
        result.report_metric("B:sent/op", result.per_op(tally.sent));
        result.report_metric("B:rcvd/op", result.per_op(tally.received));
        Ok(result)
    }

    /// Drops the client pool and force-closes whatever connections remain.
    pub fn shutdown(self) -> usize {
        let Self { dialer, client, .. } = self;
        drop(client);
        dialer.close_all()
    }
}
