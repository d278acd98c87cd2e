use std::{convert::Infallible, sync::Arc};

use axum::body::Body;
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::{Request, Response};
use tower::{Service, ServiceExt};

use crate::{
    error::BenchError,
    runner::{self, RunResult, RunSpec},
};

/// Bytes of response body quoted when a handler response is rejected.
pub const BODY_PREVIEW: usize = 256;

/// Calls `handler` in-process `spec.iterations` times, at most
/// `spec.concurrency` at a time, without touching the network.
///
/// `make_request` builds the request for each iteration; a response rejected by
/// `is_valid` fails the run with [`BenchError::UnexpectedResult`], quoting at
/// most [`BODY_PREVIEW`] bytes of its body.
pub async fn handler_calls<H, M, V>(
    spec: RunSpec,
    handler: H,
    make_request: M,
    is_valid: V,
) -> Result<RunResult, BenchError>
where
    H: Service<Request<Body>, Response = Response<Body>, Error = Infallible>
        + Clone
        + Send
        + Sync
        + 'static,
    H::Future: Send + 'static,
    M: Fn(usize) -> Request<Body> + Send + Sync + 'static,
    V: Fn(usize, &Response<Bytes>) -> bool + Send + Sync + 'static,
{
    handler_calls_with(spec, BODY_PREVIEW, handler, make_request, is_valid).await
}

/// Same as [`handler_calls`], quoting at most `body_preview` bytes of a
/// rejected body (see [`BenchConfig::body_preview`](crate::BenchConfig)).
pub async fn handler_calls_with<H, M, V>(
    spec: RunSpec,
    body_preview: usize,
    handler: H,
    make_request: M,
    is_valid: V,
) -> Result<RunResult, BenchError>
where
    H: Service<Request<Body>, Response = Response<Body>, Error = Infallible>
        + Clone
        + Send
        + Sync
        + 'static,
    H::Future: Send + 'static,
    M: Fn(usize) -> Request<Body> + Send + Sync + 'static,
    V: Fn(usize, &Response<Bytes>) -> bool + Send + Sync + 'static,
{
    let make_request = Arc::new(make_request);
    let is_valid = Arc::new(is_valid);

    runner::run(spec, move |i| {
        let handler = handler.clone();
        let make_request = Arc::clone(&make_request);
        let is_valid = Arc::clone(&is_valid);
        async move {
            let response = handler
                .oneshot(make_request(i))
                .await
                .unwrap_or_else(|never| match never {});
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
                    body_preview,
                ));
            }
            Ok(())
        }
    })
    .await
}
