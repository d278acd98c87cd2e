use std::{
    io,
    sync::Arc,
    task::{Context, Poll},
};

use futures::future::BoxFuture;
use hyper::Uri;
use hyper_util::{
    client::legacy::connect::{Connected, Connection},
    rt::TokioIo,
};
use tower::Service;

use super::{CountingConn, CountingDialer, Dial};

/// Connector for the hyper-util client that dials through a shared
/// [`CountingDialer`].
pub struct CountingConnector<D> {
    dialer: Arc<CountingDialer<D>>,
}

impl<D> CountingConnector<D> {
    pub fn new(dialer: Arc<CountingDialer<D>>) -> Self {
        Self { dialer }
    }
}

impl<D> Clone for CountingConnector<D> {
    fn clone(&self) -> Self {
        Self {
            dialer: Arc::clone(&self.dialer),
        }
    }
}

impl<C> Connection for CountingConn<C> {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

impl<D: Dial> Service<Uri> for CountingConnector<D> {
    type Response = TokioIo<CountingConn<D::Conn>>;
    type Error = io::Error;
    type Future = BoxFuture<'static, io::Result<Self::Response>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let dialer = Arc::clone(&self.dialer);
        Box::pin(async move {
            let addr = dial_address(&uri)?;
            let conn = dialer.dial(&addr).await?;
            Ok(TokioIo::new(conn))
        })
    }
}

fn dial_address(uri: &Uri) -> io::Result<String> {
    match uri.scheme_str() {
        None | Some("http") => {}
        Some(other) => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsupported scheme '{other}'"),
            ))
        }
    }
    let host = uri.host().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, format!("missing host in '{uri}'"))
    })?;
    let port = uri.port_u16().unwrap_or(80);
    Ok(format!("{host}:{port}"))
}
