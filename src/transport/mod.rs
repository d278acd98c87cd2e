mod connector;
mod counting;

use std::io;

use async_trait::async_trait;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};

use crate::logging::BenchLogger;

pub use connector::CountingConnector;
pub use counting::{ByteCounters, ByteTally, CountingConn, CountingDialer};

/// Raw connection factory wrapped by [`CountingDialer`].
#[async_trait]
pub trait Dial: Send + Sync + 'static {
    type Conn: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Opens a connection to `addr` (`host:port`).
    async fn dial(&self, addr: &str) -> io::Result<Self::Conn>;
}

#[derive(Debug, Clone, Copy)]
pub struct TcpDialer {
    nodelay: bool,
}

impl TcpDialer {
    pub const fn new() -> Self {
        Self { nodelay: true }
    }

    pub const fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Dial for TcpDialer {
    type Conn = TcpStream;

    async fn dial(&self, addr: &str) -> io::Result<TcpStream> {
        let stream = TcpStream::connect(addr).await?;
        if self.nodelay {
            if let Err(err) = stream.set_nodelay(true) {
                BenchLogger::tcp_nodelay_failed(&err);
            }
        }
        Ok(stream)
    }
}
