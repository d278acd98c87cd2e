use std::{
    io::{self, IoSlice},
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    task::{Context, Poll},
};

use futures::task::AtomicWaker;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::Dial;
use crate::logging::BenchLogger;

/// Bytes moved through every connection of one [`CountingDialer`].
#[derive(Debug, Default)]
pub struct ByteCounters {
    sent: AtomicU64,
    received: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ByteTally {
    pub sent: u64,
    pub received: u64,
}

impl ByteCounters {
    pub fn record_sent(&self, bytes: u64) {
        self.sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: u64) {
        self.received.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.sent.store(0, Ordering::Relaxed);
        self.received.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ByteTally {
        ByteTally {
            sent: self.sent(),
            received: self.received(),
        }
    }
}

/// Registry entry for one dialed connection.
#[derive(Debug)]
struct ConnState {
    id: u64,
    peer: String,
    close_requested: AtomicBool,
    released: AtomicBool,
    read_waker: AtomicWaker,
    write_waker: AtomicWaker,
}

impl ConnState {
    fn new(id: u64, peer: &str) -> Self {
        Self {
            id,
            peer: peer.to_string(),
            close_requested: AtomicBool::new(false),
            released: AtomicBool::new(false),
            read_waker: AtomicWaker::new(),
            write_waker: AtomicWaker::new(),
        }
    }

    fn close(&self) -> io::Result<()> {
        if self.released.load(Ordering::Acquire) {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection already released by its owner",
            ));
        }
        if self.close_requested.swap(true, Ordering::AcqRel) {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection already closed",
            ));
        }
        self.read_waker.wake();
        self.write_waker.wake();
        Ok(())
    }

    fn close_requested(&self) -> bool {
        self.close_requested.load(Ordering::Acquire)
    }

    fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

/// Wraps a [`Dial`] implementation so that every connection it opens adds its
/// traffic to one shared pair of counters, and can be force-closed later.
pub struct CountingDialer<D> {
    dial: D,
    counters: Arc<ByteCounters>,
    conns: Mutex<Vec<Arc<ConnState>>>,
    next_id: AtomicU64,
}

impl<D: Dial> CountingDialer<D> {
    pub fn new(dial: D) -> Self {
        Self {
            dial,
            counters: Arc::new(ByteCounters::default()),
            conns: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Dials through the wrapped factory. Dial errors are returned untouched
    /// and nothing is registered for them.
    pub async fn dial(&self, addr: &str) -> io::Result<CountingConn<D::Conn>> {
        let conn = self.dial.dial(addr).await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(ConnState::new(id, addr));

        {
            let mut conns = self.registry();
            conns.retain(|entry| !entry.is_released());
            conns.push(Arc::clone(&state));
        }
        BenchLogger::connection_dialed(id, addr);

        Ok(CountingConn {
            inner: Some(conn),
            counters: Arc::clone(&self.counters),
            state,
        })
    }
}

impl<D> CountingDialer<D> {
    fn registry(&self) -> MutexGuard<'_, Vec<Arc<ConnState>>> {
        self.conns.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn counters(&self) -> &Arc<ByteCounters> {
        &self.counters
    }

    pub fn tally(&self) -> ByteTally {
        self.counters.snapshot()
    }

    pub fn reset_counters(&self) {
        self.counters.reset();
    }

    /// Connections currently held in the registry, including ones already
    /// dropped by their owner since the last dial.
    pub fn registered(&self) -> usize {
        self.registry().len()
    }

    /// Closes every registered connection and empties the registry. Close
    /// failures are logged; returns how many connections were closed.
    ///
    /// Closing flags each connection and wakes any pending read or write. The
    /// wrapped stream, and with it the socket, is dropped on the owner's next
    /// poll or when the owner drops the [`CountingConn`]. An idle connection
    /// nobody polls stays open until then, although `is_closed()` already
    /// reports true.
    pub fn close_all(&self) -> usize {
        let mut conns = self.registry();
        let mut closed = 0;
        for conn in conns.drain(..) {
            match conn.close() {
                Ok(()) => closed += 1,
                Err(err) => BenchLogger::close_failed(&format!("#{} {}", conn.id, conn.peer), &err),
            }
        }
        BenchLogger::connections_closed(closed);
        closed
    }
}

/// A connection whose traffic is tallied into its dialer's [`ByteCounters`].
///
/// Once its dialer closes it, reads report end of stream, writes fail with
/// `BrokenPipe`, and the wrapped connection is dropped.
pub struct CountingConn<C> {
    inner: Option<C>,
    counters: Arc<ByteCounters>,
    state: Arc<ConnState>,
}

impl<C> CountingConn<C> {
    pub fn is_closed(&self) -> bool {
        self.inner.is_none() || self.state.close_requested()
    }

    pub fn peer(&self) -> &str {
        &self.state.peer
    }

    pub fn get_ref(&self) -> Option<&C> {
        self.inner.as_ref()
    }

    fn release_if_closed(&mut self) {
        if self.inner.is_some() && self.state.close_requested() {
            self.inner = None;
        }
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "connection closed")
}

impl<C> Drop for CountingConn<C> {
    fn drop(&mut self) {
        self.state.released.store(true, Ordering::Release);
    }
}

impl<C> AsyncRead for CountingConn<C>
where
    C: AsyncRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.state.read_waker.register(cx.waker());
        this.release_if_closed();
        let Some(inner) = this.inner.as_mut() else {
            return Poll::Ready(Ok(()));
        };

        let before = buf.filled().len();
        let polled = Pin::new(inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = polled {
            this.counters
                .record_received((buf.filled().len() - before) as u64);
        }
        polled
    }
}

impl<C> AsyncWrite for CountingConn<C>
where
    C: AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.state.write_waker.register(cx.waker());
        this.release_if_closed();
        let Some(inner) = this.inner.as_mut() else {
            return Poll::Ready(Err(closed_error()));
        };

        match Pin::new(inner).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                this.counters.record_sent(n as u64);
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.state.write_waker.register(cx.waker());
        this.release_if_closed();
        let Some(inner) = this.inner.as_mut() else {
            return Poll::Ready(Err(closed_error()));
        };

        match Pin::new(inner).poll_write_vectored(cx, bufs) {
            Poll::Ready(Ok(n)) => {
                this.counters.record_sent(n as u64);
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn is_write_vectored(&self) -> bool {
        self.inner
            .as_ref()
            .is_some_and(AsyncWrite::is_write_vectored)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.release_if_closed();
        match this.inner.as_mut() {
            Some(inner) => Pin::new(inner).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.release_if_closed();
        match this.inner.as_mut() {
            Some(inner) => Pin::new(inner).poll_shutdown(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}
