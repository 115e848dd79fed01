//! Per-connection read, write and idle timeouts.
//!
//! [`TimedIo`] wraps a client socket and fails any read or write that makes
//! no progress within its limit. Reads wait up to the idle timeout between
//! requests and up to the read timeout while a request is being handled.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{sleep, Instant, Sleep};

/// Connection timeouts.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub read: Duration,
    pub write: Duration,
    pub idle: Duration,
}

/// A stalled-IO deadline, armed while an operation is pending.
///
/// Re-armed when the limit changes, so a read that started while idle gets
/// the read timeout once a request begins.
struct Deadline {
    sleep: Pin<Box<Sleep>>,
    armed: Option<Duration>,
}

impl Deadline {
    fn new() -> Self {
        Self {
            sleep: Box::pin(sleep(Duration::ZERO)),
            armed: None,
        }
    }

    fn poll<T>(
        &mut self,
        cx: &mut Context<'_>,
        limit: Duration,
        polled: Poll<io::Result<T>>,
    ) -> Poll<io::Result<T>> {
        if polled.is_ready() {
            self.armed = None;
            return polled;
        }
        if self.armed != Some(limit) {
            self.sleep.as_mut().reset(Instant::now() + limit);
            self.armed = Some(limit);
        }
        match self.sleep.as_mut().poll(cx) {
            Poll::Ready(()) => {
                self.armed = None;
                Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "connection timed out",
                )))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// A socket whose reads and writes fail once they stall for too long.
pub struct TimedIo<S> {
    inner: S,
    timeouts: Timeouts,
    busy: Arc<AtomicBool>,
    read: Deadline,
    write: Deadline,
}

impl<S> TimedIo<S> {
    pub fn new(inner: S, timeouts: Timeouts) -> Self {
        Self {
            inner,
            timeouts,
            busy: Arc::new(AtomicBool::new(false)),
            read: Deadline::new(),
            write: Deadline::new(),
        }
    }

    /// Flag set while a request is being handled on this connection.
    pub fn busy(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.busy)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TimedIo<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let limit = if this.busy.load(Ordering::Acquire) {
            this.timeouts.read
        } else {
            this.timeouts.idle
        };
        let polled = Pin::new(&mut this.inner).poll_read(cx, buf);
        this.read.poll(cx, limit, polled)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TimedIo<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_write(cx, buf);
        this.write.poll(cx, this.timeouts.write, polled)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_write_vectored(cx, bufs);
        this.write.poll(cx, this.timeouts.write, polled)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_flush(cx);
        this.write.poll(cx, this.timeouts.write, polled)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_shutdown(cx);
        this.write.poll(cx, this.timeouts.write, polled)
    }
}
