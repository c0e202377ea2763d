//! Write-side corking for freshly dialed upstream connections: buffer the
//! first burst for a short window so it leaves as one segment, then pass
//! writes straight through.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{sleep, Sleep};

const CORK_BUF_LIMIT: usize = 16 * 1024;

pub struct CorkedStream<S> {
    inner: S,
    corked: bool,
    delay: Pin<Box<Sleep>>,
    buf: Vec<u8>,
    flushed: usize,
}

impl<S> CorkedStream<S> {
    pub fn new(inner: S, delay: Duration) -> Self {
        Self {
            inner,
            corked: true,
            delay: Box::pin(sleep(delay)),
            buf: Vec::new(),
            flushed: 0,
        }
    }
}

impl<S: AsyncWrite + Unpin> CorkedStream<S> {
    /// Drive buffered bytes into `inner`; Ready once the buffer is empty.
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.flushed < self.buf.len() {
            match Pin::new(&mut self.inner).poll_write(cx, &self.buf[self.flushed..]) {
                Poll::Ready(Ok(0)) => return Poll::Ready(Err(io::ErrorKind::WriteZero.into())),
                Poll::Ready(Ok(n)) => self.flushed += n,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
        self.buf.clear();
        self.flushed = 0;
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for CorkedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if this.corked {
            let timer_fired = this.delay.as_mut().poll(cx).is_ready();
            if timer_fired || this.buf.len() + data.len() > CORK_BUF_LIMIT {
                this.corked = false;
            } else {
                this.buf.extend_from_slice(data);
                return Poll::Ready(Ok(data.len()));
            }
        }

        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_write(cx, data)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.corked {
            // The corked-phase flush waits for the timer, not the caller.
            ready!(this.delay.as_mut().poll(cx));
            this.corked = false;
        }
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.corked = false;
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for CorkedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}
