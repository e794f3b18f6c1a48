//! Connection wrapper used by ICAP sessions.
//!
//! [`IdleTimeout`] delegates to the accepted stream and fails a read with
//! [`io::ErrorKind::TimedOut`] once it has been waiting longer than the
//! listener's idle timeout. The clock runs per read: it starts when a read
//! finds no data and stops as soon as bytes arrive, so a slow but steady
//! client and a slow adaptation service are never cut off.

use pin_project_lite::pin_project;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{Instant, Sleep};

pin_project! {
    #[derive(Debug)]
    pub struct IdleTimeout<S> {
        #[pin]
        inner: S,
        idle: Duration,
        deadline: Pin<Box<Sleep>>,
        // A read is pending and `deadline` is armed for it.
        waiting: bool,
    }
}

impl<S> IdleTimeout<S> {
    pub fn new(inner: S, idle: Duration) -> Self {
        Self {
            inner,
            idle,
            deadline: Box::pin(tokio::time::sleep(idle)),
            waiting: false,
        }
    }

    pub fn idle(&self) -> Duration {
        self.idle
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead> AsyncRead for IdleTimeout<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        match this.inner.poll_read(cx, buf) {
            Poll::Ready(res) => {
                *this.waiting = false;
                Poll::Ready(res)
            }
            Poll::Pending => {
                if !*this.waiting {
                    this.deadline.as_mut().reset(Instant::now() + *this.idle);
                    *this.waiting = true;
                }
                match this.deadline.as_mut().poll(cx) {
                    Poll::Ready(()) => {
                        *this.waiting = false;
                        Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            format!("no data from client for {:?}", this.idle),
                        )))
                    }
                    Poll::Pending => Poll::Pending,
                }
            }
        }
    }
}

// Any write ends the previous read attempt: a read that was probed and
// abandoned must not leave its deadline running into the next one.
impl<S: AsyncWrite> AsyncWrite for IdleTimeout<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.project();
        *this.waiting = false;
        this.inner.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.project();
        *this.waiting = false;
        this.inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

    #[tokio::test]
    async fn read_fails_after_idle_period() {
        let (_client, server) = duplex(64);
        let mut conn = IdleTimeout::new(server, Duration::from_millis(50));
        let mut buf = [0u8; 8];
        let err = conn.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn steady_trickle_never_times_out() {
        let (mut client, server) = duplex(64);
        let mut conn = IdleTimeout::new(server, Duration::from_millis(150));
        let writer = tokio::spawn(async move {
            for _ in 0..6 {
                tokio::time::sleep(Duration::from_millis(60)).await;
                client.write_all(b"x").await.unwrap();
            }
        });

        let mut got = Vec::new();
        let mut buf = [0u8; 8];
        while got.len() < 6 {
            let n = conn.read(&mut buf).await.expect("trickle keeps the read alive");
            got.extend_from_slice(&buf[..n]);
        }
        writer.await.unwrap();
        assert_eq!(got, b"xxxxxx");
    }

    #[tokio::test]
    async fn time_without_pending_read_is_not_counted() {
        let (mut client, server) = duplex(64);
        let mut conn = IdleTimeout::new(server, Duration::from_millis(50));
        tokio::time::sleep(Duration::from_millis(120)).await;
        client.write_all(b"late").await.unwrap();

        let mut buf = [0u8; 8];
        let n = conn.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"late");
    }
}
