//! Per-connection idle deadline.
//!
//! A connection is idle when no exchange is in flight on it. Every byte read
//! or written pushes the deadline back; once it passes while idle, the next
//! read fails with `TimedOut` and hyper drops the connection. The same
//! wrapper serves HTTP/1.1 keep-alive waits and HTTP/2 connections without
//! open streams.
//!
//! Each request carries its connection's [`Activity`] as an extension, so a
//! connection upgraded to HTTP/2 keeps counting against the same deadline.

use std::future::{Future, Ready};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use axum::http::Request;
use axum_server::accept::Accept;
use futures_util::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::{Instant, Sleep};
use tower::Service;

/// Number of exchanges currently running on one connection.
#[derive(Debug, Clone, Default)]
pub struct Activity {
    in_flight: Arc<AtomicUsize>,
}

impl Activity {
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    fn enter(&self) -> InFlight {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        InFlight(Arc::clone(&self.in_flight))
    }
}

struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// IO stream closed after `timeout` without traffic while idle.
pub struct IdleStream<IO> {
    inner: IO,
    timeout: Option<Duration>,
    deadline: Option<Pin<Box<Sleep>>>,
    activity: Activity,
}

impl<IO> IdleStream<IO> {
    pub fn new(inner: IO, timeout: Option<Duration>, activity: Activity) -> Self {
        let deadline = timeout.map(|t| Box::pin(tokio::time::sleep(t)));
        Self {
            inner,
            timeout,
            deadline,
            activity,
        }
    }

    fn touch(&mut self) {
        if let (Some(deadline), Some(timeout)) = (self.deadline.as_mut(), self.timeout) {
            deadline.as_mut().reset(Instant::now() + timeout);
        }
    }

    fn poll_idle(&mut self, cx: &mut Context<'_>) -> Poll<io::Error> {
        loop {
            let Some(deadline) = self.deadline.as_mut() else {
                return Poll::Pending;
            };
            ready!(deadline.as_mut().poll(cx));
            if self.activity.in_flight() == 0 {
                return Poll::Ready(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "connection idle timeout",
                ));
            }
            // Busy: look again one period later.
            self.touch();
        }
    }
}

impl<IO: AsyncRead + Unpin> AsyncRead for IdleStream<IO> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                if buf.filled().len() > before {
                    this.touch();
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => this.poll_idle(cx).map(Err),
        }
    }
}

impl<IO: AsyncWrite + Unpin> AsyncWrite for IdleStream<IO> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let written = ready!(Pin::new(&mut this.inner).poll_write(cx, buf))?;
        if written > 0 {
            this.touch();
        }
        Poll::Ready(Ok(written))
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let written = ready!(Pin::new(&mut this.inner).poll_write_vectored(cx, bufs))?;
        if written > 0 {
            this.touch();
        }
        Poll::Ready(Ok(written))
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Service wrapper counting in-flight exchanges on its connection.
#[derive(Debug, Clone)]
pub struct TrackedService<S> {
    inner: S,
    activity: Activity,
}

impl<S> TrackedService<S> {
    pub fn new(inner: S, activity: Activity) -> Self {
        Self { inner, activity }
    }
}

impl<S, B> Service<Request<B>> for TrackedService<S>
where
    S: Service<Request<B>>,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<S::Response, S::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request<B>) -> Self::Future {
        request.extensions_mut().insert(self.activity.clone());
        let in_flight = self.activity.enter();
        let response = self.inner.call(request);
        Box::pin(async move {
            let _in_flight = in_flight;
            response.await
        })
    }
}

/// Innermost acceptor: applies the idle deadline to every accepted socket.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdleAcceptor {
    timeout: Option<Duration>,
}

impl IdleAcceptor {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }
}

impl<S> Accept<TcpStream, S> for IdleAcceptor {
    type Stream = IdleStream<TcpStream>;
    type Service = TrackedService<S>;
    type Future = Ready<io::Result<(Self::Stream, Self::Service)>>;

    fn accept(&self, stream: TcpStream, service: S) -> Self::Future {
        let activity = Activity::default();
        std::future::ready(Ok((
            IdleStream::new(stream, self.timeout, activity.clone()),
            TrackedService::new(service, activity),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn idle_stream_times_out_without_traffic() {
        let (client, server) = tokio::io::duplex(64);
        let mut stream = IdleStream::new(server, Some(Duration::from_millis(50)), Activity::default());
        let _client = client;

        let mut buf = [0u8; 8];
        let err = stream.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn traffic_and_exchanges_keep_it_open() {
        let (mut client, server) = tokio::io::duplex(64);
        let activity = Activity::default();
        let mut stream = IdleStream::new(server, Some(Duration::from_millis(50)), activity.clone());

        let busy = activity.enter();
        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 2];
            stream.read_exact(&mut buf).await.map(|_| buf)
        });
        tokio::time::sleep(Duration::from_millis(150)).await;
        client.write_all(b"ok").await.unwrap();

        assert_eq!(&reader.await.unwrap().unwrap(), b"ok");
        drop(busy);
        assert_eq!(activity.in_flight(), 0);
    }

    #[tokio::test]
    async fn no_timeout_never_expires() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut stream = IdleStream::new(server, None, Activity::default());
        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 1];
            stream.read_exact(&mut buf).await.map(|_| buf[0])
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        client.write_all(b"x").await.unwrap();
        assert_eq!(reader.await.unwrap().unwrap(), b'x');
    }

    #[tokio::test]
    async fn tracked_service_counts_in_flight_calls() {
        let activity = Activity::default();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let rx = Arc::new(tokio::sync::Mutex::new(Some(rx)));
        let inner = tower::service_fn(move |request: Request<()>| {
            let rx = rx.clone();
            async move {
                if let Some(rx) = rx.lock().await.take() {
                    let _ = rx.await;
                }
                let seen = request.extensions().get::<Activity>().map(Activity::in_flight);
                Ok::<_, std::convert::Infallible>(seen)
            }
        });
        let mut service = TrackedService::new(inner, activity.clone());

        let call = tokio::spawn(service.call(Request::new(())));
        tokio::task::yield_now().await;
        assert_eq!(activity.in_flight(), 1);
        tx.send(()).unwrap();
        assert_eq!(call.await.unwrap().unwrap(), Some(1));
        assert_eq!(activity.in_flight(), 0);
    }
}
