//! Serve HTTP/1.1 on accepted connections.
//!
//! Once the server starts draining, idle keep-alive connections are closed right away and
//! connections with a request in flight are closed after sending the response.

use std::future::Future;
use std::io;
use std::pin::{pin, Pin};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Sleep;

use crate::handler::{BoxedClientStream, Connection, ConnectionHandler};

/// Time a client gets to send the request headers.
pub const DEFAULT_HEADER_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Time a write to the client may stay blocked before the connection is dropped.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// A [`ConnectionHandler`] answering HTTP requests with an async function.
#[derive(Clone)]
pub struct HttpHandler<F> {
    service: F,
    header_read_timeout: Duration,
    write_timeout: Duration,
}

impl<F, R> HttpHandler<F>
where
    F: Fn(Request<Incoming>) -> R + Clone + Send + Sync + 'static,
    R: Future<Output = Result<Response<Full<Bytes>>, anyhow::Error>> + Send + 'static,
{
    pub fn new(service: F) -> Self {
        Self {
            service,
            header_read_timeout: DEFAULT_HEADER_READ_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }

    pub fn header_read_timeout(mut self, timeout: Duration) -> Self {
        self.header_read_timeout = timeout;
        self
    }

    /// Drop clients which stop reading, e.g. while a response is sent.
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }
}

impl<F, R> ConnectionHandler for HttpHandler<F>
where
    F: Fn(Request<Incoming>) -> R + Clone + Send + Sync + 'static,
    R: Future<Output = Result<Response<Full<Bytes>>, anyhow::Error>> + Send + 'static,
{
    fn handle(&self, conn: Connection) -> BoxFuture<'static, Result<(), anyhow::Error>> {
        Box::pin(serve_http(
            conn,
            self.service.clone(),
            self.header_read_timeout,
            self.write_timeout,
        ))
    }
}

async fn serve_http<F, R>(
    conn: Connection,
    service: F,
    header_read_timeout: Duration,
    write_timeout: Duration,
) -> Result<(), anyhow::Error>
where
    F: Fn(Request<Incoming>) -> R + Send + Sync + 'static,
    R: Future<Output = Result<Response<Full<Bytes>>, anyhow::Error>> + Send + 'static,
{
    let Connection { stream, shutdown, .. } = conn;

    let mut builder = http1::Builder::new();
    builder
        .timer(TokioTimer::new())
        .header_read_timeout(header_read_timeout);

    let stream = WriteTimeout::new(stream, write_timeout);
    let mut connection = pin!(builder.serve_connection(TokioIo::new(stream), service_fn(service)));

    tokio::select! {
        res = connection.as_mut() => return Ok(res?),
        _ = shutdown.wait() => connection.as_mut().graceful_shutdown(),
    }

    Ok(connection.await?)
}

/// Fails writes which stay pending for longer than `timeout`.
struct WriteTimeout {
    inner: BoxedClientStream,
    timeout: Duration,
    stalled: Option<Pin<Box<Sleep>>>,
}

impl WriteTimeout {
    fn new(inner: BoxedClientStream, timeout: Duration) -> Self {
        Self {
            inner,
            timeout,
            stalled: None,
        }
    }

    fn check<T>(&mut self, cx: &mut Context<'_>, poll: Poll<io::Result<T>>) -> Poll<io::Result<T>> {
        if poll.is_ready() {
            self.stalled = None;
            return poll;
        }

        let timeout = self.timeout;
        let stalled = self
            .stalled
            .get_or_insert_with(|| Box::pin(tokio::time::sleep(timeout)));
        match stalled.as_mut().poll(cx) {
            Poll::Ready(()) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("client did not read for {timeout:?}"),
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncRead for WriteTimeout {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for WriteTimeout {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_write(cx, buf);
        this.check(cx, poll)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_flush(cx);
        this.check(cx, poll)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_shutdown(cx);
        this.check(cx, poll)
    }
}
