//! Byte streams and where they come from.
//!
//! The multiplexer never opens sockets itself. It asks a [`StreamFactory`]
//! for an already-secured duplex stream to an endpoint, optionally wraps it
//! with a [`StreamDecorator`], and from then on owns it exclusively.

use crate::endpoint::EndpointAddr;
use crate::error::{MuxError, MuxResult};
use async_trait::async_trait;
use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tracing::{debug, trace};

/// Longest chunk rendered by `LoggingStream`.
const LOG_PREVIEW_BYTES: usize = 256;

/// What a physical connection is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConnectionPurpose {
    /// Request/response traffic.
    Interactive,
    /// Pub/sub traffic; allows subscriptions and unsolicited pushes.
    Subscription,
}

impl fmt::Display for ConnectionPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionPurpose::Interactive => f.write_str("interactive"),
            ConnectionPurpose::Subscription => f.write_str("subscription"),
        }
    }
}

/// Any duplex byte stream the connection can own.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Produces secured duplex streams to endpoints.
///
/// Authentication and TLS live behind this seam; a factory hands back a
/// stream that is ready for RESP traffic.
#[async_trait]
pub trait StreamFactory: Send + Sync {
    async fn connect(
        &self,
        endpoint: &EndpointAddr,
        purpose: ConnectionPurpose,
    ) -> MuxResult<BoxedStream>;
}

/// Plain TCP streams with `TCP_NODELAY`.
#[derive(Debug, Clone)]
pub struct TcpStreamFactory {
    connect_timeout: Duration,
}

impl TcpStreamFactory {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpStreamFactory {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl StreamFactory for TcpStreamFactory {
    async fn connect(
        &self,
        endpoint: &EndpointAddr,
        purpose: ConnectionPurpose,
    ) -> MuxResult<BoxedStream> {
        let connect_failed = |reason: String| MuxError::ConnectFailed {
            endpoint: endpoint.to_string(),
            reason,
        };

        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(endpoint.as_str()))
            .await
            .map_err(|_| connect_failed(format!("connect timed out after {:?}", self.connect_timeout)))?
            .map_err(|e| connect_failed(e.to_string()))?;

        stream
            .set_nodelay(true)
            .map_err(|e| connect_failed(e.to_string()))?;

        debug!(endpoint = %endpoint, purpose = %purpose, "TCP stream established");
        Ok(Box::new(stream))
    }
}

/// Wraps freshly created streams, e.g. to capture traffic.
pub trait StreamDecorator: Send + Sync {
    fn decorate(
        &self,
        endpoint: &EndpointAddr,
        purpose: ConnectionPurpose,
        stream: BoxedStream,
    ) -> BoxedStream;
}

/// Decorator that traces every chunk read from or written to the stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingDecorator;

impl StreamDecorator for LoggingDecorator {
    fn decorate(
        &self,
        endpoint: &EndpointAddr,
        purpose: ConnectionPurpose,
        stream: BoxedStream,
    ) -> BoxedStream {
        Box::new(LoggingStream::new(stream, format!("{}/{}", endpoint, purpose)))
    }
}

/// A stream that logs raw RESP traffic at `trace` level.
pub struct LoggingStream<S> {
    inner: S,
    label: String,
}

impl<S> LoggingStream<S> {
    pub fn new(inner: S, label: impl Into<String>) -> Self {
        Self {
            inner,
            label: label.into(),
        }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

fn preview(data: &[u8]) -> String {
    let shown = &data[..data.len().min(LOG_PREVIEW_BYTES)];
    let mut out = shown.escape_ascii().to_string();
    if data.len() > LOG_PREVIEW_BYTES {
        out.push_str("...");
    }
    out
}

impl<S: AsyncRead + Unpin> AsyncRead for LoggingStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let result = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            let chunk = &buf.filled()[before..];
            trace!(stream = %this.label, bytes = chunk.len(), data = %preview(chunk), "in");
        }
        result
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for LoggingStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        let result = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &result {
            trace!(stream = %this.label, bytes = *n, data = %preview(&buf[..*n]), "out");
        }
        result
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
