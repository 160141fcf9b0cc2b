//! The `StreamDialer` seam every transport composes around.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::trace;

use std::io;

use crate::utils::{join_host_port, split_host_port};

/// A bidirectional byte stream. Write half-close is `poll_shutdown`; the read
/// half closes when the connection is dropped or the peer finishes.
pub trait StreamConn: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + ?Sized> StreamConn for T {}

/// Produces a connection to a `host:port` remote. `host` may be a DNS name or
/// an IP literal (IPv6 in brackets).
///
/// Transports implement this by wrapping an inner dialer: dial through the
/// inner, intercept the write side, pass the read side through. Chains of
/// wrappers are built from config strings by [`crate::config::DialerRegistry`].
#[async_trait]
pub trait StreamDialer: Send + Sync {
    async fn dial_stream(&self, remote: &str) -> io::Result<Box<dyn StreamConn>>;
}

/// The leaf dialer: a plain TCP connection.
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpDialer;

#[async_trait]
impl StreamDialer for TcpDialer {
    async fn dial_stream(&self, remote: &str) -> io::Result<Box<dyn StreamConn>> {
        trace!(%remote, "dialing tcp");
        let stream = TcpStream::connect(remote).await?;
        Ok(Box::new(stream))
    }
}

/// Rewrites host and/or port of the remote address before the inner dial,
/// the `override:` transport.
pub struct OverrideDialer {
    inner: Box<dyn StreamDialer>,
    host: Option<String>,
    port: Option<u16>,
}

impl OverrideDialer {
    pub fn new(inner: Box<dyn StreamDialer>, host: Option<String>, port: Option<u16>) -> Self {
        OverrideDialer { inner, host, port }
    }
}

#[async_trait]
impl StreamDialer for OverrideDialer {
    async fn dial_stream(&self, remote: &str) -> io::Result<Box<dyn StreamConn>> {
        let (host, port) = split_host_port(remote).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid remote address {remote:?}"),
            )
        })?;
        let host = self.host.as_deref().unwrap_or(host);
        let port = self.port.unwrap_or(port);
        let target = join_host_port(host, port);
        trace!(%remote, %target, "override remote address");
        self.inner.dial_stream(&target).await
    }
}
