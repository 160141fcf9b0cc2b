//! Plain byte-stream splitting, the `split:` transport.
//!
//! No TLS awareness at all: the writer forces write boundaries after the
//! configured prefix lengths so the kernel gets a chance to put them in
//! separate TCP segments, then passes everything through.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::config::ConfigError;
use crate::dialer::{StreamConn, StreamDialer};

/// Writer that chops the head of the stream at the given byte offsets.
///
/// Each plan entry is a prefix length; the writer never passes a boundary
/// within one `poll_write`, so every entry ends up in its own write to the
/// base. Once the plan is exhausted the writer is a transparent pipe.
pub struct SplitWriter<W> {
    base: W,
    plan: VecDeque<usize>,
}

impl<W: AsyncWrite + Unpin> SplitWriter<W> {
    /// `plan` entries must be non-zero; zero entries are dropped.
    pub fn new(base: W, plan: impl IntoIterator<Item = usize>) -> Self {
        SplitWriter {
            base,
            plan: plan.into_iter().filter(|&n| n > 0).collect(),
        }
    }

    pub fn get_ref(&self) -> &W {
        &self.base
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.base
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for SplitWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let limit = match this.plan.front() {
            Some(&boundary) => boundary.min(buf.len()),
            None => buf.len(),
        };
        match Pin::new(&mut this.base).poll_write(cx, &buf[..limit]) {
            Poll::Ready(Ok(n)) => {
                if let Some(boundary) = this.plan.front_mut() {
                    *boundary -= n;
                    if *boundary == 0 {
                        this.plan.pop_front();
                    }
                }
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().base).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().base).poll_shutdown(cx)
    }
}

impl<W: AsyncRead + Unpin> AsyncRead for SplitWriter<W> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().base).poll_read(cx, buf)
    }
}

/// Parse a `split:` argument: a comma-separated list of `length` or
/// `count*length` items, e.g. `split:2` or `split:2,3*100`.
pub fn parse_split_plan(s: &str) -> Result<Vec<usize>, ConfigError> {
    let mut plan = Vec::new();
    for item in s.split(',') {
        let item = item.trim();
        let (count, length) = match item.split_once('*') {
            Some((count, length)) => {
                let count: usize = count
                    .parse()
                    .map_err(|_| bad_plan(item, "repeat count is not a number"))?;
                let length: usize = length
                    .parse()
                    .map_err(|_| bad_plan(item, "length is not a number"))?;
                (count, length)
            }
            None => {
                let length: usize =
                    item.parse().map_err(|_| bad_plan(item, "length is not a number"))?;
                (1, length)
            }
        };
        if count == 0 || length == 0 {
            return Err(bad_plan(item, "zero entries are not allowed"));
        }
        plan.extend(std::iter::repeat(length).take(count));
    }
    Ok(plan)
}

fn bad_plan(item: &str, what: &str) -> ConfigError {
    ConfigError::Parse(format!("split: bad plan item {item:?}: {what}"))
}

/// [`StreamDialer`] for `split:`.
pub struct SplitDialer {
    inner: Box<dyn StreamDialer>,
    plan: Vec<usize>,
}

impl SplitDialer {
    pub fn new(inner: Box<dyn StreamDialer>, plan: Vec<usize>) -> Self {
        SplitDialer { inner, plan }
    }
}

#[async_trait]
impl StreamDialer for SplitDialer {
    async fn dial_stream(&self, remote: &str) -> io::Result<Box<dyn StreamConn>> {
        let conn = self.inner.dial_stream(remote).await?;
        Ok(Box::new(SplitWriter::new(conn, self.plan.clone())))
    }
}
