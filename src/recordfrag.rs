//! Record-layer prefix splitting, the `tls-record-frag:` transport.
//!
//! A simpler, type-agnostic cousin of [`crate::streaming`]: the very first
//! record on the stream is split so its first record carries exactly the
//! configured prefix length, whatever the record's content type. Records
//! whose payload does not fit a single TLS record (longer than 2^14) are
//! passed through whole; there is nothing useful to split.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::dialer::{StreamConn, StreamDialer};
use crate::record::MAX_HANDSHAKE_PAYLOAD_LENGTH;
use crate::streaming::{SplitDecision, StreamFragWriter};
use crate::utils::u16_from_be_slice;

/// Writer that splits the first record at a fixed payload prefix, with no
/// validation of the record's type or version. Transparent afterwards.
pub struct RecordFragWriter<W> {
    inner: StreamFragWriter<W>,
}

impl<W: AsyncWrite + Unpin> RecordFragWriter<W> {
    pub fn new(base: W, prefix: usize) -> Self {
        let decide = Box::new(move |hdr: &[u8; 5]| {
            let payload_len = u16_from_be_slice(&hdr[3..5]) as usize;
            if payload_len <= MAX_HANDSHAKE_PAYLOAD_LENGTH && prefix > 0 && prefix < payload_len
            {
                SplitDecision::Split(prefix)
            } else {
                SplitDecision::Pass
            }
        });
        RecordFragWriter {
            inner: StreamFragWriter::with_decision(base, decide),
        }
    }

    pub fn get_ref(&self) -> &W {
        self.inner.get_ref()
    }

    pub fn get_mut(&mut self) -> &mut W {
        self.inner.get_mut()
    }

    pub async fn read_from<R>(&mut self, src: &mut R) -> io::Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        self.inner.read_from(src).await
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for RecordFragWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

impl<W: AsyncRead + AsyncWrite + Unpin> AsyncRead for RecordFragWriter<W> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

/// [`StreamDialer`] for `tls-record-frag:N`.
pub struct RecordFragDialer {
    inner: Box<dyn StreamDialer>,
    prefix: usize,
}

impl RecordFragDialer {
    pub fn new(inner: Box<dyn StreamDialer>, prefix: usize) -> Self {
        RecordFragDialer { inner, prefix }
    }
}

#[async_trait]
impl StreamDialer for RecordFragDialer {
    async fn dial_stream(&self, remote: &str) -> io::Result<Box<dyn StreamConn>> {
        let conn = self.inner.dial_stream(remote).await?;
        Ok(Box::new(RecordFragWriter::new(conn, self.prefix)))
    }
}
