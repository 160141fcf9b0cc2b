//! Buffered Client Hello fragmentation with an arbitrary split function.
//!
//! [`BufferedFragWriter`] assembles the whole first record before deciding
//! where to cut, so the split function can inspect the complete payload (the
//! SNI-aware chooser in [`crate::sni`] needs exactly that). The streaming
//! variant in [`crate::streaming`] avoids the buffering when a fixed split
//! length is enough.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::trace;

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use crate::dialer::{StreamConn, StreamDialer};
use crate::hello::{ClientHelloBuf, HelloStatus};
use crate::record::{set_payload_len, TLS_RECORD_HEADER_LENGTH};

/// Chooses the split offset for a complete Client Hello payload (the record
/// header is not included in the slice). A return value outside
/// `(0, payload_len)` means "do not fragment".
pub type SplitFn = Box<dyn Fn(&[u8]) -> isize + Send>;

enum State {
    /// Collecting and validating the first record.
    Scanning(ClientHelloBuf),
    /// Pushing the (possibly rewritten) record down to the base writer.
    Flushing { buf: Vec<u8>, pos: usize },
    /// Pass-through. Never left once entered.
    Transparent,
}

/// Writer that intercepts the first TLS record, splits it into two records at
/// an offset chosen by a callback, and then becomes transparent.
///
/// Both records reach the base writer in a single `poll_write` call. Anything
/// that is not a valid Client Hello record is forwarded unchanged; failure to
/// fragment is never surfaced as an error.
///
/// The read side, when the base stream has one, is passed through untouched,
/// so a wrapped connection still behaves as a [`StreamConn`].
pub struct BufferedFragWriter<W> {
    base: W,
    split: SplitFn,
    state: State,
    stashed: Option<io::Error>,
}

impl<W: AsyncWrite + Unpin> BufferedFragWriter<W> {
    pub fn new(base: W, split: SplitFn) -> Self {
        BufferedFragWriter {
            base,
            split,
            state: State::Scanning(ClientHelloBuf::new()),
            stashed: None,
        }
    }

    pub fn get_ref(&self) -> &W {
        &self.base
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.base
    }

    /// Discards any buffered record bytes.
    pub fn into_inner(self) -> W {
        self.base
    }

    /// Feed this writer directly from `src` until the source is exhausted.
    ///
    /// The returned count is the number of bytes pulled from `src`; the five
    /// header bytes a split adds are not counted, so callers can use the
    /// return value to track their position in the source.
    pub async fn read_from<R>(&mut self, src: &mut R) -> io::Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        if let Some(e) = self.stashed.take() {
            return Err(e);
        }
        let mut count = 0u64;
        loop {
            let status = match &mut self.state {
                State::Scanning(hello) => {
                    let before = hello.len() as u64;
                    let status = hello.fill_from(src).await?;
                    count += hello.len() as u64 - before;
                    status
                }
                _ => break,
            };
            match status {
                HelloStatus::NeedMore => return Ok(count), // source dry
                HelloStatus::Complete | HelloStatus::Invalid => {
                    self.finish_scan(status);
                    break;
                }
                HelloStatus::Full => break,
            }
        }
        std::future::poll_fn(|cx| self.drive_flush(cx)).await?;
        count += tokio::io::copy(src, &mut self.base).await?;
        Ok(count)
    }

    /// Leave the scanning state, rewriting the record if it completed and the
    /// split function picks an in-range offset.
    fn finish_scan(&mut self, status: HelloStatus) {
        let State::Scanning(hello) = std::mem::replace(&mut self.state, State::Transparent)
        else {
            unreachable!("finish_scan outside scanning state");
        };
        let record = match status {
            HelloStatus::Complete => {
                let record = hello.into_record();
                let payload_len = record.len() - TLS_RECORD_HEADER_LENGTH;
                let split_at = (self.split)(&record[TLS_RECORD_HEADER_LENGTH..]);
                if split_at > 0 && (split_at as usize) < payload_len {
                    trace!(payload_len, split_at, "fragmenting client hello");
                    split_record_in_place(record, split_at as usize)
                } else {
                    trace!(payload_len, split_at, "split offset out of range, record kept whole");
                    record
                }
            }
            _ => {
                trace!(
                    reason = ?hello.invalid_reason(),
                    buffered = hello.len(),
                    "first record is not a client hello, passing through"
                );
                hello.into_record()
            }
        };
        self.state = State::Flushing { buf: record, pos: 0 };
    }

    /// Push any pending flush buffer down to the base writer. Ready(Ok) means
    /// the writer is out of the flushing state.
    fn drive_flush(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if let State::Flushing { buf, pos } = &mut self.state {
            while *pos < buf.len() {
                match Pin::new(&mut self.base).poll_write(cx, &buf[*pos..]) {
                    Poll::Ready(Ok(0)) => {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::WriteZero,
                            "base writer accepted zero bytes",
                        )))
                    }
                    Poll::Ready(Ok(n)) => *pos += n,
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => return Poll::Pending,
                }
            }
            self.state = State::Transparent;
        }
        Poll::Ready(Ok(()))
    }
}

/// Rewrite `header || payload` into two consecutive records split at
/// `split_at`, in place. The tail of the payload moves right by one header
/// length into the capacity headroom [`ClientHelloBuf`] reserved, so no
/// second allocation happens.
fn split_record_in_place(mut record: Vec<u8>, split_at: usize) -> Vec<u8> {
    const H: usize = TLS_RECORD_HEADER_LENGTH;
    let payload_len = record.len() - H;
    debug_assert!(split_at > 0 && split_at < payload_len);
    debug_assert!(record.capacity() >= record.len() + H);
    record.resize(payload_len + 2 * H, 0);
    record.copy_within(H + split_at..H + payload_len, 2 * H + split_at);
    let (ct, v0, v1) = (record[0], record[1], record[2]);
    record[H + split_at] = ct;
    record[H + split_at + 1] = v0;
    record[H + split_at + 2] = v1;
    set_payload_len(&mut record[H + split_at..], (payload_len - split_at) as u16);
    set_payload_len(&mut record, split_at as u16);
    record
}

impl<W: AsyncWrite + Unpin> AsyncWrite for BufferedFragWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if let Some(e) = this.stashed.take() {
            return Poll::Ready(Err(e));
        }
        loop {
            match &mut this.state {
                State::Flushing { .. } => match this.drive_flush(cx) {
                    Poll::Ready(Ok(())) => continue,
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => return Poll::Pending,
                },
                State::Transparent => return Pin::new(&mut this.base).poll_write(cx, buf),
                State::Scanning(hello) => {
                    if buf.is_empty() {
                        return Poll::Ready(Ok(0));
                    }
                    let (n, status) = hello.append(buf);
                    match status {
                        HelloStatus::NeedMore => return Poll::Ready(Ok(n)),
                        HelloStatus::Complete | HelloStatus::Invalid => {
                            this.finish_scan(status);
                            // Drain eagerly so callers that never flush still
                            // get the record onto the wire; a failure here is
                            // reported by the next call.
                            if let Poll::Ready(Err(e)) = this.drive_flush(cx) {
                                this.stashed = Some(e);
                            }
                            return Poll::Ready(Ok(n));
                        }
                        HelloStatus::Full => {
                            unreachable!("scanning state never holds a complete record")
                        }
                    }
                }
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some(e) = this.stashed.take() {
            return Poll::Ready(Err(e));
        }
        // A record still being scanned is withheld on purpose: flushing half a
        // Client Hello would forfeit fragmentation without delivering anything
        // the peer can use.
        match this.drive_flush(cx) {
            Poll::Ready(Ok(())) => {}
            other => return other,
        }
        Pin::new(&mut this.base).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let State::Scanning(hello) = &mut this.state {
            // The record never completed; pass what we have unchanged.
            if !hello.is_empty() {
                let buf =
                    match std::mem::replace(&mut this.state, State::Transparent) {
                        State::Scanning(hello) => hello.into_record(),
                        _ => unreachable!(),
                    };
                this.state = State::Flushing { buf, pos: 0 };
            } else {
                this.state = State::Transparent;
            }
        }
        match this.drive_flush(cx) {
            Poll::Ready(Ok(())) => {}
            other => return other,
        }
        Pin::new(&mut this.base).poll_shutdown(cx)
    }
}

impl<W: AsyncRead + Unpin> AsyncRead for BufferedFragWriter<W> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().base).poll_read(cx, buf)
    }
}

/// [`StreamDialer`] that wraps connections from an inner dialer with a
/// [`BufferedFragWriter`].
pub struct BufferedFragDialer {
    inner: Box<dyn StreamDialer>,
    split: Arc<dyn Fn(&[u8]) -> isize + Send + Sync>,
}

impl BufferedFragDialer {
    pub fn new(
        inner: Box<dyn StreamDialer>,
        split: Arc<dyn Fn(&[u8]) -> isize + Send + Sync>,
    ) -> Self {
        BufferedFragDialer { inner, split }
    }

    /// Split inside the SNI hostname at the given signed offset; see
    /// [`crate::sni::split_offset`] for the offset semantics.
    pub fn with_sni_offset(inner: Box<dyn StreamDialer>, offset: isize) -> Self {
        Self::new(inner, Arc::new(crate::sni::sni_split_fn(offset)))
    }
}

#[async_trait]
impl StreamDialer for BufferedFragDialer {
    async fn dial_stream(&self, remote: &str) -> io::Result<Box<dyn StreamConn>> {
        let conn = self.inner.dial_stream(remote).await?;
        let split = self.split.clone();
        Ok(Box::new(BufferedFragWriter::new(
            conn,
            Box::new(move |payload| split(payload)),
        )))
    }
}
