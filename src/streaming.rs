//! Streaming Client Hello fragmentation with a fixed split length.
//!
//! Unlike [`crate::buffered`], this writer never holds the record payload;
//! only the five header bytes are buffered while they assemble. The split
//! decision is made the moment the header is complete, from the payload
//! length alone, and from then on caller bytes stream straight through with
//! rewritten framing.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing::trace;

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::dialer::{StreamConn, StreamDialer};
use crate::record::{set_payload_len, RecordHeader, TLS_RECORD_HEADER_LENGTH};

/// What to do with the first record, decided from its raw header.
pub(crate) enum SplitDecision {
    /// Split the payload at this offset, `0 < offset < payload_len`.
    Split(usize),
    /// Forward the record unchanged and go transparent.
    Pass,
}

pub(crate) type DecideFn = Box<dyn Fn(&[u8; TLS_RECORD_HEADER_LENGTH]) -> SplitDecision + Send>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FragState {
    /// Assembling the five header bytes.
    Header,
    /// Forwarding record-1 payload; `remaining` tracks what is left of it.
    Record1,
    /// Forwarding record-2 payload.
    Record2,
    /// Pass-through. Never left once entered.
    Transparent,
}

/// Writer that splits the first TLS record at a length-derived offset while
/// the record is still streaming through.
///
/// Record headers are staged in a small internal buffer and only flushed once
/// at least one payload byte follows them, so each header and the start of
/// its payload reach the base writer in a single call; a censor watching TCP
/// segment boundaries never sees a header alone. A caller that writes the
/// whole Client Hello at once gets both records delivered in one write.
///
/// Construct with a split function over the payload length, typically
/// [`fixed_len_split`]. An out-of-range split, or a first record that is not
/// a valid Client Hello header, turns the writer into a transparent pipe.
pub struct StreamFragWriter<W> {
    base: W,
    decide: DecideFn,
    state: FragState,
    hdr: [u8; TLS_RECORD_HEADER_LENGTH],
    hdr_filled: usize,
    /// Payload bytes of the current record not yet handed to the base.
    remaining: usize,
    /// Payload length of the second record, fixed at split time.
    r2_len: usize,
    stage: Vec<u8>,
    stage_pos: usize,
    /// The stage currently ends with a record header that must not be
    /// flushed until payload bytes follow it.
    stage_open: bool,
    stashed: Option<io::Error>,
}

/// Split function for `tlsfrag:N` configs: a positive `n` is the payload
/// length of the first record, a negative `n` the payload length of the
/// second. The writer skips fragmentation when the result is out of range.
pub fn fixed_len_split(n: isize) -> impl Fn(usize) -> isize + Send + Sync + 'static {
    move |payload_len| {
        if n >= 0 {
            n
        } else {
            payload_len as isize + n
        }
    }
}

impl<W: AsyncWrite + Unpin> StreamFragWriter<W> {
    pub fn new(base: W, split: impl Fn(usize) -> isize + Send + 'static) -> Self {
        let decide: DecideFn = Box::new(move |hdr| {
            let header = RecordHeader::decode(hdr);
            if let Err(e) = header.validate_handshake() {
                trace!(error = %e, "first record is not a client hello, passing through");
                return SplitDecision::Pass;
            }
            let payload_len = header.payload_len as usize;
            let at = split(payload_len);
            if at > 0 && (at as usize) < payload_len {
                trace!(payload_len, split_at = at, "fragmenting client hello");
                SplitDecision::Split(at as usize)
            } else {
                trace!(payload_len, split_at = at, "split length out of range, record kept whole");
                SplitDecision::Pass
            }
        });
        Self::with_decision(base, decide)
    }

    pub(crate) fn with_decision(base: W, decide: DecideFn) -> Self {
        StreamFragWriter {
            base,
            decide,
            state: FragState::Header,
            hdr: [0u8; TLS_RECORD_HEADER_LENGTH],
            hdr_filled: 0,
            remaining: 0,
            r2_len: 0,
            stage: Vec::new(),
            stage_pos: 0,
            stage_open: false,
            stashed: None,
        }
    }

    pub fn get_ref(&self) -> &W {
        &self.base
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.base
    }

    pub fn into_inner(self) -> W {
        self.base
    }

    /// Feed this writer from `src` until the source is exhausted. The count
    /// is bytes pulled from `src`; headers added by the split do not count.
    pub async fn read_from<R>(&mut self, src: &mut R) -> io::Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        let mut scratch = [0u8; 8 * 1024];
        let mut count = 0u64;
        loop {
            if self.state == FragState::Transparent && self.stage.is_empty() {
                count += tokio::io::copy(src, &mut self.base).await?;
                return Ok(count);
            }
            let n = src.read(&mut scratch).await?;
            if n == 0 {
                self.flush().await?;
                return Ok(count);
            }
            self.write_all(&scratch[..n]).await?;
            count += n as u64;
        }
    }

    fn stage_header(&mut self, payload_len: u16) {
        let mut h = self.hdr;
        set_payload_len(&mut h, payload_len);
        self.stage.extend_from_slice(&h);
        self.stage_open = true;
    }

    /// Drain the stage buffer into the base writer.
    fn poll_flush_stage(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.stage_pos < self.stage.len() {
            match Pin::new(&mut self.base).poll_write(cx, &self.stage[self.stage_pos..]) {
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "base writer accepted zero bytes",
                    )))
                }
                Poll::Ready(Ok(n)) => self.stage_pos += n,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
        self.stage.clear();
        self.stage_pos = 0;
        Poll::Ready(Ok(()))
    }

    /// Advance past a record whose payload is fully forwarded.
    fn finish_record(&mut self) {
        match self.state {
            FragState::Record1 => {
                // Record 2 reuses the header scratch: same type and version,
                // only the length differs.
                self.stage_header(self.r2_len as u16);
                self.remaining = self.r2_len;
                self.state = FragState::Record2;
            }
            FragState::Record2 => {
                self.state = FragState::Transparent;
            }
            _ => unreachable!("finish_record outside a record state"),
        }
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for StreamFragWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if let Some(e) = this.stashed.take() {
            return Poll::Ready(Err(e));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let mut consumed = 0usize;
        loop {
            // A closed stage blocks everything else until it is on the wire.
            if !this.stage.is_empty() && !this.stage_open {
                match this.poll_flush_stage(cx) {
                    Poll::Ready(Ok(())) => {}
                    Poll::Ready(Err(e)) => {
                        return if consumed > 0 {
                            this.stashed = Some(e);
                            Poll::Ready(Ok(consumed))
                        } else {
                            Poll::Ready(Err(e))
                        }
                    }
                    Poll::Pending => {
                        return if consumed > 0 {
                            Poll::Ready(Ok(consumed))
                        } else {
                            Poll::Pending
                        }
                    }
                }
            }
            if consumed == buf.len() {
                return Poll::Ready(Ok(consumed));
            }
            match this.state {
                FragState::Header => {
                    let n = (TLS_RECORD_HEADER_LENGTH - this.hdr_filled)
                        .min(buf.len() - consumed);
                    this.hdr[this.hdr_filled..this.hdr_filled + n]
                        .copy_from_slice(&buf[consumed..consumed + n]);
                    this.hdr_filled += n;
                    consumed += n;
                    if this.hdr_filled < TLS_RECORD_HEADER_LENGTH {
                        return Poll::Ready(Ok(consumed));
                    }
                    match (this.decide)(&this.hdr) {
                        SplitDecision::Split(at) => {
                            let payload_len =
                                crate::utils::u16_from_be_slice(&this.hdr[3..5]) as usize;
                            debug_assert!(at > 0 && at < payload_len);
                            this.r2_len = payload_len - at;
                            this.stage_header(at as u16);
                            this.remaining = at;
                            this.state = FragState::Record1;
                        }
                        SplitDecision::Pass => {
                            let hdr = this.hdr;
                            this.stage.extend_from_slice(&hdr);
                            this.stage_open = false;
                            this.state = FragState::Transparent;
                        }
                    }
                }
                FragState::Record1 | FragState::Record2 => {
                    let n = (buf.len() - consumed).min(this.remaining);
                    debug_assert!(n > 0);
                    if !this.stage.is_empty() {
                        // Header waiting in the stage: coalesce the payload
                        // into it so both leave in one write.
                        this.stage.extend_from_slice(&buf[consumed..consumed + n]);
                        this.stage_open = false;
                        consumed += n;
                        this.remaining -= n;
                    } else {
                        match Pin::new(&mut this.base)
                            .poll_write(cx, &buf[consumed..consumed + n])
                        {
                            Poll::Ready(Ok(0)) => {
                                let e = io::Error::new(
                                    io::ErrorKind::WriteZero,
                                    "base writer accepted zero bytes",
                                );
                                return if consumed > 0 {
                                    this.stashed = Some(e);
                                    Poll::Ready(Ok(consumed))
                                } else {
                                    Poll::Ready(Err(e))
                                };
                            }
                            Poll::Ready(Ok(m)) => {
                                consumed += m;
                                this.remaining -= m;
                            }
                            Poll::Ready(Err(e)) => {
                                return if consumed > 0 {
                                    this.stashed = Some(e);
                                    Poll::Ready(Ok(consumed))
                                } else {
                                    Poll::Ready(Err(e))
                                }
                            }
                            Poll::Pending => {
                                return if consumed > 0 {
                                    Poll::Ready(Ok(consumed))
                                } else {
                                    Poll::Pending
                                }
                            }
                        }
                    }
                    if this.remaining == 0 {
                        this.finish_record();
                    }
                }
                FragState::Transparent => {
                    // Stage is empty here; closed stages were flushed above
                    // and transparent mode never opens one.
                    match Pin::new(&mut this.base).poll_write(cx, &buf[consumed..]) {
                        Poll::Ready(Ok(0)) => {
                            let e = io::Error::new(
                                io::ErrorKind::WriteZero,
                                "base writer accepted zero bytes",
                            );
                            return if consumed > 0 {
                                this.stashed = Some(e);
                                Poll::Ready(Ok(consumed))
                            } else {
                                Poll::Ready(Err(e))
                            };
                        }
                        Poll::Ready(Ok(m)) => return Poll::Ready(Ok(consumed + m)),
                        Poll::Ready(Err(e)) => {
                            return if consumed > 0 {
                                this.stashed = Some(e);
                                Poll::Ready(Ok(consumed))
                            } else {
                                Poll::Ready(Err(e))
                            }
                        }
                        Poll::Pending => {
                            return if consumed > 0 {
                                Poll::Ready(Ok(consumed))
                            } else {
                                Poll::Pending
                            }
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
        // An open stage (header awaiting its first payload byte) is withheld:
        // the caller still owes record bytes, so nothing useful is lost and
        // the header/payload coalescence survives intermediate flushes.
        if !this.stage.is_empty() && !this.stage_open {
            match this.poll_flush_stage(cx) {
                Poll::Ready(Ok(())) => {}
                other => return other,
            }
        }
        Pin::new(&mut this.base).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        // A header that never completed is dropped: no record was promised to
        // the base writer and there is nothing the peer could parse.
        if this.state == FragState::Header {
            this.hdr_filled = 0;
            this.state = FragState::Transparent;
        }
        if !this.stage.is_empty() {
            match this.poll_flush_stage(cx) {
                Poll::Ready(Ok(())) => {}
                other => return other,
            }
        }
        Pin::new(&mut this.base).poll_shutdown(cx)
    }
}

impl<W: AsyncRead + Unpin> AsyncRead for StreamFragWriter<W> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().base).poll_read(cx, buf)
    }
}

/// [`StreamDialer`] for `tlsfrag:N`: wraps connections from an inner dialer
/// with a [`StreamFragWriter`] using [`fixed_len_split`].
pub struct TlsFragDialer {
    inner: Box<dyn StreamDialer>,
    split_len: isize,
}

impl TlsFragDialer {
    pub fn new(inner: Box<dyn StreamDialer>, split_len: isize) -> Self {
        TlsFragDialer { inner, split_len }
    }
}

#[async_trait]
impl StreamDialer for TlsFragDialer {
    async fn dial_stream(&self, remote: &str) -> io::Result<Box<dyn StreamConn>> {
        let conn = self.inner.dial_stream(remote).await?;
        Ok(Box::new(StreamFragWriter::new(
            conn,
            fixed_len_split(self.split_len),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::RecordingWriter;

    const HELLO: [u8; 21] = [
        0x16, 0x03, 0x01, 0x00, 0x10, 0xFF, 0xEE, 0xDD, 0xCC, 0xBB, 0xAA, 0x99, 0x88, 0x77,
        0x66, 0x55, 0x44, 0x33, 0x22, 0x11, 0x00,
    ];
    const SPLIT_AT_7: [u8; 26] = [
        0x16, 0x03, 0x01, 0x00, 0x07, 0xFF, 0xEE, 0xDD, 0xCC, 0xBB, 0xAA, 0x99, 0x16, 0x03,
        0x01, 0x00, 0x09, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11, 0x00,
    ];

    fn writer(split: isize) -> StreamFragWriter<RecordingWriter> {
        StreamFragWriter::new(RecordingWriter::new(), fixed_len_split(split))
    }

    #[tokio::test]
    async fn whole_hello_in_one_call_is_one_base_write() {
        let mut w = writer(7);
        w.write_all(&HELLO).await.unwrap();
        assert_eq!(w.get_ref().writes, vec![SPLIT_AT_7.to_vec()]);
    }

    #[tokio::test]
    async fn single_byte_writes_produce_the_prescribed_sequence() {
        let mut w = writer(7);
        for b in HELLO {
            w.write_all(&[b]).await.unwrap();
        }
        let mut expected: Vec<Vec<u8>> = Vec::new();
        // record 1 header rides with its first payload byte
        expected.push(vec![0x16, 0x03, 0x01, 0x00, 0x07, 0xFF]);
        for b in [0xEE, 0xDD, 0xCC, 0xBB, 0xAA, 0x99] {
            expected.push(vec![b]);
        }
        // so does record 2's
        expected.push(vec![0x16, 0x03, 0x01, 0x00, 0x09, 0x88]);
        for b in [0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11, 0x00] {
            expected.push(vec![b]);
        }
        assert_eq!(w.get_ref().writes, expected);
    }

    #[tokio::test]
    async fn negative_split_length_counts_from_the_end() {
        let mut w = writer(-9);
        w.write_all(&HELLO).await.unwrap();
        assert_eq!(w.get_ref().concat(), SPLIT_AT_7.to_vec());
    }

    #[tokio::test]
    async fn non_client_hello_header_is_flushed_then_passed_through() {
        let alert = [0x15, 0x03, 0x01, 0x00, 0x06, 0xFF, 0xEE, 0xDD, 0xCC, 0xBB, 0xAA];
        let mut w = writer(3);
        w.write_all(&alert).await.unwrap();
        assert_eq!(
            w.get_ref().writes,
            vec![
                vec![0x15, 0x03, 0x01, 0x00, 0x06],
                vec![0xFF, 0xEE, 0xDD, 0xCC, 0xBB, 0xAA],
            ]
        );
    }

    #[tokio::test]
    async fn out_of_range_split_emits_header_then_payload() {
        for split in [0isize, 16, 100, -16] {
            let mut w = writer(split);
            w.write_all(&HELLO).await.unwrap();
            assert_eq!(
                w.get_ref().writes,
                vec![HELLO[..5].to_vec(), HELLO[5..].to_vec()],
                "split {split}"
            );
        }
    }

    #[tokio::test]
    async fn writes_straddling_the_record_boundary() {
        // 5-byte header, then 3 bytes, then everything else plus trailing data
        let mut w = writer(7);
        w.write_all(&HELLO[..5]).await.unwrap();
        assert!(w.get_ref().writes.is_empty()); // header withheld for payload
        w.write_all(&HELLO[5..8]).await.unwrap();
        w.write_all(&HELLO[8..]).await.unwrap();
        w.write_all(b"tail").await.unwrap();
        let mut expected = SPLIT_AT_7.to_vec();
        expected.extend_from_slice(b"tail");
        assert_eq!(w.get_ref().concat(), expected);
        // first write carried the header and its first payload bytes together
        assert_eq!(w.get_ref().writes[0][..5], SPLIT_AT_7[..5]);
        assert!(w.get_ref().writes[0].len() > 5);
    }

    #[tokio::test]
    async fn empty_writes_are_ignored() {
        let mut w = writer(7);
        assert_eq!(w.write(&[]).await.unwrap(), 0);
        w.write_all(&HELLO[..3]).await.unwrap();
        assert_eq!(w.write(&[]).await.unwrap(), 0);
        assert!(w.get_ref().writes.is_empty());
    }

    #[tokio::test]
    async fn incomplete_header_is_never_written() {
        let mut w = writer(7);
        w.write_all(&HELLO[..4]).await.unwrap();
        w.shutdown().await.unwrap();
        assert!(w.get_ref().writes.is_empty());
    }

    #[tokio::test]
    async fn survives_short_writes_from_base() {
        let mut w = StreamFragWriter::new(
            RecordingWriter::with_max_accept(2),
            fixed_len_split(7),
        );
        w.write_all(&HELLO).await.unwrap();
        w.flush().await.unwrap();
        assert_eq!(w.get_ref().concat(), SPLIT_AT_7.to_vec());
    }

    #[tokio::test]
    async fn read_from_counts_source_bytes() {
        let mut input = HELLO.to_vec();
        input.extend_from_slice(b"after");
        let mut src: &[u8] = &input;
        let mut w = writer(7);
        let n = w.read_from(&mut src).await.unwrap();
        assert_eq!(n, input.len() as u64);
        let mut expected = SPLIT_AT_7.to_vec();
        expected.extend_from_slice(b"after");
        assert_eq!(w.get_ref().concat(), expected);
    }

    #[tokio::test]
    async fn byte_preservation_for_arbitrary_payloads() {
        use rand::{Rng, SeedableRng};
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        for payload_len in [2usize, 3, 64, 1021] {
            let mut input = vec![0x16, 0x03, 0x03];
            input.extend_from_slice(&(payload_len as u16).to_be_bytes());
            let payload: Vec<u8> = (0..payload_len).map(|_| rng.gen()).collect();
            input.extend_from_slice(&payload);
            let split = ((payload_len / 2).max(1)) as isize;
            let mut w = writer(split);
            w.write_all(&input).await.unwrap();
            w.flush().await.unwrap();
            let out = w.get_ref().concat();
            assert_eq!(out.len(), input.len() + 5);
            // strip both headers, payloads concatenate to the original
            let mut got = out[5..5 + split as usize].to_vec();
            got.extend_from_slice(&out[5 + split as usize + 5..]);
            assert_eq!(got, payload);
        }
    }
}
