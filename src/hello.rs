//! Incremental accumulation of the first TLS record of a connection.
//!
//! [`ClientHelloBuf`] receives bytes as they arrive, decides as early as
//! possible whether they form a valid Client Hello record, and signals the
//! instant the record is complete. The buffer is the scanning state of both
//! fragmenting writers; once a writer leaves that state the buffer is gone.

use tokio::io::{AsyncRead, AsyncReadExt};

use std::io;

use crate::record::{
    HeaderError, RecordHeader, CONTENT_TYPE_HANDSHAKE, MAX_HANDSHAKE_PAYLOAD_LENGTH,
    TLS_RECORD_HEADER_LENGTH,
};

/// Outcome of feeding bytes into a [`ClientHelloBuf`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HelloStatus {
    /// The record is still incomplete; feed more bytes.
    NeedMore,
    /// A full Client Hello record is now buffered.
    Complete,
    /// The bytes are provably not a Client Hello record. Latched: every
    /// further append reports `Invalid` again without consuming anything.
    Invalid,
    /// The record was already complete before this call; nothing consumed.
    Full,
}

/// Buffer that accumulates and validates one Client Hello record.
///
/// Validation is staged so bad input is refused early: the content type is
/// checked as soon as the first byte is in, the version after the third, the
/// payload length after the fifth. The payload itself is opaque.
#[derive(Debug)]
pub struct ClientHelloBuf {
    data: Vec<u8>,
    /// Header plus payload length, known once the header is complete.
    total_len: Option<usize>,
    invalid: Option<HeaderError>,
}

impl ClientHelloBuf {
    pub fn new() -> Self {
        ClientHelloBuf {
            data: Vec::with_capacity(TLS_RECORD_HEADER_LENGTH),
            total_len: None,
            invalid: None,
        }
    }

    /// Feed bytes in. Returns how many bytes were consumed and the resulting
    /// status. On [`HelloStatus::Invalid`] the bytes consumed so far stay in
    /// the buffer so the caller can forward them unchanged.
    pub fn append(&mut self, input: &[u8]) -> (usize, HelloStatus) {
        if self.invalid.is_some() {
            return (0, HelloStatus::Invalid);
        }
        if self.is_complete() {
            return (0, HelloStatus::Full);
        }
        let mut consumed = 0;
        while consumed < input.len() {
            let want = self.next_checkpoint() - self.data.len();
            let n = want.min(input.len() - consumed);
            self.data.extend_from_slice(&input[consumed..consumed + n]);
            consumed += n;
            self.check_prefix();
            if self.invalid.is_some() {
                return (consumed, HelloStatus::Invalid);
            }
            if self.is_complete() {
                return (consumed, HelloStatus::Complete);
            }
        }
        (consumed, HelloStatus::NeedMore)
    }

    /// Pull bytes from `reader` until the record completes, proves invalid,
    /// or the source runs dry. End of stream while the record is incomplete
    /// is reported as [`HelloStatus::NeedMore`], not as an error; read errors
    /// surface unchanged.
    pub async fn fill_from<R>(&mut self, reader: &mut R) -> io::Result<HelloStatus>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            if self.invalid.is_some() {
                return Ok(HelloStatus::Invalid);
            }
            if self.is_complete() {
                return Ok(HelloStatus::Complete);
            }
            let expected = self.total_len.unwrap_or(TLS_RECORD_HEADER_LENGTH);
            let start = self.data.len();
            self.data.resize(expected, 0);
            let n = match reader.read(&mut self.data[start..]).await {
                Ok(n) => n,
                Err(e) => {
                    self.data.truncate(start);
                    return Err(e);
                }
            };
            self.data.truncate(start + n);
            if n == 0 {
                return Ok(HelloStatus::NeedMore);
            }
            self.check_prefix();
        }
    }

    /// The accumulated record bytes (header plus however much payload has
    /// arrived). Callers must not assume completeness; check [`status`].
    ///
    /// [`status`]: ClientHelloBuf::status
    pub fn view(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn status(&self) -> HelloStatus {
        if self.invalid.is_some() {
            HelloStatus::Invalid
        } else if self.is_complete() {
            HelloStatus::Complete
        } else {
            HelloStatus::NeedMore
        }
    }

    /// Why the buffer latched invalid, if it did.
    pub fn invalid_reason(&self) -> Option<HeaderError> {
        self.invalid
    }

    /// Surrender the accumulated bytes. For a complete record the vector has
    /// one spare header's worth of capacity past its length, so a split can
    /// rewrite it in place without reallocating.
    pub(crate) fn into_record(self) -> Vec<u8> {
        self.data
    }

    fn is_complete(&self) -> bool {
        self.total_len == Some(self.data.len())
    }

    fn next_checkpoint(&self) -> usize {
        match self.total_len {
            Some(total) => total,
            None => match self.data.len() {
                0 => 1,
                1 | 2 => 3,
                _ => TLS_RECORD_HEADER_LENGTH,
            },
        }
    }

    /// Run whichever validation stages the current fill level allows.
    fn check_prefix(&mut self) {
        if self.invalid.is_some() {
            return;
        }
        let len = self.data.len();
        if len >= 1 && self.data[0] != CONTENT_TYPE_HANDSHAKE {
            self.invalid = Some(HeaderError::WrongType(self.data[0]));
            return;
        }
        if len >= 3 {
            let version = crate::utils::u16_from_be_slice(&self.data[1..3]);
            if !(0x0301..=0x0304).contains(&version) {
                self.invalid = Some(HeaderError::BadVersion(version));
                return;
            }
        }
        if len >= TLS_RECORD_HEADER_LENGTH && self.total_len.is_none() {
            let header = RecordHeader::decode(
                self.data[..TLS_RECORD_HEADER_LENGTH].try_into().expect("header slice"),
            );
            let payload_len = header.payload_len as usize;
            if payload_len == 0 || payload_len > MAX_HANDSHAKE_PAYLOAD_LENGTH {
                self.invalid = Some(HeaderError::LengthOutOfRange(payload_len));
                return;
            }
            let total = TLS_RECORD_HEADER_LENGTH + payload_len;
            self.total_len = Some(total);
            // One growth, with headroom for a second header so the split can
            // happen in place later.
            self.data
                .reserve_exact(total + TLS_RECORD_HEADER_LENGTH - self.data.len());
        }
    }
}

impl Default for ClientHelloBuf {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record(payload: &[u8]) -> Vec<u8> {
        let mut rec = vec![0x16, 0x03, 0x01];
        rec.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        rec.extend_from_slice(payload);
        rec
    }

    #[test]
    fn completes_whole_record_in_one_append() {
        let rec = sample_record(&[0x01, 0xAA, 0xBB, 0xCC]);
        let mut buf = ClientHelloBuf::new();
        let (n, status) = buf.append(&rec);
        assert_eq!(n, rec.len());
        assert_eq!(status, HelloStatus::Complete);
        assert_eq!(buf.view(), &rec[..]);
    }

    #[test]
    fn completes_byte_by_byte() {
        let rec = sample_record(&[0x01, 0xAA, 0xBB]);
        let mut buf = ClientHelloBuf::new();
        for (i, b) in rec.iter().enumerate() {
            let (n, status) = buf.append(&[*b]);
            assert_eq!(n, 1);
            if i + 1 == rec.len() {
                assert_eq!(status, HelloStatus::Complete);
            } else {
                assert_eq!(status, HelloStatus::NeedMore);
            }
        }
    }

    #[test]
    fn consumes_only_up_to_completion() {
        let mut rec = sample_record(&[0x01, 0xAA]);
        let record_len = rec.len();
        rec.push(0xFF); // trailing byte past the record
        let mut buf = ClientHelloBuf::new();
        let (n, status) = buf.append(&rec);
        assert_eq!(status, HelloStatus::Complete);
        assert_eq!(n, record_len);
        let (n, status) = buf.append(&[0xFF]);
        assert_eq!((n, status), (0, HelloStatus::Full));
    }

    #[test]
    fn rejects_wrong_type_on_first_byte() {
        let mut buf = ClientHelloBuf::new();
        let (n, status) = buf.append(&[0x15, 0x03, 0x01]);
        assert_eq!((n, status), (1, HelloStatus::Invalid));
        assert_eq!(buf.invalid_reason(), Some(HeaderError::WrongType(0x15)));
        // latched
        let (n, status) = buf.append(&[0x16]);
        assert_eq!((n, status), (0, HelloStatus::Invalid));
        assert_eq!(buf.view(), &[0x15]);
    }

    #[test]
    fn rejects_bad_version() {
        let mut buf = ClientHelloBuf::new();
        let (_, status) = buf.append(&[0x16, 0x03, 0x00]);
        assert_eq!(status, HelloStatus::Invalid);
        assert_eq!(buf.invalid_reason(), Some(HeaderError::BadVersion(0x0300)));
    }

    #[test]
    fn rejects_zero_and_oversize_lengths() {
        let mut buf = ClientHelloBuf::new();
        let (_, status) = buf.append(&[0x16, 0x03, 0x03, 0x00, 0x00]);
        assert_eq!(status, HelloStatus::Invalid);
        assert_eq!(buf.invalid_reason(), Some(HeaderError::LengthOutOfRange(0)));

        let mut buf = ClientHelloBuf::new();
        let (_, status) = buf.append(&[0x16, 0x03, 0x03, 0x40, 0x01]);
        assert_eq!(status, HelloStatus::Invalid);
        assert_eq!(buf.invalid_reason(), Some(HeaderError::LengthOutOfRange(16385)));
    }

    #[test]
    fn reserves_split_headroom_once() {
        let rec = sample_record(&[0x01; 32]);
        let mut buf = ClientHelloBuf::new();
        buf.append(&rec);
        let data = buf.into_record();
        assert_eq!(data.len(), rec.len());
        assert!(data.capacity() >= rec.len() + TLS_RECORD_HEADER_LENGTH);
    }

    #[tokio::test]
    async fn fill_from_reads_to_completion() {
        let rec = sample_record(&[0x01, 0x02, 0x03, 0x04, 0x05]);
        let mut src: &[u8] = &rec;
        let mut buf = ClientHelloBuf::new();
        let status = buf.fill_from(&mut src).await.unwrap();
        assert_eq!(status, HelloStatus::Complete);
        assert_eq!(buf.view(), &rec[..]);
    }

    #[tokio::test]
    async fn fill_from_reports_need_more_on_eof() {
        let rec = sample_record(&[0x01, 0x02, 0x03]);
        let mut src: &[u8] = &rec[..4]; // ends mid-header
        let mut buf = ClientHelloBuf::new();
        let status = buf.fill_from(&mut src).await.unwrap();
        assert_eq!(status, HelloStatus::NeedMore);
        assert_eq!(buf.len(), 4);
    }

    #[tokio::test]
    async fn fill_from_stops_on_invalid() {
        let mut src: &[u8] = &[0x17, 0x03, 0x03, 0x00, 0x10, 0xFF];
        let mut buf = ClientHelloBuf::new();
        let status = buf.fill_from(&mut src).await.unwrap();
        assert_eq!(status, HelloStatus::Invalid);
        assert_eq!(buf.invalid_reason(), Some(HeaderError::WrongType(0x17)));
    }
}
