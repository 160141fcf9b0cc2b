//! The 5-byte TLS record header: parsing, emission and handshake validation.
//!
//! Everything above the record layer is opaque to this crate except for the
//! SNI walk in [`crate::sni`].

use thiserror::Error;

use crate::utils::u16_from_be_slice;

/// Length of a TLS record header on the wire.
pub const TLS_RECORD_HEADER_LENGTH: usize = 5;

/// Largest payload a single handshake record may carry (RFC 8446 §5.1).
pub const MAX_HANDSHAKE_PAYLOAD_LENGTH: usize = 1 << 14;

/// Record content type of handshake messages.
pub const CONTENT_TYPE_HANDSHAKE: u8 = 22;

/// Why a record header failed handshake validation.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum HeaderError {
    #[error("record type {0} is not handshake")]
    WrongType(u8),
    #[error("record version {0:#06x} is not a TLS version")]
    BadVersion(u16),
    #[error("handshake record length {0} out of range")]
    LengthOutOfRange(usize),
}

/// A decoded TLS record header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordHeader {
    pub content_type: u8,
    pub version: u16,
    pub payload_len: u16,
}

impl RecordHeader {
    pub fn decode(buf: &[u8; TLS_RECORD_HEADER_LENGTH]) -> Self {
        RecordHeader {
            content_type: buf[0],
            version: u16_from_be_slice(&buf[1..3]),
            payload_len: u16_from_be_slice(&buf[3..5]),
        }
    }

    pub fn encode(&self) -> [u8; TLS_RECORD_HEADER_LENGTH] {
        let v = self.version.to_be_bytes();
        let l = self.payload_len.to_be_bytes();
        [self.content_type, v[0], v[1], l[0], l[1]]
    }

    /// Check that this header opens a plausible handshake record.
    ///
    /// Accepts type 22, versions 0x0301..=0x0304 and a payload length in
    /// `[1, 16384]`. RFC 8446 permits 0x0300 in the record-layer version
    /// field, but no TLS 1.0+ client puts it on the wire, so it is rejected
    /// here along with everything else outside the range.
    pub fn validate_handshake(&self) -> Result<(), HeaderError> {
        if self.content_type != CONTENT_TYPE_HANDSHAKE {
            return Err(HeaderError::WrongType(self.content_type));
        }
        if !(0x0301..=0x0304).contains(&self.version) {
            return Err(HeaderError::BadVersion(self.version));
        }
        let len = self.payload_len as usize;
        if len == 0 || len > MAX_HANDSHAKE_PAYLOAD_LENGTH {
            return Err(HeaderError::LengthOutOfRange(len));
        }
        Ok(())
    }
}

/// Rewrite the length field of an encoded record header in place.
pub fn set_payload_len(header: &mut [u8], len: u16) {
    header[3..TLS_RECORD_HEADER_LENGTH].copy_from_slice(&len.to_be_bytes());
}
