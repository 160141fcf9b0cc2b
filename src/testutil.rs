//! Shared test fixtures: a write-boundary-recording sink and a Client Hello
//! builder.

use tokio::io::AsyncWrite;

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Always-ready sink that records every `poll_write` call as its own chunk,
/// so tests can assert on write boundaries, not just the byte stream.
pub(crate) struct RecordingWriter {
    pub writes: Vec<Vec<u8>>,
    max_accept: Option<usize>,
}

impl RecordingWriter {
    pub fn new() -> Self {
        RecordingWriter { writes: Vec::new(), max_accept: None }
    }

    /// Accept at most `n` bytes per call, to exercise short-write handling.
    pub fn with_max_accept(n: usize) -> Self {
        RecordingWriter { writes: Vec::new(), max_accept: Some(n) }
    }

    pub fn concat(&self) -> Vec<u8> {
        self.writes.concat()
    }
}

impl AsyncWrite for RecordingWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let n = this.max_accept.map_or(buf.len(), |m| m.min(buf.len()));
        this.writes.push(buf[..n].to_vec());
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// A minimal but structurally correct Client Hello payload (handshake header
/// onward, no record header) carrying `hostname` in a server_name extension.
/// A supported_versions extension comes first so parsers cannot cheat by
/// assuming SNI leads.
pub(crate) fn client_hello_payload(hostname: &str) -> Vec<u8> {
    let host = hostname.as_bytes();

    let mut sni_ext = Vec::new();
    sni_ext.extend_from_slice(&((host.len() + 3) as u16).to_be_bytes()); // list length
    sni_ext.push(0x00); // name type: host_name
    sni_ext.extend_from_slice(&(host.len() as u16).to_be_bytes());
    sni_ext.extend_from_slice(host);

    let mut extensions = Vec::new();
    // supported_versions: TLS 1.3 + 1.2
    extensions.extend_from_slice(&43u16.to_be_bytes());
    extensions.extend_from_slice(&5u16.to_be_bytes());
    extensions.extend_from_slice(&[0x04, 0x03, 0x04, 0x03, 0x03]);
    // server_name
    extensions.extend_from_slice(&0u16.to_be_bytes());
    extensions.extend_from_slice(&(sni_ext.len() as u16).to_be_bytes());
    extensions.extend_from_slice(&sni_ext);

    let mut body = Vec::new();
    body.extend_from_slice(&[0x03, 0x03]); // legacy_version
    body.extend_from_slice(&[0x42; 32]); // random
    body.push(0); // session id: empty
    body.extend_from_slice(&2u16.to_be_bytes()); // one cipher suite
    body.extend_from_slice(&[0x13, 0x01]);
    body.push(1); // one compression method
    body.push(0);
    body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
    body.extend_from_slice(&extensions);

    let mut payload = vec![0x01]; // client_hello
    payload.push(0);
    payload.extend_from_slice(&(body.len() as u16).to_be_bytes());
    payload.extend_from_slice(&body);
    payload
}

/// The same hello wrapped in a handshake record.
pub(crate) fn client_hello_record(hostname: &str) -> Vec<u8> {
    let payload = client_hello_payload(hostname);
    let mut record = vec![0x16, 0x03, 0x01];
    record.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    record.extend_from_slice(&payload);
    record
}
