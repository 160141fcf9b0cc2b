//! Composable stream transports that reshape the first TLS Client Hello so
//! middleboxes matching on the cleartext SNI cannot reconstruct it.
//!
//! The core move is record fragmentation: the Client Hello is re-framed as
//! two back-to-back TLS records whose payloads concatenate to the original,
//! which standards-conforming servers reassemble and naive DPI does not.
//! Everything is packaged as [`StreamDialer`] wrappers that nest, so a whole
//! evasion strategy is one config string:
//!
//! ```no_run
//! use cleave::DialerRegistry;
//!
//! # async fn run() -> std::io::Result<()> {
//! let registry = DialerRegistry::new();
//! let dialer = registry.new_stream_dialer("tlsfrag:4").unwrap();
//! let mut conn = dialer.dial_stream("example.com:443").await?;
//! // use conn like any tokio byte stream
//! # Ok(())
//! # }
//! ```
//!
//! Transforms compose right-to-left: `tls:sni=front.example | tlsfrag:-2`
//! fragments on the socket and runs a TLS session above the fragmenter.
//! Failure to fragment (no Client Hello, out-of-range split) is never an
//! error; the transports degrade to a transparent pipe.

pub mod buffered;
pub mod config;
pub mod dialer;
pub mod hello;
pub mod record;
pub mod recordfrag;
pub mod sni;
pub mod split;
pub mod streaming;
pub mod tls;

mod utils;

#[cfg(test)]
mod testutil;

pub use buffered::{BufferedFragDialer, BufferedFragWriter, SplitFn};
pub use config::{parse_config, sanitize_config, BuildFn, ConfigError, ConfigPart, DialerRegistry};
pub use dialer::{OverrideDialer, StreamConn, StreamDialer, TcpDialer};
pub use hello::{ClientHelloBuf, HelloStatus};
pub use record::{HeaderError, RecordHeader, TLS_RECORD_HEADER_LENGTH};
pub use recordfrag::{RecordFragDialer, RecordFragWriter};
pub use sni::{find_sni, split_offset};
pub use split::{SplitDialer, SplitWriter};
pub use streaming::{fixed_len_split, StreamFragWriter, TlsFragDialer};
pub use tls::TlsDialer;
