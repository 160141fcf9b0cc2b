//! TLS client wrapping, the `tls:` transport.
//!
//! Wraps the inner connection in a rustls handshake against the webpki root
//! store. `sni=` changes the name sent in the Client Hello; `certname=`
//! changes the name certificates are verified against, for fronting setups
//! where the two differ.

use async_trait::async_trait;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio_rustls::TlsConnector;
use tracing::debug;

use std::io;
use std::sync::Arc;

use crate::dialer::{StreamConn, StreamDialer};
use crate::utils::split_host_port;

/// [`StreamDialer`] that performs a TLS client handshake on the inner
/// connection.
pub struct TlsDialer {
    inner: Box<dyn StreamDialer>,
    sni: Option<String>,
    config: Arc<ClientConfig>,
}

impl TlsDialer {
    /// `sni` overrides the server name sent on the wire (default: the dialed
    /// host). `certname` overrides the name used for certificate validation
    /// (default: whatever name is sent).
    pub fn new(
        inner: Box<dyn StreamDialer>,
        sni: Option<String>,
        certname: Option<String>,
    ) -> io::Result<Self> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let roots = Arc::new(roots);
        let mut config = ClientConfig::builder()
            .with_root_certificates(roots.clone())
            .with_no_client_auth();
        if let Some(certname) = certname {
            let verifier = CertNameVerifier::new(roots, &certname)?;
            config
                .dangerous()
                .set_certificate_verifier(Arc::new(verifier));
        }
        Ok(TlsDialer {
            inner,
            sni,
            config: Arc::new(config),
        })
    }
}

#[async_trait]
impl StreamDialer for TlsDialer {
    async fn dial_stream(&self, remote: &str) -> io::Result<Box<dyn StreamConn>> {
        let conn = self.inner.dial_stream(remote).await?;
        let host = match &self.sni {
            Some(sni) => sni.clone(),
            None => {
                let (host, _) = split_host_port(remote).ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("invalid remote address {remote:?}"),
                    )
                })?;
                host.to_string()
            }
        };
        let name = ServerName::try_from(host.clone())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let stream = TlsConnector::from(self.config.clone())
            .connect(name, conn)
            .await?;
        debug!(%remote, sni = %host, "tls handshake done");
        Ok(Box::new(stream))
    }
}

/// Verifies the peer chain against a fixed name instead of the dialed one.
/// Everything else is the stock webpki verification.
#[derive(Debug)]
struct CertNameVerifier {
    inner: Arc<WebPkiServerVerifier>,
    name: ServerName<'static>,
}

impl CertNameVerifier {
    fn new(roots: Arc<RootCertStore>, certname: &str) -> io::Result<Self> {
        let inner = WebPkiServerVerifier::builder(roots)
            .build()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        let name = ServerName::try_from(certname.to_string())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        Ok(CertNameVerifier { inner, name })
    }
}

impl ServerCertVerifier for CertNameVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        self.inner
            .verify_server_cert(end_entity, intermediates, &self.name, ocsp_response, now)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}
