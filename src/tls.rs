use crate::decision::{Scheme, authority_host};
use crate::error::ProxyError;
use crate::rewind::Rewind;
use log::debug;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme};
use std::fs::File;
use std::io::{self, BufReader};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;

/// Raw connection to an upstream, after any proxy tunnel has been set up.
pub type RawConnection = Rewind<TcpStream>;

/// Accepts every certificate an upstream or proxy presents.
///
/// This gateway sits on an internal or intercepted network path and talks to
/// upstreams by IP with a foreign virtual host, so names and chains are not
/// checked. Keep it that way only where that posture is acceptable.
#[derive(Debug)]
pub struct TrustAllVerifier;

impl ServerCertVerifier for TrustAllVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

/// TLS client side used for every upstream connection.
#[derive(Clone)]
pub struct UpstreamTls {
    connector: TlsConnector,
}

impl UpstreamTls {
    pub fn trust_all() -> Self {
        let mut config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(TrustAllVerifier))
            .with_no_client_auth();
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Self {
            connector: TlsConnector::from(Arc::new(config)),
        }
    }

    /// Wraps `raw` in a client TLS session when `scheme` is encrypted, announcing
    /// the host part of `sni_host`. Plain schemes get `raw` back untouched.
    pub async fn wrap_if_needed(
        &self,
        raw: RawConnection,
        scheme: Scheme,
        sni_host: &str,
    ) -> Result<UpstreamStream, ProxyError> {
        if !scheme.is_encrypted() {
            return Ok(UpstreamStream::Plain(raw));
        }

        let host = authority_host(sni_host).to_string();
        let server_name = ServerName::try_from(host.clone())
            .map_err(|e| ProxyError::Tls(format!("invalid server name {:?}: {}", host, e)))?;

        debug!("Starting TLS handshake with SNI {}", host);
        // On failure the raw connection is dropped together with the handshake future.
        let tls = self
            .connector
            .connect(server_name, raw)
            .await
            .map_err(|e| ProxyError::Tls(e.to_string()))?;

        Ok(UpstreamStream::Tls(Box::new(tls)))
    }
}

/// Upstream byte stream, encrypted or not.
pub enum UpstreamStream {
    Plain(RawConnection),
    Tls(Box<TlsStream<RawConnection>>),
}

impl UpstreamStream {
    pub fn is_tls(&self) -> bool {
        matches!(self, UpstreamStream::Tls(_))
    }

    fn tcp(&self) -> &TcpStream {
        match self {
            UpstreamStream::Plain(raw) => raw.get_ref(),
            UpstreamStream::Tls(tls) => tls.get_ref().0.get_ref(),
        }
    }

    pub fn peer_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.tcp().peer_addr()
    }
}

impl AsyncRead for UpstreamStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            UpstreamStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for UpstreamStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            UpstreamStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => Pin::new(s).poll_flush(cx),
            UpstreamStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            UpstreamStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Builds the listener-side TLS configuration from a certificate chain and key.
pub fn server_config(
    cert_chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<ServerConfig, ProxyError> {
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)
        .map_err(|e| ProxyError::Certificate(format!("Failed to create TLS config: {}", e)))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

/// Reads a PEM certificate chain and private key from disk.
pub fn load_pem_files(
    cert_path: &str,
    key_path: &str,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), ProxyError> {
    let mut cert_file = BufReader::new(
        File::open(cert_path)
            .map_err(|e| ProxyError::Certificate(format!("Failed to open certificate file {}: {}", cert_path, e)))?,
    );
    let mut key_file = BufReader::new(
        File::open(key_path)
            .map_err(|e| ProxyError::Certificate(format!("Failed to open private key file {}: {}", key_path, e)))?,
    );

    let certs = rustls_pemfile::certs(&mut cert_file)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ProxyError::Certificate(format!("Failed to read certificate: {}", e)))?;
    if certs.is_empty() {
        return Err(ProxyError::Certificate("No valid certificate found".to_string()));
    }

    // PKCS#1, PKCS#8 and SEC1 keys are all accepted
    let key = rustls_pemfile::private_key(&mut key_file)
        .map_err(|e| ProxyError::Certificate(format!("Failed to read private key: {}", e)))?
        .ok_or_else(|| ProxyError::Certificate("No valid private key found".to_string()))?;

    Ok((certs, key))
}
