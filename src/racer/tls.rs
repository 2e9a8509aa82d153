//! TLS dialer: TCP connect, rustls handshake, optional issuer check and
//! HEAD probe

use std::net::SocketAddr;
use std::sync::{Arc, Once};
use std::time::Duration;

use async_trait::async_trait;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, Error as RustlsError, SignatureScheme};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};
use x509_parser::prelude::{FromDer, X509Certificate};

use super::dialer::{DialTarget, Dialed, Dialer, TcpDialer};
use crate::config::IssuerCheckConfig;
use crate::error::DialError;

/// Largest response head accepted from the HEAD probe
const MAX_PROBE_HEAD: usize = 16 * 1024;

static CRYPTO_PROVIDER: Once = Once::new();

/// Install the ring provider as the process default, once
pub fn ensure_crypto_provider() {
    CRYPTO_PROVIDER.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Which destinations must present a certificate from a known issuer
#[derive(Debug, Clone, Default)]
pub struct IssuerPolicy {
    host_suffixes: Vec<String>,
    host_contains: Vec<String>,
    issuer_prefix: String,
}

impl IssuerPolicy {
    /// Build from configuration
    #[must_use]
    pub fn from_config(config: &IssuerCheckConfig) -> Self {
        Self {
            host_suffixes: config.host_suffixes.clone(),
            host_contains: config.host_contains.clone(),
            issuer_prefix: config.issuer_prefix.clone(),
        }
    }

    /// Whether `host` is subject to the check
    #[must_use]
    pub fn applies_to(&self, host: &str) -> bool {
        !self.issuer_prefix.is_empty()
            && (self.host_suffixes.iter().any(|s| host.ends_with(s.as_str()))
                || self.host_contains.iter().any(|s| host.contains(s.as_str())))
    }

    /// Compare the leaf certificate's issuer CN against the expected prefix
    ///
    /// # Errors
    ///
    /// `DialError::IssuerMismatch` if the CN is missing or does not match.
    pub fn check(&self, host: &str, leaf: &CertificateDer<'_>) -> Result<(), DialError> {
        let issuer = issuer_common_name(leaf).unwrap_or_default();
        if issuer.starts_with(&self.issuer_prefix) {
            Ok(())
        } else {
            Err(DialError::IssuerMismatch {
                host: host.to_string(),
                issuer,
                expected: self.issuer_prefix.clone(),
            })
        }
    }
}

/// Issuer common name of a DER certificate
#[must_use]
pub fn issuer_common_name(der: &CertificateDer<'_>) -> Option<String> {
    let (_, cert) = X509Certificate::from_der(der.as_ref()).ok()?;
    let cn = cert.issuer().iter_common_name().next()?;
    cn.as_str().ok().map(str::to_string)
}

/// Dials TCP then performs a client TLS handshake
pub struct TlsDialer {
    tcp: TcpDialer,
    insecure: TlsConnector,
    verified: TlsConnector,
    issuer: IssuerPolicy,
}

impl std::fmt::Debug for TlsDialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsDialer")
            .field("tcp", &self.tcp)
            .field("issuer", &self.issuer)
            .finish_non_exhaustive()
    }
}

impl TlsDialer {
    /// Create a dialer over `tcp`
    #[must_use]
    pub fn new(tcp: TcpDialer, issuer: IssuerPolicy) -> Self {
        ensure_crypto_provider();

        let mut insecure = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate))
            .with_no_client_auth();
        insecure.alpn_protocols = vec![b"http/1.1".to_vec()];

        let roots = rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let mut verified = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        verified.alpn_protocols = vec![b"http/1.1".to_vec()];

        Self {
            tcp,
            insecure: TlsConnector::from(Arc::new(insecure)),
            verified: TlsConnector::from(Arc::new(verified)),
            issuer,
        }
    }

    async fn handshake(
        &self,
        target: &DialTarget,
        addr: SocketAddr,
        stream: TcpStream,
        limit: Duration,
    ) -> Result<TlsStream<TcpStream>, DialError> {
        let name = server_name(&target.host, addr)?;
        let connector = if target.validate { &self.verified } else { &self.insecure };

        let tls = timeout(limit, connector.connect(name, stream))
            .await
            .map_err(|_| DialError::timeout(addr, limit))?
            .map_err(|e| DialError::handshake(addr, e.to_string()))?;

        if target.validate && self.issuer.applies_to(&target.host) {
            let leaf = tls
                .get_ref()
                .1
                .peer_certificates()
                .and_then(|certs| certs.first())
                .ok_or_else(|| DialError::handshake(addr, "peer sent no certificate"))?;
            if let Err(e) = self.issuer.check(&target.host, leaf) {
                warn!(%addr, host = %target.host, "{}", e);
                return Err(e);
            }
        }
        Ok(tls)
    }
}

#[async_trait]
impl Dialer for TlsDialer {
    type Stream = TlsStream<TcpStream>;

    async fn dial(
        &self,
        target: &DialTarget,
        addr: SocketAddr,
        limit: Duration,
    ) -> Result<Dialed<Self::Stream>, DialError> {
        let started = Instant::now();
        let (stream, connect_time) = self.tcp.connect(addr, limit).await?;
        let mut tls = self.handshake(target, addr, stream, limit).await?;
        let handshake_time = started.elapsed();

        if target.headfirst {
            head_probe(&mut tls, &target.host, addr, limit).await?;
        }

        debug!(%addr, host = %target.host, ?connect_time, ?handshake_time, "tls connected");
        Ok(Dialed {
            stream: tls,
            peer: addr,
            connect_time,
            handshake_time: Some(handshake_time),
        })
    }
}

fn server_name(host: &str, addr: SocketAddr) -> Result<ServerName<'static>, DialError> {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Ok(ServerName::IpAddress(addr.ip().into()));
    }
    ServerName::try_from(host.to_string())
        .map_err(|e| DialError::handshake(addr, format!("invalid server name {host:?}: {e}")))
}

/// Send `HEAD /favicon.ico` and wait for a complete response head
async fn head_probe<S>(stream: &mut S, host: &str, addr: SocketAddr, limit: Duration) -> Result<(), DialError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let probe = async {
        let request = format!("HEAD /favicon.ico HTTP/1.1\r\nHost: {host}\r\n\r\n");
        stream.write_all(request.as_bytes()).await.map_err(|e| e.to_string())?;

        let mut buf = Vec::with_capacity(1024);
        let mut chunk = [0u8; 1024];
        loop {
            let n = stream.read(&mut chunk).await.map_err(|e| e.to_string())?;
            if n == 0 {
                return Err("connection closed before response".to_string());
            }
            buf.extend_from_slice(&chunk[..n]);

            let mut headers = [httparse::EMPTY_HEADER; 64];
            let mut response = httparse::Response::new(&mut headers);
            match response.parse(&buf) {
                Ok(httparse::Status::Complete(_)) => return Ok(()),
                Ok(httparse::Status::Partial) if buf.len() < MAX_PROBE_HEAD => {}
                Ok(httparse::Status::Partial) => return Err("response head too large".to_string()),
                Err(e) => return Err(e.to_string()),
            }
        }
    };

    match timeout(limit, probe).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(reason)) => Err(DialError::HeadProbe { addr, reason }),
        Err(_) => Err(DialError::HeadProbe {
            addr,
            reason: format!("no response within {}ms", limit.as_millis()),
        }),
    }
}

/// Accepts every certificate; used when the request did not ask for validation
#[derive(Debug)]
struct AcceptAnyCertificate;

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, RustlsError> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
