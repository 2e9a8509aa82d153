//! Certificate lookup for TLS interception
//!
//! Minting certificates is outside this crate: a provider only maps a
//! hostname to a PEM file holding both the certificate chain and its
//! private key.

use std::fmt::Debug;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;

use crate::config::CertConfig;
use crate::error::CertError;

/// Maps a hostname to a combined certificate/key PEM file
#[async_trait]
pub trait CertProvider: Send + Sync + Debug {
    /// PEM path for `host`
    async fn cert_path(&self, host: &str) -> Result<PathBuf, CertError>;
}

/// Looks up `<dir>/<host>.crt`, falling back to a default PEM
#[derive(Debug, Clone)]
pub struct DirectoryCertProvider {
    dir: PathBuf,
    default: Option<PathBuf>,
}

impl DirectoryCertProvider {
    /// Provider over `dir` with an optional fallback
    pub fn new(dir: impl Into<PathBuf>, default: Option<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            default,
        }
    }

    /// Provider from the `certs` configuration section
    #[must_use]
    pub fn from_config(config: &CertConfig) -> Self {
        Self::new(config.path.clone(), config.default_cert.clone())
    }
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path).await.is_ok_and(|m| m.is_file())
}

#[async_trait]
impl CertProvider for DirectoryCertProvider {
    async fn cert_path(&self, host: &str) -> Result<PathBuf, CertError> {
        let safe = !host.is_empty() && !host.contains(['/', '\\']) && !host.starts_with('.');
        if safe {
            let candidate = self.dir.join(format!("{host}.crt"));
            if is_file(&candidate).await {
                return Ok(candidate);
            }
        }
        if let Some(default) = &self.default {
            if is_file(default).await {
                return Ok(default.clone());
            }
        }
        Err(CertError::NotFound { host: host.to_string() })
    }
}

/// Serves the same PEM for every host
#[derive(Debug, Clone)]
pub struct StaticCertProvider {
    path: PathBuf,
}

impl StaticCertProvider {
    /// Always answer `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl CertProvider for StaticCertProvider {
    async fn cert_path(&self, _host: &str) -> Result<PathBuf, CertError> {
        Ok(self.path.clone())
    }
}

/// Build a server-side TLS configuration from a combined PEM
///
/// # Errors
///
/// `CertError::Invalid` if the PEM lacks a certificate or key, or rustls
/// rejects the pair.
pub fn load_server_config(path: &Path, pem: &[u8]) -> Result<ServerConfig, CertError> {
    let name = path.display().to_string();
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<_, _>>()
        .map_err(|e| CertError::invalid(&name, e.to_string()))?;
    if certs.is_empty() {
        return Err(CertError::invalid(&name, "no certificate found"));
    }
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut &pem[..])
        .map_err(|e| CertError::invalid(&name, e.to_string()))?
        .ok_or_else(|| CertError::invalid(&name, "no private key found"))?;

    crate::racer::ensure_crypto_provider();
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| CertError::invalid(&name, e.to_string()))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

#[cfg(test)]
pub(crate) mod testing {
    use std::path::Path;

    /// Write a self-signed certificate and key for `hosts` into one PEM
    pub fn write_pem(path: &Path, hosts: &[&str]) {
        let key = rcgen::KeyPair::generate().unwrap();
        let params = rcgen::CertificateParams::new(hosts.iter().map(|h| (*h).to_string()).collect::<Vec<_>>()).unwrap();
        let cert = params.self_signed(&key).unwrap();
        let pem = format!("{}{}", cert.pem(), key.serialize_pem());
        std::fs::write(path, pem).unwrap();
    }
}
