//! Local TLS termination for intercepted tunnels

use std::path::PathBuf;
use std::sync::Arc;

use moka::sync::Cache;
use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info};

use super::cert::{load_server_config, CertProvider};
use crate::error::{CertError, ConnectionError, ProxyError};
use crate::filter::Session;
use crate::http::Request;

/// Server configs kept per certificate file
const CONFIG_CACHE_SIZE: u64 = 256;

/// Answers CONNECT with `200` and then plays the TLS server with a
/// certificate for the requested host
pub struct StripPlugin {
    certs: Arc<dyn CertProvider>,
    configs: Cache<PathBuf, Arc<ServerConfig>>,
}

impl std::fmt::Debug for StripPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripPlugin")
            .field("certs", &self.certs)
            .field("cached_configs", &self.configs.entry_count())
            .finish()
    }
}

impl StripPlugin {
    /// Plugin over a certificate provider
    pub fn new(certs: Arc<dyn CertProvider>) -> Self {
        Self {
            certs,
            configs: Cache::new(CONFIG_CACHE_SIZE),
        }
    }

    /// TLS server configuration for `host`
    ///
    /// # Errors
    ///
    /// Propagates provider lookups and PEM loading failures.
    pub async fn server_config(&self, host: &str) -> Result<Arc<ServerConfig>, CertError> {
        let path = self.certs.cert_path(host).await?;
        if let Some(config) = self.configs.get(&path) {
            return Ok(config);
        }
        let pem = tokio::fs::read(&path).await?;
        let config = Arc::new(load_server_config(&path, &pem)?);
        debug!(host, path = %path.display(), "loaded interception certificate");
        self.configs.insert(path, Arc::clone(&config));
        Ok(config)
    }

    /// Confirm the tunnel to the client
    ///
    /// # Errors
    ///
    /// Propagates write failures.
    pub async fn respond_established<W>(&self, client: &mut W, req: &Request, session: &Session) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        info!(
            "{} \"STRIP {} {}:{} HTTP/1.{}\" - -",
            session.client, req.method, req.host, req.port, req.version
        );
        client.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await?;
        client.flush().await
    }

    /// Accept a TLS session on `stream` as `host`
    ///
    /// # Errors
    ///
    /// `ProxyError::Cert` when no usable certificate exists,
    /// `ConnectionError::TlsAccept` when the handshake fails.
    pub async fn accept<S>(&self, stream: S, host: &str) -> Result<TlsStream<S>, ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let config = self.server_config(host).await?;
        TlsAcceptor::from(config)
            .accept(stream)
            .await
            .map_err(|e| ProxyError::from(ConnectionError::TlsAccept(format!("{host}: {e}"))))
    }
}
