//! Connection Manager
//!
//! Limits concurrent clients with a semaphore, hands each accepted socket
//! to a [`ProxyHandler`] task and drains them on shutdown.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Semaphore};
use tracing::{debug, info, warn};

use super::handler::ProxyHandler;
use super::stats::{ProxyStats, StatsSnapshot};
use super::tcp::{spawn_tcp_handler, TcpConnectionContext};
use crate::config::ConnectionConfig;
use crate::error::{ConnectionError, ProxyError};

/// Pause after the process runs out of descriptors
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Connection manager for handling concurrent connections
pub struct ConnectionManager {
    semaphore: Arc<Semaphore>,
    max_connections: usize,
    stats: Arc<ProxyStats>,
    handler: Arc<ProxyHandler>,
    drain_timeout: Duration,
    shutdown_tx: broadcast::Sender<()>,
    shutting_down: AtomicBool,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("max_connections", &self.max_connections)
            .field("active", &self.active_connections())
            .field("shutting_down", &self.is_shutting_down())
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Create a new connection manager
    pub fn new(config: &ConnectionConfig, handler: Arc<ProxyHandler>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            semaphore: Arc::new(Semaphore::new(config.max_connections)),
            max_connections: config.max_connections,
            stats: Arc::clone(handler.stats()),
            handler,
            drain_timeout: config.drain_timeout(),
            shutdown_tx,
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Take over an accepted client, within the connection limit
    ///
    /// # Errors
    ///
    /// `ConnectionError::ShuttingDown` after [`shutdown`](Self::shutdown),
    /// `ConnectionError::LimitReached` when every slot is taken. The socket
    /// is dropped in both cases.
    pub fn handle_connection(&self, stream: TcpStream, client_addr: SocketAddr) -> Result<(), ConnectionError> {
        if self.is_shutting_down() {
            self.stats.client_rejected();
            return Err(ConnectionError::ShuttingDown);
        }

        let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() else {
            self.stats.client_rejected();
            let current = self.active_connections();
            warn!(
                "Connection limit reached ({}/{}), rejecting connection from {}",
                current, self.max_connections, client_addr
            );
            return Err(ConnectionError::limit_reached(current, self.max_connections));
        };

        self.stats.client_accepted();
        debug!(
            "Accepted connection from {} (active: {}/{})",
            client_addr,
            self.active_connections(),
            self.max_connections
        );

        let ctx = TcpConnectionContext {
            stream,
            client_addr,
            handler: Arc::clone(&self.handler),
        };
        spawn_tcp_handler(ctx, Arc::clone(&self.stats), permit, self.shutdown_tx.subscribe());
        Ok(())
    }

    /// The shared request handler
    #[must_use]
    pub fn handler(&self) -> &Arc<ProxyHandler> {
        &self.handler
    }

    #[must_use]
    pub fn stats(&self) -> &ProxyStats {
        &self.stats
    }

    #[must_use]
    pub fn stats_snapshot(&self) -> StatsSnapshot {
        self.handler.stats_snapshot()
    }

    /// Connections currently holding a slot
    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.max_connections - self.semaphore.available_permits()
    }

    #[must_use]
    pub fn available_slots(&self) -> usize {
        self.semaphore.available_permits()
    }

    #[must_use]
    pub fn at_capacity(&self) -> bool {
        self.semaphore.available_permits() == 0
    }

    /// Stop taking clients and wait up to the drain timeout for the
    /// remaining ones; idempotent
    pub async fn shutdown(&self) {
        if self
            .shutting_down
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        info!("Initiating connection manager shutdown");
        let _ = self.shutdown_tx.send(());

        let drain_start = tokio::time::Instant::now();
        let check_interval = Duration::from_millis(100);

        while drain_start.elapsed() < self.drain_timeout {
            let active = self.active_connections();
            if active == 0 {
                info!("All connections drained");
                return;
            }
            debug!(
                "Waiting for {} connections to drain ({:.1}s remaining)",
                active,
                (self.drain_timeout - drain_start.elapsed()).as_secs_f64()
            );
            tokio::time::sleep(check_interval).await;
        }

        let remaining = self.active_connections();
        if remaining > 0 {
            warn!("Drain timeout reached with {} connections still active", remaining);
        }
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }
}

/// Accept errors that only concern one connection or a passing shortage
fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    ) || matches!(
        e.raw_os_error(),
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)
    )
}

/// Run the connection accept loop until shutdown
///
/// # Errors
///
/// Returns the accept error when the listener itself fails.
pub async fn run_accept_loop(listener: TcpListener, manager: Arc<ConnectionManager>) -> Result<(), ProxyError> {
    info!(
        "Starting accept loop on {} (max {} connections)",
        listener.local_addr()?,
        manager.max_connections
    );

    loop {
        if manager.is_shutting_down() {
            info!("Accept loop stopping due to shutdown");
            break;
        }

        match listener.accept().await {
            Ok((stream, client_addr)) => {
                if let Err(e) = manager.handle_connection(stream, client_addr) {
                    debug!("Failed to handle connection from {}: {}", client_addr, e);
                }
            }
            Err(e) if is_transient_accept_error(&e) => {
                debug!("Recoverable accept error: {}", e);
                if matches!(e.raw_os_error(), Some(libc::EMFILE | libc::ENFILE)) {
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_config_str;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn create_test_manager(max_connections: usize) -> ConnectionManager {
        let config = load_config_str(r#"{ "dns": { "servers": [] }, "filters": [ { "type": "blackhole" } ] }"#).unwrap();
        let handler = Arc::new(ProxyHandler::from_config(&config).unwrap());
        let connection = ConnectionConfig {
            max_connections,
            buffer_size: 65536,
            drain_timeout_secs: 1,
        };
        ConnectionManager::new(&connection, handler)
    }

    #[test]
    fn test_manager_creation() {
        let manager = create_test_manager(10);
        assert_eq!(manager.active_connections(), 0);
        assert_eq!(manager.available_slots(), 10);
        assert!(!manager.at_capacity());
        assert_eq!(manager.stats().clients().accepted, 0);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let manager = create_test_manager(10);
        assert!(!manager.is_shutting_down());
        manager.shutdown().await;
        assert!(manager.is_shutting_down());
        manager.shutdown().await;
        assert!(manager.is_shutting_down());
    }

    #[tokio::test]
    async fn test_limit_rejects_excess_clients() {
        let manager = create_test_manager(1);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let _first = TcpStream::connect(addr).await.unwrap();
        let (stream, peer) = listener.accept().await.unwrap();
        manager.handle_connection(stream, peer).unwrap();

        let _second = TcpStream::connect(addr).await.unwrap();
        let (stream, peer) = listener.accept().await.unwrap();
        assert!(matches!(
            manager.handle_connection(stream, peer),
            Err(ConnectionError::LimitReached { .. })
        ));
        assert_eq!(manager.stats().clients().rejected, 1);
        assert_eq!(manager.stats_snapshot().clients.accepted, 1);
    }

    #[tokio::test]
    async fn test_accept_loop_serves_clients() {
        let manager = Arc::new(create_test_manager(4));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(run_accept_loop(listener, Arc::clone(&manager)));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"GET http://ads.example/banner.png HTTP/1.1\r\nHost: ads.example\r\n\r\n")
            .await
            .unwrap();
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        assert!(out.starts_with(b"HTTP/1.1 200 OK\r\n"));
        assert!(out.ends_with(b";"));

        manager.shutdown().await;
        accept.abort();
    }
}
