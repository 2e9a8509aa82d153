//! TCP client connection handling
//!
//! Wraps one accepted client socket: runs the [`ProxyHandler`] request loop
//! on it, classifies how it ended and feeds the statistics.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::{broadcast, OwnedSemaphorePermit};
use tracing::{debug, info_span, warn, Instrument};

use super::handler::ProxyHandler;
use super::stats::ProxyStats;
use crate::filter::Session;
use crate::io::CopyResult;

/// Context for handling a TCP connection
pub struct TcpConnectionContext {
    /// Accepted client socket
    pub stream: TcpStream,

    /// Client address
    pub client_addr: SocketAddr,

    /// Shared request handler
    pub handler: Arc<ProxyHandler>,
}

/// Result of handling a TCP connection
#[derive(Debug)]
pub struct TcpConnectionResult {
    /// Client address
    pub client_addr: SocketAddr,
    /// Bytes relayed, when the connection ended cleanly
    pub copy_result: Option<CopyResult>,
    /// Error message if failed
    pub error: Option<String>,
}

impl TcpConnectionResult {
    /// Whether the connection ended without a real error
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Handle a client connection through the proxy
///
/// Benign disconnects (reset, broken pipe ...) count as a clean end.
pub async fn handle_tcp_connection(ctx: TcpConnectionContext) -> TcpConnectionResult {
    let client_addr = ctx.client_addr;
    if let Err(e) = ctx.stream.set_nodelay(true) {
        debug!("set_nodelay failed for {}: {}", client_addr, e);
    }

    let mut result = TcpConnectionResult {
        client_addr,
        copy_result: None,
        error: None,
    };

    match ctx.handler.handle_tcp(ctx.stream, Session::new(client_addr)).await {
        Ok(copy_result) => {
            debug!(
                "Connection closed: {}, {} up / {} down bytes",
                client_addr, copy_result.client_to_upstream, copy_result.upstream_to_client
            );
            result.copy_result = Some(copy_result);
        }
        Err(e) if e.is_benign() => {
            debug!("Client {} went away: {}", client_addr, e);
            result.copy_result = Some(CopyResult::default());
        }
        Err(e) => {
            warn!("Connection from {} failed: {}", client_addr, e);
            result.error = Some(e.to_string());
        }
    }

    result
}

/// Spawn a task to handle a TCP connection with proper instrumentation
///
/// The connection slot `permit` is held until the task ends; a shutdown
/// signal cuts the connection short and counts it as errored.
pub fn spawn_tcp_handler(
    ctx: TcpConnectionContext,
    stats: Arc<ProxyStats>,
    permit: OwnedSemaphorePermit,
    mut shutdown: broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    let client_addr = ctx.client_addr;
    let span = info_span!("client_connection", client = %client_addr);

    tokio::spawn(
        async move {
            let _permit = permit;
            tokio::select! {
                result = handle_tcp_connection(ctx) => {
                    match &result.copy_result {
                        Some(relayed) => stats.client_closed(relayed),
                        None => stats.client_failed(),
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Connection handler for {} received shutdown signal", client_addr);
                    stats.client_failed();
                }
            }
        }
        .instrument(span),
    )
}
