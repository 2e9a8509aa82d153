//! Single-endpoint dialing
//!
//! A [`Dialer`] opens one connection to one endpoint and reports how long
//! it took. The racer runs many of them concurrently.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tracing::trace;

use crate::error::DialError;

/// Receive buffer applied to every outbound socket
pub const RECV_BUFFER_SIZE: usize = 32 * 1024;

/// Reply bytes peeked after early data
const EARLY_REPLY_PEEK: usize = 4096;

/// What to dial, independent of the endpoint
#[derive(Debug, Clone, Default)]
pub struct DialTarget {
    /// Hostname, used for SNI and the issuer policy
    pub host: String,
    /// Sent right after connect; a non-empty reply is required
    pub early_data: Option<Bytes>,
    /// Verify the peer certificate chain and issuer
    pub validate: bool,
    /// Probe with a HEAD request after the handshake
    pub headfirst: bool,
}

impl DialTarget {
    /// Target with no extras
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Self::default()
        }
    }
}

/// An established connection and its timing
#[derive(Debug)]
pub struct Dialed<S> {
    /// The connection
    pub stream: S,
    /// Endpoint it was made to
    pub peer: SocketAddr,
    /// TCP connect time
    pub connect_time: Duration,
    /// Connect plus TLS handshake time, for TLS dialers
    pub handshake_time: Option<Duration>,
}

impl<S> Dialed<S> {
    /// Latency used for quality tracking
    #[must_use]
    pub fn latency(&self) -> Duration {
        self.handshake_time.unwrap_or(self.connect_time)
    }
}

/// Opens a connection to one endpoint
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    /// Connection type produced
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Dial `addr` for `target` within `timeout`
    async fn dial(
        &self,
        target: &DialTarget,
        addr: SocketAddr,
        timeout: Duration,
    ) -> Result<Dialed<Self::Stream>, DialError>;
}

/// Plain TCP dialer with racing-friendly socket options
#[derive(Debug, Clone)]
pub struct TcpDialer {
    connect_timeout: Duration,
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self::new(Duration::from_secs(6))
    }
}

impl TcpDialer {
    /// Dialer whose connect step is capped at `connect_timeout`
    #[must_use]
    pub const fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    /// Configured connect cap
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    fn create_socket(addr: SocketAddr) -> Result<Socket, DialError> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| DialError::connection_failed(addr, e.to_string()))?;

        socket
            .set_reuse_address(true)
            .map_err(|e| DialError::socket_option("SO_REUSEADDR", e.to_string()))?;
        // Close with RST so losers and dead sockets leave no TIME_WAIT behind
        socket
            .set_linger(Some(Duration::ZERO))
            .map_err(|e| DialError::socket_option("SO_LINGER", e.to_string()))?;
        socket
            .set_recv_buffer_size(RECV_BUFFER_SIZE)
            .map_err(|e| DialError::socket_option("SO_RCVBUF", e.to_string()))?;
        socket
            .set_nodelay(true)
            .map_err(|e| DialError::socket_option("TCP_NODELAY", e.to_string()))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| DialError::socket_option("O_NONBLOCK", e.to_string()))?;

        Ok(socket)
    }

    /// Connect to `addr`, returning the stream and the time taken
    ///
    /// # Errors
    ///
    /// `DialError::Timeout` when the connect exceeds `min(connect_timeout,
    /// timeout)`, `DialError::ConnectionFailed` for refusals and socket errors.
    pub async fn connect(&self, addr: SocketAddr, limit: Duration) -> Result<(TcpStream, Duration), DialError> {
        let limit = limit.min(self.connect_timeout);
        let started = Instant::now();
        let socket = Self::create_socket(addr)?;

        match socket.connect(&addr.into()) {
            Ok(()) => {}
            Err(ref e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(e) => return Err(DialError::connection_failed(addr, e.to_string())),
        }

        let std_stream: std::net::TcpStream = socket.into();
        let stream = TcpStream::from_std(std_stream)
            .map_err(|e| DialError::connection_failed(addr, e.to_string()))?;

        let connected = timeout(limit, async {
            stream
                .writable()
                .await
                .map_err(|e| DialError::connection_failed(addr, e.to_string()))?;
            match stream.take_error() {
                Ok(Some(e)) | Err(e) => Err(DialError::connection_failed(addr, e.to_string())),
                Ok(None) => Ok(()),
            }
        })
        .await;

        match connected {
            Ok(Ok(())) => {
                let elapsed = started.elapsed();
                trace!(%addr, ?elapsed, "tcp connected");
                Ok((stream, elapsed))
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(DialError::timeout(addr, limit)),
        }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    type Stream = TcpStream;

    async fn dial(
        &self,
        target: &DialTarget,
        addr: SocketAddr,
        limit: Duration,
    ) -> Result<Dialed<TcpStream>, DialError> {
        let (mut stream, connect_time) = self.connect(addr, limit).await?;

        if let Some(early) = &target.early_data {
            let budget = limit.min(self.connect_timeout);
            let probe = async {
                stream.write_all(early).await?;
                let mut buf = [0u8; EARLY_REPLY_PEEK];
                stream.peek(&mut buf).await
            };
            match timeout(budget, probe).await {
                Ok(Ok(0)) => return Err(DialError::EmptyResponse { addr }),
                Ok(Ok(n)) => trace!(%addr, n, "early data answered"),
                Ok(Err(e)) => return Err(DialError::connection_failed(addr, e.to_string())),
                Err(_) => return Err(DialError::timeout(addr, budget)),
            }
        }

        Ok(Dialed {
            stream,
            peer: addr,
            connect_time,
            handshake_time: None,
        })
    }
}
