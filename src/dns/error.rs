//! Error types for upstream name resolution
//!
//! # Error Categories
//!
//! - **Parse/Serialize errors**: DNS message encoding/decoding failures
//! - **Network errors**: Socket I/O towards an upstream server
//! - **Timeouts**: A query budget ran out
//! - **No data**: Every upstream was tried and none returned a clean answer
//!
//! # Example
//!
//! ```
//! use racing_proxy::dns::DnsError;
//!
//! let err = DnsError::timeout("query to 8.8.8.8:53", std::time::Duration::from_secs(2));
//! assert!(err.is_recoverable());
//! assert!(err.to_string().contains("timed out"));
//! ```

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Error types for DNS operations
#[derive(Debug, Error)]
pub enum DnsError {
    /// DNS message parsing failed
    #[error("Failed to parse DNS message: {reason}")]
    ParseError {
        /// Description of what went wrong during parsing
        reason: String,
    },

    /// DNS message serialization failed
    #[error("Failed to serialize DNS message: {reason}")]
    SerializeError {
        /// Description of what went wrong during serialization
        reason: String,
    },

    /// The hostname is not a valid DNS name
    #[error("Invalid host name {name:?}: {reason}")]
    InvalidName {
        /// The rejected name
        name: String,
        /// Why it was rejected
        reason: String,
    },

    /// Network I/O error
    #[error("Network error: {reason}")]
    NetworkError {
        /// Description of the network failure
        reason: String,
        /// The underlying I/O error, if available
        #[source]
        source: Option<io::Error>,
    },

    /// Query timeout
    #[error("DNS query timed out after {timeout:?}: {context}")]
    TimeoutError {
        /// Description of what timed out
        context: String,
        /// The timeout duration that was exceeded
        timeout: Duration,
    },

    /// A reply contained blacklisted addresses
    #[error("Poisoned reply from {server}: {ips:?}")]
    Poisoned {
        /// The server that sent the reply
        server: String,
        /// The addresses it claimed
        ips: Vec<std::net::IpAddr>,
    },

    /// No upstream produced a usable answer
    ///
    /// Raised after both the UDP rounds and the TCP fallback have been
    /// exhausted. This is the `EAI_NODATA` of the system resolver.
    #[error("getaddrinfo {host:?} from {servers:?} failed")]
    NoData {
        /// The hostname that was queried
        host: String,
        /// The servers that were asked
        servers: Vec<String>,
    },
}

impl DnsError {
    /// Create a parse error
    pub fn parse(reason: impl Into<String>) -> Self {
        Self::ParseError {
            reason: reason.into(),
        }
    }

    /// Create a serialization error
    pub fn serialize(reason: impl Into<String>) -> Self {
        Self::SerializeError {
            reason: reason.into(),
        }
    }

    /// Create an invalid name error
    pub fn invalid_name(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidName {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create a network error wrapping an I/O error
    pub fn network_io(reason: impl Into<String>, source: io::Error) -> Self {
        Self::NetworkError {
            reason: reason.into(),
            source: Some(source),
        }
    }

    /// Create a timeout error
    pub fn timeout(context: impl Into<String>, timeout: Duration) -> Self {
        Self::TimeoutError {
            context: context.into(),
            timeout,
        }
    }

    /// Create a no-data error
    pub fn no_data(host: impl Into<String>, servers: &[String]) -> Self {
        Self::NoData {
            host: host.into(),
            servers: servers.to_vec(),
        }
    }

    /// Create a poisoned-reply error
    pub fn poisoned(server: impl Into<String>, ips: Vec<std::net::IpAddr>) -> Self {
        Self::Poisoned {
            server: server.into(),
            ips,
        }
    }

    /// Check if this error is recoverable
    ///
    /// Network failures and timeouts may succeed on a later attempt. A
    /// malformed name never will. `NoData` is final for this lookup, but a
    /// later lookup may still succeed once a poisoned answer stops.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::NetworkError { .. }
            | Self::TimeoutError { .. }
            | Self::Poisoned { .. }
            | Self::NoData { .. } => true,
            Self::ParseError { .. } | Self::SerializeError { .. } | Self::InvalidName { .. } => {
                false
            }
        }
    }

    /// Check if this is a timeout error
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimeoutError { .. })
    }
}

/// Result type alias for DNS operations
pub type DnsResult<T> = std::result::Result<T, DnsError>;
