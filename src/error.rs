//! Error types for racing-proxy
//!
//! This module defines the error hierarchy for the proxy engine.
//! Errors are grouped by subsystem and carry recovery hints.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::dns::DnsError;

/// Top-level error type for racing-proxy
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Configuration errors (file parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Name resolution errors
    #[error("DNS error: {0}")]
    Dns(#[from] DnsError),

    /// Upstream dial errors
    #[error("Dial error: {0}")]
    Dial(#[from] DialError),

    /// Filter chain errors
    #[error("Filter error: {0}")]
    Filter(#[from] FilterError),

    /// Certificate provider errors
    #[error("Certificate error: {0}")]
    Cert(#[from] CertError),

    /// Client connection handling errors
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ProxyError {
    /// Check if this error is recoverable (can retry operation)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) | Self::Filter(_) | Self::Cert(_) => false,
            Self::Dns(e) => e.is_recoverable(),
            Self::Dial(e) => e.is_recoverable(),
            Self::Connection(e) => e.is_recoverable(),
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }

    /// Whether this error is an expected client/server disconnect
    #[must_use]
    pub fn is_benign(&self) -> bool {
        match self {
            Self::Io(e) | Self::Connection(ConnectionError::IoError(e)) => {
                crate::io::is_benign_disconnect(e)
            }
            _ => false,
        }
    }
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// JSON parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, missing required fields)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// Environment variable error
    #[error("Environment variable error: {name}: {reason}")]
    EnvError { name: String, reason: String },

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    /// Config errors are not recoverable without user intervention
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ValidationError(msg.into())
    }
}

/// Errors raised while establishing an upstream connection
#[derive(Debug, Error)]
pub enum DialError {
    /// TCP connect failed
    #[error("Failed to connect to {addr}: {reason}")]
    ConnectionFailed { addr: SocketAddr, reason: String },

    /// Connect, handshake or probe exceeded its deadline
    #[error("Connection to {addr} timed out after {timeout_ms}ms")]
    Timeout { addr: SocketAddr, timeout_ms: u64 },

    /// Early data was sent but the peer answered with nothing
    #[error("{addr} returned no data for the initial payload")]
    EmptyResponse { addr: SocketAddr },

    /// TLS handshake failed
    #[error("TLS handshake with {addr} failed: {reason}")]
    Handshake { addr: SocketAddr, reason: String },

    /// Peer certificate issued by an unexpected authority
    #[error("{host} certificate is issued by {issuer:?}, expected prefix {expected:?}")]
    IssuerMismatch {
        host: String,
        issuer: String,
        expected: String,
    },

    /// HEAD probe did not yield a response header
    #[error("HEAD probe to {addr} failed: {reason}")]
    HeadProbe { addr: SocketAddr, reason: String },

    /// Name resolved to no usable address
    #[error("No address to dial for {host}")]
    NoAddress { host: String },

    /// Resolution failed
    #[error("Resolve failed: {0}")]
    Resolve(#[from] DnsError),

    /// Failed to set a socket option
    #[error("Failed to set socket option {option}: {reason}")]
    SocketOption { option: String, reason: String },

    /// I/O error during connection
    #[error("Dial I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl DialError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::ConnectionFailed { .. }
            | Self::Timeout { .. }
            | Self::EmptyResponse { .. }
            | Self::Handshake { .. }
            | Self::HeadProbe { .. } => true,
            Self::IssuerMismatch { .. } | Self::NoAddress { .. } | Self::SocketOption { .. } => {
                false
            }
            Self::Resolve(e) => e.is_recoverable(),
            Self::IoError(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }

    /// Create a connection failed error
    pub fn connection_failed(addr: SocketAddr, reason: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            addr,
            reason: reason.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(addr: SocketAddr, timeout: std::time::Duration) -> Self {
        Self::Timeout {
            addr,
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Create a handshake error
    pub fn handshake(addr: SocketAddr, reason: impl Into<String>) -> Self {
        Self::Handshake {
            addr,
            reason: reason.into(),
        }
    }

    /// Create a socket option error
    pub fn socket_option(option: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SocketOption {
            option: option.into(),
            reason: reason.into(),
        }
    }
}

/// Filter configuration and dispatch errors
#[derive(Debug, Error)]
pub enum FilterError {
    /// A regex or glob failed to compile
    #[error("Invalid pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// A rule is structurally unusable
    #[error("Invalid filter rule: {0}")]
    InvalidRule(String),

    /// No filter produced an action
    #[error("No filter matched the request")]
    NoMatch,
}

impl FilterError {
    /// Create an invalid pattern error
    pub fn invalid_pattern(pattern: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPattern {
            pattern: pattern.into(),
            reason: reason.into(),
        }
    }
}

/// Certificate provider errors
#[derive(Debug, Error)]
pub enum CertError {
    /// No certificate available for the host
    #[error("No certificate for {host}")]
    NotFound { host: String },

    /// PEM content could not be used
    #[error("Invalid certificate file {path}: {reason}")]
    Invalid { path: String, reason: String },

    /// I/O error reading the certificate
    #[error("Certificate I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl CertError {
    /// Create an invalid certificate error
    pub fn invalid(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Client connection handling errors
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Connection limit reached
    #[error("Connection limit reached ({current}/{max})")]
    LimitReached { current: usize, max: usize },

    /// Connection was closed
    #[error("Connection closed: {reason}")]
    Closed { reason: String },

    /// Malformed request from the client
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Malformed response from the upstream
    #[error("Bad upstream response: {0}")]
    BadResponse(String),

    /// Server-side TLS handshake with the client failed
    #[error("Client TLS handshake failed: {0}")]
    TlsAccept(String),

    /// Shutdown in progress
    #[error("Server is shutting down")]
    ShuttingDown,

    /// I/O error
    #[error("Connection I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl ConnectionError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::LimitReached { .. } => true,
            Self::Closed { .. }
            | Self::BadRequest(_)
            | Self::BadResponse(_)
            | Self::TlsAccept(_)
            | Self::ShuttingDown => false,
            Self::IoError(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }

    /// Create a limit reached error
    pub const fn limit_reached(current: usize, max: usize) -> Self {
        Self::LimitReached { current, max }
    }

    /// Create a closed error
    pub fn closed(reason: impl Into<String>) -> Self {
        Self::Closed {
            reason: reason.into(),
        }
    }

    /// Create a bad request error
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    /// Create a bad response error
    pub fn bad_response(msg: impl Into<String>) -> Self {
        Self::BadResponse(msg.into())
    }
}

/// Type alias for Result with `ProxyError`
pub type Result<T> = std::result::Result<T, ProxyError>;
