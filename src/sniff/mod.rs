//! Passive TLS ClientHello sniffing
//!
//! Used to recognise TLS on a port that is not TLS-wrapped and to learn
//! the SNI host of a CONNECT tunnel before dialing upstream.
//!
//! # Example
//!
//! ```
//! use racing_proxy::sniff::{build_client_hello, extract_sni, is_client_hello};
//!
//! let data = build_client_hello("example.com", &[]);
//! if is_client_hello(&data) {
//!     assert_eq!(extract_sni(&data).as_deref(), Some("example.com"));
//! }
//! ```

mod hello;
mod tls;

pub use hello::{extract_sni, is_client_hello};
pub use tls::{build_client_hello, looks_like_tls, sniff_tls, sniff_tls_sni, TlsSniffResult};

/// SNI of a complete ClientHello, preferring the full parser
#[must_use]
pub fn server_name(data: &[u8]) -> Option<String> {
    sniff_tls_sni(data).or_else(|| extract_sni(data))
}
