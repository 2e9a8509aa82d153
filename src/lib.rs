//! racing-proxy: local HTTP(S) proxy with connection racing
//!
//! Every upstream connection is raced across several addresses of the
//! origin at once. The fastest live socket wins, per-address quality is
//! remembered, and warm losers are cached for the next request. A filter
//! chain decides per request whether to forward, answer locally or
//! intercept TLS.
//!
//! # Architecture
//!
//! ```text
//! Client → ProxyHandler → FilterChain → Plugin (direct / mock / strip)
//!                                          ↓
//!                              ConnectionRacer (tcp / tls)
//!                                ↓               ↓
//!                          DnsResolver   AddressQualityTracker
//!                                          ConnectionCache
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use racing_proxy::config::load_config;
//! use racing_proxy::connection::{run_accept_loop, ConnectionManager, ProxyHandler};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = load_config("config.json")?;
//! let handler = Arc::new(ProxyHandler::from_config(&config)?);
//! let manager = Arc::new(ConnectionManager::new(&config.connection, handler));
//! let listener = tokio::net::TcpListener::bind(config.listen.address).await?;
//! run_accept_loop(listener, manager).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`config`]: Configuration types and loading
//! - [`connection`]: Accept loop, per-client request loop, statistics
//! - [`dns`]: Upstream resolution with poisoned-answer filtering
//! - [`error`]: Error types
//! - [`filter`]: Request filters and the dispatching chain
//! - [`http`]: HTTP/1.x heads and bodies
//! - [`io`]: Relay, replay and boxed stream utilities
//! - [`plugin`]: Direct, mock and TLS-strip plugins
//! - [`racer`]: Connection racing, address quality and socket cache
//! - [`sniff`]: TLS ClientHello sniffing

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod config;
pub mod connection;
pub mod dns;
pub mod error;
pub mod filter;
pub mod http;
pub mod io;
pub mod plugin;
pub mod racer;
pub mod sniff;

// Re-export commonly used types at the crate root
pub use config::{Config, ListenConfig};
pub use connection::{ConnectionManager, ProxyHandler, ProxyStats};
pub use dns::{DnsResolver, Resolve};
pub use error::{CertError, ConfigError, ConnectionError, DialError, FilterError, ProxyError};
pub use filter::{Filter, FilterAction, FilterChain};
pub use racer::{ConnectionRacer, Connector};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
