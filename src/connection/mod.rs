//! Client connection handling
//!
//! - Connection limiting with backpressure
//! - The per-client request loop ([`ProxyHandler`])
//! - Statistics collection
//! - Graceful shutdown

mod handler;
mod manager;
mod stats;
mod tcp;

pub use handler::ProxyHandler;
pub use manager::{run_accept_loop, ConnectionManager};
pub use stats::{ClientCounts, Handled, ProxyStats, RequestCounts, StatsSnapshot};
pub use tcp::{handle_tcp_connection, spawn_tcp_handler, TcpConnectionContext, TcpConnectionResult};
