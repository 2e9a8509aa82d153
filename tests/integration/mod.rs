//! Integration tests for racing-proxy
//!
//! # Test Organization
//!
//! - `racer_integration`: connection racing against local listeners
//! - `dns_integration`: resolver against mock UDP/TCP DNS servers
//! - `proxy_integration`: the whole proxy between a client and a mock origin
//!
//! # Test Requirements
//!
//! - Everything runs on `127.0.0.1` with mock servers
//! - Tests marked with `#[ignore]` need public internet access

pub mod dns_integration;
pub mod proxy_integration;
pub mod racer_integration;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use async_trait::async_trait;
use tokio::net::TcpListener;

use racing_proxy::dns::{DnsResult, Resolve};

/// Resolves every name to a fixed address list
pub struct StaticResolver(pub Vec<IpAddr>);

impl StaticResolver {
    pub fn loopback() -> Self {
        Self(vec![IpAddr::V4(Ipv4Addr::LOCALHOST)])
    }
}

#[async_trait]
impl Resolve for StaticResolver {
    async fn resolve(&self, _host: &str) -> DnsResult<Vec<IpAddr>> {
        Ok(self.0.clone())
    }
}

/// A loopback port nothing listens on
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}
