//! Caching resolver front-end

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use moka::sync::Cache;
use tracing::{debug, warn};

use super::{
    parse_literal_ip, resolve_over_tcp, resolve_over_udp, DnsError, DnsResult, UpstreamSettings,
};

/// Default hostname cache capacity
pub const DEFAULT_CACHE_CAPACITY: u64 = 64 * 1024;

/// Hostname to address resolution
#[async_trait]
pub trait Resolve: Send + Sync {
    /// Resolve `host` to its addresses
    async fn resolve(&self, host: &str) -> DnsResult<Vec<IpAddr>>;
}

/// Resolver over the configured upstreams, with a bounded hostname cache
///
/// Literal addresses are returned as-is. With no upstreams configured the
/// system resolver is used.
pub struct DnsResolver {
    settings: UpstreamSettings,
    cache: Cache<String, Arc<Vec<IpAddr>>>,
}

impl std::fmt::Debug for DnsResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DnsResolver")
            .field("servers", &self.settings.servers)
            .field("cached", &self.cache.entry_count())
            .finish()
    }
}

impl DnsResolver {
    /// Create a resolver with the default cache capacity
    #[must_use]
    pub fn new(settings: UpstreamSettings) -> Self {
        Self::with_capacity(settings, DEFAULT_CACHE_CAPACITY)
    }

    /// Create a resolver with an explicit cache capacity
    #[must_use]
    pub fn with_capacity(settings: UpstreamSettings, capacity: u64) -> Self {
        Self {
            settings,
            cache: Cache::new(capacity),
        }
    }

    /// Build from configuration
    ///
    /// # Errors
    ///
    /// Returns `DnsError::InvalidName` for unparseable server addresses.
    pub fn from_config(config: &crate::config::DnsConfig) -> DnsResult<Self> {
        Ok(Self::with_capacity(
            UpstreamSettings::from_config(config)?,
            config.cache_size,
        ))
    }

    /// Cached addresses for `host`, if any
    #[must_use]
    pub fn cached(&self, host: &str) -> Option<Arc<Vec<IpAddr>>> {
        self.cache.get(host)
    }

    /// Seed the cache, e.g. from a hosts mapping
    pub fn insert(&self, host: impl Into<String>, ips: Vec<IpAddr>) {
        self.cache.insert(host.into(), Arc::new(ips));
    }

    async fn lookup_uncached(&self, host: &str) -> DnsResult<Vec<IpAddr>> {
        if self.settings.servers.is_empty() {
            return lookup_system(host).await;
        }

        match resolve_over_udp(host, &self.settings).await {
            Ok(ips) => Ok(ips),
            Err(e) => {
                debug!(host, "udp resolution failed ({}), falling back to tcp", e);
                resolve_over_tcp(host, &self.settings).await
            }
        }
    }
}

#[async_trait]
impl Resolve for DnsResolver {
    async fn resolve(&self, host: &str) -> DnsResult<Vec<IpAddr>> {
        if let Some(ip) = parse_literal_ip(host) {
            return Ok(vec![ip]);
        }
        if let Some(ips) = self.cache.get(host) {
            return Ok(ips.as_ref().clone());
        }

        let ips = self.lookup_uncached(host).await?;
        if ips.is_empty() {
            warn!(host, "resolved to no addresses");
        } else {
            self.cache.insert(host.to_string(), Arc::new(ips.clone()));
        }
        Ok(ips)
    }
}

async fn lookup_system(host: &str) -> DnsResult<Vec<IpAddr>> {
    let addrs = tokio::net::lookup_host((host, 0))
        .await
        .map_err(|e| DnsError::network_io(format!("system lookup of {host}"), e))?;

    let mut ips: Vec<IpAddr> = Vec::new();
    for addr in addrs {
        if !ips.contains(&addr.ip()) {
            ips.push(addr.ip());
        }
    }
    Ok(ips)
}
