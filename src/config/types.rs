//! Configuration types for racing-proxy
//!
//! This module defines all configuration structures used by the proxy.
//! Configuration is loaded from JSON files and validated at startup.

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Local listener
    #[serde(default)]
    pub listen: ListenConfig,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,

    /// Client connection limits
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Upstream name resolution
    #[serde(default)]
    pub dns: DnsConfig,

    /// Connection racer tuning
    #[serde(default)]
    pub racer: RacerConfig,

    /// Direct fetch plugin timeouts
    #[serde(default)]
    pub direct: DirectConfig,

    /// Certificates used for TLS interception
    #[serde(default)]
    pub certs: CertConfig,

    /// Ordered filter chain
    #[serde(default)]
    pub filters: Vec<FilterConfig>,
}

impl Config {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen.validate()?;
        self.connection.validate()?;
        self.dns.validate()?;
        self.racer.validate()?;
        self.direct.validate()?;

        for filter in &self.filters {
            filter.validate()?;
        }

        Ok(())
    }

    /// Create a minimal default configuration
    #[must_use]
    pub fn default_config() -> Self {
        Self {
            filters: vec![FilterConfig::Simple],
            ..Self::default()
        }
    }
}

/// Local listener configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListenConfig {
    /// Listen address (e.g., "127.0.0.1:8087")
    #[serde(default = "default_listen_address")]
    pub address: SocketAddr,

    /// Detect TLS ClientHellos on the plain port and terminate them locally
    #[serde(default)]
    pub transparent_tls: bool,

    /// How long to wait for the first client bytes when probing for TLS
    #[serde(default = "default_sniff_timeout_ms")]
    pub sniff_timeout_ms: u64,

    /// Certificate host used when a ClientHello carries no SNI
    #[serde(default = "default_server_name")]
    pub default_server_name: String,
}

impl ListenConfig {
    /// Validate listen configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_server_name.is_empty() {
            return Err(ConfigError::validation(
                "listen.default_server_name cannot be empty",
            ));
        }
        Ok(())
    }

    /// Get sniff timeout as Duration
    #[must_use]
    pub const fn sniff_timeout(&self) -> Duration {
        Duration::from_millis(self.sniff_timeout_ms)
    }
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            address: default_listen_address(),
            transparent_tls: false,
            sniff_timeout_ms: default_sniff_timeout_ms(),
            default_server_name: default_server_name(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: "json" or "pretty"
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Include timestamps
    #[serde(default = "default_true")]
    pub timestamps: bool,

    /// Include target (module path)
    #[serde(default)]
    pub target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            timestamps: true,
            target: false,
        }
    }
}

/// Client connection limits
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectionConfig {
    /// Maximum concurrent client connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Buffer size for tunnel relays
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Graceful shutdown drain timeout in seconds
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
}

impl ConnectionConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::validation(
                "connection.max_connections must be greater than 0",
            ));
        }
        if self.buffer_size < 1024 {
            return Err(ConfigError::validation(
                "connection.buffer_size must be at least 1024",
            ));
        }
        Ok(())
    }

    /// Get drain timeout as Duration
    #[must_use]
    pub const fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            buffer_size: default_buffer_size(),
            drain_timeout_secs: default_drain_timeout_secs(),
        }
    }
}

/// DNS resolver configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DnsConfig {
    /// Upstream servers ("8.8.8.8", "8.8.8.8:53", "[2001:4860:4860::8888]:53").
    /// Empty means use the system resolver.
    #[serde(default = "default_dns_servers")]
    pub servers: Vec<String>,

    /// Poisoned answers: exact IPs, or prefixes when the entry ends with '.'
    #[serde(default)]
    pub blacklist: Vec<String>,

    /// Servers whose error replies are accepted as final
    #[serde(default)]
    pub trusted_servers: Vec<IpAddr>,

    /// Overall UDP budget in milliseconds (also the TCP fallback timeout)
    #[serde(default = "default_dns_timeout_ms")]
    pub timeout_ms: u64,

    /// UDP send rounds within the budget
    #[serde(default = "default_udp_attempts")]
    pub udp_attempts: usize,

    /// Hostname cache capacity
    #[serde(default = "default_dns_cache_size")]
    pub cache_size: u64,

    /// Apply the Google Public DNS query mangling for 8.8.8.8 / 8.8.4.4
    #[serde(default)]
    pub google_query_transform: bool,
}

impl DnsConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        for server in &self.servers {
            if crate::dns::parse_server_addr(server).is_none() {
                return Err(ConfigError::validation(format!(
                    "Invalid DNS server address: {server}"
                )));
            }
        }
        if self.udp_attempts == 0 {
            return Err(ConfigError::validation(
                "dns.udp_attempts must be greater than 0",
            ));
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::validation(
                "dns.timeout_ms must be greater than 0",
            ));
        }
        Ok(())
    }

    /// Get DNS timeout as Duration
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            servers: default_dns_servers(),
            blacklist: Vec::new(),
            trusted_servers: Vec::new(),
            timeout_ms: default_dns_timeout_ms(),
            udp_attempts: default_udp_attempts(),
            cache_size: default_dns_cache_size(),
            google_query_transform: false,
        }
    }
}

/// Connection racer configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RacerConfig {
    /// Base racing window; each retry round widens it by one
    #[serde(default = "default_max_window")]
    pub max_window: usize,

    /// Per-address connect timeout in seconds
    #[serde(default = "default_racer_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Racing rounds per dial
    #[serde(default = "default_racer_max_retry")]
    pub max_retry: usize,

    /// Seconds before a good address may age back to unknown
    #[serde(default = "default_good_ttl_secs")]
    pub good_ttl_secs: u64,

    /// Seconds before a bad address ages back to unknown
    #[serde(default = "default_bad_ttl_secs")]
    pub bad_ttl_secs: u64,

    /// Idle sockets kept per cache key
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,

    /// Cache fast losers of plain TCP races
    #[serde(default)]
    pub tcp_cache_sock: bool,

    /// Cache fast losers of TLS races
    #[serde(default)]
    pub tls_cache_sock: bool,

    /// Return fully-read plain upstream connections to the cache
    #[serde(default)]
    pub tcp_keepalive: bool,

    /// Return fully-read TLS upstream connections to the cache
    #[serde(default)]
    pub tls_keepalive: bool,

    /// Pinned addresses: always cacheable, never aged out of the good set
    #[serde(default)]
    pub predefined_ips: Vec<IpAddr>,

    /// Certificate issuer verification for validated TLS dials
    #[serde(default)]
    pub issuer_check: IssuerCheckConfig,
}

impl RacerConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_window == 0 {
            return Err(ConfigError::validation("racer.max_window must be greater than 0"));
        }
        if self.max_retry == 0 {
            return Err(ConfigError::validation("racer.max_retry must be greater than 0"));
        }
        if self.connect_timeout_secs == 0 {
            return Err(ConfigError::validation(
                "racer.connect_timeout_secs must be greater than 0",
            ));
        }
        if self.cache_capacity == 0 {
            return Err(ConfigError::validation(
                "racer.cache_capacity must be greater than 0",
            ));
        }
        Ok(())
    }

    /// Get connect timeout as Duration
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Get good-set TTL as Duration
    #[must_use]
    pub const fn good_ttl(&self) -> Duration {
        Duration::from_secs(self.good_ttl_secs)
    }

    /// Get bad-set TTL as Duration
    #[must_use]
    pub const fn bad_ttl(&self) -> Duration {
        Duration::from_secs(self.bad_ttl_secs)
    }
}

impl Default for RacerConfig {
    fn default() -> Self {
        Self {
            max_window: default_max_window(),
            connect_timeout_secs: default_racer_connect_timeout_secs(),
            max_retry: default_racer_max_retry(),
            good_ttl_secs: default_good_ttl_secs(),
            bad_ttl_secs: default_bad_ttl_secs(),
            cache_capacity: default_cache_capacity(),
            tcp_cache_sock: false,
            tls_cache_sock: false,
            tcp_keepalive: false,
            tls_keepalive: false,
            predefined_ips: Vec::new(),
            issuer_check: IssuerCheckConfig::default(),
        }
    }
}

/// Which hosts get their certificate issuer verified, and against what
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IssuerCheckConfig {
    /// Host suffixes subject to the check
    #[serde(default = "default_issuer_suffixes")]
    pub host_suffixes: Vec<String>,

    /// Host substrings subject to the check
    #[serde(default = "default_issuer_contains")]
    pub host_contains: Vec<String>,

    /// Required issuer common-name prefix
    #[serde(default = "default_issuer_prefix")]
    pub issuer_prefix: String,
}

impl Default for IssuerCheckConfig {
    fn default() -> Self {
        Self {
            host_suffixes: default_issuer_suffixes(),
            host_contains: default_issuer_contains(),
            issuer_prefix: default_issuer_prefix(),
        }
    }
}

/// Direct fetch plugin configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DirectConfig {
    /// Connect timeout in seconds
    #[serde(default = "default_direct_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Response header read timeout in seconds
    #[serde(default = "default_direct_read_timeout_secs")]
    pub read_timeout_secs: u64,

    /// Dial attempts for CONNECT tunnels
    #[serde(default = "default_direct_max_retry")]
    pub max_retry: usize,

    /// Dial attempts for forwarded HTTP requests
    #[serde(default = "default_request_max_retry")]
    pub request_max_retry: usize,
}

impl DirectConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_retry == 0 || self.request_max_retry == 0 {
            return Err(ConfigError::validation(
                "direct.max_retry and direct.request_max_retry must be greater than 0",
            ));
        }
        Ok(())
    }

    /// Get connect timeout as Duration
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Get read timeout as Duration
    #[must_use]
    pub const fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

impl Default for DirectConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_direct_connect_timeout_secs(),
            read_timeout_secs: default_direct_read_timeout_secs(),
            max_retry: default_direct_max_retry(),
            request_max_retry: default_request_max_retry(),
        }
    }
}

/// Certificate source for TLS interception
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CertConfig {
    /// Directory holding `<host>.crt` PEM files (certificate and key)
    #[serde(default = "default_cert_path")]
    pub path: PathBuf,

    /// PEM used when no per-host file exists
    #[serde(default)]
    pub default_cert: Option<PathBuf>,
}

impl Default for CertConfig {
    fn default() -> Self {
        Self {
            path: default_cert_path(),
            default_cert: None,
        }
    }
}

/// One entry of the ordered filter chain
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FilterConfig {
    /// Basic proxy authentication
    Auth {
        username: String,
        password: String,
        #[serde(default = "default_auth_whitelist")]
        whitelist: Vec<IpAddr>,
    },
    /// Overwrite the User-Agent header
    UserAgent { user_agent: String },
    /// Redirect plain HTTP to HTTPS
    ForceHttps {
        sites: Vec<String>,
        #[serde(default)]
        exclude: Vec<String>,
    },
    /// Intercept CONNECT tunnels
    FakeHttps {
        sites: Vec<String>,
        #[serde(default)]
        exclude: Vec<String>,
    },
    /// Prefix plain HTTP requests with decoy requests
    CrlfSites {
        sites: Vec<String>,
        #[serde(default)]
        exclude: Vec<String>,
    },
    /// Regex redirects and local file substitution
    UrlRewrite {
        rules: BTreeMap<String, String>,
        #[serde(default)]
        force_https_sites: Vec<String>,
        #[serde(default)]
        force_https_exclude: Vec<String>,
    },
    /// Clamp downloads with a Range header
    AutoRange {
        #[serde(default)]
        hosts: Vec<String>,
        #[serde(default)]
        endswith: Vec<String>,
        #[serde(default)]
        noendswith: Vec<String>,
        #[serde(default = "default_autorange_maxsize")]
        max_size: u64,
    },
    /// Serve files from a local directory
    StaticFile {
        #[serde(default = "default_static_root")]
        root: PathBuf,
    },
    /// Answer everything locally
    Blackhole,
    /// Catch-all direct forward
    Simple,
    /// CONNECT is intercepted, everything else forwarded
    Mitm,
}

impl FilterConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        match self {
            Self::Auth { username, .. } if username.is_empty() => Err(ConfigError::validation(
                "auth filter requires a username",
            )),
            Self::UserAgent { user_agent } if user_agent.is_empty() => Err(
                ConfigError::validation("user_agent filter requires a value"),
            ),
            Self::AutoRange { max_size, .. } if *max_size == 0 => Err(ConfigError::validation(
                "auto_range.max_size must be greater than 0",
            )),
            _ => Ok(()),
        }
    }
}

// Default value functions for serde

fn default_listen_address() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8087))
}

const fn default_sniff_timeout_ms() -> u64 {
    300
}

fn default_server_name() -> String {
    "www.google.com".into()
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

const fn default_true() -> bool {
    true
}

const fn default_max_connections() -> usize {
    4096
}

const fn default_buffer_size() -> usize {
    256 * 1024
}

const fn default_drain_timeout_secs() -> u64 {
    5
}

fn default_dns_servers() -> Vec<String> {
    vec!["8.8.8.8".into(), "114.114.114.114".into()]
}

const fn default_dns_timeout_ms() -> u64 {
    2000
}

const fn default_udp_attempts() -> usize {
    4
}

const fn default_dns_cache_size() -> u64 {
    64 * 1024
}

const fn default_max_window() -> usize {
    4
}

const fn default_racer_connect_timeout_secs() -> u64 {
    6
}

const fn default_racer_max_retry() -> usize {
    4
}

const fn default_good_ttl_secs() -> u64 {
    4 * 60
}

const fn default_bad_ttl_secs() -> u64 {
    6 * 60
}

const fn default_cache_capacity() -> usize {
    8
}

fn default_issuer_suffixes() -> Vec<String> {
    vec![".appspot.com".into()]
}

fn default_issuer_contains() -> Vec<String> {
    vec![".google".into()]
}

fn default_issuer_prefix() -> String {
    "Google".into()
}

const fn default_direct_connect_timeout_secs() -> u64 {
    4
}

const fn default_direct_read_timeout_secs() -> u64 {
    16
}

const fn default_direct_max_retry() -> usize {
    3
}

const fn default_request_max_retry() -> usize {
    2
}

fn default_cert_path() -> PathBuf {
    PathBuf::from("certs")
}

fn default_auth_whitelist() -> Vec<IpAddr> {
    vec![IpAddr::from([127, 0, 0, 1])]
}

const fn default_autorange_maxsize() -> u64 {
    1024 * 1024
}

fn default_static_root() -> PathBuf {
    PathBuf::from(".")
}
