//! Configuration module for racing-proxy
//!
//! This module provides configuration types and loading utilities.
//!
//! # Example
//!
//! ```no_run
//! use racing_proxy::config::{load_config, Config};
//!
//! let config = load_config("/etc/racing-proxy/config.json").unwrap();
//! println!("Listening on {}", config.listen.address);
//! ```

mod loader;
mod types;

pub use loader::{
    apply_env_overrides, create_default_config, load_config, load_config_str,
    load_config_with_env,
};
pub use types::{
    CertConfig, Config, ConnectionConfig, DirectConfig, DnsConfig, FilterConfig,
    IssuerCheckConfig, ListenConfig, LogConfig, RacerConfig,
};
