//! Request filter chain
//!
//! Every parsed request is offered to an ordered list of [`Filter`]s. A
//! filter either declines (`None`), possibly after adjusting the request,
//! or returns the [`FilterAction`] that decides which plugin services it.
//! The first action wins and later filters are not consulted.
//!
//! # Example
//!
//! ```no_run
//! use racing_proxy::config::FilterConfig;
//! use racing_proxy::filter::FilterChain;
//!
//! let chain = FilterChain::from_config(&[
//!     FilterConfig::Blackhole,
//! ]).unwrap();
//! assert_eq!(chain.len(), 1);
//! ```

mod auth;
mod blackhole;
mod chain;
mod https;
mod pattern;
mod range;
mod rewrite;
mod simple;
mod static_file;

use std::fmt::Debug;
use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;

use crate::http::{Headers, Request};

pub use auth::{AuthFilter, UserAgentFilter};
pub use blackhole::BlackholeFilter;
pub use chain::FilterChain;
pub use https::{CrlfSitesFilter, FakeHttpsFilter, ForceHttpsFilter};
pub use pattern::{compile_globs, glob_to_regex, SiteList};
pub use range::AutoRangeFilter;
pub use rewrite::UrlRewriteFilter;
pub use simple::{MitmFilter, SimpleFilter};
pub use static_file::{guess_content_type, StaticFileFilter};

/// Per-client-connection state visible to filters
#[derive(Debug, Clone)]
pub struct Session {
    /// Client address
    pub client: SocketAddr,
    /// `Proxy-Authorization` value that already passed
    pub auth: Option<String>,
}

impl Session {
    /// Fresh session for `client`
    #[must_use]
    pub const fn new(client: SocketAddr) -> Self {
        Self { client, auth: None }
    }
}

/// Options for the direct plugin
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectOptions {
    /// Send decoy requests ahead of the real one
    pub crlf: bool,
    /// Connection cache key for upstream reuse
    pub cache_key: Option<String>,
    /// Probe the origin with a HEAD request after the handshake
    pub headfirst: bool,
    /// Verify the origin certificate
    pub validate: bool,
}

/// A canned response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockResponse {
    /// Status code
    pub status: u16,
    /// Header fields
    pub headers: Headers,
    /// Body
    pub body: Bytes,
}

impl MockResponse {
    /// Empty response with `status`
    #[must_use]
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    /// Add a header field
    #[must_use]
    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Set the body
    #[must_use]
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }
}

/// Which plugin services a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterAction {
    /// Forward to the origin through the connection racer
    Direct(DirectOptions),
    /// Terminate TLS locally and handle the decrypted requests
    Strip,
    /// Answer locally
    Mock(MockResponse),
}

impl FilterAction {
    /// Direct forwarding with default options
    #[must_use]
    pub fn direct() -> Self {
        Self::Direct(DirectOptions::default())
    }

    /// Plugin name as logged
    #[must_use]
    pub const fn plugin(&self) -> &'static str {
        match self {
            Self::Direct(_) => "direct",
            Self::Strip => "strip",
            Self::Mock(_) => "mock",
        }
    }
}

/// A request predicate in the chain
#[async_trait]
pub trait Filter: Send + Sync + Debug {
    /// Name used in logs
    fn name(&self) -> &'static str;

    /// Inspect or adjust `req`; `Some` ends the chain
    async fn filter(&self, req: &mut Request, session: &mut Session) -> Option<FilterAction>;
}
