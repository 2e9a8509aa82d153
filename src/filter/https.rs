//! Site-list driven filters: HTTPS upgrade, TLS interception, CRLF decoys

use async_trait::async_trait;
use tracing::debug;

use super::{DirectOptions, Filter, FilterAction, MockResponse, SiteList, Session};
use crate::http::{Request, Scheme};

/// Redirect plain HTTP requests for listed sites to HTTPS
#[derive(Debug)]
pub struct ForceHttpsFilter {
    sites: SiteList,
}

impl ForceHttpsFilter {
    /// Upgrade requests whose host matches `sites`
    #[must_use]
    pub const fn new(sites: SiteList) -> Self {
        Self { sites }
    }
}

#[async_trait]
impl Filter for ForceHttpsFilter {
    fn name(&self) -> &'static str {
        "force_https"
    }

    async fn filter(&self, req: &mut Request, _session: &mut Session) -> Option<FilterAction> {
        if req.is_connect() || !self.sites.matches(&req.host) {
            return None;
        }
        let secure_referer = req.headers.get("Referer").is_some_and(|r| r.starts_with("https://"));
        if secure_referer || req.path.starts_with("https://") {
            return None;
        }
        let location = req.path.replacen("http://", "https://", 1);
        debug!(host = %req.host, %location, "forcing https");
        Some(FilterAction::Mock(
            MockResponse::new(301)
                .header("Location", location)
                .header("Content-Length", "0"),
        ))
    }
}

/// Intercept CONNECT tunnels to listed sites
#[derive(Debug)]
pub struct FakeHttpsFilter {
    sites: SiteList,
}

impl FakeHttpsFilter {
    /// Strip TLS for CONNECT requests whose host matches `sites`
    #[must_use]
    pub const fn new(sites: SiteList) -> Self {
        Self { sites }
    }
}

#[async_trait]
impl Filter for FakeHttpsFilter {
    fn name(&self) -> &'static str {
        "fake_https"
    }

    async fn filter(&self, req: &mut Request, _session: &mut Session) -> Option<FilterAction> {
        (req.is_connect() && self.sites.matches(&req.host)).then_some(FilterAction::Strip)
    }
}

/// Send plain HTTP requests for listed sites behind decoy requests
#[derive(Debug)]
pub struct CrlfSitesFilter {
    sites: SiteList,
}

impl CrlfSitesFilter {
    /// Enable decoys for hosts matching `sites`
    #[must_use]
    pub const fn new(sites: SiteList) -> Self {
        Self { sites }
    }
}

#[async_trait]
impl Filter for CrlfSitesFilter {
    fn name(&self) -> &'static str {
        "crlf_sites"
    }

    async fn filter(&self, req: &mut Request, _session: &mut Session) -> Option<FilterAction> {
        if req.is_connect() || req.scheme == Scheme::Https || !self.sites.matches(&req.host) {
            return None;
        }
        Some(FilterAction::Direct(DirectOptions {
            crlf: true,
            ..DirectOptions::default()
        }))
    }
}
