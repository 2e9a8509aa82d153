//! Ordered filter dispatch

use tracing::{debug, trace};

use super::{
    AuthFilter, AutoRangeFilter, BlackholeFilter, CrlfSitesFilter, FakeHttpsFilter, Filter, FilterAction,
    ForceHttpsFilter, MitmFilter, Session, SimpleFilter, SiteList, StaticFileFilter, UrlRewriteFilter,
    UserAgentFilter,
};
use crate::config::FilterConfig;
use crate::error::FilterError;
use crate::http::Request;

/// The configured filters, consulted in order
#[derive(Debug, Default)]
pub struct FilterChain {
    filters: Vec<Box<dyn Filter>>,
}

impl FilterChain {
    /// Chain over already-built filters
    #[must_use]
    pub fn new(filters: Vec<Box<dyn Filter>>) -> Self {
        Self { filters }
    }

    /// Compile the configured chain
    ///
    /// An empty configuration yields a single [`SimpleFilter`].
    ///
    /// # Errors
    ///
    /// `FilterError::InvalidPattern` for a rule whose regex or glob does not
    /// compile.
    pub fn from_config(configs: &[FilterConfig]) -> Result<Self, FilterError> {
        if configs.is_empty() {
            return Ok(Self::new(vec![Box::new(SimpleFilter) as Box<dyn Filter>]));
        }
        let filters = configs.iter().map(build).collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(filters))
    }

    /// Number of filters
    #[must_use]
    pub fn len(&self) -> usize {
        self.filters.len()
    }

    /// Whether the chain has no filters
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Filter names in order
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.filters.iter().map(|f| f.name())
    }

    /// Run `req` through the chain; the first action wins
    ///
    /// # Errors
    ///
    /// `FilterError::NoMatch` if every filter declined.
    pub async fn dispatch(&self, req: &mut Request, session: &mut Session) -> Result<FilterAction, FilterError> {
        for filter in &self.filters {
            trace!(filter = filter.name(), host = %req.host, "consulting filter");
            if let Some(action) = filter.filter(req, session).await {
                debug!(
                    filter = filter.name(),
                    plugin = action.plugin(),
                    method = %req.method,
                    host = %req.host,
                    port = req.port,
                    "filter matched"
                );
                return Ok(action);
            }
        }
        Err(FilterError::NoMatch)
    }
}

fn build(config: &FilterConfig) -> Result<Box<dyn Filter>, FilterError> {
    let filter: Box<dyn Filter> = match config {
        FilterConfig::Auth {
            username,
            password,
            whitelist,
        } => Box::new(AuthFilter::new(username, password, whitelist.iter().copied())),
        FilterConfig::UserAgent { user_agent } => Box::new(UserAgentFilter::new(user_agent)),
        FilterConfig::ForceHttps { sites, exclude } => Box::new(ForceHttpsFilter::new(SiteList::new(sites, exclude))),
        FilterConfig::FakeHttps { sites, exclude } => Box::new(FakeHttpsFilter::new(SiteList::new(sites, exclude))),
        FilterConfig::CrlfSites { sites, exclude } => Box::new(CrlfSitesFilter::new(SiteList::new(sites, exclude))),
        FilterConfig::UrlRewrite {
            rules,
            force_https_sites,
            force_https_exclude,
        } => Box::new(UrlRewriteFilter::new(
            rules,
            SiteList::new(force_https_sites, force_https_exclude),
        )?),
        FilterConfig::AutoRange {
            hosts,
            endswith,
            noendswith,
            max_size,
        } => Box::new(AutoRangeFilter::new(hosts, endswith, noendswith, *max_size)?),
        FilterConfig::StaticFile { root } => Box::new(StaticFileFilter::new(root.clone())),
        FilterConfig::Blackhole => Box::new(BlackholeFilter),
        FilterConfig::Simple => Box::new(SimpleFilter),
        FilterConfig::Mitm => Box::new(MitmFilter),
    };
    Ok(filter)
}
