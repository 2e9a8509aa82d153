//! Catch-all filters

use async_trait::async_trait;

use super::{Filter, FilterAction, Session};
use crate::http::Request;

/// Forward everything directly
#[derive(Debug, Default)]
pub struct SimpleFilter;

#[async_trait]
impl Filter for SimpleFilter {
    fn name(&self) -> &'static str {
        "simple"
    }

    async fn filter(&self, _req: &mut Request, _session: &mut Session) -> Option<FilterAction> {
        Some(FilterAction::direct())
    }
}

/// Intercept every tunnel, forward everything else
#[derive(Debug, Default)]
pub struct MitmFilter;

#[async_trait]
impl Filter for MitmFilter {
    fn name(&self) -> &'static str {
        "mitm"
    }

    async fn filter(&self, req: &mut Request, _session: &mut Session) -> Option<FilterAction> {
        if req.is_connect() {
            Some(FilterAction::Strip)
        } else {
            Some(FilterAction::direct())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::testing::{request, session};

    #[tokio::test]
    async fn test_catch_alls() {
        let mut connect = request("CONNECT", "example.com:443", &[]);
        let mut get = request("GET", "http://example.com/", &[]);

        assert_eq!(SimpleFilter.filter(&mut connect, &mut session()).await, Some(FilterAction::direct()));
        assert_eq!(MitmFilter.filter(&mut connect, &mut session()).await, Some(FilterAction::Strip));
        assert_eq!(MitmFilter.filter(&mut get, &mut session()).await, Some(FilterAction::direct()));
    }
}
