//! Range header injection for large downloads

use async_trait::async_trait;
use regex::Regex;
use tracing::info;

use super::{compile_globs, Filter, FilterAction, Session};
use crate::error::FilterError;
use crate::http::{path_and_query, Request};

/// Cap per-request transfer size with a `Range` header
///
/// Requests to matching hosts or paths get `bytes=0-(max_size-1)`; an
/// existing `bytes=N-` range is always clamped to `max_size` bytes.
/// The filter never ends the chain.
#[derive(Debug)]
pub struct AutoRangeFilter {
    hosts: Option<Regex>,
    endswith: Vec<String>,
    noendswith: Vec<String>,
    max_size: u64,
}

impl AutoRangeFilter {
    /// Build from host globs and path suffix lists
    ///
    /// # Errors
    ///
    /// `FilterError::InvalidPattern` if a glob does not compile.
    pub fn new(hosts: &[String], endswith: &[String], noendswith: &[String], max_size: u64) -> Result<Self, FilterError> {
        Ok(Self {
            hosts: compile_globs(hosts)?,
            endswith: endswith.to_vec(),
            noendswith: noendswith.to_vec(),
            max_size: max_size.max(1),
        })
    }

    fn range_start(value: &str) -> u64 {
        value
            .trim()
            .strip_prefix("bytes=")
            .and_then(|spec| spec.split('-').next())
            .and_then(|start| start.trim().parse().ok())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Filter for AutoRangeFilter {
    fn name(&self) -> &'static str {
        "auto_range"
    }

    async fn filter(&self, req: &mut Request, _session: &mut Session) -> Option<FilterAction> {
        if req.is_connect() {
            return None;
        }
        let (path, query) = path_and_query(&req.path);
        if self.noendswith.iter().any(|s| path.ends_with(s.as_str()))
            || query.contains("range=")
            || req.method.eq_ignore_ascii_case("HEAD")
        {
            return None;
        }
        let need = self.hosts.as_ref().is_some_and(|re| re.is_match(&req.host))
            || self.endswith.iter().any(|s| path.ends_with(s.as_str()));

        let range = match req.headers.get("Range") {
            Some(existing) => {
                let start = Self::range_start(existing);
                format!("bytes={start}-{}", start.saturating_add(self.max_size.saturating_sub(1)))
            }
            None if need => format!("bytes=0-{}", self.max_size.saturating_sub(1)),
            None => return None,
        };
        info!(url = %req.path, %range, "auto range");
        req.headers.set("Range", range);
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::testing::{request, session};

    fn filter() -> AutoRangeFilter {
        AutoRangeFilter::new(
            &["*.c.youtube.com".into()],
            &[".mp4".into()],
            &[".html".into()],
            1024 * 1024,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_injects_range_for_matching_host() {
        let mut req = request("GET", "http://r3.c.youtube.com/videoplayback?id=1", &[]);
        assert!(filter().filter(&mut req, &mut session()).await.is_none());
        assert_eq!(req.headers.get("Range"), Some("bytes=0-1048575"));
    }

    #[tokio::test]
    async fn test_injects_range_for_suffix() {
        let mut req = request("GET", "http://example.com/movie.mp4", &[]);
        filter().filter(&mut req, &mut session()).await;
        assert_eq!(req.headers.get("Range"), Some("bytes=0-1048575"));
    }

    #[tokio::test]
    async fn test_clamps_existing_range() {
        let mut req = request("GET", "http://example.com/data.bin", &[("Range", "bytes=2048-")]);
        filter().filter(&mut req, &mut session()).await;
        assert_eq!(req.headers.get("Range"), Some("bytes=2048-1050623"));
    }

    #[tokio::test]
    async fn test_clamp_saturates_at_max_offset() {
        let mut req = request(
            "GET",
            "http://example.com/data.bin",
            &[("Range", "bytes=18446744073709551615-")],
        );
        assert!(filter().filter(&mut req, &mut session()).await.is_none());
        assert_eq!(
            req.headers.get("Range"),
            Some("bytes=18446744073709551615-18446744073709551615")
        );
    }

    #[tokio::test]
    async fn test_skips() {
        let f = filter();
        let mut page = request("GET", "http://r3.c.youtube.com/watch.html", &[]);
        f.filter(&mut page, &mut session()).await;
        assert!(page.headers.get("Range").is_none());

        let mut ranged = request("GET", "http://r3.c.youtube.com/videoplayback?range=0-100", &[]);
        f.filter(&mut ranged, &mut session()).await;
        assert!(ranged.headers.get("Range").is_none());

        let mut head = request("HEAD", "http://example.com/movie.mp4", &[]);
        f.filter(&mut head, &mut session()).await;
        assert!(head.headers.get("Range").is_none());

        let mut plain = request("GET", "http://example.com/index", &[]);
        f.filter(&mut plain, &mut session()).await;
        assert!(plain.headers.get("Range").is_none());
    }
}
