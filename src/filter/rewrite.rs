//! Per-host regex redirects and local file substitution

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use bytes::Bytes;
use regex::{Captures, Regex};
use tracing::{debug, warn};

use super::{guess_content_type, Filter, FilterAction, MockResponse, Session, SiteList};
use crate::error::FilterError;
use crate::http::{netloc_host_port, split_url, unquote_plus, Request};

#[derive(Debug)]
struct RewriteRule {
    pattern: Regex,
    target: String,
}

/// Regex URL rewriting keyed by the host named in each pattern
///
/// A target may reference capture groups as `$1`..`$n` (URL-unquoted on
/// substitution). `file://` targets are answered with the file's content;
/// anything else becomes a `302` redirect.
#[derive(Debug)]
pub struct UrlRewriteFilter {
    rules: HashMap<String, Vec<RewriteRule>>,
    force_https: SiteList,
}

/// Host a rewrite pattern applies to, e.g. `www.example.com` for
/// `^https?://www\.example\.com/(.*)`
fn pattern_host(pattern: &str) -> Option<String> {
    let start = pattern.find("://")? + 3;
    let rest = &pattern[start..];
    let end = rest.find(['/', ':']).unwrap_or(rest.len());
    let host = rest[..end].replace("\\.", ".");
    (!host.is_empty()).then(|| host.to_ascii_lowercase())
}

/// Substitute `$n` markers in `target` with unquoted capture groups
fn expand(target: &str, caps: &Captures<'_>) -> String {
    let mut out = String::with_capacity(target.len());
    let mut chars = target.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        let digits_start = i + 1;
        let mut digits_end = digits_start;
        while let Some(&(j, d)) = chars.peek() {
            if !d.is_ascii_digit() {
                break;
            }
            digits_end = j + 1;
            chars.next();
        }
        if digits_end == digits_start {
            out.push('$');
            continue;
        }
        let group = target[digits_start..digits_end]
            .parse::<usize>()
            .ok()
            .and_then(|n| caps.get(n))
            .map_or_else(String::new, |m| unquote_plus(m.as_str()));
        out.push_str(&group);
    }
    out
}

impl UrlRewriteFilter {
    /// Compile `rules` (pattern → target)
    ///
    /// Patterns without a recognisable host are skipped with a warning.
    ///
    /// # Errors
    ///
    /// `FilterError::InvalidPattern` for a pattern that is not a valid regex.
    pub fn new(rules: &BTreeMap<String, String>, force_https: SiteList) -> Result<Self, FilterError> {
        let mut by_host: HashMap<String, Vec<RewriteRule>> = HashMap::new();
        for (pattern, target) in rules {
            let Some(host) = pattern_host(pattern) else {
                warn!(%pattern, "rewrite pattern names no host, skipped");
                continue;
            };
            let compiled = Regex::new(pattern).map_err(|e| FilterError::invalid_pattern(pattern, e.to_string()))?;
            by_host.entry(host).or_default().push(RewriteRule {
                pattern: compiled,
                target: target.clone(),
            });
        }
        Ok(Self {
            rules: by_host,
            force_https,
        })
    }

    /// Number of hosts with rules
    #[must_use]
    pub fn host_count(&self) -> usize {
        self.rules.len()
    }

    fn upgrade(&self, target: String) -> String {
        if !target.starts_with("http://") {
            return target;
        }
        let (scheme, netloc, _) = split_url(&target);
        let (host, _) = netloc_host_port(netloc, scheme);
        if self.force_https.matches(&host) {
            target.replacen("http://", "https://", 1)
        } else {
            target
        }
    }
}

async fn serve_file(filename: &str) -> MockResponse {
    let content = if filename == "/dev/null" || filename.eq_ignore_ascii_case("nul") {
        Ok(Vec::new())
    } else {
        tokio::fs::read(filename).await
    };
    match content {
        Ok(body) => MockResponse::new(200)
            .header("Content-Type", guess_content_type(filename))
            .header("Content-Length", body.len().to_string())
            .header("Connection", "close")
            .body(body),
        Err(e) => {
            let body = format!("read {filename:?} {e}");
            MockResponse::new(403)
                .header("Content-Length", body.len().to_string())
                .header("Connection", "close")
                .body(Bytes::from(body))
        }
    }
}

#[async_trait]
impl Filter for UrlRewriteFilter {
    fn name(&self) -> &'static str {
        "url_rewrite"
    }

    async fn filter(&self, req: &mut Request, _session: &mut Session) -> Option<FilterAction> {
        let rules = self.rules.get(&req.host.to_ascii_lowercase())?;
        let (rule, caps) = rules
            .iter()
            .find_map(|rule| rule.pattern.captures(&req.path).map(|caps| (rule, caps)))?;
        let target = expand(&rule.target, &caps);

        if let Some(filename) = target.strip_prefix("file://") {
            debug!(url = %req.path, %filename, "rewrite to local file");
            return Some(FilterAction::Mock(serve_file(filename).await));
        }

        let location = self.upgrade(target);
        debug!(url = %req.path, %location, "rewrite redirect");
        Some(FilterAction::Mock(
            MockResponse::new(302)
                .header("Location", location)
                .header("Content-Length", "0"),
        ))
    }
}
