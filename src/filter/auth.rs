//! Proxy authentication and request header overrides

use std::collections::HashSet;
use std::net::IpAddr;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tracing::debug;

use super::{Filter, FilterAction, MockResponse, Session};
use crate::http::Request;

/// Basic proxy authentication
///
/// Whitelisted client addresses pass unchallenged. A credential that
/// passed once is remembered on the session, so requests inside a stripped
/// tunnel do not need to repeat it.
#[derive(Debug)]
pub struct AuthFilter {
    username: String,
    password: String,
    whitelist: HashSet<IpAddr>,
}

impl AuthFilter {
    /// Require `username`/`password` from clients outside `whitelist`
    pub fn new(username: impl Into<String>, password: impl Into<String>, whitelist: impl IntoIterator<Item = IpAddr>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            whitelist: whitelist.into_iter().collect(),
        }
    }

    fn check(&self, header: &str) -> bool {
        let Some((scheme, token)) = header.trim().split_once(' ') else {
            return false;
        };
        if !scheme.eq_ignore_ascii_case("basic") {
            return false;
        }
        let Ok(decoded) = STANDARD.decode(token.trim()) else {
            return false;
        };
        let Ok(decoded) = String::from_utf8(decoded) else {
            return false;
        };
        decoded
            .split_once(':')
            .is_some_and(|(user, pass)| user == self.username && pass == self.password)
    }

    fn challenge() -> FilterAction {
        FilterAction::Mock(
            MockResponse::new(407)
                .header("Access-Control-Allow-Origin", "*")
                .header("Proxy-Authenticate", "Basic realm=\"Proxy authentication required\"")
                .header("Content-Length", "0")
                .header("Connection", "keep-alive"),
        )
    }
}

#[async_trait]
impl Filter for AuthFilter {
    fn name(&self) -> &'static str {
        "auth"
    }

    async fn filter(&self, req: &mut Request, session: &mut Session) -> Option<FilterAction> {
        if self.whitelist.contains(&session.client.ip()) {
            return None;
        }
        let header = req
            .headers
            .get("Proxy-Authorization")
            .map(str::to_string)
            .or_else(|| session.auth.clone());
        match header {
            Some(value) if self.check(&value) => {
                session.auth = Some(value);
                None
            }
            _ => {
                debug!(client = %session.client, host = %req.host, "proxy authentication required");
                Some(Self::challenge())
            }
        }
    }
}

/// Overwrite the `User-Agent` of every request
#[derive(Debug)]
pub struct UserAgentFilter {
    user_agent: String,
}

impl UserAgentFilter {
    /// Replace the header with `user_agent`
    pub fn new(user_agent: impl Into<String>) -> Self {
        Self {
            user_agent: user_agent.into(),
        }
    }
}

#[async_trait]
impl Filter for UserAgentFilter {
    fn name(&self) -> &'static str {
        "user_agent"
    }

    async fn filter(&self, req: &mut Request, _session: &mut Session) -> Option<FilterAction> {
        req.headers.set("User-Agent", self.user_agent.clone());
        None
    }
}
