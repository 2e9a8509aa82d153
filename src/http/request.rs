//! Client request heads and proxy target resolution

use std::fmt;

use bytes::Bytes;

use super::headers::Headers;
use crate::error::ConnectionError;

/// Maximum header fields accepted in one head
pub const MAX_HEADERS: usize = 128;

/// Scheme of the connection a request arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// Plain text
    Http,
    /// Decrypted TLS
    Https,
}

impl Scheme {
    /// Default port for the scheme
    #[must_use]
    pub const fn default_port(self) -> u16 {
        match self {
            Self::Http => 80,
            Self::Https => 443,
        }
    }

    /// Lower-case name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed request line and headers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    /// Method token
    pub method: String,
    /// Request target as sent
    pub target: String,
    /// Minor HTTP version
    pub version: u8,
    /// Header fields
    pub headers: Headers,
}

/// Parse a request head from `buf`
///
/// Returns `Ok(None)` while the head is incomplete, otherwise the head and
/// the number of bytes it occupied.
///
/// # Errors
///
/// `ConnectionError::BadRequest` for malformed heads.
pub fn parse_request_head(buf: &[u8]) -> Result<Option<(RequestHead, usize)>, ConnectionError> {
    let mut fields = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut fields);
    let consumed = match req.parse(buf) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => return Err(ConnectionError::bad_request(e.to_string())),
    };

    let headers = req
        .headers
        .iter()
        .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).into_owned()))
        .collect();

    Ok(Some((
        RequestHead {
            method: req.method.unwrap_or_default().to_string(),
            target: req.path.unwrap_or_default().to_string(),
            version: req.version.unwrap_or(1),
            headers,
        },
        consumed,
    )))
}

/// A client request with its proxy destination resolved
#[derive(Debug, Clone)]
pub struct Request {
    /// Method token
    pub method: String,
    /// Absolute URL, or `host:port` for CONNECT
    pub path: String,
    /// Minor HTTP version
    pub version: u8,
    /// Header fields
    pub headers: Headers,
    /// Buffered body
    pub body: Bytes,
    /// Destination host, brackets stripped
    pub host: String,
    /// Destination port
    pub port: u16,
    /// Scheme of the client connection
    pub scheme: Scheme,
    /// Target was sent as a bare path rather than an absolute URL
    pub origin_form: bool,
}

impl Request {
    /// Resolve the destination of `head` received over `scheme`
    ///
    /// Origin-form targets are made absolute from the `Host` header.
    ///
    /// # Errors
    ///
    /// `ConnectionError::BadRequest` for an empty target.
    pub fn from_head(head: RequestHead, scheme: Scheme) -> Result<Self, ConnectionError> {
        if head.target.is_empty() {
            return Err(ConnectionError::bad_request("empty request target"));
        }

        let is_connect = head.method.eq_ignore_ascii_case("CONNECT");
        let origin_form = !is_connect && head.target.starts_with('/');
        let (path, netloc) = if is_connect {
            (head.target.clone(), head.target.clone())
        } else if origin_form {
            let netloc = head.headers.get("Host").unwrap_or("localhost").to_string();
            (format!("{scheme}://{netloc}{}", head.target), netloc)
        } else {
            let netloc = split_url(&head.target).1.to_string();
            (head.target.clone(), netloc)
        };

        let (host, port) = split_host_port(&netloc).unwrap_or_else(|| (netloc.clone(), scheme.default_port()));

        Ok(Self {
            method: head.method,
            path,
            version: head.version,
            headers: head.headers,
            body: Bytes::new(),
            host,
            port,
            scheme,
            origin_form,
        })
    }

    /// Whether this is a CONNECT request
    #[must_use]
    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    /// Whether the client expects the connection to stay open
    #[must_use]
    pub fn keep_alive(&self) -> bool {
        if self.headers.has_token("Connection", "close") || self.headers.has_token("Proxy-Connection", "close") {
            return false;
        }
        self.version >= 1
            || self.headers.has_token("Connection", "keep-alive")
            || self.headers.has_token("Proxy-Connection", "keep-alive")
    }

    /// Request line as logged, e.g. `GET http://a/ HTTP/1.1`
    #[must_use]
    pub fn log_line(&self) -> String {
        format!("{} {} HTTP/1.{}", self.method, self.path, self.version)
    }
}

/// Split `host:port`, stripping IPv6 brackets; `None` without a numeric port
///
/// An unbracketed IPv6 literal never carries a port.
#[must_use]
pub fn split_host_port(netloc: &str) -> Option<(String, u16)> {
    let (host, port) = netloc.rsplit_once(':')?;
    if host.is_empty() || port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
        return None;
    }
    let port = port.parse().ok()?;
    Some((host.trim_matches(|c| c == '[' || c == ']').to_string(), port))
}

/// Split an absolute URL into `(scheme, netloc, path-and-query)`
///
/// The path defaults to `/` and the fragment is dropped.
#[must_use]
pub fn split_url(url: &str) -> (&str, &str, &str) {
    let (scheme, rest) = match url.find("://") {
        Some(pos) => (&url[..pos], &url[pos + 3..]),
        None => ("", url),
    };
    let end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let netloc = &rest[..end];
    let mut path = &rest[end..];
    if let Some(hash) = path.find('#') {
        path = &path[..hash];
    }
    if path.is_empty() {
        path = "/";
    }
    (scheme, netloc, path)
}

/// Host and port of a netloc for URL scheme `scheme`
///
/// A `:` after the last `]` introduces the port.
#[must_use]
pub fn netloc_host_port(netloc: &str, scheme: &str) -> (String, u16) {
    let default = if scheme.eq_ignore_ascii_case("https") { 443 } else { 80 };
    let netloc = netloc.rsplit_once('@').map_or(netloc, |(_, n)| n);
    match (netloc.rfind(':'), netloc.rfind(']')) {
        (Some(colon), None) if netloc[..colon].contains(':') => (netloc.to_string(), default),
        (Some(colon), bracket) if bracket.map_or(true, |b| colon > b) => {
            let port = netloc[colon + 1..].parse().unwrap_or(default);
            (netloc[..colon].to_string(), port)
        }
        _ => (netloc.to_string(), default),
    }
}

/// URL path without query, and the query
#[must_use]
pub fn path_and_query(url: &str) -> (&str, &str) {
    let (_, _, path) = split_url(url);
    path.split_once('?').unwrap_or((path, ""))
}

/// Percent-decode, treating `+` as space
#[must_use]
pub fn unquote_plus(s: &str) -> String {
    let spaced = s.replace('+', " ");
    urlencoding::decode(&spaced).map_or(spaced.clone(), |c| c.into_owned())
}
