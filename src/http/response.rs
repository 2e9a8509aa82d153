//! Upstream response heads and client-facing head serialization

use super::headers::{quote_disposition, split_set_cookie, title_case, Headers};
use super::request::MAX_HEADERS;
use crate::error::ConnectionError;

/// Parsed status line and headers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    /// Status code
    pub status: u16,
    /// Reason phrase as sent
    pub reason: String,
    /// Minor HTTP version
    pub version: u8,
    /// Header fields
    pub headers: Headers,
}

impl ResponseHead {
    /// Whether the upstream asked to close the connection
    #[must_use]
    pub fn wants_close(&self) -> bool {
        self.headers.has_token("Connection", "close")
            || (self.version == 0 && !self.headers.has_token("Connection", "keep-alive"))
    }
}

/// Parse a response head from `buf`
///
/// Returns `Ok(None)` while the head is incomplete.
///
/// # Errors
///
/// `ConnectionError::BadResponse` for malformed heads.
pub fn parse_response_head(buf: &[u8]) -> Result<Option<(ResponseHead, usize)>, ConnectionError> {
    let mut fields = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut fields);
    let consumed = match resp.parse(buf) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => return Err(ConnectionError::bad_response(e.to_string())),
    };

    let headers = resp
        .headers
        .iter()
        .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).into_owned()))
        .collect();

    Ok(Some((
        ResponseHead {
            status: resp.code.unwrap_or(200),
            reason: resp.reason.unwrap_or_default().to_string(),
            version: resp.version.unwrap_or(1),
            headers,
        },
        consumed,
    )))
}

/// Standard reason phrase for `status`
#[must_use]
pub const fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        413 => "Payload Too Large",
        416 => "Range Not Satisfiable",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}

/// Serialize a status line and headers for the client
///
/// Names are title-cased, folded `Set-Cookie` values are split into one
/// field per cookie and bare `Content-Disposition` filenames are quoted.
#[must_use]
pub fn write_response_head(status: u16, headers: &Headers) -> Vec<u8> {
    let mut out = format!("HTTP/1.1 {status} {}\r\n", reason_phrase(status));
    for (name, value) in headers.iter() {
        let name = title_case(name);
        match name.as_str() {
            "Set-Cookie" => {
                for cookie in split_set_cookie(value) {
                    out.push_str(&format!("Set-Cookie: {cookie}\r\n"));
                }
            }
            "Content-Disposition" => {
                out.push_str(&format!("Content-Disposition: {}\r\n", quote_disposition(value)));
            }
            _ => out.push_str(&format!("{name}: {value}\r\n")),
        }
    }
    out.push_str("\r\n");
    out.into_bytes()
}
