//! Direct forwarding through the connection racer
//!
//! Plain requests are re-serialised and sent over a raced TCP or TLS
//! connection; the response head is rewritten for the client and the body
//! streamed back, re-chunked when the origin used a transfer encoding.
//! CONNECT tunnels race a TCP connection (carrying the client's first
//! flight as early data when it is a ClientHello) and then relay bytes.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::DirectConfig;
use crate::error::{DialError, ProxyError};
use crate::filter::{DirectOptions, Session};
use crate::http::{
    is_skipped, netloc_host_port, response_body_kind, split_url, write_response_head, BodyKind, Headers, HttpStream,
    Request, ResponseHead,
};
use crate::io::{bidirectional_copy_with_buffer, CopyResult};
use crate::racer::{ConnectionRacer, Connector, DialOptions, Dialer, RacedConnection};
use crate::sniff::is_client_hello;

/// Bytes read from the client before dialing a tunnel
const FIRST_FLIGHT_SIZE: usize = 1024;

/// Decoy requests sent ahead of a CRLF request, at least
const DECOY_MIN_COUNT: usize = 5;

/// Decoy padding, at least
const DECOY_MIN_BYTES: usize = 3000;

const DECOY_DEFAULT_HEADERS: [(&str, &str); 3] = [
    (
        "User-Agent",
        "Mozilla/5.0 (Windows NT 6.1; WOW64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/35.0.1878.0 Safari/537.36",
    ),
    ("Accept-Language", "zh-CN,zh;q=0.8,en-US;q=0.6,en;q=0.4"),
    (
        "Accept",
        "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8",
    ),
];

/// A request prepared for the origin
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    /// Absolute URL as logged
    pub url: String,
    /// Origin host, brackets stripped
    pub host: String,
    /// Origin port
    pub port: u16,
    /// Whether the origin speaks TLS
    pub https: bool,
    /// Serialized request, decoys included
    pub wire: Vec<u8>,
    /// Decoy responses to discard before the real one
    pub decoys: usize,
}

impl UpstreamRequest {
    /// Prepare `req` for sending
    #[must_use]
    pub fn new(req: &Request, crlf: bool) -> Self {
        let lower = req.path.to_ascii_lowercase();
        let url = if ["http://", "https://", "ftp://"].iter().any(|p| lower.starts_with(p)) {
            req.path.clone()
        } else {
            format!("http://{}{}", req.headers.get("Host").unwrap_or(&req.host), req.path)
        };
        let (scheme, netloc, path) = split_url(&url);
        let https = scheme.eq_ignore_ascii_case("https");
        let (host, port) = netloc_host_port(netloc, scheme);

        let mut headers = req.headers.title_cased();
        headers.set_default("Host", host.clone());
        if headers.remove("Transfer-Encoding").is_some() {
            headers.set("Content-Length", req.body.len().to_string());
        }
        if !req.body.is_empty() {
            headers.set_default("Content-Length", req.body.len().to_string());
        }

        let (wire, decoys) = build_wire_request(&req.method, path, &headers, &req.body, crlf && !https);
        let host = host.trim_matches(|c| c == '[' || c == ']').to_string();
        Self {
            url,
            host,
            port,
            https,
            wire,
            decoys,
        }
    }
}

/// Serialize a request, optionally preceded by decoy requests
///
/// Returns the bytes and the number of decoys. Skip-listed headers are
/// never sent; decoys carry no `Content-Length`, `Cookie` or `Host`.
#[must_use]
pub fn build_wire_request(method: &str, path: &str, headers: &Headers, body: &[u8], crlf: bool) -> (Vec<u8>, usize) {
    let mut out = String::new();
    let mut decoys = 0;

    if crlf {
        let mut fake = headers.title_cased();
        for name in ["Content-Length", "Cookie", "Host"] {
            fake.remove(name);
        }
        for (name, value) in DECOY_DEFAULT_HEADERS {
            fake.set_default(name, value);
        }
        let fake_lines: String = fake
            .iter()
            .filter(|(k, _)| !is_skipped(k))
            .map(|(k, v)| format!("{k}: {v}\r\n"))
            .collect();
        while decoys < DECOY_MIN_COUNT || out.len() < DECOY_MIN_BYTES {
            out.push_str("GET / HTTP/1.1\r\n");
            out.push_str(&fake_lines);
            out.push_str("\r\n");
            decoys += 1;
        }
        out.push_str("\r\n\r\n\r\n");
    }

    out.push_str(&format!("{method} {path} HTTP/1.1\r\n"));
    for (name, value) in headers.iter().filter(|(k, _)| !is_skipped(k)) {
        out.push_str(&format!("{name}: {value}\r\n"));
    }
    out.push_str("\r\n");

    let mut wire = out.into_bytes();
    wire.extend_from_slice(body);
    (wire, decoys)
}

fn timed_out(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, format!("{what} timed out"))
}

/// Forwards requests and tunnels to the origin
#[derive(Debug)]
pub struct DirectPlugin {
    connector: Arc<Connector>,
    connect_timeout: Duration,
    read_timeout: Duration,
    max_retry: usize,
    request_max_retry: usize,
    buffer_size: usize,
}

impl DirectPlugin {
    /// Plugin over `connector`; `buffer_size` is the tunnel relay buffer
    pub fn new(connector: Arc<Connector>, config: &DirectConfig, buffer_size: usize) -> Self {
        Self {
            connector,
            connect_timeout: config.connect_timeout(),
            read_timeout: config.read_timeout(),
            max_retry: config.max_retry.max(1),
            request_max_retry: config.request_max_retry.max(1),
            buffer_size,
        }
    }

    /// The racers used by this plugin
    #[must_use]
    pub fn connector(&self) -> &Arc<Connector> {
        &self.connector
    }

    /// Serve a CONNECT request by tunnelling to the origin
    ///
    /// # Errors
    ///
    /// The last dial error once every attempt failed, or a non-benign relay
    /// error.
    pub async fn tunnel<C>(&self, client: &mut C, req: &Request, session: &Session, opts: &DirectOptions) -> Result<CopyResult, ProxyError>
    where
        C: AsyncRead + AsyncWrite + Unpin + Send + ?Sized,
    {
        client.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await?;
        client.flush().await?;

        let mut first = vec![0u8; FIRST_FLIGHT_SIZE];
        let n = client.read(&mut first).await?;
        if n == 0 {
            debug!(client = %session.client, host = %req.host, "client closed tunnel before sending data");
            return Ok(CopyResult::default());
        }
        first.truncate(n);
        let first = Bytes::from(first);
        let hello = is_client_hello(&first);

        let mut dial = self.connector.dial_options();
        dial.validate = opts.validate;
        if hello {
            dial.early_data = Some(first.clone());
        } else {
            dial.cache_key.clone_from(&opts.cache_key);
        }

        let mut last_error = None;
        let mut upstream = None;
        for attempt in 0..self.max_retry {
            match self
                .connector
                .tcp
                .dial_best(&req.host, req.port, self.connect_timeout, dial.clone())
                .await
            {
                Ok(conn) => {
                    upstream = Some(conn);
                    break;
                }
                Err(e) => {
                    warn!(
                        "{} \"FORWARD {} {}:{} HTTP/1.{}\" attempt {} failed: {}",
                        session.client,
                        req.method,
                        req.host,
                        req.port,
                        req.version,
                        attempt + 1,
                        e
                    );
                    last_error = Some(e);
                }
            }
        }
        let Some(mut conn) = upstream else {
            return Err(last_error
                .unwrap_or_else(|| DialError::NoAddress { host: req.host.clone() })
                .into());
        };

        if !hello {
            conn.stream.write_all(&first).await?;
        }
        info!(
            "{} \"FORWARD {} {}:{} HTTP/1.{}\" - -",
            session.client, req.method, req.host, req.port, req.version
        );

        let result = bidirectional_copy_with_buffer(client, &mut conn.stream, self.buffer_size).await?;
        debug!(
            host = %req.host,
            peer = %conn.peer,
            up = result.client_to_upstream,
            down = result.upstream_to_client,
            "tunnel closed"
        );
        Ok(result)
    }

    /// Forward a plain request and stream the response back
    ///
    /// A dial or upstream failure before any response byte reached the
    /// client is answered with `502 Bad Gateway`. Returns whether the client
    /// connection may serve another request.
    ///
    /// # Errors
    ///
    /// Failures writing to the client, or upstream failures after the
    /// response head was sent.
    pub async fn forward<C>(&self, client: &mut C, req: &Request, session: &Session, opts: &DirectOptions) -> Result<bool, ProxyError>
    where
        C: AsyncWrite + Unpin + Send + ?Sized,
    {
        let upstream = UpstreamRequest::new(req, opts.crlf);
        if upstream.https {
            self.exchange(&self.connector.tls, client, req, session, opts, &upstream).await
        } else {
            self.exchange(&self.connector.tcp, client, req, session, opts, &upstream).await
        }
    }

    async fn dial<D: Dialer>(
        &self,
        racer: &ConnectionRacer<D>,
        upstream: &UpstreamRequest,
        opts: &DirectOptions,
        cache_key: Option<String>,
    ) -> Result<RacedConnection<D::Stream>, DialError> {
        let mut last_error = None;
        for attempt in 0..self.request_max_retry {
            let dial = DialOptions {
                cache_key: cache_key.clone(),
                validate: opts.validate,
                headfirst: opts.headfirst,
                ..self.connector.dial_options()
            };
            match racer.dial_best(&upstream.host, upstream.port, self.connect_timeout, dial).await {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    warn!(url = %upstream.url, attempt = attempt + 1, "upstream dial failed: {}", e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| DialError::NoAddress {
            host: upstream.host.clone(),
        }))
    }

    /// Send the request and read past decoy responses to the real head
    async fn send<S>(&self, stream: &mut HttpStream<S>, upstream: &UpstreamRequest) -> Result<ResponseHead, ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        stream.get_mut().write_all(&upstream.wire).await?;
        stream.get_mut().flush().await?;

        let read = async {
            for _ in 0..upstream.decoys {
                let head = stream.read_response_head().await?;
                let kind = response_body_kind("GET", head.status, &head.headers);
                stream.copy_body_to(kind, &mut tokio::io::sink(), false).await?;
            }
            stream.read_response_head().await.map_err(ProxyError::from)
        };
        timeout(self.read_timeout, read)
            .await
            .map_err(|_| ProxyError::from(timed_out("upstream response")))?
    }

    async fn exchange<D, C>(
        &self,
        racer: &ConnectionRacer<D>,
        client: &mut C,
        req: &Request,
        session: &Session,
        opts: &DirectOptions,
        upstream: &UpstreamRequest,
    ) -> Result<bool, ProxyError>
    where
        D: Dialer,
        C: AsyncWrite + Unpin + Send + ?Sized,
    {
        let mut cache_key = opts.cache_key.clone();
        let (mut stream, head, peer) = loop {
            let conn = match self.dial(racer, upstream, opts, cache_key.clone()).await {
                Ok(conn) => conn,
                Err(e) => return self.bad_gateway(client, upstream, &e.to_string()).await,
            };
            let (from_cache, peer) = (conn.from_cache, conn.peer);
            let mut stream = HttpStream::new(conn.stream);
            match self.send(&mut stream, upstream).await {
                Ok(head) => break (stream, head, peer),
                Err(e) if from_cache => {
                    debug!(url = %upstream.url, %peer, "cached connection unusable, redialing: {}", e);
                    cache_key = None;
                }
                Err(e) => return self.bad_gateway(client, upstream, &e.to_string()).await,
            }
        };

        info!(
            "{} \"DIRECT {} {} HTTP/1.1\" {} {}",
            session.client,
            req.method,
            upstream.url,
            head.status,
            head.headers.get("Content-Length").unwrap_or("-")
        );

        client.write_all(&write_response_head(head.status, &head.headers)).await?;
        let kind = response_body_kind(&req.method, head.status, &head.headers);
        let rechunk = kind != BodyKind::Empty && head.headers.contains("Transfer-Encoding");
        let outcome = stream.copy_body_to(kind, client, rechunk).await?;

        let upstream_reusable = outcome.complete && !head.wants_close();
        if upstream_reusable && self.connector.keepalive(upstream.https) {
            if let Some(key) = opts.cache_key.as_deref() {
                let (conn, leftover) = stream.into_parts();
                if leftover.is_empty() {
                    racer.release(key, conn, peer);
                }
            }
        }

        let framed = outcome.complete || rechunk;
        Ok(req.keep_alive() && !opts.crlf && framed && !head.headers.has_token("Connection", "close"))
    }

    async fn bad_gateway<C>(&self, client: &mut C, upstream: &UpstreamRequest, reason: &str) -> Result<bool, ProxyError>
    where
        C: AsyncWrite + Unpin + Send + ?Sized,
    {
        warn!(url = %upstream.url, "direct fetch failed: {}", reason);
        let body = format!("{}:{} unreachable: {reason}", upstream.host, upstream.port);
        let mut headers = Headers::new();
        headers.set("Content-Type", "text/plain");
        headers.set("Content-Length", body.len().to_string());
        headers.set("Connection", "close");
        let mut out = write_response_head(502, &headers);
        out.extend_from_slice(body.as_bytes());
        client.write_all(&out).await?;
        client.flush().await?;
        Ok(false)
    }
}
