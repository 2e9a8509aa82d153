//! Per-client request loop
//!
//! A client connection carries one or more requests. Each request head is
//! parsed, its body buffered, and the filter chain picks the plugin that
//! answers it. Tunnels (`direct` CONNECT) and interception (`strip`) take
//! the stream over; an intercepted stream is served again by the same loop
//! as HTTPS.

use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use super::stats::{Handled, ProxyStats, StatsSnapshot};
use crate::config::{Config, ListenConfig};
use crate::dns::DnsResolver;
use crate::error::{ConnectionError, ProxyError};
use crate::filter::{FilterAction, FilterChain, MockResponse, Session};
use crate::http::{request_body_kind, HttpStream, Request, Scheme};
use crate::io::{boxed, BoxedStream, CopyResult, Rewind};
use crate::plugin::{DirectPlugin, DirectoryCertProvider, MockPlugin, StripPlugin};
use crate::racer::Connector;
use crate::sniff::server_name;

/// Bytes peeked when looking for a ClientHello on the plain port
const HELLO_PEEK_SIZE: usize = 1024;

/// Peek attempts before settling for the default server name
const HELLO_PEEK_ATTEMPTS: usize = 2;

/// Everything a client connection needs, shared across connections
#[derive(Debug)]
pub struct ProxyHandler {
    chain: FilterChain,
    direct: DirectPlugin,
    strip: StripPlugin,
    mock: MockPlugin,
    stats: Arc<ProxyStats>,
    transparent_tls: bool,
    sniff_timeout: Duration,
    default_server_name: String,
}

impl ProxyHandler {
    /// Assemble a handler from its parts
    pub fn new(chain: FilterChain, direct: DirectPlugin, strip: StripPlugin, listen: &ListenConfig) -> Self {
        Self {
            chain,
            direct,
            strip,
            mock: MockPlugin,
            stats: Arc::new(ProxyStats::new()),
            transparent_tls: listen.transparent_tls,
            sniff_timeout: listen.sniff_timeout(),
            default_server_name: listen.default_server_name.clone(),
        }
    }

    /// Build resolver, racers, filters and plugins from configuration
    ///
    /// # Errors
    ///
    /// DNS server addresses that do not parse, and filter rules that do not
    /// compile.
    pub fn from_config(config: &Config) -> Result<Self, ProxyError> {
        let resolver = Arc::new(DnsResolver::from_config(&config.dns)?);
        let connector = Arc::new(Connector::from_config(&config.racer, resolver));
        let chain = FilterChain::from_config(&config.filters)?;
        let direct = DirectPlugin::new(connector, &config.direct, config.connection.buffer_size);
        let strip = StripPlugin::new(Arc::new(DirectoryCertProvider::from_config(&config.certs)));
        debug!(filters = ?chain.names().collect::<Vec<_>>(), "filter chain ready");
        Ok(Self::new(chain, direct, strip, &config.listen))
    }

    /// The filter chain
    #[must_use]
    pub fn chain(&self) -> &FilterChain {
        &self.chain
    }

    /// The direct plugin and its racers
    #[must_use]
    pub fn direct(&self) -> &DirectPlugin {
        &self.direct
    }

    /// Counters fed by this handler and its connections
    #[must_use]
    pub fn stats(&self) -> &Arc<ProxyStats> {
        &self.stats
    }

    /// Counters with the race outcomes of both racers
    #[must_use]
    pub fn stats_snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot(self.direct.connector())
    }

    /// Serve a freshly accepted TCP client
    ///
    /// With transparent TLS enabled a connection opening with a TLS record
    /// is intercepted right away under its SNI, or the default server name.
    ///
    /// # Errors
    ///
    /// Anything that ends the connection abnormally; benign disconnects are
    /// reported too and left to the caller to classify.
    pub async fn handle_tcp(&self, stream: TcpStream, session: Session) -> Result<CopyResult, ProxyError> {
        if self.transparent_tls {
            if let Some(host) = self.peek_tls(&stream).await {
                debug!(client = %session.client, host = %host, "transparent tls");
                let tls = self.strip.accept(stream, &host).await?;
                return self.serve(boxed(tls), session, Scheme::Https).await;
            }
        }
        self.serve(boxed(stream), session, Scheme::Http).await
    }

    /// Server name for a connection that starts with a TLS record
    async fn peek_tls(&self, stream: &TcpStream) -> Option<String> {
        let mut first = [0u8; 1];
        match timeout(self.sniff_timeout, stream.peek(&mut first)).await {
            Ok(Ok(1)) if first[0] == 0x16 || first[0] == 0x80 => {}
            _ => return None,
        }

        let mut buf = vec![0u8; HELLO_PEEK_SIZE];
        for attempt in 0..HELLO_PEEK_ATTEMPTS {
            if attempt > 0 {
                sleep(self.sniff_timeout / 4).await;
            }
            let Ok(Ok(n)) = timeout(self.sniff_timeout, stream.peek(&mut buf)).await else {
                continue;
            };
            if let Some(name) = server_name(&buf[..n]) {
                return Some(name);
            }
        }
        Some(self.default_server_name.clone())
    }

    /// Run the request loop on `stream`
    ///
    /// Returns the bytes relayed through tunnels and request bodies.
    pub fn serve(&self, stream: BoxedStream, mut session: Session, scheme: Scheme) -> BoxFuture<'_, Result<CopyResult, ProxyError>> {
        async move {
            let mut total = CopyResult::default();
            let mut http = HttpStream::new(stream);

            loop {
                let Some(head) = http.read_request_head().await? else {
                    break;
                };
                let mut req = Request::from_head(head, scheme)?;
                if !req.is_connect() {
                    req.body = http.read_body(request_body_kind(&req.headers)).await?;
                    total.client_to_upstream += req.body.len() as u64;
                }

                let action = match self.chain.dispatch(&mut req, &mut session).await {
                    Ok(action) => action,
                    Err(e) => {
                        warn!(client = %session.client, host = %req.host, "{}", e);
                        self.stats.request_handled(Handled::Unmatched);
                        let resp = MockResponse::new(404)
                            .header("Content-Type", "text/plain")
                            .body(e.to_string());
                        if self.mock.respond(http.get_mut(), &req, &session, &resp).await? {
                            continue;
                        }
                        break;
                    }
                };

                match action {
                    FilterAction::Mock(resp) => {
                        self.stats.request_handled(Handled::Mocked);
                        if !self.mock.respond(http.get_mut(), &req, &session, &resp).await? {
                            break;
                        }
                    }
                    FilterAction::Direct(opts) if req.is_connect() => {
                        self.stats.request_handled(Handled::Tunnelled);
                        let (inner, leftover) = http.into_parts();
                        let mut client = Rewind::new(leftover, inner);
                        let relayed = self.direct.tunnel(&mut client, &req, &session, &opts).await?;
                        total.client_to_upstream += relayed.client_to_upstream;
                        total.upstream_to_client += relayed.upstream_to_client;
                        return Ok(total);
                    }
                    FilterAction::Direct(opts) => {
                        self.stats.request_handled(Handled::Forwarded);
                        if !self.direct.forward(http.get_mut(), &req, &session, &opts).await? {
                            break;
                        }
                    }
                    FilterAction::Strip => {
                        if !req.is_connect() {
                            return Err(ConnectionError::bad_request(format!("cannot strip {} {}", req.method, req.path)).into());
                        }
                        self.stats.request_handled(Handled::Stripped);
                        let (inner, leftover) = http.into_parts();
                        let mut client = Rewind::new(leftover, inner);
                        self.strip.respond_established(&mut client, &req, &session).await?;
                        let host = req.host.clone();
                        let tls = self.strip.accept(client, &host).await?;
                        let inner = self.serve(boxed(tls), session, Scheme::Https).await?;
                        total.client_to_upstream += inner.client_to_upstream;
                        total.upstream_to_client += inner.upstream_to_client;
                        return Ok(total);
                    }
                }
            }

            // Peer may already be gone.
            let _ = http.get_mut().shutdown().await;
            Ok::<_, ProxyError>(total)
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DirectConfig, FilterConfig, RacerConfig};
    use crate::dns::{DnsResult, Resolve};
    use crate::plugin::StaticCertProvider;
    use async_trait::async_trait;
    use std::net::IpAddr;
    use tokio::io::{duplex, AsyncReadExt};

    struct Unreachable;

    #[async_trait]
    impl Resolve for Unreachable {
        async fn resolve(&self, _host: &str) -> DnsResult<Vec<IpAddr>> {
            Ok(Vec::new())
        }
    }

    fn handler(filters: &[FilterConfig]) -> ProxyHandler {
        let connector = Arc::new(Connector::from_config(&RacerConfig::default(), Arc::new(Unreachable)));
        let direct = DirectPlugin::new(connector, &DirectConfig::default(), 4096);
        let strip = StripPlugin::new(Arc::new(StaticCertProvider::new("/nonexistent.pem")));
        ProxyHandler::new(
            FilterChain::from_config(filters).unwrap(),
            direct,
            strip,
            &ListenConfig::default(),
        )
    }

    async fn exchange(handler: &ProxyHandler, input: &'static [u8]) -> String {
        let (mut client, server) = duplex(64 * 1024);
        client.write_all(input).await.unwrap();
        client.shutdown().await.unwrap();
        handler
            .serve(boxed(server), crate::filter::testing::session(), Scheme::Http)
            .await
            .unwrap();
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        String::from_utf8_lossy(&out).into_owned()
    }

    #[tokio::test]
    async fn test_mock_keep_alive_serves_pipelined_requests() {
        let handler = handler(&[FilterConfig::Auth {
            username: "u".into(),
            password: "p".into(),
            whitelist: vec![],
        }]);
        let out = exchange(
            &handler,
            b"GET http://a.com/ HTTP/1.1\r\nHost: a.com\r\n\r\nGET http://b.com/ HTTP/1.1\r\nHost: b.com\r\n\r\n",
        )
        .await;
        assert_eq!(out.matches("HTTP/1.1 407 ").count(), 2);
        assert_eq!(handler.stats().requests().mocked, 2);
    }

    #[tokio::test]
    async fn test_blackhole_closes_after_response() {
        let handler = handler(&[FilterConfig::Blackhole]);
        let out = exchange(
            &handler,
            b"GET http://ads.example/x.gif HTTP/1.1\r\nHost: ads.example\r\n\r\nGET http://ads.example/y HTTP/1.1\r\n\r\n",
        )
        .await;
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
        assert_eq!(out.matches("HTTP/1.1 ").count(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_origin_gets_bad_gateway() {
        let handler = handler(&[]);
        let out = exchange(&handler, b"GET http://nowhere.invalid/ HTTP/1.1\r\nHost: nowhere.invalid\r\n\r\n").await;
        assert!(out.starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
        assert!(out.contains("Connection: close\r\n"));
        let snapshot = handler.stats_snapshot();
        assert_eq!(snapshot.requests.forwarded, 1);
        assert_eq!(snapshot.tcp.served(), 0);
    }

    #[tokio::test]
    async fn test_no_matching_filter_answers_404() {
        let handler = handler(&[FilterConfig::UserAgent { user_agent: "x".into() }]);
        let out = exchange(&handler, b"GET http://a.com/ HTTP/1.1\r\nHost: a.com\r\n\r\n").await;
        assert!(out.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert_eq!(handler.stats().requests().unmatched, 1);
    }

    #[tokio::test]
    async fn test_strip_without_certificate_fails() {
        let handler = handler(&[FilterConfig::Mitm]);
        let (mut client, server) = duplex(4096);
        client.write_all(b"CONNECT a.com:443 HTTP/1.1\r\nHost: a.com:443\r\n\r\n").await.unwrap();
        let result = handler
            .serve(boxed(server), crate::filter::testing::session(), Scheme::Http)
            .await;
        assert!(matches!(result, Err(ProxyError::Cert(_))));

        let mut buf = [0u8; 19];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"HTTP/1.1 200 OK\r\n\r\n");
    }
}
