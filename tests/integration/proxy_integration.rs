//! End-to-end tests: client → accept loop → filters → racer → mock origin
//!
//! Every origin name resolves to `127.0.0.1`; origins are plain listeners
//! on ephemeral ports that answer with canned bytes.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;

use racing_proxy::config::{ConnectionConfig, DirectConfig, FilterConfig, ListenConfig, RacerConfig};
use racing_proxy::connection::{run_accept_loop, ConnectionManager, ProxyHandler};
use racing_proxy::filter::FilterChain;
use racing_proxy::plugin::{DirectPlugin, StaticCertProvider, StripPlugin};
use racing_proxy::racer::Connector;

use super::{closed_port, StaticResolver};

struct Proxy {
    addr: SocketAddr,
    manager: Arc<ConnectionManager>,
}

impl Proxy {
    async fn start(filters: &[FilterConfig], cert: &Path, listen: ListenConfig) -> Self {
        let connector = Arc::new(Connector::from_config(
            &RacerConfig::default(),
            Arc::new(StaticResolver::loopback()),
        ));
        let direct = DirectPlugin::new(connector, &DirectConfig::default(), 16 * 1024);
        let strip = StripPlugin::new(Arc::new(StaticCertProvider::new(cert)));
        let handler = ProxyHandler::new(FilterChain::from_config(filters).unwrap(), direct, strip, &listen);

        let connection = ConnectionConfig {
            max_connections: 16,
            buffer_size: 16 * 1024,
            drain_timeout_secs: 1,
        };
        let manager = Arc::new(ConnectionManager::new(&connection, Arc::new(handler)));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(run_accept_loop(listener, Arc::clone(&manager)));
        Self { addr, manager }
    }

    async fn plain(filters: &[FilterConfig]) -> Self {
        Self::start(filters, Path::new("/nonexistent.pem"), ListenConfig::default()).await
    }

    /// Send `request` and read until the proxy closes
    async fn roundtrip(&self, request: &str) -> String {
        let mut client = TcpStream::connect(self.addr).await.unwrap();
        client.write_all(request.as_bytes()).await.unwrap();
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        String::from_utf8_lossy(&out).into_owned()
    }
}

/// Origin that answers each connection once; received requests are sent
/// back to the test. A request is complete once it contains `marker` and
/// ends a header block.
async fn origin<F>(marker: &'static str, respond: F) -> (SocketAddr, mpsc::UnboundedReceiver<String>)
where
    F: Fn(&str) -> Vec<u8> + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    let respond = Arc::new(respond);
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let tx = tx.clone();
            let respond = Arc::clone(&respond);
            tokio::spawn(async move {
                let mut received = Vec::new();
                let mut buf = [0u8; 4096];
                loop {
                    let n = socket.read(&mut buf).await.unwrap_or(0);
                    if n == 0 {
                        return;
                    }
                    received.extend_from_slice(&buf[..n]);
                    let text = String::from_utf8_lossy(&received);
                    if text.contains(marker) && text.ends_with("\r\n\r\n") {
                        break;
                    }
                }
                let text = String::from_utf8_lossy(&received).into_owned();
                let _ = socket.write_all(&respond(&text)).await;
                let _ = tx.send(text);
            });
        }
    });
    (addr, rx)
}

fn tls_client(pem: &Path) -> TlsConnector {
    let pem = std::fs::read(pem).unwrap();
    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut &pem[..]) {
        roots.add(cert.unwrap()).unwrap();
    }
    let config = ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

fn write_cert(dir: &Path, host: &str) -> std::path::PathBuf {
    let key = rcgen::KeyPair::generate().unwrap();
    let cert = rcgen::CertificateParams::new(vec![host.to_string()])
        .unwrap()
        .self_signed(&key)
        .unwrap();
    let path = dir.join(format!("{host}.crt"));
    std::fs::write(&path, format!("{}{}", cert.pem(), key.serialize_pem())).unwrap();
    path
}

#[tokio::test]
async fn test_plain_request_forwarded() {
    let (origin, mut requests) = origin("", |_| b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello".to_vec()).await;
    let proxy = Proxy::plain(&[FilterConfig::Simple]).await;

    let out = proxy
        .roundtrip(&format!(
            "GET http://origin.test:{port}/index?q=1 HTTP/1.1\r\nHost: origin.test:{port}\r\nProxy-Connection: keep-alive\r\nConnection: close\r\n\r\n",
            port = origin.port()
        ))
        .await;

    assert!(out.starts_with("HTTP/1.1 200 OK\r\n"), "{out}");
    assert!(out.ends_with("\r\n\r\nhello"));

    let seen = requests.recv().await.unwrap();
    assert!(seen.starts_with("GET /index?q=1 HTTP/1.1\r\n"), "{seen}");
    assert!(!seen.contains("Proxy-Connection"));
}

#[tokio::test]
async fn test_chunked_response_rechunked() {
    let (origin, _) = origin("", |_| {
        b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n2\r\nde\r\n0\r\n\r\n".to_vec()
    })
    .await;
    let proxy = Proxy::plain(&[FilterConfig::Simple]).await;

    let out = proxy
        .roundtrip(&format!(
            "GET http://origin.test:{}/ HTTP/1.1\r\nConnection: close\r\n\r\n",
            origin.port()
        ))
        .await;

    let (head, body) = out.split_once("\r\n\r\n").unwrap();
    assert!(head.contains("Transfer-Encoding: chunked"));
    assert!(body.ends_with("0\r\n\r\n"));
    let payload: String = body
        .split("\r\n")
        .skip(1)
        .step_by(2)
        .collect();
    assert_eq!(payload, "abcde");
}

#[tokio::test]
async fn test_unreachable_origin_answers_502() {
    let dead = closed_port().await;
    let proxy = Proxy::plain(&[FilterConfig::Simple]).await;
    let out = proxy
        .roundtrip(&format!("GET http://dead.test:{}/ HTTP/1.1\r\n\r\n", dead.port()))
        .await;
    assert!(out.starts_with("HTTP/1.1 502 Bad Gateway\r\n"), "{out}");
}

#[tokio::test]
async fn test_connect_tunnel_relays_bytes() {
    let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let echo_addr = echo.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = echo.accept().await.unwrap();
        let (mut rd, mut wr) = socket.split();
        let _ = tokio::io::copy(&mut rd, &mut wr).await;
    });
    let proxy = Proxy::plain(&[FilterConfig::Simple]).await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    client
        .write_all(format!("CONNECT echo.test:{0} HTTP/1.1\r\nHost: echo.test:{0}\r\n\r\n", echo_addr.port()).as_bytes())
        .await
        .unwrap();
    let mut established = [0u8; 19];
    client.read_exact(&mut established).await.unwrap();
    assert_eq!(&established, b"HTTP/1.1 200 OK\r\n\r\n");

    client.write_all(b"ping").await.unwrap();
    let mut reply = [0u8; 4];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"ping");
    client.shutdown().await.unwrap();

    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
}

#[tokio::test]
async fn test_auth_challenge_then_forward() {
    let (origin, _) = origin("", |_| b"HTTP/1.1 204 No Content\r\n\r\n".to_vec()).await;
    let filters = [
        FilterConfig::Auth {
            username: "alice".into(),
            password: "secret".into(),
            whitelist: Vec::new(),
        },
        FilterConfig::Simple,
    ];
    let proxy = Proxy::plain(&filters).await;
    let url = format!("http://origin.test:{}/", origin.port());

    let denied = proxy
        .roundtrip(&format!("GET {url} HTTP/1.1\r\nConnection: close\r\n\r\n"))
        .await;
    assert!(denied.starts_with("HTTP/1.1 407 "), "{denied}");
    assert!(denied.contains("Proxy-Authenticate: Basic"));

    let token = STANDARD.encode("alice:secret");
    let allowed = proxy
        .roundtrip(&format!(
            "GET {url} HTTP/1.1\r\nProxy-Authorization: Basic {token}\r\nConnection: close\r\n\r\n"
        ))
        .await;
    assert!(allowed.starts_with("HTTP/1.1 204 No Content\r\n"), "{allowed}");
}

#[tokio::test]
async fn test_force_https_redirect() {
    let proxy = Proxy::plain(&[
        FilterConfig::ForceHttps {
            sites: vec![".secure.test".into()],
            exclude: Vec::new(),
        },
        FilterConfig::Simple,
    ])
    .await;
    let out = proxy
        .roundtrip("GET http://www.secure.test/login HTTP/1.1\r\nHost: www.secure.test\r\n\r\n")
        .await;
    assert!(out.starts_with("HTTP/1.1 301 "), "{out}");
    assert!(out.contains("Location: https://www.secure.test/login\r\n"));
}

#[tokio::test]
async fn test_crlf_decoy_responses_discarded() {
    let (origin, mut requests) = origin("GET /page HTTP/1.1", |request| {
        let decoys = request.matches("GET / HTTP/1.1\r\n").count();
        let mut out = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\ndecoy".repeat(decoys);
        out.extend_from_slice(b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\nreal");
        out
    })
    .await;
    let proxy = Proxy::plain(&[
        FilterConfig::CrlfSites {
            sites: vec!["crlf.test".into()],
            exclude: Vec::new(),
        },
        FilterConfig::Simple,
    ])
    .await;

    let out = proxy
        .roundtrip(&format!(
            "GET http://crlf.test:{0}/page HTTP/1.1\r\nHost: crlf.test:{0}\r\n\r\n",
            origin.port()
        ))
        .await;
    assert!(out.starts_with("HTTP/1.1 200 OK\r\n"), "{out}");
    assert!(out.ends_with("\r\n\r\nreal"));
    assert!(!out.contains("decoy"));

    let seen = requests.recv().await.unwrap();
    assert!(seen.matches("GET / HTTP/1.1\r\n").count() >= 5);
}

#[tokio::test]
async fn test_connect_stripped_and_served_locally() {
    let dir = tempfile::tempdir().unwrap();
    let cert = write_cert(dir.path(), "strip.test");
    let filters = [
        FilterConfig::FakeHttps {
            sites: vec!["strip.test".into()],
            exclude: Vec::new(),
        },
        FilterConfig::Blackhole,
    ];
    let proxy = Proxy::start(&filters, &cert, ListenConfig::default()).await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    client
        .write_all(b"CONNECT strip.test:443 HTTP/1.1\r\nHost: strip.test:443\r\n\r\n")
        .await
        .unwrap();
    let mut established = [0u8; 19];
    client.read_exact(&mut established).await.unwrap();
    assert_eq!(&established, b"HTTP/1.1 200 OK\r\n\r\n");

    let mut tls = tls_client(&cert)
        .connect(ServerName::try_from("strip.test").unwrap(), client)
        .await
        .unwrap();
    tls.write_all(b"GET /pixel.gif HTTP/1.1\r\nHost: strip.test\r\n\r\n")
        .await
        .unwrap();
    let mut out = Vec::new();
    tls.read_to_end(&mut out).await.unwrap();

    assert!(out.starts_with(b"HTTP/1.1 200 OK\r\n"));
    assert!(out.ends_with(b";"));
    assert!(String::from_utf8_lossy(&out).contains("Content-Type: image/gif"));
}

#[tokio::test]
async fn test_transparent_tls_uses_sni() {
    let dir = tempfile::tempdir().unwrap();
    let cert = write_cert(dir.path(), "direct-tls.test");
    let listen = ListenConfig {
        transparent_tls: true,
        ..ListenConfig::default()
    };
    let proxy = Proxy::start(&[FilterConfig::Blackhole], &cert, listen).await;

    let client = TcpStream::connect(proxy.addr).await.unwrap();
    let mut tls = tls_client(&cert)
        .connect(ServerName::try_from("direct-tls.test").unwrap(), client)
        .await
        .unwrap();
    tls.write_all(b"GET /track.js HTTP/1.1\r\nHost: direct-tls.test\r\n\r\n")
        .await
        .unwrap();
    let mut out = Vec::new();
    tls.read_to_end(&mut out).await.unwrap();

    let text = String::from_utf8_lossy(&out);
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "{text}");
    assert!(text.contains("Cache-Control: max-age=86400"));

    proxy.manager.shutdown().await;
    let stats = proxy.manager.stats_snapshot();
    assert!(stats.clients.accepted >= 1);
    assert!(stats.requests.mocked >= 1);
}
