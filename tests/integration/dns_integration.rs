//! Resolver integration tests against mock DNS servers
//!
//! The mock servers answer every query with a fixed address list built with
//! hickory-proto, the same crate the resolver parses replies with.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{RData, Record};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};

use racing_proxy::dns::{resolve_over_tcp, DnsBlacklist, DnsError, DnsResolver, Resolve, UpstreamSettings};

const ORIGIN_IP: Ipv4Addr = Ipv4Addr::new(93, 184, 216, 34);
const FORGED_IP: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 66);

fn reply(query: &[u8], ips: &[Ipv4Addr], rcode: ResponseCode) -> Vec<u8> {
    let query = Message::from_vec(query).unwrap();
    let mut response = Message::new();
    response
        .set_id(query.id())
        .set_message_type(MessageType::Response)
        .set_op_code(query.op_code())
        .set_recursion_desired(true)
        .set_recursion_available(true)
        .set_response_code(rcode);
    response.add_queries(query.queries().to_vec());
    let name = query.queries()[0].name().clone();
    for ip in ips {
        response.add_answer(Record::from_rdata(name.clone(), 60, RData::A(A(*ip))));
    }
    response.to_vec().unwrap()
}

/// UDP server answering with `ips`; counts the queries it sees
async fn udp_server(ips: Vec<Ipv4Addr>, rcode: ResponseCode) -> (SocketAddr, Arc<AtomicUsize>) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let queries = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&queries);
    tokio::spawn(async move {
        let mut buf = [0u8; 512];
        while let Ok((n, src)) = socket.recv_from(&mut buf).await {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = socket.send_to(&reply(&buf[..n], &ips, rcode), src).await;
        }
    });
    (addr, queries)
}

/// Length-prefixed DNS over TCP server answering with `ips`
async fn tcp_server(listener: TcpListener, ips: Vec<Ipv4Addr>) {
    while let Ok((mut stream, _)) = listener.accept().await {
        let ips = ips.clone();
        tokio::spawn(async move {
            let mut len = [0u8; 2];
            stream.read_exact(&mut len).await.unwrap();
            let mut query = vec![0u8; usize::from(u16::from_be_bytes(len))];
            stream.read_exact(&mut query).await.unwrap();
            let answer = reply(&query, &ips, ResponseCode::NoError);
            let mut frame = u16::try_from(answer.len()).unwrap().to_be_bytes().to_vec();
            frame.extend_from_slice(&answer);
            stream.write_all(&frame).await.unwrap();
        });
    }
}

fn settings(servers: Vec<SocketAddr>) -> UpstreamSettings {
    UpstreamSettings {
        timeout: Duration::from_millis(800),
        ..UpstreamSettings::new(servers)
    }
}

#[tokio::test]
async fn test_udp_answer_is_cached() {
    let (server, queries) = udp_server(vec![ORIGIN_IP], ResponseCode::NoError).await;
    let resolver = DnsResolver::new(settings(vec![server]));

    let ips = resolver.resolve("example.com").await.unwrap();
    assert_eq!(ips, vec![IpAddr::V4(ORIGIN_IP)]);
    assert!(resolver.cached("example.com").is_some());

    let again = resolver.resolve("example.com").await.unwrap();
    assert_eq!(again, ips);
    assert_eq!(queries.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_poisoned_server_is_outvoted() {
    let (forger, _) = udp_server(vec![FORGED_IP], ResponseCode::NoError).await;
    let (honest, _) = udp_server(vec![ORIGIN_IP], ResponseCode::NoError).await;
    let mut upstream = settings(vec![forger, honest]);
    upstream.blacklist = DnsBlacklist::new([FORGED_IP.to_string()]);

    let ips = DnsResolver::new(upstream).resolve("example.com").await.unwrap();
    assert_eq!(ips, vec![IpAddr::V4(ORIGIN_IP)]);
}

#[tokio::test]
async fn test_poisoned_udp_falls_back_to_tcp() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(tcp_server(listener, vec![ORIGIN_IP]));

    let socket = UdpSocket::bind(addr).await.unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 512];
        while let Ok((n, src)) = socket.recv_from(&mut buf).await {
            let _ = socket
                .send_to(&reply(&buf[..n], &[FORGED_IP], ResponseCode::NoError), src)
                .await;
        }
    });

    let mut upstream = settings(vec![addr]);
    upstream.blacklist = DnsBlacklist::new([FORGED_IP.to_string()]);
    let ips = DnsResolver::new(upstream).resolve("example.com").await.unwrap();
    assert_eq!(ips, vec![IpAddr::V4(ORIGIN_IP)]);
}

#[tokio::test]
async fn test_trusted_error_reply_is_final() {
    let (server, _) = udp_server(Vec::new(), ResponseCode::NXDomain).await;
    let mut upstream = settings(vec![server]);
    upstream.trusted = vec![server.ip()];

    let ips = DnsResolver::new(upstream).resolve("missing.example").await.unwrap();
    assert!(ips.is_empty());
}

#[tokio::test]
async fn test_untrusted_error_reply_is_no_data() {
    let (server, _) = udp_server(Vec::new(), ResponseCode::NXDomain).await;
    let upstream = UpstreamSettings {
        timeout: Duration::from_millis(200),
        udp_attempts: 1,
        ..UpstreamSettings::new(vec![server])
    };
    let err = DnsResolver::new(upstream).resolve("missing.example").await.unwrap_err();
    assert!(matches!(err, DnsError::NoData { .. }), "unexpected error: {err:?}");
}

#[tokio::test]
async fn test_tcp_rejects_blacklisted_answer() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(tcp_server(listener, vec![FORGED_IP]));

    let mut upstream = settings(vec![addr]);
    upstream.blacklist = DnsBlacklist::new([FORGED_IP.to_string()]);
    assert!(resolve_over_tcp("example.com", &upstream).await.is_err());
}

#[tokio::test]
async fn test_literal_address_skips_upstreams() {
    let resolver = DnsResolver::new(settings(Vec::new()));
    let ips = resolver.resolve("[::1]").await.unwrap();
    assert_eq!(ips, vec!["::1".parse::<IpAddr>().unwrap()]);
}

#[tokio::test]
#[ignore = "requires network access"]
async fn test_system_resolver_without_upstreams() {
    let resolver = DnsResolver::new(UpstreamSettings::new(Vec::new()));
    assert!(!resolver.resolve("example.com").await.unwrap().is_empty());
}
