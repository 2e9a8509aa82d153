//! UDP fan-out
//!
//! Every round sends one query to every server, then waits for its share of
//! the budget. Replies are judged as they arrive: the first clean non-empty
//! answer wins, poisoned answers are logged and skipped.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use hickory_proto::op::{Message, ResponseCode};
use tokio::net::UdpSocket;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use super::{answer_ips, encode_query, DnsError, DnsResult, UpstreamSettings};

/// Receive buffer; replies larger than this are truncated and dropped
const UDP_RECV_BUFFER_SIZE: usize = 4096;

/// What to do with one reply
#[derive(Debug, PartialEq, Eq)]
enum Verdict {
    Accept(Vec<IpAddr>),
    Skip,
}

/// Resolve `host` over UDP against every configured server
///
/// # Errors
///
/// Returns `DnsError::NoData` when no round produced a usable reply.
pub async fn resolve_over_udp(host: &str, settings: &UpstreamSettings) -> DnsResult<Vec<IpAddr>> {
    let id: u16 = rand::random();
    let transform = settings.transform.as_deref();

    let mut packets = Vec::with_capacity(settings.servers.len());
    for server in &settings.servers {
        packets.push((*server, encode_query(host, server, id, transform)?));
    }

    let sock_v4 = bind_if(settings.servers.iter().any(SocketAddr::is_ipv4), Ipv4Addr::UNSPECIFIED.into()).await?;
    let sock_v6 = bind_if(settings.servers.iter().any(SocketAddr::is_ipv6), Ipv6Addr::UNSPECIFIED.into()).await?;

    let attempts = settings.udp_attempts.max(1);
    let slice = settings.timeout / u32::try_from(attempts).unwrap_or(u32::MAX);

    for attempt in 0..attempts {
        for (server, packet) in &packets {
            let sock = if server.is_ipv4() { sock_v4.as_ref() } else { sock_v6.as_ref() };
            let Some(sock) = sock else { continue };
            if let Err(e) = sock.send_to(packet, server).await {
                warn!(host, %server, attempt, "dns query send failed: {}", e);
            }
        }

        let deadline = Instant::now() + slice;
        loop {
            let (data, src) = match timeout_at(deadline, recv_any(sock_v4.as_ref(), sock_v6.as_ref())).await {
                Err(_) => break,
                Ok(Err(e)) => {
                    warn!(host, attempt, "dns reply receive failed: {}", e);
                    break;
                }
                Ok(Ok(reply)) => reply,
            };

            let message = match Message::from_vec(&data) {
                Ok(message) if message.id() == id => message,
                Ok(_) => continue,
                Err(e) => {
                    debug!(host, %src, "unparseable dns reply: {}", e);
                    continue;
                }
            };

            if let Verdict::Accept(ips) = judge(host, &message, src, settings) {
                return Ok(ips);
            }
        }
    }

    Err(DnsError::no_data(host, &settings.server_labels()))
}

fn judge(host: &str, message: &Message, src: SocketAddr, settings: &UpstreamSettings) -> Verdict {
    let ips = answer_ips(message);
    let rcode = message.response_code();

    if settings.blacklist.is_poisoned(&ips) {
        warn!(host, server = %src, ?ips, "dns reply carries blacklisted addresses");
        Verdict::Skip
    } else if rcode != ResponseCode::NoError && ips.is_empty() && settings.trusted.contains(&src.ip()) {
        info!(host, server = %src, %rcode, "accepting error reply from trusted server");
        Verdict::Accept(ips)
    } else if ips.is_empty() {
        debug!(host, server = %src, %rcode, "dns reply without addresses");
        Verdict::Skip
    } else {
        debug!(host, server = %src, ?ips, "dns reply accepted");
        Verdict::Accept(ips)
    }
}

async fn bind_if(needed: bool, ip: IpAddr) -> DnsResult<Option<UdpSocket>> {
    if !needed {
        return Ok(None);
    }
    UdpSocket::bind(SocketAddr::new(ip, 0))
        .await
        .map(Some)
        .map_err(|e| DnsError::network_io("failed to bind UDP socket", e))
}

async fn recv_any(v4: Option<&UdpSocket>, v6: Option<&UdpSocket>) -> io::Result<(Vec<u8>, SocketAddr)> {
    tokio::select! {
        r = recv_from(v4) => r,
        r = recv_from(v6) => r,
    }
}

async fn recv_from(sock: Option<&UdpSocket>) -> io::Result<(Vec<u8>, SocketAddr)> {
    let Some(sock) = sock else {
        return std::future::pending().await;
    };
    let mut buf = vec![0u8; UDP_RECV_BUFFER_SIZE];
    let (n, src) = sock.recv_from(&mut buf).await?;
    buf.truncate(n);
    Ok((buf, src))
}
