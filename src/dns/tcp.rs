//! DNS over TCP fallback
//!
//! One length-prefixed query per server, all servers concurrently. The
//! first clean answer wins.

use std::net::{IpAddr, SocketAddr};

use futures::stream::{FuturesUnordered, StreamExt};
use hickory_proto::op::{Message, ResponseCode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::{answer_ips, encode_query, DnsError, DnsResult, UpstreamSettings};

/// Resolve `host` over TCP against every configured server
///
/// # Errors
///
/// Returns `DnsError::NoData` if no server returned a clean answer within
/// the budget.
pub async fn resolve_over_tcp(host: &str, settings: &UpstreamSettings) -> DnsResult<Vec<IpAddr>> {
    let mut pending: FuturesUnordered<_> = settings
        .servers
        .iter()
        .map(|server| query_server(host, *server, settings))
        .collect();

    let first_clean = async {
        let mut last_error = None;
        while let Some(result) = pending.next().await {
            match result {
                Ok(ips) => return Ok(ips),
                Err(e) => {
                    debug!(host, "dns over tcp attempt failed: {}", e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error)
    };

    match timeout(settings.timeout, first_clean).await {
        Ok(Ok(ips)) => Ok(ips),
        Ok(Err(last_error)) => {
            warn!(host, servers = ?settings.servers, ?last_error, "dns over tcp failed");
            Err(DnsError::no_data(host, &settings.server_labels()))
        }
        Err(_) => Err(DnsError::no_data(host, &settings.server_labels())),
    }
}

async fn query_server(host: &str, server: SocketAddr, settings: &UpstreamSettings) -> DnsResult<Vec<IpAddr>> {
    let id: u16 = rand::random();
    let packet = encode_query(host, &server, id, None)?;
    let len = u16::try_from(packet.len()).map_err(|_| DnsError::serialize("query too large"))?;

    let mut stream = TcpStream::connect(server)
        .await
        .map_err(|e| DnsError::network_io(format!("connect to {server}"), e))?;

    let mut frame = Vec::with_capacity(packet.len() + 2);
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&packet);
    stream
        .write_all(&frame)
        .await
        .map_err(|e| DnsError::network_io(format!("send to {server}"), e))?;

    let mut len_buf = [0u8; 2];
    stream
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| DnsError::network_io(format!("read length from {server}"), e))?;
    let mut reply = vec![0u8; usize::from(u16::from_be_bytes(len_buf))];
    stream
        .read_exact(&mut reply)
        .await
        .map_err(|e| DnsError::network_io(format!("read reply from {server}"), e))?;

    let message = Message::from_vec(&reply).map_err(|e| DnsError::parse(e.to_string()))?;
    if message.id() != id {
        return Err(DnsError::parse(format!("reply id mismatch from {server}")));
    }

    let ips = answer_ips(&message);
    if settings.blacklist.is_poisoned(&ips) {
        return Err(DnsError::poisoned(server.to_string(), ips));
    }
    if message.response_code() != ResponseCode::NoError || ips.is_empty() {
        return Err(DnsError::no_data(host, &[server.to_string()]));
    }
    debug!(host, %server, ?ips, "dns over tcp answer");
    Ok(ips)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::testing::reply;
    use crate::dns::DnsBlacklist;
    use std::time::Duration;
    use tokio::net::TcpListener;

    async fn spawn_tcp_server(ips: Vec<IpAddr>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let ips = ips.clone();
                tokio::spawn(async move {
                    let mut len = [0u8; 2];
                    stream.read_exact(&mut len).await.unwrap();
                    let mut query = vec![0u8; usize::from(u16::from_be_bytes(len))];
                    stream.read_exact(&mut query).await.unwrap();
                    let data = reply(&query, &ips, ResponseCode::NoError);
                    let mut frame = u16::try_from(data.len()).unwrap().to_be_bytes().to_vec();
                    frame.extend_from_slice(&data);
                    stream.write_all(&frame).await.unwrap();
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_tcp_answer() {
        let ip: IpAddr = "93.184.216.34".parse().unwrap();
        let server = spawn_tcp_server(vec![ip]).await;

        let settings = UpstreamSettings::new(vec![server]);
        let ips = resolve_over_tcp("example.com", &settings).await.unwrap();
        assert_eq!(ips, vec![ip]);
    }

    #[tokio::test]
    async fn test_tcp_poisoned_and_clean() {
        let liar = spawn_tcp_server(vec!["1.2.3.4".parse().unwrap()]).await;
        let truth = spawn_tcp_server(vec!["93.184.216.34".parse().unwrap()]).await;

        let mut settings = UpstreamSettings::new(vec![liar, truth]);
        settings.blacklist = DnsBlacklist::new(["1.2.3.4"]);
        let ips = resolve_over_tcp("example.com", &settings).await.unwrap();
        assert_eq!(ips, vec!["93.184.216.34".parse::<IpAddr>().unwrap()]);
    }

    #[tokio::test]
    async fn test_tcp_all_fail() {
        let liar = spawn_tcp_server(vec!["1.2.3.4".parse().unwrap()]).await;

        let mut settings = UpstreamSettings::new(vec![liar]);
        settings.blacklist = DnsBlacklist::new(["1.2.3.4"]);
        settings.timeout = Duration::from_millis(500);
        let err = resolve_over_tcp("example.com", &settings).await.unwrap_err();
        assert!(matches!(err, DnsError::NoData { .. }));
    }
}
