//! Upstream name resolution with poisoned-answer filtering
//!
//! Hostnames are resolved by racing UDP queries against every configured
//! server, discarding replies that contain blacklisted addresses, and
//! falling back to DNS over TCP when no clean UDP answer arrives.
//!
//! # Example
//!
//! ```no_run
//! use racing_proxy::dns::{DnsResolver, Resolve, UpstreamSettings};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let resolver = DnsResolver::new(UpstreamSettings::new(vec!["8.8.8.8:53".parse()?]));
//! let ips = resolver.resolve("www.example.com").await?;
//! println!("{ips:?}");
//! # Ok(())
//! # }
//! ```

mod blacklist;
mod error;
mod resolver;
mod tcp;
mod transform;
mod udp;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RData, RecordType};

pub use blacklist::DnsBlacklist;
pub use error::{DnsError, DnsResult};
pub use resolver::{DnsResolver, Resolve};
pub use tcp::resolve_over_tcp;
pub use transform::{GooglePublicDnsTransform, QueryTransform};
pub use udp::resolve_over_udp;

/// Standard DNS port
pub const DNS_PORT: u16 = 53;

/// How the upstream servers are queried
#[derive(Debug, Clone)]
pub struct UpstreamSettings {
    /// Servers to query; IPv4 servers get `A` queries, IPv6 servers `AAAA`
    pub servers: Vec<SocketAddr>,
    /// Addresses that mark a reply as forged
    pub blacklist: DnsBlacklist,
    /// Servers whose error replies are final
    pub trusted: Vec<IpAddr>,
    /// Budget for the UDP rounds, and separately for the TCP fallback
    pub timeout: Duration,
    /// UDP send rounds within `timeout`
    pub udp_attempts: usize,
    /// Optional per-server query rewriting
    pub transform: Option<Arc<dyn QueryTransform>>,
}

impl UpstreamSettings {
    /// Settings with defaults for everything but the server list
    #[must_use]
    pub fn new(servers: Vec<SocketAddr>) -> Self {
        Self {
            servers,
            blacklist: DnsBlacklist::default(),
            trusted: Vec::new(),
            timeout: Duration::from_secs(2),
            udp_attempts: 4,
            transform: None,
        }
    }

    /// Build from configuration
    ///
    /// # Errors
    ///
    /// Returns `DnsError::InvalidName` if a server address cannot be parsed.
    pub fn from_config(config: &crate::config::DnsConfig) -> DnsResult<Self> {
        let servers = config
            .servers
            .iter()
            .map(|s| {
                parse_server_addr(s)
                    .ok_or_else(|| DnsError::invalid_name(s.as_str(), "not a DNS server address"))
            })
            .collect::<DnsResult<Vec<_>>>()?;

        Ok(Self {
            servers,
            blacklist: DnsBlacklist::new(config.blacklist.iter().cloned()),
            trusted: config.trusted_servers.clone(),
            timeout: config.timeout(),
            udp_attempts: config.udp_attempts.max(1),
            transform: config
                .google_query_transform
                .then(|| Arc::new(GooglePublicDnsTransform) as Arc<dyn QueryTransform>),
        })
    }

    pub(crate) fn server_labels(&self) -> Vec<String> {
        self.servers.iter().map(ToString::to_string).collect()
    }
}

/// Parse `"8.8.8.8"`, `"8.8.8.8:5353"`, `"2001:db8::1"` or `"[2001:db8::1]:53"`
#[must_use]
pub fn parse_server_addr(s: &str) -> Option<SocketAddr> {
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Some(addr);
    }
    s.trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .ok()
        .map(|ip| SocketAddr::new(ip, DNS_PORT))
}

/// Parse a literal IP, accepting the bracketed IPv6 form
#[must_use]
pub fn parse_literal_ip(host: &str) -> Option<IpAddr> {
    host.trim_start_matches('[').trim_end_matches(']').parse().ok()
}

/// Build a recursive query for `name`
pub(crate) fn build_query(name: &str, record_type: RecordType, id: u16) -> DnsResult<Message> {
    let name = Name::from_ascii(name).map_err(|e| DnsError::invalid_name(name, e.to_string()))?;

    let mut message = Message::new();
    message
        .set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true);
    message.add_query(Query::query(name, record_type));
    Ok(message)
}

/// Serialize `host`'s query for `server`, applying the transform if it matches
pub(crate) fn encode_query(
    host: &str,
    server: &SocketAddr,
    id: u16,
    transform: Option<&dyn QueryTransform>,
) -> DnsResult<Vec<u8>> {
    let record_type = if server.is_ipv6() {
        RecordType::AAAA
    } else {
        RecordType::A
    };
    let transform = transform.filter(|t| t.applies_to(server));

    let name = transform.map_or_else(|| host.to_string(), |t| t.transform_name(host));
    let packet = build_query(&name, record_type, id)?
        .to_vec()
        .map_err(|e| DnsError::serialize(e.to_string()))?;

    Ok(match transform {
        Some(t) => t.transform_packet(packet, record_type),
        None => packet,
    })
}

/// Answer addresses of a reply (A and AAAA records only)
pub(crate) fn answer_ips(message: &Message) -> Vec<IpAddr> {
    message
        .answers()
        .iter()
        .filter_map(|record| match record.data() {
            Some(RData::A(a)) => Some(IpAddr::V4(a.0)),
            Some(RData::AAAA(aaaa)) => Some(IpAddr::V6(aaaa.0)),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod testing {
    //! Reply builders shared by the resolver tests

    use std::net::IpAddr;

    use hickory_proto::op::{Message, MessageType, ResponseCode};
    use hickory_proto::rr::rdata::{A, AAAA};
    use hickory_proto::rr::{RData, Record};

    /// Answer `query` with `ips` and `rcode`
    pub fn reply(query: &[u8], ips: &[IpAddr], rcode: ResponseCode) -> Vec<u8> {
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
            let rdata = match ip {
                IpAddr::V4(v4) => RData::A(A(*v4)),
                IpAddr::V6(v6) => RData::AAAA(AAAA(*v6)),
            };
            response.add_answer(Record::from_rdata(name.clone(), 60, rdata));
        }
        response.to_vec().unwrap()
    }
}
