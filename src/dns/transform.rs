//! Per-server query rewriting
//!
//! Some resolvers are matched by on-path injectors on the exact bytes of a
//! query. A [`QueryTransform`] gets to rewrite the name and the serialized
//! packet before it is sent to a given server.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use hickory_proto::rr::RecordType;

/// Rewrites queries bound for particular servers
pub trait QueryTransform: Send + Sync + std::fmt::Debug {
    /// Whether this transform applies to `server`
    fn applies_to(&self, server: &SocketAddr) -> bool;

    /// Rewrite the query name before the message is built
    fn transform_name(&self, name: &str) -> String;

    /// Rewrite the serialized query
    fn transform_packet(&self, packet: Vec<u8>, record_type: RecordType) -> Vec<u8>;
}

/// Mixed-case names and a compression pointer for Google Public DNS
///
/// The name is title-cased (`www.google.com` becomes `Www.Google.Com`) and,
/// for `A` queries, the root label terminating the question name is
/// replaced with the pointer `c0 04`.
#[derive(Debug, Clone, Copy, Default)]
pub struct GooglePublicDnsTransform;

const GOOGLE_SERVERS: [Ipv4Addr; 2] = [Ipv4Addr::new(8, 8, 8, 8), Ipv4Addr::new(8, 8, 4, 4)];

impl QueryTransform for GooglePublicDnsTransform {
    fn applies_to(&self, server: &SocketAddr) -> bool {
        matches!(server.ip(), IpAddr::V4(ip) if GOOGLE_SERVERS.contains(&ip))
    }

    fn transform_name(&self, name: &str) -> String {
        title_case(name)
    }

    fn transform_packet(&self, mut packet: Vec<u8>, record_type: RecordType) -> Vec<u8> {
        // Question trailer: root label (1) + qtype (2) + qclass (2)
        if record_type == RecordType::A && packet.len() >= 5 {
            let at = packet.len() - 5;
            packet.splice(at..=at, [0xc0, 0x04]);
        }
        packet
    }
}

/// Uppercase every letter that follows a non-letter, lowercase the rest
fn title_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut after_letter = false;
    for c in name.chars() {
        if c.is_alphabetic() {
            if after_letter {
                out.extend(c.to_lowercase());
            } else {
                out.extend(c.to_uppercase());
            }
            after_letter = true;
        } else {
            out.push(c);
            after_letter = false;
        }
    }
    out
}
