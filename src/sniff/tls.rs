//! ClientHello inspection with a full TLS parser
//!
//! With the `sni-sniffing` feature the record is parsed by `tls-parser`,
//! which handles arbitrary compression lists and multi-entry server name
//! lists. Without it the fixed-offset parser in `hello.rs` is used.

use tracing::trace;

/// TLS `ContentType` for Handshake
const TLS_CONTENT_TYPE_HANDSHAKE: u8 = 0x16;

/// TLS `HandshakeType` for `ClientHello`
const TLS_HANDSHAKE_TYPE_CLIENT_HELLO: u8 = 0x01;

/// Minimum TLS record header size
const TLS_RECORD_HEADER_SIZE: usize = 5;

/// What a ClientHello reveals about the tunnel it opens
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsSniffResult {
    /// server_name host
    pub sni: Option<String>,
    /// Record layer version
    pub version: Option<u16>,
    /// Offered ALPN protocols
    pub alpn: Vec<String>,
}

#[cfg(feature = "sni-sniffing")]
mod parser_impl {
    use super::{trace, TlsSniffResult, TLS_CONTENT_TYPE_HANDSHAKE, TLS_RECORD_HEADER_SIZE};
    use tls_parser::{
        parse_tls_extensions, parse_tls_plaintext, SNIType, TlsExtension, TlsMessage,
        TlsMessageHandshake,
    };

    /// Parse a ClientHello record; `None` if `data` is not one
    #[must_use]
    pub fn sniff_tls(data: &[u8]) -> Option<TlsSniffResult> {
        if data.len() < TLS_RECORD_HEADER_SIZE || data[0] != TLS_CONTENT_TYPE_HANDSHAKE {
            return None;
        }

        let (_, record) = match parse_tls_plaintext(data) {
            Ok(parsed) => parsed,
            Err(e) => {
                trace!("Failed to parse TLS record: {:?}", e);
                return None;
            }
        };

        let hello = record.msg.iter().find_map(|msg| match msg {
            TlsMessage::Handshake(TlsMessageHandshake::ClientHello(hello)) => Some(hello),
            _ => None,
        })?;

        let mut result = TlsSniffResult {
            version: Some(record.hdr.version.0),
            ..TlsSniffResult::default()
        };

        let Some(ext_data) = hello.ext else {
            return Some(result);
        };
        let Ok((_, extensions)) = parse_tls_extensions(ext_data) else {
            trace!("Failed to parse ClientHello extensions");
            return Some(result);
        };

        for ext in extensions {
            match ext {
                TlsExtension::SNI(names) => {
                    result.sni = names
                        .iter()
                        .filter(|(kind, _)| *kind == SNIType::HostName)
                        .find_map(|(_, name)| std::str::from_utf8(name).ok())
                        .filter(|name| is_valid_hostname(name))
                        .map(str::to_owned);
                }
                TlsExtension::ALPN(protocols) => {
                    result.alpn = protocols
                        .iter()
                        .filter_map(|p| std::str::from_utf8(p).ok())
                        .map(str::to_owned)
                        .collect();
                }
                _ => {}
            }
        }

        Some(result)
    }

    fn is_valid_hostname(hostname: &str) -> bool {
        !hostname.is_empty()
            && hostname.len() <= 253
            && hostname
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_')
    }
}

#[cfg(not(feature = "sni-sniffing"))]
mod parser_impl {
    use super::TlsSniffResult;

    /// Parse a ClientHello record; `None` if `data` is not one
    #[must_use]
    pub fn sniff_tls(data: &[u8]) -> Option<TlsSniffResult> {
        if !super::looks_like_tls(data) {
            return None;
        }
        Some(TlsSniffResult {
            sni: super::super::extract_sni(data),
            version: Some(u16::from_be_bytes([data[1], data[2]])),
            alpn: Vec::new(),
        })
    }
}

pub use parser_impl::sniff_tls;

/// SNI host of a ClientHello, if any
#[must_use]
pub fn sniff_tls_sni(data: &[u8]) -> Option<String> {
    sniff_tls(data).and_then(|r| r.sni)
}

/// Cheap check for a TLS handshake record carrying a ClientHello
///
/// Only the record header and handshake type are inspected, so a partial
/// read is enough.
#[must_use]
pub fn looks_like_tls(data: &[u8]) -> bool {
    if data.len() < TLS_RECORD_HEADER_SIZE || data[0] != TLS_CONTENT_TYPE_HANDSHAKE {
        return false;
    }

    let version = u16::from_be_bytes([data[1], data[2]]);
    if !(0x0300..=0x0304).contains(&version) {
        return false;
    }

    data.get(TLS_RECORD_HEADER_SIZE)
        .map_or(true, |&t| t == TLS_HANDSHAKE_TYPE_CLIENT_HELLO)
}

/// Build a minimal ClientHello record for tests and benchmarks
#[doc(hidden)]
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn build_client_hello(sni: &str, alpn_protocols: &[&str]) -> Vec<u8> {
    fn with_len16(body: Vec<u8>) -> Vec<u8> {
        let mut out = (body.len() as u16).to_be_bytes().to_vec();
        out.extend(body);
        out
    }

    let mut extensions = Vec::new();
    if !sni.is_empty() {
        let mut entry = vec![0x00];
        entry.extend(with_len16(sni.as_bytes().to_vec()));
        extensions.extend_from_slice(&[0x00, 0x00]);
        extensions.extend(with_len16(with_len16(entry)));
    }
    if !alpn_protocols.is_empty() {
        let mut list = Vec::new();
        for proto in alpn_protocols {
            list.push(proto.len() as u8);
            list.extend_from_slice(proto.as_bytes());
        }
        extensions.extend_from_slice(&[0x00, 0x10]);
        extensions.extend(with_len16(with_len16(list)));
    }

    let mut hello = vec![0x03, 0x03];
    hello.extend_from_slice(&[0u8; 32]);
    hello.push(0x00); // session id
    hello.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]); // one cipher suite
    hello.extend_from_slice(&[0x01, 0x00]); // null compression
    hello.extend(with_len16(extensions));

    let mut handshake = vec![TLS_HANDSHAKE_TYPE_CLIENT_HELLO];
    handshake.extend_from_slice(&(hello.len() as u32).to_be_bytes()[1..]);
    handshake.extend(hello);

    let mut record = vec![TLS_CONTENT_TYPE_HANDSHAKE, 0x03, 0x01];
    record.extend(with_len16(handshake));
    record
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sniff_tls_sni() {
        let data = build_client_hello("example.com", &[]);
        assert_eq!(sniff_tls_sni(&data), Some("example.com".to_string()));
    }

    #[test]
    fn test_sniff_tls_full_result() {
        let data = build_client_hello("example.com", &["h2", "http/1.1"]);
        let result = sniff_tls(&data).unwrap();

        assert_eq!(result.sni.as_deref(), Some("example.com"));
        assert_eq!(result.version, Some(0x0301));
        assert_eq!(result.alpn, vec!["h2".to_string(), "http/1.1".to_string()]);
    }

    #[test]
    fn test_builder_agrees_with_offset_parser() {
        let data = build_client_hello("very.long.subdomain.example.com", &["h2"]);
        assert!(crate::sniff::is_client_hello(&data));
        assert_eq!(
            crate::sniff::extract_sni(&data).as_deref(),
            Some("very.long.subdomain.example.com")
        );
    }

    #[test]
    fn test_no_sni() {
        let data = build_client_hello("", &["h2"]);
        let result = sniff_tls(&data).unwrap();
        assert_eq!(result.sni, None);
    }

    #[test]
    fn test_sniff_tls_not_tls() {
        assert_eq!(sniff_tls_sni(b"GET / HTTP/1.1\r\nHost: example.com\r\n"), None);
        assert_eq!(sniff_tls_sni(&[0x16, 0x03, 0x01]), None);
    }

    #[test]
    fn test_looks_like_tls() {
        let data = build_client_hello("test.com", &[]);
        assert!(looks_like_tls(&data));
        assert!(looks_like_tls(&data[..5]));
        assert!(!looks_like_tls(b"GET / HTTP/1.1\r\n"));
        assert!(!looks_like_tls(&[0x16, 0x03]));

        let mut data = data;
        data[5] = 0x02;
        assert!(!looks_like_tls(&data));
        assert_eq!(sniff_tls_sni(&data), None);
    }
}
