//! ClientHello detection and byte-offset SNI extraction
//!
//! `extract_sni` walks the hello with fixed offsets:
//!
//! ```text
//! 0x00  record header (5) + handshake header (4) + version (2) + random (32)
//! 0x2b  session_id_len (1) + session_id
//!       cipher_suites_len (2) + cipher_suites + 2 bytes
//!       extensions_len (2)
//!       { type (2) len (2) data } ...
//! ```
//!
//! The two bytes skipped after the cipher suites are the compression
//! methods length and the single null method every modern client sends.
//! Hellos with more than one compression method are not supported here;
//! [`super::sniff_tls`] handles those.

/// Offset of the session id length byte
const SESSION_ID_OFFSET: usize = 0x2b;

/// Bytes before the host name inside a server_name extension body
const SERVER_NAME_HEADER: usize = 5;

/// Shortest buffer that can hold a hello worth inspecting
const MIN_HELLO_LEN: usize = 20;

/// Whether `data` is exactly one TLS or SSLv2-framed ClientHello record
///
/// TLS: `16 03 xx` with a declared record length covering the rest of the
/// buffer. SSLv2: `80 len .. 01 03` with `len` covering the rest.
#[must_use]
pub fn is_client_hello(data: &[u8]) -> bool {
    if data.len() < MIN_HELLO_LEN {
        return false;
    }
    if data.starts_with(&[0x16, 0x03]) {
        let declared = usize::from(u16::from_be_bytes([data[3], data[4]]));
        return data.len() == 5 + declared;
    }
    if data[0] == 0x80 && data[2..4] == [0x01, 0x03] {
        return data.len() == 2 + usize::from(data[1]);
    }
    false
}

/// Extract the server_name from a TLS ClientHello using fixed offsets
///
/// Returns `None` for SSLv2 hellos, truncated input and hellos without a
/// server_name extension.
#[must_use]
pub fn extract_sni(data: &[u8]) -> Option<String> {
    if !data.starts_with(&[0x16, 0x03]) {
        return None;
    }

    let mut cursor = Cursor::new(data, SESSION_ID_OFFSET);
    let session_id_len = usize::from(cursor.u8()?);
    cursor.skip(session_id_len)?;
    let cipher_suites_len = usize::from(cursor.u16()?);
    cursor.skip(cipher_suites_len + 2)?;
    let _extensions_len = cursor.u16()?;

    while !cursor.is_empty() {
        let ext_type = cursor.u16()?;
        let ext_len = usize::from(cursor.u16()?);
        let body = cursor.take(ext_len)?;
        if ext_type == 0 {
            let name = body.get(SERVER_NAME_HEADER..)?;
            return String::from_utf8(name.to_vec()).ok();
        }
    }
    None
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    const fn new(data: &'a [u8], pos: usize) -> Self {
        Self { data, pos }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let slice = self.data.get(self.pos..self.pos.checked_add(n)?)?;
        self.pos += n;
        Some(slice)
    }

    fn skip(&mut self, n: usize) -> Option<()> {
        self.take(n).map(|_| ())
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }
}
