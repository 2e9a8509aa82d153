//! Buffered HTTP/1.1 stream: head reading and body framing
//!
//! [`HttpStream`] owns a connection plus the bytes read past the last
//! parsed element, so heads, bodies and follow-up requests on a keep-alive
//! connection can be read without losing data. `into_parts` hands the
//! leftover bytes back when the connection switches to tunnelling.

use std::io;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::headers::Headers;
use super::request::{parse_request_head, RequestHead};
use super::response::{parse_response_head, ResponseHead};
use crate::error::ConnectionError;

/// Largest request or response head accepted
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Largest chunk-size or trailer line accepted
const MAX_LINE_SIZE: usize = 8 * 1024;

const READ_CHUNK: usize = 16 * 1024;

/// How a message body is delimited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    /// No body
    Empty,
    /// Exactly this many bytes
    Length(u64),
    /// `Transfer-Encoding: chunked`
    Chunked,
    /// Everything until the peer closes
    UntilClose,
}

fn is_chunked(headers: &Headers) -> bool {
    headers.has_token("Transfer-Encoding", "chunked")
}

/// Body framing of a request
#[must_use]
pub fn request_body_kind(headers: &Headers) -> BodyKind {
    if is_chunked(headers) {
        return BodyKind::Chunked;
    }
    match headers.content_length() {
        Some(n) if n > 0 => BodyKind::Length(n),
        _ => BodyKind::Empty,
    }
}

/// Body framing of a response to `method`
#[must_use]
pub fn response_body_kind(method: &str, status: u16, headers: &Headers) -> BodyKind {
    if method.eq_ignore_ascii_case("HEAD") || (100..200).contains(&status) || status == 204 || status == 304 {
        return BodyKind::Empty;
    }
    if is_chunked(headers) {
        return BodyKind::Chunked;
    }
    match headers.content_length() {
        Some(0) => BodyKind::Empty,
        Some(n) => BodyKind::Length(n),
        None => BodyKind::UntilClose,
    }
}

/// Result of relaying a body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BodyOutcome {
    /// Payload bytes relayed, excluding chunk framing
    pub bytes: u64,
    /// Whether the body ended at its framing boundary, leaving the
    /// connection positioned at the next message
    pub complete: bool,
}

/// A connection with read-ahead buffering
#[derive(Debug)]
pub struct HttpStream<S> {
    inner: S,
    buf: BytesMut,
}

impl<S> HttpStream<S> {
    /// Wrap a fresh connection
    pub fn new(inner: S) -> Self {
        Self::with_buffered(inner, Bytes::new())
    }

    /// Wrap a connection whose first bytes were already read
    pub fn with_buffered(inner: S, buffered: impl AsRef<[u8]>) -> Self {
        let mut buf = BytesMut::with_capacity(READ_CHUNK);
        buf.extend_from_slice(buffered.as_ref());
        Self { inner, buf }
    }

    /// The underlying connection
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Bytes read but not yet consumed
    #[must_use]
    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }

    /// The connection and any unconsumed bytes
    pub fn into_parts(self) -> (S, Bytes) {
        (self.inner, self.buf.freeze())
    }
}

impl<S: AsyncRead + Unpin> HttpStream<S> {
    async fn fill(&mut self) -> io::Result<usize> {
        self.buf.reserve(READ_CHUNK);
        self.inner.read_buf(&mut self.buf).await
    }

    /// Read the next request head
    ///
    /// Returns `Ok(None)` when the peer closes cleanly between requests.
    ///
    /// # Errors
    ///
    /// `BadRequest` for malformed or oversized heads, `Closed` for a
    /// truncated head, `IoError` for transport failures.
    pub async fn read_request_head(&mut self) -> Result<Option<RequestHead>, ConnectionError> {
        loop {
            if let Some((head, n)) = parse_request_head(&self.buf)? {
                self.buf.advance(n);
                return Ok(Some(head));
            }
            if self.buf.len() > MAX_HEAD_SIZE {
                return Err(ConnectionError::bad_request("request head too large"));
            }
            if self.fill().await? == 0 {
                if self.buf.iter().all(u8::is_ascii_whitespace) {
                    return Ok(None);
                }
                return Err(ConnectionError::closed("truncated request head"));
            }
        }
    }

    /// Read the next final response head, skipping `1xx` interim responses
    ///
    /// # Errors
    ///
    /// `BadResponse` for malformed or oversized heads, `Closed` when the
    /// upstream closes first, `IoError` for transport failures.
    pub async fn read_response_head(&mut self) -> Result<ResponseHead, ConnectionError> {
        loop {
            if let Some((head, n)) = parse_response_head(&self.buf)? {
                self.buf.advance(n);
                if (100..200).contains(&head.status) && head.status != 101 {
                    continue;
                }
                return Ok(head);
            }
            if self.buf.len() > MAX_HEAD_SIZE {
                return Err(ConnectionError::bad_response("response head too large"));
            }
            if self.fill().await? == 0 {
                return Err(ConnectionError::closed("upstream closed before response head"));
            }
        }
    }

    async fn read_line(&mut self) -> Result<Bytes, ConnectionError> {
        loop {
            if let Some(pos) = self.buf.windows(2).position(|w| w == b"\r\n") {
                let line = self.buf.split_to(pos).freeze();
                self.buf.advance(2);
                return Ok(line);
            }
            if self.buf.len() > MAX_LINE_SIZE {
                return Err(ConnectionError::bad_request("chunk line too long"));
            }
            if self.fill().await? == 0 {
                return Err(ConnectionError::closed("truncated chunked body"));
            }
        }
    }

    /// Next slice of at most `max` bytes, `None` at end of stream
    async fn next_slice(&mut self, max: usize) -> io::Result<Option<Bytes>> {
        if self.buf.is_empty() && self.fill().await? == 0 {
            return Ok(None);
        }
        let n = self.buf.len().min(max);
        Ok(Some(self.buf.split_to(n).freeze()))
    }

    async fn chunk_size(&mut self) -> Result<u64, ConnectionError> {
        let line = self.read_line().await?;
        let text = std::str::from_utf8(&line).map_err(|_| ConnectionError::bad_request("non-ascii chunk size"))?;
        let digits = text.split(';').next().unwrap_or_default().trim();
        u64::from_str_radix(digits, 16)
            .map_err(|_| ConnectionError::bad_request(format!("invalid chunk size {digits:?}")))
    }

    async fn skip_trailers(&mut self) -> Result<(), ConnectionError> {
        while !self.read_line().await?.is_empty() {}
        Ok(())
    }

    /// Read a whole body into memory
    ///
    /// # Errors
    ///
    /// `Closed` when the peer closes inside a framed body.
    pub async fn read_body(&mut self, kind: BodyKind) -> Result<Bytes, ConnectionError> {
        let mut out = Vec::new();
        self.copy_body_to(kind, &mut out, false).await?;
        Ok(Bytes::from(out))
    }

    /// Relay a body to `writer`
    ///
    /// With `rechunk`, payload is written as `{len:x}\r\n{data}\r\n` chunks
    /// terminated by `0\r\n\r\n`; otherwise it is written raw.
    ///
    /// # Errors
    ///
    /// `Closed` when the peer closes inside a framed body, `IoError` when
    /// writing fails.
    pub async fn copy_body_to<W>(&mut self, kind: BodyKind, writer: &mut W, rechunk: bool) -> Result<BodyOutcome, ConnectionError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut sent = 0u64;
        let complete = match kind {
            BodyKind::Empty => true,
            BodyKind::Length(total) => {
                while sent < total {
                    let want = usize::try_from(total - sent).unwrap_or(usize::MAX).min(READ_CHUNK);
                    let Some(data) = self.next_slice(want).await? else {
                        return Err(ConnectionError::closed(format!("body ended after {sent} of {total} bytes")));
                    };
                    write_payload(writer, &data, rechunk).await?;
                    sent += data.len() as u64;
                }
                true
            }
            BodyKind::Chunked => {
                loop {
                    let size = self.chunk_size().await?;
                    if size == 0 {
                        self.skip_trailers().await?;
                        break;
                    }
                    let mut left = size;
                    while left > 0 {
                        let want = usize::try_from(left).unwrap_or(usize::MAX).min(READ_CHUNK);
                        let Some(data) = self.next_slice(want).await? else {
                            return Err(ConnectionError::closed("truncated chunk"));
                        };
                        write_payload(writer, &data, rechunk).await?;
                        left -= data.len() as u64;
                        sent += data.len() as u64;
                    }
                    if !self.read_line().await?.is_empty() {
                        return Err(ConnectionError::bad_request("missing CRLF after chunk"));
                    }
                }
                true
            }
            BodyKind::UntilClose => {
                while let Some(data) = self.next_slice(READ_CHUNK).await? {
                    write_payload(writer, &data, rechunk).await?;
                    sent += data.len() as u64;
                }
                false
            }
        };
        if rechunk && kind != BodyKind::Empty {
            writer.write_all(b"0\r\n\r\n").await?;
        }
        writer.flush().await?;
        Ok(BodyOutcome { bytes: sent, complete })
    }
}

async fn write_payload<W>(writer: &mut W, data: &[u8], rechunk: bool) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    if rechunk {
        writer.write_all(format!("{:x}\r\n", data.len()).as_bytes()).await?;
        writer.write_all(data).await?;
        writer.write_all(b"\r\n").await
    } else {
        writer.write_all(data).await
    }
}
