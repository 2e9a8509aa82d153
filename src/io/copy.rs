//! Bidirectional relay between a client stream and an upstream stream
//!
//! Both directions are driven from a single future. When one side reaches
//! EOF its peer is shut down for writing and the other direction keeps
//! flowing until it finishes too.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;

use super::is_benign_disconnect;

/// Default relay buffer size per direction
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

/// Result of a bidirectional copy operation
#[derive(Debug, Clone, Copy, Default)]
pub struct CopyResult {
    /// Bytes transferred from client to upstream
    pub client_to_upstream: u64,
    /// Bytes transferred from upstream to client
    pub upstream_to_client: u64,
}

impl CopyResult {
    /// Total bytes transferred in both directions
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.client_to_upstream + self.upstream_to_client
    }
}

struct BidirectionalCopy<'a, A: ?Sized, B: ?Sized> {
    a: &'a mut A,
    b: &'a mut B,
    a_to_b: TransferState,
    b_to_a: TransferState,
}

/// State for one direction of transfer
struct TransferState {
    buf: Box<[u8]>,
    read_done: bool,
    finished: bool,
    pos: usize,
    cap: usize,
    bytes_transferred: u64,
    error: Option<io::Error>,
}

impl TransferState {
    fn new(buf_size: usize) -> Self {
        Self {
            buf: vec![0u8; buf_size].into_boxed_slice(),
            read_done: false,
            finished: false,
            pos: 0,
            cap: 0,
            bytes_transferred: 0,
            error: None,
        }
    }

    /// Poll this direction; returns `Ready` once it has finished (cleanly or not).
    fn poll_direction<R, W>(
        &mut self,
        cx: &mut Context<'_>,
        reader: Pin<&mut R>,
        writer: Pin<&mut W>,
    ) -> Poll<()>
    where
        R: AsyncRead + ?Sized,
        W: AsyncWrite + ?Sized,
    {
        if self.finished {
            return Poll::Ready(());
        }
        match self.poll_transfer(cx, reader, writer) {
            Poll::Ready(result) => {
                self.finished = true;
                if let Err(e) = result {
                    self.error = Some(e);
                }
                Poll::Ready(())
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_transfer<R, W>(
        &mut self,
        cx: &mut Context<'_>,
        mut reader: Pin<&mut R>,
        mut writer: Pin<&mut W>,
    ) -> Poll<io::Result<()>>
    where
        R: AsyncRead + ?Sized,
        W: AsyncWrite + ?Sized,
    {
        loop {
            if self.pos < self.cap {
                let n = match writer.as_mut().poll_write(cx, &self.buf[self.pos..self.cap]) {
                    Poll::Ready(Ok(0)) => {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::WriteZero,
                            "write zero bytes",
                        )));
                    }
                    Poll::Ready(Ok(n)) => n,
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => return Poll::Pending,
                };
                self.pos += n;
                self.bytes_transferred += n as u64;

                if self.pos == self.cap {
                    self.pos = 0;
                    self.cap = 0;
                }
            } else if self.read_done {
                if let Err(e) = futures::ready!(writer.as_mut().poll_flush(cx)) {
                    return Poll::Ready(Err(e));
                }
                return writer.as_mut().poll_shutdown(cx);
            } else {
                let mut read_buf = ReadBuf::new(&mut self.buf);
                match reader.as_mut().poll_read(cx, &mut read_buf) {
                    Poll::Ready(Ok(())) => {
                        let n = read_buf.filled().len();
                        if n == 0 {
                            self.read_done = true;
                        } else {
                            self.cap = n;
                        }
                    }
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => {
                        // Flush what earlier writes may have buffered before parking.
                        if let Poll::Ready(Err(e)) = writer.as_mut().poll_flush(cx) {
                            return Poll::Ready(Err(e));
                        }
                        return Poll::Pending;
                    }
                }
            }
        }
    }
}

impl<A, B> std::future::Future for BidirectionalCopy<'_, A, B>
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    type Output = io::Result<CopyResult>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;

        let a_to_b = this
            .a_to_b
            .poll_direction(cx, Pin::new(&mut *this.a), Pin::new(&mut *this.b));
        let b_to_a = this
            .b_to_a
            .poll_direction(cx, Pin::new(&mut *this.b), Pin::new(&mut *this.a));

        // An error on one side means the tunnel is gone; stop the other too.
        let failed = this.a_to_b.error.is_some() || this.b_to_a.error.is_some();
        if !(failed || (a_to_b.is_ready() && b_to_a.is_ready())) {
            return Poll::Pending;
        }

        let result = CopyResult {
            client_to_upstream: this.a_to_b.bytes_transferred,
            upstream_to_client: this.b_to_a.bytes_transferred,
        };

        for (direction, error) in [
            ("client->upstream", this.a_to_b.error.take()),
            ("upstream->client", this.b_to_a.error.take()),
        ] {
            if let Some(e) = error {
                if is_benign_disconnect(&e) {
                    debug!("{} closed: {}", direction, e);
                } else {
                    return Poll::Ready(Err(e));
                }
            }
        }

        Poll::Ready(Ok(result))
    }
}

/// Relay bytes between `client` and `upstream` until both directions finish
///
/// Benign disconnects (reset, abort, broken pipe, not connected) end the
/// relay quietly; any other I/O error is returned.
///
/// # Errors
///
/// Returns the first non-benign I/O error seen in either direction.
pub async fn bidirectional_copy<A, B>(client: &mut A, upstream: &mut B) -> io::Result<CopyResult>
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    bidirectional_copy_with_buffer(client, upstream, DEFAULT_BUFFER_SIZE).await
}

/// Same as [`bidirectional_copy`] with a custom per-direction buffer size
///
/// # Errors
///
/// Returns the first non-benign I/O error seen in either direction.
pub async fn bidirectional_copy_with_buffer<A, B>(
    client: &mut A,
    upstream: &mut B,
    buf_size: usize,
) -> io::Result<CopyResult>
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    BidirectionalCopy {
        a: client,
        b: upstream,
        a_to_b: TransferState::new(buf_size),
        b_to_a: TransferState::new(buf_size),
    }
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_bidirectional_copy() {
        // client_far <-> client_near ==relay== upstream_near <-> upstream_far
        let (mut client_far, mut client_near) = duplex(64);
        let (mut upstream_near, mut upstream_far) = duplex(64);

        let relay = tokio::spawn(async move {
            bidirectional_copy(&mut client_near, &mut upstream_near).await
        });

        client_far.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        upstream_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        upstream_far.write_all(b"world!").await.unwrap();
        let mut buf = [0u8; 6];
        client_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world!");

        client_far.shutdown().await.unwrap();
        upstream_far.shutdown().await.unwrap();

        let result = relay.await.unwrap().unwrap();
        assert_eq!(result.client_to_upstream, 5);
        assert_eq!(result.upstream_to_client, 6);
    }

    #[test]
    fn test_copy_result_total() {
        let result = CopyResult {
            client_to_upstream: 100,
            upstream_to_client: 200,
        };
        assert_eq!(result.total(), 300);
    }
}
