//! Type-erased client streams
//!
//! A client connection may be plain TCP, a replayed prefix over TCP, or a
//! server-side TLS session layered on either. Handlers work on
//! [`BoxedStream`] so that nesting stays a finite type.

use tokio::io::{AsyncRead, AsyncWrite};

/// Any bidirectional async byte stream usable across tasks
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Heap-allocated client stream
pub type BoxedStream = Box<dyn AsyncStream>;

/// Box any stream into a [`BoxedStream`]
pub fn boxed<S: AsyncStream + 'static>(stream: S) -> BoxedStream {
    Box::new(stream)
}
