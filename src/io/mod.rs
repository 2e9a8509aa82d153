//! I/O utilities for racing-proxy
//!
//! Tunnel relaying, replayable streams and the benign-disconnect
//! classification shared by every plugin.

mod copy;
mod rewind;
mod stream;

use std::io;

pub use copy::{bidirectional_copy, bidirectional_copy_with_buffer, CopyResult, DEFAULT_BUFFER_SIZE};
pub use rewind::Rewind;
pub use stream::{boxed, AsyncStream, BoxedStream};

/// Whether `err` is an ordinary peer disconnect
///
/// Covers the ECONNABORTED/ECONNRESET/EPIPE/ENOTCONN family. These end a
/// relay without being reported as failures.
#[must_use]
pub fn is_benign_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_benign_classification() {
        assert!(is_benign_disconnect(&io::Error::from(io::ErrorKind::ConnectionReset)));
        assert!(is_benign_disconnect(&io::Error::from(io::ErrorKind::BrokenPipe)));
        assert!(is_benign_disconnect(&io::Error::from(io::ErrorKind::NotConnected)));
        assert!(!is_benign_disconnect(&io::Error::from(io::ErrorKind::PermissionDenied)));
        assert!(!is_benign_disconnect(&io::Error::from(io::ErrorKind::TimedOut)));
    }
}
