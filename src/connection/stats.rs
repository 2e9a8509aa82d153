//! Proxy statistics
//!
//! Client connections are counted by the accept loop and the connection
//! tasks, requests by the plugin that answered them. Race outcomes live in
//! each racer's [`RaceCounters`](crate::racer::RaceCounters) and are folded
//! into [`StatsSnapshot`] on demand.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::io::CopyResult;
use crate::racer::{Connector, RaceSnapshot};

/// What answered a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    /// Sent to the origin by the direct plugin
    Forwarded,
    /// CONNECT relayed by the direct plugin
    Tunnelled,
    /// Answered locally
    Mocked,
    /// CONNECT intercepted by the strip plugin
    Stripped,
    /// No filter took the request
    Unmatched,
}

impl Handled {
    const ALL: [Self; 5] = [
        Self::Forwarded,
        Self::Tunnelled,
        Self::Mocked,
        Self::Stripped,
        Self::Unmatched,
    ];

    const fn slot(self) -> usize {
        match self {
            Self::Forwarded => 0,
            Self::Tunnelled => 1,
            Self::Mocked => 2,
            Self::Stripped => 3,
            Self::Unmatched => 4,
        }
    }
}

/// Counters shared by the accept loop, connection tasks and the handler
#[derive(Debug, Default)]
pub struct ProxyStats {
    accepted: AtomicU64,
    rejected: AtomicU64,
    closed: AtomicU64,
    failed: AtomicU64,
    requests: [AtomicU64; Handled::ALL.len()],
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
}

impl ProxyStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A client took a connection slot
    pub fn client_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    /// A client was turned away at the limit or during shutdown
    pub fn client_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// A client connection ended cleanly after relaying `relayed`
    pub fn client_closed(&self, relayed: &CopyResult) {
        self.closed.fetch_add(1, Ordering::Relaxed);
        self.bytes_up.fetch_add(relayed.client_to_upstream, Ordering::Relaxed);
        self.bytes_down.fetch_add(relayed.upstream_to_client, Ordering::Relaxed);
    }

    /// A client connection ended with an error or was cut by shutdown
    pub fn client_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// One request was answered by `how`
    pub fn request_handled(&self, how: Handled) {
        self.requests[how.slot()].fetch_add(1, Ordering::Relaxed);
    }

    /// Client connection counts
    #[must_use]
    pub fn clients(&self) -> ClientCounts {
        let accepted = self.accepted.load(Ordering::Relaxed);
        let closed = self.closed.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        ClientCounts {
            accepted,
            active: accepted.saturating_sub(closed + failed),
            closed,
            failed,
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }

    /// Request counts per answering plugin
    #[must_use]
    pub fn requests(&self) -> RequestCounts {
        let load = |how: Handled| self.requests[how.slot()].load(Ordering::Relaxed);
        RequestCounts {
            forwarded: load(Handled::Forwarded),
            tunnelled: load(Handled::Tunnelled),
            mocked: load(Handled::Mocked),
            stripped: load(Handled::Stripped),
            unmatched: load(Handled::Unmatched),
        }
    }

    /// Everything, with the race outcomes of `connector`
    #[must_use]
    pub fn snapshot(&self, connector: &Connector) -> StatsSnapshot {
        StatsSnapshot {
            clients: self.clients(),
            requests: self.requests(),
            bytes_up: self.bytes_up.load(Ordering::Relaxed),
            bytes_down: self.bytes_down.load(Ordering::Relaxed),
            tcp: connector.tcp.counters().snapshot(),
            tls: connector.tls.counters().snapshot(),
        }
    }
}

/// Client connection counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientCounts {
    pub accepted: u64,
    /// Accepted and not yet finished
    pub active: u64,
    pub closed: u64,
    pub failed: u64,
    pub rejected: u64,
}

/// Requests per answering plugin
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestCounts {
    pub forwarded: u64,
    pub tunnelled: u64,
    pub mocked: u64,
    pub stripped: u64,
    pub unmatched: u64,
}

impl RequestCounts {
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.forwarded + self.tunnelled + self.mocked + self.stripped + self.unmatched
    }
}

/// Serialisable view of the proxy counters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub clients: ClientCounts,
    pub requests: RequestCounts,
    /// Tunnel bytes and request bodies, client to origin
    pub bytes_up: u64,
    /// Tunnel bytes, origin to client
    pub bytes_down: u64,
    /// Plain TCP racer
    pub tcp: RaceSnapshot,
    /// TLS racer
    pub tls: RaceSnapshot,
}
