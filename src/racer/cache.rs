//! Warm socket cache keyed by destination

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::trace;

/// Default per-key capacity
pub const DEFAULT_CACHE_CAPACITY: usize = 8;

struct Cached<S> {
    inserted: Instant,
    stream: S,
    peer: SocketAddr,
}

/// Bounded per-key queues of established connections
///
/// Entries are served oldest first and only while younger than `max_age`.
pub struct ConnectionCache<S> {
    capacity: usize,
    max_age: Duration,
    entries: Mutex<HashMap<String, VecDeque<Cached<S>>>>,
}

impl<S> std::fmt::Debug for ConnectionCache<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionCache")
            .field("capacity", &self.capacity)
            .field("max_age", &self.max_age)
            .field("keys", &self.entries.lock().len())
            .finish()
    }
}

impl<S> ConnectionCache<S> {
    /// Create an empty cache
    #[must_use]
    pub fn new(capacity: usize, max_age: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            max_age,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Store a connection under `key`, evicting the oldest if full
    pub fn put(&self, key: &str, stream: S, peer: SocketAddr) {
        let mut entries = self.entries.lock();
        let queue = entries.entry(key.to_string()).or_default();
        if queue.len() >= self.capacity {
            queue.pop_front();
        }
        queue.push_back(Cached {
            inserted: Instant::now(),
            stream,
            peer,
        });
    }

    /// Take the oldest still-fresh connection for `key`
    ///
    /// Stale entries in front of it are dropped.
    pub fn take(&self, key: &str) -> Option<(S, SocketAddr)> {
        let mut entries = self.entries.lock();
        let queue = entries.get_mut(key)?;
        let mut found = None;
        while let Some(entry) = queue.pop_front() {
            if entry.inserted.elapsed() < self.max_age {
                found = Some((entry.stream, entry.peer));
                break;
            }
            trace!(key, peer = %entry.peer, "dropping stale cached connection");
        }
        if queue.is_empty() {
            entries.remove(key);
        }
        found
    }

    /// Connections held under `key`, fresh or not
    #[must_use]
    pub fn len(&self, key: &str) -> usize {
        self.entries.lock().get(key).map_or(0, VecDeque::len)
    }

    /// Whether nothing is cached at all
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
