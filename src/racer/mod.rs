//! Connection racing
//!
//! For every outbound connection the racer resolves the destination, picks
//! a window of candidate endpoints from the quality tracker, dials them all
//! at once and hands back whichever finishes first. Everything else keeps
//! running in the background: its outcome is still recorded, and fast
//! losers are parked in the [`ConnectionCache`] for the next request.
//!
//! Two traffic classes are raced independently, plain TCP and TLS, each
//! with its own tracker and cache. The TCP racer reads the TLS tracker to
//! size its window.

mod cache;
mod counters;
mod dialer;
mod quality;
mod select;
mod tls;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace};

pub use cache::{ConnectionCache, DEFAULT_CACHE_CAPACITY};
pub use counters::{RaceCounters, RaceSnapshot};
pub use dialer::{DialTarget, Dialed, Dialer, TcpDialer, RECV_BUFFER_SIZE};
pub use quality::{AddressQualityTracker, Classified, Endpoint, QualitySettings, QualitySnapshot};
pub use select::{dial_set, window_size, SelectionPolicy, WindowInputs};
pub use tls::{ensure_crypto_provider, issuer_common_name, IssuerPolicy, TlsDialer};

use crate::config::RacerConfig;
use crate::dns::Resolve;
use crate::error::DialError;

/// Upper bound on a loser's latency for it to be cached
const MAX_CACHEABLE_LATENCY: Duration = Duration::from_secs(1);

/// Racer-wide settings
#[derive(Debug, Clone)]
pub struct RacerSettings {
    /// Base racing window
    pub max_window: usize,
    /// Per-endpoint connect cap, also the cache entry lifetime
    pub connect_timeout: Duration,
    /// Cache fast losers
    pub cache_sock: bool,
    /// Per-key cache capacity
    pub cache_capacity: usize,
}

impl Default for RacerSettings {
    fn default() -> Self {
        Self {
            max_window: 4,
            connect_timeout: Duration::from_secs(6),
            cache_sock: false,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
        }
    }
}

/// Per-call dial options
#[derive(Debug, Clone)]
pub struct DialOptions {
    /// Racing rounds before giving up
    pub max_retry: usize,
    /// Cache key; consulted before racing and used to park losers
    pub cache_key: Option<String>,
    /// Payload sent right after connect; disables the cache
    pub early_data: Option<Bytes>,
    /// Verify the certificate chain and issuer (TLS only)
    pub validate: bool,
    /// HEAD-probe after the handshake (TLS only)
    pub headfirst: bool,
}

impl Default for DialOptions {
    fn default() -> Self {
        Self {
            max_retry: 4,
            cache_key: None,
            early_data: None,
            validate: false,
            headfirst: false,
        }
    }
}

impl DialOptions {
    /// Options with `max_retry` rounds and nothing else
    #[must_use]
    pub fn with_retry(max_retry: usize) -> Self {
        Self {
            max_retry,
            ..Self::default()
        }
    }
}

/// The connection handed back by [`ConnectionRacer::dial_best`]
#[derive(Debug)]
pub struct RacedConnection<S> {
    /// The connection
    pub stream: S,
    /// Endpoint it is connected to
    pub peer: SocketAddr,
    /// Observed latency; zero for cached connections
    pub latency: Duration,
    /// Served from the connection cache without dialing
    pub from_cache: bool,
}

type DialResult<S> = Result<Dialed<S>, DialError>;

/// Races dials for one traffic class
pub struct ConnectionRacer<D: Dialer> {
    dialer: Arc<D>,
    resolver: Arc<dyn Resolve>,
    tracker: Arc<AddressQualityTracker>,
    peer_tracker: Option<Arc<AddressQualityTracker>>,
    cache: Arc<ConnectionCache<D::Stream>>,
    counters: Arc<RaceCounters>,
    policy: SelectionPolicy,
    settings: RacerSettings,
}

impl<D: Dialer> std::fmt::Debug for ConnectionRacer<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRacer")
            .field("policy", &self.policy)
            .field("settings", &self.settings)
            .field("quality", &self.tracker.snapshot())
            .field("races", &self.counters.snapshot())
            .finish_non_exhaustive()
    }
}

impl<D: Dialer> ConnectionRacer<D> {
    /// Create a racer
    pub fn new(
        dialer: D,
        resolver: Arc<dyn Resolve>,
        tracker: Arc<AddressQualityTracker>,
        policy: SelectionPolicy,
        settings: RacerSettings,
    ) -> Self {
        let cache = Arc::new(ConnectionCache::new(settings.cache_capacity, settings.connect_timeout));
        Self {
            dialer: Arc::new(dialer),
            resolver,
            tracker,
            peer_tracker: None,
            cache,
            counters: Arc::default(),
            policy,
            settings,
        }
    }

    /// Let another tracker's history influence the window size
    #[must_use]
    pub fn with_peer_tracker(mut self, peer: Arc<AddressQualityTracker>) -> Self {
        self.peer_tracker = Some(peer);
        self
    }

    /// Quality tracker of this racer
    #[must_use]
    pub fn tracker(&self) -> &Arc<AddressQualityTracker> {
        &self.tracker
    }

    /// Connection cache of this racer
    #[must_use]
    pub fn cache(&self) -> &Arc<ConnectionCache<D::Stream>> {
        &self.cache
    }

    /// Race outcome counters of this racer
    #[must_use]
    pub fn counters(&self) -> &RaceCounters {
        &self.counters
    }

    /// Park a reusable connection under `key`
    pub fn release(&self, key: &str, stream: D::Stream, peer: SocketAddr) {
        trace!(key, %peer, "connection returned to cache");
        self.cache.put(key, stream, peer);
    }

    /// Dial `host:port`, returning the fastest connection
    ///
    /// # Errors
    ///
    /// `DialError::Resolve` or `DialError::NoAddress` if the host yields no
    /// endpoints; otherwise the last dial error once every round failed.
    pub async fn dial_best(
        &self,
        host: &str,
        port: u16,
        timeout: Duration,
        opts: DialOptions,
    ) -> Result<RacedConnection<D::Stream>, DialError> {
        let cache_key = if opts.early_data.is_some() {
            None
        } else {
            opts.cache_key
        };

        if let Some(key) = cache_key.as_deref() {
            if let Some((stream, peer)) = self.cache.take(key) {
                debug!(host, port, key, %peer, "serving cached connection");
                self.counters.cache_hit();
                return Ok(RacedConnection {
                    stream,
                    peer,
                    latency: Duration::ZERO,
                    from_cache: true,
                });
            }
        }

        let addresses: Vec<Endpoint> = self
            .resolver
            .resolve(host)
            .await?
            .into_iter()
            .map(|ip| SocketAddr::new(ip, port))
            .collect();
        if addresses.is_empty() {
            return Err(DialError::NoAddress { host: host.to_string() });
        }

        let target = Arc::new(DialTarget {
            host: host.to_string(),
            early_data: opts.early_data,
            validate: opts.validate,
            headfirst: opts.headfirst,
        });

        let mut last_error = None;
        for round in 0..opts.max_retry.max(1) {
            let candidates = self.candidates(round, &addresses);
            debug!(host, port, round, candidates = candidates.len(), "racing");

            match self.race(&target, candidates, timeout, cache_key.as_deref()).await {
                Ok(conn) => {
                    debug!(host, port, peer = %conn.peer, latency = ?conn.latency, "race won");
                    self.counters.race_won();
                    return Ok(conn);
                }
                Err(e) => {
                    debug!(host, port, round, "race round failed: {}", e);
                    self.counters.round_failed();
                    last_error = Some(e);
                }
            }
        }

        self.counters.exhausted();
        Err(last_error.unwrap_or_else(|| DialError::NoAddress { host: host.to_string() }))
    }

    fn candidates(&self, round: usize, addresses: &[Endpoint]) -> Vec<Endpoint> {
        self.tracker.reorganize(Instant::now());
        let classified = self.tracker.classify(addresses);
        let (good, bad) = self.tracker.counts();

        let peer = match self.policy {
            SelectionPolicy::Tcp => self.peer_tracker.as_ref().map(|t| t.counts()),
            SelectionPolicy::Tls => None,
        };
        let window = window_size(self.settings.max_window, round, WindowInputs { good, bad, peer });
        dial_set(self.policy, window, &classified, addresses, &mut rand::thread_rng())
    }

    async fn race(
        &self,
        target: &Arc<DialTarget>,
        candidates: Vec<Endpoint>,
        timeout: Duration,
        cache_key: Option<&str>,
    ) -> Result<RacedConnection<D::Stream>, DialError> {
        let (tx, mut rx) = mpsc::channel::<DialResult<D::Stream>>(candidates.len().max(1));

        for addr in candidates {
            let dialer = Arc::clone(&self.dialer);
            let tracker = Arc::clone(&self.tracker);
            let target = Arc::clone(target);
            let tx = tx.clone();
            tokio::spawn(async move {
                let result = dialer.dial(&target, addr, timeout).await;
                match &result {
                    Ok(dialed) => tracker.record_success(addr, dialed.latency()),
                    Err(e) => {
                        trace!(%addr, host = %target.host, "dial failed: {}", e);
                        tracker.record_failure(addr);
                    }
                }
                let _ = tx.send(result).await;
            });
        }
        drop(tx);

        let mut last_error = None;
        while let Some(result) = rx.recv().await {
            match result {
                Ok(winner) => {
                    let latency = winner.latency();
                    self.drain_losers(rx, latency, cache_key);
                    return Ok(RacedConnection {
                        stream: winner.stream,
                        peer: winner.peer,
                        latency,
                        from_cache: false,
                    });
                }
                Err(e) => last_error = Some(e),
            }
        }

        Err(last_error.unwrap_or_else(|| DialError::NoAddress {
            host: target.host.clone(),
        }))
    }

    /// Collect the remaining dials of a won race in the background
    fn drain_losers(&self, mut rx: mpsc::Receiver<DialResult<D::Stream>>, winner: Duration, cache_key: Option<&str>) {
        let cache = Arc::clone(&self.cache);
        let tracker = Arc::clone(&self.tracker);
        let counters = Arc::clone(&self.counters);
        let key = cache_key.map(str::to_string);
        let cache_sock = self.settings.cache_sock;
        let limit = winner.mul_f64(1.3).min(MAX_CACHEABLE_LATENCY);

        tokio::spawn(async move {
            while let Some(result) = rx.recv().await {
                let Ok(loser) = result else { continue };
                let Some(key) = key.as_deref() else { continue };

                let cacheable = cache_sock || tracker.is_predefined(&loser.peer.ip());
                if cacheable && loser.latency() < limit {
                    trace!(key, peer = %loser.peer, latency = ?loser.latency(), "caching race loser");
                    cache.put(key, loser.stream, loser.peer);
                    counters.loser_cached();
                }
            }
        });
    }
}

/// Both racers over one resolver
pub struct Connector {
    /// Plain TCP racer; its window reads the TLS tracker
    pub tcp: ConnectionRacer<TcpDialer>,
    /// TLS racer
    pub tls: ConnectionRacer<TlsDialer>,
    resolver: Arc<dyn Resolve>,
    max_retry: usize,
    tcp_keepalive: bool,
    tls_keepalive: bool,
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("tcp", &self.tcp)
            .field("tls", &self.tls)
            .finish_non_exhaustive()
    }
}

impl Connector {
    /// Build both racers from configuration
    pub fn from_config(config: &RacerConfig, resolver: Arc<dyn Resolve>) -> Self {
        let quality = QualitySettings::from_config(config);
        let tcp_tracker = Arc::new(AddressQualityTracker::new(quality.clone()));
        let tls_tracker = Arc::new(AddressQualityTracker::new(quality));

        let settings = |cache_sock| RacerSettings {
            max_window: config.max_window,
            connect_timeout: config.connect_timeout(),
            cache_sock,
            cache_capacity: config.cache_capacity,
        };

        let tcp_dialer = TcpDialer::new(config.connect_timeout());
        let tls_dialer = TlsDialer::new(tcp_dialer.clone(), IssuerPolicy::from_config(&config.issuer_check));

        let tcp = ConnectionRacer::new(
            tcp_dialer,
            Arc::clone(&resolver),
            tcp_tracker,
            SelectionPolicy::Tcp,
            settings(config.tcp_cache_sock),
        )
        .with_peer_tracker(Arc::clone(&tls_tracker));
        let tls = ConnectionRacer::new(
            tls_dialer,
            Arc::clone(&resolver),
            tls_tracker,
            SelectionPolicy::Tls,
            settings(config.tls_cache_sock),
        );

        Self {
            tcp,
            tls,
            resolver,
            max_retry: config.max_retry,
            tcp_keepalive: config.tcp_cache_sock && config.tcp_keepalive,
            tls_keepalive: config.tls_cache_sock && config.tls_keepalive,
        }
    }

    /// Shared resolver
    #[must_use]
    pub fn resolver(&self) -> &Arc<dyn Resolve> {
        &self.resolver
    }

    /// Dial options carrying the configured round count
    #[must_use]
    pub fn dial_options(&self) -> DialOptions {
        DialOptions::with_retry(self.max_retry)
    }

    /// Whether fully-read upstream connections go back to the cache
    ///
    /// Requires both socket caching and keep-alive for the traffic class.
    #[must_use]
    pub const fn keepalive(&self, tls: bool) -> bool {
        if tls {
            self.tls_keepalive
        } else {
            self.tcp_keepalive
        }
    }
}
