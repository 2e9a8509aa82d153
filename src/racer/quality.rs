//! Per-endpoint dial history
//!
//! Every endpoint is either good (last dial succeeded), bad (last dial
//! failed) or unknown (never dialed, or aged out). Good endpoints carry
//! their last observed latency; failed ones get a penalty latency so they
//! sort behind everything that ever worked.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use tokio::time::Instant;

/// A resolved `(ip, port)` pair, the unit of quality tracking
pub type Endpoint = SocketAddr;

/// Aging and penalty parameters
#[derive(Debug, Clone)]
pub struct QualitySettings {
    /// Racing window; the good set is only aged once it exceeds twice this
    pub max_window: usize,
    /// Base of the failure penalty latency
    pub connect_timeout: Duration,
    /// Age after which a good endpoint may return to unknown
    pub good_ttl: Duration,
    /// Age after which a bad endpoint returns to unknown
    pub bad_ttl: Duration,
    /// Pinned addresses that never age out of the good set
    pub predefined: HashSet<IpAddr>,
}

impl Default for QualitySettings {
    fn default() -> Self {
        Self {
            max_window: 4,
            connect_timeout: Duration::from_secs(6),
            good_ttl: Duration::from_secs(4 * 60),
            bad_ttl: Duration::from_secs(6 * 60),
            predefined: HashSet::new(),
        }
    }
}

impl QualitySettings {
    /// Build from racer configuration
    #[must_use]
    pub fn from_config(config: &crate::config::RacerConfig) -> Self {
        Self {
            max_window: config.max_window,
            connect_timeout: config.connect_timeout(),
            good_ttl: config.good_ttl(),
            bad_ttl: config.bad_ttl(),
            predefined: config.predefined_ips.iter().copied().collect(),
        }
    }
}

/// Candidates partitioned by history
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classified {
    /// Ascending by latency
    pub good: Vec<Endpoint>,
    /// In input order
    pub unknown: Vec<Endpoint>,
    /// Ascending by failure time, oldest first
    pub bad: Vec<Endpoint>,
}

/// Counts for debug logging
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QualitySnapshot {
    /// Endpoints in the good set
    pub good: usize,
    /// Endpoints in the bad set
    pub bad: usize,
    /// Endpoints with a recorded latency
    pub timed: usize,
}

#[derive(Debug, Default)]
struct QualityState {
    good: HashMap<Endpoint, Instant>,
    bad: HashMap<Endpoint, Instant>,
    latency: HashMap<Endpoint, Duration>,
}

/// Good/bad/latency bookkeeping for one traffic class
///
/// A single mutex guards all maps; an endpoint is never in both sets.
#[derive(Debug, Default)]
pub struct AddressQualityTracker {
    settings: QualitySettings,
    state: Mutex<QualityState>,
}

impl AddressQualityTracker {
    /// Create an empty tracker
    #[must_use]
    pub fn new(settings: QualitySettings) -> Self {
        Self {
            settings,
            state: Mutex::new(QualityState::default()),
        }
    }

    /// Tracker settings
    #[must_use]
    pub fn settings(&self) -> &QualitySettings {
        &self.settings
    }

    /// Whether `ip` is pinned
    #[must_use]
    pub fn is_predefined(&self, ip: &IpAddr) -> bool {
        self.settings.predefined.contains(ip)
    }

    /// Mark `ep` good with the observed `latency`
    pub fn record_success(&self, ep: Endpoint, latency: Duration) {
        let mut state = self.state.lock();
        state.bad.remove(&ep);
        state.good.insert(ep, Instant::now());
        state.latency.insert(ep, latency);
    }

    /// Mark `ep` bad and give it a penalty latency
    pub fn record_failure(&self, ep: Endpoint) {
        let jitter = Duration::from_secs_f64(rand::thread_rng().gen::<f64>());
        let mut state = self.state.lock();
        state.good.remove(&ep);
        state.bad.insert(ep, Instant::now());
        state.latency.insert(ep, self.settings.connect_timeout + jitter);
    }

    /// Age stale entries back to unknown
    ///
    /// Good entries older than `good_ttl` go only while the good set holds
    /// more than `2 * max_window` entries, oldest first, and never for
    /// pinned addresses. Bad entries older than `bad_ttl` always go.
    pub fn reorganize(&self, now: Instant) {
        let mut state = self.state.lock();
        let limit = 2 * self.settings.max_window;

        if state.good.len() > limit {
            let mut stale: Vec<(Endpoint, Instant)> = state
                .good
                .iter()
                .filter(|(ep, at)| {
                    now.saturating_duration_since(**at) > self.settings.good_ttl
                        && !self.is_predefined(&ep.ip())
                })
                .map(|(ep, at)| (*ep, *at))
                .collect();
            stale.sort_by_key(|(_, at)| *at);
            for (ep, _) in stale {
                if state.good.len() <= limit {
                    break;
                }
                state.good.remove(&ep);
            }
        }

        let bad_ttl = self.settings.bad_ttl;
        state
            .bad
            .retain(|_, at| now.saturating_duration_since(*at) <= bad_ttl);
    }

    /// Partition `addresses` into good, unknown and bad
    #[must_use]
    pub fn classify(&self, addresses: &[Endpoint]) -> Classified {
        let state = self.state.lock();
        let mut classified = Classified::default();
        for ep in addresses {
            if state.good.contains_key(ep) {
                classified.good.push(*ep);
            } else if state.bad.contains_key(ep) {
                classified.bad.push(*ep);
            } else {
                classified.unknown.push(*ep);
            }
        }

        let latency = |ep: &Endpoint| state.latency.get(ep).copied().unwrap_or(Duration::MAX);
        classified.good.sort_by_key(latency);
        classified.bad.sort_by_key(|ep| state.bad.get(ep).copied());
        classified
    }

    /// `(good, bad)` set sizes
    #[must_use]
    pub fn counts(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.good.len(), state.bad.len())
    }

    /// Last recorded latency of `ep`
    #[must_use]
    pub fn latency(&self, ep: &Endpoint) -> Option<Duration> {
        self.state.lock().latency.get(ep).copied()
    }

    /// Whether `ep` is in the good set
    #[must_use]
    pub fn is_good(&self, ep: &Endpoint) -> bool {
        self.state.lock().good.contains_key(ep)
    }

    /// Whether `ep` is in the bad set
    #[must_use]
    pub fn is_bad(&self, ep: &Endpoint) -> bool {
        self.state.lock().bad.contains_key(ep)
    }

    /// Current set sizes
    #[must_use]
    pub fn snapshot(&self) -> QualitySnapshot {
        let state = self.state.lock();
        QualitySnapshot {
            good: state.good.len(),
            bad: state.bad.len(),
            timed: state.latency.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(last: u8) -> Endpoint {
        SocketAddr::from(([10, 0, 0, last], 443))
    }

    fn tracker(max_window: usize) -> AddressQualityTracker {
        AddressQualityTracker::new(QualitySettings {
            max_window,
            ..QualitySettings::default()
        })
    }

    #[test]
    fn test_membership_is_exclusive() {
        let t = tracker(4);
        t.record_success(ep(1), Duration::from_millis(20));
        assert!(t.is_good(&ep(1)) && !t.is_bad(&ep(1)));

        t.record_failure(ep(1));
        assert!(t.is_bad(&ep(1)) && !t.is_good(&ep(1)));
        assert!(t.latency(&ep(1)).unwrap() >= Duration::from_secs(6));

        t.record_success(ep(1), Duration::from_millis(30));
        assert!(t.is_good(&ep(1)) && !t.is_bad(&ep(1)));
        assert_eq!(t.latency(&ep(1)), Some(Duration::from_millis(30)));
    }

    #[test]
    fn test_classify_orders() {
        let t = tracker(4);
        t.record_success(ep(1), Duration::from_millis(300));
        t.record_success(ep(2), Duration::from_millis(10));
        t.record_failure(ep(3));
        std::thread::sleep(Duration::from_millis(2));
        t.record_failure(ep(4));

        let c = t.classify(&[ep(4), ep(3), ep(1), ep(5), ep(2), ep(6)]);
        assert_eq!(c.good, vec![ep(2), ep(1)]);
        assert_eq!(c.unknown, vec![ep(5), ep(6)]);
        assert_eq!(c.bad, vec![ep(3), ep(4)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bad_entries_age_out() {
        let t = tracker(4);
        t.record_failure(ep(1));
        t.reorganize(Instant::now());
        assert!(t.is_bad(&ep(1)));

        tokio::time::advance(Duration::from_secs(6 * 60 + 1)).await;
        t.reorganize(Instant::now());
        assert!(!t.is_bad(&ep(1)));
        assert_eq!(t.classify(&[ep(1)]).unknown, vec![ep(1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_good_entries_age_only_when_crowded() {
        let t = tracker(1);
        t.record_success(ep(1), Duration::from_millis(5));
        t.record_success(ep(2), Duration::from_millis(5));
        tokio::time::advance(Duration::from_secs(5 * 60)).await;

        // Two entries is not more than 2 * window
        t.reorganize(Instant::now());
        assert_eq!(t.counts(), (2, 0));

        t.record_success(ep(3), Duration::from_millis(5));
        t.reorganize(Instant::now());
        assert_eq!(t.counts(), (2, 0));
        assert!(t.is_good(&ep(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_predefined_never_aged() {
        let mut settings = QualitySettings {
            max_window: 1,
            ..QualitySettings::default()
        };
        settings.predefined.insert(ep(1).ip());
        settings.predefined.insert(ep(2).ip());
        let t = AddressQualityTracker::new(settings);

        for i in 1..=3 {
            t.record_success(ep(i), Duration::from_millis(5));
        }
        tokio::time::advance(Duration::from_secs(5 * 60)).await;
        t.reorganize(Instant::now());

        assert!(t.is_good(&ep(1)));
        assert!(t.is_good(&ep(2)));
        assert!(!t.is_good(&ep(3)));
    }
}
