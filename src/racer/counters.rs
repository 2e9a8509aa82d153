//! Race outcome counters
//!
//! One set per traffic class, bumped from the racer and from the background
//! task that drains losers.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Atomic race outcome counters of one racer
#[derive(Debug, Default)]
pub struct RaceCounters {
    cache_hits: AtomicU64,
    races_won: AtomicU64,
    rounds_failed: AtomicU64,
    losers_cached: AtomicU64,
    exhausted: AtomicU64,
}

impl RaceCounters {
    pub(crate) fn cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn race_won(&self) {
        self.races_won.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn round_failed(&self) {
        self.rounds_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn loser_cached(&self) {
        self.losers_cached.fetch_add(1, Ordering::Relaxed);
    }

    /// Every round of a `dial_best` call failed
    pub(crate) fn exhausted(&self) {
        self.exhausted.fetch_add(1, Ordering::Relaxed);
    }

    /// Current values
    #[must_use]
    pub fn snapshot(&self) -> RaceSnapshot {
        RaceSnapshot {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            races_won: self.races_won.load(Ordering::Relaxed),
            rounds_failed: self.rounds_failed.load(Ordering::Relaxed),
            losers_cached: self.losers_cached.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
        }
    }
}

/// Serialisable copy of [`RaceCounters`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaceSnapshot {
    /// Connections served from the socket cache without dialing
    pub cache_hits: u64,
    /// Races that produced a winner
    pub races_won: u64,
    /// Rounds in which every candidate failed
    pub rounds_failed: u64,
    /// Race losers parked in the socket cache
    pub losers_cached: u64,
    /// Dials that failed after their last round
    pub exhausted: u64,
}

impl RaceSnapshot {
    /// Connections handed out, cached or raced
    #[must_use]
    pub const fn served(&self) -> u64 {
        self.cache_hits + self.races_won
    }

    /// Share of served connections that came from the cache, in percent
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn cache_hit_rate(&self) -> f64 {
        match self.served() {
            0 => 0.0,
            served => self.cache_hits as f64 * 100.0 / served as f64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_rate() {
        let counters = RaceCounters::default();
        assert!(counters.snapshot().cache_hit_rate().abs() < f64::EPSILON);

        counters.cache_hit();
        counters.race_won();
        counters.race_won();
        counters.race_won();
        let snapshot = counters.snapshot();
        assert_eq!(snapshot.served(), 4);
        assert!((snapshot.cache_hit_rate() - 25.0).abs() < f64::EPSILON);
    }
}
