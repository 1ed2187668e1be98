//! Packet-path counters.
//!
//! Cache-line aligned so checkpoints running on different cores do not bounce
//! the same line when they record outcomes.

use std::sync::atomic::{AtomicU64, Ordering};

use super::CachePadded;
use crate::nat_engine::{DropReason, Verdict};

/// Relay statistics.
#[derive(Debug)]
pub struct RelayStats {
    /// Packets that reached a checkpoint with a valid session.
    pub examined: CachePadded<AtomicU64>,
    /// Packets passed through without a session or unparsable.
    pub passed_through: CachePadded<AtomicU64>,
    /// Packets rewritten and accepted.
    pub accepted: CachePadded<AtomicU64>,
    /// Packets dropped because both directions matched equally.
    pub dropped_ambiguous: CachePadded<AtomicU64>,
    /// Packets dropped because no direction matched.
    pub dropped_no_route: CachePadded<AtomicU64>,
    /// Packets dropped because the forwarding decision could not be redone.
    pub dropped_reroute: CachePadded<AtomicU64>,
    /// RTP sequence discontinuities absorbed into a session offset.
    pub smoothing_adjustments: CachePadded<AtomicU64>,
    /// Checksum mismatches found by diagnostic verification.
    pub checksum_mismatches: CachePadded<AtomicU64>,
}

impl Default for RelayStats {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayStats {
    /// Creates new empty statistics.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            examined: CachePadded::new(AtomicU64::new(0)),
            passed_through: CachePadded::new(AtomicU64::new(0)),
            accepted: CachePadded::new(AtomicU64::new(0)),
            dropped_ambiguous: CachePadded::new(AtomicU64::new(0)),
            dropped_no_route: CachePadded::new(AtomicU64::new(0)),
            dropped_reroute: CachePadded::new(AtomicU64::new(0)),
            smoothing_adjustments: CachePadded::new(AtomicU64::new(0)),
            checksum_mismatches: CachePadded::new(AtomicU64::new(0)),
        }
    }

    /// Records a packet with a valid session.
    #[inline]
    pub fn record_examined(&self) {
        self.examined.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a packet left untouched.
    #[inline]
    pub fn record_pass_through(&self) {
        self.passed_through.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Records the final verdict for an examined packet.
    #[inline]
    pub fn record_verdict(&self, verdict: Verdict) {
        let counter = match verdict {
            Verdict::Accept => &self.accepted,
            Verdict::Drop(DropReason::AmbiguousRoute) => &self.dropped_ambiguous,
            Verdict::Drop(DropReason::NoRoute) => &self.dropped_no_route,
            Verdict::Drop(DropReason::Reroute(_)) => &self.dropped_reroute,
        };
        counter.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a sequence discontinuity.
    #[inline]
    pub fn record_smoothing_adjustment(&self) {
        self.smoothing_adjustments.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Records checksum mismatches.
    #[inline]
    pub fn record_checksum_mismatches(&self, count: u64) {
        if count > 0 {
            self.checksum_mismatches.0.fetch_add(count, Ordering::Relaxed);
        }
    }

    /// Takes a snapshot of all counters.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            examined: self.examined.0.load(Ordering::Relaxed),
            passed_through: self.passed_through.0.load(Ordering::Relaxed),
            accepted: self.accepted.0.load(Ordering::Relaxed),
            dropped_ambiguous: self.dropped_ambiguous.0.load(Ordering::Relaxed),
            dropped_no_route: self.dropped_no_route.0.load(Ordering::Relaxed),
            dropped_reroute: self.dropped_reroute.0.load(Ordering::Relaxed),
            smoothing_adjustments: self.smoothing_adjustments.0.load(Ordering::Relaxed),
            checksum_mismatches: self.checksum_mismatches.0.load(Ordering::Relaxed),
        }
    }

    /// Resets all counters to zero.
    pub fn reset(&self) {
        self.examined.0.store(0, Ordering::Relaxed);
        self.passed_through.0.store(0, Ordering::Relaxed);
        self.accepted.0.store(0, Ordering::Relaxed);
        self.dropped_ambiguous.0.store(0, Ordering::Relaxed);
        self.dropped_no_route.0.store(0, Ordering::Relaxed);
        self.dropped_reroute.0.store(0, Ordering::Relaxed);
        self.smoothing_adjustments.0.store(0, Ordering::Relaxed);
        self.checksum_mismatches.0.store(0, Ordering::Relaxed);
    }
}

/// Point-in-time copy of [`RelayStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Packets that reached a checkpoint with a valid session.
    pub examined: u64,
    /// Packets passed through untouched.
    pub passed_through: u64,
    /// Packets accepted.
    pub accepted: u64,
    /// Ambiguous-route drops.
    pub dropped_ambiguous: u64,
    /// No-route drops.
    pub dropped_no_route: u64,
    /// Reroute-failure drops.
    pub dropped_reroute: u64,
    /// Sequence discontinuities.
    pub smoothing_adjustments: u64,
    /// Diagnostic checksum mismatches.
    pub checksum_mismatches: u64,
}

impl StatsSnapshot {
    /// Total drops.
    #[must_use]
    pub const fn dropped(&self) -> u64 {
        self.dropped_ambiguous + self.dropped_no_route + self.dropped_reroute
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RerouteError;

    #[test]
    fn test_stats_creation() {
        let stats = RelayStats::new();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn test_record_verdicts() {
        let stats = RelayStats::new();

        stats.record_verdict(Verdict::Accept);
        stats.record_verdict(Verdict::Accept);
        stats.record_verdict(Verdict::Drop(DropReason::AmbiguousRoute));
        stats.record_verdict(Verdict::Drop(DropReason::NoRoute));
        stats.record_verdict(Verdict::Drop(DropReason::Reroute(RerouteError::new(-1))));

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.accepted, 2);
        assert_eq!(snapshot.dropped_ambiguous, 1);
        assert_eq!(snapshot.dropped_no_route, 1);
        assert_eq!(snapshot.dropped_reroute, 1);
        assert_eq!(snapshot.dropped(), 3);
    }

    #[test]
    fn test_stats_reset() {
        let stats = RelayStats::new();
        stats.record_examined();
        stats.record_pass_through();
        stats.record_smoothing_adjustment();
        stats.record_checksum_mismatches(2);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.examined, 1);
        assert_eq!(snapshot.passed_through, 1);
        assert_eq!(snapshot.smoothing_adjustments, 1);
        assert_eq!(snapshot.checksum_mismatches, 2);

        stats.reset();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }
}
