//! Lifetime counters for a registry.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free outcome counters, one per terminal path.
pub struct RegistryStats {
    registered: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    timed_out: AtomicU64,
    resets: AtomicU64,
}

impl RegistryStats {
    #[must_use]
    pub fn new() -> Self {
        Self {
            registered: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
            resets: AtomicU64::new(0),
        }
    }

    pub(crate) fn record_registered(&self) {
        self.registered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_timed_out(&self) {
        self.timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reset(&self) {
        self.resets.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot of all counters. `current` is the live entry count supplied
    /// by the registry.
    #[must_use]
    pub fn snapshot(&self, current: usize) -> StatsSnapshot {
        StatsSnapshot {
            registered: self.registered.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            resets: self.resets.load(Ordering::Relaxed),
            current: u64::try_from(current).unwrap_or(u64::MAX),
        }
    }
}

impl Default for RegistryStats {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RegistryStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.snapshot(0);
        f.debug_struct("RegistryStats")
            .field("registered", &s.registered)
            .field("completed", &s.completed)
            .field("failed", &s.failed)
            .field("cancelled", &s.cancelled)
            .field("timed_out", &s.timed_out)
            .field("resets", &s.resets)
            .finish_non_exhaustive()
    }
}

/// Point-in-time view of [`RegistryStats`].
///
/// `cancelled` counts explicit cancellations only; idle timeouts land in
/// `timed_out`. A session retired by reset counts in `resets`, not in any
/// terminal counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub registered: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub timed_out: u64,
    pub resets: u64,
    /// Entries in the registry (draining ones included).
    pub current: u64,
}

impl StatsSnapshot {
    /// Sessions that reached a terminal outcome through the listener.
    #[must_use]
    pub fn finished(&self) -> u64 {
        self.completed + self.failed + self.cancelled + self.timed_out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_independent() {
        let stats = RegistryStats::new();
        stats.record_registered();
        stats.record_registered();
        stats.record_completed();
        stats.record_timed_out();
        stats.record_reset();

        let snap = stats.snapshot(1);
        assert_eq!(snap.registered, 2);
        assert_eq!(snap.completed, 1);
        assert_eq!(snap.failed, 0);
        assert_eq!(snap.timed_out, 1);
        assert_eq!(snap.resets, 1);
        assert_eq!(snap.current, 1);
        assert_eq!(snap.finished(), 2);
    }

    #[test]
    fn snapshot_serializes() {
        let json = serde_json::to_value(StatsSnapshot::default()).expect("serialize");
        assert_eq!(json["timed_out"], 0);
        assert_eq!(json["current"], 0);
    }
}
