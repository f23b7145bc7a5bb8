//! Dispatch counters: handled, malformed and unknown packets plus a
//! per-tag breakdown, for periodic diagnostics logging.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use rustc_hash::FxHashMap;

// ---------------------------------------------------------------------------
// DispatchCounters
// ---------------------------------------------------------------------------

/// Live counters bumped by the dispatcher.
///
/// Totals are atomics so I/O tasks can record without locking; the per-tag
/// map sits behind a mutex.
pub struct DispatchCounters {
    handled: AtomicU64,
    malformed: AtomicU64,
    unknown: AtomicU64,
    bytes: AtomicU64,
    per_tag: Mutex<FxHashMap<u32, TagStats>>,
}

impl DispatchCounters {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self {
            handled: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
            unknown: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            per_tag: Mutex::new(FxHashMap::default()),
        }
    }

    /// Record a packet that reached its handler.
    pub fn record_handled(&self, tag: u32, bytes: u64) {
        self.handled.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
        let mut map = self.per_tag.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = map.entry(tag).or_default();
        entry.count += 1;
        entry.total_bytes += bytes;
    }

    /// Record a packet whose body was rejected.
    pub fn record_malformed(&self, tag: u32) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
        let mut map = self.per_tag.lock().unwrap_or_else(PoisonError::into_inner);
        map.entry(tag).or_default().malformed += 1;
    }

    /// Record a packet with no registered handler.
    pub fn record_unknown(&self) {
        self.unknown.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot and reset everything (swap with 0).
    pub fn snapshot_and_reset(&self) -> CountersSnapshot {
        let per_tag =
            std::mem::take(&mut *self.per_tag.lock().unwrap_or_else(PoisonError::into_inner));
        CountersSnapshot {
            handled: self.handled.swap(0, Ordering::Relaxed),
            malformed: self.malformed.swap(0, Ordering::Relaxed),
            unknown: self.unknown.swap(0, Ordering::Relaxed),
            bytes: self.bytes.swap(0, Ordering::Relaxed),
            per_tag,
        }
    }
}

impl Default for DispatchCounters {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

/// Accumulated totals for a single packet tag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TagStats {
    /// Packets handled.
    pub count: u64,
    /// Bytes across handled packets, tag included.
    pub total_bytes: u64,
    /// Packets rejected as malformed.
    pub malformed: u64,
}

/// Point-in-time view of [`DispatchCounters`] for one measurement period.
#[derive(Debug, Clone, Default)]
pub struct CountersSnapshot {
    /// Packets handled.
    pub handled: u64,
    /// Packets rejected as malformed.
    pub malformed: u64,
    /// Packets with an unknown or missing tag.
    pub unknown: u64,
    /// Bytes across handled packets.
    pub bytes: u64,
    /// Per-tag breakdown.
    pub per_tag: FxHashMap<u32, TagStats>,
}

impl CountersSnapshot {
    /// Log the period's totals, warning when anything was dropped.
    pub fn log(&self) {
        if self.malformed > 0 || self.unknown > 0 {
            tracing::warn!(
                "Dispatch: {} handled ({} bytes), {} malformed, {} unknown",
                self.handled,
                self.bytes,
                self.malformed,
                self.unknown
            );
        } else {
            tracing::debug!("Dispatch: {} handled ({} bytes)", self.handled, self.bytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_resets() {
        let counters = DispatchCounters::new();
        counters.record_handled(7, 100);
        counters.record_handled(7, 50);
        counters.record_malformed(7);
        counters.record_unknown();

        let snap = counters.snapshot_and_reset();
        assert_eq!(snap.handled, 2);
        assert_eq!(snap.bytes, 150);
        assert_eq!(snap.malformed, 1);
        assert_eq!(snap.unknown, 1);
        assert_eq!(
            snap.per_tag[&7],
            TagStats {
                count: 2,
                total_bytes: 150,
                malformed: 1
            }
        );

        let empty = counters.snapshot_and_reset();
        assert_eq!(empty.handled, 0);
        assert!(empty.per_tag.is_empty());
    }

    #[test]
    fn test_concurrent_recording() {
        let counters = std::sync::Arc::new(DispatchCounters::new());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let counters = counters.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        counters.record_handled(t, 1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let snap = counters.snapshot_and_reset();
        assert_eq!(snap.handled, 4000);
        assert_eq!(snap.per_tag.len(), 4);
    }
}
