use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub(crate) struct QuotaTelemetry {
    pub(crate) cell_admitted: AtomicU64,
    pub(crate) cell_denied: AtomicU64,
    pub(crate) actor_admitted: AtomicU64,
    pub(crate) actor_denied: AtomicU64,
    pub(crate) cache_hits: AtomicU64,
    pub(crate) cache_misses: AtomicU64,
    pub(crate) reconciliations: AtomicU64,
    pub(crate) reconciliations_unknown: AtomicU64,
    pub(crate) deltas_applied: AtomicU64,
    pub(crate) deltas_failed: AtomicU64,
    pub(crate) cache_entries_swept: AtomicU64,
}

impl QuotaTelemetry {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, store_failures: u64) -> QuotaMetrics {
        QuotaMetrics {
            cell_admitted: self.cell_admitted.load(Ordering::Relaxed),
            cell_denied: self.cell_denied.load(Ordering::Relaxed),
            actor_admitted: self.actor_admitted.load(Ordering::Relaxed),
            actor_denied: self.actor_denied.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            reconciliations: self.reconciliations.load(Ordering::Relaxed),
            reconciliations_unknown: self.reconciliations_unknown.load(Ordering::Relaxed),
            deltas_applied: self.deltas_applied.load(Ordering::Relaxed),
            deltas_failed: self.deltas_failed.load(Ordering::Relaxed),
            cache_entries_swept: self.cache_entries_swept.load(Ordering::Relaxed),
            store_failures,
        }
    }
}

/// Point-in-time copy of the engine's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QuotaMetrics {
    pub cell_admitted: u64,
    pub cell_denied: u64,
    pub actor_admitted: u64,
    pub actor_denied: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub reconciliations: u64,
    pub reconciliations_unknown: u64,
    pub deltas_applied: u64,
    pub deltas_failed: u64,
    pub cache_entries_swept: u64,
    pub store_failures: u64,
}

impl QuotaMetrics {
    /// Fraction of cache lookups that hit, 0.0 before any lookup.
    pub fn cache_hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }
}
