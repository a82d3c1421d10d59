use crate::cache::QuotaCache;
use crate::dispatch::Dispatch;
use crate::metrics::QuotaTelemetry;
use crate::store::{CounterKey, CounterStore, CounterTable, Observed, Pending};
use std::fmt::Display;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::{debug, trace};

use super::QuotaStatistics;

/// Read-through, write-behind bookkeeping for one kind of counter.
///
/// Lookups try the cache and fall back to a blocking store read. Mutations
/// go to the store first; the cache only ever takes the value the store
/// returned, stamped with the store's operation order.
pub(crate) struct CounterLedger<K> {
    store: Arc<CounterStore>,
    cache: QuotaCache<K>,
    dispatch: Arc<dyn Dispatch>,
    telemetry: Arc<QuotaTelemetry>,
    table: CounterTable,
}

impl<K> CounterLedger<K>
where
    K: Clone + Eq + Hash + Display + Into<CounterKey> + Send + Sync + 'static,
{
    pub(crate) fn new(
        store: Arc<CounterStore>,
        cache: QuotaCache<K>,
        dispatch: Arc<dyn Dispatch>,
        telemetry: Arc<QuotaTelemetry>,
        table: CounterTable,
    ) -> Self {
        Self {
            store,
            cache,
            dispatch,
            telemetry,
            table,
        }
    }

    pub(crate) fn cache(&self) -> &QuotaCache<K> {
        &self.cache
    }

    /// Cached count, else the stored one. A failed store read yields 0 and
    /// leaves the cache untouched.
    pub(crate) fn lookup(&self, key: &K) -> i32 {
        if let Some(count) = self.cache.get(key) {
            QuotaTelemetry::bump(&self.telemetry.cache_hits);
            return count;
        }
        QuotaTelemetry::bump(&self.telemetry.cache_misses);
        match self.store.read_blocking(key.clone().into()) {
            Some(observed) => {
                self.cache.put_observed(key.clone(), observed.value, observed.seq);
                observed.value
            }
            None => 0,
        }
    }

    /// Adds `delta` in the store and refreshes the cache from the result.
    /// `None` when nothing was applied.
    pub(crate) async fn apply_delta(&self, key: K, delta: i32) -> Option<i32> {
        if delta == 0 {
            return None;
        }
        let pending = self.store.submit_increment(key.clone().into(), delta);
        self.finish_delta(key, delta, pending).await
    }

    async fn finish_delta(
        &self,
        key: K,
        delta: i32,
        pending: Pending<Observed<i32>>,
    ) -> Option<i32> {
        let Some(observed) = self.store.resolve(pending).await else {
            QuotaTelemetry::bump(&self.telemetry.deltas_failed);
            return None;
        };
        QuotaTelemetry::bump(&self.telemetry.deltas_applied);
        trace!(key = %key, delta, count = observed.value, "delta applied");
        self.cache.put_observed(key, observed.value, observed.seq);
        Some(observed.value)
    }

    /// `apply_delta` off the caller's path. The store write is queued before
    /// this returns, so it runs after every write this thread queued earlier.
    pub(crate) fn apply_delta_detached(self: &Arc<Self>, key: K, delta: i32) {
        if delta == 0 {
            return;
        }
        let pending = self.store.submit_increment(key.clone().into(), delta);
        let ledger = Arc::clone(self);
        self.dispatch.run_async(Box::pin(async move {
            ledger.finish_delta(key, delta, pending).await;
        }));
    }

    /// Stores an exact count, refreshing the cache only if the write landed.
    pub(crate) async fn set_count(&self, key: K, count: i32) -> bool {
        let count = count.max(0);
        let pending = self.store.submit_set(key.clone().into(), count);
        self.finish_set(key, count, pending).await
    }

    async fn finish_set(&self, key: K, count: i32, pending: Pending<Observed<()>>) -> bool {
        match self.store.resolve(pending).await {
            Some(observed) => {
                self.cache.put_observed(key, count, observed.seq);
                true
            }
            None => false,
        }
    }

    /// `set_count` off the caller's path, queued in order like
    /// [`apply_delta_detached`](Self::apply_delta_detached).
    pub(crate) fn set_count_detached(self: &Arc<Self>, key: K, count: i32) {
        let count = count.max(0);
        let pending = self.store.submit_set(key.clone().into(), count);
        let ledger = Arc::clone(self);
        self.dispatch.run_async(Box::pin(async move {
            if !ledger.finish_set(key.clone(), count, pending).await {
                debug!(key = %key, count, "write-behind of live count failed");
            }
        }));
    }

    /// Removes the stored row and forgets the cached value.
    pub(crate) async fn reset(&self, key: K) -> bool {
        match self.store.delete_observed(key.clone().into()).await {
            Some(seq) => {
                self.cache.invalidate_observed(key, seq);
                true
            }
            None => false,
        }
    }

    pub(crate) fn sweep(&self) -> usize {
        let removed = self.cache.sweep();
        self.telemetry
            .cache_entries_swept
            .fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    pub(crate) async fn statistics(&self) -> QuotaStatistics {
        let (tracked_keys, total_units) = tokio::join!(
            self.store.row_count(self.table),
            self.store.sum_counts(self.table)
        );
        QuotaStatistics {
            tracked_keys,
            total_units,
            cache_size: self.cache.size(),
        }
    }
}
