use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// `count == None` is a tombstone left by a delete. It hides nothing from
/// readers, it only stops older store answers from resurrecting the key.
#[derive(Debug, Clone, Copy)]
struct CacheSlot {
    count: Option<i32>,
    captured_at: Instant,
    seq: u64,
}

impl CacheSlot {
    fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.captured_at) > ttl
    }
}

/// Last-known counts keyed by cell or actor.
///
/// One reader/writer lock guards the whole table. The cache is never a source
/// of truth: a miss means "ask the store", not zero.
///
/// Writes that carry a store sequence number (`*_observed`) are ordered: a
/// slot only moves forward, so a slow read can not overwrite the value left
/// by a later increment.
#[derive(Debug)]
pub struct QuotaCache<K> {
    slots: RwLock<HashMap<K, CacheSlot>>,
    ttl_millis: AtomicU64,
    enabled: AtomicBool,
}

impl<K: Eq + Hash + Clone> QuotaCache<K> {
    pub fn new(ttl: Duration, enabled: bool) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            ttl_millis: AtomicU64::new(duration_millis(ttl)),
            enabled: AtomicBool::new(enabled),
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_millis.load(Ordering::Relaxed))
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Applies new settings. Disabling drops every entry.
    pub fn reconfigure(&self, ttl: Duration, enabled: bool) {
        self.ttl_millis.store(duration_millis(ttl), Ordering::Relaxed);
        let was_enabled = self.enabled.swap(enabled, Ordering::Relaxed);
        if was_enabled && !enabled {
            self.clear();
        }
    }

    /// Present and unexpired entries only. An expired entry is removed on the
    /// way out.
    pub fn get(&self, key: &K) -> Option<i32> {
        if !self.is_enabled() {
            return None;
        }
        let now = Instant::now();
        let ttl = self.ttl();
        {
            let slots = self.slots.read();
            match slots.get(key) {
                None => return None,
                Some(slot) if !slot.is_expired(now, ttl) => return slot.count,
                Some(_) => {}
            }
        }
        let mut slots = self.slots.write();
        if slots.get(key).is_some_and(|slot| slot.is_expired(now, ttl)) {
            slots.remove(key);
        }
        None
    }

    /// Unordered write; always replaces the current value.
    pub fn put(&self, key: K, count: i32) {
        self.put_at(key, count, Instant::now());
    }

    pub(crate) fn put_at(&self, key: K, count: i32, captured_at: Instant) {
        if !self.is_enabled() {
            return;
        }
        let mut slots = self.slots.write();
        let seq = slots.get(&key).map_or(0, |slot| slot.seq);
        slots.insert(
            key,
            CacheSlot {
                count: Some(count),
                captured_at,
                seq,
            },
        );
    }

    /// Stores `count` unless the slot already reflects a later operation.
    /// Returns whether the value was taken.
    pub(crate) fn put_observed(&self, key: K, count: i32, seq: u64) -> bool {
        self.advance(key, Some(count), seq)
    }

    /// Forgets `key` as of operation `seq`.
    pub(crate) fn invalidate_observed(&self, key: K, seq: u64) {
        self.advance(key, None, seq);
    }

    fn advance(&self, key: K, count: Option<i32>, seq: u64) -> bool {
        if !self.is_enabled() {
            return false;
        }
        let mut slots = self.slots.write();
        if slots.get(&key).is_some_and(|slot| slot.seq > seq) {
            return false;
        }
        slots.insert(
            key,
            CacheSlot {
                count,
                captured_at: Instant::now(),
                seq,
            },
        );
        true
    }

    pub fn invalidate(&self, key: &K) {
        self.slots.write().remove(key);
    }

    /// Forgets every cached value. Slots stay behind as tombstones with their
    /// sequence numbers, so store answers already in flight stay ordered.
    pub fn clear(&self) {
        let now = Instant::now();
        for slot in self.slots.write().values_mut() {
            slot.count = None;
            slot.captured_at = now;
        }
    }

    /// Drops every slot older than the TTL and returns how many cached
    /// values went with them.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let ttl = self.ttl();
        let mut slots = self.slots.write();
        let mut removed = 0;
        slots.retain(|_, slot| {
            let keep = !slot.is_expired(now, ttl);
            if !keep && slot.count.is_some() {
                removed += 1;
            }
            keep
        });
        removed
    }

    /// Number of cached values; tombstones are not counted.
    pub fn size(&self) -> usize {
        self.slots
            .read()
            .values()
            .filter(|slot| slot.count.is_some())
            .count()
    }
}

fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn stale(ttl: Duration) -> Instant {
        Instant::now()
            .checked_sub(ttl * 2)
            .expect("monotonic clock too close to its origin")
    }

    #[test]
    fn put_then_get_returns_value() {
        let cache = QuotaCache::new(Duration::from_secs(300), true);
        cache.put("a", 7);
        assert_eq!(cache.get(&"a"), Some(7));
        cache.put("a", 9);
        assert_eq!(cache.get(&"a"), Some(9));
        assert_eq!(cache.get(&"b"), None);
    }

    #[test]
    fn expired_entry_is_absent_and_reaped_on_access() {
        let ttl = Duration::from_secs(60);
        let cache = QuotaCache::new(ttl, true);
        cache.put_at("old", 3, stale(ttl));
        assert_eq!(cache.size(), 1);
        assert_eq!(cache.get(&"old"), None);
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn entry_expires_after_ttl_elapses() {
        let cache = QuotaCache::new(Duration::from_millis(20), true);
        cache.put("k", 1);
        assert_eq!(cache.get(&"k"), Some(1));
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(cache.get(&"k"), None);
    }

    #[test]
    fn sweep_removes_only_stale_entries() {
        let ttl = Duration::from_secs(60);
        let cache = QuotaCache::new(ttl, true);
        cache.put_at("old1", 1, stale(ttl));
        cache.put_at("old2", 2, stale(ttl));
        cache.put("fresh", 3);
        assert_eq!(cache.sweep(), 2);
        assert_eq!(cache.size(), 1);
        assert_eq!(cache.get(&"fresh"), Some(3));
    }

    #[test]
    fn invalidate_and_clear() {
        let cache = QuotaCache::new(Duration::from_secs(60), true);
        cache.put(1u32, 1);
        cache.put(2u32, 2);
        cache.invalidate(&1);
        assert_eq!(cache.get(&1), None);
        assert_eq!(cache.size(), 1);
        cache.clear();
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn disabled_cache_never_holds_values() {
        let cache = QuotaCache::new(Duration::from_secs(60), false);
        cache.put("a", 1);
        assert_eq!(cache.get(&"a"), None);
        assert_eq!(cache.size(), 0);

        let cache = QuotaCache::new(Duration::from_secs(60), true);
        cache.put("a", 1);
        cache.reconfigure(Duration::from_secs(60), false);
        assert_eq!(cache.size(), 0);
        cache.reconfigure(Duration::from_secs(60), true);
        cache.put("a", 2);
        assert_eq!(cache.get(&"a"), Some(2));
    }

    #[test]
    fn older_observation_cannot_overwrite_newer_one() {
        let cache = QuotaCache::new(Duration::from_secs(60), true);
        assert!(cache.put_observed("k", 6, 11));
        assert!(!cache.put_observed("k", 5, 10));
        assert_eq!(cache.get(&"k"), Some(6));
        assert!(cache.put_observed("k", 7, 12));
        assert_eq!(cache.get(&"k"), Some(7));
    }

    #[test]
    fn tombstone_blocks_stale_reads_but_not_later_writes() {
        let cache = QuotaCache::new(Duration::from_secs(60), true);
        cache.put_observed("k", 4, 3);
        cache.invalidate_observed("k", 5);
        assert_eq!(cache.get(&"k"), None);
        assert_eq!(cache.size(), 0);
        assert!(!cache.put_observed("k", 4, 4));
        assert_eq!(cache.get(&"k"), None);
        assert!(cache.put_observed("k", 1, 6));
        assert_eq!(cache.get(&"k"), Some(1));
    }

    #[test]
    fn clear_keeps_reset_tombstones_and_watermarks() {
        let ttl = Duration::from_secs(60);
        let cache = QuotaCache::new(ttl, true);
        cache.put_observed("reset", 10, 3);
        cache.invalidate_observed("reset", 7);
        cache.put_observed("live", 5, 9);
        cache.clear();
        assert_eq!(cache.size(), 0);
        assert_eq!(cache.get(&"live"), None);

        // A read issued before the reset must not bring the old count back.
        assert!(!cache.put_observed("reset", 10, 4));
        assert_eq!(cache.get(&"reset"), None);
        assert!(!cache.put_observed("live", 4, 8));
        assert!(cache.put_observed("live", 6, 10));
        assert_eq!(cache.get(&"live"), Some(6));
    }

    #[test]
    fn unordered_put_keeps_the_sequence_watermark() {
        let cache = QuotaCache::new(Duration::from_secs(60), true);
        cache.put_observed("k", 2, 9);
        cache.put("k", 30);
        assert_eq!(cache.get(&"k"), Some(30));
        assert!(!cache.put_observed("k", 3, 8));
        assert_eq!(cache.get(&"k"), Some(30));
    }

    #[test]
    fn concurrent_writers_and_readers() {
        let cache = Arc::new(QuotaCache::new(Duration::from_secs(60), true));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for i in 0..500 {
                        cache.put((t, i % 50), i);
                        let _ = cache.get(&(t, (i + 1) % 50));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("worker panicked");
        }
        assert_eq!(cache.size(), 8 * 50);
    }
}
