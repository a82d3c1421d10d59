use super::ledger::CounterLedger;
use super::{QuotaStatistics, Verdict};
use crate::cache::QuotaCache;
use crate::config::QuotaConfig;
use crate::dispatch::Dispatch;
use crate::key::ActorId;
use crate::metrics::QuotaTelemetry;
use crate::permission::{PermissionSet, TierTable};
use crate::store::{CounterStore, CounterTable};
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// Per-actor ceiling on placed units, raised by tier permissions.
///
/// While disabled the service neither counts nor limits: lookups read 0 and
/// deltas are dropped.
pub struct ActorQuotaService {
    ledger: Arc<CounterLedger<ActorId>>,
    enabled: AtomicBool,
    tiers: RwLock<TierTable>,
    telemetry: Arc<QuotaTelemetry>,
}

impl ActorQuotaService {
    pub(crate) fn new(
        config: &QuotaConfig,
        store: Arc<CounterStore>,
        dispatch: Arc<dyn Dispatch>,
        telemetry: Arc<QuotaTelemetry>,
    ) -> Self {
        let cache = QuotaCache::new(config.cache_ttl(), config.cache.enabled);
        let ledger = CounterLedger::new(
            store,
            cache,
            dispatch,
            Arc::clone(&telemetry),
            CounterTable::Actors,
        );
        Self {
            ledger: Arc::new(ledger),
            enabled: AtomicBool::new(config.actor.enabled),
            tiers: RwLock::new(tier_table(config)),
            telemetry,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Largest tier ceiling the actor holds, at least the configured default.
    /// Bypass yields `i32::MAX`.
    pub fn effective_limit(&self, permissions: &PermissionSet) -> i32 {
        self.tiers.read().effective_limit(permissions)
    }

    pub fn can_admit(&self, actor: ActorId, permissions: &PermissionSet, delta: i32) -> bool {
        self.check(actor, permissions, delta).is_admitted()
    }

    pub fn check(&self, actor: ActorId, permissions: &PermissionSet, delta: i32) -> Verdict {
        if !self.is_enabled() || self.tiers.read().is_bypassed(permissions) {
            return Verdict::Admitted;
        }
        let limit = self.effective_limit(permissions);
        let current = self.current_count(actor);
        let verdict = Verdict::evaluate(current, delta, limit);
        if verdict.is_admitted() {
            QuotaTelemetry::bump(&self.telemetry.actor_admitted);
        } else {
            QuotaTelemetry::bump(&self.telemetry.actor_denied);
            debug!(actor = %actor, current, delta, limit, "actor quota denied");
        }
        verdict
    }

    pub fn current_count(&self, actor: ActorId) -> i32 {
        if !self.is_enabled() {
            return 0;
        }
        self.ledger.lookup(&actor)
    }

    /// Returns the new count, or `None` when disabled, for a zero delta, or on
    /// a store failure.
    pub async fn apply_delta(&self, actor: ActorId, delta: i32) -> Option<i32> {
        if !self.is_enabled() {
            return None;
        }
        self.ledger.apply_delta(actor, delta).await
    }

    /// Fire-and-forget `apply_delta`.
    pub fn record_delta(&self, actor: ActorId, delta: i32) {
        if self.is_enabled() {
            self.ledger.apply_delta_detached(actor, delta);
        }
    }

    pub async fn set_count(&self, actor: ActorId, count: i32) -> bool {
        self.ledger.set_count(actor, count).await
    }

    pub async fn reset_actor(&self, actor: ActorId) -> bool {
        self.ledger.reset(actor).await
    }

    pub async fn statistics(&self) -> QuotaStatistics {
        self.ledger.statistics().await
    }

    pub fn clear_cache(&self) {
        self.ledger.cache().clear();
    }

    pub fn cache_size(&self) -> usize {
        self.ledger.cache().size()
    }

    pub fn sweep_cache(&self) -> usize {
        self.ledger.sweep()
    }

    pub(crate) fn reload(&self, config: &QuotaConfig) {
        self.enabled.store(config.actor.enabled, Ordering::Relaxed);
        *self.tiers.write() = tier_table(config);
        self.ledger
            .cache()
            .reconfigure(config.cache_ttl(), config.cache.enabled);
    }
}

fn tier_table(config: &QuotaConfig) -> TierTable {
    TierTable::from_config(&config.actor, &config.permissions.bypass_actor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TierRuleConfig;
    use crate::dispatch::{AsyncTask, RegionTask};
    use crate::key::CellKey;

    struct Spawner;

    impl Dispatch for Spawner {
        fn run_async(&self, task: AsyncTask) {
            drop(tokio::spawn(task));
        }

        fn run_on_region_owner_of(&self, _cell: &CellKey, task: RegionTask) {
            task();
        }
    }

    fn service(config: &QuotaConfig) -> (ActorQuotaService, Arc<CounterStore>) {
        let store = Arc::new(CounterStore::open_in_memory().expect("open"));
        let service = ActorQuotaService::new(
            config,
            Arc::clone(&store),
            Arc::new(Spawner),
            Arc::new(QuotaTelemetry::default()),
        );
        (service, store)
    }

    #[test]
    fn tiers_never_lower_the_default() {
        let (service, _store) = service(&QuotaConfig::development());
        let low = PermissionSet::new()
            .grant("spawnquota.peractor.200")
            .grant("spawnquota.peractor.50");
        assert_eq!(service.effective_limit(&low), 500);
        let high = PermissionSet::new().grant("spawnquota.peractor.1500");
        assert_eq!(service.effective_limit(&high), 1500);
        let bypass = PermissionSet::new().grant("spawnquota.peractor.bypass");
        assert_eq!(service.effective_limit(&bypass), i32::MAX);
    }

    #[test]
    fn fixed_tiers_from_config() {
        let mut config = QuotaConfig::development();
        config.actor.tiers.push(TierRuleConfig {
            permission: "rank.vip".into(),
            ceiling: 800,
        });
        let (service, _store) = service(&config);
        let vip = PermissionSet::new().grant("rank.vip");
        assert_eq!(service.effective_limit(&vip), 800);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn limit_applies_to_the_actor_total() {
        let mut config = QuotaConfig::development();
        config.actor.max_per_actor = 10;
        let (service, _store) = service(&config);
        let actor = ActorId::random();
        let perms = PermissionSet::new();
        assert_eq!(service.apply_delta(actor, 8).await, Some(8));
        assert!(service.can_admit(actor, &perms, 2));
        assert_eq!(
            service.check(actor, &perms, 3),
            Verdict::Denied {
                current: 8,
                limit: 10
            }
        );
        let bypass = PermissionSet::new().grant("spawnquota.peractor.bypass");
        assert!(service.can_admit(actor, &bypass, 1_000));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn disabled_service_neither_counts_nor_limits() {
        let mut config = QuotaConfig::development();
        config.actor.enabled = false;
        config.actor.max_per_actor = 0;
        let (service, store) = service(&config);
        let actor = ActorId::random();
        store.set(actor, 50).await;
        assert_eq!(service.current_count(actor), 0);
        assert!(service.can_admit(actor, &PermissionSet::new(), 10));
        assert_eq!(service.apply_delta(actor, 5).await, None);
        assert_eq!(store.get(actor).await, 50);

        config.actor.enabled = true;
        service.reload(&config);
        assert_eq!(service.current_count(actor), 50);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reset_actor_starts_from_zero() {
        let (service, store) = service(&QuotaConfig::development());
        let actor = ActorId::random();
        service.apply_delta(actor, 12).await;
        assert!(service.reset_actor(actor).await);
        assert_eq!(service.current_count(actor), 0);
        assert!(!store.exists(actor).await);
        let stats = service.statistics().await;
        assert_eq!(stats.tracked_keys, 0);
    }
}
