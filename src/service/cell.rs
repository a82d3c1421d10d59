use super::ledger::CounterLedger;
use super::{QuotaStatistics, Verdict};
use crate::cache::QuotaCache;
use crate::config::QuotaConfig;
use crate::dispatch::Dispatch;
use crate::inventory::{LiveInventory, tally_cell};
use crate::key::CellKey;
use crate::metrics::QuotaTelemetry;
use crate::permission::PermissionSet;
use crate::store::{CounterStore, CounterTable};
use parking_lot::RwLock;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct CellSettings {
    enabled: bool,
    max_per_cell: i32,
    verify_on_check: bool,
    bypass: Arc<str>,
}

impl CellSettings {
    fn from_config(config: &QuotaConfig) -> Self {
        Self {
            enabled: config.cell.enabled,
            max_per_cell: config.cell.max_per_cell,
            verify_on_check: config.cell.verify_on_check,
            bypass: Arc::from(config.permissions.bypass_cell.as_str()),
        }
    }
}

/// Per-cell ceiling on placed units.
///
/// With `verify_on_check` on, every lookup recounts the cell from the live
/// inventory, returns that number, and writes it back to the store in the
/// background. When the inventory can not answer, the stored count is used.
pub struct CellQuotaService {
    ledger: Arc<CounterLedger<CellKey>>,
    settings: RwLock<CellSettings>,
    inventory: Arc<dyn LiveInventory>,
    telemetry: Arc<QuotaTelemetry>,
}

impl CellQuotaService {
    pub(crate) fn new(
        config: &QuotaConfig,
        store: Arc<CounterStore>,
        inventory: Arc<dyn LiveInventory>,
        dispatch: Arc<dyn Dispatch>,
        telemetry: Arc<QuotaTelemetry>,
    ) -> Self {
        let cache = QuotaCache::new(config.cache_ttl(), config.cache.enabled);
        let ledger = CounterLedger::new(
            store,
            cache,
            dispatch,
            Arc::clone(&telemetry),
            CounterTable::Cells,
        );
        Self {
            ledger: Arc::new(ledger),
            settings: RwLock::new(CellSettings::from_config(config)),
            inventory,
            telemetry,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.read().enabled
    }

    pub fn max_per_cell(&self) -> i32 {
        self.settings.read().max_per_cell
    }

    /// Whether `delta` more units fit in `cell`. Always admits when the
    /// quota is off or the actor holds the bypass permission.
    pub fn can_admit(&self, permissions: &PermissionSet, cell: &CellKey, delta: i32) -> bool {
        self.check(permissions, cell, delta).is_admitted()
    }

    pub fn check(&self, permissions: &PermissionSet, cell: &CellKey, delta: i32) -> Verdict {
        let settings = self.settings.read().clone();
        if !settings.enabled || permissions.has(&settings.bypass) {
            return Verdict::Admitted;
        }
        let current = self.count_with(&settings, cell);
        let verdict = Verdict::evaluate(current, delta, settings.max_per_cell);
        if verdict.is_admitted() {
            QuotaTelemetry::bump(&self.telemetry.cell_admitted);
        } else {
            QuotaTelemetry::bump(&self.telemetry.cell_denied);
            debug!(
                cell = %cell,
                current,
                delta,
                limit = settings.max_per_cell,
                "cell quota denied"
            );
        }
        verdict
    }

    /// Best-known count for `cell`. Blocks on the store only on a cache miss.
    pub fn current_count(&self, cell: &CellKey) -> i32 {
        let settings = self.settings.read().clone();
        self.count_with(&settings, cell)
    }

    fn count_with(&self, settings: &CellSettings, cell: &CellKey) -> i32 {
        if settings.verify_on_check {
            match self.live_count(cell) {
                Some(live) => {
                    QuotaTelemetry::bump(&self.telemetry.reconciliations);
                    self.ledger.cache().put(cell.clone(), live);
                    self.ledger.set_count_detached(cell.clone(), live);
                    return live;
                }
                None => {
                    QuotaTelemetry::bump(&self.telemetry.reconciliations_unknown);
                    debug!(cell = %cell, "live inventory unavailable, using stored count");
                }
            }
        }
        self.ledger.lookup(cell)
    }

    fn live_count(&self, cell: &CellKey) -> Option<i32> {
        catch_unwind(AssertUnwindSafe(|| tally_cell(self.inventory.as_ref(), cell)))
            .unwrap_or_else(|_| {
                warn!(cell = %cell, "live inventory panicked during recount");
                None
            })
    }

    /// Adds `delta` to the stored count. Returns the new count, or `None`
    /// for a zero delta or a store failure.
    pub async fn apply_delta(&self, cell: CellKey, delta: i32) -> Option<i32> {
        self.ledger.apply_delta(cell, delta).await
    }

    /// Fire-and-forget `apply_delta`.
    pub fn record_delta(&self, cell: CellKey, delta: i32) {
        self.ledger.apply_delta_detached(cell, delta);
    }

    pub async fn set_count(&self, cell: CellKey, count: i32) -> bool {
        self.ledger.set_count(cell, count).await
    }

    /// Deletes the stored row and cached value. The next lookup reads 0.
    pub async fn reset_cell(&self, cell: CellKey) -> bool {
        self.ledger.reset(cell).await
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

    /// Evicts expired cache entries and returns how many were dropped.
    pub fn sweep_cache(&self) -> usize {
        self.ledger.sweep()
    }

    pub(crate) fn reload(&self, config: &QuotaConfig) {
        *self.settings.write() = CellSettings::from_config(config);
        self.ledger
            .cache()
            .reconfigure(config.cache_ttl(), config.cache.enabled);
    }
}
