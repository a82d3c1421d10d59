pub mod cache;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod inventory;
pub mod key;
pub mod metrics;
pub mod permission;
pub mod service;
pub mod store;

use crate::config::QuotaConfig;
use crate::dispatch::{Dispatch, RegionDispatcher};
use crate::error::QuotaError;
use crate::event::{ActorContext, Admission, Denial, DenialKind, DenialSink, LogDenials};
use crate::inventory::{LiveInventory, NoInventory};
use crate::key::{ActorId, CellKey, WorldPos};
use crate::metrics::{QuotaMetrics, QuotaTelemetry};
use crate::permission::PermissionSet;
use crate::service::{ActorQuotaService, CellQuotaService, QuotaStatistics, Verdict};
use crate::store::CounterStore;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Host collaborators the engine talks to.
pub struct HostBindings {
    pub inventory: Arc<dyn LiveInventory>,
    pub denials: Arc<dyn DenialSink>,
    /// `None` builds a [`RegionDispatcher`] on the engine's runtime.
    pub dispatch: Option<Arc<dyn Dispatch>>,
}

impl Default for HostBindings {
    fn default() -> Self {
        Self {
            inventory: Arc::new(NoInventory),
            denials: Arc::new(LogDenials),
            dispatch: None,
        }
    }
}

impl HostBindings {
    pub fn with_inventory(mut self, inventory: Arc<dyn LiveInventory>) -> Self {
        self.inventory = inventory;
        self
    }

    pub fn with_denials(mut self, denials: Arc<dyn DenialSink>) -> Self {
        self.denials = denials;
        self
    }

    pub fn with_dispatch(mut self, dispatch: Arc<dyn Dispatch>) -> Self {
        self.dispatch = Some(dispatch);
        self
    }
}

/// Spawner quota enforcement for one host process.
///
/// Admission hooks are synchronous and only touch the store on a cache miss.
/// Every count change is applied in the background. Denials are reported to
/// the [`DenialSink`] on the region that owns the actor's location.
pub struct QuotaEngine {
    config: RwLock<QuotaConfig>,
    store: Arc<CounterStore>,
    cells: Arc<CellQuotaService>,
    actors: Arc<ActorQuotaService>,
    dispatch: Arc<dyn Dispatch>,
    denials: Arc<dyn DenialSink>,
    telemetry: Arc<QuotaTelemetry>,
    sweep_interval_ms: Arc<AtomicU64>,
    sweep_wake: Arc<Notify>,
    background_tasks: Mutex<Vec<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl QuotaEngine {
    /// Starts on the tokio runtime the caller is running on.
    pub fn start(config: QuotaConfig, bindings: HostBindings) -> Result<Self, QuotaError> {
        let runtime = Handle::try_current().map_err(|e| QuotaError::Dispatch {
            message: format!("no tokio runtime available: {e}"),
        })?;
        Self::start_on(config, runtime, bindings)
    }

    /// Opens the store and starts the background sweep on `runtime`. A store
    /// that can not be opened is fatal.
    pub fn start_on(
        config: QuotaConfig,
        runtime: Handle,
        bindings: HostBindings,
    ) -> Result<Self, QuotaError> {
        config.validate()?;
        let store = Arc::new(CounterStore::open(&config.store)?);
        let dispatch: Arc<dyn Dispatch> = match bindings.dispatch {
            Some(dispatch) => dispatch,
            None => Arc::new(RegionDispatcher::new(runtime.clone(), &config.dispatch)?),
        };
        let telemetry = Arc::new(QuotaTelemetry::default());
        let cells = Arc::new(CellQuotaService::new(
            &config,
            Arc::clone(&store),
            bindings.inventory,
            Arc::clone(&dispatch),
            Arc::clone(&telemetry),
        ));
        let actors = Arc::new(ActorQuotaService::new(
            &config,
            Arc::clone(&store),
            Arc::clone(&dispatch),
            Arc::clone(&telemetry),
        ));

        let sweep_interval_ms = Arc::new(AtomicU64::new(millis(config.sweep_interval())));
        let sweep_wake = Arc::new(Notify::new());
        let sweep_handle = {
            let cells = Arc::clone(&cells);
            let actors = Arc::clone(&actors);
            let interval_ms = Arc::clone(&sweep_interval_ms);
            let wake = Arc::clone(&sweep_wake);
            runtime.spawn(async move {
                loop {
                    let sleep_ms = interval_ms.load(Ordering::Relaxed).max(1);
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(sleep_ms)) => {}
                        // Interval changed; start a fresh period.
                        _ = wake.notified() => continue,
                    }
                    let removed = cells.sweep_cache() + actors.sweep_cache();
                    debug!(removed, "cache sweep finished");
                }
            })
        };

        info!(
            cell_quota = config.cell.enabled,
            actor_quota = config.actor.enabled,
            cache = config.cache.enabled,
            "quota engine started"
        );
        Ok(Self {
            config: RwLock::new(config),
            store,
            cells,
            actors,
            dispatch,
            denials: bindings.denials,
            telemetry,
            sweep_interval_ms,
            sweep_wake,
            background_tasks: Mutex::new(vec![sweep_handle]),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> QuotaConfig {
        self.config.read().clone()
    }

    pub fn cells(&self) -> &CellQuotaService {
        &self.cells
    }

    pub fn actors(&self) -> &ActorQuotaService {
        &self.actors
    }

    /// A new unit is about to be placed at `at`. On `Allowed` both counts are
    /// raised in the background.
    pub fn object_placed(&self, actor: &ActorContext, at: &WorldPos, quantity: i32) -> Admission {
        if quantity <= 0 {
            return Admission::Allowed;
        }
        let cell = at.cell();
        let admission = self.admit(actor, &cell, quantity);
        if admission.is_allowed() {
            self.cells.record_delta(cell, quantity);
            self.actors.record_delta(actor.id, quantity);
        }
        admission
    }

    /// A stack is about to change size. Only growth is checked; nothing is
    /// recorded until [`object_stack_changed`](Self::object_stack_changed).
    pub fn object_stack_changing(
        &self,
        actor: &ActorContext,
        at: &WorldPos,
        old_qty: i32,
        new_qty: i32,
    ) -> Admission {
        let growth = saturating_diff(new_qty, old_qty);
        if growth <= 0 {
            return Admission::Allowed;
        }
        self.admit(actor, &at.cell(), growth)
    }

    /// A stack change completed.
    pub fn object_stack_changed(
        &self,
        actor: &ActorContext,
        at: &WorldPos,
        old_qty: i32,
        new_qty: i32,
    ) {
        let delta = saturating_diff(new_qty, old_qty);
        if delta == 0 {
            return;
        }
        self.cells.record_delta(at.cell(), delta);
        self.actors.record_delta(actor.id, delta);
    }

    /// `amount` units were removed at `at`. The sign of `amount` is ignored.
    pub fn object_removed(&self, actor: &ActorContext, at: &WorldPos, amount: i32) {
        let amount = amount.saturating_abs();
        if amount == 0 {
            return;
        }
        self.cells.record_delta(at.cell(), -amount);
        self.actors.record_delta(actor.id, -amount);
    }

    fn admit(&self, actor: &ActorContext, cell: &CellKey, delta: i32) -> Admission {
        if let Verdict::Denied { current, limit } =
            self.cells.check(&actor.permissions, cell, delta)
        {
            return self.deny(
                actor,
                Denial {
                    kind: DenialKind::Cell(cell.clone()),
                    current,
                    limit,
                },
            );
        }
        if let Verdict::Denied { current, limit } =
            self.actors.check(actor.id, &actor.permissions, delta)
        {
            return self.deny(
                actor,
                Denial {
                    kind: DenialKind::Actor(actor.id),
                    current,
                    limit,
                },
            );
        }
        Admission::Allowed
    }

    fn deny(&self, actor: &ActorContext, denial: Denial) -> Admission {
        let sink = Arc::clone(&self.denials);
        let id = actor.id;
        let notice = denial.clone();
        self.dispatch.run_on_region_owner_of(
            &actor.location.cell(),
            Box::new(move || sink.deliver(id, &notice)),
        );
        Admission::Denied(denial)
    }

    pub fn cell_count(&self, cell: &CellKey) -> i32 {
        self.cells.current_count(cell)
    }

    pub fn actor_count(&self, actor: ActorId) -> i32 {
        self.actors.current_count(actor)
    }

    pub fn actor_limit(&self, permissions: &PermissionSet) -> i32 {
        self.actors.effective_limit(permissions)
    }

    pub async fn reset_cell(&self, cell: CellKey) -> bool {
        self.cells.reset_cell(cell).await
    }

    pub async fn reset_actor(&self, actor: ActorId) -> bool {
        self.actors.reset_actor(actor).await
    }

    pub async fn cell_statistics(&self) -> QuotaStatistics {
        self.cells.statistics().await
    }

    pub async fn actor_statistics(&self) -> QuotaStatistics {
        self.actors.statistics().await
    }

    pub fn clear_cache(&self) {
        self.cells.clear_cache();
        self.actors.clear_cache();
    }

    pub fn metrics(&self) -> QuotaMetrics {
        self.telemetry.snapshot(self.store.failures())
    }

    /// Applies new limits, flags and cache settings. Store and dispatch
    /// settings only take effect on the next start.
    pub fn reload(&self, config: QuotaConfig) -> Result<(), QuotaError> {
        config.validate()?;
        {
            let current = self.config.read();
            if current.store != config.store {
                warn!("store settings changed; they apply after a restart");
            }
            if current.dispatch != config.dispatch {
                warn!("dispatch settings changed; they apply after a restart");
            }
        }
        self.cells.reload(&config);
        self.actors.reload(&config);
        self.sweep_interval_ms
            .store(millis(config.sweep_interval()), Ordering::Relaxed);
        self.sweep_wake.notify_one();
        *self.config.write() = config;
        info!("quota configuration reloaded");
        Ok(())
    }

    /// Stops the sweep task and closes the store once the requests already
    /// queued have run. Idempotent.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.abort_background_tasks();
        self.store.close().await;
        info!("quota engine stopped");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    fn abort_background_tasks(&self) {
        for handle in self.background_tasks.lock().drain(..) {
            handle.abort();
        }
    }
}

impl Drop for QuotaEngine {
    fn drop(&mut self) {
        self.abort_background_tasks();
    }
}

fn saturating_diff(new_qty: i32, old_qty: i32) -> i32 {
    let diff = i64::from(new_qty) - i64::from(old_qty);
    diff.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
