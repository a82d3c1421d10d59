use crate::config::DispatchConfig;
use crate::error::QuotaError;
use crate::key::{CellKey, RegionKey};
use std::future::Future;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self as std_mpsc, Receiver, Sender};
use tokio::runtime::Handle;
use tracing::warn;

pub type RegionTask = Box<dyn FnOnce() + Send + 'static>;
pub type AsyncTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Where follow-up work runs.
///
/// Neither method runs the task inline. Tasks sent to the same region run in
/// submission order; nothing else about ordering is promised.
pub trait Dispatch: Send + Sync {
    /// Off the caller's path, on a general worker.
    fn run_async(&self, task: AsyncTask);

    /// On the execution context that owns the region containing `cell`.
    fn run_on_region_owner_of(&self, cell: &CellKey, task: RegionTask);
}

struct RegionJob {
    region: RegionKey,
    task: RegionTask,
}

/// Default dispatcher: async work goes to a tokio runtime, region work to a
/// fixed pool of threads with each region pinned to one thread.
pub struct RegionDispatcher {
    runtime: Handle,
    workers: Arc<Vec<Sender<RegionJob>>>,
    region_shift: u32,
    queued_tasks: Arc<AtomicUsize>,
    failed_tasks: Arc<AtomicU64>,
}

impl RegionDispatcher {
    pub fn new(runtime: Handle, config: &DispatchConfig) -> Result<Self, QuotaError> {
        config.validate()?;
        let worker_count = config.region_workers;
        let queued_tasks = Arc::new(AtomicUsize::new(0));
        let failed_tasks = Arc::new(AtomicU64::new(0));
        let mut workers = Vec::with_capacity(worker_count);
        for i in 0..worker_count {
            let (tx, rx) = std_mpsc::channel::<RegionJob>();
            let queued = Arc::clone(&queued_tasks);
            let failed = Arc::clone(&failed_tasks);
            std::thread::Builder::new()
                .name(format!("spawn-quota-region-{i}"))
                .spawn(move || run_region_worker(rx, queued, failed))?;
            workers.push(tx);
        }
        Ok(Self {
            runtime,
            workers: Arc::new(workers),
            region_shift: config.region_shift,
            queued_tasks,
            failed_tasks,
        })
    }

    /// Uses the runtime the caller is running on.
    pub fn from_current(config: &DispatchConfig) -> Result<Self, QuotaError> {
        let runtime = Handle::try_current().map_err(|e| QuotaError::Dispatch {
            message: format!("no tokio runtime available: {e}"),
        })?;
        Self::new(runtime, config)
    }

    pub fn region_of(&self, cell: &CellKey) -> RegionKey {
        cell.region(self.region_shift)
    }

    pub fn queued_tasks(&self) -> usize {
        self.queued_tasks.load(Ordering::Relaxed)
    }

    /// Region tasks that panicked or could not be delivered.
    pub fn failed_tasks(&self) -> u64 {
        self.failed_tasks.load(Ordering::Relaxed)
    }
}

impl Dispatch for RegionDispatcher {
    fn run_async(&self, task: AsyncTask) {
        drop(self.runtime.spawn(task));
    }

    fn run_on_region_owner_of(&self, cell: &CellKey, task: RegionTask) {
        let region = self.region_of(cell);
        let shard = shard_for_region(&region, self.workers.len());
        self.queued_tasks.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self.workers[shard].send(RegionJob { region, task }) {
            self.queued_tasks.fetch_sub(1, Ordering::Relaxed);
            self.failed_tasks.fetch_add(1, Ordering::Relaxed);
            warn!(region = %e.0.region, "region worker unavailable, task dropped");
        }
    }
}

fn run_region_worker(rx: Receiver<RegionJob>, queued: Arc<AtomicUsize>, failed: Arc<AtomicU64>) {
    while let Ok(job) = rx.recv() {
        queued.fetch_sub(1, Ordering::Relaxed);
        let RegionJob { region, task } = job;
        if std::panic::catch_unwind(std::panic::AssertUnwindSafe(task)).is_err() {
            failed.fetch_add(1, Ordering::Relaxed);
            warn!(region = %region, "region task panicked");
        }
    }
}

fn shard_for_region(region: &RegionKey, shard_count: usize) -> usize {
    if shard_count <= 1 {
        return 0;
    }
    let mut h = DefaultHasher::new();
    region.hash(&mut h);
    (h.finish() as usize) % shard_count
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::mpsc;
    use std::thread::ThreadId;
    use std::time::Duration;

    fn dispatcher(rt: &tokio::runtime::Runtime, workers: usize) -> RegionDispatcher {
        RegionDispatcher::new(
            rt.handle().clone(),
            &DispatchConfig {
                region_workers: workers,
                region_shift: 3,
            },
        )
        .expect("dispatcher")
    }

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .expect("runtime")
    }

    #[test]
    fn region_tasks_run_in_submission_order_on_one_thread() {
        let rt = runtime();
        let dispatcher = dispatcher(&rt, 4);
        let seen = Arc::new(Mutex::new(Vec::<(usize, ThreadId)>::new()));
        let (done_tx, done_rx) = mpsc::channel();
        for i in 0..50 {
            // Cells 0..8 share region (0, 0) with region_shift 3.
            let cell = CellKey::new("world", (i % 8) as i32, 0);
            let seen = Arc::clone(&seen);
            let done_tx = done_tx.clone();
            dispatcher.run_on_region_owner_of(
                &cell,
                Box::new(move || {
                    seen.lock().push((i, std::thread::current().id()));
                    let _ = done_tx.send(());
                }),
            );
        }
        for _ in 0..50 {
            done_rx
                .recv_timeout(Duration::from_secs(5))
                .expect("region task ran");
        }
        let seen = seen.lock();
        let order: Vec<usize> = seen.iter().map(|(i, _)| *i).collect();
        assert_eq!(order, (0..50).collect::<Vec<_>>());
        let first_thread = seen[0].1;
        assert!(seen.iter().all(|(_, t)| *t == first_thread));
        assert_ne!(first_thread, std::thread::current().id());
    }

    #[test]
    fn panicking_task_does_not_kill_the_worker() {
        let rt = runtime();
        let dispatcher = dispatcher(&rt, 1);
        let cell = CellKey::new("world", 0, 0);
        dispatcher.run_on_region_owner_of(&cell, Box::new(|| panic!("boom")));
        let (tx, rx) = mpsc::channel();
        dispatcher.run_on_region_owner_of(
            &cell,
            Box::new(move || {
                let _ = tx.send(42);
            }),
        );
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).expect("ran"), 42);
        assert_eq!(dispatcher.failed_tasks(), 1);
    }

    #[test]
    fn async_tasks_run_on_the_runtime() {
        let rt = runtime();
        let dispatcher = dispatcher(&rt, 1);
        let (tx, rx) = mpsc::channel();
        dispatcher.run_async(Box::pin(async move {
            tokio::task::yield_now().await;
            let _ = tx.send(Handle::try_current().is_ok());
        }));
        assert!(rx.recv_timeout(Duration::from_secs(5)).expect("ran"));
    }

    #[test]
    fn out_of_range_settings_are_rejected() {
        let rt = runtime();
        for config in [
            DispatchConfig {
                region_workers: 1,
                region_shift: 40,
            },
            DispatchConfig {
                region_workers: 0,
                region_shift: 3,
            },
        ] {
            let err = RegionDispatcher::new(rt.handle().clone(), &config)
                .err()
                .expect("rejected");
            assert_eq!(err.code_str(), "invalid_config");
        }

        let widest = RegionDispatcher::new(
            rt.handle().clone(),
            &DispatchConfig {
                region_workers: 1,
                region_shift: DispatchConfig::MAX_REGION_SHIFT,
            },
        )
        .expect("widest regions");
        let (tx, rx) = mpsc::channel();
        widest.run_on_region_owner_of(
            &CellKey::new("w", i32::MIN, i32::MAX),
            Box::new(move || {
                let _ = tx.send(());
            }),
        );
        rx.recv_timeout(Duration::from_secs(5)).expect("ran");
    }

    #[test]
    fn from_current_requires_a_runtime() {
        let err = RegionDispatcher::from_current(&DispatchConfig::default())
            .err()
            .expect("no runtime outside tokio");
        assert_eq!(err.code_str(), "dispatch");
    }
}
