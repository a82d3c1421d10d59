//! Durable counters behind a single-owner worker thread.
//!
//! The SQLite connection lives on one dedicated thread and every request is a
//! message to it, so reads, upserts and read-modify-write increments are
//! totally ordered and an increment can never be lost to a concurrent one.
//! Failures never leave this module: they are logged, counted, and turned
//! into neutral defaults (0 for reads, `false` for writes, `None` for
//! increments).

mod sql;

use crate::config::StoreConfig;
use crate::error::{QuotaError, StoreError};
use crate::key::{ActorId, CellKey};
use rusqlite::Connection;
use std::fs;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self as std_mpsc, Receiver, Sender, SyncSender};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CounterKey {
    Cell(CellKey),
    Actor(ActorId),
}

impl std::fmt::Display for CounterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CounterKey::Cell(cell) => write!(f, "cell {cell}"),
            CounterKey::Actor(actor) => write!(f, "actor {actor}"),
        }
    }
}

impl From<CellKey> for CounterKey {
    fn from(key: CellKey) -> Self {
        CounterKey::Cell(key)
    }
}

impl From<ActorId> for CounterKey {
    fn from(id: ActorId) -> Self {
        CounterKey::Actor(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterTable {
    Cells,
    Actors,
}

enum Reply<T> {
    Async(oneshot::Sender<T>),
    Blocking(SyncSender<T>),
}

impl<T> Reply<T> {
    fn send(self, value: T) {
        match self {
            Reply::Async(tx) => {
                let _ = tx.send(value);
            }
            Reply::Blocking(tx) => {
                let _ = tx.send(value);
            }
        }
    }
}

/// A store answer stamped with the worker's operation sequence number.
/// Larger `seq` means the operation ran later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Observed<T> {
    pub(crate) value: T,
    pub(crate) seq: u64,
}

type Stamped<T> = Reply<Result<Observed<T>, StoreError>>;

/// A request already queued on the worker whose answer has not been read.
pub(crate) struct Pending<T> {
    op: &'static str,
    key: CounterKey,
    rx: Result<oneshot::Receiver<Result<T, StoreError>>, StoreError>,
}

enum StoreRequest {
    Get {
        key: CounterKey,
        reply: Stamped<Option<i32>>,
    },
    Set {
        key: CounterKey,
        count: i32,
        reply: Stamped<()>,
    },
    Increment {
        key: CounterKey,
        delta: i32,
        reply: Stamped<i32>,
    },
    Delete {
        key: CounterKey,
        reply: Stamped<usize>,
    },
    RowCount {
        table: CounterTable,
        reply: Reply<Result<i64, StoreError>>,
    },
    SumCounts {
        table: CounterTable,
        reply: Reply<Result<i64, StoreError>>,
    },
    Close {
        reply: Reply<()>,
    },
}

pub struct CounterStore {
    tx: Sender<StoreRequest>,
    failures: AtomicU64,
}

impl CounterStore {
    /// Opens the database and creates the schema. Failure here is fatal to
    /// the quota services.
    pub fn open(config: &StoreConfig) -> Result<Self, QuotaError> {
        let conn = if config.is_in_memory() {
            Connection::open_in_memory()?
        } else {
            if let Some(parent) = config.path.parent()
                && !parent.as_os_str().is_empty()
            {
                fs::create_dir_all(parent)?;
            }
            let conn = Connection::open(&config.path)?;
            let mode: String =
                conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
            debug!(journal_mode = %mode, "counter store journal mode");
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            conn
        };
        conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;
        sql::create_schema(&conn).map_err(|e| QuotaError::StoreUnavailable {
            message: format!("schema creation failed: {e}"),
        })?;
        let version = sql::schema_version(&conn).map_err(|e| QuotaError::StoreUnavailable {
            message: format!("schema version unreadable: {e}"),
        })?;
        if version != Some(sql::SCHEMA_VERSION) {
            return Err(QuotaError::StoreUnavailable {
                message: format!(
                    "unsupported schema version {version:?}, expected {}",
                    sql::SCHEMA_VERSION
                ),
            });
        }

        let (tx, rx) = std_mpsc::channel::<StoreRequest>();
        std::thread::Builder::new()
            .name("spawn-quota-store".into())
            .spawn(move || run_worker(conn, rx))?;
        info!(path = %config.path.display(), "counter store opened");
        Ok(Self {
            tx,
            failures: AtomicU64::new(0),
        })
    }

    pub fn open_in_memory() -> Result<Self, QuotaError> {
        Self::open(&StoreConfig::in_memory())
    }

    /// Number of operations that failed and resolved to a default.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub async fn get(&self, key: impl Into<CounterKey>) -> i32 {
        let key = key.into();
        let result = self
            .call(|reply| StoreRequest::Get {
                key: key.clone(),
                reply,
            })
            .await;
        self.settle("get", &key, result)
            .and_then(|observed| observed.value)
            .unwrap_or(0)
    }

    /// Blocks the calling thread until the worker answers. Only meant for the
    /// cache-miss fallback of synchronous lookups.
    pub fn get_blocking(&self, key: impl Into<CounterKey>) -> i32 {
        self.read_blocking(key.into())
            .map(|observed| observed.value)
            .unwrap_or(0)
    }

    /// `None` when the read failed, a value of 0 when no row exists.
    pub(crate) fn read_blocking(&self, key: CounterKey) -> Option<Observed<i32>> {
        let result = self.call_blocking(|reply| StoreRequest::Get {
            key: key.clone(),
            reply,
        });
        self.settle("get", &key, result).map(|observed| Observed {
            value: observed.value.unwrap_or(0),
            seq: observed.seq,
        })
    }

    pub async fn exists(&self, key: impl Into<CounterKey>) -> bool {
        let key = key.into();
        let result = self
            .call(|reply| StoreRequest::Get {
                key: key.clone(),
                reply,
            })
            .await;
        self.settle("exists", &key, result)
            .is_some_and(|observed| observed.value.is_some())
    }

    /// Upsert the exact count (negative values are stored as 0).
    pub async fn set(&self, key: impl Into<CounterKey>, count: i32) -> bool {
        self.set_observed(key.into(), count).await.is_some()
    }

    /// Sequence number of the write, `None` when it failed.
    pub(crate) async fn set_observed(&self, key: CounterKey, count: i32) -> Option<u64> {
        self.resolve(self.submit_set(key, count))
            .await
            .map(|observed| observed.seq)
    }

    /// Queues an upsert now; the answer is collected with [`resolve`](Self::resolve).
    pub(crate) fn submit_set(&self, key: CounterKey, count: i32) -> Pending<Observed<()>> {
        let rx = self.enqueue(|reply| StoreRequest::Set {
            key: key.clone(),
            count,
            reply,
        });
        Pending { op: "set", key, rx }
    }

    /// Atomic add; returns the stored post-increment value.
    pub async fn increment(&self, key: impl Into<CounterKey>, delta: i32) -> Option<i32> {
        self.increment_observed(key.into(), delta)
            .await
            .map(|observed| observed.value)
    }

    pub(crate) async fn increment_observed(
        &self,
        key: CounterKey,
        delta: i32,
    ) -> Option<Observed<i32>> {
        self.resolve(self.submit_increment(key, delta)).await
    }

    pub(crate) fn submit_increment(&self, key: CounterKey, delta: i32) -> Pending<Observed<i32>> {
        let rx = self.enqueue(|reply| StoreRequest::Increment {
            key: key.clone(),
            delta,
            reply,
        });
        Pending {
            op: "increment",
            key,
            rx,
        }
    }

    /// Waits for a submitted request. Failures are settled like any other call.
    pub(crate) async fn resolve<T>(&self, pending: Pending<T>) -> Option<T> {
        let Pending { op, key, rx } = pending;
        let result = match rx {
            Ok(rx) => rx.await.unwrap_or_else(|_| Err(StoreError::WorkerGone)),
            Err(e) => Err(e),
        };
        self.settle(op, &key, result)
    }

    /// `true` when the delete ran, whether or not a row existed.
    pub async fn delete(&self, key: impl Into<CounterKey>) -> bool {
        self.delete_observed(key.into()).await.is_some()
    }

    pub(crate) async fn delete_observed(&self, key: CounterKey) -> Option<u64> {
        let result = self
            .call(|reply| StoreRequest::Delete {
                key: key.clone(),
                reply,
            })
            .await;
        self.settle("delete", &key, result).map(|observed| observed.seq)
    }

    pub async fn row_count(&self, table: CounterTable) -> i64 {
        let result = self.call(|reply| StoreRequest::RowCount { table, reply }).await;
        self.settle_table("row_count", table, result)
    }

    pub async fn sum_counts(&self, table: CounterTable) -> i64 {
        let result = self.call(|reply| StoreRequest::SumCounts { table, reply }).await;
        self.settle_table("sum_counts", table, result)
    }

    /// Lets every request queued so far finish, then stops the worker. Later
    /// requests resolve to defaults.
    pub async fn close(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .tx
            .send(StoreRequest::Close {
                reply: Reply::Async(tx),
            })
            .is_err()
        {
            return;
        }
        let _ = rx.await;
    }

    async fn call<T>(
        &self,
        build: impl FnOnce(Reply<Result<T, StoreError>>) -> StoreRequest,
    ) -> Result<T, StoreError> {
        let rx = self.enqueue(build)?;
        rx.await.map_err(|_| StoreError::WorkerGone)?
    }

    /// Sends the request before returning, so requests enqueued from one
    /// thread run in that order.
    fn enqueue<T>(
        &self,
        build: impl FnOnce(Reply<Result<T, StoreError>>) -> StoreRequest,
    ) -> Result<oneshot::Receiver<Result<T, StoreError>>, StoreError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(build(Reply::Async(tx)))
            .map_err(|_| StoreError::WorkerGone)?;
        Ok(rx)
    }

    fn call_blocking<T>(
        &self,
        build: impl FnOnce(Reply<Result<T, StoreError>>) -> StoreRequest,
    ) -> Result<T, StoreError> {
        let (tx, rx) = std_mpsc::sync_channel(1);
        self.tx
            .send(build(Reply::Blocking(tx)))
            .map_err(|_| StoreError::WorkerGone)?;
        rx.recv().map_err(|_| StoreError::WorkerGone)?
    }

    fn settle<T>(
        &self,
        op: &'static str,
        key: &CounterKey,
        result: Result<T, StoreError>,
    ) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                self.record_failure(op, key, &e);
                None
            }
        }
    }

    fn settle_table(
        &self,
        op: &'static str,
        table: CounterTable,
        result: Result<i64, StoreError>,
    ) -> i64 {
        result.unwrap_or_else(|e| {
            self.failures.fetch_add(1, Ordering::Relaxed);
            warn!(op, table = ?table, error = %e, "counter store aggregate failed");
            0
        })
    }

    fn record_failure(&self, op: &'static str, key: &CounterKey, err: &StoreError) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        warn!(op, key = %key, error = %err, "counter store operation failed");
    }
}

fn run_worker(mut conn: Connection, rx: Receiver<StoreRequest>) {
    let mut seq: u64 = 0;
    while let Ok(request) = rx.recv() {
        seq += 1;
        match request {
            StoreRequest::Get { key, reply } => {
                reply.send(stamp(sql::read_count(&conn, &key), seq))
            }
            StoreRequest::Set { key, count, reply } => {
                reply.send(stamp(sql::write_count(&conn, &key, count, now_millis()), seq))
            }
            StoreRequest::Increment { key, delta, reply } => reply.send(stamp(
                sql::increment_count(&mut conn, &key, delta, now_millis()),
                seq,
            )),
            StoreRequest::Delete { key, reply } => {
                reply.send(stamp(sql::delete_row(&conn, &key), seq))
            }
            StoreRequest::RowCount { table, reply } => reply.send(sql::row_count(&conn, table)),
            StoreRequest::SumCounts { table, reply } => {
                reply.send(sql::sum_counts(&conn, table))
            }
            StoreRequest::Close { reply } => {
                reply.send(());
                break;
            }
        }
    }
    match conn.close() {
        Ok(()) => info!("counter store closed"),
        Err((_, e)) => warn!(error = %e, "counter store close failed"),
    }
}

fn stamp<T>(result: Result<T, StoreError>, seq: u64) -> Result<Observed<T>, StoreError> {
    result.map(|value| Observed { value, seq })
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
