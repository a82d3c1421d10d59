use super::{CounterKey, CounterTable};
use crate::error::StoreError;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};

pub(super) const SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS cell_counters (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    world TEXT NOT NULL,
    cell_x INTEGER NOT NULL,
    cell_z INTEGER NOT NULL,
    unit_count INTEGER NOT NULL DEFAULT 0 CHECK (unit_count >= 0),
    last_updated INTEGER NOT NULL,
    UNIQUE(world, cell_x, cell_z)
);
CREATE INDEX IF NOT EXISTS idx_cell_counters_location
    ON cell_counters(world, cell_x, cell_z);
CREATE TABLE IF NOT EXISTS actor_counters (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    actor_id TEXT NOT NULL UNIQUE,
    unit_count INTEGER NOT NULL DEFAULT 0 CHECK (unit_count >= 0),
    last_updated INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_actor_counters_actor
    ON actor_counters(actor_id);
CREATE TABLE IF NOT EXISTS quota_metadata (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

pub(super) fn create_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(CREATE_SCHEMA)?;
    conn.execute(
        "INSERT OR IGNORE INTO quota_metadata (key, value) VALUES ('schema_version', ?1)",
        params![SCHEMA_VERSION.to_string()],
    )?;
    Ok(())
}

pub(super) fn schema_version(conn: &Connection) -> Result<Option<i64>, StoreError> {
    let value: Option<String> = conn
        .query_row(
            "SELECT value FROM quota_metadata WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value.and_then(|v| v.parse().ok()))
}

pub(super) fn read_count(conn: &Connection, key: &CounterKey) -> Result<Option<i32>, StoreError> {
    let raw: Option<i64> = match key {
        CounterKey::Cell(cell) => conn
            .prepare_cached(
                "SELECT unit_count FROM cell_counters
                 WHERE world = ?1 AND cell_x = ?2 AND cell_z = ?3",
            )?
            .query_row(params![cell.world, cell.cell_x, cell.cell_z], |row| {
                row.get(0)
            })
            .optional()?,
        CounterKey::Actor(actor) => conn
            .prepare_cached("SELECT unit_count FROM actor_counters WHERE actor_id = ?1")?
            .query_row(params![actor.to_string()], |row| row.get(0))
            .optional()?,
    };
    raw.map(to_count).transpose()
}

pub(super) fn write_count(
    conn: &Connection,
    key: &CounterKey,
    count: i32,
    now_millis: i64,
) -> Result<(), StoreError> {
    let count = count.max(0);
    match key {
        CounterKey::Cell(cell) => {
            conn.prepare_cached(
                "INSERT INTO cell_counters (world, cell_x, cell_z, unit_count, last_updated)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(world, cell_x, cell_z)
                 DO UPDATE SET unit_count = excluded.unit_count,
                               last_updated = excluded.last_updated",
            )?
            .execute(params![cell.world, cell.cell_x, cell.cell_z, count, now_millis])?;
        }
        CounterKey::Actor(actor) => {
            conn.prepare_cached(
                "INSERT INTO actor_counters (actor_id, unit_count, last_updated)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(actor_id)
                 DO UPDATE SET unit_count = excluded.unit_count,
                               last_updated = excluded.last_updated",
            )?
            .execute(params![actor.to_string(), count, now_millis])?;
        }
    }
    Ok(())
}

/// Read-modify-write inside one immediate transaction. The result is clamped
/// to `0..=i32::MAX` before it is stored.
pub(super) fn increment_count(
    conn: &mut Connection,
    key: &CounterKey,
    delta: i32,
    now_millis: i64,
) -> Result<i32, StoreError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let current = read_count(&tx, key)?.unwrap_or(0);
    let next = (i64::from(current) + i64::from(delta)).clamp(0, i64::from(i32::MAX));
    let next = to_count(next)?;
    write_count(&tx, key, next, now_millis)?;
    tx.commit()?;
    Ok(next)
}

pub(super) fn delete_row(conn: &Connection, key: &CounterKey) -> Result<usize, StoreError> {
    let removed = match key {
        CounterKey::Cell(cell) => conn
            .prepare_cached(
                "DELETE FROM cell_counters WHERE world = ?1 AND cell_x = ?2 AND cell_z = ?3",
            )?
            .execute(params![cell.world, cell.cell_x, cell.cell_z])?,
        CounterKey::Actor(actor) => conn
            .prepare_cached("DELETE FROM actor_counters WHERE actor_id = ?1")?
            .execute(params![actor.to_string()])?,
    };
    Ok(removed)
}

pub(super) fn row_count(conn: &Connection, table: CounterTable) -> Result<i64, StoreError> {
    let sql = match table {
        CounterTable::Cells => "SELECT COUNT(*) FROM cell_counters",
        CounterTable::Actors => "SELECT COUNT(*) FROM actor_counters",
    };
    Ok(conn.query_row(sql, [], |row| row.get(0))?)
}

pub(super) fn sum_counts(conn: &Connection, table: CounterTable) -> Result<i64, StoreError> {
    let sql = match table {
        CounterTable::Cells => "SELECT COALESCE(SUM(unit_count), 0) FROM cell_counters",
        CounterTable::Actors => "SELECT COALESCE(SUM(unit_count), 0) FROM actor_counters",
    };
    Ok(conn.query_row(sql, [], |row| row.get(0))?)
}

fn to_count(raw: i64) -> Result<i32, StoreError> {
    i32::try_from(raw).map_err(|_| StoreError::OutOfRange(raw))
}
