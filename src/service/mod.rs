//! Quota services for cells and actors.

mod actor;
mod cell;
mod ledger;

pub use actor::ActorQuotaService;
pub use cell::CellQuotaService;

use serde::Serialize;

/// Outcome of a single quota check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Admitted,
    Denied { current: i32, limit: i32 },
}

impl Verdict {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Verdict::Admitted)
    }

    /// Admits when `current + delta` stays within `limit`, computed without
    /// overflow.
    pub(crate) fn evaluate(current: i32, delta: i32, limit: i32) -> Self {
        if i64::from(current) + i64::from(delta) <= i64::from(limit) {
            Verdict::Admitted
        } else {
            Verdict::Denied { current, limit }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct QuotaStatistics {
    /// Rows in the store.
    pub tracked_keys: i64,
    /// Sum of all stored counts.
    pub total_units: i64,
    /// Values currently cached.
    pub cache_size: usize,
}
