use crate::key::{ActorId, CellKey, WorldPos};
use crate::permission::PermissionSet;
use serde::Serialize;
use std::fmt;
use tracing::info;

/// The actor behind an inbound event, as the host sees it right now.
#[derive(Debug, Clone)]
pub struct ActorContext {
    pub id: ActorId,
    pub permissions: PermissionSet,
    /// Where the actor currently stands. Denial notices are delivered on the
    /// region owning this position.
    pub location: WorldPos,
}

impl ActorContext {
    pub fn new(id: ActorId, permissions: PermissionSet, location: WorldPos) -> Self {
        Self {
            id,
            permissions,
            location,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum DenialKind {
    Cell(CellKey),
    Actor(ActorId),
}

/// Why an operation was refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Denial {
    pub kind: DenialKind,
    pub current: i32,
    pub limit: i32,
}

impl fmt::Display for Denial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            DenialKind::Cell(cell) => write!(
                f,
                "cell {cell} already holds {} of {} spawners",
                self.current, self.limit
            ),
            DenialKind::Actor(actor) => write!(
                f,
                "actor {actor} already owns {} of {} spawners",
                self.current, self.limit
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Denied(Denial),
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed)
    }
}

/// Receives denial notices on the execution context that owns the actor's
/// region. Implementations cancel the host action and tell the actor.
pub trait DenialSink: Send + Sync {
    fn deliver(&self, actor: ActorId, denial: &Denial);
}

/// Sink that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogDenials;

impl DenialSink for LogDenials {
    fn deliver(&self, actor: ActorId, denial: &Denial) {
        info!(actor = %actor, "{denial}");
    }
}
