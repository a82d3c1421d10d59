use crate::error::QuotaError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Block coordinates are shifted right by this much to get the cell coordinate.
pub const CELL_SHIFT: u32 = 4;

/// A block position inside a named world.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorldPos {
    pub world: String,
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl WorldPos {
    pub fn new(world: impl Into<String>, x: i32, y: i32, z: i32) -> Self {
        Self {
            world: world.into(),
            x,
            y,
            z,
        }
    }

    pub fn cell(&self) -> CellKey {
        CellKey::containing(self)
    }
}

/// Identifies one 16x16 cell of a world's horizontal plane.
///
/// Ordering follows the `(world, cell_x, cell_z)` tuple. The canonical string
/// form is `world:x,z`; `FromStr` accepts exactly what `Display` produces.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CellKey {
    pub world: String,
    pub cell_x: i32,
    pub cell_z: i32,
}

impl CellKey {
    pub fn new(world: impl Into<String>, cell_x: i32, cell_z: i32) -> Self {
        Self {
            world: world.into(),
            cell_x,
            cell_z,
        }
    }

    /// Arithmetic shift, so negative block coordinates round toward negative
    /// infinity (block -1 lives in cell -1).
    pub fn containing(pos: &WorldPos) -> Self {
        Self {
            world: pos.world.clone(),
            cell_x: pos.x >> CELL_SHIFT,
            cell_z: pos.z >> CELL_SHIFT,
        }
    }

    pub fn contains(&self, pos: &WorldPos) -> bool {
        pos.world == self.world
            && pos.x >> CELL_SHIFT == self.cell_x
            && pos.z >> CELL_SHIFT == self.cell_z
    }

    pub fn region(&self, region_shift: u32) -> RegionKey {
        RegionKey {
            world: self.world.clone(),
            region_x: self.cell_x >> region_shift,
            region_z: self.cell_z >> region_shift,
        }
    }
}

impl fmt::Display for CellKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{},{}", self.world, self.cell_x, self.cell_z)
    }
}

impl FromStr for CellKey {
    type Err = QuotaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // World names may themselves contain ':', the coordinate part never does.
        let (world, coords) = s
            .rsplit_once(':')
            .ok_or_else(|| invalid_key(s, "expected world:x,z"))?;
        if world.is_empty() {
            return Err(invalid_key(s, "empty world name"));
        }
        let (x, z) = coords
            .split_once(',')
            .ok_or_else(|| invalid_key(s, "expected x,z coordinates"))?;
        let cell_x = x
            .trim()
            .parse::<i32>()
            .map_err(|e| invalid_key(s, &format!("bad x coordinate: {e}")))?;
        let cell_z = z
            .trim()
            .parse::<i32>()
            .map_err(|e| invalid_key(s, &format!("bad z coordinate: {e}")))?;
        Ok(Self::new(world, cell_x, cell_z))
    }
}

/// Stable identity of a connected actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorId(Uuid);

impl ActorId {
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl From<Uuid> for ActorId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.hyphenated().fmt(f)
    }
}

impl FromStr for ActorId {
    type Err = QuotaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|e| invalid_key(s, &e.to_string()))
    }
}

/// Group of cells whose mutations the host confines to one execution context.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegionKey {
    pub world: String,
    pub region_x: i32,
    pub region_z: i32,
}

impl fmt::Display for RegionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{},{}", self.world, self.region_x, self.region_z)
    }
}

fn invalid_key(input: &str, reason: &str) -> QuotaError {
    QuotaError::InvalidKey {
        input: input.to_string(),
        reason: reason.to_string(),
    }
}
