use crate::key::{CellKey, WorldPos};
use serde::{Deserialize, Serialize};

/// One live spawner as reported by the host's inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveObject {
    /// `None` when the object's world is not loaded.
    pub position: Option<WorldPos>,
    pub stack_size: i32,
}

/// Authoritative view of every live spawner in the world.
pub trait LiveInventory: Send + Sync {
    /// `None` when the source is unavailable. An empty list means "there are
    /// none", which is a different answer.
    fn live_objects(&self) -> Option<Vec<LiveObject>>;
}

/// Sum of stack sizes of the objects inside `cell`, or `None` if the source
/// could not answer.
pub fn tally_cell(inventory: &dyn LiveInventory, cell: &CellKey) -> Option<i32> {
    let objects = inventory.live_objects()?;
    let total = objects
        .iter()
        .filter(|o| o.position.as_ref().is_some_and(|p| cell.contains(p)))
        .map(|o| i64::from(o.stack_size.max(0)))
        .sum::<i64>();
    Some(i32::try_from(total).unwrap_or(i32::MAX))
}

/// Inventory that never answers; reconciliation falls back to stored counts.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoInventory;

impl LiveInventory for NoInventory {
    fn live_objects(&self) -> Option<Vec<LiveObject>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Vec<LiveObject>);

    impl LiveInventory for Fixed {
        fn live_objects(&self) -> Option<Vec<LiveObject>> {
            Some(self.0.clone())
        }
    }

    fn at(world: &str, x: i32, z: i32, stack_size: i32) -> LiveObject {
        LiveObject {
            position: Some(WorldPos::new(world, x, 64, z)),
            stack_size,
        }
    }

    #[test]
    fn sums_stacks_inside_the_cell_only() {
        let inventory = Fixed(vec![
            at("world", 1, 1, 2),
            at("world", 15, 15, 2),
            at("world", 8, 3, 2),
            at("world", 16, 0, 5),
            at("other", 1, 1, 7),
            LiveObject {
                position: None,
                stack_size: 9,
            },
        ]);
        assert_eq!(tally_cell(&inventory, &CellKey::new("world", 0, 0)), Some(6));
        assert_eq!(tally_cell(&inventory, &CellKey::new("world", 1, 0)), Some(5));
        assert_eq!(tally_cell(&inventory, &CellKey::new("world", 9, 9)), Some(0));
    }

    #[test]
    fn unavailable_source_is_unknown_not_zero() {
        assert_eq!(tally_cell(&NoInventory, &CellKey::new("world", 0, 0)), None);
    }
}
