//! Belt Registry: tile->structure map, structure list, placement/removal
//! with horizontal merge/split, and the parallel per-structure column shift.
//!
//! Generalizes the teacher's `structures.rs::Structure` catalogue (a `Vec`
//! of named prefabs placed into the grid at an offset) from a static
//! prefab list into a mutable, mergeable placement registry.

use ahash::AHashMap;
use rayon::prelude::*;

use crate::grid::Grid;

pub const BELT_BLOCK_SIZE: i32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeltTile {
    pub direction: i8,
    pub belt_id: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeltStructure {
    pub id: u16,
    pub tile_y: i32,
    pub min_x: i32,
    pub max_x: i32,
    pub direction: i8,
    pub speed: u32,
    pub frame_offset: u32,
}

impl BeltStructure {
    pub fn surface_row(&self) -> i32 {
        self.tile_y - 1
    }
}

pub fn snap_to_grid(n: i32) -> i32 {
    n & !(BELT_BLOCK_SIZE - 1)
}

pub struct BeltRegistry {
    tiles: AHashMap<(i32, i32), BeltTile>,
    structures: Vec<Option<BeltStructure>>,
    free_ids: Vec<u16>,
    next_id: u16,
    material_pos: u8,
    material_neg: u8,
    default_speed: u32,
}

impl BeltRegistry {
    pub fn new(material_pos: u8, material_neg: u8, default_speed: u32) -> Self {
        BeltRegistry {
            tiles: AHashMap::default(),
            structures: vec![None], // index 0 reserved, mirrors cluster id convention
            free_ids: Vec::new(),
            next_id: 1,
            material_pos,
            material_neg,
            default_speed,
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

    fn material_for(&self, direction: i8) -> u8 {
        if direction >= 0 {
            self.material_pos
        } else {
            self.material_neg
        }
    }

    fn structure_mut(&mut self, id: u16) -> &mut Option<BeltStructure> {
        &mut self.structures[id as usize]
    }

    /// Places an 8x8 belt block whose surface row is `y`; the block itself
    /// fills rows `y+1 ..= y+8`. Fails if any target cell is occupied.
    pub fn place_belt(&mut self, grid: &mut Grid, x: i32, y: i32, direction: i8) -> bool {
        let x0 = snap_to_grid(x);
        let tile_y = y + 1;
        for by in tile_y..tile_y + BELT_BLOCK_SIZE {
            for bx in x0..x0 + BELT_BLOCK_SIZE {
                if !grid.in_bounds(bx, by) || !grid.get(bx, by).is_air() {
                    return false;
                }
            }
        }

        let mat = self.material_for(direction);
        let mut merge_left = None;
        let mut merge_right = None;
        for slot in self.structures.iter() {
            if let Some(s) = slot {
                if s.tile_y == tile_y && s.direction == direction {
                    if s.max_x + 1 == x0 {
                        merge_left = Some(s.id);
                    } else if s.min_x - BELT_BLOCK_SIZE == x0 {
                        merge_right = Some(s.id);
                    }
                }
            }
        }

        let id = match (merge_left, merge_right) {
            (Some(left), Some(right)) => {
                let right_struct = self.structures[right as usize].take().unwrap();
                let left_struct = self.structures[left as usize].as_mut().unwrap();
                left_struct.max_x = right_struct.max_x;
                self.free_ids.push(right);
                self.retag_tiles(right_struct.min_x, right_struct.max_x, tile_y, left);
                left
            }
            (Some(left), None) => {
                self.structures[left as usize].as_mut().unwrap().max_x = x0 + BELT_BLOCK_SIZE - 1;
                left
            }
            (None, Some(right)) => {
                self.structures[right as usize].as_mut().unwrap().min_x = x0;
                right
            }
            (None, None) => {
                let id = self.alloc_id();
                *self.structure_mut(id) = Some(BeltStructure {
                    id,
                    tile_y,
                    min_x: x0,
                    max_x: x0 + BELT_BLOCK_SIZE - 1,
                    direction,
                    speed: self.default_speed,
                    frame_offset: 0,
                });
                id
            }
        };

        for by in tile_y..tile_y + BELT_BLOCK_SIZE {
            for bx in x0..x0 + BELT_BLOCK_SIZE {
                grid.set_cell(bx, by, mat);
                self.tiles.insert((bx, by), BeltTile { direction, belt_id: id });
            }
        }
        true
    }

    fn retag_tiles(&mut self, min_x: i32, max_x: i32, tile_y: i32, id: u16) {
        for by in tile_y..tile_y + BELT_BLOCK_SIZE {
            for bx in min_x..=max_x {
                if let Some(tile) = self.tiles.get_mut(&(bx, by)) {
                    tile.belt_id = id;
                }
            }
        }
    }

    /// Removes the whole 8x8 block containing `(x, y)` where `y` is a
    /// surface row. Splits, shrinks, or frees the owning structure.
    pub fn remove_belt(&mut self, grid: &mut Grid, x: i32, y: i32) -> bool {
        let x0 = snap_to_grid(x);
        let tile_y = y + 1;
        let Some(&BeltTile { belt_id, .. }) = self.tiles.get(&(x0, tile_y)) else {
            return false;
        };
        let Some(structure) = self.structures[belt_id as usize] else {
            return false;
        };

        for by in tile_y..tile_y + BELT_BLOCK_SIZE {
            for bx in x0..x0 + BELT_BLOCK_SIZE {
                grid.set_cell(bx, by, 0);
                self.tiles.remove(&(bx, by));
            }
        }

        let is_only_block = structure.min_x == structure.max_x - (BELT_BLOCK_SIZE - 1) && structure.min_x == x0;
        if is_only_block {
            self.structures[belt_id as usize] = None;
            self.free_ids.push(belt_id);
        } else if x0 == structure.min_x {
            self.structures[belt_id as usize].as_mut().unwrap().min_x = x0 + BELT_BLOCK_SIZE;
        } else if x0 + BELT_BLOCK_SIZE - 1 == structure.max_x {
            self.structures[belt_id as usize].as_mut().unwrap().max_x = x0 - 1;
        } else {
            // interior removal: split into left and right fragments.
            let left_id = self.alloc_id();
            let right_id = self.alloc_id();
            let left = BeltStructure {
                id: left_id,
                tile_y: structure.tile_y,
                min_x: structure.min_x,
                max_x: x0 - 1,
                direction: structure.direction,
                speed: structure.speed,
                frame_offset: structure.frame_offset,
            };
            let right = BeltStructure {
                id: right_id,
                tile_y: structure.tile_y,
                min_x: x0 + BELT_BLOCK_SIZE,
                max_x: structure.max_x,
                direction: structure.direction,
                speed: structure.speed,
                frame_offset: structure.frame_offset,
            };
            self.retag_tiles(left.min_x, left.max_x, tile_y, left_id);
            self.retag_tiles(right.min_x, right.max_x, tile_y, right_id);
            self.structures[belt_id as usize] = None;
            self.free_ids.push(belt_id);
            self.structures[left_id as usize] = Some(left);
            self.structures[right_id as usize] = Some(right);
        }
        true
    }

    pub fn structures(&self) -> impl Iterator<Item = &BeltStructure> {
        self.structures.iter().filter_map(|s| s.as_ref())
    }

    /// Parallel per-structure column shift; `edge_threshold` is forwarded to
    /// `mark_dirty_with_neighbors` so motion across chunk edges wakes the
    /// cell kernel next frame.
    ///
    /// Every task shares one `&Grid`: placement only ever succeeds into
    /// fully-Air target cells, so two live structures can never claim
    /// overlapping `(x, y)` cells — either their x-ranges are disjoint, or
    /// their `tile_y` differ and so do the row ranges they touch. `Grid`'s
    /// cell storage is interior-mutable precisely so this disjointness
    /// argument is enough to make concurrent writers through a shared
    /// reference sound (see `grid`'s module docs).
    pub fn simulate(&self, grid: &Grid, current_frame: u64, edge_threshold: u16) {
        let active: Vec<&BeltStructure> = self
            .structures()
            .filter(|s| {
                let elapsed = current_frame.wrapping_sub(s.frame_offset as u64);
                s.speed > 0 && elapsed % s.speed as u64 == 0
            })
            .collect();

        active.par_iter().for_each(|structure| {
            simulate_one_structure(grid, structure, edge_threshold);
        });
    }
}

fn simulate_one_structure(grid: &Grid, structure: &BeltStructure, edge_threshold: u16) {
    let surface = structure.surface_row();
    let xs: Vec<i32> = if structure.direction >= 0 {
        (structure.min_x..=structure.max_x).rev().collect()
    } else {
        (structure.min_x..=structure.max_x).collect()
    };

    for x in xs {
        let adjacent_x = x + structure.direction as i32;
        let mut y = surface;
        loop {
            let cell = grid.get(x, y);
            if cell.is_air() {
                break;
            }
            if cell.owner_id != 0 {
                y -= 1;
                continue;
            }
            let target = grid.get(adjacent_x, y);
            if target.is_air() {
                let moving = cell;
                grid.set_raw(adjacent_x, y, moving);
                grid.set_raw(x, y, crate::cell::Cell::air());
                grid.mark_dirty_with_neighbors(x, y, edge_threshold);
                grid.mark_dirty_with_neighbors(adjacent_x, y, edge_threshold);
            }
            y -= 1;
            if surface - y > 255 {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorldConfig;

    #[test]
    fn place_then_remove_restores_air_and_frees_id() {
        let cfg = WorldConfig::default();
        let mut grid = Grid::new(64, 64, &cfg);
        let mut belts = BeltRegistry::new(10, 11, 3);
        assert!(belts.place_belt(&mut grid, 8, 20, 1));
        assert_eq!(belts.structures().count(), 1);
        for by in 21..=28 {
            for bx in 8..16 {
                assert_eq!(grid.get(bx, by).material_id, 10);
            }
        }
        assert!(belts.remove_belt(&mut grid, 8, 20));
        assert_eq!(belts.structures().count(), 0);
        for by in 21..=28 {
            for bx in 8..16 {
                assert!(grid.get(bx, by).is_air());
            }
        }
    }

    #[test]
    fn adjacent_blocks_merge_into_one_structure() {
        let cfg = WorldConfig::default();
        let mut grid = Grid::new(64, 64, &cfg);
        let mut belts = BeltRegistry::new(10, 11, 3);
        assert!(belts.place_belt(&mut grid, 0, 20, 1));
        assert!(belts.place_belt(&mut grid, 8, 20, 1));
        assert_eq!(belts.structures().count(), 1);
        let s = belts.structures().next().unwrap();
        assert_eq!((s.min_x, s.max_x), (0, 15));
    }

    #[test]
    fn placement_fails_on_occupied_cell() {
        let cfg = WorldConfig::default();
        let mut grid = Grid::new(64, 64, &cfg);
        grid.set_cell(9, 22, 1);
        let mut belts = BeltRegistry::new(10, 11, 3);
        assert!(!belts.place_belt(&mut grid, 8, 20, 1));
    }
}
