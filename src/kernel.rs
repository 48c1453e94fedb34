//! Cell Physics Kernel: evolves one chunk's dirty region end to end.
//!
//! Iteration is bottom-to-top with horizontal direction alternating by
//! `y & 1`, matching the scan-order discipline the teacher's
//! `simulation.rs::update()` already uses (`for y in (0..height).rev()`
//! with a per-frame shuffled column order) to avoid directional bias,
//! generalized here to a per-row alternation driven by a pure hash instead
//! of a mutable shuffled-index buffer, so it stays safe under checkerboard
//! parallelism.
//!
//! Every function here takes `&Grid`, not `&mut Grid`: mutation goes through
//! `Grid::set_raw`/`mark_dirty_with_neighbors`'s interior mutability, which
//! is what lets the checkerboard scheduler share one `&Grid` across a whole
//! parallel group instead of aliasing `&mut Grid` (see `grid`'s module
//! docs for the disjointness argument that makes this sound).

use crate::cell::Cell;
use crate::config::WorldConfig;
use crate::coords::{chunk_origin, ChunkKey};
use crate::grid::Grid;
use crate::hashrand;
use crate::lift::LiftRegistry;
use crate::material::{Behavior, MaterialTable};

fn can_move_to(grid: &Grid, materials: &MaterialTable, x: i32, y: i32, my_density: u8) -> bool {
    if !grid.in_bounds(x, y) {
        return false;
    }
    let target = grid.get(x, y);
    if target.is_air() {
        return true;
    }
    let target_def = materials.get(target.material_id);
    if target_def.behavior == Behavior::Static {
        return false;
    }
    my_density > target_def.density
}

fn swap_cells(grid: &Grid, ax: i32, ay: i32, bx: i32, by: i32, frame_stamp: u16) {
    let a = grid.get(ax, ay);
    let mut b = grid.get(bx, by);
    b.frame_updated = frame_stamp;
    grid.set_raw(bx, by, a);
    grid.set_raw(ax, ay, b);
}

fn zero_and_write_back(grid: &Grid, x: i32, y: i32, mut cell: Cell) {
    cell.zero_velocity();
    grid.set_raw(x, y, cell);
}

/// Process every dirty cell in one chunk. `current_frame` is the wrapping
/// 16-bit stamp; `frame_hash` is the same frame number widened for the
/// deterministic hash functions. The caller must have already ensured this
/// chunk's 8 neighbors exist (no insertion happens here).
pub fn process_chunk(
    grid: &Grid,
    materials: &MaterialTable,
    lifts: &LiftRegistry,
    key: ChunkKey,
    current_frame: u16,
    frame_hash: u32,
    cfg: &WorldConfig,
) {
    let chunk_size = cfg.chunk_size as i32;
    let (origin_x, origin_y) = chunk_origin(key, chunk_size);

    let (lx0, lx1, ly0, ly1) = match grid.get_chunk(key) {
        Some(chunk) if !chunk.state.bounds_are_inverted() => {
            let b = chunk.state.bounds();
            (b.min_x as i32, b.max_x as i32, b.min_y as i32, b.max_y as i32)
        }
        Some(_) => (0, chunk_size - 1, 0, chunk_size - 1),
        None => return,
    };

    for ly in (ly0..=ly1).rev() {
        let y = origin_y + ly;
        let reversed = hashrand::parity(origin_x, y, frame_hash as u32);
        if reversed {
            for lx in (lx0..=lx1).rev() {
                process_cell(grid, materials, lifts, origin_x + lx, y, current_frame, frame_hash, cfg);
            }
        } else {
            for lx in lx0..=lx1 {
                process_cell(grid, materials, lifts, origin_x + lx, y, current_frame, frame_hash, cfg);
            }
        }
    }
}

fn process_cell(
    grid: &Grid,
    materials: &MaterialTable,
    lifts: &LiftRegistry,
    x: i32,
    y: i32,
    current_frame: u16,
    frame_hash: u32,
    cfg: &WorldConfig,
) {
    let mut cell = grid.get(x, y);
    if cell.frame_updated == current_frame {
        return;
    }
    if cell.is_air() {
        return;
    }
    let def = materials.get(cell.material_id);
    if def.behavior == Behavior::Static {
        return;
    }
    cell.frame_updated = current_frame;

    let is_gas = def.behavior == Behavior::Gas;
    let lift_force = lifts.lift_force_at(x, y) as i16;
    let gravity: i16 = if is_gas {
        -(cfg.fractional_gravity as i16)
    } else {
        cfg.fractional_gravity as i16
    };
    let delta = gravity - lift_force;

    let mut frac = cell.velocity_frac_y as i16 + delta;
    let max_v = cfg.max_velocity;
    if frac >= 256 {
        frac -= 256;
        cell.velocity_y = (cell.velocity_y + 1).min(max_v);
    } else if frac < 0 {
        frac += 256;
        cell.velocity_y = (cell.velocity_y - 1).max(-max_v);
    }
    cell.velocity_frac_y = frac as u8;
    grid.set_raw(x, y, cell);

    let vel_y = cell.velocity_y as i32;
    let dir = vel_y.signum();
    let mut last_valid_y = y;
    if dir != 0 {
        for step in 1..=vel_y.unsigned_abs() as i32 {
            let cy = y + dir * step;
            if can_move_to(grid, materials, x, cy, def.density) {
                last_valid_y = cy;
            } else {
                break;
            }
        }
    }

    if last_valid_y != y {
        swap_cells(grid, x, y, x, last_valid_y, current_frame);
        grid.mark_dirty_with_neighbors(x, y, cfg.edge_threshold);
        grid.mark_dirty_with_neighbors(x, last_valid_y, cfg.edge_threshold);
        return;
    }

    match def.behavior {
        Behavior::Powder => {
            if def.slide_resistance > 0 && hashrand::chance_255(x, y, frame_hash, def.slide_resistance) {
                zero_and_write_back(grid, x, y, cell);
                return;
            }
            if !try_diagonal(grid, materials, x, y, 1, def.density, frame_hash, current_frame, cfg) {
                zero_and_write_back(grid, x, y, cell);
            }
        }
        Behavior::Liquid => {
            if try_diagonal(grid, materials, x, y, 1, def.density, frame_hash, current_frame, cfg) {
                return;
            }
            let spread = (max_v as i32 - vel_y.abs()).max(1) / (def.friction as i32 + 1);
            let spread = spread.max(1);
            if !try_spread(grid, materials, x, y, spread, def.density, frame_hash, current_frame, cfg) {
                zero_and_write_back(grid, x, y, cell);
            }
        }
        Behavior::Gas => {
            if try_diagonal(grid, materials, x, y, -1, def.density, frame_hash, current_frame, cfg) {
                return;
            }
            if !try_spread(grid, materials, x, y, 4, def.density, frame_hash, current_frame, cfg) {
                zero_and_write_back(grid, x, y, cell);
            }
        }
        Behavior::Static => unreachable!(),
    }
}

fn try_diagonal(
    grid: &Grid,
    materials: &MaterialTable,
    x: i32,
    y: i32,
    vertical_dir: i32,
    density: u8,
    frame_hash: u32,
    current_frame: u16,
    cfg: &WorldConfig,
) -> bool {
    let order: [i32; 2] = if hashrand::parity(x, y, frame_hash) { [1, -1] } else { [-1, 1] };
    for dx in order {
        let tx = x + dx;
        let ty = y + vertical_dir;
        if can_move_to(grid, materials, tx, ty, density) {
            swap_cells(grid, x, y, tx, ty, current_frame);
            grid.mark_dirty_with_neighbors(x, y, cfg.edge_threshold);
            grid.mark_dirty_with_neighbors(tx, ty, cfg.edge_threshold);
            return true;
        }
    }
    false
}

/// Scan both horizontal directions up to `radius` cells, in a randomized
/// order, moving into the farthest reachable cell along whichever direction
/// yields one. Used for liquid spread and gas dispersion alike (§9.1: gas
/// dispersion mirrors the two-direction liquid pattern rather than the
/// one-sided probe an earlier iteration used).
fn try_spread(
    grid: &Grid,
    materials: &MaterialTable,
    x: i32,
    y: i32,
    radius: i32,
    density: u8,
    frame_hash: u32,
    current_frame: u16,
    cfg: &WorldConfig,
) -> bool {
    let order: [i32; 2] = if hashrand::parity(x, y, frame_hash) { [1, -1] } else { [-1, 1] };
    for dx_sign in order {
        let mut best = None;
        for step in 1..=radius {
            let tx = x + dx_sign * step;
            if can_move_to(grid, materials, tx, y, density) {
                best = Some(tx);
            } else {
                break;
            }
        }
        if let Some(tx) = best {
            swap_cells(grid, x, y, tx, y, current_frame);
            grid.mark_dirty_with_neighbors(x, y, cfg.edge_threshold);
            grid.mark_dirty_with_neighbors(tx, y, cfg.edge_threshold);
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::material::MaterialTable;

    fn setup() -> (Grid, MaterialTable, LiftRegistry, WorldConfig) {
        let cfg = WorldConfig::default();
        let grid = Grid::new(16, 16, &cfg);
        let materials = MaterialTable::default_set();
        let lifts = LiftRegistry::default();
        (grid, materials, lifts, cfg)
    }

    #[test]
    fn sand_grain_on_floor_never_moves() {
        let (mut grid, materials, lifts, cfg) = setup();
        for x in 0..16 {
            grid.set_cell(x, 15, 3); // stone floor
        }
        grid.set_cell(8, 14, 1); // sand
        for frame in 1..30u16 {
            let mut groups: [Vec<ChunkKey>; 4] = Default::default();
            grid.collect_chunk_groups(&mut groups);
            grid.ensure_groups_neighbors_exist(&groups);
            for group in &groups {
                for &key in group {
                    process_chunk(&grid, &materials, &lifts, key, frame, frame as u32, &cfg);
                }
            }
            grid.reset_dirty_state();
        }
        assert_eq!(grid.get(8, 14).material_id, 1);
    }

    #[test]
    fn sand_grain_falls_through_air() {
        let (mut grid, materials, lifts, cfg) = setup();
        for x in 0..16 {
            grid.set_cell(x, 15, 3);
        }
        grid.set_cell(8, 0, 1);
        for frame in 1..30u16 {
            let mut groups: [Vec<ChunkKey>; 4] = Default::default();
            grid.collect_chunk_groups(&mut groups);
            grid.ensure_groups_neighbors_exist(&groups);
            for group in &groups {
                for &key in group {
                    process_chunk(&grid, &materials, &lifts, key, frame, frame as u32, &cfg);
                }
            }
            grid.reset_dirty_state();
        }
        assert_eq!(grid.get(8, 14).material_id, 1);
    }
}
