//! Single source of truth for cell<->world and cell<->chunk coordinate math.
//!
//! Cell grid origin is top-left with Y increasing downward. World coordinates
//! are centered on the grid with Y increasing upward. No other module should
//! duplicate these conversions inline.

use crate::config::WorldConfig;

pub type ChunkKey = (i32, i32);

/// World-space position in float units (not cell indices).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorldPos {
    pub x: f32,
    pub y: f32,
}

/// Convert a chunk-local coordinate into its owning chunk key and local offset.
/// Uses `div_euclid`/`rem_euclid` so negative cell coordinates still resolve
/// to a well-defined chunk and a non-negative local offset.
pub fn cell_to_chunk(x: i32, y: i32, chunk_size: i32) -> (ChunkKey, (u16, u16)) {
    let cx = x.div_euclid(chunk_size);
    let cy = y.div_euclid(chunk_size);
    let lx = x.rem_euclid(chunk_size) as u16;
    let ly = y.rem_euclid(chunk_size) as u16;
    ((cx, cy), (lx, ly))
}

pub fn chunk_origin(key: ChunkKey, chunk_size: i32) -> (i32, i32) {
    (key.0 * chunk_size, key.1 * chunk_size)
}

/// Map a cell coordinate to the world-space position of its center, per
/// `WorldConfig::cell_to_world_scale`. Grid is centered: cell (0,0) is the
/// top-left corner of the grid in cell space, which maps to the top-left
/// corner of the world-space rectangle; Y is flipped going from cell space
/// (down-positive) to world space (up-positive).
pub fn cell_to_world(x: i32, y: i32, grid_width: u32, grid_height: u32, cfg: &WorldConfig) -> WorldPos {
    let scale = cfg.cell_to_world_scale;
    let half_w = grid_width as f32 * scale * 0.5;
    let half_h = grid_height as f32 * scale * 0.5;
    WorldPos {
        x: x as f32 * scale - half_w,
        y: half_h - y as f32 * scale,
    }
}

/// Inverse of [`cell_to_world`]: map a world-space position back to the cell
/// that contains it (rounded to nearest).
pub fn world_to_cell(pos: WorldPos, grid_width: u32, grid_height: u32, cfg: &WorldConfig) -> (i32, i32) {
    let scale = cfg.cell_to_world_scale;
    let half_w = grid_width as f32 * scale * 0.5;
    let half_h = grid_height as f32 * scale * 0.5;
    let x = ((pos.x + half_w) / scale).round() as i32;
    let y = ((half_h - pos.y) / scale).round() as i32;
    (x, y)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_conversion_handles_negative_coordinates() {
        let (key, local) = cell_to_chunk(-1, -1, 64);
        assert_eq!(key, (-1, -1));
        assert_eq!(local, (63, 63));

        let (key, local) = cell_to_chunk(64, 0, 64);
        assert_eq!(key, (1, 0));
        assert_eq!(local, (0, 0));
    }

    #[test]
    fn world_round_trip_is_stable_at_grid_center() {
        let cfg = WorldConfig::default();
        let p = cell_to_world(16, 16, 32, 32, &cfg);
        let (x, y) = world_to_cell(p, 32, 32, &cfg);
        assert_eq!((x, y), (16, 16));
    }
}
