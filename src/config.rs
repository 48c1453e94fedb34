//! Tunable constants for a [`crate::World`], collected so embedding applications
//! can retune the simulation at construction time instead of recompiling.

/// Grid and kernel tunables. Defaults match the reference constants.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorldConfig {
    pub chunk_size: u16,
    pub edge_threshold: u16,
    pub max_velocity: i8,
    pub fractional_gravity: u8,
    pub lift_force: u8,
    /// Multiplier on `|gravity|` applied as an upward force to a cluster
    /// overlapping a lift zone (§4.6); kept slightly above 1.0 so the
    /// cluster rises slowly rather than instantly overcoming gravity.
    pub lift_force_multiplier: f32,
    pub belt_block_size: u16,
    pub belt_default_speed: u16,
    pub cell_to_world_scale: f32,
    pub min_crush_impulse: f32,
    pub opposing_dot: f32,
    pub crush_frame_threshold: u32,
    pub min_pixels_to_fracture: usize,
    pub low_velocity_sleep_frames: u32,
    pub fixed_step: f32,
    pub max_accumulator: f32,
    pub rng_seed: u64,
    /// Horizontal speed (cells/sec, cell-space units) a cluster is carried at
    /// while its footprint overlaps a belt surface row (§4.5 "Cluster force").
    pub belt_carry_speed: f32,
    /// Chunks processed per call to [`crate::World::process_dirty_chunks`]
    /// when no explicit budget is passed (§4.8 "opportunistically per frame
    /// budget").
    pub collider_chunks_per_frame: usize,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            chunk_size: 64,
            edge_threshold: 2,
            max_velocity: 16,
            fractional_gravity: 17,
            lift_force: 20,
            lift_force_multiplier: 1.2,
            belt_block_size: 8,
            belt_default_speed: 3,
            cell_to_world_scale: 2.0,
            min_crush_impulse: 5.0,
            opposing_dot: -0.5,
            crush_frame_threshold: 30,
            min_pixels_to_fracture: 3,
            low_velocity_sleep_frames: 30,
            fixed_step: 1.0 / 60.0,
            max_accumulator: 0.1,
            rng_seed: 0xC0FF_EE42_u64,
            belt_carry_speed: 3.0,
            collider_chunks_per_frame: 4,
        }
    }
}
