//! Frame Pipeline: the `World` value that owns every registry and sequences
//! a frame end to end, per §4.9. Generalizes the teacher's
//! `engine.rs::PhysicsEngine::update()` (wall-clock accumulation clamped to
//! a minimum frame time, advancing one `Simulation` per call) and
//! `engine_v2.rs::AdvancedPhysicsEngine::update_with_delta()` (ordered stage
//! sequence: rigid-body step and sync, then chunk activity update, then
//! per-chunk particle physics) into the fixed-step-accumulator-plus-
//! frame-count pipeline this spec calls for: cluster substeps decoupled
//! from display rate via the accumulator, cell physics and belts still
//! driven by the integer frame counter.
//!
//! Per §9 "Global state ... belongs to the `World` value; no process-wide
//! singletons", every piece of mutable simulation state (grid, registries,
//! frame counter, accumulator, rng seed, instrumentation) is a field here;
//! tests construct a fresh `World` per scenario.

use crate::belt::BeltRegistry;
use crate::cluster::{ClusterPixel, ClusterRegistry};
use crate::collider::{self, Vec2};
use crate::config::WorldConfig;
use crate::coords::{self, chunk_origin, ChunkKey};
use crate::error::WorldError;
use crate::grid::Grid;
use crate::material::{MaterialDef, MaterialTable};
use crate::lift::LiftRegistry;
use crate::scheduler;
use crate::timings::FrameTimings;

use ahash::AHashSet;
use nalgebra::Vector2;

/// What the Terrain Collider Extractor calls out to when it regenerates a
/// chunk's polygons (§6 "Collider consumer interface"). The core never
/// assumes a particular rendering or physics-debug backend; a host
/// implements this trait over whatever it uses to display or collide
/// against terrain outlines.
pub trait ColliderSink {
    fn replace_polygons(&mut self, chunk_index: ChunkKey, outlines: Vec<Vec<Vec2>>);
    fn remove_polygons(&mut self, chunk_index: ChunkKey);
}

/// A `ColliderSink` that does nothing; useful for callers driving
/// `simulate_frame`/`process_dirty_chunks` without a terrain renderer
/// attached (tests, headless batch runs).
#[derive(Debug, Default)]
pub struct NullColliderSink;

impl ColliderSink for NullColliderSink {
    fn replace_polygons(&mut self, _chunk_index: ChunkKey, _outlines: Vec<Vec<Vec2>>) {}
    fn remove_polygons(&mut self, _chunk_index: ChunkKey) {}
}

/// Per-frame counters for conditions §7 classifies as silent/recoverable
/// rather than exceptional, so a host can surface them without the core
/// ever raising.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameStats {
    /// Loose cells a cluster write displaced beyond the BFS radius and
    /// dropped (§7 "Displacement failure").
    pub cells_lost_to_displacement: u32,
    /// Times `create_cluster` returned the sentinel id because the id pool
    /// was exhausted (§7 "Cluster limit exhausted"); logged once per
    /// occurrence at `warn` by the cluster registry, counted here as well
    /// so a host can alert without scraping logs.
    pub cluster_creation_failures: u32,
}

pub struct World {
    pub grid: Grid,
    pub materials: MaterialTable,
    pub belts: BeltRegistry,
    pub lifts: LiftRegistry,
    pub clusters: ClusterRegistry,
    pub config: WorldConfig,
    current_frame: u64,
    physics_accumulator: f32,
    last_timings: FrameTimings,
    stats: FrameStats,
    /// Chunks touched by an external edit since they were last handed to a
    /// `ColliderSink`, consumed on demand by `process_dirty_chunks` (§4.8:
    /// "driven by the accumulated dirty-chunk set", "opportunistically per
    /// frame budget... an external scheduling knob, not a correctness
    /// property"). Transient per-frame `ChunkState::is_dirty` is reset every
    /// frame regardless of whether a collider consumer ever looked at it,
    /// so this set is tracked independently with its own lifetime.
    collider_dirty: AHashSet<ChunkKey>,
}

impl World {
    /// Allocates the cell buffer's backing registries and installs the
    /// caller-supplied material table (§3 "Table construction note": built
    /// once here from a `&[MaterialDef]` slice, not a hardcoded match over a
    /// closed enum). Fails only on construction-time configuration errors;
    /// every other documented operation uses the `bool`/`Option`/sentinel
    /// conventions of §7 instead.
    pub fn new(width: u32, height: u32, materials: &[MaterialDef], config: WorldConfig) -> Result<Self, WorldError> {
        if config.chunk_size != crate::chunk::CHUNK_SIZE {
            // `Chunk`'s cell storage is a fixed-size `[Cell; CHUNK_AREA]`
            // array sized from the compiled-in `CHUNK_SIZE` constant, while
            // `Grid`/`cell_to_chunk` key and index chunks using
            // `config.chunk_size`. Accepting a mismatched value here would
            // let local offsets exceed the array's bounds (or silently waste
            // space), so a caller that wants a different chunk size must
            // change the `CHUNK_SIZE` constant and recompile rather than
            // retune it through `WorldConfig`.
            return Err(WorldError::InvalidChunkSize { given: config.chunk_size, expected: crate::chunk::CHUNK_SIZE });
        }
        if config.belt_block_size as i32 != crate::belt::BELT_BLOCK_SIZE {
            // `BeltRegistry`'s placement/merge/split arithmetic (snap-to-grid
            // bit masking, fixed-width block iteration) is written against
            // the compiled-in `BELT_BLOCK_SIZE` constant, not this field;
            // same rationale as `chunk_size` above.
            return Err(WorldError::InvalidBeltBlockSize { given: config.belt_block_size, expected: crate::belt::BELT_BLOCK_SIZE as u16 });
        }
        if width == 0 || height == 0 || width % config.chunk_size as u32 != 0 || height % config.chunk_size as u32 != 0 {
            return Err(WorldError::InvalidDimensions { width, height });
        }
        if materials.is_empty() {
            return Err(WorldError::MaterialTableEmpty);
        }

        let grid = Grid::new(width, height, &config);
        let material_table = MaterialTable::new(materials.to_vec());
        let belts = BeltRegistry::new(
            MaterialTable::DEFAULT_BELT_MATERIAL_POS,
            MaterialTable::DEFAULT_BELT_MATERIAL_NEG,
            config.belt_default_speed as u32,
        );
        let lifts = LiftRegistry::new(config.lift_force);
        let clusters = ClusterRegistry::new(&config);

        tracing::debug!(width, height, "world constructed");

        Ok(World {
            grid,
            materials: material_table,
            belts,
            lifts,
            clusters,
            config,
            current_frame: 0,
            physics_accumulator: 0.0,
            last_timings: FrameTimings::default(),
            stats: FrameStats::default(),
            collider_dirty: AHashSet::default(),
        })
    }

    /// Convenience constructor wiring [`MaterialTable::default_set`] and
    /// [`WorldConfig::default`].
    pub fn new_default(width: u32, height: u32) -> Result<Self, WorldError> {
        let materials = MaterialTable::default_set();
        let defs: Vec<MaterialDef> = (0..materials.len() as u8).map(|i| materials.get(i)).collect();
        Self::new(width, height, &defs, WorldConfig::default())
    }

    /// Explicit teardown hook matching §6's `dispose(world)` entry in the
    /// external-interfaces table, for hosts (e.g. a native-interop binding)
    /// that model lifetime explicitly rather than relying on `Drop`. Plain
    /// Rust ownership already releases everything on drop; this exists so
    /// those call sites have something to call.
    pub fn dispose(self) {
        drop(self);
    }

    pub fn current_frame(&self) -> u64 {
        self.current_frame
    }

    pub fn last_frame_timings(&self) -> FrameTimings {
        self.last_timings
    }

    pub fn frame_stats(&self) -> FrameStats {
        self.stats
    }

    // ---- Cell edits (§6, between frames) ----

    pub fn get_cell(&self, x: i32, y: i32) -> u8 {
        self.grid.get_cell_material(x, y)
    }

    pub fn in_bounds(&self, x: i32, y: i32) -> bool {
        self.grid.in_bounds(x, y)
    }

    pub fn set_cell(&mut self, x: i32, y: i32, material_id: u8) {
        self.grid.set_cell(x, y, material_id);
        self.mark_collider_dirty_at(x, y);
    }

    /// Used by external level authoring when bulk writes should trigger
    /// collider regeneration without going through `set_cell` itself (e.g. a
    /// caller that already wrote cells via its own batch path).
    pub fn mark_chunk_dirty_at(&mut self, x: i32, y: i32) {
        self.grid.mark_dirty(x, y);
        self.mark_collider_dirty_at(x, y);
    }

    fn mark_collider_dirty_at(&mut self, x: i32, y: i32) {
        if !self.grid.in_bounds(x, y) {
            return;
        }
        let (key, _) = coords::cell_to_chunk(x, y, self.config.chunk_size as i32);
        self.collider_dirty.insert(key);
    }

    // ---- Belt/lift placement (§6, between frames) ----

    pub fn place_belt(&mut self, x: i32, y: i32, direction: i8) -> bool {
        let placed = self.belts.place_belt(&mut self.grid, x, y, direction);
        if placed {
            self.mark_block_collider_dirty(x, y);
        }
        placed
    }

    pub fn remove_belt(&mut self, x: i32, y: i32) -> bool {
        let removed = self.belts.remove_belt(&mut self.grid, x, y);
        if removed {
            self.mark_block_collider_dirty(x, y);
        }
        removed
    }

    pub fn snap_to_grid(n: i32) -> i32 {
        crate::belt::snap_to_grid(n)
    }

    pub fn place_lift(&mut self, x: i32, y: i32) -> bool {
        self.lifts.place_lift(x, y)
    }

    pub fn remove_lift(&mut self, x: i32, y: i32) -> bool {
        self.lifts.remove_lift(x, y)
    }

    fn mark_block_collider_dirty(&mut self, x: i32, y: i32) {
        let cs = self.config.chunk_size as i32;
        for dy in -1..=1 {
            for dx in -1..=1 {
                let (key, _) = coords::cell_to_chunk(x + dx * cs, y + dy * cs, cs);
                self.collider_dirty.insert(key);
            }
        }
    }

    // ---- Cluster lifecycle (§6, between frames) ----

    pub fn create_cluster(&mut self, pixels: Vec<(i16, i16, u8)>, world_position: (f32, f32)) -> u16 {
        let pixels: Vec<ClusterPixel> = pixels
            .into_iter()
            .map(|(local_x, local_y, material_id)| ClusterPixel { local_x, local_y, material_id })
            .collect();
        let id = self.clusters.create_cluster(pixels, Vector2::new(world_position.0, world_position.1));
        if id == 0 {
            self.stats.cluster_creation_failures += 1;
        }
        id
    }

    pub fn destroy_cluster(&mut self, id: u16) {
        self.clusters.destroy_cluster(&mut self.grid, id);
    }

    /// External trigger (§6, test hook); the internal trigger is the
    /// sustained-compression detector inside `step_and_sync`.
    pub fn fracture_cluster(&mut self, id: u16) {
        let seed = self.frame_seed();
        self.clusters.fracture_cluster(&mut self.grid, id, &self.config, seed);
    }

    fn frame_seed(&self) -> u64 {
        self.config.rng_seed ^ self.current_frame
    }

    // ---- Pipeline step (§6, §4.9) ----

    /// Runs the full per-frame pipeline: cluster substeps at a fixed
    /// timestep derived from `wall_dt` (clamped per §5 to avoid a spiral of
    /// death), then the checkerboard cell pass, then the belt pass, then a
    /// single dirty-state reset shared by both passes.
    pub fn simulate_frame(&mut self, wall_dt: f32) {
        let span = tracing::debug_span!("simulate_frame", frame = self.current_frame);
        let _enter = span.enter();

        // Steps 1-2 (belt/lift force write to clusters) happen inside each
        // cluster substep rather than once per call: see
        // `ClusterRegistry::step_and_sync`'s doc comment for why reapplying
        // every substep is the more correct reading of "decouples cluster
        // speed from display rate" when more than one substep runs in a
        // single `simulate_frame` call.
        self.physics_accumulator = (self.physics_accumulator + wall_dt).min(self.config.max_accumulator);
        let cluster_started = std::time::Instant::now();
        while self.physics_accumulator >= self.config.fixed_step {
            let frame_seed = self.frame_seed();
            let lost = self
                .clusters
                .step_and_sync(&mut self.grid, &self.materials, &self.lifts, &self.belts, self.config.fixed_step, &self.config, frame_seed);
            self.stats.cells_lost_to_displacement += lost;
            self.physics_accumulator -= self.config.fixed_step;
        }
        self.last_timings.cluster_physics_ms = cluster_started.elapsed().as_secs_f32() * 1000.0;
        self.last_timings.cluster_sync_ms = self.last_timings.cluster_physics_ms;

        self.current_frame += 1;

        scheduler::run_checkerboard_pass(&mut self.grid, &self.materials, &self.lifts, self.current_frame, &self.config, &mut self.last_timings);

        let belt_started = std::time::Instant::now();
        self.belts.simulate(&self.grid, self.current_frame, self.config.edge_threshold);
        self.last_timings.belt_sim_ms = belt_started.elapsed().as_secs_f32() * 1000.0;

        self.grid.reset_dirty_state();

        tracing::trace!(
            cell_sim_ms = self.last_timings.total_cell_sim_ms(),
            belt_sim_ms = self.last_timings.belt_sim_ms,
            "frame complete"
        );
    }

    // ---- Collider consumer interface (§6, §4.8) ----

    /// Regenerates colliders for up to `budget` chunks from the accumulated
    /// dirty set (or `config.collider_chunks_per_frame` if `budget` is
    /// `None`), calling `sink.replace_polygons`/`sink.remove_polygons` for
    /// each. Returns the number of chunks processed.
    pub fn process_dirty_chunks(&mut self, sink: &mut dyn ColliderSink, budget: Option<usize>) -> usize {
        let started = std::time::Instant::now();
        let limit = budget.unwrap_or(self.config.collider_chunks_per_frame);
        let keys: Vec<ChunkKey> = self.collider_dirty.iter().copied().take(limit).collect();
        for key in &keys {
            self.collider_dirty.remove(key);
            let outlines = collider::extract_chunk_colliders(&self.grid, &self.materials, *key);
            self.clusters.sync_terrain_chunk(*key, chunk_origin(*key, self.config.chunk_size as i32), &outlines);
            if outlines.is_empty() {
                sink.remove_polygons(*key);
            } else {
                let world_outlines: Vec<Vec<Vec2>> = outlines
                    .into_iter()
                    .map(|outline| self.outline_to_world(*key, &outline))
                    .collect();
                sink.replace_polygons(*key, world_outlines);
            }
        }
        self.last_timings.terrain_colliders_ms = started.elapsed().as_secs_f32() * 1000.0;
        keys.len()
    }

    fn outline_to_world(&self, key: ChunkKey, outline: &[(i32, i32)]) -> Vec<Vec2> {
        let (origin_x, origin_y) = chunk_origin(key, self.config.chunk_size as i32);
        outline
            .iter()
            .map(|&(lx, ly)| {
                let (x, y) = self.cell_to_world_pos(origin_x + lx, origin_y + ly);
                Vec2 { x, y }
            })
            .collect()
    }

    /// Maps a cell coordinate to its world-space position, the same
    /// conversion `process_dirty_chunks` applies to terrain outlines before
    /// handing them to a `ColliderSink` (§3's single cell<->world
    /// conversion point).
    pub fn cell_to_world_pos(&self, x: i32, y: i32) -> (f32, f32) {
        let pos = coords::cell_to_world(x, y, self.grid.width, self.grid.height, &self.config);
        (pos.x, pos.y)
    }

    /// Inverse of [`World::cell_to_world_pos`]: maps a world-space position
    /// back to the cell that contains it, for a host that only has a
    /// world-space coordinate on hand (e.g. a pointer position) and needs a
    /// cell index for `set_cell`/`create_cluster`-style edits.
    pub fn world_pos_to_cell(&self, x: f32, y: f32) -> (i32, i32) {
        coords::world_to_cell(coords::WorldPos { x, y }, self.grid.width, self.grid.height, &self.config)
    }

    pub fn count_active_cells(&self) -> usize {
        self.grid.count_active_cells()
    }

    pub fn count_active_chunks(&self) -> usize {
        self.grid.count_active_chunks()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_world(w: u32, h: u32) -> World {
        World::new_default(w, h).unwrap()
    }

    #[test]
    fn construction_rejects_unaligned_dimensions() {
        let err = World::new_default(100, 64).unwrap_err();
        assert!(matches!(err, WorldError::InvalidDimensions { .. }));
    }

    #[test]
    fn construction_rejects_mismatched_chunk_size() {
        let mut config = WorldConfig::default();
        config.chunk_size = 32;
        let materials = MaterialTable::default_set();
        let defs: Vec<MaterialDef> = (0..materials.len() as u8).map(|i| materials.get(i)).collect();
        let err = World::new(64, 64, &defs, config).unwrap_err();
        assert!(matches!(err, WorldError::InvalidChunkSize { .. }));
    }

    #[test]
    fn construction_rejects_mismatched_belt_block_size() {
        let mut config = WorldConfig::default();
        config.belt_block_size = 16;
        let materials = MaterialTable::default_set();
        let defs: Vec<MaterialDef> = (0..materials.len() as u8).map(|i| materials.get(i)).collect();
        let err = World::new(64, 64, &defs, config).unwrap_err();
        assert!(matches!(err, WorldError::InvalidBeltBlockSize { .. }));
    }

    #[test]
    fn construction_rejects_empty_material_table() {
        let err = World::new(64, 64, &[], WorldConfig::default()).unwrap_err();
        assert!(matches!(err, WorldError::MaterialTableEmpty));
    }

    #[test]
    fn set_cell_then_get_cell_round_trips() {
        let mut world = default_world(64, 64);
        world.set_cell(10, 10, 1);
        assert_eq!(world.get_cell(10, 10), 1);
        assert_eq!(world.get_cell(-1, -1), 0);
    }

    #[test]
    fn simulate_frame_on_static_only_world_is_a_noop_besides_frame_count() {
        let mut world = default_world(64, 64);
        for x in 0..64 {
            world.set_cell(x, 63, 3); // stone floor
        }
        world.process_dirty_chunks(&mut NullColliderSink, None);
        let before_active = world.count_active_cells();
        world.simulate_frame(1.0 / 60.0);
        assert_eq!(world.current_frame(), 1);
        assert_eq!(world.count_active_cells(), before_active);
    }

    #[test]
    fn belt_round_trip_restores_air_and_frees_structure() {
        let mut world = default_world(64, 64);
        assert!(world.place_belt(8, 20, 1));
        assert!(world.remove_belt(8, 20));
        for by in 21..=28 {
            for bx in 8..16 {
                assert!(world.get_cell(bx, by) == 0);
            }
        }
    }

    #[test]
    fn dirty_chunks_drive_collider_regeneration() {
        struct CountingSink {
            replaced: usize,
        }
        impl ColliderSink for CountingSink {
            fn replace_polygons(&mut self, _chunk_index: ChunkKey, outlines: Vec<Vec<Vec2>>) {
                if !outlines.is_empty() {
                    self.replaced += 1;
                }
            }
            fn remove_polygons(&mut self, _chunk_index: ChunkKey) {}
        }

        let mut world = default_world(128, 128);
        for y in 0..10u16 {
            for x in 0..10u16 {
                world.set_cell(x as i32, y as i32, 3);
            }
        }
        let mut sink = CountingSink { replaced: 0 };
        let processed = world.process_dirty_chunks(&mut sink, None);
        assert_eq!(processed, 1);
        assert_eq!(sink.replaced, 1);

        // Re-running with no further changes finds nothing left dirty.
        let processed_again = world.process_dirty_chunks(&mut sink, None);
        assert_eq!(processed_again, 0);
    }

    #[test]
    fn dirty_chunks_install_static_terrain_bodies() {
        let mut world = default_world(64, 64);
        for x in 0..64 {
            world.set_cell(x, 63, 3); // stone floor
        }
        world.process_dirty_chunks(&mut NullColliderSink, None);
        assert_eq!(world.clusters.static_terrain_chunk_count(), 1);

        // Clearing the floor regenerates the chunk with no outlines, which
        // must tear the static body down rather than leave it dangling.
        for x in 0..64 {
            world.set_cell(x, 63, 0);
        }
        world.process_dirty_chunks(&mut NullColliderSink, None);
        assert_eq!(world.clusters.static_terrain_chunk_count(), 0);
    }

    #[test]
    fn world_to_cell_is_the_inverse_of_cell_to_world_pos() {
        let world = default_world(32, 32);
        let (wx, wy) = world.cell_to_world_pos(16, 16);
        assert_eq!(world.world_pos_to_cell(wx, wy), (16, 16));
    }

    #[test]
    fn sand_grain_dropped_on_floor_settles_within_budget() {
        let mut world = default_world(16, 16);
        for x in 0..16 {
            world.set_cell(x, 15, 3);
        }
        world.set_cell(8, 0, 1);
        for _ in 0..30 {
            world.simulate_frame(1.0 / 60.0);
        }
        assert_eq!(world.get_cell(8, 14), 1);
    }

    #[test]
    fn cluster_create_destroy_round_trips() {
        let mut world = default_world(64, 64);
        let pixels: Vec<(i16, i16, u8)> = (0..6).flat_map(|y| (0..6).map(move |x| (x - 3, y - 3, 3u8))).collect();
        let id = world.create_cluster(pixels, (32.0, 32.0));
        assert_ne!(id, 0);
        world.destroy_cluster(id);
    }
}
