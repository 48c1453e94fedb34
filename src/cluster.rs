//! Cluster Registry & Sync: rigid polygonal bodies whose surface pixels are
//! continuously cleared from and written into the cell grid.
//!
//! Built directly on the teacher's `rigidbody.rs::RigidBodyManager` rapier2d
//! pipeline (`RigidBodySet`, `ColliderSet`, `IntegrationParameters`,
//! `PhysicsPipeline`, `IslandManager`, `BroadPhase`, `NarrowPhase`,
//! `ImpulseJointSet`, `MultibodyJointSet`, `CCDSolver`) — `rapier2d` and
//! `nalgebra` stay in the dependency table for exactly this reason. Three
//! things change from the teacher's version, in order of how much of the
//! teacher's code survives:
//! (a) collider construction uses the same marching-squares-plus-RDP outline
//!     the Terrain Collider Extractor builds (`collider.rs`) instead of the
//!     teacher's convex-hull-or-cuboid `create_collider_from_pixels`, since
//!     neither a hull nor a bounding box is pixel-accurate enough for the
//!     inverse-mapping contract below to hold at a cluster's silhouette;
//! (b) the teacher's `update_rigid_body_positions` /
//!     `update_particle_positions_from_rigid_body` forward-mapping sync is
//!     replaced end to end by inverse mapping (the one piece of teacher
//!     logic this module supersedes rather than generalizes);
//! (c) contact gathering for the compression check reads rapier2d's
//!     `NarrowPhase` contact manifolds directly, which the teacher's version
//!     never does (it only ever checks linear/angular velocity magnitude).

use ahash::AHashMap;
use nalgebra::{Point2, UnitComplex, Vector2};
use rapier2d::prelude::*;

use crate::belt::BeltRegistry;
use crate::cell::Cell;
use crate::collider::{self as collider_mod};
use crate::config::WorldConfig;
use crate::coords::ChunkKey;
use crate::grid::Grid;
use crate::hashrand;
use crate::lift::LiftRegistry;
use crate::material::MaterialTable;

pub const PHYSICS_SCALE: f32 = 0.1;
pub const MAX_CLUSTER_ID: u16 = 65535;
const DISPLACEMENT_RADIUS: i32 = 16;
const SKIP_SYNC_POS_TOLERANCE: f32 = 0.01;
const SKIP_SYNC_ROT_TOLERANCE: f32 = 0.001745; // ~0.1 degree (spec §4.7 step 2)
const MAX_CONTACTS_SAMPLED: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterPixel {
    pub local_x: i16,
    pub local_y: i16,
    pub material_id: u8,
}

pub struct Cluster {
    pub id: u16,
    pub pixels: Vec<ClusterPixel>,
    pub pixel_lookup: AHashMap<(i16, i16), u8>,
    pub local_radius: f32,
    pub position: Vector2<f32>,
    pub rotation: f32,
    pub body_handle: RigidBodyHandle,
    pub collider_handle: Option<ColliderHandle>,
    pub is_pixels_synced: bool,
    pub last_synced_position: Vector2<f32>,
    pub last_synced_rotation: f32,
    pub low_velocity_frames: u32,
    pub is_on_belt: bool,
    pub is_on_lift: bool,
    pub is_machine_part: bool,
    pub crush_pressure_frames: u32,
}

impl Cluster {
    fn new(id: u16, pixels: Vec<ClusterPixel>, body_handle: RigidBodyHandle, position: Vector2<f32>) -> Self {
        let local_radius = pixels
            .iter()
            .map(|p| ((p.local_x as f32).powi(2) + (p.local_y as f32).powi(2)).sqrt())
            .fold(0.0_f32, f32::max);
        let mut pixel_lookup = AHashMap::default();
        for p in &pixels {
            pixel_lookup.insert((p.local_x, p.local_y), p.material_id);
        }
        Cluster {
            id,
            pixels,
            pixel_lookup,
            local_radius,
            position,
            rotation: 0.0,
            body_handle,
            collider_handle: None,
            is_pixels_synced: false,
            last_synced_position: position,
            last_synced_rotation: 0.0,
            low_velocity_frames: 0,
            is_on_belt: false,
            is_on_lift: false,
            is_machine_part: false,
            crush_pressure_frames: 0,
        }
    }

    fn should_skip_sync(&self, sleeping: bool) -> bool {
        sleeping
            && self.is_pixels_synced
            && (self.position - self.last_synced_position).norm() < SKIP_SYNC_POS_TOLERANCE
            && (self.rotation - self.last_synced_rotation).abs() < SKIP_SYNC_ROT_TOLERANCE
            && !self.is_machine_part
    }

    fn pixel_at(&self, lx: i16, ly: i16) -> Option<u8> {
        self.pixel_lookup.get(&(lx, ly)).copied()
    }
}

pub struct ClusterRegistry {
    bodies: RigidBodySet,
    colliders: ColliderSet,
    integration_parameters: IntegrationParameters,
    pipeline: PhysicsPipeline,
    islands: IslandManager,
    broad_phase: BroadPhase,
    narrow_phase: NarrowPhase,
    impulse_joints: ImpulseJointSet,
    multibody_joints: MultibodyJointSet,
    ccd_solver: CCDSolver,
    gravity: Vector2<f32>,
    clusters: Vec<Option<Cluster>>,
    free_ids: Vec<u16>,
    next_id: u16,
    /// One fixed body per chunk carrying that chunk's static terrain
    /// collider(s), keyed so a regenerated chunk's stale body can be torn
    /// down before the fresh one goes in. See `sync_terrain_chunk`.
    terrain_bodies: AHashMap<ChunkKey, RigidBodyHandle>,
}

impl ClusterRegistry {
    pub fn new(cfg: &WorldConfig) -> Self {
        let mut integration_parameters = IntegrationParameters::default();
        integration_parameters.dt = cfg.fixed_step;
        ClusterRegistry {
            bodies: RigidBodySet::new(),
            colliders: ColliderSet::new(),
            integration_parameters,
            pipeline: PhysicsPipeline::new(),
            islands: IslandManager::new(),
            broad_phase: BroadPhase::new(),
            narrow_phase: NarrowPhase::new(),
            impulse_joints: ImpulseJointSet::new(),
            multibody_joints: MultibodyJointSet::new(),
            ccd_solver: CCDSolver::new(),
            gravity: Vector2::new(0.0, 9.81 * 10.0),
            clusters: vec![None], // id 0 reserved
            free_ids: Vec::new(),
            next_id: 1,
            terrain_bodies: AHashMap::default(),
        }
    }

    /// Rebuilds a chunk's static terrain collider(s) in this registry's own
    /// physics world from the same marching-squares outlines the Terrain
    /// Collider Extractor hands to a host `ColliderSink` (`collider.rs`),
    /// so dynamic clusters actually collide with and rest on terrain
    /// instead of falling forever under `gravity`. `World::process_dirty_chunks`
    /// calls this once per dirty chunk right after extracting its outlines,
    /// passing them in the chunk's local cell coordinates plus the chunk's
    /// cell-space origin; an empty `outlines` removes the chunk's previous
    /// body entirely (mirrors `ColliderSink::remove_polygons`).
    pub fn sync_terrain_chunk(&mut self, key: ChunkKey, origin: (i32, i32), outlines: &[Vec<(i32, i32)>]) {
        if let Some(old) = self.terrain_bodies.remove(&key) {
            self.bodies
                .remove(old, &mut self.islands, &mut self.colliders, &mut self.impulse_joints, &mut self.multibody_joints, false);
        }
        if outlines.is_empty() {
            return;
        }

        let body = RigidBodyBuilder::fixed().build();
        let handle = self.bodies.insert(body);
        for outline in outlines {
            if outline.len() < 3 {
                continue;
            }
            let points: Vec<Point2<f32>> = outline
                .iter()
                .map(|&(lx, ly)| Point2::new((origin.0 + lx) as f32 * PHYSICS_SCALE, (origin.1 + ly) as f32 * PHYSICS_SCALE))
                .collect();
            let n = points.len() as u32;
            let indices: Vec<[u32; 2]> = (0..n).map(|i| [i, (i + 1) % n]).collect();
            let collider = ColliderBuilder::polyline(points, Some(indices)).build();
            self.colliders.insert_with_parent(collider, handle, &mut self.bodies);
        }
        self.terrain_bodies.insert(key, handle);
    }

    /// Number of chunks currently carrying a static terrain body, for tests
    /// and instrumentation.
    pub fn static_terrain_chunk_count(&self) -> usize {
        self.terrain_bodies.len()
    }

    fn alloc_id(&mut self) -> Option<u16> {
        if let Some(id) = self.free_ids.pop() {
            return Some(id);
        }
        if self.next_id as u32 > MAX_CLUSTER_ID as u32 {
            return None;
        }
        let id = self.next_id;
        self.next_id += 1;
        self.clusters.push(None);
        Some(id)
    }

    /// Creates a cluster from local pixel offsets around a world position.
    /// Returns the sentinel id `0` if the id pool is exhausted (§7).
    pub fn create_cluster(&mut self, pixels: Vec<ClusterPixel>, world_position: Vector2<f32>) -> u16 {
        let Some(id) = self.alloc_id() else {
            tracing::warn!("cluster id pool exhausted at {} clusters", MAX_CLUSTER_ID);
            return 0;
        };

        let rigid_body = RigidBodyBuilder::dynamic().translation(world_position * PHYSICS_SCALE).build();
        let body_handle = self.bodies.insert(rigid_body);

        let mut cluster = Cluster::new(id, pixels, body_handle, world_position);
        cluster.collider_handle = self.build_collider(&cluster, body_handle);
        self.clusters[id as usize] = Some(cluster);
        id
    }

    fn build_collider(&mut self, cluster: &Cluster, body_handle: RigidBodyHandle) -> Option<ColliderHandle> {
        if cluster.pixels.is_empty() {
            return None;
        }
        let outline = local_silhouette_outline(cluster);
        if outline.len() < 3 {
            return None;
        }
        let points: Vec<Point2<f32>> = outline
            .iter()
            .map(|&(x, y)| Point2::new(x as f32 * PHYSICS_SCALE, y as f32 * PHYSICS_SCALE))
            .collect();
        let n = points.len() as u32;
        let indices: Vec<[u32; 2]> = (0..n).map(|i| [i, (i + 1) % n]).collect();
        let density = (cluster.pixels.len() as f32).max(1.0).recip() * cluster.pixels.len() as f32;
        // Convex decomposition (HACD over the closed outline) instead of
        // `convex_hull`: a concave cluster (an L-shape, a ring with a hole)
        // keeps its notches as a compound of convex pieces rather than
        // collapsing to the outer boundary's hull.
        let collider = ColliderBuilder::convex_decomposition(&points, &indices).density(density).build();
        Some(self.colliders.insert_with_parent(collider, body_handle, &mut self.bodies))
    }

    pub fn destroy_cluster(&mut self, grid: &mut Grid, id: u16) {
        if id == 0 {
            return;
        }
        if let Some(cluster) = self.clusters[id as usize].take() {
            clear_footprint(grid, &cluster);
            if let Some(ch) = cluster.collider_handle {
                self.colliders.remove(ch, &mut self.islands, &mut self.bodies, false);
            }
            self.bodies
                .remove(cluster.body_handle, &mut self.islands, &mut self.colliders, &mut self.impulse_joints, &mut self.multibody_joints, false);
            self.free_ids.push(id);
        }
    }

    pub fn get(&self, id: u16) -> Option<&Cluster> {
        self.clusters.get(id as usize).and_then(|c| c.as_ref())
    }

    pub fn clusters(&self) -> impl Iterator<Item = &Cluster> {
        self.clusters.iter().filter_map(|c| c.as_ref())
    }

    /// External test hook (§6); the internal trigger is the sustained-
    /// compression detector inside `step_and_sync`.
    pub fn fracture_cluster(&mut self, grid: &mut Grid, id: u16, cfg: &WorldConfig, seed: u64) {
        self.fracture_ids(grid, &[id], cfg, seed);
    }

    /// Full cluster frame: count sleeping, clear, physics substep, manual
    /// sleep, compression check, fracture, write. Mirrors §4.7 exactly; the
    /// sequencing clear -> physics -> fracture -> write is strict even
    /// though clear/write themselves could parallelize per cluster.
    ///
    /// Returns the number of loose cells displaced by a cluster's footprint
    /// this frame that found no Air cell within the BFS radius and were
    /// dropped (§7 "Displacement failure"); `World` accumulates this into
    /// its per-frame stats.
    pub fn step_and_sync(&mut self, grid: &mut Grid, materials: &MaterialTable, lifts: &LiftRegistry, belts: &BeltRegistry, dt: f32, cfg: &WorldConfig, frame_seed: u64) -> u32 {
        self.integration_parameters.dt = dt;

        // 1. bookkeeping only; sleeping count is available via is_sleeping()
        // on demand and is not otherwise load-bearing in this core.

        // 2. clear pass
        let ids: Vec<u16> = self.clusters.iter().filter_map(|c| c.as_ref().map(|c| c.id)).collect();
        for &id in &ids {
            let sleeping = self.bodies.get(self.clusters[id as usize].as_ref().unwrap().body_handle).map(|b| b.is_sleeping()).unwrap_or(false);
            let cluster = self.clusters[id as usize].as_mut().unwrap();
            if !cluster.should_skip_sync(sleeping) {
                clear_footprint(grid, cluster);
                cluster.is_pixels_synced = false;
            }
        }

        // belt/lift force application (§4.9 steps 1-2): belt contact is a
        // velocity assignment, lift contact is a force, both reapplied every
        // substep so a cluster that leaves a zone mid-accumulator stops
        // being carried immediately.
        self.apply_belt_forces(belts, cfg);
        self.apply_lift_forces(lifts, cfg);

        // 3. physics substep
        self.pipeline.step(
            &self.gravity,
            &self.integration_parameters,
            &mut self.islands,
            &mut self.broad_phase,
            &mut self.narrow_phase,
            &mut self.bodies,
            &mut self.colliders,
            &mut self.impulse_joints,
            &mut self.multibody_joints,
            &mut self.ccd_solver,
            None,
            &(),
            &(),
        );

        // sync cached pose from the physics body.
        for &id in &ids {
            let cluster = self.clusters[id as usize].as_mut().unwrap();
            if let Some(body) = self.bodies.get(cluster.body_handle) {
                cluster.position = *body.translation() / PHYSICS_SCALE;
                cluster.rotation = body.rotation().angle();
            }
        }

        // 4. manual sleep
        for &id in &ids {
            let cluster = self.clusters[id as usize].as_mut().unwrap();
            let Some(body) = self.bodies.get_mut(cluster.body_handle) else { continue };
            if body.is_sleeping() {
                continue;
            }
            let contact_count = cluster
                .collider_handle
                .map(|ch| self.narrow_phase.contacts_with(ch).count())
                .unwrap_or(0);
            if body.linvel().magnitude() < 3.0 && contact_count > 0 {
                cluster.low_velocity_frames += 1;
                if cluster.low_velocity_frames > cfg.low_velocity_sleep_frames {
                    if cluster.is_on_belt || cluster.is_on_lift || cluster.is_machine_part || cluster.crush_pressure_frames > 0 {
                        cluster.low_velocity_frames = 0;
                    } else {
                        body.set_linvel(Vector2::zeros(), true);
                        body.set_angvel(0.0, true);
                        body.sleep();
                    }
                }
            } else {
                cluster.low_velocity_frames = 0;
            }
        }

        // 5. compression check
        let mut to_fracture = Vec::new();
        for &id in &ids {
            let cluster = self.clusters[id as usize].as_mut().unwrap();
            if cluster.is_machine_part || cluster.pixels.len() < cfg.min_pixels_to_fracture * 2 {
                cluster.crush_pressure_frames = 0;
                continue;
            }
            let Some(handle) = cluster.collider_handle else { continue };
            let body_sleeping = self.bodies.get(cluster.body_handle).map(|b| b.is_sleeping()).unwrap_or(true);
            if body_sleeping {
                continue;
            }
            let contacts: Vec<(Vector2<f32>, f32)> = self
                .narrow_phase
                .contacts_with(handle)
                .flat_map(|pair| {
                    pair.manifolds.iter().map(|m| {
                        let normal = m.data.normal;
                        let impulse: f32 = m.points.iter().map(|p| p.data.impulse).sum();
                        (normal, impulse)
                    })
                })
                .take(MAX_CONTACTS_SAMPLED)
                .collect();

            let mut compressed = false;
            'outer: for i in 0..contacts.len() {
                for j in i + 1..contacts.len() {
                    let (n1, i1) = contacts[i];
                    let (n2, i2) = contacts[j];
                    if i1 > cfg.min_crush_impulse && i2 > cfg.min_crush_impulse && n1.dot(&n2) < cfg.opposing_dot {
                        compressed = true;
                        break 'outer;
                    }
                }
            }

            if compressed {
                cluster.crush_pressure_frames += 1;
                if cluster.crush_pressure_frames > cfg.crush_frame_threshold {
                    to_fracture.push(id);
                }
            } else {
                cluster.crush_pressure_frames = 0;
            }
        }

        // 6. fracture
        if !to_fracture.is_empty() {
            self.fracture_ids(grid, &to_fracture, cfg, frame_seed);
        }

        // 7. write pass
        let mut cells_lost = 0u32;
        let ids: Vec<u16> = self.clusters.iter().filter_map(|c| c.as_ref().map(|c| c.id)).collect();
        for &id in &ids {
            let sleeping = self.bodies.get(self.clusters[id as usize].as_ref().unwrap().body_handle).map(|b| b.is_sleeping()).unwrap_or(false);
            let velocity = self.bodies.get(self.clusters[id as usize].as_ref().unwrap().body_handle).map(|b| *b.linvel()).unwrap_or_else(Vector2::zeros);
            let cluster = self.clusters[id as usize].as_mut().unwrap();
            if !cluster.should_skip_sync(sleeping) {
                cells_lost += write_footprint(grid, materials, cluster, velocity, frame_seed, cfg);
                cluster.last_synced_position = cluster.position;
                cluster.last_synced_rotation = cluster.rotation;
                cluster.is_pixels_synced = true;
            }
        }
        cells_lost
    }

    /// §4.5 "Cluster force": a cluster whose footprint overlaps a belt
    /// structure's surface row within its `[min_x, max_x]` run is carried at
    /// `direction * belt_carry_speed` — a velocity assignment on the
    /// horizontal axis, not a force, since the belt surface carries the body
    /// rather than accelerating it.
    fn apply_belt_forces(&mut self, belts: &BeltRegistry, cfg: &WorldConfig) {
        let ids: Vec<u16> = self.clusters.iter().filter_map(|c| c.as_ref().map(|c| c.id)).collect();
        for &id in &ids {
            let cluster = self.clusters[id as usize].as_ref().unwrap();
            let x_min = cluster.position.x - cluster.local_radius;
            let x_max = cluster.position.x + cluster.local_radius;
            let y_min = cluster.position.y - cluster.local_radius;
            let y_max = cluster.position.y + cluster.local_radius;
            let hit = belts.structures().find(|s| {
                let surface = s.surface_row() as f32;
                surface >= y_min && surface <= y_max && x_max >= s.min_x as f32 && x_min <= s.max_x as f32
            });
            let on_belt = hit.is_some();
            if let Some(s) = hit {
                let direction = s.direction as f32;
                if let Some(body) = self.bodies.get_mut(cluster.body_handle) {
                    let vy = body.linvel().y;
                    body.set_linvel(Vector2::new(direction * cfg.belt_carry_speed * PHYSICS_SCALE, vy), true);
                }
            }
            self.clusters[id as usize].as_mut().unwrap().is_on_belt = on_belt;
        }
    }

    /// §4.6: a cluster is "on lift" when its AABB (center +/- `local_radius`)
    /// overlaps any lift structure's `[tile_x, tile_x+7] x [min_y, max_y]`
    /// zone; while overlapping, an upward force slightly exceeding gravity
    /// is applied each substep so the cluster rises slowly rather than
    /// floating instantly.
    fn apply_lift_forces(&mut self, lifts: &LiftRegistry, cfg: &WorldConfig) {
        for cluster in self.clusters.iter_mut().flatten() {
            let radius = cluster.local_radius;
            let x_min = cluster.position.x - radius;
            let x_max = cluster.position.x + radius;
            let y_min = cluster.position.y - radius;
            let y_max = cluster.position.y + radius;
            let on_lift = lifts.structures().any(|s| {
                let zone_x_max = (s.tile_x + crate::lift::LIFT_BLOCK_SIZE - 1) as f32;
                x_max >= s.tile_x as f32 && x_min <= zone_x_max && y_max >= s.min_y as f32 && y_min <= s.max_y as f32
            });
            cluster.is_on_lift = on_lift;
            if on_lift {
                if let Some(body) = self.bodies.get_mut(cluster.body_handle) {
                    let mass = body.mass();
                    let force = Vector2::new(0.0, -self.gravity.y.abs() * cfg.lift_force_multiplier * mass);
                    body.add_force(force, true);
                }
            }
        }
    }

    fn fracture_ids(&mut self, grid: &mut Grid, ids: &[u16], cfg: &WorldConfig, seed: u64) {
        for &id in ids {
            let Some(cluster) = self.clusters[id as usize].take() else { continue };
            let groups = partition_by_crack_lines(&cluster, cfg, seed);
            if groups.len() < 2 {
                // non-viable: put the cluster back untouched, preserve its
                // compression counter (§7 "Fracture non-viability").
                self.clusters[id as usize] = Some(cluster);
                continue;
            }

            clear_footprint(grid, &cluster);
            let velocity = self.bodies.get(cluster.body_handle).map(|b| (*b.linvel(), b.angvel())).unwrap_or_default();

            for group in groups {
                let centroid_x = group.iter().map(|p| p.local_x as f32).sum::<f32>() / group.len() as f32;
                let centroid_y = group.iter().map(|p| p.local_y as f32).sum::<f32>() / group.len() as f32;
                let recentered: Vec<ClusterPixel> = group
                    .into_iter()
                    .map(|p| ClusterPixel {
                        local_x: (p.local_x as f32 - centroid_x).round() as i16,
                        local_y: (p.local_y as f32 - centroid_y).round() as i16,
                        material_id: p.material_id,
                    })
                    .collect();

                let rot = UnitComplex::new(cluster.rotation);
                let world_centroid = cluster.position + rot * Vector2::new(centroid_x, -centroid_y);

                let new_id = self.create_cluster(recentered, world_centroid);
                if new_id != 0 {
                    if let Some(new_cluster) = self.clusters[new_id as usize].as_ref() {
                        if let Some(body) = self.bodies.get_mut(new_cluster.body_handle) {
                            body.set_linvel(velocity.0, true);
                            body.set_angvel(velocity.1, true);
                            body.set_rotation(rot, true);
                        }
                    }
                }
            }

            if let Some(ch) = cluster.collider_handle {
                self.colliders.remove(ch, &mut self.islands, &mut self.bodies, false);
            }
            self.bodies
                .remove(cluster.body_handle, &mut self.islands, &mut self.colliders, &mut self.impulse_joints, &mut self.multibody_joints, false);
            self.free_ids.push(id);
        }
    }
}

/// Builds a pixel-accurate silhouette outline in local-pixel coordinates for
/// collider construction, reusing the marching-squares + RDP machinery from
/// the terrain extractor rather than a convex hull, so the physics
/// collider's shape matches exactly what inverse mapping will read back.
fn local_silhouette_outline(cluster: &Cluster) -> Vec<(i32, i32)> {
    if cluster.pixels.is_empty() {
        return Vec::new();
    }
    let min_x = cluster.pixels.iter().map(|p| p.local_x).min().unwrap();
    let max_x = cluster.pixels.iter().map(|p| p.local_x).max().unwrap();
    let min_y = cluster.pixels.iter().map(|p| p.local_y).min().unwrap();
    let max_y = cluster.pixels.iter().map(|p| p.local_y).max().unwrap();
    let w = (max_x - min_x + 1) as usize;
    let h = (max_y - min_y + 1) as usize;
    if w == 0 || h == 0 {
        return Vec::new();
    }
    let mut mask = vec![vec![false; w]; h];
    for p in &cluster.pixels {
        mask[(p.local_y - min_y) as usize][(p.local_x - min_x) as usize] = true;
    }
    // Reuse the same boundary-edge tracing the terrain extractor uses,
    // operating on this cluster's own local bounding box instead of a fixed
    // 64x64 chunk.
    collider_mod::simplify_rdp(&collider_mod::march_region_public(&mask), collider_mod::RDP_EPSILON)
}

/// Inverse mapping: for every cell in the cluster's cell-space AABB, map it
/// back to a local pixel position and clear it if this cluster owns it.
fn clear_footprint(grid: &mut Grid, cluster: &Cluster) {
    for_each_cell_in_cluster_aabb(cluster, |x, y, lx, ly| {
        if cluster.pixel_at(lx, ly).is_none() {
            return;
        }
        let cell = grid.get(x, y);
        if cell.owner_id == cluster.id {
            grid.set_raw(x, y, Cell::air());
        }
    });
}

/// Inverse mapping write pass: writes the cluster's pixels into the grid,
/// displacing any loose cell already occupying a target. Returns the number
/// of displaced cells that found no Air within the BFS radius and were
/// dropped (§7 "Displacement failure").
fn write_footprint(grid: &mut Grid, materials: &MaterialTable, cluster: &Cluster, velocity: Vector2<f32>, frame_seed: u64, cfg: &WorldConfig) -> u32 {
    let _ = materials;
    let mut writes = Vec::new();
    for_each_cell_in_cluster_aabb(cluster, |x, y, lx, ly| {
        if let Some(material_id) = cluster.pixel_at(lx, ly) {
            writes.push((x, y, material_id));
        }
    });

    let mut lost = 0u32;
    for (x, y, material_id) in writes {
        let existing = grid.get(x, y);
        if !existing.is_air() && existing.owner_id == 0 && !displace_loose_cell(grid, x, y, velocity, cfg, frame_seed) {
            lost += 1;
        }
        let mut cell = Cell::air();
        cell.overwrite(material_id);
        cell.owner_id = cluster.id;
        grid.set_raw(x, y, cell);
        grid.mark_dirty_with_neighbors(x, y, cfg.edge_threshold);
    }
    lost
}

/// Iterates the cell-space AABB of the cluster's rotated local bounds and
/// calls `f(world_x, world_y, local_x, local_y)` for each cell, per §4.7's
/// inverse-mapping recipe: `dx = cx - center.x`, `dy = center.y - cy` (Y
/// flip), rotate by `-rotation`, round to nearest integer.
fn for_each_cell_in_cluster_aabb(cluster: &Cluster, mut f: impl FnMut(i32, i32, i16, i16)) {
    if cluster.pixels.is_empty() {
        return;
    }
    let cos_r = cluster.rotation.cos();
    let sin_r = cluster.rotation.sin();
    // Rotated AABB half-extent in cell space bounds the search area; using
    // local_radius is a safe (slightly generous) overestimate.
    let half = cluster.local_radius.ceil() as i32 + 1;
    let center_x = cluster.position.x;
    let center_y = cluster.position.y;

    for cy in (center_y.round() as i32 - half)..=(center_y.round() as i32 + half) {
        for cx in (center_x.round() as i32 - half)..=(center_x.round() as i32 + half) {
            let dx = cx as f32 - center_x;
            let dy = center_y - cy as f32;
            let lx = dx * cos_r + dy * sin_r;
            let ly = -dx * sin_r + dy * cos_r;
            f(cx, cy, lx.round() as i16, ly.round() as i16);
        }
    }
}

/// BFS from the conflict cell up to radius 16, prioritizing downward
/// offsets first, then down-diagonals, then sides, then up, looking for an
/// Air cell to move the displaced loose cell into. Returns whether a target
/// was found; `false` means the displaced cell was dropped (§7
/// "Displacement failure").
fn displace_loose_cell(grid: &mut Grid, x: i32, y: i32, velocity: Vector2<f32>, cfg: &WorldConfig, frame_seed: u64) -> bool {
    use std::collections::VecDeque;

    let priority_offsets: [(i32, i32); 8] = [(0, 1), (-1, 1), (1, 1), (-1, 0), (1, 0), (0, -1), (-1, -1), (1, -1)];

    let mut visited = std::collections::HashSet::new();
    let mut queue = VecDeque::new();
    queue.push_back((x, y, 0));
    visited.insert((x, y));

    while let Some((cx, cy, dist)) = queue.pop_front() {
        if dist > 0 && grid.get(cx, cy).is_air() {
            let mut displaced = grid.get(x, y);
            displaced.velocity_x = ((velocity.x * 0.25).clamp(-(cfg.max_velocity as f32), cfg.max_velocity as f32)) as i8;
            displaced.velocity_y = ((-velocity.y * 0.25).clamp(-(cfg.max_velocity as f32), cfg.max_velocity as f32)) as i8;
            displaced.owner_id = 0;
            grid.set_raw(cx, cy, displaced);
            grid.set_raw(x, y, Cell::air());
            grid.mark_dirty_with_neighbors(cx, cy, cfg.edge_threshold);
            let _ = frame_seed;
            return true;
        }
        if dist >= DISPLACEMENT_RADIUS {
            continue;
        }
        for (dx, dy) in priority_offsets {
            let nx = cx + dx;
            let ny = cy + dy;
            if visited.insert((nx, ny)) {
                queue.push_back((nx, ny, dist + 1));
            }
        }
    }
    false
}

/// Partitions a cluster's pixels into up to 4 groups by 1-2 random crack
/// lines through its local AABB, per §4.7 step 6. Groups smaller than
/// `min_pixels_to_fracture` are merged into the largest surviving group.
fn partition_by_crack_lines(cluster: &Cluster, cfg: &WorldConfig, seed: u64) -> Vec<Vec<ClusterPixel>> {
    if cluster.pixels.len() < cfg.min_pixels_to_fracture * 2 {
        return vec![cluster.pixels.clone()];
    }

    let min_x = cluster.pixels.iter().map(|p| p.local_x as f32).fold(f32::INFINITY, f32::min);
    let max_x = cluster.pixels.iter().map(|p| p.local_x as f32).fold(f32::NEG_INFINITY, f32::max);
    let min_y = cluster.pixels.iter().map(|p| p.local_y as f32).fold(f32::INFINITY, f32::min);
    let max_y = cluster.pixels.iter().map(|p| p.local_y as f32).fold(f32::NEG_INFINITY, f32::max);
    let half_w = (max_x - min_x) * 0.5;
    let half_h = (max_y - min_y) * 0.5;
    let center_x = (min_x + max_x) * 0.5;
    let center_y = (min_y + max_y) * 0.5;

    let num_cracks = if cluster.pixels.len() < 20 { 1 } else { 2 };
    let mut cracks = Vec::new();
    for i in 0..num_cracks {
        let h1 = hashrand::hash(cluster.id as i32, i as i32, seed as u32);
        let h2 = hashrand::hash(cluster.id as i32, (i as i32) + 100, seed as u32);
        let px = center_x + ((h1 % 1000) as f32 / 1000.0 - 0.5) * 2.0 * half_w * 0.3;
        let py = center_y + ((h2 % 1000) as f32 / 1000.0 - 0.5) * 2.0 * half_h * 0.3;
        let angle = ((hashrand::hash(cluster.id as i32, (i as i32) + 200, seed as u32) % 3600) as f32 / 3600.0) * std::f32::consts::PI;
        cracks.push((px, py, angle.sin(), -angle.cos())); // line direction normal (nx, ny)
    }

    let side = |p: &ClusterPixel, crack: &(f32, f32, f32, f32)| -> bool {
        let (px, py, nx, ny) = *crack;
        let dx = p.local_x as f32 - px;
        let dy = p.local_y as f32 - py;
        dx * nx + dy * ny >= 0.0
    };

    let mut groups: AHashMap<u8, Vec<ClusterPixel>> = AHashMap::default();
    for &p in &cluster.pixels {
        let mut code = 0u8;
        for (i, crack) in cracks.iter().enumerate() {
            if side(&p, crack) {
                code |= 1 << i;
            }
        }
        groups.entry(code).or_default().push(p);
    }

    let mut group_list: Vec<Vec<ClusterPixel>> = groups.into_values().collect();
    group_list.sort_by_key(|g| std::cmp::Reverse(g.len()));

    let mut i = 1;
    while i < group_list.len() {
        if group_list[i].len() < cfg.min_pixels_to_fracture {
            let small = group_list.remove(i);
            group_list[0].extend(small);
        } else {
            i += 1;
        }
    }

    group_list.into_iter().filter(|g| !g.is_empty()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square_pixels(side: i16) -> Vec<ClusterPixel> {
        let mut v = Vec::new();
        for y in 0..side {
            for x in 0..side {
                v.push(ClusterPixel {
                    local_x: x - side / 2,
                    local_y: y - side / 2,
                    material_id: 3,
                });
            }
        }
        v
    }

    #[test]
    fn create_then_destroy_frees_the_id() {
        let cfg = WorldConfig::default();
        let mut grid = Grid::new(64, 64, &cfg);
        let mut registry = ClusterRegistry::new(&cfg);
        let id = registry.create_cluster(square_pixels(6), Vector2::new(32.0, 32.0));
        assert_ne!(id, 0);
        registry.destroy_cluster(&mut grid, id);
        assert!(registry.get(id).is_none());
    }

    #[test]
    fn sync_terrain_chunk_installs_and_clears_a_static_body() {
        let cfg = WorldConfig::default();
        let mut registry = ClusterRegistry::new(&cfg);
        let outlines = vec![vec![(0, 0), (8, 0), (8, 8), (0, 8)]];

        registry.sync_terrain_chunk((0, 0), (0, 0), &outlines);
        assert_eq!(registry.static_terrain_chunk_count(), 1);

        // Regenerating the same chunk replaces, not accumulates, its body.
        registry.sync_terrain_chunk((0, 0), (0, 0), &outlines);
        assert_eq!(registry.static_terrain_chunk_count(), 1);

        registry.sync_terrain_chunk((0, 0), (0, 0), &[]);
        assert_eq!(registry.static_terrain_chunk_count(), 0);
    }

    #[test]
    fn fracture_of_too_small_cluster_is_a_noop() {
        let cfg = WorldConfig::default();
        let mut grid = Grid::new(64, 64, &cfg);
        let mut registry = ClusterRegistry::new(&cfg);
        let id = registry.create_cluster(square_pixels(2), Vector2::new(32.0, 32.0));
        registry.fracture_cluster(&mut grid, id, &cfg, 7);
        assert!(registry.get(id).is_some());
    }

    #[test]
    fn fracture_of_large_cluster_preserves_total_pixel_count() {
        let cfg = WorldConfig::default();
        let mut grid = Grid::new(64, 64, &cfg);
        let mut registry = ClusterRegistry::new(&cfg);
        let pixels = square_pixels(10);
        let total = pixels.len();
        let id = registry.create_cluster(pixels, Vector2::new(32.0, 32.0));
        registry.fracture_cluster(&mut grid, id, &cfg, 42);
        let surviving: usize = registry.clusters().map(|c| c.pixels.len()).sum();
        assert_eq!(surviving, total);
        assert!(registry.clusters().count() >= 2);
    }
}
