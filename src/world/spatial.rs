//! Spatial hash grid for radius queries
//!
//! The replication core only needs "which entities are within R of P" and
//! "where is this entity". [`SpatialIndex`] is that capability; [`SpatialGrid`]
//! is the default implementation used by the server binary, tests and benches.
//! Any other index (quadtree, BVH, engine-owned structure) can be plugged in.

use hashbrown::HashMap;

use crate::util::vec2::Vec2;
use crate::world::EntityId;

// ============================================================================
// Grid Constants
// ============================================================================

/// Default cell size for the entity grid (world units)
/// Should be in the same order of magnitude as typical view radii
pub const DEFAULT_GRID_CELL_SIZE: f64 = 64.0;

/// Initial capacity for grid cells (number of expected non-empty cells)
const GRID_INITIAL_CAPACITY: usize = 256;

/// Initial capacity for entity vectors within cells
const CELL_INITIAL_CAPACITY: usize = 8;

/// Grid cell key - (x, y) cell coordinates
pub type CellKey = (i64, i64);

// ============================================================================
// Capability
// ============================================================================

/// Proximity query capability consumed by the visibility stage.
///
/// Implementations must be safe to query from several worker threads at once;
/// the replication engine never mutates the index during a tick.
pub trait SpatialIndex: Sync {
    /// Current position of an entity, `None` if it is not indexed
    fn position_of(&self, entity: EntityId) -> Option<Vec2>;

    /// Visit every entity whose position lies within `radius` of `center`
    /// (inclusive). Each entity is visited at most once per call.
    fn query_radius<F>(&self, center: Vec2, radius: f64, visit: F)
    where
        F: FnMut(EntityId);

    #[inline]
    fn contains(&self, entity: EntityId) -> bool {
        self.position_of(entity).is_some()
    }
}

// ============================================================================
// Spatial Grid
// ============================================================================

/// Spatial hash grid storing entity positions
#[derive(Debug, Clone)]
pub struct SpatialGrid {
    /// Cell size in world units (larger = fewer cells, more entities per cell)
    cell_size: f64,
    /// Inverse cell size for fast position-to-cell conversion
    inv_cell_size: f64,
    /// Map from cell key to entities in that cell
    cells: HashMap<CellKey, Vec<EntityId>>,
    /// Authoritative position per entity
    positions: HashMap<EntityId, Vec2>,
}

impl SpatialGrid {
    /// Create a new spatial grid with the given cell size
    pub fn new(cell_size: f64) -> Self {
        Self {
            cell_size,
            inv_cell_size: 1.0 / cell_size,
            cells: HashMap::with_capacity(GRID_INITIAL_CAPACITY),
            positions: HashMap::with_capacity(GRID_INITIAL_CAPACITY),
        }
    }

    /// Convert world position to cell key
    #[inline]
    fn position_to_cell(&self, position: Vec2) -> CellKey {
        (
            (position.x * self.inv_cell_size).floor() as i64,
            (position.y * self.inv_cell_size).floor() as i64,
        )
    }

    /// Insert an entity, or move it if it is already indexed
    pub fn insert(&mut self, entity: EntityId, position: Vec2) {
        if self.positions.contains_key(&entity) {
            self.move_to(entity, position);
            return;
        }
        let cell_key = self.position_to_cell(position);
        self.cells
            .entry(cell_key)
            .or_insert_with(|| Vec::with_capacity(CELL_INITIAL_CAPACITY))
            .push(entity);
        self.positions.insert(entity, position);
    }

    /// Move an indexed entity. Returns false if the entity is unknown.
    pub fn move_to(&mut self, entity: EntityId, position: Vec2) -> bool {
        let Some(old) = self.positions.get(&entity).copied() else {
            return false;
        };
        let old_cell = self.position_to_cell(old);
        let new_cell = self.position_to_cell(position);
        if old_cell != new_cell {
            self.remove_from_cell(entity, old_cell);
            self.cells
                .entry(new_cell)
                .or_insert_with(|| Vec::with_capacity(CELL_INITIAL_CAPACITY))
                .push(entity);
        }
        self.positions.insert(entity, position);
        true
    }

    /// Remove an entity from the grid
    /// Returns true if the entity was found and removed
    pub fn remove(&mut self, entity: EntityId) -> bool {
        match self.positions.remove(&entity) {
            Some(position) => {
                let cell = self.position_to_cell(position);
                self.remove_from_cell(entity, cell);
                true
            }
            None => false,
        }
    }

    fn remove_from_cell(&mut self, entity: EntityId, cell_key: CellKey) {
        if let Some(cell) = self.cells.get_mut(&cell_key) {
            if let Some(idx) = cell.iter().position(|&id| id == entity) {
                cell.swap_remove(idx);
            }
            if cell.is_empty() {
                self.cells.remove(&cell_key);
            }
        }
    }

    /// Number of indexed entities
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn cell_size(&self) -> f64 {
        self.cell_size
    }

    /// Get the number of non-empty cells
    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }
}

impl Default for SpatialGrid {
    fn default() -> Self {
        Self::new(DEFAULT_GRID_CELL_SIZE)
    }
}

impl SpatialIndex for SpatialGrid {
    #[inline]
    fn position_of(&self, entity: EntityId) -> Option<Vec2> {
        self.positions.get(&entity).copied()
    }

    fn query_radius<F>(&self, center: Vec2, radius: f64, mut visit: F)
    where
        F: FnMut(EntityId),
    {
        if !radius.is_finite() || radius < 0.0 || !center.is_finite() {
            return;
        }
        let (cx, cy) = self.position_to_cell(center);
        let cell_radius = (radius * self.inv_cell_size).ceil() as i64;
        // Pre-compute squared radius to avoid sqrt in distance checks
        let radius_sq = radius * radius;

        let mut visit_cell = |cell: &Vec<EntityId>| {
            for &entity in cell {
                if let Some(position) = self.positions.get(&entity) {
                    if position.distance_sq_to(center) <= radius_sq {
                        visit(entity);
                    }
                }
            }
        };

        // Walk whichever is smaller: the query square or the occupied cells
        let side = cell_radius.saturating_mul(2).saturating_add(1);
        if side.saturating_mul(side) as u128 > self.cells.len() as u128 {
            for cell in self.cells.values() {
                visit_cell(cell);
            }
            return;
        }

        for dx in -cell_radius..=cell_radius {
            for dy in -cell_radius..=cell_radius {
                if let Some(cell) = self.cells.get(&(cx + dx, cy + dy)) {
                    visit_cell(cell);
                }
            }
        }
    }
}
