//! Collider Catalog: declarative room geometry.
//!
//! Pure data plus cheap queries. A room has at most one boundary (tile grid or
//! circular dome), any number of building footprints and any number of
//! furniture boxes with height. Boxes are binned into a uniform grid so the
//! resolver only tests the handful near the mover.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use glam::Vec2;
use serde::{Deserialize, Serialize};

use crate::api::NarrowphaseApi;
use crate::narrowphase::Narrowphase;
use crate::types::RoomId;

/// Cell classification for tile-grid rooms.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellType {
    Floor,
    Water,
    Wall,
}

impl CellType {
    pub fn blocks(self) -> bool {
        !matches!(self, CellType::Floor)
    }
}

/// Square-cell walkability grid. `cells[row][col]`, rows run along +z, columns along +x.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TileGrid {
    /// World position of the min corner of cell (0, 0).
    pub origin: Vec2,
    pub cell_size: f32,
    pub cells: Vec<Vec<CellType>>,
}

impl TileGrid {
    /// Build a grid from rows of characters: `.` floor, `~` water, `#` wall.
    pub fn from_rows(origin: Vec2, cell_size: f32, rows: &[&str]) -> Self {
        let cells = rows
            .iter()
            .map(|row| {
                row.chars()
                    .map(|c| match c {
                        '~' => CellType::Water,
                        '#' => CellType::Wall,
                        _ => CellType::Floor,
                    })
                    .collect()
            })
            .collect();
        Self { origin, cell_size, cells }
    }

    pub fn rows(&self) -> usize {
        self.cells.len()
    }

    pub fn cols(&self) -> usize {
        self.cells.first().map_or(0, Vec::len)
    }

    /// World-space (min, max) corners of the grid.
    pub fn bounds(&self) -> (Vec2, Vec2) {
        let size = Vec2::new(self.cols() as f32, self.rows() as f32) * self.cell_size;
        (self.origin, self.origin + size)
    }

    /// Coordinate to (row, col); `None` outside the grid.
    pub fn cell_index(&self, p: Vec2) -> Option<(usize, usize)> {
        let cs = self.cell_size.max(1e-5);
        let local = (p - self.origin) / cs;
        let col = local.x.floor();
        let row = local.y.floor();
        if col < 0.0 || row < 0.0 {
            return None;
        }
        let (row, col) = (row as usize, col as usize);
        let line = self.cells.get(row)?;
        (col < line.len()).then_some((row, col))
    }

    pub fn cell_at(&self, p: Vec2) -> Option<CellType> {
        self.cell_index(p).map(|(r, c)| self.cells[r][c])
    }

    /// Outside the grid counts as blocked.
    pub fn is_walkable(&self, p: Vec2) -> bool {
        self.cell_at(p).is_some_and(|c| !c.blocks())
    }

    /// Center of a cell in world space.
    pub fn cell_center(&self, row: usize, col: usize) -> Vec2 {
        self.origin + (Vec2::new(col as f32, row as f32) + Vec2::splat(0.5)) * self.cell_size
    }
}

/// Circular dome: everything inside `radius` of `center` is walkable.
#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub struct CircularBound {
    pub center: Vec2,
    pub radius: f32,
}

/// Furniture or platform: an axis-aligned box with a vertical extent.
#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub struct BoxCollider {
    pub center: Vec2,
    pub half_extents: Vec2,
    pub height: f32,
    #[serde(default)]
    pub base_y: f32,
}

impl BoxCollider {
    pub fn top(&self) -> f32 {
        self.base_y + self.height
    }
}

/// Gap in a building's front (+z) face through which entities may step.
#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub struct DoorWindow {
    pub half_width: f32,
    /// How far the gap reaches into the footprint from the front face.
    pub depth: f32,
}

/// Solid building footprint, optionally with a door gap on its front face.
#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub struct BuildingFootprint {
    pub center: Vec2,
    pub half_extents: Vec2,
    #[serde(default)]
    pub door: Option<DoorWindow>,
}

impl BuildingFootprint {
    pub fn in_door_window(&self, p: Vec2) -> bool {
        let Some(door) = self.door else {
            return false;
        };
        let front = self.center.y + self.half_extents.y;
        (p.x - self.center.x).abs() <= door.half_width && p.y >= front - door.depth
    }

    /// Whether a body of radius `r` centered at `p` is stopped by this footprint.
    pub fn blocks(&self, p: Vec2, r: f32) -> bool {
        let inflated = self.half_extents + Vec2::splat(r);
        Narrowphase::overlap_point_aabb(p, self.center, inflated) && !self.in_door_window(p)
    }
}

/// One geometry declaration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Collider {
    TileGrid(TileGrid),
    CircularBound(CircularBound),
    BoxCollider(BoxCollider),
    BuildingFootprint(BuildingFootprint),
}

/// The outer limit of a room's walkable area.
#[derive(Clone, Debug, Default)]
pub enum Boundary {
    #[default]
    Open,
    Tiles(TileGrid),
    Circle(CircularBound),
}

/// Uniform grid over box colliders (cell coord -> indices into the box list).
#[derive(Clone, Debug)]
struct BoxIndex {
    cell_size: f32,
    grid: HashMap<(i32, i32), Vec<usize>>,
}

impl BoxIndex {
    fn build(boxes: &[BoxCollider], cell_size: f32) -> Self {
        let mut index = Self { cell_size, grid: HashMap::new() };
        for (i, b) in boxes.iter().enumerate() {
            index.insert_into_grid(i, b.center - b.half_extents, b.center + b.half_extents);
        }
        index
    }

    fn insert_into_grid(&mut self, idx: usize, min: Vec2, max: Vec2) {
        let cs = self.cell_size.max(1e-5);
        let (ix0, iy0) = world_to_cell(min, cs);
        let (ix1, iy1) = world_to_cell(max, cs);
        for iy in iy0..=iy1 {
            for ix in ix0..=ix1 {
                self.grid.entry((ix, iy)).or_default().push(idx);
            }
        }
    }

    /// Candidate boxes whose cells touch the circle's bounds. Deduplicated, ascending.
    fn query_circle(&self, center: Vec2, radius: f32) -> Vec<usize> {
        let cs = self.cell_size.max(1e-5);
        let (ix0, iy0) = world_to_cell(center - Vec2::splat(radius), cs);
        let (ix1, iy1) = world_to_cell(center + Vec2::splat(radius), cs);
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for iy in iy0..=iy1 {
            for ix in ix0..=ix1 {
                if let Some(list) = self.grid.get(&(ix, iy)) {
                    out.extend(list.iter().copied().filter(|idx| seen.insert(*idx)));
                }
            }
        }
        out.sort_unstable();
        out
    }

    fn cells(&self) -> usize {
        self.grid.len()
    }
}

fn world_to_cell(p: Vec2, cs: f32) -> (i32, i32) {
    ((p.x / cs).floor() as i32, (p.y / cs).floor() as i32)
}

/// Grid cell size for the furniture index, in world units.
const BOX_INDEX_CELL: f32 = 4.0;

/// All geometry of one room, ready to query.
#[derive(Clone, Debug)]
pub struct RoomGeometry {
    pub boundary: Boundary,
    pub buildings: Vec<BuildingFootprint>,
    pub boxes: Vec<BoxCollider>,
    index: BoxIndex,
}

impl Default for RoomGeometry {
    fn default() -> Self {
        Self::from_colliders(Vec::new())
    }
}

impl RoomGeometry {
    /// Sort declarations into boundary, buildings and boxes. A second boundary
    /// declaration is ignored with a warning.
    pub fn from_colliders(colliders: impl IntoIterator<Item = Collider>) -> Self {
        let mut boundary = Boundary::Open;
        let mut buildings = Vec::new();
        let mut boxes = Vec::new();
        for c in colliders {
            match c {
                Collider::TileGrid(t) => set_boundary(&mut boundary, Boundary::Tiles(t)),
                Collider::CircularBound(c) => set_boundary(&mut boundary, Boundary::Circle(c)),
                Collider::BoxCollider(b) => boxes.push(b),
                Collider::BuildingFootprint(f) => buildings.push(f),
            }
        }
        let index = BoxIndex::build(&boxes, BOX_INDEX_CELL);
        Self { boundary, buildings, boxes, index }
    }

    /// Boxes that may touch a circle of `radius` around `p`.
    pub fn boxes_near(&self, p: Vec2, radius: f32) -> impl Iterator<Item = &BoxCollider> + '_ {
        self.index
            .query_circle(p, radius)
            .into_iter()
            .map(move |i| &self.boxes[i])
    }

    /// Boundary-stage test: tile/water/out-of-grid cells and building footprints.
    /// Circular bounds never hard-block (they project instead).
    pub fn hard_blocks(&self, p: Vec2, r: f32) -> bool {
        if let Boundary::Tiles(grid) = &self.boundary {
            if !grid.is_walkable(p) {
                return true;
            }
        }
        self.buildings.iter().any(|b| b.blocks(p, r))
    }

    /// Whether `p` is a reasonable place to stand, keeping `margin` clear of
    /// every obstacle. Used to vet NPC walk targets.
    pub fn allows_point(&self, p: Vec2, margin: f32) -> bool {
        match &self.boundary {
            Boundary::Open => {}
            Boundary::Tiles(grid) => {
                let samples = [
                    p,
                    p + Vec2::new(margin, 0.0),
                    p - Vec2::new(margin, 0.0),
                    p + Vec2::new(0.0, margin),
                    p - Vec2::new(0.0, margin),
                ];
                if !samples.iter().all(|q| grid.is_walkable(*q)) {
                    return false;
                }
            }
            Boundary::Circle(c) => {
                if Narrowphase::contain_in_circle(p, margin, c.center, c.radius).is_some() {
                    return false;
                }
            }
        }
        if self.buildings.iter().any(|b| b.blocks(p, margin)) {
            return false;
        }
        !self.boxes_near(p, margin).any(|b| {
            Narrowphase::overlap_point_aabb(p, b.center, b.half_extents + Vec2::splat(margin))
        })
    }

    /// Region to draw uniform samples from, if the room has a finite boundary.
    pub fn sample_extent(&self) -> Option<(Vec2, Vec2)> {
        match &self.boundary {
            Boundary::Open => None,
            Boundary::Tiles(grid) => Some(grid.bounds()),
            Boundary::Circle(c) => Some((c.center - Vec2::splat(c.radius), c.center + Vec2::splat(c.radius))),
        }
    }

    /// Number of occupied cells in the furniture index.
    pub fn index_cells(&self) -> usize {
        self.index.cells()
    }
}

fn set_boundary(slot: &mut Boundary, new: Boundary) {
    if matches!(slot, Boundary::Open) {
        *slot = new;
    } else {
        log::warn!("room declares more than one boundary; keeping the first");
    }
}

/// Geometry for every known room. Lookups for unknown rooms return `None`,
/// which every consumer treats as "unblocked".
#[derive(Clone, Debug, Default)]
pub struct ColliderCatalog {
    rooms: HashMap<RoomId, Arc<RoomGeometry>>,
}

impl ColliderCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, room: RoomId, geometry: RoomGeometry) {
        self.rooms.insert(room, Arc::new(geometry));
    }

    pub fn geometry(&self, room: &RoomId) -> Option<&RoomGeometry> {
        self.rooms.get(room).map(Arc::as_ref)
    }

    /// Shared handle, for contexts that outlive a borrow of the catalog.
    pub fn shared(&self, room: &RoomId) -> Option<Arc<RoomGeometry>> {
        self.rooms.get(room).cloned()
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn town_grid() -> TileGrid {
        TileGrid::from_rows(
            Vec2::ZERO,
            1.0,
            &[
                "#####",
                "#...#",
                "#.~.#",
                "#...#",
                "#####",
            ],
        )
    }

    #[test]
    fn test_tile_grid_index_mapping() {
        let g = town_grid();
        assert_eq!(g.rows(), 5);
        assert_eq!(g.cols(), 5);
        assert_eq!(g.cell_index(Vec2::new(1.5, 2.5)), Some((2, 1)));
        assert_eq!(g.cell_at(Vec2::new(2.5, 2.5)), Some(CellType::Water));
        assert_eq!(g.cell_index(Vec2::new(-0.1, 1.0)), None);
        assert_eq!(g.cell_index(Vec2::new(5.0, 1.0)), None);
        assert!(g.is_walkable(Vec2::new(1.5, 1.5)));
        assert!(!g.is_walkable(Vec2::new(2.5, 2.5)));
        assert!(!g.is_walkable(Vec2::new(0.5, 0.5)));
        assert_eq!(g.cell_center(1, 3), Vec2::new(3.5, 1.5));
    }

    #[test]
    fn test_building_door_window() {
        let b = BuildingFootprint {
            center: Vec2::ZERO,
            half_extents: Vec2::new(3.0, 2.0),
            door: Some(DoorWindow { half_width: 0.8, depth: 0.5 }),
        };
        // solid wall on the side
        assert!(b.blocks(Vec2::new(3.2, 0.0), 0.4));
        // approaching the door from the front is allowed
        assert!(!b.blocks(Vec2::new(0.0, 2.2), 0.4));
        // but not past the door depth
        assert!(b.blocks(Vec2::new(0.0, 1.0), 0.4));
        // front face outside the window
        assert!(b.blocks(Vec2::new(2.0, 2.2), 0.4));
        // far away
        assert!(!b.blocks(Vec2::new(10.0, 0.0), 0.4));
    }

    #[test]
    fn test_from_colliders_sorts_and_keeps_first_boundary() {
        let geom = RoomGeometry::from_colliders([
            Collider::CircularBound(CircularBound { center: Vec2::ZERO, radius: 10.0 }),
            Collider::TileGrid(town_grid()),
            Collider::BoxCollider(BoxCollider {
                center: Vec2::new(2.0, 0.0),
                half_extents: Vec2::splat(0.5),
                height: 1.0,
                base_y: 0.0,
            }),
        ]);
        assert!(matches!(geom.boundary, Boundary::Circle(_)));
        assert_eq!(geom.boxes.len(), 1);
        assert!(geom.index_cells() >= 1);
    }

    #[test]
    fn test_boxes_near_uses_grid() {
        let geom = RoomGeometry::from_colliders([
            Collider::BoxCollider(BoxCollider {
                center: Vec2::new(1.0, 1.0),
                half_extents: Vec2::splat(0.5),
                height: 1.0,
                base_y: 0.0,
            }),
            Collider::BoxCollider(BoxCollider {
                center: Vec2::new(40.0, 40.0),
                half_extents: Vec2::splat(0.5),
                height: 1.0,
                base_y: 0.0,
            }),
        ]);
        let near: Vec<_> = geom.boxes_near(Vec2::new(1.2, 0.8), 0.5).collect();
        assert_eq!(near.len(), 1);
        assert_eq!(near[0].center, Vec2::new(1.0, 1.0));
    }

    #[test]
    fn test_allows_point_respects_margin() {
        let geom = RoomGeometry::from_colliders([Collider::TileGrid(town_grid())]);
        assert!(geom.allows_point(Vec2::new(1.5, 1.5), 0.3));
        // next to the pond, margin reaches into water
        assert!(!geom.allows_point(Vec2::new(1.8, 2.5), 0.3));
        let dome = RoomGeometry::from_colliders([Collider::CircularBound(CircularBound {
            center: Vec2::ZERO,
            radius: 5.0,
        })]);
        assert!(dome.allows_point(Vec2::new(4.0, 0.0), 0.5));
        assert!(!dome.allows_point(Vec2::new(4.8, 0.0), 0.5));
    }

    #[test]
    fn test_collider_json_shape() {
        let c: Collider = serde_json::from_str(
            r#"{ "kind": "box_collider", "center": [1.0, 2.0], "half_extents": [0.5, 0.5], "height": 0.8 }"#,
        )
        .unwrap();
        match c {
            Collider::BoxCollider(b) => {
                assert_eq!(b.base_y, 0.0);
                assert!((b.top() - 0.8).abs() < 1e-6);
            }
            other => panic!("unexpected collider {other:?}"),
        }
    }

    #[test]
    fn test_catalog_miss_is_none() {
        let mut cat = ColliderCatalog::new();
        cat.insert(RoomId::from("plaza"), RoomGeometry::default());
        assert!(cat.geometry(&RoomId::from("plaza")).is_some());
        assert!(cat.geometry(&RoomId::from("nowhere")).is_none());
        assert_eq!(cat.len(), 1);
    }
}
