use std::collections::{BTreeSet, HashMap};

use glam::Vec3;
use serde::{Deserialize, Serialize};
use worldspace_common::{Aabb, Bounds, CellId};

/// Integer coordinate of a grid space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SpaceCoord {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl SpaceCoord {
    pub fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }
}

/// Identifies a partition: either one cube of the grid or the single
/// unbounded space that holds cells too large to grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SpaceId {
    Grid(SpaceCoord),
    Unbounded,
}

/// Partition layout parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpaceConfig {
    /// Edge length of each cubic grid space.
    pub space_size: f32,
    /// Cells whose bounds would touch more grid spaces than this go to the
    /// unbounded space instead.
    pub max_spaces_per_cell: usize,
}

impl Default for SpaceConfig {
    fn default() -> Self {
        Self {
            space_size: 32.0,
            max_spaces_per_cell: 512,
        }
    }
}

/// A bounded region of the world and the cells registered in it.
///
/// Membership is an index only; the space never owns the cells.
#[derive(Debug, Clone)]
pub struct Space {
    id: SpaceId,
    extent: Aabb,
    members: BTreeSet<CellId>,
}

impl Space {
    fn new(id: SpaceId, extent: Aabb) -> Self {
        Self {
            id,
            extent,
            members: BTreeSet::new(),
        }
    }

    pub fn id(&self) -> SpaceId {
        self.id
    }

    pub fn extent(&self) -> Aabb {
        self.extent
    }

    pub fn members(&self) -> &BTreeSet<CellId> {
        &self.members
    }
}

/// Fixed-size 3D grid of spaces, created lazily as cells move into them and
/// dropped again when they empty.
#[derive(Debug, Clone)]
pub struct SpaceIndex {
    config: SpaceConfig,
    grid: HashMap<SpaceCoord, Space>,
    unbounded: Space,
}

impl SpaceIndex {
    pub fn new(config: SpaceConfig) -> Self {
        assert!(config.space_size > 0.0, "space_size must be positive");
        Self {
            config,
            grid: HashMap::new(),
            unbounded: Space::new(SpaceId::Unbounded, Aabb::everything()),
        }
    }

    pub fn config(&self) -> &SpaceConfig {
        &self.config
    }

    /// Grid coordinate of the space containing `pos`.
    pub fn position_to_space(&self, pos: Vec3) -> SpaceCoord {
        let s = self.config.space_size;
        SpaceCoord {
            x: (pos.x / s).floor() as i32,
            y: (pos.y / s).floor() as i32,
            z: (pos.z / s).floor() as i32,
        }
    }

    /// World-space extent of a grid space.
    pub fn extent_of(&self, coord: SpaceCoord) -> Aabb {
        let s = self.config.space_size;
        let min = Vec3::new(coord.x as f32, coord.y as f32, coord.z as f32) * s;
        Aabb::new(min, min + Vec3::splat(s))
    }

    /// Every space whose extent intersects `bounds`, each with its extent.
    ///
    /// Unbounded bounds, and bounds spanning more than
    /// `max_spaces_per_cell` grid spaces, map to the unbounded space alone.
    pub fn spaces_for(&self, bounds: &Bounds) -> Vec<(SpaceId, Aabb)> {
        let Some((lo, hi)) = self.coord_range(bounds) else {
            return vec![(SpaceId::Unbounded, self.unbounded.extent)];
        };
        if span(lo, hi) > self.config.max_spaces_per_cell as u64 {
            return vec![(SpaceId::Unbounded, self.unbounded.extent)];
        }

        let mut out = Vec::new();
        for x in lo.x..=hi.x {
            for y in lo.y..=hi.y {
                for z in lo.z..=hi.z {
                    let coord = SpaceCoord::new(x, y, z);
                    let extent = self.extent_of(coord);
                    if bounds.intersects_aabb(&extent) {
                        out.push((SpaceId::Grid(coord), extent));
                    }
                }
            }
        }
        out
    }

    /// All cells registered in spaces that overlap `volume`. The caller
    /// still has to test each cell's own bounds.
    pub fn candidates(&self, volume: &Bounds) -> BTreeSet<CellId> {
        let mut out: BTreeSet<CellId> = self.unbounded.members.clone();

        match self.coord_range(volume) {
            Some((lo, hi)) if span(lo, hi) <= self.grid.len() as u64 => {
                for x in lo.x..=hi.x {
                    for y in lo.y..=hi.y {
                        for z in lo.z..=hi.z {
                            if let Some(space) = self.grid.get(&SpaceCoord::new(x, y, z)) {
                                if volume.intersects_aabb(&space.extent) {
                                    out.extend(space.members.iter().copied());
                                }
                            }
                        }
                    }
                }
            }
            // Fewer live spaces than coordinates to check: scan the map.
            _ => {
                for space in self.grid.values() {
                    if volume.intersects_aabb(&space.extent) {
                        out.extend(space.members.iter().copied());
                    }
                }
            }
        }
        out
    }

    pub fn space(&self, id: SpaceId) -> Option<&Space> {
        match id {
            SpaceId::Grid(coord) => self.grid.get(&coord),
            SpaceId::Unbounded => Some(&self.unbounded),
        }
    }

    /// Members of a space; empty when the space does not exist.
    pub fn members(&self, id: SpaceId) -> BTreeSet<CellId> {
        self.space(id)
            .map(|s| s.members.clone())
            .unwrap_or_default()
    }

    /// Number of non-empty grid spaces.
    pub fn space_count(&self) -> usize {
        self.grid.len()
    }

    /// Total number of cell placements across all spaces, including the
    /// unbounded one.
    pub fn total_placements(&self) -> usize {
        self.grid.values().map(|s| s.members.len()).sum::<usize>() + self.unbounded.members.len()
    }

    pub fn spaces(&self) -> impl Iterator<Item = &Space> {
        std::iter::once(&self.unbounded).chain(self.grid.values())
    }

    pub(crate) fn register(&mut self, id: SpaceId, cell: CellId) -> bool {
        match id {
            SpaceId::Grid(coord) => {
                let extent = self.extent_of(coord);
                self.grid
                    .entry(coord)
                    .or_insert_with(|| Space::new(id, extent))
                    .members
                    .insert(cell)
            }
            SpaceId::Unbounded => self.unbounded.members.insert(cell),
        }
    }

    pub(crate) fn deregister(&mut self, id: SpaceId, cell: CellId) -> bool {
        match id {
            SpaceId::Grid(coord) => {
                let Some(space) = self.grid.get_mut(&coord) else {
                    return false;
                };
                let removed = space.members.remove(&cell);
                if space.members.is_empty() {
                    self.grid.remove(&coord);
                }
                removed
            }
            SpaceId::Unbounded => self.unbounded.members.remove(&cell),
        }
    }

    fn coord_range(&self, bounds: &Bounds) -> Option<(SpaceCoord, SpaceCoord)> {
        if !bounds.is_finite() {
            return None;
        }
        let aabb = bounds.aabb();
        Some((
            self.position_to_space(aabb.min),
            self.position_to_space(aabb.max),
        ))
    }
}

impl Default for SpaceIndex {
    fn default() -> Self {
        Self::new(SpaceConfig::default())
    }
}

/// Number of grid coordinates in the inclusive range.
fn span(lo: SpaceCoord, hi: SpaceCoord) -> u64 {
    let axis = |a: i32, b: i32| (i64::from(b) - i64::from(a) + 1).max(0) as u64;
    axis(lo.x, hi.x)
        .saturating_mul(axis(lo.y, hi.y))
        .saturating_mul(axis(lo.z, hi.z))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> SpaceIndex {
        SpaceIndex::new(SpaceConfig {
            space_size: 16.0,
            max_spaces_per_cell: 64,
        })
    }

    #[test]
    fn position_to_space_basic() {
        let idx = index();
        assert_eq!(
            idx.position_to_space(Vec3::new(10.0, 0.0, 10.0)),
            SpaceCoord::new(0, 0, 0)
        );
        assert_eq!(
            idx.position_to_space(Vec3::new(20.0, 0.0, -5.0)),
            SpaceCoord::new(1, 0, -1)
        );
    }

    #[test]
    fn small_bounds_land_in_one_space() {
        let idx = index();
        let spaces = idx.spaces_for(&Bounds::sphere(Vec3::splat(8.0), 1.0));
        assert_eq!(spaces.len(), 1);
        assert_eq!(spaces[0].0, SpaceId::Grid(SpaceCoord::new(0, 0, 0)));
    }

    #[test]
    fn straddling_bounds_land_in_several_spaces() {
        let idx = index();
        let spaces = idx.spaces_for(&Bounds::cube(Vec3::new(16.0, 8.0, 8.0), 1.0));
        let ids: Vec<SpaceId> = spaces.iter().map(|(id, _)| *id).collect();
        assert_eq!(
            ids,
            vec![
                SpaceId::Grid(SpaceCoord::new(0, 0, 0)),
                SpaceId::Grid(SpaceCoord::new(1, 0, 0)),
            ]
        );
    }

    #[test]
    fn sphere_skips_corner_spaces_it_misses() {
        let idx = index();
        // Box of the sphere touches 8 spaces around the shared corner at
        // (16,16,16); the sphere itself reaches all of them.
        let all = idx.spaces_for(&Bounds::sphere(Vec3::splat(16.0), 2.0));
        assert_eq!(all.len(), 8);
        // Offset sphere: its box reaches the corner space diagonally but
        // the sphere does not.
        let some = idx.spaces_for(&Bounds::sphere(Vec3::new(15.0, 15.0, 8.0), 1.5));
        assert_eq!(some.len(), 4);
        let clipped = idx.spaces_for(&Bounds::sphere(Vec3::new(14.9, 14.9, 8.0), 1.45));
        assert_eq!(clipped.len(), 3);
    }

    #[test]
    fn unbounded_and_huge_bounds_go_to_unbounded_space() {
        let idx = index();
        assert_eq!(
            idx.spaces_for(&Bounds::unbounded())[0].0,
            SpaceId::Unbounded
        );
        let huge = idx.spaces_for(&Bounds::cube(Vec3::ZERO, 10_000.0));
        assert_eq!(huge.len(), 1);
        assert_eq!(huge[0].0, SpaceId::Unbounded);
    }

    #[test]
    fn register_and_deregister_manage_spaces() {
        let mut idx = index();
        let space = SpaceId::Grid(SpaceCoord::new(2, 0, 0));
        assert!(idx.register(space, CellId(1)));
        assert!(!idx.register(space, CellId(1)));
        assert_eq!(idx.space_count(), 1);
        assert_eq!(idx.total_placements(), 1);

        assert!(idx.deregister(space, CellId(1)));
        assert_eq!(idx.space_count(), 0);
        assert!(!idx.deregister(space, CellId(1)));
    }

    #[test]
    fn candidates_include_unbounded_members() {
        let mut idx = index();
        idx.register(SpaceId::Unbounded, CellId(0));
        idx.register(SpaceId::Grid(SpaceCoord::new(0, 0, 0)), CellId(1));
        idx.register(SpaceId::Grid(SpaceCoord::new(50, 0, 0)), CellId(2));

        let near = idx.candidates(&Bounds::sphere(Vec3::splat(8.0), 4.0));
        assert_eq!(near, BTreeSet::from([CellId(0), CellId(1)]));

        let everything = idx.candidates(&Bounds::unbounded());
        assert_eq!(everything.len(), 3);
    }

    #[test]
    fn empty_space_has_no_members() {
        let idx = index();
        assert!(idx.members(SpaceId::Grid(SpaceCoord::new(9, 9, 9))).is_empty());
    }
}
