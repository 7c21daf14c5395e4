use std::fmt::Write as _;

use worldspace_common::CellId;
use worldspace_kernel::{SpaceId, World};

/// World inspector for developer tooling.
///
/// Read-only queries against the cell tree and its spatial partition, for
/// debugging and the CLI.
pub struct WorldInspector;

impl WorldInspector {
    /// Produce a summary of the world state.
    pub fn summary(world: &World) -> WorldSummary {
        let index = world.space_index();
        WorldSummary {
            cell_count: world.cell_count(),
            live_cells: world.cells().filter(|c| c.is_live()).count(),
            space_count: index.space_count(),
            placements: index.total_placements(),
            unbounded_cells: index.members(SpaceId::Unbounded).len(),
            pending_events: world.events().len(),
        }
    }

    /// Describe a single cell.
    pub fn inspect_cell(world: &World, id: CellId) -> Option<CellInfo> {
        world.get(id).map(|cell| CellInfo {
            id,
            class_name: cell.class_name().to_owned(),
            name: cell.name(),
            parent: cell.parent(),
            children: cell.children().len(),
            live: cell.is_live(),
            depth: cell.depth(),
            position: cell.world_transform().map(|t| t.position.to_array()),
            transform_version: cell.transform_version(),
            content_version: cell.content_version(),
            spaces: cell.spaces().count(),
        })
    }

    /// List all cell ids in the world, ascending.
    pub fn list_cells(world: &World) -> Vec<CellId> {
        world.cells().map(|c| c.id()).collect()
    }

    /// Per-space occupancy, busiest first.
    pub fn spaces(world: &World) -> Vec<SpaceInfo> {
        let mut spaces: Vec<SpaceInfo> = world
            .space_index()
            .spaces()
            .map(|space| SpaceInfo {
                id: space.id(),
                members: space.members().len(),
            })
            .collect();
        spaces.sort_by(|a, b| b.members.cmp(&a.members).then(a.id.cmp(&b.id)));
        spaces
    }

    /// Indented rendering of the live tree under the root.
    pub fn tree(world: &World) -> String {
        let mut out = String::new();
        let mut stack = vec![(world.root(), 0usize)];
        while let Some((id, indent)) = stack.pop() {
            let Some(cell) = world.get(id) else {
                continue;
            };
            let _ = writeln!(
                out,
                "{:indent$}{} {} v{}/{}",
                "",
                cell.id(),
                cell.class_name(),
                cell.transform_version(),
                cell.content_version(),
                indent = indent * 2
            );
            for child in cell.children().iter().rev() {
                stack.push((*child, indent + 1));
            }
        }
        out
    }
}

/// Summary of world state for the inspector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorldSummary {
    pub cell_count: usize,
    pub live_cells: usize,
    pub space_count: usize,
    /// Sum of memberships over all spaces.
    pub placements: usize,
    pub unbounded_cells: usize,
    pub pending_events: usize,
}

impl std::fmt::Display for WorldSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "World: cells={} live={} spaces={} placements={} unbounded={} pending_events={}",
            self.cell_count,
            self.live_cells,
            self.space_count,
            self.placements,
            self.unbounded_cells,
            self.pending_events
        )
    }
}

/// Detailed info about a single cell.
#[derive(Debug, Clone)]
pub struct CellInfo {
    pub id: CellId,
    pub class_name: String,
    pub name: String,
    pub parent: Option<CellId>,
    pub children: usize,
    pub live: bool,
    pub depth: u32,
    /// World position; `None` while the cell is detached.
    pub position: Option<[f32; 3]>,
    pub transform_version: u64,
    pub content_version: u64,
    pub spaces: usize,
}

impl std::fmt::Display for CellInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Cell {} [{}]", self.id, self.class_name)?;
        if !self.name.is_empty() {
            write!(f, " \"{}\"", self.name)?;
        }
        match self.position {
            Some([x, y, z]) => write!(f, " pos=({x:.2}, {y:.2}, {z:.2})")?,
            None => write!(f, " detached")?,
        }
        write!(
            f,
            " depth={} versions={}/{} spaces={}",
            self.depth, self.transform_version, self.content_version, self.spaces
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpaceInfo {
    pub id: SpaceId,
    pub members: usize,
}

impl std::fmt::Display for SpaceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.id {
            SpaceId::Grid(c) => write!(f, "space ({}, {}, {})", c.x, c.y, c.z)?,
            SpaceId::Unbounded => write!(f, "space unbounded")?,
        }
        write!(f, ": {} cells", self.members)
    }
}
