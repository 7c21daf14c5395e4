use std::any::TypeId;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use worldspace_common::{Aabb, Bounds, CellId, Transform};

use crate::component::{CellComponent, ListenerId, TransformChangeListener};
use crate::error::CellError;
use crate::space::{SpaceConfig, SpaceId, SpaceIndex};

/// An event record produced by every mutation to the world.
///
/// Tooling drains these to observe structural changes; the streaming path
/// does not depend on them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorldEvent {
    Created { id: CellId },
    Attached { parent: CellId, child: CellId },
    Detached { parent: CellId, child: CellId },
    LiveChanged { id: CellId, live: bool },
    TransformChanged { id: CellId, version: u64 },
    BoundsChanged { id: CellId, version: u64 },
    ContentChanged { id: CellId, version: u64 },
    Destroyed { id: CellId },
    SpaceEntered { id: CellId, space: SpaceId },
    SpaceLeft { id: CellId, space: SpaceId },
}

/// Events kept before the oldest half of the log is dropped.
pub const DEFAULT_EVENT_CAPACITY: usize = 4096;

/// Bounded event log. When full, the oldest half is discarded so an
/// undrained log stays within its capacity.
#[derive(Debug)]
struct EventLog {
    events: Vec<WorldEvent>,
    capacity: usize,
    dropped: u64,
}

impl EventLog {
    fn new(capacity: usize) -> Self {
        Self {
            events: Vec::new(),
            capacity,
            dropped: 0,
        }
    }

    fn push(&mut self, event: WorldEvent) {
        if self.capacity == 0 {
            self.dropped += 1;
            return;
        }
        if self.events.len() >= self.capacity {
            let cut = self.events.len() + 1 - self.capacity / 2;
            let cut = cut.min(self.events.len());
            self.events.drain(..cut);
            self.dropped += cut as u64;
        }
        self.events.push(event);
    }

    fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
        if self.events.len() > capacity {
            let cut = self.events.len() - capacity;
            self.events.drain(..cut);
            self.dropped += cut as u64;
        }
    }
}

/// Everything needed to create a cell. Transform and bounds may be left out
/// until the cell is attached to the live tree.
#[derive(Debug, Clone, Default)]
pub struct CellSpec {
    pub class_name: String,
    pub name: Option<String>,
    pub local_transform: Option<Transform>,
    pub local_bounds: Option<Bounds>,
    pub movable: bool,
    pub config: Vec<u8>,
}

impl CellSpec {
    pub fn new(class_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            ..Self::default()
        }
    }

    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.local_transform = Some(transform);
        self
    }

    pub fn with_bounds(mut self, bounds: Bounds) -> Self {
        self.local_bounds = Some(bounds);
        self
    }

    pub fn movable(mut self, movable: bool) -> Self {
        self.movable = movable;
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_config(mut self, config: impl Into<Vec<u8>>) -> Self {
        self.config = config.into();
        self
    }
}

/// A node of the scene graph.
pub struct CellNode {
    id: CellId,
    class_name: String,
    name: Option<String>,
    config: Arc<[u8]>,
    local_transform: Option<Transform>,
    local_bounds: Option<Bounds>,
    world_transform: Option<Transform>,
    world_bounds: Option<Bounds>,
    parent: Option<CellId>,
    children: Vec<CellId>,
    live: bool,
    movable: bool,
    depth: u32,
    transform_version: u64,
    content_version: u64,
    /// Spaces this cell is registered in, each with the extent it had at
    /// registration.
    spaces: BTreeMap<SpaceId, Aabb>,
    components: Vec<(TypeId, Box<dyn CellComponent>)>,
    listeners: Vec<(ListenerId, Arc<dyn TransformChangeListener>)>,
}

impl CellNode {
    fn new(id: CellId, spec: CellSpec) -> Self {
        Self {
            id,
            class_name: spec.class_name,
            name: spec.name,
            config: spec.config.into(),
            local_transform: spec.local_transform,
            local_bounds: spec.local_bounds,
            world_transform: None,
            world_bounds: None,
            parent: None,
            children: Vec::new(),
            live: false,
            movable: spec.movable,
            depth: 0,
            transform_version: 0,
            content_version: 0,
            spaces: BTreeMap::new(),
            components: Vec::new(),
            listeners: Vec::new(),
        }
    }

    pub fn id(&self) -> CellId {
        self.id
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    /// Display name; defaults to the cell id.
    pub fn name(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.id.to_string())
    }

    pub fn config(&self) -> &Arc<[u8]> {
        &self.config
    }

    pub fn local_transform(&self) -> Option<&Transform> {
        self.local_transform.as_ref()
    }

    pub fn local_bounds(&self) -> Option<&Bounds> {
        self.local_bounds.as_ref()
    }

    /// World transform; `None` unless the cell is live.
    pub fn world_transform(&self) -> Option<&Transform> {
        self.world_transform.as_ref()
    }

    /// World bounds; `None` unless the cell is live.
    pub fn world_bounds(&self) -> Option<&Bounds> {
        self.world_bounds.as_ref()
    }

    pub fn parent(&self) -> Option<CellId> {
        self.parent
    }

    pub fn children(&self) -> &[CellId] {
        &self.children
    }

    pub fn is_live(&self) -> bool {
        self.live
    }

    pub fn is_movable(&self) -> bool {
        self.movable
    }

    /// Distance from the root; only meaningful while live.
    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn transform_version(&self) -> u64 {
        self.transform_version
    }

    pub fn content_version(&self) -> u64 {
        self.content_version
    }

    pub fn spaces(&self) -> impl Iterator<Item = SpaceId> + '_ {
        self.spaces.keys().copied()
    }

    /// Look up a component by concrete type.
    pub fn component<C: CellComponent + 'static>(&self) -> Option<&C> {
        self.components
            .iter()
            .find(|(ty, _)| *ty == TypeId::of::<C>())
            .and_then(|(_, c)| c.as_any().downcast_ref::<C>())
    }
}

impl std::fmt::Debug for CellNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CellNode")
            .field("id", &self.id)
            .field("class_name", &self.class_name)
            .field("live", &self.live)
            .field("parent", &self.parent)
            .field("children", &self.children)
            .field("transform_version", &self.transform_version)
            .field("content_version", &self.content_version)
            .finish_non_exhaustive()
    }
}

/// The authoritative scene graph plus its spatial partition index.
///
/// Cells live in an arena keyed by id; parent/child links are ids. All
/// mutations go through `&mut World`, so holding the world exclusively is
/// the per-object exclusive update section, and a shared borrow always sees
/// a consistent snapshot of transforms, bounds, versions and membership.
///
/// Uses BTreeMap for deterministic iteration order.
pub struct World {
    cells: BTreeMap<CellId, CellNode>,
    root: CellId,
    next_id: u64,
    next_listener: u64,
    index: SpaceIndex,
    event_log: EventLog,
}

impl World {
    /// Create a world holding only its live root cell.
    pub fn new() -> Self {
        Self::with_space_config(SpaceConfig::default())
    }

    pub fn with_space_config(config: SpaceConfig) -> Self {
        let mut world = Self {
            cells: BTreeMap::new(),
            root: CellId(0),
            next_id: 0,
            next_listener: 0,
            index: SpaceIndex::new(config),
            event_log: EventLog::new(DEFAULT_EVENT_CAPACITY),
        };
        let root = world.create_cell(
            CellSpec::new("root")
                .named("root")
                .with_transform(Transform::default())
                .with_bounds(Bounds::unbounded()),
        );
        world.root = root;
        world.apply_live(root, true);
        world
    }

    pub fn root(&self) -> CellId {
        self.root
    }

    /// Number of cells, live or not, including the root.
    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    pub fn contains(&self, id: CellId) -> bool {
        self.cells.contains_key(&id)
    }

    pub fn get(&self, id: CellId) -> Option<&CellNode> {
        self.cells.get(&id)
    }

    pub fn cells(&self) -> impl Iterator<Item = &CellNode> {
        self.cells.values()
    }

    pub fn space_index(&self) -> &SpaceIndex {
        &self.index
    }

    /// Drain and return the event log.
    pub fn drain_events(&mut self) -> Vec<WorldEvent> {
        std::mem::take(&mut self.event_log.events)
    }

    /// Read-only access to the event log.
    pub fn events(&self) -> &[WorldEvent] {
        &self.event_log.events
    }

    /// Bound the undrained event log; 0 stops recording. Shrinking drops
    /// the oldest events.
    pub fn set_event_capacity(&mut self, capacity: usize) {
        self.event_log.set_capacity(capacity);
    }

    /// Events discarded because the log was full.
    pub fn dropped_events(&self) -> u64 {
        self.event_log.dropped
    }

    /// Every live cell whose world bounds intersect `volume`.
    pub fn query(&self, volume: &Bounds) -> BTreeSet<CellId> {
        self.index
            .candidates(volume)
            .into_iter()
            .filter(|id| {
                self.cells
                    .get(id)
                    .and_then(|c| c.world_bounds.as_ref())
                    .is_some_and(|b| b.intersects(volume))
            })
            .collect()
    }

    /// Create a detached, non-live cell. Returns its id.
    pub fn create_cell(&mut self, spec: CellSpec) -> CellId {
        let id = CellId(self.next_id);
        self.next_id += 1;
        self.cells.insert(id, CellNode::new(id, spec));
        self.event_log.push(WorldEvent::Created { id });
        id
    }

    /// Create a cell and attach it under the root in one step.
    pub fn spawn(&mut self, spec: CellSpec) -> Result<CellId, CellError> {
        let id = self.create_cell(spec);
        if let Err(e) = self.add_child(self.root, id) {
            self.cells.remove(&id);
            // add_child records nothing on failure, so Created is last.
            if self.event_log.events.last() == Some(&WorldEvent::Created { id }) {
                self.event_log.events.pop();
            }
            return Err(e);
        }
        Ok(id)
    }

    /// Attach `child` under `parent`. A child of a live parent becomes live
    /// together with its whole subtree.
    pub fn add_child(&mut self, parent: CellId, child: CellId) -> Result<(), CellError> {
        if child == self.root {
            return Err(CellError::RootImmutable);
        }
        let parent_live = self.node(parent)?.live;
        if let Some(existing) = self.node(child)?.parent {
            return Err(CellError::MultipleParent {
                child,
                parent: existing,
            });
        }
        if self.is_ancestor_or_self(child, parent) {
            return Err(CellError::WouldCycle { parent, child });
        }
        if parent_live {
            self.validate_subtree(child)?;
        }

        self.node_mut(child)?.parent = Some(parent);
        self.node_mut(parent)?.children.push(child);
        self.event_log.push(WorldEvent::Attached { parent, child });

        if parent_live {
            self.apply_live(child, true);
        }
        Ok(())
    }

    /// Detach `child` from `parent`. Returns whether it actually was a
    /// child; a removed child of a live parent stops being live.
    pub fn remove_child(&mut self, parent: CellId, child: CellId) -> Result<bool, CellError> {
        let parent_node = self.node_mut(parent)?;
        let Some(pos) = parent_node.children.iter().position(|c| *c == child) else {
            return Ok(false);
        };
        parent_node.children.remove(pos);
        let parent_live = parent_node.live;

        // The parent link is part of the cell's content.
        if let Some(node) = self.cells.get_mut(&child) {
            node.parent = None;
            node.content_version += 1;
        }
        self.event_log.push(WorldEvent::Detached { parent, child });

        if parent_live {
            self.set_live(child, false)?;
        }
        Ok(true)
    }

    /// Detach a cell from whatever parent it has.
    pub fn detach(&mut self, id: CellId) -> Result<(), CellError> {
        if id == self.root {
            return Err(CellError::RootImmutable);
        }
        if let Some(parent) = self.node(id)?.parent {
            self.remove_child(parent, id)?;
        }
        Ok(())
    }

    /// Detach a cell and discard it with its whole subtree. Returns how many
    /// cells were removed.
    pub fn destroy(&mut self, id: CellId) -> Result<usize, CellError> {
        self.detach(id)?;
        let doomed = self.subtree(id);
        for cell in &doomed {
            self.cells.remove(cell);
            self.event_log.push(WorldEvent::Destroyed { id: *cell });
        }
        tracing::debug!(%id, removed = doomed.len(), "destroyed cell subtree");
        Ok(doomed.len())
    }

    /// Replace the local transform. On a live cell this recomputes world
    /// transforms and bounds for the whole subtree, re-evaluates partition
    /// membership and notifies the transform listeners of every cell whose
    /// world transform moved.
    pub fn set_local_transform(&mut self, id: CellId, transform: Transform) -> Result<(), CellError> {
        let node = self.node_mut(id)?;
        if node.live && !node.movable {
            return Err(CellError::NotMovable(id));
        }
        node.local_transform = Some(transform);
        node.transform_version += 1;
        let version = node.transform_version;
        let live = node.live;
        self.event_log
            .push(WorldEvent::TransformChanged { id, version });

        if live {
            self.propagate_transform(id);
        }
        Ok(())
    }

    /// Replace the local bounds. On a live cell this recomputes its world
    /// bounds and re-evaluates partition membership.
    pub fn set_local_bounds(&mut self, id: CellId, bounds: Bounds) -> Result<(), CellError> {
        let node = self.node_mut(id)?;
        node.local_bounds = Some(bounds);
        node.transform_version += 1;
        let version = node.transform_version;
        if let Some(world_t) = node.world_transform {
            node.world_bounds = Some(bounds.transformed(&world_t));
            self.refresh_spaces(id);
        }
        self.event_log.push(WorldEvent::BoundsChanged { id, version });
        Ok(())
    }

    pub fn set_name(&mut self, id: CellId, name: impl Into<String>) -> Result<(), CellError> {
        self.node_mut(id)?.name = Some(name.into());
        self.content_changed(id)
    }

    pub fn set_class_name(&mut self, id: CellId, class_name: impl Into<String>) -> Result<(), CellError> {
        self.node_mut(id)?.class_name = class_name.into();
        self.content_changed(id)
    }

    /// Replace the opaque client configuration payload.
    pub fn set_config(&mut self, id: CellId, config: impl Into<Vec<u8>>) -> Result<(), CellError> {
        self.node_mut(id)?.config = config.into().into();
        self.content_changed(id)
    }

    /// Mark the cell's content as changed without touching its fields.
    pub fn content_changed(&mut self, id: CellId) -> Result<(), CellError> {
        let node = self.node_mut(id)?;
        node.content_version += 1;
        let version = node.content_version;
        self.event_log.push(WorldEvent::ContentChanged { id, version });
        Ok(())
    }

    /// Attach a component. At most one component of each concrete type.
    /// A component added to a live cell is told so immediately.
    pub fn add_component<C: CellComponent + 'static>(
        &mut self,
        id: CellId,
        mut component: C,
    ) -> Result<(), CellError> {
        let node = self.node_mut(id)?;
        let ty = TypeId::of::<C>();
        if node.components.iter().any(|(t, _)| *t == ty) {
            return Err(CellError::DuplicateComponent {
                cell: id,
                component: component.name(),
            });
        }
        if node.live {
            component.set_live(id, true);
        }
        node.components.push((ty, Box::new(component)));
        Ok(())
    }

    pub fn add_transform_listener(
        &mut self,
        id: CellId,
        listener: Arc<dyn TransformChangeListener>,
    ) -> Result<ListenerId, CellError> {
        let handle = ListenerId(self.next_listener);
        self.node_mut(id)?.listeners.push((handle, listener));
        self.next_listener += 1;
        Ok(handle)
    }

    pub fn remove_transform_listener(&mut self, id: CellId, handle: ListenerId) -> bool {
        let Some(node) = self.cells.get_mut(&id) else {
            return false;
        };
        let before = node.listeners.len();
        node.listeners.retain(|(h, _)| *h != handle);
        node.listeners.len() != before
    }

    /// Set the live state of a cell and its subtree. Idempotent. Becoming
    /// live requires every cell of the subtree to have a local transform and
    /// bounds; otherwise nothing changes.
    pub(crate) fn set_live(&mut self, id: CellId, live: bool) -> Result<(), CellError> {
        if self.node(id)?.live == live {
            return Ok(());
        }
        if live {
            self.validate_subtree(id)?;
        }
        self.apply_live(id, live);
        Ok(())
    }

    fn node(&self, id: CellId) -> Result<&CellNode, CellError> {
        self.cells.get(&id).ok_or(CellError::NotFound(id))
    }

    fn node_mut(&mut self, id: CellId) -> Result<&mut CellNode, CellError> {
        self.cells.get_mut(&id).ok_or(CellError::NotFound(id))
    }

    /// Whether `candidate` is `id` or one of its ancestors.
    fn is_ancestor_or_self(&self, candidate: CellId, id: CellId) -> bool {
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            if current == candidate {
                return true;
            }
            cursor = self.cells.get(&current).and_then(|n| n.parent);
        }
        false
    }

    /// Pre-order list of `id` and all its descendants.
    fn subtree(&self, id: CellId) -> Vec<CellId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.cells.get(&current) {
                out.push(current);
                stack.extend(node.children.iter().rev());
            }
        }
        out
    }

    fn validate_subtree(&self, id: CellId) -> Result<(), CellError> {
        for cell in self.subtree(id) {
            let node = self.node(cell)?;
            if node.local_transform.is_none() {
                return Err(CellError::MissingTransform(cell));
            }
            if node.local_bounds.is_none() {
                return Err(CellError::MissingBounds(cell));
            }
        }
        Ok(())
    }

    /// Flip liveness for a validated subtree, parents before children.
    fn apply_live(&mut self, id: CellId, live: bool) {
        for cell in self.subtree(id) {
            let (parent_world, parent_depth) = self.parent_frame(cell);
            let Some(node) = self.cells.get_mut(&cell) else {
                continue;
            };
            if node.live == live {
                continue;
            }
            node.live = live;
            if live {
                let local_t = node.local_transform.unwrap_or_default();
                let world_t = match parent_world {
                    Some(p) => p.compose(&local_t),
                    None => local_t,
                };
                node.world_transform = Some(world_t);
                node.world_bounds = node.local_bounds.map(|b| b.transformed(&world_t));
                node.depth = parent_depth.map_or(0, |d| d + 1);
            } else {
                node.world_transform = None;
                node.world_bounds = None;
            }
            for (_, component) in node.components.iter_mut() {
                component.set_live(cell, live);
            }
            self.event_log.push(WorldEvent::LiveChanged { id: cell, live });
            if live {
                self.refresh_spaces(cell);
            } else {
                self.leave_all_spaces(cell);
            }
        }
    }

    fn parent_frame(&self, id: CellId) -> (Option<Transform>, Option<u32>) {
        self.cells
            .get(&id)
            .and_then(|n| n.parent)
            .and_then(|p| self.cells.get(&p))
            .filter(|p| p.live)
            .map_or((None, None), |p| (p.world_transform, Some(p.depth)))
    }

    /// Recompute world transform and bounds below (and including) `id`,
    /// notifying each live cell's listeners.
    fn propagate_transform(&mut self, id: CellId) {
        for cell in self.subtree(id) {
            let (parent_world, _) = self.parent_frame(cell);
            let Some(node) = self.cells.get_mut(&cell) else {
                continue;
            };
            if !node.live {
                continue;
            }
            let local_t = node.local_transform.unwrap_or_default();
            let world_t = match parent_world {
                Some(p) => p.compose(&local_t),
                None => local_t,
            };
            node.world_transform = Some(world_t);
            node.world_bounds = node.local_bounds.map(|b| b.transformed(&world_t));
            self.refresh_spaces(cell);
            self.notify_transform_listeners(cell);
        }
    }

    fn notify_transform_listeners(&self, id: CellId) {
        let Some(node) = self.cells.get(&id) else {
            return;
        };
        let (Some(local), Some(world)) = (node.local_transform, node.world_transform) else {
            return;
        };
        for (_, listener) in &node.listeners {
            listener.transform_changed(id, &local, &world);
        }
    }

    /// Bring a live cell's partition membership in line with its current
    /// world bounds: leave spaces it no longer overlaps, join new ones.
    fn refresh_spaces(&mut self, id: CellId) {
        let World {
            cells,
            index,
            event_log,
            ..
        } = self;
        let Some(node) = cells.get_mut(&id) else {
            return;
        };
        let Some(bounds) = node.world_bounds else {
            return;
        };

        let targets = index.spaces_for(&bounds);

        // Held spaces are checked against their cached extent first; the
        // target list settles grid-edge contact and moves to or from the
        // unbounded space.
        let stale: Vec<SpaceId> = node
            .spaces
            .iter()
            .filter(|(space, extent)| {
                !bounds.intersects_aabb(extent) || !targets.iter().any(|(t, _)| t == *space)
            })
            .map(|(space, _)| *space)
            .collect();
        for space in stale {
            node.spaces.remove(&space);
            index.deregister(space, id);
            event_log.push(WorldEvent::SpaceLeft { id, space });
        }

        for (space, extent) in targets {
            if node.spaces.contains_key(&space) {
                continue;
            }
            node.spaces.insert(space, extent);
            index.register(space, id);
            event_log.push(WorldEvent::SpaceEntered { id, space });
        }
    }

    fn leave_all_spaces(&mut self, id: CellId) {
        let World {
            cells,
            index,
            event_log,
            ..
        } = self;
        let Some(node) = cells.get_mut(&id) else {
            return;
        };
        for space in std::mem::take(&mut node.spaces).into_keys() {
            index.deregister(space, id);
            event_log.push(WorldEvent::SpaceLeft { id, space });
        }
    }
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for World {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("World")
            .field("root", &self.root)
            .field("cells", &self.cells.len())
            .field("spaces", &self.index.space_count())
            .finish_non_exhaustive()
    }
}
