#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use glam::Vec3;
use worldspace_common::{Bounds, CellId, Transform};
use worldspace_kernel::{CellSpec, SharedWorld, World};
use worldspace_stream::{
    AccessFilter, CacheConfig, CellDescriptor, CellOp, ImmediateScheduler, MemoryTransport,
    ViewerCache, ViewerIdentity,
};

/// Client-side replica of a viewer's loaded cells. Panics on any protocol
/// violation: duplicate LOAD, update or unload of a cell that is not
/// loaded, a version going backwards, a cell arriving before its parent,
/// or a parent leaving while one of its children is still loaded.
#[derive(Debug, Default)]
pub struct ClientMirror {
    loaded: BTreeMap<CellId, (u64, u64)>,
    parents: BTreeMap<CellId, Option<CellId>>,
    pub loads: usize,
}

impl ClientMirror {
    pub fn apply(&mut self, op: &CellOp) {
        match op {
            CellOp::Load(d) => {
                let previous = self
                    .loaded
                    .insert(d.id, (d.transform_version, d.content_version));
                assert!(previous.is_none(), "duplicate LOAD for {}", d.id);
                self.set_parent(d.id, d.parent);
                self.loads += 1;
            }
            CellOp::UpdateTransform {
                id,
                transform_version,
                ..
            } => {
                let entry = self.entry(*id);
                assert!(
                    *transform_version > entry.0,
                    "transform version of {id} went from {} to {transform_version}",
                    entry.0
                );
                entry.0 = *transform_version;
            }
            CellOp::UpdateContent(d) => {
                let entry = self.entry(d.id);
                assert!(
                    d.content_version > entry.1,
                    "content version of {} went from {} to {}",
                    d.id,
                    entry.1,
                    d.content_version
                );
                entry.1 = d.content_version;
                self.set_parent(d.id, d.parent);
            }
            CellOp::Unload(id) | CellOp::Delete(id) => {
                assert!(self.loaded.remove(id).is_some(), "removal of unloaded {id}");
                self.parents.remove(id);
                let orphan = self.parents.iter().find(|(_, p)| **p == Some(*id));
                assert!(orphan.is_none(), "{id} removed while child {:?} is loaded", orphan);
            }
        }
    }

    pub fn apply_all(&mut self, ops: &[CellOp]) {
        for op in ops {
            self.apply(op);
        }
    }

    fn set_parent(&mut self, id: CellId, parent: Option<CellId>) {
        if let Some(parent) = parent {
            assert!(
                self.loaded.contains_key(&parent),
                "{id} arrived before its parent {parent}"
            );
        }
        self.parents.insert(id, parent);
    }

    fn entry(&mut self, id: CellId) -> &mut (u64, u64) {
        self.loaded
            .get_mut(&id)
            .unwrap_or_else(|| panic!("update for unloaded {id}"))
    }

    pub fn loaded(&self) -> BTreeSet<CellId> {
        self.loaded.keys().copied().collect()
    }
}

pub const RADIUS: f32 = 20.0;

pub fn box_at(pos: Vec3) -> CellSpec {
    CellSpec::new("box")
        .movable(true)
        .with_transform(Transform::from_position(pos))
        .with_bounds(Bounds::cube(Vec3::ZERO, 1.0))
}

pub fn avatar_at(pos: Vec3) -> CellSpec {
    CellSpec::new("avatar")
        .movable(true)
        .with_transform(Transform::from_position(pos))
        .with_bounds(Bounds::sphere(Vec3::ZERO, 0.5))
}

pub fn new_world() -> SharedWorld {
    SharedWorld::new(World::new())
}

/// A logged-in cache for a fresh avatar at `pos`, delivering in one batch
/// per cycle.
pub fn viewer_at(
    world: &SharedWorld,
    transport: &Arc<MemoryTransport>,
    name: &str,
    pos: Vec3,
    access: Arc<dyn AccessFilter>,
) -> ViewerCache {
    let avatar = world
        .update(|w| w.spawn(avatar_at(pos)))
        .expect("spawn avatar");
    let identity = ViewerIdentity::new(name);
    let scheduler = Box::new(ImmediateScheduler::aggregated(identity.id, transport.clone()));
    let config = CacheConfig {
        radius: RADIUS,
        ..CacheConfig::default()
    };
    let mut cache = ViewerCache::new(identity, avatar, config, access, scheduler);
    cache.login();
    cache
}

/// The cells `cache` should hold right now: live cells in range whose
/// whole ancestor chain `access` admits, plus those ancestors. The root is
/// never filtered.
pub fn expected_cells(world: &World, cache: &ViewerCache, access: &dyn AccessFilter) -> BTreeSet<CellId> {
    let Some(view) = world.get(cache.view_cell()).and_then(|c| c.world_transform()) else {
        return BTreeSet::new();
    };
    let visible = |id: CellId| {
        id == world.root()
            || world
                .get(id)
                .is_some_and(|c| access.can_view(cache.identity(), &CellDescriptor::from_node(c)))
    };
    let mut expected = BTreeSet::new();
    for id in world.query(&Bounds::sphere(view.position, cache.config().radius)) {
        let mut chain = vec![id];
        let mut next = world.get(id).and_then(|c| c.parent());
        while let Some(parent) = next {
            chain.push(parent);
            next = world.get(parent).and_then(|c| c.parent());
        }
        let attached = chain.last() == Some(&world.root());
        if attached && chain.iter().all(|id| visible(*id)) {
            expected.extend(chain);
        }
    }
    expected
}
