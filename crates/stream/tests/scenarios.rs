mod common;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use common::{ClientMirror, RADIUS, avatar_at, box_at, new_world, viewer_at};
use glam::Vec3;
use worldspace_common::{CellId, Transform};
use worldspace_stream::{
    AccessFilter, AllowAll, CacheConfig, CellDescriptor, CellOp, DenyList, DriverConfig,
    MemoryTransport, OpKind, RevalidationDriver, SchedulerKind, ViewerCache, ViewerIdentity,
};

fn boxes_only() -> Arc<dyn AccessFilter> {
    Arc::new(|_: &ViewerIdentity, d: &CellDescriptor| d.class_name == "box")
}

fn of_kind(ops: &[CellOp], kind: OpKind) -> Vec<CellId> {
    ops.iter()
        .filter(|op| op.kind() == kind)
        .map(CellOp::cell_id)
        .collect()
}

#[test]
fn login_with_one_cell_in_range_loads_it_once() {
    let world = new_world();
    let transport = Arc::new(MemoryTransport::new());
    let cell = world.update(|w| w.spawn(box_at(Vec3::new(5.0, 0.0, 0.0)))).unwrap();
    let mut cache = viewer_at(&world, &transport, "alice", Vec3::ZERO, boxes_only());

    cache.revalidate(&world).unwrap();
    let ops = transport.take(cache.viewer());
    // The root is never filtered, so it always comes first.
    let root = world.with(|w| w.root());
    assert_eq!(ops.len(), 2);
    assert_eq!(of_kind(&ops, OpKind::Load), vec![root, cell]);
}

#[test]
fn root_and_avatar_stream_with_everything_else() {
    let world = new_world();
    let transport = Arc::new(MemoryTransport::new());
    let cell = world.update(|w| w.spawn(box_at(Vec3::new(5.0, 0.0, 0.0)))).unwrap();
    let mut cache = viewer_at(&world, &transport, "alice", Vec3::ZERO, Arc::new(AllowAll));

    cache.revalidate(&world).unwrap();
    let root = world.with(|w| w.root());
    let loads = of_kind(&transport.take(cache.viewer()), OpKind::Load);
    assert_eq!(loads[0], root);
    // Same depth: ordered by id, and the box was spawned first.
    assert_eq!(loads, vec![root, cell, cache.view_cell()]);
}

#[test]
fn cell_leaving_range_is_unloaded_once() {
    let world = new_world();
    let transport = Arc::new(MemoryTransport::new());
    let cell = world.update(|w| w.spawn(box_at(Vec3::new(5.0, 0.0, 0.0)))).unwrap();
    let mut cache = viewer_at(&world, &transport, "alice", Vec3::ZERO, boxes_only());
    cache.revalidate(&world).unwrap();
    transport.take(cache.viewer());

    world
        .update(|w| w.set_local_transform(cell, Transform::from_position(Vec3::new(RADIUS * 4.0, 0.0, 0.0))))
        .unwrap();
    cache.revalidate(&world).unwrap();

    let ops = transport.take(cache.viewer());
    assert_eq!(ops, vec![CellOp::Unload(cell)]);
    assert!(cache.entry(cell).is_none());

    cache.revalidate(&world).unwrap();
    assert!(transport.take(cache.viewer()).is_empty());
}

#[test]
fn destroyed_visible_cell_is_deleted_not_unloaded() {
    let world = new_world();
    let transport = Arc::new(MemoryTransport::new());
    let cell = world.update(|w| w.spawn(box_at(Vec3::new(5.0, 0.0, 0.0)))).unwrap();
    let mut cache = viewer_at(&world, &transport, "alice", Vec3::ZERO, boxes_only());
    cache.revalidate(&world).unwrap();
    transport.take(cache.viewer());

    world.update(|w| w.destroy(cell)).unwrap();
    cache.revalidate(&world).unwrap();
    assert_eq!(transport.take(cache.viewer()), vec![CellOp::Delete(cell)]);
}

#[test]
fn detached_cell_is_unloaded_not_deleted() {
    let world = new_world();
    let transport = Arc::new(MemoryTransport::new());
    let cell = world.update(|w| w.spawn(box_at(Vec3::new(5.0, 0.0, 0.0)))).unwrap();
    let mut cache = viewer_at(&world, &transport, "alice", Vec3::ZERO, boxes_only());
    cache.revalidate(&world).unwrap();
    transport.take(cache.viewer());

    world.update(|w| w.detach(cell)).unwrap();
    cache.revalidate(&world).unwrap();
    assert_eq!(transport.take(cache.viewer()), vec![CellOp::Unload(cell)]);
}

#[test]
fn revoked_access_unloads_cell_still_in_range() {
    let world = new_world();
    let transport = Arc::new(MemoryTransport::new());
    let cell = world.update(|w| w.spawn(box_at(Vec3::new(5.0, 0.0, 0.0)))).unwrap();
    let deny = Arc::new(DenyList::new());
    let mut cache = viewer_at(&world, &transport, "alice", Vec3::ZERO, deny.clone());
    cache.revalidate(&world).unwrap();
    transport.take(cache.viewer());

    deny.deny(cache.viewer(), cell);
    cache.revalidate(&world).unwrap();
    assert_eq!(transport.take(cache.viewer()), vec![CellOp::Unload(cell)]);
    assert!(world.with(|w| w.get(cell).is_some_and(|c| c.is_live())));
}

#[test]
fn two_viewers_get_independent_monotonic_streams() {
    let world = new_world();
    let transport = Arc::new(MemoryTransport::new());
    let cell = world.update(|w| w.spawn(box_at(Vec3::ZERO))).unwrap();
    let mut alice = viewer_at(&world, &transport, "alice", Vec3::new(-5.0, 0.0, 0.0), boxes_only());
    let mut bob = viewer_at(&world, &transport, "bob", Vec3::new(5.0, 0.0, 0.0), boxes_only());
    let mut alice_client = ClientMirror::default();
    let mut bob_client = ClientMirror::default();

    for step in 0..12 {
        let x = (step as f32 * 0.7).sin() * 4.0;
        world
            .update(|w| w.set_local_transform(cell, Transform::from_position(Vec3::new(x, 0.0, 0.0))))
            .unwrap();
        // Bob revalidates half as often as Alice.
        alice.revalidate(&world).unwrap();
        if step % 2 == 0 {
            bob.revalidate(&world).unwrap();
        }
        alice_client.apply_all(&transport.take(alice.viewer()));
        bob_client.apply_all(&transport.take(bob.viewer()));
    }

    // Root plus the box, each loaded exactly once.
    assert_eq!(alice_client.loads, 2);
    assert_eq!(bob_client.loads, 2);
    let latest = world.with(|w| w.get(cell).map(|c| c.transform_version()));
    assert_eq!(alice.entry(cell).map(|e| e.transform_version), latest);
    assert!(bob.entry(cell).unwrap().transform_version <= latest.unwrap());
}

#[test]
fn reparented_cell_gets_content_update() {
    let world = new_world();
    let transport = Arc::new(MemoryTransport::new());
    let (a, b, child) = world.update(|w| {
        let a = w.spawn(box_at(Vec3::new(2.0, 0.0, 0.0))).unwrap();
        let b = w.spawn(box_at(Vec3::new(-2.0, 0.0, 0.0))).unwrap();
        let child = w.create_cell(box_at(Vec3::ZERO));
        w.add_child(a, child).unwrap();
        (a, b, child)
    });
    let mut cache = viewer_at(&world, &transport, "alice", Vec3::ZERO, boxes_only());
    cache.revalidate(&world).unwrap();
    transport.take(cache.viewer());

    world.update(|w| {
        w.remove_child(a, child).unwrap();
        w.add_child(b, child).unwrap();
    });
    cache.revalidate(&world).unwrap();

    let ops = transport.take(cache.viewer());
    assert_eq!(of_kind(&ops, OpKind::UpdateContent), vec![child]);
    match ops.iter().find(|op| op.kind() == OpKind::UpdateContent) {
        Some(CellOp::UpdateContent(d)) => assert_eq!(d.parent, Some(b)),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn nested_cells_load_parents_first() {
    let world = new_world();
    let transport = Arc::new(MemoryTransport::new());
    let chain = world.update(|w| {
        let mut ids = Vec::new();
        // Built bottom-up so ids run opposite to depth.
        let mut below: Option<CellId> = None;
        for _ in 0..4 {
            let id = w.create_cell(box_at(Vec3::new(1.0, 0.0, 0.0)));
            if let Some(child) = below {
                w.add_child(id, child).unwrap();
            }
            ids.push(id);
            below = Some(id);
        }
        w.add_child(w.root(), ids[3]).unwrap();
        ids
    });
    let mut cache = viewer_at(&world, &transport, "alice", Vec3::ZERO, boxes_only());
    cache.revalidate(&world).unwrap();
    let loads = of_kind(&transport.take(cache.viewer()), OpKind::Load);
    let root = world.with(|w| w.root());
    let expected: Vec<CellId> = std::iter::once(root).chain(chain.iter().rev().copied()).collect();
    assert_eq!(loads, expected);

    world.update(|w| w.destroy(chain[3])).unwrap();
    cache.revalidate(&world).unwrap();
    let deletes = of_kind(&transport.take(cache.viewer()), OpKind::Delete);
    assert_eq!(deletes, chain);
}

#[test]
fn driver_logout_stops_delivery() {
    let world = new_world();
    let transport = Arc::new(MemoryTransport::new());
    let driver = RevalidationDriver::new(world.clone(), DriverConfig::default());
    let viewer = driver.login(viewer_at(&world, &transport, "alice", Vec3::ZERO, boxes_only()));
    world.update(|w| w.spawn(box_at(Vec3::ONE))).unwrap();
    driver.revalidate_all();
    assert_eq!(transport.take(viewer).len(), 2);

    driver.logout(viewer);
    world.update(|w| w.spawn(box_at(Vec3::ONE))).unwrap();
    driver.revalidate_all();
    assert!(transport.take(viewer).is_empty());
}

#[test]
fn content_only_change_skips_transform_update() {
    let world = new_world();
    let transport = Arc::new(MemoryTransport::new());
    let cell = world.update(|w| w.spawn(box_at(Vec3::ZERO))).unwrap();
    let mut cache = viewer_at(&world, &transport, "alice", Vec3::ZERO, boxes_only());
    cache.revalidate(&world).unwrap();
    transport.take(cache.viewer());

    world.update(|w| w.set_name(cell, "crate")).unwrap();
    cache.revalidate(&world).unwrap();
    let ops = transport.take(cache.viewer());
    assert_eq!(ops.len(), 1);
    match &ops[0] {
        CellOp::UpdateContent(d) => assert_eq!(d.name, "crate"),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn out_of_range_parent_loads_before_in_range_child() {
    let world = new_world();
    let transport = Arc::new(MemoryTransport::new());
    let (parent, child) = world.update(|w| {
        let parent = w.spawn(box_at(Vec3::new(100.0, 0.0, 0.0))).unwrap();
        // World position: the origin.
        let child = w.create_cell(box_at(Vec3::new(-100.0, 0.0, 0.0)));
        w.add_child(parent, child).unwrap();
        (parent, child)
    });
    let mut cache = viewer_at(&world, &transport, "alice", Vec3::ZERO, boxes_only());
    let mut client = ClientMirror::default();

    cache.revalidate(&world).unwrap();
    let ops = transport.take(cache.viewer());
    client.apply_all(&ops);
    let root = world.with(|w| w.root());
    assert_eq!(of_kind(&ops, OpKind::Load), vec![root, parent, child]);

    // The parent stays loaded as long as the child does.
    cache.revalidate(&world).unwrap();
    assert!(transport.take(cache.viewer()).is_empty());
    assert!(cache.entry(parent).is_some());

    world
        .update(|w| w.set_local_transform(child, Transform::default()))
        .unwrap();
    cache.revalidate(&world).unwrap();
    let ops = transport.take(cache.viewer());
    client.apply_all(&ops);
    assert_eq!(ops, vec![CellOp::Unload(child), CellOp::Unload(parent)]);
    assert_eq!(client.loaded(), BTreeSet::from([root]));
}

#[test]
fn denied_ancestor_hides_descendants_in_range() {
    let world = new_world();
    let transport = Arc::new(MemoryTransport::new());
    let (parent, child) = world.update(|w| {
        let parent = w.spawn(box_at(Vec3::new(100.0, 0.0, 0.0))).unwrap();
        let child = w.create_cell(box_at(Vec3::new(-98.0, 0.0, 0.0)));
        w.add_child(parent, child).unwrap();
        (parent, child)
    });
    let deny = Arc::new(DenyList::new());
    let mut cache = viewer_at(&world, &transport, "alice", Vec3::ZERO, deny.clone());
    cache.revalidate(&world).unwrap();
    transport.take(cache.viewer());

    deny.deny(cache.viewer(), parent);
    cache.revalidate(&world).unwrap();
    assert_eq!(
        transport.take(cache.viewer()),
        vec![CellOp::Unload(child), CellOp::Unload(parent)]
    );
}

#[test]
fn failed_delivery_commits_and_next_cycle_is_quiet() {
    let world = new_world();
    let transport = Arc::new(MemoryTransport::new());
    let mut cache = viewer_at(&world, &transport, "alice", Vec3::ZERO, boxes_only());
    cache.revalidate(&world).unwrap();
    transport.take(cache.viewer());

    transport.disconnect(cache.viewer());
    let cell = world.update(|w| w.spawn(box_at(Vec3::new(5.0, 0.0, 0.0)))).unwrap();
    let stats = cache.revalidate(&world).unwrap();
    assert_eq!(stats.loads, 1);
    assert_eq!(stats.delivery_failures, 1);
    assert!(cache.entry(cell).is_some());
    assert_eq!(transport.batch_count(cache.viewer()), 0);

    // Resync after a lost batch belongs to the transport, not the cache.
    transport.reconnect(cache.viewer());
    let stats = cache.revalidate(&world).unwrap();
    assert_eq!(stats.op_count(), 0);
    assert_eq!(stats.delivery_failures, 0);
    assert!(transport.take(cache.viewer()).is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn chunked_delivery_keeps_order_across_cycles() {
    let world = new_world();
    let transport = Arc::new(MemoryTransport::new());
    let avatar = world.update(|w| w.spawn(avatar_at(Vec3::ZERO))).unwrap();
    let cells: Vec<CellId> = world.update(|w| {
        (0..12)
            .map(|i| w.spawn(box_at(Vec3::new(i as f32 * 3.0 - 18.0, 0.0, 0.0))).unwrap())
            .collect()
    });
    let identity = ViewerIdentity::new("alice");
    let viewer = identity.id;
    let scheduler = SchedulerKind::Chunked { chunk_size: 4 }
        .build(viewer, transport.clone())
        .unwrap();
    let config = CacheConfig {
        radius: RADIUS,
        ..CacheConfig::default()
    };
    let mut cache = ViewerCache::new(identity, avatar, config, Arc::new(AllowAll), scheduler);
    cache.login();

    let mut scheduled = 0;
    for step in 0..6 {
        world.update(|w| {
            for (i, id) in cells.iter().enumerate().skip(step % 3).step_by(3) {
                if !w.contains(*id) {
                    continue;
                }
                let x = i as f32 * 3.0 - 18.0 + step as f32 * 5.0;
                w.set_local_transform(*id, Transform::from_position(Vec3::new(x, 0.0, 0.0)))
                    .unwrap();
            }
            if step == 2 {
                w.destroy(cells[6]).unwrap();
            }
        });
        scheduled += cache.revalidate(&world).unwrap().op_count();
    }
    assert!(scheduled > 0);

    tokio::time::timeout(Duration::from_secs(5), async {
        while transport.ops(viewer).len() < scheduled {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("chunked queue drained");

    assert!(transport.batches(viewer).iter().all(|b| b.len() <= 4));
    let mut client = ClientMirror::default();
    client.apply_all(&transport.ops(viewer));
    assert_eq!(transport.ops(viewer).len(), scheduled);
    assert_eq!(client.loaded(), cache.cached_cells());
}
