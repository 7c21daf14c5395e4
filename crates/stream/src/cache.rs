//! Per-viewer cache of loaded cells and the revalidation diff.
//!
//! # Invariants
//! - An entry exists for a cell iff the viewer's client has it loaded,
//!   as far as committed cycles are concerned.
//! - Entries only move forward: stored versions are always the versions
//!   last sent to the client.
//! - A cycle either commits all of its changes or none of them.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use worldspace_common::{Bounds, CellId, ViewerId};
use worldspace_kernel::{SharedWorld, World};

use crate::access::{AccessFilter, ViewerIdentity};
use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::op::{CellDescriptor, CellOp};
use crate::scheduler::RevalidationScheduler;
use crate::stats::CycleStats;

/// What the viewer's client was last told about one cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheEntry {
    pub transform_version: u64,
    pub content_version: u64,
    /// Tree depth when last seen, used to unload children first.
    pub depth: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewerState {
    LoggedOut,
    Active,
}

/// Result of comparing the world against the cache. Pure: computing it
/// changes nothing.
#[derive(Debug, Clone, Default)]
pub struct CycleDiff {
    pub ops: Vec<CellOp>,
    pub candidates: usize,
    pub admitted: usize,
    pub query_time: Duration,
    pub diff_time: Duration,
    upserts: Vec<(CellId, CacheEntry)>,
    removals: Vec<CellId>,
}

pub struct ViewerCache {
    identity: ViewerIdentity,
    view_cell: CellId,
    config: CacheConfig,
    access: Arc<dyn AccessFilter>,
    scheduler: Box<dyn RevalidationScheduler>,
    entries: BTreeMap<CellId, CacheEntry>,
    state: ViewerState,
    active: Arc<AtomicBool>,
    cycles: u64,
}

impl ViewerCache {
    /// A logged-out cache bound to `view_cell`, the cell whose world
    /// position centres the viewer's proximity sphere.
    pub fn new(
        identity: ViewerIdentity,
        view_cell: CellId,
        config: CacheConfig,
        access: Arc<dyn AccessFilter>,
        scheduler: Box<dyn RevalidationScheduler>,
    ) -> Self {
        Self {
            identity,
            view_cell,
            config,
            access,
            scheduler,
            entries: BTreeMap::new(),
            state: ViewerState::LoggedOut,
            active: Arc::new(AtomicBool::new(false)),
            cycles: 0,
        }
    }

    pub fn identity(&self) -> &ViewerIdentity {
        &self.identity
    }

    pub fn viewer(&self) -> ViewerId {
        self.identity.id
    }

    pub fn view_cell(&self) -> CellId {
        self.view_cell
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn state(&self) -> ViewerState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == ViewerState::Active && self.active.load(Ordering::Acquire)
    }

    /// Shared flag cleared on logout; lets another thread log the viewer
    /// out while a cycle is running.
    pub fn activity(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.active)
    }

    pub fn scheduler_name(&self) -> &'static str {
        self.scheduler.name()
    }

    pub fn entry(&self, id: CellId) -> Option<&CacheEntry> {
        self.entries.get(&id)
    }

    pub fn cached_cells(&self) -> BTreeSet<CellId> {
        self.entries.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Start a session with an empty cache.
    pub fn login(&mut self) {
        self.entries.clear();
        self.state = ViewerState::Active;
        self.active.store(true, Ordering::Release);
        tracing::info!(viewer = %self.identity.id, user = %self.identity.username, "viewer logged in");
    }

    pub fn logout(&mut self) {
        self.active.store(false, Ordering::Release);
        self.finish_logout();
    }

    /// Rebind the viewer to a different view cell, e.g. a new avatar.
    pub fn set_view_cell(&mut self, view_cell: CellId) {
        self.view_cell = view_cell;
    }

    fn finish_logout(&mut self) {
        if self.state == ViewerState::LoggedOut {
            return;
        }
        self.entries.clear();
        self.state = ViewerState::LoggedOut;
        tracing::info!(viewer = %self.identity.id, user = %self.identity.username, "viewer logged out");
    }

    /// Admit `id` along with every ancestor up to the root, or nothing.
    ///
    /// A cell is only admitted when its whole ancestor chain is, so a loaded
    /// cell always has its parent loaded. Ancestors join the set even when
    /// they are out of range. The root is exempt from the access filter;
    /// any other cell the filter rejects blocks itself and the descendants
    /// walked so far.
    fn admit_chain(
        &self,
        world: &World,
        id: CellId,
        admitted: &mut BTreeMap<CellId, CellDescriptor>,
        blocked: &mut BTreeSet<CellId>,
    ) {
        let root = world.root();
        let mut chain: Vec<CellDescriptor> = Vec::new();
        let mut next = Some(id);
        let reached = loop {
            let Some(current) = next else {
                // Ran off a detached subtree.
                break false;
            };
            if admitted.contains_key(&current) {
                break true;
            }
            if blocked.contains(&current) {
                break false;
            }
            let Some(node) = world.get(current) else {
                break false;
            };
            let descriptor = CellDescriptor::from_node(node);
            if current != root && !self.access.can_view(&self.identity, &descriptor) {
                chain.push(descriptor);
                break false;
            }
            next = node.parent();
            chain.push(descriptor);
            if current == root {
                break true;
            }
        };

        if reached {
            admitted.extend(chain.into_iter().map(|d| (d.id, d)));
        } else {
            blocked.extend(chain.iter().map(|d| d.id));
        }
    }

    /// Compare the admitted set against the cache. The admitted set is
    /// every in-range cell the viewer may see, closed over ancestors.
    ///
    /// LOADs and updates come parents first (ascending depth, then id);
    /// UNLOADs and DELETEs come children first.
    pub fn diff(&self, world: &World) -> Result<CycleDiff, CacheError> {
        let view = world
            .get(self.view_cell)
            .and_then(|cell| cell.world_transform())
            .ok_or(CacheError::ViewUnavailable(self.view_cell))?;
        let volume = Bounds::sphere(view.position, self.config.radius);

        let query_started = Instant::now();
        let candidates = world.query(&volume);
        let mut admitted = BTreeMap::new();
        let mut blocked = BTreeSet::new();
        for id in &candidates {
            self.admit_chain(world, *id, &mut admitted, &mut blocked);
        }
        let query_time = query_started.elapsed();

        let diff_started = Instant::now();
        let admitted_ids: BTreeSet<CellId> = admitted.keys().copied().collect();

        let mut forward: Vec<((u32, CellId, u8), CellOp)> = Vec::new();
        let mut upserts = Vec::new();
        for d in admitted.into_values() {
            let fresh = CacheEntry {
                transform_version: d.transform_version,
                content_version: d.content_version,
                depth: d.depth,
            };
            let key = (d.depth, d.id);
            match self.entries.get(&d.id) {
                None => {
                    upserts.push((d.id, fresh));
                    forward.push(((key.0, key.1, 0), CellOp::Load(d)));
                }
                Some(entry) => {
                    if entry.transform_version != d.transform_version {
                        forward.push((
                            (key.0, key.1, 1),
                            CellOp::UpdateTransform {
                                id: d.id,
                                transform_version: d.transform_version,
                                transform: d.transform,
                                bounds: d.bounds,
                            },
                        ));
                    }
                    let content_changed = entry.content_version != d.content_version;
                    if *entry != fresh {
                        upserts.push((d.id, fresh));
                    }
                    if content_changed {
                        forward.push(((key.0, key.1, 2), CellOp::UpdateContent(d)));
                    }
                }
            }
        }
        forward.sort_by_key(|(key, _)| *key);

        let mut backward: Vec<((Reverse<u32>, Reverse<CellId>), CellOp)> = self
            .entries
            .iter()
            .filter(|(id, _)| !admitted_ids.contains(id))
            .map(|(id, entry)| {
                // Anything still in the world was only filtered out.
                let op = if world.contains(*id) {
                    CellOp::Unload(*id)
                } else {
                    CellOp::Delete(*id)
                };
                ((Reverse(entry.depth), Reverse(*id)), op)
            })
            .collect();
        backward.sort_by_key(|(key, _)| *key);
        let removals = backward.iter().map(|(_, op)| op.cell_id()).collect();

        let ops = forward
            .into_iter()
            .map(|(_, op)| op)
            .chain(backward.into_iter().map(|(_, op)| op))
            .collect();

        Ok(CycleDiff {
            ops,
            candidates: candidates.len(),
            admitted: admitted_ids.len(),
            query_time,
            diff_time: diff_started.elapsed(),
            upserts,
            removals,
        })
    }

    /// Run one revalidation cycle against `world`.
    ///
    /// The diff is computed under the world's read lock and committed only
    /// if it completes; a panic inside it aborts the cycle with
    /// [`CacheError::Aborted`] and leaves the cache untouched. If the viewer
    /// is logged out concurrently, the cycle completes with its output
    /// discarded.
    pub fn revalidate(&mut self, world: &SharedWorld) -> Result<CycleStats, CacheError> {
        if !self.is_active() {
            return Err(CacheError::NotActive(self.identity.id));
        }
        self.cycles += 1;
        let _span = tracing::info_span!(
            "revalidate",
            viewer = %self.identity.id,
            cycle = self.cycles
        )
        .entered();
        let started = Instant::now();

        let diff = {
            let guard = world.read();
            panic::catch_unwind(AssertUnwindSafe(|| self.diff(&guard)))
                .map_err(|payload| CacheError::Aborted(panic_message(payload.as_ref())))??
        };

        let mut stats = CycleStats {
            cycle: self.cycles,
            candidates: diff.candidates,
            admitted: diff.admitted,
            query_time: diff.query_time,
            diff_time: diff.diff_time,
            ..CycleStats::default()
        };

        if !self.active.load(Ordering::Acquire) {
            tracing::debug!(ops = diff.ops.len(), "viewer logged out mid-cycle, discarding");
            self.finish_logout();
            stats.discarded = true;
            stats.total_time = started.elapsed();
            return Ok(stats);
        }

        let apply_started = Instant::now();
        for (id, entry) in &diff.upserts {
            self.entries.insert(*id, *entry);
        }
        for id in &diff.removals {
            self.entries.remove(id);
        }

        self.scheduler.start_cycle();
        for op in diff.ops {
            stats.count(&op);
            tracing::debug!(kind = %op.kind(), cell = %op.cell_id(), "scheduling op");
            if let Err(err) = self.scheduler.schedule(op) {
                stats.delivery_failures += 1;
                tracing::warn!(%err, "op delivery failed");
            }
        }
        if let Err(err) = self.scheduler.end_cycle() {
            stats.delivery_failures += 1;
            tracing::warn!(%err, "batch delivery failed");
        }

        stats.cached = self.entries.len();
        stats.apply_time = apply_started.elapsed();
        stats.total_time = started.elapsed();
        tracing::trace!(
            candidates = stats.candidates,
            admitted = stats.admitted,
            ops = stats.op_count(),
            cached = stats.cached,
            "revalidate complete"
        );
        Ok(stats)
    }
}

impl std::fmt::Debug for ViewerCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewerCache")
            .field("identity", &self.identity)
            .field("view_cell", &self.view_cell)
            .field("state", &self.state)
            .field("entries", &self.entries.len())
            .field("scheduler", &self.scheduler.name())
            .finish_non_exhaustive()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic during diff".to_owned()
    }
}
