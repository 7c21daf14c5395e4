use std::time::Duration;

use serde::Serialize;
use worldspace_common::ViewerId;

use crate::error::CacheError;
use crate::op::{CellOp, OpKind};

/// Counters and timings for one revalidation cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CycleStats {
    pub cycle: u64,
    pub candidates: usize,
    pub admitted: usize,
    pub loads: usize,
    pub transform_updates: usize,
    pub content_updates: usize,
    pub unloads: usize,
    pub deletes: usize,
    /// Entries in the cache after the cycle.
    pub cached: usize,
    pub delivery_failures: usize,
    /// The viewer logged out while the cycle ran; nothing was delivered.
    pub discarded: bool,
    /// Partition query and access filtering.
    pub query_time: Duration,
    /// Comparing admitted cells against the cache.
    pub diff_time: Duration,
    /// Committing the cache and handing ops to the scheduler.
    pub apply_time: Duration,
    pub total_time: Duration,
}

impl CycleStats {
    pub fn count(&mut self, op: &CellOp) {
        match op.kind() {
            OpKind::Load => self.loads += 1,
            OpKind::UpdateTransform => self.transform_updates += 1,
            OpKind::UpdateContent => self.content_updates += 1,
            OpKind::Unload => self.unloads += 1,
            OpKind::Delete => self.deletes += 1,
        }
    }

    pub fn op_count(&self) -> usize {
        self.loads + self.transform_updates + self.content_updates + self.unloads + self.deletes
    }
}

/// Out-of-band consumer of cycle instrumentation. Must not block.
pub trait CycleObserver: Send + Sync {
    fn on_cycle(&self, viewer: ViewerId, stats: &CycleStats);

    fn on_failure(&self, viewer: ViewerId, error: &CacheError) {
        let _ = (viewer, error);
    }
}
