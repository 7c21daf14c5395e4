use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};

use worldspace_common::ViewerId;

use crate::error::TransportError;
use crate::op::CellOp;

/// Outbound path to viewers' clients. Each call delivers one ordered batch.
pub trait Transport: Send + Sync {
    fn send(&self, viewer: ViewerId, ops: Vec<CellOp>) -> Result<(), TransportError>;
}

/// In-process transport that records every delivered batch per viewer.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    inner: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    batches: HashMap<ViewerId, Vec<Vec<CellOp>>>,
    disconnected: HashSet<ViewerId>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// All batches delivered to `viewer` so far, oldest first.
    pub fn batches(&self, viewer: ViewerId) -> Vec<Vec<CellOp>> {
        self.state()
            .batches
            .get(&viewer)
            .cloned()
            .unwrap_or_default()
    }

    /// All ops delivered to `viewer`, flattened in delivery order.
    pub fn ops(&self, viewer: ViewerId) -> Vec<CellOp> {
        self.batches(viewer).into_iter().flatten().collect()
    }

    /// Remove and return everything delivered to `viewer`.
    pub fn take(&self, viewer: ViewerId) -> Vec<CellOp> {
        self.state()
            .batches
            .remove(&viewer)
            .unwrap_or_default()
            .into_iter()
            .flatten()
            .collect()
    }

    pub fn batch_count(&self, viewer: ViewerId) -> usize {
        self.state().batches.get(&viewer).map_or(0, Vec::len)
    }

    /// Make further sends to `viewer` fail until [`Self::reconnect`].
    pub fn disconnect(&self, viewer: ViewerId) {
        self.state().disconnected.insert(viewer);
    }

    pub fn reconnect(&self, viewer: ViewerId) {
        self.state().disconnected.remove(&viewer);
    }
}

impl Transport for MemoryTransport {
    fn send(&self, viewer: ViewerId, ops: Vec<CellOp>) -> Result<(), TransportError> {
        let mut state = self.state();
        if state.disconnected.contains(&viewer) {
            return Err(TransportError::Disconnected(viewer));
        }
        state.batches.entry(viewer).or_default().push(ops);
        Ok(())
    }
}
