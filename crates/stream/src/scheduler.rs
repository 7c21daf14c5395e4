//! Delivery strategies between a viewer's diff and its transport.
//!
//! Every strategy delivers each scheduled op exactly once, in submission
//! order, across cycles.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::runtime::Handle;
use tokio::sync::Notify;
use worldspace_common::ViewerId;

use crate::config::SchedulerKind;
use crate::error::{ConfigError, TransportError};
use crate::op::CellOp;
use crate::transport::Transport;

pub trait RevalidationScheduler: Send {
    fn name(&self) -> &'static str;

    fn start_cycle(&mut self);

    fn schedule(&mut self, op: CellOp) -> Result<(), TransportError>;

    fn end_cycle(&mut self) -> Result<(), TransportError>;
}

impl SchedulerKind {
    /// Build a scheduler delivering to `viewer`. The chunked strategy needs
    /// to be called from inside a tokio runtime.
    pub fn build(
        self,
        viewer: ViewerId,
        transport: Arc<dyn Transport>,
    ) -> Result<Box<dyn RevalidationScheduler>, ConfigError> {
        Ok(match self {
            Self::Immediate => Box::new(ImmediateScheduler::new(viewer, transport)),
            Self::Aggregated => Box::new(ImmediateScheduler::aggregated(viewer, transport)),
            Self::Chunked { chunk_size } => {
                let handle = Handle::try_current().map_err(|_| {
                    ConfigError::Invalid("chunked scheduler requires a tokio runtime".into())
                })?;
                Box::new(ChunkedScheduler::new(viewer, transport, chunk_size, handle))
            }
        })
    }
}

/// Sends as ops are produced, or once per cycle when coalescing.
pub struct ImmediateScheduler {
    viewer: ViewerId,
    transport: Arc<dyn Transport>,
    coalesce: bool,
    batch: Vec<CellOp>,
}

impl ImmediateScheduler {
    pub fn new(viewer: ViewerId, transport: Arc<dyn Transport>) -> Self {
        Self {
            viewer,
            transport,
            coalesce: false,
            batch: Vec::new(),
        }
    }

    /// Coalesce each cycle into a single batch.
    pub fn aggregated(viewer: ViewerId, transport: Arc<dyn Transport>) -> Self {
        Self {
            coalesce: true,
            ..Self::new(viewer, transport)
        }
    }
}

impl RevalidationScheduler for ImmediateScheduler {
    fn name(&self) -> &'static str {
        if self.coalesce { "aggregated" } else { "immediate" }
    }

    fn start_cycle(&mut self) {
        self.batch.clear();
    }

    fn schedule(&mut self, op: CellOp) -> Result<(), TransportError> {
        if self.coalesce {
            self.batch.push(op);
            Ok(())
        } else {
            self.transport.send(self.viewer, vec![op])
        }
    }

    fn end_cycle(&mut self) -> Result<(), TransportError> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.batch);
        self.transport.send(self.viewer, batch)
    }
}

#[derive(Debug, Default)]
struct Pending {
    ops: VecDeque<CellOp>,
    draining: bool,
}

#[derive(Debug, Default)]
struct ChunkQueue {
    pending: Mutex<Pending>,
    idle: Notify,
    failures: AtomicUsize,
}

impl ChunkQueue {
    fn lock(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Observes a chunked scheduler's queue from outside.
#[derive(Debug, Clone)]
pub struct ChunkQueueHandle {
    queue: Arc<ChunkQueue>,
}

impl ChunkQueueHandle {
    pub fn pending(&self) -> usize {
        self.queue.lock().ops.len()
    }

    pub fn is_idle(&self) -> bool {
        let pending = self.queue.lock();
        pending.ops.is_empty() && !pending.draining
    }

    /// Batches the background task failed to deliver.
    pub fn delivery_failures(&self) -> usize {
        self.queue.failures.load(Ordering::Relaxed)
    }

    /// Wait until the queue is empty and no drain task is running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.queue.idle.notified();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }
}

/// Appends ops to a pending queue drained by a background task, at most
/// `chunk_size` ops per unit of work. At most one drain task runs per queue,
/// so delivery order is submission order.
pub struct ChunkedScheduler {
    viewer: ViewerId,
    transport: Arc<dyn Transport>,
    chunk_size: usize,
    queue: Arc<ChunkQueue>,
    handle: Handle,
}

impl ChunkedScheduler {
    pub fn new(
        viewer: ViewerId,
        transport: Arc<dyn Transport>,
        chunk_size: usize,
        handle: Handle,
    ) -> Self {
        Self {
            viewer,
            transport,
            chunk_size: chunk_size.max(1),
            queue: Arc::new(ChunkQueue::default()),
            handle,
        }
    }

    pub fn queue_handle(&self) -> ChunkQueueHandle {
        ChunkQueueHandle {
            queue: Arc::clone(&self.queue),
        }
    }
}

impl RevalidationScheduler for ChunkedScheduler {
    fn name(&self) -> &'static str {
        "chunked"
    }

    fn start_cycle(&mut self) {}

    fn schedule(&mut self, op: CellOp) -> Result<(), TransportError> {
        self.queue.lock().ops.push_back(op);
        Ok(())
    }

    fn end_cycle(&mut self) -> Result<(), TransportError> {
        let mut pending = self.queue.lock();
        if pending.draining || pending.ops.is_empty() {
            return Ok(());
        }
        pending.draining = true;
        drop(pending);
        spawn_chunk(ChunkTask {
            viewer: self.viewer,
            transport: Arc::clone(&self.transport),
            chunk_size: self.chunk_size,
            queue: Arc::clone(&self.queue),
            handle: self.handle.clone(),
        });
        Ok(())
    }
}

struct ChunkTask {
    viewer: ViewerId,
    transport: Arc<dyn Transport>,
    chunk_size: usize,
    queue: Arc<ChunkQueue>,
    handle: Handle,
}

/// Deliver one chunk, then reschedule while work remains.
fn spawn_chunk(task: ChunkTask) {
    let handle = task.handle.clone();
    handle.spawn(async move {
        let batch: Vec<CellOp> = {
            let mut pending = task.queue.lock();
            let n = task.chunk_size.min(pending.ops.len());
            pending.ops.drain(..n).collect()
        };
        if !batch.is_empty() {
            let len = batch.len();
            if let Err(err) = task.transport.send(task.viewer, batch) {
                task.queue.failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(viewer = %task.viewer, %err, ops = len, "chunk delivery failed");
            } else {
                tracing::trace!(viewer = %task.viewer, ops = len, "chunk delivered");
            }
        }

        let mut pending = task.queue.lock();
        if pending.ops.is_empty() {
            pending.draining = false;
            drop(pending);
            task.queue.idle.notify_waiters();
        } else {
            drop(pending);
            spawn_chunk(task);
        }
    });
}
