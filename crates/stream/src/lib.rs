//! Streaming: per-viewer cell caches, revalidation diffs and delivery.
//!
//! # Invariants
//! - A viewer never receives two LOADs for a cell without an UNLOAD or
//!   DELETE in between.
//! - Versions delivered for a cell only increase while it stays loaded.
//! - Parents load before their children; children unload first.
//! - A failed or discarded cycle leaves the viewer's cache as it was.
//! - Cells load/unload without corrupting world truth: revalidation only
//!   reads the world.

mod access;
mod cache;
mod config;
mod driver;
mod error;
mod op;
mod scheduler;
mod stats;
mod transport;

pub use access::{AccessFilter, AllowAll, DenyList, ViewerIdentity};
pub use cache::{CacheEntry, CycleDiff, ViewerCache, ViewerState};
pub use config::{
    CacheConfig, DEFAULT_CHUNK_SIZE, DriverConfig, DriverMode, SchedulerKind, StreamSettings,
};
pub use driver::RevalidationDriver;
pub use error::{CacheError, ConfigError, TransportError};
pub use op::{CellDescriptor, CellOp, OpKind};
pub use scheduler::{ChunkQueueHandle, ChunkedScheduler, ImmediateScheduler, RevalidationScheduler};
pub use stats::{CycleObserver, CycleStats};
pub use transport::{MemoryTransport, Transport};
