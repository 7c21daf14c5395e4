//! Developer Tooling: world inspector and revalidation monitoring.
//!
//! # Invariants
//! - Tools only read world state; they never mutate it.

mod inspector;
mod monitor;

pub use inspector::{CellInfo, SpaceInfo, WorldInspector, WorldSummary};
pub use monitor::{DurationWindow, MonitorTotals, RevalidationMonitor};
