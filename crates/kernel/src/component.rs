use std::any::Any;

use worldspace_common::{CellId, Transform};

/// Per-type capability attached to a cell.
///
/// Components follow the owning cell's liveness: `set_live` is called every
/// time the cell becomes live or stops being live, before its children are
/// visited.
pub trait CellComponent: Send + Sync {
    /// Short name used in errors and logs.
    fn name(&self) -> &'static str;

    fn set_live(&mut self, cell: CellId, live: bool);

    fn as_any(&self) -> &dyn Any;
}

/// Receives the new local and world transform of a cell after each
/// successful transform change while the cell is live.
///
/// Listeners run inside the world's exclusive update section and must not
/// block.
pub trait TransformChangeListener: Send + Sync {
    fn transform_changed(&self, cell: CellId, local: &Transform, world: &Transform);
}

impl<F> TransformChangeListener for F
where
    F: Fn(CellId, &Transform, &Transform) + Send + Sync,
{
    fn transform_changed(&self, cell: CellId, local: &Transform, world: &Transform) {
        self(cell, local, world)
    }
}

/// Handle returned when registering a transform listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub u64);

/// Channel-bearing capability: the cell's message channel is open exactly
/// while the cell is live.
#[derive(Debug, Clone, Default)]
pub struct ChannelComponent {
    channel: Option<String>,
    opened: u64,
}

impl ChannelComponent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Name of the open channel, if any.
    pub fn channel(&self) -> Option<&str> {
        self.channel.as_deref()
    }

    pub fn is_open(&self) -> bool {
        self.channel.is_some()
    }

    /// How many times the channel has been opened over the cell's lifetime.
    pub fn open_count(&self) -> u64 {
        self.opened
    }
}

impl CellComponent for ChannelComponent {
    fn name(&self) -> &'static str {
        "channel"
    }

    fn set_live(&mut self, cell: CellId, live: bool) {
        if live {
            let name = format!("cell-{cell}");
            tracing::debug!(%cell, channel = %name, "opening cell channel");
            self.channel = Some(name);
            self.opened += 1;
        } else if let Some(name) = self.channel.take() {
            tracing::debug!(%cell, channel = %name, "closing cell channel");
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
