use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use worldspace_common::{Bounds, CellId, Transform};
use worldspace_kernel::CellNode;

/// Snapshot of everything a client needs to instantiate or refresh a cell.
/// Taken at diff time, so later world changes never leak into an op that
/// is already queued.
#[derive(Debug, Clone, PartialEq)]
pub struct CellDescriptor {
    pub id: CellId,
    pub class_name: String,
    pub name: String,
    pub parent: Option<CellId>,
    pub transform: Transform,
    pub bounds: Bounds,
    pub config: Arc<[u8]>,
    pub transform_version: u64,
    pub content_version: u64,
    pub depth: u32,
}

impl CellDescriptor {
    pub fn from_node(node: &CellNode) -> Self {
        Self {
            id: node.id(),
            class_name: node.class_name().to_owned(),
            name: node.name(),
            parent: node.parent(),
            transform: node.local_transform().copied().unwrap_or_default(),
            bounds: node
                .local_bounds()
                .copied()
                .unwrap_or_else(Bounds::unbounded),
            config: Arc::clone(node.config()),
            transform_version: node.transform_version(),
            content_version: node.content_version(),
            depth: node.depth(),
        }
    }
}

/// One client-facing cache operation.
#[derive(Debug, Clone, PartialEq)]
pub enum CellOp {
    Load(CellDescriptor),
    UpdateTransform {
        id: CellId,
        transform_version: u64,
        transform: Transform,
        bounds: Bounds,
    },
    UpdateContent(CellDescriptor),
    /// The cell still exists but left the viewer's admitted set.
    Unload(CellId),
    /// The cell no longer exists.
    Delete(CellId),
}

impl CellOp {
    pub fn cell_id(&self) -> CellId {
        match self {
            Self::Load(d) | Self::UpdateContent(d) => d.id,
            Self::UpdateTransform { id, .. } => *id,
            Self::Unload(id) | Self::Delete(id) => *id,
        }
    }

    pub fn kind(&self) -> OpKind {
        match self {
            Self::Load(_) => OpKind::Load,
            Self::UpdateTransform { .. } => OpKind::UpdateTransform,
            Self::UpdateContent(_) => OpKind::UpdateContent,
            Self::Unload(_) => OpKind::Unload,
            Self::Delete(_) => OpKind::Delete,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OpKind {
    Load,
    UpdateTransform,
    UpdateContent,
    Unload,
    Delete,
}

impl OpKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Load => "LOAD",
            Self::UpdateTransform => "UPDATE_TRANSFORM",
            Self::UpdateContent => "UPDATE_CONTENT",
            Self::Unload => "UNLOAD",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
