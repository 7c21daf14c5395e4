use std::collections::BTreeSet;
use std::sync::{PoisonError, RwLock};

use worldspace_common::{CellId, ViewerId};

use crate::op::CellDescriptor;

/// Who a viewer cache belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewerIdentity {
    pub id: ViewerId,
    pub username: String,
}

impl ViewerIdentity {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            id: ViewerId::new(),
            username: username.into(),
        }
    }
}

/// Decides whether a viewer may see a candidate cell. Called once per
/// candidate per cycle, concurrently for different viewers.
pub trait AccessFilter: Send + Sync {
    fn can_view(&self, viewer: &ViewerIdentity, cell: &CellDescriptor) -> bool;
}

impl<F> AccessFilter for F
where
    F: Fn(&ViewerIdentity, &CellDescriptor) -> bool + Send + Sync,
{
    fn can_view(&self, viewer: &ViewerIdentity, cell: &CellDescriptor) -> bool {
        self(viewer, cell)
    }
}

/// Admits every candidate.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AccessFilter for AllowAll {
    fn can_view(&self, _viewer: &ViewerIdentity, _cell: &CellDescriptor) -> bool {
        true
    }
}

/// Mutable deny rules: per viewer, or for everyone.
#[derive(Debug, Default)]
pub struct DenyList {
    rules: RwLock<BTreeSet<(Option<ViewerId>, CellId)>>,
}

impl DenyList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deny(&self, viewer: ViewerId, cell: CellId) {
        self.write().insert((Some(viewer), cell));
    }

    pub fn deny_everyone(&self, cell: CellId) {
        self.write().insert((None, cell));
    }

    /// Drop every rule mentioning `cell`.
    pub fn allow(&self, cell: CellId) {
        self.write().retain(|(_, c)| *c != cell);
    }

    pub fn len(&self) -> usize {
        self.rules.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeSet<(Option<ViewerId>, CellId)>> {
        self.rules.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl AccessFilter for DenyList {
    fn can_view(&self, viewer: &ViewerIdentity, cell: &CellDescriptor) -> bool {
        let rules = self.rules.read().unwrap_or_else(PoisonError::into_inner);
        !rules.contains(&(None, cell.id)) && !rules.contains(&(Some(viewer.id), cell.id))
    }
}
