use worldspace_common::CellId;

/// Structural errors from world mutations. Every operation that returns one
/// of these leaves the world exactly as it was before the call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CellError {
    #[error("cell {0} not found")]
    NotFound(CellId),
    #[error("cell {child} already has parent {parent}")]
    MultipleParent { child: CellId, parent: CellId },
    #[error("cell {0} is not movable while live")]
    NotMovable(CellId),
    #[error("cell {0} has no local transform")]
    MissingTransform(CellId),
    #[error("cell {0} has no local bounds")]
    MissingBounds(CellId),
    #[error("attaching {child} under {parent} would create a cycle")]
    WouldCycle { parent: CellId, child: CellId },
    #[error("the world root cannot be reparented or destroyed")]
    RootImmutable,
    #[error("cell {cell} already has a {component} component")]
    DuplicateComponent {
        cell: CellId,
        component: &'static str,
    },
}
