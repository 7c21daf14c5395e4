//! Shared types for the worldspace cell streaming engine: identifiers,
//! transforms and bounding volumes.

mod bounds;
mod types;

pub use bounds::{Aabb, Bounds};
pub use types::{CellId, Transform, ViewerId};
