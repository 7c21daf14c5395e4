//! World Kernel: the authoritative cell tree and its spatial partition index.
//!
//! # Invariants
//! - A cell is live iff it is the root or its parent is live.
//! - A live cell has a world transform equal to its parent's world transform
//!   composed with its local transform, and world bounds equal to its local
//!   bounds mapped through that world transform.
//! - A live cell is registered in exactly the spaces its world bounds
//!   intersect; a non-live cell is registered in none.
//! - Structural errors leave the world unchanged.
//! - All state mutations flow through explicit operations on [`World`].

pub mod component;
pub mod error;
pub mod shared;
pub mod space;
pub mod world;

pub use component::{CellComponent, ChannelComponent, ListenerId, TransformChangeListener};
pub use error::CellError;
pub use shared::SharedWorld;
pub use space::{Space, SpaceConfig, SpaceCoord, SpaceId, SpaceIndex};
pub use world::{CellNode, CellSpec, DEFAULT_EVENT_CAPACITY, World, WorldEvent};
