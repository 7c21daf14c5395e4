use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::world::World;

/// A world shared between the mutation path and revalidation workers.
///
/// Readers see a consistent snapshot of transforms, bounds, versions and
/// partition membership; writers hold exclusive access for the whole of a
/// structural or transform change. A panic while holding the lock does not
/// make the world unusable: the guard is recovered, since every `World`
/// mutation validates before it changes anything.
#[derive(Debug, Clone, Default)]
pub struct SharedWorld {
    inner: Arc<RwLock<World>>,
}

impl SharedWorld {
    pub fn new(world: World) -> Self {
        Self {
            inner: Arc::new(RwLock::new(world)),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, World> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, World> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` with shared access.
    pub fn with<R>(&self, f: impl FnOnce(&World) -> R) -> R {
        f(&self.read())
    }

    /// Run `f` with exclusive access.
    pub fn update<R>(&self, f: impl FnOnce(&mut World) -> R) -> R {
        f(&mut self.write())
    }
}

impl From<World> for SharedWorld {
    fn from(world: World) -> Self {
        Self::new(world)
    }
}
