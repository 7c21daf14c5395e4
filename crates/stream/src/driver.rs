//! Periodic revalidation of every logged-in viewer.
//!
//! Two modes with the same observable behaviour: one periodic task per
//! viewer, or one shared task fanning out over all viewers with bounded
//! concurrency. Cycles run on the blocking pool since they hold the world's
//! read lock.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use worldspace_common::{CellId, ViewerId};
use worldspace_kernel::SharedWorld;

use crate::cache::ViewerCache;
use crate::config::{DriverConfig, DriverMode};
use crate::error::CacheError;
use crate::stats::{CycleObserver, CycleStats};

#[derive(Clone)]
struct ViewerSlot {
    cache: Arc<Mutex<ViewerCache>>,
    active: Arc<AtomicBool>,
}

/// What a cycle needs besides the viewer itself.
struct CycleContext {
    world: SharedWorld,
    observer: Option<Arc<dyn CycleObserver>>,
    slow_cycle: Duration,
}

impl CycleContext {
    /// Run one cycle. `None` when the viewer is already logged out.
    fn run(&self, viewer: ViewerId, slot: &ViewerSlot) -> Option<Result<CycleStats, CacheError>> {
        if !slot.active.load(Ordering::Acquire) {
            return None;
        }
        let mut cache = slot.cache.lock().unwrap_or_else(PoisonError::into_inner);
        match cache.revalidate(&self.world) {
            Ok(stats) => {
                if stats.total_time > self.slow_cycle {
                    tracing::warn!(
                        %viewer,
                        elapsed = ?stats.total_time,
                        threshold = ?self.slow_cycle,
                        "slow revalidation cycle"
                    );
                }
                if !stats.discarded {
                    if let Some(observer) = &self.observer {
                        observer.on_cycle(viewer, &stats);
                    }
                }
                Some(Ok(stats))
            }
            Err(CacheError::NotActive(_)) => None,
            Err(err) => {
                tracing::error!(%viewer, %err, "revalidation cycle failed");
                if let Some(observer) = &self.observer {
                    observer.on_failure(viewer, &err);
                }
                Some(Err(err))
            }
        }
    }
}

struct Running {
    handle: Handle,
    tasks: Vec<JoinHandle<()>>,
}

pub struct RevalidationDriver {
    world: SharedWorld,
    config: DriverConfig,
    observer: Option<Arc<dyn CycleObserver>>,
    viewers: Arc<Mutex<BTreeMap<ViewerId, ViewerSlot>>>,
    running: Mutex<Option<Running>>,
}

impl RevalidationDriver {
    pub fn new(world: SharedWorld, config: DriverConfig) -> Self {
        Self {
            world,
            config,
            observer: None,
            viewers: Arc::new(Mutex::new(BTreeMap::new())),
            running: Mutex::new(None),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn CycleObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn world(&self) -> &SharedWorld {
        &self.world
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    fn context(&self) -> Arc<CycleContext> {
        Arc::new(CycleContext {
            world: self.world.clone(),
            observer: self.observer.clone(),
            slow_cycle: self.config.slow_cycle(),
        })
    }

    fn slots(&self) -> MutexGuard<'_, BTreeMap<ViewerId, ViewerSlot>> {
        self.viewers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a viewer, logging its cache in if needed. Once started, a
    /// per-viewer driver begins scheduling its cycles right away.
    pub fn login(&self, mut cache: ViewerCache) -> ViewerId {
        if !cache.is_active() {
            cache.login();
        }
        let viewer = cache.viewer();
        let slot = ViewerSlot {
            active: cache.activity(),
            cache: Arc::new(Mutex::new(cache)),
        };
        if let Some(previous) = self.slots().insert(viewer, slot.clone()) {
            previous.active.store(false, Ordering::Release);
        }

        if self.config.mode == DriverMode::PerViewer {
            let mut running = self.running();
            if let Some(running) = running.as_mut() {
                let task = spawn_viewer_task(&running.handle, self.context(), &self.config, viewer, slot);
                running.tasks.retain(|t| !t.is_finished());
                running.tasks.push(task);
            }
        }
        tracing::debug!(%viewer, mode = ?self.config.mode, "viewer added to driver");
        viewer
    }

    /// Remove a viewer. A cycle already running for it completes and its
    /// output is discarded; no new cycles are scheduled.
    pub fn logout(&self, viewer: ViewerId) -> bool {
        let Some(slot) = self.slots().remove(&viewer) else {
            return false;
        };
        slot.active.store(false, Ordering::Release);
        match slot.cache.try_lock() {
            Ok(mut cache) => cache.logout(),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().logout(),
            Err(TryLockError::WouldBlock) => {
                tracing::debug!(%viewer, "logout raced an in-flight cycle");
            }
        }
        tracing::debug!(%viewer, "viewer removed from driver");
        true
    }

    pub fn viewer_count(&self) -> usize {
        self.slots().len()
    }

    pub fn viewers(&self) -> Vec<ViewerId> {
        self.slots().keys().copied().collect()
    }

    /// Cells currently cached for `viewer`.
    pub fn cached_cells(&self, viewer: ViewerId) -> Option<BTreeSet<CellId>> {
        let slot = self.slots().get(&viewer).cloned()?;
        let cache = slot.cache.lock().unwrap_or_else(PoisonError::into_inner);
        Some(cache.cached_cells())
    }

    /// Run one cycle for every viewer on the calling thread, in viewer id
    /// order.
    pub fn revalidate_all(&self) -> Vec<(ViewerId, Result<CycleStats, CacheError>)> {
        let ctx = self.context();
        snapshot(&self.viewers)
            .into_iter()
            .filter_map(|(viewer, slot)| ctx.run(viewer, &slot).map(|r| (viewer, r)))
            .collect()
    }

    pub fn is_running(&self) -> bool {
        self.running().is_some()
    }

    /// Start periodic revalidation on `handle`. Calling it again while
    /// running does nothing.
    pub fn start(&self, handle: &Handle) {
        let mut running = self.running();
        if running.is_some() {
            return;
        }
        let tasks = match self.config.mode {
            DriverMode::PerViewer => snapshot(&self.viewers)
                .into_iter()
                .map(|(viewer, slot)| spawn_viewer_task(handle, self.context(), &self.config, viewer, slot))
                .collect(),
            DriverMode::Shared => vec![spawn_shared_task(
                handle,
                self.context(),
                &self.config,
                Arc::clone(&self.viewers),
            )],
        };
        tracing::info!(
            mode = ?self.config.mode,
            interval = ?self.config.interval(),
            viewers = self.viewer_count(),
            "revalidation driver started"
        );
        *running = Some(Running {
            handle: handle.clone(),
            tasks,
        });
    }

    /// Stop all periodic tasks. Viewers stay registered.
    pub fn shutdown(&self) {
        if let Some(running) = self.running().take() {
            for task in &running.tasks {
                task.abort();
            }
            tracing::info!(tasks = running.tasks.len(), "revalidation driver stopped");
        }
    }
}

impl Drop for RevalidationDriver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn snapshot(viewers: &Mutex<BTreeMap<ViewerId, ViewerSlot>>) -> Vec<(ViewerId, ViewerSlot)> {
    viewers
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .iter()
        .map(|(id, slot)| (*id, slot.clone()))
        .collect()
}

fn cycle_ticker(period: Duration) -> tokio::time::Interval {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

fn spawn_viewer_task(
    handle: &Handle,
    ctx: Arc<CycleContext>,
    config: &DriverConfig,
    viewer: ViewerId,
    slot: ViewerSlot,
) -> JoinHandle<()> {
    let initial_delay = config.initial_delay();
    let interval = config.interval();
    handle.spawn(async move {
        tokio::time::sleep(initial_delay).await;
        let mut ticker = cycle_ticker(interval);
        loop {
            ticker.tick().await;
            if !slot.active.load(Ordering::Acquire) {
                break;
            }
            let ctx = Arc::clone(&ctx);
            let cycle_slot = slot.clone();
            if let Err(err) = tokio::task::spawn_blocking(move || ctx.run(viewer, &cycle_slot)).await {
                tracing::error!(%viewer, %err, "revalidation task panicked");
            }
        }
        tracing::debug!(%viewer, "viewer task stopped");
    })
}

fn spawn_shared_task(
    handle: &Handle,
    ctx: Arc<CycleContext>,
    config: &DriverConfig,
    viewers: Arc<Mutex<BTreeMap<ViewerId, ViewerSlot>>>,
) -> JoinHandle<()> {
    let initial_delay = config.initial_delay();
    let interval = config.interval();
    let permits = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
    handle.spawn(async move {
        tokio::time::sleep(initial_delay).await;
        let mut ticker = cycle_ticker(interval);
        loop {
            ticker.tick().await;
            let mut cycles = JoinSet::new();
            for (viewer, slot) in snapshot(&viewers) {
                let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                    return;
                };
                let ctx = Arc::clone(&ctx);
                cycles.spawn_blocking(move || {
                    let _permit = permit;
                    ctx.run(viewer, &slot);
                });
            }
            while let Some(joined) = cycles.join_next().await {
                if let Err(err) = joined {
                    tracing::error!(%err, "shared revalidation task panicked");
                }
            }
        }
    })
}
