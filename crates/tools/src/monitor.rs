use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use worldspace_common::ViewerId;
use worldspace_stream::{CacheError, CycleObserver, CycleStats};

/// Fixed-size ring of recent durations.
#[derive(Debug, Clone)]
pub struct DurationWindow {
    history: Vec<Duration>,
    capacity: usize,
    index: usize,
    filled: bool,
}

impl DurationWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            history: vec![Duration::ZERO; capacity],
            capacity,
            index: 0,
            filled: false,
        }
    }

    pub fn record(&mut self, dt: Duration) {
        self.history[self.index] = dt;
        self.index = (self.index + 1) % self.capacity;
        if self.index == 0 {
            self.filled = true;
        }
    }

    fn window(&self) -> &[Duration] {
        &self.history[..self.count()]
    }

    pub fn average(&self) -> Duration {
        let window = self.window();
        if window.is_empty() {
            return Duration::ZERO;
        }
        window.iter().sum::<Duration>() / window.len() as u32
    }

    pub fn max(&self) -> Duration {
        self.window().iter().copied().max().unwrap_or(Duration::ZERO)
    }

    pub fn min(&self) -> Duration {
        self.window().iter().copied().min().unwrap_or(Duration::ZERO)
    }

    pub fn count(&self) -> usize {
        if self.filled {
            self.capacity
        } else {
            self.index
        }
    }
}

/// Running totals across every observed cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitorTotals {
    pub cycles: u64,
    pub failures: u64,
    pub discarded: u64,
    pub loads: u64,
    pub transform_updates: u64,
    pub content_updates: u64,
    pub unloads: u64,
    pub deletes: u64,
    pub delivery_failures: u64,
}

impl MonitorTotals {
    pub fn ops(&self) -> u64 {
        self.loads + self.transform_updates + self.content_updates + self.unloads + self.deletes
    }
}

impl std::fmt::Display for MonitorTotals {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "cycles={} failures={} discarded={} ops={} (load={} xform={} content={} unload={} delete={}) delivery_failures={}",
            self.cycles,
            self.failures,
            self.discarded,
            self.ops(),
            self.loads,
            self.transform_updates,
            self.content_updates,
            self.unloads,
            self.deletes,
            self.delivery_failures
        )
    }
}

#[derive(Debug)]
struct MonitorState {
    totals: MonitorTotals,
    query: DurationWindow,
    diff: DurationWindow,
    apply: DurationWindow,
    total: DurationWindow,
}

/// Cycle observer that aggregates revalidation timings and op counts, and
/// logs a report every `report_every` cycles.
#[derive(Debug)]
pub struct RevalidationMonitor {
    state: Mutex<MonitorState>,
    report_every: u64,
}

impl RevalidationMonitor {
    pub fn new(window: usize, report_every: u64) -> Self {
        Self {
            state: Mutex::new(MonitorState {
                totals: MonitorTotals::default(),
                query: DurationWindow::new(window),
                diff: DurationWindow::new(window),
                apply: DurationWindow::new(window),
                total: DurationWindow::new(window),
            }),
            report_every,
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn totals(&self) -> MonitorTotals {
        self.state().totals.clone()
    }

    /// Human-readable timing table over the current window.
    pub fn report(&self) -> String {
        let state = self.state();
        let row = |label: &str, w: &DurationWindow| {
            format!(
                "  {label:<6} min={:?} avg={:?} max={:?}\n",
                w.min(),
                w.average(),
                w.max()
            )
        };
        let mut out = format!("{}\n", state.totals);
        out.push_str(&row("query", &state.query));
        out.push_str(&row("diff", &state.diff));
        out.push_str(&row("apply", &state.apply));
        out.push_str(&row("total", &state.total));
        out
    }
}

impl Default for RevalidationMonitor {
    fn default() -> Self {
        Self::new(128, 0)
    }
}

impl CycleObserver for RevalidationMonitor {
    fn on_cycle(&self, viewer: ViewerId, stats: &CycleStats) {
        let cycles = {
            let mut state = self.state();
            let totals = &mut state.totals;
            totals.cycles += 1;
            if stats.discarded {
                totals.discarded += 1;
            }
            totals.loads += stats.loads as u64;
            totals.transform_updates += stats.transform_updates as u64;
            totals.content_updates += stats.content_updates as u64;
            totals.unloads += stats.unloads as u64;
            totals.deletes += stats.deletes as u64;
            totals.delivery_failures += stats.delivery_failures as u64;
            let cycles = totals.cycles;
            state.query.record(stats.query_time);
            state.diff.record(stats.diff_time);
            state.apply.record(stats.apply_time);
            state.total.record(stats.total_time);
            cycles
        };
        tracing::trace!(%viewer, cycle = stats.cycle, ops = stats.op_count(), "cycle observed");
        if self.report_every > 0 && cycles % self.report_every == 0 {
            tracing::info!("revalidation report\n{}", self.report());
        }
    }

    fn on_failure(&self, viewer: ViewerId, error: &CacheError) {
        self.state().totals.failures += 1;
        tracing::debug!(%viewer, %error, "cycle failure observed");
    }
}
