use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use strata_memory::{MemoryMonitor, MemoryStatistics, ProcessMemoryMonitor};

use crate::error::EvictionConfigError;
use crate::handle::{now_millis, ClearingEvaluator, LazyRef, LazyView};

/// One eviction policy pass over registered handles.
///
/// `begin_cycle` / `end_cycle` bracket a sweep pass; `check` is invoked once
/// per resolvable handle in between and returns whether it cleared.
pub trait Checker: Send + Sync {
    fn begin_cycle(&self) {}
    fn check(&self, lazy: &dyn LazyRef) -> bool;
    fn end_cycle(&self) {}
}

/// Custom override consulted before the generic decision. `Some` answers are
/// definitive; `None` defers to the timeout/grace/memory logic.
pub type CustomCheck =
    dyn Fn(&LazyView, &MemoryStatistics, Duration) -> Option<bool> + Send + Sync;

/// End-of-cycle observer: memory statistics, cleared-handle count, quota.
pub type CycleEvaluator = dyn Fn(&MemoryStatistics, u64, f64) + Send + Sync;

/// Configuration for [`EvictionChecker`]. Validated eagerly; an invalid
/// timeout or quota is a construction error, never a sweep-time surprise.
#[derive(Debug, Clone, Copy)]
pub struct EvictionConfig {
    /// Age beyond which a handle is cleared regardless of memory pressure.
    /// Must be greater than zero.
    pub timeout: Duration,
    /// Fraction of the committed memory ceiling lazy subjects may occupy,
    /// in `[0.0, 1.0]`. Zero disables the memory dimension entirely.
    pub memory_quota: f64,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            memory_quota: DEFAULT_MEMORY_QUOTA,
        }
    }
}

impl EvictionConfig {
    fn validate(&self) -> Result<(), EvictionConfigError> {
        if self.timeout.is_zero() {
            return Err(EvictionConfigError::InvalidTimeout);
        }
        if !(0.0..=1.0).contains(&self.memory_quota) {
            return Err(EvictionConfigError::InvalidMemoryQuota(self.memory_quota));
        }
        Ok(())
    }
}

// About 15 minutes.
const DEFAULT_TIMEOUT_MS: u64 = 1_000_000;
const DEFAULT_MEMORY_QUOTA: f64 = 1.0;
const GRACE_CEILING_MS: u64 = 1_000;

// Refresh the memory snapshot every this-many clears within a cycle.
// Power of two so the check is a mask.
const MEMORY_REFRESH_MASK: u64 = 127;

/// Working state of one check cycle. Derived thresholds keep the per-handle
/// decision down to integer comparisons; the `sh10_*` values are the
/// shift-by-10 fixed-point forms used by the age-penalty formula.
#[derive(Default)]
struct CycleState {
    start_ms: u64,
    timeout_threshold_ms: u64,
    grace_threshold_ms: u64,
    statistics: MemoryStatistics,
    memory_used: u64,
    sh10_used: u128,
    sh10_limit: u128,
    clear_count: u64,
}

/// The default eviction policy: two dimensions decide whether a handle is
/// cleared.
///
/// - time: the handle's age (now minus `last_touched`) against a grace
///   period and a hard timeout;
/// - memory: bytes used against the permitted quota of the committed
///   ceiling.
///
/// Inside the window between grace and timeout the dimensions combine: the
/// handle's age, as a fraction of the timeout, amplifies the used-memory
/// side of the comparison. As memory tightens, older handles are cleared
/// sooner while recently used ones need the system to be nearly at the
/// limit.
pub struct EvictionChecker {
    timeout_ms: u64,
    grace_ms: u64,
    memory_quota: f64,
    custom_check: Option<Box<CustomCheck>>,
    cycle_evaluator: Option<Box<CycleEvaluator>>,
    monitor: Arc<dyn MemoryMonitor>,
    cycle: Mutex<CycleState>,
}

impl EvictionChecker {
    pub fn new(config: EvictionConfig) -> Result<Self, EvictionConfigError> {
        config.validate()?;
        let timeout_ms = config.timeout.as_millis().min(u64::MAX as u128) as u64;
        Ok(Self::from_validated(timeout_ms, config.memory_quota))
    }

    /// Pure timeout policy; memory pressure never clears anything.
    pub fn timeout_only(timeout: Duration) -> Result<Self, EvictionConfigError> {
        Self::new(EvictionConfig {
            timeout,
            memory_quota: 0.0,
        })
    }

    /// Pure memory policy; handles age out only under pressure.
    pub fn memory_only(memory_quota: f64) -> Result<Self, EvictionConfigError> {
        Self::new(EvictionConfig {
            timeout: Duration::from_millis(u64::MAX),
            memory_quota,
        })
    }

    fn from_validated(timeout_ms: u64, memory_quota: f64) -> Self {
        Self {
            timeout_ms,
            grace_ms: GRACE_CEILING_MS.min(timeout_ms / 2),
            memory_quota,
            custom_check: None,
            cycle_evaluator: None,
            monitor: Arc::new(ProcessMemoryMonitor::new()),
            cycle: Mutex::new(CycleState::default()),
        }
    }

    pub fn with_monitor(mut self, monitor: Arc<dyn MemoryMonitor>) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn with_custom_check(mut self, check: Box<CustomCheck>) -> Self {
        self.custom_check = Some(check);
        self
    }

    pub fn with_cycle_evaluator(mut self, evaluator: Box<CycleEvaluator>) -> Self {
        self.cycle_evaluator = Some(evaluator);
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn memory_quota(&self) -> f64 {
        self.memory_quota
    }

    fn memory_check_enabled(&self) -> bool {
        self.memory_quota != 0.0
    }

    fn refresh_memory(&self, cycle: &mut CycleState) {
        let statistics = self.monitor.sample();
        let limit = if self.memory_check_enabled() {
            (statistics.committed as f64 * self.memory_quota) as u64
        } else {
            u64::MAX
        };
        cycle.memory_used = statistics.used;
        cycle.sh10_used = sh10(statistics.used);
        cycle.sh10_limit = sh10(limit);
        cycle.statistics = statistics;
    }

    /// Books a positive decision and occasionally refreshes the memory
    /// snapshot: clearing frees memory, but sampling usage on every single
    /// clear would dominate the sweep.
    fn record_clearing(&self, cycle: &mut CycleState, decision: bool) -> bool {
        if decision {
            cycle.clear_count += 1;
            if cycle.clear_count & MEMORY_REFRESH_MASK == 0 {
                self.refresh_memory(cycle);
            }
        }
        decision
    }

    fn check_by_memory_with_age_penalty(&self, cycle: &mut CycleState, lazy: &LazyView) -> bool {
        if !self.memory_check_enabled() {
            return false;
        }

        let age = cycle.start_ms.saturating_sub(lazy.last_touched);
        let sh10_weight = sh10(age) / self.timeout_ms as u128;

        // Used memory times the age weight acts as an "age penalty" on top
        // of the memory actually used.
        let decision =
            cycle.sh10_used + cycle.memory_used as u128 * sh10_weight >= cycle.sh10_limit;

        tracing::trace!(
            target = "strata.lazy",
            object_id = lazy.object_id,
            age_ms = age,
            used = cycle.memory_used,
            decision,
            "age-penalty check"
        );
        self.record_clearing(cycle, decision)
    }
}

impl Default for EvictionChecker {
    fn default() -> Self {
        Self::from_validated(DEFAULT_TIMEOUT_MS, DEFAULT_MEMORY_QUOTA)
    }
}

// Equals *1024, roughly *1000 but a plain shift; the exact factor does not
// matter as long as weight and limit are scaled consistently.
fn sh10(value: u64) -> u128 {
    (value as u128) << 10
}

impl Checker for EvictionChecker {
    fn begin_cycle(&self) {
        let mut cycle = self.cycle.lock();
        let now = now_millis();
        cycle.start_ms = now;
        // Timeout is validated to be > 0, so the grace threshold is always
        // at or above the timeout threshold.
        cycle.timeout_threshold_ms = now.saturating_sub(self.timeout_ms);
        cycle.grace_threshold_ms = now.saturating_sub(self.grace_ms);
        cycle.clear_count = 0;
        self.refresh_memory(&mut cycle);

        tracing::trace!(
            target = "strata.lazy",
            timeout_ms = self.timeout_ms,
            grace_ms = self.grace_ms,
            used = cycle.statistics.used,
            committed = cycle.statistics.committed,
            "begin check cycle"
        );
    }

    fn check(&self, lazy: &dyn LazyRef) -> bool {
        lazy.clear_if(self)
    }

    fn end_cycle(&self) {
        let cycle = self.cycle.lock();
        if let Some(evaluator) = &self.cycle_evaluator {
            evaluator(&cycle.statistics, cycle.clear_count, self.memory_quota);
        } else {
            tracing::trace!(
                target = "strata.lazy",
                cleared = cycle.clear_count,
                "end check cycle"
            );
        }
    }
}

impl ClearingEvaluator for EvictionChecker {
    /// Invoked while the handle's own lock is held (via `clear_if`), so the
    /// decision and the eviction are one atomic step.
    fn needs_clearing(&self, lazy: &LazyView) -> bool {
        let mut cycle = self.cycle.lock();

        if let Some(custom) = &self.custom_check {
            if let Some(decision) = custom(lazy, &cycle.statistics, self.timeout()) {
                return self.record_clearing(&mut cycle, decision);
            }
            // Indecisive custom check defers to the generic logic.
        }

        // Time fast paths: never clear inside the grace period (this also
        // covers the absent-subject sentinel), always clear beyond the
        // timeout.
        let last_touched = lazy.last_touched;
        if last_touched >= cycle.grace_threshold_ms {
            return false;
        }
        if last_touched < cycle.timeout_threshold_ms {
            tracing::debug!(
                target = "strata.lazy",
                object_id = lazy.object_id,
                "timeout-clearing lazy reference"
            );
            return self.record_clearing(&mut cycle, true);
        }

        // Between grace and timeout: combine age and memory pressure.
        self.check_by_memory_with_age_penalty(&mut cycle, lazy)
    }
}

/// Policy that clears every resolvable handle: backs full flushes, not the
/// periodic sweep. Unstored handles are skipped rather than treated as the
/// fatal invariant violation an explicit `clear` would raise.
pub struct Clearer;

struct ClearAlways;

impl ClearingEvaluator for ClearAlways {
    fn needs_clearing(&self, _lazy: &LazyView) -> bool {
        true
    }
}

impl Checker for Clearer {
    fn check(&self, lazy: &dyn LazyRef) -> bool {
        lazy.clear_if(&ClearAlways)
    }
}
