use std::sync::{Arc, LazyLock, Weak};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::checker::{Checker, Clearer, EvictionChecker};
use crate::handle::{Lazy, LazyRef};

/// External gate predicate over the background sweep. Attaching any
/// controller is a one-way opt-in to external gating: from then on the
/// sweep runs only while at least one live controller says it may.
pub trait SweepController: Send + Sync {
    fn may_run(&self) -> bool;
}

/// Timing of the background worker.
#[derive(Debug, Clone, Copy)]
pub struct RegistryConfig {
    /// Sleep interval between sweep passes.
    pub check_interval: Duration,
    /// Wall-clock budget of one sweep pass.
    pub time_budget: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        // Check every second, spending about 0.1% of one thread.
        Self {
            check_interval: Duration::from_secs(1),
            time_budget: Duration::from_millis(1),
        }
    }
}

/// Chain link weakly tracking one handle. The head sentinel carries no
/// handle; `next` is the only mutable field and only the sweep ever
/// rewrites a non-tail link.
struct Entry {
    lazy: Option<Weak<dyn LazyRef>>,
    next: Mutex<Option<Arc<Entry>>>,
}

impl Entry {
    fn sentinel() -> Arc<Entry> {
        Arc::new(Entry {
            lazy: None,
            next: Mutex::new(None),
        })
    }
}

#[derive(Default)]
struct ControllerSet {
    entries: Vec<Weak<dyn SweepController>>,
    /// Lifetime attachment count: incremented per add, decremented only by
    /// explicit removal. Orphaned controllers keep their attachment, which
    /// is what makes the opt-in sticky.
    attached: u64,
}

struct RegistryInner {
    checker: Arc<dyn Checker>,
    check_interval: Duration,
    time_budget: Duration,
    head: Arc<Entry>,
    tail: Mutex<Arc<Entry>>,
    /// Position reached by the previous sweep pass; the next pass resumes
    /// here. Only the sweep reads or writes it.
    cursor: Mutex<Arc<Entry>>,
    running: Mutex<bool>,
    controllers: Mutex<ControllerSet>,
}

/// Process-wide (or explicitly scoped) registry of outstanding lazy
/// handles.
///
/// Every handle is tracked weakly: the registry observes handles without
/// keeping them alive. A background worker periodically runs a
/// time-budgeted eviction sweep over the chain; entries whose handle has
/// been dropped are pruned along the way.
#[derive(Clone)]
pub struct LazyRegistry {
    inner: Arc<RegistryInner>,
}

impl LazyRegistry {
    pub fn new(checker: Arc<dyn Checker>) -> Self {
        Self::with_config(RegistryConfig::default(), checker)
    }

    pub fn with_config(config: RegistryConfig, checker: Arc<dyn Checker>) -> Self {
        let head = Entry::sentinel();
        Self {
            inner: Arc::new(RegistryInner {
                checker,
                check_interval: config.check_interval,
                time_budget: config.time_budget,
                head: head.clone(),
                tail: Mutex::new(head.clone()),
                cursor: Mutex::new(head),
                running: Mutex::new(false),
                controllers: Mutex::new(ControllerSet::default()),
            }),
        }
    }

    /// Identity comparison: clones of one registry share all state.
    pub fn ptr_eq(&self, other: &LazyRegistry) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Appends a weakly-tracked entry for the handle. Called exactly once
    /// per handle by its constructor.
    pub fn register<T: Send + Sync + 'static>(&self, lazy: &Lazy<T>) {
        self.inner.register_weak(lazy.as_weak_ref());
    }

    /// One budgeted sweep pass with the registry's configured policy.
    pub fn sweep(&self, time_budget: Duration) {
        self.inner.sweep_pass(time_budget, &*self.inner.checker);
    }

    /// One budgeted sweep pass with an explicit policy.
    pub fn sweep_with(&self, time_budget: Duration, checker: &dyn Checker) {
        self.inner.sweep_pass(time_budget, checker);
    }

    /// Clears every resolvable, stored, resident handle. Unbounded; used
    /// for explicit full flushes, not periodic sweeping.
    pub fn flush(&self) {
        self.inner.sweep_pass(Duration::MAX, &Clearer);
    }

    /// Read-only traversal over all currently resolvable handles. Never
    /// mutates the chain.
    pub fn iterate(&self, mut visitor: impl FnMut(&dyn LazyRef)) {
        let mut next = self.inner.head.next.lock().clone();
        while let Some(entry) = next {
            if let Some(lazy) = entry.lazy.as_ref().and_then(Weak::upgrade) {
                visitor(lazy.as_ref());
            }
            next = entry.next.lock().clone();
        }
    }

    /// Re-registers every live handle and controller of `other` here, the
    /// migration half of [`install`].
    pub fn adopt_all(&self, other: &LazyRegistry) {
        assert!(
            !self.ptr_eq(other),
            "cannot adopt a registry's entries into itself"
        );

        let mut next = other.inner.head.next.lock().clone();
        while let Some(entry) = next {
            if let Some(weak) = entry.lazy.as_ref() {
                if weak.strong_count() > 0 {
                    self.inner.register_weak(weak.clone());
                }
            }
            next = entry.next.lock().clone();
        }

        let migrated: Vec<Weak<dyn SweepController>> =
            other.inner.controllers.lock().entries.clone();
        let mut set = self.inner.controllers.lock();
        for weak in migrated {
            if weak.strong_count() == 0 {
                continue;
            }
            if set.entries.iter().any(|existing| existing.ptr_eq(&weak)) {
                continue;
            }
            set.entries.push(weak);
            set.attached += 1;
        }
    }

    /// Attaches a gate controller (idempotent per controller instance).
    /// Held weakly; a dropped controller is pruned but its opt-in sticks.
    pub fn add_controller(&self, controller: &Arc<dyn SweepController>) {
        let weak = Arc::downgrade(controller);
        let mut set = self.inner.controllers.lock();
        if set.entries.iter().any(|existing| existing.ptr_eq(&weak)) {
            return;
        }
        set.entries.push(weak);
        set.attached += 1;
    }

    /// Detaches a controller. Returns whether it was attached. When the
    /// last attachment is explicitly removed the worker is stopped, so no
    /// background thread outlives the code that governed it.
    pub fn remove_controller(&self, controller: &Arc<dyn SweepController>) -> bool {
        let weak = Arc::downgrade(controller);
        let none_left = {
            let mut set = self.inner.controllers.lock();
            let Some(position) = set
                .entries
                .iter()
                .position(|existing| existing.ptr_eq(&weak))
            else {
                return false;
            };
            set.entries.remove(position);
            set.attached = set.attached.saturating_sub(1);
            set.attached == 0
        };
        if none_left {
            self.stop();
        }
        true
    }

    /// Whether the sweep may currently run; see [`SweepController`].
    pub fn may_run(&self) -> bool {
        self.inner.may_run()
    }

    /// Starts the background worker for this registry. The worker holds
    /// the registry only weakly and self-terminates once the registry is
    /// stopped or dropped.
    pub fn start(&self) {
        let mut running = self.inner.running.lock();
        if *running {
            return;
        }
        *running = true;
        let registry = Arc::downgrade(&self.inner);
        let spawned = thread::Builder::new()
            .name("strata-lazy-sweep".into())
            .spawn(move || sweep_loop(registry));
        if let Err(err) = spawned {
            // Constrained environments can refuse new threads; degrade to
            // explicit sweeps instead of crashing.
            *running = false;
            tracing::warn!(
                target = "strata.lazy",
                error = %err,
                "failed to spawn sweep worker"
            );
        }
    }

    pub fn stop(&self) {
        *self.inner.running.lock() = false;
    }

    pub fn is_running(&self) -> bool {
        *self.inner.running.lock()
    }
}

impl Default for LazyRegistry {
    fn default() -> Self {
        Self::new(Arc::new(EvictionChecker::default()))
    }
}

impl RegistryInner {
    fn register_weak(&self, lazy: Weak<dyn LazyRef>) {
        let entry = Arc::new(Entry {
            lazy: Some(lazy),
            next: Mutex::new(None),
        });
        // Exclusive only for the instant of the two pointer updates.
        let mut tail = self.tail.lock();
        *tail.next.lock() = Some(entry.clone());
        *tail = entry;
    }

    fn may_run(&self) -> bool {
        let live: Vec<Arc<dyn SweepController>> = {
            let mut set = self.controllers.lock();
            set.entries.retain(|weak| weak.strong_count() > 0);
            if set.entries.is_empty() {
                // Self-governed until the first controller ever attaches;
                // afterwards an empty chain means "may not run".
                return set.attached == 0;
            }
            set.entries.iter().filter_map(Weak::upgrade).collect()
        };
        // One live approval suffices.
        live.iter().any(|controller| controller.may_run())
    }

    /// The sweep. Resumes at the cursor, checks at least one entry no
    /// matter the budget, prunes orphans, and stops either on budget
    /// exhaustion (remembering the position) or at the tail snapshot
    /// (resetting the cursor to the head).
    fn sweep_pass(&self, time_budget: Duration, checker: &dyn Checker) {
        let deadline = Instant::now().checked_add(time_budget);

        // Snapshot the tail under a brief lock, then run without any
        // registry-wide lock. The check path takes handle locks and may
        // call into application code (gates, custom checks) that registers
        // new handles; holding a registry lock across that would close a
        // lock-ordering cycle with any thread that registers while holding
        // its handle's lock, the classic load-vs-sweep deadlock.
        let snapshot_tail = self.tail.lock().clone();

        let mut last = self.cursor.lock().clone();
        let first = last.next.lock().clone();
        let Some(mut entry) = first else {
            // Nothing beyond the cursor; no-op pass.
            return;
        };

        checker.begin_cycle();

        loop {
            // Hold a strong reference across the check so the handle
            // cannot disappear mid-decision.
            match entry.lazy.as_ref().and_then(Weak::upgrade) {
                Some(lazy) => {
                    checker.check(lazy.as_ref());
                }
                None if !Arc::ptr_eq(&entry, &snapshot_tail) => {
                    // Unlink the orphan. The snapshot tail is never
                    // unlinked, keeping the chain consistent under
                    // concurrent appends. Orphans do not consume budget.
                    let next = entry.next.lock().clone();
                    *last.next.lock() = next.clone();
                    match next {
                        Some(next) => {
                            entry = next;
                            continue;
                        }
                        None => break,
                    }
                }
                None => {}
            }

            if Arc::ptr_eq(&entry, &snapshot_tail) {
                // Entries appended during this pass are too new to be
                // worth checking; restart at the head next pass so the
                // oldest entries are favored.
                last = self.head.clone();
                break;
            }

            let next = entry.next.lock().clone();
            last = entry;
            match next {
                Some(next) => entry = next,
                None => break,
            }

            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                break;
            }
        }

        *self.cursor.lock() = last;
        checker.end_cycle();
    }
}

fn sweep_loop(registry: Weak<RegistryInner>) {
    tracing::debug!(target = "strata.lazy", "sweep worker started");
    loop {
        let Some(inner) = registry.upgrade() else {
            break;
        };
        if !*inner.running.lock() {
            break;
        }
        if inner.may_run() {
            inner.sweep_pass(inner.time_budget, &*inner.checker);
        }
        let interval = inner.check_interval;
        // The worker must never be the reason the registry stays alive:
        // drop the strong reference before sleeping.
        drop(inner);
        thread::sleep(interval);
    }
    tracing::debug!(target = "strata.lazy", "sweep worker terminating");
}

static CURRENT: LazyLock<Mutex<LazyRegistry>> =
    LazyLock::new(|| Mutex::new(LazyRegistry::default()));

/// The process-wide registry new handles register with by default.
pub fn current() -> LazyRegistry {
    CURRENT.lock().clone()
}

/// Replaces the process-wide registry, migrating all live entries and
/// controllers into the replacement, and returns the previous registry.
pub fn install(registry: LazyRegistry) -> LazyRegistry {
    let mut current = CURRENT.lock();
    registry.adopt_all(&current);
    std::mem::replace(&mut *current, registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checker::{EvictionChecker, EvictionConfig};
    use crate::handle::now_millis;

    fn resident_handle(registry: &LazyRegistry, object_id: i64) -> Lazy<String> {
        Lazy::with_parts_in(
            registry,
            Some(Arc::new(format!("subject-{object_id}"))),
            object_id,
            None,
        )
    }

    fn resolvable_count(registry: &LazyRegistry) -> usize {
        let mut count = 0;
        registry.iterate(|_| count += 1);
        count
    }

    #[test]
    fn sweep_clears_only_timed_out_handles() {
        let registry = LazyRegistry::default();
        let h10 = resident_handle(&registry, 10);
        let h20 = resident_handle(&registry, 20);
        let h30 = resident_handle(&registry, 30);

        let now = now_millis();
        h20.set_last_touched(now - 2_000);
        h30.set_last_touched(now - 20_000);

        let checker = EvictionChecker::new(EvictionConfig {
            timeout: Duration::from_millis(10_000),
            memory_quota: 0.0,
        })
        .unwrap();
        registry.sweep_with(Duration::from_secs(60), &checker);

        assert!(h10.peek().is_some());
        assert!(h20.peek().is_some());
        assert!(h30.peek().is_none());
    }

    #[test]
    fn zero_budget_pass_checks_exactly_one_entry() {
        let registry = LazyRegistry::default();
        let handles: Vec<_> = (1..=3).map(|id| resident_handle(&registry, id)).collect();

        let resident =
            |handles: &[Lazy<String>]| handles.iter().filter(|h| h.peek().is_some()).count();

        registry.sweep_with(Duration::ZERO, &Clearer);
        assert_eq!(resident(&handles), 2);
        registry.sweep_with(Duration::ZERO, &Clearer);
        assert_eq!(resident(&handles), 1);
        registry.sweep_with(Duration::ZERO, &Clearer);
        assert_eq!(resident(&handles), 0);
    }

    #[test]
    fn cursor_resets_to_head_after_reaching_the_tail() {
        let registry = LazyRegistry::default();
        let handles: Vec<_> = (1..=2).map(|id| resident_handle(&registry, id)).collect();

        // Walk the whole chain once; the cursor ends back at the head.
        registry.flush();
        assert!(handles.iter().all(|h| h.peek().is_none()));

        // Register another and flush again; a stuck cursor would miss it.
        let reloaded = resident_handle(&registry, 3);
        registry.flush();
        assert!(reloaded.peek().is_none());
    }

    #[test]
    fn orphaned_entries_are_pruned_during_sweep() {
        let registry = LazyRegistry::default();
        let keep_front = resident_handle(&registry, 1);
        let dropped = resident_handle(&registry, 2);
        let keep_back = resident_handle(&registry, 3);
        assert_eq!(resolvable_count(&registry), 3);

        drop(dropped);
        assert_eq!(resolvable_count(&registry), 2);

        // The sweep unlinks the orphan without disturbing its neighbors.
        registry.flush();
        assert_eq!(resolvable_count(&registry), 2);
        assert!(keep_front.peek().is_none());
        assert!(keep_back.peek().is_none());

        let late = resident_handle(&registry, 4);
        assert_eq!(resolvable_count(&registry), 3);
        drop(late);
    }

    #[test]
    fn unstored_handles_survive_a_flush() {
        let registry = LazyRegistry::default();
        let unstored = Lazy::reference_in(&registry, "precious".to_string());
        let stored = resident_handle(&registry, 9);

        registry.flush();

        assert!(unstored.peek().is_some());
        assert!(stored.peek().is_none());
    }

    struct FixedGate(bool);

    impl SweepController for FixedGate {
        fn may_run(&self) -> bool {
            self.0
        }
    }

    #[test]
    fn controller_opt_in_is_sticky_across_orphaning() {
        let registry = LazyRegistry::default();
        assert!(registry.may_run());

        let deny: Arc<dyn SweepController> = Arc::new(FixedGate(false));
        registry.add_controller(&deny);
        assert!(!registry.may_run());

        // Dropping the controller does not revert to default-allow.
        drop(deny);
        assert!(!registry.may_run());
    }

    #[test]
    fn explicit_removal_restores_self_governance() {
        let registry = LazyRegistry::default();
        let allow: Arc<dyn SweepController> = Arc::new(FixedGate(true));

        registry.add_controller(&allow);
        registry.add_controller(&allow); // idempotent
        assert!(registry.may_run());

        assert!(registry.remove_controller(&allow));
        assert!(!registry.remove_controller(&allow));
        assert!(registry.may_run());
    }

    #[test]
    fn any_live_approval_suffices() {
        let registry = LazyRegistry::default();
        let deny: Arc<dyn SweepController> = Arc::new(FixedGate(false));
        let allow: Arc<dyn SweepController> = Arc::new(FixedGate(true));

        registry.add_controller(&deny);
        assert!(!registry.may_run());
        registry.add_controller(&allow);
        assert!(registry.may_run());
    }

    #[test]
    fn adoption_migrates_live_entries_and_controllers() {
        let old = LazyRegistry::default();
        let handle = resident_handle(&old, 77);
        let dropped = resident_handle(&old, 78);
        drop(dropped);
        let deny: Arc<dyn SweepController> = Arc::new(FixedGate(false));
        old.add_controller(&deny);

        let replacement = LazyRegistry::default();
        replacement.adopt_all(&old);

        assert_eq!(resolvable_count(&replacement), 1);
        assert!(!replacement.may_run());
        drop(handle);
        assert_eq!(resolvable_count(&replacement), 0);
    }
}
