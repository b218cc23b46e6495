//! Registry sweeping end to end, including the background worker.

use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use strata_lazy::{
    EvictionChecker, EvictionConfig, Lazy, LazyRegistry, ObjectLoader, RegistryConfig,
    SweepController,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct CountingLoader {
    calls: AtomicUsize,
}

impl ObjectLoader for CountingLoader {
    fn load(&self, object_id: i64) -> anyhow::Result<Arc<dyn Any + Send + Sync>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(format!("subject-{object_id}")))
    }
}

fn worker_registry() -> LazyRegistry {
    let checker = EvictionChecker::new(EvictionConfig {
        timeout: Duration::from_millis(1),
        memory_quota: 0.0,
    })
    .unwrap();
    LazyRegistry::with_config(
        RegistryConfig {
            check_interval: Duration::from_millis(5),
            time_budget: Duration::from_millis(10),
        },
        Arc::new(checker),
    )
}

fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}

#[test]
fn background_worker_evicts_stale_handles() {
    init_tracing();
    let registry = worker_registry();
    let lazy = Lazy::with_parts_in(&registry, Some(Arc::new("stale".to_string())), 1, None);

    registry.start();
    assert!(registry.is_running());
    assert!(wait_until(Duration::from_secs(2), || lazy.peek().is_none()));
    registry.stop();
}

#[test]
fn start_is_idempotent() {
    let registry = worker_registry();
    registry.start();
    registry.start();
    assert!(registry.is_running());
    registry.stop();
    assert!(!registry.is_running());
}

struct Paused;

impl SweepController for Paused {
    fn may_run(&self) -> bool {
        false
    }
}

#[test]
fn worker_pauses_while_a_controller_denies() {
    init_tracing();
    let registry = worker_registry();
    let lazy = Lazy::with_parts_in(&registry, Some(Arc::new("pinned".to_string())), 2, None);
    let pause: Arc<dyn SweepController> = Arc::new(Paused);
    registry.add_controller(&pause);

    registry.start();
    thread::sleep(Duration::from_millis(50));
    assert!(lazy.peek().is_some());

    // Removing the last controller stops the registry outright rather than
    // leaving an ungoverned worker behind.
    assert!(registry.remove_controller(&pause));
    assert!(!registry.is_running());
    assert!(lazy.peek().is_some());
}

#[test]
fn flushed_subjects_reload_on_demand() {
    let registry = LazyRegistry::default();
    let loader = Arc::new(CountingLoader {
        calls: AtomicUsize::new(0),
    });
    let lazy = Lazy::<String>::from_oid_in(&registry, 6, loader.clone());

    assert!(lazy.get().unwrap().is_some());
    assert_eq!(loader.calls.load(Ordering::SeqCst), 1);

    registry.flush();
    assert!(lazy.peek().is_none());

    assert_eq!(
        lazy.get().unwrap().as_deref(),
        Some(&"subject-6".to_string())
    );
    assert_eq!(loader.calls.load(Ordering::SeqCst), 2);
}

#[test]
fn sweeping_an_empty_registry_is_a_no_op() {
    let registry = LazyRegistry::default();
    registry.sweep(Duration::ZERO);
    registry.flush();
}
