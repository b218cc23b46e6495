use std::sync::Mutex;

use sysinfo::System;

use crate::stats::MemoryStatistics;
use crate::{cgroup, process};

/// Source of [`MemoryStatistics`] samples.
///
/// Implementations must be cheap enough to call from eviction hot paths;
/// callers already throttle how often they ask.
pub trait MemoryMonitor: Send + Sync {
    fn sample(&self) -> MemoryStatistics;
}

/// Default monitor: RSS from `/proc` (with a `sysinfo` fallback) against a
/// ceiling derived from the cgroup memory limit or total system memory.
pub struct ProcessMemoryMonitor {
    system: Mutex<System>,
    committed: u64,
    max: u64,
}

impl ProcessMemoryMonitor {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_memory();
        let max = system.total_memory().max(1);
        let committed = match cgroup::memory_limit_bytes() {
            Some(limit) => limit.min(max),
            None => max,
        };
        tracing::debug!(
            target = "strata.memory",
            committed,
            max,
            "initialized process memory monitor"
        );
        Self {
            system: Mutex::new(system),
            committed,
            max,
        }
    }

    fn rss_via_sysinfo(&self) -> Option<u64> {
        let pid = sysinfo::get_current_pid().ok()?;
        let mut system = self.system.lock().unwrap();
        if !system.refresh_process(pid) {
            return None;
        }
        system.process(pid).map(|process| process.memory())
    }
}

impl Default for ProcessMemoryMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryMonitor for ProcessMemoryMonitor {
    fn sample(&self) -> MemoryStatistics {
        let used = process::rss_bytes()
            .or_else(|| self.rss_via_sysinfo())
            .unwrap_or(0);
        MemoryStatistics {
            used,
            committed: self.committed,
            max: self.max,
        }
    }
}

/// Monitor returning a fixed snapshot. Backs tests and deterministic
/// eviction policies.
#[derive(Debug, Clone, Copy)]
pub struct FixedMemoryMonitor(pub MemoryStatistics);

impl MemoryMonitor for FixedMemoryMonitor {
    fn sample(&self) -> MemoryStatistics {
        self.0
    }
}
