use serde::{Deserialize, Serialize};

/// Snapshot of process memory occupancy against its permitted ceiling.
///
/// `committed` is the number of bytes the process may grow into before the
/// host (cgroup limit or physical memory) pushes back; `max` is the hard
/// physical ceiling. Consumers derive their own quotas from `committed`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryStatistics {
    /// Bytes currently occupied by the process (RSS where available).
    pub used: u64,
    /// Bytes the process may occupy (cgroup limit or total system memory).
    pub committed: u64,
    /// Total physical memory visible to the process.
    pub max: u64,
}

impl MemoryStatistics {
    /// Fraction of the committed ceiling currently in use, in `[0.0, ..]`.
    pub fn usage_ratio(&self) -> f64 {
        (self.used as f64) / (self.committed.max(1) as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_ratio_guards_against_zero_ceiling() {
        let stats = MemoryStatistics {
            used: 42,
            committed: 0,
            max: 0,
        };
        assert_eq!(stats.usage_ratio(), 42.0);
    }

    #[test]
    fn statistics_round_trip_as_json() {
        let stats = MemoryStatistics {
            used: 1024,
            committed: 4096,
            max: 8192,
        };
        let json = serde_json::to_string(&stats).unwrap();
        let back: MemoryStatistics = serde_json::from_str(&json).unwrap();
        assert_eq!(stats, back);
    }
}
