use thiserror::Error;

/// Errors surfaced by [`Lazy::get`](crate::Lazy::get) and other loading
/// paths. Loader failures leave the handle exactly as it was, so a later
/// `get` can retry cleanly.
#[derive(Debug, Error)]
pub enum LazyError {
    #[error("failed to load object {object_id}")]
    Load {
        object_id: i64,
        #[source]
        source: anyhow::Error,
    },
    #[error("no loader available to resolve object {object_id}")]
    MissingLoader { object_id: i64 },
    #[error("loader returned a subject of an unexpected type for object {object_id}")]
    SubjectType { object_id: i64 },
}

/// Rejected eviction-policy configuration. Raised eagerly at construction,
/// never deferred to sweep time.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum EvictionConfigError {
    #[error("eviction timeout must be greater than zero")]
    InvalidTimeout,
    #[error("memory quota must be within [0.0, 1.0], got {0}")]
    InvalidMemoryQuota(f64),
}
