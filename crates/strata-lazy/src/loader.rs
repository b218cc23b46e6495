use std::any::Any;
use std::sync::Arc;

/// External capability that reconstructs a subject from its object id,
/// transitively materializing everything the subject strongly references.
///
/// Loaders are shared read-only across many handles and must tolerate
/// concurrent invocation. The returned value is type-erased; the handle
/// downcasts it to its subject type and reports a mismatch as
/// [`LazyError::SubjectType`](crate::LazyError::SubjectType).
///
/// Failures propagate verbatim to the caller of `get`; retry policy, if
/// any, belongs to the loader or its caller.
pub trait ObjectLoader: Send + Sync {
    fn load(&self, object_id: i64) -> anyhow::Result<Arc<dyn Any + Send + Sync>>;
}
