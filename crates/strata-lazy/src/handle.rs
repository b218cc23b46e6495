use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::error::LazyError;
use crate::gate::ClearGate;
use crate::loader::ObjectLoader;
use crate::registry::{self, LazyRegistry};
use crate::swizzle;

/// `last_touched` value of a handle whose subject is absent. An absent
/// handle can never be mistaken for "about to time out".
pub const TOUCHED_NEVER: u64 = u64::MAX;

/// Wall-clock milliseconds, the unit of `last_touched` and all eviction
/// thresholds.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis().min(u64::MAX as u128) as u64)
        .unwrap_or(0)
}

/// Immutable snapshot of a handle's identity and age, handed to clearing
/// decisions while the handle's own lock is held.
#[derive(Debug, Clone, Copy)]
pub struct LazyView {
    pub object_id: i64,
    pub last_touched: u64,
}

/// Decides whether a single handle should be cleared. Invoked exclusively
/// through [`Lazy::clear_if`] / [`LazyRef::clear_if`], so decision and
/// eviction happen under one hold of the handle's lock.
pub trait ClearingEvaluator: Send + Sync {
    fn needs_clearing(&self, lazy: &LazyView) -> bool;
}

/// Untyped face of a [`Lazy<T>`], the surface the registry sweep and
/// diagnostics operate on. Observing a `LazyRef` never loads a subject.
pub trait LazyRef: Send + Sync {
    fn object_id(&self) -> i64;
    /// Millis timestamp of the last significant use, or [`TOUCHED_NEVER`]
    /// while the subject is absent.
    fn last_touched(&self) -> u64;
    /// Whether the reference has been persisted (proper or null id).
    fn is_stored(&self) -> bool;
    /// Not yet persisted, a null reference, or a present subject: all
    /// states in which nothing remains to load.
    fn is_loaded(&self) -> bool;
    /// Whether the subject is currently in memory.
    fn is_resident(&self) -> bool;
    /// Evict if stored, resident, gates allow and the evaluator agrees.
    /// Returns whether an eviction occurred.
    fn clear_if(&self, evaluator: &dyn ClearingEvaluator) -> bool;
}

struct LazyState<T> {
    subject: Option<Arc<T>>,
    object_id: i64,
    loader: Option<Arc<dyn ObjectLoader>>,
    last_touched: u64,
    owner_gate: Option<Weak<dyn ClearGate>>,
    guard_gate: Option<Weak<dyn ClearGate>>,
}

impl<T> LazyState<T> {
    fn touch(&mut self) {
        self.last_touched = if self.subject.is_some() {
            now_millis()
        } else {
            TOUCHED_NEVER
        };
    }

    fn is_stored(&self) -> bool {
        swizzle::is_found_oid(self.object_id)
    }

    /// A dead or absent gate allows clearing; a live gate is asked.
    fn gates_allow_clear(&self) -> bool {
        for gate in [&self.owner_gate, &self.guard_gate] {
            if let Some(gate) = gate.as_ref().and_then(Weak::upgrade) {
                if !gate.allow_clear() {
                    return false;
                }
            }
        }
        true
    }

    /// Drops the subject and resets the touch sentinel. Clearing a reference
    /// that was never persisted would lose the only copy of its subject, so
    /// that is a fatal caller bug, not a recoverable condition.
    fn evict(&mut self) {
        assert!(
            self.is_stored(),
            "cannot clear an unstored lazy reference (object id {})",
            self.object_id
        );
        self.subject = None;
        self.touch();
    }

    fn set_loader(&mut self, loader: Arc<dyn ObjectLoader>) {
        // Handles may be relinked from several sources (storage, network
        // transport). Only the first supplier counts; the "primary" loader
        // is expected to arrive first.
        if self.loader.is_none() {
            self.loader = Some(loader);
        }
    }
}

impl<T: Send + Sync + 'static> LazyState<T> {
    /// Loads the subject through the loader. On any error the state is left
    /// exactly as it was.
    fn materialize(&mut self) -> Result<(), LazyError> {
        let object_id = self.object_id;
        let loader = self
            .loader
            .clone()
            .ok_or(LazyError::MissingLoader { object_id })?;

        tracing::debug!(target = "strata.lazy", object_id, "lazy loading");
        let raw = loader
            .load(object_id)
            .map_err(|source| LazyError::Load { object_id, source })?;
        let subject = raw
            .downcast::<T>()
            .map_err(|_| LazyError::SubjectType { object_id })?;
        self.subject = Some(subject);
        Ok(())
    }
}

struct LazyInner<T> {
    state: Mutex<LazyState<T>>,
}

/// A lazily loading reference into the persisted object graph.
///
/// Cloning shares the same underlying reference. All operations are
/// mutually exclusive per handle; no operation blocks on another handle or
/// on the registry.
pub struct Lazy<T> {
    inner: Arc<LazyInner<T>>,
}

impl<T> Clone for Lazy<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> Lazy<T> {
    /// Wraps a live, not yet persisted subject and registers the handle
    /// with the current registry.
    pub fn reference(subject: T) -> Self {
        Self::reference_in(&registry::current(), subject)
    }

    pub fn reference_in(registry: &LazyRegistry, subject: T) -> Self {
        Self::build_in(
            registry,
            Some(Arc::new(subject)),
            swizzle::to_unmapped_oid(true),
            None,
        )
    }

    /// Post-load-deferred form: the subject stays absent until first `get`.
    pub fn from_oid(object_id: i64, loader: Arc<dyn ObjectLoader>) -> Self {
        Self::from_oid_in(&registry::current(), object_id, loader)
    }

    pub fn from_oid_in(
        registry: &LazyRegistry,
        object_id: i64,
        loader: Arc<dyn ObjectLoader>,
    ) -> Self {
        Self::build_in(registry, None, object_id, Some(loader))
    }

    /// Full form used by the binary layer when subject, id and loader are
    /// all known at reconstruction time.
    pub fn with_parts(
        subject: Option<Arc<T>>,
        object_id: i64,
        loader: Option<Arc<dyn ObjectLoader>>,
    ) -> Self {
        Self::with_parts_in(&registry::current(), subject, object_id, loader)
    }

    pub fn with_parts_in(
        registry: &LazyRegistry,
        subject: Option<Arc<T>>,
        object_id: i64,
        loader: Option<Arc<dyn ObjectLoader>>,
    ) -> Self {
        Self::build_in(registry, subject, object_id, loader)
    }

    fn build_in(
        registry: &LazyRegistry,
        subject: Option<Arc<T>>,
        object_id: i64,
        loader: Option<Arc<dyn ObjectLoader>>,
    ) -> Self {
        let mut state = LazyState {
            subject,
            object_id,
            loader,
            last_touched: TOUCHED_NEVER,
            owner_gate: None,
            guard_gate: None,
        };
        state.touch();
        let lazy = Self {
            inner: Arc::new(LazyInner {
                state: Mutex::new(state),
            }),
        };
        registry.register(&lazy);
        lazy
    }

    /// Returns the subject, loading it first if absent and the id is a
    /// proper identifier. Touches the handle before returning, whether the
    /// subject was resident or just loaded.
    pub fn get(&self) -> Result<Option<Arc<T>>, LazyError> {
        let mut state = self.inner.state.lock();
        // A persisted null (id == 0) and a not yet persisted subject
        // (id < 0) have nothing to load.
        if state.subject.is_none() && swizzle::is_proper_oid(state.object_id) {
            state.materialize()?;
        }
        state.touch();
        Ok(state.subject.clone())
    }

    /// Current residency without loading and without touching. This is what
    /// the sweep and diagnostics use so observation cannot revive a handle.
    pub fn peek(&self) -> Option<Arc<T>> {
        self.inner.state.lock().subject.clone()
    }

    /// Unconditionally evicts the subject and returns it, leaving the
    /// option to reload intact.
    ///
    /// # Panics
    ///
    /// Panics if the reference was never persisted; see
    /// [`LazyRef::clear_if`] for the condition-checked variant.
    pub fn clear(&self) -> Option<Arc<T>> {
        let mut state = self.inner.state.lock();
        let prior = state.subject.clone();
        if !state.gates_allow_clear() {
            // Vetoed: degenerate to peek-like behavior.
            return prior;
        }
        state.evict();
        prior
    }

    /// Conditional clear; see [`LazyRef::clear_if`].
    pub fn clear_if(&self, evaluator: &dyn ClearingEvaluator) -> bool {
        LazyRef::clear_if(&*self.inner, evaluator)
    }

    pub fn object_id(&self) -> i64 {
        self.inner.state.lock().object_id
    }

    pub fn last_touched(&self) -> u64 {
        self.inner.state.lock().last_touched
    }

    /// Whether this reference has been persisted.
    pub fn is_stored(&self) -> bool {
        self.inner.state.lock().is_stored()
    }

    pub fn is_loaded(&self) -> bool {
        LazyRef::is_loaded(&*self.inner)
    }

    /// Delayed-initialization hook for the binary layer: assigns the
    /// persisted object id and offers a loader (first supplier wins).
    ///
    /// # Panics
    ///
    /// Panics if a different proper id was already assigned; an identifier
    /// never changes over the lifetime of a reference.
    pub fn link(&self, object_id: i64, loader: Option<Arc<dyn ObjectLoader>>) {
        let mut state = self.inner.state.lock();
        assert!(
            !state.is_stored() || state.object_id == object_id,
            "object id already assigned: {} (attempted to link {})",
            state.object_id,
            object_id
        );
        if let Some(loader) = loader {
            state.set_loader(loader);
        }
        state.object_id = object_id;
    }

    /// Offers a loader; ignored if one is already present.
    pub fn set_loader(&self, loader: Arc<dyn ObjectLoader>) {
        self.inner.state.lock().set_loader(loader);
    }

    /// Attach the owner-side clear gate (held weakly).
    pub fn set_owner_gate(&self, gate: &Arc<dyn ClearGate>) {
        self.inner.state.lock().owner_gate = Some(Arc::downgrade(gate));
    }

    /// Attach the guard-side clear gate (held weakly).
    pub fn set_guard_gate(&self, gate: &Arc<dyn ClearGate>) {
        self.inner.state.lock().guard_gate = Some(Arc::downgrade(gate));
    }

    /// Traversal integration: yields the current subject to `visitor`,
    /// loading it if necessary, then restores the prior absence. Walking
    /// the graph for inspection must not permanently materialize lazily
    /// absent parts, and does not count as a touch.
    pub fn inspect<R>(&self, visitor: impl FnOnce(Option<&T>) -> R) -> Result<R, LazyError> {
        let mut state = self.inner.state.lock();
        let was_resident = state.subject.is_some();
        if !was_resident && swizzle::is_proper_oid(state.object_id) {
            state.materialize()?;
        }
        let output = visitor(state.subject.as_deref());
        if !was_resident && state.subject.is_some() {
            if state.is_stored() && state.gates_allow_clear() {
                state.subject = None;
            }
            // Either restores the absent sentinel or stamps the subject a
            // gate forced to stay resident.
            state.touch();
        }
        Ok(output)
    }

    /// Weak, untyped view for registry bookkeeping. Never extends the
    /// handle's lifetime.
    pub(crate) fn as_weak_ref(&self) -> Weak<dyn LazyRef> {
        let strong: Arc<dyn LazyRef> = self.inner.clone();
        Arc::downgrade(&strong)
    }

    #[cfg(test)]
    pub(crate) fn set_last_touched(&self, value: u64) {
        self.inner.state.lock().last_touched = value;
    }
}

impl<T: Send + Sync + 'static> LazyRef for LazyInner<T> {
    fn object_id(&self) -> i64 {
        self.state.lock().object_id
    }

    fn last_touched(&self) -> u64 {
        self.state.lock().last_touched
    }

    fn is_stored(&self) -> bool {
        self.state.lock().is_stored()
    }

    fn is_loaded(&self) -> bool {
        let state = self.state.lock();
        swizzle::is_not_proper_oid(state.object_id) || state.subject.is_some()
    }

    fn is_resident(&self) -> bool {
        self.state.lock().subject.is_some()
    }

    fn clear_if(&self, evaluator: &dyn ClearingEvaluator) -> bool {
        let mut state = self.state.lock();
        // Must be stored and resident to even consult the evaluator.
        if !state.is_stored() || state.subject.is_none() {
            return false;
        }
        if !state.gates_allow_clear() {
            return false;
        }
        let view = LazyView {
            object_id: state.object_id,
            last_touched: state.last_touched,
        };
        if evaluator.needs_clearing(&view) {
            state.evict();
            return true;
        }
        false
    }
}

/// Null-tolerant helpers over optional handles, for object-graph code
/// where a field may hold no lazy reference at all.
pub mod opt {
    use std::sync::Arc;

    use super::Lazy;
    use crate::error::LazyError;

    /// [`Lazy::get`] through an optional handle; `None` stays `None`.
    pub fn get<T: Send + Sync + 'static>(
        lazy: Option<&Lazy<T>>,
    ) -> Result<Option<Arc<T>>, LazyError> {
        match lazy {
            Some(lazy) => lazy.get(),
            None => Ok(None),
        }
    }

    /// [`Lazy::peek`] through an optional handle.
    pub fn peek<T: Send + Sync + 'static>(lazy: Option<&Lazy<T>>) -> Option<Arc<T>> {
        lazy.and_then(Lazy::peek)
    }

    /// [`Lazy::clear`] through an optional handle.
    ///
    /// # Panics
    ///
    /// As [`Lazy::clear`]: the handle, if any, must be stored.
    pub fn clear<T: Send + Sync + 'static>(lazy: Option<&Lazy<T>>) -> Option<Arc<T>> {
        lazy.and_then(Lazy::clear)
    }
}

impl<T: Send + Sync + 'static> fmt::Debug for Lazy<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Lazy")
            .field("object_id", &state.object_id)
            .field("resident", &state.subject.is_some())
            .field("last_touched", &state.last_touched)
            .finish()
    }
}
