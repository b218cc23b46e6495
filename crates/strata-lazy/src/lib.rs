//! Lazy-reference lifecycle and eviction for Strata's object-graph
//! persistence layer.
//!
//! Application code holds [`Lazy<T>`] handles into a persisted object graph.
//! A handle materializes its subject on first [`Lazy::get`] through a shared
//! [`ObjectLoader`], and every handle is weakly tracked by a [`LazyRegistry`]
//! whose budgeted background sweep clears subjects that are stale or that
//! crowd the configured memory quota. The registry observes handles without
//! extending their lifetime: dropping the last application reference to a
//! handle is enough to retire it.
//!
//! The default eviction policy ([`EvictionChecker`]) combines a hard timeout,
//! a grace period protecting recently touched handles, and a memory-weighted
//! age penalty: the closer a handle gets to its timeout, the less memory
//! pressure it takes to evict it.

mod checker;
mod error;
mod gate;
mod handle;
mod loader;
mod registry;
pub mod swizzle;

pub use checker::{
    Checker, Clearer, CustomCheck, CycleEvaluator, EvictionChecker, EvictionConfig,
};
pub use error::{EvictionConfigError, LazyError};
pub use gate::ClearGate;
pub use handle::{opt, ClearingEvaluator, Lazy, LazyRef, LazyView, TOUCHED_NEVER};
pub use loader::ObjectLoader;
pub use registry::{current, install, LazyRegistry, RegistryConfig, SweepController};
