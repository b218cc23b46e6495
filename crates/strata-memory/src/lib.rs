//! Process memory statistics for Strata's eviction machinery.
//!
//! This crate is intentionally small and "best-effort": it answers the single
//! question the lazy-reference checker keeps asking (how many bytes does this
//! process currently occupy, and how many is it allowed to occupy) without
//! claiming byte-exact precision. Sampling prefers cheap `/proc` reads and
//! falls back to `sysinfo` where those are unavailable.

mod cgroup;
mod monitor;
mod process;
mod stats;

pub use monitor::{FixedMemoryMonitor, MemoryMonitor, ProcessMemoryMonitor};
pub use stats::MemoryStatistics;
