//! Workspace placeholder crate.
//!
//! This crate exists to expose shared feature flags that map to the individual
//! workspace crates (e.g., `core-service`, `core-sync`). Host applications can
//! depend on `catalog-sync-workspace` and enable the documented features without
//! needing to wire each crate individually.

#[cfg(any(feature = "desktop-shims", feature = "realtime"))]
pub use core_service::{SyncEngine, UpdateSubscription};
