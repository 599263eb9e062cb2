//! Two-tier data cache for dashboard payloads.
//!
//! This module provides the `TieredCacheStore`, a process-wide key/value store
//! with an in-memory tier and a persistent tier that survives reloads, and the
//! `StalenessPolicy` that classifies entries as fresh, stale or expired.
//!
//! Payloads are stored as JSON values so they can be mirrored to the
//! persistent tier unchanged. Typed access happens in the fetch layer.

pub mod entry;
pub mod persistent;
pub mod staleness;
pub mod store;

pub use entry::{CacheEntry, Tier, TtlClass};
pub use persistent::{
    FilePersistentStore, MemoryPersistentStore, PersistentKeyValueStore, StoreError,
};
pub use staleness::{Freshness, StalenessPolicy};
pub use store::{CacheStats, TieredCacheStore};
