//! Client-side data cache and predictive prefetch engine for the dashboard.
//!
//! The crate is split into four areas:
//! - [`cache`]: the two-tier key/value store and its staleness policy
//! - [`fetch`]: per-key fetch orchestration (`useCachedApi` semantics)
//! - [`navigation`]: navigation history, hover intent and next-page prediction
//! - [`preload`]: admission gate, idle scheduling, the page registry and the
//!   [`PreloadManager`] that ties everything together
//!
//! Browser globals (`localStorage`, `navigator.connection`, idle callbacks,
//! `Date.now()`) are reached only through the capability traits
//! [`PersistentKeyValueStore`], [`NetworkConditionProbe`], [`IdleSignal`] and
//! [`Clock`], so the whole engine runs on any tokio host.

pub mod cache;
pub mod clock;
pub mod config;
pub mod fetch;
pub mod navigation;
pub mod preload;

#[cfg(test)]
pub(crate) mod test_support;

pub use cache::{
    CacheEntry, CacheStats, FilePersistentStore, Freshness, MemoryPersistentStore,
    PersistentKeyValueStore, StalenessPolicy, StoreError, Tier, TieredCacheStore, TtlClass,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CacheConfig, Config, ConfigError, PreloadConfig};
pub use fetch::{
    CachedQuery, FetchCoordinator, FetchError, FetchState, QueryOptions, QuerySnapshot,
};
pub use navigation::{page_id_from_path, HoverOutcome, NavigationEvent, NavigationPredictor};
pub use preload::{
    EffectiveConnectionType, IdleSignal, IdleTaskScheduler, ManualIdleSignal,
    NetworkConditionProbe, NetworkConditions, NeverIdle, PageId, PreloadError, PreloadGate,
    PreloadManager, PreloadRegistry, Priority, RegistryError, StaticConditionProbe,
};
