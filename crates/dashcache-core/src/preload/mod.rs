//! Predictive preloading of page components and their data.
//!
//! - `PreloadGate`: admission control from network and device signals
//! - `IdleTaskScheduler`: runs deferred work when the host is idle
//! - `PreloadRegistry`: page id -> component loader and data prefetcher
//! - `PreloadManager`: turns navigation and hover events into preloads

pub mod gate;
pub mod idle;
pub mod manager;
pub mod registry;

pub use gate::{
    EffectiveConnectionType, NetworkConditionProbe, NetworkConditions, PreloadGate,
    StaticConditionProbe,
};
pub use idle::{IdleSignal, IdleTaskScheduler, ManualIdleSignal, NeverIdle};
pub use manager::PreloadManager;
pub use registry::{
    ComponentLoader, DataPrefetcher, PageId, PreloadError, PreloadRegistry,
    PreloadRegistryBuilder, Priority, RegistryEntry, RegistryError,
};
