//! Per-key fetch orchestration for dashboard data.
//!
//! This module provides the `FetchCoordinator`, which sits between UI
//! collaborators and the data provider:
//! - serves fresh entries straight from the `TieredCacheStore`
//! - serves stale entries immediately and refreshes them in the background
//! - coalesces concurrent fetches for the same key into one request
//! - keeps last-known-good data when a fetch fails
//!
//! `CachedQuery` is the subscription handle a component holds for the
//! lifetime of its view (`useCachedApi`).

pub mod coordinator;
pub mod error;
pub mod query;

pub use coordinator::{FetchCoordinator, FetchState};
pub use error::FetchError;
pub use query::{CachedQuery, QueryOptions, QuerySnapshot};
