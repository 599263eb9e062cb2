use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::query::{CachedQuery, QueryOptions};
use super::FetchError;
use crate::cache::{CacheEntry, Freshness, TieredCacheStore, TtlClass};

/// Type-erased fetch function. Payloads travel as JSON values so one
/// in-flight request can serve every typed consumer of a key.
pub(crate) type ErasedFetch =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Value, FetchError>> + Send + Sync>;

type SharedFetch = Shared<BoxFuture<'static, Result<Value, FetchError>>>;

pub(crate) fn erase<T, F, Fut>(fetch: F) -> ErasedFetch
where
    T: Serialize + Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
{
    Arc::new(move || {
        let fut = fetch();
        async move {
            let data = fut.await?;
            Ok::<Value, FetchError>(serde_json::to_value(data)?)
        }
        .boxed()
    })
}

pub(crate) fn decode<T: DeserializeOwned>(value: &Value) -> Result<T, FetchError> {
    Ok(T::deserialize(value)?)
}

/// Whether a fetch should show up as `loading` to consumers of the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FetchMode {
    Foreground,
    /// Stale-while-revalidate refresh; consumers keep showing cached data.
    Background,
}

/// Per-key fetch status, owned by the coordinator.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchState {
    pub loading: bool,
    pub error: Option<FetchError>,
    pub last_updated: Option<DateTime<Utc>>,
    pub is_stale: bool,
    pub in_flight: bool,
}

struct InFlight {
    id: u64,
    fetch: SharedFetch,
}

struct Inner {
    store: Arc<TieredCacheStore>,
    in_flight: Mutex<HashMap<String, InFlight>>,
    states: Mutex<HashMap<String, FetchState>>,
    next_id: AtomicU64,
}

/// Coordinates fetches against the shared cache.
/// Clone is cheap - clones share the store and the in-flight table.
#[derive(Clone)]
pub struct FetchCoordinator {
    inner: Arc<Inner>,
}

impl FetchCoordinator {
    pub fn new(store: Arc<TieredCacheStore>) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                in_flight: Mutex::new(HashMap::new()),
                states: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn store(&self) -> &Arc<TieredCacheStore> {
        &self.inner.store
    }

    pub fn state(&self, key: &str) -> FetchState {
        self.inner
            .states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        self.inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    /// Mount a subscription for `options.cache_key`. Must be called from
    /// within a tokio runtime.
    pub fn query<T, F, Fut>(&self, fetch: F, options: QueryOptions) -> CachedQuery<T>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        CachedQuery::mount(self.clone(), erase(fetch), options)
    }

    /// One-shot read honouring freshness: fresh data is returned as is,
    /// stale data is returned while a background refresh starts, anything
    /// else waits for the network.
    pub async fn fetch_cached<T, F, Fut>(
        &self,
        key: &str,
        ttl_class: TtlClass,
        fetch: F,
    ) -> Result<T, FetchError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        let fetch = erase(fetch);
        if let Some((entry, freshness)) = self.inner.store.lookup(key) {
            if freshness.is_servable() {
                if let Ok(data) = decode(&entry.value) {
                    self.inner.record_served(key, &entry, freshness);
                    if freshness == Freshness::Stale {
                        let _ = self.start_or_join(key, ttl_class, &fetch, FetchMode::Background);
                    }
                    return Ok(data);
                }
            }
        }

        let value = self
            .start_or_join(key, ttl_class, &fetch, FetchMode::Foreground)
            .await?;
        decode(&value)
    }

    /// Force a network fetch for `key`, joining one already in flight.
    pub async fn refetch<T, F, Fut>(
        &self,
        key: &str,
        ttl_class: TtlClass,
        fetch: F,
    ) -> Result<T, FetchError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        let value = self
            .start_or_join(key, ttl_class, &erase(fetch), FetchMode::Foreground)
            .await?;
        decode(&value)
    }

    /// Warm the cache for `key` without waiting. Fresh keys are skipped.
    /// Returns whether a fetch was started or joined.
    pub fn prefetch<T, F, Fut>(&self, key: &str, ttl_class: TtlClass, fetch: F) -> bool
    where
        T: Serialize + Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        let mode = match self.inner.store.lookup(key) {
            Some((entry, Freshness::Fresh)) => {
                debug!(cache = key, "Prefetch skipped, entry is fresh");
                self.inner.record_served(key, &entry, Freshness::Fresh);
                return false;
            }
            Some((entry, Freshness::Stale)) => {
                self.inner.record_served(key, &entry, Freshness::Stale);
                FetchMode::Background
            }
            _ => FetchMode::Foreground,
        };
        let _ = self.start_or_join(key, ttl_class, &erase(fetch), mode);
        true
    }

    /// Note that a cached entry for `key` was handed to a consumer, ahead
    /// of or instead of network data.
    pub(crate) fn record_served(&self, key: &str, entry: &CacheEntry, freshness: Freshness) {
        self.inner.record_served(key, entry, freshness);
    }

    /// Return the in-flight fetch for `key`, starting one if none exists.
    ///
    /// The fetch runs as its own task, so it completes and populates the
    /// cache even if every waiter goes away.
    pub(crate) fn start_or_join(
        &self,
        key: &str,
        ttl_class: TtlClass,
        fetch: &ErasedFetch,
        mode: FetchMode,
    ) -> SharedFetch {
        let mut in_flight = self
            .inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = in_flight.get(key) {
            debug!(cache = key, "Joining in-flight fetch");
            if mode == FetchMode::Foreground {
                self.inner.update_state(key, |s| s.loading = true);
            }
            return existing.fetch.clone();
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.update_state(key, |s| {
            s.in_flight = true;
            if mode == FetchMode::Foreground {
                s.loading = true;
            }
        });
        debug!(cache = key, ?mode, "Starting fetch");

        let request = fetch();
        let inner = Arc::clone(&self.inner);
        let owned_key = key.to_string();
        let handle = tokio::spawn(async move {
            let _guard = InFlightGuard {
                inner: Arc::clone(&inner),
                key: owned_key.clone(),
                id,
            };
            let result = request.await;
            inner.settle(&owned_key, ttl_class, &result);
            result
        });

        let shared = async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => Err(FetchError::TaskFailed(e.to_string())),
            }
        }
        .boxed()
        .shared();

        in_flight.insert(
            key.to_string(),
            InFlight {
                id,
                fetch: shared.clone(),
            },
        );
        shared
    }
}

impl Inner {
    fn update_state(&self, key: &str, f: impl FnOnce(&mut FetchState)) {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        f(states.entry(key.to_string()).or_default());
    }

    fn record_served(&self, key: &str, entry: &CacheEntry, freshness: Freshness) {
        self.update_state(key, |s| {
            s.is_stale = freshness == Freshness::Stale;
            s.last_updated = Some(entry.stored_at);
        });
    }

    fn settle(&self, key: &str, ttl_class: TtlClass, result: &Result<Value, FetchError>) {
        match result {
            Ok(value) => {
                let entry = self.store.set(key, value.clone(), ttl_class);
                debug!(cache = key, tier = ?entry.tier, "Fetch succeeded");
                self.update_state(key, |s| {
                    s.loading = false;
                    s.error = None;
                    s.is_stale = false;
                    s.last_updated = Some(entry.stored_at);
                });
            }
            Err(e) => {
                // Keep whatever is cached; it is the last known good value.
                let has_fallback = self.store.has(key);
                warn!(cache = key, error = %e, has_fallback, "Fetch failed");
                self.update_state(key, |s| {
                    s.loading = false;
                    s.error = Some(e.clone());
                    s.is_stale = has_fallback;
                });
            }
        }
    }
}

/// Removes the in-flight record when the fetch task ends, including when
/// the fetch panics.
struct InFlightGuard {
    inner: Arc<Inner>,
    key: String,
    id: u64,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut in_flight = self
            .inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if in_flight.get(&self.key).map(|f| f.id) == Some(self.id) {
            in_flight.remove(&self.key);
            self.inner.update_state(&self.key, |s| {
                s.in_flight = false;
                s.loading = false;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::config::CacheConfig;
    use chrono::Duration;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::watch;

    fn coordinator() -> (FetchCoordinator, ManualClock) {
        let clock = ManualClock::default();
        let store = TieredCacheStore::in_memory(&CacheConfig::default(), Arc::new(clock.clone()));
        (FetchCoordinator::new(Arc::new(store)), clock)
    }

    /// Fetch that counts invocations and blocks until released.
    fn gated_fetch(
        calls: Arc<AtomicUsize>,
        gate: watch::Receiver<bool>,
        value: u32,
    ) -> impl Fn() -> BoxFuture<'static, Result<u32, FetchError>> + Send + Sync + 'static {
        move || {
            let calls = calls.clone();
            let mut gate = gate.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                let _ = gate.wait_for(|open| *open).await;
                Ok(value)
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn test_concurrent_refetches_share_one_request() {
        let (coordinator, _) = coordinator();
        let calls = Arc::new(AtomicUsize::new(0));
        let (gate, gate_rx) = watch::channel(false);

        let mut waiters = Vec::new();
        for _ in 0..8 {
            let c = coordinator.clone();
            let fetch = gated_fetch(calls.clone(), gate_rx.clone(), 42);
            waiters.push(tokio::spawn(async move {
                c.refetch("alerts", TtlClass::Fast, fetch).await
            }));
        }

        // Let every waiter register before releasing the request
        while !coordinator.is_in_flight("alerts") {
            tokio::task::yield_now().await;
        }
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(coordinator.state("alerts").loading);
        gate.send_replace(true);

        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), Ok(42));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!coordinator.is_in_flight("alerts"));
        assert_eq!(coordinator.store().get("alerts").unwrap().value, json!(42));

        let state = coordinator.state("alerts");
        assert!(!state.loading);
        assert!(!state.in_flight);
        assert!(state.last_updated.is_some());
    }

    #[tokio::test]
    async fn test_fresh_entry_skips_network() {
        let (coordinator, _) = coordinator();
        coordinator.store().set("rules", json!(["r1"]), TtlClass::Slow);

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let rules: Vec<String> = coordinator
            .fetch_cached("rules", TtlClass::Slow, move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(vec!["r2".to_string()]) }
            })
            .await
            .unwrap();

        assert_eq!(rules, vec!["r1".to_string()]);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stale_entry_served_and_refreshed() {
        let (coordinator, clock) = coordinator();
        coordinator.store().set("stats", json!(1), TtlClass::Normal);
        clock.advance(Duration::seconds(90));

        let value: u32 = coordinator
            .fetch_cached("stats", TtlClass::Normal, || async { Ok(2u32) })
            .await
            .unwrap();
        assert_eq!(value, 1);

        while coordinator.is_in_flight("stats") {
            tokio::task::yield_now().await;
        }
        let (entry, freshness) = coordinator.store().lookup("stats").unwrap();
        assert_eq!(entry.value, json!(2));
        assert_eq!(freshness, Freshness::Fresh);
        assert!(!coordinator.state("stats").loading);
    }

    #[tokio::test]
    async fn test_failed_fetch_keeps_cached_value() {
        let (coordinator, clock) = coordinator();
        coordinator.store().set("timeline", json!(["e1"]), TtlClass::Fast);
        clock.advance(Duration::seconds(20));
        let before = coordinator.store().get("timeline").unwrap();

        let result: Result<Vec<String>, _> = coordinator
            .refetch("timeline", TtlClass::Fast, || async {
                Err::<Vec<String>, _>(FetchError::Network("connection reset".to_string()))
            })
            .await;

        assert_eq!(result, Err(FetchError::Network("connection reset".to_string())));
        assert_eq!(coordinator.store().get("timeline").unwrap(), before);

        let state = coordinator.state("timeline");
        assert!(!state.loading);
        assert!(state.is_stale);
        assert!(state.error.is_some());
    }

    #[tokio::test]
    async fn test_error_cleared_by_next_success() {
        let (coordinator, _) = coordinator();
        let _ = coordinator
            .refetch("agents", TtlClass::Fast, || async {
                Err::<u32, _>(FetchError::ServerError("boom".to_string()))
            })
            .await;
        assert!(coordinator.state("agents").error.is_some());

        let value: u32 = coordinator
            .refetch("agents", TtlClass::Fast, || async { Ok(5u32) })
            .await
            .unwrap();
        assert_eq!(value, 5);
        assert_eq!(coordinator.state("agents").error, None);
    }

    #[tokio::test]
    async fn test_panicking_fetch_releases_key() {
        let (coordinator, _) = coordinator();
        let result: Result<u32, _> = coordinator
            .refetch("broken", TtlClass::Fast, || async {
                if true {
                    panic!("provider bug");
                }
                Ok(1u32)
            })
            .await;

        assert!(matches!(result, Err(FetchError::TaskFailed(_))));
        assert!(!coordinator.is_in_flight("broken"));
        assert!(!coordinator.state("broken").loading);
    }

    #[tokio::test]
    async fn test_prefetch_skips_fresh_keys() {
        let (coordinator, _) = coordinator();
        assert!(coordinator.prefetch("events", TtlClass::Normal, || async { Ok(3u32) }));
        while coordinator.is_in_flight("events") {
            tokio::task::yield_now().await;
        }
        assert_eq!(coordinator.store().get("events").unwrap().value, json!(3));
        assert!(!coordinator.prefetch("events", TtlClass::Normal, || async { Ok(4u32) }));
    }

    #[tokio::test]
    async fn test_state_reports_stale_serve_until_refresh_lands() {
        let (coordinator, clock) = coordinator();
        let stored = coordinator.store().set("stats", json!(1), TtlClass::Normal);
        clock.advance(Duration::seconds(90));

        let calls = Arc::new(AtomicUsize::new(0));
        let (gate, gate_rx) = watch::channel(false);
        let served: u32 = coordinator
            .fetch_cached("stats", TtlClass::Normal, gated_fetch(calls, gate_rx, 2))
            .await
            .unwrap();
        assert_eq!(served, 1);

        let state = coordinator.state("stats");
        assert!(state.in_flight);
        assert!(!state.loading);
        assert!(state.is_stale);
        assert_eq!(state.last_updated, Some(stored.stored_at));

        gate.send_replace(true);
        while coordinator.is_in_flight("stats") {
            tokio::task::yield_now().await;
        }
        let state = coordinator.state("stats");
        assert!(!state.is_stale);
        assert_eq!(state.last_updated, Some(clock.now()));
    }
}
