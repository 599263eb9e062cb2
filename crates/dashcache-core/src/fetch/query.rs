use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

use super::coordinator::{decode, ErasedFetch, FetchMode};
use super::{FetchCoordinator, FetchError};
use crate::cache::{Freshness, TtlClass};

#[derive(Debug, Clone, PartialEq)]
pub struct QueryOptions {
    pub cache_key: String,
    pub ttl_class: TtlClass,
    /// Proactively refetch on this period, regardless of staleness.
    pub refresh_interval: Option<Duration>,
    /// Request parameters the data depends on. They are folded into the
    /// effective cache key, and changing them reloads the query.
    pub dependencies: Vec<String>,
}

impl QueryOptions {
    pub fn new(cache_key: impl Into<String>, ttl_class: TtlClass) -> Self {
        Self {
            cache_key: cache_key.into(),
            ttl_class,
            refresh_interval: None,
            dependencies: Vec::new(),
        }
    }

    pub fn refresh_every(mut self, interval: Duration) -> Self {
        self.refresh_interval = Some(interval);
        self
    }

    pub fn depends_on<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = dependencies.into_iter().map(Into::into).collect();
        self
    }

    /// `cache_key` alone, or `cache_key?dep1&dep2` when there are dependencies.
    pub fn effective_key(&self) -> String {
        if self.dependencies.is_empty() {
            self.cache_key.clone()
        } else {
            format!("{}?{}", self.cache_key, self.dependencies.join("&"))
        }
    }
}

/// What a consumer renders from.
#[derive(Debug, PartialEq)]
pub struct QuerySnapshot<T> {
    pub data: Option<Arc<T>>,
    pub loading: bool,
    pub error: Option<FetchError>,
    pub is_stale: bool,
    pub last_updated: Option<DateTime<Utc>>,
}

impl<T> Clone for QuerySnapshot<T> {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            loading: self.loading,
            error: self.error.clone(),
            is_stale: self.is_stale,
            last_updated: self.last_updated,
        }
    }
}

impl<T> Default for QuerySnapshot<T> {
    fn default() -> Self {
        Self {
            data: None,
            loading: false,
            error: None,
            is_stale: false,
            last_updated: None,
        }
    }
}

struct QueryShared<T> {
    coordinator: FetchCoordinator,
    fetch: ErasedFetch,
    options: Mutex<QueryOptions>,
    tx: watch::Sender<QuerySnapshot<T>>,
}

/// Live subscription to one cache key. Dropping it unmounts the consumer:
/// the refresh timer stops and pending fetches no longer update it, though
/// they still complete and populate the cache.
pub struct CachedQuery<T> {
    shared: Arc<QueryShared<T>>,
    refresh_task: Option<JoinHandle<()>>,
}

impl<T> CachedQuery<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    pub(crate) fn mount(
        coordinator: FetchCoordinator,
        fetch: ErasedFetch,
        options: QueryOptions,
    ) -> Self {
        let refresh_interval = options.refresh_interval;
        let (tx, _) = watch::channel(QuerySnapshot::default());
        let shared = Arc::new(QueryShared {
            coordinator,
            fetch,
            options: Mutex::new(options),
            tx,
        });

        shared.load(false);
        let refresh_task = refresh_interval.map(|period| spawn_refresh(&shared, period));

        Self {
            shared,
            refresh_task,
        }
    }

    pub fn snapshot(&self) -> QuerySnapshot<T> {
        self.shared.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<QuerySnapshot<T>> {
        self.shared.tx.subscribe()
    }

    pub fn cache_key(&self) -> String {
        self.shared.options().effective_key()
    }

    /// Wait until no foreground fetch is pending.
    pub async fn settled(&self) -> QuerySnapshot<T> {
        let mut rx = self.subscribe();
        let snapshot = match rx.wait_for(|s| !s.loading).await {
            Ok(snapshot) => snapshot.clone(),
            Err(_) => self.snapshot(),
        };
        snapshot
    }

    /// Bypass the freshness check and fetch now. Joins a fetch already in
    /// flight for the key instead of issuing another.
    pub async fn refetch(&self) -> QuerySnapshot<T> {
        if let Some(handle) = self.shared.load(true) {
            let _ = handle.await;
        }
        self.snapshot()
    }

    /// Reload when the dependencies differ from the current ones.
    pub fn set_dependencies<I, S>(&self, dependencies: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let dependencies: Vec<String> = dependencies.into_iter().map(Into::into).collect();
        {
            let mut options = self
                .shared
                .options
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if options.dependencies == dependencies {
                return;
            }
            options.dependencies = dependencies;
        }
        self.shared.load(false);
    }
}

impl<T> Drop for CachedQuery<T> {
    fn drop(&mut self) {
        if let Some(task) = self.refresh_task.take() {
            task.abort();
        }
    }
}

impl<T> QueryShared<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    fn options(&self) -> QueryOptions {
        self.options
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Resolve the current key from cache or network. Returns the task
    /// waiting on a fetch, if one was needed.
    fn load(self: &Arc<Self>, force: bool) -> Option<JoinHandle<()>> {
        let options = self.options();
        let key = options.effective_key();
        let store = self.coordinator.store();

        if !force {
            if let Some((entry, freshness)) = store.lookup(&key) {
                match (freshness, decode::<T>(&entry.value)) {
                    (Freshness::Fresh, Ok(data)) => {
                        debug!(cache = %key, "Serving fresh cache entry");
                        self.coordinator.record_served(&key, &entry, freshness);
                        self.tx.send_modify(|s| {
                            s.data = Some(Arc::new(data));
                            s.loading = false;
                            s.error = None;
                            s.is_stale = false;
                            s.last_updated = Some(entry.stored_at);
                        });
                        return None;
                    }
                    (Freshness::Stale, Ok(data)) => {
                        debug!(cache = %key, "Serving stale cache entry, refreshing in background");
                        self.coordinator.record_served(&key, &entry, freshness);
                        self.tx.send_modify(|s| {
                            s.data = Some(Arc::new(data));
                            s.loading = false;
                            s.is_stale = true;
                            s.last_updated = Some(entry.stored_at);
                        });
                        return Some(self.spawn_fetch(key, options.ttl_class, FetchMode::Background));
                    }
                    (_, Err(e)) => {
                        debug!(cache = %key, error = %e, "Cached value does not decode, refetching");
                    }
                    _ => {}
                }
            }
        }

        self.tx.send_modify(|s| {
            s.loading = true;
            if !force {
                // Expired or absent data is never handed out
                s.data = None;
                s.is_stale = false;
                s.last_updated = None;
            }
        });
        Some(self.spawn_fetch(key, options.ttl_class, FetchMode::Foreground))
    }

    fn spawn_fetch(
        self: &Arc<Self>,
        key: String,
        ttl_class: TtlClass,
        mode: FetchMode,
    ) -> JoinHandle<()> {
        let fetch = self
            .coordinator
            .start_or_join(&key, ttl_class, &self.fetch, mode);
        let weak: Weak<Self> = Arc::downgrade(self);

        tokio::spawn(async move {
            let result = fetch.await;
            let Some(this) = weak.upgrade() else {
                debug!(cache = %key, "Consumer unmounted before fetch settled");
                return;
            };
            if this.options().effective_key() != key {
                debug!(cache = %key, "Dependencies changed while fetching, dropping result");
                return;
            }
            this.apply(&key, result);
        })
    }

    fn apply(&self, key: &str, result: Result<serde_json::Value, FetchError>) {
        match result.and_then(|value| decode::<T>(&value)) {
            Ok(data) => {
                let last_updated = self.coordinator.state(key).last_updated;
                self.tx.send_modify(|s| {
                    s.data = Some(Arc::new(data));
                    s.loading = false;
                    s.error = None;
                    s.is_stale = false;
                    s.last_updated = last_updated;
                });
            }
            Err(e) => {
                // Fall back to last-known-good data, whatever its age
                let fallback = self
                    .coordinator
                    .store()
                    .get(key)
                    .and_then(|entry| decode::<T>(&entry.value).ok().map(|d| (d, entry.stored_at)));
                self.tx.send_modify(|s| {
                    if let Some((data, stored_at)) = fallback {
                        s.data = Some(Arc::new(data));
                        s.last_updated = Some(stored_at);
                    }
                    s.loading = false;
                    s.is_stale = s.data.is_some();
                    s.error = Some(e);
                });
            }
        }
    }
}

fn spawn_refresh<T>(shared: &Arc<QueryShared<T>>, period: Duration) -> JoinHandle<()>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    let weak = Arc::downgrade(shared);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let handle = match weak.upgrade() {
                Some(this) => this.load(true),
                None => break,
            };
            if let Some(handle) = handle {
                let _ = handle.await;
            }
        }
    })
}
