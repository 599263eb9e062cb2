use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::{debug, info, warn};

use super::gate::PreloadGate;
use super::idle::IdleTaskScheduler;
use super::registry::PreloadRegistry;
use crate::clock::Clock;
use crate::config::PreloadConfig;
use crate::fetch::FetchCoordinator;
use crate::navigation::{HoverOutcome, NavigationEvent, NavigationPredictor};

struct ManagerInner {
    config: PreloadConfig,
    registry: Arc<PreloadRegistry>,
    coordinator: FetchCoordinator,
    gate: Arc<PreloadGate>,
    scheduler: IdleTaskScheduler,
    predictor: Mutex<NavigationPredictor>,
    clock: Arc<dyn Clock>,
    immediate_scheduled: AtomicBool,
}

/// Drives preloading from navigation and hover events.
///
/// One instance per session, constructed by the host and shared by cloning.
/// Scheduled work holds only a weak reference, so dropping the last handle
/// cancels everything still waiting for idle time.
#[derive(Clone)]
pub struct PreloadManager {
    inner: Arc<ManagerInner>,
}

impl PreloadManager {
    pub fn new(
        config: PreloadConfig,
        registry: Arc<PreloadRegistry>,
        coordinator: FetchCoordinator,
        gate: Arc<PreloadGate>,
        scheduler: IdleTaskScheduler,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let predictor = NavigationPredictor::new(&config);
        Self {
            inner: Arc::new(ManagerInner {
                config,
                registry,
                coordinator,
                gate,
                scheduler,
                predictor: Mutex::new(predictor),
                clock,
                immediate_scheduled: AtomicBool::new(false),
            }),
        }
    }

    fn predictor(&self) -> MutexGuard<'_, NavigationPredictor> {
        self.inner
            .predictor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // ===== Events =====

    /// Schedule the immediate bundle for the next idle period. Happens at
    /// most once per manager; a call refused by the gate does not count.
    pub fn start(&self) {
        if self.inner.registry.immediate_bundle().is_empty() || !self.can_preload() {
            return;
        }
        if self.inner.immediate_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }

        let pages: Vec<String> = self
            .inner
            .registry
            .immediate_bundle()
            .into_iter()
            .map(|p| p.to_string())
            .collect();
        info!(pages = pages.len(), "Scheduling immediate preload bundle");

        let weak = Arc::downgrade(&self.inner);
        self.inner
            .scheduler
            .on_idle(self.inner.config.idle_fallback(), move || async move {
                for page in pages {
                    match upgrade(&weak) {
                        Some(manager) => {
                            manager.preload_page(&page).await;
                        }
                        None => return,
                    }
                }
            });
    }

    /// Record a route change and schedule preloads for the pages the user
    /// is likely to open next.
    pub fn on_navigate(&self, path: &str) -> NavigationEvent {
        let now = self.inner.clock.now();
        let (event, candidates) = {
            let mut predictor = self.predictor();
            let event = predictor.track_navigation(path, now).clone();

            let mut candidates = predictor.priority_candidates();
            for page in predictor.predict_next_pages(&event.page_id) {
                if !candidates.contains(&page) {
                    candidates.push(page);
                }
            }
            candidates.retain(|page| {
                *page != event.page_id
                    && !predictor.is_preloaded(page)
                    && self.inner.registry.contains(page)
            });
            (event, candidates)
        };
        debug!(path, page = %event.page_id, "Tracked navigation");

        if !self.can_preload() {
            return event;
        }
        self.start();

        for (index, page) in candidates.into_iter().enumerate() {
            let delay = self.inner.config.stagger_delay(index);
            debug!(page = %page, ?delay, "Scheduling predicted preload");
            let weak = Arc::downgrade(&self.inner);
            self.inner.scheduler.on_idle_after(
                delay,
                self.inner.config.idle_fallback(),
                move || async move {
                    if let Some(manager) = upgrade(&weak) {
                        manager.preload_page(&page).await;
                    }
                },
            );
        }
        event
    }

    /// Record hover intent on a link to `page_id`. Once the page has been
    /// hovered often enough it is preloaded right away.
    pub fn on_hover_target(&self, page_id: &str) -> HoverOutcome {
        let (outcome, preloaded) = {
            let mut predictor = self.predictor();
            let outcome = predictor.track_hover(page_id);
            (outcome, predictor.is_preloaded(page_id))
        };

        if outcome.is_priority
            && !preloaded
            && self.inner.registry.contains(page_id)
            && self.can_preload()
        {
            let weak = Arc::downgrade(&self.inner);
            let page = page_id.to_string();
            self.inner.scheduler.run_now(move || async move {
                if let Some(manager) = upgrade(&weak) {
                    manager.preload_page(&page).await;
                }
            });
        }
        outcome
    }

    /// Prefetch the page's data and load its component. Returns whether the
    /// page is preloaded afterwards. Failures are logged, never returned.
    pub async fn preload_page(&self, page_id: &str) -> bool {
        if self.is_preloaded(page_id) {
            return true;
        }
        if !self.can_preload() {
            return false;
        }
        let Some(entry) = self.inner.registry.get(page_id) else {
            debug!(page = page_id, "No preloadable registered");
            return false;
        };

        entry.prefetch_data(&self.inner.coordinator);
        match entry.load_component().await {
            Ok(()) => {
                if self.predictor().mark_preloaded(page_id) {
                    debug!(page = page_id, "Page preloaded");
                }
                true
            }
            Err(e) => {
                warn!(page = page_id, error = %e, "Preload failed");
                false
            }
        }
    }

    /// Cancel pending idle work and trim the navigation history.
    pub fn teardown(&self) {
        self.inner.scheduler.cancel_all();
        self.predictor().cleanup();
        info!("Preload manager torn down");
    }

    // ===== Queries =====

    pub fn can_preload(&self) -> bool {
        self.inner.gate.can_preload()
    }

    pub fn is_preloaded(&self, page_id: &str) -> bool {
        self.predictor().is_preloaded(page_id)
    }

    /// Preloaded page ids, sorted.
    pub fn preloaded_pages(&self) -> Vec<String> {
        let mut pages: Vec<String> = self.predictor().preloaded().map(str::to_string).collect();
        pages.sort();
        pages
    }

    /// Predictions from the current page.
    pub fn predict_next_pages(&self) -> Vec<String> {
        let predictor = self.predictor();
        match predictor.current_page() {
            Some(current) => predictor.predict_next_pages(current),
            None => Vec::new(),
        }
    }

    pub fn navigation_patterns(&self) -> HashMap<String, u32> {
        self.predictor().navigation_patterns()
    }

    pub fn hover_count(&self, page_id: &str) -> u32 {
        self.predictor().hover_count(page_id)
    }

    pub fn pending_tasks(&self) -> usize {
        self.inner.scheduler.pending_count()
    }

    pub fn gate(&self) -> &Arc<PreloadGate> {
        &self.inner.gate
    }

    pub fn coordinator(&self) -> &FetchCoordinator {
        &self.inner.coordinator
    }

    pub fn registry(&self) -> &Arc<PreloadRegistry> {
        &self.inner.registry
    }
}

fn upgrade(weak: &Weak<ManagerInner>) -> Option<PreloadManager> {
    weak.upgrade().map(|inner| PreloadManager { inner })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::cache::{TieredCacheStore, TtlClass};
    use crate::clock::ManualClock;
    use crate::config::CacheConfig;
    use crate::fetch::FetchError;
    use crate::preload::gate::{NetworkConditions, StaticConditionProbe};
    use crate::preload::idle::NeverIdle;
    use crate::preload::registry::{PreloadError, PreloadRegistryBuilder, Priority};
    use crate::test_support::init_tracing;

    type LoadLog = Arc<Mutex<Vec<(String, Duration)>>>;

    struct Harness {
        manager: PreloadManager,
        log: LoadLog,
        probe: Arc<StaticConditionProbe>,
        started: tokio::time::Instant,
    }

    impl Harness {
        fn loaded(&self) -> Vec<String> {
            self.log.lock().unwrap().iter().map(|(p, _)| p.clone()).collect()
        }

        fn loaded_at(&self, page: &str) -> Option<Duration> {
            self.log
                .lock()
                .unwrap()
                .iter()
                .find(|(p, _)| p == page)
                .map(|(_, at)| *at)
        }
    }

    fn register(
        builder: PreloadRegistryBuilder,
        log: &LoadLog,
        started: tokio::time::Instant,
        page: &'static str,
        priority: Priority,
    ) -> PreloadRegistryBuilder {
        let log = Arc::clone(log);
        builder
            .register(page, priority, move || {
                let log = Arc::clone(&log);
                async move {
                    log.lock()
                        .unwrap()
                        .push((page.to_string(), started.elapsed()));
                    Ok(())
                }
            })
            .unwrap()
    }

    fn harness(pages: &[(&'static str, Priority)]) -> Harness {
        init_tracing();
        let log: LoadLog = Arc::new(Mutex::new(Vec::new()));
        let started = tokio::time::Instant::now();
        let mut builder = PreloadRegistry::builder();
        for &(page, priority) in pages {
            builder = register(builder, &log, started, page, priority);
        }
        let (manager, probe) = manager_with(builder.build());
        Harness {
            manager,
            log,
            probe,
            started,
        }
    }

    fn manager_with(registry: Arc<PreloadRegistry>) -> (PreloadManager, Arc<StaticConditionProbe>) {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(TieredCacheStore::in_memory(&CacheConfig::default(), clock.clone()));
        let probe = Arc::new(StaticConditionProbe::default());
        let config = PreloadConfig::default();
        let gate = Arc::new(PreloadGate::new(probe.clone(), &config));
        let manager = PreloadManager::new(
            config,
            registry,
            FetchCoordinator::new(store),
            gate,
            IdleTaskScheduler::new(Arc::new(NeverIdle)),
            clock,
        );
        (manager, probe)
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_bundle_runs_once_per_session() {
        let h = harness(&[
            ("dashboard", Priority::Immediate),
            ("security-events", Priority::Immediate),
            ("timeline", Priority::Lazy),
        ]);

        h.manager.on_navigate("/");
        h.manager.on_navigate("/security-events");
        tokio::time::sleep(Duration::from_millis(1999)).await;
        assert!(h.loaded().is_empty());

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(h.loaded(), vec!["dashboard", "security-events"]);
        assert_eq!(h.manager.preloaded_pages(), vec!["dashboard", "security-events"]);

        // Back to a page whose only prediction is already preloaded
        h.manager.on_navigate("/");
        assert_eq!(h.manager.pending_tasks(), 0);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(h.loaded().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_predictions_are_staggered() {
        let h = harness(&[
            ("dashboard", Priority::Lazy),
            ("alerts", Priority::Lazy),
            ("timeline", Priority::Lazy),
        ]);

        // Build history without scheduling anything
        h.manager.gate().set_opt_out(true);
        for path in ["/dashboard", "/alerts", "/dashboard", "/timeline", "/dashboard"] {
            h.manager.on_navigate(path);
        }
        assert_eq!(h.manager.pending_tasks(), 0);
        assert_eq!(h.manager.predict_next_pages(), vec!["timeline", "alerts"]);

        h.manager.gate().set_opt_out(false);
        h.manager.on_navigate("/dashboard/overview");
        assert_eq!(h.manager.pending_tasks(), 2);

        tokio::time::sleep(Duration::from_millis(2600)).await;
        assert_eq!(h.loaded(), vec!["timeline"]);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(h.loaded(), vec!["timeline", "alerts"]);
        let first = h.loaded_at("timeline").unwrap();
        let second = h.loaded_at("alerts").unwrap();
        assert!(first >= Duration::from_millis(2500));
        assert!(second >= first + Duration::from_millis(250));
        assert!(h.started.elapsed() >= second);
    }

    #[tokio::test(start_paused = true)]
    async fn test_save_data_blocks_all_preloading() {
        let h = harness(&[
            ("dashboard", Priority::Immediate),
            ("yara-rules", Priority::Lazy),
        ]);
        h.probe.set(NetworkConditions {
            save_data: Some(true),
            ..NetworkConditions::default()
        });

        h.manager.on_navigate("/dashboard");
        h.manager.on_navigate("/yara-rules");
        h.manager.on_navigate("/dashboard");
        for _ in 0..5 {
            h.manager.on_hover_target("yara-rules");
        }
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert!(h.loaded().is_empty());
        assert!(!h.manager.preload_page("yara-rules").await);
        assert!(h.manager.preloaded_pages().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_third_hover_triggers_preload() {
        let h = harness(&[("yara-rules", Priority::Lazy)]);

        assert!(!h.manager.on_hover_target("yara-rules").is_priority);
        assert!(!h.manager.on_hover_target("yara-rules").is_priority);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(h.loaded().is_empty());

        let third = h.manager.on_hover_target("yara-rules");
        assert!(third.promoted);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.loaded(), vec!["yara-rules"]);
        assert!(h.manager.is_preloaded("yara-rules"));

        // Unregistered pages are tracked but never loaded
        for _ in 0..3 {
            h.manager.on_hover_target("reports");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.manager.hover_count("reports"), 3);
        assert_eq!(h.loaded().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_cancels_hover_preload() {
        let h = harness(&[("yara-rules", Priority::Lazy)]);

        for _ in 0..3 {
            h.manager.on_hover_target("yara-rules");
        }
        assert_eq!(h.manager.pending_tasks(), 1);
        h.manager.teardown();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(h.loaded().is_empty());
        assert!(!h.manager.is_preloaded("yara-rules"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hover_preload_does_not_outlive_manager() {
        let h = harness(&[("yara-rules", Priority::Lazy)]);
        let weak = Arc::downgrade(&h.manager.inner);

        for _ in 0..3 {
            h.manager.on_hover_target("yara-rules");
        }
        let Harness { manager, log, .. } = h;
        drop(manager);

        assert!(weak.upgrade().is_none());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_mixed_case_routes_match_registered_pages() {
        let h = harness(&[("alerts", Priority::Lazy), ("timeline", Priority::Lazy)]);
        h.manager.gate().set_opt_out(true);
        for path in ["/Alerts", "/Timeline", "/ALERTS"] {
            h.manager.on_navigate(path);
        }
        h.manager.gate().set_opt_out(false);

        h.manager.on_navigate("/alerts/3");
        tokio::time::sleep(Duration::from_millis(2600)).await;
        assert_eq!(h.loaded(), vec!["timeline"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_cancels_pending_work() {
        let h = harness(&[("dashboard", Priority::Immediate)]);

        h.manager.on_navigate("/");
        assert_eq!(h.manager.pending_tasks(), 1);
        h.manager.teardown();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(h.loaded().is_empty());
        assert_eq!(h.manager.pending_tasks(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_loader_is_swallowed() {
        init_tracing();
        let registry = PreloadRegistry::builder()
            .register("timeline", Priority::Lazy, || async {
                Err(PreloadError::load("timeline", "chunk failed to load"))
            })
            .and_then(|b| b.register("alerts", Priority::Lazy, || async { Ok(()) }))
            .unwrap()
            .build();
        let (manager, _) = manager_with(registry);

        assert!(!manager.preload_page("timeline").await);
        assert!(manager.preload_page("alerts").await);
        assert!(!manager.preload_page("unknown").await);
        assert_eq!(manager.preloaded_pages(), vec!["alerts"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_preload_warms_page_data() {
        init_tracing();
        let registry = PreloadRegistry::builder()
            .register_with_prefetch(
                "security-events",
                Priority::Lazy,
                || async { Ok(()) },
                |coordinator: &FetchCoordinator| {
                    coordinator.prefetch("security-events:list", TtlClass::Fast, || async {
                        Ok::<_, FetchError>(vec!["evt-1", "evt-2"])
                    });
                },
            )
            .unwrap()
            .build();
        let (manager, _) = manager_with(registry);

        assert!(manager.preload_page("security-events").await);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let cached = manager.coordinator().store().get("security-events:list").unwrap();
        assert_eq!(cached.value, serde_json::json!(["evt-1", "evt-2"]));
    }
}
