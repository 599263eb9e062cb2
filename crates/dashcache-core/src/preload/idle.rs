use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::{self, BoxFuture, FutureExt};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::debug;

/// Source of "the host has spare capacity" notifications
/// (`requestIdleCallback` in a browser).
pub trait IdleSignal: Send + Sync {
    /// Resolves at the next idle period.
    fn idle(&self) -> BoxFuture<'static, ()>;
}

/// Never reports idle time. Work runs when its fallback timer fires.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverIdle;

impl IdleSignal for NeverIdle {
    fn idle(&self) -> BoxFuture<'static, ()> {
        future::pending().boxed()
    }
}

/// Idle signal driven by the host calling [`ManualIdleSignal::notify_idle`].
#[derive(Debug, Clone, Default)]
pub struct ManualIdleSignal {
    notify: Arc<Notify>,
}

impl ManualIdleSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake every task currently waiting for idle time.
    pub fn notify_idle(&self) {
        self.notify.notify_waiters();
    }
}

impl IdleSignal for ManualIdleSignal {
    fn idle(&self) -> BoxFuture<'static, ()> {
        let notify = Arc::clone(&self.notify);
        async move { notify.notified().await }.boxed()
    }
}

/// Runs deferred work when the host is idle, or after a fallback delay so
/// work is never starved by a permanently busy host.
pub struct IdleTaskScheduler {
    signal: Arc<dyn IdleSignal>,
    pending: Mutex<Vec<JoinHandle<()>>>,
}

impl IdleTaskScheduler {
    pub fn new(signal: Arc<dyn IdleSignal>) -> Self {
        Self {
            signal,
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Run `task` at the next idle period, at the latest after `fallback`.
    pub fn on_idle<F, Fut>(&self, fallback: Duration, task: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.schedule(Duration::ZERO, fallback, task);
    }

    /// Like [`on_idle`](Self::on_idle), but only start waiting for idle time
    /// after `delay`. Used to stagger several preloads.
    pub fn on_idle_after<F, Fut>(&self, delay: Duration, fallback: Duration, task: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.schedule(delay, fallback, task);
    }

    fn schedule<F, Fut>(&self, delay: Duration, fallback: Duration, task: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let signal = Arc::clone(&self.signal);
        self.track(tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            tokio::select! {
                _ = signal.idle() => debug!("Running idle task"),
                _ = tokio::time::sleep(fallback) => debug!(?fallback, "Idle fallback elapsed, running task"),
            }
            task().await;
        }));
    }

    /// Start `task` right away without waiting for idle time. It is still
    /// cancelled by [`cancel_all`](Self::cancel_all).
    pub fn run_now<F, Fut>(&self, task: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.track(tokio::spawn(async move { task().await }));
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        pending.retain(|h| !h.is_finished());
        pending.push(handle);
    }

    /// Registrations that have not run to completion yet.
    pub fn pending_count(&self) -> usize {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        pending.retain(|h| !h.is_finished());
        pending.len()
    }

    /// Abort every pending registration. Called on teardown.
    pub fn cancel_all(&self) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let cancelled = pending.len();
        for handle in pending.drain(..) {
            handle.abort();
        }
        if cancelled > 0 {
            debug!(cancelled, "Cancelled pending idle tasks");
        }
    }
}

impl Drop for IdleTaskScheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
