use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures_util::{FutureExt, StreamExt};
use tokio::sync::watch;
use tracing::debug;

use super::{LoadError, LoadHandle, LoadScope};
use crate::connection::{DeviceId, FailureSink};
use crate::error::RelayError;
use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Tier {
    Cache,
    Fast,
    Full,
}

/// What the caller renders for one coordinator.
#[derive(Debug, Clone, PartialEq)]
pub struct TieredView<K, T> {
    pub key: Option<K>,
    pub value: Option<T>,
    /// Tier that produced `value`.
    pub tier: Option<Tier>,
    pub is_loading: bool,
    pub error: Option<LoadError>,
    pub generation: u64,
}

impl<K, T> Default for TieredView<K, T> {
    fn default() -> Self {
        Self {
            key: None,
            value: None,
            tier: None,
            is_loading: false,
            error: None,
            generation: 0,
        }
    }
}

type Probe<K, T> = Box<dyn FnOnce(&K) -> Option<T> + Send>;
type Sufficient<T> = Box<dyn Fn(&T) -> bool + Send>;
type Fetch<T> = Box<dyn FnOnce() -> BoxFuture<'static, Result<T, RelayError>> + Send>;
type Merge<T> = Box<dyn FnOnce(Option<T>, T) -> T + Send>;

/// One tiered load: an optional cache probe plus the fast and full remote fetches.
pub struct FetchRequest<K, T> {
    key: K,
    probe: Option<Probe<K, T>>,
    sufficient: Option<Sufficient<T>>,
    fast: Fetch<T>,
    full: Fetch<T>,
    merge: Option<Merge<T>>,
    timeout: Option<Duration>,
    device: Option<DeviceId>,
}

impl<K, T> FetchRequest<K, T>
where
    T: Send + 'static,
{
    pub fn new<F1, Fut1, F2, Fut2>(key: K, fast: F1, full: F2) -> Self
    where
        F1: FnOnce() -> Fut1 + Send + 'static,
        Fut1: Future<Output = Result<T, RelayError>> + Send + 'static,
        F2: FnOnce() -> Fut2 + Send + 'static,
        Fut2: Future<Output = Result<T, RelayError>> + Send + 'static,
    {
        Self {
            key,
            probe: None,
            sufficient: None,
            fast: Box::new(move || fast().boxed()),
            full: Box::new(move || full().boxed()),
            merge: None,
            timeout: None,
            device: None,
        }
    }

    pub fn cache(mut self, probe: impl FnOnce(&K) -> Option<T> + Send + 'static) -> Self {
        self.probe = Some(Box::new(probe));
        self
    }

    /// Completeness predicate for cached values. Without one, any hit is sufficient.
    pub fn sufficient(mut self, predicate: impl Fn(&T) -> bool + Send + 'static) -> Self {
        self.sufficient = Some(Box::new(predicate));
        self
    }

    /// Combines the value on screen with the full result. Defaults to replacing it.
    pub fn merge(mut self, merge: impl FnOnce(Option<T>, T) -> T + Send + 'static) -> Self {
        self.merge = Some(Box::new(merge));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Device whose connection-loss failures and timeouts are reported back to the
    /// supervisor.
    pub fn report_to(mut self, device: DeviceId) -> Self {
        self.device = Some(device);
        self
    }
}

struct Inner<K, T> {
    scope: LoadScope,
    view: watch::Sender<TieredView<K, T>>,
    failures: Option<Arc<dyn FailureSink>>,
}

/// Runs [`FetchRequest`]s for one slot and publishes the resulting [`TieredView`].
pub struct TieredFetchCoordinator<K, T> {
    inner: Arc<Inner<K, T>>,
}

impl<K, T> Clone for TieredFetchCoordinator<K, T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, T> fmt::Debug for TieredFetchCoordinator<K, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TieredFetchCoordinator")
            .field("slot", &self.inner.scope.slot())
            .finish()
    }
}

impl<K, T> TieredFetchCoordinator<K, T>
where
    K: Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub fn new(slot: impl Into<String>, default_timeout: Duration) -> Self {
        Self::with_scope(LoadScope::new(slot, default_timeout), None)
    }

    pub fn with_scope(scope: LoadScope, failures: Option<Arc<dyn FailureSink>>) -> Self {
        let (view, _) = watch::channel(TieredView::default());
        Self {
            inner: Arc::new(Inner {
                scope,
                view,
                failures,
            }),
        }
    }

    pub fn with_failure_sink(slot: impl Into<String>, default_timeout: Duration, sink: Arc<dyn FailureSink>) -> Self {
        Self::with_scope(LoadScope::new(slot, default_timeout), Some(sink))
    }

    pub fn scope(&self) -> &LoadScope {
        &self.inner.scope
    }

    pub fn view(&self) -> TieredView<K, T> {
        self.inner.view.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<TieredView<K, T>> {
        self.inner.view.subscribe()
    }

    /// Stream of rendered states, starting with the current one.
    pub fn updates(&self) -> BoxStream<'static, TieredView<K, T>> {
        let rx = self.subscribe();
        futures::stream::unfold((rx, true), |(mut rx, first)| async move {
            if !first && rx.changed().await.is_err() {
                return None;
            }
            let view = rx.borrow_and_update().clone();
            Some((view, (rx, false)))
        })
        .boxed()
    }

    /// Cancels the current load. The view stops loading and keeps what it rendered.
    pub fn cancel(&self) {
        let view = &self.inner.view;
        self.inner.scope.cancel_current_with(|| {
            view.send_modify(|v| v.is_loading = false);
        });
    }

    /// Starts `request`, superseding any load in flight on this coordinator.
    pub fn load(&self, request: FetchRequest<K, T>) -> LoadHandle {
        let FetchRequest {
            key,
            probe,
            sufficient,
            fast,
            full,
            merge,
            timeout,
            device,
        } = request;
        let scope = &self.inner.scope;

        let weak = Arc::downgrade(&self.inner);
        let expired_on = device.clone();
        let on_timeout: super::TimeoutHook = Box::new(move |handle: &LoadHandle| {
            if let Some(inner) = weak.upgrade() {
                let generation = handle.generation();
                inner.view.send_modify(|v| {
                    if v.generation == generation {
                        v.is_loading = false;
                        v.error = Some(LoadError::Timeout);
                    }
                });
                inner.report(expired_on.as_ref(), &RelayError::Timeout);
            }
        });
        let handle = scope.begin_with(timeout.unwrap_or(scope.default_timeout()), Some(on_timeout));

        scope.apply(&handle, || {
            self.inner.view.send_replace(TieredView {
                key: Some(key.clone()),
                value: None,
                tier: None,
                is_loading: true,
                error: None,
                generation: handle.generation(),
            });
        });

        // Tier 1 completes before any remote tier starts.
        let mut satisfied = false;
        if let Some(hit) = probe.and_then(|probe| probe(&key)) {
            satisfied = sufficient.as_ref().map_or(true, |is_enough| is_enough(&hit));
            let view = &self.inner.view;
            let render = || {
                view.send_modify(|v| {
                    v.value = Some(hit);
                    v.tier = Some(Tier::Cache);
                    v.is_loading = !satisfied;
                })
            };
            if satisfied {
                scope.finish_with(&handle, render);
            } else {
                scope.apply(&handle, render);
            }
            debug!(
                target = "harbor::tiered",
                slot = scope.slot(),
                generation = handle.generation(),
                satisfied,
                "cache hit"
            );
        }

        if !satisfied {
            self.spawn_fast(handle.clone(), fast, device.clone());
        }
        self.spawn_full(handle.clone(), full, merge, device);
        handle
    }

    fn spawn_fast(&self, handle: LoadHandle, fast: Fetch<T>, device: Option<DeviceId>) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                _ = handle.cancelled() => return,
                result = fast() => result,
            };
            match result {
                Ok(value) => {
                    inner.scope.finish_with(&handle, || {
                        inner.view.send_modify(|v| {
                            // Never replace richer data that already landed.
                            if v.tier != Some(Tier::Full) {
                                v.value = Some(value);
                                v.tier = Some(Tier::Fast);
                            }
                            v.is_loading = false;
                            v.error = None;
                        })
                    });
                }
                Err(err) => {
                    inner.report(device.as_ref(), &err);
                    let load_err = LoadError::Relay(err);
                    inner.scope.fail_with(&handle, load_err.clone(), || {
                        inner.view.send_modify(|v| {
                            if v.tier != Some(Tier::Full) {
                                v.error = Some(load_err);
                            }
                            v.is_loading = false;
                        })
                    });
                }
            }
        });
    }

    fn spawn_full(
        &self,
        handle: LoadHandle,
        full: Fetch<T>,
        merge: Option<Merge<T>>,
        device: Option<DeviceId>,
    ) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                _ = handle.cancelled() => return,
                result = full() => result,
            };
            match result {
                Ok(value) => {
                    inner.scope.finish_with(&handle, || {
                        inner.view.send_modify(|v| {
                            let merged = match merge {
                                Some(merge) => merge(v.value.take(), value),
                                None => value,
                            };
                            v.value = Some(merged);
                            v.tier = Some(Tier::Full);
                            v.is_loading = false;
                            v.error = None;
                        })
                    });
                }
                Err(err) => {
                    metrics::HYDRATION_FAILURES
                        .with_label_values(&[handle.slot()])
                        .inc();
                    debug!(
                        target = "harbor::tiered",
                        slot = handle.slot(),
                        generation = handle.generation(),
                        error = %err,
                        "background hydration failed"
                    );
                    inner.report(device.as_ref(), &err);
                }
            }
        });
    }
}

impl<K, T> Inner<K, T> {
    fn report(&self, device: Option<&DeviceId>, err: &RelayError) {
        if let (Some(sink), Some(device)) = (&self.failures, device) {
            if err.is_connection_loss() || matches!(err, RelayError::Timeout) {
                sink.report_failure(device, err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::sleep;

    fn coordinator() -> TieredFetchCoordinator<String, String> {
        TieredFetchCoordinator::new("job:1", Duration::from_secs(12))
    }

    fn delayed(ms: u64, result: Result<&'static str, RelayError>) -> impl Future<Output = Result<String, RelayError>> {
        async move {
            sleep(Duration::from_millis(ms)).await;
            result.map(str::to_string)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sufficient_cache_hit_skips_fast_tier() {
        let coord = coordinator();
        let fast_calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fast_calls);
        coord.load(
            FetchRequest::new(
                "job-1".to_string(),
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    delayed(10, Ok("fast"))
                },
                || delayed(100, Ok("full")),
            )
            .cache(|_| Some("cached".to_string())),
        );

        let view = coord.view();
        assert_eq!(view.value.as_deref(), Some("cached"));
        assert_eq!(view.tier, Some(Tier::Cache));
        assert!(!view.is_loading);

        sleep(Duration::from_millis(150)).await;
        assert_eq!(fast_calls.load(Ordering::SeqCst), 0);
        let view = coord.view();
        assert_eq!(view.value.as_deref(), Some("full"));
        assert!(!view.is_loading);
    }

    #[tokio::test(start_paused = true)]
    async fn insufficient_cache_hit_still_runs_fast_tier() {
        let coord = coordinator();
        coord.load(
            FetchRequest::new(
                "job-1".to_string(),
                || delayed(10, Ok("fast")),
                || delayed(100, Ok("full")),
            )
            .cache(|_| Some("partial".to_string()))
            .sufficient(|v: &String| v != "partial"),
        );
        let view = coord.view();
        assert_eq!(view.value.as_deref(), Some("partial"));
        assert!(view.is_loading);

        sleep(Duration::from_millis(20)).await;
        let view = coord.view();
        assert_eq!(view.value.as_deref(), Some("fast"));
        assert!(!view.is_loading);
    }

    #[tokio::test(start_paused = true)]
    async fn fast_and_full_run_concurrently() {
        let coord = coordinator();
        let started = Arc::new(Mutex::new(Vec::new()));
        let (a, b) = (Arc::clone(&started), Arc::clone(&started));
        coord.load(FetchRequest::new(
            "job-1".to_string(),
            move || {
                a.lock().push(("fast", tokio::time::Instant::now()));
                delayed(100, Ok("fast"))
            },
            move || {
                b.lock().push(("full", tokio::time::Instant::now()));
                delayed(50, Ok("full"))
            },
        ));

        sleep(Duration::from_millis(60)).await;
        assert_eq!(coord.view().value.as_deref(), Some("full"));
        assert!(!coord.view().is_loading);

        sleep(Duration::from_millis(60)).await;
        let view = coord.view();
        assert_eq!(view.value.as_deref(), Some("full"));
        assert_eq!(view.tier, Some(Tier::Full));

        let started = started.lock();
        assert_eq!(started.len(), 2);
        assert_eq!(started[0].1, started[1].1);
    }

    #[tokio::test(start_paused = true)]
    async fn full_success_after_fast_failure_populates_view() {
        let coord = coordinator();
        coord.load(FetchRequest::new(
            "job-1".to_string(),
            || delayed(10, Err(RelayError::server("-32002", "not found"))),
            || delayed(100, Ok("full")),
        ));

        sleep(Duration::from_millis(20)).await;
        let view = coord.view();
        assert!(view.error.is_some());
        assert!(!view.is_loading);

        sleep(Duration::from_millis(100)).await;
        let view = coord.view();
        assert_eq!(view.value.as_deref(), Some("full"));
        assert_eq!(view.error, None);
        assert!(!view.is_loading);
    }

    #[tokio::test(start_paused = true)]
    async fn full_failure_is_never_surfaced() {
        let coord = coordinator();
        let mut updates = coord.updates();
        coord.load(FetchRequest::new(
            "job-1".to_string(),
            || delayed(10, Ok("fast")),
            || delayed(50, Err(RelayError::Network("reset".into()))),
        ));

        sleep(Duration::from_millis(100)).await;
        let view = coord.view();
        assert_eq!(view.value.as_deref(), Some("fast"));
        assert_eq!(view.error, None);

        let mut seen = Vec::new();
        while let Some(Some(update)) = updates.next().now_or_never() {
            seen.push(update);
        }
        assert!(seen.iter().all(|v| v.error.is_none()));
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_load_never_mutates_the_view() {
        let coord = coordinator();
        coord.load(
            FetchRequest::new(
                "old".to_string(),
                || delayed(200, Ok("old-fast")),
                || delayed(300, Ok("old-full")),
            )
            .cache(|_| Some("old-cached".to_string()))
            .sufficient(|_| false),
        );
        assert_eq!(coord.view().value.as_deref(), Some("old-cached"));

        sleep(Duration::from_millis(50)).await;
        coord.load(FetchRequest::new(
            "new".to_string(),
            || delayed(400, Ok("new-fast")),
            || delayed(500, Ok("new-full")),
        ));
        let mut rx = coord.subscribe();
        rx.borrow_and_update();

        sleep(Duration::from_millis(300)).await;
        assert!(!rx.has_changed().unwrap());
        let view = coord.view();
        assert_eq!(view.key.as_deref(), Some("new"));
        assert_eq!(view.value, None);
        assert!(view.is_loading);

        sleep(Duration::from_millis(300)).await;
        assert_eq!(coord.view().value.as_deref(), Some("new-full"));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_surfaces_once_and_cancels_tiers() {
        let coord: TieredFetchCoordinator<String, String> =
            TieredFetchCoordinator::new("folders", Duration::from_secs(12));
        let handle = coord.load(FetchRequest::new(
            "slow".to_string(),
            || delayed(60_000, Ok("fast")),
            || delayed(60_000, Ok("full")),
        ));

        sleep(Duration::from_secs(13)).await;
        let view = coord.view();
        assert_eq!(view.error, Some(LoadError::Timeout));
        assert!(!view.is_loading);
        assert!(handle.is_cancelled());

        sleep(Duration::from_secs(120)).await;
        let view = coord.view();
        assert_eq!(view.value, None);
        assert_eq!(view.error, Some(LoadError::Timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_loading_without_error() {
        let coord = coordinator();
        let handle = coord.load(FetchRequest::new(
            "job-1".to_string(),
            || delayed(100, Ok("fast")),
            || delayed(200, Ok("full")),
        ));
        coord.cancel();
        assert!(handle.is_cancelled());
        sleep(Duration::from_millis(300)).await;
        let view = coord.view();
        assert!(!view.is_loading);
        assert_eq!(view.error, None);
        assert_eq!(view.value, None);
    }

    struct RecordingSink(Mutex<Vec<(DeviceId, RelayError)>>);

    impl FailureSink for RecordingSink {
        fn report_failure(&self, device: &DeviceId, error: &RelayError) {
            self.0.lock().push((device.clone(), error.clone()));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn connection_loss_is_reported_to_the_sink() {
        let sink = Arc::new(RecordingSink(Mutex::new(Vec::new())));
        let coord: TieredFetchCoordinator<String, String> = TieredFetchCoordinator::with_failure_sink(
            "job:1",
            Duration::from_secs(12),
            sink.clone(),
        );
        coord.load(
            FetchRequest::new(
                "job-1".to_string(),
                || delayed(10, Err(RelayError::server("-32002", "missing"))),
                || delayed(20, Err(RelayError::Disconnected)),
            )
            .report_to(DeviceId::new("desk-1")),
        );
        sleep(Duration::from_millis(50)).await;
        let reported = sink.0.lock().clone();
        assert_eq!(reported, vec![(DeviceId::new("desk-1"), RelayError::Disconnected)]);
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_is_reported_to_the_sink_once() {
        let sink = Arc::new(RecordingSink(Mutex::new(Vec::new())));
        let coord: TieredFetchCoordinator<String, String> = TieredFetchCoordinator::with_failure_sink(
            "job:1",
            Duration::from_secs(12),
            sink.clone(),
        );
        coord.load(
            FetchRequest::new(
                "job-1".to_string(),
                || delayed(60_000, Ok("fast")),
                || delayed(60_000, Ok("full")),
            )
            .report_to(DeviceId::new("desk-1")),
        );
        sleep(Duration::from_secs(11)).await;
        assert!(sink.0.lock().is_empty());

        sleep(Duration::from_secs(120)).await;
        let reported = sink.0.lock().clone();
        assert_eq!(reported, vec![(DeviceId::new("desk-1"), RelayError::Timeout)]);
        assert_eq!(coord.view().error, Some(LoadError::Timeout));
    }
}
