use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::LoadError;
use crate::metrics;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadState {
    Idle,
    Loading,
    Finished,
    Failed(LoadError),
    Cancelled,
}

impl LoadState {
    pub fn is_loading(&self) -> bool {
        matches!(self, LoadState::Loading)
    }
}

/// Runs under the scope lock when a load expires, before the timeout is published.
pub type TimeoutHook = Box<dyn FnOnce(&LoadHandle) + Send>;

/// One outstanding load. Clones refer to the same load.
#[derive(Debug, Clone)]
pub struct LoadHandle {
    slot: Arc<str>,
    generation: u64,
    token: CancellationToken,
    deadline: Instant,
    expired: Arc<AtomicBool>,
}

impl LoadHandle {
    pub fn slot(&self) -> &str {
        &self.slot
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn timed_out(&self) -> bool {
        self.expired.load(Ordering::SeqCst)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum LoadOutcome<T> {
    Value(T),
    Failed(LoadError),
    Cancelled,
}

struct Active {
    handle: LoadHandle,
    settled: bool,
    timer: Option<JoinHandle<()>>,
    on_timeout: Option<TimeoutHook>,
}

impl Active {
    fn settle(&mut self) {
        self.settled = true;
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

struct Slot {
    generation: u64,
    active: Option<Active>,
}

struct Shared {
    slot: Arc<str>,
    default_timeout: Duration,
    state: watch::Sender<LoadState>,
    inner: Mutex<Slot>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(mut active) = self.inner.get_mut().active.take() {
            active.handle.token.cancel();
            active.settle();
        }
    }
}

/// Owns the single current load of one logical slot. Starting a load supersedes
/// the previous one; results are only applied while their handle is current.
#[derive(Clone)]
pub struct LoadScope {
    shared: Arc<Shared>,
}

impl LoadScope {
    pub fn new(slot: impl Into<String>, default_timeout: Duration) -> Self {
        let (state, _) = watch::channel(LoadState::Idle);
        Self {
            shared: Arc::new(Shared {
                slot: Arc::from(slot.into()),
                default_timeout,
                state,
                inner: Mutex::new(Slot {
                    generation: 0,
                    active: None,
                }),
            }),
        }
    }

    pub fn slot(&self) -> &str {
        &self.shared.slot
    }

    pub fn default_timeout(&self) -> Duration {
        self.shared.default_timeout
    }

    pub fn state(&self) -> LoadState {
        self.shared.state.borrow().clone()
    }

    pub fn is_loading(&self) -> bool {
        self.shared.state.borrow().is_loading()
    }

    pub fn watch(&self) -> watch::Receiver<LoadState> {
        self.shared.state.subscribe()
    }

    pub fn begin(&self) -> LoadHandle {
        self.begin_with(self.shared.default_timeout, None)
    }

    pub fn begin_with(&self, timeout: Duration, on_timeout: Option<TimeoutHook>) -> LoadHandle {
        let mut slot = self.shared.inner.lock();
        if let Some(mut previous) = slot.active.take() {
            if !previous.settled {
                metrics::LOADS_SUPERSEDED
                    .with_label_values(&[self.shared.slot.as_ref()])
                    .inc();
                debug!(
                    target = "harbor::load",
                    slot = %self.shared.slot,
                    generation = previous.handle.generation,
                    "load superseded"
                );
            }
            previous.handle.token.cancel();
            previous.settle();
        }

        slot.generation += 1;
        let handle = LoadHandle {
            slot: Arc::clone(&self.shared.slot),
            generation: slot.generation,
            token: CancellationToken::new(),
            deadline: Instant::now() + timeout,
            expired: Arc::new(AtomicBool::new(false)),
        };
        let timer = tokio::spawn(expire_after(
            Arc::downgrade(&self.shared),
            handle.generation,
            timeout,
        ));
        slot.active = Some(Active {
            handle: handle.clone(),
            settled: false,
            timer: Some(timer),
            on_timeout,
        });
        self.shared.state.send_replace(LoadState::Loading);
        handle
    }

    /// Whether `handle` is still the slot's load and has not been cancelled.
    pub fn is_current(&self, handle: &LoadHandle) -> bool {
        let slot = self.shared.inner.lock();
        current(&slot, handle).is_some()
    }

    /// Runs `f` only if `handle` is current. The check and `f` are atomic with
    /// respect to supersession and cancellation.
    pub fn apply<R>(&self, handle: &LoadHandle, f: impl FnOnce() -> R) -> Option<R> {
        let slot = self.shared.inner.lock();
        current(&slot, handle)?;
        Some(f())
    }

    /// Marks the load finished. Idempotent; a no-op for stale or cancelled handles.
    pub fn finish(&self, handle: &LoadHandle) -> bool {
        self.finish_with(handle, || ()).is_some()
    }

    /// Applies `f` and settles the load as finished if it was still loading.
    pub fn finish_with<R>(&self, handle: &LoadHandle, f: impl FnOnce() -> R) -> Option<R> {
        self.settle_with(handle, LoadState::Finished, f)
    }

    /// Records a failure without cancelling the handle, so other work under it
    /// may still complete.
    pub fn fail(&self, handle: &LoadHandle, error: LoadError) -> bool {
        self.fail_with(handle, error, || ()).is_some()
    }

    pub fn fail_with<R>(
        &self,
        handle: &LoadHandle,
        error: LoadError,
        f: impl FnOnce() -> R,
    ) -> Option<R> {
        self.settle_with(handle, LoadState::Failed(error), f)
    }

    fn settle_with<R>(&self, handle: &LoadHandle, terminal: LoadState, f: impl FnOnce() -> R) -> Option<R> {
        let mut slot = self.shared.inner.lock();
        let active = current_mut(&mut slot, handle)?;
        let result = f();
        if !active.settled {
            active.settle();
            self.shared.state.send_replace(terminal);
        }
        Some(result)
    }

    /// Cancels `handle` if it is the current load. Explicit cancellation ends in
    /// [`LoadState::Cancelled`], never an error.
    pub fn cancel(&self, handle: &LoadHandle) -> bool {
        let mut slot = self.shared.inner.lock();
        if current_mut(&mut slot, handle).is_none() {
            return false;
        }
        self.cancel_locked(&mut slot, || ());
        true
    }

    pub fn cancel_current(&self) {
        self.cancel_current_with(|| ());
    }

    /// Cancels whatever load is current and runs `f` under the same lock.
    pub fn cancel_current_with(&self, f: impl FnOnce()) {
        let mut slot = self.shared.inner.lock();
        self.cancel_locked(&mut slot, f);
    }

    fn cancel_locked(&self, slot: &mut Slot, f: impl FnOnce()) {
        let Some(mut active) = slot.active.take() else {
            return;
        };
        active.handle.token.cancel();
        let was_loading = !active.settled;
        active.settle();
        f();
        if was_loading {
            debug!(
                target = "harbor::load",
                slot = %self.shared.slot,
                generation = active.handle.generation,
                "load cancelled"
            );
            self.shared.state.send_replace(LoadState::Cancelled);
        }
    }

    /// Begins a load, runs `work` under it and settles the scope with its result.
    pub async fn run<T, F, Fut>(&self, work: F) -> LoadOutcome<T>
    where
        F: FnOnce(LoadHandle) -> Fut,
        Fut: Future<Output = Result<T, LoadError>>,
    {
        let handle = self.begin();
        let work = work(handle.clone());
        tokio::select! {
            biased;
            _ = handle.cancelled() => {
                if handle.timed_out() {
                    LoadOutcome::Failed(LoadError::Timeout)
                } else {
                    LoadOutcome::Cancelled
                }
            }
            result = work => match result {
                Ok(value) => {
                    if self.finish(&handle) {
                        LoadOutcome::Value(value)
                    } else {
                        LoadOutcome::Cancelled
                    }
                }
                Err(err) => {
                    if self.fail(&handle, err.clone()) {
                        LoadOutcome::Failed(err)
                    } else {
                        LoadOutcome::Cancelled
                    }
                }
            },
        }
    }
}

fn current<'a>(slot: &'a Slot, handle: &LoadHandle) -> Option<&'a Active> {
    slot.active
        .as_ref()
        .filter(|a| a.handle.generation == handle.generation && !a.handle.token.is_cancelled())
}

fn current_mut<'a>(slot: &'a mut Slot, handle: &LoadHandle) -> Option<&'a mut Active> {
    slot.active
        .as_mut()
        .filter(|a| a.handle.generation == handle.generation && !a.handle.token.is_cancelled())
}

async fn expire_after(shared: Weak<Shared>, generation: u64, timeout: Duration) {
    tokio::time::sleep(timeout).await;
    let Some(shared) = shared.upgrade() else {
        return;
    };
    let mut slot = shared.inner.lock();
    let Some(active) = slot.active.as_mut() else {
        return;
    };
    if active.handle.generation != generation || active.settled {
        return;
    }
    active.settled = true;
    active.timer = None;
    active.handle.expired.store(true, Ordering::SeqCst);
    active.handle.token.cancel();
    if let Some(hook) = active.on_timeout.take() {
        hook(&active.handle);
    }
    metrics::LOAD_TIMEOUTS
        .with_label_values(&[shared.slot.as_ref()])
        .inc();
    warn!(
        target = "harbor::load",
        slot = %shared.slot,
        generation,
        timeout_ms = timeout.as_millis() as u64,
        "load timed out"
    );
    shared
        .state
        .send_replace(LoadState::Failed(LoadError::Timeout));
}
