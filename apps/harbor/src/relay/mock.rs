//! In-memory relay with scripted connect outcomes and delayable response frames.
//! Backs the test suites and the binary's `--demo` mode.

use std::collections::{HashMap, HashSet, VecDeque};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;

use super::{FrameStream, LinkObserver, RelayCommandChannel, RelayConnector, RelayRequest, ResponseFrame};
use crate::connection::DeviceId;
use crate::error::RelayError;

/// Frames a scripted call yields, each after its own delay measured from the
/// previous frame.
#[derive(Debug, Clone, Default)]
pub struct ScriptedResponse {
    frames: Vec<(Duration, Result<ResponseFrame, RelayError>)>,
}

impl ScriptedResponse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value(delay: Duration, value: Value) -> Self {
        Self::new().then(delay, Ok(ResponseFrame::result(value)))
    }

    pub fn error(delay: Duration, error: RelayError) -> Self {
        Self::new().then(delay, Err(error))
    }

    /// A call that never yields a frame.
    pub fn hang() -> Self {
        Self::new().then(Duration::MAX, Ok(ResponseFrame::result(Value::Null)))
    }

    pub fn then(mut self, delay: Duration, frame: Result<ResponseFrame, RelayError>) -> Self {
        self.frames.push((delay, frame));
        self
    }
}

type Responder = dyn Fn(&DeviceId, &RelayRequest) -> ScriptedResponse + Send + Sync;

struct ScriptedConnect {
    delay: Option<Duration>,
    outcome: Result<(), RelayError>,
}

#[derive(Default)]
struct State {
    connect_outcomes: HashMap<DeviceId, VecDeque<ScriptedConnect>>,
    connect_counts: HashMap<DeviceId, usize>,
    linked: HashSet<DeviceId>,
    invocations: Vec<(DeviceId, RelayRequest)>,
    connect_delay: Duration,
    require_link: bool,
}

pub struct ScriptedRelay {
    state: Mutex<State>,
    responder: Mutex<Option<Arc<Responder>>>,
    observer: Mutex<Option<Weak<dyn LinkObserver>>>,
    abandoned: Arc<AtomicUsize>,
}

impl Default for ScriptedRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedRelay {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            responder: Mutex::new(None),
            observer: Mutex::new(None),
            abandoned: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Delay applied to connects that have no scripted delay of their own.
    pub fn set_connect_delay(&self, delay: Duration) {
        self.state.lock().connect_delay = delay;
    }

    /// When set, calls to devices without a live link fail with `NotConnected`.
    pub fn require_link(&self, required: bool) {
        self.state.lock().require_link = required;
    }

    pub fn push_connect_outcome(&self, device: &DeviceId, outcome: Result<(), RelayError>) {
        self.push_connect(device, None, outcome);
    }

    pub fn push_connect_outcome_after(
        &self,
        device: &DeviceId,
        delay: Duration,
        outcome: Result<(), RelayError>,
    ) {
        self.push_connect(device, Some(delay), outcome);
    }

    fn push_connect(&self, device: &DeviceId, delay: Option<Duration>, outcome: Result<(), RelayError>) {
        self.state
            .lock()
            .connect_outcomes
            .entry(device.clone())
            .or_default()
            .push_back(ScriptedConnect { delay, outcome });
    }

    pub fn set_responder<F>(&self, responder: F)
    where
        F: Fn(&DeviceId, &RelayRequest) -> ScriptedResponse + Send + Sync + 'static,
    {
        *self.responder.lock() = Some(Arc::new(responder));
    }

    pub fn connect_count(&self, device: &DeviceId) -> usize {
        self.state
            .lock()
            .connect_counts
            .get(device)
            .copied()
            .unwrap_or(0)
    }

    pub fn is_linked(&self, device: &DeviceId) -> bool {
        self.state.lock().linked.contains(device)
    }

    pub fn invocations(&self) -> Vec<(DeviceId, RelayRequest)> {
        self.state.lock().invocations.clone()
    }

    /// Calls whose frame stream was dropped before the call completed.
    pub fn abandoned_calls(&self) -> usize {
        self.abandoned.load(Ordering::SeqCst)
    }

    /// Simulates the relay route to `device` going away.
    pub fn drop_link(&self, device: &DeviceId, cause: RelayError) {
        self.state.lock().linked.remove(device);
        let observer = self.observer.lock().as_ref().and_then(Weak::upgrade);
        if let Some(observer) = observer {
            observer.link_lost(device, cause);
        }
    }
}

#[async_trait]
impl RelayConnector for ScriptedRelay {
    async fn connect(&self, device: &DeviceId) -> Result<(), RelayError> {
        let (delay, outcome) = {
            let mut state = self.state.lock();
            *state.connect_counts.entry(device.clone()).or_default() += 1;
            let scripted = state
                .connect_outcomes
                .get_mut(device)
                .and_then(VecDeque::pop_front);
            match scripted {
                Some(ScriptedConnect { delay, outcome }) => {
                    (delay.unwrap_or(state.connect_delay), outcome)
                }
                None => (state.connect_delay, Ok(())),
            }
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if outcome.is_ok() {
            self.state.lock().linked.insert(device.clone());
        }
        outcome
    }

    fn set_link_observer(&self, observer: Weak<dyn LinkObserver>) {
        *self.observer.lock() = Some(observer);
    }
}

#[async_trait]
impl RelayCommandChannel for ScriptedRelay {
    async fn invoke(
        &self,
        device: &DeviceId,
        request: RelayRequest,
    ) -> Result<FrameStream, RelayError> {
        {
            let mut state = self.state.lock();
            if state.require_link && !state.linked.contains(device) {
                return Err(RelayError::NotConnected);
            }
            state.invocations.push((device.clone(), request.clone()));
        }
        let responder = self.responder.lock().clone();
        let script = match responder {
            Some(responder) => responder(device, &request),
            None => ScriptedResponse::value(Duration::ZERO, Value::Null),
        };
        let frames = futures::stream::iter(script.frames).then(|(delay, frame)| async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            frame
        });
        Ok(ScriptedStream {
            inner: frames.boxed(),
            finished: false,
            abandoned: Arc::clone(&self.abandoned),
        }
        .boxed())
    }
}

struct ScriptedStream {
    inner: FrameStream,
    finished: bool,
    abandoned: Arc<AtomicUsize>,
}

impl Stream for ScriptedStream {
    type Item = Result<ResponseFrame, RelayError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let polled = self.inner.poll_next_unpin(cx);
        match &polled {
            Poll::Ready(None) | Poll::Ready(Some(Err(_))) => self.finished = true,
            Poll::Ready(Some(Ok(frame))) if frame.is_final || frame.error.is_some() => {
                self.finished = true
            }
            _ => {}
        }
        polled
    }
}

impl Drop for ScriptedStream {
    fn drop(&mut self) {
        if !self.finished {
            self.abandoned.fetch_add(1, Ordering::SeqCst);
        }
    }
}
