use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use state_bus::{Bus, Subscription};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{
    BackoffPolicy, ConnectReason, ConnectionEvent, ConnectionState, DeviceConnection, DeviceId,
    LifecycleEvent, TOPIC,
};
use crate::error::RelayError;
use crate::metrics;
use crate::relay::{LinkObserver, RelayConnector};

/// Receives operation failures so connection loss detected by a load can escalate
/// into reconnection.
pub trait FailureSink: Send + Sync {
    fn report_failure(&self, device: &DeviceId, error: &RelayError);
}

type ConnectAttempt = Shared<BoxFuture<'static, Result<(), RelayError>>>;

#[derive(Debug, Clone, PartialEq, Eq)]
struct DeviceEntry {
    state: ConnectionState,
    reconnect_failures: u32,
    available: bool,
}

impl Default for DeviceEntry {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            reconnect_failures: 0,
            available: true,
        }
    }
}

struct Inner {
    this: Weak<Inner>,
    connector: Arc<dyn RelayConnector>,
    bus: Arc<dyn Bus<ConnectionEvent>>,
    devices: RwLock<HashMap<DeviceId, DeviceEntry>>,
    active: RwLock<Option<DeviceId>>,
    inflight: Mutex<HashMap<DeviceId, ConnectAttempt>>,
    aggressive: Mutex<HashMap<DeviceId, JoinHandle<()>>>,
    connect_timeout: Duration,
    backoff: BackoffPolicy,
}

/// Owns per-device connection state. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ConnectionSupervisor {
    inner: Arc<Inner>,
}

impl ConnectionSupervisor {
    pub fn new(
        connector: Arc<dyn RelayConnector>,
        bus: Arc<dyn Bus<ConnectionEvent>>,
        connect_timeout: Duration,
        backoff: BackoffPolicy,
    ) -> Self {
        let inner = Arc::new_cyclic(|this| Inner {
            this: this.clone(),
            connector: Arc::clone(&connector),
            bus,
            devices: RwLock::new(HashMap::new()),
            active: RwLock::new(None),
            inflight: Mutex::new(HashMap::new()),
            aggressive: Mutex::new(HashMap::new()),
            connect_timeout,
            backoff,
        });
        let observer: Weak<dyn LinkObserver> = Arc::downgrade(&inner) as Weak<dyn LinkObserver>;
        connector.set_link_observer(observer);
        Self { inner }
    }

    pub fn subscribe(&self) -> Subscription<ConnectionEvent> {
        self.inner.bus.subscribe(TOPIC)
    }

    pub fn connection_state(&self, device: &DeviceId) -> Option<ConnectionState> {
        self.inner
            .devices
            .read()
            .get(device)
            .map(|entry| entry.state.clone())
    }

    pub fn device(&self, device: &DeviceId) -> Option<DeviceConnection> {
        self.inner
            .devices
            .read()
            .get(device)
            .map(|entry| snapshot_of(device, entry))
    }

    pub fn snapshot(&self) -> Vec<DeviceConnection> {
        let devices = self.inner.devices.read();
        let mut all: Vec<DeviceConnection> = devices
            .iter()
            .map(|(device, entry)| snapshot_of(device, entry))
            .collect();
        all.sort_by(|a, b| a.device.cmp(&b.device));
        all
    }

    pub fn active_device(&self) -> Option<DeviceId> {
        self.inner.active.read().clone()
    }

    /// Starts tracking `device` as `disconnected` if it is not already known.
    pub fn observe_device(&self, device: &DeviceId) {
        self.inner.update(device, true, |_| {});
    }

    pub fn set_active_device(&self, device: Option<DeviceId>) {
        if let Some(device) = &device {
            self.observe_device(device);
        }
        let mut active = self.inner.active.write();
        if *active == device {
            return;
        }
        *active = device.clone();
        info!(
            target = "harbor::connection",
            device = device.as_ref().map(DeviceId::as_str).unwrap_or(""),
            "active device changed"
        );
        let _ = self
            .inner
            .bus
            .publish(TOPIC, ConnectionEvent::ActiveDeviceChanged(device));
    }

    /// Forgets an unpaired device and stops any reconnect loop for it.
    pub fn remove_device(&self, device: &DeviceId) {
        if let Some(handle) = self.inner.aggressive.lock().remove(device) {
            handle.abort();
        }
        let removed = {
            let mut devices = self.inner.devices.write();
            let removed = devices.remove(device).is_some();
            if removed {
                let _ = self
                    .inner
                    .bus
                    .publish(TOPIC, ConnectionEvent::DeviceRemoved(device.clone()));
            }
            removed
        };
        if removed && self.active_device().as_ref() == Some(device) {
            self.set_active_device(None);
        }
    }

    /// Connects `device`, joining the attempt already in flight if there is one.
    /// Resolves immediately when the device is already connected.
    pub async fn connect(&self, device: &DeviceId, reason: ConnectReason) -> Result<(), RelayError> {
        self.inner.attempt(device, reason, false).await
    }

    /// Starts a retrying reconnect loop for each device that does not already have one.
    pub fn trigger_aggressive_reconnect(&self, reason: ConnectReason, devices: &[DeviceId]) {
        for device in devices {
            self.inner.spawn_aggressive(device.clone(), reason);
        }
    }

    /// Feeds a device-discovery signal.
    pub fn observe_presence(&self, device: &DeviceId, available: bool) {
        let is_active = self.active_device().as_ref() == Some(device);
        let mut previous = None;
        let mut was_available = true;
        self.inner.update(device, false, |entry| {
            previous = Some(entry.state.clone());
            was_available = entry.available;
            entry.available = available;
            if !available && entry.state.is_connected() {
                entry.state = ConnectionState::Disconnected;
            }
        });
        let Some(previous) = previous else {
            return;
        };
        debug!(
            target = "harbor::connection",
            device = %device,
            available,
            previous = previous.label(),
            "presence signal"
        );
        match (available, previous) {
            (false, ConnectionState::Connected) if is_active => {
                self.inner
                    .spawn_aggressive(device.clone(), ConnectReason::PresenceLost);
            }
            (true, ConnectionState::Disconnected) if !was_available => {
                self.inner
                    .spawn_aggressive(device.clone(), ConnectReason::PresenceRegained);
            }
            (true, ConnectionState::Failed(cause))
                if !was_available && !cause.requires_device_selection() =>
            {
                self.inner
                    .spawn_aggressive(device.clone(), ConnectReason::PresenceRegained);
            }
            _ => {}
        }
    }

    pub fn handle_lifecycle(&self, event: LifecycleEvent) {
        match event {
            LifecycleEvent::Foreground => {
                let Some(active) = self.active_device() else {
                    return;
                };
                let connected = self
                    .connection_state(&active)
                    .is_some_and(|state| state.is_connected());
                if !connected {
                    self.inner.spawn_aggressive(active, ConnectReason::Foreground);
                }
            }
            LifecycleEvent::Background => self.inner.abort_loops(),
        }
    }

    pub fn is_reconnecting(&self, device: &DeviceId) -> bool {
        self.inner
            .aggressive
            .lock()
            .get(device)
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn shutdown(&self) {
        self.inner.abort_loops();
    }
}

impl FailureSink for ConnectionSupervisor {
    fn report_failure(&self, device: &DeviceId, error: &RelayError) {
        if error.requires_device_selection() {
            warn!(
                target = "harbor::connection",
                device = %device,
                code = error.code(),
                "relay rejected device; selection required"
            );
            self.inner.update(device, false, |entry| {
                entry.state = ConnectionState::Failed(error.clone());
            });
            return;
        }
        let timed_out = matches!(error, RelayError::Timeout);
        if !timed_out && !error.is_connection_loss() {
            return;
        }
        let mut retry = false;
        let mut recheck = false;
        self.inner.update(device, false, |entry| match entry.state {
            // A slow desktop is not proof the link is gone; re-dial once instead.
            ConnectionState::Connected if timed_out => recheck = true,
            ConnectionState::Connected => {
                entry.state = ConnectionState::Failed(error.clone());
                retry = true;
            }
            ConnectionState::Failed(_) | ConnectionState::Disconnected => retry = true,
            ConnectionState::Connecting => {}
        });
        if recheck {
            self.inner.recheck_link(device.clone());
        } else if retry {
            debug!(
                target = "harbor::connection",
                device = %device,
                error = %error,
                "operation reported connection loss"
            );
            self.inner
                .spawn_aggressive(device.clone(), ConnectReason::OperationFailed);
        }
    }
}

impl Inner {
    fn arc(&self) -> Option<Arc<Inner>> {
        self.this.upgrade()
    }

    /// Applies `f` to the device entry and publishes the new snapshot if anything
    /// changed. Publishing under the write lock keeps per-device order.
    fn update<F>(&self, device: &DeviceId, create: bool, f: F) -> bool
    where
        F: FnOnce(&mut DeviceEntry),
    {
        let mut devices = self.devices.write();
        let created = if devices.contains_key(device) {
            false
        } else if create {
            devices.insert(device.clone(), DeviceEntry::default());
            true
        } else {
            return false;
        };
        let Some(entry) = devices.get_mut(device) else {
            return false;
        };
        let before = entry.clone();
        f(entry);
        if created || *entry != before {
            let _ = self.bus.publish(
                TOPIC,
                ConnectionEvent::StateChanged(snapshot_of(device, entry)),
            );
        }
        true
    }

    /// Starts or joins a connect attempt. Unless `force` is set, a device that is
    /// already connected is left alone.
    fn attempt(&self, device: &DeviceId, reason: ConnectReason, force: bool) -> ConnectAttempt {
        let mut inflight = self.inflight.lock();
        if let Some(existing) = inflight.get(device) {
            debug!(
                target = "harbor::connection",
                device = %device,
                reason = reason.as_str(),
                "joining in-flight connect attempt"
            );
            return existing.clone();
        }
        let connected = self
            .devices
            .read()
            .get(device)
            .is_some_and(|entry| entry.state.is_connected());
        if connected && !force {
            debug!(
                target = "harbor::connection",
                device = %device,
                reason = reason.as_str(),
                "already connected"
            );
            return futures::future::ready(Ok(())).boxed().shared();
        }
        let Some(this) = self.arc() else {
            return futures::future::ready(Err(RelayError::InvalidState(
                "connection supervisor shut down".into(),
            )))
            .boxed()
            .shared();
        };

        self.update(device, true, |entry| entry.state = ConnectionState::Connecting);
        info!(
            target = "harbor::connection",
            device = %device,
            reason = reason.as_str(),
            "connect attempt started"
        );

        let owned = device.clone();
        let task = tokio::spawn(async move { this.run_attempt(owned).await });
        let attempt = async move {
            match task.await {
                Ok(result) => result,
                Err(err) => Err(RelayError::InvalidState(format!(
                    "connect attempt aborted: {err}"
                ))),
            }
        }
        .boxed()
        .shared();
        inflight.insert(device.clone(), attempt.clone());
        attempt
    }

    async fn run_attempt(self: Arc<Self>, device: DeviceId) -> Result<(), RelayError> {
        let outcome = match tokio::time::timeout(self.connect_timeout, self.connector.connect(&device))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(RelayError::Timeout),
        };

        match &outcome {
            Ok(()) => {
                metrics::CONNECT_ATTEMPTS.with_label_values(&["connected"]).inc();
                self.update(&device, false, |entry| {
                    entry.state = ConnectionState::Connected;
                    entry.reconnect_failures = 0;
                });
                info!(target = "harbor::connection", device = %device, "device connected");
            }
            Err(err) => {
                metrics::CONNECT_ATTEMPTS
                    .with_label_values(&[err.class().to_string().as_str()])
                    .inc();
                self.update(&device, false, |entry| {
                    entry.state = ConnectionState::Failed(err.clone());
                    entry.reconnect_failures = entry.reconnect_failures.saturating_add(1);
                });
                warn!(
                    target = "harbor::connection",
                    device = %device,
                    error = %err,
                    class = %err.class(),
                    "connect attempt failed"
                );
            }
        }

        self.inflight.lock().remove(&device);
        outcome
    }

    fn recheck_link(&self, device: DeviceId) {
        let Some(this) = self.arc() else {
            return;
        };
        info!(
            target = "harbor::connection",
            device = %device,
            "load timed out on a connected device; re-dialing"
        );
        let attempt = self.attempt(&device, ConnectReason::LoadTimeout, true);
        tokio::spawn(async move {
            if let Err(err) = attempt.await {
                if err.is_retryable() {
                    this.spawn_aggressive(device, ConnectReason::LoadTimeout);
                }
            }
        });
    }

    fn spawn_aggressive(&self, device: DeviceId, reason: ConnectReason) {
        let mut loops = self.aggressive.lock();
        if loops.get(&device).is_some_and(|handle| !handle.is_finished()) {
            debug!(
                target = "harbor::connection",
                device = %device,
                reason = reason.as_str(),
                "aggressive reconnect already running"
            );
            return;
        }
        let Some(this) = self.arc() else {
            return;
        };
        metrics::AGGRESSIVE_RECONNECTS
            .with_label_values(&[reason.as_str()])
            .inc();
        info!(
            target = "harbor::connection",
            device = %device,
            reason = reason.as_str(),
            "aggressive reconnect triggered"
        );
        let owned = device.clone();
        let handle = tokio::spawn(async move { this.reconnect_loop(owned, reason).await });
        loops.insert(device, handle);
    }

    async fn reconnect_loop(self: Arc<Self>, device: DeviceId, reason: ConnectReason) {
        let max_attempts = self.backoff.max_attempts.max(1);
        for attempt in 0..max_attempts {
            let state = self.devices.read().get(&device).map(|e| e.state.clone());
            match state {
                None | Some(ConnectionState::Connected) => return,
                _ => {}
            }
            let reason = if attempt == 0 { reason } else { ConnectReason::Retry };
            match self.attempt(&device, reason, false).await {
                Ok(()) => return,
                Err(err) if !err.is_retryable() => {
                    warn!(
                        target = "harbor::connection",
                        device = %device,
                        attempt,
                        error = %err,
                        "reconnect stopped on non-retryable error"
                    );
                    return;
                }
                Err(err) => {
                    if attempt + 1 == max_attempts {
                        error!(
                            target = "harbor::connection",
                            device = %device,
                            error = %err,
                            "exhausted reconnect attempts"
                        );
                        return;
                    }
                    let delay = self.backoff.delay(attempt);
                    debug!(
                        target = "harbor::connection",
                        device = %device,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "reconnect backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn abort_loops(&self) {
        for (_, handle) in self.aggressive.lock().drain() {
            handle.abort();
        }
    }
}

impl LinkObserver for Inner {
    fn link_lost(&self, device: &DeviceId, cause: RelayError) {
        warn!(
            target = "harbor::connection",
            device = %device,
            error = %cause,
            "relay link lost"
        );
        let state = match cause {
            RelayError::Disconnected => ConnectionState::Disconnected,
            ref other => ConnectionState::Failed(other.clone()),
        };
        if !self.update(device, false, |entry| entry.state = state) {
            return;
        }
        if cause.is_retryable() {
            self.spawn_aggressive(device.clone(), ConnectReason::LinkLost);
        }
    }
}

fn snapshot_of(device: &DeviceId, entry: &DeviceEntry) -> DeviceConnection {
    DeviceConnection {
        device: device.clone(),
        state: entry.state.clone(),
        reconnect_failures: entry.reconnect_failures,
        available: entry.available,
    }
}
