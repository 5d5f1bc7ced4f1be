use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use state_bus::{Bus, BusError, Subscription};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Sleep;
use tracing::{debug, info, warn};

use super::state::{
    SessionContext, WorkspaceConnectivityState, WorkspaceEvent, WorkspaceSnapshot,
    derive_connectivity,
};
use crate::connection::{ConnectionEvent, ConnectionState, ConnectionSupervisor, DeviceConnection, DeviceId};
use crate::metrics;

/// Topic on which the machine publishes [`WorkspaceEvent`]s.
pub const TOPIC: &str = "workspace.events";

/// The most recently active load. Re-triggered when the workspace recovers.
pub trait ReloadTarget: Send + Sync {
    fn reload(&self);
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WorkspaceError {
    #[error("workspace state machine stopped")]
    Stopped,
}

enum Command {
    Connection(DeviceConnection),
    DeviceRemoved(DeviceId),
    ActiveDevice(Option<DeviceId>),
    OfflineMode(bool),
    Resync {
        devices: Vec<DeviceConnection>,
        active: Option<DeviceId>,
    },
    SelectProject {
        project: Option<String>,
        ack: oneshot::Sender<u64>,
    },
    SelectSession {
        session_id: Option<String>,
        ack: oneshot::Sender<u64>,
    },
    SetPendingText {
        epoch: u64,
        text: String,
    },
    RecordSyncMarker {
        epoch: u64,
        key: String,
        value: u64,
    },
    RegisterReload {
        slot: String,
        target: Arc<dyn ReloadTarget>,
    },
    Sync(oneshot::Sender<()>),
    Shutdown,
}

/// Handle to the workspace actor. Every mutation is a message, so transitions
/// are applied one at a time in arrival order. Clones share the actor.
#[derive(Clone)]
pub struct WorkspaceStateMachine {
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<WorkspaceSnapshot>,
    bus: Arc<dyn Bus<WorkspaceEvent>>,
}

impl WorkspaceStateMachine {
    pub fn spawn(
        bus: Arc<dyn Bus<WorkspaceEvent>>,
        escalation_delay: Duration,
        offline_mode: bool,
    ) -> (Self, JoinHandle<()>) {
        let (commands, rx) = mpsc::unbounded_channel();
        let initial = WorkspaceSnapshot {
            offline_mode,
            ..WorkspaceSnapshot::default()
        };
        let (snapshot_tx, snapshot) = watch::channel(initial);
        let actor = Actor {
            bus: Arc::clone(&bus),
            snapshot: snapshot_tx,
            escalation_delay,
            devices: HashMap::new(),
            active: None,
            offline_mode,
            current: None,
            previous: None,
            banner_visible: false,
            escalation: None,
            context: SessionContext::default(),
            reload: None,
        };
        let handle = tokio::spawn(actor.run(rx));
        (
            Self {
                commands,
                snapshot,
                bus,
            },
            handle,
        )
    }

    /// Feeds the supervisor's state into the machine. Seeds from the current
    /// snapshot and resynchronises whenever the subscription lags.
    pub fn attach_supervisor(&self, supervisor: &ConnectionSupervisor) -> JoinHandle<()> {
        let mut events = supervisor.subscribe();
        self.resync_from(supervisor);
        let supervisor = supervisor.clone();
        let machine = self.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(msg) => match msg.payload {
                        ConnectionEvent::StateChanged(connection) => {
                            machine.apply_connection(connection)
                        }
                        ConnectionEvent::ActiveDeviceChanged(device) => {
                            machine.set_active_device(device)
                        }
                        ConnectionEvent::DeviceRemoved(device) => {
                            machine.send(Command::DeviceRemoved(device))
                        }
                    },
                    Err(BusError::Lagged(skipped)) => {
                        warn!(
                            target = "harbor::workspace",
                            skipped, "connection feed lagged; resyncing"
                        );
                        drain(&mut events);
                        machine.resync_from(&supervisor);
                    }
                    Err(BusError::Closed | BusError::Cancelled) => break,
                }
                if machine.commands.is_closed() {
                    break;
                }
            }
        })
    }

    fn resync_from(&self, supervisor: &ConnectionSupervisor) {
        self.send(Command::Resync {
            devices: supervisor.snapshot(),
            active: supervisor.active_device(),
        });
    }

    pub fn snapshot(&self) -> WorkspaceSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn connectivity(&self) -> Option<WorkspaceConnectivityState> {
        self.snapshot.borrow().connectivity
    }

    pub fn watch(&self) -> watch::Receiver<WorkspaceSnapshot> {
        self.snapshot.clone()
    }

    pub fn subscribe(&self) -> Subscription<WorkspaceEvent> {
        self.bus.subscribe(TOPIC)
    }

    pub fn apply_connection(&self, connection: DeviceConnection) {
        self.send(Command::Connection(connection));
    }

    pub fn set_active_device(&self, device: Option<DeviceId>) {
        self.send(Command::ActiveDevice(device));
    }

    pub fn set_offline_mode(&self, enabled: bool) {
        self.send(Command::OfflineMode(enabled));
    }

    /// Switches the root context. Session-bound state is discarded before this
    /// returns; the returned epoch identifies the new context.
    pub async fn select_project(&self, project: Option<String>) -> Result<u64, WorkspaceError> {
        let (ack, rx) = oneshot::channel();
        self.send(Command::SelectProject { project, ack });
        rx.await.map_err(|_| WorkspaceError::Stopped)
    }

    pub async fn select_session(&self, session_id: Option<String>) -> Result<u64, WorkspaceError> {
        let (ack, rx) = oneshot::channel();
        self.send(Command::SelectSession { session_id, ack });
        rx.await.map_err(|_| WorkspaceError::Stopped)
    }

    /// Ignored when `epoch` no longer matches the current context.
    pub fn set_pending_text(&self, epoch: u64, text: impl Into<String>) {
        self.send(Command::SetPendingText {
            epoch,
            text: text.into(),
        });
    }

    /// Ignored when `epoch` no longer matches the current context.
    pub fn record_sync_marker(&self, epoch: u64, key: impl Into<String>, value: u64) {
        self.send(Command::RecordSyncMarker {
            epoch,
            key: key.into(),
            value,
        });
    }

    pub fn register_reload(&self, slot: impl Into<String>, target: Arc<dyn ReloadTarget>) {
        self.send(Command::RegisterReload {
            slot: slot.into(),
            target,
        });
    }

    /// Resolves once every command sent before it has been applied.
    pub async fn sync(&self) -> Result<(), WorkspaceError> {
        let (ack, rx) = oneshot::channel();
        self.send(Command::Sync(ack));
        rx.await.map_err(|_| WorkspaceError::Stopped)
    }

    pub fn shutdown(&self) {
        self.send(Command::Shutdown);
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!(target = "harbor::workspace", "state machine stopped; command dropped");
        }
    }
}

fn drain(events: &mut Subscription<ConnectionEvent>) {
    loop {
        match events.try_recv() {
            Ok(Some(_)) | Err(BusError::Lagged(_)) => continue,
            Ok(None) | Err(_) => break,
        }
    }
}

struct Actor {
    bus: Arc<dyn Bus<WorkspaceEvent>>,
    snapshot: watch::Sender<WorkspaceSnapshot>,
    escalation_delay: Duration,
    devices: HashMap<DeviceId, DeviceConnection>,
    active: Option<DeviceId>,
    offline_mode: bool,
    current: Option<WorkspaceConnectivityState>,
    previous: Option<WorkspaceConnectivityState>,
    banner_visible: bool,
    escalation: Option<Pin<Box<Sleep>>>,
    context: SessionContext,
    reload: Option<(String, Arc<dyn ReloadTarget>)>,
}

impl Actor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle(command),
                },
                _ = escalation_elapsed(&mut self.escalation) => {
                    self.escalation = None;
                    self.escalate();
                }
            }
            self.publish_snapshot();
        }
        self.escalation = None;
        debug!(target = "harbor::workspace", "state machine stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Connection(connection) => {
                let device = connection.device.clone();
                let previous = self.devices.insert(device.clone(), connection);
                if self.active.as_ref() == Some(&device) {
                    self.check_device_selection(&device, previous.as_ref());
                }
                self.evaluate();
            }
            Command::DeviceRemoved(device) => {
                self.devices.remove(&device);
                if self.active.as_ref() == Some(&device) {
                    self.active = None;
                }
                self.evaluate();
            }
            Command::ActiveDevice(device) => {
                self.active = device;
                self.evaluate();
            }
            Command::OfflineMode(enabled) => {
                self.offline_mode = enabled;
                self.evaluate();
            }
            Command::Resync { devices, active } => {
                self.devices = devices
                    .into_iter()
                    .map(|connection| (connection.device.clone(), connection))
                    .collect();
                self.active = active;
                self.evaluate();
            }
            Command::SelectProject { project, ack } => {
                if project != self.context.project {
                    self.reset_context(project, None);
                }
                let _ = ack.send(self.context.epoch);
            }
            Command::SelectSession { session_id, ack } => {
                if session_id != self.context.session_id {
                    let project = self.context.project.clone();
                    self.reset_context(project, session_id);
                }
                let _ = ack.send(self.context.epoch);
            }
            Command::SetPendingText { epoch, text } => {
                if self.accepts(epoch) {
                    self.context.pending_text = text;
                }
            }
            Command::RecordSyncMarker { epoch, key, value } => {
                if self.accepts(epoch) {
                    self.context.sync_markers.insert(key, value);
                }
            }
            Command::RegisterReload { slot, target } => {
                self.reload = Some((slot, target));
            }
            Command::Sync(ack) => {
                let _ = ack.send(());
            }
            Command::Shutdown => {}
        }
    }

    fn accepts(&self, epoch: u64) -> bool {
        if epoch != self.context.epoch {
            debug!(
                target = "harbor::workspace",
                epoch,
                current = self.context.epoch,
                "dropping write for a replaced context"
            );
            return false;
        }
        true
    }

    fn reset_context(&mut self, project: Option<String>, session_id: Option<String>) {
        let epoch = self.context.epoch + 1;
        self.context = SessionContext {
            project: project.clone(),
            session_id: session_id.clone(),
            epoch,
            ..SessionContext::default()
        };
        self.reload = None;
        info!(
            target = "harbor::workspace",
            project = project.as_deref().unwrap_or(""),
            session = session_id.as_deref().unwrap_or(""),
            epoch,
            "context reset"
        );
        self.emit(WorkspaceEvent::ContextReset {
            project,
            session_id,
            epoch,
        });
    }

    fn check_device_selection(&self, device: &DeviceId, previous: Option<&DeviceConnection>) {
        let Some(ConnectionState::Failed(cause)) = self.devices.get(device).map(|c| &c.state) else {
            return;
        };
        if !cause.requires_device_selection() {
            return;
        }
        if previous.is_some_and(|p| p.state == ConnectionState::Failed(cause.clone())) {
            return;
        }
        self.emit(WorkspaceEvent::DeviceSelectionRequired {
            device: device.clone(),
            code: cause.code().to_string(),
        });
    }

    fn evaluate(&mut self) {
        use WorkspaceConnectivityState::*;

        let connection = self.active.as_ref().and_then(|device| self.devices.get(device));
        let next = derive_connectivity(connection, self.offline_mode);
        if next == self.current {
            return;
        }
        let from = self.current;
        self.previous = from;
        self.current = next;
        info!(
            target = "harbor::workspace",
            from = from.map(WorkspaceConnectivityState::as_str).unwrap_or("none"),
            to = next.map(WorkspaceConnectivityState::as_str).unwrap_or("none"),
            "connectivity changed"
        );
        self.emit(WorkspaceEvent::ConnectivityChanged { from, to: next });

        match next {
            Some(TransientReconnecting) => {
                if matches!(from, None | Some(Healthy) | Some(OfflineModeCandidate)) {
                    self.escalation =
                        Some(Box::pin(tokio::time::sleep(self.escalation_delay)));
                    self.hide_banner();
                }
            }
            Some(Healthy) => {
                self.escalation = None;
                self.hide_banner();
                if matches!(from, Some(TransientReconnecting) | Some(DegradedDisconnected)) {
                    self.request_reload();
                }
            }
            Some(DegradedDisconnected) | Some(OfflineModeCandidate) => {
                self.escalation = None;
                self.show_banner();
            }
            None => {
                self.escalation = None;
                self.hide_banner();
            }
        }
    }

    fn escalate(&mut self) {
        if self.current == Some(WorkspaceConnectivityState::TransientReconnecting) {
            debug!(
                target = "harbor::workspace",
                delay_ms = self.escalation_delay.as_millis() as u64,
                "still reconnecting; escalating"
            );
            self.show_banner();
        }
    }

    fn show_banner(&mut self) {
        if self.banner_visible {
            return;
        }
        self.banner_visible = true;
        metrics::BANNERS_SHOWN.inc();
        self.emit(WorkspaceEvent::BannerShown);
    }

    fn hide_banner(&mut self) {
        if !self.banner_visible {
            return;
        }
        self.banner_visible = false;
        self.emit(WorkspaceEvent::BannerCleared);
    }

    fn request_reload(&self) {
        let Some((slot, target)) = &self.reload else {
            return;
        };
        info!(target = "harbor::workspace", slot = %slot, "reloading after recovery");
        self.emit(WorkspaceEvent::ReloadRequested { slot: slot.clone() });
        target.reload();
    }

    fn emit(&self, event: WorkspaceEvent) {
        if let Err(err) = self.bus.publish(TOPIC, event) {
            warn!(target = "harbor::workspace", error = %err, "workspace event dropped");
        }
    }

    fn publish_snapshot(&self) {
        let next = WorkspaceSnapshot {
            connectivity: self.current,
            previous: self.previous,
            banner_visible: self.banner_visible,
            escalation_pending: self.escalation.is_some(),
            active_device: self.active.clone(),
            offline_mode: self.offline_mode,
            context: self.context.clone(),
        };
        self.snapshot.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }
}

async fn escalation_elapsed(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}
