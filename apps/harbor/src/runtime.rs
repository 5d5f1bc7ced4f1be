//! Composition root: builds every component once, wires the supervisor's state
//! feed into the workspace machine and tears everything down together.

use std::collections::HashMap;
use std::sync::Arc;

use futures::Stream;
use parking_lot::Mutex;
use state_bus::{Bus, LocalBus};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::ClientConfig;
use crate::connection::{
    ConnectReason, ConnectionEvent, ConnectionSupervisor, DeviceId, LifecycleEvent, PresenceMonitor,
};
use crate::entities::{
    EntityCache, FolderBrowser, JobDetailLoader, JobRecord, LoaderContext, SessionLoader,
};
use crate::error::RelayError;
use crate::load::LoadHandle;
use crate::relay::{RelayCommandChannel, RelayConnector};
use crate::workspace::{WorkspaceError, WorkspaceEvent, WorkspaceStateMachine};

pub struct WorkspaceRuntime {
    config: ClientConfig,
    supervisor: ConnectionSupervisor,
    machine: WorkspaceStateMachine,
    loaders: LoaderContext,
    folders: FolderBrowser,
    sessions: SessionLoader,
    jobs: EntityCache<String, JobRecord>,
    job_loaders: Mutex<HashMap<String, JobDetailLoader>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    presence: Mutex<Option<PresenceMonitor>>,
}

impl WorkspaceRuntime {
    /// Must be called from within a tokio runtime.
    pub fn start<R>(config: ClientConfig, relay: Arc<R>) -> Self
    where
        R: RelayConnector + RelayCommandChannel + 'static,
    {
        let connections: Arc<dyn Bus<ConnectionEvent>> = Arc::new(LocalBus::<ConnectionEvent>::new());
        let workspace: Arc<dyn Bus<WorkspaceEvent>> = Arc::new(LocalBus::<WorkspaceEvent>::new());

        let connector: Arc<dyn RelayConnector> = relay.clone();
        let channel: Arc<dyn RelayCommandChannel> = relay;
        let supervisor = ConnectionSupervisor::new(
            connector,
            connections,
            config.connect_timeout,
            config.backoff,
        );
        let (machine, actor) =
            WorkspaceStateMachine::spawn(workspace, config.escalation_delay, config.offline_mode);
        let feed = machine.attach_supervisor(&supervisor);

        let loaders = LoaderContext::new(channel, supervisor.clone(), config.load_timeout);
        let folders = FolderBrowser::new(loaders.clone());
        let sessions = SessionLoader::new(loaders.clone(), machine.clone());

        info!(
            target = "harbor::runtime",
            relay = %config.relay_url,
            offline = config.offline_mode,
            "workspace runtime started"
        );
        Self {
            config,
            supervisor,
            machine,
            loaders,
            folders,
            sessions,
            jobs: EntityCache::new(),
            job_loaders: Mutex::new(HashMap::new()),
            tasks: Mutex::new(vec![actor, feed]),
            presence: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn supervisor(&self) -> &ConnectionSupervisor {
        &self.supervisor
    }

    pub fn machine(&self) -> &WorkspaceStateMachine {
        &self.machine
    }

    pub fn folders(&self) -> &FolderBrowser {
        &self.folders
    }

    pub fn sessions(&self) -> &SessionLoader {
        &self.sessions
    }

    /// Loader for one job. Repeated calls for the same id share a slot, so a
    /// second `load()` supersedes the first.
    pub fn job(&self, job_id: impl Into<String>) -> JobDetailLoader {
        let job_id = job_id.into();
        self.job_loaders
            .lock()
            .entry(job_id.clone())
            .or_insert_with(|| JobDetailLoader::new(self.loaders.clone(), self.jobs.clone(), job_id))
            .clone()
    }

    fn cancel_jobs(&self) {
        for loader in self.job_loaders.lock().values() {
            loader.cancel();
        }
    }

    /// Follows `device` and connects to it.
    pub async fn select_device(&self, device: DeviceId) -> Result<(), RelayError> {
        self.supervisor.set_active_device(Some(device.clone()));
        self.supervisor.connect(&device, ConnectReason::UserSelected).await
    }

    /// Switches project. Loads bound to the old project are cancelled and the
    /// session context is reset before this returns.
    pub async fn select_project(&self, project: Option<String>) -> Result<u64, WorkspaceError> {
        self.folders.cancel();
        self.sessions.close();
        self.cancel_jobs();
        self.machine.select_project(project).await
    }

    pub async fn select_session(&self, session_id: impl Into<String>) -> Result<LoadHandle, WorkspaceError> {
        let session_id = session_id.into();
        self.sessions.close();
        self.machine.select_session(Some(session_id.clone())).await?;
        Ok(self.sessions.open(session_id))
    }

    pub fn set_offline_mode(&self, enabled: bool) {
        self.machine.set_offline_mode(enabled);
    }

    pub fn handle_lifecycle(&self, event: LifecycleEvent) {
        self.supervisor.handle_lifecycle(event);
    }

    /// Replaces the device-discovery feed.
    pub fn watch_presence<S>(&self, feed: S)
    where
        S: Stream<Item = (DeviceId, bool)> + Send + 'static,
    {
        let monitor = PresenceMonitor::spawn(self.supervisor.clone(), feed);
        if let Some(previous) = self.presence.lock().replace(monitor) {
            previous.stop();
        }
    }

    pub fn shutdown(&self) {
        if let Some(presence) = self.presence.lock().take() {
            presence.stop();
        }
        self.folders.cancel();
        self.sessions.close();
        self.cancel_jobs();
        self.supervisor.shutdown();
        self.machine.shutdown();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        debug!(target = "harbor::runtime", "workspace runtime stopped");
    }
}

impl Drop for WorkspaceRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}
