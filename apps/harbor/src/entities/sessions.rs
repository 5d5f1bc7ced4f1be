use std::sync::{Arc, Weak};

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::watch;
use tracing::debug;

use super::{EntityCache, LoaderContext};
use crate::error::RelayError;
use crate::load::{FetchRequest, LoadHandle, TieredFetchCoordinator, TieredView};
use crate::relay::RelayRequest;
use crate::workspace::{ReloadTarget, WorkspaceStateMachine};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub project_directory: String,
    #[serde(default)]
    pub task_description: Option<String>,
    #[serde(default)]
    pub included_files: Vec<String>,
    #[serde(default)]
    pub updated_at: Option<i64>,
    /// True for the full record; the overview omits file lists and text.
    #[serde(skip)]
    pub detailed: bool,
}

struct Inner {
    ctx: LoaderContext,
    machine: WorkspaceStateMachine,
    cache: EntityCache<String, SessionRecord>,
    coordinator: TieredFetchCoordinator<String, SessionRecord>,
    current: Mutex<Option<String>>,
}

/// Loads the active session and registers itself as the workspace's reload
/// target, so a recovered connection refreshes the session on screen.
#[derive(Clone)]
pub struct SessionLoader {
    inner: Arc<Inner>,
}

impl SessionLoader {
    pub const SLOT: &'static str = "session";

    pub fn new(ctx: LoaderContext, machine: WorkspaceStateMachine) -> Self {
        let coordinator =
            TieredFetchCoordinator::with_failure_sink(Self::SLOT, ctx.load_timeout, ctx.failure_sink());
        Self {
            inner: Arc::new(Inner {
                ctx,
                machine,
                cache: EntityCache::new(),
                coordinator,
                current: Mutex::new(None),
            }),
        }
    }

    /// Makes `session_id` the session on screen and loads it.
    pub fn open(&self, session_id: impl Into<String>) -> LoadHandle {
        let session_id = session_id.into();
        *self.inner.current.lock() = Some(session_id.clone());
        self.inner.machine.register_reload(
            Self::SLOT,
            Arc::new(Reloader(Arc::downgrade(&self.inner))),
        );
        self.inner.load(session_id)
    }

    /// Reloads the open session, if any.
    pub fn refresh(&self) -> Option<LoadHandle> {
        self.inner.refresh()
    }

    pub fn close(&self) {
        self.inner.current.lock().take();
        self.inner.coordinator.cancel();
    }

    pub fn current(&self) -> Option<String> {
        self.inner.current.lock().clone()
    }

    pub fn view(&self) -> TieredView<String, SessionRecord> {
        self.inner.coordinator.view()
    }

    pub fn subscribe(&self) -> watch::Receiver<TieredView<String, SessionRecord>> {
        self.inner.coordinator.subscribe()
    }

    pub fn updates(&self) -> BoxStream<'static, TieredView<String, SessionRecord>> {
        self.inner.coordinator.updates()
    }
}

impl Inner {
    fn refresh(&self) -> Option<LoadHandle> {
        let session_id = self.current.lock().clone()?;
        Some(self.load(session_id))
    }

    fn load(&self, session_id: String) -> LoadHandle {
        let fast = self.fetch(&session_id, "session.getOverview", "overview", false);
        let full = self.fetch(&session_id, "session.get", "session", true);
        let cache = self.cache.clone();
        let request = FetchRequest::new(session_id, fast, full)
            .cache(move |id| cache.get(id))
            .sufficient(|session: &SessionRecord| session.detailed);
        self.coordinator.load(self.ctx.targeted(request))
    }

    fn fetch(
        &self,
        session_id: &str,
        method: &'static str,
        field: &'static str,
        detailed: bool,
    ) -> impl FnOnce() -> BoxFuture<'static, Result<SessionRecord, RelayError>> + Send + 'static {
        let remote = self.ctx.remote::<SessionRecord>(
            RelayRequest::new(method, json!({ "sessionId": session_id })),
            field,
        );
        let cache = self.cache.clone();
        move || {
            Box::pin(async move {
                let mut session = remote.await?;
                session.detailed = detailed;
                cache.insert(session.id.clone(), session.clone(), detailed);
                Ok(session)
            })
        }
    }
}

struct Reloader(Weak<Inner>);

impl ReloadTarget for Reloader {
    fn reload(&self) {
        let Some(inner) = self.0.upgrade() else {
            return;
        };
        if let Some(handle) = inner.refresh() {
            debug!(
                target = "harbor::entities",
                slot = handle.slot(),
                generation = handle.generation(),
                "session reload started"
            );
        }
    }
}
