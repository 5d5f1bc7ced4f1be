use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::watch;

use super::{EntityCache, LoaderContext};
use crate::error::RelayError;
use crate::load::{FetchRequest, LoadHandle, TieredFetchCoordinator, TieredView};
use crate::relay::RelayRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobStatus {
    Idle,
    Created,
    Queued,
    AcknowledgedByWorker,
    Preparing,
    PreparingInput,
    GeneratingStream,
    ProcessingStream,
    Running,
    CompletedByTag,
    Completed,
    Failed,
    Canceled,
    #[serde(other)]
    Unknown,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::CompletedByTag | JobStatus::Failed | JobStatus::Canceled
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub task_type: String,
    pub status: JobStatus,
    #[serde(default)]
    pub response: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub model_used: Option<String>,
    #[serde(default)]
    pub tokens_sent: Option<i64>,
    #[serde(default)]
    pub tokens_received: Option<i64>,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: Option<i64>,
}

impl JobRecord {
    /// A record is enough to render without waiting for the full fetch once it
    /// carries its response body or can no longer change.
    pub fn is_sufficient(&self) -> bool {
        self.response.is_some() || self.status.is_terminal()
    }
}

/// Loads one job's detail. Each job has its own slot, so reopening the same job
/// supersedes only that job's previous load.
#[derive(Clone)]
pub struct JobDetailLoader {
    job_id: String,
    ctx: LoaderContext,
    cache: EntityCache<String, JobRecord>,
    coordinator: TieredFetchCoordinator<String, JobRecord>,
}

impl JobDetailLoader {
    pub fn new(ctx: LoaderContext, cache: EntityCache<String, JobRecord>, job_id: impl Into<String>) -> Self {
        let job_id = job_id.into();
        let coordinator = TieredFetchCoordinator::with_failure_sink(
            format!("job:{job_id}"),
            ctx.load_timeout,
            ctx.failure_sink(),
        );
        Self {
            job_id,
            ctx,
            cache,
            coordinator,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn load(&self) -> LoadHandle {
        let fast = self.fetch(true);
        let full = self.fetch(false);
        let cache = self.cache.clone();
        let request = FetchRequest::new(self.job_id.clone(), fast, full)
            .cache(move |id| cache.get(id))
            .sufficient(JobRecord::is_sufficient)
            .merge(|shown, full| match shown {
                // A summary that raced ahead may carry a newer status.
                Some(shown) if shown.updated_at > full.updated_at => JobRecord {
                    status: shown.status,
                    updated_at: shown.updated_at,
                    ..full
                },
                _ => full,
            });
        self.coordinator.load(self.ctx.targeted(request))
    }

    fn fetch(
        &self,
        summary_only: bool,
    ) -> impl FnOnce() -> BoxFuture<'static, Result<JobRecord, RelayError>> + Send + 'static {
        let params = if summary_only {
            json!({ "jobId": self.job_id, "summaryOnly": true })
        } else {
            json!({ "jobId": self.job_id })
        };
        let remote = self
            .ctx
            .remote::<JobRecord>(RelayRequest::new("job.get", params), "job");
        let cache = self.cache.clone();
        move || {
            Box::pin(async move {
                let job = remote.await?;
                cache.insert(job.id.clone(), job.clone(), !summary_only);
                Ok(job)
            })
        }
    }

    pub fn view(&self) -> TieredView<String, JobRecord> {
        self.coordinator.view()
    }

    pub fn subscribe(&self) -> watch::Receiver<TieredView<String, JobRecord>> {
        self.coordinator.subscribe()
    }

    pub fn updates(&self) -> BoxStream<'static, TieredView<String, JobRecord>> {
        self.coordinator.updates()
    }

    pub fn cancel(&self) {
        self.coordinator.cancel();
    }
}
