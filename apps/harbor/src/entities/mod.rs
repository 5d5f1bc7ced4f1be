//! Tiered loaders for the screens the client renders: folder browsing, job
//! detail and the active session.

mod cache;
mod folders;
mod jobs;
mod sessions;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::connection::{ConnectionSupervisor, DeviceId, FailureSink};
use crate::error::RelayError;
use crate::load::FetchRequest;
use crate::relay::{RelayCall, RelayCommandChannel, RelayRequest};

pub use cache::EntityCache;
pub use folders::{FolderBrowser, FolderEntry, FolderListing};
pub use jobs::{JobDetailLoader, JobRecord, JobStatus};
pub use sessions::{SessionLoader, SessionRecord};

/// What every loader needs: the relay channel, the supervisor that names the
/// active device and hears about connection loss, and the load budget.
#[derive(Clone)]
pub struct LoaderContext {
    pub channel: Arc<dyn RelayCommandChannel>,
    pub supervisor: ConnectionSupervisor,
    pub load_timeout: Duration,
}

impl LoaderContext {
    pub fn new(
        channel: Arc<dyn RelayCommandChannel>,
        supervisor: ConnectionSupervisor,
        load_timeout: Duration,
    ) -> Self {
        Self {
            channel,
            supervisor,
            load_timeout,
        }
    }

    pub(crate) fn failure_sink(&self) -> Arc<dyn FailureSink> {
        Arc::new(self.supervisor.clone())
    }

    /// A remote fetch against the active device, captured now so a later
    /// device switch does not redirect an in-flight load.
    pub(crate) fn remote<T>(
        &self,
        request: RelayRequest,
        field: &'static str,
    ) -> impl Future<Output = Result<T, RelayError>> + Send + 'static
    where
        T: DeserializeOwned + Send + 'static,
    {
        let channel = Arc::clone(&self.channel);
        let device = self.supervisor.active_device();
        async move {
            let device = device.ok_or(RelayError::NotConnected)?;
            let value = RelayCall::request(channel.as_ref(), &device, request).await?;
            decode(value, field)
        }
    }

    pub(crate) fn targeted<K, T>(&self, request: FetchRequest<K, T>) -> FetchRequest<K, T>
    where
        T: Send + 'static,
    {
        match self.supervisor.active_device() {
            Some(device) => request.report_to(device),
            None => request,
        }
    }

    pub fn active_device(&self) -> Option<DeviceId> {
        self.supervisor.active_device()
    }
}

/// Pulls `field` out of a result payload such as `{"job": {...}}`.
pub(crate) fn decode<T: DeserializeOwned>(mut value: Value, field: &str) -> Result<T, RelayError> {
    let inner = value
        .get_mut(field)
        .map(Value::take)
        .ok_or_else(|| RelayError::Encoding(format!("response is missing `{field}`")))?;
    Ok(serde_json::from_value(inner)?)
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;
    use std::time::Duration;

    use state_bus::LocalBus;

    use super::LoaderContext;
    use crate::connection::{BackoffPolicy, ConnectionEvent, ConnectionSupervisor, DeviceId};
    use crate::relay::mock::ScriptedRelay;

    /// Loader context whose supervisor follows `desk-1`.
    pub(crate) fn context(relay: &Arc<ScriptedRelay>) -> LoaderContext {
        let supervisor = ConnectionSupervisor::new(
            relay.clone(),
            Arc::new(LocalBus::<ConnectionEvent>::new()),
            Duration::from_secs(10),
            BackoffPolicy::default(),
        );
        supervisor.set_active_device(Some(DeviceId::new("desk-1")));
        LoaderContext::new(relay.clone(), supervisor, Duration::from_secs(12))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_reports_missing_fields_as_encoding_errors() {
        let err = decode::<Vec<String>>(json!({"other": []}), "folders").unwrap_err();
        assert!(matches!(err, RelayError::Encoding(_)));
        let ok: Vec<String> = decode(json!({"folders": ["a"]}), "folders").unwrap();
        assert_eq!(ok, vec!["a".to_string()]);
        let wrong = decode::<Vec<String>>(json!({"folders": 3}), "folders").unwrap_err();
        assert!(matches!(wrong, RelayError::Encoding(_)));
    }
}
