use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::watch;

use super::{EntityCache, LoaderContext};
use crate::error::RelayError;
use crate::load::{FetchRequest, LoadHandle, TieredFetchCoordinator, TieredView};
use crate::relay::RelayRequest;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderEntry {
    pub name: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_count: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderListing {
    pub path: String,
    pub folders: Vec<FolderEntry>,
    /// Set once the listing carries per-folder metadata.
    pub detailed: bool,
}

/// Directory picker backing store. One slot: browsing a new path supersedes
/// the listing still loading for the previous one.
#[derive(Clone)]
pub struct FolderBrowser {
    ctx: LoaderContext,
    cache: EntityCache<String, FolderListing>,
    coordinator: TieredFetchCoordinator<String, FolderListing>,
}

impl FolderBrowser {
    pub const SLOT: &'static str = "folders";

    pub fn new(ctx: LoaderContext) -> Self {
        let coordinator =
            TieredFetchCoordinator::with_failure_sink(Self::SLOT, ctx.load_timeout, ctx.failure_sink());
        Self {
            ctx,
            cache: EntityCache::new(),
            coordinator,
        }
    }

    pub fn browse(&self, path: impl Into<String>) -> LoadHandle {
        let path = path.into();
        let fast = self.fetch(&path, false);
        let full = self.fetch(&path, true);
        let cache = self.cache.clone();
        let request = FetchRequest::new(path, fast, full)
            .cache(move |path| cache.get(path))
            .sufficient(|listing: &FolderListing| listing.detailed);
        self.coordinator.load(self.ctx.targeted(request))
    }

    fn fetch(
        &self,
        path: &str,
        detailed: bool,
    ) -> impl FnOnce() -> BoxFuture<'static, Result<FolderListing, RelayError>> + Send + 'static {
        let params = if detailed {
            json!({ "directoryPath": path, "includeMetadata": true })
        } else {
            json!({ "directoryPath": path })
        };
        let remote = self
            .ctx
            .remote::<Vec<FolderEntry>>(RelayRequest::new("fs.listFolders", params), "folders");
        let cache = self.cache.clone();
        let path = path.to_string();
        move || {
            Box::pin(async move {
                let folders = remote.await?;
                let listing = FolderListing {
                    path: path.clone(),
                    folders,
                    detailed,
                };
                cache.insert(path, listing.clone(), detailed);
                Ok(listing)
            })
        }
    }

    pub fn view(&self) -> TieredView<String, FolderListing> {
        self.coordinator.view()
    }

    pub fn subscribe(&self) -> watch::Receiver<TieredView<String, FolderListing>> {
        self.coordinator.subscribe()
    }

    pub fn updates(&self) -> BoxStream<'static, TieredView<String, FolderListing>> {
        self.coordinator.updates()
    }

    pub fn cancel(&self) {
        self.coordinator.cancel();
    }

    pub fn cache(&self) -> &EntityCache<String, FolderListing> {
        &self.cache
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::entities::test_support::context;
    use crate::load::Tier;
    use crate::relay::mock::{ScriptedRelay, ScriptedResponse};
    use tokio::time::sleep;

    fn folders(names: &[&str], with_meta: bool) -> serde_json::Value {
        let entries: Vec<_> = names
            .iter()
            .map(|name| {
                if with_meta {
                    json!({ "name": name, "path": format!("/{name}"), "childCount": 2 })
                } else {
                    json!({ "name": name, "path": format!("/{name}") })
                }
            })
            .collect();
        json!({ "folders": entries })
    }

    fn scripted() -> Arc<ScriptedRelay> {
        let relay = Arc::new(ScriptedRelay::new());
        relay.set_responder(|_, request| {
            let detailed = request.params.get("includeMetadata").is_some();
            if detailed {
                ScriptedResponse::value(Duration::from_millis(300), folders(&["src", "docs"], true))
            } else {
                ScriptedResponse::value(Duration::from_millis(50), folders(&["src"], false))
            }
        });
        relay
    }

    #[tokio::test(start_paused = true)]
    async fn fast_listing_renders_then_metadata_hydrates() {
        let relay = scripted();
        let browser = FolderBrowser::new(context(&relay));
        browser.browse("/home/user");
        assert!(browser.view().is_loading);

        sleep(Duration::from_millis(60)).await;
        let view = browser.view();
        assert!(!view.is_loading);
        assert_eq!(view.tier, Some(Tier::Fast));
        assert_eq!(view.value.as_ref().map(|l| l.folders.len()), Some(1));

        sleep(Duration::from_millis(300)).await;
        let view = browser.view();
        assert!(!view.is_loading);
        let listing = view.value.unwrap();
        assert!(listing.detailed);
        assert_eq!(listing.folders[1].child_count, Some(2));
        assert!(browser.cache().is_complete(&"/home/user".to_string()));

        let methods: Vec<_> = relay
            .invocations()
            .into_iter()
            .map(|(device, req)| (device.to_string(), req.method))
            .collect();
        assert_eq!(
            methods,
            vec![
                ("desk-1".to_string(), "fs.listFolders".to_string()),
                ("desk-1".to_string(), "fs.listFolders".to_string()),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn detailed_cache_entry_skips_the_fast_call() {
        let relay = scripted();
        let browser = FolderBrowser::new(context(&relay));
        browser.browse("/home/user");
        sleep(Duration::from_millis(400)).await;
        let before = relay.invocations().len();

        browser.browse("/home/user");
        let view = browser.view();
        assert_eq!(view.tier, Some(Tier::Cache));
        assert!(!view.is_loading);
        sleep(Duration::from_millis(400)).await;
        // only the background refresh went out
        assert_eq!(relay.invocations().len(), before + 1);
    }
}
