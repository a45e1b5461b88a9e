//! Per-namespace Endpoints informer
//!
//! Lists once, then follows the watch stream, keeping a local store keyed by
//! object name. Every store change is queued for the consumer; the informer
//! itself never performs lookups beyond list and watch.

use super::api::{Endpoints, KubeApi, WatchEvent};
use crate::error::Result;
use futures::StreamExt;
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Local copy of one namespace's Endpoints, keyed by name
pub type EndpointsStore = Arc<RwLock<BTreeMap<String, Endpoints>>>;

/// One object changed in a store; `endpoints` is `None` after deletion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreChange {
    /// Namespace of the store
    pub namespace: String,
    /// Object name
    pub name: String,
    /// Current object
    pub endpoints: Option<Endpoints>,
}

/// List/watch loop for one namespace
pub struct EndpointsInformer {
    namespace: String,
    api: Arc<dyn KubeApi>,
    store: EndpointsStore,
    changes: mpsc::UnboundedSender<StoreChange>,
}

impl EndpointsInformer {
    /// Creates an informer writing into `store`
    pub fn new(
        namespace: impl Into<String>,
        api: Arc<dyn KubeApi>,
        store: EndpointsStore,
        changes: mpsc::UnboundedSender<StoreChange>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            api,
            store,
            changes,
        }
    }

    /// Runs until cancelled, relisting with jittered back-off after failures
    pub async fn run(self, token: CancellationToken) {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            let result = tokio::select! {
                _ = token.cancelled() => return,
                r = self.list_and_watch() => r,
            };
            match result {
                Ok(()) => {
                    debug!(namespace = %self.namespace, "Endpoints watch ended, relisting");
                    backoff = INITIAL_BACKOFF;
                }
                Err(e) => {
                    warn!(namespace = %self.namespace, error = %e, "Endpoints informer failed");
                }
            }
            let delay = jittered(backoff);
            backoff = (backoff * 2).min(MAX_BACKOFF);
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One list followed by watches from the listed resource version
    ///
    /// Returns `Ok` when the server ends the watch or reports it expired, so
    /// the caller relists.
    async fn list_and_watch(&self) -> Result<()> {
        let list = self.api.list_endpoints(&self.namespace).await?;
        let mut resource_version = list.metadata.resource_version.clone().unwrap_or_default();
        self.replace(list.items);

        let mut stream = self
            .api
            .watch_endpoints(&self.namespace, &resource_version)
            .await?;
        while let Some(event) = stream.next().await {
            match event? {
                WatchEvent::Added(endpoints) | WatchEvent::Modified(endpoints) => {
                    if let Some(rv) = &endpoints.metadata.resource_version {
                        resource_version = rv.clone();
                    }
                    self.upsert(endpoints);
                }
                WatchEvent::Deleted(endpoints) => {
                    if let Some(rv) = &endpoints.metadata.resource_version {
                        resource_version = rv.clone();
                    }
                    self.delete(&endpoints.metadata.name);
                }
                WatchEvent::Bookmark(rv) => resource_version = rv,
                WatchEvent::Error(message) => {
                    debug!(namespace = %self.namespace, %message, "Watch expired");
                    return Ok(());
                }
            }
        }
        debug!(namespace = %self.namespace, resource_version = %resource_version, "Watch stream closed");
        Ok(())
    }

    fn replace(&self, items: Vec<Endpoints>) {
        let incoming: BTreeMap<String, Endpoints> = items
            .into_iter()
            .map(|e| (e.metadata.name.clone(), e))
            .collect();
        let mut changes = Vec::new();
        {
            let mut store = self.store.write().unwrap_or_else(PoisonError::into_inner);
            for name in store.keys() {
                if !incoming.contains_key(name) {
                    changes.push(self.change(name, None));
                }
            }
            for (name, endpoints) in &incoming {
                if store.get(name) != Some(endpoints) {
                    changes.push(self.change(name, Some(endpoints.clone())));
                }
            }
            *store = incoming;
        }
        self.send(changes);
    }

    fn upsert(&self, endpoints: Endpoints) {
        let name = endpoints.metadata.name.clone();
        let changed = {
            let mut store = self.store.write().unwrap_or_else(PoisonError::into_inner);
            let changed = store.get(&name) != Some(&endpoints);
            store.insert(name.clone(), endpoints.clone());
            changed
        };
        if changed {
            self.send(vec![self.change(&name, Some(endpoints))]);
        }
    }

    fn delete(&self, name: &str) {
        let removed = self
            .store
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        if removed.is_some() {
            self.send(vec![self.change(name, None)]);
        }
    }

    fn change(&self, name: &str, endpoints: Option<Endpoints>) -> StoreChange {
        StoreChange {
            namespace: self.namespace.clone(),
            name: name.to_string(),
            endpoints,
        }
    }

    fn send(&self, changes: Vec<StoreChange>) {
        for change in changes {
            if self.changes.send(change).is_err() {
                debug!(namespace = %self.namespace, "Store change consumer gone");
                return;
            }
        }
    }
}

fn jittered(base: Duration) -> Duration {
    let millis = base.as_millis() as u64;
    let jitter = rand::rng().random_range(0..=millis / 2);
    Duration::from_millis(millis + jitter)
}

#[cfg(test)]
mod tests {
    use super::super::api::ObjectMeta;
    use super::super::test_support::FakeKubeApi;
    use super::*;

    fn named(name: &str, rv: &str) -> Endpoints {
        Endpoints {
            metadata: ObjectMeta {
                name: name.to_string(),
                resource_version: Some(rv.to_string()),
                ..Default::default()
            },
            subsets: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_list_then_watch_updates_store_and_queues_changes() {
        let api = Arc::new(FakeKubeApi::default());
        api.set_endpoints("ns", vec![named("a", "1"), named("b", "1")]);
        api.push_watch_events(
            "ns",
            vec![
                WatchEvent::Modified(named("a", "2")),
                WatchEvent::Deleted(named("b", "3")),
                WatchEvent::Bookmark("4".to_string()),
            ],
        );

        let store: EndpointsStore = Arc::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let informer = EndpointsInformer::new("ns", api.clone(), store.clone(), tx);
        let token = CancellationToken::new();
        let task = tokio::spawn(informer.run(token.clone()));

        let mut names = Vec::new();
        for _ in 0..4 {
            let change = rx.recv().await.unwrap();
            names.push((change.name, change.endpoints.is_some()));
        }
        token.cancel();
        task.await.unwrap();

        assert_eq!(
            names,
            vec![
                ("a".to_string(), true),
                ("b".to_string(), true),
                ("a".to_string(), true),
                ("b".to_string(), false),
            ]
        );
        let store = store.read().unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store["a"].metadata.resource_version.as_deref(), Some("2"));
    }

    #[test]
    fn test_unchanged_relist_queues_nothing() {
        let api = Arc::new(FakeKubeApi::default());
        let store: EndpointsStore = Arc::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let informer = EndpointsInformer::new("ns", api, store, tx);

        informer.replace(vec![named("a", "1")]);
        assert!(rx.try_recv().is_ok());
        informer.replace(vec![named("a", "1")]);
        assert!(rx.try_recv().is_err());
        informer.replace(Vec::new());
        assert_eq!(rx.try_recv().unwrap().endpoints, None);
    }

    #[test]
    fn test_jitter_stays_within_half_again() {
        for _ in 0..32 {
            let d = jittered(Duration::from_secs(2));
            assert!(d >= Duration::from_secs(2) && d <= Duration::from_secs(3));
        }
    }
}
