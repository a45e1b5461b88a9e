//! Kubernetes and OpenShift discovery
//!
//! One [`informer::EndpointsInformer`] per configured namespace keeps a local
//! Endpoints store. A single consumer task turns store changes into
//! discovery events, so events for one object keep their detection order.
//! Trees are built from the stores and memoized by their content hash.

use super::{
    diff_with_modifications, DiscoveryListener, EnvironmentNode, PlatformClient, TargetDiscoveryEvent,
};
use crate::config::KubernetesConfig;
use crate::error::{CryostatError, Result};
use crate::events::{ListenerId, Listeners};
use crate::target::ServiceRef;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub mod api;
pub mod informer;
pub mod tree;

use api::{HttpKubeApi, KubeApi};
use informer::{EndpointsInformer, EndpointsStore, StoreChange};
use tree::{ObjectCache, PortFilter};

/// Realm name of Kubernetes discovery
pub const REALM: &str = "KubernetesApi";

struct KubeState {
    /// Derived targets per `(namespace, endpoints name)`
    services: Mutex<BTreeMap<(String, String), Vec<ServiceRef>>>,
    listeners: Listeners<TargetDiscoveryEvent>,
}

impl KubeState {
    async fn apply(&self, api: &dyn KubeApi, filter: &PortFilter, change: StoreChange) {
        let current = match &change.endpoints {
            Some(endpoints) => {
                let mut cache = ObjectCache::new(api);
                tree::matched_endpoints(endpoints, &change.namespace, filter, &mut cache)
                    .await
                    .into_iter()
                    .map(|m| m.service_ref)
                    .collect()
            }
            None => Vec::new(),
        };
        let key = (change.namespace, change.name);
        let previous = {
            let mut services = self.services.lock().unwrap_or_else(PoisonError::into_inner);
            let previous = services.remove(&key).unwrap_or_default();
            if !current.is_empty() {
                services.insert(key.clone(), current.clone());
            }
            previous
        };
        for event in diff_with_modifications(&previous, &current) {
            debug!(namespace = %key.0, endpoints = %key.1, kind = %event.kind, target = %event.service_ref, "Kubernetes target change");
            self.listeners.emit(&event);
        }
    }
}

struct TreeMemo {
    hash: String,
    tree: EnvironmentNode,
}

/// Discovery backend over Kubernetes Endpoints
pub struct KubeApiPlatformClient {
    api: Arc<dyn KubeApi>,
    filter: Arc<PortFilter>,
    stores: BTreeMap<String, EndpointsStore>,
    state: Arc<KubeState>,
    memo: tokio::sync::Mutex<Option<TreeMemo>>,
    running: tokio::sync::Mutex<Option<(CancellationToken, Vec<JoinHandle<()>>)>>,
}

impl KubeApiPlatformClient {
    /// Creates a client watching `namespaces` through `api`
    pub fn new(api: Arc<dyn KubeApi>, namespaces: Vec<String>, filter: PortFilter) -> Self {
        let stores = namespaces
            .into_iter()
            .map(|ns| (ns, EndpointsStore::default()))
            .collect();
        Self {
            api,
            filter: Arc::new(filter),
            stores,
            state: Arc::new(KubeState {
                services: Mutex::new(BTreeMap::new()),
                listeners: Listeners::new(),
            }),
            memo: tokio::sync::Mutex::new(None),
            running: tokio::sync::Mutex::new(None),
        }
    }

    /// Creates a client from in-cluster service account credentials
    ///
    /// Without configured namespaces, the pod's own namespace is watched.
    ///
    /// # Errors
    ///
    /// Returns `CryostatError::Startup` when not running inside a cluster or
    /// when no namespace can be determined.
    pub fn in_cluster(config: KubernetesConfig) -> Result<Self> {
        let api = HttpKubeApi::in_cluster(&config)?;
        let namespaces = if config.namespaces.is_empty() {
            let own = std::fs::read_to_string(&config.namespace_path).map_err(|e| {
                CryostatError::Startup(format!(
                    "no namespaces configured and {} unreadable: {}",
                    config.namespace_path.display(),
                    e
                ))
            })?;
            vec![own.trim().to_string()]
        } else {
            config.namespaces.clone()
        };
        Ok(Self::new(Arc::new(api), namespaces, PortFilter::from_config(&config)))
    }

    /// Namespaces being watched
    pub fn namespaces(&self) -> Vec<&str> {
        self.stores.keys().map(String::as_str).collect()
    }

    fn snapshot(&self) -> Vec<(String, Vec<api::Endpoints>)> {
        self.stores
            .iter()
            .map(|(ns, store)| {
                let items = store
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .values()
                    .cloned()
                    .collect();
                (ns.clone(), items)
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl PlatformClient for KubeApiPlatformClient {
    fn realm(&self) -> &str {
        REALM
    }

    async fn is_available(&self) -> bool {
        self.api.ping().await
    }

    async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }
        let token = CancellationToken::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut tasks = Vec::new();
        for (namespace, store) in &self.stores {
            let informer = EndpointsInformer::new(namespace.clone(), self.api.clone(), store.clone(), tx.clone());
            tasks.push(tokio::spawn(informer.run(token.clone())));
        }
        drop(tx);

        let state = self.state.clone();
        let api = self.api.clone();
        let filter = self.filter.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(change) = rx.recv().await {
                state.apply(api.as_ref(), &filter, change).await;
            }
        }));
        info!(namespaces = ?self.namespaces(), "Kubernetes discovery started");
        *running = Some((token, tasks));
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if let Some((token, _tasks)) = self.running.lock().await.take() {
            token.cancel();
            info!("Kubernetes discovery stopped");
        }
        Ok(())
    }

    async fn list_discoverable_services(&self) -> Result<Vec<ServiceRef>> {
        Ok(self
            .state
            .services
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .flatten()
            .cloned()
            .collect())
    }

    async fn discovery_tree(&self) -> Result<EnvironmentNode> {
        let stores = self.snapshot();
        let hash = tree::store_hash(&stores);
        let mut memo = self.memo.lock().await;
        if let Some(previous) = memo.as_ref() {
            if previous.hash == hash {
                return Ok(previous.tree.clone());
            }
        }
        let built = tree::build_tree(&stores, &self.filter, self.api.as_ref()).await;
        *memo = Some(TreeMemo {
            hash,
            tree: built.clone(),
        });
        Ok(built)
    }

    fn add_listener(&self, listener: DiscoveryListener) -> ListenerId {
        self.state.listeners.add(listener)
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.state.listeners.remove(id)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::api::{Endpoints, EndpointsList, KubeApi, ListMeta, ObjectMeta, WatchEvent};
    use crate::error::Result;
    use futures::stream::{BoxStream, StreamExt};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// In-memory API server
    #[derive(Default)]
    pub struct FakeKubeApi {
        objects: Mutex<HashMap<(String, String, String), ObjectMeta>>,
        endpoints: Mutex<HashMap<String, Vec<Endpoints>>>,
        watches: Mutex<HashMap<String, Vec<WatchEvent>>>,
        lookups: AtomicUsize,
    }

    impl FakeKubeApi {
        pub fn insert_object(&self, namespace: &str, kind: &str, meta: ObjectMeta) {
            self.objects
                .lock()
                .unwrap()
                .insert((namespace.to_string(), kind.to_string(), meta.name.clone()), meta);
        }

        pub fn set_endpoints(&self, namespace: &str, items: Vec<Endpoints>) {
            self.endpoints.lock().unwrap().insert(namespace.to_string(), items);
        }

        /// Events served by the next watch call; later calls stay open
        pub fn push_watch_events(&self, namespace: &str, events: Vec<WatchEvent>) {
            self.watches.lock().unwrap().insert(namespace.to_string(), events);
        }

        pub fn object_lookups(&self) -> usize {
            self.lookups.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl KubeApi for FakeKubeApi {
        async fn ping(&self) -> bool {
            true
        }

        async fn list_endpoints(&self, namespace: &str) -> Result<EndpointsList> {
            Ok(EndpointsList {
                metadata: ListMeta {
                    resource_version: Some("1".to_string()),
                },
                items: self
                    .endpoints
                    .lock()
                    .unwrap()
                    .get(namespace)
                    .cloned()
                    .unwrap_or_default(),
            })
        }

        async fn watch_endpoints(
            &self,
            namespace: &str,
            _resource_version: &str,
        ) -> Result<BoxStream<'static, Result<WatchEvent>>> {
            match self.watches.lock().unwrap().remove(namespace) {
                Some(events) => Ok(futures::stream::iter(events.into_iter().map(Ok))
                    .chain(futures::stream::pending())
                    .boxed()),
                None => Ok(futures::stream::pending().boxed()),
            }
        }

        async fn get_object(&self, namespace: &str, kind: &str, name: &str) -> Result<Option<ObjectMeta>> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .objects
                .lock()
                .unwrap()
                .get(&(namespace.to_string(), kind.to_string(), name.to_string()))
                .cloned())
        }
    }
}
