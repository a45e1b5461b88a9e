//! Aggregation of several discovery backends
//!
//! Backend calls run concurrently, each under its own timeout. A failing or
//! slow backend is logged and left out of the result rather than failing the
//! whole call.

use super::{AbstractNode, DiscoveryListener, EnvironmentNode, PlatformClient, TargetDiscoveryEvent};
use crate::error::Result;
use crate::events::{ListenerId, Listeners};
use crate::target::ServiceRef;
use futures::future::join_all;
use metrics::increment_counter;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{info, warn};

/// Notification category for topology changes
pub const TARGET_JVM_DISCOVERY: &str = "TargetJvmDiscovery";

/// Receiver of topology-changed notifications
pub trait NotificationSink: Send + Sync {
    /// Publishes one discovery event under a category
    fn publish(&self, category: &str, event: &TargetDiscoveryEvent);
}

/// Sink that writes notifications to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotificationSink;

impl NotificationSink for TracingNotificationSink {
    fn publish(&self, category: &str, event: &TargetDiscoveryEvent) {
        info!(
            category,
            kind = %event.kind,
            target = %event.service_ref,
            realm = event.service_ref.cryostat_annotation(crate::target::AnnotationKey::Realm).unwrap_or(""),
            "Topology changed"
        );
    }
}

/// Composes several backends into one
pub struct MergingPlatformClient {
    clients: Vec<Arc<dyn PlatformClient>>,
    listeners: Arc<Listeners<TargetDiscoveryEvent>>,
    registrations: Mutex<Vec<ListenerId>>,
    timeout: Duration,
}

impl MergingPlatformClient {
    /// Wraps `clients`, forwarding their events to this client's listeners
    /// and to `sink`
    ///
    /// # Arguments
    ///
    /// * `clients` - Backends to aggregate
    /// * `sink` - Receiver of topology-changed notifications
    /// * `timeout` - Bound on each backend call
    pub fn new(clients: Vec<Arc<dyn PlatformClient>>, sink: Arc<dyn NotificationSink>, timeout: Duration) -> Self {
        let listeners: Arc<Listeners<TargetDiscoveryEvent>> = Arc::new(Listeners::new());
        let mut registrations = Vec::with_capacity(clients.len());
        for client in &clients {
            let listeners = listeners.clone();
            let sink = sink.clone();
            let forward: DiscoveryListener = Arc::new(move |event: &TargetDiscoveryEvent| {
                increment_counter!("discovery_events_total", "kind" => event.kind.to_string());
                listeners.emit(event);
                sink.publish(TARGET_JVM_DISCOVERY, event);
            });
            registrations.push(client.add_listener(forward));
        }
        Self {
            clients,
            listeners,
            registrations: Mutex::new(registrations),
            timeout,
        }
    }

    /// Aggregated backends
    pub fn clients(&self) -> &[Arc<dyn PlatformClient>] {
        &self.clients
    }
}

impl Drop for MergingPlatformClient {
    fn drop(&mut self) {
        let registrations = std::mem::take(
            &mut *self.registrations.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for (client, id) in self.clients.iter().zip(registrations) {
            client.remove_listener(id);
        }
    }
}

#[async_trait::async_trait]
impl PlatformClient for MergingPlatformClient {
    fn realm(&self) -> &str {
        "Universe"
    }

    async fn is_available(&self) -> bool {
        !self.clients.is_empty()
    }

    /// Starts every backend; a backend that fails to start is logged and
    /// keeps the others running
    async fn start(&self) -> Result<()> {
        let results = join_all(self.clients.iter().map(|c| c.start())).await;
        for (client, result) in self.clients.iter().zip(results) {
            match result {
                Ok(()) => info!(realm = %client.realm(), "Discovery backend started"),
                Err(e) => warn!(realm = %client.realm(), error = %e, "Discovery backend failed to start"),
            }
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let results = join_all(self.clients.iter().map(|c| c.stop())).await;
        for (client, result) in self.clients.iter().zip(results) {
            if let Err(e) = result {
                warn!(realm = %client.realm(), error = %e, "Discovery backend failed to stop");
            }
        }
        Ok(())
    }

    async fn list_discoverable_services(&self) -> Result<Vec<ServiceRef>> {
        let calls = self
            .clients
            .iter()
            .map(|c| tokio::time::timeout(self.timeout, c.list_discoverable_services()));
        let results = join_all(calls).await;

        let mut services = Vec::new();
        for (client, result) in self.clients.iter().zip(results) {
            match result {
                Ok(Ok(found)) => services.extend(found),
                Ok(Err(e)) => {
                    warn!(realm = %client.realm(), error = %e, "Discovery backend listing failed")
                }
                Err(_) => {
                    warn!(realm = %client.realm(), timeout_ms = self.timeout.as_millis() as u64, "Discovery backend listing timed out")
                }
            }
        }
        Ok(services)
    }

    async fn discovery_tree(&self) -> Result<EnvironmentNode> {
        let calls = self
            .clients
            .iter()
            .map(|c| tokio::time::timeout(self.timeout, c.discovery_tree()));
        let results = join_all(calls).await;

        let mut universe = EnvironmentNode::universe();
        for (client, result) in self.clients.iter().zip(results) {
            let subtree = match result {
                Ok(Ok(tree)) => tree,
                Ok(Err(e)) => {
                    warn!(realm = %client.realm(), error = %e, "Discovery tree build failed");
                    EnvironmentNode::realm(client.realm())
                }
                Err(_) => {
                    warn!(realm = %client.realm(), "Discovery tree build timed out");
                    EnvironmentNode::realm(client.realm())
                }
            };
            universe.add_child(AbstractNode::Environment(subtree));
        }
        Ok(universe)
    }

    fn add_listener(&self, listener: DiscoveryListener) -> ListenerId {
        self.listeners.add(listener)
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }
}
