//! Platform discovery
//!
//! Each discovery backend implements [`PlatformClient`] and watches one
//! source of truth. [`MergingPlatformClient`] composes the available
//! backends into one event stream and one topology tree.
//!
//! # Modules
//!
//! - [`node`]: discovery tree nodes
//! - [`custom`]: user-maintained target list
//! - [`jdp`]: Java Discovery Protocol network discovery
//! - [`container`]: Docker and Podman control-socket polling
//! - [`kubernetes`]: Endpoints informers and owner-chain trees
//! - [`merging`]: aggregation of several backends

use crate::config::DiscoveryConfig;
use crate::error::Result;
use crate::events::{Listener, ListenerId};
use crate::target::ServiceRef;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub mod container;
pub mod custom;
pub mod jdp;
pub mod kubernetes;
pub mod merging;
pub mod node;

pub use container::{ContainerEngineKind, ContainerPlatformClient};
pub use custom::CustomTargetPlatformClient;
pub use jdp::JdpPlatformClient;
pub use kubernetes::KubeApiPlatformClient;
pub use merging::{MergingPlatformClient, NotificationSink, TracingNotificationSink};
pub use node::{AbstractNode, EnvironmentNode, NodeType, TargetNode};

/// Kind of change reported for a target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    /// Target appeared
    Found,
    /// Target disappeared
    Lost,
    /// Target is still present but its attributes changed
    Modified,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventKind::Found => "FOUND",
            EventKind::Lost => "LOST",
            EventKind::Modified => "MODIFIED",
        };
        f.write_str(s)
    }
}

/// A change detected by a discovery backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetDiscoveryEvent {
    /// What happened
    pub kind: EventKind,
    /// The affected target
    pub service_ref: ServiceRef,
}

impl TargetDiscoveryEvent {
    /// Creates an event
    pub fn new(kind: EventKind, service_ref: ServiceRef) -> Self {
        Self { kind, service_ref }
    }
}

/// Callback receiving discovery events
pub type DiscoveryListener = Listener<TargetDiscoveryEvent>;

/// One discovery backend
///
/// Implementations own their watch resources and caches. `start` and `stop`
/// are idempotent. Events for one target are delivered in the order the
/// backend detected them, exactly once per change.
#[async_trait::async_trait]
pub trait PlatformClient: Send + Sync {
    /// Realm name, also the name of the subtree root
    fn realm(&self) -> &str;

    /// Probes whether the backend's prerequisites are met
    async fn is_available(&self) -> bool {
        true
    }

    /// Begins watching. Fails with a startup error when prerequisites are unmet.
    async fn start(&self) -> Result<()>;

    /// Releases watch resources
    async fn stop(&self) -> Result<()>;

    /// Point-in-time snapshot of discovered targets
    async fn list_discoverable_services(&self) -> Result<Vec<ServiceRef>>;

    /// This backend's subtree, rooted at a realm node
    async fn discovery_tree(&self) -> Result<EnvironmentNode>;

    /// Registers a listener for discovery events
    fn add_listener(&self, listener: DiscoveryListener) -> ListenerId;

    /// Unregisters a listener
    fn remove_listener(&self, id: ListenerId) -> bool;
}

/// Set-difference diff: LOST for refs no longer present, FOUND for new ones.
///
/// Refs are compared by full value, so a changed ref shows up as a LOST of
/// the old value and a FOUND of the new one.
pub fn diff_by_value(previous: &[ServiceRef], current: &[ServiceRef]) -> Vec<TargetDiscoveryEvent> {
    let prev: HashSet<&ServiceRef> = previous.iter().collect();
    let curr: HashSet<&ServiceRef> = current.iter().collect();
    let mut events = Vec::new();
    for lost in previous.iter().filter(|r| !curr.contains(r)) {
        events.push(TargetDiscoveryEvent::new(EventKind::Lost, lost.clone()));
    }
    for found in current.iter().filter(|r| !prev.contains(r)) {
        events.push(TargetDiscoveryEvent::new(EventKind::Found, found.clone()));
    }
    events
}

/// Diff keyed by connect address: refs present on both sides under the same
/// `service_uri` but unequal produce MODIFIED; the rest behave as
/// [`diff_by_value`].
pub fn diff_with_modifications(
    previous: &[ServiceRef],
    current: &[ServiceRef],
) -> Vec<TargetDiscoveryEvent> {
    let prev: HashMap<&str, &ServiceRef> =
        previous.iter().map(|r| (r.service_uri.as_str(), r)).collect();
    let curr: HashMap<&str, &ServiceRef> =
        current.iter().map(|r| (r.service_uri.as_str(), r)).collect();

    let mut events = Vec::new();
    for old in previous {
        if !curr.contains_key(old.service_uri.as_str()) {
            events.push(TargetDiscoveryEvent::new(EventKind::Lost, old.clone()));
        }
    }
    for new in current {
        match prev.get(new.service_uri.as_str()) {
            Some(old) if *old != new => {
                events.push(TargetDiscoveryEvent::new(EventKind::Modified, new.clone()))
            }
            Some(_) => {}
            None => events.push(TargetDiscoveryEvent::new(EventKind::Found, new.clone())),
        }
    }
    events
}

/// Builds every enabled backend whose availability probe succeeds
///
/// Unavailable backends are logged and left out of the result; this is not
/// an error.
pub async fn build_platform_clients(config: &DiscoveryConfig) -> Vec<Arc<dyn PlatformClient>> {
    let mut candidates: Vec<Arc<dyn PlatformClient>> = Vec::new();

    if config.custom.enabled {
        let custom = CustomTargetPlatformClient::new();
        for entry in &config.custom.targets {
            if let Err(e) = custom.add_target(entry.to_service_ref()) {
                warn!(connect_url = %entry.connect_url, error = %e, "Skipping configured custom target");
            }
        }
        candidates.push(Arc::new(custom));
    }
    if config.jdp.enabled {
        candidates.push(Arc::new(JdpPlatformClient::udp(config.jdp.clone())));
    }
    if config.docker.enabled {
        candidates.push(Arc::new(ContainerPlatformClient::over_socket(
            ContainerEngineKind::Docker,
            config.docker.clone(),
        )));
    }
    if config.podman.enabled {
        candidates.push(Arc::new(ContainerPlatformClient::over_socket(
            ContainerEngineKind::Podman,
            config.podman.clone(),
        )));
    }
    if config.kubernetes.enabled {
        match KubeApiPlatformClient::in_cluster(config.kubernetes.clone()) {
            Ok(client) => candidates.push(Arc::new(client)),
            Err(e) => debug!(error = %e, "Kubernetes API client unavailable"),
        }
    }

    let mut available = Vec::new();
    for client in candidates {
        if client.is_available().await {
            info!(realm = %client.realm(), "Discovery backend available");
            available.push(client);
        } else {
            info!(realm = %client.realm(), "Discovery backend unavailable, skipping");
        }
    }
    available
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uri(s: &str) -> ServiceRef {
        ServiceRef::new(s)
    }

    #[test]
    fn test_diff_by_value_lost_and_found() {
        let a = uri("a");
        let b = uri("b");
        let c = uri("c");
        let events = diff_by_value(&[a.clone(), b.clone()], &[a, c.clone()]);
        assert_eq!(
            events,
            vec![
                TargetDiscoveryEvent::new(EventKind::Lost, b),
                TargetDiscoveryEvent::new(EventKind::Found, c),
            ]
        );
    }

    #[test]
    fn test_diff_by_value_changed_ref_is_lost_and_found() {
        let old = uri("a").with_label("v", "1");
        let new = uri("a").with_label("v", "2");
        let events = diff_by_value(&[old], &[new]);
        let kinds: Vec<EventKind> = events.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::Lost, EventKind::Found]);
    }

    #[test]
    fn test_diff_with_modifications() {
        let a = uri("a");
        let b_old = uri("b").with_alias("old");
        let b_new = uri("b").with_alias("new");
        let c = uri("c");
        let events = diff_with_modifications(&[a.clone(), b_old], &[a, b_new.clone(), c.clone()]);
        assert_eq!(
            events,
            vec![
                TargetDiscoveryEvent::new(EventKind::Modified, b_new),
                TargetDiscoveryEvent::new(EventKind::Found, c),
            ]
        );
    }

    #[tokio::test]
    async fn test_duplicate_custom_targets_are_skipped() {
        let mut config = DiscoveryConfig::default();
        config.jdp.enabled = false;
        config.kubernetes.enabled = false;
        config.docker.enabled = false;
        config.podman.enabled = false;
        let entry = |url: &str| crate::config::CustomTargetEntry {
            connect_url: url.to_string(),
            alias: None,
            labels: Default::default(),
            annotations: Default::default(),
        };
        config.custom.targets = vec![
            entry("service:jmx:rmi:///a"),
            entry("service:jmx:rmi:///a"),
            entry("service:jmx:rmi:///b"),
        ];

        let clients = build_platform_clients(&config).await;
        assert_eq!(clients.len(), 1);
        let targets = clients[0].list_discoverable_services().await.unwrap();
        assert_eq!(targets.len(), 2);
    }

    #[test]
    fn test_diff_with_modifications_unchanged_is_silent() {
        let a = uri("a");
        assert!(diff_with_modifications(&[a.clone()], &[a]).is_empty());
    }
}
