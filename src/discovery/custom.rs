//! User-maintained target list
//!
//! Targets are added and removed explicitly. Every mutation emits its event
//! immediately; the subtree is flat.

use super::{DiscoveryListener, EnvironmentNode, EventKind, NodeType, PlatformClient, TargetDiscoveryEvent};
use crate::error::{CryostatError, Result};
use crate::events::{ListenerId, Listeners};
use crate::target::{parse_host_port, AnnotationKey, ServiceRef};
use std::collections::BTreeMap;
use std::sync::Mutex;
use tracing::info;

/// Realm name of the custom target list
pub const REALM: &str = "Custom Targets";

/// Discovery backend over an explicit add/remove set, ordered by connect address
pub struct CustomTargetPlatformClient {
    targets: Mutex<BTreeMap<String, ServiceRef>>,
    listeners: Listeners<TargetDiscoveryEvent>,
}

impl CustomTargetPlatformClient {
    /// Creates an empty list
    pub fn new() -> Self {
        Self {
            targets: Mutex::new(BTreeMap::new()),
            listeners: Listeners::new(),
        }
    }

    /// Adds a target and emits FOUND
    ///
    /// The realm annotation is attached, as are host and port annotations
    /// when the connect address can be parsed.
    ///
    /// # Errors
    ///
    /// Returns `CryostatError::Discovery` when a target with the same connect
    /// address is already present.
    pub fn add_target(&self, target: ServiceRef) -> Result<ServiceRef> {
        let mut target = target.with_cryostat_annotation(AnnotationKey::Realm, REALM);
        if let Some((host, port)) = parse_host_port(&target.service_uri) {
            target = target
                .with_cryostat_annotation(AnnotationKey::Host, host)
                .with_cryostat_annotation(AnnotationKey::Port, port.to_string());
        }
        {
            let mut targets = self.lock();
            if targets.contains_key(&target.service_uri) {
                return Err(CryostatError::discovery(
                    REALM,
                    format!("duplicate connect URL {}", target.service_uri),
                )
                .into());
            }
            targets.insert(target.service_uri.clone(), target.clone());
        }
        info!(target = %target, "Custom target added");
        self.listeners
            .emit(&TargetDiscoveryEvent::new(EventKind::Found, target.clone()));
        Ok(target)
    }

    /// Removes a target by connect address and emits LOST
    pub fn remove_target(&self, service_uri: &str) -> Option<ServiceRef> {
        let removed = self.lock().remove(service_uri);
        if let Some(target) = &removed {
            info!(target = %target, "Custom target removed");
            self.listeners
                .emit(&TargetDiscoveryEvent::new(EventKind::Lost, target.clone()));
        }
        removed
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, ServiceRef>> {
        self.targets
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Default for CustomTargetPlatformClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl PlatformClient for CustomTargetPlatformClient {
    fn realm(&self) -> &str {
        REALM
    }

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    async fn list_discoverable_services(&self) -> Result<Vec<ServiceRef>> {
        Ok(self.lock().values().cloned().collect())
    }

    async fn discovery_tree(&self) -> Result<EnvironmentNode> {
        let mut realm = EnvironmentNode::realm(REALM);
        for target in self.lock().values() {
            realm.add_target(NodeType::Jvm, target.clone());
        }
        Ok(realm)
    }

    fn add_listener(&self, listener: DiscoveryListener) -> ListenerId {
        self.listeners.add(listener)
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }
}
