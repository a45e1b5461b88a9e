//! Docker and Podman discovery
//!
//! Polls the engine's control-socket HTTP API on a fixed interval for
//! containers carrying the discovery opt-in label, and diffs successive
//! listings by value. Container label sets are immutable for a container's
//! lifetime, so only FOUND and LOST are emitted.

use super::{
    diff_by_value, AbstractNode, DiscoveryListener, EnvironmentNode, NodeType, PlatformClient,
    TargetDiscoveryEvent,
};
use crate::config::ContainerEngineConfig;
use crate::error::{CryostatError, Result};
use crate::events::{ListenerId, Listeners};
use crate::target::{jmx_service_url, parse_host_port, AnnotationKey, ServiceRef};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Label a container must carry (with value `true`) to be discovered
pub const DISCOVERY_LABEL: &str = "io.cryostat.discovery";
/// Label carrying a complete JMX service URL
pub const JMX_URL_LABEL: &str = "io.cryostat.jmxUrl";
/// Label carrying the JMX host
pub const JMX_HOST_LABEL: &str = "io.cryostat.jmxHost";
/// Label carrying the JMX port
pub const JMX_PORT_LABEL: &str = "io.cryostat.jmxPort";

const DEFAULT_JMX_PORT: u16 = 9091;
const PODMAN_API_PREFIX: &str = "/v4.0.0/libpod";

/// Which container engine a backend talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContainerEngineKind {
    /// Docker Engine API
    Docker,
    /// Podman libpod API
    Podman,
}

impl ContainerEngineKind {
    /// Realm name
    pub fn realm(&self) -> &'static str {
        match self {
            ContainerEngineKind::Docker => "Docker",
            ContainerEngineKind::Podman => "Podman",
        }
    }

    /// Default control socket location
    pub fn default_socket_path(&self) -> PathBuf {
        match self {
            ContainerEngineKind::Docker => PathBuf::from("/var/run/docker.sock"),
            ContainerEngineKind::Podman => match std::env::var("XDG_RUNTIME_DIR") {
                Ok(runtime_dir) => PathBuf::from(runtime_dir).join("podman/podman.sock"),
                Err(_) => PathBuf::from("/run/podman/podman.sock"),
            },
        }
    }

    fn api_prefix(&self) -> &'static str {
        match self {
            ContainerEngineKind::Docker => "",
            ContainerEngineKind::Podman => PODMAN_API_PREFIX,
        }
    }

    /// Path listing opted-in containers
    pub fn list_path(&self) -> String {
        let filter = format!(r#"{{"label":["{}=true"]}}"#, DISCOVERY_LABEL);
        let encoded: String = url::form_urlencoded::byte_serialize(filter.as_bytes()).collect();
        format!("{}/containers/json?filters={}", self.api_prefix(), encoded)
    }

    /// Path inspecting one container
    pub fn inspect_path(&self, id: &str) -> String {
        format!("{}/containers/{}/json", self.api_prefix(), id)
    }

    /// Path of the liveness endpoint
    pub fn ping_path(&self) -> String {
        format!("{}/_ping", self.api_prefix())
    }
}

/// One entry of a container listing
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerSummary {
    /// Container id
    pub id: String,
    /// Container names (Docker prefixes them with `/`)
    #[serde(default)]
    pub names: Vec<String>,
    /// Container labels
    #[serde(default)]
    pub labels: Option<BTreeMap<String, String>>,
    /// Podman pod id, empty when not in a pod
    #[serde(default)]
    pub pod: String,
    /// Podman pod name, empty when not in a pod
    #[serde(default)]
    pub pod_name: String,
}

impl ContainerSummary {
    /// First name without Docker's leading slash
    pub fn name(&self) -> String {
        self.names
            .first()
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_else(|| self.id.chars().take(12).collect())
    }

    fn labels(&self) -> BTreeMap<String, String> {
        self.labels.clone().unwrap_or_default()
    }

    fn opted_in(&self) -> bool {
        self.labels
            .as_ref()
            .and_then(|l| l.get(DISCOVERY_LABEL))
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerInspect {
    #[serde(default)]
    config: Option<ContainerInspectConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerInspectConfig {
    #[serde(default)]
    hostname: Option<String>,
}

/// Engine control API
#[async_trait::async_trait]
pub trait ContainerApi: Send + Sync {
    /// Whether the engine answers at all
    async fn ping(&self) -> bool;

    /// Lists opted-in containers
    async fn list_containers(&self) -> Result<Vec<ContainerSummary>>;

    /// Resolves a container's hostname via an inspect call
    async fn inspect_hostname(&self, id: &str) -> Result<Option<String>>;
}

/// [`ContainerApi`] speaking HTTP/1.0 over the engine's Unix socket
pub struct SocketContainerApi {
    kind: ContainerEngineKind,
    socket_path: PathBuf,
    timeout: Duration,
}

impl SocketContainerApi {
    /// Creates a client for the given engine socket
    pub fn new(kind: ContainerEngineKind, socket_path: PathBuf, timeout: Duration) -> Self {
        Self {
            kind,
            socket_path,
            timeout,
        }
    }

    /// Sends a GET request, bounded by the configured timeout
    async fn get(&self, path: &str) -> Result<String> {
        let realm = self.kind.realm();
        let response = tokio::time::timeout(self.timeout, async {
            let stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
                CryostatError::discovery(
                    realm,
                    format!("failed to connect to {}: {}", self.socket_path.display(), e),
                )
            })?;

            let request = format!(
                "GET {} HTTP/1.0\r\nHost: localhost\r\nAccept: application/json\r\n\r\n",
                path
            );
            let (mut reader, mut writer) = stream.into_split();
            writer.write_all(request.as_bytes()).await?;
            writer.shutdown().await?;

            let mut response = Vec::new();
            reader.read_to_end(&mut response).await?;
            Ok::<_, anyhow::Error>(response)
        })
        .await
        .map_err(|_| CryostatError::discovery(realm, format!("request {} timed out", path)))??;

        parse_http_response(realm, &response)
    }
}

/// Splits a raw HTTP/1.x response and returns the body of a 2xx answer
pub fn parse_http_response(realm: &str, response: &[u8]) -> Result<String> {
    let text = String::from_utf8_lossy(response);
    let (head, body) = text
        .split_once("\r\n\r\n")
        .ok_or_else(|| CryostatError::discovery(realm, "invalid HTTP response"))?;
    let status: u16 = head
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| CryostatError::discovery(realm, "missing HTTP status"))?;
    if !(200..300).contains(&status) {
        return Err(CryostatError::discovery(realm, format!("HTTP status {}", status)).into());
    }
    Ok(body.to_string())
}

#[async_trait::async_trait]
impl ContainerApi for SocketContainerApi {
    async fn ping(&self) -> bool {
        self.get(&self.kind.ping_path()).await.is_ok()
    }

    async fn list_containers(&self) -> Result<Vec<ContainerSummary>> {
        let body = self.get(&self.kind.list_path()).await?;
        Ok(serde_json::from_str(&body)?)
    }

    async fn inspect_hostname(&self, id: &str) -> Result<Option<String>> {
        let body = self.get(&self.kind.inspect_path(id)).await?;
        let inspect: ContainerInspect = serde_json::from_str(&body)?;
        Ok(inspect
            .config
            .and_then(|c| c.hostname)
            .filter(|h| !h.is_empty()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct DiscoveredContainer {
    target: ServiceRef,
    pod_name: Option<String>,
}

#[derive(Default)]
struct ContainerState {
    containers: Mutex<Vec<DiscoveredContainer>>,
    listeners: Listeners<TargetDiscoveryEvent>,
}

/// Discovery backend for one container engine
pub struct ContainerPlatformClient {
    kind: ContainerEngineKind,
    config: ContainerEngineConfig,
    api: Arc<dyn ContainerApi>,
    state: Arc<ContainerState>,
    running: tokio::sync::Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl ContainerPlatformClient {
    /// Creates a backend over an arbitrary engine API
    pub fn new(kind: ContainerEngineKind, config: ContainerEngineConfig, api: Arc<dyn ContainerApi>) -> Self {
        Self {
            kind,
            config,
            api,
            state: Arc::new(ContainerState::default()),
            running: tokio::sync::Mutex::new(None),
        }
    }

    /// Creates a backend talking to the engine's Unix socket
    pub fn over_socket(kind: ContainerEngineKind, config: ContainerEngineConfig) -> Self {
        let socket_path = config
            .socket_path
            .clone()
            .unwrap_or_else(|| kind.default_socket_path());
        let api = SocketContainerApi::new(kind, socket_path, config.request_timeout());
        Self::new(kind, config, Arc::new(api))
    }

    /// Runs one poll: lists containers, diffs against the previous listing
    /// and emits the differences. A failed listing keeps the previous state.
    pub async fn poll(&self) {
        poll_once(self.kind, self.api.as_ref(), &self.state).await;
    }
}

async fn poll_once(kind: ContainerEngineKind, api: &dyn ContainerApi, state: &ContainerState) {
    let listing = match api.list_containers().await {
        Ok(listing) => listing,
        Err(e) => {
            warn!(realm = kind.realm(), error = %e, "Container listing failed, will retry next poll");
            return;
        }
    };

    let mut current = Vec::new();
    for summary in listing.iter().filter(|c| c.opted_in()) {
        match resolve_container(kind, api, summary).await {
            Some(container) => current.push(container),
            None => warn!(
                realm = kind.realm(),
                container = %summary.name(),
                "Could not resolve JMX address for container, will retry next poll"
            ),
        }
    }

    let events = {
        let mut containers = state.containers.lock().unwrap_or_else(PoisonError::into_inner);
        let previous: Vec<ServiceRef> = containers.iter().map(|c| c.target.clone()).collect();
        let next: Vec<ServiceRef> = current.iter().map(|c| c.target.clone()).collect();
        *containers = current;
        diff_by_value(&previous, &next)
    };
    for event in &events {
        debug!(realm = kind.realm(), kind = %event.kind, target = %event.service_ref, "Container event");
        state.listeners.emit(event);
    }
}

async fn resolve_container(
    kind: ContainerEngineKind,
    api: &dyn ContainerApi,
    summary: &ContainerSummary,
) -> Option<DiscoveredContainer> {
    let labels = summary.labels();
    let name = summary.name();

    let (uri, host, port) = if let Some(url) = labels.get(JMX_URL_LABEL) {
        let (host, port) = parse_host_port(url)?;
        (url.clone(), host, port)
    } else {
        let port = match labels.get(JMX_PORT_LABEL) {
            Some(p) => p.parse().ok()?,
            None => DEFAULT_JMX_PORT,
        };
        let host = match labels.get(JMX_HOST_LABEL) {
            Some(h) => h.clone(),
            None => match api.inspect_hostname(&summary.id).await {
                Ok(Some(hostname)) => hostname,
                Ok(None) => return None,
                Err(e) => {
                    debug!(container = %name, error = %e, "Container inspect failed");
                    return None;
                }
            },
        };
        (jmx_service_url(&host, port), host, port)
    };

    let pod_name = Some(summary.pod_name.clone()).filter(|p| !p.is_empty());
    let mut target = ServiceRef::new(uri)
        .with_alias(name.clone())
        .with_labels(labels)
        .with_cryostat_annotation(AnnotationKey::Realm, kind.realm())
        .with_cryostat_annotation(AnnotationKey::Host, host)
        .with_cryostat_annotation(AnnotationKey::Port, port.to_string())
        .with_cryostat_annotation(AnnotationKey::ContainerName, name);
    if let Some(pod) = &pod_name {
        target = target.with_cryostat_annotation(AnnotationKey::PodName, pod.clone());
    }
    Some(DiscoveredContainer { target, pod_name })
}

#[async_trait::async_trait]
impl PlatformClient for ContainerPlatformClient {
    fn realm(&self) -> &str {
        self.kind.realm()
    }

    async fn is_available(&self) -> bool {
        self.api.ping().await
    }

    async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }
        if !self.api.ping().await {
            return Err(CryostatError::Startup(format!(
                "{} control socket is not reachable",
                self.kind.realm()
            ))
            .into());
        }

        let token = CancellationToken::new();
        let kind = self.kind;
        let api = self.api.clone();
        let state = self.state.clone();
        let period = self.config.poll_interval();
        let cancel = token.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => poll_once(kind, api.as_ref(), &state).await,
                }
            }
        });
        info!(realm = kind.realm(), interval_secs = period.as_secs(), "Container discovery started");
        *running = Some((token, handle));
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if let Some((token, _handle)) = self.running.lock().await.take() {
            token.cancel();
            info!(realm = self.kind.realm(), "Container discovery stopped");
        }
        Ok(())
    }

    async fn list_discoverable_services(&self) -> Result<Vec<ServiceRef>> {
        Ok(self
            .state
            .containers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|c| c.target.clone())
            .collect())
    }

    async fn discovery_tree(&self) -> Result<EnvironmentNode> {
        let containers = self
            .state
            .containers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut realm = EnvironmentNode::realm(self.kind.realm());
        let mut pods: BTreeMap<String, EnvironmentNode> = BTreeMap::new();
        for container in containers {
            match container.pod_name {
                Some(pod) => pods
                    .entry(pod.clone())
                    .or_insert_with(|| EnvironmentNode::new(pod, NodeType::Pod))
                    .add_target(NodeType::Container, container.target),
                None => realm.add_target(NodeType::Container, container.target),
            }
        }
        for pod in pods.into_values() {
            realm.add_child(AbstractNode::Environment(pod));
        }
        realm.sort_recursive();
        Ok(realm)
    }

    fn add_listener(&self, listener: DiscoveryListener) -> ListenerId {
        self.state.listeners.add(listener)
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.state.listeners.remove(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::EventKind;

    #[derive(Default)]
    struct FakeContainerApi {
        listing: Mutex<Option<Vec<ContainerSummary>>>,
        hostnames: Mutex<BTreeMap<String, String>>,
    }

    impl FakeContainerApi {
        fn set_listing(&self, listing: Option<Vec<ContainerSummary>>) {
            *self.listing.lock().unwrap() = listing;
        }
    }

    #[async_trait::async_trait]
    impl ContainerApi for FakeContainerApi {
        async fn ping(&self) -> bool {
            true
        }

        async fn list_containers(&self) -> Result<Vec<ContainerSummary>> {
            self.listing
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| CryostatError::discovery("Docker", "socket closed").into())
        }

        async fn inspect_hostname(&self, id: &str) -> Result<Option<String>> {
            Ok(self.hostnames.lock().unwrap().get(id).cloned())
        }
    }

    fn container(id: &str, labels: &[(&str, &str)]) -> ContainerSummary {
        let mut all: BTreeMap<String, String> =
            labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        all.insert(DISCOVERY_LABEL.to_string(), "true".to_string());
        ContainerSummary {
            id: id.to_string(),
            names: vec![format!("/{}", id)],
            labels: Some(all),
            ..Default::default()
        }
    }

    fn client(api: Arc<FakeContainerApi>) -> (ContainerPlatformClient, Arc<Mutex<Vec<TargetDiscoveryEvent>>>) {
        let client = ContainerPlatformClient::new(
            ContainerEngineKind::Docker,
            ContainerEngineConfig::default(),
            api,
        );
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        client.add_listener(Arc::new(move |e: &TargetDiscoveryEvent| {
            sink.lock().unwrap().push(e.clone())
        }));
        (client, seen)
    }

    #[test]
    fn test_list_path_filters_on_discovery_label() {
        let path = ContainerEngineKind::Podman.list_path();
        assert!(path.starts_with("/v4.0.0/libpod/containers/json?filters="));
        assert!(path.contains("io.cryostat.discovery"));
        assert!(!path.contains('"'));
    }

    #[test]
    fn test_parse_http_response() {
        let ok = b"HTTP/1.0 200 OK\r\nContent-Type: application/json\r\n\r\n[]";
        assert_eq!(parse_http_response("Docker", ok).unwrap(), "[]");
        let err = b"HTTP/1.0 500 Internal Server Error\r\n\r\n{}";
        assert!(parse_http_response("Docker", err).is_err());
        assert!(parse_http_response("Docker", b"garbage").is_err());
    }

    #[tokio::test]
    async fn test_poll_emits_found_and_lost() {
        let api = Arc::new(FakeContainerApi::default());
        let (client, seen) = client(api.clone());

        api.set_listing(Some(vec![
            container("a", &[(JMX_HOST_LABEL, "a-host")]),
            container("b", &[(JMX_URL_LABEL, "service:jmx:rmi:///jndi/rmi://b:9999/jmxrmi")]),
        ]));
        client.poll().await;
        api.set_listing(Some(vec![
            container("a", &[(JMX_HOST_LABEL, "a-host")]),
            container("c", &[(JMX_HOST_LABEL, "c-host"), (JMX_PORT_LABEL, "9000")]),
        ]));
        client.poll().await;

        let events = seen.lock().unwrap().clone();
        let summary: Vec<(EventKind, String)> = events
            .iter()
            .map(|e| (e.kind, e.service_ref.alias.clone().unwrap()))
            .collect();
        assert_eq!(
            summary,
            vec![
                (EventKind::Found, "a".to_string()),
                (EventKind::Found, "b".to_string()),
                (EventKind::Lost, "b".to_string()),
                (EventKind::Found, "c".to_string()),
            ]
        );
        let services = client.list_discoverable_services().await.unwrap();
        assert_eq!(services.len(), 2);
        assert!(services
            .iter()
            .any(|s| s.service_uri == "service:jmx:rmi:///jndi/rmi://c-host:9000/jmxrmi"));
    }

    #[tokio::test]
    async fn test_failed_listing_keeps_state() {
        let api = Arc::new(FakeContainerApi::default());
        let (client, seen) = client(api.clone());
        api.set_listing(Some(vec![container("a", &[(JMX_HOST_LABEL, "h")])]));
        client.poll().await;
        api.set_listing(None);
        client.poll().await;
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(client.list_discoverable_services().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unresolvable_container_is_retried() {
        let api = Arc::new(FakeContainerApi::default());
        let (client, seen) = client(api.clone());
        api.set_listing(Some(vec![container("a", &[])]));
        client.poll().await;
        assert!(seen.lock().unwrap().is_empty());

        api.hostnames.lock().unwrap().insert("a".to_string(), "a-host".to_string());
        client.poll().await;
        let events = seen.lock().unwrap().clone();
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].service_ref.service_uri,
            "service:jmx:rmi:///jndi/rmi://a-host:9091/jmxrmi"
        );
    }

    #[tokio::test]
    async fn test_unlabelled_containers_are_ignored() {
        let api = Arc::new(FakeContainerApi::default());
        let (client, _) = client(api.clone());
        let mut plain = container("x", &[(JMX_HOST_LABEL, "h")]);
        plain.labels.as_mut().unwrap().remove(DISCOVERY_LABEL);
        api.set_listing(Some(vec![plain]));
        client.poll().await;
        assert!(client.list_discoverable_services().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_tree_groups_pod_members() {
        let api = Arc::new(FakeContainerApi::default());
        let (client, _) = client(api.clone());
        let mut in_pod = container("a", &[(JMX_HOST_LABEL, "h")]);
        in_pod.pod_name = "pod-1".to_string();
        api.set_listing(Some(vec![in_pod, container("b", &[(JMX_HOST_LABEL, "h2")])]));
        client.poll().await;

        let tree = client.discovery_tree().await.unwrap();
        assert_eq!(tree.name, "Docker");
        let pod = tree.find(NodeType::Pod, "pod-1").unwrap();
        assert_eq!(pod.targets().len(), 1);
        assert_eq!(tree.targets().len(), 2);
    }
}
