//! Minimal Kubernetes REST API surface
//!
//! Only the pieces discovery needs: listing and watching Endpoints, and
//! fetching object metadata to walk owner references.

use crate::config::KubernetesConfig;
use crate::error::{CryostatError, Result};
use bytes::{Bytes, BytesMut};
use futures::stream::{BoxStream, StreamExt};
use futures::Stream;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::REALM;

/// Server-side timeout requested for one watch call
const WATCH_TIMEOUT_SECS: u64 = 300;

/// Object metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// Object name
    #[serde(default)]
    pub name: String,
    /// Namespace
    #[serde(default)]
    pub namespace: Option<String>,
    /// Unique id
    #[serde(default)]
    pub uid: Option<String>,
    /// Resource version
    #[serde(default)]
    pub resource_version: Option<String>,
    /// Labels
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Annotations
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// Owner references
    #[serde(default)]
    pub owner_references: Vec<OwnerReference>,
}

/// Reference from an object to its owner
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    /// Owner API version
    #[serde(default)]
    pub api_version: String,
    /// Owner kind
    pub kind: String,
    /// Owner name
    pub name: String,
    /// Owner uid
    #[serde(default)]
    pub uid: Option<String>,
    /// Whether the owner is the managing controller
    #[serde(default)]
    pub controller: Option<bool>,
}

/// Reference from an endpoint address to the object backing it
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectReference {
    /// Referenced kind
    #[serde(default)]
    pub kind: Option<String>,
    /// Referenced namespace
    #[serde(default)]
    pub namespace: Option<String>,
    /// Referenced name
    #[serde(default)]
    pub name: Option<String>,
    /// Referenced uid
    #[serde(default)]
    pub uid: Option<String>,
}

/// One ready address of an Endpoints subset
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointAddress {
    /// Address IP
    pub ip: String,
    /// Hostname, when set
    #[serde(default)]
    pub hostname: Option<String>,
    /// Node hosting the address
    #[serde(default)]
    pub node_name: Option<String>,
    /// Backing object
    #[serde(default)]
    pub target_ref: Option<ObjectReference>,
}

/// One port of an Endpoints subset
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointPort {
    /// Port name
    #[serde(default)]
    pub name: Option<String>,
    /// Port number
    pub port: u16,
    /// Protocol
    #[serde(default)]
    pub protocol: Option<String>,
}

/// A set of addresses sharing a set of ports
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointSubset {
    /// Ready addresses
    #[serde(default)]
    pub addresses: Vec<EndpointAddress>,
    /// Ports
    #[serde(default)]
    pub ports: Vec<EndpointPort>,
}

/// Endpoints resource
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoints {
    /// Metadata
    #[serde(default)]
    pub metadata: ObjectMeta,
    /// Subsets
    #[serde(default)]
    pub subsets: Vec<EndpointSubset>,
}

/// List metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListMeta {
    /// Resource version of the list
    #[serde(default)]
    pub resource_version: Option<String>,
}

/// Endpoints list response
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct EndpointsList {
    /// List metadata
    #[serde(default)]
    pub metadata: ListMeta,
    /// Items
    #[serde(default)]
    pub items: Vec<Endpoints>,
}

/// Any object; only metadata is kept
#[derive(Debug, Clone, Default, Deserialize)]
struct AnyObject {
    #[serde(default)]
    metadata: ObjectMeta,
}

/// One event of a watch stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// Object created
    Added(Endpoints),
    /// Object changed
    Modified(Endpoints),
    /// Object deleted
    Deleted(Endpoints),
    /// Progress marker carrying a resource version
    Bookmark(String),
    /// The server ended the watch with an error status (e.g. 410 Gone)
    Error(String),
}

#[derive(Debug, Deserialize)]
struct RawWatchEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    object: serde_json::Value,
}

/// Parses one newline-delimited watch event
pub fn parse_watch_line(line: &[u8]) -> Result<WatchEvent> {
    let raw: RawWatchEvent = serde_json::from_slice(line)?;
    let event = match raw.event_type.as_str() {
        "ADDED" => WatchEvent::Added(serde_json::from_value(raw.object)?),
        "MODIFIED" => WatchEvent::Modified(serde_json::from_value(raw.object)?),
        "DELETED" => WatchEvent::Deleted(serde_json::from_value(raw.object)?),
        "BOOKMARK" => {
            let object: AnyObject = serde_json::from_value(raw.object)?;
            WatchEvent::Bookmark(object.metadata.resource_version.unwrap_or_default())
        }
        "ERROR" => WatchEvent::Error(
            raw.object
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("watch error")
                .to_string(),
        ),
        other => {
            return Err(CryostatError::discovery(REALM, format!("unknown watch event type {}", other)).into())
        }
    };
    Ok(event)
}

/// Splits a chunked response body into watch events, one per line
pub fn watch_event_stream<S, E>(body: S) -> BoxStream<'static, Result<WatchEvent>>
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
    E: Into<anyhow::Error> + Send + 'static,
{
    let body = Box::pin(body);
    futures::stream::unfold((body, BytesMut::new(), false), |(mut body, mut buf, mut done)| async move {
        loop {
            if let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                let line = buf.split_to(pos + 1);
                let line = &line[..pos];
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                return Some((parse_watch_line(line), (body, buf, done)));
            }
            if done {
                if buf.iter().all(u8::is_ascii_whitespace) {
                    return None;
                }
                let rest = buf.split();
                return Some((parse_watch_line(&rest), (body, buf, true)));
            }
            match body.next().await {
                Some(Ok(chunk)) => buf.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    buf.clear();
                    return Some((Err(e.into()), (body, buf, true)));
                }
                None => done = true,
            }
        }
    })
    .boxed()
}

/// Kubernetes API operations used by discovery
#[async_trait::async_trait]
pub trait KubeApi: Send + Sync {
    /// Whether the API server answers
    async fn ping(&self) -> bool;

    /// Lists Endpoints in a namespace
    async fn list_endpoints(&self, namespace: &str) -> Result<EndpointsList>;

    /// Watches Endpoints in a namespace from a resource version
    async fn watch_endpoints(
        &self,
        namespace: &str,
        resource_version: &str,
    ) -> Result<BoxStream<'static, Result<WatchEvent>>>;

    /// Fetches metadata of one object; `None` when it does not exist
    async fn get_object(&self, namespace: &str, kind: &str, name: &str) -> Result<Option<ObjectMeta>>;
}

/// REST path segment for an object kind, if the kind is supported
pub fn object_path(namespace: &str, kind: &str, name: &str) -> Option<String> {
    let (group, plural) = match kind {
        "Pod" => ("api/v1", "pods"),
        "ReplicationController" => ("api/v1", "replicationcontrollers"),
        "Endpoints" => ("api/v1", "endpoints"),
        "ReplicaSet" => ("apis/apps/v1", "replicasets"),
        "Deployment" => ("apis/apps/v1", "deployments"),
        "StatefulSet" => ("apis/apps/v1", "statefulsets"),
        "DaemonSet" => ("apis/apps/v1", "daemonsets"),
        "DeploymentConfig" => ("apis/apps.openshift.io/v1", "deploymentconfigs"),
        _ => return None,
    };
    Some(format!("/{}/namespaces/{}/{}/{}", group, namespace, plural, name))
}

/// [`KubeApi`] over the cluster REST API using a bearer token
pub struct HttpKubeApi {
    client: Client,
    base: Url,
    token: Option<String>,
    timeout: Duration,
}

impl HttpKubeApi {
    /// Creates a client for the given API server
    ///
    /// # Errors
    ///
    /// Returns an error when the base URL or the CA bundle is invalid.
    pub fn new(base: &str, token: Option<String>, ca_pem: Option<&[u8]>, timeout: Duration) -> Result<Self> {
        let base = Url::parse(base)
            .map_err(|e| CryostatError::Config(format!("invalid Kubernetes API URL {}: {}", base, e)))?;
        let mut builder = Client::builder();
        if let Some(pem) = ca_pem {
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(pem)?);
        }
        Ok(Self {
            client: builder.build()?,
            base,
            token,
            timeout,
        })
    }

    /// Creates a client from in-cluster service account files
    ///
    /// # Errors
    ///
    /// Returns `CryostatError::Startup` when not running inside a cluster.
    pub fn in_cluster(config: &KubernetesConfig) -> Result<Self> {
        let base = match &config.api_server {
            Some(url) => url.clone(),
            None => {
                let host = std::env::var("KUBERNETES_SERVICE_HOST").map_err(|_| {
                    CryostatError::Startup("KUBERNETES_SERVICE_HOST is not set".to_string())
                })?;
                let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string());
                if host.contains(':') {
                    format!("https://[{}]:{}", host, port)
                } else {
                    format!("https://{}:{}", host, port)
                }
            }
        };
        let token = std::fs::read_to_string(&config.token_path)
            .map(|t| t.trim().to_string())
            .map_err(|e| {
                CryostatError::Startup(format!(
                    "cannot read service account token {}: {}",
                    config.token_path.display(),
                    e
                ))
            })?;
        let ca = std::fs::read(&config.ca_path).ok();
        Self::new(&base, Some(token), ca.as_deref(), config.request_timeout())
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .map_err(|e| CryostatError::discovery(REALM, format!("bad path {}: {}", path, e)).into())
    }

    fn request(&self, url: Url) -> reqwest::RequestBuilder {
        let builder = self.client.get(url);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(CryostatError::discovery(REALM, format!("API returned {}: {}", status, body)).into())
    }
}

#[async_trait::async_trait]
impl KubeApi for HttpKubeApi {
    async fn ping(&self) -> bool {
        let Ok(url) = self.url("/version") else {
            return false;
        };
        match self.request(url).timeout(self.timeout).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(error = %e, "Kubernetes API ping failed");
                false
            }
        }
    }

    async fn list_endpoints(&self, namespace: &str) -> Result<EndpointsList> {
        let url = self.url(&format!("/api/v1/namespaces/{}/endpoints", namespace))?;
        let response = self.request(url).timeout(self.timeout).send().await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn watch_endpoints(
        &self,
        namespace: &str,
        resource_version: &str,
    ) -> Result<BoxStream<'static, Result<WatchEvent>>> {
        let mut url = self.url(&format!("/api/v1/namespaces/{}/endpoints", namespace))?;
        url.query_pairs_mut()
            .append_pair("watch", "true")
            .append_pair("allowWatchBookmarks", "true")
            .append_pair("resourceVersion", resource_version)
            .append_pair("timeoutSeconds", &WATCH_TIMEOUT_SECS.to_string());
        let response = self.request(url).send().await?;
        let response = Self::check(response).await?;
        Ok(watch_event_stream(response.bytes_stream()))
    }

    async fn get_object(&self, namespace: &str, kind: &str, name: &str) -> Result<Option<ObjectMeta>> {
        let path = object_path(namespace, kind, name)
            .ok_or_else(|| CryostatError::discovery(REALM, format!("unsupported kind {}", kind)))?;
        let response = self.request(self.url(&path)?).timeout(self.timeout).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let object: AnyObject = Self::check(response).await?.json().await?;
        Ok(Some(object.metadata))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_paths() {
        assert_eq!(
            object_path("ns", "Pod", "p").as_deref(),
            Some("/api/v1/namespaces/ns/pods/p")
        );
        assert_eq!(
            object_path("ns", "DeploymentConfig", "dc").as_deref(),
            Some("/apis/apps.openshift.io/v1/namespaces/ns/deploymentconfigs/dc")
        );
        assert!(object_path("ns", "CronJob", "c").is_none());
    }

    #[test]
    fn test_parse_watch_lines() {
        let added = br#"{"type":"ADDED","object":{"metadata":{"name":"svc","resourceVersion":"7"},"subsets":[]}}"#;
        match parse_watch_line(added).unwrap() {
            WatchEvent::Added(ep) => assert_eq!(ep.metadata.name, "svc"),
            other => panic!("unexpected {:?}", other),
        }
        let bookmark = br#"{"type":"BOOKMARK","object":{"metadata":{"resourceVersion":"12"}}}"#;
        assert_eq!(parse_watch_line(bookmark).unwrap(), WatchEvent::Bookmark("12".to_string()));
        let error = br#"{"type":"ERROR","object":{"code":410,"message":"too old resource version"}}"#;
        assert_eq!(
            parse_watch_line(error).unwrap(),
            WatchEvent::Error("too old resource version".to_string())
        );
        assert!(parse_watch_line(br#"{"type":"WHAT","object":{}}"#).is_err());
    }

    #[tokio::test]
    async fn test_watch_stream_reassembles_split_chunks() {
        let chunks: Vec<std::result::Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from_static(br#"{"type":"ADDED","object":{"metadata":{"name":"a"}}}"#)),
            Ok(Bytes::from_static(b"\n{\"type\":\"DELETED\",")),
            Ok(Bytes::from_static(br#""object":{"metadata":{"name":"a"}}}"#)),
            Ok(Bytes::from_static(b"\n\n")),
        ];
        let events: Vec<WatchEvent> = watch_event_stream(futures::stream::iter(chunks))
            .map(|e| e.unwrap())
            .collect()
            .await;
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], WatchEvent::Added(_)));
        assert!(matches!(events[1], WatchEvent::Deleted(_)));
    }

    #[tokio::test]
    async fn test_watch_stream_handles_unterminated_last_line() {
        let chunks: Vec<std::result::Result<Bytes, std::io::Error>> = vec![Ok(Bytes::from_static(
            br#"{"type":"BOOKMARK","object":{"metadata":{"resourceVersion":"3"}}}"#,
        ))];
        let events: Vec<Result<WatchEvent>> = watch_event_stream(futures::stream::iter(chunks)).collect().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].as_ref().unwrap(), &WatchEvent::Bookmark("3".to_string()));
    }
}
