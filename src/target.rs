//! Discovered target identity
//!
//! A [`ServiceRef`] identifies one application instance found by a discovery
//! backend. Equality and hashing cover every attribute so that two snapshots
//! of a backend can be diffed by value.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

/// Well-known annotation keys attached by discovery backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnnotationKey {
    /// Backend realm the target was discovered through
    Realm,
    /// Host part of the connect address
    Host,
    /// Port part of the connect address
    Port,
    /// Main class or jar of the JVM
    JavaMain,
    /// Process id of the JVM
    Pid,
    /// JVM start time
    StartTime,
    /// Kubernetes namespace
    Namespace,
    /// Service name, when known
    ServiceName,
    /// Container name
    ContainerName,
    /// Kubernetes pod name
    PodName,
}

impl AnnotationKey {
    /// Name of the key as exposed to match expressions
    pub fn as_str(&self) -> &'static str {
        match self {
            AnnotationKey::Realm => "REALM",
            AnnotationKey::Host => "HOST",
            AnnotationKey::Port => "PORT",
            AnnotationKey::JavaMain => "JAVA_MAIN",
            AnnotationKey::Pid => "PID",
            AnnotationKey::StartTime => "START_TIME",
            AnnotationKey::Namespace => "NAMESPACE",
            AnnotationKey::ServiceName => "SERVICE_NAME",
            AnnotationKey::ContainerName => "CONTAINER_NAME",
            AnnotationKey::PodName => "POD_NAME",
        }
    }
}

impl fmt::Display for AnnotationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Annotation maps of a target
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Annotations {
    /// Platform-native annotations (e.g. pod annotations)
    #[serde(default)]
    pub platform: BTreeMap<String, String>,
    /// Annotations attached by the discovery backend itself
    #[serde(default)]
    pub cryostat: BTreeMap<AnnotationKey, String>,
}

/// Reference to one discovered target
///
/// # Examples
///
/// ```
/// use cryostat::target::{AnnotationKey, ServiceRef};
///
/// let target = ServiceRef::new("service:jmx:rmi:///jndi/rmi://app:9091/jmxrmi")
///     .with_alias("app")
///     .with_label("app", "inventory")
///     .with_cryostat_annotation(AnnotationKey::Realm, "Custom Targets");
/// assert_eq!(target.alias.as_deref(), Some("app"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRef {
    /// Stable JVM identity; empty until the first successful connection
    #[serde(default)]
    pub jvm_id: String,
    /// Connection address
    pub service_uri: String,
    /// Human label
    #[serde(default)]
    pub alias: Option<String>,
    /// Platform-native labels
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Platform and backend annotations
    #[serde(default)]
    pub annotations: Annotations,
}

impl ServiceRef {
    /// Creates a reference with only a connect address
    pub fn new(service_uri: impl Into<String>) -> Self {
        Self {
            jvm_id: String::new(),
            service_uri: service_uri.into(),
            alias: None,
            labels: BTreeMap::new(),
            annotations: Annotations::default(),
        }
    }

    /// Sets the alias
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Sets the JVM id
    pub fn with_jvm_id(mut self, jvm_id: impl Into<String>) -> Self {
        self.jvm_id = jvm_id.into();
        self
    }

    /// Adds one platform label
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Replaces all platform labels
    pub fn with_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.labels = labels;
        self
    }

    /// Replaces all platform annotations
    pub fn with_platform_annotations(mut self, annotations: BTreeMap<String, String>) -> Self {
        self.annotations.platform = annotations;
        self
    }

    /// Adds one backend annotation
    pub fn with_cryostat_annotation(mut self, key: AnnotationKey, value: impl Into<String>) -> Self {
        self.annotations.cryostat.insert(key, value.into());
        self
    }

    /// Looks up a backend annotation
    pub fn cryostat_annotation(&self, key: AnnotationKey) -> Option<&str> {
        self.annotations.cryostat.get(&key).map(String::as_str)
    }

    /// Alias if present, else the connect address
    pub fn display_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.service_uri)
    }
}

impl fmt::Display for ServiceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.alias {
            Some(alias) => write!(f, "{} ({})", alias, self.service_uri),
            None => f.write_str(&self.service_uri),
        }
    }
}

/// Builds a JMX-over-RMI service URL for a host and port
///
/// # Examples
///
/// ```
/// use cryostat::target::jmx_service_url;
///
/// assert_eq!(
///     jmx_service_url("10.0.0.5", 9091),
///     "service:jmx:rmi:///jndi/rmi://10.0.0.5:9091/jmxrmi"
/// );
/// ```
pub fn jmx_service_url(host: &str, port: u16) -> String {
    format!("service:jmx:rmi:///jndi/rmi://{}:{}/jmxrmi", host, port)
}

fn host_port_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^service:jmx:[a-z]+://([^/]*)(?:/jndi/[a-z]+://(\[[^\]]+\]|[^:/]+):(\d+))?").ok()
    })
    .as_ref()
}

/// Extracts host and port from a JMX service URL.
///
/// Both the `rmi:///jndi/rmi://host:port/...` form and the direct
/// `service:jmx:<proto>://host:port` form are understood.
pub fn parse_host_port(service_uri: &str) -> Option<(String, u16)> {
    let caps = host_port_regex()?.captures(service_uri)?;
    if let (Some(host), Some(port)) = (caps.get(2), caps.get(3)) {
        return Some((host.as_str().to_string(), port.as_str().parse().ok()?));
    }
    let authority = caps.get(1)?.as_str();
    let (host, port) = authority.rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port.parse().ok()?))
}
