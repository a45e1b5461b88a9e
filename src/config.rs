//! Configuration management for Cryostat
//!
//! This module handles loading, parsing, validating, and managing
//! configuration from files, environment variables, and CLI overrides.

use crate::error::{CryostatError, Result};
use crate::target::{AnnotationKey, ServiceRef};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure for Cryostat
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Discovery backend configuration
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    /// Rule engine configuration
    #[serde(default)]
    pub rules: RulesConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Upper bound for one backend's snapshot call (milliseconds)
    #[serde(default = "default_request_timeout_ms")]
    pub list_timeout_ms: u64,

    /// Java Discovery Protocol settings
    #[serde(default)]
    pub jdp: JdpConfig,

    /// Kubernetes API settings
    #[serde(default)]
    pub kubernetes: KubernetesConfig,

    /// Docker engine settings
    #[serde(default)]
    pub docker: ContainerEngineConfig,

    /// Podman engine settings
    #[serde(default)]
    pub podman: ContainerEngineConfig,

    /// Static target list
    #[serde(default)]
    pub custom: CustomTargetsConfig,
}

impl DiscoveryConfig {
    /// Snapshot timeout as a duration
    pub fn list_timeout(&self) -> Duration {
        Duration::from_millis(self.list_timeout_ms)
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            list_timeout_ms: default_request_timeout_ms(),
            jdp: JdpConfig::default(),
            kubernetes: KubernetesConfig::default(),
            docker: ContainerEngineConfig::default(),
            podman: ContainerEngineConfig::default(),
            custom: CustomTargetsConfig::default(),
        }
    }
}

/// Java Discovery Protocol listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JdpConfig {
    /// Enable JDP discovery
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Multicast group to join
    #[serde(default = "default_jdp_address")]
    pub multicast_address: String,

    /// Multicast port
    #[serde(default = "default_jdp_port")]
    pub port: u16,

    /// Number of missed broadcast intervals after which a JVM is lost
    #[serde(default = "default_missed_broadcasts")]
    pub lost_after_missed_broadcasts: u32,
}

fn default_jdp_address() -> String {
    "224.0.23.178".to_string()
}

fn default_jdp_port() -> u16 {
    7095
}

fn default_missed_broadcasts() -> u32 {
    3
}

impl Default for JdpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            multicast_address: default_jdp_address(),
            port: default_jdp_port(),
            lost_after_missed_broadcasts: default_missed_broadcasts(),
        }
    }
}

/// Kubernetes API discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KubernetesConfig {
    /// Enable Kubernetes discovery
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// API server base URL. Derived from `KUBERNETES_SERVICE_HOST` and
    /// `KUBERNETES_SERVICE_PORT` when unset.
    #[serde(default)]
    pub api_server: Option<String>,

    /// Namespaces to watch. The service account's own namespace when empty.
    #[serde(default)]
    pub namespaces: Vec<String>,

    /// Endpoint port names that mark a JMX port
    #[serde(default = "default_port_names")]
    pub port_names: Vec<String>,

    /// Endpoint port numbers that mark a JMX port
    #[serde(default = "default_port_numbers")]
    pub port_numbers: Vec<u16>,

    /// Service account token file
    #[serde(default = "default_token_path")]
    pub token_path: PathBuf,

    /// Cluster CA bundle
    #[serde(default = "default_ca_path")]
    pub ca_path: PathBuf,

    /// Service account namespace file
    #[serde(default = "default_namespace_path")]
    pub namespace_path: PathBuf,

    /// Timeout for single API requests (milliseconds)
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

fn default_port_names() -> Vec<String> {
    vec!["jfr-jmx".to_string()]
}

fn default_port_numbers() -> Vec<u16> {
    vec![9091]
}

fn default_token_path() -> PathBuf {
    Path::new(SERVICE_ACCOUNT_DIR).join("token")
}

fn default_ca_path() -> PathBuf {
    Path::new(SERVICE_ACCOUNT_DIR).join("ca.crt")
}

fn default_namespace_path() -> PathBuf {
    Path::new(SERVICE_ACCOUNT_DIR).join("namespace")
}

impl KubernetesConfig {
    /// Request timeout as a duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_server: None,
            namespaces: Vec::new(),
            port_names: default_port_names(),
            port_numbers: default_port_numbers(),
            token_path: default_token_path(),
            ca_path: default_ca_path(),
            namespace_path: default_namespace_path(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

/// Container engine (Docker or Podman) discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerEngineConfig {
    /// Enable this engine
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Control socket path. Engine default when unset.
    #[serde(default)]
    pub socket_path: Option<PathBuf>,

    /// Poll interval in seconds
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Timeout for one control-socket request (milliseconds)
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_poll_interval_secs() -> u64 {
    10
}

impl ContainerEngineConfig {
    /// Poll interval as a duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Request timeout as a duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for ContainerEngineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            socket_path: None,
            poll_interval_secs: default_poll_interval_secs(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

/// Static target list configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomTargetsConfig {
    /// Enable the custom target list
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Targets registered at startup
    #[serde(default)]
    pub targets: Vec<CustomTargetEntry>,
}

impl Default for CustomTargetsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            targets: Vec::new(),
        }
    }
}

/// One statically configured target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomTargetEntry {
    /// Connect URL
    pub connect_url: String,
    /// Optional alias
    #[serde(default)]
    pub alias: Option<String>,
    /// Labels
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Platform annotations
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl CustomTargetEntry {
    /// Converts the entry into a target reference
    pub fn to_service_ref(&self) -> ServiceRef {
        let mut target = ServiceRef::new(&self.connect_url)
            .with_labels(self.labels.clone())
            .with_platform_annotations(self.annotations.clone());
        target.alias = self.alias.clone();
        target.with_cryostat_annotation(AnnotationKey::Realm, crate::discovery::custom::REALM)
    }
}

/// Rule engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RulesConfig {
    /// Directory holding persisted rules. Platform data dir when unset.
    #[serde(default)]
    pub storage_dir: Option<PathBuf>,

    /// Bound of the activation worker pool
    #[serde(default = "default_max_concurrent_activations")]
    pub max_concurrent_activations: usize,

    /// Capacity of the match expression result cache
    #[serde(default = "default_cache_capacity")]
    pub expression_cache_capacity: usize,
}

fn default_max_concurrent_activations() -> usize {
    4
}

fn default_cache_capacity() -> usize {
    1024
}

impl RulesConfig {
    /// Resolves the rule storage directory
    ///
    /// # Errors
    ///
    /// Returns `CryostatError::Config` when no directory is configured and
    /// the platform data directory cannot be determined.
    pub fn storage_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.storage_dir {
            return Ok(dir.clone());
        }
        let dirs = directories::ProjectDirs::from("io", "cryostat", "cryostat").ok_or_else(|| {
            CryostatError::Config("Could not determine data directory".to_string())
        })?;
        Ok(dirs.data_dir().join("rules"))
    }
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            storage_dir: None,
            max_concurrent_activations: default_max_concurrent_activations(),
            expression_cache_capacity: default_cache_capacity(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Enable JSON-formatted logs
    #[serde(default)]
    pub json_format: bool,

    /// Log file path (if None, stderr only)
    #[serde(default)]
    pub file_path: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
            file_path: None,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_request_timeout_ms() -> u64 {
    2000
}

impl Config {
    /// Load configuration from file with environment and CLI overrides
    ///
    /// # Arguments
    ///
    /// * `path` - Path to configuration file
    /// * `cli` - CLI arguments for overrides
    ///
    /// # Returns
    ///
    /// Returns the loaded and merged configuration
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read or parsed
    pub fn load(path: &str, cli: &crate::cli::Cli) -> Result<Self> {
        let mut config = if Path::new(path).exists() {
            Self::from_file(path)?
        } else {
            tracing::warn!("Config file not found at {}, using defaults", path);
            Self::default()
        };

        config.apply_env_vars();
        config.apply_cli_overrides(cli);

        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| CryostatError::Config(format!("Failed to read config file: {}", e)))?;
        serde_yaml::from_str(&contents)
            .map_err(|e| CryostatError::Config(format!("Failed to parse config: {}", e)).into())
    }

    fn apply_env_vars(&mut self) {
        if let Ok(dir) = std::env::var("CRYOSTAT_RULES_DIR") {
            self.rules.storage_dir = Some(PathBuf::from(dir));
        }

        if let Ok(level) = std::env::var("CRYOSTAT_LOG_LEVEL") {
            self.logging.level = level;
        }

        if let Ok(namespaces) = std::env::var("CRYOSTAT_K8S_NAMESPACES") {
            self.discovery.kubernetes.namespaces = namespaces
                .split(',')
                .map(str::trim)
                .filter(|ns| !ns.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Ok(value) = std::env::var("CRYOSTAT_DISABLE_JDP") {
            match value.parse::<bool>() {
                Ok(disabled) => self.discovery.jdp.enabled = !disabled,
                Err(_) => tracing::warn!("Invalid CRYOSTAT_DISABLE_JDP: {}", value),
            }
        }

        if let Ok(value) = std::env::var("CRYOSTAT_DISABLE_BUILTIN_DISCOVERY") {
            match value.parse::<bool>() {
                Ok(true) => {
                    self.discovery.jdp.enabled = false;
                    self.discovery.kubernetes.enabled = false;
                    self.discovery.docker.enabled = false;
                    self.discovery.podman.enabled = false;
                }
                Ok(false) => {}
                Err(_) => tracing::warn!("Invalid CRYOSTAT_DISABLE_BUILTIN_DISCOVERY: {}", value),
            }
        }
    }

    fn apply_cli_overrides(&mut self, cli: &crate::cli::Cli) {
        if cli.verbose {
            self.logging.level = "debug".to_string();
        }
        if let Some(dir) = &cli.rules_dir {
            self.rules.storage_dir = Some(dir.clone());
        }
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns error if any validation check fails
    pub fn validate(&self) -> Result<()> {
        if self.discovery.list_timeout_ms == 0 {
            return Err(CryostatError::Config(
                "discovery.list_timeout_ms must be greater than 0".to_string(),
            )
            .into());
        }

        for (name, engine) in [("docker", &self.discovery.docker), ("podman", &self.discovery.podman)] {
            if engine.enabled && engine.poll_interval_secs == 0 {
                return Err(CryostatError::Config(format!(
                    "discovery.{}.poll_interval_secs must be greater than 0",
                    name
                ))
                .into());
            }
            if engine.enabled && engine.request_timeout_ms == 0 {
                return Err(CryostatError::Config(format!(
                    "discovery.{}.request_timeout_ms must be greater than 0",
                    name
                ))
                .into());
            }
        }

        let kube = &self.discovery.kubernetes;
        if kube.enabled && kube.port_names.is_empty() && kube.port_numbers.is_empty() {
            return Err(CryostatError::Config(
                "discovery.kubernetes needs at least one port name or number".to_string(),
            )
            .into());
        }

        if self.discovery.jdp.lost_after_missed_broadcasts == 0 {
            return Err(CryostatError::Config(
                "discovery.jdp.lost_after_missed_broadcasts must be greater than 0".to_string(),
            )
            .into());
        }

        if self.rules.max_concurrent_activations == 0 {
            return Err(CryostatError::Config(
                "rules.max_concurrent_activations must be greater than 0".to_string(),
            )
            .into());
        }

        if self.rules.expression_cache_capacity == 0 {
            return Err(CryostatError::Config(
                "rules.expression_cache_capacity must be greater than 0".to_string(),
            )
            .into());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn cli() -> crate::cli::Cli {
        crate::cli::Cli {
            config: None,
            verbose: false,
            rules_dir: None,
            command: crate::cli::Commands::Discover,
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.discovery.list_timeout_ms, 2000);
        assert_eq!(config.discovery.docker.poll_interval_secs, 10);
        assert_eq!(config.discovery.jdp.port, 7095);
        assert_eq!(config.discovery.kubernetes.port_names, vec!["jfr-jmx"]);
        assert_eq!(config.rules.expression_cache_capacity, 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_yaml_config() {
        let yaml = r#"
discovery:
  kubernetes:
    namespaces: [apps, monitoring]
    port_numbers: [9091, 9999]
  docker:
    enabled: false
  custom:
    targets:
      - connect_url: "service:jmx:rmi:///jndi/rmi://app:9091/jmxrmi"
        alias: app
        labels:
          team: payments
rules:
  storage_dir: /tmp/rules
  max_concurrent_activations: 8
logging:
  level: debug
  json_format: true
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.discovery.kubernetes.namespaces, vec!["apps", "monitoring"]);
        assert_eq!(config.discovery.kubernetes.port_numbers, vec![9091, 9999]);
        assert!(!config.discovery.docker.enabled);
        assert!(config.discovery.podman.enabled);
        assert_eq!(config.discovery.custom.targets.len(), 1);
        assert_eq!(config.rules.max_concurrent_activations, 8);
        assert_eq!(config.rules.storage_dir().unwrap(), PathBuf::from("/tmp/rules"));
        assert!(config.logging.json_format);
    }

    #[test]
    fn test_shipped_config_parses_and_validates() {
        let config: Config = serde_yaml::from_str(include_str!("../config/cryostat.yaml")).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.discovery.podman.poll_interval_secs, 10);
        assert!(config.discovery.custom.targets.is_empty());
        assert_eq!(config.rules.storage_dir, None);
    }

    #[test]
    fn test_custom_entry_to_service_ref() {
        let entry = CustomTargetEntry {
            connect_url: "service:jmx:rmi:///jndi/rmi://app:9091/jmxrmi".to_string(),
            alias: Some("app".to_string()),
            labels: BTreeMap::from([("team".to_string(), "payments".to_string())]),
            annotations: BTreeMap::new(),
        };
        let target = entry.to_service_ref();
        assert_eq!(target.alias.as_deref(), Some("app"));
        assert_eq!(target.labels["team"], "payments");
        assert_eq!(target.cryostat_annotation(AnnotationKey::Realm), Some("Custom Targets"));
    }

    #[test]
    fn test_validation_rejects_zero_poll_interval() {
        let mut config = Config::default();
        config.discovery.podman.poll_interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_empty_port_allow_list() {
        let mut config = Config::default();
        config.discovery.kubernetes.port_names.clear();
        config.discovery.kubernetes.port_numbers.clear();
        assert!(config.validate().is_err());
        config.discovery.kubernetes.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_zero_cache_capacity() {
        let mut config = Config::default();
        config.rules.expression_cache_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        std::env::set_var("CRYOSTAT_K8S_NAMESPACES", "a, b,,c");
        std::env::set_var("CRYOSTAT_DISABLE_BUILTIN_DISCOVERY", "true");
        std::env::set_var("CRYOSTAT_LOG_LEVEL", "trace");

        let config = Config::load("nonexistent.yaml", &cli()).unwrap();
        assert_eq!(config.discovery.kubernetes.namespaces, vec!["a", "b", "c"]);
        assert!(!config.discovery.jdp.enabled);
        assert!(!config.discovery.kubernetes.enabled);
        assert!(!config.discovery.docker.enabled);
        assert!(!config.discovery.podman.enabled);
        assert!(config.discovery.custom.enabled);
        assert_eq!(config.logging.level, "trace");

        std::env::remove_var("CRYOSTAT_K8S_NAMESPACES");
        std::env::remove_var("CRYOSTAT_DISABLE_BUILTIN_DISCOVERY");
        std::env::remove_var("CRYOSTAT_LOG_LEVEL");
    }

    #[test]
    #[serial]
    fn test_cli_overrides_env() {
        std::env::set_var("CRYOSTAT_RULES_DIR", "/from/env");
        let mut args = cli();
        args.verbose = true;
        args.rules_dir = Some(PathBuf::from("/from/cli"));

        let config = Config::load("nonexistent.yaml", &args).unwrap();
        assert_eq!(config.rules.storage_dir, Some(PathBuf::from("/from/cli")));
        assert_eq!(config.logging.level, "debug");

        std::env::remove_var("CRYOSTAT_RULES_DIR");
    }
}
