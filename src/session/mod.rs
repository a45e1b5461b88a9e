//! Target session and archive store interfaces
//!
//! The wire protocol used to command a target is provided by the embedding
//! application. The rule engine only sees these traits.
//!
//! - [`TargetSessionService`] resolves credentials and opens sessions
//! - [`TargetSession`] starts, lists, closes and snapshots captures
//! - [`ArchiveStore`] persists captures and enforces retention
//!
//! Failures are reported as [`CryostatError::Session`] with a
//! [`SessionFailureKind`] so callers can tell permanent failures from
//! transient ones.
//!
//! [`CryostatError::Session`]: crate::error::CryostatError::Session
//! [`SessionFailureKind`]: crate::error::SessionFailureKind

use crate::error::Result;
use crate::target::ServiceRef;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub mod fake;

/// Credentials for connecting to a target
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Username
    pub username: String,
    /// Password
    pub password: String,
}

impl Credentials {
    /// Creates credentials
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Where an event template is defined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TemplateType {
    /// Provided by the target runtime
    Target,
    /// Uploaded by a user
    Custom,
}

impl std::str::FromStr for TemplateType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "TARGET" => Ok(TemplateType::Target),
            "CUSTOM" => Ok(TemplateType::Custom),
            other => Err(format!("unknown template type {}", other)),
        }
    }
}

/// Reference to the event template a capture records with
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventTemplate {
    /// Template name
    pub name: String,
    /// Template location; `None` lets the session pick
    pub template_type: Option<TemplateType>,
}

/// Retention options of a capture
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureOptions {
    /// Keep data on the target's disk
    pub to_disk: bool,
    /// Discard data older than this
    pub max_age_seconds: Option<i64>,
    /// Discard data beyond this size
    pub max_size_bytes: Option<i64>,
}

/// State of a capture on the target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CaptureState {
    /// Recording
    Running,
    /// Finished
    Stopped,
}

/// A capture as reported by the target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureDescriptor {
    /// Target-assigned id
    pub id: i64,
    /// Capture name
    pub name: String,
    /// State
    pub state: CaptureState,
    /// Metadata labels
    pub labels: BTreeMap<String, String>,
}

/// An archived capture
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivedRecording {
    /// Archive name
    pub name: String,
    /// Size in bytes
    pub size: u64,
    /// When the capture was archived
    pub archived_time: DateTime<Utc>,
}

/// An open connection to one target
#[async_trait::async_trait]
pub trait TargetSession: Send + Sync {
    /// The connected target
    fn target(&self) -> &ServiceRef;

    /// Starts a named capture, replacing an existing one with the same name
    async fn start_capture(
        &self,
        name: &str,
        options: &CaptureOptions,
        template: &EventTemplate,
    ) -> Result<CaptureDescriptor>;

    /// Lists captures on the target
    async fn list_captures(&self) -> Result<Vec<CaptureDescriptor>>;

    /// Stops and discards a capture
    async fn close_capture(&self, descriptor: &CaptureDescriptor) -> Result<()>;

    /// Takes a snapshot capture of everything currently recorded
    async fn snapshot_capture(&self) -> Result<CaptureDescriptor>;

    /// Replaces the metadata labels of a capture
    async fn update_capture_labels(
        &self,
        descriptor: &CaptureDescriptor,
        labels: BTreeMap<String, String>,
    ) -> Result<()>;
}

/// Opens sessions to targets
#[async_trait::async_trait]
pub trait TargetSessionService: Send + Sync {
    /// Credentials to use for a target, if any apply
    async fn resolve_credentials(&self, target: &ServiceRef) -> Result<Option<Credentials>>;

    /// Connects to a target
    ///
    /// # Errors
    ///
    /// Returns `CryostatError::Session` classified by failure kind.
    async fn connect(
        &self,
        target: &ServiceRef,
        credentials: Option<&Credentials>,
    ) -> Result<Box<dyn TargetSession>>;
}

/// Persistent storage of archived captures
#[async_trait::async_trait]
pub trait ArchiveStore: Send + Sync {
    /// Archived captures of a target
    async fn list_archived(&self, target_uri: &str) -> Result<Vec<ArchivedRecording>>;

    /// Archives a capture from an open session, returning the archive name
    async fn archive(&self, session: &dyn TargetSession, capture_name: &str) -> Result<String>;

    /// Deletes an archived capture
    async fn delete_archived(&self, target_uri: &str, archived_name: &str) -> Result<()>;
}

/// Archive name for a capture: `<target>_<capture>_<UTC basic timestamp>.jfr`
///
/// The target part is the alias when present, else the connect address,
/// with characters outside `[A-Za-z0-9-]` replaced by `-`.
pub fn archive_name(target: &ServiceRef, capture_name: &str, at: DateTime<Utc>) -> String {
    let source = target.alias.as_deref().unwrap_or(&target.service_uri);
    let sanitized: String = source
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    format!("{}_{}_{}.jfr", sanitized, capture_name, at.format("%Y%m%dT%H%M%SZ"))
}
