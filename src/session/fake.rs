//! In-process fakes of the session service and archive store
//!
//! [`FakeSessionService`] keeps captures per target in memory and counts the
//! calls made against it. [`FakeArchiveStore`] keeps archives per target.
//! Both can be told to fail with a given [`SessionFailureKind`].
//!
//! # Example
//!
//! ```
//! use cryostat::session::fake::FakeSessionService;
//! use cryostat::session::{CaptureOptions, EventTemplate, TargetSessionService};
//! use cryostat::target::ServiceRef;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let service = FakeSessionService::new();
//! let target = ServiceRef::new("service:jmx:rmi:///jndi/rmi://app:9091/jmxrmi");
//! let session = service.connect(&target, None).await.unwrap();
//! let template = EventTemplate { name: "Continuous".to_string(), template_type: None };
//! session.start_capture("auto_x", &CaptureOptions::default(), &template).await.unwrap();
//! assert_eq!(service.start_calls(), 1);
//! # }
//! ```

use super::{
    archive_name, ArchiveStore, ArchivedRecording, CaptureDescriptor, CaptureOptions, CaptureState, Credentials,
    EventTemplate, TargetSession, TargetSessionService,
};
use crate::error::{CryostatError, Result, SessionFailureKind};
use crate::target::ServiceRef;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

#[derive(Default)]
struct SessionInner {
    captures: Mutex<HashMap<String, Vec<CaptureDescriptor>>>,
    credentials: Mutex<HashMap<String, Credentials>>,
    required: Mutex<HashMap<String, Credentials>>,
    failure: Mutex<Option<SessionFailureKind>>,
    connect_delay: Mutex<Duration>,
    next_id: AtomicI64,
    connect_calls: AtomicUsize,
    start_calls: AtomicUsize,
    snapshot_calls: AtomicUsize,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory [`TargetSessionService`]
#[derive(Clone, Default)]
pub struct FakeSessionService {
    inner: Arc<SessionInner>,
}

impl FakeSessionService {
    /// Creates a service where every target is reachable without credentials
    pub fn new() -> Self {
        Self::default()
    }

    /// Credentials returned for a target
    pub fn set_credentials(&self, service_uri: &str, credentials: Credentials) {
        lock(&self.inner.credentials).insert(service_uri.to_string(), credentials);
    }

    /// Rejects connections to a target unless they present `credentials`
    pub fn require_credentials(&self, service_uri: &str, credentials: Credentials) {
        lock(&self.inner.required).insert(service_uri.to_string(), credentials);
    }

    /// Makes every connection attempt fail with `kind`, or succeed with `None`
    pub fn fail_connections(&self, kind: Option<SessionFailureKind>) {
        *lock(&self.inner.failure) = kind;
    }

    /// Delays every connection attempt
    pub fn set_connect_delay(&self, delay: Duration) {
        *lock(&self.inner.connect_delay) = delay;
    }

    /// Captures currently present on a target
    pub fn captures(&self, service_uri: &str) -> Vec<CaptureDescriptor> {
        lock(&self.inner.captures)
            .get(service_uri)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of connection attempts
    pub fn connect_calls(&self) -> usize {
        self.inner.connect_calls.load(Ordering::SeqCst)
    }

    /// Number of capture starts
    pub fn start_calls(&self) -> usize {
        self.inner.start_calls.load(Ordering::SeqCst)
    }

    /// Number of snapshots taken
    pub fn snapshot_calls(&self) -> usize {
        self.inner.snapshot_calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl TargetSessionService for FakeSessionService {
    async fn resolve_credentials(&self, target: &ServiceRef) -> Result<Option<Credentials>> {
        Ok(lock(&self.inner.credentials).get(&target.service_uri).cloned())
    }

    async fn connect(
        &self,
        target: &ServiceRef,
        credentials: Option<&Credentials>,
    ) -> Result<Box<dyn TargetSession>> {
        self.inner.connect_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *lock(&self.inner.connect_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(kind) = *lock(&self.inner.failure) {
            return Err(CryostatError::session(kind, format!("cannot connect to {}", target.service_uri)).into());
        }
        if let Some(required) = lock(&self.inner.required).get(&target.service_uri) {
            if credentials != Some(required) {
                return Err(CryostatError::session(
                    SessionFailureKind::Authentication,
                    format!("bad credentials for {}", target.service_uri),
                )
                .into());
            }
        }
        Ok(Box::new(FakeSession {
            target: target.clone(),
            inner: self.inner.clone(),
        }))
    }
}

struct FakeSession {
    target: ServiceRef,
    inner: Arc<SessionInner>,
}

impl FakeSession {
    fn descriptor(&self, name: &str, state: CaptureState) -> CaptureDescriptor {
        CaptureDescriptor {
            id: self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1,
            name: name.to_string(),
            state,
            labels: BTreeMap::new(),
        }
    }
}

#[async_trait::async_trait]
impl TargetSession for FakeSession {
    fn target(&self) -> &ServiceRef {
        &self.target
    }

    async fn start_capture(
        &self,
        name: &str,
        _options: &CaptureOptions,
        _template: &EventTemplate,
    ) -> Result<CaptureDescriptor> {
        self.inner.start_calls.fetch_add(1, Ordering::SeqCst);
        let descriptor = self.descriptor(name, CaptureState::Running);
        let mut captures = lock(&self.inner.captures);
        let list = captures.entry(self.target.service_uri.clone()).or_default();
        list.retain(|c| c.name != name);
        list.push(descriptor.clone());
        Ok(descriptor)
    }

    async fn list_captures(&self) -> Result<Vec<CaptureDescriptor>> {
        Ok(lock(&self.inner.captures)
            .get(&self.target.service_uri)
            .cloned()
            .unwrap_or_default())
    }

    async fn close_capture(&self, descriptor: &CaptureDescriptor) -> Result<()> {
        if let Some(list) = lock(&self.inner.captures).get_mut(&self.target.service_uri) {
            list.retain(|c| c.id != descriptor.id);
        }
        Ok(())
    }

    async fn snapshot_capture(&self) -> Result<CaptureDescriptor> {
        self.inner.snapshot_calls.fetch_add(1, Ordering::SeqCst);
        let descriptor = self.descriptor("snapshot", CaptureState::Stopped);
        lock(&self.inner.captures)
            .entry(self.target.service_uri.clone())
            .or_default()
            .push(descriptor.clone());
        Ok(descriptor)
    }

    async fn update_capture_labels(
        &self,
        descriptor: &CaptureDescriptor,
        labels: BTreeMap<String, String>,
    ) -> Result<()> {
        if let Some(list) = lock(&self.inner.captures).get_mut(&self.target.service_uri) {
            if let Some(capture) = list.iter_mut().find(|c| c.id == descriptor.id) {
                capture.labels = labels;
            }
        }
        Ok(())
    }
}

/// In-memory [`ArchiveStore`]
#[derive(Default)]
pub struct FakeArchiveStore {
    archives: Mutex<HashMap<String, Vec<ArchivedRecording>>>,
    deleted: Mutex<Vec<String>>,
    failure: Mutex<Option<SessionFailureKind>>,
    archive_calls: AtomicUsize,
}

impl FakeArchiveStore {
    /// Creates an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds archives as if left over from an earlier run
    pub fn seed(&self, target_uri: &str, names: &[&str]) {
        let mut archives = lock(&self.archives);
        let list = archives.entry(target_uri.to_string()).or_default();
        for name in names {
            list.push(ArchivedRecording {
                name: name.to_string(),
                size: 0,
                archived_time: Utc::now(),
            });
        }
    }

    /// Makes every archival fail with `kind`, or succeed with `None`
    pub fn fail_archival(&self, kind: Option<SessionFailureKind>) {
        *lock(&self.failure) = kind;
    }

    /// Archive names currently held for a target
    pub fn names(&self, target_uri: &str) -> Vec<String> {
        lock(&self.archives)
            .get(target_uri)
            .map(|list| list.iter().map(|a| a.name.clone()).collect())
            .unwrap_or_default()
    }

    /// Archive names deleted so far, in order
    pub fn deleted(&self) -> Vec<String> {
        lock(&self.deleted).clone()
    }

    /// Number of archival attempts
    pub fn archive_calls(&self) -> usize {
        self.archive_calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ArchiveStore for FakeArchiveStore {
    async fn list_archived(&self, target_uri: &str) -> Result<Vec<ArchivedRecording>> {
        Ok(lock(&self.archives).get(target_uri).cloned().unwrap_or_default())
    }

    async fn archive(&self, session: &dyn TargetSession, capture_name: &str) -> Result<String> {
        self.archive_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(kind) = *lock(&self.failure) {
            return Err(CryostatError::session(kind, format!("cannot archive {}", capture_name)).into());
        }
        let target = session.target();
        let mut archives = lock(&self.archives);
        let list = archives.entry(target.service_uri.clone()).or_default();
        let base = archive_name(target, capture_name, Utc::now());
        let mut name = base.clone();
        let mut seq = 1;
        while list.iter().any(|a| a.name == name) {
            name = format!("{}.{}.jfr", base.trim_end_matches(".jfr"), seq);
            seq += 1;
        }
        list.push(ArchivedRecording {
            name: name.clone(),
            size: 1024,
            archived_time: Utc::now(),
        });
        Ok(name)
    }

    async fn delete_archived(&self, target_uri: &str, archived_name: &str) -> Result<()> {
        if let Some(list) = lock(&self.archives).get_mut(target_uri) {
            list.retain(|a| a.name != archived_name);
        }
        lock(&self.deleted).push(archived_name.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_start_capture_replaces_same_name() {
        let service = FakeSessionService::new();
        let target = ServiceRef::new("uri");
        let session = service.connect(&target, None).await.unwrap();
        let template = EventTemplate {
            name: "Continuous".to_string(),
            template_type: None,
        };
        session.start_capture("a", &CaptureOptions::default(), &template).await.unwrap();
        session.start_capture("a", &CaptureOptions::default(), &template).await.unwrap();
        assert_eq!(service.captures("uri").len(), 1);
        assert_eq!(service.start_calls(), 2);
    }

    #[tokio::test]
    async fn test_archive_names_are_unique() {
        let service = FakeSessionService::new();
        let store = FakeArchiveStore::new();
        let session = service.connect(&ServiceRef::new("uri").with_alias("app"), None).await.unwrap();
        let a = store.archive(session.as_ref(), "auto_r").await.unwrap();
        let b = store.archive(session.as_ref(), "auto_r").await.unwrap();
        assert_ne!(a, b);
        assert_eq!(store.names("uri").len(), 2);
    }

    #[tokio::test]
    async fn test_failures_are_classified() {
        let service = FakeSessionService::new();
        service.fail_connections(Some(SessionFailureKind::Authentication));
        let err = service.connect(&ServiceRef::new("uri"), None).await.err().unwrap();
        assert_eq!(
            crate::error::session_failure_kind(&err),
            Some(SessionFailureKind::Authentication)
        );
    }
}
