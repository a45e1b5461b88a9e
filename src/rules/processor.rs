//! Rule activation state machine
//!
//! [`RuleProcessor`] keeps at most one live task per `(target, rule)` key.
//! A task is created when an enabled rule matches a discovered target and
//! removed when the rule is disabled or deleted, the target is lost, or the
//! task's periodic archival hits a permanent session failure.
//!
//! Event sources only enqueue work. A single dispatcher drains the queue in
//! order and claims task keys synchronously; the blocking part of an
//! activation (connecting and starting the capture) runs on spawned tasks
//! bounded by a semaphore.

use super::archiver::{FailureHandler, PeriodicArchiver};
use super::registry::{RuleEvent, RuleEventKind, RuleRegistry};
use super::{EventSpecifier, Rule};
use crate::credentials::{CredentialEvent, CredentialStore};
use crate::discovery::{EventKind, PlatformClient, TargetDiscoveryEvent};
use crate::error::{CryostatError, Result};
use crate::events::ListenerId;
use crate::session::{ArchiveStore, CaptureOptions, Credentials, TargetSessionService};
use crate::target::ServiceRef;
use metrics::increment_counter;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Label attached to captures started by a rule
pub const RULE_LABEL: &str = "rule";

/// Longest initial delay or archival period an archiver will schedule
const MAX_SCHEDULE_SECONDS: i64 = 60 * 60 * 24 * 365;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TaskKey {
    target: String,
    rule: Rule,
}

impl TaskKey {
    fn new(target: &ServiceRef, rule: &Rule) -> Self {
        Self {
            target: task_target(target),
            rule: rule.clone(),
        }
    }
}

/// Identity of a target in the task map: its JVM id once known, else its
/// connect address
fn task_target(target: &ServiceRef) -> String {
    if target.jvm_id.is_empty() {
        target.service_uri.clone()
    } else {
        target.jvm_id.clone()
    }
}

enum TaskState {
    /// Key claimed, capture start in flight
    Pending(u64),
    /// Capture running; the archiver loop is present only for periodic rules
    Active {
        generation: u64,
        token: CancellationToken,
        _archiver: Option<JoinHandle<()>>,
    },
}

enum Work {
    Discovery(TargetDiscoveryEvent),
    Rule(RuleEvent),
    Credential(CredentialEvent),
}

struct Running {
    token: CancellationToken,
    _dispatcher: JoinHandle<()>,
    discovery: ListenerId,
    rules: ListenerId,
    credentials: ListenerId,
}

struct ProcessorInner {
    platform: Arc<dyn PlatformClient>,
    registry: Arc<RuleRegistry>,
    credentials: Arc<dyn CredentialStore>,
    sessions: Arc<dyn TargetSessionService>,
    archives: Arc<dyn ArchiveStore>,
    tasks: Mutex<HashMap<TaskKey, TaskState>>,
    permits: Semaphore,
    generation: AtomicU64,
}

/// Reacts to rule, credential and discovery events by starting captures and
/// scheduling periodic archival
pub struct RuleProcessor {
    inner: Arc<ProcessorInner>,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl RuleProcessor {
    /// Creates a processor running at most `max_concurrent_activations`
    /// activations at once
    pub fn new(
        platform: Arc<dyn PlatformClient>,
        registry: Arc<RuleRegistry>,
        credentials: Arc<dyn CredentialStore>,
        sessions: Arc<dyn TargetSessionService>,
        archives: Arc<dyn ArchiveStore>,
        max_concurrent_activations: usize,
    ) -> Self {
        Self {
            inner: Arc::new(ProcessorInner {
                platform,
                registry,
                credentials,
                sessions,
                archives,
                tasks: Mutex::new(HashMap::new()),
                permits: Semaphore::new(max_concurrent_activations.max(1)),
                generation: AtomicU64::new(1),
            }),
            running: tokio::sync::Mutex::new(None),
        }
    }

    /// Subscribes to every event source and activates rules for the targets
    /// already known. Idempotent.
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<Work>();
        let discovery = {
            let tx = tx.clone();
            self.inner
                .platform
                .add_listener(Arc::new(move |event: &TargetDiscoveryEvent| {
                    let _ = tx.send(Work::Discovery(event.clone()));
                }))
        };
        let rules = {
            let tx = tx.clone();
            self.inner.registry.add_listener(Arc::new(move |event: &RuleEvent| {
                let _ = tx.send(Work::Rule(event.clone()));
            }))
        };
        let credentials = self
            .inner
            .credentials
            .add_listener(Arc::new(move |event: &CredentialEvent| {
                let _ = tx.send(Work::Credential(event.clone()));
            }));

        let token = CancellationToken::new();
        let cancel = token.clone();
        let weak = Arc::downgrade(&self.inner);
        let dispatcher = tokio::spawn(async move {
            loop {
                let work = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    work = rx.recv() => match work {
                        Some(work) => work,
                        None => break,
                    },
                };
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.dispatch(work).await;
            }
        });

        for target in self.inner.discoverable().await {
            self.inner.activate_matching(&target);
        }

        *running = Some(Running {
            token,
            _dispatcher: dispatcher,
            discovery,
            rules,
            credentials,
        });
        info!("Rule processor started");
        Ok(())
    }

    /// Unsubscribes and cancels every task without waiting for in-flight
    /// archival. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        let Some(running) = self.running.lock().await.take() else {
            return Ok(());
        };
        running.token.cancel();
        self.inner.platform.remove_listener(running.discovery);
        self.inner.registry.remove_listener(running.rules);
        self.inner.credentials.remove_listener(running.credentials);

        let drained: Vec<TaskState> = self.inner.lock_tasks().drain().map(|(_, state)| state).collect();
        let count = drained.len();
        drained.into_iter().for_each(cancel);
        info!(cancelled = count, "Rule processor stopped");
        Ok(())
    }

    /// Activates `rule` for `target` and waits for the capture to start
    ///
    /// Re-activating a key that is already pending or active is a no-op.
    pub async fn activate(&self, target: &ServiceRef, rule: &Rule) -> Result<()> {
        if rule.is_archiver() {
            return self.inner.archive_now(target, rule).await.map(|_| ());
        }
        match self.inner.claim(target, rule) {
            Some(generation) => self.inner.clone().complete(target.clone(), rule.clone(), generation).await,
            None => Ok(()),
        }
    }

    /// Cancels and removes tasks matching the rule, the target, or both
    ///
    /// # Errors
    ///
    /// Returns `CryostatError::InvalidRule` when neither is given.
    pub fn deactivate(&self, rule: Option<&Rule>, target: Option<&ServiceRef>) -> Result<usize> {
        self.inner.deactivate(rule, target)
    }

    /// Number of pending or active tasks
    pub fn task_count(&self) -> usize {
        self.inner.lock_tasks().len()
    }

    /// Whether a task exists for the key
    pub fn has_task(&self, target: &ServiceRef, rule: &Rule) -> bool {
        self.inner.lock_tasks().contains_key(&TaskKey::new(target, rule))
    }

    /// Whether the key's task is active with a running periodic archiver
    pub fn has_archiver(&self, target: &ServiceRef, rule: &Rule) -> bool {
        matches!(
            self.inner.lock_tasks().get(&TaskKey::new(target, rule)),
            Some(TaskState::Active { _archiver: Some(handle), .. }) if !handle.is_finished()
        )
    }
}

fn cancel(state: TaskState) {
    if let TaskState::Active { token, .. } = state {
        token.cancel();
    }
}

impl ProcessorInner {
    fn lock_tasks(&self) -> MutexGuard<'_, HashMap<TaskKey, TaskState>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn discoverable(&self) -> Vec<ServiceRef> {
        match self.platform.list_discoverable_services().await {
            Ok(targets) => targets,
            Err(e) => {
                warn!(error = %e, "Cannot list discoverable targets");
                Vec::new()
            }
        }
    }

    async fn dispatch(self: Arc<Self>, work: Work) {
        match work {
            Work::Discovery(event) => match event.kind {
                EventKind::Found | EventKind::Modified => self.activate_matching(&event.service_ref),
                EventKind::Lost => {
                    if let Err(e) = self.deactivate(None, Some(&event.service_ref)) {
                        warn!(error = %e, "Deactivation failed");
                    }
                }
            },
            Work::Rule(RuleEvent { kind, rule }) => match kind {
                RuleEventKind::Added | RuleEventKind::Updated if rule.is_enabled() => {
                    for target in self.discoverable().await {
                        if target.alias.is_some() && self.registry.applies(&rule, &target) {
                            self.schedule(target, rule.clone());
                        }
                    }
                }
                _ => {
                    if let Err(e) = self.deactivate(Some(&rule), None) {
                        warn!(error = %e, "Deactivation failed");
                    }
                }
            },
            Work::Credential(event) => {
                let evaluator = self.registry.evaluator().clone();
                for target in self.discoverable().await {
                    match evaluator.applies(&event.match_expression, &target) {
                        Ok(true) => self.activate_matching(&target),
                        Ok(false) => {}
                        Err(e) => debug!(target = %target, error = %e, "Credential expression not applicable"),
                    }
                }
            }
        }
    }

    fn activate_matching(self: &Arc<Self>, target: &ServiceRef) {
        for rule in self.registry.get_rules_for(target) {
            if rule.is_enabled() {
                self.schedule(target.clone(), rule);
            }
        }
    }

    /// Claims the key now and finishes the activation on the worker pool
    fn schedule(self: &Arc<Self>, target: ServiceRef, rule: Rule) {
        if rule.is_archiver() {
            let inner = self.clone();
            tokio::spawn(async move {
                let _ = inner.archive_now(&target, &rule).await;
            });
            return;
        }
        if let Some(generation) = self.claim(&target, &rule) {
            let inner = self.clone();
            tokio::spawn(async move {
                let _ = inner.complete(target, rule, generation).await;
            });
        }
    }

    fn claim(&self, target: &ServiceRef, rule: &Rule) -> Option<u64> {
        let key = TaskKey::new(target, rule);
        let mut tasks = self.lock_tasks();
        if tasks.contains_key(&key) {
            trace!(target = %target, rule = %rule.name(), "Rule already active for target");
            return None;
        }
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        tasks.insert(key, TaskState::Pending(generation));
        Some(generation)
    }

    async fn complete(self: Arc<Self>, target: ServiceRef, rule: Rule, generation: u64) -> Result<()> {
        let key = TaskKey::new(&target, &rule);
        let started = self.start_capture(&target, &rule).await;
        let mut tasks = self.lock_tasks();
        let claimed = matches!(tasks.get(&key), Some(TaskState::Pending(g)) if *g == generation);

        let credentials = match started {
            Ok(credentials) => credentials,
            Err(e) => {
                if claimed {
                    tasks.remove(&key);
                }
                increment_counter!("rule_activation_failures_total", "rule" => rule.name().to_string());
                warn!(target = %target, rule = %rule.name(), error = %e, "Rule activation failed");
                return Err(e);
            }
        };
        if !claimed {
            debug!(target = %target, rule = %rule.name(), "Task deactivated before activation completed");
            return Ok(());
        }

        let token = CancellationToken::new();
        let archiver = (rule.preserved_archives() > 0 && rule.archival_period_seconds() > 0)
            .then(|| {
                self.spawn_archiver(&key, generation, target.clone(), rule.clone(), credentials, token.clone())
            });
        tasks.insert(
            key,
            TaskState::Active {
                generation,
                token,
                _archiver: archiver,
            },
        );
        drop(tasks);

        increment_counter!("rule_activations_total", "rule" => rule.name().to_string());
        info!(target = %target, rule = %rule.name(), "Rule activated");
        Ok(())
    }

    async fn start_capture(&self, target: &ServiceRef, rule: &Rule) -> Result<Option<Credentials>> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| CryostatError::Startup(format!("worker pool closed: {}", e)))?;
        let EventSpecifier::Template(template) = rule.parsed_event_specifier()? else {
            return Err(CryostatError::InvalidRule(format!("rule '{}' names no event template", rule.name())).into());
        };
        let credentials = self.credentials_for(target).await?;
        let session = self.sessions.connect(target, credentials.as_ref()).await?;
        let options = CaptureOptions {
            to_disk: true,
            max_age_seconds: (rule.max_age_seconds() > 0).then(|| rule.max_age_seconds()),
            max_size_bytes: (rule.max_size_bytes() > 0).then(|| rule.max_size_bytes()),
        };
        let descriptor = session
            .start_capture(&rule.recording_name(), &options, &template)
            .await?;
        let mut labels = descriptor.labels.clone();
        labels.insert(RULE_LABEL.to_string(), rule.name().to_string());
        session.update_capture_labels(&descriptor, labels).await?;
        Ok(credentials)
    }

    /// Stored credentials first, then whatever the session service resolves
    async fn credentials_for(&self, target: &ServiceRef) -> Result<Option<Credentials>> {
        if let Some(credentials) = self.credentials.get_credentials(target)? {
            return Ok(Some(credentials));
        }
        self.sessions.resolve_credentials(target).await
    }

    fn spawn_archiver(
        self: &Arc<Self>,
        key: &TaskKey,
        generation: u64,
        target: ServiceRef,
        rule: Rule,
        credentials: Option<Credentials>,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let failed = key.clone();
        let on_failure: FailureHandler = Arc::new(move |target: &ServiceRef, rule: &Rule| {
            if let Some(inner) = weak.upgrade() {
                if inner.remove_generation(&failed, generation) {
                    warn!(target = %target, rule = %rule.name(), "Deactivating rule after permanent failure");
                } else {
                    debug!(target = %target, rule = %rule.name(), "Ignoring failure from a superseded archiver");
                }
            }
        });
        if rule.initial_delay_seconds() > MAX_SCHEDULE_SECONDS || rule.archival_period_seconds() > MAX_SCHEDULE_SECONDS {
            warn!(
                target = %target,
                rule = %rule.name(),
                max_seconds = MAX_SCHEDULE_SECONDS,
                "Archival schedule clamped"
            );
        }
        let initial = Duration::from_secs(rule.initial_delay_seconds().clamp(0, MAX_SCHEDULE_SECONDS) as u64);
        let period = Duration::from_secs(rule.archival_period_seconds().clamp(1, MAX_SCHEDULE_SECONDS) as u64);
        let archiver = PeriodicArchiver::new(
            target,
            rule,
            credentials,
            self.sessions.clone(),
            self.archives.clone(),
            on_failure,
        );
        tokio::spawn(async move {
            let now = tokio::time::Instant::now();
            let mut ticker = tokio::time::interval_at(now.checked_add(initial).unwrap_or(now), period);
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let _ = archiver.run().await;
                    }
                }
            }
            debug!(target = %archiver.target(), rule = %archiver.rule().name(), "Archiver stopped");
        })
    }

    async fn archive_now(&self, target: &ServiceRef, rule: &Rule) -> Result<String> {
        let result = self.snapshot_and_archive(target).await;
        match &result {
            Ok(name) => info!(target = %target, rule = %rule.name(), archive = %name, "Snapshot archived"),
            Err(e) => warn!(target = %target, rule = %rule.name(), error = %e, "Snapshot archival failed"),
        }
        result
    }

    async fn snapshot_and_archive(&self, target: &ServiceRef) -> Result<String> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| CryostatError::Startup(format!("worker pool closed: {}", e)))?;
        let credentials = self.credentials_for(target).await?;
        let session = self.sessions.connect(target, credentials.as_ref()).await?;
        let snapshot = session.snapshot_capture().await?;
        let archived = self.archives.archive(session.as_ref(), &snapshot.name).await;
        if let Err(e) = session.close_capture(&snapshot).await {
            warn!(target = %target, capture = %snapshot.name, error = %e, "Cannot close snapshot");
        }
        archived
    }

    fn deactivate(&self, rule: Option<&Rule>, target: Option<&ServiceRef>) -> Result<usize> {
        if rule.is_none() && target.is_none() {
            return Err(CryostatError::InvalidRule("deactivation needs a rule or a target".to_string()).into());
        }
        let target = target.map(task_target);
        let removed: Vec<TaskState> = {
            let mut tasks = self.lock_tasks();
            let keys: Vec<TaskKey> = tasks
                .keys()
                .filter(|k| rule.map_or(true, |r| &k.rule == r) && target.as_ref().map_or(true, |t| &k.target == t))
                .cloned()
                .collect();
            keys.iter().filter_map(|k| tasks.remove(k)).collect()
        };
        let count = removed.len();
        removed.into_iter().for_each(cancel);
        if count > 0 {
            info!(
                rule = rule.map(Rule::name).unwrap_or("*"),
                target = target.as_deref().unwrap_or("*"),
                count,
                "Tasks deactivated"
            );
        }
        Ok(count)
    }

    /// Removes the key only while it still holds the task started by
    /// `generation`
    fn remove_generation(&self, key: &TaskKey, generation: u64) -> bool {
        let removed = {
            let mut tasks = self.lock_tasks();
            match tasks.get(key) {
                Some(TaskState::Active { generation: g, .. }) if *g == generation => tasks.remove(key),
                _ => None,
            }
        };
        removed.map(cancel).is_some()
    }
}
