//! Bounded-retention periodic archival of a rule's capture
//!
//! Each firing of a [`PeriodicArchiver`] archives the rule's named capture on
//! its target and deletes the oldest archives so that at most
//! `preservedArchives` remain. Retention state is rebuilt from the archive
//! listing on the first firing, so it survives restarts without separate
//! persistence.

use super::Rule;
use crate::error::{session_failure_kind, Result};
use crate::session::{ArchiveStore, Credentials, TargetSessionService};
use crate::target::ServiceRef;
use metrics::increment_counter;
use regex::Regex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Called when a firing fails in a way that retrying cannot fix
pub type FailureHandler = Arc<dyn Fn(&ServiceRef, &Rule) + Send + Sync>;

#[derive(Default)]
struct Retention {
    recovered: bool,
    archives: VecDeque<String>,
}

/// Periodic archival task state for one target and rule
pub struct PeriodicArchiver {
    target: ServiceRef,
    rule: Rule,
    credentials: Option<Credentials>,
    sessions: Arc<dyn TargetSessionService>,
    archives: Arc<dyn ArchiveStore>,
    on_failure: FailureHandler,
    retention: Mutex<Retention>,
}

impl PeriodicArchiver {
    /// Creates an archiver; nothing runs until [`PeriodicArchiver::run`]
    pub fn new(
        target: ServiceRef,
        rule: Rule,
        credentials: Option<Credentials>,
        sessions: Arc<dyn TargetSessionService>,
        archives: Arc<dyn ArchiveStore>,
        on_failure: FailureHandler,
    ) -> Self {
        Self {
            target,
            rule,
            credentials,
            sessions,
            archives,
            on_failure,
            retention: Mutex::new(Retention::default()),
        }
    }

    /// Target being archived
    pub fn target(&self) -> &ServiceRef {
        &self.target
    }

    /// Rule being enforced
    pub fn rule(&self) -> &Rule {
        &self.rule
    }

    /// One firing: recover, evict, archive
    ///
    /// Permanent session failures are reported to the failure handler;
    /// every failure is also returned.
    pub async fn run(&self) -> Result<String> {
        match self.archive_once().await {
            Ok(name) => {
                increment_counter!("rule_archives_total", "rule" => self.rule.name().to_string());
                info!(target = %self.target, rule = %self.rule.name(), archive = %name, "Archived capture");
                Ok(name)
            }
            Err(e) => {
                increment_counter!("rule_archive_failures_total", "rule" => self.rule.name().to_string());
                warn!(target = %self.target, rule = %self.rule.name(), error = %e, "Periodic archival failed");
                if session_failure_kind(&e).is_some_and(|kind| kind.is_permanent()) {
                    (self.on_failure)(&self.target, &self.rule);
                }
                Err(e)
            }
        }
    }

    /// Archive names currently retained, oldest first
    pub async fn retained(&self) -> Vec<String> {
        self.retention.lock().await.archives.iter().cloned().collect()
    }

    async fn archive_once(&self) -> Result<String> {
        let mut retention = self.retention.lock().await;
        if !retention.recovered {
            retention.archives = self.recover().await?;
            retention.recovered = true;
        }

        let keep = usize::try_from(self.rule.preserved_archives() - 1).unwrap_or(0);
        while retention.archives.len() > keep {
            let Some(oldest) = retention.archives.front().cloned() else {
                break;
            };
            self.archives
                .delete_archived(&self.target.service_uri, &oldest)
                .await?;
            retention.archives.pop_front();
            debug!(target = %self.target, archive = %oldest, "Pruned archive");
        }

        let session = self
            .sessions
            .connect(&self.target, self.credentials.as_ref())
            .await?;
        let name = self
            .archives
            .archive(session.as_ref(), &self.rule.recording_name())
            .await?;
        retention.archives.push_back(name.clone());
        Ok(name)
    }

    async fn recover(&self) -> Result<VecDeque<String>> {
        let pattern = Regex::new(&format!(
            r"^.+_{}_\d{{8}}T\d{{6}}Z(\.\d+)?(\.jfr)?$",
            regex::escape(&self.rule.recording_name())
        ))?;
        let mut existing: Vec<_> = self
            .archives
            .list_archived(&self.target.service_uri)
            .await?
            .into_iter()
            .filter(|archived| pattern.is_match(&archived.name))
            .collect();
        existing.sort_by(|a, b| a.archived_time.cmp(&b.archived_time).then_with(|| a.name.cmp(&b.name)));
        debug!(
            target = %self.target,
            rule = %self.rule.name(),
            recovered = existing.len(),
            "Recovered retention state"
        );
        Ok(existing.into_iter().map(|archived| archived.name).collect())
    }
}
