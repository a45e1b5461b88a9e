//! Rule registry and persistence
//!
//! [`RuleRegistry`] holds the live rule set in memory. Persistent storage is
//! the source of truth: it is read once by [`RuleRegistry::load_rules`] and
//! written before every in-memory mutation, so a failed save leaves the
//! registry unchanged.

use super::expression::{MatchExpressionEvaluator, MatchExpressionValidator};
use super::Rule;
use crate::error::{is_evaluation_error, CryostatError, Result};
use crate::events::{Listener, ListenerId, Listeners};
use crate::target::ServiceRef;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

/// What happened to a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleEventKind {
    /// Rule registered
    Added,
    /// Rule deleted
    Removed,
    /// Rule enabled or disabled
    Updated,
}

/// Change notification from the registry
#[derive(Debug, Clone, PartialEq)]
pub struct RuleEvent {
    /// Kind of change
    pub kind: RuleEventKind,
    /// Affected rule, in its new state
    pub rule: Rule,
}

/// Persistent rule storage
pub trait RuleStorage: Send + Sync {
    /// Every stored rule
    fn load_all(&self) -> Result<Vec<Rule>>;

    /// Stores a rule, replacing any rule with the same name
    fn save(&self, rule: &Rule) -> Result<()>;

    /// Deletes a stored rule; deleting a missing rule succeeds
    fn delete(&self, name: &str) -> Result<()>;
}

/// Stores each rule as a pretty-printed JSON file named after the rule
#[derive(Debug, Clone)]
pub struct FileRuleStorage {
    dir: PathBuf,
}

impl FileRuleStorage {
    /// Creates storage rooted at `dir`, creating it when missing
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| {
            CryostatError::Persistence(format!("cannot create rule directory {}: {}", dir.display(), e))
        })?;
        Ok(Self { dir })
    }

    /// Storage directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File holding `name`; the name is percent-encoded so distinct names
    /// never share a file
    fn path_for(&self, name: &str) -> PathBuf {
        let file: String = url::form_urlencoded::byte_serialize(name.as_bytes()).collect();
        self.dir.join(format!("{}.json", file))
    }
}

impl RuleStorage for FileRuleStorage {
    fn load_all(&self) -> Result<Vec<Rule>> {
        let entries = fs::read_dir(&self.dir).map_err(|e| {
            CryostatError::Persistence(format!("cannot read rule directory {}: {}", self.dir.display(), e))
        })?;
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        let mut rules = Vec::with_capacity(paths.len());
        for path in paths {
            let parsed = fs::read_to_string(&path)
                .map_err(anyhow::Error::from)
                .and_then(|content| serde_json::from_str::<Rule>(&content).map_err(anyhow::Error::from));
            match parsed {
                Ok(rule) => rules.push(rule),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable rule file"),
            }
        }
        Ok(rules)
    }

    fn save(&self, rule: &Rule) -> Result<()> {
        let path = self.path_for(rule.name());
        let content = serde_json::to_string_pretty(rule)?;
        fs::write(&path, content)
            .map_err(|e| CryostatError::Persistence(format!("cannot write {}: {}", path.display(), e)))?;
        debug!(rule = %rule.name(), path = %path.display(), "Rule saved");
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<()> {
        let path = self.path_for(name);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CryostatError::Persistence(format!("cannot delete {}: {}", path.display(), e)).into()),
        }
    }
}

/// In-memory rule set backed by a [`RuleStorage`]
pub struct RuleRegistry {
    storage: Arc<dyn RuleStorage>,
    evaluator: Arc<MatchExpressionEvaluator>,
    validator: MatchExpressionValidator,
    rules: RwLock<Vec<Rule>>,
    listeners: Listeners<RuleEvent>,
}

impl RuleRegistry {
    /// Creates an empty registry; call [`RuleRegistry::load_rules`] to fill it
    pub fn new(storage: Arc<dyn RuleStorage>, evaluator: Arc<MatchExpressionEvaluator>) -> Self {
        Self {
            storage,
            evaluator,
            validator: MatchExpressionValidator::new(),
            rules: RwLock::new(Vec::new()),
            listeners: Listeners::new(),
        }
    }

    /// Replaces the in-memory set with the stored rules
    pub fn load_rules(&self) -> Result<()> {
        let loaded = self.storage.load_all()?;
        info!(count = loaded.len(), "Rules loaded");
        *self.rules.write().unwrap_or_else(PoisonError::into_inner) = loaded;
        Ok(())
    }

    /// The evaluator used to match rules against targets
    pub fn evaluator(&self) -> &Arc<MatchExpressionEvaluator> {
        &self.evaluator
    }

    /// Registers and persists a rule
    ///
    /// Archiver rules are exempt from name uniqueness and never persisted.
    ///
    /// # Errors
    ///
    /// Returns `CryostatError::IllegalExpression` for an unsafe match
    /// expression, `CryostatError::DuplicateRule` on a name collision, or the
    /// storage error. The registry is unchanged on error.
    pub fn add_rule(&self, rule: Rule) -> Result<Rule> {
        self.validator.validate(rule.match_expression())?;
        {
            let mut rules = self.rules.write().unwrap_or_else(PoisonError::into_inner);
            if !rule.is_archiver() {
                if rules.iter().any(|r| !r.is_archiver() && r.name() == rule.name()) {
                    return Err(CryostatError::DuplicateRule(rule.name().to_string()).into());
                }
                self.storage.save(&rule)?;
            }
            rules.push(rule.clone());
        }
        info!(rule = %rule.name(), expression = %rule.match_expression(), "Rule added");
        self.emit(RuleEventKind::Added, &rule);
        Ok(rule)
    }

    /// Enables or disables a rule, persisting the change
    pub fn enable(&self, name: &str, enabled: bool) -> Result<Rule> {
        let updated = {
            let mut rules = self.rules.write().unwrap_or_else(PoisonError::into_inner);
            let slot = rules
                .iter_mut()
                .find(|r| r.name() == name)
                .ok_or_else(|| CryostatError::InvalidRule(format!("no rule named '{}'", name)))?;
            if slot.is_enabled() == enabled {
                debug!(rule = %name, enabled, "Rule already in requested state");
                return Ok(slot.clone());
            }
            let updated = slot.with_enabled(enabled);
            if !updated.is_archiver() {
                self.storage.save(&updated)?;
            }
            *slot = updated.clone();
            updated
        };
        info!(rule = %name, enabled, "Rule updated");
        self.emit(RuleEventKind::Updated, &updated);
        Ok(updated)
    }

    /// Deletes every rule with the given name
    ///
    /// The in-memory entry is removed and REMOVED fired even when storage
    /// fails; the storage error is still returned.
    pub fn delete(&self, name: &str) -> Result<Vec<Rule>> {
        let removed: Vec<Rule> = {
            let mut rules = self.rules.write().unwrap_or_else(PoisonError::into_inner);
            let (removed, kept): (Vec<Rule>, Vec<Rule>) = rules.drain(..).partition(|r| r.name() == name);
            *rules = kept;
            removed
        };
        let stored = if removed.iter().any(|r| !r.is_archiver()) {
            self.storage.delete(name)
        } else {
            Ok(())
        };
        for rule in &removed {
            self.removed(rule);
        }
        stored.map(|_| removed)
    }

    /// Deletes one specific rule
    pub fn delete_rule(&self, rule: &Rule) -> Result<bool> {
        let found = {
            let mut rules = self.rules.write().unwrap_or_else(PoisonError::into_inner);
            match rules.iter().position(|r| r == rule) {
                Some(index) => {
                    rules.remove(index);
                    true
                }
                None => false,
            }
        };
        if !found {
            return Ok(false);
        }
        let stored = if rule.is_archiver() {
            Ok(())
        } else {
            self.storage.delete(rule.name())
        };
        self.removed(rule);
        stored.map(|_| true)
    }

    /// Whether a rule with the name is registered
    pub fn has_rule(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// The rule with the given name
    pub fn get(&self, name: &str) -> Option<Rule> {
        self.rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|r| r.name() == name)
            .cloned()
    }

    /// Every registered rule
    pub fn get_rules(&self) -> Vec<Rule> {
        self.rules.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Rules whose expression holds for `target`
    ///
    /// Targets without an alias never match.
    pub fn get_rules_for(&self, target: &ServiceRef) -> Vec<Rule> {
        if target.alias.is_none() {
            return Vec::new();
        }
        self.get_rules()
            .into_iter()
            .filter(|rule| self.applies(rule, target))
            .collect()
    }

    /// Whether a rule's expression holds for `target`
    ///
    /// A rule whose expression fails at evaluation time is deleted.
    pub fn applies(&self, rule: &Rule, target: &ServiceRef) -> bool {
        match self.evaluator.applies(rule.match_expression(), target) {
            Ok(result) => result,
            Err(e) if is_evaluation_error(&e) => {
                warn!(rule = %rule.name(), target = %target, error = %e, "Deleting rule with failing match expression");
                if let Err(e) = self.delete_rule(rule) {
                    warn!(rule = %rule.name(), error = %e, "Failed to delete broken rule");
                }
                false
            }
            Err(e) => {
                warn!(rule = %rule.name(), target = %target, error = %e, "Match expression rejected");
                false
            }
        }
    }

    /// Registers a listener for rule events
    pub fn add_listener(&self, listener: Listener<RuleEvent>) -> ListenerId {
        self.listeners.add(listener)
    }

    /// Unregisters a listener
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    fn removed(&self, rule: &Rule) {
        self.evaluator.invalidate(rule.match_expression());
        info!(rule = %rule.name(), "Rule removed");
        self.emit(RuleEventKind::Removed, rule);
    }

    fn emit(&self, kind: RuleEventKind, rule: &Rule) {
        self.listeners.emit(&RuleEvent {
            kind,
            rule: rule.clone(),
        });
    }
}
