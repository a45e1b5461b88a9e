//! Stored target credentials
//!
//! Credentials are scoped by a match expression: a target uses the first
//! stored credential whose expression holds for it. Stores announce every
//! addition and removal so the rule processor can retry targets that were
//! previously unreachable.

use crate::error::Result;
use crate::events::{Listener, ListenerId, Listeners};
use crate::rules::expression::{MatchExpressionEvaluator, MatchExpressionValidator};
use crate::rules::MatchExpression;
use crate::session::Credentials;
use crate::target::ServiceRef;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{info, warn};

/// What happened to a stored credential
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CredentialEventKind {
    /// Credential stored
    Added,
    /// Credential deleted
    Removed,
}

/// Change notification carrying the credential's match expression text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialEvent {
    /// Kind of change
    pub kind: CredentialEventKind,
    /// Match expression scoping the credential
    pub match_expression: String,
}

/// A credential together with the expression selecting its targets
#[derive(Debug, Clone)]
pub struct StoredCredentials {
    /// Expression selecting the targets this credential applies to
    pub match_expression: MatchExpression,
    /// The secret
    pub credentials: Credentials,
}

/// Source of target credentials
pub trait CredentialStore: Send + Sync {
    /// Credentials for a target, if any stored expression applies
    fn get_credentials(&self, target: &ServiceRef) -> Result<Option<Credentials>>;

    /// Registers a listener for additions and removals
    fn add_listener(&self, listener: Listener<CredentialEvent>) -> ListenerId;

    /// Unregisters a listener
    fn remove_listener(&self, id: ListenerId) -> bool;
}

/// Credential store kept in memory
pub struct InMemoryCredentialStore {
    evaluator: Arc<MatchExpressionEvaluator>,
    entries: RwLock<Vec<StoredCredentials>>,
    next_id: AtomicI64,
    listeners: Listeners<CredentialEvent>,
}

impl InMemoryCredentialStore {
    /// Creates an empty store matching through `evaluator`
    pub fn new(evaluator: Arc<MatchExpressionEvaluator>) -> Self {
        Self {
            evaluator,
            entries: RwLock::new(Vec::new()),
            next_id: AtomicI64::new(1),
            listeners: Listeners::new(),
        }
    }

    /// Stores a credential, returning its id
    ///
    /// # Errors
    ///
    /// Returns `CryostatError::IllegalExpression` when the expression fails
    /// validation.
    pub fn add(&self, expression: &str, credentials: Credentials) -> Result<i64> {
        MatchExpressionValidator::new().validate(expression)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(StoredCredentials {
                match_expression: MatchExpression::new(id, expression),
                credentials,
            });
        info!(id, expression, "Credentials stored");
        self.listeners.emit(&CredentialEvent {
            kind: CredentialEventKind::Added,
            match_expression: expression.to_string(),
        });
        Ok(id)
    }

    /// Deletes a credential by id
    pub fn remove(&self, id: i64) -> Option<StoredCredentials> {
        let removed = {
            let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            let index = entries.iter().position(|e| e.match_expression.id == id)?;
            entries.remove(index)
        };
        let text = removed.match_expression.text.clone();
        self.evaluator.invalidate(&text);
        info!(id, expression = %text, "Credentials removed");
        self.listeners.emit(&CredentialEvent {
            kind: CredentialEventKind::Removed,
            match_expression: text,
        });
        Some(removed)
    }

    /// Stored match expressions, in insertion order
    pub fn match_expressions(&self) -> Vec<MatchExpression> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|e| e.match_expression.clone())
            .collect()
    }
}

impl CredentialStore for InMemoryCredentialStore {
    fn get_credentials(&self, target: &ServiceRef) -> Result<Option<Credentials>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner).clone();
        for entry in entries {
            match self.evaluator.applies(&entry.match_expression.text, target) {
                Ok(true) => return Ok(Some(entry.credentials)),
                Ok(false) => {}
                Err(e) => warn!(
                    id = entry.match_expression.id,
                    target = %target,
                    error = %e,
                    "Credential match expression failed"
                ),
            }
        }
        Ok(None)
    }

    fn add_listener(&self, listener: Listener<CredentialEvent>) -> ListenerId {
        self.listeners.add(listener)
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn store() -> InMemoryCredentialStore {
        InMemoryCredentialStore::new(Arc::new(MatchExpressionEvaluator::default()))
    }

    #[test]
    fn test_first_matching_credential_wins() {
        let store = store();
        store
            .add("target.alias == 'a'", Credentials::new("alice", "pw1"))
            .unwrap();
        store.add("true", Credentials::new("fallback", "pw2")).unwrap();

        let a = ServiceRef::new("uri-a").with_alias("a");
        let b = ServiceRef::new("uri-b").with_alias("b");
        assert_eq!(store.get_credentials(&a).unwrap().unwrap().username, "alice");
        assert_eq!(store.get_credentials(&b).unwrap().unwrap().username, "fallback");
    }

    #[test]
    fn test_illegal_expression_rejected() {
        let store = store();
        assert!(store.add("System.exit(1)", Credentials::new("u", "p")).is_err());
        assert!(store.match_expressions().is_empty());
    }

    #[test]
    fn test_events_and_cache_invalidation() {
        let evaluator = Arc::new(MatchExpressionEvaluator::default());
        let store = InMemoryCredentialStore::new(evaluator.clone());
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        store.add_listener(Arc::new(move |e: &CredentialEvent| {
            sink.lock().unwrap().push(e.clone());
        }));

        let id = store.add("target.alias == 'a'", Credentials::new("u", "p")).unwrap();
        store.get_credentials(&ServiceRef::new("x").with_alias("a")).unwrap();
        store.get_credentials(&ServiceRef::new("y").with_alias("b")).unwrap();
        assert_eq!(evaluator.cached_entries(), 2);

        assert!(store.remove(id).is_some());
        assert!(store.remove(id).is_none());
        assert_eq!(evaluator.cached_entries(), 0);

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, CredentialEventKind::Added);
        assert_eq!(events[1].kind, CredentialEventKind::Removed);
        assert_eq!(events[1].match_expression, "target.alias == 'a'");
    }
}
