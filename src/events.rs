//! Synchronous listener fan-out
//!
//! [`Listeners`] is the small observer helper every event source composes:
//! discovery backends, the rule registry and the credential store.
//! Dispatch happens on the caller's thread. Listeners that need to block
//! must hand work off to a worker pool themselves.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// Handle returned on registration, used to unregister
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// A registered callback
pub type Listener<E> = Arc<dyn Fn(&E) + Send + Sync + 'static>;

/// A set of listeners for events of type `E`
///
/// Registration and removal may race with [`Listeners::emit`]. An emit takes
/// a snapshot of the current set, so a listener registered during delivery
/// of one event sees every later event but not necessarily that one.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use cryostat::events::Listeners;
///
/// let listeners: Listeners<u32> = Listeners::new();
/// let seen = Arc::new(AtomicUsize::new(0));
/// let counter = seen.clone();
/// let id = listeners.add(Arc::new(move |n: &u32| {
///     counter.fetch_add(*n as usize, Ordering::SeqCst);
/// }));
/// listeners.emit(&2);
/// assert!(listeners.remove(id));
/// listeners.emit(&5);
/// assert_eq!(seen.load(Ordering::SeqCst), 2);
/// ```
pub struct Listeners<E> {
    next_id: AtomicU64,
    entries: RwLock<Vec<(ListenerId, Listener<E>)>>,
}

impl<E> Listeners<E> {
    /// Creates an empty listener set
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Registers a listener
    pub fn add(&self, listener: Listener<E>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));
        id
    }

    /// Unregisters a listener, returning whether it was present
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|(existing, _)| *existing != id);
        entries.len() != before
    }

    /// Delivers an event to every listener registered at call time
    pub fn emit(&self, event: &E) {
        let snapshot: Vec<Listener<E>> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in snapshot {
            listener(event);
        }
    }

    /// Number of registered listeners
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether no listener is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E> Default for Listeners<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> std::fmt::Debug for Listeners<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listeners")
            .field("count", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_listener_added_during_emit_sees_later_events_only() {
        let listeners: Arc<Listeners<u32>> = Arc::new(Listeners::new());
        let late_seen = Arc::new(Mutex::new(Vec::new()));

        let registrar = listeners.clone();
        let late = late_seen.clone();
        listeners.add(Arc::new(move |n: &u32| {
            if *n == 1 {
                let late = late.clone();
                registrar.add(Arc::new(move |m: &u32| late.lock().unwrap().push(*m)));
            }
        }));

        listeners.emit(&1);
        listeners.emit(&2);
        assert_eq!(*late_seen.lock().unwrap(), vec![2]);
    }

    #[test]
    fn test_remove_unknown_listener() {
        let listeners: Listeners<()> = Listeners::new();
        let id = listeners.add(Arc::new(|_| {}));
        assert!(listeners.remove(id));
        assert!(!listeners.remove(id));
        assert!(listeners.is_empty());
    }
}
