//! Fan-out of capability state changes

use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use crate::domain::{CapabilityIdentity, CapabilityState, StateChangeCause};
use crate::traits::ContextObserver;

/// Registered observers, guarded by their own lock
///
/// Notification iterates over a snapshot taken under the lock, so observers
/// added or removed while a notification is running only see the change on
/// the next one.
#[derive(Default)]
pub struct ObserverHub {
    observers: Mutex<Vec<Arc<dyn ContextObserver>>>,
}

impl ObserverHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an observer. Adding the same observer twice is a no-op.
    pub fn add_observer(&self, observer: Arc<dyn ContextObserver>) {
        let mut observers = self.observers.lock().unwrap_or_else(PoisonError::into_inner);
        if observers.iter().any(|o| Arc::ptr_eq(o, &observer)) {
            debug!("ObserverHub::add_observer: already registered");
            return;
        }
        observers.push(observer);
        debug!(count = observers.len(), "ObserverHub::add_observer: added");
    }

    /// Remove an observer; returns whether it was registered
    pub fn remove_observer(&self, observer: &Arc<dyn ContextObserver>) -> bool {
        let mut observers = self.observers.lock().unwrap_or_else(PoisonError::into_inner);
        let before = observers.len();
        observers.retain(|o| !Arc::ptr_eq(o, observer));
        before != observers.len()
    }

    pub fn len(&self) -> usize {
        self.observers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver a change to every observer in registration order
    pub fn notify(&self, identity: &CapabilityIdentity, state: &CapabilityState, cause: StateChangeCause) {
        let snapshot: Vec<Arc<dyn ContextObserver>> =
            self.observers.lock().unwrap_or_else(PoisonError::into_inner).clone();
        debug!(%identity, ?cause, observers = snapshot.len(), "ObserverHub::notify: called");

        for observer in snapshot {
            observer.on_state_changed(identity, state, cause);
        }
    }
}
