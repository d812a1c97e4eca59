//! Bookkeeping for one in-flight context request

use std::collections::HashSet;
use std::sync::Arc;

use crate::domain::CapabilityIdentity;
use crate::timer::TimerHandle;
use crate::traits::ContextRequester;

/// An open request waiting for provider responses
pub(crate) struct PendingRequest {
    pub requester: Arc<dyn ContextRequester>,
    pub endpoint_id: String,
    /// Capabilities polled and not yet answered
    pub pending: HashSet<CapabilityIdentity>,
    /// Answered with fresh state for this request
    pub refreshed: HashSet<CapabilityIdentity>,
    /// Answered as unavailable; dropped from the result
    pub unavailable: HashSet<CapabilityIdentity>,
    pub timer: Option<TimerHandle>,
    pub generation: u64,
}

impl PendingRequest {
    pub fn new(
        requester: Arc<dyn ContextRequester>,
        endpoint_id: String,
        pending: HashSet<CapabilityIdentity>,
        generation: u64,
    ) -> Self {
        Self {
            requester,
            endpoint_id,
            pending,
            refreshed: HashSet::new(),
            unavailable: HashSet::new(),
            timer: None,
            generation,
        }
    }

    /// Record fresh state for `identity`; false if it was not awaited
    pub fn resolve(&mut self, identity: &CapabilityIdentity) -> bool {
        if self.pending.remove(identity) {
            self.refreshed.insert(identity.clone());
            true
        } else {
            false
        }
    }

    /// Record that `identity` has no state for this request; false if it was not awaited
    pub fn resolve_unavailable(&mut self, identity: &CapabilityIdentity) -> bool {
        if self.pending.remove(identity) {
            self.unavailable.insert(identity.clone());
            true
        } else {
            false
        }
    }

    pub fn awaits(&self, identity: &CapabilityIdentity) -> bool {
        self.pending.contains(identity)
    }

    pub fn is_complete(&self) -> bool {
        self.pending.is_empty()
    }
}
