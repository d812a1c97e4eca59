//! Contracts for the parties that talk to the context manager

use crate::domain::{CapabilityIdentity, CapabilityState, Context, RequestToken, StateChangeCause};
use crate::error::ContextRequestError;

/// Owner of a capability's state
///
/// For every `provide_state` call the provider must eventually answer exactly
/// once, either with
/// [`provide_state_response`](crate::ContextManager::provide_state_response) or
/// [`provide_state_unavailable_response`](crate::ContextManager::provide_state_unavailable_response)
/// (legacy providers may answer with [`set_state`](crate::ContextManager::set_state)
/// carrying the token). Calls arrive on a runtime task, never on the
/// coordinator's worker, so answering synchronously is fine.
pub trait StateProvider: Send + Sync {
    /// Produce fresh state for `identity` as part of request `token`
    fn provide_state(&self, identity: &CapabilityIdentity, token: RequestToken);

    /// Whether this provider can be polled at all
    fn can_state_be_retrieved(&self) -> bool {
        true
    }
}

/// Party waiting for an aggregated context
///
/// Exactly one of the two callbacks is invoked, exactly once, per token.
pub trait ContextRequester: Send + Sync {
    fn on_context_available(&self, token: RequestToken, endpoint_id: &str, context: Context);

    fn on_context_failure(&self, token: RequestToken, error: ContextRequestError);
}

/// Receives proactive state changes
pub trait ContextObserver: Send + Sync {
    fn on_state_changed(&self, identity: &CapabilityIdentity, state: &CapabilityState, cause: StateChangeCause);
}
