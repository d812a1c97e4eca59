//! Push-based state compatibility
//!
//! Older capabilities push their state together with a refresh policy instead
//! of being polled. A binding registered that way can move between `Always`
//! and `Sometimes`, but never into or out of `Never`, and a polled binding
//! never accepts a legacy push.

use tracing::{debug, warn};

use super::binding::{BindingKind, StateBinding};
use crate::domain::{CapabilityIdentity, CapabilityState, StateRefreshPolicy};
use crate::error::{ContextError, ContextResult};

/// Check that `requested` is a valid policy for a legacy push onto `binding`
pub(crate) fn check_policy_change(
    identity: &CapabilityIdentity,
    binding: &StateBinding,
    requested: StateRefreshPolicy,
) -> ContextResult<()> {
    let compatible = match binding.kind.refresh_policy() {
        None => false,
        Some(current) => {
            current == requested || (current != StateRefreshPolicy::Never && requested != StateRefreshPolicy::Never)
        }
    };

    if compatible {
        Ok(())
    } else {
        warn!(%identity, from = %binding.kind, to = %requested, "Rejected legacy refresh policy change");
        Err(ContextError::InvalidPolicyChange {
            identity: identity.clone(),
            from: binding.kind.to_string(),
            to: requested,
        })
    }
}

/// Apply a validated legacy push to `binding`
///
/// An empty payload means the provider has nothing to report: the cached
/// state is cleared so the capability drops out of aggregation.
pub(crate) fn apply_push(binding: &mut StateBinding, payload: &str, refresh_policy: StateRefreshPolicy) {
    binding.kind = BindingKind::legacy(refresh_policy);
    if payload.is_empty() {
        debug!(%refresh_policy, "apply_push: empty payload clears cached state");
        binding.state = None;
        binding.fresh = false;
    } else {
        binding.state = Some(CapabilityState::new(payload));
        binding.fresh = true;
    }
}
