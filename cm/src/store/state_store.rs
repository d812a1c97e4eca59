//! CapabilityStateStore - per-endpoint capability bindings and cached state
//!
//! The store is plain data with no locking of its own. The coordinator worker
//! owns it and is the only code that mutates it.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use tracing::debug;

use super::binding::{BindingKind, StateBinding};
use super::legacy;
use crate::domain::{CapabilityIdentity, CapabilityState, Context, StateRefreshPolicy};
use crate::error::{ContextError, ContextResult};
use crate::traits::StateProvider;

/// A capability that must be polled for a request
pub struct PollTarget {
    pub identity: CapabilityIdentity,
    pub provider: Arc<dyn StateProvider>,
}

/// Bindings partitioned by endpoint id
///
/// Identities handed to the store must already carry a resolved endpoint id.
#[derive(Debug, Default)]
pub struct CapabilityStateStore {
    endpoints: HashMap<String, BTreeMap<CapabilityIdentity, StateBinding>>,
}

impl CapabilityStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the binding for `identity`
    ///
    /// The cached state survives a replacement only when the binding kind is
    /// unchanged. Returns whether a binding was replaced.
    pub fn register(&mut self, identity: CapabilityIdentity, provider: Arc<dyn StateProvider>, kind: BindingKind) -> bool {
        debug!(%identity, %kind, "CapabilityStateStore::register: called");
        let bindings = self.endpoints.entry(identity.endpoint_id.clone()).or_default();

        let mut binding = StateBinding::new(provider, kind);
        let previous = bindings.remove(&identity);
        if let Some(prev) = &previous
            && prev.kind == kind
        {
            binding.state = prev.state.clone();
            binding.fresh = prev.fresh;
        }

        bindings.insert(identity, binding);
        previous.is_some()
    }

    /// Remove the binding for `identity`
    pub fn unregister(&mut self, identity: &CapabilityIdentity) -> ContextResult<StateBinding> {
        debug!(%identity, "CapabilityStateStore::unregister: called");
        let bindings = self
            .endpoints
            .get_mut(&identity.endpoint_id)
            .ok_or_else(|| ContextError::InvalidCapability(identity.clone()))?;

        let removed = bindings
            .remove(identity)
            .ok_or_else(|| ContextError::InvalidCapability(identity.clone()))?;

        if bindings.is_empty() {
            self.endpoints.remove(&identity.endpoint_id);
        }
        Ok(removed)
    }

    pub fn get(&self, identity: &CapabilityIdentity) -> Option<&StateBinding> {
        self.endpoints.get(&identity.endpoint_id)?.get(identity)
    }

    fn get_mut(&mut self, identity: &CapabilityIdentity) -> ContextResult<&mut StateBinding> {
        self.endpoints
            .get_mut(&identity.endpoint_id)
            .and_then(|bindings| bindings.get_mut(identity))
            .ok_or_else(|| ContextError::InvalidCapability(identity.clone()))
    }

    pub fn contains(&self, identity: &CapabilityIdentity) -> bool {
        self.get(identity).is_some()
    }

    /// Legacy write path with refresh policy validation
    pub fn push_legacy(
        &mut self,
        identity: &CapabilityIdentity,
        payload: &str,
        refresh_policy: StateRefreshPolicy,
    ) -> ContextResult<()> {
        debug!(%identity, %refresh_policy, "CapabilityStateStore::push_legacy: called");
        let binding = self.get_mut(identity)?;
        legacy::check_policy_change(identity, binding, refresh_policy)?;
        legacy::apply_push(binding, payload, refresh_policy);
        Ok(())
    }

    /// Modern unconditional write path
    pub fn push(&mut self, identity: &CapabilityIdentity, state: CapabilityState) -> ContextResult<()> {
        debug!(%identity, "CapabilityStateStore::push: called");
        let binding = self.get_mut(identity)?;
        binding.state = Some(state);
        binding.fresh = true;
        Ok(())
    }

    /// Cached context for `endpoint`
    ///
    /// `Pull` and `Always` bindings with a cached state are included, as are
    /// `Sometimes` bindings refreshed since they were last polled.
    pub fn read(&self, endpoint: &str) -> Context {
        self.bindings(endpoint)
            .filter_map(|(identity, binding)| {
                binding
                    .aggregated_state(binding.fresh)
                    .map(|state| (identity.clone(), state.clone()))
            })
            .collect()
    }

    /// Context for one request
    ///
    /// Like [`read`](Self::read), but `Sometimes` freshness comes from the
    /// request's `refreshed` set and `unavailable` identities are dropped.
    pub fn aggregate(
        &self,
        endpoint: &str,
        refreshed: &HashSet<CapabilityIdentity>,
        unavailable: &HashSet<CapabilityIdentity>,
    ) -> Context {
        self.bindings(endpoint)
            .filter(|(identity, _)| !unavailable.contains(*identity))
            .filter_map(|(identity, binding)| {
                binding
                    .aggregated_state(refreshed.contains(identity))
                    .map(|state| (identity.clone(), state.clone()))
            })
            .collect()
    }

    /// Capabilities on `endpoint` that must be polled for a new request
    ///
    /// Polled `Sometimes` bindings are marked stale until they are refreshed.
    pub fn scatter_set(&mut self, endpoint: &str) -> Vec<PollTarget> {
        let Some(bindings) = self.endpoints.get_mut(endpoint) else {
            return Vec::new();
        };

        bindings
            .iter_mut()
            .filter(|(_, binding)| binding.needs_poll())
            .map(|(identity, binding)| {
                if binding.kind == BindingKind::legacy(StateRefreshPolicy::Sometimes) {
                    binding.fresh = false;
                }
                PollTarget {
                    identity: identity.clone(),
                    provider: Arc::clone(&binding.provider),
                }
            })
            .collect()
    }

    fn bindings(&self, endpoint: &str) -> impl Iterator<Item = (&CapabilityIdentity, &StateBinding)> {
        self.endpoints.get(endpoint).into_iter().flat_map(|bindings| bindings.iter())
    }

    /// Total number of bindings across all endpoints
    pub fn len(&self) -> usize {
        self.endpoints.values().map(|bindings| bindings.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}
