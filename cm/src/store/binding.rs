//! Per-capability provider binding

use std::fmt;
use std::sync::Arc;

use crate::domain::{CapabilityState, StateRefreshPolicy};
use crate::traits::StateProvider;

/// How a capability delivers its state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingKind {
    /// Provider pushes state itself; the refresh policy decides aggregation
    LegacyPush { refresh_policy: StateRefreshPolicy },
    /// Provider is asked for fresh state on every request
    Pull,
}

impl BindingKind {
    pub fn legacy(refresh_policy: StateRefreshPolicy) -> Self {
        BindingKind::LegacyPush { refresh_policy }
    }

    /// Refresh policy of a legacy binding; `None` for polled ones
    pub fn refresh_policy(&self) -> Option<StateRefreshPolicy> {
        match self {
            BindingKind::LegacyPush { refresh_policy } => Some(*refresh_policy),
            BindingKind::Pull => None,
        }
    }
}

impl fmt::Display for BindingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindingKind::LegacyPush { refresh_policy } => write!(f, "{}", refresh_policy),
            BindingKind::Pull => f.write_str("pull"),
        }
    }
}

/// Provider reference plus the last state it reported
#[derive(Clone)]
pub struct StateBinding {
    pub provider: Arc<dyn StateProvider>,
    pub state: Option<CapabilityState>,
    pub kind: BindingKind,
    /// Refreshed since the last scatter that polled it (`Sometimes` only)
    pub fresh: bool,
}

impl StateBinding {
    pub fn new(provider: Arc<dyn StateProvider>, kind: BindingKind) -> Self {
        Self {
            provider,
            state: None,
            kind,
            fresh: false,
        }
    }

    /// Whether a scatter round should ask the provider for state
    pub fn needs_poll(&self) -> bool {
        match self.kind {
            BindingKind::Pull => self.provider.can_state_be_retrieved(),
            BindingKind::LegacyPush { refresh_policy } => refresh_policy == StateRefreshPolicy::Sometimes,
        }
    }

    /// Cached state to aggregate, if the binding's policy allows it
    ///
    /// `refreshed` reports whether a `Sometimes` binding was refreshed for the
    /// aggregation being built.
    pub fn aggregated_state(&self, refreshed: bool) -> Option<&CapabilityState> {
        let state = self.state.as_ref()?;
        match self.kind {
            BindingKind::Pull => Some(state),
            BindingKind::LegacyPush { refresh_policy } => match refresh_policy {
                StateRefreshPolicy::Always => Some(state),
                StateRefreshPolicy::Sometimes if refreshed => Some(state),
                StateRefreshPolicy::Sometimes | StateRefreshPolicy::Never => None,
            },
        }
    }
}

impl fmt::Debug for StateBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateBinding")
            .field("state", &self.state)
            .field("kind", &self.kind)
            .field("fresh", &self.fresh)
            .finish_non_exhaustive()
    }
}
