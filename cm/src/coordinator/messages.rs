//! Tasks posted to the coordinator worker

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::domain::{CapabilityIdentity, CapabilityState, Context, RequestToken, StateRefreshPolicy};
use crate::error::ContextResult;
use crate::store::BindingKind;
use crate::traits::{ContextRequester, StateProvider};

/// Work items executed one at a time, in post order, by the worker
pub(crate) enum Task {
    Register {
        identity: CapabilityIdentity,
        provider: Arc<dyn StateProvider>,
        kind: BindingKind,
        reply: oneshot::Sender<ContextResult<()>>,
    },

    Unregister {
        identity: CapabilityIdentity,
        reply: oneshot::Sender<ContextResult<()>>,
    },

    /// Legacy push, optionally answering a specific request
    SetState {
        identity: CapabilityIdentity,
        payload: String,
        refresh_policy: StateRefreshPolicy,
        token: Option<RequestToken>,
        reply: oneshot::Sender<ContextResult<()>>,
    },

    PushState {
        identity: CapabilityIdentity,
        state: CapabilityState,
        reply: oneshot::Sender<ContextResult<()>>,
    },

    /// Cache update for a proactive state change (no token bookkeeping)
    ReportStateChange {
        identity: CapabilityIdentity,
        state: CapabilityState,
    },

    GetContext {
        token: RequestToken,
        requester: Arc<dyn ContextRequester>,
        endpoint_id: String,
        timeout: Duration,
    },

    StateResponse {
        identity: CapabilityIdentity,
        state: CapabilityState,
        token: RequestToken,
    },

    StateUnavailable {
        identity: CapabilityIdentity,
        token: RequestToken,
        endpoint_unreachable: bool,
    },

    /// Posted by the timer; `generation` guards against firing into a later request
    Timeout { token: RequestToken, generation: u64 },

    ReadContext {
        endpoint_id: String,
        reply: oneshot::Sender<ContextResult<Context>>,
    },

    GetMetrics {
        reply: oneshot::Sender<CoordinatorMetrics>,
    },

    Shutdown { reply: Option<oneshot::Sender<()>> },
}

impl Task {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Task::Register { .. } => "register",
            Task::Unregister { .. } => "unregister",
            Task::SetState { .. } => "set_state",
            Task::PushState { .. } => "push_state",
            Task::ReportStateChange { .. } => "report_state_change",
            Task::GetContext { .. } => "get_context",
            Task::StateResponse { .. } => "state_response",
            Task::StateUnavailable { .. } => "state_unavailable",
            Task::Timeout { .. } => "timeout",
            Task::ReadContext { .. } => "read_context",
            Task::GetMetrics { .. } => "get_metrics",
            Task::Shutdown { .. } => "shutdown",
        }
    }
}

/// Coordinator metrics for observability
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoordinatorMetrics {
    pub registered_capabilities: usize,
    pub pending_requests: usize,
    pub requests_completed: u64,
    pub requests_failed: u64,
    pub timeouts: u64,
    /// Responses for tokens that were not in flight
    pub stale_responses: u64,
    pub tasks_processed: u64,
}
