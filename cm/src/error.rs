//! Error types

use thiserror::Error;

use crate::domain::{CapabilityIdentity, RequestToken, StateRefreshPolicy};

/// Errors returned synchronously by the [`ContextManager`](crate::ContextManager) API
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("Capability not registered: {0}")]
    InvalidCapability(CapabilityIdentity),

    #[error("Refresh policy of {identity} cannot change from {from} to {to}")]
    InvalidPolicyChange {
        identity: CapabilityIdentity,
        from: String,
        to: StateRefreshPolicy,
    },

    #[error("State request token {0} is not in flight")]
    StateTokenOutdated(RequestToken),

    #[error("Context manager is shutting down")]
    ShuttingDown,
}

/// Response from synchronous context manager operations
pub type ContextResult<T> = Result<T, ContextError>;

/// Why a context request failed; delivered to the requester, never returned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ContextRequestError {
    #[error("Context request timed out")]
    Timeout,

    #[error("Endpoint unreachable")]
    EndpointUnreachable,

    #[error("Context request cancelled")]
    Cancelled,
}
