//! ContextManager - scatter/gather aggregation of capability state
//!
//! Capabilities (device features, sensors) report their state through
//! providers. On request, the context manager polls every provider that must
//! be refreshed for an endpoint, waits for their answers within a deadline and
//! delivers one consistent snapshot, the *context*, to the requester.
//!
//! # Core Concepts
//!
//! - **Exactly-once delivery**: every token gets one context or one typed failure
//! - **Single writer**: all bookkeeping runs on one worker task, in post order
//! - **Legacy push**: older capabilities push state with a refresh policy
//!   instead of being polled
//! - **Observers**: proactive state changes fan out independently of requests
//!
//! # Modules
//!
//! - [`coordinator`] - the [`ContextManager`] handle and its worker
//! - [`store`] - capability bindings and cached state per endpoint
//! - [`domain`] - identities, states, tokens
//! - [`observer`] - state change fan-out
//! - [`timer`] - timeout scheduling contract and tokio implementation
//! - [`config`] - configuration types and loading

pub mod config;
pub mod coordinator;
pub mod domain;
pub mod error;
pub mod observer;
pub mod store;
pub mod timer;
pub mod traits;

pub use config::ContextManagerConfig;
pub use coordinator::{ContextManager, CoordinatorMetrics};
pub use domain::{
    CapabilityIdentity, CapabilityState, Context, NO_TOKEN, RequestToken, StateChangeCause, StateRefreshPolicy,
    TokenAllocator,
};
pub use error::{ContextError, ContextRequestError, ContextResult};
pub use observer::ObserverHub;
pub use store::{BindingKind, CapabilityStateStore, StateBinding};
pub use timer::{TimeoutScheduler, TimerHandle, TokioTimer};
pub use traits::{ContextObserver, ContextRequester, StateProvider};
