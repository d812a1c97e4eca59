//! ContextManager - client interface for providers, requesters and observers

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use super::core::Worker;
use super::messages::{CoordinatorMetrics, Task};
use crate::config::ContextManagerConfig;
use crate::domain::{
    CapabilityIdentity, CapabilityState, Context, NO_TOKEN, RequestToken, StateChangeCause, StateRefreshPolicy,
    TokenAllocator,
};
use crate::error::{ContextError, ContextResult};
use crate::observer::ObserverHub;
use crate::store::BindingKind;
use crate::timer::{TimeoutScheduler, TokioTimer};
use crate::traits::{ContextObserver, ContextRequester, StateProvider};

struct Shared {
    tx: mpsc::UnboundedSender<Task>,
    tokens: Arc<Mutex<TokenAllocator>>,
    observers: ObserverHub,
    config: ContextManagerConfig,
    shutting_down: AtomicBool,
}

/// Handle to the context manager
///
/// Cloneable and usable from any thread. Calls that only post work
/// (`get_context`, provider responses, state change reports) never block;
/// calls that can fail synchronously are async and wait for the worker's
/// answer. Dropping the last handle shuts the manager down.
#[derive(Clone)]
pub struct ContextManager {
    shared: Arc<Shared>,
}

impl ContextManager {
    /// Spawn the worker with the default tokio-backed timer
    pub fn spawn(config: ContextManagerConfig) -> Self {
        Self::spawn_with_timer(config, Arc::new(TokioTimer::new()))
    }

    /// Spawn the worker with a custom timeout scheduler
    pub fn spawn_with_timer(config: ContextManagerConfig, timer: Arc<dyn TimeoutScheduler>) -> Self {
        debug!(default_endpoint_id = %config.default_endpoint_id, "ContextManager::spawn: called");
        let (tx, rx) = mpsc::unbounded_channel();
        let tokens = Arc::new(Mutex::new(TokenAllocator::new()));

        let worker = Worker::new(Arc::clone(&tokens), timer, tx.downgrade());
        tokio::spawn(worker.run(rx));

        info!("ContextManager spawned");
        Self {
            shared: Arc::new(Shared {
                tx,
                tokens,
                observers: ObserverHub::new(),
                config,
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &ContextManagerConfig {
        &self.shared.config
    }

    pub fn default_endpoint_id(&self) -> &str {
        &self.shared.config.default_endpoint_id
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.shutting_down.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn token_in_flight(&self, token: RequestToken) -> bool {
        self.shared
            .tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_live(token)
    }

    fn resolve(&self, identity: CapabilityIdentity) -> CapabilityIdentity {
        identity.resolved(self.default_endpoint_id())
    }

    fn resolve_endpoint(&self, endpoint_id: &str) -> String {
        if endpoint_id.is_empty() {
            self.default_endpoint_id().to_string()
        } else {
            endpoint_id.to_string()
        }
    }

    fn post(&self, task: Task) -> ContextResult<()> {
        if self.is_shutting_down() {
            return Err(ContextError::ShuttingDown);
        }
        self.shared.tx.send(task).map_err(|_| ContextError::ShuttingDown)
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<ContextResult<T>>) -> Task) -> ContextResult<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.post(make(reply_tx))?;
        reply_rx.await.map_err(|_| ContextError::ShuttingDown)?
    }

    // === Registration ===

    /// Insert or replace the binding for a capability
    pub async fn register(
        &self,
        identity: CapabilityIdentity,
        provider: Arc<dyn StateProvider>,
        kind: BindingKind,
    ) -> ContextResult<()> {
        let identity = self.resolve(identity);
        debug!(%identity, %kind, "ContextManager::register: called");
        self.request(|reply| Task::Register {
            identity,
            provider,
            kind,
            reply,
        })
        .await
    }

    /// Register a capability that is polled on every request
    pub async fn add_state_provider(
        &self,
        identity: CapabilityIdentity,
        provider: Arc<dyn StateProvider>,
    ) -> ContextResult<()> {
        self.register(identity, provider, BindingKind::Pull).await
    }

    /// Legacy registration: bind a push-based provider, or unbind with `None`
    pub async fn set_state_provider(
        &self,
        identity: CapabilityIdentity,
        provider: Option<Arc<dyn StateProvider>>,
    ) -> ContextResult<()> {
        match provider {
            Some(provider) => {
                self.register(identity, provider, BindingKind::legacy(StateRefreshPolicy::Always))
                    .await
            }
            None => self.unregister(identity).await,
        }
    }

    /// Remove a capability's binding
    ///
    /// Requests still waiting on it complete without it.
    pub async fn unregister(&self, identity: CapabilityIdentity) -> ContextResult<()> {
        let identity = self.resolve(identity);
        debug!(%identity, "ContextManager::unregister: called");
        self.request(|reply| Task::Unregister { identity, reply }).await
    }

    pub async fn remove_state_provider(&self, identity: CapabilityIdentity) -> ContextResult<()> {
        self.unregister(identity).await
    }

    // === State writes ===

    /// Legacy push with a refresh policy
    ///
    /// With a token, the push answers that request and fails with
    /// [`ContextError::StateTokenOutdated`] if it is no longer in flight.
    /// Without one (or with [`NO_TOKEN`]), it answers every request waiting
    /// on the capability.
    pub async fn set_state(
        &self,
        identity: CapabilityIdentity,
        payload: impl Into<String>,
        refresh_policy: StateRefreshPolicy,
        token: Option<RequestToken>,
    ) -> ContextResult<()> {
        let identity = self.resolve(identity);
        let token = token.filter(|token| *token != NO_TOKEN);
        debug!(%identity, %refresh_policy, ?token, "ContextManager::set_state: called");
        let payload = payload.into();
        self.request(|reply| Task::SetState {
            identity,
            payload,
            refresh_policy,
            token,
            reply,
        })
        .await
    }

    /// Modern push; answers every request waiting on the capability
    pub async fn push_state(&self, identity: CapabilityIdentity, state: CapabilityState) -> ContextResult<()> {
        let identity = self.resolve(identity);
        debug!(%identity, "ContextManager::push_state: called");
        self.request(|reply| Task::PushState { identity, state, reply }).await
    }

    /// Update the cache and notify observers of a proactive change
    ///
    /// Observers are called on this thread, in registration order.
    pub fn report_state_change(
        &self,
        identity: CapabilityIdentity,
        state: CapabilityState,
        cause: StateChangeCause,
    ) -> ContextResult<()> {
        let identity = self.resolve(identity);
        debug!(%identity, ?cause, "ContextManager::report_state_change: called");
        self.post(Task::ReportStateChange {
            identity: identity.clone(),
            state: state.clone(),
        })?;
        self.shared.observers.notify(&identity, &state, cause);
        Ok(())
    }

    // === Scatter/gather ===

    /// Request the context of `endpoint_id`; an empty id means the default endpoint
    ///
    /// Returns the token immediately. The outcome is always delivered later
    /// through exactly one of the requester's callbacks.
    pub fn get_context(
        &self,
        requester: Arc<dyn ContextRequester>,
        endpoint_id: &str,
        timeout: Duration,
    ) -> ContextResult<RequestToken> {
        if self.is_shutting_down() {
            return Err(ContextError::ShuttingDown);
        }

        let endpoint_id = self.resolve_endpoint(endpoint_id);
        let token = self
            .shared
            .tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .allocate();
        debug!(token, %endpoint_id, ?timeout, "ContextManager::get_context: called");

        let task = Task::GetContext {
            token,
            requester,
            endpoint_id,
            timeout,
        };
        if let Err(e) = self.post(task) {
            self.shared
                .tokens
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .release(token);
            return Err(e);
        }
        Ok(token)
    }

    /// Request the default endpoint's context with the configured timeout
    pub fn get_default_context(&self, requester: Arc<dyn ContextRequester>) -> ContextResult<RequestToken> {
        let timeout = self.config().default_timeout();
        self.get_context(requester, "", timeout)
    }

    /// Answer a pull with fresh state
    ///
    /// A token that is no longer in flight only refreshes the cache.
    pub fn provide_state_response(&self, identity: CapabilityIdentity, state: CapabilityState, token: RequestToken) {
        let identity = self.resolve(identity);
        debug!(%identity, token, "ContextManager::provide_state_response: called");
        if let Err(e) = self.post(Task::StateResponse { identity, state, token }) {
            debug!(token, error = %e, "Dropped state response");
        }
    }

    /// Answer a pull without state
    ///
    /// `is_endpoint_unreachable` fails the whole request immediately.
    pub fn provide_state_unavailable_response(
        &self,
        identity: CapabilityIdentity,
        token: RequestToken,
        is_endpoint_unreachable: bool,
    ) {
        let identity = self.resolve(identity);
        debug!(%identity, token, is_endpoint_unreachable, "ContextManager::provide_state_unavailable_response: called");
        let task = Task::StateUnavailable {
            identity,
            token,
            endpoint_unreachable: is_endpoint_unreachable,
        };
        if let Err(e) = self.post(task) {
            debug!(token, error = %e, "Dropped state unavailable response");
        }
    }

    // === Queries ===

    /// Cached context of an endpoint, without polling any provider
    pub async fn read_context(&self, endpoint_id: &str) -> ContextResult<Context> {
        let endpoint_id = self.resolve_endpoint(endpoint_id);
        self.request(|reply| Task::ReadContext { endpoint_id, reply }).await
    }

    pub async fn metrics(&self) -> ContextResult<CoordinatorMetrics> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.post(Task::GetMetrics { reply: reply_tx })?;
        reply_rx.await.map_err(|_| ContextError::ShuttingDown)
    }

    // === Observers ===

    pub fn add_observer(&self, observer: Arc<dyn ContextObserver>) {
        self.shared.observers.add_observer(observer);
    }

    pub fn remove_observer(&self, observer: &Arc<dyn ContextObserver>) -> bool {
        self.shared.observers.remove_observer(observer)
    }

    // === Lifecycle ===

    /// Stop accepting work and cancel every open request
    ///
    /// Open requests are answered with `Cancelled`. Returns once the worker has
    /// stopped; calling it again is a no-op.
    pub async fn shutdown(&self) {
        if self.shared.shutting_down.swap(true, Ordering::AcqRel) {
            debug!("ContextManager::shutdown: already shutting down");
            return;
        }
        info!("ContextManager shutdown requested");

        let (reply_tx, reply_rx) = oneshot::channel();
        if self.shared.tx.send(Task::Shutdown { reply: Some(reply_tx) }).is_ok() {
            let _ = reply_rx.await;
        }
    }
}
