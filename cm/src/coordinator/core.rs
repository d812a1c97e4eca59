//! Coordinator worker: the single consumer of the mutation queue
//!
//! Every mutation of the state store and of the pending-request table happens
//! here, one task at a time. Provider pulls and requester callbacks are
//! spawned onto separate tasks so a provider or requester that calls straight
//! back into the manager never runs inside the worker.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::messages::{CoordinatorMetrics, Task};
use super::pending::PendingRequest;
use crate::domain::{CapabilityIdentity, CapabilityState, RequestToken, StateRefreshPolicy, TokenAllocator};
use crate::error::{ContextError, ContextRequestError, ContextResult};
use crate::store::{CapabilityStateStore, PollTarget};
use crate::timer::TimeoutScheduler;
use crate::traits::ContextRequester;

pub(crate) struct Worker {
    store: CapabilityStateStore,
    requests: HashMap<RequestToken, PendingRequest>,
    tokens: Arc<Mutex<TokenAllocator>>,
    timer: Arc<dyn TimeoutScheduler>,
    /// Weak so that dropping every handle closes the queue
    tx: mpsc::WeakUnboundedSender<Task>,
    next_generation: u64,
    metrics: CoordinatorMetrics,
}

impl Worker {
    pub(crate) fn new(
        tokens: Arc<Mutex<TokenAllocator>>,
        timer: Arc<dyn TimeoutScheduler>,
        tx: mpsc::WeakUnboundedSender<Task>,
    ) -> Self {
        Self {
            store: CapabilityStateStore::new(),
            requests: HashMap::new(),
            tokens,
            timer,
            tx,
            next_generation: 0,
            metrics: CoordinatorMetrics::default(),
        }
    }

    /// Process tasks until shutdown is requested or every handle is dropped
    pub(crate) async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Task>) {
        info!("Context manager worker started");

        let mut shutdown_reply = None;
        while let Some(task) = rx.recv().await {
            self.metrics.tasks_processed += 1;
            debug!(task = task.name(), "Worker: processing task");

            if let Task::Shutdown { reply } = task {
                shutdown_reply = reply;
                break;
            }
            self.handle(task);
        }

        info!(open_requests = self.requests.len(), "Context manager shutting down");
        self.cancel_all();

        // Anything posted before the queue closed is rejected without side effects
        rx.close();
        while let Ok(task) = rx.try_recv() {
            self.reject(task);
        }

        if let Some(reply) = shutdown_reply {
            let _ = reply.send(());
        }
        info!("Context manager worker stopped");
    }

    fn handle(&mut self, task: Task) {
        match task {
            Task::Register {
                identity,
                provider,
                kind,
                reply,
            } => {
                let replaced = self.store.register(identity.clone(), provider, kind);
                debug!(%identity, %kind, replaced, "Registered capability");
                let _ = reply.send(Ok(()));
            }

            Task::Unregister { identity, reply } => {
                let _ = reply.send(self.unregister(&identity));
            }

            Task::SetState {
                identity,
                payload,
                refresh_policy,
                token,
                reply,
            } => {
                let _ = reply.send(self.set_state(&identity, &payload, refresh_policy, token));
            }

            Task::PushState { identity, state, reply } => {
                let result = self.store.push(&identity, state);
                if result.is_ok() {
                    self.satisfy(&identity, None);
                }
                let _ = reply.send(result);
            }

            Task::ReportStateChange { identity, state } => {
                if let Err(e) = self.store.push(&identity, state) {
                    debug!(%identity, error = %e, "State change for unregistered capability");
                }
            }

            Task::GetContext {
                token,
                requester,
                endpoint_id,
                timeout,
            } => self.get_context(token, requester, endpoint_id, timeout),

            Task::StateResponse { identity, state, token } => self.state_response(&identity, state, token),

            Task::StateUnavailable {
                identity,
                token,
                endpoint_unreachable,
            } => self.state_unavailable(&identity, token, endpoint_unreachable),

            Task::Timeout { token, generation } => self.timeout(token, generation),

            Task::ReadContext { endpoint_id, reply } => {
                let _ = reply.send(Ok(self.store.read(&endpoint_id)));
            }

            Task::GetMetrics { reply } => {
                let _ = reply.send(self.snapshot_metrics());
            }

            // Intercepted by `run`
            Task::Shutdown { reply } => {
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
            }
        }
    }

    fn unregister(&mut self, identity: &CapabilityIdentity) -> ContextResult<()> {
        self.store.unregister(identity)?;

        // Requests still waiting on this capability resolve it as unavailable
        let waiting: Vec<RequestToken> = self
            .requests
            .iter()
            .filter(|(_, request)| request.awaits(identity))
            .map(|(token, _)| *token)
            .collect();

        for token in waiting {
            debug!(%identity, token, "Unregistered capability resolved as unavailable");
            let complete = self
                .requests
                .get_mut(&token)
                .map(|request| {
                    request.resolve_unavailable(identity);
                    request.is_complete()
                })
                .unwrap_or(false);
            if complete {
                self.finalize_success(token);
            }
        }
        Ok(())
    }

    fn set_state(
        &mut self,
        identity: &CapabilityIdentity,
        payload: &str,
        refresh_policy: StateRefreshPolicy,
        token: Option<RequestToken>,
    ) -> ContextResult<()> {
        if !self.store.contains(identity) {
            warn!(%identity, "set_state for unregistered capability");
            return Err(ContextError::InvalidCapability(identity.clone()));
        }
        if let Some(token) = token
            && !self.requests.contains_key(&token)
        {
            debug!(%identity, token, "set_state with outdated token");
            return Err(ContextError::StateTokenOutdated(token));
        }

        self.store.push_legacy(identity, payload, refresh_policy)?;
        self.satisfy(identity, token);
        Ok(())
    }

    /// Treat a push as the answer to outstanding pulls for `identity`
    ///
    /// With a token only that request is satisfied, otherwise every open
    /// request waiting on the identity is.
    fn satisfy(&mut self, identity: &CapabilityIdentity, token: Option<RequestToken>) {
        let tokens: Vec<RequestToken> = match token {
            Some(token) => vec![token],
            None => self
                .requests
                .iter()
                .filter(|(_, request)| request.awaits(identity))
                .map(|(token, _)| *token)
                .collect(),
        };

        for token in tokens {
            let complete = match self.requests.get_mut(&token) {
                Some(request) => request.resolve(identity) && request.is_complete(),
                None => false,
            };
            if complete {
                self.finalize_success(token);
            }
        }
    }

    fn get_context(
        &mut self,
        token: RequestToken,
        requester: Arc<dyn ContextRequester>,
        endpoint_id: String,
        timeout: Duration,
    ) {
        assert!(
            !self.requests.contains_key(&token),
            "request token {token} reused while still in flight"
        );

        let targets = self.store.scatter_set(&endpoint_id);
        let pending: HashSet<CapabilityIdentity> = targets.iter().map(|t| t.identity.clone()).collect();
        debug!(token, %endpoint_id, polled = pending.len(), ?timeout, "Scattering context request");

        self.next_generation += 1;
        let generation = self.next_generation;
        let mut request = PendingRequest::new(requester, endpoint_id, pending, generation);

        if request.is_complete() {
            self.requests.insert(token, request);
            self.finalize_success(token);
            return;
        }

        let tx = self.tx.clone();
        request.timer = Some(self.timer.schedule(
            timeout,
            Box::new(move || {
                if let Some(tx) = tx.upgrade() {
                    let _ = tx.send(Task::Timeout { token, generation });
                }
            }),
        ));

        // Bookkeeping exists before any provider can answer
        self.requests.insert(token, request);
        dispatch_pulls(token, targets);
    }

    fn state_response(&mut self, identity: &CapabilityIdentity, state: CapabilityState, token: RequestToken) {
        // Late responses still refresh the cache
        if let Err(e) = self.store.push(identity, state) {
            debug!(%identity, token, error = %e, "Response from unregistered capability");
        }

        let Some(request) = self.requests.get_mut(&token) else {
            self.stale_response(identity, token);
            return;
        };

        if !request.resolve(identity) {
            debug!(%identity, token, "Response for capability the request is not waiting on");
            return;
        }
        if request.is_complete() {
            self.finalize_success(token);
        }
    }

    fn state_unavailable(&mut self, identity: &CapabilityIdentity, token: RequestToken, endpoint_unreachable: bool) {
        let Some(request) = self.requests.get_mut(&token) else {
            self.stale_response(identity, token);
            return;
        };

        if endpoint_unreachable {
            warn!(%identity, token, endpoint_id = %request.endpoint_id, "Endpoint unreachable");
            self.finalize_failure(token, ContextRequestError::EndpointUnreachable);
            return;
        }

        if request.resolve_unavailable(identity) && request.is_complete() {
            self.finalize_success(token);
        }
    }

    fn stale_response(&mut self, identity: &CapabilityIdentity, token: RequestToken) {
        self.metrics.stale_responses += 1;
        debug!(%identity, token, "Ignoring response for token not in flight");
    }

    fn timeout(&mut self, token: RequestToken, generation: u64) {
        let Some(request) = self.requests.get(&token) else {
            debug!(token, "Timeout for finalized request");
            return;
        };
        if request.generation != generation {
            debug!(token, generation, "Timeout from an earlier request with the same token");
            return;
        }

        warn!(token, outstanding = request.pending.len(), "Context request timed out");
        self.metrics.timeouts += 1;
        self.finalize_failure(token, ContextRequestError::Timeout);
    }

    fn finalize_success(&mut self, token: RequestToken) {
        let Some(request) = self.close(token) else {
            return;
        };

        let context = self
            .store
            .aggregate(&request.endpoint_id, &request.refreshed, &request.unavailable);
        debug!(token, capabilities = context.len(), "Context request complete");
        self.metrics.requests_completed += 1;

        let PendingRequest {
            requester, endpoint_id, ..
        } = request;
        tokio::spawn(async move {
            requester.on_context_available(token, &endpoint_id, context);
        });
    }

    fn finalize_failure(&mut self, token: RequestToken, error: ContextRequestError) {
        let Some(request) = self.close(token) else {
            return;
        };

        debug!(token, %error, "Context request failed");
        self.metrics.requests_failed += 1;
        deliver_failure(request.requester, token, error);
    }

    /// Remove a request from the table, disarm its timer and free its token
    fn close(&mut self, token: RequestToken) -> Option<PendingRequest> {
        let request = self.requests.remove(&token)?;
        if let Some(timer) = &request.timer {
            self.timer.cancel(timer);
        }
        self.tokens.lock().unwrap_or_else(PoisonError::into_inner).release(token);
        Some(request)
    }

    fn cancel_all(&mut self) {
        let tokens: Vec<RequestToken> = self.requests.keys().copied().collect();
        for token in tokens {
            self.finalize_failure(token, ContextRequestError::Cancelled);
        }
    }

    /// Answer a task that arrived after shutdown
    fn reject(&mut self, task: Task) {
        debug!(task = task.name(), "Rejecting task after shutdown");
        match task {
            // The caller already holds this token, so it still gets exactly one answer
            Task::GetContext { token, requester, .. } => {
                self.tokens.lock().unwrap_or_else(PoisonError::into_inner).release(token);
                self.metrics.requests_failed += 1;
                deliver_failure(requester, token, ContextRequestError::Cancelled);
            }
            Task::Register { reply, .. }
            | Task::Unregister { reply, .. }
            | Task::SetState { reply, .. }
            | Task::PushState { reply, .. } => {
                let _ = reply.send(Err(ContextError::ShuttingDown));
            }
            Task::ReadContext { reply, .. } => {
                let _ = reply.send(Err(ContextError::ShuttingDown));
            }
            Task::GetMetrics { reply } => {
                let _ = reply.send(self.snapshot_metrics());
            }
            Task::Shutdown { reply } => {
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
            }
            Task::ReportStateChange { .. }
            | Task::StateResponse { .. }
            | Task::StateUnavailable { .. }
            | Task::Timeout { .. } => {}
        }
    }

    fn snapshot_metrics(&self) -> CoordinatorMetrics {
        CoordinatorMetrics {
            registered_capabilities: self.store.len(),
            pending_requests: self.requests.len(),
            ..self.metrics.clone()
        }
    }
}

fn dispatch_pulls(token: RequestToken, targets: Vec<PollTarget>) {
    tokio::spawn(async move {
        for target in targets {
            target.provider.provide_state(&target.identity, token);
        }
    });
}

fn deliver_failure(requester: Arc<dyn ContextRequester>, token: RequestToken, error: ContextRequestError) {
    tokio::spawn(async move {
        requester.on_context_failure(token, error);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContextManagerConfig;
    use crate::coordinator::ContextManager;
    use crate::domain::Context;
    use crate::timer::{TimeoutCallback, TimerHandle};
    use crate::traits::StateProvider;

    /// Timer that only fires when the test says so, even after a cancel
    #[derive(Default)]
    struct ManualTimer {
        callbacks: Mutex<Vec<TimeoutCallback>>,
        cancelled: Mutex<Vec<TimerHandle>>,
    }

    impl ManualTimer {
        /// Run the callback scheduled `index`-th among those not yet fired
        fn fire(&self, index: usize) {
            let callback = self.callbacks.lock().unwrap().remove(index);
            callback();
        }

        fn fire_all(&self) {
            let callbacks: Vec<TimeoutCallback> = self.callbacks.lock().unwrap().drain(..).collect();
            for callback in callbacks {
                callback();
            }
        }
    }

    impl TimeoutScheduler for ManualTimer {
        fn schedule(&self, _duration: Duration, callback: TimeoutCallback) -> TimerHandle {
            let mut callbacks = self.callbacks.lock().unwrap();
            callbacks.push(callback);
            TimerHandle::new(callbacks.len() as u64)
        }

        fn cancel(&self, handle: &TimerHandle) {
            self.cancelled.lock().unwrap().push(*handle);
        }
    }

    struct Silent;

    impl StateProvider for Silent {
        fn provide_state(&self, _: &CapabilityIdentity, _: RequestToken) {}
    }

    type Delivered = Result<Context, ContextRequestError>;

    struct Channel(mpsc::UnboundedSender<(RequestToken, Delivered)>);

    impl ContextRequester for Channel {
        fn on_context_available(&self, token: RequestToken, _: &str, context: Context) {
            let _ = self.0.send((token, Ok(context)));
        }

        fn on_context_failure(&self, token: RequestToken, error: ContextRequestError) {
            let _ = self.0.send((token, Err(error)));
        }
    }

    async fn setup() -> (
        ContextManager,
        Arc<ManualTimer>,
        Arc<Channel>,
        mpsc::UnboundedReceiver<(RequestToken, Delivered)>,
    ) {
        let timer = Arc::new(ManualTimer::default());
        let manager = ContextManager::spawn_with_timer(ContextManagerConfig::default(), timer.clone());
        manager
            .add_state_provider(CapabilityIdentity::new("Alexa", "Power"), Arc::new(Silent))
            .await
            .unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        (manager, timer, Arc::new(Channel(tx)), rx)
    }

    fn power() -> CapabilityIdentity {
        CapabilityIdentity::new("Alexa", "Power")
    }

    #[tokio::test]
    async fn test_timer_firing_after_completion_is_ignored() {
        let (manager, timer, requester, mut rx) = setup().await;

        let token = manager.get_context(requester, "", Duration::from_secs(1)).unwrap();
        manager.provide_state_response(power(), CapabilityState::new("ON"), token);

        let (delivered_token, delivered) = rx.recv().await.unwrap();
        assert_eq!(delivered_token, token);
        assert_eq!(delivered.unwrap().len(), 1);
        assert_eq!(timer.cancelled.lock().unwrap().len(), 1);

        // The callback raced the cancel and still posts a timeout
        timer.fire_all();
        let metrics = manager.metrics().await.unwrap();
        assert_eq!(metrics.timeouts, 0);
        assert_eq!(metrics.requests_completed, 1);
        assert!(rx.try_recv().is_err());

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_first_to_reach_queue_wins() {
        let (manager, timer, requester, mut rx) = setup().await;

        let token = manager.get_context(requester, "", Duration::from_secs(1)).unwrap();
        // Make sure the request is armed before firing
        manager.metrics().await.unwrap();
        timer.fire_all();
        manager.provide_state_response(power(), CapabilityState::new("ON"), token);

        let (delivered_token, delivered) = rx.recv().await.unwrap();
        assert_eq!(delivered_token, token);
        assert_eq!(delivered.unwrap_err(), ContextRequestError::Timeout);

        let metrics = manager.metrics().await.unwrap();
        assert_eq!(metrics.timeouts, 1);
        assert_eq!(metrics.stale_responses, 1);
        assert!(rx.try_recv().is_err());

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_finalize_releases_token() {
        let (manager, _timer, requester, mut rx) = setup().await;

        let token = manager.get_context(requester, "", Duration::from_secs(1)).unwrap();
        assert!(manager.token_in_flight(token));

        manager.provide_state_unavailable_response(power(), token, false);
        let (_, delivered) = rx.recv().await.unwrap();
        assert!(delivered.unwrap().is_empty());
        assert!(!manager.token_in_flight(token));

        manager.shutdown().await;
    }

    const DEVICE: &str = "device-1";

    fn speaker() -> CapabilityIdentity {
        CapabilityIdentity::new("Speaker", "volume").with_endpoint(DEVICE)
    }

    fn bare_worker(
        tokens: Arc<Mutex<TokenAllocator>>,
        timer: Arc<ManualTimer>,
    ) -> (Worker, mpsc::UnboundedSender<Task>, mpsc::UnboundedReceiver<Task>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = Worker::new(tokens, timer, tx.downgrade());
        (worker, tx, rx)
    }

    fn get_context_task(token: RequestToken, requester: &Arc<Channel>) -> Task {
        Task::GetContext {
            token,
            requester: Arc::clone(requester) as Arc<dyn ContextRequester>,
            endpoint_id: DEVICE.to_string(),
            timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn test_timeout_from_earlier_generation_is_ignored() {
        let tokens = Arc::new(Mutex::new(TokenAllocator::with_state(RequestToken::MAX, Vec::new())));
        let timer = Arc::new(ManualTimer::default());
        let (mut worker, _tx, mut queue) = bare_worker(Arc::clone(&tokens), Arc::clone(&timer));
        let (out_tx, mut outcomes) = mpsc::unbounded_channel();
        let requester = Arc::new(Channel(out_tx));

        let (reply, _) = tokio::sync::oneshot::channel();
        worker.handle(Task::Register {
            identity: speaker(),
            provider: Arc::new(Silent),
            kind: crate::store::BindingKind::Pull,
            reply,
        });

        // First request takes token 1 and finishes; its timer callback stays armed
        let first = tokens.lock().unwrap().allocate();
        assert_eq!(first, 1);
        worker.handle(get_context_task(first, &requester));
        worker.handle(Task::StateUnavailable {
            identity: speaker(),
            token: first,
            endpoint_unreachable: false,
        });
        let (token, delivered) = outcomes.recv().await.unwrap();
        assert_eq!(token, first);
        assert!(delivered.unwrap().is_empty());

        // The counter wraps again and hands out the same token
        *tokens.lock().unwrap() = TokenAllocator::with_state(RequestToken::MAX, Vec::new());
        let second = tokens.lock().unwrap().allocate();
        assert_eq!(second, first);
        worker.handle(get_context_task(second, &requester));

        // The first request's timer fires late and targets the reused token
        timer.fire(0);
        let stale = queue.try_recv().unwrap();
        assert!(matches!(stale, Task::Timeout { token, generation: 1 } if token == first));
        worker.handle(stale);

        assert!(worker.requests.contains_key(&second));
        assert_eq!(worker.metrics.timeouts, 0);
        assert!(outcomes.try_recv().is_err());

        // The second request's own timer still applies
        timer.fire(0);
        let current = queue.try_recv().unwrap();
        worker.handle(current);
        let (token, delivered) = outcomes.recv().await.unwrap();
        assert_eq!(token, second);
        assert_eq!(delivered.unwrap_err(), ContextRequestError::Timeout);
        assert_eq!(worker.metrics.timeouts, 1);
    }

    #[tokio::test]
    async fn test_queued_request_after_shutdown_is_cancelled() {
        let tokens = Arc::new(Mutex::new(TokenAllocator::new()));
        let timer = Arc::new(ManualTimer::default());
        let (worker, tx, queue) = bare_worker(Arc::clone(&tokens), timer);
        let (out_tx, mut outcomes) = mpsc::unbounded_channel();
        let requester = Arc::new(Channel(out_tx));

        let token = tokens.lock().unwrap().allocate();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        tx.send(Task::Shutdown { reply: Some(done_tx) }).unwrap();
        tx.send(get_context_task(token, &requester)).unwrap();

        worker.run(queue).await;
        done_rx.await.unwrap();

        let (delivered_token, delivered) = outcomes.recv().await.unwrap();
        assert_eq!(delivered_token, token);
        assert_eq!(delivered.unwrap_err(), ContextRequestError::Cancelled);
        assert!(!tokens.lock().unwrap().is_live(token));
        assert!(outcomes.try_recv().is_err());

        // The queue is closed for anything posted afterwards
        assert!(tx.send(get_context_task(token + 1, &requester)).is_err());
    }
}
