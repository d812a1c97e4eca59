//! Shared fixtures for context manager integration tests

#![allow(dead_code)]

use std::sync::{Arc, Once};
use std::time::Duration;

use contextmanager::{
    CapabilityIdentity, Context, ContextManager, ContextManagerConfig, ContextRequestError, ContextRequester,
    RequestToken, StateProvider,
};
use tokio::sync::mpsc;

pub const ENDPOINT: &str = "device-1";

static LOGGING: Once = Once::new();

/// Route tracing output through the test harness (RUST_LOG controls the level)
pub fn init_logging() {
    LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

pub fn spawn_manager() -> ContextManager {
    init_logging();
    ContextManager::spawn(ContextManagerConfig {
        default_endpoint_id: ENDPOINT.to_string(),
        ..Default::default()
    })
}

pub fn id(namespace: &str, name: &str) -> CapabilityIdentity {
    CapabilityIdentity::new(namespace, name).with_endpoint(ENDPOINT)
}

/// What a requester was told
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Available { token: RequestToken, endpoint_id: String, context: Context },
    Failed { token: RequestToken, error: ContextRequestError },
}

impl Outcome {
    pub fn token(&self) -> RequestToken {
        match self {
            Outcome::Available { token, .. } | Outcome::Failed { token, .. } => *token,
        }
    }

    pub fn context(&self) -> &Context {
        match self {
            Outcome::Available { context, .. } => context,
            Outcome::Failed { error, .. } => panic!("expected context, got failure {error:?}"),
        }
    }

    pub fn error(&self) -> ContextRequestError {
        match self {
            Outcome::Failed { error, .. } => *error,
            Outcome::Available { .. } => panic!("expected failure, got context"),
        }
    }
}

/// Requester that forwards every callback to a channel
pub struct Requester {
    tx: mpsc::UnboundedSender<Outcome>,
}

impl Requester {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Outcome>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl ContextRequester for Requester {
    fn on_context_available(&self, token: RequestToken, endpoint_id: &str, context: Context) {
        let _ = self.tx.send(Outcome::Available {
            token,
            endpoint_id: endpoint_id.to_string(),
            context,
        });
    }

    fn on_context_failure(&self, token: RequestToken, error: ContextRequestError) {
        let _ = self.tx.send(Outcome::Failed { token, error });
    }
}

/// Provider that records pulls and lets the test answer them
pub struct PullRecorder {
    tx: mpsc::UnboundedSender<(CapabilityIdentity, RequestToken)>,
}

impl PullRecorder {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<(CapabilityIdentity, RequestToken)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl StateProvider for PullRecorder {
    fn provide_state(&self, identity: &CapabilityIdentity, token: RequestToken) {
        let _ = self.tx.send((identity.clone(), token));
    }
}

/// Provider that is never heard from
pub struct Silent;

impl StateProvider for Silent {
    fn provide_state(&self, _: &CapabilityIdentity, _: RequestToken) {}
}

/// Wait for the next outcome, failing the test after a generous deadline
pub async fn next_outcome(rx: &mut mpsc::UnboundedReceiver<Outcome>) -> Outcome {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no outcome delivered")
        .expect("requester channel closed")
}

/// Assert nothing more is delivered within `wait`
pub async fn assert_no_more(rx: &mut mpsc::UnboundedReceiver<Outcome>, wait: Duration) {
    tokio::time::sleep(wait).await;
    if let Ok(extra) = rx.try_recv() {
        panic!("unexpected second outcome: {extra:?}");
    }
}
