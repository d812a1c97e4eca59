//! Capability identity and state value types

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifies one capability on one endpoint
///
/// Two identities are equal iff namespace, name, instance and endpoint all
/// match. An empty `endpoint_id` addresses the implicit default endpoint and is
/// resolved by the [`ContextManager`](crate::ContextManager) before it is used
/// as a store key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CapabilityIdentity {
    pub namespace: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(rename = "endpoint-id", default)]
    pub endpoint_id: String,
}

impl CapabilityIdentity {
    /// Identity on the implicit default endpoint
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            instance: None,
            endpoint_id: String::new(),
        }
    }

    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    pub fn with_endpoint(mut self, endpoint_id: impl Into<String>) -> Self {
        self.endpoint_id = endpoint_id.into();
        self
    }

    /// True when no endpoint was supplied by the caller
    pub fn uses_default_endpoint(&self) -> bool {
        self.endpoint_id.is_empty()
    }

    /// Fill in `default_endpoint` if this identity has no endpoint of its own
    pub(crate) fn resolved(mut self, default_endpoint: &str) -> Self {
        if self.endpoint_id.is_empty() {
            self.endpoint_id = default_endpoint.to_string();
        }
        self
    }
}

impl fmt::Display for CapabilityIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.namespace, self.name)?;
        if let Some(instance) = &self.instance {
            write!(f, "[{}]", instance)?;
        }
        if !self.endpoint_id.is_empty() {
            write!(f, "@{}", self.endpoint_id)?;
        }
        Ok(())
    }
}

/// Last reported state of a capability
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityState {
    /// Opaque payload, typically a JSON document owned by the provider
    #[serde(rename = "value-payload")]
    pub value_payload: String,

    #[serde(rename = "time-of-sample")]
    pub time_of_sample: DateTime<Utc>,

    #[serde(rename = "uncertainty-ms", default)]
    pub uncertainty_ms: u32,
}

impl CapabilityState {
    /// State sampled now with no uncertainty
    pub fn new(value_payload: impl Into<String>) -> Self {
        Self {
            value_payload: value_payload.into(),
            time_of_sample: Utc::now(),
            uncertainty_ms: 0,
        }
    }

    pub fn with_uncertainty(mut self, uncertainty_ms: u32) -> Self {
        self.uncertainty_ms = uncertainty_ms;
        self
    }
}

/// How a legacy push-based capability participates in aggregation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StateRefreshPolicy {
    /// Cached state is included in every context without polling
    Always,
    /// Included only when refreshed for the request being aggregated
    Sometimes,
    /// Never included; push-only bookkeeping
    Never,
}

impl fmt::Display for StateRefreshPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StateRefreshPolicy::Always => "always",
            StateRefreshPolicy::Sometimes => "sometimes",
            StateRefreshPolicy::Never => "never",
        };
        f.write_str(s)
    }
}

/// Why a capability state changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StateChangeCause {
    AppInteraction,
    PhysicalInteraction,
    PeriodicPoll,
    RuleTrigger,
    VoiceInteraction,
    AlexaInteraction,
}

/// Aggregated snapshot for one endpoint, sorted by identity
pub type Context = Vec<(CapabilityIdentity, CapabilityState)>;
