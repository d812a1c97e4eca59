//! Capability bindings and their cached state

mod binding;
mod legacy;
mod state_store;

pub use binding::{BindingKind, StateBinding};
pub use state_store::{CapabilityStateStore, PollTarget};
