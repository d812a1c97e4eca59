//! Domain value types shared by the store and the coordinator

mod capability;
mod token;

pub use capability::{CapabilityIdentity, CapabilityState, Context, StateChangeCause, StateRefreshPolicy};
pub use token::{NO_TOKEN, RequestToken, TokenAllocator};
