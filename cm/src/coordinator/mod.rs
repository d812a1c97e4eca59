//! Request coordinator
//!
//! Scatter/gather of capability state into endpoint contexts. All bookkeeping
//! runs on one worker task fed by an unbounded queue:
//! - **get_context:** poll providers, arm a timeout, deliver once
//! - **responses:** resolve pending capabilities, finalize when none remain
//! - **shutdown:** cancel open requests and reject later calls

mod core;
mod handle;
mod messages;
mod pending;

pub use handle::ContextManager;
pub use messages::CoordinatorMetrics;
