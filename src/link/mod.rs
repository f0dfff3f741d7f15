//! Connection manager: link state machine, reconnection, and health events.

mod manager;
mod state;

pub use manager::{LinkEvent, LinkManager};
pub use state::{LinkState, LinkStateMachine};
