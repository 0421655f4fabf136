//! State machine module.

pub mod handlers;
pub mod machine;

pub use handlers::{ActiveOperation, HandleResult, HandlerContext, handle_response};
pub use machine::{DeviceState, Request, StateMachine};
