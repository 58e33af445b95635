//! Agent runtime: tag protocol parsing, tool dispatch, and the turn loop
//! that drives a conversation from user input to completed work.

pub mod dispatch;
pub mod prompts;
pub mod protocol;
pub mod tool_loop;

pub use dispatch::dispatch_tool_call;
pub use protocol::parse_tool_calls;
pub use tool_loop::{AgentLoop, TurnOutcome, TurnStatus};
