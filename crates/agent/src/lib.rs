//! The docchat agent: a ReAct loop over per-file tools, and the coordinator
//! that streams its output while persisting each turn exactly once.
//!
//! A turn goes through these steps:
//!
//! 1. **Resolve** per-chat settings (prompt, model, temperature, timeout)
//! 2. **Assemble** tools from the chat's files and memory from its stored messages
//! 3. **Reason/act** until the model answers or the iteration ceiling is hit
//! 4. **Relay** deltas to the client and **persist** the user/assistant pair

pub mod coordinator;
pub mod orchestrator;
pub mod settings;
pub mod stream_event;
pub mod turn;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use coordinator::{ERROR_SUFFIX, Finalizer, INTERRUPTED_SUFFIX, Persisted, TurnAnswer, complete_turn, stream_turn};
pub use orchestrator::{Agent, AgentOptions, AgentOutcome, AgentState, ITERATION_LIMIT_NOTICE, create_agent};
pub use settings::TurnSettings;
pub use stream_event::{AgentStreamEvent, GENERIC_STREAM_ERROR, RunEnd, WireEvent};
pub use turn::{PreparedTurn, TurnRunner, WebAccess};
