//! Agent-level streaming events and the wire events sent to clients.
//!
//! `AgentStreamEvent` is what the orchestrator emits while it runs. The
//! coordinator reduces it to `WireEvent`s: zero or more `value` deltas followed
//! by exactly one terminal `done` or `error`.

use serde::{Deserialize, Serialize};

/// How an agent run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunEnd {
    Finished,
    IterationLimitExceeded,
    Errored,
}

/// Events emitted by the agent during streaming execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentStreamEvent {
    /// Partial text from the LLM.
    Chunk { content: String },

    /// The agent is calling a tool.
    ToolCall {
        id: String,
        name: String,
        input: serde_json::Value,
    },

    /// Tool execution completed.
    ToolResult {
        id: String,
        name: String,
        output: String,
        success: bool,
    },

    /// The run ended without an error. `end` tells whether the model answered
    /// or the iteration ceiling was hit.
    Done {
        end: RunEnd,
        iterations: usize,
        tool_calls_made: usize,
    },

    /// The run failed; `message` carries the underlying cause for logging.
    Error { message: String },
}

impl AgentStreamEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Chunk { .. } => "chunk",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolResult { .. } => "tool_result",
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }
}

/// Message sent to clients in place of the underlying error.
pub const GENERIC_STREAM_ERROR: &str = "An error occurred while generating the response.";

/// One event of the client-facing `text/event-stream`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireEvent {
    Value(String),
    Done,
    Error(String),
}

impl WireEvent {
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Value(delta) => serde_json::json!({ "value": delta }),
            Self::Done => serde_json::json!({ "status": "done" }),
            Self::Error(message) => serde_json::json!({ "error": message }),
        }
    }

    /// The event as a raw `data: <json>\n\n` frame.
    pub fn to_sse_frame(&self) -> String {
        format!("data: {}\n\n", self.to_json())
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Value(_))
    }
}
