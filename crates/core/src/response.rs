//! The tagged sum every Agent Core entry point resolves to (§4.4).

use conduit_handoff::HandoffContext;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingToolCall {
    pub tool_name: String,
    pub tool_use_id: String,
    pub input: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentResponse {
    Text { content: String },
    ToolCall { calls: Vec<PendingToolCall> },
    Handoff { target_agent: String, context: HandoffContext },
    Error { message: String },
}

/// Processing state for a single session's Agent Core loop (§4.4). Tracked
/// only for observability/testing — control flow is driven directly by the
/// function being called, not by matching on this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentCoreState {
    Idle,
    AwaitingLlm,
    AwaitingToolResult,
    HandoffPending,
    Terminated,
}
