//! Wire messages for the Client ⇄ Runtime stream (§6).
//!
//! Kept as its own crate, below both adapters (C5/C6) and the unified
//! runtime (C7) in the dependency graph, so neither adapter depends on the
//! other and the runtime can match on either side's output without a cycle.

use conduit_handoff::{HandoffContext, Memory};
use serde::{Deserialize, Serialize};

/// Inbound JSON message types recognised on the client stream (§4.7, §6).
/// Raw binary frames (PCM audio) are represented at the transport layer,
/// not here — see the runtime's frame demultiplexer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientInbound {
    SessionInit {
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        memory: Option<Memory>,
        #[serde(default)]
        trace_id: Option<String>,
        #[serde(default)]
        workflow_state: Option<WorkflowStateWire>,
    },
    UserInput {
        text: String,
    },
    TextInput {
        text: String,
        #[serde(default)]
        skip_transcript: bool,
    },
    EndAudio,
    UpdateConfig {
        config: serde_json::Value,
    },
    MemoryUpdate {
        memory: Memory,
        #[serde(default)]
        graph_state: Option<WorkflowStateWire>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WorkflowStateWire {
    pub node_id: String,
    #[serde(default)]
    pub outcomes: Vec<String>,
}

/// Outbound JSON message types emitted on the client stream (§6). Audio is
/// sent as raw binary frames, not represented here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientOutbound {
    Connected {
        session_id: String,
        mode: String,
    },
    Transcript {
        id: String,
        role: String,
        text: String,
        is_final: bool,
    },
    ToolUse {
        tool_use_id: String,
        tool_name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
    },
    ToolError {
        tool_use_id: String,
        error: String,
    },
    HandoffRequest {
        target_agent_id: String,
        context: HandoffContext,
        graph_state: WorkflowStateWire,
    },
    WorkflowUpdate {
        node_id: String,
    },
    Interruption,
    Metadata {
        data: serde_json::Value,
    },
    Usage {
        data: serde_json::Value,
    },
    SessionStart {
        session_id: String,
    },
    ContentStart,
    ContentEnd,
    InteractionTurnEnd,
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<String>,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        fatal: bool,
    },
}

impl ClientOutbound {
    pub fn error(message: impl Into<String>, fatal: bool) -> Self {
        ClientOutbound::Error { message: message.into(), details: None, fatal }
    }
}
