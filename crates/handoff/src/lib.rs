//! Handoff protocol (C8): detecting handoff intent from a tool name,
//! assembling the context that crosses the process boundary, and the wire
//! record emitted to the gateway.
//!
//! This crate is intentionally standalone — it knows nothing about the live
//! `Workflow` graph or `Session` types used elsewhere in the runtime so that
//! the context it carries is always an explicit, serialisable snapshot
//! (§9: "Any richer state must be serialised explicitly in the handoff
//! context").

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Memory is a plain string→scalar map — never an arbitrary object graph
/// (§9). This is the one type shared by every crate that touches
/// cross-agent state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MemoryValue {
    String(String),
    Bool(bool),
    Number(f64),
}

impl MemoryValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MemoryValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            MemoryValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<&str> for MemoryValue {
    fn from(value: &str) -> Self {
        MemoryValue::String(value.to_string())
    }
}
impl From<String> for MemoryValue {
    fn from(value: String) -> Self {
        MemoryValue::String(value)
    }
}
impl From<bool> for MemoryValue {
    fn from(value: bool) -> Self {
        MemoryValue::Bool(value)
    }
}
impl From<f64> for MemoryValue {
    fn from(value: f64) -> Self {
        MemoryValue::Number(value)
    }
}

pub type Memory = BTreeMap<String, MemoryValue>;

/// Snapshot of a session's position in its workflow graph, frozen at the
/// moment a handoff is initiated.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowStateSnapshot {
    pub node_id: String,
    pub outcomes: Vec<String>,
}

/// The context a handoff carries across the process boundary (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffContext {
    pub last_user_utterance: String,
    pub memory: Memory,
    pub workflow_state: WorkflowStateSnapshot,
    pub conversation_summary: String,
    pub reason: Option<String>,
}

/// A handoff staged on a session, awaiting the tool-result round trip
/// (§4.8) before it is emitted upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingHandoff {
    pub target_agent: String,
    pub context: HandoffContext,
    pub ready_after_tool_result: bool,
}

/// The wire record sent to the gateway once a handoff is ready to emit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffRecord {
    pub source_agent: String,
    pub target_agent: String,
    pub session_id: String,
    pub context: HandoffContext,
    pub initiated_at: chrono::DateTime<chrono::Utc>,
}

fn transfer_to_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^transfer_to_(?P<agent>[A-Za-z0-9_-]+)$").expect("valid regex"))
}

/// Detect whether `name` is a handoff tool per the naming convention
/// (§4.8): `transfer_to_<agent>` or exactly `return_to_triage`. Returns the
/// derived target agent id. A pure function of the name string only — no
/// coupling to any language's string-processing library beyond a regex
/// anchored at both ends.
pub fn target_agent_for(name: &str) -> Option<String> {
    if name == "return_to_triage" {
        return Some("triage".to_string());
    }
    transfer_to_re()
        .captures(name)
        .map(|caps| caps["agent"].to_string())
}

/// `true` iff `name` is recognised as a handoff tool.
pub fn is_handoff_tool(name: &str) -> bool {
    target_agent_for(name).is_some()
}

/// Build the context assembled at handoff time (§4.8 step 1).
pub fn build_context(
    last_user_utterance: String,
    memory: Memory,
    workflow_state: WorkflowStateSnapshot,
    conversation_summary: String,
    reason: Option<String>,
) -> HandoffContext {
    HandoffContext {
        last_user_utterance,
        memory,
        workflow_state,
        conversation_summary,
        reason,
    }
}
