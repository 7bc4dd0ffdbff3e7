//! Tool Registry & Dispatcher (C2): holds the allowed-tool list per
//! persona, routes tool invocations to the local-tools backend or the
//! handoff machinery, and enforces input-schema shape.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use conduit_handoff::{build_context, is_handoff_tool, target_agent_for, PendingHandoff, WorkflowStateSnapshot};
use conduit_session::Session;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Where a registered tool's invocations are routed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "target", rename_all = "snake_case")]
pub enum RoutingTarget {
    LocalTools,
    Handoff,
    Named { backend: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
    pub routing: RoutingTarget,
}

/// Tool input after normalisation: a caller may submit a JSON string, an
/// object, or a scalar; scalars (and unparsable strings) are wrapped as
/// `{value: x}`, but the result is a typed variant rather than an untyped
/// bag.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolInput {
    Object(serde_json::Map<String, serde_json::Value>),
    Array(Vec<serde_json::Value>),
    Scalar(serde_json::Value),
}

impl ToolInput {
    pub fn into_value(self) -> serde_json::Value {
        match self {
            ToolInput::Object(map) => serde_json::Value::Object(map),
            ToolInput::Array(arr) => serde_json::Value::Array(arr),
            ToolInput::Scalar(v) => v,
        }
    }
}

/// Parse raw tool input, normalising a JSON-string payload exactly once
/// (§4.2 point 2). Any other JSON value (object, array, number, bool, null)
/// passes through typed, unwrapped.
pub fn normalize_tool_input(raw: serde_json::Value) -> ToolInput {
    match raw {
        serde_json::Value::String(s) => match serde_json::from_str::<serde_json::Value>(&s) {
            Ok(parsed) => normalize_tool_input(parsed),
            Err(_) => {
                let mut map = serde_json::Map::new();
                map.insert("value".to_string(), serde_json::Value::String(s));
                ToolInput::Object(map)
            }
        },
        serde_json::Value::Object(map) => ToolInput::Object(map),
        serde_json::Value::Array(arr) => ToolInput::Array(arr),
        other => ToolInput::Scalar(other),
    }
}

/// Validate a normalised input against a tool's declared JSON-shape schema.
/// This is a lightweight structural check — not a full JSON Schema engine —
/// covering the `{"type": "object", "required": [...]}` shape the registry
/// declares its tools with.
pub fn validate_against_schema(input: &ToolInput, schema: &serde_json::Value) -> Result<(), ToolError> {
    let required = schema.get("required").and_then(|v| v.as_array());
    let declared_type = schema.get("type").and_then(|v| v.as_str());

    if declared_type == Some("object") {
        let ToolInput::Object(map) = input else {
            return Err(ToolError::SchemaMismatch("expected an object input".to_string()));
        };
        if let Some(required) = required {
            for key in required {
                let Some(key) = key.as_str() else { continue };
                if !map.contains_key(key) {
                    return Err(ToolError::SchemaMismatch(format!("missing required field {key:?}")));
                }
            }
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_use_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    fn ok(tool_use_id: impl Into<String>, result: serde_json::Value) -> Self {
        Self { tool_use_id: tool_use_id.into(), success: true, result: Some(result), error: None }
    }
    fn fail(tool_use_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self { tool_use_id: tool_use_id.into(), success: false, result: None, error: Some(error.into()) }
    }
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("tool {0:?} is not permitted for this persona")]
    NotPermitted(String),
    #[error("duplicate tool_use_id {0:?}")]
    DuplicateToolUseId(String),
    #[error("tool input does not match declared schema: {0}")]
    SchemaMismatch(String),
    #[error("tool backend failure: {0}")]
    BackendFailure(String),
    #[error("unknown tool {0:?}")]
    UnknownTool(String),
}

/// Holds every globally-registered tool, independent of any one persona's
/// allow-list.
#[derive(Default)]
pub struct ToolRegistry {
    specs: HashMap<String, ToolSpec>,
}

impl ToolRegistry {
    pub fn register(&mut self, spec: ToolSpec) {
        self.specs.insert(spec.name.clone(), spec);
    }

    pub fn get(&self, name: &str) -> Option<&ToolSpec> {
        self.specs.get(name)
    }

    pub fn list_specs(&self) -> Vec<&ToolSpec> {
        self.specs.values().collect()
    }

    /// Intersection of globally-registered tools with a persona's allow-list.
    pub fn allowed_for(&self, persona_allowlist: &HashSet<String>) -> HashSet<String> {
        self.specs.keys().filter(|name| persona_allowlist.contains(*name)).cloned().collect()
    }
}

/// Backend that actually executes a tool call — an opaque `execute(name,
/// input) -> result` RPC (§1). Implementations must not panic; transport
/// failures surface as `ToolError::BackendFailure`.
#[async_trait]
pub trait ToolBackend: Send + Sync {
    async fn execute(
        &self,
        backend: &str,
        name: &str,
        input: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, ToolError>;
}

/// HTTP implementation of [`ToolBackend`] against the local-tools service
/// (`POST /tools/execute`).
pub struct HttpToolBackend {
    client: reqwest::Client,
    local_tools_url: String,
}

impl HttpToolBackend {
    pub fn new(local_tools_url: impl Into<String>) -> Self {
        Self { client: reqwest::Client::new(), local_tools_url: local_tools_url.into() }
    }
}

#[derive(Serialize)]
struct ExecuteRequest<'a> {
    tool: &'a str,
    input: serde_json::Value,
}

#[derive(Deserialize)]
struct ExecuteResponse {
    #[serde(default)]
    result: serde_json::Value,
}

#[async_trait]
impl ToolBackend for HttpToolBackend {
    async fn execute(
        &self,
        _backend: &str,
        name: &str,
        input: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, ToolError> {
        let url = format!("{}/tools/execute", self.local_tools_url.trim_end_matches('/'));
        let resp = self
            .client
            .post(&url)
            .json(&ExecuteRequest { tool: name, input })
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| ToolError::BackendFailure(e.to_string()))?;

        let resp = resp.error_for_status().map_err(|e| ToolError::BackendFailure(e.to_string()))?;
        let parsed: ExecuteResponse =
            resp.json().await.map_err(|e| ToolError::BackendFailure(e.to_string()))?;
        Ok(parsed.result)
    }
}

/// Dispatches tool calls for one persona against one backend (§4.2).
pub struct ToolDispatcher<B: ToolBackend> {
    registry: ToolRegistry,
    persona_agent_id: String,
    backend: B,
    tool_rpc_timeout: Duration,
}

impl<B: ToolBackend> ToolDispatcher<B> {
    pub fn new(registry: ToolRegistry, persona_agent_id: impl Into<String>, backend: B, tool_rpc_timeout: Duration) -> Self {
        Self { registry, persona_agent_id: persona_agent_id.into(), backend, tool_rpc_timeout }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Invoke `tool_name` for `session`, enforcing the allow-list, the
    /// single-flight `tool_use_id` invariant, schema shape, and the handoff
    /// naming convention, before (maybe) making an RPC.
    pub async fn invoke(
        &self,
        session: &mut Session,
        persona_allowlist: &HashSet<String>,
        tool_name: &str,
        raw_input: serde_json::Value,
        tool_use_id: &str,
        last_user_utterance: String,
        conversation_summary: String,
    ) -> ToolResult {
        if !session.register_tool_call(tool_use_id) {
            return ToolResult::fail(tool_use_id, "duplicate tool_use_id");
        }

        let allowed = self.registry.allowed_for(persona_allowlist);
        if !allowed.contains(tool_name) {
            return ToolResult::fail(tool_use_id, "not permitted");
        }

        let input = normalize_tool_input(raw_input);

        if is_handoff_tool(tool_name) {
            return self.stage_handoff(session, tool_name, input, tool_use_id, last_user_utterance, conversation_summary);
        }

        let Some(spec) = self.registry.get(tool_name) else {
            return ToolResult::fail(tool_use_id, format!("unknown tool {tool_name:?}"));
        };

        if let Err(err) = validate_against_schema(&input, &spec.input_schema) {
            warn!(tool = tool_name, %err, "tool input failed schema validation");
            return ToolResult::fail(tool_use_id, err.to_string());
        }

        let backend_name = match &spec.routing {
            RoutingTarget::Named { backend } => backend.as_str(),
            RoutingTarget::LocalTools => "local-tools",
            RoutingTarget::Handoff => unreachable!("handoff tools are handled above"),
        };

        match self
            .backend
            .execute(backend_name, tool_name, input.into_value(), self.tool_rpc_timeout)
            .await
        {
            Ok(result) => ToolResult::ok(tool_use_id, result),
            Err(err) => {
                warn!(tool = tool_name, %err, "tool backend RPC failed");
                ToolResult::fail(tool_use_id, err.to_string())
            }
        }
    }

    fn stage_handoff(
        &self,
        session: &mut Session,
        tool_name: &str,
        input: ToolInput,
        tool_use_id: &str,
        last_user_utterance: String,
        conversation_summary: String,
    ) -> ToolResult {
        let target_agent = match target_agent_for(tool_name) {
            Some(t) => t,
            None => return ToolResult::fail(tool_use_id, "handoff to unknown agent"),
        };

        let reason = match &input {
            ToolInput::Object(map) => map.get("reason").and_then(|v| v.as_str()).map(|s| s.to_string()),
            _ => None,
        };

        let workflow_state = WorkflowStateSnapshot {
            node_id: session.workflow_state.node_id.clone(),
            outcomes: session.workflow_state.outcomes.clone(),
        };
        let context = build_context(
            last_user_utterance,
            session.memory.clone(),
            workflow_state,
            conversation_summary,
            reason,
        );

        session.pending_handoff = Some(PendingHandoff {
            target_agent: target_agent.clone(),
            context,
            ready_after_tool_result: true,
        });

        ToolResult::ok(
            tool_use_id,
            serde_json::json!({ "handoff": true, "target_agent": target_agent, "source_agent": self.persona_agent_id }),
        )
    }
}
