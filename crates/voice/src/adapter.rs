//! Bridges a live Sonic stream to Agent Core for one session at a time.
//!
//! Two independent paths exist. Drained Sonic events (transcripts, tool
//! calls, audio, interruptions) are translated into client output by a
//! background task per session. A separate `handle_text_input` path drives
//! Agent Core directly for hybrid mode's text messages, never touching
//! Sonic at all — a text-only turn within a voice-capable agent must not pay
//! Sonic's cost (§4.5).
//!
//! Sonic's own embedded model makes the tool-call decisions and produces the
//! audio the caller hears; `process_user_utterance` is still invoked on every
//! final user transcript so workflow state, transcript history, and the
//! circuit breaker stay in sync regardless of modality (§4.4's "voice
//! agnostic" contract), but its own `ToolCall`/`Text` output is not
//! re-dispatched or re-spoken — only the outcomes Sonic has no way to
//! originate itself (an LLM-side error, or a decision-node handoff) surface
//! back to the client from that call.

use std::collections::HashMap;
use std::sync::Arc;

use conduit_core::{drive_to_terminal, AgentCore, AgentResponse, ConversationStep};
use conduit_protocol::{ClientOutbound, WorkflowStateWire};
use conduit_tools::ToolBackend;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::numerals::canonicalize_numerals;
use crate::sonic::{SonicClient, SonicError, SonicEvent, SonicStream, TranscriptRole};

/// One unit of adapter output. `ClientOutbound` is JSON-only; audio travels
/// as raw binary frames outside that wire enum.
#[derive(Debug)]
pub enum VoiceOutboundEvent {
    Json(ClientOutbound),
    Audio(Vec<u8>),
}

struct LiveStream {
    stream: Arc<Mutex<Box<dyn SonicStream>>>,
    drain_task: JoinHandle<()>,
}

pub struct VoiceAdapter<B: ToolBackend> {
    agent_core: Arc<AgentCore<B>>,
    sonic: Arc<dyn SonicClient>,
    voice_system_prompt: String,
    streams: Mutex<HashMap<String, LiveStream>>,
}

impl<B: ToolBackend + 'static> VoiceAdapter<B> {
    pub fn new(
        agent_core: Arc<AgentCore<B>>,
        sonic: Arc<dyn SonicClient>,
        voice_system_prompt: impl Into<String>,
    ) -> Self {
        Self {
            agent_core,
            sonic,
            voice_system_prompt: voice_system_prompt.into(),
            streams: Mutex::new(HashMap::new()),
        }
    }

    /// Opens the Sonic stream for `session_id` unless it is already open.
    /// Lazy start (§4.5): constructing the adapter never opens a stream.
    pub async fn ensure_started(
        &self,
        session_id: &str,
        voice_id: Option<&str>,
        outbound: mpsc::Sender<VoiceOutboundEvent>,
    ) -> Result<(), SonicError> {
        let mut streams = self.streams.lock().await;
        if streams.contains_key(session_id) {
            return Ok(());
        }
        let (tx, rx) = mpsc::channel(64);
        let stream = self.sonic.open(session_id, &self.voice_system_prompt, voice_id, tx).await?;
        let stream = Arc::new(Mutex::new(stream));
        let drain_task = tokio::spawn(drain_sonic_events(
            self.agent_core.clone(),
            stream.clone(),
            self.voice_system_prompt.clone(),
            session_id.to_string(),
            rx,
            outbound,
        ));
        streams.insert(session_id.to_string(), LiveStream { stream, drain_task });
        Ok(())
    }

    /// Forward one inbound client audio chunk. At most one Sonic send per
    /// chunk, in arrival order — no batching, no re-ordering (§4.5).
    pub async fn handle_client_audio(
        &self,
        session_id: &str,
        chunk: Vec<u8>,
        voice_id: Option<&str>,
        outbound: mpsc::Sender<VoiceOutboundEvent>,
    ) -> Result<(), SonicError> {
        self.ensure_started(session_id, voice_id, outbound).await?;
        let streams = self.streams.lock().await;
        if let Some(live) = streams.get(session_id) {
            live.stream.lock().await.send_audio(chunk).await?;
        }
        Ok(())
    }

    /// Hybrid mode's text path (§4.5): drives Agent Core directly and
    /// returns the client messages the caller should send. Sonic is never
    /// touched.
    pub async fn handle_text_input(&self, session_id: &str, text: &str) -> Vec<ClientOutbound> {
        let mut out = vec![ClientOutbound::Transcript {
            id: new_id(),
            role: "user".to_string(),
            text: text.to_string(),
            is_final: true,
        }];
        let initial = self.agent_core.process_user_utterance(session_id, text).await;
        let steps = drive_to_terminal(&self.agent_core, session_id, initial).await;
        for step in steps {
            push_step(step, &mut out);
        }
        out
    }

    pub async fn close(&self, session_id: &str) {
        let mut streams = self.streams.lock().await;
        if let Some(live) = streams.remove(session_id) {
            live.stream.lock().await.close().await;
            live.drain_task.abort();
        }
    }
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn graph_state_of(context: &conduit_handoff::HandoffContext) -> WorkflowStateWire {
    WorkflowStateWire {
        node_id: context.workflow_state.node_id.clone(),
        outcomes: context.workflow_state.outcomes.clone(),
    }
}

fn push_step(step: ConversationStep, out: &mut Vec<ClientOutbound>) {
    match step {
        ConversationStep::ToolDispatched { tool_name, tool_use_id, input } => {
            out.push(ClientOutbound::ToolUse { tool_use_id, tool_name, input });
        }
        ConversationStep::ToolResolved(result) => {
            if result.success {
                out.push(ClientOutbound::ToolResult {
                    tool_use_id: result.tool_use_id,
                    success: true,
                    result: result.result,
                });
            } else {
                out.push(ClientOutbound::ToolError {
                    tool_use_id: result.tool_use_id,
                    error: result.error.unwrap_or_default(),
                });
            }
        }
        ConversationStep::Final(resp) => push_final(resp, out),
    }
}

fn push_final(resp: AgentResponse, out: &mut Vec<ClientOutbound>) {
    match resp {
        AgentResponse::Text { content } => out.push(ClientOutbound::Transcript {
            id: new_id(),
            role: "assistant".to_string(),
            text: content,
            is_final: true,
        }),
        AgentResponse::Handoff { target_agent, context } => {
            let graph_state = graph_state_of(&context);
            out.push(ClientOutbound::HandoffRequest { target_agent_id: target_agent, context, graph_state });
        }
        AgentResponse::Error { message } => out.push(ClientOutbound::error(message, false)),
        AgentResponse::ToolCall { .. } => {}
    }
}

/// Background task draining one session's Sonic events for the lifetime of
/// its stream.
async fn drain_sonic_events<B: ToolBackend + 'static>(
    agent_core: Arc<AgentCore<B>>,
    stream: Arc<Mutex<Box<dyn SonicStream>>>,
    base_system_prompt: String,
    session_id: String,
    mut events: mpsc::Receiver<SonicEvent>,
    outbound: mpsc::Sender<VoiceOutboundEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            SonicEvent::Transcript { role, text, is_final } => {
                handle_transcript(&agent_core, &session_id, role, text, is_final, &outbound).await;
            }
            SonicEvent::ToolUse { tool_use_id, name, input } => {
                handle_tool_use(&agent_core, &stream, &base_system_prompt, &session_id, tool_use_id, name, input, &outbound)
                    .await;
            }
            SonicEvent::Audio(bytes) => {
                let _ = outbound.send(VoiceOutboundEvent::Audio(bytes)).await;
            }
            SonicEvent::Interruption => {
                let _ = outbound.send(VoiceOutboundEvent::Json(ClientOutbound::Interruption)).await;
            }
        }
    }
    info!(session_id, "sonic event stream closed");
}

async fn handle_transcript<B: ToolBackend>(
    agent_core: &Arc<AgentCore<B>>,
    session_id: &str,
    role: TranscriptRole,
    text: String,
    is_final: bool,
    outbound: &mpsc::Sender<VoiceOutboundEvent>,
) {
    let is_final_user = role == TranscriptRole::User && is_final;
    let forwarded_text = if is_final_user { canonicalize_numerals(&text) } else { text };
    let wire_role = match role {
        TranscriptRole::User => "user",
        TranscriptRole::Assistant => "assistant",
    };

    let _ = outbound
        .send(VoiceOutboundEvent::Json(ClientOutbound::Transcript {
            id: new_id(),
            role: wire_role.to_string(),
            text: forwarded_text.clone(),
            is_final,
        }))
        .await;

    if !is_final_user {
        return;
    }

    if forwarded_text.trim().is_empty() {
        return;
    }

    match agent_core.process_user_utterance(session_id, &forwarded_text).await {
        AgentResponse::Error { message } => {
            let _ = outbound.send(VoiceOutboundEvent::Json(ClientOutbound::error(message, false))).await;
        }
        AgentResponse::Handoff { target_agent, context } => {
            let graph_state = graph_state_of(&context);
            let _ = outbound
                .send(VoiceOutboundEvent::Json(ClientOutbound::HandoffRequest {
                    target_agent_id: target_agent,
                    context,
                    graph_state,
                }))
                .await;
        }
        AgentResponse::Text { .. } | AgentResponse::ToolCall { .. } => {}
    }
}

async fn handle_tool_use<B: ToolBackend>(
    agent_core: &Arc<AgentCore<B>>,
    stream: &Arc<Mutex<Box<dyn SonicStream>>>,
    base_system_prompt: &str,
    session_id: &str,
    tool_use_id: String,
    name: String,
    input: Value,
    outbound: &mpsc::Sender<VoiceOutboundEvent>,
) {
    let _ = outbound
        .send(VoiceOutboundEvent::Json(ClientOutbound::ToolUse {
            tool_use_id: tool_use_id.clone(),
            tool_name: name.clone(),
            input: input.clone(),
        }))
        .await;

    let result = agent_core.dispatch_tool(session_id, &name, input, &tool_use_id).await;

    {
        let mut guard = stream.lock().await;
        let payload = result.result.clone().unwrap_or(Value::Null);
        if let Err(err) = guard.send_tool_result(&tool_use_id, result.success, payload).await {
            warn!(%err, "failed delivering tool result back to sonic");
        }
    }

    if result.success {
        let _ = outbound
            .send(VoiceOutboundEvent::Json(ClientOutbound::ToolResult {
                tool_use_id: result.tool_use_id.clone(),
                success: true,
                result: result.result.clone(),
            }))
            .await;
    } else {
        let _ = outbound
            .send(VoiceOutboundEvent::Json(ClientOutbound::ToolError {
                tool_use_id: result.tool_use_id.clone(),
                error: result.error.clone().unwrap_or_default(),
            }))
            .await;
    }

    let tool_use_id = result.tool_use_id.clone();
    let success = result.success;
    if let AgentResponse::Handoff { target_agent, context } =
        agent_core.deliver_tool_result(session_id, &tool_use_id, result).await
    {
        let graph_state = graph_state_of(&context);
        let _ = outbound
            .send(VoiceOutboundEvent::Json(ClientOutbound::HandoffRequest {
                target_agent_id: target_agent,
                context,
                graph_state,
            }))
            .await;
    }

    if success {
        if let Some(prompt) = agent_core.render_session_prompt(session_id, base_system_prompt).await {
            let mut guard = stream.lock().await;
            if let Err(err) = guard.update_system_prompt(&prompt).await {
                warn!(%err, "failed refreshing sonic system prompt after tool result");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use conduit_core::Persona;
    use conduit_handoff::Memory;
    use conduit_llm::{ChatMessage, ConverseOutcome, LlmClient, LlmError, RequestedToolCall, ToolSpecRef};
    use conduit_session::{SessionMode, SessionStore};
    use conduit_tools::{RoutingTarget, ToolDispatcher, ToolError, ToolRegistry, ToolSpec};
    use conduit_workflow::{Edge, Node, NodeKind, Workflow, WorkflowDef};
    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;

    struct ScriptedLlm {
        replies: StdMutex<Vec<ConverseOutcome>>,
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn classify(&self, _prompt: &str, choices: &[String]) -> Result<String, LlmError> {
            Ok(choices.first().cloned().unwrap_or_default())
        }
        async fn converse(
            &self,
            _system_prompt: &str,
            _history: &[ChatMessage],
            _tools: &[ToolSpecRef],
        ) -> Result<ConverseOutcome, LlmError> {
            Ok(self.replies.lock().unwrap().remove(0))
        }
    }

    struct StubBackend;
    #[async_trait]
    impl ToolBackend for StubBackend {
        async fn execute(
            &self,
            _backend: &str,
            _name: &str,
            _input: Value,
            _timeout: Duration,
        ) -> Result<Value, ToolError> {
            Ok(json!({"balance": 42}))
        }
    }

    struct NoSonic;
    #[async_trait]
    impl SonicClient for NoSonic {
        async fn open(
            &self,
            _session_id: &str,
            _system_prompt: &str,
            _voice_id: Option<&str>,
            _events: mpsc::Sender<SonicEvent>,
        ) -> Result<Box<dyn SonicStream>, SonicError> {
            Err(SonicError::OpenFailed("not used in this test".to_string()))
        }
    }

    fn workflow() -> Arc<Workflow> {
        let def = WorkflowDef {
            nodes: vec![
                Node { id: "start".into(), kind: NodeKind::Start, label: "start".into(), tool_name: None, outcome: None, relevant_memory_keys: vec![] },
                Node { id: "end".into(), kind: NodeKind::End, label: "end".into(), tool_name: None, outcome: None, relevant_memory_keys: vec![] },
            ],
            edges: vec![Edge { from: "start".into(), to: "end".into(), label: None }],
        };
        Arc::new(Workflow::load(def).unwrap())
    }

    fn adapter_with(replies: Vec<ConverseOutcome>) -> VoiceAdapter<StubBackend> {
        let mut allowed = HashSet::new();
        allowed.insert("lookup_balance".to_string());
        let persona = Arc::new(Persona {
            id: "banking".into(),
            display_name: "Banking".into(),
            voice_id: None,
            allowed_tools: allowed,
            system_prompt: "You help with banking.".into(),
            metadata: Default::default(),
            auto_trigger: None,
        });
        let llm = Arc::new(ScriptedLlm { replies: StdMutex::new(replies) });
        let mut registry = ToolRegistry::default();
        registry.register(ToolSpec {
            name: "lookup_balance".into(),
            description: "".into(),
            input_schema: json!({"type": "object"}),
            routing: RoutingTarget::LocalTools,
        });
        let dispatcher = Arc::new(ToolDispatcher::new(registry, "banking", StubBackend, Duration::from_secs(1)));
        let core = Arc::new(AgentCore::new(workflow(), persona, dispatcher, SessionStore::new(), llm, 20));
        VoiceAdapter::new(core, Arc::new(NoSonic), "You help with banking.\nKeep replies short.")
    }

    #[tokio::test]
    async fn text_input_path_never_opens_sonic() {
        let adapter = adapter_with(vec![ConverseOutcome::Text { content: "[STEP: end] All set.".into() }]);
        adapter.agent_core.session_store().create("s1".into(), SessionMode::Hybrid, Memory::new()).await.unwrap();

        let out = adapter.handle_text_input("s1", "hello").await;

        assert!(matches!(out[0], ClientOutbound::Transcript { ref role, .. } if role == "user"));
        match out.last().unwrap() {
            ClientOutbound::Transcript { role, text, is_final, .. } => {
                assert_eq!(role, "assistant");
                assert_eq!(text, "All set.");
                assert!(is_final);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(adapter.streams.lock().await.is_empty());
    }

    #[tokio::test]
    async fn text_input_tool_call_surfaces_dispatch_and_result() {
        let adapter = adapter_with(vec![
            ConverseOutcome::ToolCalls {
                calls: vec![RequestedToolCall { tool_use_id: "tu-1".into(), name: "lookup_balance".into(), input: json!({}) }],
            },
            ConverseOutcome::Text { content: "[STEP: end] Your balance is 42.".into() },
        ]);
        adapter.agent_core.session_store().create("s1".into(), SessionMode::Hybrid, Memory::new()).await.unwrap();

        let out = adapter.handle_text_input("s1", "what's my balance").await;

        assert!(out.iter().any(|m| matches!(m, ClientOutbound::ToolUse { tool_name, .. } if tool_name == "lookup_balance")));
        assert!(out.iter().any(|m| matches!(m, ClientOutbound::ToolResult { success: true, .. })));
        assert!(matches!(out.last().unwrap(), ClientOutbound::Transcript { text, .. } if text == "Your balance is 42."));
    }
}
