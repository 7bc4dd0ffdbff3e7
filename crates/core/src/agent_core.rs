//! Agent Core (C4): voice-agnostic processing. Accepts an inbound
//! utterance, advances the workflow, and emits a typed response.

use std::collections::HashMap;
use std::sync::Arc;

use conduit_handoff::{build_context, HandoffContext, WorkflowStateSnapshot};
use conduit_llm::{ChatMessage, ChatRole, ConverseOutcome, LlmClient, ToolSpecRef};
use conduit_session::{Session, SessionStore, Turn, TurnContent, TurnRole};
use conduit_tools::{ToolBackend, ToolDispatcher, ToolResult};
use conduit_workflow::{self as workflow, AdvanceContext, AdvanceResult, NodeKind, Workflow};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use crate::classifier::LlmDecisionClassifier;
use crate::persona::Persona;
use crate::response::{AgentCoreState, AgentResponse, PendingToolCall};

pub struct AgentCore<B: ToolBackend> {
    workflow: Arc<Workflow>,
    persona: Arc<Persona>,
    tool_dispatcher: Arc<ToolDispatcher<B>>,
    session_store: SessionStore,
    llm: Arc<dyn LlmClient>,
    classifier: LlmDecisionClassifier,
    history_window: usize,
    states: Mutex<HashMap<String, AgentCoreState>>,
}

impl<B: ToolBackend> AgentCore<B> {
    pub fn new(
        workflow: Arc<Workflow>,
        persona: Arc<Persona>,
        tool_dispatcher: Arc<ToolDispatcher<B>>,
        session_store: SessionStore,
        llm: Arc<dyn LlmClient>,
        history_window: usize,
    ) -> Self {
        let classifier = LlmDecisionClassifier::new(llm.clone());
        Self {
            workflow,
            persona,
            tool_dispatcher,
            session_store,
            llm,
            classifier,
            history_window,
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn persona(&self) -> &Persona {
        &self.persona
    }

    pub fn workflow(&self) -> &Workflow {
        &self.workflow
    }

    pub fn session_store(&self) -> &SessionStore {
        &self.session_store
    }

    pub async fn state_of(&self, session_id: &str) -> AgentCoreState {
        self.states.lock().await.get(session_id).copied().unwrap_or(AgentCoreState::Idle)
    }

    async fn set_state(&self, session_id: &str, state: AgentCoreState) {
        self.states.lock().await.insert(session_id.to_string(), state);
    }

    #[instrument(skip(self, text), fields(session_id = %session_id))]
    pub async fn process_user_utterance(&self, session_id: &str, text: &str) -> AgentResponse {
        let Some(session_handle) = self.session_store.get(session_id).await else {
            return AgentResponse::Error { message: format!("unknown session {session_id:?}") };
        };
        self.set_state(session_id, AgentCoreState::AwaitingLlm).await;

        let mut session = session_handle.lock().await;
        session.push_turn(TurnRole::User, TurnContent::Text { text: text.to_string() }, true);
        let response = self.continue_conversation(&mut session).await;
        self.reflect_state(session_id, &response).await;
        response
    }

    #[instrument(skip(self, result), fields(session_id = %session_id, tool_use_id = %tool_use_id))]
    pub async fn deliver_tool_result(
        &self,
        session_id: &str,
        tool_use_id: &str,
        result: ToolResult,
    ) -> AgentResponse {
        let Some(session_handle) = self.session_store.get(session_id).await else {
            return AgentResponse::Error { message: format!("unknown session {session_id:?}") };
        };
        let mut session = session_handle.lock().await;

        if !session.register_tool_result(tool_use_id) {
            warn!(tool_use_id, "duplicate tool result delivered; ignoring");
            return AgentResponse::Error { message: "duplicate tool_use_id".to_string() };
        }

        session.push_turn(
            TurnRole::Tool,
            TurnContent::ToolResult {
                tool_use_id: tool_use_id.to_string(),
                success: result.success,
                result: result.result.clone().unwrap_or(Value::Null),
            },
            true,
        );

        // Opportunistically advance a `tool` node once its result lands.
        if let Some(node) = self.workflow.node(&session.workflow_state.node_id) {
            if node.kind == NodeKind::Tool {
                let excerpt = conversation_excerpt(&session, self.history_window);
                let memory_json = serde_json::to_value(&session.memory).unwrap_or(Value::Null);
                let ctx = AdvanceContext { conversation_excerpt: &excerpt, memory: &memory_json };
                let advanced = workflow::advance(
                    &self.workflow,
                    &session.workflow_state.node_id,
                    &ctx,
                    &self.classifier,
                    Some(result.success),
                )
                .await;
                if let Some(resp) = self.apply_advance(&mut session, advanced) {
                    self.reflect_state(session_id, &resp).await;
                    return resp;
                }
            }
        }

        self.set_state(session_id, AgentCoreState::AwaitingLlm).await;
        let response = self.continue_conversation(&mut session).await;
        self.reflect_state(session_id, &response).await;
        response
    }

    /// Emit the handoff staged by a tool call once it is ready (§4.8: "mark
    /// it ready" on tool-result delivery). Returns `None` if no handoff is
    /// staged, or one is staged but still waiting on its tool result.
    pub async fn finalize_pending_handoff(&self, session_id: &str) -> Option<AgentResponse> {
        let session_handle = self.session_store.get(session_id).await?;
        let mut session = session_handle.lock().await;
        if !session.pending_handoff.as_ref()?.ready_after_tool_result {
            return None;
        }
        let pending = session.pending_handoff.take()?;
        drop(session);
        self.set_state(session_id, AgentCoreState::HandoffPending).await;
        Some(AgentResponse::Handoff { target_agent: pending.target_agent, context: pending.context })
    }

    /// Explicit programmatic handoff, used by decision-node end states
    /// (§4.4) rather than a handoff *tool* invocation.
    #[instrument(skip(self), fields(session_id = %session_id, target_agent = %target_agent))]
    pub async fn request_handoff(&self, session_id: &str, target_agent: &str) -> AgentResponse {
        let Some(session_handle) = self.session_store.get(session_id).await else {
            return AgentResponse::Error { message: format!("unknown session {session_id:?}") };
        };
        let mut session = session_handle.lock().await;
        let context = self.build_handoff_context(&session, None);
        self.stage_handoff(&mut session, target_agent.to_string(), context.clone());
        self.set_state(session_id, AgentCoreState::HandoffPending).await;
        AgentResponse::Handoff { target_agent: target_agent.to_string(), context }
    }

    /// Dispatch one or more tool calls requested by the model. Adapters
    /// call this, then feed each [`ToolResult`] back through
    /// `deliver_tool_result`.
    pub async fn dispatch_tool(
        &self,
        session_id: &str,
        tool_name: &str,
        input: Value,
        tool_use_id: &str,
    ) -> ToolResult {
        let Some(session_handle) = self.session_store.get(session_id).await else {
            return ToolResult {
                tool_use_id: tool_use_id.to_string(),
                success: false,
                result: None,
                error: Some("unknown session".to_string()),
            };
        };
        let mut session = session_handle.lock().await;
        let last_user_utterance = last_user_utterance(&session);
        let conversation_summary = conversation_excerpt(&session, self.history_window);
        self.set_state(session_id, AgentCoreState::AwaitingToolResult).await;
        self.tool_dispatcher
            .invoke(
                &mut session,
                &self.persona.allowed_tools,
                tool_name,
                input,
                tool_use_id,
                last_user_utterance,
                conversation_summary,
            )
            .await
    }

    async fn continue_conversation(&self, session: &mut Session) -> AgentResponse {
        let (system_prompt, history, tools) = self.compose_prompt(session);

        match self.llm.converse(&system_prompt, &history, &tools).await {
            Err(err) => {
                session.record_error();
                AgentResponse::Error { message: err.to_string() }
            }
            Ok(ConverseOutcome::ToolCalls { calls }) => {
                for call in &calls {
                    session.push_turn(
                        TurnRole::Assistant,
                        TurnContent::ToolCall {
                            tool_use_id: call.tool_use_id.clone(),
                            tool_name: call.name.clone(),
                            input: call.input.clone(),
                        },
                        true,
                    );
                }
                let calls = calls
                    .into_iter()
                    .map(|c| PendingToolCall { tool_name: c.name, tool_use_id: c.tool_use_id, input: c.input })
                    .collect();
                AgentResponse::ToolCall { calls }
            }
            Ok(ConverseOutcome::Text { content }) => {
                let (maybe_node, stripped) = workflow::parse_step_tag(&content);
                if let Some(node_id) = maybe_node {
                    if workflow::is_known_node(&self.workflow, &node_id) {
                        session.workflow_state.node_id = node_id;
                    } else {
                        warn!(node_id, "model reported an unknown workflow node; accepting anyway");
                        session.workflow_state.node_id = node_id;
                    }
                }

                if let Some(resp) = self.drain_decision_nodes(session).await {
                    return resp;
                }

                session.push_turn(TurnRole::Assistant, TurnContent::Text { text: stripped.to_string() }, true);
                AgentResponse::Text { content: stripped.to_string() }
            }
        }
    }

    /// Walk any chain of `decision` nodes the session currently sits on,
    /// classifying each one, until a non-decision node or a handoff is
    /// reached. Returns `Some` only when the chain resolves to a handoff.
    async fn drain_decision_nodes(&self, session: &mut Session) -> Option<AgentResponse> {
        // A validated graph never chains decision nodes indefinitely (§8
        // invariant 4), but this guard keeps a malformed one from hanging a
        // session rather than trusting that invariant at runtime.
        const MAX_DECISION_HOPS: usize = 32;
        for _ in 0..MAX_DECISION_HOPS {
            let node = self.workflow.node(&session.workflow_state.node_id)?;
            if node.kind != NodeKind::Decision {
                return None;
            }
            let excerpt = conversation_excerpt(session, self.history_window);
            let memory_json = serde_json::to_value(&session.memory).unwrap_or(Value::Null);
            let ctx = AdvanceContext { conversation_excerpt: &excerpt, memory: &memory_json };
            let advanced = workflow::advance(
                &self.workflow,
                &session.workflow_state.node_id,
                &ctx,
                &self.classifier,
                None,
            )
            .await;
            if let Some(resp) = self.apply_advance(session, advanced) {
                return Some(resp);
            }
        }
        warn!("decision-node chain exceeded safety cap; halting further auto-advance this turn");
        None
    }

    /// Apply an [`AdvanceResult`] to `session`. Returns `Some` when the
    /// result terminates this turn (a handoff), `None` when the caller
    /// should keep going (including when the graph halted).
    fn apply_advance(&self, session: &mut Session, advanced: AdvanceResult) -> Option<AgentResponse> {
        match advanced {
            AdvanceResult::Next { next_node_id, outcome } => {
                session.workflow_state.node_id = next_node_id;
                if let Some(outcome) = outcome {
                    session.workflow_state.outcomes.push(outcome.label);
                }
                None
            }
            AdvanceResult::Halt { .. } => None,
            AdvanceResult::Done { .. } => None,
            AdvanceResult::Handoff { target_agent, outcome } => {
                if let Some(outcome) = outcome {
                    session.workflow_state.outcomes.push(outcome.label);
                }
                let context = self.build_handoff_context(session, None);
                self.stage_handoff(session, target_agent.clone(), context.clone());
                Some(AgentResponse::Handoff { target_agent, context })
            }
        }
    }

    fn stage_handoff(&self, session: &mut Session, target_agent: String, context: HandoffContext) {
        session.pending_handoff = Some(conduit_handoff::PendingHandoff {
            target_agent,
            context,
            ready_after_tool_result: false,
        });
    }

    fn build_handoff_context(&self, session: &Session, reason: Option<String>) -> HandoffContext {
        build_context(
            last_user_utterance(session),
            session.memory.clone(),
            WorkflowStateSnapshot {
                node_id: session.workflow_state.node_id.clone(),
                outcomes: session.workflow_state.outcomes.clone(),
            },
            conversation_excerpt(session, self.history_window),
            reason,
        )
    }

    /// Renders `base_prompt` with the session's current memory appended, the
    /// same way [`Self::compose_prompt`] does for the LLM. Used by the Voice
    /// Adapter to refresh Sonic's system prompt after a tool call updates
    /// memory (§4.5), since the adapter only holds the static persona/voice
    /// prompt built at startup and has no memory-rendering logic of its own.
    pub async fn render_session_prompt(&self, session_id: &str, base_prompt: &str) -> Option<String> {
        let session = self.session_store.get(session_id).await?;
        let guard = session.lock().await;
        let relevant_keys: Vec<String> = self
            .workflow
            .node(&guard.workflow_state.node_id)
            .map(|n| n.relevant_memory_keys.clone())
            .unwrap_or_default();
        let memory_block = render_memory(&guard, &relevant_keys);
        Some(format!("{base_prompt}\n{memory_block}"))
    }

    fn compose_prompt(&self, session: &Session) -> (String, Vec<ChatMessage>, Vec<ToolSpecRef>) {
        let relevant_keys: Vec<String> = self
            .workflow
            .node(&session.workflow_state.node_id)
            .map(|n| n.relevant_memory_keys.clone())
            .unwrap_or_default();

        let memory_block = render_memory(session, &relevant_keys);
        let graph_prompt = workflow::system_prompt_text(&self.workflow, &relevant_keys);

        let system_prompt = format!(
            "{persona_prompt}\n\n{graph_prompt}\n{memory_block}",
            persona_prompt = self.persona.system_prompt
        );

        let history: Vec<ChatMessage> = session
            .transcript
            .iter()
            .rev()
            .take(self.history_window)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .filter_map(turn_to_chat_message)
            .collect();

        let allowed = self.tool_dispatcher.registry().allowed_for(&self.persona.allowed_tools);
        let tools: Vec<ToolSpecRef> = self
            .tool_dispatcher
            .registry()
            .list_specs()
            .into_iter()
            .filter(|spec| allowed.contains(&spec.name))
            .map(|spec| ToolSpecRef {
                name: spec.name.clone(),
                description: spec.description.clone(),
                input_schema: spec.input_schema.clone(),
            })
            .collect();

        (system_prompt, history, tools)
    }
}

fn render_memory(session: &Session, relevant_keys: &[String]) -> String {
    if session.memory.is_empty() {
        return String::new();
    }
    let mut out = String::from("Known facts about this conversation:\n");
    for (key, value) in session.memory.iter() {
        if !relevant_keys.is_empty() && !relevant_keys.iter().any(|k| k == key) {
            continue;
        }
        out.push_str(&format!("- {key}: {value:?}\n"));
    }
    out
}

fn turn_to_chat_message(turn: &Turn) -> Option<ChatMessage> {
    match (&turn.role, &turn.content) {
        (TurnRole::User, TurnContent::Text { text }) => Some(ChatMessage::user(text.clone())),
        (TurnRole::Assistant, TurnContent::Text { text }) => Some(ChatMessage::assistant(text.clone())),
        (TurnRole::Assistant, TurnContent::ToolCall { tool_name, .. }) => {
            Some(ChatMessage::assistant(format!("(called tool {tool_name})")))
        }
        (TurnRole::Tool, TurnContent::ToolResult { tool_use_id, success, result }) => {
            let content = if *success {
                result.to_string()
            } else {
                format!("error: {result}")
            };
            Some(ChatMessage::tool_result(tool_use_id.clone(), content))
        }
        (TurnRole::System, TurnContent::Text { text }) => {
            Some(ChatMessage { role: ChatRole::System, content: Some(text.clone()), tool_call_id: None })
        }
        _ => None,
    }
}

fn conversation_excerpt(session: &Session, window: usize) -> String {
    session
        .transcript
        .iter()
        .rev()
        .take(window)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .filter_map(turn_to_chat_message)
        .map(|m| format!("{:?}: {}", m.role, m.content.unwrap_or_default()))
        .collect::<Vec<_>>()
        .join("\n")
}

fn last_user_utterance(session: &Session) -> String {
    session
        .transcript
        .iter()
        .rev()
        .find_map(|t| match (&t.role, &t.content) {
            (TurnRole::User, TurnContent::Text { text }) => Some(text.clone()),
            _ => None,
        })
        .unwrap_or_default()
}

impl<B: ToolBackend> AgentCore<B> {
    async fn reflect_state(&self, session_id: &str, response: &AgentResponse) {
        let state = match response {
            AgentResponse::Text { .. } => AgentCoreState::Idle,
            AgentResponse::ToolCall { .. } => AgentCoreState::AwaitingToolResult,
            AgentResponse::Handoff { .. } => AgentCoreState::HandoffPending,
            AgentResponse::Error { .. } => AgentCoreState::Idle,
        };
        info!(session_id, ?state, "agent core turn complete");
        self.set_state(session_id, state).await;
    }
}
