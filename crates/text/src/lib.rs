//! Text Adapter (C6): the plain request/response counterpart to the Voice
//! Adapter. No speech collaborator sits in front of Agent Core here — every
//! client text turn drives Agent Core directly.

use std::sync::Arc;

use conduit_core::{drive_to_terminal, AgentCore, AgentResponse, ConversationStep};
use conduit_protocol::ClientOutbound;
use conduit_tools::ToolBackend;

pub struct TextAdapter<B: ToolBackend> {
    agent_core: Arc<AgentCore<B>>,
}

impl<B: ToolBackend> TextAdapter<B> {
    pub fn new(agent_core: Arc<AgentCore<B>>) -> Self {
        Self { agent_core }
    }

    /// Handle one inbound text turn: echo it to the client first,
    /// drive Agent Core to a terminal response — dispatching any requested
    /// tools along the way and emitting `tool_use`/`tool_result` for each —
    /// and translate the terminal response into its client message. A blank
    /// utterance is echoed but never handed to Agent Core, matching the
    /// Voice Adapter's handling of an empty final transcript.
    pub async fn handle_text_input(&self, session_id: &str, text: &str) -> Vec<ClientOutbound> {
        let out = vec![ClientOutbound::Transcript {
            id: new_id(),
            role: "user".to_string(),
            text: text.to_string(),
            is_final: true,
        }];
        if text.trim().is_empty() {
            return out;
        }

        let mut out = out;
        let initial = self.agent_core.process_user_utterance(session_id, text).await;
        let steps = drive_to_terminal(&self.agent_core, session_id, initial).await;
        for step in steps {
            push_step(step, &mut out);
        }
        out
    }
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
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
            let graph_state = conduit_protocol::WorkflowStateWire {
                node_id: context.workflow_state.node_id.clone(),
                outcomes: context.workflow_state.outcomes.clone(),
            };
            out.push(ClientOutbound::HandoffRequest { target_agent_id: target_agent, context, graph_state });
        }
        AgentResponse::Error { message } => out.push(ClientOutbound::error(message, false)),
        AgentResponse::ToolCall { .. } => {}
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
            _input: serde_json::Value,
            _timeout: Duration,
        ) -> Result<serde_json::Value, ToolError> {
            Ok(json!({"balance": 42}))
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

    fn adapter_with(replies: Vec<ConverseOutcome>) -> TextAdapter<StubBackend> {
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
        TextAdapter::new(core)
    }

    #[tokio::test]
    async fn plain_text_reply_echoes_user_turn_then_assistant_reply() {
        let adapter = adapter_with(vec![ConverseOutcome::Text { content: "[STEP: end] Hi there.".into() }]);
        adapter.agent_core.session_store().create("s1".into(), SessionMode::Text, Memory::new()).await.unwrap();

        let out = adapter.handle_text_input("s1", "hello").await;

        assert_eq!(out.len(), 2);
        assert!(matches!(&out[0], ClientOutbound::Transcript { role, text, .. } if role == "user" && text == "hello"));
        assert!(matches!(&out[1], ClientOutbound::Transcript { role, text, .. } if role == "assistant" && text == "Hi there."));
    }

    #[tokio::test]
    async fn blank_utterance_is_echoed_but_never_reaches_agent_core() {
        let adapter = adapter_with(vec![]);
        adapter.agent_core.session_store().create("s1".into(), SessionMode::Text, Memory::new()).await.unwrap();

        let out = adapter.handle_text_input("s1", "   ").await;

        assert_eq!(out.len(), 1);
        assert!(matches!(&out[0], ClientOutbound::Transcript { role, text, .. } if role == "user" && text == "   "));
    }

    #[tokio::test]
    async fn tool_call_loop_emits_tool_use_then_result_then_final_reply() {
        let adapter = adapter_with(vec![
            ConverseOutcome::ToolCalls {
                calls: vec![RequestedToolCall { tool_use_id: "tu-1".into(), name: "lookup_balance".into(), input: json!({}) }],
            },
            ConverseOutcome::Text { content: "[STEP: end] Your balance is 42.".into() },
        ]);
        adapter.agent_core.session_store().create("s1".into(), SessionMode::Text, Memory::new()).await.unwrap();

        let out = adapter.handle_text_input("s1", "what's my balance").await;

        assert!(matches!(&out[1], ClientOutbound::ToolUse { tool_name, .. } if tool_name == "lookup_balance"));
        assert!(matches!(&out[2], ClientOutbound::ToolResult { success: true, .. }));
        assert!(matches!(out.last().unwrap(), ClientOutbound::Transcript { text, .. } if text == "Your balance is 42."));
    }

    #[tokio::test]
    async fn unknown_tool_surfaces_as_tool_error() {
        let adapter = adapter_with(vec![
            ConverseOutcome::ToolCalls {
                calls: vec![RequestedToolCall { tool_use_id: "tu-1".into(), name: "not_registered".into(), input: json!({}) }],
            },
            ConverseOutcome::Text { content: "[STEP: end] Sorry, I can't do that.".into() },
        ]);
        adapter.agent_core.session_store().create("s1".into(), SessionMode::Text, Memory::new()).await.unwrap();

        let out = adapter.handle_text_input("s1", "do the impossible thing").await;

        assert!(out.iter().any(|m| matches!(m, ClientOutbound::ToolError { .. })));
    }
}
