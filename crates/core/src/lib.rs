//! Agent Core (C4): the voice-agnostic processing heart of one agent
//! process. See `agent_core::AgentCore`.

mod agent_core;
mod classifier;
mod conversation;
mod persona;
mod response;

pub use agent_core::AgentCore;
pub use classifier::LlmDecisionClassifier;
pub use conversation::{drive_to_terminal, ConversationStep};
pub use persona::{AutoTriggerSpec, Persona};
pub use response::{AgentCoreState, AgentResponse, PendingToolCall};

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use conduit_handoff::Memory;
    use conduit_llm::{ChatMessage, ConverseOutcome, LlmClient, LlmError, ToolSpecRef};
    use conduit_session::{SessionMode, SessionStore};
    use conduit_tools::{ToolBackend, ToolDispatcher, ToolError, ToolRegistry};
    use conduit_workflow::{Edge, Node, NodeKind, Workflow, WorkflowDef};
    use serde_json::json;

    use super::*;

    fn node(id: &str, kind: NodeKind) -> Node {
        Node {
            id: id.to_string(),
            kind,
            label: id.to_string(),
            tool_name: None,
            outcome: None,
            relevant_memory_keys: Vec::new(),
        }
    }

    fn edge(from: &str, to: &str, label: Option<&str>) -> Edge {
        Edge { from: from.to_string(), to: to.to_string(), label: label.map(|s| s.to_string()) }
    }

    fn simple_workflow() -> Arc<Workflow> {
        let def = WorkflowDef {
            nodes: vec![node("start", NodeKind::Start), node("chat", NodeKind::Process), node("end", NodeKind::End)],
            edges: vec![edge("start", "chat", None), edge("chat", "end", None)],
        };
        Arc::new(Workflow::load(def).unwrap())
    }

    fn test_persona() -> Arc<Persona> {
        Arc::new(Persona {
            id: "triage".into(),
            display_name: "Triage".into(),
            voice_id: None,
            allowed_tools: HashSet::new(),
            system_prompt: "You are triage.".into(),
            metadata: Default::default(),
            auto_trigger: None,
        })
    }

    struct ScriptedLlm {
        replies: std::sync::Mutex<Vec<ConverseOutcome>>,
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
            let mut replies = self.replies.lock().unwrap();
            Ok(replies.remove(0))
        }
    }

    struct NoopBackend;
    #[async_trait]
    impl ToolBackend for NoopBackend {
        async fn execute(&self, _b: &str, _n: &str, _i: serde_json::Value, _t: Duration) -> Result<serde_json::Value, ToolError> {
            Ok(json!({}))
        }
    }

    fn core_with(replies: Vec<ConverseOutcome>) -> AgentCore<NoopBackend> {
        let workflow = simple_workflow();
        let persona = test_persona();
        let llm = Arc::new(ScriptedLlm { replies: std::sync::Mutex::new(replies) });
        let dispatcher = Arc::new(ToolDispatcher::new(ToolRegistry::default(), "triage", NoopBackend, Duration::from_secs(1)));
        AgentCore::new(workflow, persona, dispatcher, SessionStore::new(), llm, 20)
    }

    #[tokio::test]
    async fn text_reply_strips_step_tag_and_updates_node() {
        let core = core_with(vec![ConverseOutcome::Text { content: "[STEP: chat] Hi there!".into() }]);
        core.session_store().create("s1".into(), SessionMode::Text, Memory::new()).await.unwrap();
        let resp = core.process_user_utterance("s1", "hello").await;
        match resp {
            AgentResponse::Text { content } => assert_eq!(content, "Hi there!"),
            other => panic!("unexpected {other:?}"),
        }
        let session = core.session_store().get("s1").await.unwrap();
        assert_eq!(session.lock().await.workflow_state.node_id, "chat");
    }

    #[tokio::test]
    async fn unknown_session_yields_error_response() {
        let core = core_with(vec![]);
        let resp = core.process_user_utterance("missing", "hi").await;
        assert!(matches!(resp, AgentResponse::Error { .. }));
    }

    #[tokio::test]
    async fn tool_call_reply_is_surfaced_for_dispatch() {
        use conduit_llm::RequestedToolCall;
        let core = core_with(vec![ConverseOutcome::ToolCalls {
            calls: vec![RequestedToolCall { tool_use_id: "tu-1".into(), name: "lookup_balance".into(), input: json!({}) }],
        }]);
        core.session_store().create("s1".into(), SessionMode::Text, Memory::new()).await.unwrap();
        let resp = core.process_user_utterance("s1", "what's my balance").await;
        match resp {
            AgentResponse::ToolCall { calls } => {
                assert_eq!(calls.len(), 1);
                assert_eq!(calls[0].tool_name, "lookup_balance");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn explicit_handoff_stages_pending_handoff() {
        let core = core_with(vec![]);
        core.session_store().create("s1".into(), SessionMode::Text, Memory::new()).await.unwrap();
        let resp = core.request_handoff("s1", "banking").await;
        match resp {
            AgentResponse::Handoff { target_agent, .. } => assert_eq!(target_agent, "banking"),
            other => panic!("unexpected {other:?}"),
        }
        let session = core.session_store().get("s1").await.unwrap();
        assert!(session.lock().await.pending_handoff.is_some());
    }

    #[tokio::test]
    async fn render_session_prompt_reflects_current_memory() {
        let core = core_with(vec![]);
        core.session_store().create("s1".into(), SessionMode::Text, Memory::new()).await.unwrap();

        let before = core.render_session_prompt("s1", "base prompt").await.unwrap();
        assert!(!before.contains("account_number"));

        let mut patch = Memory::new();
        patch.insert("account_number".into(), "12345678".into());
        core.session_store().update_memory("s1", patch).await.unwrap();

        let after = core.render_session_prompt("s1", "base prompt").await.unwrap();
        assert!(after.contains("account_number"));
        assert!(after.starts_with("base prompt"));
    }
}
