//! Shared fixtures for this crate's own `#[cfg(test)]` modules: a minimal
//! `AgentProcess` built directly (bypassing `AgentProcess::build`'s network
//! calls to local-tools) so `control`/`health`/`stream` can be exercised
//! against real listeners without a live gateway or local-tools backend.

#![cfg(test)]

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use conduit_config::{AgentSection, AppConfig, Mode, SessionSection};
use conduit_core::{AgentCore, Persona};
use conduit_llm::{ChatMessage, ConverseOutcome, LlmClient, LlmError, ToolSpecRef};
use conduit_session::SessionStore;
use conduit_tools::{HttpToolBackend, ToolDispatcher, ToolRegistry};
use conduit_workflow::{Edge, Node, NodeKind, Workflow, WorkflowDef};

use crate::process::AgentProcess;

pub struct ScriptedLlm {
    replies: std::sync::Mutex<Vec<ConverseOutcome>>,
}

impl ScriptedLlm {
    pub fn new(replies: Vec<ConverseOutcome>) -> Arc<Self> {
        Arc::new(Self { replies: std::sync::Mutex::new(replies) })
    }
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
        if replies.is_empty() {
            return Err(LlmError::Transport("scripted replies exhausted".to_string()));
        }
        Ok(replies.remove(0))
    }
}

fn node(id: &str, kind: NodeKind) -> Node {
    Node { id: id.to_string(), kind, label: id.to_string(), tool_name: None, outcome: None, relevant_memory_keys: vec![] }
}

fn edge(from: &str, to: &str) -> Edge {
    Edge { from: from.to_string(), to: to.to_string(), label: None }
}

fn simple_workflow() -> Arc<Workflow> {
    let def = WorkflowDef {
        nodes: vec![node("start", NodeKind::Start), node("end", NodeKind::End)],
        edges: vec![edge("start", "end")],
    };
    Arc::new(Workflow::load(def).unwrap())
}

fn test_persona() -> Arc<Persona> {
    Arc::new(Persona {
        id: "test-persona".into(),
        display_name: "Test".into(),
        voice_id: None,
        allowed_tools: HashSet::new(),
        system_prompt: "You are a test persona.".into(),
        metadata: Default::default(),
        auto_trigger: None,
    })
}

fn test_config() -> AppConfig {
    AppConfig {
        mode: Mode::Text,
        agent: AgentSection { agent_id: "test-agent".to_string(), ..Default::default() },
        session: SessionSection { max_session_errors: 5, error_window_ms: 60_000, ..Default::default() },
        ..Default::default()
    }
}

/// An `AgentProcess` whose LLM always fails — usable anywhere the LLM is
/// never actually invoked (control socket and health endpoint tests).
pub fn fake_process() -> AgentProcess {
    process_with_llm(ScriptedLlm::new(Vec::new()), test_config())
}

/// An `AgentProcess` driven by `llm`, with `config` overriding the defaults
/// from [`test_config`] (e.g. a tighter `max_session_errors` for circuit
/// breaker tests).
pub fn process_with_llm(llm: Arc<ScriptedLlm>, config: AppConfig) -> AgentProcess {
    process_with_llm_and_persona(llm, config, test_persona())
}

/// As [`process_with_llm`], but with a caller-supplied persona — used by
/// tests that need a non-default `auto_trigger` spec.
pub fn process_with_llm_and_persona(llm: Arc<ScriptedLlm>, config: AppConfig, persona: Arc<Persona>) -> AgentProcess {
    let dispatcher = Arc::new(ToolDispatcher::new(
        ToolRegistry::default(),
        config.agent.agent_id.clone(),
        HttpToolBackend::new("http://127.0.0.1:1"),
        Duration::from_secs(1),
    ));
    let agent_core =
        Arc::new(AgentCore::new(simple_workflow(), persona.clone(), dispatcher, SessionStore::new(), llm, 20));
    let text = Some(Arc::new(conduit_text::TextAdapter::new(agent_core.clone())));
    AgentProcess { config, agent_core, voice: None, text }
}

pub fn default_config() -> AppConfig {
    test_config()
}
