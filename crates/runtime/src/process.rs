//! Assembles one agent process's fixed collaborators from configuration
//! (§4.7 steps 1-4): load the workflow and persona files, fetch the tool
//! catalogue from local-tools, build Agent Core, and construct whichever
//! adapter(s) the configured mode calls for.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use conduit_config::{AppConfig, Mode};
use conduit_core::{AgentCore, Persona};
use conduit_llm::HttpLlmClient;
use conduit_session::SessionStore;
use conduit_text::TextAdapter;
use conduit_tools::{HttpToolBackend, ToolDispatcher, ToolRegistry, ToolSpec};
use conduit_voice::{SonicClient, VoiceAdapter};
use conduit_workflow::{Workflow, WorkflowDef};
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

/// Appended to the persona's system prompt for voice sessions only (§4.5):
/// rules that only make sense when the model's output becomes speech.
pub const VOICE_RULES_APPENDIX: &str = "\n\nVoice rules:\n\
- Read numbers as individual digits, never as words.\n\
- Speak account numbers and sort codes one digit at a time.\n\
- If interrupted, stop speaking immediately; do not finish the sentence.\n\
- Never produce filler (\"let me check that\") before calling a tool.\n\
- If the caller's utterance is incomplete or unclear, ask them to repeat it rather than guessing.";

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("workflow graph {path} failed validation: {source}")]
    WorkflowInvalid {
        path: String,
        #[source]
        source: conduit_workflow::ValidationError,
    },
    #[error("failed to fetch tool catalogue from local-tools: {0}")]
    ToolCatalogue(#[from] reqwest::Error),
}

#[derive(Deserialize)]
struct ToolListResponse {
    tools: Vec<ToolListEntry>,
}

#[derive(Deserialize)]
struct ToolListEntry {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default = "default_schema")]
    input_schema: serde_json::Value,
}

fn default_schema() -> serde_json::Value {
    serde_json::json!({"type": "object"})
}

pub fn load_workflow(path: &str) -> Result<Arc<Workflow>, StartupError> {
    let raw = fs::read_to_string(path).map_err(|source| StartupError::Read { path: path.to_string(), source })?;
    let def: WorkflowDef =
        serde_json::from_str(&raw).map_err(|source| StartupError::Parse { path: path.to_string(), source })?;
    let workflow =
        Workflow::load(def).map_err(|source| StartupError::WorkflowInvalid { path: path.to_string(), source })?;
    Ok(Arc::new(workflow))
}

pub fn load_persona(path: &str) -> Result<Arc<Persona>, StartupError> {
    let raw = fs::read_to_string(path).map_err(|source| StartupError::Read { path: path.to_string(), source })?;
    let persona =
        Persona::from_json_str(&raw).map_err(|source| StartupError::Parse { path: path.to_string(), source })?;
    Ok(Arc::new(persona))
}

/// `GET {local_tools_url}/tools/list` (§6). A fetch failure fails startup —
/// a process that can't see its own tool catalogue can't safely advertise
/// capabilities to the gateway.
pub async fn fetch_tool_registry(local_tools_url: &str, timeout: Duration) -> Result<ToolRegistry, StartupError> {
    let client = reqwest::Client::new();
    let url = format!("{}/tools/list", local_tools_url.trim_end_matches('/'));
    let resp = client.get(&url).timeout(timeout).send().await?.error_for_status()?;
    let parsed: ToolListResponse = resp.json().await?;

    let mut registry = ToolRegistry::default();
    for entry in parsed.tools {
        registry.register(ToolSpec {
            name: entry.name,
            description: entry.description,
            input_schema: entry.input_schema,
            routing: conduit_tools::RoutingTarget::LocalTools,
        });
    }
    Ok(registry)
}

/// One agent's live, assembled collaborators (§4.4-§4.7). Built once at
/// startup and shared across every session the process serves.
pub struct AgentProcess {
    pub config: AppConfig,
    pub agent_core: Arc<AgentCore<HttpToolBackend>>,
    pub voice: Option<Arc<VoiceAdapter<HttpToolBackend>>>,
    pub text: Option<Arc<TextAdapter<HttpToolBackend>>>,
}

impl AgentProcess {
    pub async fn build(config: AppConfig, sonic: Arc<dyn SonicClient>) -> Result<Self, StartupError> {
        let workflow = load_workflow(&config.agent.workflow_file)?;
        let persona = load_persona(&config.agent.persona_file)?;

        let registry = fetch_tool_registry(&config.upstream.local_tools_url, config.tool_rpc_timeout()).await?;
        info!(tool_count = registry.list_specs().len(), "fetched tool catalogue from local-tools");

        let backend = HttpToolBackend::new(config.upstream.local_tools_url.clone());
        let dispatcher =
            Arc::new(ToolDispatcher::new(registry, config.agent.agent_id.clone(), backend, config.tool_rpc_timeout()));

        let llm = Arc::new(HttpLlmClient::new(
            config.upstream.llm_url.clone(),
            config.upstream.llm_api_key.clone(),
            config.llm_rpc_timeout(),
        ));

        let agent_core = Arc::new(AgentCore::new(
            workflow,
            persona.clone(),
            dispatcher,
            SessionStore::new(),
            llm,
            config.session.history_window_turns,
        ));

        // §4.7/§9: hybrid mode constructs only the Voice Adapter; its
        // `handle_text_input` path serves `text_input` messages directly, so
        // the Text Adapter is never instantiated alongside it.
        let (voice, text) = match config.mode {
            Mode::Voice | Mode::Hybrid => {
                let voice_prompt = format!("{}{}", persona.system_prompt, VOICE_RULES_APPENDIX);
                (Some(Arc::new(VoiceAdapter::new(agent_core.clone(), sonic, voice_prompt))), None)
            }
            Mode::Text => (None, Some(Arc::new(TextAdapter::new(agent_core.clone())))),
        };

        Ok(Self { config, agent_core, voice, text })
    }
}

/// Stand-in for the real Sonic transport, which is out of scope (§1). Used
/// until a concrete vendor transport is wired in; every call fails loudly
/// rather than silently pretending to speak.
pub struct UnconfiguredSonicClient;

#[async_trait::async_trait]
impl SonicClient for UnconfiguredSonicClient {
    async fn open(
        &self,
        _session_id: &str,
        _system_prompt: &str,
        _voice_id: Option<&str>,
        _events: tokio::sync::mpsc::Sender<conduit_voice::SonicEvent>,
    ) -> Result<Box<dyn conduit_voice::SonicStream>, conduit_voice::SonicError> {
        warn!("no Sonic transport configured; voice session cannot start");
        Err(conduit_voice::SonicError::OpenFailed("sonic transport not configured".to_string()))
    }
}
