//! Client for the external text-LLM collaborator.
//!
//! The LLM itself is out of scope (§1): this crate only defines the two
//! opaque RPCs the rest of the system calls — `classify` for workflow
//! decision nodes (§4.1) and `converse` for the main per-utterance loop
//! (§4.4) — and a thin HTTP implementation of both.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Role of a single turn handed to `converse`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: ChatRole::System, content: Some(content.into()), tool_call_id: None }
    }
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: ChatRole::User, content: Some(content.into()), tool_call_id: None }
    }
    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: ChatRole::Assistant, content: Some(content.into()), tool_call_id: None }
    }
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Tool,
            content: Some(content.into()),
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

/// A tool the model is permitted to call this turn, as advertised to `converse`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpecRef {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestedToolCall {
    pub tool_use_id: String,
    pub name: String,
    pub input: serde_json::Value,
}

/// Outcome of a `converse` call: either a final text reply or one or more
/// tool invocations the caller must dispatch before continuing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConverseOutcome {
    Text { content: String },
    ToolCalls { calls: Vec<RequestedToolCall> },
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("llm request timed out after {0:?}")]
    Timeout(Duration),
    #[error("llm transport error: {0}")]
    Transport(String),
    #[error("llm returned an unparsable response: {0}")]
    Malformed(String),
}

/// Opaque collaborator interface (§6): `classify` drives workflow decision
/// nodes, `converse` drives the main per-utterance loop. Implementations
/// must never panic — transport failures surface as `LlmError`.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn classify(&self, prompt: &str, choices: &[String]) -> Result<String, LlmError>;

    async fn converse(
        &self,
        system_prompt: &str,
        history: &[ChatMessage],
        tools: &[ToolSpecRef],
    ) -> Result<ConverseOutcome, LlmError>;
}

/// HTTP implementation of [`LlmClient`] against a single configured endpoint.
/// The wire format (`{prompt, choices}` / `{system_prompt, history, tools}`)
/// is an implementation detail of this adapter, not part of the core's
/// contract with the collaborator.
pub struct HttpLlmClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    timeout: Duration,
}

impl HttpLlmClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            timeout,
        }
    }

    fn auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.api_key.is_empty() {
            req
        } else {
            req.bearer_auth(&self.api_key)
        }
    }
}

#[derive(Serialize)]
struct ClassifyRequest<'a> {
    prompt: &'a str,
    choices: &'a [String],
}

#[derive(Deserialize)]
struct ClassifyResponse {
    label: String,
}

#[derive(Serialize)]
struct ConverseRequest<'a> {
    system_prompt: &'a str,
    history: &'a [ChatMessage],
    tools: &'a [ToolSpecRef],
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn classify(&self, prompt: &str, choices: &[String]) -> Result<String, LlmError> {
        let url = format!("{}/classify", self.base_url.trim_end_matches('/'));
        let body = ClassifyRequest { prompt, choices };
        let req = self.auth(self.client.post(&url)).json(&body).timeout(self.timeout);
        let resp = req.send().await.map_err(map_reqwest_err(self.timeout))?;
        let resp = resp.error_for_status().map_err(|e| LlmError::Transport(e.to_string()))?;
        let parsed: ClassifyResponse = resp
            .json()
            .await
            .map_err(|e| LlmError::Malformed(e.to_string()))?;
        Ok(parsed.label)
    }

    async fn converse(
        &self,
        system_prompt: &str,
        history: &[ChatMessage],
        tools: &[ToolSpecRef],
    ) -> Result<ConverseOutcome, LlmError> {
        let url = format!("{}/converse", self.base_url.trim_end_matches('/'));
        let body = ConverseRequest { system_prompt, history, tools };
        let req = self.auth(self.client.post(&url)).json(&body).timeout(self.timeout);
        let resp = req.send().await.map_err(map_reqwest_err(self.timeout))?;
        let resp = resp.error_for_status().map_err(|e| LlmError::Transport(e.to_string()))?;
        let parsed: ConverseOutcome = resp
            .json()
            .await
            .map_err(|e| LlmError::Malformed(e.to_string()))?;
        Ok(parsed)
    }
}

fn map_reqwest_err(timeout: Duration) -> impl Fn(reqwest::Error) -> LlmError {
    move |e: reqwest::Error| {
        if e.is_timeout() {
            LlmError::Timeout(timeout)
        } else {
            LlmError::Transport(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_message_constructors_set_role() {
        let m = ChatMessage::user("hello");
        assert_eq!(m.role, ChatRole::User);
        assert_eq!(m.content.as_deref(), Some("hello"));

        let t = ChatMessage::tool_result("id-1", "ok");
        assert_eq!(t.role, ChatRole::Tool);
        assert_eq!(t.tool_call_id.as_deref(), Some("id-1"));
    }

    #[test]
    fn converse_outcome_serde_roundtrip() {
        let outcome = ConverseOutcome::ToolCalls {
            calls: vec![RequestedToolCall {
                tool_use_id: "tu-1".into(),
                name: "lookup_balance".into(),
                input: serde_json::json!({"account": "123"}),
            }],
        };
        let json = serde_json::to_string(&outcome).unwrap();
        let back: ConverseOutcome = serde_json::from_str(&json).unwrap();
        match back {
            ConverseOutcome::ToolCalls { calls } => assert_eq!(calls.len(), 1),
            _ => panic!("expected ToolCalls variant"),
        }
    }
}
