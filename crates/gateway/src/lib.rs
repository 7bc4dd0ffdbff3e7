//! HTTP client for the Agent ⇄ Gateway surface (§6).
//!
//! The gateway itself is out of scope (§1) — this crate only implements the
//! handful of RPCs the core calls against it: `register`, `heartbeat`,
//! `publish_memory`, `transfer_session`, and the two read-only probes. The
//! upstream-may-be-temporarily-down policy from §4.7/§7 is carried here as
//! a reusable connect-with-backoff helper, mirroring the teacher's
//! `DaemonClient::connect_with_backoff`.

use std::time::Duration;

use conduit_handoff::HandoffContext;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, Serialize)]
pub struct Capabilities {
    pub voice: bool,
    pub text: bool,
    pub mode: String,
    pub persona_id: String,
    pub tools: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegisterRequest {
    pub id: String,
    pub url: String,
    pub port: u16,
    pub capabilities: Capabilities,
}

#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatRequest {
    pub agent_id: String,
    pub active_sessions: usize,
    pub uptime: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryPublishRequest {
    pub memory: conduit_handoff::Memory,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransferRequest {
    pub source_agent: String,
    pub target_agent: String,
    pub context: HandoffContext,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentDescriptor {
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub available: bool,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway request timed out after {0:?}")]
    Timeout(Duration),
    #[error("gateway transport error: {0}")]
    Transport(String),
    #[error("gateway returned an unparsable response: {0}")]
    Malformed(String),
}

fn map_reqwest_err(timeout: Duration) -> impl Fn(reqwest::Error) -> GatewayError {
    move |e: reqwest::Error| {
        if e.is_timeout() {
            GatewayError::Timeout(timeout)
        } else {
            GatewayError::Transport(e.to_string())
        }
    }
}

/// Thin HTTP client against the gateway's `/api/...` surface (§6).
#[derive(Clone)]
pub struct GatewayClient {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl GatewayClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self { client: reqwest::Client::new(), base_url: base_url.into(), timeout }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    pub async fn register(&self, req: &RegisterRequest) -> Result<(), GatewayError> {
        let resp = self
            .client
            .post(self.url("/api/agents/register"))
            .json(req)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(map_reqwest_err(self.timeout))?;
        resp.error_for_status().map_err(|e| GatewayError::Transport(e.to_string()))?;
        Ok(())
    }

    /// `register`, retried up to `max_attempts` times with exponential
    /// backoff starting at 100ms (capped at 2s), mirroring the teacher's
    /// `connect_with_backoff`. The final failure is returned to the caller,
    /// which per §4.7 step 6 logs and continues rather than failing startup.
    pub async fn register_with_backoff(
        &self,
        req: &RegisterRequest,
        max_attempts: usize,
    ) -> Result<(), GatewayError> {
        let mut delay = Duration::from_millis(100);
        let attempts = max_attempts.max(1);
        for attempt in 0..attempts {
            match self.register(req).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    if attempt + 1 == attempts {
                        return Err(err);
                    }
                    warn!(attempt, %err, "gateway register failed; retrying");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_secs(2));
                }
            }
        }
        unreachable!("loop always returns on the final attempt")
    }

    pub async fn heartbeat(&self, req: &HeartbeatRequest) -> Result<(), GatewayError> {
        let resp = self
            .client
            .post(self.url("/api/agents/heartbeat"))
            .json(req)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(map_reqwest_err(self.timeout))?;
        resp.error_for_status().map_err(|e| GatewayError::Transport(e.to_string()))?;
        Ok(())
    }

    pub async fn publish_memory(
        &self,
        session_id: &str,
        req: &MemoryPublishRequest,
    ) -> Result<(), GatewayError> {
        let resp = self
            .client
            .post(self.url(&format!("/api/sessions/{session_id}/memory")))
            .json(req)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(map_reqwest_err(self.timeout))?;
        resp.error_for_status().map_err(|e| GatewayError::Transport(e.to_string()))?;
        Ok(())
    }

    async fn transfer_once(&self, session_id: &str, req: &TransferRequest) -> Result<(), GatewayError> {
        let resp = self
            .client
            .post(self.url(&format!("/api/sessions/{session_id}/transfer")))
            .json(req)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(map_reqwest_err(self.timeout))?;
        resp.error_for_status().map_err(|e| GatewayError::Transport(e.to_string()))?;
        Ok(())
    }

    /// Explicit handoff RPC (§4.8), with the resolved retry policy: one
    /// retry after a fixed 500ms backoff, then surfaced to the caller.
    pub async fn transfer_session(
        &self,
        session_id: &str,
        req: &TransferRequest,
    ) -> Result<(), GatewayError> {
        match self.transfer_once(session_id, req).await {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!(%err, session_id, "handoff transfer RPC failed; retrying once after 500ms");
                tokio::time::sleep(Duration::from_millis(500)).await;
                self.transfer_once(session_id, req).await
            }
        }
    }

    pub async fn get_agent(&self, agent_id: &str) -> Result<AgentDescriptor, GatewayError> {
        let resp = self
            .client
            .get(self.url(&format!("/api/agents/{agent_id}")))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(map_reqwest_err(self.timeout))?;
        let resp = resp.error_for_status().map_err(|e| GatewayError::Transport(e.to_string()))?;
        resp.json().await.map_err(|e| GatewayError::Malformed(e.to_string()))
    }

    pub async fn list_agents(&self) -> Result<Vec<AgentDescriptor>, GatewayError> {
        let resp = self
            .client
            .get(self.url("/api/agents"))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(map_reqwest_err(self.timeout))?;
        let resp = resp.error_for_status().map_err(|e| GatewayError::Transport(e.to_string()))?;
        resp.json().await.map_err(|e| GatewayError::Malformed(e.to_string()))
    }
}
