//! Startup registration and the heartbeat loop (§4.7 step 6, §4.8) against
//! the Agent ⇄ Gateway surface.

use std::sync::Arc;
use std::time::{Duration, Instant};

use conduit_gateway::{Capabilities, GatewayClient, HeartbeatRequest, RegisterRequest};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::process::AgentProcess;

const REGISTER_MAX_ATTEMPTS: usize = 5;

fn capabilities(process: &AgentProcess) -> Capabilities {
    let mode = match process.config.mode {
        conduit_config::Mode::Voice => "voice",
        conduit_config::Mode::Text => "text",
        conduit_config::Mode::Hybrid => "hybrid",
    };
    Capabilities {
        voice: process.voice.is_some(),
        text: process.text.is_some() || process.voice.is_some(),
        mode: mode.to_string(),
        persona_id: process.agent_core.persona().id.clone(),
        tools: process.agent_core.persona().allowed_tools.iter().cloned().collect(),
    }
}

/// Register once at startup. A failure after all retries is logged and the
/// process keeps running (§4.7 step 6) — the gateway may come up later.
pub async fn register_at_startup(process: &AgentProcess, gateway: &GatewayClient) {
    let req = RegisterRequest {
        id: process.config.agent.agent_id.clone(),
        url: format!("http://localhost:{}", process.config.agent.port),
        port: process.config.agent.port,
        capabilities: capabilities(process),
    };
    match gateway.register_with_backoff(&req, REGISTER_MAX_ATTEMPTS).await {
        Ok(()) => info!(agent_id = %process.config.agent.agent_id, "registered with gateway"),
        Err(err) => warn!(%err, "gateway registration failed after retries; continuing without it"),
    }
}

/// Heartbeat every `session.heartbeat_interval_ms` until `shutdown` fires.
pub async fn heartbeat_loop(process: Arc<AgentProcess>, gateway: GatewayClient, mut shutdown: watch::Receiver<bool>) {
    let interval = Duration::from_millis(process.config.session.heartbeat_interval_ms);
    let started_at = Instant::now();
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
        if *shutdown.borrow() {
            break;
        }
        let req = HeartbeatRequest {
            agent_id: process.config.agent.agent_id.clone(),
            active_sessions: process.agent_core.session_store().active_count().await,
            uptime: started_at.elapsed().as_secs(),
        };
        if let Err(err) = gateway.heartbeat(&req).await {
            warn!(%err, "heartbeat failed; will retry on the next interval");
        }
    }
}
