//! The client-stream protocol demultiplexer (§4.7, §6): one task per
//! connection, translating binary frames to Sonic audio and JSON frames to
//! [`ClientInbound`] messages, and enforcing the per-session circuit
//! breaker, auto-trigger, and delayed handoff emission along the way.

use std::sync::Arc;
use std::time::Duration;

use conduit_core::{drive_to_terminal, AgentResponse, ConversationStep};
use conduit_gateway::{GatewayClient, TransferRequest};
use conduit_handoff::Memory;
use conduit_protocol::{ClientInbound, ClientOutbound, WorkflowStateWire};
use conduit_session::SessionMode;
use conduit_voice::VoiceOutboundEvent;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{info, warn};

use crate::process::AgentProcess;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Drive one client connection end to end. Returns once the socket closes
/// or the session is torn down (handoff, fatal error, circuit breaker trip).
pub async fn handle_connection(tcp: TcpStream, process: Arc<AgentProcess>, gateway: GatewayClient) {
    let ws = match tokio_tungstenite::accept_async(tcp).await {
        Ok(ws) => ws,
        Err(err) => {
            warn!(%err, "websocket handshake failed");
            return;
        }
    };
    let (mut sink, mut source) = ws.split();

    let Some(session_id) = init_session(&process, &mut sink, &mut source).await else {
        return;
    };
    info!(session_id, "session stream started");

    let (voice_tx, mut voice_rx) = mpsc::channel::<VoiceOutboundEvent>(64);
    let auto_trigger_deadline = auto_trigger_sleep(&process);
    let mut user_spoke = false;

    loop {
        tokio::select! {
            biased;

            Some(event) = voice_rx.recv(), if process.voice.is_some() => {
                if !forward_voice_event(event, &mut sink).await {
                    break;
                }
            }

            () = sleep_or_pending(auto_trigger_deadline), if !user_spoke => {
                user_spoke = true; // fires at most once per session (`Session::autotrigger_fired`)
                let utterance = match process.agent_core.persona().auto_trigger.as_ref() {
                    Some(spec) => {
                        let Some(session) = process.agent_core.session_store().get(&session_id).await else {
                            continue;
                        };
                        let mut guard = session.lock().await;
                        if guard.autotrigger_fired || !spec.preconditions_met(&guard.memory) {
                            continue;
                        }
                        guard.autotrigger_fired = true;
                        spec.render_utterance(&guard.memory)
                    }
                    None => continue,
                };
                let out = run_auto_trigger(&process, &session_id, &utterance).await;
                if !send_all(&mut sink, out, &process, &gateway, &session_id).await {
                    break;
                }
            }

            msg = source.next() => {
                let Some(msg) = msg else { break };
                let Ok(msg) = msg else { break };
                match msg {
                    Message::Binary(bytes) => {
                        if let Some(voice) = &process.voice {
                            let _ = voice.handle_client_audio(&session_id, bytes.to_vec(), None, voice_tx.clone()).await;
                        }
                    }
                    Message::Text(text) => {
                        user_spoke = true;
                        if !dispatch_inbound(&text, &process, &gateway, &session_id, &mut sink).await {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    }

    if let Some(voice) = &process.voice {
        voice.close(&session_id).await;
    }
    process.agent_core.session_store().delete(&session_id).await;
    info!(session_id, "session stream closed");
}

async fn init_session(process: &Arc<AgentProcess>, sink: &mut WsSink, source: &mut WsSource) -> Option<String> {
    let first = source.next().await?.ok()?;
    let Message::Text(raw) = first else {
        return None;
    };
    let inbound: ClientInbound = serde_json::from_str(&raw).ok()?;
    let ClientInbound::SessionInit { session_id, memory, workflow_state: _, .. } = inbound else {
        return None;
    };
    let session_id = session_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let mode = match process.config.mode {
        conduit_config::Mode::Voice => SessionMode::Voice,
        conduit_config::Mode::Text => SessionMode::Text,
        conduit_config::Mode::Hybrid => SessionMode::Hybrid,
    };

    // Duplicate `session_init` for a live session id is a hard failure
    // (resolved Open Question) rather than silently reusing the old state.
    if let Err(err) = process.agent_core.session_store().create(session_id.clone(), mode, memory.unwrap_or_default()).await
    {
        let _ = send_json(sink, ClientOutbound::error(err.to_string(), true)).await;
        return None;
    }

    let mode_str = match mode {
        SessionMode::Voice => "voice",
        SessionMode::Text => "text",
        SessionMode::Hybrid => "hybrid",
    };
    send_json(sink, ClientOutbound::Connected { session_id: session_id.clone(), mode: mode_str.to_string() }).await.ok()?;
    send_json(sink, ClientOutbound::SessionStart { session_id: session_id.clone() }).await.ok()?;
    Some(session_id)
}

/// Only schedules the auto-trigger sleep when it is both process-wide
/// enabled (`AUTO_TRIGGER_ENABLED`) and this persona opts in with an
/// `auto_trigger` spec (§4.7: "certain agents"). A persona without one
/// never auto-fires, however the global flag is set.
fn auto_trigger_sleep(process: &AgentProcess) -> Option<tokio::time::Instant> {
    if process.config.session.auto_trigger_enabled && process.agent_core.persona().auto_trigger.is_some() {
        Some(tokio::time::Instant::now() + Duration::from_millis(process.config.session.auto_trigger_delay_ms))
    } else {
        None
    }
}

/// Takes the deadline by value (`Instant` is `Copy`) rather than mutating
/// shared state: `select!` polls every branch's future once per loop
/// iteration, including ones that don't win, so a version that consumed the
/// deadline as a side effect of merely being polled would permanently
/// disarm the timer the first time any other branch (a voice event, an
/// inbound audio chunk) completed first. The `user_spoke` guard on the
/// select arm, not this function, is what ensures the auto-trigger fires at
/// most once.
async fn sleep_or_pending(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn dispatch_inbound(
    raw: &str,
    process: &Arc<AgentProcess>,
    gateway: &GatewayClient,
    session_id: &str,
    sink: &mut WsSink,
) -> bool {
    let inbound: ClientInbound = match serde_json::from_str(raw) {
        Ok(m) => m,
        Err(err) => {
            return send_json(sink, ClientOutbound::error(format!("bad message: {err}"), false)).await.is_ok();
        }
    };

    let out = match inbound {
        ClientInbound::SessionInit { .. } => {
            vec![ClientOutbound::error("session already initialised", false)]
        }
        ClientInbound::TextInput { text, .. } | ClientInbound::UserInput { text } => {
            if let Some(voice) = &process.voice {
                voice.handle_text_input(session_id, &text).await
            } else if let Some(text_adapter) = &process.text {
                text_adapter.handle_text_input(session_id, &text).await
            } else {
                vec![ClientOutbound::error("no adapter configured for this mode", true)]
            }
        }
        ClientInbound::EndAudio => Vec::new(),
        ClientInbound::UpdateConfig { .. } => Vec::new(),
        ClientInbound::MemoryUpdate { memory, graph_state } => {
            apply_memory_update(process, session_id, memory, graph_state).await;
            Vec::new()
        }
    };

    send_all(sink, out, process, gateway, session_id).await
}

/// Synthesise the one auto-trigger utterance (§4.7, §8 invariant 3) from the
/// persona's `auto_trigger.utterance_template` rendered against session
/// memory (e.g. `"12345678 112233"` for identity verification), and drive
/// Agent Core with it exactly as if the user had spoken it.
async fn run_auto_trigger(process: &Arc<AgentProcess>, session_id: &str, utterance: &str) -> Vec<ClientOutbound> {
    let initial = process.agent_core.process_user_utterance(session_id, utterance).await;
    let steps = drive_to_terminal(&*process.agent_core, session_id, initial).await;
    let mut out = Vec::new();
    for step in steps {
        push_step(step, &mut out);
    }
    out
}

fn push_step(step: ConversationStep, out: &mut Vec<ClientOutbound>) {
    match step {
        ConversationStep::ToolDispatched { tool_name, tool_use_id, input } => {
            out.push(ClientOutbound::ToolUse { tool_use_id, tool_name, input });
        }
        ConversationStep::ToolResolved(result) => {
            if result.success {
                out.push(ClientOutbound::ToolResult { tool_use_id: result.tool_use_id, success: true, result: result.result });
            } else {
                out.push(ClientOutbound::ToolError { tool_use_id: result.tool_use_id, error: result.error.unwrap_or_default() });
            }
        }
        ConversationStep::Final(resp) => push_final(resp, out),
    }
}

fn push_final(resp: AgentResponse, out: &mut Vec<ClientOutbound>) {
    match resp {
        AgentResponse::Text { content } => out.push(ClientOutbound::Transcript {
            id: uuid::Uuid::new_v4().to_string(),
            role: "assistant".to_string(),
            text: content,
            is_final: true,
        }),
        AgentResponse::Handoff { target_agent, context } => {
            let graph_state = WorkflowStateWire {
                node_id: context.workflow_state.node_id.clone(),
                outcomes: context.workflow_state.outcomes.clone(),
            };
            out.push(ClientOutbound::HandoffRequest { target_agent_id: target_agent, context, graph_state });
        }
        AgentResponse::Error { message } => out.push(ClientOutbound::error(message, false)),
        AgentResponse::ToolCall { .. } => {}
    }
}

async fn apply_memory_update(
    process: &Arc<AgentProcess>,
    session_id: &str,
    memory: Memory,
    graph_state: Option<WorkflowStateWire>,
) {
    let _ = process.agent_core.session_store().update_memory(session_id, memory).await;
    if let Some(state) = graph_state {
        if let Some(session) = process.agent_core.session_store().get(session_id).await {
            let mut session = session.lock().await;
            session.workflow_state.node_id = state.node_id;
            session.workflow_state.outcomes = state.outcomes;
        }
    }
}

/// Send every message in `out`, applying the handoff confirmation delay and
/// gateway transfer RPC (§4.8) to any `HandoffRequest` found, and tearing
/// the session down if the circuit breaker has tripped. Returns `false` if
/// the connection should close.
async fn send_all(
    sink: &mut WsSink,
    out: Vec<ClientOutbound>,
    process: &Arc<AgentProcess>,
    gateway: &GatewayClient,
    session_id: &str,
) -> bool {
    for msg in out {
        if let ClientOutbound::Error { fatal: true, .. } = &msg {
            let _ = send_json(sink, msg).await;
            return false;
        }
        if let ClientOutbound::HandoffRequest { ref target_agent_id, ref context, .. } = msg {
            tokio::time::sleep(Duration::from_millis(process.config.session.handoff_confirmation_delay_ms)).await;
            if send_json(sink, msg.clone()).await.is_err() {
                return false;
            }
            let req = TransferRequest {
                source_agent: process.config.agent.agent_id.clone(),
                target_agent: target_agent_id.clone(),
                context: context.clone(),
            };
            if let Err(err) = gateway.transfer_session(session_id, &req).await {
                warn!(%err, session_id, "handoff transfer RPC failed after retry");
                let _ = send_json(sink, ClientOutbound::error(format!("handoff failed: {err}"), true)).await;
            }
            return false;
        }
        if send_json(sink, msg).await.is_err() {
            return false;
        }
    }

    if let Some(session) = process.agent_core.session_store().get(session_id).await {
        let mut session = session.lock().await;
        session.maybe_reset_error_window(Duration::from_millis(process.config.session.error_window_ms));
        if session.circuit_open(process.config.session.max_session_errors) {
            drop(session);
            let _ = send_json(sink, ClientOutbound::error("too many errors; closing session", true)).await;
            return false;
        }
    }
    true
}

async fn forward_voice_event(
    event: VoiceOutboundEvent,
    sink: &mut (impl SinkExt<Message, Error = impl std::fmt::Debug> + Unpin),
) -> bool {
    match event {
        VoiceOutboundEvent::Json(msg) => send_json(sink, msg).await.is_ok(),
        VoiceOutboundEvent::Audio(bytes) => sink.send(Message::Binary(bytes.into())).await.is_ok(),
    }
}

async fn send_json(
    sink: &mut (impl SinkExt<Message, Error = impl std::fmt::Debug> + Unpin),
    msg: ClientOutbound,
) -> Result<(), ()> {
    let text = serde_json::to_string(&msg).map_err(|_| ())?;
    sink.send(Message::Text(text.into())).await.map_err(|_| ())
}
