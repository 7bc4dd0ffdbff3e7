//! Shared tool-dispatch loop used by both adapters (C5's text-input path and
//! C6) to drive an [`AgentResponse::ToolCall`] to a terminal response (§4.6:
//! "dispatch the tool(s) ... then re-invoke Agent Core ... repeat until the
//! response is Text, Handoff, or Error").
//!
//! Factored out of the adapters themselves so the dispatch-then-continue
//! loop has exactly one implementation, each adapter only translating the
//! resulting [`ConversationStep`]s into its own wire format (JSON messages
//! for text, Sonic tool-result frames plus JSON UI feedback for voice).

use conduit_tools::{ToolBackend, ToolResult};

use crate::agent_core::AgentCore;
use crate::response::{AgentResponse, PendingToolCall};

/// One step produced while draining a `ToolCall` response to completion.
#[derive(Debug, Clone)]
pub enum ConversationStep {
    ToolDispatched { tool_name: String, tool_use_id: String, input: serde_json::Value },
    ToolResolved(ToolResult),
    Final(AgentResponse),
}

/// Drive `initial` to completion, dispatching any requested tool calls
/// concurrently and feeding each result back through `deliver_tool_result`,
/// looping until a `Text`, `Handoff`, or `Error` response is reached.
pub async fn drive_to_terminal<B: ToolBackend>(
    core: &AgentCore<B>,
    session_id: &str,
    initial: AgentResponse,
) -> Vec<ConversationStep> {
    let mut steps = Vec::new();
    let mut current = initial;

    loop {
        match current {
            AgentResponse::ToolCall { calls } => {
                let results = dispatch_all(core, session_id, &calls, &mut steps).await;
                // §4.6: dispatch concurrently, then re-invoke Agent Core for
                // the follow-up once every result has landed.
                let mut next = AgentResponse::Text { content: String::new() };
                for result in results {
                    steps.push(ConversationStep::ToolResolved(result.clone()));
                    next = core.deliver_tool_result(session_id, &result.tool_use_id, result).await;
                }
                current = next;
            }
            terminal => {
                let is_text = matches!(terminal, AgentResponse::Text { .. });
                steps.push(ConversationStep::Final(terminal));
                // §4.8: a handoff tool stages `pending_handoff` but returns a
                // plain success result so the model can speak a brief
                // confirmation first; only once that confirmation has been
                // surfaced does the handoff itself become a step here.
                if is_text {
                    if let Some(handoff) = core.finalize_pending_handoff(session_id).await {
                        steps.push(ConversationStep::Final(handoff));
                    }
                }
                break;
            }
        }
    }

    steps
}

async fn dispatch_all<B: ToolBackend>(
    core: &AgentCore<B>,
    session_id: &str,
    calls: &[PendingToolCall],
    steps: &mut Vec<ConversationStep>,
) -> Vec<ToolResult> {
    for call in calls {
        steps.push(ConversationStep::ToolDispatched {
            tool_name: call.tool_name.clone(),
            tool_use_id: call.tool_use_id.clone(),
            input: call.input.clone(),
        });
    }
    // §4.6: independent tool calls requested in the same turn are dispatched
    // concurrently, not one at a time.
    let futures = calls
        .iter()
        .map(|call| core.dispatch_tool(session_id, &call.tool_name, call.input.clone(), &call.tool_use_id));
    futures::future::join_all(futures).await
}
