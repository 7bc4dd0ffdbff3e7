//! Workflow Graph (C1): parses workflow definitions, evaluates state
//! transitions, and renders the graph into LLM-facing instructions.
//!
//! The engine never calls the LLM itself — `advance` is a pure function of
//! `(graph, state, classifier)` where the classifier is injected by the
//! caller. This keeps the state machine deterministic and testable (§4.1
//! "Key design decision").

use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Kinds of node a workflow graph may contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Start,
    Process,
    Decision,
    Tool,
    Workflow,
    End,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub kind: NodeKind,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub tool_name: Option<String>,
    /// For `end` nodes: an outcome label which may itself encode a target
    /// agent per the handoff naming convention (§4.8).
    #[serde(default)]
    pub outcome: Option<String>,
    /// Memory keys this node's prompt needs; empty means "all of memory".
    #[serde(default)]
    pub relevant_memory_keys: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub label: Option<String>,
}

/// Raw, on-disk shape of a workflow definition before validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDef {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("workflow has no start node")]
    MissingStart,
    #[error("workflow has more than one start node: {0:?}")]
    MultipleStart(Vec<String>),
    #[error("edge {from} -> {to} references an unknown node {to}")]
    DanglingEdgeTarget { from: String, to: String },
    #[error("edge from unknown source node {0}")]
    DanglingEdgeSource(String),
    #[error("decision node {0} has fewer than 2 outgoing edges")]
    DecisionTooFewEdges(String),
    #[error("decision node {0} has duplicate edge labels (case-insensitive): {1}")]
    DuplicateEdgeLabels(String, String),
    #[error("non-end node {0} has no outgoing edges")]
    NoOutgoingEdge(String),
    #[error("duplicate node id {0}")]
    DuplicateNodeId(String),
}

/// A validated, immutable workflow graph.
#[derive(Debug, Clone)]
pub struct Workflow {
    nodes: HashMap<String, Node>,
    edges_from: HashMap<String, Vec<Edge>>,
    start_id: String,
}

impl Workflow {
    pub fn load(def: WorkflowDef) -> Result<Self, ValidationError> {
        let mut nodes = HashMap::new();
        for node in def.nodes {
            if nodes.insert(node.id.clone(), node.clone()).is_some() {
                return Err(ValidationError::DuplicateNodeId(node.id));
            }
        }

        let starts: Vec<String> = nodes
            .values()
            .filter(|n| n.kind == NodeKind::Start)
            .map(|n| n.id.clone())
            .collect();
        let start_id = match starts.len() {
            0 => return Err(ValidationError::MissingStart),
            1 => starts[0].clone(),
            _ => return Err(ValidationError::MultipleStart(starts)),
        };

        let mut edges_from: HashMap<String, Vec<Edge>> = HashMap::new();
        for edge in &def.edges {
            if !nodes.contains_key(&edge.from) {
                return Err(ValidationError::DanglingEdgeSource(edge.from.clone()));
            }
            if !nodes.contains_key(&edge.to) {
                return Err(ValidationError::DanglingEdgeTarget {
                    from: edge.from.clone(),
                    to: edge.to.clone(),
                });
            }
            edges_from.entry(edge.from.clone()).or_default().push(edge.clone());
        }

        for node in nodes.values() {
            let outgoing = edges_from.get(&node.id).map(|v| v.as_slice()).unwrap_or(&[]);
            if node.kind == NodeKind::End {
                continue;
            }
            if outgoing.is_empty() {
                return Err(ValidationError::NoOutgoingEdge(node.id.clone()));
            }
            if node.kind == NodeKind::Decision {
                if outgoing.len() < 2 {
                    return Err(ValidationError::DecisionTooFewEdges(node.id.clone()));
                }
                let mut seen: HashSet<String> = HashSet::new();
                for e in outgoing {
                    let label = e.label.clone().unwrap_or_default().to_ascii_lowercase();
                    if !seen.insert(label.clone()) {
                        return Err(ValidationError::DuplicateEdgeLabels(node.id.clone(), label));
                    }
                }
            }
        }

        Ok(Workflow { nodes, edges_from, start_id })
    }

    pub fn start_id(&self) -> &str {
        &self.start_id
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn outgoing(&self, id: &str) -> &[Edge] {
        self.edges_from.get(id).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(|s| s.as_str())
    }
}

/// Context handed to a decision classifier: the conversation excerpt and the
/// currently relevant memory. Kept as a JSON value rather than a typed map
/// so the workflow crate stays decoupled from the session crate's memory
/// representation.
#[derive(Debug, Clone)]
pub struct AdvanceContext<'a> {
    pub conversation_excerpt: &'a str,
    pub memory: &'a serde_json::Value,
}

/// Result of classifying a decision node: the chosen label and how it was
/// derived.
#[derive(Debug, Clone, PartialEq)]
pub struct DecisionOutcome {
    pub label: String,
    pub confidence: f32,
}

#[async_trait]
pub trait DecisionClassifier: Send + Sync {
    /// Returns the classifier's raw label, or `None` on any transport
    /// failure. `advance` never propagates classifier errors — see §4.1.
    async fn classify(
        &self,
        node_label: &str,
        edge_labels: &[String],
        ctx: &AdvanceContext<'_>,
    ) -> Option<String>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum AdvanceResult {
    Next { next_node_id: String, outcome: Option<DecisionOutcome> },
    Halt { at: String },
    /// Reached an `end` node whose `outcome` encodes a target agent.
    Handoff { target_agent: String, outcome: Option<DecisionOutcome> },
    /// Reached a terminal `end` node with no handoff encoded.
    Done { outcome: Option<String> },
}

/// Advance the workflow one step from `current_node_id` (§4.1).
pub async fn advance(
    workflow: &Workflow,
    current_node_id: &str,
    ctx: &AdvanceContext<'_>,
    classifier: &dyn DecisionClassifier,
    tool_result_success: Option<bool>,
) -> AdvanceResult {
    let node = match workflow.node(current_node_id) {
        Some(n) => n,
        None => return AdvanceResult::Halt { at: current_node_id.to_string() },
    };

    match node.kind {
        NodeKind::Start | NodeKind::Process | NodeKind::Workflow => {
            let outgoing = workflow.outgoing(current_node_id);
            match outgoing.first() {
                Some(edge) => AdvanceResult::Next { next_node_id: edge.to.clone(), outcome: None },
                None => AdvanceResult::Halt { at: current_node_id.to_string() },
            }
        }
        NodeKind::Tool => match tool_result_success {
            Some(true) => match workflow.outgoing(current_node_id).first() {
                Some(edge) => AdvanceResult::Next { next_node_id: edge.to.clone(), outcome: None },
                None => AdvanceResult::Halt { at: current_node_id.to_string() },
            },
            _ => AdvanceResult::Halt { at: current_node_id.to_string() },
        },
        NodeKind::Decision => {
            let outgoing = workflow.outgoing(current_node_id);
            let edge_labels: Vec<String> =
                outgoing.iter().map(|e| e.label.clone().unwrap_or_default()).collect();

            let raw = classifier.classify(&node.label, &edge_labels, ctx).await;

            let (chosen_idx, confidence) = match raw {
                Some(label) => match_label(&edge_labels, &label),
                None => {
                    warn!(node = %current_node_id, "decision classifier failed; falling back to first edge");
                    (0, 0.5)
                }
            };

            let edge = &outgoing[chosen_idx];
            AdvanceResult::Next {
                next_node_id: edge.to.clone(),
                outcome: Some(DecisionOutcome { label: edge_labels[chosen_idx].clone(), confidence }),
            }
        }
        NodeKind::End => match node.outcome.as_deref().and_then(conduit_handoff::target_agent_for) {
            Some(target_agent) => AdvanceResult::Handoff {
                target_agent,
                outcome: node.outcome.clone().map(|label| DecisionOutcome { label, confidence: 1.0 }),
            },
            None => AdvanceResult::Done { outcome: node.outcome.clone() },
        },
    }
}

/// Match the classifier's raw label against the candidate edge labels:
/// exact (case-insensitive) first, then substring either direction, else
/// fall back to the first edge with confidence 0.5 (§4.1).
fn match_label(edge_labels: &[String], raw: &str) -> (usize, f32) {
    let raw_lower = raw.trim().to_ascii_lowercase();

    if let Some(idx) = edge_labels.iter().position(|l| l.eq_ignore_ascii_case(raw_lower.as_str())) {
        return (idx, 1.0);
    }

    if let Some(idx) = edge_labels.iter().position(|l| {
        let l_lower = l.to_ascii_lowercase();
        l_lower.contains(&raw_lower) || raw_lower.contains(&l_lower)
    }) {
        return (idx, 0.75);
    }

    (0, 0.5)
}

/// Render the graph into a human-readable instruction block for inclusion
/// in the LLM system prompt (§4.1), including the `[STEP: <node_id>]`
/// covert-channel rule.
pub fn system_prompt_text(workflow: &Workflow, memory_keys: &[String]) -> String {
    let mut out = String::new();
    out.push_str("You are driving a multi-step workflow. ");
    out.push_str(
        "Every response you produce MUST begin with a line of the exact form `[STEP: <node_id>]` \
         naming the workflow node you are currently executing, followed by your reply.\n\n",
    );
    out.push_str("Workflow nodes:\n");
    let mut ids: Vec<&str> = workflow.node_ids().collect();
    ids.sort_unstable();
    for id in ids {
        let node = workflow.node(id).expect("id came from node_ids");
        out.push_str(&format!("- {} ({:?}): {}\n", node.id, node.kind, node.label));
        for edge in workflow.outgoing(id) {
            out.push_str(&format!(
                "    -> {} [{}]\n",
                edge.to,
                edge.label.as_deref().unwrap_or("")
            ));
        }
    }
    if !memory_keys.is_empty() {
        out.push_str("\nKnown memory keys available to you: ");
        out.push_str(&memory_keys.join(", "));
        out.push('\n');
    }
    out
}

fn step_tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\[STEP:\s*([A-Za-z0-9_.:-]+)\s*\]\s*").expect("valid regex"))
}

/// Parse a leading `[STEP: node_id]` tag (§9), returning the node id and the
/// remainder of the text with the tag stripped. Anchored at message start.
pub fn parse_step_tag(text: &str) -> (Option<String>, &str) {
    match step_tag_re().captures(text) {
        Some(caps) => {
            let whole = caps.get(0).unwrap();
            let node_id = caps.get(1).unwrap().as_str().to_string();
            (Some(node_id), &text[whole.end()..])
        }
        None => (None, text),
    }
}

/// `true` iff `node_id` is a valid node in `workflow` — used to validate a
/// `[STEP: ...]` transition before accepting it. Per §9/§4.4, an illegal
/// transition is logged and accepted anyway; this helper only reports the
/// fact, it does not enforce anything.
pub fn is_known_node(workflow: &Workflow, node_id: &str) -> bool {
    workflow.node(node_id).is_some()
}
