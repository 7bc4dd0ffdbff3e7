//! Adapts the opaque LLM collaborator's `classify` RPC to the workflow
//! engine's [`DecisionClassifier`] trait (§4.1, §6).

use std::sync::Arc;

use async_trait::async_trait;
use conduit_llm::LlmClient;
use conduit_workflow::{AdvanceContext, DecisionClassifier};
use tracing::warn;

pub struct LlmDecisionClassifier {
    llm: Arc<dyn LlmClient>,
}

impl LlmDecisionClassifier {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl DecisionClassifier for LlmDecisionClassifier {
    async fn classify(
        &self,
        node_label: &str,
        edge_labels: &[String],
        ctx: &AdvanceContext<'_>,
    ) -> Option<String> {
        let prompt = format!(
            "Node: {node_label}\nConversation so far:\n{}\nMemory: {}",
            ctx.conversation_excerpt, ctx.memory
        );
        match self.llm.classify(&prompt, edge_labels).await {
            Ok(label) => Some(label),
            Err(err) => {
                warn!(%err, "decision classifier RPC failed");
                None
            }
        }
    }
}
