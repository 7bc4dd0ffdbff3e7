//! Static per-agent configuration (§3): loaded from disk at process start,
//! immutable for the process lifetime.

use std::collections::{HashMap, HashSet};

use conduit_handoff::Memory;
use serde::{Deserialize, Serialize};

/// Opt-in auto-trigger pre-conditions for one persona (§4.7): "on session
/// init of certain agents (identity-verification, banking), if memory
/// contains the required pre-conditions ... synthesise one user
/// utterance". A persona with no `auto_trigger` section never auto-fires,
/// regardless of the process-wide `AUTO_TRIGGER_ENABLED` setting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoTriggerSpec {
    /// Memory keys that must all be present for the trigger to fire (e.g.
    /// `["providedAccount", "providedSortCode"]` for identity verification,
    /// `["verified"]` for banking).
    #[serde(default)]
    pub requires: Vec<String>,
    /// Memory keys whose presence suppresses the trigger — used for the
    /// "not-yet-attempted" half of a pre-condition (e.g. don't re-fire IDV
    /// once it has already run this session).
    #[serde(default)]
    pub excludes: Vec<String>,
    /// The synthesised utterance, with `{key}` placeholders substituted
    /// from memory. Falls back to an empty utterance (a proactive greeting
    /// with no fabricated user words) when absent.
    #[serde(default)]
    pub utterance_template: Option<String>,
}

impl AutoTriggerSpec {
    /// `true` iff every `requires` key is present in `memory` and no
    /// `excludes` key is.
    pub fn preconditions_met(&self, memory: &Memory) -> bool {
        self.requires.iter().all(|k| memory.contains_key(k))
            && self.excludes.iter().all(|k| !memory.contains_key(k))
    }

    /// Render `utterance_template` against `memory`, substituting each
    /// `{key}` with the corresponding value (stringified) or leaving it
    /// untouched if the key is absent. Returns an empty string if no
    /// template is configured.
    pub fn render_utterance(&self, memory: &Memory) -> String {
        let Some(template) = &self.utterance_template else {
            return String::new();
        };
        let mut out = template.clone();
        for (key, value) in memory.iter() {
            let placeholder = format!("{{{key}}}");
            if out.contains(&placeholder) {
                let rendered = match value {
                    conduit_handoff::MemoryValue::String(s) => s.clone(),
                    conduit_handoff::MemoryValue::Bool(b) => b.to_string(),
                    conduit_handoff::MemoryValue::Number(n) => n.to_string(),
                };
                out = out.replace(&placeholder, &rendered);
            }
        }
        out
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Persona {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub voice_id: Option<String>,
    pub allowed_tools: HashSet<String>,
    pub system_prompt: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub auto_trigger: Option<AutoTriggerSpec>,
}

impl Persona {
    pub fn from_json_str(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_persona() {
        let raw = r#"{
            "id": "banking",
            "display_name": "Banking Agent",
            "allowed_tools": ["lookup_balance", "transfer_to_triage"],
            "system_prompt": "You help with banking."
        }"#;
        let persona = Persona::from_json_str(raw).unwrap();
        assert_eq!(persona.id, "banking");
        assert!(persona.allowed_tools.contains("lookup_balance"));
        assert!(persona.voice_id.is_none());
        assert!(persona.auto_trigger.is_none());
    }

    #[test]
    fn parses_persona_with_auto_trigger_spec() {
        let raw = r#"{
            "id": "idv",
            "display_name": "Identity Verification",
            "allowed_tools": ["perform_idv_check"],
            "system_prompt": "You verify identity.",
            "auto_trigger": {
                "requires": ["providedAccount", "providedSortCode"],
                "excludes": ["verified"],
                "utterance_template": "{providedAccount} {providedSortCode}"
            }
        }"#;
        let persona = Persona::from_json_str(raw).unwrap();
        let spec = persona.auto_trigger.expect("auto_trigger parsed");
        assert_eq!(spec.requires, vec!["providedAccount", "providedSortCode"]);
        assert_eq!(spec.excludes, vec!["verified"]);
    }

    #[test]
    fn preconditions_require_all_keys_and_no_excluded_keys() {
        let spec = AutoTriggerSpec {
            requires: vec!["providedAccount".to_string(), "providedSortCode".to_string()],
            excludes: vec!["verified".to_string()],
            utterance_template: Some("{providedAccount} {providedSortCode}".to_string()),
        };
        let mut memory = Memory::new();
        assert!(!spec.preconditions_met(&memory));

        memory.insert("providedAccount".to_string(), "12345678".into());
        memory.insert("providedSortCode".to_string(), "112233".into());
        assert!(spec.preconditions_met(&memory));

        memory.insert("verified".to_string(), true.into());
        assert!(!spec.preconditions_met(&memory));
    }

    #[test]
    fn utterance_template_substitutes_memory_values() {
        let spec = AutoTriggerSpec {
            requires: vec![],
            excludes: vec![],
            utterance_template: Some("{providedAccount} {providedSortCode}".to_string()),
        };
        let mut memory = Memory::new();
        memory.insert("providedAccount".to_string(), "12345678".into());
        memory.insert("providedSortCode".to_string(), "112233".into());
        assert_eq!(spec.render_utterance(&memory), "12345678 112233");
    }

    #[test]
    fn missing_template_renders_empty_utterance() {
        let spec = AutoTriggerSpec { requires: vec![], excludes: vec![], utterance_template: None };
        assert_eq!(spec.render_utterance(&Memory::new()), "");
    }
}
