//! Session Store (C3): per-session conversational state, memory, workflow
//! position, and pending handoff, with a lifecycle independent from the
//! adapter that drives it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use conduit_handoff::{Memory, PendingHandoff};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

/// Mode fixed at session start, mirroring `conduit_config::Mode` without
/// creating a dependency on the config crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    Voice,
    Text,
    Hybrid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
    Tool,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TurnContent {
    Text { text: String },
    ToolCall { tool_use_id: String, tool_name: String, input: serde_json::Value },
    ToolResult { tool_use_id: String, success: bool, result: serde_json::Value },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: TurnRole,
    pub content: TurnContent,
    pub r#final: bool,
    pub timestamp: DateTime<Utc>,
}

/// Current position in the workflow graph plus the decision trail.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowPosition {
    pub node_id: String,
    pub outcomes: Vec<String>,
}

/// Tracks one `tool_use_id` through its call/result lifecycle, enforcing the
/// at-most-once-per-`tool_use_id` invariant (§3, §8 invariant 1).
#[derive(Debug, Clone, Default)]
struct ToolUseTracker {
    called: std::collections::HashSet<String>,
    resulted: std::collections::HashSet<String>,
}

/// The unit of conversation (§3). Mutated only by Agent Core via adapter
/// callbacks; created by the Runtime on session-init, destroyed on
/// disconnect or circuit-breaker trip.
#[derive(Debug)]
pub struct Session {
    pub session_id: String,
    pub mode: SessionMode,
    pub started_at: Instant,
    pub memory: Memory,
    pub workflow_state: WorkflowPosition,
    pub transcript: Vec<Turn>,
    pub pending_handoff: Option<PendingHandoff>,
    pub error_count: u32,
    pub last_error_at: Option<Instant>,
    pub autotrigger_fired: bool,
    tool_uses: ToolUseTracker,
}

impl Session {
    pub fn new(session_id: String, mode: SessionMode, memory: Memory) -> Self {
        Self {
            session_id,
            mode,
            started_at: Instant::now(),
            memory,
            workflow_state: WorkflowPosition::default(),
            transcript: Vec::new(),
            pending_handoff: None,
            error_count: 0,
            last_error_at: None,
            autotrigger_fired: false,
            tool_uses: ToolUseTracker::default(),
        }
    }

    pub fn push_turn(&mut self, role: TurnRole, content: TurnContent, is_final: bool) {
        self.transcript.push(Turn { role, content, r#final: is_final, timestamp: Utc::now() });
    }

    /// Record a new user error, for the circuit breaker (§4.7, §7).
    pub fn record_error(&mut self) {
        self.error_count += 1;
        self.last_error_at = Some(Instant::now());
    }

    /// Reset the error window once it has elapsed without new errors.
    pub fn maybe_reset_error_window(&mut self, window: std::time::Duration) {
        if let Some(last) = self.last_error_at {
            if last.elapsed() >= window {
                self.error_count = 0;
                self.last_error_at = None;
            }
        }
    }

    pub fn circuit_open(&self, max_errors: u32) -> bool {
        self.error_count >= max_errors
    }

    /// Register a tool call's `tool_use_id`. Returns `false` if it has
    /// already been used in this session (single-flight per call id, §4.2).
    pub fn register_tool_call(&mut self, tool_use_id: &str) -> bool {
        self.tool_uses.called.insert(tool_use_id.to_string())
    }

    /// Register a tool result's `tool_use_id`. Returns `false` if a result
    /// was already recorded for this id (§8 invariant 1).
    pub fn register_tool_result(&mut self, tool_use_id: &str) -> bool {
        self.tool_uses.resulted.insert(tool_use_id.to_string())
    }

    pub fn merge_memory(&mut self, patch: Memory) {
        for (k, v) in patch {
            self.memory.insert(k, v);
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session {0} already exists")]
    AlreadyExists(String),
    #[error("session {0} not found")]
    NotFound(String),
}

/// Concurrent map of live sessions, keyed by session id (§3, §5).
///
/// A single session is processed by at most one in-flight message at any
/// instant; callers enforce that discipline themselves (e.g. a per-session
/// serialising task) — the store only guarantees safe concurrent access
/// across *distinct* session ids.
#[derive(Clone, Default)]
pub struct SessionStore {
    sessions: Arc<RwLock<HashMap<String, Arc<Mutex<Session>>>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create(
        &self,
        session_id: String,
        mode: SessionMode,
        memory: Memory,
    ) -> Result<Arc<Mutex<Session>>, SessionError> {
        let mut guard = self.sessions.write().await;
        if guard.contains_key(&session_id) {
            return Err(SessionError::AlreadyExists(session_id));
        }
        let session = Arc::new(Mutex::new(Session::new(session_id.clone(), mode, memory)));
        guard.insert(session_id, session.clone());
        Ok(session)
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<Mutex<Session>>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    pub async fn update_memory(&self, session_id: &str, patch: Memory) -> Result<(), SessionError> {
        let session = self.get(session_id).await.ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        let mut guard = session.lock().await;
        guard.merge_memory(patch);
        Ok(())
    }

    /// Idempotent: deleting an id that is not present is a no-op, matching
    /// the `create -> delete -> create` round-trip property (§8).
    pub async fn delete(&self, session_id: &str) {
        self.sessions.write().await.remove(session_id);
    }

    pub async fn active_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn contains(&self, session_id: &str) -> bool {
        self.sessions.read().await.contains_key(session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let store = SessionStore::new();
        store.create("s1".into(), SessionMode::Text, Memory::new()).await.unwrap();
        assert!(store.get("s1").await.is_some());
    }

    #[tokio::test]
    async fn duplicate_create_fails() {
        let store = SessionStore::new();
        store.create("s1".into(), SessionMode::Text, Memory::new()).await.unwrap();
        let err = store.create("s1".into(), SessionMode::Text, Memory::new()).await.unwrap_err();
        assert!(matches!(err, SessionError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn create_delete_create_round_trip_is_idempotent() {
        let store = SessionStore::new();
        store.create("s1".into(), SessionMode::Text, Memory::new()).await.unwrap();
        store.delete("s1").await;
        store.delete("s1").await; // idempotent no-op
        assert!(store.create("s1".into(), SessionMode::Text, Memory::new()).await.is_ok());
    }

    #[tokio::test]
    async fn memory_update_is_last_writer_wins_per_key() {
        let store = SessionStore::new();
        let mut initial = Memory::new();
        initial.insert("account".into(), "111".into());
        store.create("s1".into(), SessionMode::Text, initial).await.unwrap();

        let mut patch = Memory::new();
        patch.insert("account".into(), "222".into());
        patch.insert("sortCode".into(), "00-00-00".into());
        store.update_memory("s1", patch).await.unwrap();

        let session = store.get("s1").await.unwrap();
        let guard = session.lock().await;
        assert_eq!(guard.memory.get("account").unwrap().as_str(), Some("222"));
        assert_eq!(guard.memory.get("sortCode").unwrap().as_str(), Some("00-00-00"));
    }

    #[test]
    fn duplicate_tool_use_id_is_rejected_on_second_registration() {
        let mut session = Session::new("s1".into(), SessionMode::Text, Memory::new());
        assert!(session.register_tool_call("tu-1"));
        assert!(!session.register_tool_call("tu-1"));
    }

    #[test]
    fn circuit_breaker_trips_after_max_errors() {
        let mut session = Session::new("s1".into(), SessionMode::Text, Memory::new());
        for _ in 0..5 {
            session.record_error();
        }
        assert!(session.circuit_open(5));
    }
}
