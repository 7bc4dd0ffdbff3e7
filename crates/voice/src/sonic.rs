//! The opaque speech-to-speech collaborator's event contract (§1, §6, §9).
//!
//! Sonic itself is out of scope: this module only defines the typed event
//! variants the adapter drains from a single channel (§9 "model each event
//! as a variant ... process them through a single typed channel"), and the
//! [`SonicClient`]/[`SonicStream`] traits a real transport implements.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptRole {
    User,
    Assistant,
}

/// One event surfaced by a live Sonic stream. Event kinds Sonic emits that
/// this system has no use for are filtered out by the transport
/// implementation before they reach this channel (§9) — never forwarded as
/// errors.
#[derive(Debug, Clone)]
pub enum SonicEvent {
    Transcript { role: TranscriptRole, text: String, is_final: bool },
    ToolUse { tool_use_id: String, name: String, input: serde_json::Value },
    Audio(Vec<u8>),
    Interruption,
}

#[derive(Debug, Error)]
pub enum SonicError {
    #[error("sonic stream open failed: {0}")]
    OpenFailed(String),
    #[error("sonic transport error: {0}")]
    Transport(String),
    #[error("sonic stream already closed")]
    Closed,
}

/// A live Sonic stream for one session. Implementations must not panic;
/// transport failures surface as [`SonicError`].
#[async_trait]
pub trait SonicStream: Send {
    async fn send_audio(&mut self, chunk: Vec<u8>) -> Result<(), SonicError>;
    async fn send_tool_result(
        &mut self,
        tool_use_id: &str,
        success: bool,
        result: serde_json::Value,
    ) -> Result<(), SonicError>;
    /// Refresh the live system prompt — used when a tool updates memory in
    /// a way that affects the persona's voice behaviour (§4.5).
    async fn update_system_prompt(&mut self, prompt: &str) -> Result<(), SonicError>;
    async fn close(&mut self);
}

/// Opens Sonic streams. Out of scope per §1; implementations wrap the real
/// transport and are injected into [`crate::adapter::VoiceAdapter`].
#[async_trait]
pub trait SonicClient: Send + Sync {
    async fn open(
        &self,
        session_id: &str,
        system_prompt: &str,
        voice_id: Option<&str>,
        events: mpsc::Sender<SonicEvent>,
    ) -> Result<Box<dyn SonicStream>, SonicError>;
}
