//! Voice Adapter (C5): bridges the opaque Sonic speech-to-speech collaborator
//! to Agent Core. See `adapter::VoiceAdapter`.

mod adapter;
mod numerals;
mod sonic;

pub use adapter::{VoiceAdapter, VoiceOutboundEvent};
pub use numerals::canonicalize_numerals;
pub use sonic::{SonicClient, SonicError, SonicEvent, SonicStream, TranscriptRole};
