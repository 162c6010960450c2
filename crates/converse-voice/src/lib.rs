//! Speech collaborators for Converse.
//!
//! Synthesis turns a text chunk into MP3 bytes; transcription turns a
//! buffer of recorded audio into text. Both sit behind traits so the
//! conversation pipeline can be driven by test doubles, and both ship a
//! process-backed implementation (`edge-tts` and whisper.cpp) that runs the
//! external binary with an input size cap and a hard timeout.

pub mod audio;
pub mod error;
pub mod stt;
pub mod tts;

pub use audio::{decode_fragment, mp3_data_url};
pub use error::VoiceError;
pub use stt::WhisperTranscriber;
pub use tts::EdgeTtsSynthesizer;

use async_trait::async_trait;
use converse_types::VoiceOptions;

/// Text-to-speech backend.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Renders `text` as MP3 audio. Empty or whitespace-only text is an
    /// error.
    async fn synthesize(&self, text: &str, options: &VoiceOptions) -> Result<Vec<u8>, VoiceError>;
}

/// Speech-to-text backend.
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribes `audio`. Empty input yields empty text without running
    /// the backend.
    async fn transcribe(&self, audio: &[u8], language: &str) -> Result<String, VoiceError>;
}
