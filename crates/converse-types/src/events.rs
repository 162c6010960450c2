//! Event frames for the two delivery channels.
//!
//! [`StreamEvent`] is the payload of one server-sent event on the streaming
//! HTTP response. [`LiveEvent`] and [`LiveCommand`] are the outbound and
//! inbound frames of the live voice WebSocket.

use serde::{Deserialize, Serialize};

/// One event on the streaming HTTP response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    /// A flushed text chunk with its synthesized audio (base64).
    Content {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        audio: Option<String>,
    },
    /// A raw fragment delivered ahead of its audio-bearing chunk.
    Partial { text: String },
    /// The response completed and was persisted.
    Done,
    /// The response failed; the user turn was rolled back.
    Error { error: String },
}

/// Outbound frame on the live voice channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LiveEvent {
    VoiceStreamStarted { status: String },
    VoiceStreamEnded { status: String },
    PartialTranscript { text: String },
    FinalTranscript { text: String },
    PartialResponse { text: String },
    /// Synthesized audio as a `data:audio/mp3;base64,` URL.
    AudioChunk { audio_data: String },
    ResponseComplete { message_id: String },
    Error { message: String },
}

impl LiveEvent {
    /// Convenience constructor for error frames.
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

/// Inbound frame on the live voice channel.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LiveCommand {
    StartVoiceStream { conversation_id: String },
    /// One audio fragment, base64 or a base64 `data:` URL.
    VoiceData { audio_chunk: String },
    EndVoiceStream {},
}
