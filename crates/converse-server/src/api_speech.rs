//! Speech synthesis and transcription handlers.

use crate::api::ApiError;
use crate::AppState;
use axum::{
    extract::{Extension, Json, Multipart, Path},
    http::header,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

/// Maximum size of an uploaded recording (10 MiB).
const MAX_AUDIO_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Deserialize)]
pub struct TextToSpeechRequest {
    #[serde(default)]
    pub text: String,
    pub voice: Option<String>,
}

/// Handler for `POST /api/conversations/{id}/speak`. Reads the latest
/// assistant turn aloud.
pub async fn speak_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let audio = state.chat.speak_last(&id).await?;
    Ok(([(header::CONTENT_TYPE, "audio/mpeg")], audio).into_response())
}

/// Handler for `POST /api/text-to-speech`.
pub async fn text_to_speech_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(payload): Json<TextToSpeechRequest>,
) -> Result<Response, ApiError> {
    let audio = state
        .chat
        .synthesize(&payload.text, payload.voice.as_deref())
        .await?;
    Ok((
        [
            (header::CONTENT_TYPE, "audio/mpeg"),
            (header::CONTENT_DISPOSITION, "attachment; filename=\"speech.mp3\""),
        ],
        audio,
    )
        .into_response())
}

/// Handler for `POST /api/speech-to-text`. Expects the recording in the
/// `audio` multipart field. A failed transcription yields empty text.
pub async fn speech_to_text_handler(
    Extension(state): Extension<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    let mut audio = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("multipart error: {}", e)))?
    {
        if field.name() != Some("audio") {
            continue;
        }
        let data = field
            .bytes()
            .await
            .map_err(|e| ApiError::BadRequest(format!("failed to read upload: {}", e)))?;
        audio = Some(data);
        break;
    }

    let audio = audio.ok_or_else(|| ApiError::BadRequest("没有上传音频文件".to_string()))?;
    if audio.len() > MAX_AUDIO_BYTES {
        return Err(ApiError::BadRequest(format!(
            "file too large: {} bytes (max {})",
            audio.len(),
            MAX_AUDIO_BYTES
        )));
    }

    let text = state.chat.transcribe(&audio).await;
    Ok(Json(json!({ "text": text })))
}
