//! Converse server library logic.

pub mod api;
pub mod api_agents;
pub mod api_conversations;
pub mod api_speech;
pub mod api_stream;
pub mod api_ws;
pub mod config;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post, put},
    Extension, Json, Router,
};
use config::Config;
use converse_chat::{ChatService, ChatSettings, Collaborators};
use converse_engine::{ChatCompletionsBinder, EngineError};
use converse_store::{JsonFileStore, StoreError};
use converse_types::VoiceOptions;
use converse_voice::{EdgeTtsSynthesizer, WhisperTranscriber};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// The conversation pipeline.
    pub chat: Arc<ChatService>,
    /// Directory of the browser client.
    pub static_dir: PathBuf,
}

/// Errors that prevent the server from starting.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to open storage: {0}")]
    Store(#[from] StoreError),
    #[error("failed to configure the answer engine: {0}")]
    Engine(#[from] EngineError),
}

/// Maximum request body size (32 MiB). Agent creation uploads several
/// documents in one request.
const MAX_REQUEST_BODY_BYTES: usize = 32 * 1024 * 1024;

/// Wires the pipeline to the JSON store under `storage.data_dir`, the
/// configured chat-completions endpoint and the speech binaries.
pub fn build_service(config: &Config) -> Result<ChatService, StartupError> {
    let data_dir = &config.storage.data_dir;
    let store = Arc::new(JsonFileStore::open(data_dir)?);
    let binder = ChatCompletionsBinder::new(config.llm.clone())?;

    let mut settings = ChatSettings::new(data_dir);
    settings.refresh_interval = config.chat.refresh_interval;
    settings.partial_transcript_threshold = config.chat.partial_transcript_threshold;
    settings.collaborator_timeout = Duration::from_secs(config.chat.collaborator_timeout_secs);
    settings.max_background_tasks = config.chat.max_background_tasks;
    settings.language = config.voice.language.clone();
    settings.voice = VoiceOptions::with_voice(config.voice.default_voice.clone());

    Ok(ChatService::new(
        Collaborators {
            conversations: store.clone(),
            agents: store,
            binder: Arc::new(binder),
            synthesizer: Arc::new(EdgeTtsSynthesizer::new(&config.voice.tts_binary)),
            transcriber: Arc::new(WhisperTranscriber::new(
                &config.voice.stt_model,
                &config.voice.stt_binary,
            )),
        },
        settings,
    ))
}

/// Health check handler.
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    let router = Router::new()
        .route("/health", get(health))
        .route(
            "/api/agents",
            get(api_agents::list_agents_handler).post(api_agents::create_agent_handler),
        )
        .route(
            "/api/agents/{id}",
            get(api_agents::get_agent_handler).delete(api_agents::delete_agent_handler),
        )
        .route(
            "/api/conversations",
            get(api_conversations::list_conversations_handler)
                .post(api_conversations::create_conversation_handler),
        )
        .route(
            "/api/conversations/{id}",
            get(api_conversations::get_conversation_handler)
                .delete(api_conversations::delete_conversation_handler),
        )
        .route(
            "/api/conversations/{id}/title",
            put(api_conversations::rename_conversation_handler),
        )
        .route(
            "/api/conversations/{id}/messages",
            post(api_conversations::send_message_handler),
        )
        .route(
            "/api/conversations/{id}/stream",
            post(api_stream::stream_message_handler),
        )
        .route(
            "/api/conversations/{id}/refresh-context",
            post(api_conversations::refresh_context_handler),
        )
        .route(
            "/api/conversations/{id}/memory-status",
            get(api_conversations::memory_status_handler),
        )
        .route(
            "/api/conversations/{id}/speak",
            post(api_speech::speak_handler),
        )
        .route(
            "/api/speech-to-text",
            post(api_speech::speech_to_text_handler),
        )
        .route(
            "/api/text-to-speech",
            post(api_speech::text_to_speech_handler),
        )
        .route("/ws", get(api_ws::ws_handler));

    // Serve client static files if the directory holds an index page.
    let static_dir = &state.static_dir;
    let router = if static_dir.join("index.html").exists() {
        tracing::info!(path = %static_dir.display(), "serving client static files");
        router.fallback_service(
            ServeDir::new(static_dir).fallback(ServeFile::new(static_dir.join("index.html"))),
        )
    } else {
        tracing::info!(path = %static_dir.display(), "client directory not found, skipping static file serving");
        router
    };

    router
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(Extension(Arc::new(state)))
}
