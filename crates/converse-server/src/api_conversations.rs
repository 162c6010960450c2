//! Conversation handlers.

use crate::api::ApiError;
use crate::AppState;
use axum::extract::{Extension, Json, Path};
use converse_chat::{ConversationDetail, ConversationSummary, MemoryStatus};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct CreateConversationRequest {
    pub agent_id: String,
}

#[derive(Debug, Serialize)]
pub struct CreateConversationResponse {
    pub id: String,
    pub title: String,
    pub agent_id: String,
}

#[derive(Debug, Deserialize)]
pub struct RenameRequest {
    #[serde(default)]
    pub title: String,
}

/// Body of the message and stream endpoints.
#[derive(Debug, Deserialize)]
pub struct MessageRequest {
    #[serde(default)]
    pub message: String,
}

/// Handler for `GET /api/conversations`. Newest first.
pub async fn list_conversations_handler(
    Extension(state): Extension<Arc<AppState>>,
) -> Json<Vec<ConversationSummary>> {
    Json(state.chat.store().list().await)
}

/// Handler for `POST /api/conversations`.
pub async fn create_conversation_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(payload): Json<CreateConversationRequest>,
) -> Result<Json<CreateConversationResponse>, ApiError> {
    let record = state.chat.create_conversation(&payload.agent_id).await?;
    Ok(Json(CreateConversationResponse {
        id: record.id,
        title: record.info.title,
        agent_id: record.info.agent_id,
    }))
}

/// Handler for `GET /api/conversations/{id}`.
pub async fn get_conversation_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ConversationDetail>, ApiError> {
    Ok(Json(state.chat.store().detail(&id).await?))
}

/// Handler for `DELETE /api/conversations/{id}`.
pub async fn delete_conversation_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.chat.store().delete(&id).await?;
    Ok(Json(json!({ "success": true, "message": "对话已删除" })))
}

/// Handler for `PUT /api/conversations/{id}/title`.
pub async fn rename_conversation_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
    Json(payload): Json<RenameRequest>,
) -> Result<Json<Value>, ApiError> {
    let record = state.chat.store().rename(&id, &payload.title).await?;
    Ok(Json(json!({ "success": true, "title": record.info.title })))
}

/// Handler for `POST /api/conversations/{id}/messages`.
pub async fn send_message_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
    Json(payload): Json<MessageRequest>,
) -> Result<Json<Value>, ApiError> {
    let turn = state.chat.send_message(&id, &payload.message).await?;
    Ok(Json(json!({ "success": true, "message": turn })))
}

/// Handler for `POST /api/conversations/{id}/refresh-context`.
pub async fn refresh_context_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let message_count = state.chat.refresh_context(&id).await?;
    Ok(Json(json!({
        "success": true,
        "message": "上下文已刷新",
        "message_count": message_count,
    })))
}

/// Handler for `GET /api/conversations/{id}/memory-status`.
pub async fn memory_status_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<MemoryStatus>, ApiError> {
    Ok(Json(state.chat.store().memory_status(&id).await?))
}
