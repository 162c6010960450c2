//! Agent management handlers.

use crate::api::ApiError;
use crate::AppState;
use axum::extract::{Extension, Json, Multipart, Path};
use converse_chat::{NewAgent, Upload};
use converse_types::{Agent, AgentType};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;

/// Maximum size of one uploaded knowledge-base file (10 MiB).
const MAX_DOCUMENT_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Serialize)]
pub struct CreateAgentResponse {
    pub success: bool,
    pub message: String,
    pub agent: Agent,
    pub conversation_id: String,
}

/// Handler for `GET /api/agents`.
pub async fn list_agents_handler(
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<Vec<Agent>>, ApiError> {
    Ok(Json(state.chat.agents().list().await?))
}

/// Handler for `POST /api/agents`.
///
/// Multipart fields: `name`, `role`, `agent_type` and any number of `files`.
pub async fn create_agent_handler(
    Extension(state): Extension<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<CreateAgentResponse>, ApiError> {
    let mut name = String::new();
    let mut role = String::new();
    let mut agent_type = AgentType::default();
    let mut uploads = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("multipart error: {}", e)))?
    {
        let field_name = field.name().unwrap_or_default().to_string();
        match field_name.as_str() {
            "name" => name = read_text(field).await?,
            "role" => role = read_text(field).await?,
            "agent_type" => {
                let code = read_text(field).await?;
                if !code.trim().is_empty() {
                    agent_type = code
                        .trim()
                        .parse()
                        .map_err(|e: converse_types::UnknownAgentType| {
                            ApiError::BadRequest(e.to_string())
                        })?;
                }
            }
            "files" | "files[]" => {
                let file_name = field.file_name().unwrap_or_default().to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("failed to read upload: {}", e)))?;
                if file_name.is_empty() && bytes.is_empty() {
                    continue;
                }
                if bytes.len() > MAX_DOCUMENT_BYTES {
                    return Err(ApiError::BadRequest(format!(
                        "file too large: {} bytes (max {})",
                        bytes.len(),
                        MAX_DOCUMENT_BYTES
                    )));
                }
                uploads.push(Upload {
                    file_name,
                    bytes: bytes.to_vec(),
                });
            }
            other => {
                tracing::debug!(field = other, "ignoring unknown multipart field");
            }
        }
    }

    let (agent, conversation) = state
        .chat
        .create_agent(
            NewAgent {
                name,
                role,
                agent_type,
            },
            uploads,
        )
        .await?;

    Ok(Json(CreateAgentResponse {
        success: true,
        message: "智能体创建成功".to_string(),
        agent,
        conversation_id: conversation.id,
    }))
}

/// Handler for `GET /api/agents/{id}`.
pub async fn get_agent_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Agent>, ApiError> {
    Ok(Json(state.chat.get_agent(&id).await?))
}

/// Handler for `DELETE /api/agents/{id}`. Removes the agent's
/// conversations, uploads and knowledge index as well.
pub async fn delete_agent_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let (agent, deleted_conversations) = state.chat.delete_agent(&id).await?;
    Ok(Json(json!({
        "success": true,
        "message": format!("智能体 {} 已删除", agent.name),
        "agent": agent,
        "deleted_conversations": deleted_conversations,
    })))
}

async fn read_text(field: axum::extract::multipart::Field<'_>) -> Result<String, ApiError> {
    field
        .text()
        .await
        .map_err(|e| ApiError::BadRequest(format!("failed to read form field: {}", e)))
}
