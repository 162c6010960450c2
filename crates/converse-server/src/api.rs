//! Error type shared by the API handlers.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use converse_chat::ChatError;
use thiserror::Error;

/// API error type mapping to HTTP status codes.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid input: {0}")]
    BadRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
    /// The request was understood but no agent can serve it.
    #[error("unprocessable: {0}")]
    UnprocessableEntity(String),
    #[error("internal server error: {0}")]
    InternalServerError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::UnprocessableEntity(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
            ApiError::InternalServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(serde_json::json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

impl From<ChatError> for ApiError {
    fn from(e: ChatError) -> Self {
        match e {
            ChatError::ConversationNotFound(_) => ApiError::NotFound("对话不存在".to_string()),
            ChatError::AgentNotFound(_) => ApiError::NotFound("智能体不存在".to_string()),
            ChatError::InvalidInput(msg) => ApiError::BadRequest(msg),
            ChatError::SessionNotFound => ApiError::BadRequest(e.to_string()),
            ChatError::Routing(msg) => ApiError::UnprocessableEntity(msg),
            ChatError::Binding(_)
            | ChatError::Answer(_)
            | ChatError::Synthesis(_)
            | ChatError::Persistence(_) => {
                tracing::error!("request failed: {}", e);
                ApiError::InternalServerError(e.to_string())
            }
        }
    }
}
