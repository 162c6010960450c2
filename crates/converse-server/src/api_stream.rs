//! Server-sent event stream of one answer.

use crate::api::ApiError;
use crate::api_conversations::MessageRequest;
use crate::AppState;
use axum::{
    extract::{Extension, Json, Path},
    http::{header, HeaderName, HeaderValue},
    response::{
        sse::{Event, KeepAlive},
        IntoResponse, Response, Sse,
    },
};
use std::{convert::Infallible, sync::Arc};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

/// Handler for `POST /api/conversations/{id}/stream`.
///
/// Failures before the first event (unknown conversation, empty message,
/// no engine) are ordinary JSON errors. Later failures arrive as an
/// `error` event, after which the stream ends.
pub async fn stream_message_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
    Json(payload): Json<MessageRequest>,
) -> Result<Response, ApiError> {
    let rx = state.chat.stream_message(&id, &payload.message).await?;

    let events = ReceiverStream::new(rx).filter_map(|event| match serde_json::to_string(&event) {
        Ok(data) => Some(Ok::<_, Infallible>(Event::default().data(data))),
        Err(e) => {
            tracing::error!("failed to serialize stream event: {}", e);
            None
        }
    });

    let mut response = Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response();
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(
        HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );
    Ok(response)
}
