//! Live voice WebSocket.
//!
//! Each connection may hold one voice session at a time. Inbound frames are
//! [`LiveCommand`]s; everything the server sends is a [`LiveEvent`] pushed
//! through a bounded per-connection queue, so slow clients lose events
//! instead of stalling the pipeline. Errors are reported as `error` frames
//! and never close the connection.

use crate::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Extension, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use converse_chat::LiveSink;
use converse_types::{LiveCommand, LiveEvent};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Outbound queue capacity of one connection.
const OUTBOUND_BUFFER: usize = 256;

/// Maximum size of one inbound frame (1 MiB). Audio arrives in small
/// fragments; anything larger is rejected.
const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Handler for `GET /ws`.
pub async fn ws_handler(
    Extension(state): Extension<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.max_message_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let conn = Uuid::new_v4();
    tracing::info!(connection = %conn, "live connection opened");

    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<LiveEvent>(OUTBOUND_BUFFER);
    let sink: Arc<dyn LiveSink> = Arc::new(tx);

    let send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!("failed to serialize live event: {}", e);
                    continue;
                }
            };
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = receiver.next().await {
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let command = match serde_json::from_str::<LiveCommand>(text.as_str()) {
            Ok(command) => command,
            Err(e) => {
                tracing::debug!(connection = %conn, "unparseable live frame: {}", e);
                sink.push(LiveEvent::error("无效的消息格式"));
                continue;
            }
        };
        handle_command(&state, conn, command, &sink);
    }

    state.chat.disconnect_voice(conn);
    send_task.abort();
    tracing::info!(connection = %conn, "live connection closed");
}

fn handle_command(state: &AppState, conn: Uuid, command: LiveCommand, sink: &Arc<dyn LiveSink>) {
    // Each failure below has already been pushed to the client.
    match command {
        LiveCommand::StartVoiceStream { conversation_id } => {
            let _ = state.chat.start_voice(conn, &conversation_id, sink.as_ref());
        }
        LiveCommand::VoiceData { audio_chunk } => {
            let _ = state.chat.voice_fragment(conn, &audio_chunk, sink);
        }
        LiveCommand::EndVoiceStream {} => {
            // Transcription and reply run detached, outliving the connection
            // if needed, while this loop keeps reading frames.
            let _ = state.chat.end_voice(conn, Arc::clone(sink));
        }
    }
}
