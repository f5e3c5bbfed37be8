//! Streaming endpoint for Uni Chat.
//!
//! `GET /ws/chat/{session_id}` upgrades to a WebSocket. Each text frame
//! `{"message": ...}` is answered with `{"token": ...}` frames and a final
//! `{"end": true}`, or with `{"error": ...}`. The connection stays open
//! between turns. History is kept per session id, so a client may open a
//! new connection for every turn.

pub mod config;
pub mod error;
pub mod llm;

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{Path, State},
    response::IntoResponse,
    routing::get,
    Router,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, error, info, warn};
use uni_chat_shared::{ChatMessage, InboundFrame, OutboundFrame};

pub use config::ServerConfig;
pub use error::{Result, ServerError};
pub use llm::{ChatBackend, LlmService, ReplyChunk};

/// Completed turns of every chat session, keyed by session id.
#[derive(Clone, Default)]
pub struct HistoryStore {
    sessions: Arc<Mutex<HashMap<String, Vec<ChatMessage>>>>,
}

impl HistoryStore {
    pub fn get(&self, session_id: &str) -> Vec<ChatMessage> {
        self.lock().get(session_id).cloned().unwrap_or_default()
    }

    /// Records a finished turn. Failed turns are never recorded.
    pub fn append_turn(&self, session_id: &str, user: ChatMessage, assistant: ChatMessage) {
        let mut sessions = self.lock();
        let history = sessions.entry(session_id.to_string()).or_default();
        history.push(user);
        history.push(assistant);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<ChatMessage>>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Clone)]
pub struct AppState {
    backend: Arc<dyn ChatBackend>,
    histories: HistoryStore,
}

impl AppState {
    pub fn new(backend: impl ChatBackend) -> Self {
        Self {
            backend: Arc::new(backend),
            histories: HistoryStore::default(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws/chat/:session_id", get(ws_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> &'static str {
    "OK"
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, session_id, state))
}

async fn handle_socket(mut socket: WebSocket, session_id: String, state: AppState) {
    info!("New WebSocket connection for session {}", session_id);

    while let Some(msg) = socket.recv().await {
        match msg {
            Ok(Message::Text(text)) => {
                if let Err(e) = handle_turn(&mut socket, &session_id, &state, &text).await {
                    warn!("Failed to send frame to session {}: {}", session_id, e);
                    break;
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!("WebSocket error on session {}: {}", session_id, e);
                break;
            }
        }
    }

    info!("WebSocket connection for session {} closed", session_id);
}

/// Answers one request frame. Only socket failures are returned; request
/// and LLM failures are reported to the client as `{"error": ...}`.
async fn handle_turn(
    socket: &mut WebSocket,
    session_id: &str,
    state: &AppState,
    text: &str,
) -> std::result::Result<(), axum::Error> {
    let request = match serde_json::from_str::<OutboundFrame>(text) {
        Ok(request) if !request.message.trim().is_empty() => request,
        Ok(_) => {
            return send_frame(socket, InboundFrame::Error("No message provided.".to_string())).await;
        }
        Err(e) => {
            error!("Failed to parse request: {}", e);
            return send_frame(socket, InboundFrame::Error(format!("Invalid request format: {e}")))
                .await;
        }
    };

    let user = ChatMessage::user(request.message);
    let mut history = state.histories.get(session_id);
    history.push(user.clone());
    debug!(
        "Streaming reply over {} messages with {}",
        history.len(),
        state.backend.model()
    );

    let mut rx = match state.backend.stream_reply(history).await {
        Ok(rx) => rx,
        Err(e) => {
            error!("Failed to stream chat: {}", e);
            return send_frame(socket, InboundFrame::Error(e.to_string())).await;
        }
    };

    let mut reply = String::new();
    while let Some(chunk) = rx.recv().await {
        match chunk {
            ReplyChunk::Token(token) => {
                reply.push_str(&token);
                send_frame(socket, InboundFrame::Token(token)).await?;
            }
            ReplyChunk::Failed(message) => {
                return send_frame(socket, InboundFrame::Error(message)).await;
            }
        }
    }

    info!("Sent reply ({} chars)", reply.len());
    // Recorded before `end` so a client reconnecting right away sees it.
    state
        .histories
        .append_turn(session_id, user, ChatMessage::assistant(reply));
    send_frame(socket, InboundFrame::End).await
}

async fn send_frame(socket: &mut WebSocket, frame: InboundFrame) -> std::result::Result<(), axum::Error> {
    let json = frame.encode().map_err(axum::Error::new)?;
    socket.send(Message::Text(json)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_store_keeps_sessions_apart() {
        let store = HistoryStore::default();
        store.append_turn("s1", ChatMessage::user("hi"), ChatMessage::assistant("hello"));
        store.append_turn("s1", ChatMessage::user("bye"), ChatMessage::assistant("later"));

        let history = store.get("s1");
        assert_eq!(history.len(), 4);
        assert_eq!(history[2].content, "bye");
        assert!(store.get("s2").is_empty());
    }

    #[test]
    fn clones_share_the_same_store() {
        let store = HistoryStore::default();
        let clone = store.clone();
        clone.append_turn("s1", ChatMessage::user("hi"), ChatMessage::assistant("hello"));
        assert_eq!(store.get("s1").len(), 2);
    }
}
