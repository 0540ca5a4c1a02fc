//! Axum WebSocket handler for the streaming recognition endpoint.
//!
//! Upgrades the connection, allocates a session, sends the one-time
//! connection acknowledgement, then loops read → process → (asynchronous)
//! reply. Outbound traffic is drained by a spawned sender task so the read
//! loop never blocks on a slow client.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt, stream::SplitSink};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::session::{OutboundMessage, Session, SessionManager};
use crate::state::AppState;

/// Streaming recognition handler.
/// Upgrades the HTTP connection to WebSocket for real-time transcription.
pub async fn ws_stream_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    let Some(manager) = state.session_manager.clone() else {
        warn!("WebSocket upgrade refused: session manager not initialized");
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };
    debug!("WebSocket connection upgrade requested");
    ws.on_upgrade(move |socket| handle_stream_socket(socket, state, manager))
}

async fn handle_stream_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    manager: Arc<SessionManager>,
) {
    let session_id = uuid::Uuid::new_v4().simple().to_string();
    let (sender, mut receiver) = socket.split();

    let (session, outbound_rx) = manager.create_session(&session_id);
    info!("New WebSocket connection established, session_id={}", session_id);

    session.enqueue(OutboundMessage::Connection {
        session_id: session_id.clone(),
        message: "connected, ready for audio".to_string(),
    });

    let sender_task = tokio::spawn(send_loop(
        sender,
        outbound_rx,
        Arc::clone(&session),
        state.config.session.max_send_errors,
    ));

    let read_timeout = state.config.server.websocket.read_timeout;
    let max_message_size = state.config.server.websocket.max_message_size;

    loop {
        // The read deadline is refreshed by construction: a fresh timeout
        // wraps every frame.
        let inbound = if read_timeout > 0 {
            match tokio::time::timeout(Duration::from_secs(read_timeout), receiver.next()).await {
                Ok(inbound) => inbound,
                Err(_) => {
                    warn!("Session {}: read timeout, closing", session_id);
                    break;
                }
            }
        } else {
            receiver.next().await
        };

        match inbound {
            Some(Ok(Message::Binary(data))) => {
                if max_message_size > 0 && data.len() > max_message_size {
                    warn!(
                        "Session {}: frame of {} bytes exceeds limit, closing",
                        session_id,
                        data.len()
                    );
                    break;
                }
                if data.is_empty() {
                    continue;
                }
                // Binary frames arrive as `Bytes` and move into the
                // pipeline without copying.
                if let Err(e) = manager.process_audio(&session_id, data).await {
                    warn!("Session {}: failed to process audio: {}", session_id, e);
                    session.enqueue(OutboundMessage::Error {
                        message: e.to_string(),
                    });
                }
            }
            Some(Ok(Message::Text(_))) => {
                // The streaming endpoint speaks binary PCM only.
                session.enqueue(OutboundMessage::Error {
                    message: "expected binary audio frame".to_string(),
                });
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
            Some(Ok(Message::Close(_))) => {
                info!("Session {}: closed by client", session_id);
                break;
            }
            Some(Err(e)) => {
                warn!("Session {}: WebSocket read error: {}", session_id, e);
                break;
            }
            None => break,
        }
    }

    manager.remove_session(&session_id);
    sender_task.abort();
    info!("WebSocket connection closed, session_id={}", session_id);
}

/// Single consumer of the session's outbound queue.
///
/// Serializes messages as JSON text in enqueue order. Consecutive write
/// failures beyond the configured threshold mark the session closed; a
/// close signal drains whatever is still buffered.
async fn send_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut outbound_rx: mpsc::Receiver<OutboundMessage>,
    session: Arc<Session>,
    max_send_errors: u32,
) {
    loop {
        tokio::select! {
            message = outbound_rx.recv() => {
                let Some(message) = message else { break };
                if session.is_closed() {
                    break;
                }
                let json = match serde_json::to_string(&message) {
                    Ok(json) => json,
                    Err(e) => {
                        error!("Failed to serialize outgoing message: {}", e);
                        continue;
                    }
                };
                if let Err(e) = sender.send(Message::Text(json.into())).await {
                    let errors = session.record_send_error();
                    error!(
                        "Failed to send message to session {}: {}",
                        session.id(),
                        e
                    );
                    if errors > max_send_errors {
                        error!("Too many send errors for session {}, closing", session.id());
                        session.mark_closed();
                        break;
                    }
                } else {
                    session.reset_send_errors();
                }
            }
            _ = session.done() => {
                while outbound_rx.try_recv().is_ok() {}
                break;
            }
        }
    }
}
