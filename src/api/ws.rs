//! WebSocket protocol adapter: one socket, one canonical request per client
//! message, one JSON message per stream chunk. Request errors are answered
//! in-band; the socket stays open unless the transport itself fails.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::backend::{Backend, ChatMessage, GenerateRequest, Operation};
use crate::error::ProxyError;
use crate::routing::annotations::Annotations;
use crate::stream::{relay, TokenChunk, WRITE_DEADLINE};
use crate::AppState;

#[derive(Debug, Deserialize)]
struct WsRequest {
    #[serde(default)]
    request_id: Option<String>,
    model: String,
    #[serde(default)]
    prompt: Option<String>,
    #[serde(default)]
    messages: Vec<ChatMessage>,
    #[serde(default = "default_stream")]
    stream: bool,
    #[serde(default)]
    options: Option<serde_json::Value>,
    #[serde(default)]
    annotations: Option<Annotations>,
}

fn default_stream() -> bool {
    true
}

/// The socket went away (closed, write error, frame deadline exceeded).
struct SocketGone;

pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>) {
    debug!("WebSocket connected");
    while let Some(Ok(message)) = socket.recv().await {
        match message {
            Message::Text(text) => {
                if handle_request(&mut socket, &state, text.as_str())
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Message::Close(_) => break,
            // Pings are answered by the transport layer.
            _ => {}
        }
    }
    debug!("WebSocket disconnected");
}

async fn handle_request(
    socket: &mut WebSocket,
    state: &Arc<AppState>,
    raw: &str,
) -> Result<(), SocketGone> {
    let request: WsRequest = match serde_json::from_str(raw) {
        Ok(r) => r,
        Err(e) => {
            return send_error(
                socket,
                None,
                &ProxyError::InvalidRequest(format!("bad request message: {e}")),
            )
            .await;
        }
    };

    let request_id = request.request_id.clone();
    let mut annotations = request.annotations.unwrap_or_default();
    if annotations.request_id.is_none() {
        annotations.request_id = request_id.clone();
    }

    if let Err(e) = state.admit() {
        return send_error(socket, request_id.as_deref(), &e).await;
    }

    info!(
        model = %request.model,
        stream = request.stream,
        request_id = ?request_id,
        "WebSocket inference request"
    );

    let generate = GenerateRequest {
        model: request.model.clone(),
        prompt: request.prompt,
        messages: request.messages,
        options: request.options,
    };

    if request.stream {
        stream_request(socket, state, generate, annotations, request_id).await
    } else {
        match super::openai::generate_with_fallback(state, &generate, &annotations).await {
            Ok((decision, resp)) => {
                let chunk = TokenChunk {
                    token: resp.text,
                    done: true,
                    total_tokens: Some(resp.total_tokens),
                    total_duration_ms: Some(resp.duration_ms),
                    backend_id: Some(decision.backend.id().to_string()),
                    ..TokenChunk::default()
                };
                send_chunk(socket, request_id.as_deref(), &chunk).await
            }
            Err(e) => send_error(socket, request_id.as_deref(), &e).await,
        }
    }
}

async fn stream_request(
    socket: &mut WebSocket,
    state: &Arc<AppState>,
    generate: GenerateRequest,
    annotations: Annotations,
    request_id: Option<String>,
) -> Result<(), SocketGone> {
    let decision = match state
        .engine
        .route(&generate.model, Operation::Stream, &annotations)
    {
        Ok(d) => d,
        Err(e) => return send_error(socket, request_id.as_deref(), &e).await,
    };

    let guard = state
        .queues
        .mark_start(decision.backend.id(), annotations.effective_priority());

    let stream = match decision.backend.backend.generate_stream(generate).await {
        Ok(s) => s,
        Err(e) => {
            decision
                .backend
                .backend
                .record_outcome(Duration::ZERO, false);
            drop(guard);
            let err = ProxyError::Backend {
                backend_id: decision.backend.id().to_string(),
                message: e.to_string(),
            };
            return send_error(socket, request_id.as_deref(), &err).await;
        }
    };

    let deadline = annotations.deadline_ms.map(Duration::from_millis);
    let mut rx = relay(
        Arc::clone(&decision.backend.backend),
        stream,
        guard,
        deadline,
    );

    while let Some(item) = rx.recv().await {
        match item {
            Ok(chunk) => send_chunk(socket, request_id.as_deref(), &chunk).await?,
            Err(e) => send_error(socket, request_id.as_deref(), &e).await?,
        }
    }
    Ok(())
}

/// Send one JSON message within the per-frame write deadline. Exceeding it
/// abandons the socket (`client_write_timeout`); dropping the stream
/// receiver upstream cancels the producer.
async fn send_json(socket: &mut WebSocket, payload: String) -> Result<(), SocketGone> {
    match tokio::time::timeout(WRITE_DEADLINE, socket.send(Message::Text(payload.into()))).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(send_err)) => {
            let err = ProxyError::Cancelled;
            debug!(error = %err, cause = %send_err, "WebSocket send failed");
            Err(SocketGone)
        }
        Err(_) => {
            let err = ProxyError::ClientTooSlow {
                code: "client_write_timeout",
            };
            warn!(error = %err, "WebSocket frame write exceeded deadline");
            Err(SocketGone)
        }
    }
}

async fn send_chunk(
    socket: &mut WebSocket,
    request_id: Option<&str>,
    chunk: &TokenChunk,
) -> Result<(), SocketGone> {
    let mut value = serde_json::to_value(chunk).unwrap_or_default();
    if let (Some(id), Some(map)) = (request_id, value.as_object_mut()) {
        map.insert("request_id".into(), serde_json::Value::String(id.into()));
    }
    send_json(socket, value.to_string()).await
}

async fn send_error(
    socket: &mut WebSocket,
    request_id: Option<&str>,
    error: &ProxyError,
) -> Result<(), SocketGone> {
    let payload = serde_json::json!({
        "request_id": request_id,
        "error": error.to_string(),
        "code": error.code(),
    });
    send_json(socket, payload.to_string()).await
}
