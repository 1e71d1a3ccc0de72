//! WebSocket transport for the chat assistant. One socket is one chat session.

use axum::{
    Router,
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::HeaderMap,
    response::Response,
    routing::get,
};
use futures::{SinkExt, StreamExt};
use medease_flow::ChatEngine;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{Instrument, debug, error, info, warn};
use uuid::Uuid;

use crate::auth::credential_from_headers;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

/// One user turn as received on the socket
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    pub mode: Option<String>,
    pub content: String,
}

pub fn router(engine: Arc<ChatEngine>) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .with_state(engine)
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(engine): State<Arc<ChatEngine>>,
    headers: HeaderMap,
    Query(query): Query<WsQuery>,
) -> Response {
    let credential = connection_credential(&headers, query.token);
    ws.on_upgrade(move |socket| handle_socket(socket, engine, credential))
}

/// Cookie, then `Authorization` header, then the `token` query parameter
pub fn connection_credential(headers: &HeaderMap, query_token: Option<String>) -> Option<String> {
    credential_from_headers(headers).or_else(|| query_token.filter(|token| !token.trim().is_empty()))
}

/// Accepts `{"mode": .., "content": ..}`, a JSON string, or raw text. Blank turns are dropped.
pub fn parse_inbound(text: &str) -> Option<Inbound> {
    let inbound = match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(object)) => Inbound {
            mode: object
                .get("mode")
                .and_then(Value::as_str)
                .map(str::to_string),
            content: object
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        },
        Ok(Value::String(content)) => Inbound {
            mode: None,
            content,
        },
        _ => Inbound {
            mode: None,
            content: text.to_string(),
        },
    };
    (!inbound.content.trim().is_empty()).then_some(inbound)
}

pub fn outbound_frame(reply: &str) -> String {
    json!({ "event": "message", "data": reply }).to_string()
}

async fn handle_socket(socket: WebSocket, engine: Arc<ChatEngine>, credential: Option<String>) {
    let connection_id = Uuid::new_v4().to_string();
    let span = tracing::info_span!("chat_connection", connection_id = %connection_id);
    run_session(socket, engine, connection_id, credential)
        .instrument(span)
        .await
}

async fn run_session(
    socket: WebSocket,
    engine: Arc<ChatEngine>,
    connection_id: String,
    credential: Option<String>,
) {
    let authenticated = credential.is_some();
    if let Err(e) = engine.connect(&connection_id, credential).await {
        error!("Failed to open chat session: {}", e);
        return;
    }
    info!(authenticated, "Chat connected");

    let (mut sink, mut stream) = socket.split();

    // Frames are handled one at a time, so turns of this session never interleave
    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!("Socket read failed: {}", e);
                break;
            }
        };

        let Some(inbound) = parse_inbound(text.as_str()) else {
            continue;
        };
        debug!(mode = inbound.mode.as_deref().unwrap_or("chat"), "User turn");

        match engine.handle_message(&connection_id, &inbound.content).await {
            Ok(reply) => {
                if sink
                    .send(Message::Text(outbound_frame(&reply).into()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Err(e) => {
                warn!("Chat turn failed: {}", e);
                break;
            }
        }
    }

    if let Err(e) = engine.disconnect(&connection_id).await {
        warn!("Failed to close chat session: {}", e);
    }
    info!("Chat disconnected");
}
