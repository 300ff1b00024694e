use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::hub::normalize_token;
use crate::server::AppState;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
    /// Id of a previous connection this client is resuming
    pub connection_id: Option<String>,
}

/// WebSocket upgrade handler
#[tracing::instrument(
    name = "ws.upgrade",
    skip(ws, state, query, headers),
    fields(
        has_query_token = query.token.is_some(),
        resuming = query.connection_id.is_some()
    )
)]
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
) -> Response {
    let credential = match extract_credential(&state.settings.relay.credential_cookie, &query, &headers) {
        Some(c) => c,
        None => {
            return (StatusCode::UNAUTHORIZED, "Missing user token").into_response();
        }
    };

    if normalize_token(&credential).is_empty() {
        return (StatusCode::BAD_REQUEST, "Invalid user token").into_response();
    }

    let (connection_id, reconnect) = match query.connection_id.filter(|id| !id.is_empty()) {
        Some(id) => (id, true),
        None => (Uuid::new_v4().to_string(), false),
    };

    ws.on_upgrade(move |socket| handle_socket(socket, state, connection_id, credential, reconnect))
}

/// Credential lookup order: cookie, `token` query parameter, bearer header
fn extract_credential(cookie_name: &str, query: &WsQuery, headers: &HeaderMap) -> Option<String> {
    if let Some(token) = cookie_value(headers, cookie_name) {
        return Some(token);
    }

    if let Some(ref token) = query.token {
        return Some(token.clone());
    }

    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::to_string)
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.trim().to_string())
}

/// Handle an established WebSocket connection
#[tracing::instrument(name = "ws.connection", skip(socket, state, credential))]
async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    connection_id: String,
    credential: String,
    reconnect: bool,
) {
    let connection_start = std::time::Instant::now();

    let (tx, mut rx) = mpsc::channel::<Arc<str>>(state.settings.websocket.channel_buffer_size);
    let handle = state.transport.connect(connection_id.clone(), tx);

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Frames are serialized once per delivery by the transport
    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if ws_sender.send(Message::Text(frame.to_string().into())).await.is_err() {
                break;
            }
        }
    });

    let joined = if reconnect {
        state.hub.on_reconnected(&connection_id, &credential).await
    } else {
        state.hub.on_connected(&connection_id, &credential).await
    };

    match joined {
        Ok(outcome) => {
            tracing::info!(
                connection_id = %connection_id,
                user_token = %outcome.user_token,
                groups = ?outcome.groups,
                "WebSocket connection established"
            );

            while let Some(result) = ws_receiver.next().await {
                match result {
                    Ok(Message::Close(_)) => {
                        tracing::debug!(connection_id = %connection_id, "Received close frame");
                        break;
                    }
                    // The relay is push-only; inbound frames are ignored
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "WebSocket receive error");
                        break;
                    }
                }
            }
        }
        Err(e) => {
            tracing::warn!(connection_id = %connection_id, error = %e, "Group registration rejected");
        }
    }

    state.transport.disconnect(&handle);
    send_task.abort();

    tracing::info!(
        connection_id = %connection_id,
        duration_secs = connection_start.elapsed().as_secs_f64(),
        "WebSocket connection closed"
    );
}
