//! WebSocket subscription endpoint.
//!
//! One socket carries one session on one document. After the upgrade, the
//! client identifies the document with an `x-file-id` header (on the
//! upgrade request or inside its `init` frame); the server answers with the
//! connection id and the current user list, then forwards document events
//! until the socket closes. Missed events are not replayed here — a client
//! that lags recovers through the catch-up endpoint.

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use futures::SinkExt;
use futures::StreamExt;
use futures::stream::SplitSink;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;
use tracing::warn;
use uuid::Uuid;

use crate::hub::CollabEvent;
use crate::presence::{SessionRecord, TouchUpdate};
use crate::state::AppState;

/// Frames sent by the client.
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
enum ClientFrame {
    /// Opens the subscription. Fields may instead arrive as headers on the
    /// upgrade request.
    #[serde(rename_all = "camelCase")]
    Init {
        #[serde(default)]
        file_id: Option<String>,
        #[serde(default)]
        user_name: Option<String>,
    },
    /// Liveness ping.
    Heartbeat,
}

/// First frame sent by the server after a successful init.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InitAck {
    action: &'static str,
    connection_id: String,
    users: Vec<SessionRecord>,
}

/// Upgrade handler for `/ws`.
pub async fn ws_upgrade(State(state): State<AppState>, headers: HeaderMap, ws: WebSocketUpgrade) -> impl IntoResponse {
    let header_doc = header_value(&headers, "x-file-id");
    let header_user = header_value(&headers, "x-user-name");
    ws.on_upgrade(move |socket| handle_socket(state, socket, header_doc, header_user))
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string)
}

async fn handle_socket(state: AppState, socket: WebSocket, header_doc: Option<String>, header_user: Option<String>) {
    let (mut sink, mut stream) = socket.split();

    // The subscription starts with an init frame; headers on the upgrade
    // request may pre-fill its fields.
    let (doc, user_name) = loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientFrame>(&text) {
                Ok(ClientFrame::Init { file_id, user_name }) => {
                    let doc = match file_id.or_else(|| header_doc.clone()) {
                        Some(doc) => doc,
                        None => {
                            debug!("init frame without file id, closing socket");
                            let _ = sink.send(Message::Close(None)).await;
                            return;
                        }
                    };
                    let user = user_name
                        .or_else(|| header_user.clone())
                        .unwrap_or_else(|| "anonymous".to_string());
                    break (doc, user);
                }
                Ok(ClientFrame::Heartbeat) => continue,
                Err(e) => {
                    debug!(error = %e, "unparseable frame before init, ignoring");
                }
            },
            Some(Ok(Message::Close(_))) | None => return,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                debug!(error = %e, "socket error before init");
                return;
            }
        }
    };

    let session_id = Uuid::new_v4().to_string();

    // Subscribe before announcing the join so this session cannot miss its
    // own join broadcast window.
    let mut events = state.hub().subscribe(&doc);

    if let Err(e) = state.presence().add_session(&doc, &session_id, &user_name).await {
        warn!(doc = %doc, error = %e, "failed to register session");
        let _ = sink.send(Message::Close(None)).await;
        return;
    }

    let users = match state.presence().list_sessions(&doc).await {
        Ok(users) => users,
        Err(e) => {
            warn!(doc = %doc, error = %e, "failed to list sessions");
            Vec::new()
        }
    };

    let ack = InitAck {
        action: "init",
        connection_id: session_id.clone(),
        users: users.clone(),
    };
    if send_json(&mut sink, &ack).await.is_err() {
        teardown(&state, &doc, &session_id).await;
        return;
    }
    state.hub().publish(&doc, CollabEvent::UserJoined { payload: users });

    debug!(doc = %doc, session_id = %session_id, user = %user_name, "websocket session opened");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    if send_json(&mut sink, &event).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    // The client recovers missed operations via catch-up.
                    debug!(doc = %doc, session_id = %session_id, missed, "subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ClientFrame>(&text) {
                        Ok(ClientFrame::Heartbeat) => {
                            if let Err(e) = state.presence().touch(&doc, &user_name, TouchUpdate::heartbeat()).await {
                                warn!(doc = %doc, error = %e, "heartbeat touch failed");
                            }
                        }
                        Ok(ClientFrame::Init { .. }) => {
                            debug!(doc = %doc, session_id = %session_id, "duplicate init ignored");
                        }
                        Err(e) => {
                            debug!(doc = %doc, error = %e, "unrecognized client frame");
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(doc = %doc, session_id = %session_id, error = %e, "socket error");
                    break;
                }
            },
        }
    }

    teardown(&state, &doc, &session_id).await;
    debug!(doc = %doc, session_id = %session_id, "websocket session closed");
}

async fn send_json<T: Serialize>(sink: &mut SplitSink<WebSocket, Message>, value: &T) -> Result<(), axum::Error> {
    let text = serde_json::to_string(value).map_err(axum::Error::new)?;
    sink.send(Message::Text(text.into())).await
}

/// Remove the departing session and tell the remaining subscribers.
async fn teardown(state: &AppState, doc: &str, session_id: &str) {
    match state.presence().remove_session(doc, session_id).await {
        Ok(true) => {
            state.hub().publish(doc, CollabEvent::UserLeft {
                payload: session_id.to_string(),
            });
        }
        Ok(false) => {}
        Err(e) => warn!(doc = %doc, session_id = %session_id, error = %e, "failed to remove session"),
    }
}
