use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::ws::{close_code, CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use blob_shared::protocol::{ClientMsg, PongMsg, ServerMsg};
use blob_shared::types::Role;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot};
use tower_http::cors::CorsLayer;

use crate::credential::VisitorGate;
use crate::game_loop::{GameBroadcast, GameCommand};
use crate::sessions::AdmissionRequest;

/// Multiple of `max_message_size` past which the transport itself refuses a
/// message before buffering it. Anything in between is read and closed with
/// a 1009.
const TRANSPORT_LIMIT_FACTOR: usize = 4;

/// Shared app state passed to each WebSocket handler
#[derive(Clone)]
pub struct AppState {
    pub game_tx: mpsc::Sender<GameCommand>,
    pub broadcast_tx: broadcast::Sender<GameBroadcast>,
    pub gate: Arc<VisitorGate>,
    /// Largest inbound message accepted before the connection is closed
    pub max_message_size: usize,
    pub outbox_capacity: usize,
}

/// Query string of `/ws`
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    pub role: Option<String>,
    pub skin: Option<String>,
    pub token: Option<String>,
    pub visitor: Option<String>,
}

impl ConnectParams {
    pub fn into_request(self) -> AdmissionRequest {
        let role = match self.role.as_deref() {
            Some("spectator") => Role::Spectator,
            _ => Role::Player,
        };
        AdmissionRequest {
            role,
            skin: self.skin,
            token: self.token,
            visitor: self.visitor,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct VisitorResponse {
    pub credential: String,
}

pub fn router(app_state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/visitor", get(visitor_handler))
        .layer(CorsLayer::permissive())
        .with_state(app_state)
}

/// Issue a visitor credential for the next `/ws` connection
pub async fn visitor_handler(State(app_state): State<AppState>) -> Json<VisitorResponse> {
    Json(VisitorResponse {
        credential: app_state.gate.issue(),
    })
}

/// HTTP handler for WebSocket upgrade
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(app_state): State<AppState>,
) -> impl IntoResponse {
    let request = params.into_request();
    let transport_limit = app_state
        .max_message_size
        .saturating_mul(TRANSPORT_LIMIT_FACTOR);
    ws.max_message_size(transport_limit)
        .max_frame_size(transport_limit)
        .on_upgrade(move |socket| handle_socket(socket, app_state, request))
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

async fn send_json(sink: &mut SplitSink<WebSocket, Message>, msg: &ServerMsg) -> bool {
    match serde_json::to_string(msg) {
        Ok(json) => sink.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            tracing::warn!("Failed to serialize message: {}", e);
            true
        }
    }
}

async fn close_with(sink: &mut SplitSink<WebSocket, Message>, code: u16, reason: &'static str) {
    let frame = CloseFrame {
        code,
        reason: Utf8Bytes::from_static(reason),
    };
    let _ = sink.send(Message::Close(Some(frame))).await;
}

async fn handle_socket(socket: WebSocket, app_state: AppState, request: AdmissionRequest) {
    let (mut sink, mut stream) = socket.split();

    let (outbox_tx, mut outbox_rx) = mpsc::channel(app_state.outbox_capacity);
    let (resp_tx, resp_rx) = oneshot::channel();
    if app_state
        .game_tx
        .send(GameCommand::Connect {
            request,
            outbox: outbox_tx,
            response: resp_tx,
        })
        .await
        .is_err()
    {
        tracing::error!("Failed to send Connect command");
        return;
    }

    let joined = match resp_rx.await {
        Ok(Ok(joined)) => joined,
        Ok(Err(rejection)) => {
            close_with(&mut sink, rejection.close_code(), rejection.reason()).await;
            return;
        }
        Err(_) => {
            tracing::error!("Game loop dropped the admission request");
            return;
        }
    };
    let my_id = joined.id;

    if !send_json(&mut sink, &ServerMsg::Welcome(joined.welcome)).await {
        let _ = app_state.game_tx.send(GameCommand::Disconnect { id: my_id }).await;
        return;
    }
    if let Some(snapshot) = joined.snapshot {
        if sink.send(Message::Binary(snapshot)).await.is_err() {
            let _ = app_state.game_tx.send(GameCommand::Disconnect { id: my_id }).await;
            return;
        }
    }

    // Subscribe to broadcasts
    let mut broadcast_rx = app_state.broadcast_tx.subscribe();

    loop {
        tokio::select! {
            // Client -> Server
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if text.as_str().len() > app_state.max_message_size {
                            tracing::warn!(
                                "Connection {} sent {} bytes, closing",
                                my_id,
                                text.as_str().len()
                            );
                            close_with(&mut sink, close_code::SIZE, "message too large").await;
                            break;
                        }
                        match serde_json::from_str::<ClientMsg>(text.as_str()) {
                            Ok(ClientMsg::Action { action }) => {
                                let _ = app_state
                                    .game_tx
                                    .send(GameCommand::Action { id: my_id, action })
                                    .await;
                            }
                            Ok(ClientMsg::Ping { t }) => {
                                let pong = ServerMsg::Pong(PongMsg {
                                    t,
                                    server_time: now_millis(),
                                });
                                if !send_json(&mut sink, &pong).await {
                                    break;
                                }
                            }
                            Err(e) => {
                                tracing::debug!("Connection {} sent malformed message: {}", my_id, e);
                            }
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        if data.len() > app_state.max_message_size {
                            close_with(&mut sink, close_code::SIZE, "message too large").await;
                            break;
                        }
                        tracing::debug!("Connection {} sent unexpected binary message", my_id);
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!("Connection {} read error: {}", my_id, e);
                        break;
                    }
                    _ => {} // Ping/pong frames are answered by the transport
                }
            }

            // Server -> this client only
            Some(msg) = outbox_rx.recv() => {
                if !send_json(&mut sink, &msg).await {
                    break;
                }
            }

            // Server -> Client (broadcast)
            result = broadcast_rx.recv() => {
                match result {
                    Ok(payload) => {
                        let message = match payload {
                            GameBroadcast::Frame(frame) => Message::Binary(frame),
                            GameBroadcast::Text(text) => Message::Text(text),
                        };
                        if sink.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Connection {} lagged by {} messages", my_id, n);
                        // Snapshots are full state, the next one catches up
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    // Cleanup on disconnect
    let _ = app_state
        .game_tx
        .send(GameCommand::Disconnect { id: my_id })
        .await;
    tracing::info!("Connection {} disconnected", my_id);
}
