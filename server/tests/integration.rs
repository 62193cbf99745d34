//! Integration tests for the blob arena server.
//!
//! These tests start a real server instance and connect via WebSocket
//! to verify end-to-end behavior.

use std::sync::Arc;
use std::time::Duration;

use blob_server::config::ServerConfig;
use blob_server::credential::VisitorGate;
use blob_server::game_loop::{run_game_loop, GameBroadcast, GameCommand};
use blob_server::policy::PolicySet;
use blob_server::ws::{router, AppState};
use blob_shared::frame::StateFrame;
use blob_shared::protocol::ServerMsg;
use blob_shared::types::Role;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{connect_async, tungstenite::Message};

type Ws = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>;

struct TestServer {
    addr: String,
    gate: Arc<VisitorGate>,
    broadcast_tx: broadcast::Sender<GameBroadcast>,
}

impl TestServer {
    fn player_url(&self, token: &str) -> String {
        format!(
            "ws://{}/ws?role=player&skin=blue&token={}&visitor={}",
            self.addr,
            token,
            self.gate.issue()
        )
    }

    fn spectator_url(&self) -> String {
        format!(
            "ws://{}/ws?role=spectator&visitor={}",
            self.addr,
            self.gate.issue()
        )
    }
}

fn test_config() -> ServerConfig {
    ServerConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        policy_entities: 2,
        rng_seed: 12345,
        max_players: 4,
        ..Default::default()
    }
}

/// Start a test server on a random available port.
async fn start_test_server() -> TestServer {
    start_test_server_with(test_config()).await
}

async fn start_test_server_with(config: ServerConfig) -> TestServer {
    let listener = TcpListener::bind(&config.listen_addr).await.unwrap();
    let addr = listener.local_addr().unwrap();

    let gate = Arc::new(VisitorGate::new());
    let (game_tx, game_rx) = mpsc::channel::<GameCommand>(256);
    let (broadcast_tx, _) = broadcast::channel::<GameBroadcast>(config.broadcast_capacity);

    let app_state = AppState {
        game_tx,
        broadcast_tx: broadcast_tx.clone(),
        gate: gate.clone(),
        max_message_size: config.max_message_size,
        outbox_capacity: config.outbox_capacity,
    };

    // Start game loop
    let loop_broadcast_tx = broadcast_tx.clone();
    let policies = PolicySet::load(config.policy_entities, &config.policy_weights);
    let loop_gate = gate.clone();
    tokio::spawn(async move {
        run_game_loop(game_rx, loop_broadcast_tx, config, policies, loop_gate).await;
    });

    // Start HTTP/WebSocket server
    tokio::spawn(async move {
        axum::serve(listener, router(app_state)).await.unwrap();
    });

    TestServer {
        addr: addr.to_string(),
        gate,
        broadcast_tx,
    }
}

async fn connect(url: &str) -> Ws {
    let (ws, _) = connect_async(url).await.expect("Failed to connect");
    ws
}

/// Read the next text message and parse as ServerMsg, skipping frames.
async fn recv_msg(ws: &mut Ws) -> ServerMsg {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                return serde_json::from_str(text.as_str()).expect("Failed to parse server message");
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => panic!("WebSocket error: {}", e),
            None => panic!("WebSocket closed unexpectedly"),
        }
    }
}

/// Read the next binary state frame, skipping text.
async fn recv_frame(ws: &mut Ws) -> StateFrame {
    loop {
        match ws.next().await {
            Some(Ok(Message::Binary(data))) => {
                return StateFrame::decode(&data).expect("Failed to decode frame");
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => panic!("WebSocket error: {}", e),
            None => panic!("WebSocket closed unexpectedly"),
        }
    }
}

/// Wait for the server to close the connection and return its close code.
async fn recv_close_code(ws: &mut Ws) -> Option<u16> {
    let deadline = Duration::from_secs(2);
    tokio::time::timeout(deadline, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(frame))) => return frame.map(|f| u16::from(f.code)),
                Some(Ok(_)) => continue,
                Some(Err(_)) | None => return None,
            }
        }
    })
    .await
    .expect("Server did not close the connection")
}

async fn recv_pong(ws: &mut Ws) -> f64 {
    let wait = async {
        loop {
            if let ServerMsg::Pong(p) = recv_msg(ws).await {
                return p.t;
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(2), wait)
        .await
        .expect("No pong received")
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_player_receives_welcome_and_snapshot() {
    let server = start_test_server().await;
    let mut ws = connect(&server.player_url("integration-token-01")).await;

    match recv_msg(&mut ws).await {
        ServerMsg::Welcome(w) => {
            assert_eq!(w.role, Role::Player);
            assert_eq!(w.slot, Some(2));
            assert_eq!(w.protocol_version, blob_shared::protocol::PROTOCOL_VERSION);
        }
        other => panic!("Expected welcome, got {:?}", other),
    }

    let frame = recv_frame(&mut ws).await;
    assert_eq!(frame.entities.len(), 3);
    assert!(frame.entities[2].flags.remote);
    assert_eq!(frame.foods.len(), 10);
}

#[tokio::test]
async fn test_spectator_has_no_slot_and_gets_frames() {
    let server = start_test_server().await;
    let mut ws = connect(&server.spectator_url()).await;

    match recv_msg(&mut ws).await {
        ServerMsg::Welcome(w) => {
            assert_eq!(w.role, Role::Spectator);
            assert_eq!(w.slot, None);
        }
        other => panic!("Expected welcome, got {:?}", other),
    }

    // initial snapshot, then the regular stream
    recv_frame(&mut ws).await;
    let frame = tokio::time::timeout(Duration::from_secs(2), recv_frame(&mut ws))
        .await
        .expect("No broadcast frame");
    assert_eq!(frame.entities.len(), 2);
}

#[tokio::test]
async fn test_missing_credential_is_rejected() {
    let server = start_test_server().await;
    let url = format!("ws://{}/ws?role=spectator", server.addr);
    let mut ws = connect(&url).await;
    assert_eq!(recv_close_code(&mut ws).await, Some(4001));
}

#[tokio::test]
async fn test_short_token_is_rejected() {
    let server = start_test_server().await;
    let mut ws = connect(&server.player_url("short")).await;
    assert_eq!(recv_close_code(&mut ws).await, Some(4002));
}

#[tokio::test]
async fn test_duplicate_token_is_rejected() {
    let server = start_test_server().await;
    let token = "integration-token-dup";
    let mut first = connect(&server.player_url(token)).await;
    assert!(matches!(recv_msg(&mut first).await, ServerMsg::Welcome(_)));

    let mut second = connect(&server.player_url(token)).await;
    assert_eq!(recv_close_code(&mut second).await, Some(4003));

    // first session is unaffected
    first
        .send(Message::Text(r#"{"type":"ping","t":1.0}"#.into()))
        .await
        .unwrap();
    assert_eq!(recv_pong(&mut first).await, 1.0);
}

#[tokio::test]
async fn test_ping_is_echoed() {
    let server = start_test_server().await;
    let mut ws = connect(&server.spectator_url()).await;
    recv_msg(&mut ws).await;

    ws.send(Message::Text(r#"{"type":"ping","t":42.5}"#.into()))
        .await
        .unwrap();
    assert_eq!(recv_pong(&mut ws).await, 42.5);
}

#[tokio::test]
async fn test_malformed_messages_are_ignored() {
    let server = start_test_server().await;
    let mut ws = connect(&server.player_url("integration-token-02")).await;
    recv_msg(&mut ws).await;

    for bad in [
        "not valid json",
        r#"{"type":"teleport"}"#,
        r#"{"type":"action","action":9}"#,
    ] {
        ws.send(Message::Text(bad.into())).await.unwrap();
    }
    ws.send(Message::Text(r#"{"type":"action","action":1}"#.into()))
        .await
        .unwrap();
    ws.send(Message::Text(r#"{"type":"ping","t":7.0}"#.into()))
        .await
        .unwrap();
    assert_eq!(recv_pong(&mut ws).await, 7.0);
}

#[tokio::test]
async fn test_oversized_message_closes_connection() {
    let server = start_test_server().await;
    let mut ws = connect(&server.spectator_url()).await;
    recv_msg(&mut ws).await;

    let msg = format!(r#"{{"type":"ping","t":1.0,"pad":"{}"}}"#, "x".repeat(2000));
    let _ = ws.send(Message::Text(msg.into())).await;
    assert_eq!(
        recv_close_code(&mut ws).await,
        Some(u16::from(CloseCode::Size))
    );
}

#[tokio::test]
async fn test_huge_message_is_refused_by_transport() {
    let server = start_test_server().await;
    let mut ws = connect(&server.spectator_url()).await;
    recv_msg(&mut ws).await;

    let msg = format!(r#"{{"type":"ping","t":1.0,"pad":"{}"}}"#, "x".repeat(64 * 1024));
    let _ = ws.send(Message::Text(msg.into())).await;
    let code = recv_close_code(&mut ws).await;
    assert!(code.is_none() || code == Some(u16::from(CloseCode::Size)), "{:?}", code);

    // the server keeps serving others
    let mut other = connect(&server.spectator_url()).await;
    assert!(matches!(recv_msg(&mut other).await, ServerMsg::Welcome(_)));
}

#[tokio::test]
async fn test_stalled_peers_do_not_hold_up_others() {
    let config = ServerConfig {
        broadcast_capacity: 2,
        ..test_config()
    };
    let server = start_test_server_with(config).await;

    // one subscriber that never drains the fan-out channel and one socket
    // that never reads
    let mut stalled_rx = server.broadcast_tx.subscribe();
    let _stalled_ws = connect(&server.spectator_url()).await;

    let mut ws = connect(&server.spectator_url()).await;
    recv_msg(&mut ws).await;
    let first = recv_frame(&mut ws).await;

    let mut frames = 0;
    let mut last = first.clone();
    let window = tokio::time::Instant::now() + Duration::from_secs(1);
    while tokio::time::Instant::now() < window {
        match tokio::time::timeout(Duration::from_millis(500), recv_frame(&mut ws)).await {
            Ok(frame) => {
                frames += 1;
                last = frame;
            }
            Err(_) => panic!("Frames stopped after {}", frames),
        }
    }
    assert!(frames >= 5, "only {} frames in a second", frames);
    assert_ne!(first.entities[0].x, last.entities[0].x);

    ws.send(Message::Text(r#"{"type":"ping","t":3.0}"#.into()))
        .await
        .unwrap();
    assert_eq!(recv_pong(&mut ws).await, 3.0);

    // the idle subscriber fell behind and lost frames instead of queueing them
    assert!(matches!(
        stalled_rx.try_recv(),
        Err(broadcast::error::TryRecvError::Lagged(_))
    ));
}

#[tokio::test]
async fn test_visitor_endpoint_issues_valid_credentials() {
    let server = start_test_server().await;

    let mut stream = TcpStream::connect(&server.addr).await.unwrap();
    let request = format!(
        "GET /visitor HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        server.addr
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();

    assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
    let body = response.split("\r\n\r\n").nth(1).unwrap();
    let json: serde_json::Value = serde_json::from_str(body).unwrap();
    let credential = json["credential"].as_str().unwrap();
    assert!(server.gate.verify(credential).is_ok());
}
