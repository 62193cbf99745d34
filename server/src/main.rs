use std::sync::Arc;

use anyhow::Context;
use blob_server::config::ServerConfig;
use blob_server::credential::VisitorGate;
use blob_server::game_loop::{run_game_loop, GameBroadcast, GameCommand};
use blob_server::policy::PolicySet;
use blob_server::ws::{router, AppState};
use tokio::sync::{broadcast, mpsc};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    tracing::info!("Blob arena server v{}", env!("CARGO_PKG_VERSION"));

    let config = ServerConfig::load_or_default();
    config
        .validate()
        .context("Invalid server configuration")?;

    let listen_addr = config.listen_addr.clone();
    let policies = PolicySet::load(config.policy_entities, &config.policy_weights);
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

    // Spawn game loop
    tokio::spawn(async move {
        run_game_loop(game_rx, broadcast_tx, config, policies, gate).await;
    });

    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", listen_addr))?;
    tracing::info!("Listening on {}", listen_addr);

    axum::serve(listener, router(app_state)).await?;
    Ok(())
}
