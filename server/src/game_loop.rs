use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::Utf8Bytes;
use blob_shared::protocol::ServerMsg;
use blob_shared::types::Action;
use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::config::ServerConfig;
use crate::credential::VisitorGate;
use crate::policy::PolicySet;
use crate::scheduler::{Joined, TickScheduler};
use crate::sessions::{AdmissionError, AdmissionRequest, ConnectionId};

/// Commands from client connections to the game loop
pub enum GameCommand {
    Connect {
        request: AdmissionRequest,
        /// Unicast channel for messages meant only for this connection
        outbox: mpsc::Sender<ServerMsg>,
        response: oneshot::Sender<Result<Joined, AdmissionError>>,
    },
    Action {
        id: ConnectionId,
        action: Action,
    },
    Disconnect {
        id: ConnectionId,
    },
}

/// Broadcasts from game loop to all clients, serialized once
#[derive(Debug, Clone)]
pub enum GameBroadcast {
    Frame(Bytes),
    Text(Utf8Bytes),
}

/// Run the main game loop. Owns all game state.
pub async fn run_game_loop(
    mut cmd_rx: mpsc::Receiver<GameCommand>,
    broadcast_tx: broadcast::Sender<GameBroadcast>,
    config: ServerConfig,
    policies: PolicySet,
    gate: Arc<VisitorGate>,
) {
    let tick_duration = config.tick_duration();
    let prune_period = config.prune_interval;
    let mut scheduler = TickScheduler::new(config, policies, gate);

    let mut tick_interval = tokio::time::interval(tick_duration);
    tick_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut prune_interval = tokio::time::interval(prune_period);
    prune_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = tick_interval.tick() => {
                for payload in scheduler.tick(Instant::now()) {
                    // No receivers just means nobody is watching
                    let _ = broadcast_tx.send(payload);
                }
            }

            _ = prune_interval.tick() => {
                scheduler.prune(Instant::now());
            }

            Some(cmd) = cmd_rx.recv() => {
                match cmd {
                    GameCommand::Connect { request, outbox, response } => {
                        let result = scheduler.connect(&request, outbox, Instant::now());
                        if let Err(e) = &result {
                            tracing::info!(
                                "Rejected {:?} connection: {} ({})",
                                request.role,
                                e.reason(),
                                e.close_code()
                            );
                        }
                        // The socket went away while we were admitting it
                        if let Err(Ok(joined)) = response.send(result) {
                            scheduler.disconnect(joined.id);
                        }
                    }
                    GameCommand::Action { id, action } => {
                        scheduler.handle_action(id, action);
                    }
                    GameCommand::Disconnect { id } => {
                        scheduler.disconnect(id);
                    }
                }
            }

            else => break,
        }
    }

    tracing::info!("Game loop ended");
}
