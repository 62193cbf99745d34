//! One authoritative tick, independent of the async runtime.
//!
//! The game loop feeds wall-clock instants and client commands in; the
//! scheduler mutates the world and hands back the payloads to fan out.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::Utf8Bytes;
use blob_shared::protocol::{
    EntityStatsWire, EventWire, EventsMsg, ServerMsg, StatsMsg, WelcomeMsg, PROTOCOL_VERSION,
};
use blob_shared::types::Action;
use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;

use crate::broadcast::BroadcastController;
use crate::config::ServerConfig;
use crate::credential::VisitorGate;
use crate::game_loop::GameBroadcast;
use crate::policy::PolicySet;
use crate::sessions::{AdmissionError, AdmissionRequest, ConnectionId, ConnectionManager};
use crate::timers::Timers;
use crate::world::{ControlMode, World, WorldEvent};

/// Reason attached to anti-idle demotions
pub const IDLE_REASON: &str = "idle";

/// Everything a freshly admitted connection needs before it joins the
/// broadcast stream.
#[derive(Debug)]
pub struct Joined {
    pub id: ConnectionId,
    pub welcome: WelcomeMsg,
    /// Full state at admission time
    pub snapshot: Option<Bytes>,
}

pub struct TickScheduler {
    config: ServerConfig,
    world: World,
    connections: ConnectionManager,
    policies: PolicySet,
    timers: Timers,
    broadcast: BroadcastController,
    episode: u32,
    ticks: u64,
    draws: u32,
    last_winner: Option<u32>,
    last_tick: Option<Instant>,
    frame_buf: BytesMut,
}

fn text(msg: &ServerMsg) -> Option<GameBroadcast> {
    match serde_json::to_string(msg) {
        Ok(json) => Some(GameBroadcast::Text(Utf8Bytes::from(json))),
        Err(e) => {
            tracing::warn!("Failed to serialize broadcast: {}", e);
            None
        }
    }
}

impl TickScheduler {
    pub fn new(config: ServerConfig, policies: PolicySet, gate: Arc<VisitorGate>) -> Self {
        let mut world = World::new(config.world, config.rng_seed);
        for id in 0..config.policy_entities {
            world.add_entity(ControlMode::Policy(id), None);
        }
        world.reset();

        Self {
            connections: ConnectionManager::new(&config, gate),
            broadcast: BroadcastController::from_config(&config),
            world,
            policies,
            timers: Timers::new(),
            episode: 1,
            ticks: 0,
            draws: 0,
            last_winner: None,
            last_tick: None,
            frame_buf: BytesMut::new(),
            config,
        }
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub fn episode(&self) -> u32 {
        self.episode
    }

    pub fn reset_pending(&self) -> bool {
        self.timers.reset_pending()
    }

    pub fn broadcast_interval(&self) -> u32 {
        self.broadcast.interval()
    }

    /// Encode the current state; the buffer is reused between calls.
    fn snapshot(&mut self) -> Option<Bytes> {
        self.frame_buf.clear();
        match self.world.encode_frame(&mut self.frame_buf) {
            Ok(()) => Some(self.frame_buf.split().freeze()),
            Err(e) => {
                tracing::error!("Failed to encode state frame: {}", e);
                None
            }
        }
    }

    fn stats(&self) -> ServerMsg {
        ServerMsg::Stats(StatsMsg {
            episode: self.episode,
            step: self.world.steps(),
            entities: self
                .world
                .entities()
                .iter()
                .enumerate()
                .map(|(slot, e)| EntityStatsWire {
                    slot: slot as u32,
                    mass: e.mass,
                    foods: e.foods_collected,
                    alive: e.alive,
                    controlled: e.is_remote(),
                    wins: e.wins,
                })
                .collect(),
            last_winner: self.last_winner,
            draws: self.draws,
        })
    }

    pub fn connect(
        &mut self,
        request: &AdmissionRequest,
        outbox: mpsc::Sender<ServerMsg>,
        now: Instant,
    ) -> Result<Joined, AdmissionError> {
        let admitted = self
            .connections
            .admit(&mut self.world, request, outbox, now)?;
        tracing::info!(
            "Connection {} admitted as {:?} (slot {:?})",
            admitted.id,
            admitted.role,
            admitted.slot
        );
        let welcome = WelcomeMsg {
            protocol_version: PROTOCOL_VERSION,
            server_version: env!("CARGO_PKG_VERSION").to_string(),
            role: admitted.role,
            slot: admitted.slot.map(|s| s as u32),
            episode: self.episode,
            config: self.config.world,
        };
        Ok(Joined {
            id: admitted.id,
            welcome,
            snapshot: self.snapshot(),
        })
    }

    pub fn handle_action(&mut self, id: ConnectionId, action: Action) {
        if !self.connections.buffer_action(&mut self.world, id, action) {
            tracing::debug!("Dropped action from connection {} without an entity", id);
        }
    }

    pub fn disconnect(&mut self, id: ConnectionId) {
        self.timers.cancel_respawn(id);
        if let Some(session) = self.connections.disconnect(&mut self.world, id) {
            tracing::info!(
                "Connection {} left (slot {:?}) after {:?}",
                id,
                session.slot,
                session.admitted_at.elapsed()
            );
        }
    }

    pub fn prune(&mut self, now: Instant) {
        let dropped = self.connections.prune_tokens(now);
        if dropped > 0 {
            tracing::debug!("Pruned {} stale session tokens", dropped);
        }
    }

    fn gather_actions(&mut self) -> Vec<Action> {
        let observations = self.world.observations().to_vec();
        self.world
            .entities()
            .iter()
            .zip(observations)
            .enumerate()
            .map(|(slot, (e, obs))| match e.control {
                ControlMode::Policy(id) if e.alive => self.policies.predict(id, &obs),
                ControlMode::Policy(_) => Action::Straight,
                ControlMode::Remote => self.world.pending_action(slot).unwrap_or_default(),
            })
            .collect()
    }

    /// Demote players that sat through the episode without steering.
    fn demote_idle(&mut self) {
        let mut idle = self.world.idle_remote_slots(self.config.idle_grace_ticks);
        // highest first so earlier removals don't shift later ones
        idle.sort_unstable_by(|a, b| b.cmp(a));
        for slot in idle {
            self.connections
                .demote_slot(&mut self.world, slot, IDLE_REASON);
        }
    }

    fn start_episode(&mut self) {
        self.demote_idle();
        self.timers.cancel_all_respawns();
        self.world.reset();
        self.episode += 1;
        tracing::info!("Episode {} started with {} entities", self.episode, self.world.len());
    }

    /// Run one tick at wall-clock `now` and return what should be fanned out.
    pub fn tick(&mut self, now: Instant) -> Vec<GameBroadcast> {
        let started = Instant::now();
        let dt = self
            .last_tick
            .map(|prev| now.saturating_duration_since(prev))
            .unwrap_or_else(|| self.config.tick_duration())
            .as_secs_f32()
            .min(self.config.max_dt);
        self.last_tick = Some(now);
        self.ticks += 1;

        let redelivered = self.connections.flush_pending();
        if redelivered > 0 {
            tracing::debug!("Redelivered {} held notices", redelivered);
        }

        let mut events = Vec::new();
        let mut force_frame = false;
        let mut episode_ended = false;

        for id in self.timers.take_due_respawns(now) {
            if let Some(slot) = self.connections.slot_of(id) {
                if self.world.respawn_entity(slot) {
                    events.push(EventWire::Respawn { slot: slot as u32 });
                }
            }
        }

        if self.timers.take_reset(now) {
            self.start_episode();
            force_frame = true;
        }

        if !self.timers.reset_pending() {
            let actions = self.gather_actions();
            let outcome = self.world.step(&actions, dt);

            for event in &outcome.events {
                match *event {
                    WorldEvent::FoodCollected { slot, .. } => {
                        events.push(EventWire::FoodCollected { slot: slot as u32 });
                    }
                    WorldEvent::Death { slot } => {
                        events.push(EventWire::Death { slot: slot as u32 });
                        if let Some(id) = self.connections.session_for_slot(slot) {
                            self.timers
                                .schedule_respawn(id, now + self.config.respawn_delay);
                        }
                    }
                }
            }

            if outcome.done() {
                let winner = outcome.winner.map(|s| s as u32);
                match winner {
                    Some(slot) => tracing::info!("Episode {} won by slot {}", self.episode, slot),
                    None if outcome.truncated => {
                        tracing::info!("Episode {} truncated at step {}", self.episode, self.world.steps())
                    }
                    None => tracing::info!("Episode {} ended in a draw", self.episode),
                }
                if winner.is_none() && outcome.terminated {
                    self.draws += 1;
                }
                self.last_winner = winner;
                events.push(EventWire::EpisodeEnd {
                    winner,
                    truncated: outcome.truncated,
                });
                self.timers.schedule_reset(now + self.config.reset_delay);
                force_frame = true;
                episode_ended = true;
            }

            if let Err(e) = self.world.verify() {
                tracing::error!("{}", e);
                std::process::abort();
            }
        }

        let mut out = Vec::new();
        let send_frame = if force_frame {
            self.broadcast.mark_forced();
            true
        } else {
            self.broadcast.should_broadcast()
        };
        if send_frame {
            if let Some(frame) = self.snapshot() {
                out.push(GameBroadcast::Frame(frame));
            }
        }
        if !events.is_empty() {
            let msg = ServerMsg::Events(EventsMsg {
                episode: self.episode,
                step: self.world.steps(),
                events,
            });
            out.extend(text(&msg));
        }
        let stats_every = self.config.stats_interval_ticks.max(1) as u64;
        if episode_ended || self.ticks % stats_every == 0 {
            out.extend(text(&self.stats()));
        }

        if let Some(interval) = self.broadcast.record_tick(started.elapsed()) {
            tracing::info!(
                "Broadcast interval now {} ticks (smoothed tick cost {:?})",
                interval,
                self.broadcast.smoothed()
            );
        }
        out
    }
}
