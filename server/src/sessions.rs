//! Connection admission and session bookkeeping.
//!
//! Owned by the game loop, like the world. A player session remembers the
//! slot of the entity it drives; whenever the world compacts its entity
//! table the manager rewrites those slots and tells the affected clients.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use blob_shared::protocol::{DemotedMsg, ServerMsg, SlotChangedMsg};
use blob_shared::types::{Action, Role, Skin};
use tokio::sync::mpsc;

use crate::config::ServerConfig;
use crate::credential::VisitorGate;
use crate::world::{ControlMode, World};

pub type ConnectionId = u64;

/// What a client asked for in its connection query.
#[derive(Debug, Clone, Default)]
pub struct AdmissionRequest {
    pub role: Role,
    pub skin: Option<String>,
    pub token: Option<String>,
    pub visitor: Option<String>,
}

/// Why a connection was turned away. Checked in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    #[error("visitor credential missing or invalid")]
    Credential,
    #[error("session token missing or too short")]
    Token,
    #[error("session token already has a live connection")]
    DuplicateSession,
    #[error("session token reused too quickly")]
    Cooldown,
    #[error("no free player slots")]
    Full,
    #[error("no skin selected")]
    Skin,
}

impl AdmissionError {
    /// WebSocket close code sent with the rejection
    pub fn close_code(&self) -> u16 {
        match self {
            AdmissionError::Credential => 4001,
            AdmissionError::Token => 4002,
            AdmissionError::DuplicateSession => 4003,
            AdmissionError::Cooldown => 4004,
            AdmissionError::Full => 4005,
            AdmissionError::Skin => 4006,
        }
    }

    /// Stable machine-readable reason
    pub fn reason(&self) -> &'static str {
        match self {
            AdmissionError::Credential => "invalid_credential",
            AdmissionError::Token => "invalid_token",
            AdmissionError::DuplicateSession => "duplicate_session",
            AdmissionError::Cooldown => "token_cooldown",
            AdmissionError::Full => "server_full",
            AdmissionError::Skin => "invalid_skin",
        }
    }
}

/// Successful admission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admitted {
    pub id: ConnectionId,
    pub role: Role,
    pub slot: Option<usize>,
}

#[derive(Debug)]
pub struct Session {
    pub id: ConnectionId,
    pub role: Role,
    /// Entity slot, `Some` only while the session drives an entity
    pub slot: Option<usize>,
    pub token: Option<String>,
    pub admitted_at: Instant,
    outbox: mpsc::Sender<ServerMsg>,
    /// Latest notice that found the outbox full, retried every tick
    pending: Option<ServerMsg>,
}

/// Session tokens that are bound to a live player, plus when each token was
/// last admitted. Pruned periodically so it only remembers recent tokens.
#[derive(Debug)]
pub struct TokenLedger {
    active: HashSet<String>,
    last_admitted: HashMap<String, Instant>,
    cooldown: Duration,
}

impl TokenLedger {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            active: HashSet::new(),
            last_admitted: HashMap::new(),
            cooldown,
        }
    }

    pub fn is_active(&self, token: &str) -> bool {
        self.active.contains(token)
    }

    pub fn is_cooling_down(&self, token: &str, now: Instant) -> bool {
        self.last_admitted
            .get(token)
            .is_some_and(|&at| now.saturating_duration_since(at) < self.cooldown)
    }

    pub fn claim(&mut self, token: &str, now: Instant) {
        self.active.insert(token.to_string());
        self.last_admitted.insert(token.to_string(), now);
    }

    pub fn release(&mut self, token: &str) -> bool {
        self.active.remove(token)
    }

    /// Forget admission times old enough to no longer matter. Returns how
    /// many were dropped.
    pub fn prune(&mut self, now: Instant) -> usize {
        let before = self.last_admitted.len();
        let cooldown = self.cooldown;
        let active = &self.active;
        self.last_admitted.retain(|token, &mut at| {
            active.contains(token) || now.saturating_duration_since(at) < cooldown
        });
        before - self.last_admitted.len()
    }

    pub fn tracked(&self) -> usize {
        self.last_admitted.len()
    }
}

pub struct ConnectionManager {
    sessions: HashMap<ConnectionId, Session>,
    tokens: TokenLedger,
    gate: Arc<VisitorGate>,
    next_id: ConnectionId,
    max_players: usize,
    min_token_len: usize,
}

impl ConnectionManager {
    pub fn new(config: &ServerConfig, gate: Arc<VisitorGate>) -> Self {
        Self {
            sessions: HashMap::new(),
            tokens: TokenLedger::new(config.token_cooldown),
            gate,
            next_id: 1,
            max_players: config.max_players,
            min_token_len: config.min_token_len,
        }
    }

    /// Sessions currently driving an entity
    pub fn player_count(&self) -> usize {
        self.sessions.values().filter(|s| s.slot.is_some()).count()
    }

    pub fn slot_of(&self, id: ConnectionId) -> Option<usize> {
        self.sessions.get(&id).and_then(|s| s.slot)
    }

    pub fn session_for_slot(&self, slot: usize) -> Option<ConnectionId> {
        self.sessions
            .values()
            .find(|s| s.slot == Some(slot))
            .map(|s| s.id)
    }

    fn check(&self, request: &AdmissionRequest, now: Instant) -> Result<Option<Skin>, AdmissionError> {
        let visitor = request.visitor.as_deref().ok_or(AdmissionError::Credential)?;
        self.gate
            .verify(visitor)
            .map_err(|_| AdmissionError::Credential)?;

        if request.role == Role::Spectator {
            return Ok(None);
        }

        let token = request
            .token
            .as_deref()
            .filter(|t| t.chars().count() >= self.min_token_len)
            .ok_or(AdmissionError::Token)?;
        if self.tokens.is_active(token) {
            return Err(AdmissionError::DuplicateSession);
        }
        if self.tokens.is_cooling_down(token, now) {
            return Err(AdmissionError::Cooldown);
        }
        if self.player_count() >= self.max_players {
            return Err(AdmissionError::Full);
        }
        request
            .skin
            .as_deref()
            .and_then(Skin::from_name)
            .map(Some)
            .ok_or(AdmissionError::Skin)
    }

    /// Run the admission checks and, for players, attach a new entity.
    pub fn admit(
        &mut self,
        world: &mut World,
        request: &AdmissionRequest,
        outbox: mpsc::Sender<ServerMsg>,
        now: Instant,
    ) -> Result<Admitted, AdmissionError> {
        let skin = self.check(request, now)?;

        let id = self.next_id;
        self.next_id += 1;

        let (slot, token) = match request.role {
            Role::Player => {
                let token = request.token.clone().unwrap_or_default();
                self.tokens.claim(&token, now);
                (Some(world.add_entity(ControlMode::Remote, skin)), Some(token))
            }
            Role::Spectator => (None, None),
        };

        self.sessions.insert(
            id,
            Session {
                id,
                role: request.role,
                slot,
                token,
                admitted_at: now,
                outbox,
                pending: None,
            },
        );
        Ok(Admitted {
            id,
            role: request.role,
            slot,
        })
    }

    /// Forward a steering action. Spectators and stale slots are ignored.
    pub fn buffer_action(&self, world: &mut World, id: ConnectionId, action: Action) -> bool {
        match self.slot_of(id) {
            Some(slot) => world.buffer_action(slot, action),
            None => false,
        }
    }

    /// Drop a session, detaching its entity and releasing its token.
    pub fn disconnect(&mut self, world: &mut World, id: ConnectionId) -> Option<Session> {
        let session = self.sessions.remove(&id)?;
        if let Some(token) = &session.token {
            self.tokens.release(token);
        }
        if let Some(slot) = session.slot {
            world.remove_entity(slot);
            self.on_slot_removed(slot);
        }
        Some(session)
    }

    /// Turn the player driving `slot` into a spectator and remove its entity.
    pub fn demote_slot(&mut self, world: &mut World, slot: usize, reason: &str) -> Option<ConnectionId> {
        let id = self.session_for_slot(slot)?;
        let session = self.sessions.get_mut(&id)?;
        session.slot = None;
        session.role = Role::Spectator;
        if let Some(token) = session.token.take() {
            self.tokens.release(&token);
        }
        self.notify(
            id,
            ServerMsg::Demoted(DemotedMsg {
                reason: reason.to_string(),
            }),
        );
        world.remove_entity(slot);
        self.on_slot_removed(slot);
        tracing::info!("Connection {} demoted ({})", id, reason);
        Some(id)
    }

    /// Shift every slot above `removed` down by one and notify the owners.
    fn on_slot_removed(&mut self, removed: usize) {
        let mut moved = Vec::new();
        for session in self.sessions.values_mut() {
            if let Some(slot) = session.slot.as_mut() {
                if *slot > removed {
                    *slot -= 1;
                    moved.push((session.id, *slot));
                }
            }
        }
        for (id, slot) in moved {
            tracing::debug!("Connection {} renumbered to slot {}", id, slot);
            self.notify(id, ServerMsg::SlotChanged(SlotChangedMsg { slot: slot as u32 }));
        }
    }

    /// Queue a notice for one connection without blocking. Returns true if
    /// it went straight into the outbox. A notice that finds the outbox full
    /// is parked on the session and replaces any older parked one, since each
    /// notice carries the session's whole control state.
    pub fn notify(&mut self, id: ConnectionId, msg: ServerMsg) -> bool {
        let Some(session) = self.sessions.get_mut(&id) else {
            return false;
        };
        if session.pending.is_some() {
            session.pending = Some(msg);
            return false;
        }
        match session.outbox.try_send(msg) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(msg)) => {
                tracing::warn!("Connection {} outbox full, holding notice", id);
                session.pending = Some(msg);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Retry parked notices. Returns how many were delivered.
    pub fn flush_pending(&mut self) -> usize {
        let mut delivered = 0;
        for session in self.sessions.values_mut() {
            let Some(msg) = session.pending.take() else {
                continue;
            };
            match session.outbox.try_send(msg) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(msg)) => session.pending = Some(msg),
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        delivered
    }

    pub fn prune_tokens(&mut self, now: Instant) -> usize {
        self.tokens.prune(now)
    }
}
