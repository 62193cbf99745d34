//! Text (JSON) side of the protocol.
//!
//! Every message carries a `type` field. Receivers ignore fields they do not
//! know, so new keys can be added without bumping [`PROTOCOL_VERSION`].
//! Snapshots do not travel here; see [`crate::frame`].

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::config::WorldConfig;
use crate::types::{Action, Role};

/// Protocol version - increment when making breaking changes.
pub const PROTOCOL_VERSION: u32 = 1;

// === Server -> Client ===

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export, export_to = "../../web/src/generated/")]
#[serde(tag = "type")]
pub enum ServerMsg {
    #[serde(rename = "welcome")]
    Welcome(WelcomeMsg),
    #[serde(rename = "slot_changed")]
    SlotChanged(SlotChangedMsg),
    #[serde(rename = "demoted")]
    Demoted(DemotedMsg),
    #[serde(rename = "events")]
    Events(EventsMsg),
    #[serde(rename = "stats")]
    Stats(StatsMsg),
    #[serde(rename = "pong")]
    Pong(PongMsg),
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export, export_to = "../../web/src/generated/")]
#[serde(rename_all = "camelCase")]
pub struct WelcomeMsg {
    pub protocol_version: u32,
    pub server_version: String,
    pub role: Role,
    /// Entity slot controlled by this connection, absent for spectators
    pub slot: Option<u32>,
    pub episode: u32,
    pub config: WorldConfig,
}

/// The server compacted its entity table and this client's slot moved.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export, export_to = "../../web/src/generated/")]
pub struct SlotChangedMsg {
    pub slot: u32,
}

/// The player was turned into a spectator and no longer controls an entity.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export, export_to = "../../web/src/generated/")]
pub struct DemotedMsg {
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export, export_to = "../../web/src/generated/")]
pub struct EventsMsg {
    pub episode: u32,
    pub step: u32,
    pub events: Vec<EventWire>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "../../web/src/generated/")]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventWire {
    FoodCollected { slot: u32 },
    Death { slot: u32 },
    Respawn { slot: u32 },
    /// `winner` is null for a draw or a truncated episode
    EpisodeEnd { winner: Option<u32>, truncated: bool },
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export, export_to = "../../web/src/generated/")]
#[serde(rename_all = "camelCase")]
pub struct StatsMsg {
    pub episode: u32,
    pub step: u32,
    pub entities: Vec<EntityStatsWire>,
    /// Winner of the most recently finished episode, null for a draw
    pub last_winner: Option<u32>,
    pub draws: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export, export_to = "../../web/src/generated/")]
#[serde(rename_all = "camelCase")]
pub struct EntityStatsWire {
    pub slot: u32,
    pub mass: f32,
    pub foods: u32,
    pub alive: bool,
    pub controlled: bool,
    pub wins: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export, export_to = "../../web/src/generated/")]
#[serde(rename_all = "camelCase")]
pub struct PongMsg {
    /// Echo of the client's timestamp
    pub t: f64,
    /// Server wall clock in milliseconds since the unix epoch
    #[ts(type = "number")]
    pub server_time: u64,
}

// === Client -> Server ===

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export, export_to = "../../web/src/generated/")]
#[serde(tag = "type")]
pub enum ClientMsg {
    #[serde(rename = "action")]
    Action {
        #[ts(type = "0 | 1 | 2")]
        action: Action,
    },
    #[serde(rename = "ping")]
    Ping {
        #[serde(default)]
        t: f64,
    },
}
