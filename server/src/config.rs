use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use blob_shared::config::WorldConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid world config: {0}")]
    World(String),
    #[error("{0}")]
    Invalid(&'static str),
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub world: WorldConfig,
    pub tick_rate_hz: u32,
    /// Upper bound on a single tick's `dt` (seconds)
    pub max_dt: f32,
    /// Pause between an episode ending and the next reset
    pub reset_delay: Duration,
    /// Pause before a dead remote player is put back in
    pub respawn_delay: Duration,
    /// Fastest broadcast cadence, in ticks between snapshots
    pub broadcast_floor_ticks: u32,
    /// Slowest broadcast cadence, in ticks between snapshots
    pub broadcast_ceiling_ticks: u32,
    pub broadcast_initial_ticks: u32,
    /// Smoothed tick cost above which snapshots are sent less often
    pub broadcast_high_water: Duration,
    /// Smoothed tick cost below which snapshots are sent more often
    pub broadcast_low_water: Duration,
    /// Ticks that must pass between two cadence changes
    pub broadcast_adjust_cooldown_ticks: u32,
    /// Ticks between stats messages
    pub stats_interval_ticks: u32,
    pub max_players: usize,
    pub min_token_len: usize,
    /// Minimum time between two admissions with the same session token
    pub token_cooldown: Duration,
    /// How often stale token bookkeeping is dropped
    pub prune_interval: Duration,
    /// Ticks a remote entity must have been present before it can be
    /// demoted for never steering
    pub idle_grace_ticks: u32,
    /// Number of policy-driven entities in every episode
    pub policy_entities: usize,
    /// Weight files for the policies, one per policy entity (cycled)
    pub policy_weights: Vec<PathBuf>,
    pub rng_seed: u64,
    pub max_message_size: usize,
    /// Queued unicast messages per connection before new ones are dropped
    pub outbox_capacity: usize,
    /// Snapshots buffered in the fan-out channel before slow peers lag
    pub broadcast_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:9001".to_string(),
            world: WorldConfig::default(),
            tick_rate_hz: 30,
            max_dt: 0.1,
            reset_delay: Duration::from_secs(2),
            respawn_delay: Duration::from_secs(2),
            broadcast_floor_ticks: 1,
            broadcast_ceiling_ticks: 6,
            broadcast_initial_ticks: 1,
            broadcast_high_water: Duration::from_millis(12),
            broadcast_low_water: Duration::from_millis(4),
            broadcast_adjust_cooldown_ticks: 15,
            stats_interval_ticks: 30,
            max_players: 32,
            min_token_len: 16,
            token_cooldown: Duration::from_secs(3),
            prune_interval: Duration::from_secs(60),
            idle_grace_ticks: 150,
            policy_entities: 2,
            policy_weights: Vec::new(),
            rng_seed: 42,
            max_message_size: 1024,
            outbox_capacity: 32,
            broadcast_capacity: 16,
        }
    }
}

fn env_parse<T: FromStr>(key: &str, target: &mut T) {
    if let Ok(raw) = std::env::var(key) {
        match raw.parse::<T>() {
            Ok(v) => *target = v,
            Err(_) => tracing::warn!("Invalid {} '{}', using default", key, raw),
        }
    }
}

fn env_millis(key: &str, target: &mut Duration) {
    let mut ms = target.as_millis() as u64;
    env_parse(key, &mut ms);
    *target = Duration::from_millis(ms);
}

impl ServerConfig {
    /// Load config from `BLOB_*` environment variables on top of the defaults
    pub fn load_or_default() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("BLOB_LISTEN_ADDR") {
            config.listen_addr = addr;
        }
        env_parse("BLOB_TICK_RATE_HZ", &mut config.tick_rate_hz);
        env_parse("BLOB_MAX_PLAYERS", &mut config.max_players);
        env_parse("BLOB_POLICY_ENTITIES", &mut config.policy_entities);
        env_parse("BLOB_RNG_SEED", &mut config.rng_seed);
        env_parse("BLOB_MAX_FOODS", &mut config.world.max_foods);
        env_parse("BLOB_MAP_SIZE", &mut config.world.map_size);
        env_parse("BLOB_MAX_STEPS", &mut config.world.max_steps);
        env_parse(
            "BLOB_BROADCAST_ADJUST_COOLDOWN_TICKS",
            &mut config.broadcast_adjust_cooldown_ticks,
        );
        env_millis("BLOB_RESET_DELAY_MS", &mut config.reset_delay);
        env_millis("BLOB_RESPAWN_DELAY_MS", &mut config.respawn_delay);
        env_millis("BLOB_TOKEN_COOLDOWN_MS", &mut config.token_cooldown);

        if let Ok(paths) = std::env::var("BLOB_POLICY_WEIGHTS") {
            config.policy_weights = paths
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(PathBuf::from)
                .collect();
        }

        config
    }

    pub fn tick_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_rate_hz as f64)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.world.validate().map_err(ConfigError::World)?;
        if self.tick_rate_hz == 0 || self.tick_rate_hz > 240 {
            return Err(ConfigError::Invalid("tick_rate_hz must be in 1..=240"));
        }
        if !self.max_dt.is_finite() || self.max_dt <= 0.0 {
            return Err(ConfigError::Invalid("max_dt must be finite and > 0"));
        }
        if self.broadcast_floor_ticks == 0
            || self.broadcast_floor_ticks > self.broadcast_ceiling_ticks
        {
            return Err(ConfigError::Invalid(
                "broadcast floor must be >= 1 and <= ceiling",
            ));
        }
        if !(self.broadcast_floor_ticks..=self.broadcast_ceiling_ticks)
            .contains(&self.broadcast_initial_ticks)
        {
            return Err(ConfigError::Invalid(
                "broadcast_initial_ticks must lie between floor and ceiling",
            ));
        }
        if self.broadcast_low_water >= self.broadcast_high_water {
            return Err(ConfigError::Invalid("broadcast low water must be below high water"));
        }
        if self.policy_entities + self.max_players > u16::MAX as usize {
            return Err(ConfigError::Invalid("entity count must fit in a u16"));
        }
        if self.min_token_len == 0 {
            return Err(ConfigError::Invalid("min_token_len must be > 0"));
        }
        if self.outbox_capacity == 0 || self.broadcast_capacity == 0 {
            return Err(ConfigError::Invalid("channel capacities must be > 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_server_config_is_valid() {
        assert!(ServerConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_tick_rate_invalid() {
        let config = ServerConfig {
            tick_rate_hz: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn inverted_broadcast_bounds_invalid() {
        let config = ServerConfig {
            broadcast_floor_ticks: 5,
            broadcast_ceiling_ticks: 2,
            broadcast_initial_ticks: 3,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn bad_world_config_is_reported() {
        let mut config = ServerConfig::default();
        config.world.map_size = -1.0;
        assert!(matches!(config.validate(), Err(ConfigError::World(_))));
    }

    #[test]
    fn tick_duration_matches_rate() {
        let config = ServerConfig::default();
        let d = config.tick_duration();
        assert!((d.as_secs_f64() - 1.0 / 30.0).abs() < 1e-9);
    }
}
