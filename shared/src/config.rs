/// Arena tuning shared by server and clients.
///
/// Rates are per second; the server multiplies them by the tick's `dt`.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize, ts_rs::TS)]
#[ts(export, export_to = "../../web/src/generated/")]
#[serde(rename_all = "camelCase")]
pub struct WorldConfig {
    /// Side length of the square, toroidal arena
    pub map_size: f32,
    pub initial_mass: f32,
    /// Mass lost per second while alive
    pub mass_decay_rate: f32,
    /// Forward speed (units per second)
    pub movement_speed: f32,
    /// Steering rate (radians per second)
    pub turn_rate: f32,
    pub food_mass_gain: f32,
    /// An entity at or below this mass dies
    pub min_mass: f32,
    /// Number of collectibles kept on the map at all times
    pub max_foods: usize,
    pub agent_radius: f32,
    pub food_radius: f32,
    /// Steps before an episode is truncated
    pub max_steps: u32,
    /// Minimum distance from the edge when spawning entities
    pub spawn_margin: f32,
    /// Minimum distance from the edge when spawning collectibles
    pub food_margin: f32,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            map_size: 100.0,
            initial_mass: 5.0,
            mass_decay_rate: 1.5, // 0.05 per step at 30 Hz
            movement_speed: 36.0, // 1.2 per step at 30 Hz
            turn_rate: 3.6,       // 0.12 rad per step at 30 Hz
            food_mass_gain: 1.5,
            min_mass: 0.5,
            max_foods: 10,
            agent_radius: 2.5,
            food_radius: 1.0,
            max_steps: 2000,
            spawn_margin: 10.0,
            food_margin: 5.0,
        }
    }
}

impl WorldConfig {
    /// Diagonal of the map, used to normalize observation distances.
    pub fn diagonal(&self) -> f32 {
        std::f32::consts::SQRT_2 * self.map_size
    }

    /// Distance at which an entity picks up a collectible.
    pub fn pickup_radius(&self) -> f32 {
        self.agent_radius + self.food_radius
    }

    pub fn validate(&self) -> Result<(), String> {
        if !self.map_size.is_finite() || self.map_size <= 0.0 {
            return Err("map_size must be finite and > 0".to_string());
        }
        if !self.initial_mass.is_finite() || self.initial_mass <= self.min_mass {
            return Err("initial_mass must be finite and > min_mass".to_string());
        }
        if !self.mass_decay_rate.is_finite() || self.mass_decay_rate < 0.0 {
            return Err("mass_decay_rate must be finite and >= 0".to_string());
        }
        if !self.movement_speed.is_finite() || !self.turn_rate.is_finite() {
            return Err("movement_speed and turn_rate must be finite".to_string());
        }
        if self.max_foods > u16::MAX as usize {
            return Err("max_foods must fit in the frame's u16 count".to_string());
        }
        if self.spawn_margin * 2.0 >= self.map_size || self.food_margin * 2.0 >= self.map_size {
            return Err("spawn margins must leave room inside the map".to_string());
        }
        if self.spawn_margin < 0.0 || self.food_margin < 0.0 {
            return Err("spawn margins must be >= 0".to_string());
        }
        Ok(())
    }
}
