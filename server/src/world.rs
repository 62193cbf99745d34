//! Authoritative arena state.
//!
//! Entities live in a dense `Vec` indexed by slot. Removing slot `k` shifts
//! every higher slot down by one; callers holding slots (sessions) must remap
//! them, and every operation taking a slot treats an out-of-range slot as a
//! no-op because client input can reference a slot that disappeared between
//! arrival and the next tick.

use blob_shared::config::WorldConfig;
use blob_shared::frame::{self, CodecError, EntityFlags, EntityRecord, FoodRecord};
use blob_shared::types::{Action, Skin};
use blob_shared::vec2::{dist_sq, relative_angle, wrap_angle, wrap_coord};
use bytes::BytesMut;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::policy::PolicyId;
use crate::spatial::{IndexedPoint, QuadTree};

/// Per-entity observation vector:
/// `[x, y, heading, mass, other dist, other angle, food dist, food angle]`
pub type Observation = [f32; 8];

/// Reward for staying alive through a step
pub const SURVIVAL_REWARD: f32 = 0.01;
/// Reward for picking up a collectible
pub const FOOD_REWARD: f32 = 5.0;

/// Attempts at placing a policy entity far from the others before giving up
const SPAWN_SEPARATION_ATTEMPTS: usize = 32;

/// Who decides an entity's steering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMode {
    /// Driven by a policy collaborator every tick
    Policy(PolicyId),
    /// Driven by buffered input from a remote player
    Remote,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub x: f32,
    pub y: f32,
    pub angle: f32,
    pub mass: f32,
    pub foods_collected: u32,
    pub alive: bool,
    pub control: ControlMode,
    pub skin: Option<Skin>,
    /// Episodes won as the last policy entity standing
    pub wins: u32,
    /// Issued a steering action during the current episode
    pub steered: bool,
    /// Ticks this entity has been alive in the current episode
    pub episode_ticks: u32,
}

impl Entity {
    pub fn is_remote(&self) -> bool {
        self.control == ControlMode::Remote
    }

    pub fn is_policy(&self) -> bool {
        matches!(self.control, ControlMode::Policy(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Food {
    pub x: f32,
    pub y: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorldEvent {
    FoodCollected { slot: usize, food: usize },
    Death { slot: usize },
}

/// Result of a single [`World::step`].
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub observations: Vec<Observation>,
    pub rewards: Vec<f32>,
    /// Policy population dropped to one (win) or zero (draw)
    pub terminated: bool,
    /// Step limit reached
    pub truncated: bool,
    pub winner: Option<usize>,
    pub events: Vec<WorldEvent>,
}

impl StepOutcome {
    pub fn done(&self) -> bool {
        self.terminated || self.truncated
    }
}

#[derive(Debug, thiserror::Error)]
#[error("world invariant violated: {0}")]
pub struct InvariantViolation(pub String);

pub struct World {
    config: WorldConfig,
    entities: Vec<Entity>,
    foods: Vec<Food>,
    /// Latest input per slot, compacted together with `entities`
    pending_actions: Vec<Option<Action>>,
    entity_index: QuadTree,
    food_index: QuadTree,
    indices_fresh: bool,
    observations: Vec<Observation>,
    observations_fresh: bool,
    steps: u32,
    episode_over: bool,
    rng: ChaCha8Rng,
    scratch: Vec<IndexedPoint>,
}

impl World {
    pub fn new(config: WorldConfig, seed: u64) -> Self {
        let mut world = Self {
            entity_index: QuadTree::new(config.map_size, config.map_size),
            food_index: QuadTree::new(config.map_size, config.map_size),
            config,
            entities: Vec::new(),
            foods: Vec::with_capacity(config.max_foods),
            pending_actions: Vec::new(),
            indices_fresh: false,
            observations: Vec::new(),
            observations_fresh: false,
            steps: 0,
            episode_over: false,
            rng: ChaCha8Rng::seed_from_u64(seed),
            scratch: Vec::new(),
        };
        world.seed_foods();
        world
    }

    pub fn config(&self) -> &WorldConfig {
        &self.config
    }

    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    pub fn entity(&self, slot: usize) -> Option<&Entity> {
        self.entities.get(slot)
    }

    pub fn foods(&self) -> &[Food] {
        &self.foods
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn steps(&self) -> u32 {
        self.steps
    }

    pub fn is_episode_over(&self) -> bool {
        self.episode_over
    }

    fn random_entity_pos(&mut self) -> (f32, f32) {
        let m = self.config.spawn_margin;
        let hi = self.config.map_size - m;
        (self.rng.gen_range(m..hi), self.rng.gen_range(m..hi))
    }

    fn random_food(&mut self) -> Food {
        let m = self.config.food_margin;
        let hi = self.config.map_size - m;
        Food {
            x: self.rng.gen_range(m..hi),
            y: self.rng.gen_range(m..hi),
        }
    }

    fn random_angle(&mut self) -> f32 {
        wrap_angle(self.rng.gen_range(-std::f32::consts::PI..std::f32::consts::PI))
    }

    fn seed_foods(&mut self) {
        self.foods.clear();
        for _ in 0..self.config.max_foods {
            let food = self.random_food();
            self.foods.push(food);
        }
        self.mark_dirty();
    }

    fn mark_dirty(&mut self) {
        self.indices_fresh = false;
        self.observations_fresh = false;
    }

    /// Append a new entity at a random position and return its slot.
    pub fn add_entity(&mut self, control: ControlMode, skin: Option<Skin>) -> usize {
        let (x, y) = self.random_entity_pos();
        let angle = self.random_angle();
        self.entities.push(Entity {
            x,
            y,
            angle,
            mass: self.config.initial_mass,
            foods_collected: 0,
            alive: true,
            control,
            skin,
            wins: 0,
            steered: false,
            episode_ticks: 0,
        });
        self.pending_actions.push(None);
        self.mark_dirty();
        self.entities.len() - 1
    }

    /// Remove the entity at `slot`; every higher slot moves down by one.
    pub fn remove_entity(&mut self, slot: usize) -> Option<Entity> {
        if slot >= self.entities.len() {
            return None;
        }
        let removed = self.entities.remove(slot);
        self.pending_actions.remove(slot);
        self.mark_dirty();
        Some(removed)
    }

    /// Buffer the latest input for a slot; consumed by the next tick.
    pub fn buffer_action(&mut self, slot: usize, action: Action) -> bool {
        match self.pending_actions.get_mut(slot) {
            Some(pending) => {
                *pending = Some(action);
                true
            }
            None => false,
        }
    }

    pub fn pending_action(&self, slot: usize) -> Option<Action> {
        self.pending_actions.get(slot).copied().flatten()
    }

    /// Bring a dead entity back at a fresh position, keeping its slot.
    pub fn respawn_entity(&mut self, slot: usize) -> bool {
        if self.entities.get(slot).map_or(true, |e| e.alive) {
            return false;
        }
        let (x, y) = self.random_entity_pos();
        let angle = self.random_angle();
        let mass = self.config.initial_mass;
        let e = &mut self.entities[slot];
        e.x = x;
        e.y = y;
        e.angle = angle;
        e.mass = mass;
        e.alive = true;
        self.pending_actions[slot] = None;
        self.mark_dirty();
        true
    }

    /// Start a new episode: every entity is placed again at full mass and
    /// the collectibles are re-seeded. Returns one observation per entity.
    pub fn reset(&mut self) -> Vec<Observation> {
        let min_sep_sq = (self.config.map_size / 3.0).powi(2);
        let mut placed_policy: Vec<(f32, f32)> = Vec::new();

        for slot in 0..self.entities.len() {
            let mut pos = self.random_entity_pos();
            if self.entities[slot].is_policy() {
                for _ in 0..SPAWN_SEPARATION_ATTEMPTS {
                    let far_enough = placed_policy
                        .iter()
                        .all(|&(px, py)| dist_sq(px, py, pos.0, pos.1) >= min_sep_sq);
                    if far_enough {
                        break;
                    }
                    pos = self.random_entity_pos();
                }
                placed_policy.push(pos);
            }
            let angle = self.random_angle();
            let mass = self.config.initial_mass;
            let e = &mut self.entities[slot];
            e.x = pos.0;
            e.y = pos.1;
            e.angle = angle;
            e.mass = mass;
            e.alive = true;
            e.foods_collected = 0;
            e.steered = false;
            e.episode_ticks = 0;
        }
        self.pending_actions.iter_mut().for_each(|a| *a = None);
        self.seed_foods();
        self.steps = 0;
        self.episode_over = false;
        self.observations().to_vec()
    }

    fn rebuild_indices(&mut self) {
        self.entity_index.clear();
        for (slot, e) in self.entities.iter().enumerate() {
            if e.alive {
                self.entity_index.insert(IndexedPoint {
                    id: slot,
                    x: e.x,
                    y: e.y,
                });
            }
        }
        self.food_index.clear();
        for (id, f) in self.foods.iter().enumerate() {
            self.food_index.insert(IndexedPoint { id, x: f.x, y: f.y });
        }
        self.indices_fresh = true;
    }

    fn compute_observation(&self, slot: usize) -> Observation {
        let e = &self.entities[slot];
        let diag = self.config.diagonal();

        let (other_dist, other_angle) = self
            .entity_index
            .find_nearest(e.x, e.y, Some(slot), None)
            .map(|n| {
                (
                    n.dist_sq.sqrt() / diag,
                    relative_angle(e.x, e.y, e.angle, n.point.x, n.point.y),
                )
            })
            .unwrap_or((1.0, 0.0));

        let (food_dist, food_angle) = self
            .food_index
            .find_nearest(e.x, e.y, None, None)
            .map(|n| {
                (
                    n.dist_sq.sqrt() / diag,
                    relative_angle(e.x, e.y, e.angle, n.point.x, n.point.y),
                )
            })
            .unwrap_or((1.0, 0.0));

        [
            e.x / self.config.map_size,
            e.y / self.config.map_size,
            wrap_angle(e.angle),
            e.mass / 10.0,
            other_dist,
            other_angle,
            food_dist,
            food_angle,
        ]
    }

    /// This tick's observations, computed at most once between mutations.
    pub fn observations(&mut self) -> &[Observation] {
        if !self.observations_fresh {
            if !self.indices_fresh {
                self.rebuild_indices();
            }
            let fresh: Vec<Observation> = (0..self.entities.len())
                .map(|slot| self.compute_observation(slot))
                .collect();
            self.observations = fresh;
            self.observations_fresh = true;
        }
        &self.observations
    }

    pub fn observation(&mut self, slot: usize) -> Option<Observation> {
        self.observations().get(slot).copied()
    }

    /// Advance the world by `dt` seconds. `actions[slot]` steers the entity
    /// in that slot; missing entries mean "go straight".
    pub fn step(&mut self, actions: &[Action], dt: f32) -> StepOutcome {
        self.observations_fresh = false;
        self.steps += 1;

        let turn = self.config.turn_rate * dt;
        let travel = self.config.movement_speed * dt;
        let decay = self.config.mass_decay_rate * dt;
        let size = self.config.map_size;

        // Movement pass. The index is rebuilt only after every entity moved.
        for (slot, e) in self.entities.iter_mut().enumerate() {
            if !e.alive {
                continue;
            }
            let action = actions.get(slot).copied().unwrap_or_default();
            if e.is_remote() && action.is_steering() {
                e.steered = true;
            }
            e.episode_ticks += 1;
            e.angle = wrap_angle(e.angle + action.steer_sign() * turn);
            e.x = wrap_coord(e.x + travel * e.angle.cos(), size);
            e.y = wrap_coord(e.y + travel * e.angle.sin(), size);
            e.mass -= decay;
        }
        self.rebuild_indices();

        let mut rewards: Vec<f32> = self
            .entities
            .iter()
            .map(|e| if e.alive { SURVIVAL_REWARD } else { 0.0 })
            .collect();
        let mut events = Vec::new();

        // Collection pass: first claimant wins a contested collectible.
        let pickup = self.config.pickup_radius();
        let mut claimed = vec![false; self.foods.len()];
        let mut hits = std::mem::take(&mut self.scratch);
        for slot in 0..self.entities.len() {
            if !self.entities[slot].alive {
                continue;
            }
            let (x, y) = (self.entities[slot].x, self.entities[slot].y);
            hits.clear();
            self.food_index.query_circle_into(x, y, pickup, &mut hits);
            for hit in &hits {
                if claimed[hit.id] || dist_sq(x, y, hit.x, hit.y) >= pickup * pickup {
                    continue;
                }
                claimed[hit.id] = true;
                let e = &mut self.entities[slot];
                e.mass += self.config.food_mass_gain;
                e.foods_collected += 1;
                rewards[slot] += FOOD_REWARD;
                events.push(WorldEvent::FoodCollected {
                    slot,
                    food: hit.id,
                });
                self.foods[hit.id] = self.random_food();
                self.indices_fresh = false;
            }
        }
        self.scratch = hits;

        // Death pass
        let mut policy_died = false;
        for (slot, e) in self.entities.iter_mut().enumerate() {
            if e.alive && e.mass <= self.config.min_mass {
                e.alive = false;
                policy_died |= e.is_policy();
                events.push(WorldEvent::Death { slot });
                self.indices_fresh = false;
            }
        }

        let mut terminated = false;
        let mut winner = None;
        if policy_died && !self.episode_over {
            let survivors: Vec<usize> = self
                .entities
                .iter()
                .enumerate()
                .filter(|(_, e)| e.is_policy() && e.alive)
                .map(|(slot, _)| slot)
                .collect();
            match survivors.as_slice() {
                [] => terminated = true,
                [last] => {
                    terminated = true;
                    winner = Some(*last);
                    self.entities[*last].wins += 1;
                }
                _ => {}
            }
        }
        let truncated = !terminated && !self.episode_over && self.steps >= self.config.max_steps;
        if terminated || truncated {
            self.episode_over = true;
        }

        let observations = self.observations().to_vec();
        StepOutcome {
            observations,
            rewards,
            terminated,
            truncated,
            winner,
            events,
        }
    }

    /// Remote entities that never steered while present for at least
    /// `grace_ticks` of the current episode.
    pub fn idle_remote_slots(&self, grace_ticks: u32) -> Vec<usize> {
        self.entities
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_remote() && !e.steered && e.episode_ticks >= grace_ticks)
            .map(|(slot, _)| slot)
            .collect()
    }

    /// Serialize the current state as a binary frame into `buf`.
    pub fn encode_frame(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        frame::put_header(
            buf,
            self.config.map_size,
            self.config.agent_radius,
            self.entities.len(),
        )?;
        for e in &self.entities {
            frame::put_entity(
                buf,
                &EntityRecord {
                    x: e.x,
                    y: e.y,
                    angle: e.angle,
                    mass: e.mass,
                    foods: e.foods_collected.min(u16::MAX as u32) as u16,
                    flags: EntityFlags::new(e.alive, e.is_remote(), e.skin),
                },
            );
        }
        frame::put_foods(buf, self.foods.iter().map(|f| FoodRecord { x: f.x, y: f.y }))
    }

    /// Consistency check run after every tick.
    pub fn verify(&self) -> Result<(), InvariantViolation> {
        if self.pending_actions.len() != self.entities.len() {
            return Err(InvariantViolation(format!(
                "{} action slots for {} entities",
                self.pending_actions.len(),
                self.entities.len()
            )));
        }
        if self.foods.len() != self.config.max_foods {
            return Err(InvariantViolation(format!(
                "{} collectibles, expected {}",
                self.foods.len(),
                self.config.max_foods
            )));
        }
        let size = self.config.map_size;
        for (slot, e) in self.entities.iter().enumerate() {
            if e.alive && e.mass <= self.config.min_mass {
                return Err(InvariantViolation(format!(
                    "slot {} alive with mass {}",
                    slot, e.mass
                )));
            }
            if !(0.0..size).contains(&e.x) || !(0.0..size).contains(&e.y) {
                return Err(InvariantViolation(format!(
                    "slot {} out of bounds at ({}, {})",
                    slot, e.x, e.y
                )));
            }
        }
        Ok(())
    }
}
