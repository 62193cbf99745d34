//! Load-adaptive snapshot cadence.
//!
//! Tracks an exponential moving average of how long a tick takes and stretches
//! or shrinks the number of ticks between snapshots so fan-out cost stays
//! inside the tick budget.

use std::time::Duration;

use crate::config::ServerConfig;

/// Weight of the newest sample in the moving average
const SMOOTHING: f64 = 0.1;

#[derive(Debug, Clone)]
pub struct BroadcastController {
    /// Smoothed tick cost in seconds
    smoothed: f64,
    interval: u32,
    floor: u32,
    ceiling: u32,
    low_water: f64,
    high_water: f64,
    /// Ticks that must pass between two interval changes
    adjust_cooldown: u32,
    ticks_since_broadcast: u32,
    ticks_since_adjust: u32,
}

impl BroadcastController {
    pub fn new(
        floor: u32,
        ceiling: u32,
        initial: u32,
        low_water: Duration,
        high_water: Duration,
        adjust_cooldown: u32,
    ) -> Self {
        let floor = floor.max(1);
        let ceiling = ceiling.max(floor);
        Self {
            smoothed: 0.0,
            interval: initial.clamp(floor, ceiling),
            floor,
            ceiling,
            low_water: low_water.as_secs_f64(),
            high_water: high_water.as_secs_f64(),
            adjust_cooldown,
            ticks_since_broadcast: 0,
            ticks_since_adjust: 0,
        }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(
            config.broadcast_floor_ticks,
            config.broadcast_ceiling_ticks,
            config.broadcast_initial_ticks,
            config.broadcast_low_water,
            config.broadcast_high_water,
            config.broadcast_adjust_cooldown_ticks,
        )
    }

    /// Ticks between snapshots
    pub fn interval(&self) -> u32 {
        self.interval
    }

    pub fn smoothed(&self) -> Duration {
        Duration::from_secs_f64(self.smoothed)
    }

    /// Feed the cost of the tick that just ran. Returns the new interval if
    /// it changed.
    pub fn record_tick(&mut self, cost: Duration) -> Option<u32> {
        self.smoothed = (1.0 - SMOOTHING) * self.smoothed + SMOOTHING * cost.as_secs_f64();
        self.ticks_since_adjust = self.ticks_since_adjust.saturating_add(1);
        if self.ticks_since_adjust < self.adjust_cooldown {
            return None;
        }

        let next = if self.smoothed > self.high_water {
            (self.interval + 1).min(self.ceiling)
        } else if self.smoothed < self.low_water {
            self.interval.saturating_sub(1).max(self.floor)
        } else {
            self.interval
        };
        if next == self.interval {
            return None;
        }
        self.interval = next;
        self.ticks_since_adjust = 0;
        Some(next)
    }

    /// Called once per tick; true when this tick's state should go out.
    pub fn should_broadcast(&mut self) -> bool {
        self.ticks_since_broadcast += 1;
        if self.ticks_since_broadcast >= self.interval {
            self.ticks_since_broadcast = 0;
            true
        } else {
            false
        }
    }

    /// Note a broadcast sent outside the cadence (terminal frames).
    pub fn mark_forced(&mut self) {
        self.ticks_since_broadcast = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> BroadcastController {
        BroadcastController::new(
            1,
            4,
            1,
            Duration::from_millis(4),
            Duration::from_millis(12),
            15,
        )
    }

    fn feed(c: &mut BroadcastController, cost: Duration, ticks: u32) -> Vec<u32> {
        (0..ticks).filter_map(|_| c.record_tick(cost)).collect()
    }

    #[test]
    fn ema_converges_to_constant_cost() {
        let mut c = controller();
        feed(&mut c, Duration::from_millis(8), 200);
        assert!((c.smoothed().as_secs_f64() - 0.008).abs() < 1e-6);
    }

    #[test]
    fn single_sample_moves_average_by_a_tenth() {
        let mut c = controller();
        c.record_tick(Duration::from_millis(10));
        assert!((c.smoothed().as_secs_f64() - 0.001).abs() < 1e-9);
    }

    #[test]
    fn heavy_ticks_back_off_to_ceiling() {
        let mut c = controller();
        let changes = feed(&mut c, Duration::from_millis(30), 500);
        assert_eq!(changes, vec![2, 3, 4]);
        assert_eq!(c.interval(), 4);
    }

    #[test]
    fn light_ticks_recover_to_floor() {
        let mut c = controller();
        feed(&mut c, Duration::from_millis(30), 500);
        let changes = feed(&mut c, Duration::from_micros(100), 1000);
        assert_eq!(changes, vec![3, 2, 1]);
        assert_eq!(c.interval(), 1);
    }

    #[test]
    fn steady_cost_between_marks_holds() {
        let mut c = BroadcastController::new(
            1,
            6,
            3,
            Duration::from_millis(4),
            Duration::from_millis(12),
            15,
        );
        let changes = feed(&mut c, Duration::from_millis(8), 60);
        // average climbs from zero through the low band first
        assert!(changes.iter().all(|&i| i < 3));
        let settled = c.interval();
        assert!(feed(&mut c, Duration::from_millis(8), 500).is_empty());
        assert_eq!(c.interval(), settled);
    }

    #[test]
    fn cadence_follows_interval() {
        let mut c = BroadcastController::new(
            1,
            6,
            3,
            Duration::from_millis(4),
            Duration::from_millis(12),
            15,
        );
        let sent: Vec<bool> = (0..6).map(|_| c.should_broadcast()).collect();
        assert_eq!(sent, vec![false, false, true, false, false, true]);
    }

    #[test]
    fn forced_broadcast_restarts_cadence() {
        let mut c = BroadcastController::new(
            1,
            6,
            3,
            Duration::from_millis(4),
            Duration::from_millis(12),
            15,
        );
        assert!(!c.should_broadcast());
        c.mark_forced();
        assert!(!c.should_broadcast());
        assert!(!c.should_broadcast());
        assert!(c.should_broadcast());
    }

    #[test]
    fn cooldown_spaces_out_adjustments() {
        let mut c = BroadcastController::new(
            1,
            4,
            1,
            Duration::from_millis(4),
            Duration::from_millis(12),
            40,
        );
        let mut changed_at = Vec::new();
        for tick in 1..=200u32 {
            if c.record_tick(Duration::from_millis(30)).is_some() {
                changed_at.push(tick);
            }
        }
        assert_eq!(changed_at.len(), 3);
        assert!(changed_at.windows(2).all(|w| w[1] - w[0] >= 40));
    }

    #[test]
    fn initial_interval_is_clamped() {
        let c = BroadcastController::new(
            2,
            4,
            9,
            Duration::from_millis(4),
            Duration::from_millis(12),
            15,
        );
        assert_eq!(c.interval(), 4);
    }
}
