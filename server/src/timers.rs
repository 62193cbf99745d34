//! Deadlines owned by the game loop: the pending episode reset and per-player
//! respawns. Everything is polled from the tick, so cancelling is just
//! forgetting the deadline.

use std::collections::HashMap;
use std::time::Instant;

use crate::sessions::ConnectionId;

#[derive(Debug, Default)]
pub struct Timers {
    reset_at: Option<Instant>,
    /// Keyed by connection rather than slot so renumbering can't misdirect them
    respawns: HashMap<ConnectionId, Instant>,
}

impl Timers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the reset unless one is already pending.
    pub fn schedule_reset(&mut self, at: Instant) {
        self.reset_at.get_or_insert(at);
    }

    pub fn reset_pending(&self) -> bool {
        self.reset_at.is_some()
    }

    /// True once when the pending reset's deadline has passed.
    pub fn take_reset(&mut self, now: Instant) -> bool {
        match self.reset_at {
            Some(at) if at <= now => {
                self.reset_at = None;
                true
            }
            _ => false,
        }
    }

    pub fn schedule_respawn(&mut self, id: ConnectionId, at: Instant) {
        self.respawns.insert(id, at);
    }

    pub fn cancel_respawn(&mut self, id: ConnectionId) -> bool {
        self.respawns.remove(&id).is_some()
    }

    pub fn cancel_all_respawns(&mut self) {
        self.respawns.clear();
    }

    /// Remove and return every respawn whose deadline has passed, oldest
    /// connection first.
    pub fn take_due_respawns(&mut self, now: Instant) -> Vec<ConnectionId> {
        let mut due: Vec<ConnectionId> = self
            .respawns
            .iter()
            .filter(|(_, &at)| at <= now)
            .map(|(&id, _)| id)
            .collect();
        due.sort_unstable();
        for id in &due {
            self.respawns.remove(id);
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn reset_fires_once_after_deadline() {
        let t0 = Instant::now();
        let mut timers = Timers::new();
        timers.schedule_reset(t0 + Duration::from_secs(2));
        assert!(timers.reset_pending());
        assert!(!timers.take_reset(t0 + Duration::from_secs(1)));
        assert!(timers.take_reset(t0 + Duration::from_secs(2)));
        assert!(!timers.take_reset(t0 + Duration::from_secs(3)));
        assert!(!timers.reset_pending());
    }

    #[test]
    fn rescheduling_keeps_the_first_deadline() {
        let t0 = Instant::now();
        let mut timers = Timers::new();
        timers.schedule_reset(t0 + Duration::from_secs(1));
        timers.schedule_reset(t0 + Duration::from_secs(5));
        assert!(timers.take_reset(t0 + Duration::from_secs(1)));
    }

    #[test]
    fn respawns_fire_in_connection_order() {
        let t0 = Instant::now();
        let mut timers = Timers::new();
        timers.schedule_respawn(9, t0 + Duration::from_secs(1));
        timers.schedule_respawn(3, t0 + Duration::from_secs(1));
        timers.schedule_respawn(5, t0 + Duration::from_secs(4));
        assert!(timers.take_due_respawns(t0).is_empty());
        assert_eq!(timers.take_due_respawns(t0 + Duration::from_secs(2)), vec![3, 9]);
        assert!(timers.cancel_respawn(5));
        assert!(!timers.cancel_respawn(5));
        assert!(timers.take_due_respawns(t0 + Duration::from_secs(10)).is_empty());
    }

    #[test]
    fn clearing_respawns() {
        let t0 = Instant::now();
        let mut timers = Timers::new();
        timers.schedule_respawn(1, t0);
        timers.schedule_respawn(2, t0);
        timers.cancel_all_respawns();
        assert!(timers.take_due_respawns(t0).is_empty());
    }
}
