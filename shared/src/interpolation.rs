//! Client-side smoothing between state frames.
//!
//! Keeps the two most recent frames and blends between them based on when
//! they arrived, so a client can render at any rate while the server
//! broadcasts on a subset of its ticks.

use crate::frame::{EntityRecord, StateFrame};
use crate::vec2::{lerp_angle, lerp_wrapped};

#[derive(Debug, Clone)]
struct TimedFrame {
    received_at: f64,
    frame: StateFrame,
}

#[derive(Debug, Default)]
pub struct SnapshotInterpolator {
    previous: Option<TimedFrame>,
    latest: Option<TimedFrame>,
}

impl SnapshotInterpolator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a freshly decoded frame received at `now` (seconds).
    pub fn push(&mut self, frame: StateFrame, now: f64) {
        self.previous = self.latest.take();
        self.latest = Some(TimedFrame {
            received_at: now,
            frame,
        });
    }

    pub fn latest(&self) -> Option<&StateFrame> {
        self.latest.as_ref().map(|f| &f.frame)
    }

    /// Blend factor between the two buffered frames at `now`, in `[0, 1]`.
    ///
    /// The gap between the two arrivals is used as the expected interval:
    /// the view reaches the latest frame one interval after it arrived.
    pub fn alpha(&self, now: f64) -> f64 {
        match (&self.previous, &self.latest) {
            (Some(prev), Some(latest)) => {
                let interval = latest.received_at - prev.received_at;
                if interval <= 0.0 {
                    return 1.0;
                }
                ((now - latest.received_at) / interval).clamp(0.0, 1.0)
            }
            _ => 1.0,
        }
    }

    /// Entity views at `now`. Falls back to the latest frame when there is
    /// nothing to blend with or the entity table changed size.
    pub fn sample(&self, now: f64) -> Vec<EntityRecord> {
        let Some(latest) = &self.latest else {
            return Vec::new();
        };
        let Some(prev) = &self.previous else {
            return latest.frame.entities.clone();
        };
        if prev.frame.entities.len() != latest.frame.entities.len() {
            return latest.frame.entities.clone();
        }

        let t = self.alpha(now) as f32;
        let size = latest.frame.map_size;
        prev.frame
            .entities
            .iter()
            .zip(&latest.frame.entities)
            .map(|(a, b)| {
                // Respawns teleport; don't smear them across the map
                if a.flags.alive != b.flags.alive {
                    return *b;
                }
                EntityRecord {
                    x: lerp_wrapped(a.x, b.x, t, size),
                    y: lerp_wrapped(a.y, b.y, t, size),
                    angle: lerp_angle(a.angle, b.angle, t),
                    mass: a.mass + (b.mass - a.mass) * t,
                    ..*b
                }
            })
            .collect()
    }
}
