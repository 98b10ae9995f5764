//! Synthetic flight model driving the Active targets.
//!
//! Every target flies a straight heading derived from its id, with a speed
//! that swells and fades along a sine of its sample count, plus a little
//! uniform jitter each tick. Heading components flip sign when the next fix
//! would leave the patrol box, so targets bounce around the base.

use nalgebra::Vector2;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tmap_core::{MotionModel, Position, TargetRecord};

/// Flight model parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlightConfig {
    /// Launch point of new targets
    pub base_lat: f64,
    pub base_lon: f64,

    /// Patrol box; crossing an edge reverses that heading component
    pub lat_min: f64,
    pub lat_max: f64,
    pub lon_min: f64,
    pub lon_max: f64,

    /// Per-axis speed unit in degrees per tick
    pub speed_unit: f64,

    /// Full width of the uniform jitter in degrees
    pub noise: f64,
}

impl Default for FlightConfig {
    fn default() -> Self {
        Self {
            base_lat: 37.5,
            base_lon: 127.0,
            lat_min: 37.45,
            lat_max: 37.55,
            lon_min: 126.93,
            lon_max: 127.07,
            speed_unit: 0.00008,
            noise: 0.00025,
        }
    }
}

impl FlightConfig {
    pub fn base(&self) -> Position {
        Position::new(self.base_lat, self.base_lon)
    }
}

/// Deterministic motion model over a seeded RNG.
pub struct FlightModel {
    config: FlightConfig,
    rng: ChaCha8Rng,
    /// Heading sign per target id, (lat, lon), each ±1
    headings: HashMap<i32, Vector2<f64>>,
}

impl FlightModel {
    pub fn new(config: FlightConfig, rng: ChaCha8Rng) -> Self {
        Self {
            config,
            rng,
            headings: HashMap::new(),
        }
    }

    pub fn config(&self) -> &FlightConfig {
        &self.config
    }

    /// Base velocity of a target, degrees per tick as (lat, lon).
    pub fn base_velocity(&self, id: i32) -> Vector2<f64> {
        let unit = self.config.speed_unit;
        let v = Vector2::new(
            f64::from(id.rem_euclid(5) - 2) * unit,
            f64::from(id.rem_euclid(7) - 3) * unit,
        );
        if v == Vector2::zeros() {
            // Ids with no natural heading drift diagonally
            Vector2::new(0.75 * unit, 0.75 * unit)
        } else {
            v
        }
    }

    /// Speed multiplier after `samples` fixes, in [1.0, 10.0].
    pub fn speed_modifier(samples: usize) -> f64 {
        5.5 + 4.5 * (samples as f64 * 0.275).sin()
    }

    /// Current heading signs of a target.
    pub fn heading(&self, id: i32) -> Vector2<f64> {
        self.headings
            .get(&id)
            .copied()
            .unwrap_or_else(|| Vector2::new(1.0, 1.0))
    }

    fn jitter(&mut self) -> f64 {
        self.rng.gen_range(-0.5..0.5) * self.config.noise
    }
}

impl MotionModel for FlightModel {
    fn next_fix(&mut self, record: &TargetRecord, _tick: u64) -> Option<Position> {
        let current = record.position()?;
        let id = record.id();
        let heading = self.heading(id);

        let drift = self
            .base_velocity(id)
            .component_mul(&heading)
            * Self::speed_modifier(record.sample_count());
        let jitter = Vector2::new(self.jitter(), self.jitter());
        let next = Vector2::new(current.lat, current.lon) + drift + jitter;

        // The step is taken even across an edge. The heading reverses only
        // while drifting outward, so an overshoot always heads back in.
        let mut new_heading = heading;
        let (c, x, y) = (&self.config, next.x, next.y);
        if (x > c.lat_max && drift.x > 0.0) || (x < c.lat_min && drift.x < 0.0) {
            new_heading.x = -new_heading.x;
        }
        if (y > c.lon_max && drift.y > 0.0) || (y < c.lon_min && drift.y < 0.0) {
            new_heading.y = -new_heading.y;
        }
        self.headings.insert(id, new_heading);

        Some(Position::new(next.x, next.y))
    }
}
