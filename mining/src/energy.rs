/// Energy model
///
/// Energy drains when a session starts and refills linearly over time up to
/// the user's capacity. Everything here is pure: callers pass `now` and
/// decide themselves whether the recomputed value gets persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const MS_PER_HOUR: f64 = 3_600_000.0;
const MS_PER_MINUTE: f64 = 60_000.0;

/// Last known energy snapshot of a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnergyState {
    pub current: f64,
    pub max: f64,
    /// `None` until the first debit or regeneration tick
    pub last_update: Option<DateTime<Utc>>,
    /// Units regenerated per hour
    pub regen_rate: f64,
}

impl EnergyState {
    /// Fresh state for a new user: full tank, nothing to regenerate.
    pub fn full(max: f64, regen_rate: f64) -> Self {
        Self { current: max, max, last_update: None, regen_rate }
    }

    pub fn is_full(&self) -> bool {
        self.current >= self.max
    }

    /// Snapshot with `current` replaced and the timestamp moved to `now`.
    pub fn rebased(&self, current: f64, now: DateTime<Utc>) -> Self {
        Self {
            current: current.clamp(0.0, self.max),
            max: self.max,
            last_update: Some(now),
            regen_rate: self.regen_rate,
        }
    }
}

/// Energy available at `now`.
///
/// Without a state the configured base capacity is returned. Regeneration
/// is capped at `max`; time running backwards regenerates nothing.
pub fn current_energy(state: Option<&EnergyState>, now: DateTime<Utc>, base_capacity: f64) -> f64 {
    let Some(state) = state else {
        return base_capacity;
    };
    let Some(last_update) = state.last_update else {
        return state.current;
    };

    let elapsed_ms = (now - last_update).num_milliseconds().max(0) as f64;
    let regen = elapsed_ms / MS_PER_HOUR * state.regen_rate;
    (state.current + regen).min(state.max)
}

/// Energy consumed by one session of `block_time_ms`.
pub fn energy_required(cost_per_minute: f64, block_time_ms: u64) -> f64 {
    cost_per_minute * (block_time_ms as f64 / MS_PER_MINUTE)
}
