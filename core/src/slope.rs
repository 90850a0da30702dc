use chrono::NaiveDateTime;
use serde::Serialize;

use crate::model::{asymmetric_ewma, clamp_k};

pub const HEATING_MODES: [&str; 2] = ["heat", "heat_cool"];

/// Readings within this many degrees of target are the slow tail of the ramp.
pub const TAIL_BAND: f64 = 1.0;
pub const MIN_DT_MIN: f64 = 0.1;
pub const SLOPE_MIN: f64 = 0.02;
pub const SLOPE_MAX: f64 = 2.0;
pub const ALPHA_UP: f64 = 0.30;
pub const ALPHA_DOWN: f64 = 0.05;
/// A raise below 1% is noise and is not committed.
pub const RATCHET_MARGIN: f64 = 1.01;

pub fn is_heating_mode(mode: &str) -> bool {
    HEATING_MODES.contains(&mode.trim().to_ascii_lowercase().as_str())
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Reading {
    pub last_t: f64,
    pub last_ts: NaiveDateTime,
}

/// Previous ramp reading, kept between sampling ticks.
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize)]
pub struct SlopeSample {
    last: Option<Reading>,
}

impl SlopeSample {
    pub fn clear(&mut self) {
        self.last = None;
    }

    pub fn last(&self) -> Option<Reading> {
        self.last
    }

    /// Stores the reading and returns the rise rate (deg/min) since the
    /// previous one, or `None` when this is the first point.
    pub fn observe(&mut self, now: NaiveDateTime, indoor: f64) -> Option<f64> {
        let prev = self.last.replace(Reading {
            last_t: indoor,
            last_ts: now,
        })?;
        let elapsed_min = (now - prev.last_ts).num_milliseconds() as f64 / 60_000.0;
        let dt_min = elapsed_min.max(MIN_DT_MIN);
        Some((indoor - prev.last_t) / dt_min)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum SlopeTick {
    /// Heating off or not in a heating mode.
    Inactive,
    NearTarget,
    Baseline,
    Implausible { slope: f64 },
    Held { slope: f64, k_obs: f64, k_candidate: f64 },
    Raised { slope: f64, k_obs: f64, k_old: f64, k_new: f64 },
}

/// Blends an observed slope into `k_current`. This path may only raise `k`.
pub fn ratchet(k_current: f64, slope: f64) -> SlopeTick {
    if slope <= SLOPE_MIN || slope >= SLOPE_MAX {
        return SlopeTick::Implausible { slope };
    }
    let k_obs = 1.0 / slope;
    let blended = clamp_k(asymmetric_ewma(k_current, k_obs, ALPHA_UP, ALPHA_DOWN));
    let k_candidate = blended.max(k_current);

    if k_candidate > k_current * RATCHET_MARGIN {
        SlopeTick::Raised {
            slope,
            k_obs,
            k_old: k_current,
            k_new: k_candidate,
        }
    } else {
        SlopeTick::Held {
            slope,
            k_obs,
            k_candidate,
        }
    }
}
