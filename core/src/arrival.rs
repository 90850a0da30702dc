use chrono::{Duration, NaiveDateTime, NaiveTime};
use serde::Serialize;

use crate::cycle::CycleState;
use crate::model::{asymmetric_ewma, clamp_k, clamp_offset, ewma, ThermalModel};

pub const NEAR_COMFORT_MIN: i64 = 5;
pub const MIN_CYCLE_MIN: f64 = 15.0;
pub const MIN_GAIN: f64 = 0.5;
/// High-demand gate: shallow cycles ramp non-linearly on modulating equipment.
pub const MIN_START_DEFICIT: f64 = 2.0;
pub const ON_TARGET_BAND: f64 = 0.3;
pub const MAX_ERROR_MIN: f64 = 120.0;

pub const OFFSET_ALPHA_LATE: f64 = 0.6;
pub const OFFSET_ALPHA_EARLY: f64 = 0.1;
pub const K_ALPHA_UP: f64 = 0.40;
pub const K_ALPHA_DOWN: f64 = 0.08;

#[derive(Debug, Clone, Copy)]
pub struct ArrivalInputs {
    pub now: NaiveDateTime,
    pub comfort: NaiveTime,
    pub indoor: f64,
    pub target: f64,
    pub heating_active: bool,
    pub cycle: CycleState,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Correction {
    pub error_min: f64,
    pub offset_old: f64,
    pub offset_new: f64,
    pub k_old: f64,
    pub k_new: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ArrivalReport {
    pub indoor: f64,
    pub target: f64,
    /// Positive when the house arrived cold (late), negative when warm (early).
    pub error_t: f64,
    pub near_comfort: bool,
    pub k_model: f64,
    pub k_cycle: Option<f64>,
    pub k_used: f64,
    /// `None` inside the on-target band.
    pub correction: Option<Correction>,
    pub model: ThermalModel,
}

/// True when `now` is within a few minutes of the nearest comfort instant.
pub fn near_comfort(now: NaiveDateTime, comfort: NaiveTime) -> bool {
    let window = Duration::minutes(NEAR_COMFORT_MIN);
    [-1, 0, 1].iter().any(|&days| {
        let instant = (now.date() + Duration::days(days)).and_time(comfort);
        (now - instant).abs() <= window
    })
}

/// Minutes per degree observed over the whole cycle, when the cycle is trustworthy.
pub fn cycle_rate(inputs: &ArrivalInputs) -> Option<f64> {
    if !inputs.heating_active || !near_comfort(inputs.now, inputs.comfort) {
        return None;
    }
    let progress = inputs.cycle.progress(inputs.now, inputs.indoor)?;
    let high_demand = inputs.target - progress.start_t >= MIN_START_DEFICIT;
    if progress.elapsed_min < MIN_CYCLE_MIN || progress.gained < MIN_GAIN || !high_demand {
        return None;
    }
    Some(progress.elapsed_min / progress.gained)
}

pub fn evaluate(model: &ThermalModel, inputs: &ArrivalInputs) -> ArrivalReport {
    let error_t = inputs.target - inputs.indoor;
    let k_model = model.k;
    let k_cycle = cycle_rate(inputs);
    let k_used = k_cycle.map_or(k_model, |k| k.max(k_model));

    let mut report = ArrivalReport {
        indoor: inputs.indoor,
        target: inputs.target,
        error_t,
        near_comfort: near_comfort(inputs.now, inputs.comfort),
        k_model,
        k_cycle,
        k_used,
        correction: None,
        model: *model,
    };

    if error_t.abs() < ON_TARGET_BAND {
        return report;
    }

    let error_min = (error_t * k_used).max(-MAX_ERROR_MIN).min(MAX_ERROR_MIN);
    let alpha_off = if error_t > 0.0 {
        OFFSET_ALPHA_LATE
    } else {
        OFFSET_ALPHA_EARLY
    };
    let offset_new = clamp_offset(ewma(model.offset_min, error_min, alpha_off));

    let k_new = match k_cycle {
        Some(k) => clamp_k(asymmetric_ewma(k_model, k, K_ALPHA_UP, K_ALPHA_DOWN)),
        None => k_model,
    };

    report.correction = Some(Correction {
        error_min,
        offset_old: model.offset_min,
        offset_new,
        k_old: k_model,
        k_new,
    });
    report.model = ThermalModel {
        k: k_new,
        offset_min: offset_new,
        ..*model
    };
    report
}
