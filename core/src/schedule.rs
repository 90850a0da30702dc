use chrono::{Duration, NaiveDateTime, NaiveTime};
use serde::Serialize;
use tracing::{debug, warn};

use crate::model::ThermalModel;
use crate::window::ActiveHours;

/// No recompute within this many minutes of an existing start.
pub const FREEZE_MIN: i64 = 15;
pub const DEFAULT_MIN_LEAD: f64 = 0.0;
pub const DEFAULT_MAX_LEAD: f64 = 240.0;

// Colder nights lose more heat: (outdoor - forecast_low) thresholds and bias increments.
pub const BIAS_STEPS: [(f64, f64); 2] = [(5.0, 0.10), (10.0, 0.20)];

pub fn default_comfort() -> NaiveTime {
    NaiveTime::from_hms_opt(6, 0, 0).unwrap_or(NaiveTime::MIN)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LeadLimits {
    pub min_lead: f64,
    pub max_lead: f64,
    /// Applied only while unoccupied and only when positive.
    pub unocc_cap: f64,
}

impl Default for LeadLimits {
    fn default() -> Self {
        LeadLimits {
            min_lead: DEFAULT_MIN_LEAD,
            max_lead: DEFAULT_MAX_LEAD,
            unocc_cap: 0.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScheduleInputs<'a> {
    pub now: NaiveDateTime,
    pub comfort: NaiveTime,
    pub existing_start: Option<NaiveTime>,
    pub model: ThermalModel,
    pub indoor: f64,
    pub outdoor: f64,
    pub forecast_low: Option<f64>,
    pub target: f64,
    pub occupied: bool,
    pub limits: LeadLimits,
    pub active_hours: &'a [String],
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduleDecision {
    pub comfort: NaiveDateTime,
    pub delta: f64,
    pub k: f64,
    pub bias: f64,
    pub offset_min: f64,
    pub occupied: bool,
    pub lead_min: f64,
    pub raw_start: NaiveDateTime,
    pub start: NaiveDateTime,
    /// Set when the active-hours clamp was skipped.
    pub window_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ScheduleOutcome {
    Vacation,
    Frozen {
        start: NaiveDateTime,
        comfort: NaiveDateTime,
    },
    Scheduled(ScheduleDecision),
    /// Lead time does not fit on the calendar; the previous start stays.
    Skipped {
        lead_min: f64,
        comfort: NaiveDateTime,
    },
}

/// Next comfort instant strictly after `now`.
pub fn next_comfort(now: NaiveDateTime, comfort: NaiveTime) -> NaiveDateTime {
    let today = now.date().and_time(comfort);
    if today > now {
        today
    } else {
        today + Duration::days(1)
    }
}

/// Places a stored start time on the comfort instant's day; a time of day
/// later than the comfort time is read as belonging to the day before.
pub fn start_for_comfort(comfort_dt: NaiveDateTime, start: NaiveTime) -> NaiveDateTime {
    let same_day = comfort_dt.date().and_time(start);
    if same_day > comfort_dt {
        same_day - Duration::days(1)
    } else {
        same_day
    }
}

/// True once `now` is within the freeze window of (or past) the existing start.
pub fn is_frozen(now: NaiveDateTime, comfort_dt: NaiveDateTime, existing: NaiveTime) -> bool {
    now >= start_for_comfort(comfort_dt, existing) - Duration::minutes(FREEZE_MIN)
}

pub fn forecast_bias(outdoor: f64, forecast_low: Option<f64>) -> f64 {
    let Some(low) = forecast_low else {
        return 1.0;
    };
    let drop = (outdoor - low).max(0.0);
    BIAS_STEPS
        .iter()
        .filter(|(threshold, _)| drop >= *threshold)
        .fold(1.0, |bias, (_, step)| bias + step)
}

pub fn lead_minutes(
    model: &ThermalModel,
    delta: f64,
    bias: f64,
    occupied: bool,
    limits: &LeadLimits,
) -> f64 {
    let mut lead_min = model.k * delta * bias + model.offset_min;
    if !occupied && limits.unocc_cap > 0.0 {
        lead_min = lead_min.min(limits.unocc_cap);
    }
    // not f64::clamp: a misconfigured min_lead > max_lead must not panic
    limits.min_lead.max(limits.max_lead.min(lead_min))
}

fn minutes(lead_min: f64) -> Option<Duration> {
    Duration::try_milliseconds((lead_min * 60_000.0).round() as i64)
}

pub fn compute(inputs: &ScheduleInputs) -> ScheduleOutcome {
    let comfort_dt = next_comfort(inputs.now, inputs.comfort);

    if let Some(existing) = inputs.existing_start {
        if is_frozen(inputs.now, comfort_dt, existing) {
            return ScheduleOutcome::Frozen {
                start: start_for_comfort(comfort_dt, existing),
                comfort: comfort_dt,
            };
        }
    }

    let delta = (inputs.target - inputs.indoor).max(0.0);
    let bias = forecast_bias(inputs.outdoor, inputs.forecast_low);
    let lead_min = lead_minutes(&inputs.model, delta, bias, inputs.occupied, &inputs.limits);
    let Some(raw_start) = minutes(lead_min).and_then(|lead| comfort_dt.checked_sub_signed(lead))
    else {
        warn!("lead of {} minutes is out of range; keeping previous start", lead_min);
        return ScheduleOutcome::Skipped {
            lead_min,
            comfort: comfort_dt,
        };
    };

    let (start, window_error) = match ActiveHours::parse(inputs.active_hours) {
        Ok(window) => (window.clamp(raw_start), None),
        Err(e) => {
            debug!("window clamp skipped: {}", e);
            (raw_start, Some(e.to_string()))
        }
    };

    ScheduleOutcome::Scheduled(ScheduleDecision {
        comfort: comfort_dt,
        delta,
        k: inputs.model.k,
        bias,
        offset_min: inputs.model.offset_min,
        occupied: inputs.occupied,
        lead_min,
        raw_start,
        start,
        window_error,
    })
}
