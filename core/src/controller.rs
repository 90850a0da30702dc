use chrono::{NaiveDateTime, NaiveTime};
use serde::Serialize;
use tracing::{debug, error, info};

use crate::arrival::{self, ArrivalInputs, ArrivalReport};
use crate::config::PreheatConfig;
use crate::cycle::{CycleStart, CycleState};
use crate::host::Host;
use crate::model;
use crate::schedule::{
    self, default_comfort, LeadLimits, ScheduleInputs, ScheduleOutcome, DEFAULT_MAX_LEAD,
    DEFAULT_MIN_LEAD,
};
use crate::slope::{is_heating_mode, ratchet, SlopeSample, SlopeTick, TAIL_BAND};
use crate::window::parse_time_of_day;

/// Comfort time of day from its entity, `06:00:00` when unknown or malformed.
pub fn comfort_time(host: &impl Host, cfg: &PreheatConfig) -> NaiveTime {
    host.read_text(&cfg.comfort)
        .and_then(|raw| parse_time_of_day(raw.trim()).ok())
        .unwrap_or_else(default_comfort)
}

fn fmt_k(k: Option<f64>) -> String {
    k.map_or_else(|| "n/a".to_string(), |k| format!("{:.2}", k))
}

/// Owns the transient per-cycle state; every trigger goes through one instance.
#[derive(Debug, Default, Clone, Serialize)]
pub struct Controller {
    cycle: CycleState,
    sample: SlopeSample,
}

impl Controller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cycle(&self) -> &CycleState {
        &self.cycle
    }

    pub fn sample(&self) -> &SlopeSample {
        &self.sample
    }

    /// Heating became active.
    pub fn capture_start(
        &mut self,
        host: &impl Host,
        cfg: &PreheatConfig,
        now: NaiveDateTime,
    ) -> CycleStart {
        let indoor = host.read_numeric(&cfg.indoor, 0.0);
        self.cycle.capture_start(now, indoor);
        info!(
            "captured preheat start at {} indoor={:.2}",
            now.format("%H:%M:%S"),
            indoor
        );
        CycleStart {
            start_ts: now,
            start_t: indoor,
        }
    }

    /// One sampling tick of the ramp.
    pub fn sample_slope(
        &mut self,
        host: &mut impl Host,
        cfg: &PreheatConfig,
        now: NaiveDateTime,
    ) -> SlopeTick {
        let active = host.read_flag(&cfg.preheat_active, false);
        let mode = host.read_text(&cfg.climate).unwrap_or_default();
        if !active || !is_heating_mode(&mode) {
            self.sample.clear();
            self.cycle.clear();
            return SlopeTick::Inactive;
        }

        let indoor = host.read_numeric(&cfg.indoor, 0.0);
        let target = cfg.target_temp(host);
        if indoor >= target - TAIL_BAND {
            self.sample.clear();
            return SlopeTick::NearTarget;
        }

        let Some(slope) = self.sample.observe(now, indoor) else {
            return SlopeTick::Baseline;
        };

        let mut current = model::load(host, &cfg.model_entity);
        match ratchet(current.k, slope) {
            SlopeTick::Raised { k_obs, k_old, k_new, .. } => {
                current.k = k_new;
                if !model::save(host, &cfg.model_entity, &current) {
                    return SlopeTick::Held {
                        slope,
                        k_obs,
                        k_candidate: k_new,
                    };
                }
                info!(
                    "slope {:.3}/min k_obs={:.2} raised k {:.2} -> {:.2}",
                    slope, k_obs, k_old, k_new
                );
                SlopeTick::Raised {
                    slope,
                    k_obs,
                    k_old,
                    k_new,
                }
            }
            tick => {
                debug!("slope sample {:?}", tick);
                tick
            }
        }
    }

    /// Runs at comfort time: corrects the offset and, from a trusted cycle, `k`.
    pub fn evaluate_arrival(
        &self,
        host: &mut impl Host,
        cfg: &PreheatConfig,
        now: NaiveDateTime,
    ) -> ArrivalReport {
        let current = model::load(host, &cfg.model_entity);
        let inputs = ArrivalInputs {
            now,
            comfort: comfort_time(host, cfg),
            indoor: host.read_numeric(&cfg.indoor, 0.0),
            target: cfg.target_temp(host),
            heating_active: host.read_flag(&cfg.preheat_active, false),
            cycle: self.cycle,
        };
        let report = arrival::evaluate(&current, &inputs);

        match report.correction {
            None => info!(
                "arrival ok indoor={:.1} target={:.1} k_model={:.2} k_cycle={} offset={:.1}",
                report.indoor,
                report.target,
                report.k_model,
                fmt_k(report.k_cycle),
                current.offset_min
            ),
            Some(c) => {
                model::save(host, &cfg.model_entity, &report.model);
                info!(
                    "arrival eval indoor={:.1} target={:.1} error_T={:.2} k_model={:.2} k_cycle={} \
                     k_used={:.2} error_min={:.1}m offset_old={:.1} offset_new={:.1} k_new={:.2}",
                    report.indoor,
                    report.target,
                    report.error_t,
                    report.k_model,
                    fmt_k(report.k_cycle),
                    report.k_used,
                    c.error_min,
                    c.offset_old,
                    c.offset_new,
                    c.k_new
                );
            }
        }
        report
    }

    /// Turns the model and current readings into the next preheat start.
    pub fn recompute(
        &self,
        host: &mut impl Host,
        cfg: &PreheatConfig,
        now: NaiveDateTime,
    ) -> ScheduleOutcome {
        if host.read_flag(&cfg.vacation, false) {
            info!("vacation mode active; skipping schedule");
            return ScheduleOutcome::Vacation;
        }

        let outdoor = host.read_numeric(&cfg.outdoor, 0.0);
        let inputs = ScheduleInputs {
            now,
            comfort: comfort_time(host, cfg),
            existing_start: host
                .read_text(&cfg.preheat)
                .and_then(|raw| parse_time_of_day(raw.trim()).ok()),
            model: model::load(host, &cfg.model_entity),
            indoor: host.read_numeric(&cfg.indoor, 0.0),
            outdoor,
            forecast_low: cfg
                .forecast_low
                .as_deref()
                .map(|id| host.read_numeric(id, outdoor)),
            target: cfg.target_temp(host),
            occupied: host.read_flag(&cfg.occupied, true),
            limits: LeadLimits {
                min_lead: host.read_numeric(&cfg.min_lead, DEFAULT_MIN_LEAD),
                max_lead: host.read_numeric(&cfg.max_lead, DEFAULT_MAX_LEAD),
                unocc_cap: host.read_numeric(&cfg.unocc_cap, 0.0),
            },
            active_hours: &cfg.active_hours,
        };

        let outcome = schedule::compute(&inputs);
        match &outcome {
            ScheduleOutcome::Frozen { start, comfort } => info!(
                "start {} for comfort {} is imminent; keeping schedule",
                start.format("%H:%M:%S"),
                comfort.format("%H:%M:%S")
            ),
            ScheduleOutcome::Scheduled(d) => {
                if let Err(e) = host.write_time(&cfg.preheat, d.start.time()) {
                    error!("failed to write preheat start to {}: {:#}", cfg.preheat, e);
                }
                info!(
                    "delta={:.1} k={:.2} bias={:.2} offset={:.1}m occ={} lead={:.0}m start={} comfort={}",
                    d.delta,
                    d.k,
                    d.bias,
                    d.offset_min,
                    d.occupied,
                    d.lead_min,
                    d.start.format("%H:%M:%S"),
                    d.comfort.format("%H:%M:%S")
                );
            }
            ScheduleOutcome::Vacation | ScheduleOutcome::Skipped { .. } => {}
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MemoryHost;
    use crate::model::ThermalModel;
    use anyhow::Result;
    use chrono::{Duration, NaiveDate};

    /// Reads from a house but refuses every write.
    struct ReadOnlyHost(MemoryHost);

    impl Host for ReadOnlyHost {
        fn state(&self, entity_id: &str) -> Option<String> {
            self.0.state(entity_id)
        }
        fn write_time(&mut self, _entity_id: &str, _time: NaiveTime) -> Result<()> {
            anyhow::bail!("read only")
        }
        fn write_text(&mut self, _entity_id: &str, _payload: &str) -> Result<()> {
            anyhow::bail!("read only")
        }
    }

    fn at(d: u32, h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, d)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn house(cfg: &PreheatConfig) -> MemoryHost {
        let mut host = MemoryHost::new();
        host.set(&cfg.climate, "heat");
        host.set(&cfg.indoor, "70.0");
        host.set(&cfg.outdoor, "30.0");
        host.set(&cfg.comfort, "06:00:00");
        host.set(&cfg.occupied, "on");
        host.set(&cfg.vacation, "off");
        host.set(&cfg.preheat_active, "off");
        model::seed(&mut host, &cfg.model_entity);
        host
    }

    fn set_indoor(host: &mut MemoryHost, cfg: &PreheatConfig, t: f64) {
        host.set(&cfg.indoor, format!("{:.3}", t));
    }

    #[test]
    fn reference_schedule_is_written() {
        let cfg = PreheatConfig::default();
        let mut host = house(&cfg);
        let outcome = Controller::new().recompute(&mut host, &cfg, at(10, 2, 0));
        match outcome {
            ScheduleOutcome::Scheduled(d) => assert_eq!(d.start, at(10, 5, 12)),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(host.read_text(&cfg.preheat).as_deref(), Some("05:12:00"));
    }

    #[test]
    fn recompute_is_idempotent() {
        let cfg = PreheatConfig::default();
        let mut host = house(&cfg);
        let controller = Controller::new();
        let first = controller.recompute(&mut host, &cfg, at(10, 2, 0));
        let second = controller.recompute(&mut host, &cfg, at(10, 2, 0));
        assert_eq!(first, second);
    }

    #[test]
    fn vacation_skips_without_writing() {
        let cfg = PreheatConfig::default();
        let mut host = house(&cfg);
        host.set(&cfg.vacation, "on");
        let outcome = Controller::new().recompute(&mut host, &cfg, at(10, 2, 0));
        assert_eq!(outcome, ScheduleOutcome::Vacation);
        assert_eq!(host.read_text(&cfg.preheat), None);
    }

    #[test]
    fn frozen_start_is_left_alone() {
        let cfg = PreheatConfig::default();
        let mut host = house(&cfg);
        host.set(&cfg.preheat, "05:12:00");
        // colder house would otherwise pull the start earlier
        set_indoor(&mut host, &cfg, 66.0);
        let outcome = Controller::new().recompute(&mut host, &cfg, at(10, 5, 0));
        assert!(matches!(outcome, ScheduleOutcome::Frozen { .. }));
        assert_eq!(host.read_text(&cfg.preheat).as_deref(), Some("05:12:00"));
    }

    #[test]
    fn unknown_readings_fall_back() {
        let cfg = PreheatConfig::default();
        let mut host = MemoryHost::new();
        host.set(&cfg.indoor, "70");
        host.set(&cfg.comfort, "unknown");
        host.set(&cfg.model_entity, "garbage");
        let outcome = Controller::new().recompute(&mut host, &cfg, at(10, 2, 0));
        match outcome {
            ScheduleOutcome::Scheduled(d) => {
                assert_eq!(d.comfort, at(10, 6, 0));
                assert_eq!(d.k, model::DEFAULT_K);
                assert!(d.occupied);
                assert_eq!(d.bias, 1.0);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn inactive_heating_clears_state() {
        let cfg = PreheatConfig::default();
        let mut host = house(&cfg);
        let mut controller = Controller::new();
        host.set(&cfg.preheat_active, "on");
        controller.capture_start(&host, &cfg, at(10, 4, 30));
        assert_eq!(
            controller.sample_slope(&mut host, &cfg, at(10, 4, 31)),
            SlopeTick::Baseline
        );
        assert!(controller.sample().last().is_some());

        host.set(&cfg.climate, "cool");
        assert_eq!(
            controller.sample_slope(&mut host, &cfg, at(10, 4, 32)),
            SlopeTick::Inactive
        );
        assert_eq!(controller.sample().last(), None);
        assert_eq!(controller.cycle().start(), None);
    }

    #[test]
    fn near_target_clears_sample_but_keeps_cycle() {
        let cfg = PreheatConfig::default();
        let mut host = house(&cfg);
        let mut controller = Controller::new();
        host.set(&cfg.preheat_active, "on");
        controller.capture_start(&host, &cfg, at(10, 4, 30));
        controller.sample_slope(&mut host, &cfg, at(10, 4, 31));

        set_indoor(&mut host, &cfg, 73.2);
        assert_eq!(
            controller.sample_slope(&mut host, &cfg, at(10, 4, 32)),
            SlopeTick::NearTarget
        );
        assert_eq!(controller.sample().last(), None);
        assert!(controller.cycle().start().is_some());
    }

    #[test]
    fn slope_path_never_lowers_k() {
        let cfg = PreheatConfig::default();
        let mut host = house(&cfg);
        let mut controller = Controller::new();
        host.set(&cfg.preheat_active, "on");

        // fast ramp, a stall, a spike, then a slow ramp
        let readings = [66.0, 66.5, 67.0, 67.0, 69.5, 69.53, 69.56, 69.6, 69.62];
        let mut k = model::load(&host, &cfg.model_entity).k;
        for (i, t) in readings.iter().enumerate() {
            set_indoor(&mut host, &cfg, *t);
            controller.sample_slope(&mut host, &cfg, at(10, 4, i as u32));
            let k_now = model::load(&host, &cfg.model_entity).k;
            assert!(k_now >= k, "k dropped from {} to {}", k, k_now);
            k = k_now;
        }
        assert!(k > model::DEFAULT_K);
    }

    #[test]
    fn one_cycle_feeds_both_learners() {
        let cfg = PreheatConfig::default();
        let mut host = house(&cfg);
        let mut controller = Controller::new();

        // The house gains 1 degree every 20 minutes from 68 starting 04:30.
        let start = at(10, 4, 30);
        set_indoor(&mut host, &cfg, 68.0);
        host.set(&cfg.preheat_active, "on");
        controller.capture_start(&host, &cfg, start);

        let mut k_prev = model::load(&host, &cfg.model_entity).k;
        for minute in 1..=90 {
            set_indoor(&mut host, &cfg, 68.0 + minute as f64 / 20.0);
            controller.sample_slope(&mut host, &cfg, start + Duration::minutes(minute));
            let k = model::load(&host, &cfg.model_entity).k;
            assert!(k >= k_prev);
            k_prev = k;
        }
        let k_slope = k_prev;
        assert!(k_slope > 18.0 && k_slope <= 20.0, "k after ramp {}", k_slope);

        // 72.5 at 06:00: 90 minutes for 4.5 degrees
        let report = controller.evaluate_arrival(&mut host, &cfg, at(10, 6, 0));
        assert_eq!(report.k_model, k_slope);
        let k_cycle = report.k_cycle.unwrap();
        assert!((k_cycle - 20.0).abs() < 1e-6);
        let c = report.correction.unwrap();
        assert!((c.error_min - 30.0).abs() < 1e-6);
        assert!((c.offset_new - 18.0).abs() < 1e-6);
        assert!((c.k_new - (0.6 * k_slope + 0.4 * k_cycle)).abs() < 1e-6);

        let stored = model::load(&host, &cfg.model_entity);
        assert_eq!(stored.k, c.k_new);
        assert_eq!(stored.offset_min, c.offset_new);

        // next night starts earlier than the untrained 05:12
        host.set(&cfg.preheat_active, "off");
        controller.sample_slope(&mut host, &cfg, at(11, 0, 0));
        set_indoor(&mut host, &cfg, 70.0);
        match controller.recompute(&mut host, &cfg, at(11, 2, 0)) {
            ScheduleOutcome::Scheduled(d) => {
                assert!(d.start < at(11, 5, 12));
                assert_eq!(
                    host.read_text(&cfg.preheat),
                    Some(d.start.time().format("%H:%M:%S").to_string())
                );
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn arrival_on_target_leaves_model_untouched() {
        let cfg = PreheatConfig::default();
        let mut host = house(&cfg);
        let seeded = ThermalModel {
            k: 15.0,
            offset_min: 12.0,
            ..ThermalModel::default()
        };
        model::save(&mut host, &cfg.model_entity, &seeded);
        set_indoor(&mut host, &cfg, 73.9);
        let report = Controller::new().evaluate_arrival(&mut host, &cfg, at(10, 6, 0));
        assert_eq!(report.correction, None);
        assert_eq!(model::load(&host, &cfg.model_entity), seeded);
    }

    #[test]
    fn huge_min_lead_keeps_previous_start() {
        let cfg = PreheatConfig::default();
        let mut host = house(&cfg);
        host.set(&cfg.preheat, "05:30:00");
        host.set(&cfg.min_lead, "1e12");
        let outcome = Controller::new().recompute(&mut host, &cfg, at(10, 2, 0));
        assert!(matches!(outcome, ScheduleOutcome::Skipped { .. }));
        assert_eq!(host.read_text(&cfg.preheat).as_deref(), Some("05:30:00"));
    }

    #[test]
    fn failed_start_write_still_schedules() {
        let cfg = PreheatConfig::default();
        let mut host = ReadOnlyHost(house(&cfg));
        match Controller::new().recompute(&mut host, &cfg, at(10, 2, 0)) {
            ScheduleOutcome::Scheduled(d) => assert_eq!(d.start, at(10, 5, 12)),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(host.read_text(&cfg.preheat), None);
    }

    #[test]
    fn unreadable_indoor_captures_zero() {
        let cfg = PreheatConfig::default();
        let mut host = house(&cfg);
        host.set(&cfg.indoor, "unavailable");
        let mut controller = Controller::new();
        let start = controller.capture_start(&host, &cfg, at(10, 4, 30));
        assert_eq!(start.start_t, 0.0);

        let empty = MemoryHost::new();
        let start = controller.capture_start(&empty, &cfg, at(10, 4, 31));
        assert_eq!(start.start_t, 0.0);
        assert_eq!(controller.cycle().start(), Some(start));
    }

    #[test]
    fn unsaved_raise_is_reported_as_held() {
        let cfg = PreheatConfig::default();
        let mut inner = house(&cfg);
        inner.set(&cfg.preheat_active, "on");
        set_indoor(&mut inner, &cfg, 66.0);
        let mut host = ReadOnlyHost(inner);
        let mut controller = Controller::new();
        assert_eq!(
            controller.sample_slope(&mut host, &cfg, at(10, 4, 0)),
            SlopeTick::Baseline
        );

        // 0.05 degrees a minute is k_obs 20, which would raise k
        set_indoor(&mut host.0, &cfg, 66.05);
        match controller.sample_slope(&mut host, &cfg, at(10, 4, 1)) {
            SlopeTick::Held { k_candidate, .. } => assert!(k_candidate > model::DEFAULT_K),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(model::load(&host, &cfg.model_entity).k, model::DEFAULT_K);
    }
}
