use chrono::{Duration, NaiveDateTime, Timelike};
use std::ops::RangeInclusive;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::info;

use preheat_core::schedule::next_comfort;

use crate::AppState;

const SLOPE_PERIOD: std::time::Duration = std::time::Duration::from_secs(60);
/// Upper bound on one sleep while waiting for comfort time, so edits are picked up.
const COMFORT_RECHECK: std::time::Duration = std::time::Duration::from_secs(60);
/// Local hours in which the schedule is recomputed every quarter hour.
const RECOMPUTE_HOURS: RangeInclusive<u32> = 2..=7;

fn until(now: NaiveDateTime, due: NaiveDateTime) -> std::time::Duration {
    (due - now).to_std().unwrap_or_default()
}

/// Next `:00/:15/:30/:45` boundary strictly after `now`.
pub fn next_quarter_hour(now: NaiveDateTime) -> NaiveDateTime {
    let hour_start = now
        - Duration::seconds((now.minute() * 60 + now.second()) as i64)
        - Duration::nanoseconds(now.nanosecond() as i64);
    hour_start + Duration::minutes(((now.minute() / 15 + 1) * 15) as i64)
}

pub fn in_recompute_window(at: NaiveDateTime) -> bool {
    RECOMPUTE_HOURS.contains(&at.hour())
}

async fn run_slope_sampler(state: AppState) {
    let mut ticker = interval(SLOPE_PERIOD);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        state.sample_slope().await;
    }
}

async fn run_arrival_evaluator(state: AppState) {
    let mut last_fired: Option<NaiveDateTime> = None;
    loop {
        let cfg = state.config().await;
        let now = state.now();
        let due = next_comfort(now, state.comfort_time(&cfg).await);
        let wait = until(now, due);
        if wait > COMFORT_RECHECK {
            sleep(COMFORT_RECHECK).await;
            continue;
        }
        sleep(wait).await;
        if last_fired == Some(due) {
            sleep(std::time::Duration::from_secs(1)).await;
            continue;
        }
        last_fired = Some(due);
        state.evaluate_arrival().await;
    }
}

async fn run_schedule(state: AppState) {
    loop {
        let now = state.now();
        let due = next_quarter_hour(now);
        sleep(until(now, due)).await;
        if in_recompute_window(due) {
            state.recompute().await;
        }
    }
}

pub fn spawn_all(state: AppState) -> Vec<JoinHandle<()>> {
    info!(
        "starting triggers: slope every {}s, schedule every 15m in hours {:?}",
        SLOPE_PERIOD.as_secs(),
        RECOMPUTE_HOURS
    );
    vec![
        tokio::spawn(run_slope_sampler(state.clone())),
        tokio::spawn(run_arrival_evaluator(state.clone())),
        tokio::spawn(run_schedule(state)),
    ]
}
