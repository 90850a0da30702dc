use chrono::NaiveDateTime;
use serde::Serialize;

/// Indoor temperature and time at which the current heating cycle began.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CycleStart {
    pub start_ts: NaiveDateTime,
    pub start_t: f64,
}

/// Progress of a cycle measured at some later instant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CycleProgress {
    pub elapsed_min: f64,
    pub gained: f64,
    pub start_t: f64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize)]
pub struct CycleState {
    start: Option<CycleStart>,
}

impl CycleState {
    /// Overwrites any previous start unconditionally.
    pub fn capture_start(&mut self, now: NaiveDateTime, indoor: f64) {
        self.start = Some(CycleStart {
            start_ts: now,
            start_t: indoor,
        });
    }

    pub fn clear(&mut self) {
        self.start = None;
    }

    pub fn start(&self) -> Option<CycleStart> {
        self.start
    }

    pub fn progress(&self, now: NaiveDateTime, indoor: f64) -> Option<CycleProgress> {
        self.start.map(|s| CycleProgress {
            elapsed_min: (now - s.start_ts).num_milliseconds() as f64 / 60_000.0,
            gained: indoor - s.start_t,
            start_t: s.start_t,
        })
    }
}
