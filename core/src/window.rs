use chrono::{Duration, NaiveDateTime, NaiveTime};
use thiserror::Error;

pub const DEFAULT_ACTIVE_HOURS: [&str; 2] = ["03:00:00", "23:00:00"];

#[derive(Debug, Error, PartialEq)]
pub enum WindowError {
    #[error("expected 2 entries in active hours, got {0}")]
    Arity(usize),
    #[error("malformed time of day {0:?}, expected HH:MM:SS")]
    Malformed(String),
}

/// Parses a strict `HH:MM:SS` time of day.
pub fn parse_time_of_day(raw: &str) -> Result<NaiveTime, WindowError> {
    let bytes = raw.as_bytes();
    let shaped = bytes.len() == 8
        && bytes[2] == b':'
        && bytes[5] == b':'
        && bytes
            .iter()
            .enumerate()
            .all(|(i, b)| i == 2 || i == 5 || b.is_ascii_digit());
    if !shaped {
        return Err(WindowError::Malformed(raw.to_string()));
    }
    NaiveTime::parse_from_str(raw, "%H:%M:%S").map_err(|_| WindowError::Malformed(raw.to_string()))
}

/// Same-day time-of-day range. `end <= start` means the window crosses midnight.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActiveHours {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl ActiveHours {
    pub fn parse<S: AsRef<str>>(entries: &[S]) -> Result<Self, WindowError> {
        match entries {
            [start, end] => Ok(ActiveHours {
                start: parse_time_of_day(start.as_ref())?,
                end: parse_time_of_day(end.as_ref())?,
            }),
            _ => Err(WindowError::Arity(entries.len())),
        }
    }

    pub fn crosses_midnight(&self) -> bool {
        self.end <= self.start
    }

    /// Moves `at` into the window anchored on `at`'s own day.
    pub fn clamp(&self, at: NaiveDateTime) -> NaiveDateTime {
        let day = at.date();
        let mut win_start = day.and_time(self.start);
        let mut win_end = day.and_time(self.end);

        if self.crosses_midnight() {
            if at < win_end {
                // morning tail of the window that opened yesterday
                win_start -= Duration::days(1);
            } else if at >= win_start {
                win_end += Duration::days(1);
            } else if win_start - at <= at - win_end {
                win_end += Duration::days(1);
            } else {
                win_start -= Duration::days(1);
            }
        }

        if at < win_start {
            win_start
        } else if at > win_end {
            win_end
        } else {
            at
        }
    }
}
