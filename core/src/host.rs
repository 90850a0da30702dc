use anyhow::Result;
use chrono::NaiveTime;
use std::collections::HashMap;

/// States the host reports for entities it cannot currently read.
const UNKNOWN_STATES: [&str; 3] = ["", "unknown", "unavailable"];

/// Access to the host environment's entities (sensors, flags, schedule slots).
///
/// Implementors only provide raw state lookup and the two writes; the typed
/// readers map unknown values to the caller's default and never fail.
pub trait Host {
    fn state(&self, entity_id: &str) -> Option<String>;
    fn write_time(&mut self, entity_id: &str, time: NaiveTime) -> Result<()>;
    fn write_text(&mut self, entity_id: &str, payload: &str) -> Result<()>;

    fn read_text(&self, entity_id: &str) -> Option<String> {
        self.state(entity_id)
            .filter(|v| !UNKNOWN_STATES.contains(&v.trim()))
    }

    fn read_numeric(&self, entity_id: &str, default: f64) -> f64 {
        self.read_text(entity_id)
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|v| v.is_finite())
            .unwrap_or(default)
    }

    fn read_flag(&self, entity_id: &str, default_when_unknown: bool) -> bool {
        match self.read_text(entity_id) {
            Some(v) => v.trim().eq_ignore_ascii_case("on"),
            None => default_when_unknown,
        }
    }
}

/// Host backed by a plain map of entity states.
#[derive(Debug, Default, Clone)]
pub struct MemoryHost {
    states: HashMap<String, String>,
}

impl MemoryHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_states(states: HashMap<String, String>) -> Self {
        Self { states }
    }

    /// Stores a state and returns the previous one.
    pub fn set(&mut self, entity_id: &str, state: impl Into<String>) -> Option<String> {
        self.states.insert(entity_id.to_string(), state.into())
    }

    pub fn states(&self) -> &HashMap<String, String> {
        &self.states
    }
}

impl Host for MemoryHost {
    fn state(&self, entity_id: &str) -> Option<String> {
        self.states.get(entity_id).cloned()
    }

    fn write_time(&mut self, entity_id: &str, time: NaiveTime) -> Result<()> {
        self.set(entity_id, time.format("%H:%M:%S").to_string());
        Ok(())
    }

    fn write_text(&mut self, entity_id: &str, payload: &str) -> Result<()> {
        self.set(entity_id, payload);
        Ok(())
    }
}
