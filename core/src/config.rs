use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tracing::{error, warn};

use crate::host::Host;
use crate::window::{ActiveHours, DEFAULT_ACTIVE_HOURS};

pub const CONFIG_PATH_ENV: &str = "PREHEAT_CONFIG_PATH";
pub const DEFAULT_CONFIG_PATH: &str = "/config/preheat/furnace_preheat_config.json";

pub const DEFAULT_TARGET: f64 = 74.0;
pub const DEFAULT_FORECAST_HOURS: u32 = 8;
pub const FORECAST_HOURS_RANGE: (u32, u32) = (1, 48);

/// Entity ids and settings for one evaluation, with defaults for every key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreheatConfig {
    pub climate: String,
    pub indoor: String,
    pub outdoor: String,
    /// `None` disables the forecast bias.
    pub forecast_low: Option<String>,
    pub occupied: String,
    pub vacation: String,
    pub comfort: String,
    pub preheat: String,
    /// Legacy numeric target, used when `target_input` is absent or unreadable.
    pub target: f64,
    pub target_input: Option<String>,
    pub active_hours: Vec<String>,
    pub forecast_hours: u32,
    pub min_lead: String,
    pub max_lead: String,
    pub unocc_cap: String,
    pub preheat_active: String,
    pub model_entity: String,
}

impl Default for PreheatConfig {
    fn default() -> Self {
        PreheatConfig {
            climate: "climate.daikin".to_string(),
            indoor: "sensor.indoor_temperature".to_string(),
            outdoor: "sensor.main_room_outdoor_air_temperature".to_string(),
            forecast_low: Some("sensor.nws_overnight_low_temperature".to_string()),
            occupied: "binary_sensor.family_home".to_string(),
            vacation: "input_boolean.vacation".to_string(),
            comfort: "input_datetime.comfort_time".to_string(),
            preheat: "input_datetime.preheat_start".to_string(),
            target: DEFAULT_TARGET,
            target_input: None,
            active_hours: DEFAULT_ACTIVE_HOURS.iter().map(|s| s.to_string()).collect(),
            forecast_hours: DEFAULT_FORECAST_HOURS,
            min_lead: "input_number.preheat_min_lead".to_string(),
            max_lead: "input_number.preheat_max_lead".to_string(),
            unocc_cap: "input_number.preheat_unoccupied_cap".to_string(),
            preheat_active: "input_boolean.preheat_active".to_string(),
            model_entity: "input_text.furnace_model_json".to_string(),
        }
    }
}

fn entity(raw: &Map<String, Value>, key: &str, slot: &mut String) {
    match raw.get(key) {
        None => {}
        Some(Value::String(s)) if !s.trim().is_empty() => *slot = s.trim().to_string(),
        Some(other) => warn!("config {}: expected an entity id, got {}; using {}", key, other, slot),
    }
}

fn optional_entity(raw: &Map<String, Value>, key: &str, slot: &mut Option<String>) {
    match raw.get(key) {
        None => {}
        Some(Value::Null) => *slot = None,
        Some(Value::String(s)) if s.trim().is_empty() => *slot = None,
        Some(Value::String(s)) => *slot = Some(s.trim().to_string()),
        Some(other) => warn!("config {}: expected an entity id, got {}; using {:?}", key, other, slot),
    }
}

impl PreheatConfig {
    /// Validates each recognized key on its own; a bad field keeps its default.
    pub fn from_value(raw: &Value) -> PreheatConfig {
        let mut cfg = PreheatConfig::default();
        let Some(raw) = raw.as_object() else {
            warn!("config root is not an object; using defaults");
            return cfg;
        };

        entity(raw, "climate", &mut cfg.climate);
        entity(raw, "indoor_temp", &mut cfg.indoor);
        entity(raw, "outdoor_temp", &mut cfg.outdoor);
        optional_entity(raw, "forecast_low", &mut cfg.forecast_low);
        entity(raw, "occupied_binary", &mut cfg.occupied);
        entity(raw, "vacation", &mut cfg.vacation);
        entity(raw, "comfort_time", &mut cfg.comfort);
        entity(raw, "preheat_start", &mut cfg.preheat);
        optional_entity(raw, "target_temp_input", &mut cfg.target_input);
        entity(raw, "min_lead", &mut cfg.min_lead);
        entity(raw, "max_lead", &mut cfg.max_lead);
        entity(raw, "unocc_cap", &mut cfg.unocc_cap);
        entity(raw, "preheat_active", &mut cfg.preheat_active);
        entity(raw, "model_entity", &mut cfg.model_entity);

        if let Some(v) = raw.get("target_temp") {
            match v.as_f64().filter(|t| t.is_finite()) {
                Some(t) => cfg.target = t,
                None => warn!("config target_temp: expected a number, got {}; using {}", v, cfg.target),
            }
        }

        if let Some(v) = raw.get("forecast_hours_ahead") {
            let (lo, hi) = FORECAST_HOURS_RANGE;
            match v.as_f64().filter(|h| h.is_finite()) {
                Some(h) => cfg.forecast_hours = (h.round().max(lo as f64).min(hi as f64)) as u32,
                None => warn!(
                    "config forecast_hours_ahead: expected an integer, got {}; using {}",
                    v, cfg.forecast_hours
                ),
            }
        }

        if let Some(v) = raw.get("active_hours") {
            let entries: Option<Vec<String>> = v.as_array().map(|items| {
                items
                    .iter()
                    .map(|i| i.as_str().unwrap_or_default().to_string())
                    .collect()
            });
            match entries.map(|e| ActiveHours::parse(&e).map(|_| e)) {
                Some(Ok(entries)) => cfg.active_hours = entries,
                Some(Err(e)) => warn!("config active_hours: {}; using {:?}", e, cfg.active_hours),
                None => warn!("config active_hours: expected a list, got {}", v),
            }
        }

        cfg
    }

    pub fn from_json(raw: &str) -> Result<PreheatConfig> {
        let value: Value = serde_json::from_str(raw).context("config is not valid json")?;
        Ok(PreheatConfig::from_value(&value))
    }

    /// Comfort target, preferring the dedicated input when it reads as a number.
    pub fn target_temp(&self, host: &impl Host) -> f64 {
        self.target_input
            .as_deref()
            .map_or(self.target, |id| host.read_numeric(id, self.target))
    }
}

pub fn config_path() -> PathBuf {
    std::env::var(CONFIG_PATH_ENV)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

async fn read_config(path: &Path) -> Result<PreheatConfig> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    PreheatConfig::from_json(&raw)
}

/// Loads the config file; any failure is logged and yields the defaults.
pub async fn load_config(path: &Path) -> PreheatConfig {
    match read_config(path).await {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("error loading config file: {:#}", e);
            PreheatConfig::default()
        }
    }
}
