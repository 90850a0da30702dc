use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::host::Host;

pub const MODEL_VERSION: u32 = 2;
pub const DEFAULT_K: f64 = 12.0;
pub const DEFAULT_ALPHA: f64 = 0.15;
pub const DEFAULT_OFFSET_MIN: f64 = 0.0;

// Guard rails: below 2 min/deg is unrealistically fast heating,
// above 60 min/deg only comes from spikes.
pub const K_MIN: f64 = 2.0;
pub const K_MAX: f64 = 60.0;
pub const OFFSET_MAX_MIN: f64 = 180.0;

/// Learned thermal response: minutes per degree plus a lead-time correction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ThermalModel {
    pub version: u32,
    pub k: f64,
    pub alpha: f64,
    pub offset_min: f64,
}

impl Default for ThermalModel {
    fn default() -> Self {
        ThermalModel {
            version: MODEL_VERSION,
            k: DEFAULT_K,
            alpha: DEFAULT_ALPHA,
            offset_min: DEFAULT_OFFSET_MIN,
        }
    }
}

#[derive(Deserialize)]
struct StoredModel {
    k: Option<f64>,
    alpha: Option<f64>,
    offset_min: Option<f64>,
}

fn bounded(value: f64, lo: f64, hi: f64, fallback: f64) -> f64 {
    if value.is_finite() {
        value.max(lo).min(hi)
    } else {
        fallback
    }
}

pub fn clamp_k(k: f64) -> f64 {
    bounded(k, K_MIN, K_MAX, DEFAULT_K)
}

pub fn clamp_offset(offset_min: f64) -> f64 {
    bounded(offset_min, 0.0, OFFSET_MAX_MIN, DEFAULT_OFFSET_MIN)
}

pub fn ewma(current: f64, observed: f64, alpha: f64) -> f64 {
    (1.0 - alpha) * current + alpha * observed
}

/// EWMA that moves with `alpha_up` when the observation is above the current
/// value and with `alpha_down` otherwise.
pub fn asymmetric_ewma(current: f64, observed: f64, alpha_up: f64, alpha_down: f64) -> f64 {
    let alpha = if observed > current { alpha_up } else { alpha_down };
    ewma(current, observed, alpha)
}

impl ThermalModel {
    /// Copy with the schema tag fixed and every field inside its bounds.
    pub fn clamped(&self) -> ThermalModel {
        ThermalModel {
            version: MODEL_VERSION,
            k: clamp_k(self.k),
            alpha: bounded(self.alpha, 0.0, 1.0, DEFAULT_ALPHA),
            offset_min: clamp_offset(self.offset_min),
        }
    }

    pub fn parse(raw: &str) -> Result<ThermalModel> {
        let stored: StoredModel = serde_json::from_str(raw).context("invalid model json")?;
        let model = ThermalModel {
            version: MODEL_VERSION,
            k: stored.k.unwrap_or(DEFAULT_K),
            alpha: stored.alpha.unwrap_or(DEFAULT_ALPHA),
            offset_min: stored.offset_min.unwrap_or(DEFAULT_OFFSET_MIN),
        };
        Ok(model.clamped())
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(&self.clamped()).context("failed to serialize model")
    }
}

/// Reads the model from its slot; anything missing or unparsable yields the default.
pub fn load(host: &impl Host, entity_id: &str) -> ThermalModel {
    let Some(raw) = host.read_text(entity_id) else {
        return ThermalModel::default();
    };
    match ThermalModel::parse(&raw) {
        Ok(model) => model,
        Err(e) => {
            warn!("discarding stored model in {}: {:#}", entity_id, e);
            ThermalModel::default()
        }
    }
}

/// Writes the clamped model. Failures are logged; returns whether the write landed.
pub fn save(host: &mut impl Host, entity_id: &str, model: &ThermalModel) -> bool {
    let result = model
        .to_json()
        .and_then(|payload| host.write_text(entity_id, &payload));
    match result {
        Ok(()) => true,
        Err(e) => {
            error!("model save to {} failed: {:#}", entity_id, e);
            false
        }
    }
}

/// Writes the default model when the slot is empty or holds garbage.
pub fn seed(host: &mut impl Host, entity_id: &str) -> bool {
    let valid = host
        .read_text(entity_id)
        .map(|raw| ThermalModel::parse(&raw).is_ok())
        .unwrap_or(false);
    if valid {
        return false;
    }
    info!("seeding default model into {}", entity_id);
    save(host, entity_id, &ThermalModel::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MemoryHost;
    use chrono::NaiveTime;

    const SLOT: &str = "input_text.furnace_model_json";

    struct ReadOnlyHost;

    impl Host for ReadOnlyHost {
        fn state(&self, _entity_id: &str) -> Option<String> {
            None
        }
        fn write_time(&mut self, _entity_id: &str, _time: NaiveTime) -> Result<()> {
            anyhow::bail!("read only")
        }
        fn write_text(&mut self, _entity_id: &str, _payload: &str) -> Result<()> {
            anyhow::bail!("read only")
        }
    }

    #[test]
    fn missing_or_garbage_slot_loads_default() {
        let mut host = MemoryHost::new();
        assert_eq!(load(&host, SLOT), ThermalModel::default());

        host.set(SLOT, "{not json");
        assert_eq!(load(&host, SLOT), ThermalModel::default());

        host.set(SLOT, r#"{"k": "fast"}"#);
        assert_eq!(load(&host, SLOT), ThermalModel::default());
    }

    #[test]
    fn partial_model_fills_defaults_and_clamps() {
        let mut host = MemoryHost::new();
        host.set(SLOT, r#"{"version": 1, "k": 95.0, "offset_min": -4}"#);
        let model = load(&host, SLOT);
        assert_eq!(model.version, MODEL_VERSION);
        assert_eq!(model.k, K_MAX);
        assert_eq!(model.offset_min, 0.0);
        assert_eq!(model.alpha, DEFAULT_ALPHA);
    }

    #[test]
    fn save_writes_clamped_payload() {
        let mut host = MemoryHost::new();
        let model = ThermalModel {
            version: 7,
            k: 1.0,
            alpha: 0.2,
            offset_min: 500.0,
        };
        assert!(save(&mut host, SLOT, &model));

        let raw = host.read_text(SLOT).unwrap();
        let v: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(v["version"], 2);
        assert_eq!(v["k"], 2.0);
        assert_eq!(v["alpha"], 0.2);
        assert_eq!(v["offset_min"], 180.0);
        assert!(raw.starts_with(r#"{"version":2,"k":"#));

        let reloaded = load(&host, SLOT);
        assert_eq!(reloaded, model.clamped());
    }

    #[test]
    fn save_failure_is_not_fatal() {
        let mut host = ReadOnlyHost;
        assert!(!save(&mut host, SLOT, &ThermalModel::default()));
    }

    #[test]
    fn seed_only_replaces_invalid_slots() {
        let mut host = MemoryHost::new();
        assert!(seed(&mut host, SLOT));
        assert_eq!(load(&host, SLOT), ThermalModel::default());

        host.set(SLOT, r#"{"k": 20.0, "offset_min": 5.0}"#);
        assert!(!seed(&mut host, SLOT));
        assert_eq!(load(&host, SLOT).k, 20.0);

        host.set(SLOT, "42");
        assert!(seed(&mut host, SLOT));
        assert_eq!(load(&host, SLOT).k, DEFAULT_K);
    }

    #[test]
    fn asymmetric_ewma_picks_direction() {
        assert!((asymmetric_ewma(10.0, 20.0, 0.4, 0.08) - 14.0).abs() < 1e-9);
        assert!((asymmetric_ewma(10.0, 5.0, 0.4, 0.08) - 9.6).abs() < 1e-9);
    }
}
