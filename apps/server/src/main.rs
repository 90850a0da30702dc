pub mod store;
pub mod triggers;
pub mod web;

use anyhow::Result;
use chrono::{Local, NaiveDateTime, NaiveTime};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use preheat_core::arrival::ArrivalReport;
use preheat_core::config::{config_path, load_config, PreheatConfig};
use preheat_core::controller::{comfort_time, Controller};
use preheat_core::cycle::{CycleStart, CycleState};
use preheat_core::host::Host;
use preheat_core::model::{self, ThermalModel};
use preheat_core::schedule::ScheduleOutcome;
use preheat_core::slope::{SlopeSample, SlopeTick};

use crate::store::StateStore;

const LISTEN_ADDR_ENV: &str = "PREHEAT_LISTEN_ADDR";
const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";
const STATE_PATH_ENV: &str = "PREHEAT_STATE_PATH";
const DEFAULT_STATE_PATH: &str = "/var/lib/preheat/state.json";

/// Controller and host state, always touched together under one lock.
pub struct Runtime {
    pub controller: Controller,
    pub store: StateStore,
}

#[derive(Clone, Serialize)]
pub struct Status {
    pub model: ThermalModel,
    pub cycle: CycleState,
    pub sample: SlopeSample,
    pub comfort_time: NaiveTime,
    pub preheat_start: Option<String>,
}

async fn persist(store: &mut StateStore) {
    if let Err(e) = store.flush().await {
        error!("failed to save host state: {:#}", e);
    }
}

fn local_now() -> NaiveDateTime {
    Local::now().naive_local()
}

#[derive(Clone)]
pub struct AppState {
    runtime: Arc<Mutex<Runtime>>,
    config_path: PathBuf,
    clock: fn() -> NaiveDateTime,
}

impl AppState {
    pub fn new(store: StateStore, config_path: PathBuf) -> Self {
        AppState {
            runtime: Arc::new(Mutex::new(Runtime {
                controller: Controller::new(),
                store,
            })),
            config_path,
            clock: local_now,
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: fn() -> NaiveDateTime) -> Self {
        self.clock = clock;
        self
    }

    pub fn now(&self) -> NaiveDateTime {
        (self.clock)()
    }

    pub async fn config(&self) -> PreheatConfig {
        load_config(&self.config_path).await
    }

    pub async fn init_model(&self) -> bool {
        let cfg = self.config().await;
        let mut rt = self.runtime.lock().await;
        let seeded = model::seed(&mut rt.store, &cfg.model_entity);
        persist(&mut rt.store).await;
        seeded
    }

    /// Stores a pushed state; the heating-active off->on edge starts a cycle.
    pub async fn push_state(&self, entity_id: &str, state: &str) -> Option<CycleStart> {
        let cfg = self.config().await;
        let mut rt = self.runtime.lock().await;
        let Runtime { controller, store } = &mut *rt;

        let was_active = store.read_flag(&cfg.preheat_active, false);
        store.set(entity_id, state);

        if entity_id == cfg.climate {
            debug!("{} is now {}", entity_id, state);
        }
        if entity_id == cfg.preheat_active && !was_active && store.read_flag(entity_id, false) {
            return Some(controller.capture_start(&*store, &cfg, self.now()));
        }
        None
    }

    pub async fn sample_slope(&self) -> SlopeTick {
        let cfg = self.config().await;
        let mut rt = self.runtime.lock().await;
        let Runtime { controller, store } = &mut *rt;
        let result = controller.sample_slope(&mut *store, &cfg, self.now());
        persist(store).await;
        result
    }

    pub async fn evaluate_arrival(&self) -> ArrivalReport {
        let cfg = self.config().await;
        let mut rt = self.runtime.lock().await;
        let Runtime { controller, store } = &mut *rt;
        let result = controller.evaluate_arrival(&mut *store, &cfg, self.now());
        persist(store).await;
        result
    }

    pub async fn recompute(&self) -> ScheduleOutcome {
        let cfg = self.config().await;
        let mut rt = self.runtime.lock().await;
        let Runtime { controller, store } = &mut *rt;
        let result = controller.recompute(&mut *store, &cfg, self.now());
        persist(store).await;
        result
    }

    pub async fn comfort_time(&self, cfg: &PreheatConfig) -> NaiveTime {
        let rt = self.runtime.lock().await;
        comfort_time(&rt.store, cfg)
    }

    pub async fn model(&self) -> ThermalModel {
        let cfg = self.config().await;
        let rt = self.runtime.lock().await;
        let current = model::load(&rt.store, &cfg.model_entity);
        info!("model = {:?}", current);
        current
    }

    pub async fn reset_model(&self) -> ThermalModel {
        let cfg = self.config().await;
        let mut rt = self.runtime.lock().await;
        let fresh = ThermalModel::default();
        model::save(&mut rt.store, &cfg.model_entity, &fresh);
        persist(&mut rt.store).await;
        info!("model reset to {:?}", fresh);
        fresh
    }

    pub async fn status(&self) -> Status {
        let cfg = self.config().await;
        let rt = self.runtime.lock().await;
        Status {
            model: model::load(&rt.store, &cfg.model_entity),
            cycle: *rt.controller.cycle(),
            sample: *rt.controller.sample(),
            comfort_time: comfort_time(&rt.store, &cfg),
            preheat_start: rt.store.read_text(&cfg.preheat),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("preheat_server=info,preheat_core=info,info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let store = StateStore::open(PathBuf::from(env_or(STATE_PATH_ENV, DEFAULT_STATE_PATH)))?;
    let state = AppState::new(store, config_path());
    info!("using config {}", state.config_path.display());
    state.init_model().await;

    triggers::spawn_all(state.clone());

    web::serve(state, &env_or(LISTEN_ADDR_ENV, DEFAULT_LISTEN_ADDR)).await
}
