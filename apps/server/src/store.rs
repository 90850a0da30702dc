use anyhow::{Context, Result};
use chrono::NaiveTime;
use preheat_core::host::{Host, MemoryHost};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::create_dir_all;
use std::io::ErrorKind;
use std::path::PathBuf;
use tracing::warn;

/// Entity states pushed by the host, plus the slots this daemon writes.
///
/// Written slots (model json, preheat start) survive restarts through a JSON
/// snapshot; pushed sensor states do not, they are re-sent by the host.
/// Host writes only mark the store dirty, `flush` writes the snapshot.
pub struct StateStore {
    states: MemoryHost,
    persisted: HashSet<String>,
    snapshot: Option<PathBuf>,
    dirty: bool,
}

impl StateStore {
    #[cfg(test)]
    pub fn in_memory() -> Self {
        StateStore {
            states: MemoryHost::new(),
            persisted: HashSet::new(),
            snapshot: None,
            dirty: false,
        }
    }

    pub fn open(path: PathBuf) -> Result<Self> {
        if let Some(dir) = path.parent() {
            create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
        }

        let saved: HashMap<String, String> = match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!("ignoring unreadable snapshot {}: {}", path.display(), e);
                HashMap::new()
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                warn!("cannot read snapshot {}: {}; starting empty", path.display(), e);
                HashMap::new()
            }
        };

        Ok(StateStore {
            persisted: saved.keys().cloned().collect(),
            states: MemoryHost::from_states(saved),
            snapshot: Some(path),
            dirty: false,
        })
    }

    /// Stores a pushed state, returning the previous one.
    pub fn set(&mut self, entity_id: &str, state: &str) -> Option<String> {
        self.states.set(entity_id, state)
    }

    /// Rewrites the snapshot if a slot changed since the last flush.
    pub async fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let Some(path) = &self.snapshot else {
            self.dirty = false;
            return Ok(());
        };
        let slots: BTreeMap<&str, &str> = self
            .persisted
            .iter()
            .filter_map(|id| {
                self.states
                    .states()
                    .get(id)
                    .map(|v| (id.as_str(), v.as_str()))
            })
            .collect();

        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(&slots)?)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, path)
            .await
            .with_context(|| format!("failed to rename {} to {}", tmp.display(), path.display()))?;
        self.dirty = false;
        Ok(())
    }
}

impl Host for StateStore {
    fn state(&self, entity_id: &str) -> Option<String> {
        self.states.state(entity_id)
    }

    fn write_time(&mut self, entity_id: &str, time: NaiveTime) -> Result<()> {
        self.states.write_time(entity_id, time)?;
        self.persisted.insert(entity_id.to_string());
        self.dirty = true;
        Ok(())
    }

    fn write_text(&mut self, entity_id: &str, payload: &str) -> Result<()> {
        self.states.write_text(entity_id, payload)?;
        self.persisted.insert(entity_id.to_string());
        self.dirty = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("preheat-store-{}", std::process::id()))
            .join(name)
    }

    #[tokio::test]
    async fn written_slots_survive_reopen() -> Result<()> {
        let path = snapshot_path("reopen.json");
        let mut store = StateStore::open(path.clone())?;
        store.set("sensor.indoor_temperature", "70.5");
        store.write_text("input_text.furnace_model_json", r#"{"k":14.0}"#)?;
        store.write_time(
            "input_datetime.preheat_start",
            NaiveTime::from_hms_opt(5, 12, 0).unwrap(),
        )?;
        store.flush().await?;

        let reopened = StateStore::open(path.clone())?;
        assert_eq!(
            reopened.read_text("input_text.furnace_model_json").as_deref(),
            Some(r#"{"k":14.0}"#)
        );
        assert_eq!(
            reopened.read_text("input_datetime.preheat_start").as_deref(),
            Some("05:12:00")
        );
        assert_eq!(reopened.read_text("sensor.indoor_temperature"), None);

        std::fs::remove_file(&path)?;
        Ok(())
    }

    #[tokio::test]
    async fn nothing_hits_disk_until_flush() -> Result<()> {
        let path = snapshot_path("deferred.json");
        let mut store = StateStore::open(path.clone())?;
        store.flush().await?;
        assert!(!path.exists());

        store.write_text("input_text.furnace_model_json", "{}")?;
        assert!(!path.exists());
        store.flush().await?;
        assert!(path.exists());

        std::fs::remove_file(&path)?;
        Ok(())
    }

    #[test]
    fn corrupt_snapshot_starts_empty() -> Result<()> {
        let path = snapshot_path("corrupt.json");
        create_dir_all(path.parent().unwrap())?;
        std::fs::write(&path, "{{{")?;
        let store = StateStore::open(path.clone())?;
        assert_eq!(store.read_text("input_text.furnace_model_json"), None);
        std::fs::remove_file(&path)?;
        Ok(())
    }

    #[test]
    fn unreadable_snapshot_starts_empty() -> Result<()> {
        // a directory where the file should be fails with something other than NotFound
        let path = snapshot_path("is-a-dir.json");
        create_dir_all(&path)?;
        let store = StateStore::open(path.clone())?;
        assert_eq!(store.read_text("input_text.furnace_model_json"), None);
        std::fs::remove_dir(&path)?;
        Ok(())
    }

    #[tokio::test]
    async fn in_memory_store_never_touches_disk() -> Result<()> {
        let mut store = StateStore::in_memory();
        store.write_text("input_text.furnace_model_json", "{}")?;
        store.flush().await?;
        assert_eq!(
            store.read_text("input_text.furnace_model_json").as_deref(),
            Some("{}")
        );
        Ok(())
    }
}
