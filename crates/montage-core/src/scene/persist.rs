//! Project persistence and schema migration
//!
//! The persisted document carries an integer schema `version` at the root.
//! Loading parses to a JSON value first, walks the linear migration chain
//! up to the current version, then deserializes. Every scene field is
//! explicitly present on save; collections missing on load default to
//! empty.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::store::SceneManager;
use super::{MediaAsset, Scene};
use crate::error::{EngineError, EngineResult};

/// Schema version written by this build.
pub const SCHEMA_VERSION: u32 = 3;

/// Keybinding action names the engine exposes
pub const ACTION_MARK_ONESHOT: &str = "mark_oneshot";
pub const ACTION_CYCLE_ONESHOT: &str = "cycle_oneshot";

/// Default key map for the engine-exposed actions.
pub fn default_keybindings() -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    map.insert(ACTION_MARK_ONESHOT.to_string(), "o".to_string());
    map.insert(ACTION_CYCLE_ONESHOT.to_string(), "shift+tab".to_string());
    map
}

/// The persisted project document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedProject {
    pub version: u32,
    pub name: String,
    #[serde(default)]
    pub scenes: Vec<Scene>,
    #[serde(default)]
    pub assets: Vec<MediaAsset>,
    #[serde(default)]
    pub keybindings: BTreeMap<String, String>,
}

impl SavedProject {
    /// Capture the current store state as a persisted document.
    pub fn capture(manager: &SceneManager, name: impl Into<String>) -> Self {
        Self {
            version: SCHEMA_VERSION,
            name: name.into(),
            scenes: manager.snapshot(),
            assets: manager.assets(),
            keybindings: default_keybindings(),
        }
    }

    /// Restore this document into the store.
    pub fn restore(&self, manager: &SceneManager) {
        manager.restore_assets(self.assets.clone());
        manager.restore(self.scenes.clone());
    }
}

/// One step of the linear migration chain: version n to n + 1.
type Migrator = fn(Value) -> Result<Value, String>;

/// Migration table indexed by source version (index 0 migrates v1 → v2).
const MIGRATIONS: &[Migrator] = &[migrate_v1_to_v2, migrate_v2_to_v3];

/// v1 → v2: the one-shot actions gained keybindings.
fn migrate_v1_to_v2(mut value: Value) -> Result<Value, String> {
    let root = value
        .as_object_mut()
        .ok_or_else(|| "project root is not an object".to_string())?;

    let bindings = root
        .entry("keybindings")
        .or_insert_with(|| Value::Object(Default::default()));
    let bindings = bindings
        .as_object_mut()
        .ok_or_else(|| "keybindings is not an object".to_string())?;
    for (action, key) in default_keybindings() {
        bindings.entry(action).or_insert(Value::String(key));
    }

    root.insert("version".into(), Value::from(2));
    Ok(value)
}

/// v2 → v3: sidechain `source_track_id: String` became the tagged
/// `source` union. Envelope caches are never persisted, so the reshape
/// needs no cache surgery here; the in-memory cache is rebuilt from the
/// migrated configs on the next playback preparation.
fn migrate_v2_to_v3(mut value: Value) -> Result<Value, String> {
    let root = value
        .as_object_mut()
        .ok_or_else(|| "project root is not an object".to_string())?;

    if let Some(scenes) = root.get_mut("scenes").and_then(|s| s.as_array_mut()) {
        for scene in scenes {
            let Some(configs) = scene
                .get_mut("sidechain_configs")
                .and_then(|c| c.as_array_mut())
            else {
                continue;
            };
            for config in configs {
                let Some(obj) = config.as_object_mut() else {
                    continue;
                };
                if obj.contains_key("source") {
                    continue;
                }
                let Some(track_id) = obj.remove("source_track_id") else {
                    continue;
                };
                obj.insert(
                    "source".into(),
                    serde_json::json!({ "kind": "track", "track_id": track_id }),
                );
            }
        }
    }

    root.insert("version".into(), Value::from(3));
    Ok(value)
}

/// Apply the migration chain until `value` is at the current version.
pub fn migrate_to_current(mut value: Value) -> EngineResult<Value> {
    loop {
        let version = (value
            .get("version")
            .and_then(|v| v.as_u64())
            .unwrap_or(1) as u32)
            .max(1);
        if version >= SCHEMA_VERSION {
            return Ok(value);
        }
        let migrator = MIGRATIONS
            .get((version - 1) as usize)
            .ok_or_else(|| EngineError::Persist(format!("no migration from version {}", version)))?;
        value = migrator(value).map_err(EngineError::Persist)?;
    }
}

/// Serialize a project document to JSON.
pub fn to_json(project: &SavedProject) -> EngineResult<String> {
    serde_json::to_string_pretty(project).map_err(|e| EngineError::Persist(e.to_string()))
}

/// Parse a persisted document, migrating old schemas forward.
pub fn from_json(text: &str) -> EngineResult<SavedProject> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| EngineError::Persist(e.to_string()))?;
    let value = migrate_to_current(value)?;
    serde_json::from_value(value).map_err(|e| EngineError::Persist(e.to_string()))
}
