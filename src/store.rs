//! Durable key-value settings store.
//!
//! Everything the agent persists — the session token, the organization
//! id, recently watched folders, the upload configuration — goes
//! through one flat string-keyed map. Callers hold a `Settings` facade
//! over an injected `SettingsStore` implementation rather than a
//! reference to any concrete file, so tests swap in `MemoryStore`.
//!
//! Writes are last-writer-wins per key; there are no cross-key
//! transactions.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::upload::UploadConfig;

/// Application name used for config/data directory paths
const APP_NAME: &str = "tether";

/// Settings file name in the config directory
const SETTINGS_FILE: &str = "settings.json";

/// Maximum number of remembered watch directories
const MAX_RECENT_DIRS: usize = 5;

// Store keys. The names match the wire/settings contract of the
// desktop app, so an existing settings file keeps working.
pub const KEY_TOKEN: &str = "token";
pub const KEY_ORGANIZATION_ID: &str = "organization_id";
pub const KEY_RECENT_DIRS: &str = "recentDirs";
pub const KEY_UPLOAD_CONFIG: &str = "uploadConfig";

/// String-keyed JSON value store.
pub trait SettingsStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;
    fn set(&self, key: &str, value: Value) -> Result<()>;
    fn delete(&self, key: &str) -> Result<()>;
}

/// Settings persisted as a single JSON object on disk, flushed on every
/// write. A missing or unparseable file degrades to an empty map.
pub struct JsonFileStore {
    path: PathBuf,
    map: Mutex<Map<String, Value>>,
}

impl JsonFileStore {
    /// Open the store at the default location
    /// (`<config_dir>/tether/settings.json`).
    pub fn open_default() -> Result<Self> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Self::open(config_dir.join(APP_NAME).join(SETTINGS_FILE))
    }

    pub fn open(path: PathBuf) -> Result<Self> {
        let map = if path.exists() {
            match std::fs::read_to_string(&path) {
                Ok(contents) => match serde_json::from_str::<Map<String, Value>>(&contents) {
                    Ok(map) => map,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Settings file unparseable, starting empty");
                        Map::new()
                    }
                },
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Settings file unreadable, starting empty");
                    Map::new()
                }
            }
        } else {
            Map::new()
        };

        Ok(Self {
            path,
            map: Mutex::new(map),
        })
    }

    fn flush(&self, map: &Map<String, Value>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let contents = serde_json::to_string_pretty(&Value::Object(map.clone()))?;
        std::fs::write(&self.path, contents)
            .with_context(|| format!("Failed to write {}", self.path.display()))?;
        Ok(())
    }
}

impl SettingsStore for JsonFileStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.map.lock().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        let mut map = self
            .map
            .lock()
            .map_err(|_| anyhow::anyhow!("Settings store poisoned"))?;
        map.insert(key.to_string(), value);
        self.flush(&map)
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut map = self
            .map
            .lock()
            .map_err(|_| anyhow::anyhow!("Settings store poisoned"))?;
        if map.remove(key).is_some() {
            self.flush(&map)?;
        }
        Ok(())
    }
}

/// In-memory store for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryStore {
    map: Mutex<Map<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemoryStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.map.lock().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        let mut map = self
            .map
            .lock()
            .map_err(|_| anyhow::anyhow!("Settings store poisoned"))?;
        map.insert(key.to_string(), value);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut map = self
            .map
            .lock()
            .map_err(|_| anyhow::anyhow!("Settings store poisoned"))?;
        map.remove(key);
        Ok(())
    }
}

/// Typed facade over the raw key-value map.
/// Clone is cheap - the underlying store is shared via Arc.
#[derive(Clone)]
pub struct Settings {
    store: Arc<dyn SettingsStore>,
}

impl Settings {
    pub fn new(store: Arc<dyn SettingsStore>) -> Self {
        Self { store }
    }

    fn get_typed<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.store.get(key)?;
        match serde_json::from_value(value) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                debug!(key, error = %e, "Stored value has unexpected shape");
                None
            }
        }
    }

    fn set_typed<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        self.store.set(key, serde_json::to_value(value)?)
    }

    pub fn token(&self) -> Option<String> {
        self.get_typed(KEY_TOKEN)
    }

    pub fn set_token(&self, token: &str) -> Result<()> {
        self.set_typed(KEY_TOKEN, &token)
    }

    pub fn delete_token(&self) -> Result<()> {
        self.store.delete(KEY_TOKEN)
    }

    pub fn organization_id(&self) -> Option<String> {
        self.get_typed(KEY_ORGANIZATION_ID)
    }

    pub fn set_organization_id(&self, org_id: &str) -> Result<()> {
        self.set_typed(KEY_ORGANIZATION_ID, &org_id)
    }

    pub fn delete_organization_id(&self) -> Result<()> {
        self.store.delete(KEY_ORGANIZATION_ID)
    }

    pub fn recent_dirs(&self) -> Vec<String> {
        self.get_typed(KEY_RECENT_DIRS).unwrap_or_default()
    }

    /// Remember a watched directory: most-recent-first, deduplicated,
    /// capped at `MAX_RECENT_DIRS` entries.
    pub fn push_recent_dir(&self, dir: &str) -> Result<()> {
        let mut dirs = self.recent_dirs();
        dirs.retain(|d| d != dir);
        dirs.insert(0, dir.to_string());
        dirs.truncate(MAX_RECENT_DIRS);
        self.set_typed(KEY_RECENT_DIRS, &dirs)
    }

    pub fn upload_config(&self) -> UploadConfig {
        self.get_typed(KEY_UPLOAD_CONFIG).unwrap_or_default()
    }

    pub fn set_upload_config(&self, config: &UploadConfig) -> Result<()> {
        self.set_typed(KEY_UPLOAD_CONFIG, config)
    }
}

// ============================================================================
// Tests
// ============================================================================
