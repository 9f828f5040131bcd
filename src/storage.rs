// SPDX-License-Identifier: GPL-3.0-only

//! Storage backends for persisted settings records
//!
//! Backends are synchronous; the settings store runs them on the blocking
//! pool.

use crate::errors::SettingsError;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

/// Raw record storage keyed by record name
pub trait SettingsBackend: Send + Sync + 'static {
    /// Load the stored JSON for `key`, `None` when nothing was stored yet
    fn load(&self, key: &str) -> Result<Option<String>, SettingsError>;

    /// Replace the stored JSON for `key`
    fn store(&self, key: &str, json: &str) -> Result<(), SettingsError>;
}

/// Default settings directory (`$XDG_CONFIG_HOME/wscam` on Linux)
pub fn default_settings_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("wscam")
}

/// One `<key>.json` file per record inside a directory
#[derive(Debug, Clone)]
pub struct JsonFileBackend {
    dir: PathBuf,
}

impl JsonFileBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }
}

impl Default for JsonFileBackend {
    fn default() -> Self {
        Self::new(default_settings_dir())
    }
}

impl SettingsBackend for JsonFileBackend {
    fn load(&self, key: &str) -> Result<Option<String>, SettingsError> {
        let path = self.path_for(key);
        match std::fs::read_to_string(&path) {
            Ok(json) => {
                debug!(path = %path.display(), "Loaded settings file");
                Ok(Some(json))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn store(&self, key: &str, json: &str) -> Result<(), SettingsError> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(key);
        // Write then rename so readers never see a half-written record
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)?;
        debug!(path = %path.display(), "Saved settings file");
        Ok(())
    }
}

/// In-memory storage for tests and ephemeral runs
#[derive(Debug, Default)]
pub struct MemoryBackend {
    records: Mutex<std::collections::HashMap<String, String>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a raw record, e.g. to simulate a corrupted store
    pub fn with_record(self, key: &str, json: &str) -> Self {
        self.lock().insert(key.to_string(), json.to_string());
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, std::collections::HashMap<String, String>> {
        // A poisoned map still holds complete records
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl SettingsBackend for MemoryBackend {
    fn load(&self, key: &str) -> Result<Option<String>, SettingsError> {
        Ok(self.lock().get(key).cloned())
    }

    fn store(&self, key: &str, json: &str) -> Result<(), SettingsError> {
        self.lock().insert(key.to_string(), json.to_string());
        Ok(())
    }
}
