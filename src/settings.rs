// SPDX-License-Identifier: GPL-3.0-only

//! Reactive settings store
//!
//! A [`SettingsStore`] holds the latest value of one settings record and
//! offers read-latest, atomic read-modify-write and change subscription.
//! Readers always get whole immutable snapshots; writers are serialised so no
//! update is lost when several run concurrently.

use crate::config::SettingsRecord;
use crate::errors::SettingsError;
use crate::storage::SettingsBackend;
use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

/// Reactive store for a single settings record
pub struct SettingsStore<T: SettingsRecord> {
    value: watch::Sender<T>,
    backend: Arc<dyn SettingsBackend>,
    write_lock: Mutex<()>,
}

impl<T: SettingsRecord> SettingsStore<T> {
    /// Open the store, loading the persisted record
    ///
    /// A missing record yields the default. A corrupt or invalid record also
    /// yields the default; only backend I/O failures are returned.
    pub async fn open(backend: Arc<dyn SettingsBackend>) -> Result<Self, SettingsError> {
        let loader = Arc::clone(&backend);
        let stored = tokio::task::spawn_blocking(move || loader.load(T::KEY))
            .await
            .map_err(|e| SettingsError::Storage(e.to_string()))??;

        let value = match stored {
            Some(json) => T::from_json_or_default(&json),
            None => {
                debug!(key = T::KEY, "No stored settings, using defaults");
                T::default()
            }
        };

        Ok(Self::with_value(backend, value))
    }

    /// Create a store around a known value without touching the backend
    pub fn with_value(backend: Arc<dyn SettingsBackend>, value: T) -> Self {
        let (tx, _) = watch::channel(value);
        Self {
            value: tx,
            backend,
            write_lock: Mutex::new(()),
        }
    }

    /// Latest snapshot
    pub fn get(&self) -> T {
        self.value.borrow().clone()
    }

    /// Subscribe to changes; the receiver starts at the current value
    pub fn watch(&self) -> watch::Receiver<T> {
        self.value.subscribe()
    }

    /// Atomically replace the record with `transform(latest)`
    ///
    /// The new record is validated and persisted before it is published. If
    /// the transform produces an equal record nothing is written.
    pub async fn update<F>(&self, transform: F) -> Result<T, SettingsError>
    where
        F: FnOnce(&T) -> T,
    {
        let _guard = self.write_lock.lock().await;

        let old = self.get();
        let new = transform(&old);
        if new == old {
            return Ok(new);
        }
        new.validate()?;

        let json = new.to_json()?;
        let backend = Arc::clone(&self.backend);
        tokio::task::spawn_blocking(move || backend.store(T::KEY, &json))
            .await
            .map_err(|e| SettingsError::Storage(e.to_string()))??;

        self.value.send_replace(new.clone());
        info!(key = T::KEY, "Settings updated");
        Ok(new)
    }

    /// Re-read the backend and publish the stored value if it changed
    pub async fn reload(&self) -> Result<T, SettingsError> {
        let _guard = self.write_lock.lock().await;
        let backend = Arc::clone(&self.backend);
        let stored = tokio::task::spawn_blocking(move || backend.load(T::KEY))
            .await
            .map_err(|e| SettingsError::Storage(e.to_string()))??;
        let value = stored
            .map(|json| T::from_json_or_default(&json))
            .unwrap_or_default();
        self.value.send_if_modified(|current| {
            if *current == value {
                false
            } else {
                warn!(key = T::KEY, "Settings changed outside the store");
                *current = value.clone();
                true
            }
        });
        Ok(value)
    }
}
