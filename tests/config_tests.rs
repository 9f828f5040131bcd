// SPDX-License-Identifier: GPL-3.0-only

//! Integration tests for settings records and their persistence

use std::path::PathBuf;
use std::sync::Arc;
use wscam::config::{CameraFacing, CameraSettings, SettingsRecord, ServerSettings};
use wscam::settings::SettingsStore;
use wscam::storage::{JsonFileBackend, SettingsBackend};

fn temp_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("wscam-config-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

#[test]
fn test_server_settings_round_trip() {
    let settings = ServerSettings {
        port: 8080,
        listen_on_all_interfaces: false,
    };

    let json = settings.to_json().unwrap();
    assert_eq!(ServerSettings::from_json(&json).unwrap(), settings);
}

#[test]
fn test_corrupt_server_settings_default() {
    for corrupt in ["", "{", "null", "{\"port\":\"eighty\"}", "{\"port\":0}"] {
        assert_eq!(
            ServerSettings::from_json_or_default(corrupt),
            ServerSettings::default(),
            "record {:?} should fall back to defaults",
            corrupt
        );
    }
}

#[test]
fn test_defaults_match_documented_values() {
    let server = ServerSettings::default();
    assert_eq!(server.port, 8080);
    assert!(!server.listen_on_all_interfaces);

    let camera = CameraSettings::default();
    assert_eq!(camera.resolution.to_string(), "640x480");
    assert_eq!(camera.fps_range_front.to_string(), "30-30");
    assert_eq!(camera.fps_range_back.to_string(), "30-30");
    assert_eq!(camera.quality, 85);
    assert_eq!(camera.facing, CameraFacing::Back);
    assert!(!camera.rotate_image);
}

#[tokio::test]
async fn test_file_store_persists_across_reopen() {
    let dir = temp_dir();
    let backend: Arc<dyn SettingsBackend> = Arc::new(JsonFileBackend::new(&dir));

    let store = SettingsStore::<CameraSettings>::open(Arc::clone(&backend))
        .await
        .unwrap();
    store
        .update(|old| CameraSettings {
            facing: CameraFacing::Front,
            quality: 60,
            ..old.clone()
        })
        .await
        .unwrap();
    drop(store);

    let reopened = SettingsStore::<CameraSettings>::open(backend).await.unwrap();
    assert_eq!(reopened.get().facing, CameraFacing::Front);
    assert_eq!(reopened.get().quality, 60);

    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn test_file_store_recovers_from_corrupt_file() {
    let dir = temp_dir();
    std::fs::write(dir.join("server_settings.json"), "not json at all").unwrap();

    let store = SettingsStore::<ServerSettings>::open(Arc::new(JsonFileBackend::new(&dir)))
        .await
        .unwrap();
    assert_eq!(store.get(), ServerSettings::default());

    let _ = std::fs::remove_dir_all(dir);
}
