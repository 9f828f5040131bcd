// SPDX-License-Identifier: GPL-3.0-only

//! End-to-end tests: frame source, reconciler, pipeline and server together

use futures::StreamExt;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use wscam::capture::{FrameSource, TestPatternSource};
use wscam::config::{CameraFacing, CameraSettings, FpsRange, Resolution, ServerSettings};
use wscam::lifecycle::{FixedResolver, LogKeepAlive, ServerLifecycleManager};
use wscam::pipeline::{FramePipeline, FrameSink, JpegFrameEncoder};
use wscam::reconciler::{ConfigReconciler, encode_params};
use wscam::settings::SettingsStore;
use wscam::storage::MemoryBackend;

const WAIT: Duration = Duration::from_secs(10);

fn small_camera() -> CameraSettings {
    CameraSettings {
        resolution: Resolution::new(64, 48),
        ..CameraSettings::default()
    }
}

struct NullSink;

impl FrameSink for NullSink {
    fn broadcast(&self, _frame: bytes::Bytes) {}
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_frames_reach_websocket_client() {
    let server_settings = SettingsStore::with_value(
        Arc::new(MemoryBackend::new()),
        ServerSettings {
            port: 0,
            listen_on_all_interfaces: false,
        },
    );
    let manager = Arc::new(ServerLifecycleManager::new(
        Arc::new(server_settings),
        Arc::new(FixedResolver(Some(IpAddr::V4(Ipv4Addr::LOCALHOST)))),
        Arc::new(LogKeepAlive),
    ));
    let camera = SettingsStore::with_value(Arc::new(MemoryBackend::new()), small_camera());
    let source = Arc::new(TestPatternSource::new());

    let pipeline = Arc::new(FramePipeline::start(
        Arc::new(JpegFrameEncoder),
        manager.clone(),
        encode_params(&camera.get()),
    ));
    let reconciler = ConfigReconciler::spawn(camera.watch(), source.clone(), Arc::clone(&pipeline));
    timeout(WAIT, reconciler.wait_ready()).await.unwrap();

    let info = manager.start().await.unwrap();
    let (mut client, _) = tokio_tungstenite::connect_async(info.url()).await.unwrap();

    let message = timeout(WAIT, client.next()).await.unwrap().unwrap().unwrap();
    let data = message.into_data();
    assert_eq!(&data[..2], &[0xFF, 0xD8]);
    let image = image::load_from_memory(&data).unwrap();
    assert_eq!((image.width(), image.height()), (64, 48));

    manager.stop().await.unwrap();
    reconciler.shutdown().await;
    pipeline.shutdown().await;

    // Every produced frame was handed back
    assert_eq!(source.outstanding_frames(), 0);
    assert!(pipeline.stats().broadcast >= 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_facing_without_ranges_drops_fps_constraint() {
    let source = Arc::new(
        TestPatternSource::new().with_fps_ranges(CameraFacing::Front, Vec::new()),
    );
    assert!(source.available_fps_ranges(CameraFacing::Front).is_empty());

    let camera = SettingsStore::with_value(Arc::new(MemoryBackend::new()), small_camera());
    let pipeline = Arc::new(FramePipeline::start(
        Arc::new(JpegFrameEncoder),
        Arc::new(NullSink),
        encode_params(&camera.get()),
    ));
    let reconciler = ConfigReconciler::spawn(camera.watch(), source.clone(), Arc::clone(&pipeline));
    timeout(WAIT, reconciler.wait_ready()).await.unwrap();

    let config = reconciler.current_config().unwrap();
    assert_eq!(config.facing, CameraFacing::Back);
    assert_eq!(config.fps_range, Some(FpsRange::new(30, 30)));
    let generation = pipeline.generation();

    camera
        .update(|old| CameraSettings {
            facing: CameraFacing::Front,
            ..old.clone()
        })
        .await
        .unwrap();

    let mut configs = reconciler.configs();
    let config = *timeout(
        WAIT,
        configs.wait_for(|c| c.is_some_and(|c| c.facing == CameraFacing::Front)),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(config.unwrap().fps_range, None);
    assert!(pipeline.generation() > generation);
    timeout(WAIT, reconciler.wait_ready()).await.unwrap();
    assert!(reconciler.is_ready());

    reconciler.shutdown().await;
    pipeline.shutdown().await;
    assert_eq!(source.outstanding_frames(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_quality_change_keeps_capture_session() {
    let source = Arc::new(TestPatternSource::new());
    let camera = SettingsStore::with_value(Arc::new(MemoryBackend::new()), small_camera());
    let pipeline = Arc::new(FramePipeline::start(
        Arc::new(JpegFrameEncoder),
        Arc::new(NullSink),
        encode_params(&camera.get()),
    ));
    let reconciler = ConfigReconciler::spawn(camera.watch(), source.clone(), Arc::clone(&pipeline));
    timeout(WAIT, reconciler.wait_ready()).await.unwrap();
    let before = reconciler.current_config();

    camera
        .update(|old| CameraSettings {
            quality: 30,
            ..old.clone()
        })
        .await
        .unwrap();

    timeout(WAIT, async {
        while pipeline.params().quality != 30 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(reconciler.current_config(), before);

    reconciler.shutdown().await;
    pipeline.shutdown().await;
}
