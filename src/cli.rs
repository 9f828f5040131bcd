// SPDX-License-Identifier: GPL-3.0-only

//! CLI commands
//!
//! - `serve`: run the broadcast server with a synthetic or still-image source
//! - `settings`: inspect and change persisted settings
//! - `receive`: a minimal client for checking what the server sends

use chrono::Local;
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_tungstenite::tungstenite::Message;
use wscam::capture::{FrameSource, StillImageSource, TestPatternSource};
use wscam::config::{
    CameraFacing, CameraSettings, ContentScale, FpsRange, Resolution, ServerSettings,
};
use wscam::lifecycle::{LogKeepAlive, RouteProbeResolver, ServerLifecycleManager};
use wscam::pipeline::{FramePipeline, JpegFrameEncoder};
use wscam::reconciler::{ConfigReconciler, encode_params};
use wscam::server::{ConnectionEvent, ServerState};
use wscam::settings::SettingsStore;
use wscam::storage::{JsonFileBackend, SettingsBackend, default_settings_dir};
use wscam::supervisor::{ControlChannelSupervisor, LocalConnector};

type CliResult = Result<(), Box<dyn std::error::Error>>;

fn backend(dir: Option<PathBuf>) -> Arc<dyn SettingsBackend> {
    Arc::new(JsonFileBackend::new(dir.unwrap_or_else(default_settings_dir)))
}

/// Camera settings fields given on the command line
pub struct CameraChanges {
    pub resolution: Option<Resolution>,
    pub fps_front: Option<FpsRange>,
    pub fps_back: Option<FpsRange>,
    pub quality: Option<u8>,
    pub facing: Option<CameraFacing>,
    pub rotate: Option<bool>,
    pub scale: Option<ContentScale>,
}

impl CameraChanges {
    fn apply(&self, old: &CameraSettings) -> CameraSettings {
        CameraSettings {
            resolution: self.resolution.unwrap_or(old.resolution),
            fps_range_front: self.fps_front.unwrap_or(old.fps_range_front),
            fps_range_back: self.fps_back.unwrap_or(old.fps_range_back),
            quality: self.quality.unwrap_or(old.quality),
            facing: self.facing.unwrap_or(old.facing),
            rotate_image: self.rotate.unwrap_or(old.rotate_image),
            content_scale: self.scale.unwrap_or(old.content_scale),
        }
    }
}

fn server_changes(
    port: Option<u16>,
    all_interfaces: Option<bool>,
) -> impl FnOnce(&ServerSettings) -> ServerSettings {
    move |old| ServerSettings {
        port: port.unwrap_or(old.port),
        listen_on_all_interfaces: all_interfaces.unwrap_or(old.listen_on_all_interfaces),
    }
}

/// Print both settings records as JSON
pub fn show_settings(dir: Option<PathBuf>) -> CliResult {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let backend = backend(dir);
        let server = SettingsStore::<ServerSettings>::open(Arc::clone(&backend)).await?;
        let camera = SettingsStore::<CameraSettings>::open(backend).await?;

        println!("Server settings:");
        println!("{}", serde_json::to_string_pretty(&server.get())?);
        if server.get().is_reserved_port() {
            println!("  (port {} is reserved and may need privileges)", server.get().port);
        }
        println!();
        println!("Camera settings:");
        println!("{}", serde_json::to_string_pretty(&camera.get())?);
        CliResult::Ok(())
    })
}

pub fn update_server_settings(
    dir: Option<PathBuf>,
    port: Option<u16>,
    all_interfaces: Option<bool>,
) -> CliResult {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let store = SettingsStore::<ServerSettings>::open(backend(dir)).await?;
        let updated = store.update(server_changes(port, all_interfaces)).await?;
        println!("{}", serde_json::to_string_pretty(&updated)?);
        CliResult::Ok(())
    })
}

pub fn update_camera_settings(dir: Option<PathBuf>, changes: CameraChanges) -> CliResult {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let store = SettingsStore::<CameraSettings>::open(backend(dir)).await?;
        let updated = store.update(|old| changes.apply(old)).await?;
        println!("{}", serde_json::to_string_pretty(&updated)?);
        CliResult::Ok(())
    })
}

/// Run the full stack until Ctrl+C
pub fn serve(
    dir: Option<PathBuf>,
    port: Option<u16>,
    all_interfaces: Option<bool>,
    image: Option<PathBuf>,
) -> CliResult {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let backend = backend(dir);
        let server_settings =
            Arc::new(SettingsStore::<ServerSettings>::open(Arc::clone(&backend)).await?);
        let camera_settings = Arc::new(SettingsStore::<CameraSettings>::open(backend).await?);

        if port.is_some() || all_interfaces.is_some() {
            server_settings
                .update(server_changes(port, all_interfaces))
                .await?;
        }

        let source: Arc<dyn FrameSource> = match image {
            Some(path) => Arc::new(StillImageSource::open(&path)?),
            None => Arc::new(TestPatternSource::new()),
        };

        let manager = Arc::new(ServerLifecycleManager::new(
            server_settings,
            Arc::new(RouteProbeResolver::new()),
            Arc::new(LogKeepAlive),
        ));
        let mut events = manager.server().subscribe_events();

        let supervisor = Arc::new(ControlChannelSupervisor::spawn(Arc::new(
            LocalConnector::new(Arc::clone(&manager)),
        )));
        supervisor.connect();

        let pipeline = Arc::new(FramePipeline::start(
            Arc::new(JpegFrameEncoder),
            supervisor.clone(),
            encode_params(&camera_settings.get()),
        ));
        let reconciler =
            ConfigReconciler::spawn(camera_settings.watch(), source, Arc::clone(&pipeline));

        let mut states = Box::pin(supervisor.server_state());
        tokio::spawn(async move {
            while let Some(state) = states.next().await {
                match state {
                    ServerState::Error(cause) => eprintln!("Error: {}", cause.user_message()),
                    other => println!("Server {}", other),
                }
            }
        });

        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                match event {
                    ConnectionEvent::Opened(client) => {
                        println!("Client connected: {}", client.remote_addr)
                    }
                    ConnectionEvent::Closed(client) => {
                        println!("Client disconnected: {}", client.remote_addr)
                    }
                    _ => {}
                }
            }
        });

        let control = supervisor
            .connected()
            .await
            .ok_or("control channel unavailable")?;
        reconciler.wait_ready().await;

        let started = control.start_server().await;
        if let Ok(info) = &started {
            println!("Streaming at {}", info.url());
            println!("Press Ctrl+C to stop");
            tokio::signal::ctrl_c().await?;
            println!();
        }

        let stopped = match supervisor.handle() {
            Some(control) => control.stop_server().await,
            None => Ok(()),
        };
        reconciler.shutdown().await;
        pipeline.shutdown().await;
        supervisor.shutdown().await;

        started?;
        stopped?;
        CliResult::Ok(())
    })
}

/// Connect to `url` and print one line per received frame
pub fn receive(url: &str, count: Option<u64>, output: Option<PathBuf>) -> CliResult {
    if let Some(dir) = &output {
        std::fs::create_dir_all(dir)?;
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let (mut ws, _) = tokio_tungstenite::connect_async(url).await?;
        println!("Connected to {}", url);

        let mut received = 0u64;
        while let Some(message) = ws.next().await {
            match message? {
                Message::Binary(frame) => {
                    received += 1;
                    println!(
                        "{}  frame {:>6}  {:>8} bytes",
                        Local::now().format("%H:%M:%S%.3f"),
                        received,
                        frame.len()
                    );
                    if let Some(dir) = &output {
                        std::fs::write(dir.join(format!("frame_{:06}.jpg", received)), &frame)?;
                    }
                    if count.is_some_and(|count| received >= count) {
                        break;
                    }
                }
                Message::Close(_) => {
                    println!("Server closed the connection");
                    break;
                }
                _ => {}
            }
        }

        let _ = ws.close(None).await;
        println!("Received {} frames", received);
        CliResult::Ok(())
    })
}
