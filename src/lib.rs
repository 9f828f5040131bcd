// SPDX-License-Identifier: GPL-3.0-only

//! wscam - live camera frames pushed to local network clients over WebSocket
//!
//! # Architecture
//!
//! - [`server`]: push-only WebSocket broadcast server and its state machine
//! - [`lifecycle`]: start/stop sequencing, bind address resolution, keep-alive
//! - [`pipeline`]: latest-wins raw frame to JPEG broadcast lane
//! - [`capture`]: frame sources and their capture threads
//! - [`reconciler`]: rebuilds the capture path when camera settings change
//! - [`supervisor`]: reconnecting control channel to the server component
//! - [`config`], [`settings`], [`storage`]: persisted settings records
//!
//! ```text
//! FrameSource ──▶ FramePipeline ──▶ ControlChannelSupervisor ──▶ BroadcastServer ──▶ clients
//!      ▲                ▲                                              ▲
//!      └── ConfigReconciler ◀── CameraSettings    ServerSettings ──▶ ServerLifecycleManager
//! ```

pub mod capture;
pub mod config;
pub mod constants;
pub mod errors;
pub mod lifecycle;
pub mod pipeline;
pub mod reconciler;
pub mod server;
pub mod settings;
pub mod storage;
pub mod supervisor;

// Re-export commonly used types
pub use config::{CameraFacing, CameraSettings, ContentScale, FpsRange, Resolution, ServerSettings};
pub use errors::{ServerError, ServerResult};
pub use lifecycle::ServerLifecycleManager;
pub use pipeline::{FramePipeline, RawFrame};
pub use reconciler::ConfigReconciler;
pub use server::{BroadcastServer, ServerInfo, ServerState};
pub use settings::SettingsStore;
pub use supervisor::{ControlChannelSupervisor, ServerControl};
