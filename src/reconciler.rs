// SPDX-License-Identifier: GPL-3.0-only

//! Camera settings reconciliation
//!
//! Every `CameraSettings` change rebuilds the capture configuration, restarts
//! the frame source if the capture itself changed and re-applies encode
//! parameters to the pipeline. The pipeline counts as not ready from the
//! moment a change is seen until the new configuration is loaded. The
//! broadcast server is never touched.

use crate::capture::{CaptureConfig, CaptureSession, FrameSource};
use crate::config::{CameraSettings, FpsRange};
use crate::pipeline::{EncodeParams, FramePipeline};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Capture request for `settings` given the ranges the facing offers
///
/// The selected range is only kept when it is offered; otherwise, and always
/// when nothing is offered, the frame rate is left unconstrained.
pub fn capture_config(settings: &CameraSettings, available: &[FpsRange]) -> CaptureConfig {
    let selected = settings.selected_fps_range();
    CaptureConfig {
        resolution: settings.resolution,
        facing: settings.facing,
        fps_range: available.contains(&selected).then_some(selected),
        content_scale: settings.content_scale,
    }
}

pub fn encode_params(settings: &CameraSettings) -> EncodeParams {
    EncodeParams {
        quality: settings.quality,
        rotate: settings.rotate_image,
    }
}

/// Background task keeping the capture path in line with camera settings
pub struct ConfigReconciler {
    ready: watch::Receiver<bool>,
    config: watch::Receiver<Option<CaptureConfig>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConfigReconciler {
    /// Reconcile once for the current settings, then on every change
    pub fn spawn(
        settings: watch::Receiver<CameraSettings>,
        source: Arc<dyn FrameSource>,
        pipeline: Arc<FramePipeline>,
    ) -> Self {
        let (ready_tx, ready) = watch::channel(false);
        let (config_tx, config) = watch::channel(None);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run(
            settings,
            source,
            pipeline,
            ready_tx,
            config_tx,
            cancel.clone(),
        ));

        Self {
            ready,
            config,
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    pub fn ready(&self) -> watch::Receiver<bool> {
        self.ready.clone()
    }

    /// Wait until the latest configuration is loaded
    pub async fn wait_ready(&self) {
        let mut ready = self.ready.clone();
        let _ = ready.wait_for(|ready| *ready).await;
    }

    pub fn current_config(&self) -> Option<CaptureConfig> {
        *self.config.borrow()
    }

    pub fn configs(&self) -> watch::Receiver<Option<CaptureConfig>> {
        self.config.clone()
    }

    /// Stop reacting to changes and stop the capture session
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            warn!(error = %e, "Reconciler task ended abnormally");
        }
    }
}

impl Drop for ConfigReconciler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run(
    mut settings: watch::Receiver<CameraSettings>,
    source: Arc<dyn FrameSource>,
    pipeline: Arc<FramePipeline>,
    ready: watch::Sender<bool>,
    config: watch::Sender<Option<CaptureConfig>>,
    cancel: CancellationToken,
) {
    let mut session: Option<CaptureSession> = None;

    loop {
        let current = settings.borrow_and_update().clone();
        ready.send_replace(false);

        session = reconcile(session, &current, &source, &pipeline).await;
        let loaded = session.as_ref().map(|s| *s.config());
        config.send_replace(loaded);
        ready.send_replace(loaded.is_some());

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            changed = settings.changed() => {
                if changed.is_err() {
                    debug!("Camera settings closed");
                    break;
                }
            }
        }
    }

    ready.send_replace(false);
    if let Some(session) = session {
        stop_session(session).await;
    }
    debug!("Reconciler stopped");
}

async fn reconcile(
    session: Option<CaptureSession>,
    settings: &CameraSettings,
    source: &Arc<dyn FrameSource>,
    pipeline: &Arc<FramePipeline>,
) -> Option<CaptureSession> {
    let available = source.available_fps_ranges(settings.facing);
    let target = capture_config(settings, &available);

    if target.fps_range.is_none() {
        warn!(
            facing = %settings.facing,
            selected = %settings.selected_fps_range(),
            offered = available.len(),
            "Selected fps range not offered, leaving frame rate unconstrained"
        );
    }

    if let Some(current) = session {
        // Only quality or rotation changed: keep capturing
        if *current.config() == target && current.is_running() {
            let generation = pipeline.reconfigure(encode_params(settings));
            debug!(generation, "Encode parameters updated, capture unchanged");
            return Some(current);
        }
        stop_session(current).await;
    }

    let generation = pipeline.reconfigure(encode_params(settings));

    let submitter = pipeline.submitter();
    let source = Arc::clone(source);
    let started = tokio::task::spawn_blocking(move || source.start(&target, submitter)).await;

    match started {
        Ok(Ok(session)) => {
            info!(
                generation,
                resolution = %target.resolution,
                facing = %target.facing,
                fps = ?target.fps_range,
                "Capture configuration loaded"
            );
            Some(session)
        }
        Ok(Err(e)) => {
            error!(error = %e, "Failed to start capture");
            None
        }
        Err(e) => {
            error!(error = %e, "Capture start task failed");
            None
        }
    }
}

/// Join the capture thread off the runtime
async fn stop_session(session: CaptureSession) {
    if let Err(e) = tokio::task::spawn_blocking(move || session.stop()).await {
        warn!(error = %e, "Failed to stop capture session");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CameraFacing;

    #[test]
    fn test_offered_range_is_kept() {
        let settings = CameraSettings::default();
        let config = capture_config(&settings, &[FpsRange::new(15, 15), FpsRange::new(30, 30)]);
        assert_eq!(config.fps_range, Some(FpsRange::new(30, 30)));
    }

    #[test]
    fn test_unoffered_range_is_dropped() {
        let settings = CameraSettings {
            fps_range_back: FpsRange::new(60, 60),
            ..CameraSettings::default()
        };
        let config = capture_config(&settings, &[FpsRange::new(30, 30)]);
        assert_eq!(config.fps_range, None);
    }

    #[test]
    fn test_no_ranges_means_unconstrained() {
        let settings = CameraSettings {
            facing: CameraFacing::Front,
            ..CameraSettings::default()
        };
        let config = capture_config(&settings, &[]);
        assert_eq!(config.fps_range, None);
        assert_eq!(config.facing, CameraFacing::Front);
    }

    #[test]
    fn test_encode_params_follow_settings() {
        let settings = CameraSettings {
            quality: 40,
            rotate_image: true,
            ..CameraSettings::default()
        };
        assert_eq!(
            encode_params(&settings),
            EncodeParams {
                quality: 40,
                rotate: true
            }
        );
    }
}
