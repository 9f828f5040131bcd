// SPDX-License-Identifier: GPL-3.0-only

//! Frame sources
//!
//! A [`FrameSource`] reports the frame-rate ranges each facing supports and
//! starts a [`CaptureSession`] that pushes [`RawFrame`](crate::pipeline::RawFrame)s
//! into a pipeline. Sessions produce on their own thread and stop when
//! stopped or dropped.

mod frame_loop;
mod sources;

pub use frame_loop::{CaptureLoopController, LoopAction, sleep_until};
pub use sources::{StillImageSource, TestPatternSource};

use crate::config::{CameraFacing, ContentScale, FpsRange, Resolution};
use crate::constants::AUTO_FRAME_RATE;
use crate::errors::CaptureError;
use crate::pipeline::FrameSubmitter;
use std::time::Duration;

/// Concrete capture request derived from camera settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConfig {
    pub resolution: Resolution,
    pub facing: CameraFacing,
    /// `None` leaves the frame rate unconstrained
    pub fps_range: Option<FpsRange>,
    pub content_scale: ContentScale,
}

impl CaptureConfig {
    /// Time between frames: the top of the fixed range, or the auto rate
    pub fn frame_interval(&self) -> Duration {
        let fps = self
            .fps_range
            .map(|range| range.upper)
            .filter(|fps| *fps > 0)
            .unwrap_or(AUTO_FRAME_RATE);
        Duration::from_secs(1) / fps
    }
}

/// Camera capability consumed by the reconciler
pub trait FrameSource: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Frame-rate ranges offered for `facing`; may be empty
    fn available_fps_ranges(&self, facing: CameraFacing) -> Vec<FpsRange>;

    /// Begin producing frames into `submitter`
    fn start(
        &self,
        config: &CaptureConfig,
        submitter: FrameSubmitter,
    ) -> Result<CaptureSession, CaptureError>;
}

/// A running capture bound to one configuration
pub struct CaptureSession {
    config: CaptureConfig,
    controller: CaptureLoopController,
}

impl CaptureSession {
    pub fn new(config: CaptureConfig, controller: CaptureLoopController) -> Self {
        Self { config, controller }
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.controller.is_running()
    }

    /// Stop producing and join the capture thread (blocking)
    pub fn stop(mut self) {
        self.controller.stop();
    }
}

impl std::fmt::Debug for CaptureSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureSession")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(fps_range: Option<FpsRange>) -> CaptureConfig {
        CaptureConfig {
            resolution: Resolution::default(),
            facing: CameraFacing::Back,
            fps_range,
            content_scale: ContentScale::Crop,
        }
    }

    #[test]
    fn test_frame_interval() {
        assert_eq!(
            config(Some(FpsRange::new(10, 20))).frame_interval(),
            Duration::from_millis(50)
        );
        assert_eq!(
            config(None).frame_interval(),
            Duration::from_secs(1) / AUTO_FRAME_RATE
        );
    }
}
