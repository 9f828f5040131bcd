// SPDX-License-Identifier: GPL-3.0-only

//! Built-in frame sources: a synthetic test pattern and a replayed still image

use super::frame_loop::{CaptureLoopController, LoopAction, sleep_until};
use super::{CaptureConfig, CaptureSession, FrameSource};
use crate::config::{CameraFacing, ContentScale, FpsRange};
use crate::errors::CaptureError;
use crate::pipeline::{FrameSubmitter, RawFrame, Rotation};
use image::imageops::{self, FilterType};
use image::{DynamicImage, RgbaImage};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use tracing::{debug, info};

/// Tracks frames handed to the pipeline and not yet released
#[derive(Debug, Clone, Default)]
struct Outstanding(Arc<AtomicUsize>);

impl Outstanding {
    fn lend(&self, frame: RawFrame) -> RawFrame {
        self.0.fetch_add(1, Ordering::SeqCst);
        let counter = Arc::clone(&self.0);
        frame.with_release(move || {
            counter.fetch_sub(1, Ordering::SeqCst);
        })
    }

    fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// Paced producer loop shared by the built-in sources
fn spawn_paced<F>(
    name: &str,
    config: &CaptureConfig,
    submitter: FrameSubmitter,
    mut next_frame: F,
) -> Result<CaptureSession, CaptureError>
where
    F: FnMut(u64) -> RawFrame + Send + 'static,
{
    let interval = config.frame_interval();
    let mut index = 0u64;
    let mut deadline = Instant::now();

    let controller = CaptureLoopController::start(name, move |stop| {
        if submitter.is_closed() {
            return LoopAction::Stop;
        }
        submitter.submit(next_frame(index));
        index += 1;

        deadline += interval;
        // Don't try to catch up after a stall
        let now = Instant::now();
        if deadline < now {
            deadline = now;
        }
        if sleep_until(deadline, stop) {
            LoopAction::Continue
        } else {
            LoopAction::Stop
        }
    })
    .map_err(|e| CaptureError::Open(format!("failed to spawn capture thread: {}", e)))?;

    Ok(CaptureSession::new(*config, controller))
}

/// Moving colour gradient; stands in for camera hardware
#[derive(Debug, Clone)]
pub struct TestPatternSource {
    front_ranges: Vec<FpsRange>,
    back_ranges: Vec<FpsRange>,
    rotation: Rotation,
    outstanding: Outstanding,
}

impl TestPatternSource {
    pub fn new() -> Self {
        Self {
            front_ranges: vec![FpsRange::new(15, 15), FpsRange::new(30, 30)],
            back_ranges: vec![
                FpsRange::new(15, 15),
                FpsRange::new(15, 30),
                FpsRange::new(30, 30),
            ],
            rotation: Rotation::None,
            outstanding: Outstanding::default(),
        }
    }

    /// Replace the ranges offered for one facing
    pub fn with_fps_ranges(mut self, facing: CameraFacing, ranges: Vec<FpsRange>) -> Self {
        match facing {
            CameraFacing::Front => self.front_ranges = ranges,
            CameraFacing::Back => self.back_ranges = ranges,
        }
        self
    }

    /// Sensor rotation reported with every frame
    pub fn with_rotation(mut self, rotation: Rotation) -> Self {
        self.rotation = rotation;
        self
    }

    /// Frames produced and not yet released by the pipeline
    pub fn outstanding_frames(&self) -> usize {
        self.outstanding.count()
    }

    fn render(width: u32, height: u32, facing: CameraFacing, index: u64) -> Vec<u8> {
        let shift = (index % 256) as u32;
        let blue = match facing {
            CameraFacing::Front => 64,
            CameraFacing::Back => 192,
        };
        let mut data = Vec::with_capacity(width as usize * height as usize * 4);
        for y in 0..height {
            for x in 0..width {
                data.extend_from_slice(&[
                    ((x + shift) % 256) as u8,
                    ((y + shift) % 256) as u8,
                    blue,
                    255,
                ]);
            }
        }
        data
    }
}

impl Default for TestPatternSource {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSource for TestPatternSource {
    fn name(&self) -> &str {
        "test-pattern"
    }

    fn available_fps_ranges(&self, facing: CameraFacing) -> Vec<FpsRange> {
        match facing {
            CameraFacing::Front => self.front_ranges.clone(),
            CameraFacing::Back => self.back_ranges.clone(),
        }
    }

    fn start(
        &self,
        config: &CaptureConfig,
        submitter: FrameSubmitter,
    ) -> Result<CaptureSession, CaptureError> {
        let (width, height) = (config.resolution.width, config.resolution.height);
        if width == 0 || height == 0 {
            return Err(CaptureError::Unsupported(format!(
                "resolution {}",
                config.resolution
            )));
        }

        info!(
            resolution = %config.resolution,
            facing = %config.facing,
            fps = ?config.fps_range,
            "Starting test pattern capture"
        );

        let facing = config.facing;
        let rotation = self.rotation;
        let outstanding = self.outstanding.clone();
        spawn_paced("test-pattern", config, submitter, move |index| {
            let data = Self::render(width, height, facing, index);
            outstanding.lend(RawFrame::new(width, height, data, rotation))
        })
    }
}

/// Replays one decoded image file at the configured rate
#[derive(Debug, Clone)]
pub struct StillImageSource {
    path: PathBuf,
    image: Arc<DynamicImage>,
    fps_ranges: Vec<FpsRange>,
    outstanding: Outstanding,
}

impl StillImageSource {
    /// Decode the image once
    pub fn open(path: &Path) -> Result<Self, CaptureError> {
        info!(path = %path.display(), "Loading image file");

        let image = image::open(path).map_err(|e| {
            CaptureError::Open(format!("failed to load image '{}': {}", path.display(), e))
        })?;

        info!(width = image.width(), height = image.height(), "Image loaded successfully");

        Ok(Self {
            path: path.to_path_buf(),
            image: Arc::new(image),
            fps_ranges: vec![FpsRange::new(1, 1), FpsRange::new(15, 15), FpsRange::new(30, 30)],
            outstanding: Outstanding::default(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn outstanding_frames(&self) -> usize {
        self.outstanding.count()
    }

    /// Scale to exactly `width`x`height`; `Fit` letterboxes on black
    fn scaled(&self, width: u32, height: u32, scale: ContentScale) -> RgbaImage {
        match scale {
            ContentScale::Crop => self
                .image
                .resize_to_fill(width, height, FilterType::Triangle)
                .to_rgba8(),
            ContentScale::Fit => {
                let fitted = self.image.resize(width, height, FilterType::Triangle).to_rgba8();
                let mut canvas = RgbaImage::from_pixel(width, height, image::Rgba([0, 0, 0, 255]));
                let x = (width - fitted.width()) / 2;
                let y = (height - fitted.height()) / 2;
                imageops::overlay(&mut canvas, &fitted, i64::from(x), i64::from(y));
                canvas
            }
        }
    }
}

impl FrameSource for StillImageSource {
    fn name(&self) -> &str {
        "still-image"
    }

    /// The same ranges regardless of facing
    fn available_fps_ranges(&self, _facing: CameraFacing) -> Vec<FpsRange> {
        self.fps_ranges.clone()
    }

    fn start(
        &self,
        config: &CaptureConfig,
        submitter: FrameSubmitter,
    ) -> Result<CaptureSession, CaptureError> {
        let (width, height) = (config.resolution.width, config.resolution.height);
        if width == 0 || height == 0 {
            return Err(CaptureError::Unsupported(format!(
                "resolution {}",
                config.resolution
            )));
        }

        let frame = self.scaled(width, height, config.content_scale).into_raw();
        debug!(
            path = %self.path.display(),
            resolution = %config.resolution,
            scale = ?config.content_scale,
            "Prepared still frame"
        );

        let outstanding = self.outstanding.clone();
        spawn_paced("still-image", config, submitter, move |_| {
            outstanding.lend(RawFrame::new(width, height, frame.clone(), Rotation::None))
        })
    }
}
