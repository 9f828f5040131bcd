// SPDX-License-Identifier: GPL-3.0-only

//! Raw frame to broadcast pipeline
//!
//! A single latest-wins lane: producers [`FrameSubmitter::submit`] raw frames
//! from any thread without blocking, one worker task encodes them on the
//! blocking pool and hands the result to a [`FrameSink`]. At most one frame is
//! encoded at a time and at most one waits behind it; a newer arrival replaces
//! the waiting frame, which is released on the spot.
//!
//! Every [`RawFrame`] runs its release hook exactly once when dropped, so
//! buffers are returned on every path: superseded, stale, failed or sent.

mod encode;

pub use encode::{EncodeParams, FrameEncoder, JpegFrameEncoder};

use crate::errors::EncodeError;
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Clockwise rotation reported by the sensor for a frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Rotation {
    #[default]
    None,
    Rotate90,
    Rotate180,
    Rotate270,
}

impl Rotation {
    /// Normalise an integer degree value; non-right angles map to `None`
    pub fn from_degrees(degrees: i32) -> Self {
        match degrees.rem_euclid(360) {
            90 => Rotation::Rotate90,
            180 => Rotation::Rotate180,
            270 => Rotation::Rotate270,
            _ => Rotation::None,
        }
    }

    pub fn degrees(&self) -> u32 {
        match self {
            Rotation::None => 0,
            Rotation::Rotate90 => 90,
            Rotation::Rotate180 => 180,
            Rotation::Rotate270 => 270,
        }
    }
}

type ReleaseHook = Box<dyn FnOnce() + Send>;

/// One uncompressed RGBA frame borrowed from a frame source
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    /// Tightly packed RGBA8 pixels
    pub data: Vec<u8>,
    pub rotation: Rotation,
    pub captured_at: Instant,
    release: Option<ReleaseHook>,
}

impl RawFrame {
    pub fn new(width: u32, height: u32, data: Vec<u8>, rotation: Rotation) -> Self {
        Self {
            width,
            height,
            data,
            rotation,
            captured_at: Instant::now(),
            release: None,
        }
    }

    /// Attach the hook that hands the buffer back to its source
    pub fn with_release(mut self, release: impl FnOnce() + Send + 'static) -> Self {
        self.release = Some(Box::new(release));
        self
    }
}

impl std::fmt::Debug for RawFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawFrame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.data.len())
            .field("rotation", &self.rotation)
            .finish()
    }
}

impl Drop for RawFrame {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// Compressed image ready to broadcast
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    /// Monotonic per pipeline; only used to spot stale frames
    pub seq: u64,
    pub data: Bytes,
}

/// Destination of encoded frames
///
/// Must not block; implementations hand the payload off and return.
pub trait FrameSink: Send + Sync + 'static {
    fn broadcast(&self, frame: Bytes);
}

/// Snapshot of pipeline counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub submitted: u64,
    pub encoded: u64,
    pub broadcast: u64,
    /// Superseded by a newer frame or made stale by a reconfiguration
    pub dropped: u64,
    /// Encoding faults
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    encoded: AtomicU64,
    broadcast: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
}

struct Pending {
    seq: u64,
    frame: RawFrame,
}

#[derive(Clone, Copy)]
struct Config {
    params: EncodeParams,
    generation: u64,
}

struct Lane {
    pending: Mutex<Option<Pending>>,
    notify: Notify,
    next_seq: AtomicU64,
    config: Mutex<Config>,
    counters: Counters,
    closed: CancellationToken,
}

impl Lane {
    fn pending(&self) -> MutexGuard<'_, Option<Pending>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn config(&self) -> Config {
        *self.config.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn submit(&self, frame: RawFrame) {
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        if self.closed.is_cancelled() {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            trace!("Pipeline closed, releasing frame");
            return;
        }

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let replaced = self.pending().replace(Pending { seq, frame });
        if let Some(old) = replaced {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            trace!(seq = old.seq, "Superseded pending frame");
            // Release outside the lock
            drop(old);
        }
        self.notify.notify_one();
    }

    fn take_pending(&self) -> Option<Pending> {
        self.pending().take()
    }
}

/// Cheap, cloneable producer handle
#[derive(Clone)]
pub struct FrameSubmitter {
    lane: Arc<Lane>,
}

impl FrameSubmitter {
    /// Queue a frame for encoding; never blocks, callable from any thread
    pub fn submit(&self, frame: RawFrame) {
        self.lane.submit(frame);
    }

    pub fn is_closed(&self) -> bool {
        self.lane.closed.is_cancelled()
    }
}

/// Latest-wins encode and broadcast lane
pub struct FramePipeline {
    lane: Arc<Lane>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl FramePipeline {
    /// Spawn the worker task on the current runtime
    pub fn start(
        encoder: Arc<dyn FrameEncoder>,
        sink: Arc<dyn FrameSink>,
        params: EncodeParams,
    ) -> Self {
        let lane = Arc::new(Lane {
            pending: Mutex::new(None),
            notify: Notify::new(),
            next_seq: AtomicU64::new(1),
            config: Mutex::new(Config {
                params,
                generation: 0,
            }),
            counters: Counters::default(),
            closed: CancellationToken::new(),
        });

        info!(quality = params.quality, rotate = params.rotate, "Starting frame pipeline");
        let worker = tokio::spawn(run_worker(Arc::clone(&lane), encoder, sink));

        Self {
            lane,
            worker: Mutex::new(Some(worker)),
        }
    }

    pub fn submitter(&self) -> FrameSubmitter {
        FrameSubmitter {
            lane: Arc::clone(&self.lane),
        }
    }

    pub fn submit(&self, frame: RawFrame) {
        self.lane.submit(frame);
    }

    /// Apply new encode parameters and return the new generation
    ///
    /// The waiting frame is released and a frame still being encoded under
    /// the old parameters is discarded when it completes.
    pub fn reconfigure(&self, params: EncodeParams) -> u64 {
        let generation = {
            let mut config = self.lane.config.lock().unwrap_or_else(|e| e.into_inner());
            config.params = params;
            config.generation += 1;
            config.generation
        };

        if let Some(stale) = self.lane.take_pending() {
            self.lane.counters.dropped.fetch_add(1, Ordering::Relaxed);
            drop(stale);
        }

        debug!(
            generation,
            quality = params.quality,
            rotate = params.rotate,
            "Pipeline reconfigured"
        );
        generation
    }

    pub fn params(&self) -> EncodeParams {
        self.lane.config().params
    }

    pub fn generation(&self) -> u64 {
        self.lane.config().generation
    }

    pub fn stats(&self) -> PipelineStats {
        let c = &self.lane.counters;
        PipelineStats {
            submitted: c.submitted.load(Ordering::Relaxed),
            encoded: c.encoded.load(Ordering::Relaxed),
            broadcast: c.broadcast.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
        }
    }

    /// Stop the worker and release any waiting frame
    pub async fn shutdown(&self) {
        self.lane.closed.cancel();
        let worker = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(worker) = worker
            && let Err(e) = worker.await
        {
            warn!(error = %e, "Pipeline worker ended abnormally");
        }
        if let Some(frame) = self.lane.take_pending() {
            self.lane.counters.dropped.fetch_add(1, Ordering::Relaxed);
            drop(frame);
        }
        info!(stats = ?self.stats(), "Frame pipeline stopped");
    }
}

impl Drop for FramePipeline {
    fn drop(&mut self) {
        self.lane.closed.cancel();
    }
}

async fn run_worker(lane: Arc<Lane>, encoder: Arc<dyn FrameEncoder>, sink: Arc<dyn FrameSink>) {
    debug!("Pipeline worker started");
    loop {
        tokio::select! {
            biased;
            _ = lane.closed.cancelled() => break,
            _ = lane.notify.notified() => {}
        }

        while let Some(Pending { seq, frame }) = lane.take_pending() {
            if lane.closed.is_cancelled() {
                lane.counters.dropped.fetch_add(1, Ordering::Relaxed);
                break;
            }

            let config = lane.config();
            match encode_frame(Arc::clone(&encoder), frame, config.params).await {
                Ok(data) => {
                    lane.counters.encoded.fetch_add(1, Ordering::Relaxed);
                    if lane.config().generation != config.generation {
                        lane.counters.dropped.fetch_add(1, Ordering::Relaxed);
                        trace!(seq, "Discarding frame encoded with outdated parameters");
                        continue;
                    }
                    if lane.pending().as_ref().is_some_and(|next| next.seq > seq) {
                        lane.counters.dropped.fetch_add(1, Ordering::Relaxed);
                        trace!(seq, "Discarding frame superseded while encoding");
                        continue;
                    }
                    let encoded = EncodedFrame {
                        seq,
                        data: Bytes::from(data),
                    };
                    trace!(seq = encoded.seq, bytes = encoded.data.len(), "Broadcasting frame");
                    sink.broadcast(encoded.data);
                    lane.counters.broadcast.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    lane.counters.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(seq, error = %e, "Frame encoding failed, skipping");
                }
            }
        }
    }
    debug!("Pipeline worker exiting");
}

/// Encode on the blocking pool; the frame is released there once encoded
async fn encode_frame(
    encoder: Arc<dyn FrameEncoder>,
    frame: RawFrame,
    params: EncodeParams,
) -> Result<Vec<u8>, EncodeError> {
    tokio::task::spawn_blocking(move || {
        let result = encoder.encode(&frame, &params);
        drop(frame);
        result
    })
    .await
    .map_err(|e| EncodeError::Task(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Encodes a frame as its first pixel byte
    struct TagEncoder;

    impl FrameEncoder for TagEncoder {
        fn encode(&self, frame: &RawFrame, _params: &EncodeParams) -> Result<Vec<u8>, EncodeError> {
            match frame.data.first() {
                Some(0xFF) => Err(EncodeError::Codec("poisoned frame".into())),
                Some(tag) => Ok(vec![*tag]),
                None => Err(EncodeError::InvalidFrame("empty".into())),
            }
        }
    }

    struct ChannelSink(mpsc::UnboundedSender<Bytes>);

    impl FrameSink for ChannelSink {
        fn broadcast(&self, frame: Bytes) {
            let _ = self.0.send(frame);
        }
    }

    fn tagged(tag: u8, released: &Arc<AtomicUsize>) -> RawFrame {
        let released = Arc::clone(released);
        RawFrame::new(1, 1, vec![tag, 0, 0, 255], Rotation::None).with_release(move || {
            released.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn pipeline() -> (FramePipeline, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let pipeline = FramePipeline::start(
            Arc::new(TagEncoder),
            Arc::new(ChannelSink(tx)),
            EncodeParams::default(),
        );
        (pipeline, rx)
    }

    #[tokio::test]
    async fn test_rapid_frames_only_newest_is_broadcast() {
        let released = Arc::new(AtomicUsize::new(0));
        let (pipeline, mut rx) = pipeline();

        // Both arrive before the worker gets to run
        pipeline.submit(tagged(1, &released));
        pipeline.submit(tagged(2, &released));
        assert_eq!(released.load(Ordering::SeqCst), 1);

        let sent = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&sent[..], &[2]);

        pipeline.shutdown().await;
        assert!(rx.try_recv().is_err());
        assert_eq!(released.load(Ordering::SeqCst), 2);

        let stats = pipeline.stats();
        assert_eq!(stats.submitted, 2);
        assert_eq!(stats.broadcast, 1);
        assert_eq!(stats.dropped, 1);
    }

    /// Tags like `TagEncoder` but takes its time about it
    struct SlowEncoder {
        started: Arc<AtomicUsize>,
    }

    impl FrameEncoder for SlowEncoder {
        fn encode(&self, frame: &RawFrame, params: &EncodeParams) -> Result<Vec<u8>, EncodeError> {
            self.started.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(300));
            TagEncoder.encode(frame, params)
        }
    }

    #[tokio::test]
    async fn test_frame_arriving_during_encode_supersedes_it() {
        let released = Arc::new(AtomicUsize::new(0));
        let started = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let pipeline = FramePipeline::start(
            Arc::new(SlowEncoder {
                started: Arc::clone(&started),
            }),
            Arc::new(ChannelSink(tx)),
            EncodeParams::default(),
        );

        pipeline.submit(tagged(1, &released));
        tokio::time::timeout(Duration::from_secs(5), async {
            while started.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        pipeline.submit(tagged(2, &released));

        let sent = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&sent[..], &[2]);

        pipeline.shutdown().await;
        assert!(rx.try_recv().is_err());
        assert_eq!(released.load(Ordering::SeqCst), 2);

        let stats = pipeline.stats();
        assert_eq!(stats.encoded, 2);
        assert_eq!(stats.broadcast, 1);
        assert_eq!(stats.dropped, 1);
    }

    #[tokio::test]
    async fn test_encode_failure_does_not_stop_pipeline() {
        let released = Arc::new(AtomicUsize::new(0));
        let (pipeline, mut rx) = pipeline();

        pipeline.submit(tagged(0xFF, &released));
        tokio::time::timeout(Duration::from_secs(5), async {
            while pipeline.stats().failed == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        pipeline.submit(tagged(7, &released));
        let sent = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&sent[..], &[7]);

        pipeline.shutdown().await;
        assert_eq!(released.load(Ordering::SeqCst), 2);
        assert_eq!(pipeline.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_reconfigure_releases_pending_frame() {
        let released = Arc::new(AtomicUsize::new(0));
        let (pipeline, _rx) = pipeline();

        pipeline.submit(tagged(1, &released));
        let generation = pipeline.reconfigure(EncodeParams {
            quality: 40,
            rotate: true,
        });

        assert_eq!(generation, 1);
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert_eq!(pipeline.params().quality, 40);
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_releases_frame() {
        let released = Arc::new(AtomicUsize::new(0));
        let (pipeline, _rx) = pipeline();
        let submitter = pipeline.submitter();
        pipeline.shutdown().await;

        assert!(submitter.is_closed());
        submitter.submit(tagged(3, &released));
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_rotation_from_degrees() {
        assert_eq!(Rotation::from_degrees(90), Rotation::Rotate90);
        assert_eq!(Rotation::from_degrees(-90), Rotation::Rotate270);
        assert_eq!(Rotation::from_degrees(45), Rotation::None);
        assert_eq!(Rotation::Rotate180.degrees(), 180);
    }
}
