//! Engine: wires window, scheduler, encode pipeline, and writer into one
//! pipeline and implements the recording policy on top.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::detect::{DetectionScheduler, MotionClassifier};
use crate::encode::{EncodeHandle, EncodePipeline, VideoEncoder};
use crate::frame::{Frame, FrameError};
use crate::storage;
use crate::window::FrameSink;
use crate::writer::AsyncWriter;

/// Timestamp sentinel meaning "no motion observed yet this session".
const NO_MOTION: i64 = i64::MIN;

/// Counters the engine exposes for diagnostics and tests.
#[derive(Clone, Copy, Debug, Default)]
pub struct EngineStats {
    pub ingested: u64,
    pub kept: u64,
    pub session_splits: u64,
}

/// Top-level pipeline owner. Construct once, feed frames from the capture
/// thread, shut down explicitly.
pub struct Engine {
    config: EngineConfig,
    detector: DetectionScheduler,
    encode: EncodePipeline,
    writer: AsyncWriter,
    encode_handle: EncodeHandle,
    recording: AtomicBool,
    last_motion_pts: Arc<AtomicI64>,
    ingested: AtomicU64,
    kept: Arc<AtomicU64>,
    session_splits: AtomicU64,
}

/// Sink plugged into the detection window: forwards kept frames to the
/// encode stage and tracks the last-motion timestamp for the split policy.
struct MotionForwarder {
    encode: EncodeHandle,
    last_motion_pts: Arc<AtomicI64>,
    kept: Arc<AtomicU64>,
}

impl FrameSink for MotionForwarder {
    fn release(&self, frame: Frame, real_pts: i64) {
        self.last_motion_pts.store(real_pts, Ordering::Relaxed);
        self.kept.fetch_add(1, Ordering::Relaxed);
        self.encode.send_frame(frame);
    }
}

impl Engine {
    /// Build the pipeline. Recovers crash remnants in the output directory
    /// before anything opens a new session file.
    pub fn new(
        config: EngineConfig,
        classifier: Arc<dyn MotionClassifier>,
        encoder: Box<dyn VideoEncoder>,
    ) -> Result<Self> {
        let recovered = storage::recover_interrupted_sessions(&config.output_dir)
            .with_context(|| format!("scanning {} for crash remnants", config.output_dir.display()))?;
        if recovered > 0 {
            info!("recovered {recovered} interrupted session file(s)");
        }

        let writer = AsyncWriter::new(config.io_buffer_count, config.io_buffer_size);
        let encode = EncodePipeline::new(
            config.width,
            config.height,
            config.output_dir.clone(),
            config.file_extension.clone(),
            config.encoder_queue,
            encoder,
            writer.handle(),
        );
        let encode_handle = encode.handle();

        let last_motion_pts = Arc::new(AtomicI64::new(NO_MOTION));
        let kept = Arc::new(AtomicU64::new(0));
        let sink = MotionForwarder {
            encode: encode_handle.clone(),
            last_motion_pts: last_motion_pts.clone(),
            kept: kept.clone(),
        };
        let detector = DetectionScheduler::new(&config, classifier, Box::new(sink));

        Ok(Self {
            config,
            detector,
            encode,
            writer,
            encode_handle,
            recording: AtomicBool::new(false),
            last_motion_pts,
            ingested: AtomicU64::new(0),
            kept,
            session_splits: AtomicU64::new(0),
        })
    }

    /// Feed one frame into the pipeline. Applies the session-split policy
    /// before forwarding; never blocks the caller.
    pub fn ingest(&self, frame: Frame) {
        self.ingested.fetch_add(1, Ordering::Relaxed);

        if self.recording.load(Ordering::Relaxed) {
            let last_motion = self.last_motion_pts.load(Ordering::Relaxed);
            if last_motion != NO_MOTION
                && frame.pts - last_motion > self.config.session_split_gap_ns
            {
                info!(
                    "idle gap of {} ms exceeded split threshold, starting a new session",
                    (frame.pts - last_motion) / 1_000_000
                );
                self.session_splits.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("watcher_session_splits_total").increment(1);
                self.stop_recording();
                self.start_recording();
            }
        }

        self.detector.submit(frame);
    }

    /// Convenience entry point for camera-native planar data.
    pub fn ingest_planar(
        &self,
        data_y: &[u8],
        data_u: &[u8],
        data_v: &[u8],
        stride_y: usize,
        stride_u: usize,
        stride_v: usize,
        pts_ns: i64,
    ) -> std::result::Result<(), FrameError> {
        let frame = Frame::from_planes(
            data_y,
            data_u,
            data_v,
            stride_y,
            stride_u,
            stride_v,
            self.config.width,
            self.config.height,
            pts_ns,
        )?;
        self.ingest(frame);
        Ok(())
    }

    /// Open a recording session. Idempotent past the first call.
    pub fn start_recording(&self) {
        if self.recording.swap(true, Ordering::Relaxed) {
            debug!("start_recording while already recording");
        }
        self.last_motion_pts.store(NO_MOTION, Ordering::Relaxed);
        self.encode_handle.start_record();
    }

    /// Close the current session. Flushes in-flight classification first so
    /// no late result can reorder output after the file closes.
    pub fn stop_recording(&self) {
        self.detector.flush();
        self.encode_handle.stop_record();
        self.recording.store(false, Ordering::Relaxed);
    }

    /// Tear the pipeline down: producers before their consumers, so each
    /// stage drains into a still-running successor.
    pub fn shutdown(mut self) {
        if self.recording.load(Ordering::Relaxed) {
            self.stop_recording();
        }
        self.detector.terminate();
        self.encode.terminate();
        self.writer.terminate();
        info!("engine shut down");
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            ingested: self.ingested.load(Ordering::Relaxed),
            kept: self.kept.load(Ordering::Relaxed),
            session_splits: self.session_splits.load(Ordering::Relaxed),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Whether a recording session is currently requested.
    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::Relaxed)
    }
}
