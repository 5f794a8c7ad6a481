//! Engine configuration shared by every stage.
//!
//! One struct owns every knob so the stages never re-derive limits from each
//! other; callers build it once and hand it to [`crate::Engine::new`].

use std::path::PathBuf;

#[derive(Clone, Debug)]
/// Canonical configuration for the recording pipeline.
pub struct EngineConfig {
    /// Frame width expected from the ingestion side.
    pub width: u32,
    /// Frame height expected from the ingestion side.
    pub height: u32,
    /// Directory that receives session files.
    pub output_dir: PathBuf,
    /// Extension for session files, without the leading dot.
    pub file_extension: String,
    /// Maximum frames buffered in the detection window before forced eviction.
    pub window_capacity: usize,
    /// How long a detected-motion event keeps temporally nearby frames, in
    /// nanoseconds.
    pub propagation_tolerance_ns: i64,
    /// Idle gap between kept frames that splits the recording into a new
    /// session file, in nanoseconds.
    pub session_split_gap_ns: i64,
    /// Number of classifier worker threads.
    pub detector_workers: usize,
    /// Capacity of the detector control queue; ingestion drops frames once
    /// it is full.
    pub detector_queue: usize,
    /// Capacity of the encode operation queue.
    pub encoder_queue: usize,
    /// Luma rows cropped off the top of every frame before classification,
    /// for camera overlays that would otherwise read as motion.
    pub classify_crop_top: u32,
    /// Size of one pooled I/O buffer in bytes.
    pub io_buffer_size: usize,
    /// Number of pre-allocated I/O buffers.
    pub io_buffer_count: usize,
}

impl EngineConfig {
    /// Ceiling on concurrently scheduled detection requests; frames arriving
    /// beyond it are dropped before buffering.
    pub(crate) fn max_in_flight(&self) -> usize {
        (self.detector_queue / 2).max(1)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            output_dir: PathBuf::from("recordings"),
            file_extension: "flv".to_string(),
            window_capacity: 20,
            propagation_tolerance_ns: 150_000_000,
            session_split_gap_ns: 10_000_000_000,
            detector_workers: 3,
            detector_queue: 20,
            encoder_queue: 60,
            classify_crop_top: 0,
            io_buffer_size: 4096,
            io_buffer_count: 256,
        }
    }
}
