//! Motion-gated continuous recording pipeline.
//!
//! The engine ingests raw planar frames, classifies motion on a worker pool
//! without stalling ingestion, restores result order through a sequencer,
//! and streams kept frames into a session file through a dedicated encode
//! thread and an asynchronous disk writer. Overload is handled by dropping
//! frames, never by blocking the capture path.

mod config;
mod detect;
mod encode;
mod engine;
mod frame;
mod pool;
mod storage;
mod sync;
mod window;
mod writer;

pub use config::EngineConfig;
pub use detect::{DetectionScheduler, MotionClassifier};
pub use encode::{EncodeError, EncodeHandle, EncodePipeline, SessionSink, VideoEncoder};
pub use engine::{Engine, EngineStats};
pub use frame::{Frame, FrameError, GrayImage};
pub use pool::BufferPool;
pub use storage::recover_interrupted_sessions;
pub use window::FrameSink;
pub use writer::{AsyncWriter, FileHandle, WriterHandle};
