//! Encode pipeline: one thread owning the video-encoder capability.
//!
//! The external encoder is stateful and non-reentrant, so every touch of it
//! is serialized onto this stage's thread. Frames arrive through a bounded
//! queue with drop-on-full semantics; control messages share the same FIFO
//! queue and therefore order after all previously queued frames.

use std::path::PathBuf;
use std::thread;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::frame::Frame;
use crate::storage::{self, SessionPaths};
use crate::writer::{FileHandle, WriterHandle};

/// Byte sink for one encoder session; all physical writes route through the
/// async writer.
pub trait SessionSink: Send {
    fn write(&self, bytes: &[u8]);
}

/// Capability interface for the external encoder/muxer. One session maps to
/// one output file; sessions never overlap.
pub trait VideoEncoder: Send {
    fn start_session(
        &mut self,
        width: u32,
        height: u32,
        sink: Box<dyn SessionSink>,
    ) -> Result<(), EncodeError>;
    fn write_frame(&mut self, frame: &Frame) -> Result<(), EncodeError>;
    fn close_session(&mut self) -> Result<(), EncodeError>;
}

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("encoder session already open")]
    SessionOpen,
    #[error("no encoder session open")]
    NoSession,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

enum EncoderOp {
    StartRecord,
    Frame(Frame),
    CloseRecord,
    Finalize,
}

/// Owner of the encode thread.
pub struct EncodePipeline {
    handle: EncodeHandle,
    thread: Option<thread::JoinHandle<()>>,
}

#[derive(Clone)]
pub struct EncodeHandle {
    ops: Sender<EncoderOp>,
}

impl EncodePipeline {
    pub fn new(
        width: u32,
        height: u32,
        output_dir: PathBuf,
        extension: String,
        queue: usize,
        encoder: Box<dyn VideoEncoder>,
        writer: WriterHandle,
    ) -> Self {
        let (ops_tx, ops_rx) = bounded(queue);
        let thread = thread::Builder::new()
            .name("encode".into())
            .spawn(move || {
                EncodeWorker {
                    encoder,
                    writer,
                    width,
                    height,
                    output_dir,
                    extension,
                    session: None,
                }
                .run(ops_rx)
            })
            .expect("failed to spawn encode thread");
        Self { handle: EncodeHandle { ops: ops_tx }, thread: Some(thread) }
    }

    pub fn handle(&self) -> EncodeHandle {
        self.handle.clone()
    }

    /// Enqueue `Finalize` and join. A queue or session left non-empty past
    /// this point is a caller protocol violation; the worker logs it and
    /// state stays consistent.
    pub fn terminate(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = self.handle.ops.send(EncoderOp::Finalize);
            if thread.join().is_err() {
                error!("encode thread terminated by a fatal encoder error");
            }
        }
    }
}

impl Drop for EncodePipeline {
    fn drop(&mut self) {
        self.terminate();
    }
}

impl EncodeHandle {
    /// Open a new recording session. Idempotent: a start while already
    /// recording is logged and ignored by the worker.
    pub fn start_record(&self) {
        let _ = self.ops.send(EncoderOp::StartRecord);
    }

    /// Close the current session. A stop while idle is a no-op.
    pub fn stop_record(&self) {
        let _ = self.ops.send(EncoderOp::CloseRecord);
    }

    /// Queue a frame for encoding; on a full queue the frame is dropped and
    /// counted rather than blocking the caller.
    pub fn send_frame(&self, frame: Frame) {
        match self.ops.try_send(EncoderOp::Frame(frame)) {
            Ok(()) => {
                metrics::gauge!("watcher_queue_depth", "queue" => "encode").set(self.ops.len() as f64);
            }
            Err(TrySendError::Full(_)) => {
                warn!("frame drop at encode queue");
                metrics::counter!("watcher_dropped_frames_total", "stage" => "encode").increment(1);
            }
            Err(TrySendError::Disconnected(_)) => {
                error!("encode thread is gone, dropping frame");
            }
        }
    }
}

struct Session {
    paths: SessionPaths,
    file: FileHandle,
    /// Timestamp of the session's first frame; every later frame is rebased
    /// against it so the output stream starts at zero.
    epoch: Option<i64>,
}

struct EncodeWorker {
    encoder: Box<dyn VideoEncoder>,
    writer: WriterHandle,
    width: u32,
    height: u32,
    output_dir: PathBuf,
    extension: String,
    session: Option<Session>,
}

/// Sink routing encoder output bytes to the async writer.
struct WriterSink {
    writer: WriterHandle,
    file: FileHandle,
}

impl SessionSink for WriterSink {
    fn write(&self, bytes: &[u8]) {
        self.writer.write(self.file, bytes);
    }
}

impl EncodeWorker {
    fn run(mut self, ops: Receiver<EncoderOp>) {
        for op in ops.iter() {
            match op {
                EncoderOp::StartRecord => self.start_session(),
                EncoderOp::Frame(frame) => self.encode_frame(frame),
                EncoderOp::CloseRecord => self.close_session(),
                EncoderOp::Finalize => {
                    self.close_session();
                    break;
                }
            }
        }

        if !ops.is_empty() {
            warn!("encode pipeline still has pending operations after finalization");
        }
        if self.session.is_some() {
            warn!("encoder session still open after finalization");
        }
    }

    fn start_session(&mut self) {
        if self.session.is_some() {
            warn!("start_record while already recording, ignoring");
            return;
        }

        let paths = match storage::allocate_session_paths(&self.output_dir, &self.extension) {
            Ok(paths) => paths,
            Err(err) => {
                error!("cannot allocate session file: {err}");
                metrics::counter!("watcher_session_open_failures_total").increment(1);
                return;
            }
        };
        let file = match self.writer.open(&paths.active) {
            Ok(file) => file,
            Err(err) => {
                error!("cannot open session file {:?}: {err}", paths.active);
                metrics::counter!("watcher_session_open_failures_total").increment(1);
                return;
            }
        };

        let sink = Box::new(WriterSink { writer: self.writer.clone(), file });
        if let Err(err) = self.encoder.start_session(self.width, self.height, sink) {
            error!("encoder refused to start a session: {err}");
            self.writer.close_file(file);
            if let Err(err) = std::fs::remove_file(&paths.active) {
                warn!("could not remove aborted session file: {err}");
            }
            return;
        }

        info!("recording session started: {:?}", paths.active);
        metrics::counter!("watcher_sessions_total").increment(1);
        self.session = Some(Session { paths, file, epoch: None });
    }

    fn encode_frame(&mut self, mut frame: Frame) {
        let Some(session) = self.session.as_mut() else {
            debug!("frame while idle, dropping");
            metrics::counter!("watcher_dropped_frames_total", "stage" => "idle").increment(1);
            return;
        };

        let epoch = *session.epoch.get_or_insert(frame.pts);
        let rebased = frame.pts - epoch;
        assert!(rebased >= 0, "frame timestamp predates the session epoch: {rebased}");
        frame.pts = rebased;

        if let Err(err) = self.encoder.write_frame(&frame) {
            // Mid-session output corruption has no safe recovery.
            panic!("encoder write failed: {err}");
        }
        metrics::counter!("watcher_frames_encoded_total").increment(1);
    }

    fn close_session(&mut self) {
        let Some(session) = self.session.take() else { return };

        if let Err(err) = self.encoder.close_session() {
            panic!("encoder close failed: {err}");
        }
        self.writer.close_file(session.file);

        if let Err(err) = storage::finish_session(&session.paths) {
            // The marker stays; startup recovery will strip it by rename.
            error!("could not strip in-use marker from {:?}: {err}", session.paths.active);
        } else {
            info!("recording session closed: {:?}", session.paths.finished);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::*;
    use crate::writer::AsyncWriter;

    /// Encoder double that records session lifecycle events and writes a
    /// byte per frame through the sink.
    #[derive(Default)]
    struct RecordingEncoder {
        events: Arc<Mutex<Vec<String>>>,
        sink: Option<Box<dyn SessionSink>>,
    }

    impl VideoEncoder for RecordingEncoder {
        fn start_session(
            &mut self,
            _width: u32,
            _height: u32,
            sink: Box<dyn SessionSink>,
        ) -> Result<(), EncodeError> {
            if self.sink.is_some() {
                return Err(EncodeError::SessionOpen);
            }
            self.events.lock().unwrap().push("start".into());
            self.sink = Some(sink);
            Ok(())
        }

        fn write_frame(&mut self, frame: &Frame) -> Result<(), EncodeError> {
            let sink = self.sink.as_ref().ok_or(EncodeError::NoSession)?;
            sink.write(&frame.pts.to_le_bytes());
            self.events.lock().unwrap().push(format!("frame@{}", frame.pts));
            Ok(())
        }

        fn close_session(&mut self) -> Result<(), EncodeError> {
            self.sink.take().ok_or(EncodeError::NoSession)?;
            self.events.lock().unwrap().push("close".into());
            Ok(())
        }
    }

    fn test_frame(pts: i64) -> Frame {
        Frame::new(vec![0; 16], vec![0; 4], vec![0; 4], 4, 4, pts).unwrap()
    }

    fn spawn_pipeline(dir: &std::path::Path) -> (EncodePipeline, AsyncWriter, Arc<Mutex<Vec<String>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let encoder = RecordingEncoder { events: events.clone(), sink: None };
        let writer = AsyncWriter::new(4, 64);
        let pipeline = EncodePipeline::new(
            4,
            4,
            dir.to_path_buf(),
            "flv".into(),
            16,
            Box::new(encoder),
            writer.handle(),
        );
        (pipeline, writer, events)
    }

    #[test]
    fn frames_are_rebased_to_the_session_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let (mut pipeline, mut writer, events) = spawn_pipeline(dir.path());
        let handle = pipeline.handle();

        handle.start_record();
        handle.send_frame(test_frame(1_000));
        handle.send_frame(test_frame(1_500));
        handle.stop_record();
        pipeline.terminate();
        writer.terminate();

        let events = events.lock().unwrap();
        assert_eq!(*events, vec!["start", "frame@0", "frame@500", "close"]);
    }

    #[test]
    fn double_start_opens_a_single_session_file() {
        let dir = tempfile::tempdir().unwrap();
        let (mut pipeline, mut writer, events) = spawn_pipeline(dir.path());
        let handle = pipeline.handle();

        handle.start_record();
        handle.start_record();
        handle.send_frame(test_frame(0));
        handle.stop_record();
        pipeline.terminate();
        writer.terminate();

        assert_eq!(events.lock().unwrap().iter().filter(|e| *e == "start").count(), 1);
        let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn frames_while_idle_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let (mut pipeline, mut writer, events) = spawn_pipeline(dir.path());
        let handle = pipeline.handle();

        handle.send_frame(test_frame(0));
        std::thread::sleep(Duration::from_millis(20));
        pipeline.terminate();
        writer.terminate();

        assert!(events.lock().unwrap().is_empty());
        assert!(std::fs::read_dir(dir.path()).is_err() || std::fs::read_dir(dir.path()).unwrap().count() == 0);
    }

    #[test]
    fn close_strips_the_in_use_marker() {
        let dir = tempfile::tempdir().unwrap();
        let (mut pipeline, mut writer, _events) = spawn_pipeline(dir.path());
        let handle = pipeline.handle();

        handle.start_record();
        handle.send_frame(test_frame(77));
        handle.stop_record();
        pipeline.terminate();
        writer.terminate();

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 1);
        assert!(!names[0].contains("(in use)"), "marker not stripped: {names:?}");
    }
}
