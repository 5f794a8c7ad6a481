//! Frame sources feeding the recording engine.
//!
//! Each source spawns a capture thread that emits planar frames over a small
//! bounded channel; the buffer is intentionally tiny so the capture loop is
//! backpressured when the consumer falls behind.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender, bounded};
use engine::Frame;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open video source {path:?}")]
    Open { path: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Clone, Debug)]
/// Geometry and pacing shared by all sources.
pub struct SourceConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl SourceConfig {
    fn frame_interval_ns(&self) -> i64 {
        1_000_000_000 / self.fps.max(1) as i64
    }

    fn frame_bytes(&self) -> usize {
        let luma = (self.width * self.height) as usize;
        luma + luma / 2
    }
}

/// Spawn a synthetic moving-bar source useful for demos and soak tests.
/// Frames carry monotonic timestamps derived from the frame counter.
pub fn spawn_pattern_source(config: SourceConfig) -> Result<Receiver<Result<Frame, CaptureError>>> {
    let (tx, rx) = bounded(2);
    thread::Builder::new()
        .name("pattern-source".into())
        .spawn(move || pattern_loop(config, tx))
        .context("failed to spawn pattern source thread")?;
    Ok(rx)
}

/// Spawn a reader over a headerless planar YUV420 file at the configured
/// resolution, emitting frames with synthetic monotonic timestamps and
/// stopping at end of file.
pub fn spawn_file_source(
    path: &Path,
    config: SourceConfig,
) -> Result<Receiver<Result<Frame, CaptureError>>> {
    let file = File::open(path).map_err(|_| CaptureError::Open { path: path.display().to_string() })?;
    let (tx, rx) = bounded(2);
    thread::Builder::new()
        .name("file-source".into())
        .spawn(move || file_loop(file, config, tx))
        .context("failed to spawn file source thread")?;
    Ok(rx)
}

fn pattern_loop(config: SourceConfig, tx: Sender<Result<Frame, CaptureError>>) {
    let interval = config.frame_interval_ns();
    let width = config.width as usize;
    let height = config.height as usize;
    let started = Instant::now();

    for index in 0u64.. {
        // A bright vertical bar sweeping across a mid-gray background; the
        // sweep gives the difference classifier something to latch onto.
        let bar = (index as usize * 4) % width;
        let mut y = vec![96u8; width * height];
        for row in y.chunks_mut(width) {
            for col in bar..(bar + 8).min(width) {
                row[col] = 235;
            }
        }
        let chroma = vec![128u8; (width / 2) * (height / 2)];

        let pts = index as i64 * interval;
        let frame = match Frame::new(y, chroma.clone(), chroma, config.width, config.height, pts) {
            Ok(frame) => frame,
            Err(err) => {
                let _ = tx.send(Err(CaptureError::Other(err.into())));
                return;
            }
        };
        if tx.send(Ok(frame)).is_err() {
            debug!("pattern source consumer gone, stopping");
            return;
        }

        // Pace against the wall clock rather than sleeping a fixed interval,
        // so slow sends do not accumulate drift.
        let target = Duration::from_nanos((pts + interval) as u64);
        if let Some(remaining) = target.checked_sub(started.elapsed()) {
            thread::sleep(remaining);
        }
    }
}

fn file_loop(file: File, config: SourceConfig, tx: Sender<Result<Frame, CaptureError>>) {
    let mut reader = BufReader::new(file);
    let interval = config.frame_interval_ns();
    let luma = (config.width * config.height) as usize;
    let chroma = luma / 4;
    let mut buffer = vec![0u8; config.frame_bytes()];

    for index in 0u64.. {
        match reader.read_exact(&mut buffer) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!("file source reached end of stream after {index} frame(s)");
                return;
            }
            Err(err) => {
                let _ = tx.send(Err(CaptureError::Other(err.into())));
                return;
            }
        }

        let frame = Frame::new(
            buffer[..luma].to_vec(),
            buffer[luma..luma + chroma].to_vec(),
            buffer[luma + chroma..].to_vec(),
            config.width,
            config.height,
            index as i64 * interval,
        );
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                let _ = tx.send(Err(CaptureError::Other(err.into())));
                return;
            }
        };
        if tx.send(Ok(frame)).is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn pattern_source_emits_monotonic_frames() {
        let config = SourceConfig { width: 32, height: 16, fps: 100 };
        let rx = spawn_pattern_source(config).unwrap();

        let first = rx.recv().unwrap().unwrap();
        let second = rx.recv().unwrap().unwrap();
        assert_eq!(first.pts, 0);
        assert!(second.pts > first.pts);
        assert_eq!(first.y.len(), 32 * 16);
        drop(rx);
    }

    #[test]
    fn file_source_reads_whole_frames_then_stops() {
        let config = SourceConfig { width: 4, height: 4, fps: 30 };
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        // Two frames plus a truncated third that must be ignored.
        tmp.write_all(&vec![7u8; config.frame_bytes() * 2 + 3]).unwrap();

        let rx = spawn_file_source(tmp.path(), config).unwrap();
        assert!(rx.recv().unwrap().is_ok());
        assert!(rx.recv().unwrap().is_ok());
        assert!(rx.recv().is_err(), "channel must close at end of file");
    }

    #[test]
    fn missing_file_fails_at_spawn() {
        let config = SourceConfig { width: 4, height: 4, fps: 30 };
        let result = spawn_file_source(Path::new("/nonexistent/stream.yuv"), config);
        assert!(result.is_err());
    }
}
