//! Minimal segment muxer implementing the `VideoEncoder` capability.
//!
//! Writes an uncompressed length-delimited planar stream: a session header,
//! one record per frame, and a trailer. Useful for exercising the pipeline
//! without a codec; a real encoder slots in behind the same trait.

use engine::{EncodeError, Frame, SessionSink, VideoEncoder};

const SESSION_MAGIC: &[u8; 4] = b"WSEG";
const FRAME_MAGIC: &[u8; 4] = b"FRAM";
const TRAILER_MAGIC: &[u8; 4] = b"TEND";
const FORMAT_VERSION: u16 = 1;

#[derive(Default)]
pub struct RawSegmentEncoder {
    sink: Option<Box<dyn SessionSink>>,
    frames_written: u64,
}

impl VideoEncoder for RawSegmentEncoder {
    fn start_session(
        &mut self,
        width: u32,
        height: u32,
        sink: Box<dyn SessionSink>,
    ) -> Result<(), EncodeError> {
        if self.sink.is_some() {
            return Err(EncodeError::SessionOpen);
        }

        let mut header = Vec::with_capacity(16);
        header.extend_from_slice(SESSION_MAGIC);
        header.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        header.extend_from_slice(&width.to_le_bytes());
        header.extend_from_slice(&height.to_le_bytes());
        sink.write(&header);

        self.sink = Some(sink);
        self.frames_written = 0;
        Ok(())
    }

    fn write_frame(&mut self, frame: &Frame) -> Result<(), EncodeError> {
        let sink = self.sink.as_ref().ok_or(EncodeError::NoSession)?;

        let mut record = Vec::with_capacity(24);
        record.extend_from_slice(FRAME_MAGIC);
        record.extend_from_slice(&frame.pts.to_le_bytes());
        record.extend_from_slice(&(frame.y.len() as u32).to_le_bytes());
        record.extend_from_slice(&(frame.u.len() as u32).to_le_bytes());
        record.extend_from_slice(&(frame.v.len() as u32).to_le_bytes());
        sink.write(&record);
        sink.write(&frame.y);
        sink.write(&frame.u);
        sink.write(&frame.v);

        self.frames_written += 1;
        Ok(())
    }

    fn close_session(&mut self) -> Result<(), EncodeError> {
        let sink = self.sink.take().ok_or(EncodeError::NoSession)?;
        let mut trailer = Vec::with_capacity(12);
        trailer.extend_from_slice(TRAILER_MAGIC);
        trailer.extend_from_slice(&self.frames_written.to_le_bytes());
        sink.write(&trailer);
        Ok(())
    }
}
