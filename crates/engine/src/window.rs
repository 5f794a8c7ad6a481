//! Sliding detection window deciding which frames are worth persisting.
//!
//! Frames buffer here until their motion status resolves. Motion propagates
//! backward over a bounded tolerance: a detected event keeps temporally
//! nearby frames that were already buffered. Frames that outlive the
//! propagation horizon without motion are freed, and the buffer never grows
//! past its capacity.

use std::collections::VecDeque;

use tracing::{debug, warn};

use crate::detect::{DetectionRequest, PoolClient};
use crate::frame::Frame;

/// Downstream consumer of kept frames. `real_pts` carries the uncorrected
/// capture timestamp for policy decisions; the frame itself already has its
/// output timestamp re-accumulated over kept frames.
pub trait FrameSink: Send {
    fn release(&self, frame: Frame, real_pts: i64);
}

#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct WindowStats {
    /// Frames emitted to the sink with motion.
    pub released: u64,
    /// Frames that outlived the propagation horizon without motion.
    pub expired: u64,
    /// Frames forced out by the capacity bound.
    pub evicted: u64,
    /// Frames dropped before buffering because the pool backlog was full.
    pub dropped_backlog: u64,
}

pub(crate) struct MotionWindow {
    capacity: usize,
    tolerance_ns: i64,
    max_in_flight: usize,
    buffer: VecDeque<Frame>,
    /// Partially assembled detection triple.
    pending_prev: Option<Frame>,
    pending_mid: Option<Frame>,
    next_sequence: u64,
    last_frame_time: Option<i64>,
    last_motion_time: Option<i64>,
    /// Output timestamp of the last kept frame, the re-accumulation anchor.
    last_kept_output: Option<i64>,
    stats: WindowStats,
}

impl MotionWindow {
    pub(crate) fn new(capacity: usize, tolerance_ns: i64, max_in_flight: usize) -> Self {
        Self {
            capacity,
            tolerance_ns,
            max_in_flight,
            buffer: VecDeque::with_capacity(capacity),
            pending_prev: None,
            pending_mid: None,
            next_sequence: 0,
            last_frame_time: None,
            last_motion_time: None,
            last_kept_output: None,
            stats: WindowStats::default(),
        }
    }

    /// Accept one ingested frame: stamp its inter-frame delta, group it into
    /// a detection triple, and dispatch the triple to the worker pool once
    /// complete. Timestamps must be strictly increasing between resets.
    pub(crate) fn submit(&mut self, mut frame: Frame, pool: &PoolClient) {
        match self.last_frame_time {
            Some(last) => {
                let delta = frame.pts - last;
                assert!(delta > 0, "non-monotonic frame timestamp: {} after {last}", frame.pts);
                frame.delta = delta;
            }
            None => frame.delta = 0,
        }
        self.last_frame_time = Some(frame.pts);

        if pool.in_flight() >= self.max_in_flight {
            warn!("frame drop at schedule, {} detections in flight", pool.in_flight());
            metrics::counter!("watcher_dropped_frames_total", "stage" => "schedule").increment(1);
            self.stats.dropped_backlog += 1;
            return;
        }

        let Some(prev) = self.pending_prev.take() else {
            self.pending_prev = Some(frame);
            return;
        };
        let Some(mid) = self.pending_mid.take() else {
            self.pending_prev = Some(prev);
            self.pending_mid = Some(frame);
            return;
        };

        let request = DetectionRequest {
            prev,
            mid,
            next: frame,
            sequence: self.next_sequence,
            have_motion: false,
        };
        match pool.dispatch(request) {
            Ok(()) => self.next_sequence += 1,
            Err(request) => {
                // Sequence allocation rolls back by simply not advancing.
                warn!("frame drop at worker pool, sequence {}", request.sequence);
                metrics::counter!("watcher_dropped_frames_total", "stage" => "pool").increment(3);
                self.stats.dropped_backlog += 3;
            }
        }
    }

    /// Consume one classified request, delivered strictly in submission
    /// order by the sequencer. The verdict belongs to the middle frame of
    /// the triple.
    pub(crate) fn on_result(&mut self, request: DetectionRequest, sink: &dyn FrameSink) {
        let DetectionRequest { prev, mid, next, have_motion, .. } = request;
        self.process(prev, false, sink);
        self.process(mid, have_motion, sink);
        self.process(next, false, sink);
    }

    fn process(&mut self, frame: Frame, have_motion: bool, sink: &dyn FrameSink) {
        if let Some(back) = self.buffer.back() {
            let head_time = back.pts;

            while let Some(front) = self.buffer.front() {
                let over_capacity = self.buffer.len() >= self.capacity;
                let expired = front.pts + self.tolerance_ns < head_time;
                let propagated = self
                    .last_motion_time
                    .is_some_and(|t| t + self.tolerance_ns >= front.pts);
                let keep = propagated || (!expired && have_motion);

                if !(keep || expired || over_capacity) {
                    break;
                }

                let mut released = self.buffer.pop_front().expect("front checked above");
                if keep {
                    let real_pts = released.pts;
                    self.correct_timestamp(&mut released);
                    debug!("frame with motion released, pts {}", released.pts);
                    self.stats.released += 1;
                    metrics::counter!("watcher_frames_released_total").increment(1);
                    sink.release(released, real_pts);
                } else if expired {
                    self.stats.expired += 1;
                } else {
                    warn!("window at capacity, evicting frame at pts {}", released.pts);
                    metrics::counter!("watcher_dropped_frames_total", "stage" => "evict").increment(1);
                    self.stats.evicted += 1;
                }
            }

            if have_motion {
                self.last_motion_time = Some(head_time);
            }
        }

        self.buffer.push_back(frame);
    }

    /// Rebase a kept frame onto the output timeline: the first kept frame
    /// anchors the epoch, every later one advances it by its own delta, so
    /// the deltas of unkept frames never reach the output stream.
    fn correct_timestamp(&mut self, frame: &mut Frame) {
        match self.last_kept_output {
            None => self.last_kept_output = Some(frame.pts),
            Some(prev) => {
                let output = prev + frame.delta;
                frame.pts = output;
                self.last_kept_output = Some(output);
            }
        }
    }

    /// Drop all buffered state and zero every anchor. Frames whose motion
    /// status never resolved are freed, not released.
    pub(crate) fn reset(&mut self) {
        let discarded =
            self.buffer.len() + self.pending_prev.is_some() as usize + self.pending_mid.is_some() as usize;
        if discarded > 0 {
            debug!("window reset discarding {discarded} unresolved frame(s)");
        }
        self.buffer.clear();
        self.pending_prev = None;
        self.pending_mid = None;
        self.next_sequence = 0;
        self.last_frame_time = None;
        self.last_motion_time = None;
        self.last_kept_output = None;
    }

    pub(crate) fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    pub(crate) fn stats(&self) -> WindowStats {
        self.stats
    }
}
