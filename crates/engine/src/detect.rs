//! Detection scheduler: classifier worker pool plus result sequencer.
//!
//! Workers classify frame triples in parallel and finish in arbitrary
//! order; the sequencer restores submission order before results reach the
//! window, so downstream consumers never observe reordering. One control
//! thread owns the window and sequencer state and serializes every mutation.

use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use tracing::{debug, error, warn};

use crate::config::EngineConfig;
use crate::frame::{Frame, GrayImage};
use crate::sync::{AckSender, InflightGauge, ack_channel};
use crate::window::{FrameSink, MotionWindow};

/// Capability interface for the motion-classification algorithm: given the
/// gray views of two consecutive frames, decide whether motion occurred
/// between them.
pub trait MotionClassifier: Send + Sync {
    fn classify(&self, current: &GrayImage, next: &GrayImage) -> bool;
}

/// A classification window of three consecutive frames. The verdict is
/// computed from the (mid, next) boundary pair and attaches to `mid`.
pub(crate) struct DetectionRequest {
    pub(crate) prev: Frame,
    pub(crate) mid: Frame,
    pub(crate) next: Frame,
    /// Dense, strictly increasing per scheduler instance between resets.
    pub(crate) sequence: u64,
    pub(crate) have_motion: bool,
}

enum DetectorOp {
    Frame(Frame),
    Classified(DetectionRequest),
    Reset(AckSender),
    Finalize(AckSender),
}

/// Worker-pool access handed to the window for dispatching requests.
pub(crate) struct PoolClient {
    work_tx: Sender<DetectionRequest>,
    in_flight: Arc<InflightGauge>,
}

impl PoolClient {
    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.current()
    }

    /// Dispatch a request to the pool. On rejection the request comes back
    /// so the caller can roll back its sequence allocation.
    pub(crate) fn dispatch(&self, request: DetectionRequest) -> Result<(), DetectionRequest> {
        self.in_flight.inc();
        match self.work_tx.try_send(request) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(request)) | Err(TrySendError::Disconnected(request)) => {
                self.in_flight.dec();
                Err(request)
            }
        }
    }
}

/// Reorder buffer emitting completed requests in strict submission order.
#[derive(Default)]
struct Sequencer {
    pending: Vec<DetectionRequest>,
    current: u64,
}

impl Sequencer {
    /// Insert a completed request and pop every request that became
    /// sequential, in order.
    fn accept(&mut self, request: DetectionRequest) -> Vec<DetectionRequest> {
        let at = self.pending.partition_point(|r| r.sequence < request.sequence);
        self.pending.insert(at, request);

        let mut ready = Vec::new();
        while self.pending.first().is_some_and(|r| r.sequence == self.current) {
            ready.push(self.pending.remove(0));
            self.current += 1;
        }
        ready
    }

    /// Clear all state, returning how many requests were still waiting for
    /// a predecessor. After a flush that number must be zero.
    fn reset(&mut self) -> usize {
        let leftover = self.pending.len();
        self.pending.clear();
        self.current = 0;
        leftover
    }
}

/// Owner of the classifier pool and the detector control thread.
pub struct DetectionScheduler {
    ops_tx: Sender<DetectorOp>,
    in_flight: Arc<InflightGauge>,
    detector: Option<thread::JoinHandle<()>>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl DetectionScheduler {
    pub fn new(
        config: &EngineConfig,
        classifier: Arc<dyn MotionClassifier>,
        sink: Box<dyn FrameSink>,
    ) -> Self {
        let (ops_tx, ops_rx) = bounded::<DetectorOp>(config.detector_queue);
        let (work_tx, work_rx) = bounded::<DetectionRequest>(config.max_in_flight());
        let in_flight = Arc::new(InflightGauge::new());

        let mut workers = Vec::with_capacity(config.detector_workers);
        for index in 0..config.detector_workers {
            let work_rx = work_rx.clone();
            let ops_tx = ops_tx.clone();
            let classifier = classifier.clone();
            let in_flight = in_flight.clone();
            let crop_top = config.classify_crop_top;
            let handle = thread::Builder::new()
                .name(format!("classify-{index}"))
                .spawn(move || classify_loop(work_rx, ops_tx, classifier, in_flight, crop_top))
                .expect("failed to spawn classifier worker");
            workers.push(handle);
        }
        drop(work_rx);

        let window = MotionWindow::new(
            config.window_capacity,
            config.propagation_tolerance_ns,
            config.max_in_flight(),
        );
        let pool = PoolClient { work_tx, in_flight: in_flight.clone() };
        let detector_ops = ops_rx;
        let detector = thread::Builder::new()
            .name("detector".into())
            .spawn(move || detector_loop(detector_ops, pool, window, sink))
            .expect("failed to spawn detector thread");

        Self { ops_tx, in_flight, detector: Some(detector), workers }
    }

    /// Queue a frame for the detection window. Never blocks: a full backlog
    /// drops the frame with a warning.
    pub fn submit(&self, frame: Frame) {
        match self.ops_tx.try_send(DetectorOp::Frame(frame)) {
            Ok(()) => {
                metrics::gauge!("watcher_queue_depth", "queue" => "detector")
                    .set(self.ops_tx.len() as f64);
            }
            Err(TrySendError::Full(_)) => {
                warn!("frame drop at ingest, detector backlog full");
                metrics::counter!("watcher_dropped_frames_total", "stage" => "ingest").increment(1);
            }
            Err(TrySendError::Disconnected(_)) => {
                error!("detector thread is gone, dropping frame");
            }
        }
    }

    /// Synchronous barrier: wait out all queued and in-flight classification
    /// work, then reset the sequencer and window together. Returns only
    /// after every pre-flush frame has been released or freed.
    pub fn flush(&self) {
        self.in_flight.wait_zero();
        let (ack, waiter) = ack_channel();
        if self.ops_tx.send(DetectorOp::Reset(ack)).is_ok() {
            waiter.wait();
        }
    }

    /// Flush, stop the control thread, and join the worker pool.
    pub fn terminate(&mut self) {
        let Some(detector) = self.detector.take() else { return };
        self.flush();
        let (ack, waiter) = ack_channel();
        if self.ops_tx.send(DetectorOp::Finalize(ack)).is_ok() {
            waiter.wait();
        }
        if detector.join().is_err() {
            error!("detector thread terminated by a broken invariant");
        }
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("classifier worker terminated by a panic");
            }
        }
    }
}

impl Drop for DetectionScheduler {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn classify_loop(
    work_rx: Receiver<DetectionRequest>,
    ops_tx: Sender<DetectorOp>,
    classifier: Arc<dyn MotionClassifier>,
    in_flight: Arc<InflightGauge>,
    crop_top: u32,
) {
    for mut request in work_rx.iter() {
        let started = Instant::now();
        let current = request.mid.gray_view(crop_top);
        let next = request.next.gray_view(crop_top);
        request.have_motion = classifier.classify(&current, &next);
        metrics::histogram!("watcher_stage_latency_seconds", "stage" => "classify")
            .record(started.elapsed().as_secs_f64());

        // The completion must be queued before the gauge drops so a flush
        // observing zero cannot overtake a produced result.
        let delivered = ops_tx.send(DetectorOp::Classified(request));
        in_flight.dec();
        if delivered.is_err() {
            break;
        }
    }
}

fn detector_loop(
    ops_rx: Receiver<DetectorOp>,
    pool: PoolClient,
    mut window: MotionWindow,
    sink: Box<dyn FrameSink>,
) {
    let mut sequencer = Sequencer::default();

    for op in ops_rx.iter() {
        match op {
            DetectorOp::Frame(frame) => window.submit(frame, &pool),
            DetectorOp::Classified(request) => {
                for ready in sequencer.accept(request) {
                    window.on_result(ready, sink.as_ref());
                }
            }
            DetectorOp::Reset(ack) => {
                debug!("reset start");
                drain_in_flight(&ops_rx, &pool, &mut window, &mut sequencer, sink.as_ref());
                clear_state(&mut window, &mut sequencer);
                debug!("reset finish");
                ack.ack();
            }
            DetectorOp::Finalize(ack) => {
                drain_in_flight(&ops_rx, &pool, &mut window, &mut sequencer, sink.as_ref());
                clear_state(&mut window, &mut sequencer);
                ack.ack();
                break;
            }
        }
    }

    if !ops_rx.is_empty() {
        warn!("motion detector still has pending operations after finalization");
    }
}

/// Frames queued before the barrier may have formed requests the pool is
/// still chewing on; consume their completions so the reorder buffer is
/// provably empty at reset. Frames met here never resolved and are freed.
fn drain_in_flight(
    ops_rx: &Receiver<DetectorOp>,
    pool: &PoolClient,
    window: &mut MotionWindow,
    sequencer: &mut Sequencer,
    sink: &dyn FrameSink,
) {
    while pool.in_flight() > 0 {
        match ops_rx.recv() {
            Ok(DetectorOp::Classified(request)) => {
                for ready in sequencer.accept(request) {
                    window.on_result(ready, sink);
                }
            }
            Ok(DetectorOp::Frame(_)) => {
                metrics::counter!("watcher_dropped_frames_total", "stage" => "reset").increment(1);
            }
            Ok(DetectorOp::Reset(ack)) | Ok(DetectorOp::Finalize(ack)) => {
                // Nested barriers collapse into the one being served.
                ack.ack();
            }
            Err(_) => break,
        }
    }
}

fn clear_state(window: &mut MotionWindow, sequencer: &mut Sequencer) {
    let leftover = sequencer.reset();
    if leftover > 0 {
        // All pool work was drained first, so a leftover means a request
        // was lost and the order invariant is broken.
        warn!("{leftover} unsorted request(s) found after flush");
    }
    window.reset();
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    fn test_frame(pts: i64) -> Frame {
        Frame::new(vec![0; 16], vec![0; 4], vec![0; 4], 4, 4, pts).unwrap()
    }

    fn request(sequence: u64) -> DetectionRequest {
        DetectionRequest {
            prev: test_frame(0),
            mid: test_frame(1),
            next: test_frame(2),
            sequence,
            have_motion: false,
        }
    }

    #[test]
    fn sequencer_restores_submission_order() {
        // Completion order chosen to exercise every insertion position.
        let arrival = [3u64, 0, 4, 1, 7, 2, 5, 9, 6, 8];
        let mut sequencer = Sequencer::default();
        let mut emitted = Vec::new();
        for sequence in arrival {
            for ready in sequencer.accept(request(sequence)) {
                emitted.push(ready.sequence);
            }
        }
        assert_eq!(emitted, (0..10).collect::<Vec<_>>());
        assert_eq!(sequencer.reset(), 0);
    }

    #[test]
    fn sequencer_holds_results_that_arrive_early() {
        let mut sequencer = Sequencer::default();
        assert!(sequencer.accept(request(1)).is_empty());
        assert!(sequencer.accept(request(2)).is_empty());
        let ready = sequencer.accept(request(0));
        assert_eq!(ready.iter().map(|r| r.sequence).collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    struct AlwaysMotion;

    impl MotionClassifier for AlwaysMotion {
        fn classify(&self, _current: &GrayImage, _next: &GrayImage) -> bool {
            true
        }
    }

    #[derive(Default)]
    struct Collector {
        real: Mutex<Vec<i64>>,
    }

    impl FrameSink for Collector {
        fn release(&self, _frame: Frame, real_pts: i64) {
            self.real.lock().unwrap().push(real_pts);
        }
    }

    #[test]
    fn flush_drains_all_submitted_work_in_order() {
        let config = EngineConfig { detector_workers: 4, ..EngineConfig::default() };
        let sink = Arc::new(Collector::default());

        struct Fwd(Arc<Collector>);
        impl FrameSink for Fwd {
            fn release(&self, frame: Frame, real_pts: i64) {
                self.0.release(frame, real_pts);
            }
        }

        let mut scheduler =
            DetectionScheduler::new(&config, Arc::new(AlwaysMotion), Box::new(Fwd(sink.clone())));

        for i in 0..15 {
            scheduler.submit(test_frame(i * 50_000_000));
        }
        scheduler.flush();

        let released = sink.real.lock().unwrap().clone();
        assert!(!released.is_empty(), "motion frames must reach the sink");
        assert!(released.windows(2).all(|p| p[1] > p[0]), "out of order: {released:?}");

        // The barrier left nothing behind: a second flush acks immediately
        // and releases nothing new.
        scheduler.flush();
        assert_eq!(sink.real.lock().unwrap().len(), released.len());

        scheduler.terminate();
    }

    #[test]
    fn submission_restarts_cleanly_after_flush() {
        let config = EngineConfig::default();
        let sink = Arc::new(Collector::default());

        struct Fwd(Arc<Collector>);
        impl FrameSink for Fwd {
            fn release(&self, frame: Frame, real_pts: i64) {
                self.0.release(frame, real_pts);
            }
        }

        let mut scheduler =
            DetectionScheduler::new(&config, Arc::new(AlwaysMotion), Box::new(Fwd(sink.clone())));

        for i in 0..6 {
            scheduler.submit(test_frame(i * 50_000_000));
        }
        scheduler.flush();

        // Timestamps restart from zero: legal, because the flush reset the
        // monotonicity anchor with everything else.
        for i in 0..6 {
            scheduler.submit(test_frame(i * 50_000_000));
        }
        scheduler.flush();
        scheduler.terminate();

        let released = sink.real.lock().unwrap().clone();
        assert!(released.len() >= 2);
    }
}
