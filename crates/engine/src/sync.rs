//! Small synchronization helpers shared by the pipeline stages.

use std::sync::{Condvar, Mutex};

use crossbeam_channel::{Receiver, Sender, bounded};

/// Create a one-shot acknowledgment pair for synchronous barriers: the
/// requester blocks on the waiter until the serving thread consumes the
/// request and acks.
pub(crate) fn ack_channel() -> (AckSender, AckWaiter) {
    let (tx, rx) = bounded(1);
    (AckSender(tx), AckWaiter(rx))
}

pub(crate) struct AckSender(Sender<()>);

impl AckSender {
    /// Signal the waiting side. Consumes the sender; an ack happens once.
    pub(crate) fn ack(self) {
        let _ = self.0.send(());
    }
}

pub(crate) struct AckWaiter(Receiver<()>);

impl AckWaiter {
    /// Block until the serving side acks. Returns normally if the serving
    /// side disappeared, since there is nothing left to wait for.
    pub(crate) fn wait(self) {
        let _ = self.0.recv();
    }
}

/// Counter of queued-plus-running worker jobs with a blocking wait for
/// quiescence. Incremented at dispatch, decremented after the completion
/// has been pushed downstream, so `wait_zero` returning means every result
/// is already on the control queue.
pub(crate) struct InflightGauge {
    count: Mutex<usize>,
    idle: Condvar,
}

impl InflightGauge {
    pub(crate) fn new() -> Self {
        Self { count: Mutex::new(0), idle: Condvar::new() }
    }

    pub(crate) fn inc(&self) {
        let mut count = self.count.lock().expect("in-flight gauge poisoned");
        *count += 1;
    }

    pub(crate) fn dec(&self) {
        let mut count = self.count.lock().expect("in-flight gauge poisoned");
        *count = count.checked_sub(1).expect("in-flight gauge underflow");
        if *count == 0 {
            self.idle.notify_all();
        }
    }

    pub(crate) fn current(&self) -> usize {
        *self.count.lock().expect("in-flight gauge poisoned")
    }

    pub(crate) fn wait_zero(&self) {
        let mut count = self.count.lock().expect("in-flight gauge poisoned");
        while *count > 0 {
            count = self.idle.wait(count).expect("in-flight gauge poisoned");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn ack_unblocks_waiter() {
        let (ack, waiter) = ack_channel();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            ack.ack();
        });
        waiter.wait();
        handle.join().unwrap();
    }

    #[test]
    fn wait_zero_returns_after_last_dec() {
        let gauge = Arc::new(InflightGauge::new());
        gauge.inc();
        gauge.inc();
        let worker = {
            let gauge = gauge.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                gauge.dec();
                thread::sleep(Duration::from_millis(10));
                gauge.dec();
            })
        };
        gauge.wait_zero();
        assert_eq!(gauge.current(), 0);
        worker.join().unwrap();
    }
}
