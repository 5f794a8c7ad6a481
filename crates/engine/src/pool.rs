//! Recycled pool of fixed-size I/O buffers.
//!
//! Every byte headed for disk is copied into a pooled buffer, queued for the
//! writer thread, and the buffer returns here once the physical write is
//! done. The pool never allocates after construction: a caller that cannot
//! borrow a buffer blocks until one is recycled, which bounds total I/O
//! memory at `count * size` bytes.

use crossbeam_channel::{Receiver, Sender, bounded};
use tracing::warn;

#[derive(Clone)]
pub struct BufferPool {
    slots_tx: Sender<Box<[u8]>>,
    slots_rx: Receiver<Box<[u8]>>,
    buffer_size: usize,
    total: usize,
}

impl BufferPool {
    pub fn new(count: usize, buffer_size: usize) -> Self {
        assert!(count > 0 && buffer_size > 0, "buffer pool must be non-empty");
        let (slots_tx, slots_rx) = bounded(count);
        for _ in 0..count {
            slots_tx
                .send(vec![0u8; buffer_size].into_boxed_slice())
                .expect("pool channel sized to hold every buffer");
        }
        Self { slots_tx, slots_rx, buffer_size, total: count }
    }

    /// Take a buffer out of the pool, blocking when all buffers are in
    /// flight. This is the one producer-side call allowed to block; its
    /// callers are already off the capture path.
    pub fn borrow(&self) -> Box<[u8]> {
        match self.slots_rx.try_recv() {
            Ok(buffer) => buffer,
            Err(_) => {
                warn!("ran out of I/O buffers, waiting for a write to finish");
                metrics::counter!("watcher_io_buffer_waits_total").increment(1);
                self.slots_rx
                    .recv()
                    .expect("buffer pool channel closed while pool alive")
            }
        }
    }

    /// Return a buffer after its write completed.
    pub fn recycle(&self, buffer: Box<[u8]>) {
        debug_assert_eq!(buffer.len(), self.buffer_size);
        metrics::gauge!("watcher_io_buffers_free").set(self.slots_rx.len() as f64 + 1.0);
        self.slots_tx
            .send(buffer)
            .expect("buffer pool channel closed while pool alive");
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn total(&self) -> usize {
        self.total
    }

    /// Buffers currently at rest in the pool.
    pub fn pooled(&self) -> usize {
        self.slots_rx.len()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn outstanding_plus_pooled_is_constant() {
        let pool = BufferPool::new(4, 16);
        assert_eq!(pool.pooled(), 4);
        let a = pool.borrow();
        let b = pool.borrow();
        assert_eq!(pool.pooled() + 2, pool.total());
        pool.recycle(a);
        assert_eq!(pool.pooled() + 1, pool.total());
        pool.recycle(b);
        assert_eq!(pool.pooled(), pool.total());
    }

    #[test]
    fn exhausted_borrow_blocks_until_one_return() {
        let pool = BufferPool::new(1, 8);
        let held = pool.borrow();
        assert_eq!(pool.pooled(), 0);

        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || {
                let buffer = pool.borrow();
                pool.recycle(buffer);
            })
        };
        // The waiter cannot finish while the single buffer is held.
        thread::sleep(Duration::from_millis(30));
        assert!(!waiter.is_finished());

        pool.recycle(held);
        waiter.join().unwrap();
        assert_eq!(pool.pooled(), pool.total());
    }
}
