//! Asynchronous disk writer.
//!
//! A single consumer thread performs every blocking file write and close so
//! no latency-sensitive stage ever touches the filesystem. Producers copy
//! their bytes into pooled buffers and enqueue operations; the file object
//! itself travels to the writer thread on the same FIFO queue, which
//! guarantees it is adopted before any write that references it.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use crossbeam_channel::{Receiver, Sender, bounded};
use tracing::{debug, error, warn};

use crate::pool::BufferPool;

/// Identifier for a file owned by the writer thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileHandle(u64);

enum IoOp {
    /// Hand a freshly opened file over to the writer thread.
    Adopt { handle: u64, file: File },
    Write { handle: u64, buffer: Box<[u8]>, len: usize },
    CloseFile { handle: u64 },
    Finalize,
}

/// Owner of the writer thread; cloneable access goes through [`WriterHandle`].
pub struct AsyncWriter {
    handle: WriterHandle,
    thread: Option<thread::JoinHandle<()>>,
}

#[derive(Clone)]
pub struct WriterHandle {
    ops: Sender<IoOp>,
    pool: BufferPool,
    next_handle: Arc<AtomicU64>,
}

impl AsyncWriter {
    pub fn new(buffer_count: usize, buffer_size: usize) -> Self {
        let pool = BufferPool::new(buffer_count, buffer_size);
        let (ops_tx, ops_rx) = bounded(buffer_count * 2);
        let thread_pool = pool.clone();
        let thread = thread::Builder::new()
            .name("async-writer".into())
            .spawn(move || writer_loop(ops_rx, thread_pool))
            .expect("failed to spawn writer thread");
        Self {
            handle: WriterHandle { ops: ops_tx, pool, next_handle: Arc::new(AtomicU64::new(1)) },
            thread: Some(thread),
        }
    }

    pub fn handle(&self) -> WriterHandle {
        self.handle.clone()
    }

    /// Enqueue `Finalize` and join the writer thread. Anything left queued
    /// afterwards is a caller protocol violation and is logged by the thread.
    pub fn terminate(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = self.handle.ops.send(IoOp::Finalize);
            if thread.join().is_err() {
                error!("writer thread terminated by a fatal I/O error");
            }
        }
    }
}

impl Drop for AsyncWriter {
    fn drop(&mut self) {
        self.terminate();
    }
}

impl WriterHandle {
    /// Create `path` and register it with the writer thread, returning the
    /// handle used for subsequent writes.
    pub fn open(&self, path: &Path) -> io::Result<FileHandle> {
        let file = File::create(path)?;
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.ops
            .send(IoOp::Adopt { handle, file })
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "writer thread gone"))?;
        Ok(FileHandle(handle))
    }

    /// Copy `bytes` into pooled buffers and enqueue them for writing,
    /// chunking when the payload exceeds one buffer. Blocks only on buffer
    /// starvation, never on the disk itself.
    pub fn write(&self, handle: FileHandle, bytes: &[u8]) {
        for chunk in bytes.chunks(self.pool.buffer_size()) {
            let mut buffer = self.pool.borrow();
            buffer[..chunk.len()].copy_from_slice(chunk);
            if self
                .ops
                .send(IoOp::Write { handle: handle.0, buffer, len: chunk.len() })
                .is_err()
            {
                warn!("write dropped: writer thread is gone");
                return;
            }
        }
    }

    /// Schedule an asynchronous close; always succeeds from the caller's
    /// perspective.
    pub fn close_file(&self, handle: FileHandle) {
        if self.ops.send(IoOp::CloseFile { handle: handle.0 }).is_err() {
            warn!("close dropped: writer thread is gone");
        }
    }
}

fn writer_loop(ops: Receiver<IoOp>, pool: BufferPool) {
    let mut files: HashMap<u64, File> = HashMap::new();

    for op in ops.iter() {
        match op {
            IoOp::Adopt { handle, file } => {
                if files.insert(handle, file).is_some() {
                    // Handles are allocated from an atomic counter; a
                    // collision means memory corruption somewhere upstream.
                    panic!("duplicate writer file handle {handle}");
                }
            }
            IoOp::Write { handle, buffer, len } => {
                let file = files
                    .get_mut(&handle)
                    .unwrap_or_else(|| panic!("write to unknown file handle {handle}"));
                perform_write(file, &buffer[..len]);
                pool.recycle(buffer);
                metrics::counter!("watcher_bytes_written_total").increment(len as u64);
            }
            IoOp::CloseFile { handle } => {
                match files.remove(&handle) {
                    Some(file) => drop(file),
                    None => warn!("close of unknown file handle {handle}"),
                }
                debug!("closed file handle {handle}");
            }
            IoOp::Finalize => break,
        }
    }

    if !ops.is_empty() {
        warn!("async writer still has pending operations after finalization");
    }
    if !files.is_empty() {
        warn!("{} file(s) left open at writer finalization", files.len());
    }
}

/// A short write has no recovery strategy: the container byte stream would
/// be silently truncated mid-structure, so it is a hard stop.
fn perform_write(file: &mut File, bytes: &[u8]) {
    let written = file
        .write(bytes)
        .unwrap_or_else(|err| panic!("async file write failed: {err}"));
    if written != bytes.len() {
        panic!("short write: {written} of {} bytes", bytes.len());
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn writes_and_closes_through_the_thread() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");

        let mut writer = AsyncWriter::new(4, 8);
        let handle = writer.handle();
        let file = handle.open(&path).unwrap();
        // Larger than one pooled buffer, forcing a chunked write.
        handle.write(file, b"0123456789abcdef0123");
        handle.close_file(file);
        writer.terminate();

        assert_eq!(fs::read(&path).unwrap(), b"0123456789abcdef0123");
    }

    #[test]
    fn interleaved_files_keep_their_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = AsyncWriter::new(2, 4);
        let handle = writer.handle();

        let a = handle.open(&dir.path().join("a.bin")).unwrap();
        let b = handle.open(&dir.path().join("b.bin")).unwrap();
        handle.write(a, b"aaaa");
        handle.write(b, b"bb");
        handle.write(a, b"AA");
        handle.close_file(a);
        handle.close_file(b);
        writer.terminate();

        assert_eq!(fs::read(dir.path().join("a.bin")).unwrap(), b"aaaaAA");
        assert_eq!(fs::read(dir.path().join("b.bin")).unwrap(), b"bb");
    }
}
