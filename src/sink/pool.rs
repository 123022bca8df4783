//! Reusable line buffers.
//!
//! Every framed log line travels through the pipeline inside a
//! [`LogMessage`] taken from a per-sink [`BufferPool`]. A message has a
//! single owner at any time and [`BufferPool::release`] consumes it, so a
//! buffer cannot be handed back twice.

use bytes::BytesMut;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// One framed log line, without its terminator.
#[derive(Debug)]
pub struct LogMessage {
    buf: BytesMut,
}

impl LogMessage {
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub(crate) fn strip_suffix(&mut self, byte: u8) {
        if self.buf.last() == Some(&byte) {
            self.buf.truncate(self.buf.len() - 1);
        }
    }
}

impl AsRef<[u8]> for LogMessage {
    fn as_ref(&self) -> &[u8] {
        &self.buf
    }
}

impl fmt::Display for LogMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.buf))
    }
}

/// Point-in-time counters of a [`BufferPool`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub acquired: u64,
    pub released: u64,
    /// Acquisitions served from the free list instead of a new allocation
    pub reused: u64,
}

impl PoolStats {
    pub fn outstanding(&self) -> u64 {
        self.acquired.saturating_sub(self.released)
    }
}

/// Free list of line buffers shared by the framer and both confirmation loops.
pub struct BufferPool {
    free: Mutex<Vec<BytesMut>>,
    buffer_capacity: usize,
    max_idle: usize,
    acquired: AtomicU64,
    released: AtomicU64,
    reused: AtomicU64,
}

impl BufferPool {
    pub fn new(buffer_capacity: usize, max_idle: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            buffer_capacity,
            max_idle,
            acquired: AtomicU64::new(0),
            released: AtomicU64::new(0),
            reused: AtomicU64::new(0),
        }
    }

    /// Returns an empty message, reusing an idle buffer when one is available.
    pub fn acquire(&self) -> LogMessage {
        self.acquired.fetch_add(1, Ordering::Relaxed);
        let buf = match self.free.lock().pop() {
            Some(buf) => {
                self.reused.fetch_add(1, Ordering::Relaxed);
                buf
            }
            None => BytesMut::with_capacity(self.buffer_capacity),
        };
        LogMessage { buf }
    }

    /// Truncates the message and keeps its allocation for a later [`acquire`](Self::acquire).
    pub fn release(&self, message: LogMessage) {
        let mut buf = message.buf;
        buf.clear();
        self.released.fetch_add(1, Ordering::Relaxed);

        let mut free = self.free.lock();
        if free.len() < self.max_idle {
            free.push(buf);
        }
    }

    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            acquired: self.acquired.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_capacity", &self.buffer_capacity)
            .field("max_idle", &self.max_idle)
            .field("stats", &self.stats())
            .finish()
    }
}
