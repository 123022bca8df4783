//! In-memory byte queue between `Write` callers and the framing thread.
//!
//! A fixed-capacity blocking buffer with one logical writer and one reader.
//! Each `write` holds the writer lock for its whole duration, so bytes from
//! concurrent callers never interleave inside the queue.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::io::{self, Read};
use std::sync::Arc;

struct State {
    buf: VecDeque<u8>,
    write_closed: bool,
    read_closed: bool,
}

struct Shared {
    state: Mutex<State>,
    readable: Condvar,
    writable: Condvar,
    capacity: usize,
}

/// Creates a connected writer/reader pair holding at most `capacity` unread bytes.
pub fn pipe(capacity: usize) -> (PipeWriter, PipeReader) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            buf: VecDeque::with_capacity(capacity),
            write_closed: false,
            read_closed: false,
        }),
        readable: Condvar::new(),
        writable: Condvar::new(),
        capacity: capacity.max(1),
    });

    (
        PipeWriter {
            shared: shared.clone(),
            write_lock: Mutex::new(()),
        },
        PipeReader { shared },
    )
}

fn closed_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "write on closed pipe")
}

pub struct PipeWriter {
    shared: Arc<Shared>,
    write_lock: Mutex<()>,
}

impl PipeWriter {
    /// Blocks until all of `buf` is queued or either side is closed.
    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let _writer = self.write_lock.lock();
        let mut state = self.shared.state.lock();
        let mut written = 0;

        loop {
            if state.write_closed || state.read_closed {
                return Err(closed_pipe());
            }
            if written == buf.len() {
                return Ok(written);
            }

            let room = self.shared.capacity - state.buf.len();
            if room == 0 {
                self.shared.writable.wait(&mut state);
                continue;
            }

            let n = room.min(buf.len() - written);
            state.buf.extend(&buf[written..written + n]);
            written += n;
            self.shared.readable.notify_one();
        }
    }

    /// Closes the write side. Queued bytes stay readable, then reads report end of stream.
    pub fn close(&self) {
        let mut state = self.shared.state.lock();
        state.write_closed = true;
        self.shared.readable.notify_all();
        self.shared.writable.notify_all();
    }

    /// Closes the read side. A blocked read fails with `BrokenPipe` once nothing is queued.
    pub fn close_read(&self) {
        let mut state = self.shared.state.lock();
        state.read_closed = true;
        self.shared.readable.notify_all();
        self.shared.writable.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        let state = self.shared.state.lock();
        state.write_closed || state.read_closed
    }
}

pub struct PipeReader {
    shared: Arc<Shared>,
}

impl Read for PipeReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }

        let mut state = self.shared.state.lock();
        loop {
            if !state.buf.is_empty() {
                let n = out.len().min(state.buf.len());
                for (slot, byte) in out.iter_mut().zip(state.buf.drain(..n)) {
                    *slot = byte;
                }
                self.shared.writable.notify_one();
                return Ok(n);
            }
            if state.read_closed {
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "read on closed pipe",
                ));
            }
            if state.write_closed {
                return Ok(0);
            }
            self.shared.readable.wait(&mut state);
        }
    }
}
