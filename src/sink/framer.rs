//! Newline framing of the raw log byte stream.
//!
//! The encoder writes arbitrary slices; a single log line may arrive across
//! several writes, and a single read may hold several lines. [`LineFramer`]
//! accumulates bytes into the in-flight [`LogMessage`] and yields it once its
//! terminator shows up. `\r\n` endings are accepted and the `\r` dropped.

use crate::sink::bridge::ProducerBridge;
use crate::sink::pool::{BufferPool, LogMessage};
use std::io::{self, Read};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

pub struct LineFramer {
    pool: Arc<BufferPool>,
    current: Option<LogMessage>,
}

impl LineFramer {
    pub fn new(pool: Arc<BufferPool>) -> Self {
        Self {
            pool,
            current: None,
        }
    }

    /// Splits `chunk` into completed lines. Bytes after the last terminator
    /// stay in the in-flight message until a later chunk completes it.
    pub fn feed<'a>(&'a mut self, chunk: &'a [u8]) -> Lines<'a> {
        Lines {
            framer: self,
            rest: chunk,
        }
    }

    /// Length of the unterminated line under assembly, if any.
    pub fn pending_len(&self) -> Option<usize> {
        self.current.as_ref().map(LogMessage::len)
    }

    /// Drops the line under assembly, returning its buffer to the pool.
    pub fn discard(&mut self) -> Option<usize> {
        let message = self.current.take()?;
        let len = message.len();
        self.pool.release(message);
        Some(len)
    }
}

/// Completed lines of one chunk, see [`LineFramer::feed`].
pub struct Lines<'a> {
    framer: &'a mut LineFramer,
    rest: &'a [u8],
}

impl Iterator for Lines<'_> {
    type Item = LogMessage;

    fn next(&mut self) -> Option<LogMessage> {
        if self.rest.is_empty() {
            return None;
        }

        let pool = &self.framer.pool;
        let message = self.framer.current.get_or_insert_with(|| pool.acquire());

        match self.rest.iter().position(|&b| b == b'\n') {
            Some(end) => {
                message.extend_from_slice(&self.rest[..end]);
                message.strip_suffix(b'\r');
                self.rest = &self.rest[end + 1..];
                self.framer.current.take()
            }
            None => {
                // partial line, keep accumulating
                message.extend_from_slice(self.rest);
                self.rest = &[];
                None
            }
        }
    }
}

/// Reads `reader` until the stream ends, handing every completed line to `bridge`.
///
/// Returns when the stream is closed, when the read fails, or when the
/// shutdown signal wins an enqueue race. A line still under assembly at
/// that point is discarded.
pub(crate) fn read_loop<R: Read>(
    mut reader: R,
    mut framer: LineFramer,
    bridge: &ProducerBridge,
    shutdown: &CancellationToken,
    chunk_size: usize,
) {
    debug!("read loop started");

    let mut chunk = vec![0u8; chunk_size.max(1)];

    'read: loop {
        let n = match reader.read(&mut chunk) {
            Ok(0) => {
                debug!("kafka logger read loop finished with end of stream");
                break;
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                debug!("kafka logger read loop finished with closed pipe");
                break;
            }
            Err(e) => {
                error!(
                    error = %e,
                    "kafka logger read loop failed with unexpected error: err={}",
                    e
                );
                break;
            }
        };

        for message in framer.feed(&chunk[..n]) {
            if let Err(skipped) = bridge.enqueue(message, shutdown) {
                debug!(skipped_message = %skipped, "kafka logger is closed");
                bridge.release(skipped);
                break 'read;
            }
            trace!("send message");
        }

        if let Some(pending) = framer.pending_len() {
            trace!(pending, "read partial line");
        }
    }

    if let Some(bytes) = framer.discard() {
        debug!(bytes, "discarded unterminated line");
    }

    debug!("read loop stopped");
}
