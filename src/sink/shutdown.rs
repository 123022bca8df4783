//! Lifecycle of a sink: `Running` → `Draining` → `Closed`.
//!
//! The coordinator owns the shutdown signal, the sink runtime and the join
//! handles of the three background tasks. Shutdown order:
//!
//! 1. fire the signal, so a framer blocked on a full producer input gives up
//!    once the close grace period runs out
//! 2. close both sides of the byte queue, so the framer drains what is
//!    queued and then sees end of stream
//! 3. join the framer
//! 4. close the producer, which settles in-flight messages and closes the
//!    confirmation channels
//! 5. join the success and error loops

use crate::kafka::AsyncProducer;
use crate::sink::pipe::PipeWriter;
use crate::{Error, Result};
use futures::executor::block_on;
use parking_lot::Mutex;
use std::thread;
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkState {
    Running,
    Draining,
    Closed,
}

pub(crate) struct Workers {
    pub framer: thread::JoinHandle<()>,
    pub successes: JoinHandle<()>,
    pub errors: JoinHandle<()>,
}

pub struct ShutdownCoordinator {
    signal: CancellationToken,
    state: Mutex<SinkState>,
    workers: Mutex<Option<(Runtime, Workers)>>,
}

impl ShutdownCoordinator {
    /// `signal` is already shared with the framer; `workers` run on `runtime`.
    pub(crate) fn new(signal: CancellationToken, runtime: Runtime, workers: Workers) -> Self {
        Self {
            signal,
            state: Mutex::new(SinkState::Running),
            workers: Mutex::new(Some((runtime, workers))),
        }
    }

    pub fn state(&self) -> SinkState {
        *self.state.lock()
    }

    /// Runs the shutdown sequence once; later calls return `Ok(())` immediately.
    ///
    /// Returns the producer's close error, if any, or a task failure.
    pub(crate) fn shutdown(&self, queue: &PipeWriter, producer: &dyn AsyncProducer) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state != SinkState::Running {
                debug!(state = ?*state, "kafka logger already closing");
                return Ok(());
            }
            *state = SinkState::Draining;
        }

        self.signal.cancel();
        queue.close();
        queue.close_read();

        let Some((runtime, workers)) = self.workers.lock().take() else {
            *self.state.lock() = SinkState::Closed;
            return Ok(());
        };

        let mut failure = None;
        if workers.framer.join().is_err() {
            warn!("framer thread panicked");
            failure = Some(Error::Task { task: "framer" });
        }

        let closed = match block_on(runtime.spawn(producer.close())) {
            Ok(result) => result,
            Err(_) => Err(Error::Task {
                task: "producer-close",
            }),
        };
        info!(error = ?closed.as_ref().err(), "kafka logger producer closed");

        for (task, handle) in [("success-loop", workers.successes), ("error-loop", workers.errors)] {
            if block_on(handle).is_err() {
                warn!(task, "confirmation loop panicked");
                failure.get_or_insert(Error::Task { task });
            }
        }

        runtime.shutdown_background();
        *self.state.lock() = SinkState::Closed;
        debug!("kafka logger closed");

        closed?;
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
