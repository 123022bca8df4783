//! The Kafka log sink.
//!
//! [`LogSink`] is a plain [`std::io::Write`] target: anything that can write
//! bytes (a `tracing-subscriber` fmt layer, a process's stdout) can drive it.
//! Each write is queued in memory and returns; a framing thread splits the
//! stream into lines and hands them to the producer, whose confirmations
//! release the line buffers again.
//!
//! ```text
//! Write ─▶ byte queue ─▶ LineFramer ─▶ producer input ─▶ Kafka
//!                                         │
//!                      success loop ◀─────┤
//!                      error loop   ◀─────┘
//! ```
//!
//! The sink reports its own problems on a separate console logger, passed in
//! as a [`tracing::Dispatch`], and never through the dispatcher it may be
//! installed in.
//!
//! # Example
//!
//! ```rust,no_run
//! use log_shipper::{logging, KafkaConfig, LogSink};
//! use std::io::Write;
//!
//! # fn main() -> log_shipper::Result<()> {
//! let config = KafkaConfig::new(vec!["localhost:9092".to_string()], "app-logs");
//! let sink = LogSink::new(config, logging::console(false, false))?;
//!
//! (&sink).write_all(b"{\"level\":\"INFO\",\"message\":\"hello\"}\n")?;
//! sink.close()?;
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod framer;
pub mod pipe;
pub mod pool;
pub mod shutdown;

pub use bridge::ProducerBridge;
pub use framer::LineFramer;
pub use pool::{BufferPool, LogMessage, PoolStats};
pub use shutdown::SinkState;

use crate::config::KafkaConfig;
use crate::kafka::{AsyncProducer, KafkaProducer};
use crate::Result;
use pipe::{pipe, PipeWriter};
use shutdown::{ShutdownCoordinator, Workers};
use std::io;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;
use tracing::instrument::WithSubscriber;
use tracing::{debug, warn, Dispatch};

const RUNTIME_WORKERS: usize = 2;

/// Writer that tees log bytes to a Kafka topic.
pub struct LogSink {
    queue: PipeWriter,
    pool: Arc<BufferPool>,
    producer: Arc<dyn AsyncProducer>,
    coordinator: ShutdownCoordinator,
    console: Dispatch,
    namespace: String,
}

impl LogSink {
    /// Connects a [`KafkaProducer`] and starts the pipeline.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the configuration is invalid or the Kafka client
    /// cannot be created. Broker reachability is not checked here.
    pub fn new(config: KafkaConfig, console: Dispatch) -> Result<Self> {
        let producer = KafkaProducer::new(&config, &console)?;
        Self::with_producer(&config, producer, console)
    }

    /// Starts the pipeline on top of any [`AsyncProducer`].
    pub fn with_producer<P: AsyncProducer>(
        config: &KafkaConfig,
        producer: P,
        console: Dispatch,
    ) -> Result<Self> {
        config.validate()?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(RUNTIME_WORKERS)
            .thread_name("log-shipper")
            .enable_all()
            .build()?;

        let producer: Arc<dyn AsyncProducer> = Arc::new(producer);
        let pool = Arc::new(BufferPool::new(config.buffer_capacity, config.max_idle_buffers));
        let (queue, reader) = pipe(config.queue_capacity);
        let signal = CancellationToken::new();

        let workers = match Self::spawn_workers(
            &runtime,
            producer.as_ref(),
            reader,
            pool.clone(),
            signal.clone(),
            config.read_chunk_size,
            config.close_timeout(),
            &console,
        ) {
            Ok(workers) => workers,
            Err(e) => {
                runtime.shutdown_background();
                return Err(e);
            }
        };

        tracing::dispatcher::with_default(&console, || {
            debug!(topic = %config.topic, "kafka logger started");
        });

        Ok(Self {
            queue,
            pool,
            producer,
            coordinator: ShutdownCoordinator::new(signal, runtime, workers),
            console,
            namespace: config.namespace.clone(),
        })
    }

    fn spawn_workers(
        runtime: &Runtime,
        producer: &dyn AsyncProducer,
        reader: pipe::PipeReader,
        pool: Arc<BufferPool>,
        signal: CancellationToken,
        chunk_size: usize,
        grace: Duration,
        console: &Dispatch,
    ) -> Result<Workers> {
        let channels = producer.start(runtime.handle())?;

        let errors = runtime.spawn(
            ProducerBridge::error_loop(channels.errors, pool.clone()).with_subscriber(console.clone()),
        );
        let successes = runtime.spawn(
            ProducerBridge::success_loop(channels.successes, pool.clone())
                .with_subscriber(console.clone()),
        );

        let bridge = ProducerBridge::new(
            channels.input,
            pool.clone(),
            runtime.handle().clone(),
            grace,
        );
        let line_framer = LineFramer::new(pool);
        let framer_console = console.clone();

        let framer = thread::Builder::new()
            .name("log-shipper-framer".to_string())
            .spawn(move || {
                tracing::dispatcher::with_default(&framer_console, || {
                    framer::read_loop(reader, line_framer, &bridge, &signal, chunk_size)
                })
            })?;

        Ok(Workers {
            framer,
            successes,
            errors,
        })
    }

    /// Stops the pipeline and returns the producer's close error, if any.
    ///
    /// Lines already handed to the producer are settled first; an
    /// unterminated trailing line is dropped. Writes after `close` succeed
    /// without doing anything. Calling `close` again returns `Ok(())`.
    pub fn close(&self) -> Result<()> {
        tracing::dispatcher::with_default(&self.console, || {
            self.coordinator.shutdown(&self.queue, self.producer.as_ref())
        })
    }

    /// Namespace tag of this sink, empty when none is configured.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn state(&self) -> SinkState {
        self.coordinator.state()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }
}

impl io::Write for &LogSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.queue.write(buf) {
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                tracing::dispatcher::with_default(&self.console, || {
                    debug!("skip Write due to closed pipe");
                });
                Ok(buf.len())
            }
            other => other,
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl io::Write for LogSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&*self).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for LogSink {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::dispatcher::with_default(&self.console, || {
                warn!(error = %e, "kafka logger close on drop failed");
            });
        }
    }
}
