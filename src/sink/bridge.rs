use crate::kafka::ProducerError;
use crate::sink::pool::{BufferPool, LogMessage};
use std::cell::Cell;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, error::SendError, Permit};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

/// Connects the framer to the producer input and returns confirmed buffers to the pool.
pub struct ProducerBridge {
    input: mpsc::Sender<LogMessage>,
    pool: Arc<BufferPool>,
    runtime: Handle,
    grace: Duration,
    drain_deadline: Cell<Option<Instant>>,
}

impl ProducerBridge {
    /// `grace` bounds how long, in total, enqueues keep waiting for input
    /// capacity once shutdown has been signalled.
    pub fn new(
        input: mpsc::Sender<LogMessage>,
        pool: Arc<BufferPool>,
        runtime: Handle,
        grace: Duration,
    ) -> Self {
        Self {
            input,
            pool,
            runtime,
            grace,
            drain_deadline: Cell::new(None),
        }
    }

    /// Submits `message` to the producer input, racing a full input against `shutdown`.
    ///
    /// Free input capacity always wins. After shutdown the framer keeps
    /// handing over lines until the grace period that started with the first
    /// lost race runs out, so a healthy producer still receives every framed
    /// line while a stalled one cannot hold up close. The message comes back
    /// as `Err` when the grace period is over or the producer has gone away.
    /// Must not be called from async code.
    pub fn enqueue(
        &self,
        message: LogMessage,
        shutdown: &CancellationToken,
    ) -> Result<(), LogMessage> {
        self.runtime.block_on(async {
            let message = tokio::select! {
                biased;
                permit = self.input.reserve() => return hand_over(permit, message),
                _ = shutdown.cancelled() => message,
            };

            let deadline = self.drain_deadline();
            match tokio::time::timeout_at(deadline, self.input.reserve()).await {
                Ok(permit) => hand_over(permit, message),
                Err(_) => Err(message),
            }
        })
    }

    fn drain_deadline(&self) -> Instant {
        match self.drain_deadline.get() {
            Some(deadline) => deadline,
            None => {
                let deadline = Instant::now() + self.grace;
                debug!(grace_ms = self.grace.as_millis() as u64, "kafka logger draining");
                self.drain_deadline.set(Some(deadline));
                deadline
            }
        }
    }

    pub fn release(&self, message: LogMessage) {
        self.pool.release(message);
    }

    /// Releases every delivered message until the producer closes its success channel.
    pub async fn success_loop(mut successes: mpsc::Receiver<LogMessage>, pool: Arc<BufferPool>) {
        debug!("success loop started");
        while let Some(message) = successes.recv().await {
            trace!(bytes = message.len(), "log line delivered");
            pool.release(message);
        }
        debug!("success loop stopped");
    }

    /// Logs undelivered messages to the console, then releases them.
    pub async fn error_loop(mut errors: mpsc::Receiver<ProducerError>, pool: Arc<BufferPool>) {
        debug!("error loop started");
        while let Some(ProducerError { message, error }) = errors.recv().await {
            error!(
                log_entry = %message,
                error = %error,
                "kafka log failed: err={}",
                error
            );
            pool.release(message);
        }
        debug!("error loop stopped");
    }
}

fn hand_over(
    permit: Result<Permit<'_, LogMessage>, SendError<()>>,
    message: LogMessage,
) -> Result<(), LogMessage> {
    match permit {
        Ok(permit) => {
            permit.send(message);
            Ok(())
        }
        Err(_) => Err(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdkafka::error::{KafkaError, RDKafkaErrorCode};
    use std::io::Write;
    use std::sync::Mutex;
    use tracing::instrument::WithSubscriber;

    const GRACE: Duration = Duration::from_millis(50);

    fn message(pool: &BufferPool, text: &str) -> LogMessage {
        let mut message = pool.acquire();
        message.extend_from_slice(text.as_bytes());
        message
    }

    #[test]
    fn test_enqueue_hands_message_to_input() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let pool = Arc::new(BufferPool::new(16, 4));
        let (tx, mut rx) = mpsc::channel(4);
        let bridge = ProducerBridge::new(tx, pool.clone(), runtime.handle().clone(), GRACE);

        bridge
            .enqueue(message(&pool, "hello"), &CancellationToken::new())
            .unwrap();

        assert_eq!(rx.try_recv().unwrap().to_string(), "hello");
    }

    #[test]
    fn test_enqueue_returns_message_when_shutdown_wins() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let pool = Arc::new(BufferPool::new(16, 4));
        let (tx, _rx) = mpsc::channel(1);
        let bridge = ProducerBridge::new(tx, pool.clone(), runtime.handle().clone(), GRACE);
        let shutdown = CancellationToken::new();

        bridge.enqueue(message(&pool, "fills input"), &shutdown).unwrap();

        let trigger = shutdown.clone();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(50));
            trigger.cancel();
        });

        let skipped = bridge.enqueue(message(&pool, "blocked"), &shutdown).unwrap_err();
        assert_eq!(skipped.to_string(), "blocked");
        canceller.join().unwrap();
    }

    #[test]
    fn test_enqueue_keeps_draining_after_shutdown() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let pool = Arc::new(BufferPool::new(16, 4));
        let (tx, mut rx) = mpsc::channel(1);
        let bridge =
            ProducerBridge::new(tx, pool.clone(), runtime.handle().clone(), Duration::from_secs(5));
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let consumer_pool = pool.clone();
        let consumer = runtime.spawn(async move {
            let mut received = Vec::new();
            while let Some(message) = rx.recv().await {
                received.push(message.to_string());
                consumer_pool.release(message);
            }
            received
        });

        for i in 0..20 {
            bridge
                .enqueue(message(&pool, &format!("line {}", i)), &shutdown)
                .unwrap();
        }
        drop(bridge);

        let received = runtime.block_on(consumer).unwrap();
        let expected: Vec<String> = (0..20).map(|i| format!("line {}", i)).collect();
        assert_eq!(received, expected);
        assert_eq!(pool.stats().outstanding(), 0);
    }

    #[test]
    fn test_grace_period_is_shared_across_enqueues() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let pool = Arc::new(BufferPool::new(16, 4));
        let (tx, _rx) = mpsc::channel(1);
        let bridge = ProducerBridge::new(tx, pool.clone(), runtime.handle().clone(), GRACE);
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        bridge.enqueue(message(&pool, "fits"), &shutdown).unwrap();

        let started = std::time::Instant::now();
        let first = bridge.enqueue(message(&pool, "waits"), &shutdown).unwrap_err();
        assert!(started.elapsed() >= GRACE);

        let started = std::time::Instant::now();
        let second = bridge.enqueue(message(&pool, "gives up"), &shutdown).unwrap_err();
        assert!(started.elapsed() < GRACE);

        bridge.release(first);
        bridge.release(second);
    }

    #[test]
    fn test_enqueue_fails_when_producer_is_gone() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let pool = Arc::new(BufferPool::new(16, 4));
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let bridge = ProducerBridge::new(tx, pool.clone(), runtime.handle().clone(), GRACE);

        let returned = bridge
            .enqueue(message(&pool, "orphan"), &CancellationToken::new())
            .unwrap_err();
        bridge.release(returned);
        assert_eq!(pool.stats().outstanding(), 0);
    }

    #[tokio::test]
    async fn test_success_loop_releases_until_closed() {
        let pool = Arc::new(BufferPool::new(16, 4));
        let (tx, rx) = mpsc::channel(4);

        tx.send(message(&pool, "a")).await.unwrap();
        tx.send(message(&pool, "b")).await.unwrap();
        drop(tx);

        ProducerBridge::success_loop(rx, pool.clone()).await;
        assert_eq!(pool.stats().released, 2);
        assert_eq!(pool.stats().outstanding(), 0);
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_error_loop_logs_entry_and_cause() {
        let pool = Arc::new(BufferPool::new(16, 4));
        let (tx, rx) = mpsc::channel(4);
        let captured = Captured::default();
        let writer = captured.clone();
        let console = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();

        tx.send(ProducerError {
            message: message(&pool, "X"),
            error: KafkaError::MessageProduction(RDKafkaErrorCode::MessageTimedOut),
        })
        .await
        .unwrap();
        drop(tx);

        ProducerBridge::error_loop(rx, pool.clone())
            .with_subscriber(console)
            .await;

        let output = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("ERROR"));
        assert!(output.contains("log_entry=X"));
        assert!(output.contains("kafka log failed"));
        assert!(output.contains("timed out"));
        assert_eq!(pool.stats().released, 1);
    }
}
