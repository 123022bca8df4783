//! Scriptable in-process [`AsyncProducer`] for tests.
//!
//! Records every message that reaches its input and confirms each one as a
//! success, unless the failure predicate matches. A stalled producer never
//! reads its input until it is closed, which lets tests pin the framer on a
//! full producer input.

use crate::kafka::producer::{AsyncProducer, ProducerChannels, ProducerError};
use crate::sink::LogMessage;
use crate::{Error, Result};
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

type FailWhen = Arc<dyn Fn(&[u8]) -> bool + Send + Sync>;

pub struct MockProducer {
    capacity: usize,
    fail_when: Option<FailWhen>,
    stalled: bool,
    close_error: Option<RDKafkaErrorCode>,
    recorder: MockRecorder,
    closing: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Shared view of what a [`MockProducer`] received.
#[derive(Clone, Default)]
pub struct MockRecorder {
    received: Arc<Mutex<Vec<String>>>,
}

impl MockProducer {
    pub fn new() -> Self {
        Self {
            capacity: 256,
            fail_when: None,
            stalled: false,
            close_error: None,
            recorder: MockRecorder::default(),
            closing: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Capacity of the input and confirmation channels.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Fails delivery of every message whose content matches `predicate`.
    pub fn fail_when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&[u8]) -> bool + Send + Sync + 'static,
    {
        self.fail_when = Some(Arc::new(predicate));
        self
    }

    pub fn stalled(mut self) -> Self {
        self.stalled = true;
        self
    }

    /// Makes [`AsyncProducer::close`] report `code` after settling.
    pub fn with_close_error(mut self, code: RDKafkaErrorCode) -> Self {
        self.close_error = Some(code);
        self
    }

    pub fn recorder(&self) -> MockRecorder {
        self.recorder.clone()
    }
}

impl Default for MockProducer {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRecorder {
    pub fn received(&self) -> Vec<String> {
        self.received.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.received.lock().len()
    }

    /// Polls until at least `count` messages arrived or `timeout` passed.
    pub fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.count() < count {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        true
    }

    fn record(&self, message: &LogMessage) {
        self.received.lock().push(message.to_string());
    }
}

impl AsyncProducer for MockProducer {
    fn start(&self, runtime: &Handle) -> Result<ProducerChannels> {
        let mut slot = self.task.lock();
        if slot.is_some() {
            return Err(Error::Config("mock producer already started".to_string()));
        }

        let (input_tx, mut input_rx) = mpsc::channel::<LogMessage>(self.capacity);
        let (success_tx, success_rx) = mpsc::channel(self.capacity);
        let (error_tx, error_rx) = mpsc::channel(self.capacity);

        let fail_when = self.fail_when.clone();
        let recorder = self.recorder.clone();
        let closing = self.closing.clone();
        let stalled = self.stalled;

        let route = move |message: LogMessage| {
            recorder.record(&message);
            let failed = fail_when
                .as_ref()
                .map(|predicate| predicate(message.as_bytes()))
                .unwrap_or(false);
            (failed, message)
        };

        *slot = Some(runtime.spawn(async move {
            let confirm = |(failed, message): (bool, LogMessage)| {
                let successes = success_tx.clone();
                let errors = error_tx.clone();
                async move {
                    if failed {
                        let error =
                            KafkaError::MessageProduction(RDKafkaErrorCode::BrokerTransportFailure);
                        let _ = errors.send(ProducerError { message, error }).await;
                    } else {
                        let _ = successes.send(message).await;
                    }
                }
            };

            if stalled {
                closing.cancelled().await;
            } else {
                loop {
                    tokio::select! {
                        next = input_rx.recv() => match next {
                            Some(message) => confirm(route(message)).await,
                            None => break,
                        },
                        _ = closing.cancelled() => break,
                    }
                }
            }

            input_rx.close();
            while let Ok(message) = input_rx.try_recv() {
                confirm(route(message)).await;
            }
        }));

        Ok(ProducerChannels {
            input: input_tx,
            successes: success_rx,
            errors: error_rx,
        })
    }

    fn close(&self) -> BoxFuture<'static, Result<()>> {
        self.closing.cancel();
        let handle = self.task.lock().take();
        let close_error = self.close_error;

        async move {
            if let Some(handle) = handle {
                handle.await.map_err(|_| Error::Task {
                    task: "mock-producer",
                })?;
            }
            match close_error {
                Some(code) => Err(Error::Kafka(KafkaError::Flush(code))),
                None => Ok(()),
            }
        }
        .boxed()
    }
}
