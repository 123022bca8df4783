use crate::config::KafkaConfig;
use crate::kafka::version::KafkaVersion;
use crate::sink::LogMessage;
use crate::{Error, Result};
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use rdkafka::client::ClientContext;
use rdkafka::config::RDKafkaLogLevel;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer, PurgeConfig};
use rdkafka::ClientConfig;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::instrument::WithSubscriber;
use tracing::{debug, error, info, warn, Dispatch};

const QUEUE_FULL_BACKOFF: Duration = Duration::from_millis(100);

/// A message the broker client could not deliver.
#[derive(Debug)]
pub struct ProducerError {
    pub message: LogMessage,
    pub error: KafkaError,
}

/// Channels of a started producer.
///
/// Every message sent on `input` comes back exactly once, either on
/// `successes` or on `errors`. Both confirmation channels close after
/// [`AsyncProducer::close`] has settled the last message.
pub struct ProducerChannels {
    pub input: mpsc::Sender<LogMessage>,
    pub successes: mpsc::Receiver<LogMessage>,
    pub errors: mpsc::Receiver<ProducerError>,
}

/// Broker client with an asynchronous input and per-message confirmations.
pub trait AsyncProducer: Send + Sync + 'static {
    /// Spawns the producer's tasks on `runtime`. Called once per producer.
    fn start(&self, runtime: &Handle) -> Result<ProducerChannels>;

    /// Stops intake, settles in-flight messages and closes both confirmation channels.
    fn close(&self) -> BoxFuture<'static, Result<()>>;
}

/// Routes librdkafka's own logs and client errors to the console logger.
pub struct ConsoleContext {
    console: Dispatch,
}

impl ClientContext for ConsoleContext {
    fn log(&self, level: RDKafkaLogLevel, fac: &str, log_message: &str) {
        tracing::dispatcher::with_default(&self.console, || match level {
            RDKafkaLogLevel::Emerg
            | RDKafkaLogLevel::Alert
            | RDKafkaLogLevel::Critical
            | RDKafkaLogLevel::Error => error!(facility = fac, "librdkafka: {}", log_message),
            RDKafkaLogLevel::Warning => warn!(facility = fac, "librdkafka: {}", log_message),
            RDKafkaLogLevel::Notice | RDKafkaLogLevel::Info => {
                info!(facility = fac, "librdkafka: {}", log_message)
            }
            RDKafkaLogLevel::Debug => debug!(facility = fac, "librdkafka: {}", log_message),
        });
    }

    fn error(&self, error: KafkaError, reason: &str) {
        tracing::dispatcher::with_default(&self.console, || {
            error!(error = %error, "kafka client error: {}", reason);
        });
    }
}

/// [`AsyncProducer`] backed by an rdkafka [`FutureProducer`].
pub struct KafkaProducer {
    producer: FutureProducer<ConsoleContext>,
    topic: String,
    headers: Option<OwnedHeaders>,
    channel_buffer_size: usize,
    close_timeout: Duration,
    console: Dispatch,
    closing: CancellationToken,
    dispatcher: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl KafkaProducer {
    pub fn new(config: &KafkaConfig, console: &Dispatch) -> Result<Self> {
        config.validate()?;

        let version = KafkaVersion::resolve(&config.version, console);
        let log_level = if config.debug {
            RDKafkaLogLevel::Debug
        } else {
            RDKafkaLogLevel::Warning
        };

        let producer: FutureProducer<ConsoleContext> = ClientConfig::new()
            .set("bootstrap.servers", config.bootstrap_servers())
            .set("client.id", &config.client_id)
            .set("compression.type", &config.compression)
            .set("acks", &config.acks)
            .set("linger.ms", config.linger_ms.to_string())
            .set("message.timeout.ms", config.message_timeout_ms.to_string())
            .set("broker.version.fallback", version.to_string())
            .set("sticky.partitioning.linger.ms", "0")
            .set_log_level(log_level)
            .create_with_context(ConsoleContext {
                console: console.clone(),
            })
            .map_err(Error::Kafka)?;

        let headers = (!config.namespace.is_empty()).then(|| {
            OwnedHeaders::new().insert(Header {
                key: "ns",
                value: Some(config.namespace.as_str()),
            })
        });

        tracing::dispatcher::with_default(console, || {
            debug!(
                brokers = %config.bootstrap_servers(),
                topic = %config.topic,
                version = %version,
                "kafka log producer created"
            );
        });

        Ok(Self {
            producer,
            topic: config.topic.clone(),
            headers,
            channel_buffer_size: config.channel_buffer_size,
            close_timeout: config.close_timeout(),
            console: console.clone(),
            closing: CancellationToken::new(),
            dispatcher: Mutex::new(None),
        })
    }
}

impl AsyncProducer for KafkaProducer {
    fn start(&self, runtime: &Handle) -> Result<ProducerChannels> {
        let mut slot = self.dispatcher.lock();
        if slot.is_some() || self.closing.is_cancelled() {
            return Err(Error::Config("kafka producer already started".to_string()));
        }

        let (input_tx, input_rx) = mpsc::channel(self.channel_buffer_size);
        let (success_tx, success_rx) = mpsc::channel(self.channel_buffer_size);
        let (error_tx, error_rx) = mpsc::channel(self.channel_buffer_size);

        let dispatch = Dispatcher {
            producer: self.producer.clone(),
            topic: self.topic.clone(),
            headers: self.headers.clone(),
            successes: success_tx,
            errors: error_tx,
            closing: self.closing.clone(),
            close_timeout: self.close_timeout,
        };
        *slot = Some(runtime.spawn(dispatch.run(input_rx).with_subscriber(self.console.clone())));

        Ok(ProducerChannels {
            input: input_tx,
            successes: success_rx,
            errors: error_rx,
        })
    }

    fn close(&self) -> BoxFuture<'static, Result<()>> {
        self.closing.cancel();
        let handle = self.dispatcher.lock().take();

        async move {
            match handle {
                Some(handle) => handle.await.map_err(|_| Error::Task {
                    task: "kafka-dispatch",
                })?,
                None => Ok(()),
            }
        }
        .boxed()
    }
}

type InFlight = FuturesUnordered<BoxFuture<'static, (std::result::Result<(), KafkaError>, LogMessage)>>;

/// Moves messages from the input into librdkafka and confirms each one.
struct Dispatcher {
    producer: FutureProducer<ConsoleContext>,
    topic: String,
    headers: Option<OwnedHeaders>,
    successes: mpsc::Sender<LogMessage>,
    errors: mpsc::Sender<ProducerError>,
    closing: CancellationToken,
    close_timeout: Duration,
}

impl Dispatcher {
    async fn run(self, mut input: mpsc::Receiver<LogMessage>) -> Result<()> {
        debug!("kafka dispatch loop started");
        let mut in_flight = InFlight::new();

        loop {
            tokio::select! {
                Some((outcome, message)) = in_flight.next() => {
                    self.confirm(outcome, message).await;
                }
                next = input.recv() => match next {
                    Some(message) => self.dispatch(message, &mut in_flight).await,
                    None => break,
                },
                _ = self.closing.cancelled() => break,
            }
        }

        // hand over whatever the framer managed to enqueue before closing
        input.close();
        while let Ok(message) = input.try_recv() {
            self.dispatch(message, &mut in_flight).await;
        }

        let flushed = self.flush().await;

        let settle = async {
            while let Some((outcome, message)) = in_flight.next().await {
                self.confirm(outcome, message).await;
            }
        };
        if tokio::time::timeout(self.close_timeout, settle).await.is_err() {
            warn!(
                abandoned = in_flight.len(),
                "kafka deliveries did not settle before close timeout"
            );
        }

        info!(result = ?flushed.as_ref().err(), "kafka dispatch loop stopped");
        flushed
    }

    async fn dispatch(&self, message: LogMessage, in_flight: &mut InFlight) {
        loop {
            let sent = {
                let mut record = FutureRecord::<(), [u8]>::to(&self.topic).payload(message.as_bytes());
                if let Some(headers) = &self.headers {
                    record = record.headers(headers.clone());
                }
                self.producer.send_result(record).map_err(|(error, _)| error)
            };

            match sent {
                Ok(delivery) => {
                    in_flight.push(
                        async move {
                            let outcome = match delivery.await {
                                Ok(Ok(_)) => Ok(()),
                                Ok(Err((error, _))) => Err(error),
                                Err(_) => Err(KafkaError::Canceled),
                            };
                            (outcome, message)
                        }
                        .boxed(),
                    );
                    return;
                }
                Err(KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull))
                    if !self.closing.is_cancelled() =>
                {
                    debug!("local producer queue full, backing off");
                    tokio::time::sleep(QUEUE_FULL_BACKOFF).await;
                }
                Err(error) => {
                    self.confirm(Err(error), message).await;
                    return;
                }
            }
        }
    }

    async fn confirm(&self, outcome: std::result::Result<(), KafkaError>, message: LogMessage) {
        let delivered = match outcome {
            Ok(()) => self.successes.send(message).await.is_ok(),
            Err(error) => self.errors.send(ProducerError { message, error }).await.is_ok(),
        };
        if !delivered {
            debug!("confirmation channel closed, dropping confirmation");
        }
    }

    /// Flushes librdkafka, purging whatever is still queued when the timeout expires.
    async fn flush(&self) -> Result<()> {
        let producer = self.producer.clone();
        let timeout = self.close_timeout;

        tokio::task::spawn_blocking(move || {
            let flushed = producer.flush(timeout);
            if flushed.is_err() {
                producer.purge(PurgeConfig::default().queue().inflight());
                // serve the delivery reports of purged messages
                let _ = producer.flush(Duration::from_millis(100));
            }
            flushed
        })
        .await
        .map_err(|_| Error::Task {
            task: "kafka-flush",
        })?
        .map_err(Error::Kafka)
    }
}
