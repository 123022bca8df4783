use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub kafka: KafkaConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Broker connection and pipeline tuning for one [`LogSink`](crate::LogSink).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KafkaConfig {
    pub brokers: Vec<String>,
    pub topic: String,
    /// Protocol version hint such as `2.7.2`. Empty selects the default.
    #[serde(default)]
    pub version: String,
    /// Attached to every shipped message as the `ns` header when non-empty.
    #[serde(default)]
    pub namespace: String,
    /// Raises the fallback logger to debug level.
    #[serde(default)]
    pub debug: bool,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_compression")]
    pub compression: String,
    #[serde(default = "default_acks")]
    pub acks: String,
    #[serde(default = "default_linger_ms")]
    pub linger_ms: u32,
    #[serde(default = "default_message_timeout_ms")]
    pub message_timeout_ms: u64,
    #[serde(default = "default_close_timeout_ms")]
    pub close_timeout_ms: u64,
    #[serde(default = "default_channel_buffer_size")]
    pub channel_buffer_size: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_read_chunk_size")]
    pub read_chunk_size: usize,
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    #[serde(default = "default_max_idle_buffers")]
    pub max_idle_buffers: usize,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub service_name: String,
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub dev_mode: bool,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("LOG_SHIPPER")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("kafka.brokers")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.kafka.validate()?;
        Ok(config)
    }
}

impl KafkaConfig {
    /// Builds a configuration with every tunable at its default.
    pub fn new(brokers: Vec<String>, topic: impl Into<String>) -> Self {
        Self {
            brokers,
            topic: topic.into(),
            version: String::new(),
            namespace: String::new(),
            debug: false,
            client_id: default_client_id(),
            compression: default_compression(),
            acks: default_acks(),
            linger_ms: default_linger_ms(),
            message_timeout_ms: default_message_timeout_ms(),
            close_timeout_ms: default_close_timeout_ms(),
            channel_buffer_size: default_channel_buffer_size(),
            queue_capacity: default_queue_capacity(),
            read_chunk_size: default_read_chunk_size(),
            buffer_capacity: default_buffer_capacity(),
            max_idle_buffers: default_max_idle_buffers(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.brokers.is_empty() {
            return Err(Error::Config("kafka.brokers must not be empty".to_string()));
        }
        if self.brokers.iter().any(|b| b.trim().is_empty()) {
            return Err(Error::Config(
                "kafka.brokers must not contain blank addresses".to_string(),
            ));
        }
        if self.topic.trim().is_empty() {
            return Err(Error::Config("kafka.topic must not be empty".to_string()));
        }
        for (name, value) in [
            ("kafka.channel_buffer_size", self.channel_buffer_size),
            ("kafka.queue_capacity", self.queue_capacity),
            ("kafka.read_chunk_size", self.read_chunk_size),
        ] {
            if value == 0 {
                return Err(Error::Config(format!("{} must be greater than zero", name)));
            }
        }
        Ok(())
    }

    pub fn bootstrap_servers(&self) -> String {
        self.brokers
            .iter()
            .map(|b| b.trim())
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

impl LoggingConfig {
    /// Effective level directive; an empty level means `debug` in dev mode and `info` otherwise.
    pub fn level(&self) -> &str {
        match (self.level.trim(), self.dev_mode) {
            ("", true) => "debug",
            ("", false) => "info",
            (level, _) => level,
        }
    }
}

fn default_client_id() -> String {
    "log-shipper".to_string()
}

fn default_compression() -> String {
    "snappy".to_string()
}

fn default_acks() -> String {
    "1".to_string()
}

fn default_linger_ms() -> u32 {
    10
}

fn default_message_timeout_ms() -> u64 {
    30_000
}

fn default_close_timeout_ms() -> u64 {
    5_000
}

fn default_channel_buffer_size() -> usize {
    256
}

fn default_queue_capacity() -> usize {
    4096
}

fn default_read_chunk_size() -> usize {
    4096
}

fn default_buffer_capacity() -> usize {
    3000
}

fn default_max_idle_buffers() -> usize {
    1024
}
