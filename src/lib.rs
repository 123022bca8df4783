pub mod config;
pub mod error;
pub mod logging;

pub mod kafka;
pub mod sink;

pub use config::{Config, KafkaConfig, LoggingConfig};
pub use error::{Error, Result};
pub use sink::LogSink;
