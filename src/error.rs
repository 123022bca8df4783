//! Error types and result handling for log-shipper.
//!
//! This module defines the main error type [`Error`] and a convenience
//! [`Result`] type alias used throughout the crate.
//!
//! Only construction and shutdown surface errors to callers. Delivery
//! failures of individual log lines are reported on the fallback logger
//! and never reach the application.
//!
//! # Example
//!
//! ```rust
//! use log_shipper::{Error, Result};
//!
//! fn build_sink() -> Result<()> {
//!     Err(Error::Config("kafka.brokers must not be empty".to_string()))
//! }
//!
//! match build_sink() {
//!     Ok(()) => println!("Sink started"),
//!     Err(Error::Config(msg)) => eprintln!("Invalid configuration: {}", msg),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! ```

use thiserror::Error;

/// The main error type for log-shipper operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid broker or logging configuration. The sink never starts.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file or environment could not be loaded.
    #[error("Settings error: {0}")]
    Settings(#[from] config::ConfigError),

    /// Kafka client creation or close failure.
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    /// I/O error, e.g. while building the sink runtime or spawning threads.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The global tracing subscriber could not be installed.
    #[error("Logging error: {0}")]
    Logging(String),

    /// A background task panicked before it could be joined.
    #[error("Background task '{task}' panicked")]
    Task {
        /// Name of the task that failed to join
        task: &'static str,
    },
}

/// A convenient Result type alias for log-shipper operations.
///
/// This is equivalent to `std::result::Result<T, log_shipper::Error>`.
pub type Result<T> = std::result::Result<T, Error>;
