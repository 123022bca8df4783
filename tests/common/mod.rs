#![allow(dead_code)]

use log_shipper::config::KafkaConfig;
use parking_lot::Mutex;
use std::env;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::Dispatch;

/// Get test configuration, honouring TEST_KAFKA_BROKERS when set
pub fn get_test_config() -> KafkaConfig {
    let brokers = env::var("TEST_KAFKA_BROKERS")
        .unwrap_or_else(|_| "localhost:9092".to_string())
        .split(',')
        .map(|s| s.trim().to_string())
        .collect();

    let mut config = KafkaConfig::new(brokers, format!("test_logs_{}", std::process::id()));
    config.compression = "none".to_string(); // No compression for tests
    config.linger_ms = 0; // Immediate sending for tests
    config.close_timeout_ms = 1_000;
    config.buffer_capacity = 64;
    config.max_idle_buffers = 64;
    config
}

/// In-memory writer shared between a console logger and the test body.
#[derive(Clone, Default)]
pub struct Captured(Arc<Mutex<Vec<u8>>>);

impl Captured {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl io::Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Console logger that records everything at debug level and above.
pub fn captured_console() -> (Dispatch, Captured) {
    let captured = Captured::default();
    let writer = captured.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_max_level(tracing::Level::DEBUG)
        .with_ansi(false)
        .finish();
    (Dispatch::new(subscriber), captured)
}

/// Polls `condition` until it holds or `timeout` passes.
pub fn wait_until<F: Fn() -> bool>(timeout: Duration, condition: F) -> bool {
    let deadline = Instant::now() + timeout;
    while !condition() {
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    true
}
