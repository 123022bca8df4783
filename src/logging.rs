//! Subscriber setup.
//!
//! Two outputs exist side by side: the console, which is always available,
//! and an optional [`LogSink`] that receives every event as one JSON line.
//! The sink reports its own failures on a console [`Dispatch`] built by
//! [`console`], never through the global subscriber it is part of.

use crate::config::LoggingConfig;
use crate::sink::LogSink;
use crate::{Error, Result};
use std::fmt::{self, Write as _};
use std::sync::Arc;
use tracing::level_filters::LevelFilter;
use tracing::{Dispatch, Event, Subscriber};
use tracing_subscriber::fmt::format::{Format, Json, Writer};
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Stderr logger used for the sink's self-diagnostics. `debug` raises it from info to debug.
pub fn console(debug: bool, json: bool) -> Dispatch {
    let level = if debug {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };

    let builder = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(level)
        .with_target(false);

    if json {
        Dispatch::new(builder.json().flatten_event(true).finish())
    } else {
        Dispatch::new(builder.finish())
    }
}

/// Layer writing every event as a flattened JSON line into `sink`.
///
/// Each line carries the sink's namespace as `ns` and `service_name` as
/// `logger`; either is left out when empty.
pub fn kafka_layer<S>(sink: Arc<LogSink>, service_name: &str) -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let format = TaggedJson::new(sink.namespace(), service_name);
    tracing_subscriber::fmt::layer()
        .json()
        .event_format(format)
        .with_writer(sink)
}

/// Flattened JSON event format with constant fields placed first.
pub struct TaggedJson {
    inner: Format<Json>,
    tags: String,
}

impl TaggedJson {
    pub fn new(namespace: &str, logger: &str) -> Self {
        let tags = [("ns", namespace), ("logger", logger)]
            .into_iter()
            .filter(|(_, value)| !value.is_empty())
            .map(|(key, value)| format!("\"{}\":{},", key, serde_json::Value::from(value)))
            .collect();

        Self {
            inner: tracing_subscriber::fmt::format()
                .json()
                .flatten_event(true)
                .with_current_span(false)
                .with_span_list(false),
            tags,
        }
    }
}

impl<S, N> FormatEvent<S, N> for TaggedJson
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        if self.tags.is_empty() {
            return self.inner.format_event(ctx, writer, event);
        }

        let mut line = String::new();
        self.inner.format_event(ctx, Writer::new(&mut line), event)?;
        match line.strip_prefix('{') {
            Some(rest) => write!(writer, "{{{}{}", self.tags, rest),
            None => writer.write_str(&line),
        }
    }
}

/// Installs the global subscriber: console output, plus `tee` when given.
///
/// `dev_mode` keeps the console human-readable even when `json` is set.
pub fn init(
    config: &LoggingConfig,
    json: bool,
    verbose: bool,
    tee: Option<Arc<LogSink>>,
) -> Result<()> {
    let env_filter = if verbose {
        EnvFilter::new("log_shipper=debug,info")
    } else {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(config.level()))
            .map_err(|e| Error::Logging(e.to_string()))?
    };

    let fmt_layer = if json && !config.dev_mode {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(tee.map(|sink| kafka_layer(sink, &config.service_name)))
        .try_init()
        .map_err(|e| Error::Logging(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::Mutex;
    use tracing::Level;

    #[derive(Clone, Default)]
    struct Lines(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Lines {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn format_one(format: TaggedJson) -> serde_json::Value {
        let lines = Lines::default();
        let writer = lines.clone();
        let subscriber = tracing_subscriber::registry().with(
            tracing_subscriber::fmt::layer()
                .json()
                .event_format(format)
                .with_writer(move || writer.clone()),
        );
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(order = 7, "payment \"captured\"");
        });

        let output = String::from_utf8(lines.0.lock().unwrap().clone()).unwrap();
        assert_eq!(output.lines().count(), 1, "output: {}", output);
        serde_json::from_str(output.trim_end()).unwrap()
    }

    #[test]
    fn test_tagged_json_adds_namespace_and_logger() {
        let entry = format_one(TaggedJson::new("pay\"ments", "billing"));
        assert_eq!(entry["ns"], "pay\"ments");
        assert_eq!(entry["logger"], "billing");
        assert_eq!(entry["message"], "payment \"captured\"");
        assert_eq!(entry["order"], 7);
        assert_eq!(entry["level"], "INFO");
    }

    #[test]
    fn test_tagged_json_skips_empty_tags() {
        let entry = format_one(TaggedJson::new("", "billing"));
        assert!(entry.get("ns").is_none());
        assert_eq!(entry["logger"], "billing");

        let entry = format_one(TaggedJson::new("", ""));
        assert!(entry.get("ns").is_none());
        assert!(entry.get("logger").is_none());
        assert_eq!(entry["message"], "payment \"captured\"");
    }

    fn enabled_at(dispatch: &Dispatch, level: Level) -> bool {
        tracing::dispatcher::with_default(dispatch, || match level {
            Level::DEBUG => tracing::enabled!(Level::DEBUG),
            Level::INFO => tracing::enabled!(Level::INFO),
            _ => tracing::enabled!(Level::ERROR),
        })
    }

    #[test]
    fn test_console_debug_flag_raises_level() {
        let quiet = console(false, false);
        assert!(enabled_at(&quiet, Level::INFO));
        assert!(!enabled_at(&quiet, Level::DEBUG));

        let verbose = console(true, true);
        assert!(enabled_at(&verbose, Level::DEBUG));
    }
}
