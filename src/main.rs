use clap::Parser;
use log_shipper::{logging, Config, LogSink, Result};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::{error, info};

const STDIN_CHUNK: usize = 8192;

#[derive(Parser, Debug)]
#[command(name = "log-shipper")]
#[command(about = "Ships newline-delimited log lines from stdin to Kafka", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
    config: PathBuf,

    #[arg(short, long, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::from_file(&args.config)?;
    let json = args.json_logs && !config.logging.dev_mode;
    let console = logging::console(config.kafka.debug || args.verbose, json);
    let sink = Arc::new(LogSink::new(config.kafka.clone(), console)?);

    logging::init(&config.logging, args.json_logs, args.verbose, Some(sink.clone()))?;

    info!(
        service = %config.logging.service_name,
        kafka_brokers = ?config.kafka.brokers,
        kafka_topic = %config.kafka.topic,
        kafka_namespace = %config.kafka.namespace,
        "Starting log-shipper"
    );

    tokio::select! {
        result = forward_stdin(&sink) => match result {
            Ok(bytes) => info!(bytes, "stdin closed"),
            Err(e) => error!("Failed to read stdin: {}", e),
        },
        _ = tokio::signal::ctrl_c() => info!("Interrupted, shutting down"),
    }

    let closing = sink.clone();
    let closed = tokio::task::spawn_blocking(move || closing.close())
        .await
        .map_err(|_| log_shipper::Error::Task { task: "close" })?;
    if let Err(e) = &closed {
        error!("Failed to close kafka sink: {}", e);
    }
    closed
}

/// Copies stdin into the sink and terminates a trailing partial line.
async fn forward_stdin(sink: &LogSink) -> std::io::Result<u64> {
    let mut stdin = tokio::io::stdin();
    let mut buf = vec![0u8; STDIN_CHUNK];
    let mut total = 0u64;
    let mut last = b'\n';

    loop {
        let n = stdin.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let chunk = &buf[..n];
        tokio::task::block_in_place(|| (&*sink).write_all(chunk))?;
        last = chunk[n - 1];
        total += n as u64;
    }

    if last != b'\n' {
        tokio::task::block_in_place(|| (&*sink).write_all(b"\n"))?;
    }
    Ok(total)
}
