use std::fs;
use std::io;
use std::path::PathBuf;

use tracing_appender::non_blocking::{self, WorkerGuard};
use tracing_appender::rolling;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("logging already initialized")]
    AlreadyInitialized,
    #[error("subscriber init failed: {0}")]
    SubscriberInit(#[from] tracing_subscriber::util::TryInitError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Console + file logging. The returned guard must stay alive for the
/// duration of the process so the non-blocking writer can flush.
pub fn init(verbose: bool) -> Result<WorkerGuard, LogError> {
    let logs_dir = PathBuf::from("logs");
    fs::create_dir_all(&logs_dir)?;

    let file_appender = rolling::never(&logs_dir, "latest.log");
    let (file_writer, guard) = non_blocking::NonBlockingBuilder::default()
        .lossy(false)
        .finish(file_appender);

    let console_level = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };

    let console_layer = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(console_level);

    let file_layer = fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer)
        .with_filter(LevelFilter::DEBUG);

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| {
            let msg = e.to_string();
            if msg.contains("global subscriber") || msg.contains("already") {
                LogError::AlreadyInitialized
            } else {
                LogError::SubscriberInit(e)
            }
        })?;

    Ok(guard)
}
