//! Tracing setup.
//!
//! Always logs to stdout. With a log directory it also writes two daily-rotated files:
//! `scraper.log` (plain text) and `scraper.json.log` (one JSON object per event).
//! `RUST_LOG` controls filtering and defaults to `info`.

use std::path::Path;
use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("Failed to create log directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid log filter: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),

    #[error("Logging already initialized: {0}")]
    Init(#[from] tracing_subscriber::util::TryInitError),
}

/// Keeps the background file writers alive; drop it only at shutdown.
pub struct LogGuards {
    _guards: Vec<WorkerGuard>,
}

fn stdout_layer<S>(filter: EnvFilter) -> impl Layer<S>
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    fmt::layer().with_target(false).compact().with_filter(filter)
}

fn env_filter() -> Result<EnvFilter, LoggingError> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => Ok(EnvFilter::try_new("info")?),
    }
}

pub fn init_logging(log_dir: Option<&Path>) -> Result<LogGuards, LoggingError> {
    let Some(log_path) = log_dir else {
        tracing_subscriber::registry()
            .with(stdout_layer(env_filter()?))
            .try_init()?;
        return Ok(LogGuards {
            _guards: Vec::new(),
        });
    };

    std::fs::create_dir_all(log_path)?;

    let (text_writer, text_guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(log_path, "scraper.log"));
    let (json_writer, json_guard) = tracing_appender::non_blocking(
        tracing_appender::rolling::daily(log_path, "scraper.json.log"),
    );

    let text_layer = fmt::layer()
        .with_writer(text_writer)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .with_ansi(false)
        .compact()
        .with_filter(env_filter()?);

    let json_layer = fmt::layer()
        .json()
        .with_writer(json_writer)
        .with_target(true)
        .with_current_span(true)
        .with_span_list(true)
        .with_filter(env_filter()?);

    tracing_subscriber::registry()
        .with(text_layer)
        .with(json_layer)
        .with(stdout_layer(env_filter()?))
        .try_init()?;

    tracing::info!("Logging to {}", log_path.display());
    Ok(LogGuards {
        _guards: vec![text_guard, json_guard],
    })
}
