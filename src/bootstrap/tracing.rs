//! Tracing subscriber for the daemon.
//!
//! Output format: `2025-01-15 10:30:45.123 INFO [file.rs:42] [target] message`.
//! `RUST_LOG` overrides the default filter.

use std::{fs, io, path::Path, sync::OnceLock};

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{fmt, fmt::writer::BoxMakeWriter, prelude::*, registry};

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

const LOG_FILE: &str = "devicelife.log";

fn is_development() -> bool {
    cfg!(debug_assertions)
}

fn build_filter_directives(is_dev: bool) -> Vec<String> {
    let level = if is_dev { "debug" } else { "info" };
    vec![
        level.to_string(),
        format!("dl_app={level}"),
        format!("dl_infra={level}"),
        // HTTP client internals
        "hyper_util=warn".to_string(),
        "reqwest=warn".to_string(),
    ]
}

/// Installs the global subscriber: stdout always, plus a non-blocking
/// daily file when `log_dir` is set. Fails if a subscriber is already set.
pub fn init_tracing_subscriber(log_dir: Option<&Path>) -> anyhow::Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(build_filter_directives(is_development()).join(","))
    });

    let stdout_layer = fmt::layer()
        .with_timer(fmt::time::ChronoUtc::new(
            "%Y-%m-%d %H:%M:%S%.3f".to_string(),
        ))
        .with_level(true)
        .with_file(true)
        .with_line_number(true)
        .with_target(true)
        .with_ansi(cfg!(not(test)))
        .with_writer(BoxMakeWriter::new(io::stdout));

    let file_writer = match log_dir.map(build_file_writer).transpose() {
        Ok(writer) => writer,
        Err(err) => {
            eprintln!("Failed to initialize file logging, falling back to stdout: {err}");
            None
        }
    };
    let file_layer = file_writer.map(|writer| {
        fmt::layer()
            .with_timer(fmt::time::ChronoUtc::new(
                "%Y-%m-%d %H:%M:%S%.3f".to_string(),
            ))
            .with_level(true)
            .with_file(true)
            .with_line_number(true)
            .with_target(true)
            .with_ansi(false)
            .with_writer(writer)
    });

    registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()?;
    Ok(())
}

fn build_file_writer(dir: &Path) -> anyhow::Result<NonBlocking> {
    fs::create_dir_all(dir)?;
    let file_appender = tracing_appender::rolling::daily(dir, LOG_FILE);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    LOG_GUARD
        .set(guard)
        .map_err(|_| anyhow::anyhow!("Tracing log guard already initialized"))?;

    Ok(non_blocking)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_filter_directives() {
        let dev = build_filter_directives(true);
        assert!(dev.contains(&"debug".to_string()));
        assert!(dev.contains(&"dl_infra=debug".to_string()));
        assert!(dev.contains(&"reqwest=warn".to_string()));

        let prod = build_filter_directives(false);
        assert!(prod.contains(&"info".to_string()));
        assert!(prod.contains(&"dl_app=info".to_string()));
    }
}
