//! votefleet
//!
//! A fleet scheduler and per-instance state machine that automates repeated
//! vote attempts against a target page through a fleet of proxy-bound
//! browser workers, each with its own persisted session.

pub mod errors;
pub mod votelog;
pub mod session_store;
pub mod proxy;
pub mod browser;
pub mod classifier;
pub mod instance;
pub mod fleet;
pub mod stats;
pub mod config;
pub mod web;

use std::path::PathBuf;

/// Get log directory path (shared across modules)
pub fn log_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("votefleet").join("logs"))
}

/// Initialize logging: console output plus a daily-rolling file under
/// `log_dir()`. Returns the worker guard that must stay alive for the
/// non-blocking file writer to keep flushing.
pub fn init_logging() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into());

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false);

    if let Some(log_dir) = log_dir() {
        let _ = std::fs::create_dir_all(&log_dir);
        let file_appender = tracing_appender::rolling::daily(&log_dir, "votefleet.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(true)
            .with_writer(non_blocking);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .with(file_layer)
            .init();

        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .init();

        None
    }
}
