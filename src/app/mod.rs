pub mod aggregator;
pub mod bot;
pub mod commands;
mod config;
mod error;
mod logging;
pub mod messages;
pub mod monitor;
pub mod notifier;
mod runtime;
pub mod services;

pub use error::AppError;

use config::{AppConfig, TelegramConfig};

/// Monitor, Telegram bot and HTTP API in one process.
pub fn run() -> Result<(), AppError> {
    let config = bootstrap()?;
    let telegram = TelegramConfig::from_env()?;

    runtime::run(config, telegram)
}

/// Monitor and Telegram bot without the HTTP API.
pub fn run_service() -> Result<(), AppError> {
    let config = bootstrap()?;
    let telegram = TelegramConfig::from_env()?;

    runtime::run_service(config, telegram)
}

/// HTTP API only, reading the database a separate monitor writes.
pub fn run_api() -> Result<(), AppError> {
    let config = bootstrap()?;

    runtime::run_api(config)
}

fn bootstrap() -> Result<AppConfig, AppError> {
    // Loaded before logging so RUST_LOG can come from the .env file.
    let dotenv = dotenvy::dotenv();
    logging::init()?;

    match dotenv {
        Ok(path) => tracing::debug!(path = %path.display(), "loaded environment file"),
        Err(error) if error.not_found() => {}
        Err(error) => tracing::warn!(error = %error, "failed to load environment file"),
    }

    let config = AppConfig::from_env()?;

    tracing::info!(
        devices_file = %config.devices_file,
        poll_interval_secs = config.poll_interval_secs,
        debounce_samples = config.debounce_samples,
        probe_timeout_secs = config.probe_timeout_secs,
        ping_count = config.ping_count,
        db_path = %config.db_path,
        http_bind = %config.http_bind,
        history_days = config.history_days,
        "application bootstrap initialized"
    );

    Ok(config)
}
