use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use actix_cors::Cors;
use actix_web::{App, HttpServer, web};
use chrono::{DateTime, Utc};

use crate::adapters::api::{ApiState, configure_routes};
use crate::adapters::db::{open_connection, run_migrations};
use crate::adapters::probe::PingProbe;
use crate::adapters::telegram::TelegramClient;
use crate::app::aggregator::Aggregator;
use crate::app::bot::start_bot;
use crate::app::commands::PowerCommands;
use crate::app::config::{AppConfig, TelegramConfig};
use crate::app::error::AppError;
use crate::app::monitor::PowerMonitor;
use crate::app::notifier::Notifier;
use crate::app::services::SqliteHistoryStore;
use crate::domain::power_state::Clock;

#[derive(Debug, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

pub fn open_store(db_path: &str) -> Result<SqliteHistoryStore, AppError> {
    let mut connection = open_connection(db_path).map_err(AppError::database_init)?;
    run_migrations(&mut connection).map_err(AppError::database_init)?;
    Ok(SqliteHistoryStore::new(Arc::new(Mutex::new(connection))))
}

fn build_aggregator(config: &AppConfig) -> Result<Arc<Aggregator>, AppError> {
    let devices = config.load_devices()?;
    for device in &devices {
        tracing::info!(
            device = %device.name,
            address = %device.address,
            description = %device.description,
            "monitoring device"
        );
    }

    let probe = PingProbe::new(config.ping_count);
    let aggregator = Aggregator::new(devices, Arc::new(probe), config.probe_timeout())
        .map_err(AppError::config)?;
    Ok(Arc::new(aggregator))
}

/// Runs one tick per `poll_interval` until `shutdown` fires or its sender
/// is dropped. The tick in progress always completes.
pub fn start_monitor<N, Cl>(
    mut monitor: PowerMonitor<N, Cl>,
    poll_interval: Duration,
    shutdown: Receiver<()>,
) -> std::io::Result<JoinHandle<()>>
where
    N: Notifier,
    Cl: Clock + 'static,
{
    thread::Builder::new()
        .name("power-monitor".to_string())
        .spawn(move || {
            monitor.announce_started();
            loop {
                monitor.tick();
                match shutdown.recv_timeout(poll_interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            monitor.flush();
            tracing::info!("power monitor stopped");
        })
}

struct Background {
    monitor: JoinHandle<()>,
    monitor_shutdown: mpsc::Sender<()>,
    bot: Option<JoinHandle<()>>,
    bot_stop: Arc<AtomicBool>,
}

impl Background {
    fn stop(self) -> Result<(), AppError> {
        self.bot_stop.store(true, Ordering::Relaxed);
        let _ = self.monitor_shutdown.send(());

        if self.monitor.join().is_err() {
            return Err(AppError::runtime("monitor thread panicked"));
        }
        if let Some(bot) = self.bot
            && bot.join().is_err()
        {
            return Err(AppError::runtime("telegram bot thread panicked"));
        }
        Ok(())
    }
}

fn start_background(
    config: &AppConfig,
    telegram: &TelegramConfig,
) -> Result<(Background, PowerCommands), AppError> {
    let aggregator = build_aggregator(config)?;
    let store = open_store(&config.db_path)?;
    let client = TelegramClient::new(&telegram.api_url, &telegram.bot_token, &telegram.chat_id)
        .map_err(AppError::config)?;

    let mut monitor = PowerMonitor::new(
        store.clone(),
        Arc::clone(&aggregator),
        client.clone(),
        SystemClock,
        config.debounce_samples,
    );
    monitor.recover().map_err(AppError::database_init)?;

    let commands = PowerCommands::new(
        store,
        aggregator,
        Arc::new(SystemClock),
        config.history_days,
    );

    let (monitor_shutdown, shutdown) = mpsc::channel();
    let monitor = start_monitor(monitor, config.poll_interval(), shutdown)
        .map_err(AppError::runtime)?;

    let bot_stop = Arc::new(AtomicBool::new(false));
    let bot = match telegram.command_chat_id() {
        Some(chat_id) => Some(
            start_bot(client, commands.clone(), chat_id, Arc::clone(&bot_stop))
                .map_err(AppError::runtime)?,
        ),
        None => {
            tracing::warn!(
                chat_id = %telegram.chat_id,
                "TELEGRAM_CHAT_ID is not a numeric chat id; notifications only, bot commands disabled"
            );
            None
        }
    };

    Ok((
        Background {
            monitor,
            monitor_shutdown,
            bot,
            bot_stop,
        },
        commands,
    ))
}

fn serve_http(http_bind: &str, commands: PowerCommands) -> Result<(), AppError> {
    let api_state = ApiState { commands };
    let bind = http_bind.to_string();

    tracing::info!(bind = %bind, "http server starting");

    actix_web::rt::System::new()
        .block_on(async move {
            HttpServer::new(move || {
                App::new()
                    .wrap(
                        Cors::default()
                            .allow_any_origin()
                            .allowed_methods(vec!["GET", "POST"])
                            .max_age(3600),
                    )
                    .app_data(web::Data::new(api_state.clone()))
                    .configure(configure_routes)
            })
            .bind(&bind)?
            .run()
            .await
        })
        .map_err(AppError::runtime)
}

/// Monitor, bot and HTTP API in one process. Stops when the HTTP server
/// receives a termination signal.
pub fn run(config: AppConfig, telegram: TelegramConfig) -> Result<(), AppError> {
    let (background, commands) = start_background(&config, &telegram)?;

    let server_result = serve_http(&config.http_bind, commands);

    tracing::info!("shutting down background workers");
    background.stop()?;
    server_result
}

/// Monitor and bot only, for hosts that do not expose the HTTP API.
pub fn run_service(config: AppConfig, telegram: TelegramConfig) -> Result<(), AppError> {
    let (signal_sender, signal) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = signal_sender.send(());
    })
    .map_err(AppError::runtime)?;

    let (background, _commands) = start_background(&config, &telegram)?;

    let _ = signal.recv();
    tracing::info!("termination signal received");
    background.stop()
}

/// Read-only HTTP API over an existing history database. `/fix` still probes.
pub fn run_api(config: AppConfig) -> Result<(), AppError> {
    let aggregator = build_aggregator(&config)?;
    let store = open_store(&config.db_path)?;
    let commands = PowerCommands::new(
        store,
        aggregator,
        Arc::new(SystemClock),
        config.history_days,
    );

    serve_http(&config.http_bind, commands)
}
