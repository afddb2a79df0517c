use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use rusqlite::Connection;

use crate::adapters::db::{open_connection, run_migrations};
use crate::adapters::probe::{Probe, ProbeError};
use crate::app::aggregator::Aggregator;
use crate::app::commands::PowerCommands;
use crate::app::notifier::{Notifier, NotifierError};
use crate::app::services::SqliteHistoryStore;
use crate::domain::models::{Device, PowerEvent};
use crate::domain::power_state::Clock;

static TEST_DB_COUNTER: AtomicU64 = AtomicU64::new(0);

const TEST_DB_DIR: &str = "./target/testdb";

/// Copies a migrated template database so each test gets its own file.
pub(crate) fn open_test_connection(test_name: &str) -> Connection {
    let test_db_path = test_db_path(test_name);
    std::fs::copy(ensure_template_db(), &test_db_path).expect("template db should be copied");
    open_connection(test_db_path.to_string_lossy().as_ref()).expect("test db should open")
}

/// Fresh path for tests that open their own connections to one file.
pub(crate) fn test_db_path(test_name: &str) -> PathBuf {
    std::fs::create_dir_all(TEST_DB_DIR).expect("test db dir should be creatable");

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let counter = TEST_DB_COUNTER.fetch_add(1, Ordering::Relaxed);
    Path::new(TEST_DB_DIR).join(format!("{test_name}-{now}-{counter}.sqlite"))
}

fn ensure_template_db() -> &'static Path {
    static TEMPLATE_PATH: OnceLock<PathBuf> = OnceLock::new();

    TEMPLATE_PATH.get_or_init(|| {
        let template_path = std::env::var("POWER_TEST_DB_TEMPLATE")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| test_db_path("template"));

        if let Some(parent) = template_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).expect("template parent dir should be creatable");
        }

        // Dropping the connection checkpoints the WAL so the copy is complete.
        let mut connection =
            open_connection(template_path.to_string_lossy().as_ref()).expect("template db opens");
        run_migrations(&mut connection).expect("template migrations should succeed");
        drop(connection);

        template_path
    })
}

pub(crate) struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub(crate) fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub(crate) fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().expect("clock lock should be available") = now;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("clock lock should be available")
    }
}

/// Probe whose answer the test flips between ticks.
pub(crate) struct ToggleProbe {
    reachable: AtomicBool,
}

impl ToggleProbe {
    pub(crate) fn new(reachable: bool) -> Self {
        Self {
            reachable: AtomicBool::new(reachable),
        }
    }

    pub(crate) fn set(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }
}

impl Probe for ToggleProbe {
    fn is_reachable(&self, _address: &str, _timeout: Duration) -> Result<bool, ProbeError> {
        Ok(self.reachable.load(Ordering::SeqCst))
    }
}

#[derive(Clone, Default)]
pub(crate) struct RecordingNotifier {
    events: Arc<Mutex<Vec<PowerEvent>>>,
}

impl RecordingNotifier {
    pub(crate) fn events(&self) -> Vec<PowerEvent> {
        self.events
            .lock()
            .expect("notifier lock should be available")
            .clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, event: &PowerEvent) -> Result<(), NotifierError> {
        self.events
            .lock()
            .expect("notifier lock should be available")
            .push(event.clone());
        Ok(())
    }
}

pub(crate) struct FailingNotifier;

impl Notifier for FailingNotifier {
    fn notify(&self, _event: &PowerEvent) -> Result<(), NotifierError> {
        Err(NotifierError::Delivery("chat unreachable".to_string()))
    }
}

pub(crate) fn test_aggregator(probe: Arc<ToggleProbe>) -> Arc<Aggregator> {
    let devices = vec![Device {
        name: "router".to_string(),
        address: "10.0.0.1".to_string(),
        description: String::new(),
    }];
    Arc::new(
        Aggregator::new(devices, probe, Duration::from_secs(1)).expect("aggregator should build"),
    )
}

pub(crate) struct CommandsHarness {
    pub(crate) commands: PowerCommands,
    pub(crate) store: SqliteHistoryStore,
    pub(crate) probe: Arc<ToggleProbe>,
    pub(crate) clock: Arc<FixedClock>,
}

pub(crate) fn commands_harness(test_name: &str, now: DateTime<Utc>) -> CommandsHarness {
    let store = SqliteHistoryStore::new(Arc::new(Mutex::new(open_test_connection(test_name))));
    let probe = Arc::new(ToggleProbe::new(true));
    let clock = Arc::new(FixedClock::new(now));
    let commands = PowerCommands::new(
        store.clone(),
        test_aggregator(Arc::clone(&probe)),
        Arc::clone(&clock) as Arc<dyn Clock>,
        30,
    );

    CommandsHarness {
        commands,
        store,
        probe,
        clock,
    }
}
