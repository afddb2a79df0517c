use std::time::Duration;

use chrono::{DateTime, Local, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use thiserror::Error;

use crate::domain::duration::elapsed_seconds;
use crate::domain::models::{CurrentStatus, OutageEvent, OutageStats, PowerState};

pub const LATEST_SCHEMA_VERSION: u32 = 2;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

type MigrationStep = fn(&Connection) -> Result<(), DbError>;

const MIGRATIONS: &[(u32, MigrationStep)] = &[
    (1, create_outage_tables),
    (2, import_legacy_power_cuts),
];

const OUTAGE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS outage_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    started_at TEXT NOT NULL,
    ended_at TEXT,
    duration_seconds INTEGER
);

CREATE INDEX IF NOT EXISTS idx_outage_events_started_at_desc
ON outage_events (started_at DESC);

CREATE UNIQUE INDEX IF NOT EXISTS idx_outage_events_single_open
ON outage_events ((ended_at IS NULL))
WHERE ended_at IS NULL;

CREATE TABLE IF NOT EXISTS current_status (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    state TEXT NOT NULL CHECK (state IN ('UP', 'DOWN', 'UNKNOWN')),
    last_checked_at TEXT NOT NULL,
    open_event_id INTEGER
);
"#;

const OUTAGE_COLUMNS: &str = "id, started_at, ended_at, duration_seconds";

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database operation failed: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("unsupported schema version {current}; latest supported is {latest}")]
    UnsupportedSchemaVersion { current: u32, latest: u32 },
    #[error("outage event {event_id} does not exist or is already closed")]
    NotFound { event_id: i64 },
}

pub fn open_connection(path: &str) -> Result<Connection, DbError> {
    let connection = Connection::open(path)?;
    connection.busy_timeout(BUSY_TIMEOUT)?;
    connection.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
        row.get::<_, String>(0)
    })?;
    Ok(connection)
}

pub fn run_migrations(connection: &mut Connection) -> Result<(), DbError> {
    let current_version = schema_version(connection)?;

    if current_version > LATEST_SCHEMA_VERSION {
        return Err(DbError::UnsupportedSchemaVersion {
            current: current_version,
            latest: LATEST_SCHEMA_VERSION,
        });
    }

    let transaction = connection.transaction()?;

    for (version, step) in MIGRATIONS {
        if *version > current_version {
            step(&transaction)?;
            transaction.pragma_update(None, "user_version", version)?;
        }
    }

    transaction.commit()?;

    Ok(())
}

fn create_outage_tables(connection: &Connection) -> Result<(), DbError> {
    connection.execute_batch(OUTAGE_SCHEMA)?;
    Ok(())
}

/// Copies history from the older `power_cuts` table into `outage_events`.
/// The legacy table is left in place. Its timestamps are naive local time;
/// a stored duration wins over `end_time`, which some writers recorded in
/// UTC. The newest unfinished cut stays open and is linked as a DOWN
/// snapshot so recovery resumes it; older unfinished cuts are closed at
/// their start.
fn import_legacy_power_cuts(connection: &Connection) -> Result<(), DbError> {
    let legacy_exists: bool = connection.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'power_cuts')",
        [],
        |row| row.get(0),
    )?;
    if !legacy_exists {
        return Ok(());
    }

    let rows = connection
        .prepare("SELECT start_time, end_time, duration_seconds FROM power_cuts ORDER BY id")?
        .query_map([], |row| {
            Ok((
                row.get::<_, Option<String>>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, Option<i64>>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut unfinished = Vec::new();
    for (start_time, end_time, duration_seconds) in rows {
        let Some(started_at) = start_time.as_deref().and_then(parse_legacy_timestamp) else {
            continue;
        };

        let ended_at = match (duration_seconds, end_time.as_deref()) {
            (Some(seconds), _) if seconds >= 0 => {
                Some(started_at + chrono::Duration::seconds(seconds))
            }
            (_, Some(raw)) => parse_legacy_timestamp(raw).map(|ended_at| ended_at.max(started_at)),
            _ => None,
        };

        match ended_at {
            Some(ended_at) => {
                insert_closed_outage(connection, started_at, ended_at)?;
            }
            None => unfinished.push(started_at),
        }
    }

    unfinished.sort();
    let newest = unfinished.pop();
    for started_at in unfinished {
        insert_closed_outage(connection, started_at, started_at)?;
    }

    if let Some(started_at) = newest {
        if find_open_outage(connection)?.is_none() && get_current_status(connection)?.is_none() {
            let event_id = record_outage_start(connection, started_at)?;
            set_current_status(
                connection,
                &CurrentStatus {
                    state: PowerState::Down,
                    last_checked_at: started_at,
                    open_event_id: Some(event_id),
                },
            )?;
        } else {
            insert_closed_outage(connection, started_at, started_at)?;
        }
    }

    Ok(())
}

fn parse_legacy_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(value) = DateTime::parse_from_rfc3339(raw) {
        return Some(value.with_timezone(&Utc));
    }

    let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f"))
        .ok()?;
    Some(
        Local
            .from_local_datetime(&naive)
            .earliest()
            .map_or_else(|| naive.and_utc(), |value| value.with_timezone(&Utc)),
    )
}

pub fn schema_version(connection: &Connection) -> Result<u32, DbError> {
    let version = connection.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

pub fn to_db_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(index: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|value| value.with_timezone(&Utc))
        .map_err(|error| rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(error)))
}

fn outage_from_row(row: &Row<'_>) -> rusqlite::Result<OutageEvent> {
    let started_at: String = row.get(1)?;
    let ended_at: Option<String> = row.get(2)?;

    Ok(OutageEvent {
        id: row.get(0)?,
        started_at: parse_timestamp(1, &started_at)?,
        ended_at: ended_at
            .map(|value| parse_timestamp(2, &value))
            .transpose()?,
        duration_seconds: row.get(3)?,
    })
}

pub fn record_outage_start(
    connection: &Connection,
    started_at: DateTime<Utc>,
) -> Result<i64, DbError> {
    connection.execute(
        "INSERT INTO outage_events (started_at) VALUES (?1)",
        params![to_db_timestamp(started_at)],
    )?;

    Ok(connection.last_insert_rowid())
}

/// Closes an open event. Fails with [`DbError::NotFound`] when the event is
/// missing or already closed.
pub fn record_outage_end(
    connection: &Connection,
    event_id: i64,
    ended_at: DateTime<Utc>,
) -> Result<OutageEvent, DbError> {
    let event = get_outage(connection, event_id)?
        .filter(OutageEvent::is_open)
        .ok_or(DbError::NotFound { event_id })?;
    let duration_seconds = elapsed_seconds(event.started_at, ended_at);

    let updated = connection.execute(
        "UPDATE outage_events SET ended_at = ?1, duration_seconds = ?2
         WHERE id = ?3 AND ended_at IS NULL",
        params![to_db_timestamp(ended_at), duration_seconds, event_id],
    )?;
    if updated == 0 {
        return Err(DbError::NotFound { event_id });
    }

    Ok(OutageEvent {
        ended_at: Some(ended_at),
        duration_seconds: Some(duration_seconds),
        ..event
    })
}

pub fn insert_closed_outage(
    connection: &Connection,
    started_at: DateTime<Utc>,
    ended_at: DateTime<Utc>,
) -> Result<i64, DbError> {
    connection.execute(
        "INSERT INTO outage_events (started_at, ended_at, duration_seconds) VALUES (?1, ?2, ?3)",
        params![
            to_db_timestamp(started_at),
            to_db_timestamp(ended_at),
            elapsed_seconds(started_at, ended_at),
        ],
    )?;

    Ok(connection.last_insert_rowid())
}

pub fn get_outage(connection: &Connection, event_id: i64) -> Result<Option<OutageEvent>, DbError> {
    let event = connection
        .query_row(
            &format!("SELECT {OUTAGE_COLUMNS} FROM outage_events WHERE id = ?1"),
            params![event_id],
            outage_from_row,
        )
        .optional()?;

    Ok(event)
}

pub fn find_open_outage(connection: &Connection) -> Result<Option<OutageEvent>, DbError> {
    let event = connection
        .query_row(
            &format!(
                "SELECT {OUTAGE_COLUMNS} FROM outage_events
                 WHERE ended_at IS NULL
                 ORDER BY started_at DESC, id DESC
                 LIMIT 1"
            ),
            [],
            outage_from_row,
        )
        .optional()?;

    Ok(event)
}

pub fn get_current_status(connection: &Connection) -> Result<Option<CurrentStatus>, DbError> {
    let status = connection
        .query_row(
            "SELECT state, last_checked_at, open_event_id FROM current_status WHERE id = 1",
            [],
            |row| {
                let state: String = row.get(0)?;
                let last_checked_at: String = row.get(1)?;
                Ok(CurrentStatus {
                    state: state.parse::<PowerState>().map_err(|error| {
                        rusqlite::Error::FromSqlConversionFailure(0, Type::Text, error.into())
                    })?,
                    last_checked_at: parse_timestamp(1, &last_checked_at)?,
                    open_event_id: row.get(2)?,
                })
            },
        )
        .optional()?;

    Ok(status)
}

pub fn set_current_status(connection: &Connection, status: &CurrentStatus) -> Result<(), DbError> {
    connection.execute(
        "INSERT INTO current_status (id, state, last_checked_at, open_event_id)
         VALUES (1, ?1, ?2, ?3)
         ON CONFLICT(id) DO UPDATE SET
             state = excluded.state,
             last_checked_at = excluded.last_checked_at,
             open_event_id = excluded.open_event_id",
        params![
            status.state.as_str(),
            to_db_timestamp(status.last_checked_at),
            status.open_event_id,
        ],
    )?;

    Ok(())
}

/// Newest first. Open events get a display-only duration measured to `now`.
pub fn list_outages(
    connection: &Connection,
    since: DateTime<Utc>,
    limit: u32,
    offset: u32,
    now: DateTime<Utc>,
) -> Result<Vec<OutageEvent>, DbError> {
    let mut statement = connection.prepare(&format!(
        "SELECT {OUTAGE_COLUMNS}
         FROM outage_events
         WHERE started_at >= ?1
         ORDER BY started_at DESC, id DESC
         LIMIT ?2 OFFSET ?3"
    ))?;

    let rows = statement.query_map(
        params![to_db_timestamp(since), i64::from(limit), i64::from(offset)],
        outage_from_row,
    )?;

    let mut outages = Vec::new();
    for row in rows {
        let mut outage = row?;
        if outage.is_open() {
            outage.duration_seconds = Some(elapsed_seconds(outage.started_at, now));
        }
        outages.push(outage);
    }

    Ok(outages)
}

pub fn count_outages(connection: &Connection, since: DateTime<Utc>) -> Result<i64, DbError> {
    let count = connection.query_row(
        "SELECT COUNT(*) FROM outage_events WHERE started_at >= ?1",
        params![to_db_timestamp(since)],
        |row| row.get(0),
    )?;
    Ok(count)
}

pub fn outage_stats(
    connection: &Connection,
    since: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<OutageStats, DbError> {
    let (count, closed_count, closed_seconds): (i64, i64, i64) = connection.query_row(
        "SELECT COUNT(*), COUNT(ended_at), COALESCE(SUM(duration_seconds), 0)
         FROM outage_events
         WHERE started_at >= ?1",
        params![to_db_timestamp(since)],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )?;

    let ongoing_seconds = find_open_outage(connection)?
        .filter(|outage| outage.started_at >= since)
        .map_or(0, |outage| elapsed_seconds(outage.started_at, now));

    Ok(OutageStats {
        count,
        closed_count,
        total_downtime_seconds: closed_seconds + ongoing_seconds,
        average_duration_seconds: if closed_count > 0 {
            closed_seconds / closed_count
        } else {
            0
        },
    })
}
