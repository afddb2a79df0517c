use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;

use crate::adapters::db::{self, DbError};
use crate::app::aggregator::Aggregator;
use crate::app::services::{OutageQueryHandler, ServiceError, SqliteHistoryStore};
use crate::domain::duration::{elapsed_seconds, format_duration};
use crate::domain::models::{CurrentStatus, OutageEvent, OutageStats, PowerState};
use crate::domain::power_state::Clock;

pub const HISTORY_PAGE_SIZE: u32 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub state: PowerState,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub outage: Option<OngoingOutage>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OngoingOutage {
    pub event_id: i64,
    pub started_at: DateTime<Utc>,
    pub elapsed_seconds: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutagePage {
    pub outages: Vec<OutageEvent>,
    pub total: i64,
    pub limit: u32,
    pub offset: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryPage {
    pub page: u32,
    pub page_count: u32,
    pub total: i64,
    pub window_days: i64,
    pub outages: Vec<OutageEvent>,
    pub stats: OutageStats,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FixOutcome {
    NoChange {
        state: PowerState,
    },
    MarkedUp {
        previous: PowerState,
        closed_outage: Option<OutageEvent>,
    },
    MarkedDown {
        previous: PowerState,
        event_id: i64,
        started_at: DateTime<Utc>,
        opened: bool,
    },
}

impl FixOutcome {
    pub fn changed(&self) -> bool {
        !matches!(self, Self::NoChange { .. })
    }

    pub fn state(&self) -> PowerState {
        match self {
            Self::NoChange { state } => *state,
            Self::MarkedUp { .. } => PowerState::Up,
            Self::MarkedDown { .. } => PowerState::Down,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::NoChange { state } => {
                format!("no change needed: power is {state} and the history agrees")
            }
            Self::MarkedUp {
                previous,
                closed_outage: Some(outage),
            } => format!(
                "devices answer: closed outage #{} after {}, state {previous} -> UP",
                outage.id,
                format_duration(outage.duration_seconds.unwrap_or_default())
            ),
            Self::MarkedUp {
                previous,
                closed_outage: None,
            } => format!("devices answer: state {previous} -> UP"),
            Self::MarkedDown {
                previous,
                event_id,
                opened: true,
                ..
            } => format!("no device answers: opened outage #{event_id}, state {previous} -> DOWN"),
            Self::MarkedDown {
                previous,
                event_id,
                opened: false,
                ..
            } => format!(
                "no device answers: linked open outage #{event_id}, state {previous} -> DOWN"
            ),
        }
    }
}

/// Read and repair operations shared by the HTTP API and the chat bot.
#[derive(Clone)]
pub struct PowerCommands {
    store: SqliteHistoryStore,
    aggregator: Arc<Aggregator>,
    clock: Arc<dyn Clock>,
    history_window_days: i64,
}

impl PowerCommands {
    pub fn new(
        store: SqliteHistoryStore,
        aggregator: Arc<Aggregator>,
        clock: Arc<dyn Clock>,
        history_window_days: i64,
    ) -> Self {
        Self {
            store,
            aggregator,
            clock,
            history_window_days: history_window_days.max(1),
        }
    }

    pub fn status(&self) -> Result<StatusReport, ServiceError> {
        let now = self.clock.now();
        let Some(status) = self.store.get_current_status()? else {
            return Ok(StatusReport {
                state: PowerState::Unknown,
                last_checked_at: None,
                outage: None,
            });
        };

        let outage = match (status.state, status.open_event_id) {
            (PowerState::Down, Some(event_id)) => self
                .store
                .get_outage(event_id)?
                .filter(OutageEvent::is_open)
                .map(|event| OngoingOutage {
                    event_id: event.id,
                    started_at: event.started_at,
                    elapsed_seconds: elapsed_seconds(event.started_at, now),
                }),
            _ => None,
        };

        Ok(StatusReport {
            state: status.state,
            last_checked_at: Some(status.last_checked_at),
            outage,
        })
    }

    /// Whole history, newest first.
    pub fn outages(&self, limit: u32, offset: u32) -> Result<OutagePage, ServiceError> {
        let since = DateTime::<Utc>::from(std::time::UNIX_EPOCH);
        let now = self.clock.now();

        Ok(OutagePage {
            outages: self.store.list_outages(since, limit, offset, now)?,
            total: self.store.count_outages(since)?,
            limit,
            offset,
        })
    }

    /// One page of the recent history window. Pages are 1-based; a page past
    /// the end comes back empty with the real page count.
    pub fn history(&self, page: u32) -> Result<HistoryPage, ServiceError> {
        let page = page.max(1);
        let now = self.clock.now();
        let since = now - Duration::days(self.history_window_days);

        let total = self.store.count_outages(since)?;
        let page_size = i64::from(HISTORY_PAGE_SIZE);
        let page_count = u32::try_from((total + page_size - 1) / page_size)
            .unwrap_or(u32::MAX)
            .max(1);
        let offset = (page - 1).saturating_mul(HISTORY_PAGE_SIZE);

        Ok(HistoryPage {
            page,
            page_count,
            total,
            window_days: self.history_window_days,
            outages: self
                .store
                .list_outages(since, HISTORY_PAGE_SIZE, offset, now)?,
            stats: self.store.stats(since, now)?,
        })
    }

    pub fn stats(&self, days: i64) -> Result<OutageStats, ServiceError> {
        let now = self.clock.now();
        self.store.stats(now - Duration::days(days.max(1)), now)
    }

    /// Probes the devices now and rewrites the persisted state to match.
    /// Running it again without a change in reachability is a no-op.
    pub fn fix(&self) -> Result<FixOutcome, ServiceError> {
        let present = self.aggregator.evaluate();
        let now = self.clock.now();
        let outcome = self
            .store
            .with_transaction(|tx| reconcile(tx, present, now))?;

        if outcome.changed() {
            tracing::warn!(present, outcome = %outcome.describe(), "manual fix rewrote power state");
        } else {
            tracing::info!(present, "manual fix found nothing to change");
        }

        Ok(outcome)
    }
}

fn reconcile(
    connection: &Connection,
    present: bool,
    now: DateTime<Utc>,
) -> Result<FixOutcome, DbError> {
    let status = db::get_current_status(connection)?;
    let previous = status
        .as_ref()
        .map_or(PowerState::Unknown, |status| status.state);
    let open = db::find_open_outage(connection)?;

    if present {
        if previous == PowerState::Up
            && open.is_none()
            && status.as_ref().is_some_and(|status| status.open_event_id.is_none())
        {
            return Ok(FixOutcome::NoChange { state: previous });
        }

        let closed_outage = match open {
            Some(event) => Some(db::record_outage_end(connection, event.id, now.max(event.started_at))?),
            None => None,
        };
        db::set_current_status(
            connection,
            &CurrentStatus {
                state: PowerState::Up,
                last_checked_at: now,
                open_event_id: None,
            },
        )?;

        return Ok(FixOutcome::MarkedUp {
            previous,
            closed_outage,
        });
    }

    if let (Some(status), Some(event)) = (&status, &open)
        && status.state == PowerState::Down
        && status.open_event_id == Some(event.id)
    {
        return Ok(FixOutcome::NoChange {
            state: PowerState::Down,
        });
    }

    let (event_id, started_at, opened) = match open {
        Some(event) => (event.id, event.started_at, false),
        None => (db::record_outage_start(connection, now)?, now, true),
    };
    db::set_current_status(
        connection,
        &CurrentStatus {
            state: PowerState::Down,
            last_checked_at: now,
            open_event_id: Some(event_id),
        },
    )?;

    Ok(FixOutcome::MarkedDown {
        previous,
        event_id,
        started_at,
        opened,
    })
}
