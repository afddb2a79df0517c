use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use thiserror::Error;

use crate::adapters::db::{self, DbError};
use crate::app::aggregator::Aggregator;
use crate::app::notifier::Notifier;
use crate::app::services::{ServiceError, SqliteHistoryStore};
use crate::domain::duration::elapsed_seconds;
use crate::domain::models::{CurrentStatus, OutageEvent, PowerEvent, PowerState};
use crate::domain::power_state::{Clock, PowerStateMachine, PowerTransition};

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("failed to recover power state: {0}")]
    Recovery(#[source] ServiceError),
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_backoff: Duration::from_millis(200),
        }
    }
}

/// Correction applied to an inconsistent snapshot row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepairAction {
    ReopenedOutage {
        event_id: i64,
        started_at: DateTime<Utc>,
    },
    RelinkedOutage {
        event_id: i64,
    },
    ClosedDanglingOutages {
        event_ids: Vec<i64>,
    },
}

#[derive(Debug)]
struct RecoveredState {
    state: PowerState,
    open_event: Option<OutageEvent>,
    repair: Option<RepairAction>,
}

/// Outage closed while the store rejected writes.
#[derive(Debug, Clone)]
struct PendingOutage {
    event_id: Option<i64>,
    started_at: DateTime<Utc>,
    ended_at: DateTime<Utc>,
}

struct TickStep {
    machine: PowerStateMachine,
    event: Option<PowerEvent>,
}

pub struct PowerMonitor<N, Cl> {
    store: SqliteHistoryStore,
    aggregator: Arc<Aggregator>,
    notifier: N,
    clock: Cl,
    machine: PowerStateMachine,
    retry: RetryPolicy,
    degraded: bool,
    backlog: Vec<PendingOutage>,
}

impl<N, Cl> PowerMonitor<N, Cl>
where
    N: Notifier,
    Cl: Clock,
{
    pub fn new(
        store: SqliteHistoryStore,
        aggregator: Arc<Aggregator>,
        notifier: N,
        clock: Cl,
        debounce_samples: usize,
    ) -> Self {
        Self {
            store,
            aggregator,
            notifier,
            clock,
            machine: PowerStateMachine::new(debounce_samples),
            retry: RetryPolicy::default(),
            degraded: false,
            backlog: Vec::new(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Loads the persisted snapshot, repairing it when a crash left it
    /// inconsistent. Must run before the first tick.
    pub fn recover(&mut self) -> Result<Option<RepairAction>, MonitorError> {
        let recovered = self
            .store
            .with_transaction(|tx| recover_snapshot(tx))
            .map_err(MonitorError::Recovery)?;

        match &recovered.repair {
            Some(repair) => tracing::warn!(
                ?repair,
                state = %recovered.state,
                "repaired inconsistent power snapshot"
            ),
            None => tracing::info!(
                state = %recovered.state,
                open_event_id = ?recovered.open_event.as_ref().map(|event| event.id),
                "power snapshot recovered"
            ),
        }

        self.machine.restore(
            recovered.state,
            recovered
                .open_event
                .as_ref()
                .map(|event| (event.id, event.started_at)),
        );

        Ok(recovered.repair)
    }

    pub fn announce_started(&self) {
        self.publish(&PowerEvent::MonitoringStarted {
            at: self.clock.now(),
            state: self.machine.state(),
        });
    }

    pub fn tick(&mut self) -> Option<PowerEvent> {
        let present = self.aggregator.evaluate();
        let now = self.clock.now();
        self.apply_reading(present, now)
    }

    pub fn apply_reading(&mut self, present: bool, now: DateTime<Utc>) -> Option<PowerEvent> {
        let event = match self.persist_reading(present, now) {
            Ok(step) => {
                if self.degraded {
                    tracing::info!(
                        flushed_outages = self.backlog.len(),
                        "history store writable again; leaving degraded mode"
                    );
                }
                self.degraded = false;
                self.backlog.clear();
                self.machine = step.machine;
                step.event
            }
            Err(error) => {
                if self.degraded {
                    tracing::debug!(error = %error, "history store still unavailable");
                } else {
                    tracing::warn!(
                        error = %error,
                        "history store unavailable; degraded mode, power state tracked in memory only"
                    );
                }
                self.degraded = true;
                self.apply_in_memory(present, now)
            }
        };

        tracing::debug!(
            present,
            state = %self.machine.state(),
            pending_readings = self.machine.pending_readings(),
            "poll tick complete"
        );

        if let Some(event) = &event {
            log_event(event);
            self.publish(event);
        }
        event
    }

    /// Writes state kept in memory during degraded mode. Called on shutdown.
    pub fn flush(&mut self) {
        if !self.degraded {
            return;
        }

        let now = self.clock.now();
        let mut machine = self.machine.clone();
        let result = self.store.with_transaction(|tx| {
            flush_backlog(tx, &self.backlog, &mut machine, now)?;
            db::set_current_status(tx, &machine.snapshot(now))
        });

        match result {
            Ok(()) => {
                tracing::info!(flushed_outages = self.backlog.len(), "pending power state flushed");
                self.machine = machine;
                self.backlog.clear();
                self.degraded = false;
            }
            Err(error) => tracing::error!(
                error = %error,
                pending_outages = self.backlog.len(),
                "failed to flush pending power state; unsaved outages are lost"
            ),
        }
    }

    pub fn state(&self) -> PowerState {
        self.machine.state()
    }

    pub fn open_event_id(&self) -> Option<i64> {
        self.machine.open_event_id()
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    fn persist_reading(&self, present: bool, now: DateTime<Utc>) -> Result<TickStep, ServiceError> {
        with_retry(&self.retry, || {
            self.store
                .with_transaction(|tx| self.tick_in_transaction(tx, present, now))
        })
    }

    fn tick_in_transaction(
        &self,
        tx: &Connection,
        present: bool,
        now: DateTime<Utc>,
    ) -> Result<TickStep, DbError> {
        let mut machine = self.machine.clone();

        if self.degraded {
            flush_backlog(tx, &self.backlog, &mut machine, now)?;
        } else {
            adopt_external_changes(tx, &mut machine)?;
        }

        let transition = machine.observe(present, now);
        let event = persist_transition(tx, &mut machine, transition)?;
        db::set_current_status(tx, &machine.snapshot(now))?;

        Ok(TickStep { machine, event })
    }

    fn apply_in_memory(&mut self, present: bool, now: DateTime<Utc>) -> Option<PowerEvent> {
        match self.machine.observe(present, now)? {
            PowerTransition::Baseline => None,
            PowerTransition::OutageStarted { started_at } => Some(PowerEvent::OutageStarted {
                event_id: None,
                started_at,
            }),
            PowerTransition::PowerRestored {
                event_id,
                started_at,
                restored_at,
            } => {
                let started_at = started_at.unwrap_or(restored_at);
                self.backlog.push(PendingOutage {
                    event_id,
                    started_at,
                    ended_at: restored_at,
                });
                Some(PowerEvent::PowerRestored {
                    event_id,
                    started_at,
                    ended_at: restored_at,
                    duration_seconds: elapsed_seconds(started_at, restored_at),
                })
            }
        }
    }

    fn publish(&self, event: &PowerEvent) {
        if let Err(error) = self.notifier.notify(event) {
            tracing::warn!(error = %error, "failed to deliver power notification");
        }
    }
}

fn log_event(event: &PowerEvent) {
    match event {
        PowerEvent::OutageStarted {
            event_id,
            started_at,
        } => tracing::warn!(?event_id, started_at = %started_at, "power outage detected"),
        PowerEvent::PowerRestored {
            event_id,
            duration_seconds,
            ..
        } => tracing::info!(?event_id, duration_seconds, "power restored"),
        PowerEvent::MonitoringStarted { .. } => {}
    }
}

fn with_retry<T>(
    policy: &RetryPolicy,
    mut op: impl FnMut() -> Result<T, ServiceError>,
) -> Result<T, ServiceError> {
    let mut backoff = policy.initial_backoff;
    let mut attempt = 1;

    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(error) if error.is_retryable() && attempt < policy.attempts => {
                tracing::warn!(attempt, error = %error, "history store write failed; retrying");
                thread::sleep(backoff);
                backoff = backoff.saturating_mul(2);
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}

fn recover_snapshot(connection: &Connection) -> Result<RecoveredState, DbError> {
    let Some(status) = db::get_current_status(connection)? else {
        return Ok(RecoveredState {
            state: PowerState::Unknown,
            open_event: None,
            repair: None,
        });
    };

    if status.state == PowerState::Down {
        let linked = match status.open_event_id {
            Some(event_id) => db::get_outage(connection, event_id)?.filter(OutageEvent::is_open),
            None => None,
        };
        if let Some(event) = linked {
            return Ok(RecoveredState {
                state: PowerState::Down,
                open_event: Some(event),
                repair: None,
            });
        }

        let (event, repair) = match db::find_open_outage(connection)? {
            Some(event) => {
                let repair = RepairAction::RelinkedOutage { event_id: event.id };
                (event, repair)
            }
            None => {
                let started_at = status.last_checked_at;
                let id = db::record_outage_start(connection, started_at)?;
                let event = OutageEvent {
                    id,
                    started_at,
                    ended_at: None,
                    duration_seconds: None,
                };
                (
                    event,
                    RepairAction::ReopenedOutage {
                        event_id: id,
                        started_at,
                    },
                )
            }
        };

        db::set_current_status(
            connection,
            &CurrentStatus {
                state: PowerState::Down,
                last_checked_at: status.last_checked_at,
                open_event_id: Some(event.id),
            },
        )?;

        return Ok(RecoveredState {
            state: PowerState::Down,
            open_event: Some(event),
            repair: Some(repair),
        });
    }

    let state = status.state;
    let mut closed = Vec::new();
    while let Some(event) = db::find_open_outage(connection)? {
        let ended_at = status.last_checked_at.max(event.started_at);
        db::record_outage_end(connection, event.id, ended_at)?;
        closed.push(event.id);
    }

    if closed.is_empty() && status.open_event_id.is_none() {
        return Ok(RecoveredState {
            state,
            open_event: None,
            repair: None,
        });
    }

    db::set_current_status(
        connection,
        &CurrentStatus {
            open_event_id: None,
            ..status
        },
    )?;

    Ok(RecoveredState {
        state,
        open_event: None,
        repair: Some(RepairAction::ClosedDanglingOutages { event_ids: closed }),
    })
}

/// Picks up a snapshot rewritten outside this monitor, such as a manual fix.
fn adopt_external_changes(
    connection: &Connection,
    machine: &mut PowerStateMachine,
) -> Result<(), DbError> {
    let durable = db::get_current_status(connection)?;
    let (state, open_event_id) = durable
        .as_ref()
        .map_or((PowerState::Unknown, None), |status| {
            (status.state, status.open_event_id)
        });

    if state == machine.state() && open_event_id == machine.open_event_id() {
        return Ok(());
    }

    let recovered = recover_snapshot(connection)?;
    tracing::info!(
        previous_state = %machine.state(),
        adopted_state = %recovered.state,
        open_event_id = ?recovered.open_event.as_ref().map(|event| event.id),
        "adopting power state changed outside the monitor"
    );
    machine.restore(
        recovered.state,
        recovered
            .open_event
            .as_ref()
            .map(|event| (event.id, event.started_at)),
    );

    Ok(())
}

fn persist_transition(
    connection: &Connection,
    machine: &mut PowerStateMachine,
    transition: Option<PowerTransition>,
) -> Result<Option<PowerEvent>, DbError> {
    match transition {
        None | Some(PowerTransition::Baseline) => Ok(None),
        Some(PowerTransition::OutageStarted { started_at }) => {
            let event = match db::find_open_outage(connection)? {
                Some(existing) => {
                    tracing::warn!(
                        event_id = existing.id,
                        "an open outage is already recorded; tracking it instead of opening another"
                    );
                    existing
                }
                None => OutageEvent {
                    id: db::record_outage_start(connection, started_at)?,
                    started_at,
                    ended_at: None,
                    duration_seconds: None,
                },
            };
            machine.attach_event(event.id, event.started_at);

            Ok(Some(PowerEvent::OutageStarted {
                event_id: Some(event.id),
                started_at: event.started_at,
            }))
        }
        Some(PowerTransition::PowerRestored {
            event_id,
            started_at,
            restored_at,
        }) => {
            let closed = match event_id {
                Some(event_id) => match db::record_outage_end(connection, event_id, restored_at) {
                    Ok(event) => Some(event),
                    Err(DbError::NotFound { event_id }) => {
                        tracing::warn!(event_id, "tracked outage missing or already closed");
                        None
                    }
                    Err(error) => return Err(error),
                },
                None => {
                    tracing::warn!("power restored without a tracked outage event");
                    None
                }
            };

            let started_at = closed
                .as_ref()
                .map(|event| event.started_at)
                .or(started_at)
                .unwrap_or(restored_at);
            let duration_seconds = closed
                .and_then(|event| event.duration_seconds)
                .unwrap_or_else(|| elapsed_seconds(started_at, restored_at));

            Ok(Some(PowerEvent::PowerRestored {
                event_id,
                started_at,
                ended_at: restored_at,
                duration_seconds,
            }))
        }
    }
}

fn flush_backlog(
    connection: &Connection,
    backlog: &[PendingOutage],
    machine: &mut PowerStateMachine,
    now: DateTime<Utc>,
) -> Result<(), DbError> {
    for pending in backlog {
        match pending.event_id {
            Some(event_id) => match db::record_outage_end(connection, event_id, pending.ended_at) {
                Ok(_) | Err(DbError::NotFound { .. }) => {}
                Err(error) => return Err(error),
            },
            None => {
                db::insert_closed_outage(connection, pending.started_at, pending.ended_at)?;
            }
        }
    }

    if machine.state() == PowerState::Down && machine.open_event_id().is_none() {
        let started_at = machine.outage_started_at().unwrap_or(now);
        let event_id = match db::find_open_outage(connection)? {
            Some(existing) => existing.id,
            None => db::record_outage_start(connection, started_at)?,
        };
        machine.attach_event(event_id, started_at);
    }

    Ok(())
}
