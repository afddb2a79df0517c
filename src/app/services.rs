use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use thiserror::Error;

use crate::adapters::db;
use crate::adapters::db::DbError;
use crate::domain::models::{CurrentStatus, OutageEvent, OutageStats};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("database lock poisoned")]
    DbLockPoisoned,
    #[error("database operation failed: {0}")]
    Database(#[from] DbError),
}

impl ServiceError {
    /// Transient storage failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Database(DbError::Sqlite(_)))
    }
}

pub trait OutageQueryHandler {
    fn get_current_status(&self) -> Result<Option<CurrentStatus>, ServiceError>;
    fn get_outage(&self, event_id: i64) -> Result<Option<OutageEvent>, ServiceError>;
    fn list_outages(
        &self,
        since: DateTime<Utc>,
        limit: u32,
        offset: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutageEvent>, ServiceError>;
    fn count_outages(&self, since: DateTime<Utc>) -> Result<i64, ServiceError>;
    fn stats(&self, since: DateTime<Utc>, now: DateTime<Utc>) -> Result<OutageStats, ServiceError>;
}

/// History store handle shared by the poll loop and the command surfaces.
#[derive(Clone)]
pub struct SqliteHistoryStore {
    connection: Arc<Mutex<Connection>>,
}

impl SqliteHistoryStore {
    pub fn new(connection: Arc<Mutex<Connection>>) -> Self {
        Self { connection }
    }

    fn with_connection<T>(
        &self,
        op: impl FnOnce(&Connection) -> Result<T, DbError>,
    ) -> Result<T, ServiceError> {
        let connection = self
            .connection
            .lock()
            .map_err(|_| ServiceError::DbLockPoisoned)?;
        op(&connection).map_err(ServiceError::from)
    }

    /// Runs `op` inside a `BEGIN IMMEDIATE` transaction so concurrent writers,
    /// in this process or another, are serialized by SQLite. Rolls back when
    /// `op` fails. This is the only write path the store exposes.
    pub fn with_transaction<T>(
        &self,
        op: impl FnOnce(&Transaction<'_>) -> Result<T, DbError>,
    ) -> Result<T, ServiceError> {
        let mut connection = self
            .connection
            .lock()
            .map_err(|_| ServiceError::DbLockPoisoned)?;
        let transaction = connection
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(DbError::from)?;
        let value = op(&transaction)?;
        transaction.commit().map_err(DbError::from)?;
        Ok(value)
    }
}

impl OutageQueryHandler for SqliteHistoryStore {
    fn get_current_status(&self) -> Result<Option<CurrentStatus>, ServiceError> {
        self.with_connection(db::get_current_status)
    }

    fn get_outage(&self, event_id: i64) -> Result<Option<OutageEvent>, ServiceError> {
        self.with_connection(|connection| db::get_outage(connection, event_id))
    }

    fn list_outages(
        &self,
        since: DateTime<Utc>,
        limit: u32,
        offset: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutageEvent>, ServiceError> {
        self.with_connection(|connection| db::list_outages(connection, since, limit, offset, now))
    }

    fn count_outages(&self, since: DateTime<Utc>) -> Result<i64, ServiceError> {
        self.with_connection(|connection| db::count_outages(connection, since))
    }

    fn stats(&self, since: DateTime<Utc>, now: DateTime<Utc>) -> Result<OutageStats, ServiceError> {
        self.with_connection(|connection| db::outage_stats(connection, since, now))
    }
}
