use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Device {
    pub name: String,
    #[serde(alias = "ip")]
    pub address: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    Up,
    Down,
    Unknown,
}

impl PowerState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Up => "UP",
            Self::Down => "DOWN",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PowerState {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "UP" => Ok(Self::Up),
            "DOWN" => Ok(Self::Down),
            "UNKNOWN" => Ok(Self::Unknown),
            other => Err(format!("unknown power state '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutageEvent {
    pub id: i64,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
}

impl OutageEvent {
    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }
}

/// Singleton snapshot of the monitor, persisted on every tick for crash recovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentStatus {
    pub state: PowerState,
    pub last_checked_at: DateTime<Utc>,
    pub open_event_id: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OutageStats {
    pub count: i64,
    pub closed_count: i64,
    pub total_downtime_seconds: i64,
    pub average_duration_seconds: i64,
}

/// Events pushed to subscribers. `event_id` is `None` while the history
/// store is unavailable and the outage only exists in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PowerEvent {
    MonitoringStarted {
        at: DateTime<Utc>,
        state: PowerState,
    },
    OutageStarted {
        event_id: Option<i64>,
        started_at: DateTime<Utc>,
    },
    PowerRestored {
        event_id: Option<i64>,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
        duration_seconds: i64,
    },
}
