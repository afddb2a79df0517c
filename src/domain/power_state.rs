use chrono::{DateTime, Utc};

use crate::domain::models::{CurrentStatus, PowerState};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerTransition {
    /// First reading after startup showed power present.
    Baseline,
    OutageStarted {
        started_at: DateTime<Utc>,
    },
    PowerRestored {
        event_id: Option<i64>,
        started_at: Option<DateTime<Utc>>,
        restored_at: DateTime<Utc>,
    },
}

/// Debounced power state. Pure: persistence and notification are the
/// caller's job, driven by the returned [`PowerTransition`].
#[derive(Debug, Clone)]
pub struct PowerStateMachine {
    debounce_samples: usize,
    state: PowerState,
    candidate: Option<Candidate>,
    open_event_id: Option<i64>,
    outage_started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    present: bool,
    count: usize,
    first_seen: DateTime<Utc>,
}

impl PowerStateMachine {
    pub fn new(debounce_samples: usize) -> Self {
        Self {
            debounce_samples: debounce_samples.max(1),
            state: PowerState::Unknown,
            candidate: None,
            open_event_id: None,
            outage_started_at: None,
        }
    }

    pub fn observe(&mut self, present: bool, at: DateTime<Utc>) -> Option<PowerTransition> {
        match self.state {
            PowerState::Unknown => {
                self.candidate = None;
                if present {
                    self.state = PowerState::Up;
                    Some(PowerTransition::Baseline)
                } else {
                    self.enter_down(at);
                    Some(PowerTransition::OutageStarted { started_at: at })
                }
            }
            PowerState::Up if present => {
                self.candidate = None;
                None
            }
            PowerState::Down if !present => {
                self.candidate = None;
                None
            }
            PowerState::Up => {
                let first_seen = self.accept_candidate(present, at)?;
                self.enter_down(first_seen);
                Some(PowerTransition::OutageStarted {
                    started_at: first_seen,
                })
            }
            PowerState::Down => {
                self.accept_candidate(present, at)?;
                self.state = PowerState::Up;
                Some(PowerTransition::PowerRestored {
                    event_id: self.open_event_id.take(),
                    started_at: self.outage_started_at.take(),
                    restored_at: at,
                })
            }
        }
    }

    pub fn state(&self) -> PowerState {
        self.state
    }

    pub fn open_event_id(&self) -> Option<i64> {
        self.open_event_id
    }

    pub fn outage_started_at(&self) -> Option<DateTime<Utc>> {
        self.outage_started_at
    }

    pub fn pending_readings(&self) -> usize {
        self.candidate.map_or(0, |candidate| candidate.count)
    }

    /// Links the current outage to its persisted event.
    pub fn attach_event(&mut self, event_id: i64, started_at: DateTime<Utc>) {
        self.open_event_id = Some(event_id);
        self.outage_started_at = Some(started_at);
    }

    /// Replaces the committed state with one loaded from storage and drops
    /// any pending debounce run.
    pub fn restore(
        &mut self,
        state: PowerState,
        open_event: Option<(i64, DateTime<Utc>)>,
    ) {
        self.state = state;
        self.candidate = None;
        self.open_event_id = open_event.map(|(id, _)| id);
        self.outage_started_at = open_event.map(|(_, started_at)| started_at);
    }

    pub fn snapshot(&self, checked_at: DateTime<Utc>) -> CurrentStatus {
        CurrentStatus {
            state: self.state,
            last_checked_at: checked_at,
            open_event_id: self.open_event_id,
        }
    }

    fn enter_down(&mut self, started_at: DateTime<Utc>) {
        self.state = PowerState::Down;
        self.open_event_id = None;
        self.outage_started_at = Some(started_at);
    }

    /// Returns the timestamp of the first reading of the run once the run
    /// reaches the debounce threshold.
    fn accept_candidate(&mut self, present: bool, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let candidate = match self.candidate {
            Some(mut candidate) if candidate.present == present => {
                candidate.count += 1;
                candidate
            }
            _ => Candidate {
                present,
                count: 1,
                first_seen: at,
            },
        };

        if candidate.count >= self.debounce_samples {
            self.candidate = None;
            Some(candidate.first_seen)
        } else {
            self.candidate = Some(candidate);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, TimeZone, Utc};

    use super::{PowerStateMachine, PowerTransition};
    use crate::domain::models::PowerState;

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 20, 10, 0, 0).unwrap() + Duration::seconds(seconds)
    }

    fn machine_up(debounce: usize) -> PowerStateMachine {
        let mut machine = PowerStateMachine::new(debounce);
        assert_eq!(machine.observe(true, at(0)), Some(PowerTransition::Baseline));
        machine
    }

    #[test]
    fn first_reading_commits_baseline_without_debounce() {
        let mut machine = PowerStateMachine::new(3);

        assert_eq!(machine.observe(true, at(0)), Some(PowerTransition::Baseline));
        assert_eq!(machine.state(), PowerState::Up);
        assert_eq!(machine.outage_started_at(), None);
    }

    #[test]
    fn first_reading_absent_starts_outage_now() {
        let mut machine = PowerStateMachine::new(3);

        assert_eq!(
            machine.observe(false, at(5)),
            Some(PowerTransition::OutageStarted { started_at: at(5) })
        );
        assert_eq!(machine.state(), PowerState::Down);
        assert_eq!(machine.outage_started_at(), Some(at(5)));
    }

    #[test]
    fn outage_starts_at_first_contrary_reading() {
        let mut machine = machine_up(3);

        assert_eq!(machine.observe(false, at(30)), None);
        assert_eq!(machine.observe(false, at(60)), None);
        assert_eq!(machine.pending_readings(), 2);
        assert_eq!(
            machine.observe(false, at(90)),
            Some(PowerTransition::OutageStarted { started_at: at(30) })
        );
        assert_eq!(machine.pending_readings(), 0);
    }

    #[test]
    fn isolated_contrary_readings_never_commit() {
        let mut machine = machine_up(2);
        let readings = [true, false, true, true, false, true, false, true];

        for (index, present) in readings.into_iter().enumerate() {
            assert_eq!(machine.observe(present, at(index as i64 * 30)), None);
            assert_eq!(machine.state(), PowerState::Up);
        }
    }

    #[test]
    fn isolated_restore_reading_does_not_end_outage() {
        let mut machine = machine_up(2);
        machine.observe(false, at(30));
        machine.observe(false, at(60));
        machine.attach_event(7, at(30));

        assert_eq!(machine.observe(true, at(90)), None);
        assert_eq!(machine.observe(false, at(120)), None);
        assert_eq!(machine.state(), PowerState::Down);
        assert_eq!(machine.open_event_id(), Some(7));
    }

    #[test]
    fn restoration_reports_tracked_event_and_bounds() {
        let mut machine = machine_up(2);
        machine.observe(false, at(30));
        machine.observe(false, at(60));
        machine.attach_event(7, at(30));

        assert_eq!(machine.observe(true, at(300)), None);
        assert_eq!(
            machine.observe(true, at(330)),
            Some(PowerTransition::PowerRestored {
                event_id: Some(7),
                started_at: Some(at(30)),
                restored_at: at(330),
            })
        );
        assert_eq!(machine.state(), PowerState::Up);
        assert_eq!(machine.open_event_id(), None);
    }

    #[test]
    fn single_sample_debounce_flips_immediately() {
        let mut machine = machine_up(1);

        assert_eq!(
            machine.observe(false, at(30)),
            Some(PowerTransition::OutageStarted { started_at: at(30) })
        );
    }

    #[test]
    fn restore_clears_pending_run() {
        let mut machine = machine_up(3);
        machine.observe(false, at(30));

        machine.restore(PowerState::Down, Some((5, at(10))));

        assert_eq!(machine.pending_readings(), 0);
        assert_eq!(machine.state(), PowerState::Down);
        assert_eq!(machine.snapshot(at(40)).open_event_id, Some(5));
        assert_eq!(machine.outage_started_at(), Some(at(10)));
    }
}
