//! The running-timer state machine (`Idle` → `Running` → `Idle`) and the
//! arbiter that keeps it exclusive with the focus timer.

use chrono::{DateTime, NaiveDate, Utc};
use log::{info, warn};

use crate::domain::{Partitions, TimeEntry};
use crate::error::{Result, TrackerError};
use crate::interval_store::{IntervalStore, find_active, remove_from, upsert_in};
use crate::store::KeyValueStore;
use crate::timezone::{
    Zone, civil_date, civil_date_key, date_key, end_of_civil_day, format_duration,
    start_of_civil_day,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerOwner {
    /// The main time tracker.
    Tracker,
    /// The focus (pomodoro) timer.
    Focus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArbiterRequest {
    Acquire(TimerOwner),
    Release(TimerOwner),
    Query,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArbiterResponse {
    Granted,
    Denied { holder: TimerOwner },
    Released,
    NotHeld,
    Holder(Option<TimerOwner>),
}

/// Sole owner of the "which subsystem is timing right now" state. Both the
/// tracker and the focus timer ask it before starting.
#[derive(Debug, Default)]
pub struct TimerArbiter {
    holder: Option<TimerOwner>,
}

impl TimerArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&mut self, request: ArbiterRequest) -> ArbiterResponse {
        match request {
            ArbiterRequest::Acquire(owner) => match self.holder {
                Some(holder) if holder != owner => ArbiterResponse::Denied { holder },
                _ => {
                    self.holder = Some(owner);
                    ArbiterResponse::Granted
                }
            },
            ArbiterRequest::Release(owner) => {
                if self.holder == Some(owner) {
                    self.holder = None;
                    ArbiterResponse::Released
                } else {
                    ArbiterResponse::NotHeld
                }
            }
            ArbiterRequest::Query => ArbiterResponse::Holder(self.holder),
        }
    }

    pub fn acquire(&mut self, owner: TimerOwner) -> Result<()> {
        match self.handle(ArbiterRequest::Acquire(owner)) {
            ArbiterResponse::Denied { holder } => Err(TrackerError::conflict(format!(
                "the {} timer is already running",
                owner_label(holder)
            ))),
            _ => Ok(()),
        }
    }

    pub fn release(&mut self, owner: TimerOwner) -> bool {
        self.handle(ArbiterRequest::Release(owner)) == ArbiterResponse::Released
    }

    pub fn holder(&mut self) -> Option<TimerOwner> {
        match self.handle(ArbiterRequest::Query) {
            ArbiterResponse::Holder(holder) => holder,
            _ => None,
        }
    }
}

fn owner_label(owner: TimerOwner) -> &'static str {
    match owner {
        TimerOwner::Tracker => "time tracker",
        TimerOwner::Focus => "focus",
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StopOutcome {
    Idle,
    Stopped {
        date_key: String,
        entry: TimeEntry,
    },
    /// The civil day changed while the timer ran. The start day is closed at
    /// 23:59:59, every day in `between` gets a full-day piece and the current
    /// day gets the time since its midnight.
    SplitAtMidnight {
        first_key: String,
        first: TimeEntry,
        between: Vec<(String, TimeEntry)>,
        second_key: String,
        second: TimeEntry,
    },
}

impl StopOutcome {
    pub fn message(&self) -> String {
        match self {
            StopOutcome::Idle => "no timer running".to_string(),
            StopOutcome::Stopped { entry, .. } => format!(
                "stopped \"{}\" after {}",
                entry.description,
                format_duration(entry.duration_seconds(entry.start_time))
            ),
            StopOutcome::SplitAtMidnight {
                first_key,
                between,
                second_key,
                ..
            } if between.is_empty() => {
                format!("timer ran past midnight; recorded for both {first_key} and {second_key}")
            }
            StopOutcome::SplitAtMidnight {
                first_key,
                between,
                second_key,
                ..
            } => format!(
                "timer ran past midnight; recorded for {first_key} through {second_key} ({} days)",
                between.len() + 2
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StartOutcome {
    pub date_key: String,
    pub entry: TimeEntry,
    /// Present when a running timer had to be stopped first.
    pub stopped: Option<StopOutcome>,
}

pub struct ActiveTimerController<'a, S: KeyValueStore> {
    store: &'a mut IntervalStore<S>,
    arbiter: &'a mut TimerArbiter,
}

impl<'a, S: KeyValueStore> ActiveTimerController<'a, S> {
    /// Brings the arbiter in line with whatever the store says is running.
    pub fn new(store: &'a mut IntervalStore<S>, arbiter: &'a mut TimerArbiter) -> Result<Self> {
        let running = store.find_active_entry()?.is_some();
        if running {
            if let Err(err) = arbiter.acquire(TimerOwner::Tracker) {
                warn!("tracker entry is running while another timer holds the clock: {err}");
            }
        } else {
            arbiter.release(TimerOwner::Tracker);
        }
        Ok(Self { store, arbiter })
    }

    pub fn active_entry(&self) -> Result<Option<(String, TimeEntry)>> {
        self.store.find_active_entry()
    }

    /// Starts a new timer for today. A running timer is stopped first in the
    /// same write, so two entries are never active at once.
    pub fn start(
        &mut self,
        description: &str,
        now: DateTime<Utc>,
        zone: Zone,
        viewing_day: NaiveDate,
    ) -> Result<StartOutcome> {
        let entry = TimeEntry::active(description, now);
        self.begin(entry, now, zone, viewing_day)
    }

    /// Starts a new timer with the description and classifiers of `template`.
    pub fn continue_entry(
        &mut self,
        template: &TimeEntry,
        now: DateTime<Utc>,
        zone: Zone,
        viewing_day: NaiveDate,
    ) -> Result<StartOutcome> {
        let entry = TimeEntry::active(&template.description, now).with_classifiers_of(template);
        self.begin(entry, now, zone, viewing_day)
    }

    pub fn stop(&mut self, now: DateTime<Utc>, zone: Zone) -> Result<StopOutcome> {
        let mut partitions = self.store.load_all()?;
        let outcome = stop_in(&mut partitions, now, zone);
        if outcome != StopOutcome::Idle {
            self.store.save_all(&partitions)?;
            info!("{}", outcome.message());
        }
        self.arbiter.release(TimerOwner::Tracker);
        Ok(outcome)
    }

    fn begin(
        &mut self,
        entry: TimeEntry,
        now: DateTime<Utc>,
        zone: Zone,
        viewing_day: NaiveDate,
    ) -> Result<StartOutcome> {
        if let Some(TimerOwner::Focus) = self.arbiter.holder() {
            return Err(TrackerError::conflict(
                "stop the focus timer before starting the time tracker",
            ));
        }

        let today = civil_date(now, zone);
        if viewing_day != today {
            return Err(TrackerError::invalid_state(format!(
                "timers can only be started for today ({}), not {}",
                date_key(today),
                date_key(viewing_day)
            )));
        }

        let mut partitions = self.store.load_all()?;
        let stopped = match stop_in(&mut partitions, now, zone) {
            StopOutcome::Idle => None,
            outcome => Some(outcome),
        };

        let date_key = civil_date_key(now, zone);
        upsert_in(&mut partitions, &date_key, entry.clone());
        self.store.save_all(&partitions)?;
        self.arbiter.acquire(TimerOwner::Tracker)?;

        info!("started \"{}\" on {date_key}", entry.description);
        Ok(StartOutcome {
            date_key,
            entry,
            stopped,
        })
    }
}

/// Closes the active entry inside `partitions`, splitting it at civil
/// midnight when the day in `zone` advanced while it ran.
pub fn stop_in(partitions: &mut Partitions, now: DateTime<Utc>, zone: Zone) -> StopOutcome {
    let Some((stored_key, active)) = find_active(partitions) else {
        return StopOutcome::Idle;
    };

    let start_date = civil_date(active.start_time, zone);
    let current_date = civil_date(now, zone);

    if current_date <= start_date {
        let mut closed = active;
        closed.end_time = Some(now.max(closed.start_time));
        closed.is_active = false;
        upsert_in(partitions, &stored_key, closed.clone());
        return StopOutcome::Stopped {
            date_key: stored_key,
            entry: closed,
        };
    }

    let first_key = date_key(start_date);
    let second_key = date_key(current_date);

    let mut first = active.clone();
    first.end_time = Some(end_of_civil_day(start_date, zone).max(first.start_time));
    first.is_active = false;
    remove_from(partitions, &first.id, &stored_key);
    upsert_in(partitions, &first_key, first.clone());

    let between = start_date
        .iter_days()
        .skip(1)
        .take_while(|day| *day < current_date)
        .map(|day| {
            let key = date_key(day);
            let piece = TimeEntry::piece_of(
                &active,
                start_of_civil_day(day, zone),
                end_of_civil_day(day, zone),
            );
            upsert_in(partitions, &key, piece.clone());
            (key, piece)
        })
        .collect::<Vec<_>>();
    if !between.is_empty() {
        warn!(
            "\"{}\" ran for {} full days; each was recorded as a full-day entry",
            active.description,
            between.len()
        );
    }

    let midnight = start_of_civil_day(current_date, zone).min(now);
    let second = TimeEntry::piece_of(&active, midnight, now);
    upsert_in(partitions, &second_key, second.clone());

    StopOutcome::SplitAtMidnight {
        first_key,
        first,
        between,
        second_key,
        second,
    }
}
