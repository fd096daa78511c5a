use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use rand::{Rng, distributions::Alphanumeric, thread_rng};
use serde::{Deserialize, Serialize};

const ID_SUFFIX_LEN: usize = 6;

pub const POMODORO_SOURCE: &str = "pomodoro";

const PLACEHOLDER_DESCRIPTIONS: [&str; 8] = [
    "Deep work",
    "Something important",
    "Untitled task",
    "Making progress",
    "Focus session",
    "Getting things done",
    "Busy being brilliant",
    "Mystery task",
];

/// Civil-date key (`yyyy-MM-dd`) to the entries recorded on that day.
pub type Partitions = BTreeMap<String, Vec<TimeEntry>>;

/// Civil-date key to the weekly timesheet row for that day.
pub type WeeklyRows = BTreeMap<String, WeeklyTimesheetRow>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeEntry {
    pub id: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl TimeEntry {
    /// A running entry starting at `start_time`.
    pub fn active(description: &str, start_time: DateTime<Utc>) -> Self {
        Self {
            id: generate_id(start_time),
            description: description_or_placeholder(description),
            project: None,
            task: None,
            tags: Vec::new(),
            start_time,
            end_time: None,
            is_active: true,
            source: None,
        }
    }

    pub fn completed(
        description: &str,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Self {
        Self {
            end_time: Some(end_time),
            is_active: false,
            ..Self::active(description, start_time)
        }
    }

    /// A completed copy of `template` covering `start_time..end_time` under a
    /// fresh id. The stored description is kept as is, blank or not.
    pub fn piece_of(
        template: &TimeEntry,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id: generate_id(start_time),
            start_time,
            end_time: Some(end_time),
            is_active: false,
            ..template.clone()
        }
    }

    /// Copies project, task and tags from `other`.
    pub fn with_classifiers_of(mut self, other: &TimeEntry) -> Self {
        self.project = other.project.clone();
        self.task = other.task.clone();
        self.tags = other.tags.clone();
        self
    }

    pub fn is_completed(&self) -> bool {
        !self.is_active && self.end_time.is_some()
    }

    pub fn is_pomodoro(&self) -> bool {
        self.source.as_deref() == Some(POMODORO_SOURCE)
    }

    /// Elapsed seconds; running entries are measured against `now`.
    pub fn duration_seconds(&self, now: DateTime<Utc>) -> i64 {
        let end = self.end_time.unwrap_or(now);
        (end - self.start_time).num_seconds().max(0)
    }
}

/// Chronological order with `id` as the tie breaker.
pub fn sort_chronologically(entries: &mut [TimeEntry]) {
    entries.sort_by(|left, right| {
        left.start_time
            .cmp(&right.start_time)
            .then_with(|| left.id.cmp(&right.id))
    });
}

/// A day of the weekly timesheet. Every field is optional because rows can
/// be edited by hand.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeeklyTimesheetRow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tasks: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_in: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_out: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub break_hours: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceLineItem {
    pub date: String,
    pub description: String,
    pub hours: f64,
    pub amount: f64,
    pub formatted_amount: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeekStart {
    Sunday,
    #[default]
    Monday,
}

impl Display for WeekStart {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            WeekStart::Sunday => write!(f, "sunday"),
            WeekStart::Monday => write!(f, "monday"),
        }
    }
}

impl FromStr for WeekStart {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "sunday" => Ok(WeekStart::Sunday),
            "monday" => Ok(WeekStart::Monday),
            other => Err(format!("unknown week start: {other}")),
        }
    }
}

/// Millisecond timestamp followed by a random suffix, so ids sort in
/// creation order when start times tie.
pub fn generate_id(at: DateTime<Utc>) -> String {
    let suffix: String = thread_rng()
        .sample_iter(&Alphanumeric)
        .take(ID_SUFFIX_LEN)
        .map(char::from)
        .collect();
    format!("{:013}-{suffix}", at.timestamp_millis().max(0))
}

pub fn description_or_placeholder(description: &str) -> String {
    let trimmed = description.trim();
    if !trimmed.is_empty() {
        return trimmed.to_string();
    }

    PLACEHOLDER_DESCRIPTIONS
        .choose(&mut thread_rng())
        .copied()
        .unwrap_or("Untitled task")
        .to_string()
}
