//! Per-day totals, inferred breaks and the unified display sequence.

use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::domain::{TimeEntry, sort_chronologically};
use crate::reconcile::merged_seconds;
use crate::timezone::duration_seconds;

/// Gaps at or below this many seconds are noise, not breaks.
pub const BREAK_THRESHOLD_SECONDS: i64 = 10;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakSpan {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub seconds: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DisplayItem {
    Active(TimeEntry),
    Entry(TimeEntry),
    Break(BreakSpan),
}

/// Completed, well-formed entries in chronological order. Inactive entries
/// without an end, or ending before they start, are skipped.
pub(crate) fn completed_sorted(entries: &[TimeEntry]) -> Vec<TimeEntry> {
    let mut completed = entries
        .iter()
        .filter(|entry| !entry.is_active)
        .filter(|entry| match entry.end_time {
            Some(end) if end >= entry.start_time => true,
            Some(_) => {
                warn!("entry {} ends before it starts; skipping it", entry.id);
                false
            }
            None => {
                warn!("entry {} is not running but has no end time; skipping it", entry.id);
                false
            }
        })
        .cloned()
        .collect::<Vec<_>>();
    sort_chronologically(&mut completed);
    completed
}

fn gap_after(previous: &TimeEntry, next: &TimeEntry) -> Option<BreakSpan> {
    if previous.is_active {
        return None;
    }
    let end = previous.end_time?;
    let seconds = duration_seconds(end, next.start_time);
    (seconds > BREAK_THRESHOLD_SECONDS).then_some(BreakSpan {
        start: end,
        end: next.start_time,
        seconds,
    })
}

/// Overlap-merged worked time plus the running entry's elapsed time.
pub fn daily_total_seconds(
    entries: &[TimeEntry],
    active: Option<&TimeEntry>,
    now: DateTime<Utc>,
) -> i64 {
    let completed = completed_sorted(entries);
    let running = active
        .map(|entry| duration_seconds(entry.start_time, now).max(0))
        .unwrap_or(0);
    merged_seconds(&completed) + running
}

pub fn break_seconds(entries: &[TimeEntry], active: Option<&TimeEntry>) -> i64 {
    let mut sequence = completed_sorted(entries);
    if let Some(active) = active {
        sequence.push(active.clone());
    }

    sequence
        .windows(2)
        .filter_map(|pair| gap_after(&pair[0], &pair[1]))
        .map(|span| span.seconds)
        .sum()
}

/// Pure projection of a day for display: the running entry first, then the
/// completed entries with the breaks between them in `order`.
pub fn unified_display_sequence(
    entries: &[TimeEntry],
    active: Option<&TimeEntry>,
    order: SortOrder,
    show_breaks: bool,
) -> Vec<DisplayItem> {
    let mut timeline = completed_sorted(entries);
    if let Some(active) = active {
        let position = timeline
            .iter()
            .position(|entry| entry.start_time > active.start_time)
            .unwrap_or(timeline.len());
        timeline.insert(position, active.clone());
    }

    let mut chronological = Vec::with_capacity(timeline.len() * 2);
    for (index, entry) in timeline.iter().enumerate() {
        if index > 0 {
            let previous = &timeline[index - 1];
            if !entry.is_active {
                if let Some(span) = gap_after(previous, entry) {
                    chronological.push(DisplayItem::Break(span));
                }
            }
        }
        if entry.is_active {
            chronological.push(DisplayItem::Active(entry.clone()));
        } else {
            chronological.push(DisplayItem::Entry(entry.clone()));
        }
    }

    let mut pinned = None;
    let mut rest = Vec::with_capacity(chronological.len());
    for item in chronological {
        match item {
            DisplayItem::Active(entry) => pinned = Some(DisplayItem::Active(entry)),
            other => rest.push(other),
        }
    }

    if order == SortOrder::Desc {
        rest.reverse();
    }
    if !show_breaks {
        rest.retain(|item| !matches!(item, DisplayItem::Break(_)));
    }

    pinned.into_iter().chain(rest).collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct DaySummary {
    pub date_key: String,
    pub total_seconds: i64,
    pub break_seconds: i64,
    pub completed_count: usize,
    pub items: Vec<DisplayItem>,
}

impl DaySummary {
    pub fn build(
        date_key: &str,
        entries: &[TimeEntry],
        active: Option<&TimeEntry>,
        now: DateTime<Utc>,
        order: SortOrder,
        show_breaks: bool,
    ) -> Self {
        Self {
            date_key: date_key.to_string(),
            total_seconds: daily_total_seconds(entries, active, now),
            break_seconds: break_seconds(entries, active),
            completed_count: completed_sorted(entries).len(),
            items: unified_display_sequence(entries, active, order, show_breaks),
        }
    }
}
