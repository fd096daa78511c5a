//! Duplicate detection, description merges and overlap folding.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use log::{info, warn};

use crate::domain::{TimeEntry, sort_chronologically};
use crate::error::{Result, TrackerError};
use crate::interval_store::{IntervalStore, remove_from, upsert_in};
use crate::store::KeyValueStore;
use crate::timezone::truncate_to_minute;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Interval {
    pub fn seconds(&self) -> i64 {
        (self.end - self.start).num_seconds().max(0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub removed: Vec<String>,
    pub created: TimeEntry,
}

/// Descriptions used by at least two entries, in first-seen order.
pub fn find_duplicate_descriptions(entries: &[TimeEntry]) -> Vec<String> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    let mut order = Vec::new();
    for entry in entries {
        let count = counts.entry(entry.description.as_str()).or_insert(0);
        if *count == 0 {
            order.push(entry.description.as_str());
        }
        *count += 1;
    }

    order
        .into_iter()
        .filter(|description| counts.get(description).copied().unwrap_or(0) >= 2)
        .map(str::to_string)
        .collect()
}

fn matching(entries: &[TimeEntry], description: &str) -> Vec<TimeEntry> {
    let mut matches = entries
        .iter()
        .filter(|entry| entry.description == description)
        .cloned()
        .collect::<Vec<_>>();
    sort_chronologically(&mut matches);
    matches
}

/// Whether the entries named `description` can be collapsed into one. Work
/// that was interrupted by a different task never merges.
pub fn can_merge(entries: &[TimeEntry], description: &str) -> bool {
    let matches = matching(entries, description);
    if matches.len() < 2 {
        return false;
    }
    if matches.iter().any(|entry| entry.is_pomodoro() || entry.is_active) {
        return false;
    }

    matches.windows(2).all(|pair| {
        let (earlier, later) = (pair[0].start_time, pair[1].start_time);
        !entries.iter().any(|other| {
            other.description != description
                && other.start_time > earlier
                && other.start_time < later
        })
    })
}

pub fn merge(entries: &[TimeEntry], description: &str, now: DateTime<Utc>) -> Result<MergeOutcome> {
    let matches = matching(entries, description);
    if matches.len() < 2 {
        return Err(TrackerError::not_found(format!(
            "fewer than two entries named {description:?}"
        )));
    }
    if !can_merge(entries, description) {
        return Err(TrackerError::conflict(format!(
            "entries named {description:?} are running, pomodoro sessions, or interrupted by other work"
        )));
    }

    let first = &matches[0];
    let start = first.start_time;
    let end = matches
        .iter()
        .map(|entry| entry.end_time.unwrap_or(now))
        .max()
        .unwrap_or(now);

    let created = TimeEntry::piece_of(first, start, end.max(start));
    Ok(MergeOutcome {
        removed: matches.into_iter().map(|entry| entry.id).collect(),
        created,
    })
}

/// Merges the entries named `description` inside one partition and saves the
/// result in a single write.
pub fn merge_in_store<S: KeyValueStore>(
    store: &mut IntervalStore<S>,
    date_key: &str,
    description: &str,
    now: DateTime<Utc>,
) -> Result<MergeOutcome> {
    let mut partitions = store.load_all()?;
    let entries = partitions.get(date_key).cloned().unwrap_or_default();
    let outcome = merge(&entries, description, now)?;

    for id in &outcome.removed {
        remove_from(&mut partitions, id, date_key);
    }
    upsert_in(&mut partitions, date_key, outcome.created.clone());
    store.save_all(&partitions)?;

    info!(
        "merged {} entries named {description:?} on {date_key}",
        outcome.removed.len()
    );
    Ok(outcome)
}

/// Folds completed entries into non-overlapping minute-granular intervals.
pub fn merge_overlapping_intervals(entries: &[TimeEntry]) -> Vec<Interval> {
    let mut intervals = entries
        .iter()
        .filter(|entry| !entry.is_active)
        .filter_map(|entry| {
            let end = entry.end_time?;
            let interval = Interval {
                start: truncate_to_minute(entry.start_time),
                end: truncate_to_minute(end),
            };
            if interval.end < interval.start {
                warn!("entry {} ends before it starts; ignoring it", entry.id);
                return None;
            }
            Some(interval)
        })
        .collect::<Vec<_>>();

    fold_intervals(&mut intervals)
}

/// Sort-and-fold over already built intervals.
pub fn fold_intervals(intervals: &mut [Interval]) -> Vec<Interval> {
    intervals.sort_by_key(|interval| (interval.start, interval.end));

    let mut merged: Vec<Interval> = Vec::with_capacity(intervals.len());
    for interval in intervals.iter() {
        match merged.last_mut() {
            Some(current) if interval.start <= current.end => {
                current.end = current.end.max(interval.end);
            }
            _ => merged.push(*interval),
        }
    }
    merged
}

pub fn merged_seconds(entries: &[TimeEntry]) -> i64 {
    merge_overlapping_intervals(entries)
        .iter()
        .map(Interval::seconds)
        .sum()
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::domain::POMODORO_SOURCE;
    use crate::store::MemoryStore;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, hour, minute, 0).unwrap()
    }

    fn entry(description: &str, start: (u32, u32), end: (u32, u32)) -> TimeEntry {
        TimeEntry::completed(description, at(start.0, start.1), at(end.0, end.1))
    }

    #[test]
    fn finds_duplicates_in_first_seen_order() {
        let entries = vec![
            entry("B", (8, 0), (9, 0)),
            entry("A", (9, 0), (10, 0)),
            entry("A", (10, 0), (11, 0)),
            entry("C", (11, 0), (12, 0)),
            entry("B", (12, 0), (13, 0)),
        ];
        assert_eq!(find_duplicate_descriptions(&entries), vec!["B", "A"]);
    }

    #[test]
    fn merges_keep_blank_descriptions_verbatim() {
        let mut entries = vec![entry("x", (9, 0), (10, 0)), entry("x", (10, 0), (11, 0))];
        for item in &mut entries {
            item.description = String::new();
        }

        let outcome = merge(&entries, "", at(12, 0)).expect("merge");
        assert_eq!(outcome.created.description, "");
        assert_eq!(outcome.created.end_time, Some(at(11, 0)));
    }

    #[test]
    fn refuses_merges_interrupted_by_other_work() {
        let entries = vec![
            entry("A", (9, 0), (10, 0)),
            entry("B", (10, 0), (10, 30)),
            entry("A", (10, 30), (11, 0)),
        ];
        assert!(!can_merge(&entries, "A"));
        assert!(matches!(
            merge(&entries, "A", at(12, 0)),
            Err(TrackerError::Conflict(_))
        ));
    }

    #[test]
    fn refuses_single_running_and_pomodoro_matches() {
        let single = vec![entry("A", (9, 0), (10, 0))];
        assert!(!can_merge(&single, "A"));
        assert!(matches!(
            merge(&single, "A", at(12, 0)),
            Err(TrackerError::NotFound(_))
        ));

        let mut running = vec![entry("A", (9, 0), (10, 0)), TimeEntry::active("A", at(10, 5))];
        assert!(!can_merge(&running, "A"));

        running[1] = entry("A", (10, 5), (10, 30));
        running[1].source = Some(POMODORO_SOURCE.to_string());
        assert!(!can_merge(&running, "A"));
    }

    #[test]
    fn merges_contiguous_matches() {
        let mut first = entry("A", (9, 0), (10, 0));
        first.project = Some("Acme".to_string());
        first.tags = vec!["billable".to_string()];
        let entries = vec![
            entry("A", (10, 15), (11, 0)),
            first.clone(),
            entry("B", (11, 30), (12, 0)),
        ];
        assert!(can_merge(&entries, "A"));

        let outcome = merge(&entries, "A", at(13, 0)).expect("merge");
        assert_eq!(outcome.removed.len(), 2);
        assert_eq!(outcome.removed[0], first.id);
        assert_eq!(outcome.created.start_time, at(9, 0));
        assert_eq!(outcome.created.end_time, Some(at(11, 0)));
        assert_eq!(outcome.created.project.as_deref(), Some("Acme"));
        assert_eq!(outcome.created.tags, vec!["billable".to_string()]);
        assert!(!outcome.created.is_active);
    }

    #[test]
    fn merge_in_store_replaces_the_matches() {
        let mut store = IntervalStore::new(MemoryStore::new());
        for item in [
            entry("A", (9, 0), (10, 0)),
            entry("A", (10, 0), (11, 0)),
            entry("B", (11, 0), (12, 0)),
        ] {
            store.upsert_entry("2024-01-01", item).expect("seed");
        }

        merge_in_store(&mut store, "2024-01-01", "A", at(13, 0)).expect("merge");
        let entries = store.entries_for("2024-01-01").expect("entries");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].description, "A");
        assert_eq!(entries[0].duration_seconds(at(13, 0)), 7200);
    }

    #[test]
    fn folds_overlaps_at_minute_granularity() {
        let mut noisy = entry("A", (9, 0), (10, 0));
        noisy.end_time = Some(Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 40).unwrap());
        let entries = vec![
            entry("B", (9, 30), (10, 30)),
            noisy,
            entry("C", (10, 30), (11, 0)),
            entry("D", (13, 0), (14, 0)),
            TimeEntry::active("E", at(15, 0)),
        ];

        let merged = merge_overlapping_intervals(&entries);
        assert_eq!(
            merged,
            vec![
                Interval { start: at(9, 0), end: at(11, 0) },
                Interval { start: at(13, 0), end: at(14, 0) },
            ]
        );
        assert_eq!(merged_seconds(&entries), 3 * 3600);
    }

    #[test]
    fn folding_is_idempotent() {
        let entries = vec![
            entry("A", (9, 0), (10, 0)),
            entry("B", (9, 45), (10, 15)),
            entry("C", (12, 0), (12, 30)),
        ];
        let mut once = merge_overlapping_intervals(&entries);
        let twice = fold_intervals(&mut once.clone());
        once.sort_by_key(|interval| interval.start);
        assert_eq!(once, twice);
    }

    #[test]
    fn exact_duplicates_do_not_double_count() {
        let original = vec![entry("A", (9, 0), (10, 0)), entry("B", (10, 5), (11, 0))];
        let mut duplicated = original.clone();
        duplicated.push(entry("A copy", (9, 0), (10, 0)));
        assert_eq!(merged_seconds(&original), merged_seconds(&duplicated));
    }
}
