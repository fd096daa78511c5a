//! Typed access to the persisted timesheet keys.
//!
//! `timesheet_data` holds every day partition in one JSON object, so the
//! whole map is the unit of mutation: each write loads it, edits it and saves
//! it back in one `set`.

use chrono::{Duration, NaiveDate};
use log::warn;

use crate::domain::{Partitions, TimeEntry, WeekStart, WeeklyRows, WeeklyTimesheetRow, sort_chronologically};
use crate::error::{Result, TrackerError};
use crate::store::{KeyValueStore, ObservableStore, StorageError};
use crate::timezone::{Zone, civil_date_key, parse_civil_time, parse_duration, to_instant_resolved};

pub const TIMESHEET_KEY: &str = "timesheet_data";
pub const WEEKLY_KEY: &str = "weekly_timesheet";
pub const TIMEZONE_KEY: &str = "selected_timezone";
pub const WEEK_START_KEY: &str = "week_start";

/// A hand-entered, already completed entry in civil terms.
#[derive(Debug, Clone)]
pub struct ManualEntry {
    pub date: NaiveDate,
    pub description: String,
    pub start: String,
    pub end: ManualEnd,
    /// The end time belongs to the following civil day.
    pub overnight: bool,
    pub project: Option<String>,
    pub task: Option<String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum ManualEnd {
    /// Civil `HH:MM` on the entry's day, or the next one with `overnight`.
    At(String),
    /// A length such as `"1h 30min"` counted from the start instant.
    After(String),
}

pub struct IntervalStore<S: KeyValueStore> {
    store: ObservableStore<S>,
}

impl<S: KeyValueStore> IntervalStore<S> {
    pub fn new(backend: S) -> Self {
        Self {
            store: ObservableStore::new(backend),
        }
    }

    pub fn observable(&self) -> &ObservableStore<S> {
        &self.store
    }

    pub fn observable_mut(&mut self) -> &mut ObservableStore<S> {
        &mut self.store
    }

    /// Entries that fail to decode are skipped with a warning rather than
    /// failing the whole load.
    pub fn load_all(&self) -> Result<Partitions> {
        let raw: Option<serde_json::Map<String, serde_json::Value>> =
            self.store.get_json(TIMESHEET_KEY)?;
        let mut partitions = Partitions::new();
        for (date_key, value) in raw.unwrap_or_default() {
            let serde_json::Value::Array(items) = value else {
                warn!("partition {date_key} is not a list; skipping it");
                continue;
            };

            let mut entries = Vec::with_capacity(items.len());
            for item in items {
                match serde_json::from_value::<TimeEntry>(item) {
                    Ok(entry) => entries.push(entry),
                    Err(err) => warn!("skipping malformed entry in {date_key}: {err}"),
                }
            }
            if !entries.is_empty() {
                partitions.insert(date_key, entries);
            }
        }
        Ok(partitions)
    }

    /// Replaces the stored map. Empty partitions are dropped.
    pub fn save_all(&mut self, partitions: &Partitions) -> Result<()> {
        let mut cleaned = partitions.clone();
        cleaned.retain(|_, entries| !entries.is_empty());
        self.store.set_json(TIMESHEET_KEY, &cleaned)?;
        Ok(())
    }

    pub fn entries_for(&self, date_key: &str) -> Result<Vec<TimeEntry>> {
        let mut entries = self
            .load_all()?
            .remove(date_key)
            .unwrap_or_default();
        sort_chronologically(&mut entries);
        Ok(entries)
    }

    /// Replaces the entry with the same id inside `date_key`, or appends it.
    /// The key is the entry's recorded partition and is never recomputed here.
    pub fn upsert_entry(&mut self, date_key: &str, entry: TimeEntry) -> Result<()> {
        let mut partitions = self.load_all()?;
        upsert_in(&mut partitions, date_key, entry);
        self.save_all(&partitions)
    }

    pub fn delete_entry(&mut self, id: &str, date_key: &str) -> Result<TimeEntry> {
        let mut partitions = self.load_all()?;
        let removed = remove_from(&mut partitions, id, date_key)
            .ok_or_else(|| TrackerError::not_found(format!("entry {id} on {date_key}")))?;
        self.save_all(&partitions)?;
        Ok(removed)
    }

    pub fn find_entry(&self, id: &str) -> Result<Option<(String, TimeEntry)>> {
        let partitions = self.load_all()?;
        Ok(partitions.iter().find_map(|(date_key, entries)| {
            entries
                .iter()
                .find(|entry| entry.id == id)
                .map(|entry| (date_key.clone(), entry.clone()))
        }))
    }

    pub fn find_active_entry(&self) -> Result<Option<(String, TimeEntry)>> {
        Ok(find_active(&self.load_all()?))
    }

    pub fn add_manual_entry(&mut self, manual: ManualEntry, zone: Zone) -> Result<(String, TimeEntry)> {
        if manual.description.trim().is_empty() {
            return Err(TrackerError::validation("description is required"));
        }
        let start_time = parse_civil_time(&manual.start)
            .ok_or_else(|| TrackerError::validation(format!("invalid start time: {:?}", manual.start)))?;
        let start = to_instant_resolved(manual.date.and_time(start_time), zone);

        let end = match &manual.end {
            ManualEnd::At(raw) => {
                let end_time = parse_civil_time(raw)
                    .ok_or_else(|| TrackerError::validation(format!("invalid end time: {raw:?}")))?;
                let end_date = if end_time <= start_time {
                    if !manual.overnight {
                        return Err(TrackerError::validation(
                            "end time must be after start time (use the overnight flag for entries past midnight)",
                        ));
                    }
                    manual.date + Duration::days(1)
                } else {
                    manual.date
                };
                to_instant_resolved(end_date.and_time(end_time), zone)
            }
            ManualEnd::After(raw) => parse_duration(raw)
                .filter(|seconds| *seconds > 0)
                .and_then(Duration::try_seconds)
                .and_then(|length| start.checked_add_signed(length))
                .ok_or_else(|| TrackerError::validation(format!("invalid duration: {raw:?}")))?,
        };
        if end <= start {
            return Err(TrackerError::validation("entry has no duration in this timezone"));
        }

        let mut entry = TimeEntry::completed(&manual.description, start, end);
        entry.project = manual.project;
        entry.task = manual.task;
        entry.tags = manual.tags;

        let date_key = civil_date_key(start, zone);
        self.upsert_entry(&date_key, entry.clone())?;
        Ok((date_key, entry))
    }

    /// Replaces an entry with an edited copy, moving it to the partition of
    /// its (possibly new) start date in `zone`. Returns that partition key.
    pub fn edit_entry(&mut self, date_key: &str, updated: TimeEntry, zone: Zone) -> Result<String> {
        validate_edit(&updated)?;

        let mut partitions = self.load_all()?;
        if remove_from(&mut partitions, &updated.id, date_key).is_none() {
            return Err(TrackerError::not_found(format!(
                "entry {} on {date_key}",
                updated.id
            )));
        }
        if updated.is_active {
            if let Some((_, other)) = find_active(&partitions) {
                return Err(TrackerError::invalid_state(format!(
                    "entry {} is already running",
                    other.id
                )));
            }
        }

        let new_key = civil_date_key(updated.start_time, zone);
        upsert_in(&mut partitions, &new_key, updated);
        self.save_all(&partitions)?;
        Ok(new_key)
    }

    pub fn weekly_rows(&self) -> Result<WeeklyRows> {
        Ok(self.store.get_json(WEEKLY_KEY)?.unwrap_or_default())
    }

    pub fn save_weekly_rows(&mut self, rows: &WeeklyRows) -> Result<()> {
        self.store.set_json(WEEKLY_KEY, rows)?;
        Ok(())
    }

    /// Last writer wins: the row replaces whatever was stored for the date.
    pub fn save_weekly_row(&mut self, date_key: &str, row: WeeklyTimesheetRow) -> Result<()> {
        let mut rows = self.weekly_rows()?;
        rows.insert(date_key.to_string(), row);
        self.save_weekly_rows(&rows)
    }

    pub fn selected_timezone(&self) -> Result<Option<String>> {
        Ok(self.store.get_json(TIMEZONE_KEY)?)
    }

    /// Only the setting changes; existing partitions keep their keys.
    pub fn set_selected_timezone(&mut self, name: &str) -> Result<()> {
        self.store.set_json(TIMEZONE_KEY, &name.trim())?;
        Ok(())
    }

    pub fn week_start(&self) -> Result<WeekStart> {
        let raw: Option<String> = self.store.get_json(WEEK_START_KEY)?;
        Ok(raw
            .and_then(|value| match value.parse::<WeekStart>() {
                Ok(week_start) => Some(week_start),
                Err(err) => {
                    warn!("{err}; using the default week start");
                    None
                }
            })
            .unwrap_or_default())
    }

    pub fn set_week_start(&mut self, week_start: WeekStart) -> Result<()> {
        self.store.set_json(WEEK_START_KEY, &week_start)?;
        Ok(())
    }

    /// Explicit data clear: drops entries and weekly rows.
    pub fn clear_all(&mut self) -> Result<()> {
        self.store.remove(TIMESHEET_KEY)?;
        self.store.remove(WEEKLY_KEY)?;
        Ok(())
    }

    pub fn get_raw(&self, key: &str) -> std::result::Result<Option<String>, StorageError> {
        self.store.get_raw(key)
    }

    pub fn restore_raw(&mut self, key: &str, value: Option<&str>) -> std::result::Result<(), StorageError> {
        match value {
            Some(value) => self.store.set_raw(key, value),
            None => self.store.remove(key),
        }
    }
}

/// First active entry in key order. More than one is a data inconsistency:
/// it is logged and the first one wins.
pub fn find_active(partitions: &Partitions) -> Option<(String, TimeEntry)> {
    let mut active = partitions.iter().flat_map(|(date_key, entries)| {
        entries
            .iter()
            .filter(|entry| entry.is_active)
            .map(move |entry| (date_key, entry))
    });

    let (date_key, first) = active.next()?;
    let extra = active.count();
    if extra > 0 {
        warn!(
            "found {} active entries; using {} from {date_key}",
            extra + 1,
            first.id
        );
    }
    Some((date_key.clone(), first.clone()))
}

pub fn upsert_in(partitions: &mut Partitions, date_key: &str, entry: TimeEntry) {
    let entries = partitions.entry(date_key.to_string()).or_default();
    match entries.iter_mut().find(|existing| existing.id == entry.id) {
        Some(existing) => *existing = entry,
        None => entries.push(entry),
    }
}

pub fn remove_from(partitions: &mut Partitions, id: &str, date_key: &str) -> Option<TimeEntry> {
    let entries = partitions.get_mut(date_key)?;
    let index = entries.iter().position(|entry| entry.id == id)?;
    let removed = entries.remove(index);
    if entries.is_empty() {
        partitions.remove(date_key);
    }
    Some(removed)
}

fn validate_edit(entry: &TimeEntry) -> Result<()> {
    if entry.description.trim().is_empty() {
        return Err(TrackerError::validation("description is required"));
    }
    match (entry.is_active, entry.end_time) {
        (true, Some(_)) => Err(TrackerError::validation("a running entry cannot have an end time")),
        (false, None) => Err(TrackerError::validation("end time is required")),
        (false, Some(end)) if end <= entry.start_time => {
            Err(TrackerError::validation("end time must be after start time"))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, TimeZone, Utc};

    use super::*;
    use crate::store::MemoryStore;

    fn utc() -> Zone {
        Zone::resolve("UTC")
    }

    fn entry(description: &str, start: (u32, u32), end: (u32, u32)) -> TimeEntry {
        TimeEntry::completed(
            description,
            Utc.with_ymd_and_hms(2024, 1, 1, start.0, start.1, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 1, end.0, end.1, 0).unwrap(),
        )
    }

    fn manual(start: &str, end: &str, overnight: bool) -> ManualEntry {
        ManualEntry {
            date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            description: "Planning".to_string(),
            start: start.to_string(),
            end: ManualEnd::At(end.to_string()),
            overnight,
            project: Some("Internal".to_string()),
            task: None,
            tags: Vec::new(),
        }
    }

    #[test]
    fn upsert_replaces_by_id_and_delete_drops_empty_partitions() {
        let mut store = IntervalStore::new(MemoryStore::new());
        let mut first = entry("A", (9, 0), (10, 0));
        store.upsert_entry("2024-01-01", first.clone()).expect("upsert");
        first.description = "A (renamed)".to_string();
        store.upsert_entry("2024-01-01", first.clone()).expect("upsert");

        let entries = store.entries_for("2024-01-01").expect("entries");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].description, "A (renamed)");

        store.delete_entry(&first.id, "2024-01-01").expect("delete");
        assert!(store.load_all().expect("load").is_empty());
        assert!(matches!(
            store.delete_entry(&first.id, "2024-01-01"),
            Err(TrackerError::NotFound(_))
        ));
    }

    #[test]
    fn entries_come_back_sorted() {
        let mut store = IntervalStore::new(MemoryStore::new());
        store.upsert_entry("2024-01-01", entry("late", (14, 0), (15, 0))).expect("upsert");
        store.upsert_entry("2024-01-01", entry("early", (8, 0), (9, 0))).expect("upsert");
        let descriptions = store
            .entries_for("2024-01-01")
            .expect("entries")
            .into_iter()
            .map(|entry| entry.description)
            .collect::<Vec<_>>();
        assert_eq!(descriptions, vec!["early", "late"]);
    }

    #[test]
    fn finds_first_active_entry_even_when_data_is_inconsistent() {
        let mut store = IntervalStore::new(MemoryStore::new());
        let first = TimeEntry::active("one", Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap());
        let second = TimeEntry::active("two", Utc.with_ymd_and_hms(2024, 1, 2, 9, 0, 0).unwrap());
        store.upsert_entry("2024-01-01", first.clone()).expect("upsert");
        store.upsert_entry("2024-01-02", second).expect("upsert");

        let (date_key, active) = store.find_active_entry().expect("scan").expect("active");
        assert_eq!(date_key, "2024-01-01");
        assert_eq!(active.id, first.id);
    }

    #[test]
    fn skips_malformed_entries_on_load() {
        let mut store = IntervalStore::new(MemoryStore::new());
        store
            .observable_mut()
            .set_raw(
                TIMESHEET_KEY,
                r#"{"2024-01-01": [
                    {"id": "1", "description": "ok", "startTime": "2024-01-01T09:00:00Z", "endTime": "2024-01-01T10:00:00Z", "isActive": false},
                    {"id": "2", "description": "broken", "startTime": "not a date"}
                ], "2024-01-02": "garbage"}"#,
            )
            .expect("seed");
        let partitions = store.load_all().expect("load");
        assert_eq!(partitions.len(), 1);
        assert_eq!(partitions["2024-01-01"].len(), 1);
    }

    #[test]
    fn manual_entries_validate_their_times() {
        let mut store = IntervalStore::new(MemoryStore::new());
        let (date_key, created) = store
            .add_manual_entry(manual("09:00", "10:30", false), utc())
            .expect("manual entry");
        assert_eq!(date_key, "2024-01-01");
        assert_eq!(created.duration_seconds(created.start_time), 5400);
        assert_eq!(created.project.as_deref(), Some("Internal"));

        let backwards = store.add_manual_entry(manual("22:00", "01:00", false), utc());
        assert!(matches!(backwards, Err(TrackerError::Validation(_))));

        let (_, overnight) = store
            .add_manual_entry(manual("22:00", "01:00", true), utc())
            .expect("overnight entry");
        assert_eq!(
            overnight.end_time,
            Some(Utc.with_ymd_and_hms(2024, 1, 2, 1, 0, 0).unwrap())
        );

        let mut blank = manual("09:00", "10:00", false);
        blank.description = "  ".to_string();
        assert!(matches!(
            store.add_manual_entry(blank, utc()),
            Err(TrackerError::Validation(_))
        ));
        assert!(matches!(
            store.add_manual_entry(manual("9h", "10:00", false), utc()),
            Err(TrackerError::Validation(_))
        ));
    }

    #[test]
    fn manual_entries_accept_a_duration() {
        let mut store = IntervalStore::new(MemoryStore::new());
        let mut by_length = manual("23:30", "", false);
        by_length.end = ManualEnd::After("1h 15min".to_string());
        let (date_key, created) = store.add_manual_entry(by_length, utc()).expect("manual entry");
        assert_eq!(date_key, "2024-01-01");
        assert_eq!(
            created.end_time,
            Some(Utc.with_ymd_and_hms(2024, 1, 2, 0, 45, 0).unwrap())
        );

        for raw in ["0", "soon", "99999999999999999h"] {
            let mut invalid = manual("09:00", "", false);
            invalid.end = ManualEnd::After(raw.to_string());
            assert!(matches!(
                store.add_manual_entry(invalid, utc()),
                Err(TrackerError::Validation(_))
            ));
        }
    }

    #[test]
    fn editing_an_entry_into_a_second_running_timer_is_refused() {
        let mut store = IntervalStore::new(MemoryStore::new());
        store
            .upsert_entry(
                "2024-01-01",
                TimeEntry::active("Running", Utc.with_ymd_and_hms(2024, 1, 1, 11, 0, 0).unwrap()),
            )
            .expect("seed running");
        let done = entry("Done", (9, 0), (10, 0));
        store.upsert_entry("2024-01-01", done.clone()).expect("seed done");
        let before = store.load_all().expect("load");

        let mut reopened = done.clone();
        reopened.is_active = true;
        reopened.end_time = None;
        assert!(matches!(
            store.edit_entry("2024-01-01", reopened, utc()),
            Err(TrackerError::InvalidState(_))
        ));
        assert_eq!(store.load_all().expect("load"), before);
    }

    #[test]
    fn editing_the_start_date_moves_the_entry() {
        let mut store = IntervalStore::new(MemoryStore::new());
        let original = entry("A", (9, 0), (10, 0));
        store.upsert_entry("2024-01-01", original.clone()).expect("upsert");

        let mut moved = original.clone();
        moved.start_time = Utc.with_ymd_and_hms(2024, 1, 3, 9, 0, 0).unwrap();
        moved.end_time = Some(Utc.with_ymd_and_hms(2024, 1, 3, 11, 0, 0).unwrap());
        let new_key = store.edit_entry("2024-01-01", moved, utc()).expect("edit");

        assert_eq!(new_key, "2024-01-03");
        let partitions = store.load_all().expect("load");
        assert!(!partitions.contains_key("2024-01-01"));
        assert_eq!(partitions["2024-01-03"][0].id, original.id);

        let mut invalid = partitions["2024-01-03"][0].clone();
        invalid.end_time = Some(invalid.start_time);
        assert!(matches!(
            store.edit_entry("2024-01-03", invalid, utc()),
            Err(TrackerError::Validation(_))
        ));
    }

    #[test]
    fn timezone_changes_do_not_move_history() {
        let mut store = IntervalStore::new(MemoryStore::new());
        store.upsert_entry("2024-01-01", entry("A", (23, 0), (23, 30))).expect("upsert");
        store.set_selected_timezone("Asia/Tokyo").expect("set timezone");
        assert_eq!(
            store.selected_timezone().expect("timezone").as_deref(),
            Some("Asia/Tokyo")
        );
        assert!(store.load_all().expect("load").contains_key("2024-01-01"));
    }

    #[test]
    fn week_start_defaults_to_monday() {
        let mut store = IntervalStore::new(MemoryStore::new());
        assert_eq!(store.week_start().expect("week start"), WeekStart::Monday);
        store.set_week_start(WeekStart::Sunday).expect("set");
        assert_eq!(store.week_start().expect("week start"), WeekStart::Sunday);
    }
}
