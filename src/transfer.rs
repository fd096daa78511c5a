//! JSON export, import with a single-slot revert backup.

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::domain::{Partitions, WeeklyRows};
use crate::error::{Result, TrackerError};
use crate::interval_store::{IntervalStore, TIMESHEET_KEY, TIMEZONE_KEY, WEEKLY_KEY};
use crate::store::KeyValueStore;

pub const EXPORT_VERSION: &str = "1.0";
pub const BACKUP_KEY: &str = "import_backup";

const REQUIRED_FIELDS: [&str; 3] = ["version", "dailyData", "weeklyData"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportDocument {
    pub version: serde_json::Value,
    #[serde(default)]
    pub export_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub timezone: Option<String>,
    pub daily_data: Partitions,
    pub weekly_data: WeeklyRows,
}

/// Raw values of every key an import overwrites, taken just before it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImportBackup {
    taken_at: DateTime<Utc>,
    timesheet_data: Option<String>,
    weekly_timesheet: Option<String>,
    selected_timezone: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportSummary {
    pub days: usize,
    pub entries: usize,
    pub weekly_rows: usize,
}

pub fn export_document<S: KeyValueStore>(
    store: &IntervalStore<S>,
    now: DateTime<Utc>,
) -> Result<ExportDocument> {
    Ok(ExportDocument {
        version: serde_json::Value::String(EXPORT_VERSION.to_string()),
        export_date: Some(now),
        timezone: store.selected_timezone()?,
        daily_data: store.load_all()?,
        weekly_data: store.weekly_rows()?,
    })
}

pub fn export_json<S: KeyValueStore>(store: &IntervalStore<S>, now: DateTime<Utc>) -> Result<String> {
    Ok(serde_json::to_string_pretty(&export_document(store, now)?)?)
}

/// Validates and decodes an export document without touching any store.
pub fn parse_import(raw: &str) -> Result<ExportDocument> {
    let value: serde_json::Value = serde_json::from_str(raw)
        .map_err(|err| TrackerError::data_format(format!("not a JSON document: {err}")))?;
    let Some(object) = value.as_object() else {
        return Err(TrackerError::data_format("expected a JSON object"));
    };

    let missing = REQUIRED_FIELDS
        .iter()
        .filter(|field| !object.contains_key(**field))
        .copied()
        .collect::<Vec<_>>();
    if !missing.is_empty() {
        return Err(TrackerError::data_format(format!(
            "missing required field(s): {}",
            missing.join(", ")
        )));
    }

    serde_json::from_value(value).map_err(|err| TrackerError::data_format(err.to_string()))
}

/// Replaces entries, weekly rows and (when present) the timezone with the
/// document's contents. The previous state is kept in the revert slot, which
/// holds only the most recent import.
pub fn import_document<S: KeyValueStore>(
    store: &mut IntervalStore<S>,
    raw: &str,
    now: DateTime<Utc>,
) -> Result<ImportSummary> {
    let document = parse_import(raw)?;

    let active = document
        .daily_data
        .values()
        .flatten()
        .filter(|entry| entry.is_active)
        .count();
    if active > 1 {
        warn!("imported data has {active} running entries; only the first will be treated as running");
    }

    let backup = ImportBackup {
        taken_at: now,
        timesheet_data: store.get_raw(TIMESHEET_KEY)?,
        weekly_timesheet: store.get_raw(WEEKLY_KEY)?,
        selected_timezone: store.get_raw(TIMEZONE_KEY)?,
    };
    store.observable_mut().set_json(BACKUP_KEY, &backup)?;

    store.save_all(&document.daily_data)?;
    store.save_weekly_rows(&document.weekly_data)?;
    if let Some(timezone) = document.timezone.as_deref() {
        store.set_selected_timezone(timezone)?;
    }

    let summary = ImportSummary {
        days: document.daily_data.values().filter(|entries| !entries.is_empty()).count(),
        entries: document.daily_data.values().map(Vec::len).sum(),
        weekly_rows: document.weekly_data.len(),
    };
    info!(
        "imported {} entries across {} days and {} weekly rows",
        summary.entries, summary.days, summary.weekly_rows
    );
    Ok(summary)
}

pub fn has_backup<S: KeyValueStore>(store: &IntervalStore<S>) -> Result<bool> {
    Ok(store.get_raw(BACKUP_KEY)?.is_some())
}

/// Restores the state saved by the last import and clears the slot.
pub fn revert_import<S: KeyValueStore>(store: &mut IntervalStore<S>) -> Result<DateTime<Utc>> {
    let backup: ImportBackup = store
        .observable()
        .get_json(BACKUP_KEY)?
        .ok_or_else(|| TrackerError::not_found("no import to revert"))?;

    store.restore_raw(TIMESHEET_KEY, backup.timesheet_data.as_deref())?;
    store.restore_raw(WEEKLY_KEY, backup.weekly_timesheet.as_deref())?;
    store.restore_raw(TIMEZONE_KEY, backup.selected_timezone.as_deref())?;
    store.restore_raw(BACKUP_KEY, None)?;

    info!("reverted the import taken at {}", backup.taken_at);
    Ok(backup.taken_at)
}
