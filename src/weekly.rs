//! Weekly timesheet rows and the invoice lines derived from them.
//!
//! [`row_hours`] is the only place a row's hours are computed; the weekly
//! table and invoices both go through it so they always agree.

use chrono::{Datelike, Duration, NaiveDate, NaiveTime};
use log::{info, warn};

use crate::daily::completed_sorted;
use crate::domain::{InvoiceLineItem, TimeEntry, WeekStart, WeeklyRows, WeeklyTimesheetRow};
use crate::error::{Result, TrackerError};
use crate::interval_store::IntervalStore;
use crate::reconcile::merged_seconds;
use crate::store::KeyValueStore;
use crate::timezone::{
    Zone, date_key, format_civil_time, parse_civil_time, parse_date_key, to_civil,
    truncate_to_minute,
};

const MINUTES_PER_DAY: i64 = 24 * 60;

/// Summarises one day of completed entries as a weekly timesheet row.
pub fn day_to_weekly_row(entries: &[TimeEntry], zone: Zone) -> Result<WeeklyTimesheetRow> {
    if entries.iter().any(|entry| entry.is_active) {
        return Err(TrackerError::invalid_state(
            "stop the running timer before saving the day",
        ));
    }

    let completed = completed_sorted(entries);
    let (Some(first_start), Some(last_end)) = (
        completed.iter().map(|entry| entry.start_time).min(),
        completed.iter().filter_map(|entry| entry.end_time).max(),
    ) else {
        return Err(TrackerError::not_found("no completed entries for this day"));
    };

    // Break is measured against the wall-clock span `row_hours` reads back;
    // a DST shift inside the span lands in the break.
    let time_in = to_civil(truncate_to_minute(first_start), zone).time();
    let time_out = to_civil(truncate_to_minute(last_end), zone).time();
    let span_minutes = clock_minutes(time_in, time_out);
    let work_minutes = merged_seconds(&completed) / 60;
    let break_minutes = (span_minutes - work_minutes).max(0);

    let mut descriptions: Vec<&str> = Vec::new();
    for entry in &completed {
        let description = entry.description.trim();
        if !description.is_empty() && !descriptions.contains(&description) {
            descriptions.push(description);
        }
    }

    let count = completed.len();
    Ok(WeeklyTimesheetRow {
        tasks: Some(format!("{count} {}", if count == 1 { "task" } else { "tasks" })),
        work_details: Some(descriptions.join("; ")),
        time_in: Some(format_civil_time(truncate_to_minute(first_start), zone)),
        time_out: Some(format_civil_time(truncate_to_minute(last_end), zone)),
        break_hours: Some(format_break_hours(break_minutes)),
    })
}

/// Builds the row for `date_key` from its entries and stores it, replacing
/// any row already there.
pub fn save_day_to_weekly<S: KeyValueStore>(
    store: &mut IntervalStore<S>,
    date_key: &str,
    zone: Zone,
) -> Result<WeeklyTimesheetRow> {
    let entries = store.entries_for(date_key)?;
    let row = day_to_weekly_row(&entries, zone)?;
    store.save_weekly_row(date_key, row.clone())?;
    info!("saved {date_key} to the weekly timesheet");
    Ok(row)
}

/// Break minutes as hours with up to four decimals (`5` → `"0.0833"`, `30` →
/// `"0.5"`). Whole minutes over 60 never sit near a cent boundary, so four
/// decimals read back by [`row_hours`] round to the exact worked time.
fn format_break_hours(minutes: i64) -> String {
    let formatted = format!("{:.4}", minutes as f64 / 60.0);
    formatted
        .trim_end_matches('0')
        .trim_end_matches('.')
        .to_string()
}

/// Wall-clock minutes from `time_in` to `time_out`; an earlier `time_out`
/// runs past midnight.
fn clock_minutes(time_in: NaiveTime, time_out: NaiveTime) -> i64 {
    let minutes = (time_out - time_in).num_minutes();
    if minutes < 0 {
        minutes + MINUTES_PER_DAY
    } else {
        minutes
    }
}

/// Worked hours of a row: `timeOut - timeIn - breakHours`, rounded to two
/// decimals. A `timeOut` earlier than `timeIn` runs past midnight. Missing or
/// unreadable times give zero.
pub fn row_hours(row: &WeeklyTimesheetRow) -> f64 {
    let (Some(time_in), Some(time_out)) = (
        row.time_in.as_deref().and_then(parse_civil_time),
        row.time_out.as_deref().and_then(parse_civil_time),
    ) else {
        return 0.0;
    };

    let minutes = clock_minutes(time_in, time_out);

    let break_hours = match row.break_hours.as_deref().map(str::trim) {
        None | Some("") => 0.0,
        Some(raw) => match raw.parse::<f64>() {
            Ok(value) if value.is_finite() => value,
            _ => {
                warn!("unreadable break hours {raw:?}; treating as zero");
                0.0
            }
        },
    };

    round_cents(minutes as f64 / 60.0 - break_hours).max(0.0)
}

fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// The seven dates of the week containing `day`.
pub fn week_dates(day: NaiveDate, week_start: WeekStart) -> Vec<NaiveDate> {
    let offset = match week_start {
        WeekStart::Monday => day.weekday().num_days_from_monday(),
        WeekStart::Sunday => day.weekday().num_days_from_sunday(),
    };
    let first = day - Duration::days(offset.into());
    (0..7).map(|index| first + Duration::days(index)).collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct WeekDay {
    pub date: NaiveDate,
    pub row: Option<WeeklyTimesheetRow>,
    pub hours: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WeeklySummary {
    pub days: Vec<WeekDay>,
    pub total_hours: f64,
}

pub fn weekly_summary(rows: &WeeklyRows, day: NaiveDate, week_start: WeekStart) -> WeeklySummary {
    let days = week_dates(day, week_start)
        .into_iter()
        .map(|date| {
            let row = rows.get(&date_key(date)).cloned();
            let hours = row.as_ref().map(row_hours).unwrap_or(0.0);
            WeekDay { date, row, hours }
        })
        .collect::<Vec<_>>();
    let total_hours = round_cents(days.iter().map(|day| day.hours).sum());
    WeeklySummary { days, total_hours }
}

pub fn currency_symbol(currency: &str) -> Option<&'static str> {
    match currency.trim().to_ascii_uppercase().as_str() {
        "USD" => Some("$"),
        "EUR" => Some("€"),
        "GBP" => Some("£"),
        _ => None,
    }
}

pub fn format_amount(amount: f64, currency: &str) -> String {
    match currency_symbol(currency) {
        Some(symbol) => format!("{symbol}{amount:.2}"),
        None => format!("{} {amount:.2}", currency.trim().to_ascii_uppercase()),
    }
}

/// One line per row dated inside `[start, end]` with positive hours.
pub fn invoice_line_items(
    rows: &WeeklyRows,
    start: NaiveDate,
    end: NaiveDate,
    hourly_rate: f64,
    currency: &str,
) -> Vec<InvoiceLineItem> {
    let mut items = Vec::new();
    for (raw_date, row) in rows {
        let Some(date) = parse_date_key(raw_date) else {
            warn!("weekly row has an unreadable date {raw_date:?}; skipping it");
            continue;
        };
        if date < start || date > end {
            continue;
        }

        let hours = row_hours(row);
        if hours <= 0.0 {
            continue;
        }

        let description = [row.work_details.as_deref(), row.tasks.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|value| !value.is_empty())
            .unwrap_or("Work")
            .to_string();
        let amount = round_cents(hours * hourly_rate);
        items.push(InvoiceLineItem {
            date: date_key(date),
            description,
            hours,
            amount,
            formatted_amount: format_amount(amount, currency),
        });
    }
    items
}

pub fn invoice_total(items: &[InvoiceLineItem]) -> f64 {
    round_cents(items.iter().map(|item| item.amount).sum())
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, TimeZone, Utc};
    use rstest::rstest;

    use super::*;
    use crate::store::MemoryStore;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, hour, minute, 0).unwrap()
    }

    fn entry(description: &str, start: (u32, u32), end: (u32, u32)) -> TimeEntry {
        TimeEntry::completed(description, at(start.0, start.1), at(end.0, end.1))
    }

    fn row(time_in: &str, time_out: &str, break_hours: Option<&str>) -> WeeklyTimesheetRow {
        WeeklyTimesheetRow {
            tasks: Some("1 task".to_string()),
            work_details: Some("Billing".to_string()),
            time_in: Some(time_in.to_string()),
            time_out: Some(time_out.to_string()),
            break_hours: break_hours.map(str::to_string),
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn summarises_a_day_into_a_row() {
        let entries = vec![
            entry("A", (9, 0), (10, 0)),
            entry("B", (10, 5), (11, 0)),
            entry("A", (11, 0), (11, 30)),
        ];
        let row = day_to_weekly_row(&entries, Zone::resolve("UTC")).expect("row");
        assert_eq!(row.time_in.as_deref(), Some("09:00"));
        assert_eq!(row.time_out.as_deref(), Some("11:30"));
        assert_eq!(row.break_hours.as_deref(), Some("0.0833"));
        assert_eq!(row.work_details.as_deref(), Some("A; B"));
        assert_eq!(row.tasks.as_deref(), Some("3 tasks"));
        assert_eq!(row_hours(&row), 2.42);
    }

    #[test]
    fn row_times_use_the_zone() {
        let entries = vec![entry("A", (14, 0), (15, 0))];
        let row = day_to_weekly_row(&entries, Zone::resolve("America/New_York")).expect("row");
        assert_eq!(row.time_in.as_deref(), Some("09:00"));
        assert_eq!(row.tasks.as_deref(), Some("1 task"));
    }

    #[test]
    fn spring_forward_day_keeps_worked_hours() {
        // 01:00 EST to 04:00 EDT is two hours of work over three clock hours.
        let entries = vec![TimeEntry::completed(
            "Deploy",
            Utc.with_ymd_and_hms(2024, 3, 10, 6, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 10, 8, 0, 0).unwrap(),
        )];
        let row = day_to_weekly_row(&entries, Zone::resolve("America/New_York")).expect("row");
        assert_eq!(row.time_in.as_deref(), Some("01:00"));
        assert_eq!(row.time_out.as_deref(), Some("04:00"));
        assert_eq!(row.break_hours.as_deref(), Some("1"));
        assert_eq!(row_hours(&row), 2.0);
    }

    #[rstest]
    #[case(0, "0")]
    #[case(30, "0.5")]
    #[case(5, "0.0833")]
    #[case(7, "0.1167")]
    #[case(90, "1.5")]
    fn formats_break_hours(#[case] minutes: i64, #[case] expected: &str) {
        assert_eq!(format_break_hours(minutes), expected);
    }

    #[test]
    fn stored_breaks_read_back_to_the_worked_minutes() {
        // 61 minutes on the clock with 5 minutes off leaves 56 minutes = 0.93h.
        let entries = vec![entry("A", (9, 0), (9, 20)), entry("A", (9, 25), (10, 1))];
        let row = day_to_weekly_row(&entries, Zone::resolve("UTC")).expect("row");
        assert_eq!(row.break_hours.as_deref(), Some("0.0833"));
        assert_eq!(row_hours(&row), 0.93);
    }

    #[test]
    fn refuses_running_or_empty_days() {
        let running = vec![entry("A", (9, 0), (10, 0)), TimeEntry::active("B", at(10, 5))];
        assert!(matches!(
            day_to_weekly_row(&running, Zone::resolve("UTC")),
            Err(TrackerError::InvalidState(_))
        ));
        assert!(matches!(
            day_to_weekly_row(&[], Zone::resolve("UTC")),
            Err(TrackerError::NotFound(_))
        ));
    }

    #[test]
    fn saves_the_row_last_writer_wins() {
        let mut store = IntervalStore::new(MemoryStore::new());
        store
            .save_weekly_row("2024-01-01", row("08:00", "09:00", None))
            .expect("hand edit");
        store
            .upsert_entry("2024-01-01", entry("A", (9, 0), (10, 0)))
            .expect("seed");

        save_day_to_weekly(&mut store, "2024-01-01", Zone::resolve("UTC")).expect("save");
        let rows = store.weekly_rows().expect("rows");
        assert_eq!(rows["2024-01-01"].time_in.as_deref(), Some("09:00"));
        assert_eq!(rows["2024-01-01"].work_details.as_deref(), Some("A"));
    }

    #[rstest]
    #[case(row("09:00", "17:00", Some("1")), 7.0)]
    #[case(row("09:00", "17:30", Some("0.5")), 8.0)]
    #[case(row("22:00", "02:00", None), 4.0)]
    #[case(row("09:00", "10:00", Some("3")), 0.0)]
    #[case(row("09:00", "10:00", Some("lunch")), 1.0)]
    #[case(WeeklyTimesheetRow::default(), 0.0)]
    fn computes_row_hours(#[case] row: WeeklyTimesheetRow, #[case] expected: f64) {
        assert_eq!(row_hours(&row), expected);
    }

    #[test]
    fn builds_invoice_lines_inside_the_range() {
        let mut rows = WeeklyRows::new();
        rows.insert("2024-01-01".to_string(), row("09:00", "17:00", Some("1")));
        rows.insert("2024-01-02".to_string(), row("09:00", "09:00", None));
        rows.insert("2024-01-03".to_string(), row("09:00", "11:30", Some("0")));
        rows.insert("2024-01-09".to_string(), row("09:00", "17:00", None));
        rows.insert("not-a-date".to_string(), row("09:00", "17:00", None));

        let items = invoice_line_items(&rows, date(2024, 1, 1), date(2024, 1, 7), 50.0, "usd");
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].date, "2024-01-01");
        assert_eq!(items[0].hours, 7.0);
        assert_eq!(items[0].amount, 350.0);
        assert_eq!(items[0].formatted_amount, "$350.00");
        assert_eq!(items[1].hours, 2.5);
        assert_eq!(invoice_total(&items), 475.0);
    }

    #[test]
    fn invoice_hours_match_the_weekly_table() {
        let mut rows = WeeklyRows::new();
        rows.insert("2024-01-03".to_string(), row("08:10", "16:47", Some("0.75")));
        let summary = weekly_summary(&rows, date(2024, 1, 3), WeekStart::Monday);
        let items = invoice_line_items(&rows, date(2024, 1, 1), date(2024, 1, 7), 1.0, "EUR");
        assert_eq!(summary.total_hours, items[0].hours);
        assert!(items[0].formatted_amount.starts_with('€'));
    }

    #[test]
    fn formats_currencies() {
        assert_eq!(format_amount(12.5, "GBP"), "£12.50");
        assert_eq!(format_amount(10.0, "chf"), "CHF 10.00");
    }

    #[test]
    fn lays_out_weeks_by_start_day() {
        let wednesday = date(2024, 1, 3);
        let monday_week = week_dates(wednesday, WeekStart::Monday);
        assert_eq!(monday_week.first(), Some(&date(2024, 1, 1)));
        assert_eq!(monday_week.last(), Some(&date(2024, 1, 7)));

        let sunday_week = week_dates(wednesday, WeekStart::Sunday);
        assert_eq!(sunday_week.first(), Some(&date(2023, 12, 31)));
        assert_eq!(sunday_week.len(), 7);
    }
}
