//! Conversions between UTC instants and civil (wall-clock) time in a named
//! timezone, plus the duration formatting used across every view.
//!
//! Durations are always computed on instants. Civil values are only produced
//! for display and for the `yyyy-MM-dd` partition key.

use chrono::{
    DateTime, Duration, Local, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, TimeZone,
    Timelike, Utc,
};
use chrono_tz::Tz;
use log::warn;

pub const DATE_KEY_FORMAT: &str = "%Y-%m-%d";
const GAP_SEARCH_MINUTES: u32 = 180;

/// The timezone every civil computation is evaluated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Zone {
    Named(Tz),
    /// Host local time, used when no usable IANA name is configured.
    Local,
}

impl Zone {
    /// Never fails: an empty or unknown identifier falls back to host local
    /// time so that persistence keeps working with a bad setting.
    pub fn resolve(name: &str) -> Self {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Zone::Local;
        }

        match trimmed.parse::<Tz>() {
            Ok(tz) => Zone::Named(tz),
            Err(err) => {
                warn!("invalid timezone {trimmed:?} ({err}); falling back to local time");
                Zone::Local
            }
        }
    }

    pub fn name(&self) -> String {
        match self {
            Zone::Named(tz) => tz.name().to_string(),
            Zone::Local => "local".to_string(),
        }
    }
}

pub fn to_civil(instant: DateTime<Utc>, zone: Zone) -> NaiveDateTime {
    match zone {
        Zone::Named(tz) => instant.with_timezone(&tz).naive_local(),
        Zone::Local => instant.with_timezone(&Local).naive_local(),
    }
}

/// Returns `None` for civil times inside a spring-forward gap. Ambiguous
/// fall-back times resolve to the earlier instant.
pub fn to_instant(civil: NaiveDateTime, zone: Zone) -> Option<DateTime<Utc>> {
    match zone {
        Zone::Named(tz) => earliest_instant(tz.from_local_datetime(&civil)),
        Zone::Local => earliest_instant(Local.from_local_datetime(&civil)),
    }
}

/// Like [`to_instant`], but a civil time inside a gap is moved forward to the
/// first minute that exists.
pub fn to_instant_resolved(civil: NaiveDateTime, zone: Zone) -> DateTime<Utc> {
    let mut cursor = civil;
    for _ in 0..=GAP_SEARCH_MINUTES {
        if let Some(instant) = to_instant(cursor, zone) {
            return instant;
        }
        cursor += Duration::minutes(1);
    }

    warn!(
        "civil time {civil} does not exist in {}; treating it as UTC",
        zone.name()
    );
    Utc.from_utc_datetime(&civil)
}

fn earliest_instant<Z: TimeZone>(result: LocalResult<DateTime<Z>>) -> Option<DateTime<Utc>> {
    match result {
        LocalResult::Single(datetime) => Some(datetime.with_timezone(&Utc)),
        LocalResult::Ambiguous(first, second) => Some(first.min(second).with_timezone(&Utc)),
        LocalResult::None => None,
    }
}

pub fn civil_date(instant: DateTime<Utc>, zone: Zone) -> NaiveDate {
    to_civil(instant, zone).date()
}

/// The partition key an instant belongs to in `zone`.
pub fn civil_date_key(instant: DateTime<Utc>, zone: Zone) -> String {
    date_key(civil_date(instant, zone))
}

pub fn date_key(date: NaiveDate) -> String {
    date.format(DATE_KEY_FORMAT).to_string()
}

pub fn parse_date_key(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), DATE_KEY_FORMAT).ok()
}

/// Civil midnight of `date` as an instant.
pub fn start_of_civil_day(date: NaiveDate, zone: Zone) -> DateTime<Utc> {
    to_instant_resolved(date.and_time(NaiveTime::MIN), zone)
}

/// `23:59:59` civil of `date` as an instant.
pub fn end_of_civil_day(date: NaiveDate, zone: Zone) -> DateTime<Utc> {
    let last_second = NaiveTime::from_hms_opt(23, 59, 59).unwrap_or(NaiveTime::MIN);
    to_instant_resolved(date.and_time(last_second), zone)
}

pub fn duration_seconds(start: DateTime<Utc>, end: DateTime<Utc>) -> i64 {
    (end - start).num_seconds()
}

pub fn truncate_to_minute(instant: DateTime<Utc>) -> DateTime<Utc> {
    instant
        .with_second(0)
        .and_then(|value| value.with_nanosecond(0))
        .unwrap_or(instant)
}

pub fn format_civil_time(instant: DateTime<Utc>, zone: Zone) -> String {
    to_civil(instant, zone).format("%H:%M").to_string()
}

pub fn parse_civil_time(raw: &str) -> Option<NaiveTime> {
    let trimmed = raw.trim();
    NaiveTime::parse_from_str(trimmed, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(trimmed, "%H:%M:%S"))
        .ok()
}

/// `<60s → "Ns"`, `<60min → "N min"`, otherwise `"Hh Mmin"` with zero
/// minutes omitted.
pub fn format_duration(seconds: i64) -> String {
    let seconds = seconds.max(0);
    if seconds < 60 {
        return format!("{seconds}s");
    }
    if seconds < 3600 {
        return format!("{} min", seconds / 60);
    }

    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    if minutes == 0 {
        format!("{hours}h")
    } else {
        format!("{hours}h {minutes}min")
    }
}

/// Running-timer display: `HH:MM:SS`.
pub fn format_clock(seconds: i64) -> String {
    let total_seconds = seconds.max(0);
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}

/// Accepts `"1h 30min"`, `"45 min"`, `"90s"`, `"2h"`, `"1:30"` and
/// `"1:30:15"`. A bare number is read as minutes.
pub fn parse_duration(raw: &str) -> Option<i64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    if trimmed.contains(':') {
        let parts = trimmed
            .split(':')
            .map(|part| part.trim().parse::<i64>().ok())
            .collect::<Option<Vec<_>>>()?;
        let (hours, minutes, seconds) = match parts.as_slice() {
            [hours, minutes] => (*hours, *minutes, 0),
            [hours, minutes, seconds] => (*hours, *minutes, *seconds),
            _ => return None,
        };
        if hours < 0 || !(0..60).contains(&minutes) || !(0..60).contains(&seconds) {
            return None;
        }
        return hours
            .checked_mul(3600)?
            .checked_add(minutes * 60 + seconds);
    }

    let mut total = 0i64;
    let mut number = String::new();
    let mut unit = String::new();
    let mut saw_component = false;

    let mut flush = |number: &mut String, unit: &mut String| -> Option<()> {
        if number.is_empty() {
            return if unit.is_empty() { Some(()) } else { None };
        }
        let value = number.parse::<i64>().ok()?;
        let factor = match unit.as_str() {
            "" | "m" | "min" | "mins" | "minute" | "minutes" => 60,
            "h" | "hr" | "hrs" | "hour" | "hours" => 3600,
            "s" | "sec" | "secs" | "second" | "seconds" => 1,
            _ => return None,
        };
        total = total.checked_add(value.checked_mul(factor)?)?;
        number.clear();
        unit.clear();
        Some(())
    };

    for ch in trimmed.chars() {
        if ch.is_ascii_digit() {
            if !unit.is_empty() {
                flush(&mut number, &mut unit)?;
            }
            number.push(ch);
            saw_component = true;
        } else if ch.is_ascii_alphabetic() {
            if number.is_empty() {
                return None;
            }
            unit.push(ch.to_ascii_lowercase());
        } else if ch.is_whitespace() {
            continue;
        } else {
            return None;
        }
    }
    flush(&mut number, &mut unit)?;

    if saw_component { Some(total) } else { None }
}
