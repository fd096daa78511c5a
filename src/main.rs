use std::cell::Cell;
use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::thread;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use clap::{Parser, Subcommand};

use tally::config::{Settings, load_settings, resolve_data_dir, resolve_zone, save_settings};
use tally::daily::{DaySummary, DisplayItem, SortOrder};
use tally::domain::{TimeEntry, WeekStart};
use tally::error::TrackerError;
use tally::interval_store::{IntervalStore, ManualEnd, ManualEntry, TIMESHEET_KEY};
use tally::reconcile::{can_merge, find_duplicate_descriptions, merge_in_store};
use tally::store::DirStore;
use tally::timer::{ActiveTimerController, TimerArbiter};
use tally::timezone::{
	Zone, civil_date, date_key, format_civil_time, format_clock, format_duration, parse_civil_time,
	parse_date_key, to_civil, to_instant_resolved,
};
use tally::transfer::{export_json, import_document, revert_import};
use tally::weekly::{format_amount, invoice_line_items, invoice_total, save_day_to_weekly, weekly_summary};

const WATCH_TICK: StdDuration = StdDuration::from_secs(1);

#[derive(Debug, Parser)]
#[command(name = "tally", about = "Timezone-aware personal time tracker")]
struct Cli {
	#[arg(long)]
	data_dir: Option<PathBuf>,
	#[command(subcommand)]
	command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
	/// Start a timer, stopping any running one first.
	Start {
		#[arg(long, default_value = "")]
		description: String,
		/// The day being looked at; timers only start for today.
		#[arg(long)]
		day: Option<String>,
	},
	Stop,
	Status,
	/// Show the running timer, refreshing every second and on data changes
	/// made by other processes.
	Watch,
	/// Start a new timer copying an existing entry.
	Continue {
		#[arg(long)]
		id: String,
		#[arg(long)]
		day: Option<String>,
	},
	Add {
		#[arg(long)]
		day: Option<String>,
		#[arg(long)]
		description: String,
		#[arg(long)]
		start: String,
		#[arg(long)]
		end: Option<String>,
		/// Length instead of an end time, e.g. `1h 30min` or `1:30`.
		#[arg(long, conflicts_with = "end")]
		duration: Option<String>,
		#[arg(long)]
		overnight: bool,
		#[arg(long)]
		project: Option<String>,
		#[arg(long)]
		task: Option<String>,
		#[arg(long = "tag")]
		tags: Vec<String>,
	},
	Edit {
		#[arg(long)]
		id: String,
		#[arg(long)]
		description: Option<String>,
		/// Move the entry to another civil day.
		#[arg(long)]
		day: Option<String>,
		#[arg(long)]
		start: Option<String>,
		#[arg(long)]
		end: Option<String>,
		#[arg(long)]
		overnight: bool,
		#[arg(long)]
		project: Option<String>,
	},
	Delete {
		#[arg(long)]
		id: String,
	},
	Day {
		#[arg(long)]
		day: Option<String>,
		#[arg(long)]
		asc: bool,
		#[arg(long)]
		desc: bool,
		#[arg(long)]
		hide_breaks: bool,
	},
	Duplicates {
		#[arg(long)]
		day: Option<String>,
	},
	Merge {
		#[arg(long)]
		day: Option<String>,
		#[arg(long)]
		description: String,
	},
	/// Write a day's entries into the weekly timesheet.
	SaveDay {
		#[arg(long)]
		day: Option<String>,
	},
	Week {
		#[arg(long)]
		day: Option<String>,
	},
	Invoice {
		#[arg(long)]
		from: String,
		#[arg(long)]
		to: String,
		#[arg(long)]
		rate: Option<f64>,
		#[arg(long)]
		currency: Option<String>,
	},
	Export {
		#[arg(long)]
		out: Option<PathBuf>,
	},
	Import {
		#[arg(long)]
		file: PathBuf,
	},
	/// Undo the most recent import.
	Revert,
	Timezone {
		name: Option<String>,
	},
	WeekStart {
		value: Option<String>,
	},
	/// Show or change the settings kept in config.toml.
	Config {
		#[arg(long)]
		rate: Option<f64>,
		#[arg(long)]
		currency: Option<String>,
		/// `asc` or `desc`.
		#[arg(long)]
		sort: Option<String>,
		#[arg(long)]
		show_breaks: Option<bool>,
		#[arg(long)]
		default_timezone: Option<String>,
	},
	/// Delete every entry and weekly row.
	Clear {
		#[arg(long)]
		yes: bool,
	},
}

fn main() {
	env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

	if let Err(err) = run() {
		if let Some(tracker_err) = err.downcast_ref::<TrackerError>() {
			if tracker_err.is_warning() {
				eprintln!("warning: {tracker_err}");
				return;
			}
		}
		eprintln!("error: {err}");
		std::process::exit(1);
	}
}

fn run() -> Result<(), Box<dyn Error>> {
	let cli = Cli::parse();
	let data_dir = resolve_data_dir(cli.data_dir);
	let settings = load_settings(&data_dir)?;
	let mut store = IntervalStore::new(DirStore::open(&data_dir)?);
	let zone = resolve_zone(store.selected_timezone()?.as_deref(), &settings);
	let now = Utc::now();
	let today = civil_date(now, zone);

	match cli.command.unwrap_or(Command::Status) {
		Command::Start { description, day } => {
			let viewing_day = parse_day(day.as_deref(), today)?;
			let mut arbiter = TimerArbiter::new();
			let mut timer = ActiveTimerController::new(&mut store, &mut arbiter)?;
			let outcome = timer.start(&description, now, zone, viewing_day)?;
			if let Some(stopped) = &outcome.stopped {
				println!("{}", stopped.message());
			}
			println!("started \"{}\" ({})", outcome.entry.description, outcome.entry.id);
		}
		Command::Stop => {
			let mut arbiter = TimerArbiter::new();
			let mut timer = ActiveTimerController::new(&mut store, &mut arbiter)?;
			let outcome = timer.stop(now, zone)?;
			println!("{}", outcome.message());
		}
		Command::Status => {
			print_status(&store, now)?;
		}
		Command::Watch => {
			watch(&mut store)?;
		}
		Command::Continue { id, day } => {
			let viewing_day = parse_day(day.as_deref(), today)?;
			let (_, template) = store
				.find_entry(&id)?
				.ok_or_else(|| TrackerError::not_found(format!("entry {id}")))?;
			let mut arbiter = TimerArbiter::new();
			let mut timer = ActiveTimerController::new(&mut store, &mut arbiter)?;
			let outcome = timer.continue_entry(&template, now, zone, viewing_day)?;
			if let Some(stopped) = &outcome.stopped {
				println!("{}", stopped.message());
			}
			println!("continued \"{}\" ({})", outcome.entry.description, outcome.entry.id);
		}
		Command::Add {
			day,
			description,
			start,
			end,
			duration,
			overnight,
			project,
			task,
			tags,
		} => {
			let end = match (end, duration) {
				(Some(end), _) => ManualEnd::At(end),
				(None, Some(length)) => ManualEnd::After(length),
				(None, None) => {
					return Err(TrackerError::validation("pass --end or --duration").into());
				}
			};
			let manual = ManualEntry {
				date: parse_day(day.as_deref(), today)?,
				description,
				start,
				end,
				overnight,
				project,
				task,
				tags,
			};
			let (date_key, entry) = store.add_manual_entry(manual, zone)?;
			println!(
				"recorded {} on {date_key} ({})",
				format_duration(entry.duration_seconds(now)),
				entry.id
			);
		}
		Command::Edit {
			id,
			description,
			day,
			start,
			end,
			overnight,
			project,
		} => {
			let (date_key, original) = store
				.find_entry(&id)?
				.ok_or_else(|| TrackerError::not_found(format!("entry {id}")))?;
			let edit = EntryEdit {
				description,
				day: day.as_deref().map(|raw| parse_day(Some(raw), today)).transpose()?,
				start,
				end,
				overnight,
				project,
			};
			let updated = apply_edit(&original, &edit, zone)?;
			let new_key = store.edit_entry(&date_key, updated, zone)?;
			println!("updated {id} on {new_key}");
		}
		Command::Delete { id } => {
			let (date_key, _) = store
				.find_entry(&id)?
				.ok_or_else(|| TrackerError::not_found(format!("entry {id}")))?;
			let removed = store.delete_entry(&id, &date_key)?;
			println!("deleted \"{}\" from {date_key}", removed.description);
		}
		Command::Day {
			day,
			asc,
			desc,
			hide_breaks,
		} => {
			let day = parse_day(day.as_deref(), today)?;
			let order = if asc {
				SortOrder::Asc
			} else if desc {
				SortOrder::Desc
			} else {
				settings.sort_order
			};
			print_day(&store, day, today, now, zone, order, settings.show_breaks && !hide_breaks)?;
		}
		Command::Duplicates { day } => {
			let key = date_key(parse_day(day.as_deref(), today)?);
			let entries = store.entries_for(&key)?;
			let duplicates = find_duplicate_descriptions(&entries);
			if duplicates.is_empty() {
				println!("no duplicate descriptions on {key}");
			}
			for description in duplicates {
				let verdict = if can_merge(&entries, &description) {
					"mergeable"
				} else {
					"not mergeable"
				};
				println!("{description} | {verdict}");
			}
		}
		Command::Merge { day, description } => {
			let key = date_key(parse_day(day.as_deref(), today)?);
			let outcome = merge_in_store(&mut store, &key, &description, now)?;
			println!(
				"merged {} entries into {} ({})",
				outcome.removed.len(),
				outcome.created.id,
				format_duration(outcome.created.duration_seconds(now))
			);
		}
		Command::SaveDay { day } => {
			let key = date_key(parse_day(day.as_deref(), today)?);
			let row = save_day_to_weekly(&mut store, &key, zone)?;
			println!(
				"saved {key}: {} - {}, break {}h, {}",
				row.time_in.unwrap_or_default(),
				row.time_out.unwrap_or_default(),
				row.break_hours.unwrap_or_default(),
				row.tasks.unwrap_or_default()
			);
		}
		Command::Week { day } => {
			let day = parse_day(day.as_deref(), today)?;
			print_week(&store, day)?;
		}
		Command::Invoice {
			from,
			to,
			rate,
			currency,
		} => {
			let from = parse_day(Some(&from), today)?;
			let to = parse_day(Some(&to), today)?;
			print_invoice(&store, &settings, from, to, rate, currency)?;
		}
		Command::Export { out } => {
			let document = export_json(&store, now)?;
			match out {
				Some(path) => {
					fs::write(&path, document)?;
					println!("exported to {}", path.display());
				}
				None => println!("{document}"),
			}
		}
		Command::Import { file } => {
			let raw = read_import_file(&file)?;
			let summary = import_document(&mut store, &raw, now)?;
			println!(
				"imported {} entries across {} days and {} weekly rows (use `revert` to undo)",
				summary.entries, summary.days, summary.weekly_rows
			);
		}
		Command::Revert => {
			let taken_at = revert_import(&mut store)?;
			println!("restored data from before the import at {}", taken_at.to_rfc3339());
		}
		Command::Timezone { name } => {
			if let Some(name) = name {
				store.set_selected_timezone(&name)?;
				println!("timezone set to {}", resolve_zone(Some(&name), &settings).name());
			} else {
				println!("{}", zone.name());
			}
		}
		Command::WeekStart { value } => {
			if let Some(value) = value {
				let week_start = value
					.parse::<WeekStart>()
					.map_err(TrackerError::validation)?;
				store.set_week_start(week_start)?;
			}
			println!("weeks start on {}", store.week_start()?);
		}
		Command::Config {
			rate,
			currency,
			sort,
			show_breaks,
			default_timezone,
		} => {
			let mut updated = settings.clone();
			if let Some(rate) = rate {
				if !rate.is_finite() || rate < 0.0 {
					return Err(TrackerError::validation("rate must be a non-negative number").into());
				}
				updated.hourly_rate = rate;
			}
			if let Some(currency) = currency {
				updated.currency = currency.trim().to_uppercase();
			}
			if let Some(sort) = sort {
				updated.sort_order = match sort.trim().to_ascii_lowercase().as_str() {
					"asc" => SortOrder::Asc,
					"desc" => SortOrder::Desc,
					other => return Err(TrackerError::validation(format!("unknown sort order {other:?}")).into()),
				};
			}
			if let Some(show_breaks) = show_breaks {
				updated.show_breaks = show_breaks;
			}
			if let Some(name) = default_timezone {
				updated.default_timezone = Some(name).filter(|name| !name.trim().is_empty());
			}
			if updated != settings {
				save_settings(&data_dir, &updated)?;
			}
			print_settings(&store, &updated);
		}
		Command::Clear { yes } => {
			if !yes {
				return Err(TrackerError::validation("pass --yes to delete all tracked data").into());
			}
			store.clear_all()?;
			println!("cleared all entries and weekly rows");
		}
	}

	Ok(())
}

fn parse_day(input: Option<&str>, today: NaiveDate) -> Result<NaiveDate, TrackerError> {
	match input {
		Some(raw) => parse_date_key(raw)
			.ok_or_else(|| TrackerError::validation(format!("invalid date {raw:?}, expected yyyy-mm-dd"))),
		None => Ok(today),
	}
}

fn read_import_file(path: &Path) -> Result<String, Box<dyn Error>> {
	Ok(fs::read_to_string(path)?)
}

struct EntryEdit {
	description: Option<String>,
	day: Option<NaiveDate>,
	start: Option<String>,
	end: Option<String>,
	overnight: bool,
	project: Option<String>,
}

/// Applies civil-time edits to a copy of `original`. Times are read on the
/// target day (the entry's current civil day unless moved).
fn apply_edit(original: &TimeEntry, edit: &EntryEdit, zone: Zone) -> Result<TimeEntry, TrackerError> {
	let mut updated = original.clone();
	if let Some(description) = &edit.description {
		updated.description = description.trim().to_string();
	}
	if let Some(project) = &edit.project {
		updated.project = Some(project.clone()).filter(|project| !project.trim().is_empty());
	}

	let original_start = to_civil(original.start_time, zone);
	let target_day = edit.day.unwrap_or(original_start.date());
	let start_time = match &edit.start {
		Some(raw) => parse_civil_time(raw)
			.ok_or_else(|| TrackerError::validation(format!("invalid start time: {raw:?}")))?,
		None => original_start.time(),
	};
	let start = to_instant_resolved(target_day.and_time(start_time), zone);
	updated.start_time = start;

	if original.is_active {
		if edit.end.is_some() {
			return Err(TrackerError::validation("stop the timer instead of setting an end time"));
		}
		return Ok(updated);
	}

	let end_time = match (&edit.end, original.end_time) {
		(Some(raw), _) => parse_civil_time(raw)
			.ok_or_else(|| TrackerError::validation(format!("invalid end time: {raw:?}")))?,
		(None, Some(end)) => to_civil(end, zone).time(),
		(None, None) => return Err(TrackerError::validation("entry has no end time")),
	};
	let end_day = if end_time <= start_time && edit.overnight {
		target_day + Duration::days(1)
	} else {
		target_day
	};
	updated.end_time = Some(to_instant_resolved(end_day.and_time(end_time), zone));
	Ok(updated)
}

fn watch(store: &mut IntervalStore<DirStore>) -> Result<(), Box<dyn Error>> {
	let dirty = Rc::new(Cell::new(true));
	let flag = Rc::clone(&dirty);
	store
		.observable_mut()
		.subscribe(TIMESHEET_KEY, move |_| flag.set(true))?;

	let mut active = None;
	loop {
		store.observable_mut().sync_external()?;
		if dirty.replace(false) {
			active = store.find_active_entry()?;
		}

		let now = Utc::now();
		match &active {
			Some((date_key, entry)) => println!(
				"{} | {} [{date_key}]",
				format_clock(entry.duration_seconds(now)),
				entry.description
			),
			None => println!("no timer running"),
		}
		thread::sleep(WATCH_TICK);
	}
}

fn print_settings(store: &IntervalStore<DirStore>, settings: &Settings) {
	println!("data dir         {}", store.observable().backend().root().display());
	println!("hourly rate      {}", format_amount(settings.hourly_rate, &settings.currency));
	println!("currency         {}", settings.currency);
	println!(
		"sort order       {}",
		match settings.sort_order {
			SortOrder::Asc => "asc",
			SortOrder::Desc => "desc",
		}
	);
	println!("show breaks      {}", settings.show_breaks);
	println!(
		"default timezone {}",
		settings.default_timezone.as_deref().unwrap_or("(host local time)")
	);
}

fn print_status(store: &IntervalStore<DirStore>, now: DateTime<Utc>) -> Result<(), Box<dyn Error>> {
	match store.find_active_entry()? {
		Some((date_key, entry)) => println!(
			"running: \"{}\" since {} ({}) [{date_key}]",
			entry.description,
			entry.start_time.to_rfc3339(),
			format_clock(entry.duration_seconds(now))
		),
		None => println!("no timer running"),
	}
	Ok(())
}

fn print_day(
	store: &IntervalStore<DirStore>,
	day: NaiveDate,
	today: NaiveDate,
	now: DateTime<Utc>,
	zone: Zone,
	order: SortOrder,
	show_breaks: bool,
) -> Result<(), Box<dyn Error>> {
	let key = date_key(day);
	let entries = store.entries_for(&key)?;
	let active = store
		.find_active_entry()?
		.filter(|(active_key, _)| *active_key == key || day == today)
		.map(|(_, entry)| entry);

	let summary = DaySummary::build(&key, &entries, active.as_ref(), now, order, show_breaks);
	println!("{} ({})", summary.date_key, zone.name());
	if summary.items.is_empty() {
		println!("no tracked time for this day");
		return Ok(());
	}

	for item in &summary.items {
		match item {
			DisplayItem::Active(entry) => println!(
				"> {} - now   {} | {} [{}]",
				format_civil_time(entry.start_time, zone),
				format_clock(entry.duration_seconds(now)),
				entry.description,
				entry.id
			),
			DisplayItem::Entry(entry) => println!(
				"  {} - {} {} | {} [{}]",
				format_civil_time(entry.start_time, zone),
				entry
					.end_time
					.map(|end| format_civil_time(end, zone))
					.unwrap_or_default(),
				format_duration(entry.duration_seconds(now)),
				entry.description,
				entry.id
			),
			DisplayItem::Break(span) => println!("    break {}", format_duration(span.seconds)),
		}
	}

	println!(
		"\ntotal {} | breaks {} | {} completed",
		format_duration(summary.total_seconds),
		format_duration(summary.break_seconds),
		summary.completed_count
	);
	Ok(())
}

fn print_week(store: &IntervalStore<DirStore>, day: NaiveDate) -> Result<(), Box<dyn Error>> {
	let rows = store.weekly_rows()?;
	let summary = weekly_summary(&rows, day, store.week_start()?);

	for week_day in &summary.days {
		let row = week_day.row.clone().unwrap_or_default();
		println!(
			"{} | {:>5} - {:<5} | break {:>5} | {:>5.2}h | {}",
			week_day.date.format("%a %Y-%m-%d"),
			row.time_in.unwrap_or_default(),
			row.time_out.unwrap_or_default(),
			row.break_hours.unwrap_or_default(),
			week_day.hours,
			row.work_details.unwrap_or_default()
		);
	}
	println!("\nweek total {:.2}h", summary.total_hours);
	Ok(())
}

fn print_invoice(
	store: &IntervalStore<DirStore>,
	settings: &Settings,
	from: NaiveDate,
	to: NaiveDate,
	rate: Option<f64>,
	currency: Option<String>,
) -> Result<(), Box<dyn Error>> {
	let rate = rate.unwrap_or(settings.hourly_rate);
	let currency = currency.unwrap_or_else(|| settings.currency.clone());
	let items = invoice_line_items(&store.weekly_rows()?, from, to, rate, &currency);

	if items.is_empty() {
		println!("no billable days between {} and {}", date_key(from), date_key(to));
		return Ok(());
	}

	for item in &items {
		println!(
			"{} | {:>6.2}h | {:>10} | {}",
			item.date, item.hours, item.formatted_amount, item.description
		);
	}
	println!("\ntotal {}", format_amount(invoice_total(&items), &currency));
	Ok(())
}
