use std::env;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::daily::SortOrder;
use crate::timezone::Zone;

const CONFIG_FILE: &str = "config.toml";
const DATA_DIR_ENV: &str = "TALLY_DATA_DIR";
const APP_DIR: &str = "tally";

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("io error on {path}: {source}")]
	Io {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},
	#[error("failed to parse {path}: {source}")]
	Decode {
		path: PathBuf,
		#[source]
		source: toml::de::Error,
	},
	#[error("failed to encode settings: {0}")]
	Encode(#[from] toml::ser::Error),
}

/// Preferences kept in `config.toml` next to the data files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
	/// Used when no timezone has been selected in the store.
	pub default_timezone: Option<String>,
	pub hourly_rate: f64,
	pub currency: String,
	pub sort_order: SortOrder,
	pub show_breaks: bool,
}

impl Default for Settings {
	fn default() -> Self {
		Self {
			default_timezone: None,
			hourly_rate: 0.0,
			currency: "USD".to_string(),
			sort_order: SortOrder::Desc,
			show_breaks: true,
		}
	}
}

/// `--data-dir`, then `TALLY_DATA_DIR`, then the platform data directory.
pub fn resolve_data_dir(cli_path: Option<PathBuf>) -> PathBuf {
	if let Some(path) = cli_path {
		return absolutize(path);
	}

	if let Some(path) = env::var_os(DATA_DIR_ENV) {
		let path = PathBuf::from(path);
		if !path.as_os_str().is_empty() {
			return absolutize(path);
		}
	}

	#[cfg(target_os = "windows")]
	{
		if let Some(path) = env::var_os("APPDATA") {
			return PathBuf::from(path).join(APP_DIR);
		}
	}

	if let Some(path) = env::var_os("XDG_DATA_HOME") {
		return PathBuf::from(path).join(APP_DIR);
	}

	if let Some(path) = env::var_os("HOME") {
		return PathBuf::from(path)
			.join(".local")
			.join("share")
			.join(APP_DIR);
	}

	PathBuf::from(format!(".{APP_DIR}"))
}

pub fn load_settings(data_dir: &Path) -> Result<Settings, ConfigError> {
	let path = data_dir.join(CONFIG_FILE);
	let raw = match fs::read_to_string(&path) {
		Ok(raw) => raw,
		Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Settings::default()),
		Err(source) => return Err(ConfigError::Io { path, source }),
	};

	if raw.trim().is_empty() {
		return Ok(Settings::default());
	}

	toml::from_str(&raw).map_err(|source| ConfigError::Decode { path, source })
}

pub fn save_settings(data_dir: &Path, settings: &Settings) -> Result<(), ConfigError> {
	fs::create_dir_all(data_dir).map_err(|source| ConfigError::Io {
		path: data_dir.to_path_buf(),
		source,
	})?;

	let path = data_dir.join(CONFIG_FILE);
	let raw = toml::to_string_pretty(settings)?;
	fs::write(&path, raw).map_err(|source| ConfigError::Io { path, source })
}

/// The store's selected timezone wins over the configured default; with
/// neither, host local time is used.
pub fn resolve_zone(selected: Option<&str>, settings: &Settings) -> Zone {
	let name = selected
		.filter(|name| !name.trim().is_empty())
		.or(settings.default_timezone.as_deref())
		.unwrap_or("");
	Zone::resolve(name)
}

fn absolutize(path: PathBuf) -> PathBuf {
	if path.is_absolute() {
		path
	} else if let Ok(cwd) = env::current_dir() {
		cwd.join(path)
	} else {
		path
	}
}

#[cfg(test)]
mod tests {
	use std::fs;
	use std::path::PathBuf;

	use super::*;

	#[test]
	fn missing_config_gives_defaults() {
		let dir = tempfile::tempdir().expect("temp dir");
		let settings = load_settings(dir.path()).expect("load");
		assert_eq!(settings, Settings::default());
	}

	#[test]
	fn partial_config_keeps_other_defaults() {
		let dir = tempfile::tempdir().expect("temp dir");
		fs::write(
			dir.path().join(CONFIG_FILE),
			"hourly_rate = 85.0\ncurrency = \"EUR\"\nsort_order = \"asc\"\n",
		)
		.expect("write config");

		let settings = load_settings(dir.path()).expect("load");
		assert_eq!(settings.hourly_rate, 85.0);
		assert_eq!(settings.currency, "EUR");
		assert_eq!(settings.sort_order, SortOrder::Asc);
		assert!(settings.show_breaks);
	}

	#[test]
	fn round_trips_settings() {
		let dir = tempfile::tempdir().expect("temp dir");
		let settings = Settings {
			default_timezone: Some("Europe/Berlin".to_string()),
			hourly_rate: 42.5,
			currency: "GBP".to_string(),
			sort_order: SortOrder::Asc,
			show_breaks: false,
		};
		save_settings(dir.path(), &settings).expect("save");
		assert_eq!(load_settings(dir.path()).expect("load"), settings);
	}

	#[test]
	fn reports_broken_config() {
		let dir = tempfile::tempdir().expect("temp dir");
		fs::write(dir.path().join(CONFIG_FILE), "hourly_rate = [").expect("write config");
		assert!(matches!(
			load_settings(dir.path()),
			Err(ConfigError::Decode { .. })
		));
	}

	#[test]
	fn selected_timezone_beats_the_default() {
		let settings = Settings {
			default_timezone: Some("Asia/Tokyo".to_string()),
			..Settings::default()
		};
		assert_eq!(
			resolve_zone(Some("Europe/Paris"), &settings).name(),
			"Europe/Paris"
		);
		assert_eq!(resolve_zone(None, &settings).name(), "Asia/Tokyo");
		assert_eq!(resolve_zone(Some(" "), &settings).name(), "Asia/Tokyo");
		assert_eq!(resolve_zone(None, &Settings::default()), Zone::Local);
	}

	#[test]
	fn explicit_data_dir_wins() {
		let explicit = PathBuf::from("/tmp/tally-explicit");
		assert_eq!(resolve_data_dir(Some(explicit.clone())), explicit);
	}
}
