use std::path::{Path, PathBuf};
use anyhow::{anyhow, Context, Result};
use chrono::TimeDelta;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;
use crate::error::ConfigError;
use crate::global::utils::get_global_data_dir;
use crate::util::{expand_path, home_dir};

pub const DEFAULT_API_URL: &str = "https://api.github.com";

/// Contents of `settings.toml`.
///
/// Every key is optional; a missing file yields the defaults.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Minimum time between two requests for the same URL (e.g. `"1d"`).
    pub fetch_delay: String,
    /// A resource whose `Last-Modified` is younger than this is not re-requested.
    pub update_delay: String,
    /// Where `bin` links go. Defaults to `~/.local/bin`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bin_dir: Option<String>,
    /// Root of the project directories. Defaults to the platform data directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<String>,
    /// Base URL of the release API.
    pub api_url: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            fetch_delay: "1d".to_string(),
            update_delay: "1d".to_string(),
            bin_dir: None,
            data_dir: None,
            api_url: DEFAULT_API_URL.to_string(),
        }
    }
}

/// Resolved locations every project operation works against.
#[derive(Debug, Clone, PartialEq)]
pub struct Layout {
    /// Parent of all project directories.
    pub data_dir: PathBuf,
    /// Target directory for relative `bin` names.
    pub bin_dir: PathBuf,
    /// Base URL of the release API, without trailing slash.
    pub api_url: String,
}

impl Layout {
    /// The directory a project's downloads and installed files live in.
    pub fn project_directory(&self, name: &str) -> PathBuf {
        self.data_dir.join(name)
    }
}

impl Settings {
    /// Loads the settings from the given file, falling back to defaults if it does not exist.
    ///
    /// # Errors
    /// Returns an error if the file exists but can't be read or parsed.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Settings> {
        let path = path.as_ref();
        if !path.exists() {
            debug!("No settings at {}, using defaults", path.display());
            return Ok(Settings::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Could not read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Could not parse {}", path.display()))
    }

    pub fn fetch_delay(&self) -> Result<TimeDelta, ConfigError> {
        parse_duration(&self.fetch_delay)
    }

    pub fn update_delay(&self) -> Result<TimeDelta, ConfigError> {
        parse_duration(&self.update_delay)
    }

    /// Resolves the configured (or default) directories.
    pub fn layout(&self) -> Result<Layout> {
        let data_dir = match &self.data_dir {
            Some(dir) => expand_path(dir, &[])?,
            None => get_global_data_dir()?,
        };
        let bin_dir = match &self.bin_dir {
            Some(dir) => expand_path(dir, &[])?,
            None => home_dir()
                .ok_or_else(|| anyhow!("Could not determine home directory"))?
                .join(".local")
                .join("bin"),
        };
        Ok(Layout {
            data_dir,
            bin_dir,
            api_url: self.api_url.trim_end_matches('/').to_string(),
        })
    }
}

/// Parses durations like `90s`, `30m`, `12h`, `1d`, `2w`. A bare number means seconds.
pub fn parse_duration(text: &str) -> Result<TimeDelta, ConfigError> {
    let invalid = || ConfigError::InvalidDuration(text.to_string());
    let re = Regex::new(r"^\s*(\d+)\s*([smhdw]?)\s*$").map_err(|_| invalid())?;
    let caps = re.captures(text).ok_or_else(invalid)?;
    let amount: i64 = caps[1].parse().map_err(|_| invalid())?;
    let delta = match &caps[2] {
        "" | "s" => TimeDelta::try_seconds(amount),
        "m" => TimeDelta::try_minutes(amount),
        "h" => TimeDelta::try_hours(amount),
        "d" => TimeDelta::try_days(amount),
        "w" => TimeDelta::try_weeks(amount),
        _ => None,
    };
    delta.ok_or_else(invalid)
}
