use std::fs;
use std::path::Path;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;
use crate::release::Release;
use crate::util::project_relative;

/// Per-project state, stored as `state.json`.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct ProjectState {
    /// Last metadata refresh.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<DateTime<Utc>>,
    /// Version of the release that would be installed next.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installed: Option<InstalledRelease>,
    #[serde(default)]
    pub installed_files: InstalledFiles,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct InstalledRelease {
    pub version: String,
    #[serde(default)]
    pub date: Option<DateTime<Utc>>,
}

impl From<&Release> for InstalledRelease {
    fn from(release: &Release) -> Self {
        Self { version: release.version.clone(), date: release.date }
    }
}

/// The files a project has put on disk, relative to the project directory or
/// absolute if they live outside of it.
///
/// Kept in insertion order, without duplicates.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
#[serde(transparent)]
pub struct InstalledFiles(Vec<String>);

impl InstalledFiles {
    /// Registers paths, resolving relative ones against `directory`.
    pub fn register<P: AsRef<Path>>(
        &mut self,
        directory: &Path,
        paths: impl IntoIterator<Item = P>,
    ) {
        for path in paths {
            let entry = project_relative(directory, path.as_ref());
            if !self.0.contains(&entry) {
                debug!("Registering installed file {entry}");
                self.0.push(entry);
            }
        }
    }

    /// Forgets paths. Unknown paths are logged and skipped.
    pub fn unregister<P: AsRef<Path>>(
        &mut self,
        directory: &Path,
        paths: impl IntoIterator<Item = P>,
    ) {
        for path in paths {
            let entry = project_relative(directory, path.as_ref());
            match self.0.iter().position(|known| *known == entry) {
                Some(index) => {
                    self.0.remove(index);
                }
                None => debug!("{entry} was not registered as installed"),
            }
        }
    }

    pub fn contains(&self, directory: &Path, path: &Path) -> bool {
        self.0.contains(&project_relative(directory, path))
    }

    /// Registered entries as stored.
    pub fn list(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Reads a JSON file, falling back to the default value if it is missing or broken.
pub fn load_json_or_default<T: DeserializeOwned + Default, P: AsRef<Path>>(path: P) -> T {
    let path = path.as_ref();
    if !path.exists() {
        return T::default();
    }
    let parsed = fs::read_to_string(path)
        .map_err(anyhow::Error::from)
        .and_then(|content| Ok(serde_json::from_str(&content)?));
    match parsed {
        Ok(value) => value,
        Err(e) => {
            debug!("Ignoring unreadable {}: {e}", path.display());
            T::default()
        }
    }
}

/// Writes pretty-printed JSON, creating parent directories.
pub fn save_json<T: Serialize, P: AsRef<Path>>(value: &T, path: P) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let content = serde_json::to_string_pretty(value)?;
    fs::write(path, content).with_context(|| format!("Could not write {}", path.display()))
}
