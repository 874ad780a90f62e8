//! Releases and their assets as returned by the GitHub releases API, and the rules
//! that pick one release and the configured assets out of them.

use std::cmp::Ordering;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;
use crate::config::{ActionSpec, RuleTable, RELEASE_LATEST, RELEASE_PRE};
use crate::fetch::FetchCache;
use crate::util::{glob_matches, human_size};

/// One published release. `data` is the raw API record.
#[derive(Debug, Clone, Serialize)]
pub struct Release {
    pub version: String,
    pub date: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub data: Value,
}

impl Release {
    /// Builds a release from an API record (`tag_name`, `published_at`, ...).
    pub fn from_record(data: Value) -> Result<Self> {
        let version = data
            .get("tag_name")
            .and_then(Value::as_str)
            .context("Release record without tag_name")?
            .to_string();
        let date = data.get("published_at").and_then(Value::as_str).and_then(parse_timestamp);
        Ok(Self { version, date, data })
    }

    pub fn is_draft(&self) -> bool {
        self.flag("draft")
    }

    pub fn is_prerelease(&self) -> bool {
        self.flag("prerelease")
    }

    fn flag(&self, key: &str) -> bool {
        self.data.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.data.get("created_at").and_then(Value::as_str).and_then(parse_timestamp)
    }

    /// The release's asset descriptors in API order.
    pub fn assets(&self) -> Result<Vec<AssetDescriptor>> {
        match self.data.get("assets") {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(assets) => serde_json::from_value(assets.clone())
                .with_context(|| format!("Malformed asset list in release {}", self.version)),
        }
    }
}

impl fmt::Display for Release {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.version)
    }
}

impl PartialEq for Release {
    fn eq(&self, other: &Self) -> bool {
        match (self.date, other.date) {
            (Some(a), Some(b)) => a == b,
            _ => self.version == other.version,
        }
    }
}

impl PartialOrd for Release {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(match (self.date, other.date) {
            (Some(a), Some(b)) => a.cmp(&b),
            _ => self.version.cmp(&other.version),
        })
    }
}

fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text).ok().map(|date| date.with_timezone(&Utc))
}

/// An asset as listed in a release record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetDescriptor {
    pub name: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub download_count: u64,
    pub url: String,
}

impl fmt::Display for AssetDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if let Some(label) = self.label.as_deref().filter(|l| !l.is_empty() && *l != self.name) {
            write!(f, " \"{label}\"")?;
        }
        write!(f, " ({}, {} downloads)", human_size(self.size), self.download_count)
    }
}

/// Decodes cached release data: a single record (from `/releases/latest`) or a list,
/// which is returned newest first by creation time.
pub fn releases_from_data(data: Option<&Value>) -> Result<Vec<Release>> {
    let mut releases = match data {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(record @ Value::Object(_)) => vec![Release::from_record(record.clone())?],
        Some(Value::Array(records)) => records
            .iter()
            .cloned()
            .map(Release::from_record)
            .collect::<Result<Vec<_>>>()?,
        Some(other) => {
            warn!("Ignoring unexpected release data: {}", truncate(&other.to_string(), 80));
            return Ok(Vec::new());
        }
    };
    releases.sort_by(newest_first);
    Ok(releases)
}

/// Orders by creation time, else publish time, else tag, newest first. Dated
/// releases come before undated ones.
fn newest_first(a: &Release, b: &Release) -> Ordering {
    let key = |release: &Release| (release.created_at().or(release.date), release.version.clone());
    key(b).cmp(&key(a))
}

fn truncate(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

/// Applies a release rule to releases sorted newest first.
///
/// `latest` takes the newest stable release, `pre` the newest non-draft one, and
/// anything else is a glob pattern on the tag. Drafts are never selected.
pub fn select_release<'a>(rule: &str, releases: &'a [Release]) -> Option<&'a Release> {
    releases.iter().find(|release| {
        !release.is_draft()
            && match rule {
                RELEASE_LATEST => !release.is_prerelease(),
                RELEASE_PRE => true,
                pattern => glob_matches(pattern, &release.version),
            }
    })
}

/// A release asset bound to the configuration rule that selected it.
#[derive(Debug, Clone, PartialEq)]
pub struct Asset {
    pub descriptor: AssetDescriptor,
    /// Version of the release the asset belongs to.
    pub release: String,
    pub pattern: String,
    pub spec: ActionSpec,
    /// Where the downloaded file lives, inside the project directory.
    pub source: PathBuf,
}

impl Asset {
    /// Whether the file is missing or belongs to another release than the cached one.
    pub fn needs_download(&self, cache: Option<&FetchCache>) -> bool {
        !self.source.exists()
            || cache.and_then(|c| c.release.as_deref()) != Some(self.release.as_str())
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.descriptor.fmt(f)
    }
}

/// Finds the asset for each rule of `rules`, in rule order.
///
/// A rule without a matching asset is skipped; if several assets match, the first
/// in API order is used. Both cases are logged as warnings.
pub fn match_assets(
    project: &str,
    directory: &Path,
    release: &Release,
    rules: &RuleTable,
) -> Result<Vec<Asset>> {
    let descriptors: Vec<AssetDescriptor> = release
        .assets()?
        .into_iter()
        .filter(|descriptor| {
            let plain = source_path(directory, &descriptor.name).is_some();
            if !plain {
                warn!(
                    "{project} {release}: Ignoring asset {:?}, its name is not a plain file name",
                    descriptor.name
                );
            }
            plain
        })
        .collect();
    let mut result = Vec::new();
    for (pattern, spec) in rules.iter() {
        let matching: Vec<&AssetDescriptor> =
            descriptors.iter().filter(|d| glob_matches(pattern, &d.name)).collect();
        let Some(first) = matching.first() else {
            warn!("{project} {release}: No asset matching {pattern} found");
            continue;
        };
        if matching.len() > 1 {
            let names: Vec<&str> = matching.iter().map(|d| d.name.as_str()).collect();
            warn!(
                "{project} {release}: {} assets match {pattern} ({}), using the first one",
                matching.len(),
                names.join(", ")
            );
        }
        result.push(Asset {
            descriptor: (*first).clone(),
            release: release.version.clone(),
            pattern: pattern.to_string(),
            spec: spec.clone(),
            source: directory.join(&first.name),
        });
    }
    Ok(result)
}

/// Where an asset named `name` is downloaded to. Only a single plain file name
/// is accepted, so a download can never land outside `directory`.
fn source_path(directory: &Path, name: &str) -> Option<PathBuf> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(file)), None) if !name.contains(['/', '\\']) => {
            Some(directory.join(file))
        }
        _ => None,
    }
}

/// Binds every asset of `release` to the first rule matching it, if any.
pub fn all_assets(
    directory: &Path,
    release: &Release,
    rules: &RuleTable,
) -> Result<Vec<(AssetDescriptor, Option<Asset>)>> {
    Ok(release
        .assets()?
        .into_iter()
        .map(|descriptor| {
            let bound = source_path(directory, &descriptor.name).and_then(|source| {
                rules.first_match(&descriptor.name).map(|(pattern, spec)| Asset {
                    descriptor: descriptor.clone(),
                    release: release.version.clone(),
                    pattern: pattern.to_string(),
                    spec: spec.clone(),
                    source,
                })
            });
            (descriptor, bound)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use crate::config::Action;

    fn record(tag: &str, created: &str, draft: bool, prerelease: bool) -> Value {
        json!({
            "tag_name": tag,
            "name": tag,
            "published_at": created,
            "created_at": created,
            "draft": draft,
            "prerelease": prerelease,
            "assets": [
                {"name": format!("tool-{tag}-linux.tar.gz"), "label": "",
                 "size": 2_300_000, "download_count": 7,
                 "url": format!("https://api.github.com/assets/{tag}/1")},
                {"name": format!("tool-{tag}-windows.zip"), "label": "Windows build",
                 "size": 999, "download_count": 1,
                 "url": format!("https://api.github.com/assets/{tag}/2")},
                {"name": format!("tool-{tag}-linux.tar.gz.sha256"), "label": null,
                 "size": 64, "download_count": 0,
                 "url": format!("https://api.github.com/assets/{tag}/3")},
            ]
        })
    }

    fn releases() -> Vec<Release> {
        let data = json!([
            record("v1.0.0", "2024-01-01T00:00:00Z", false, false),
            record("v2.0.0-rc1", "2024-03-01T00:00:00Z", false, true),
            record("v3.0.0", "2024-04-01T00:00:00Z", true, false),
            record("v1.1.0", "2024-02-01T00:00:00Z", false, false),
        ]);
        releases_from_data(Some(&data)).unwrap()
    }

    #[test]
    fn test_releases_sorted_newest_first() {
        let versions: Vec<String> = releases().into_iter().map(|r| r.version).collect();
        assert_eq!(versions, ["v3.0.0", "v2.0.0-rc1", "v1.1.0", "v1.0.0"]);
    }

    #[test]
    fn test_releases_without_creation_time() {
        let data = json!([
            {"tag_name": "v1.0.0", "published_at": "2024-01-01T00:00:00Z", "prerelease": false},
            {"tag_name": "v2.0.0", "published_at": "2024-03-01T00:00:00Z", "prerelease": false},
        ]);
        let releases = releases_from_data(Some(&data)).unwrap();
        let versions: Vec<&str> = releases.iter().map(|r| r.version.as_str()).collect();
        assert_eq!(versions, ["v2.0.0", "v1.0.0"]);
        assert_eq!(select_release("latest", &releases).unwrap().version, "v2.0.0");

        let undated = json!([
            {"tag_name": "v0.9"},
            {"tag_name": "v0.10-dated", "published_at": "2023-01-01T00:00:00Z"},
            {"tag_name": "v1.0"},
        ]);
        let versions: Vec<String> =
            releases_from_data(Some(&undated)).unwrap().into_iter().map(|r| r.version).collect();
        assert_eq!(versions, ["v0.10-dated", "v1.0", "v0.9"]);
    }

    #[test]
    fn test_single_record_from_latest_endpoint() {
        let data = record("v1.0.0", "2024-01-01T00:00:00Z", false, false);
        let releases = releases_from_data(Some(&data)).unwrap();
        assert_eq!(releases.len(), 1);
        assert!(releases_from_data(None).unwrap().is_empty());
    }

    #[test]
    fn test_select_release_rules() {
        let releases = releases();
        assert_eq!(select_release("latest", &releases).unwrap().version, "v1.1.0");
        assert_eq!(select_release("pre", &releases).unwrap().version, "v2.0.0-rc1");
        assert_eq!(select_release("v1.*", &releases).unwrap().version, "v1.1.0");
        assert!(select_release("v3.*", &releases).is_none());
        assert!(select_release("v9.*", &releases).is_none());
    }

    #[test]
    fn test_release_equality_and_order() {
        let releases = releases();
        let mut same_date = releases[2].clone();
        same_date.version = "renamed".to_string();
        assert_eq!(same_date, releases[2]);
        assert!(releases[3] < releases[2]);

        let undated_a = Release { version: "a".into(), date: None, data: Value::Null };
        let undated_b = Release { version: "b".into(), date: None, data: Value::Null };
        assert!(undated_a < undated_b);
        assert_ne!(undated_a, releases[0]);
    }

    #[test]
    fn test_match_assets_first_wins() {
        let releases = releases();
        let release = &releases[2];
        let rules: RuleTable = vec![
            ("*linux*".to_string(), ActionSpec::bare(Action::Unpack)),
            ("*.dmg".to_string(), ActionSpec::bare(Action::Bin)),
        ]
        .into_iter()
        .collect();

        let assets = match_assets("tool", Path::new("/data/tool"), release, &rules).unwrap();
        assert_eq!(assets.len(), 1);
        assert_eq!(assets[0].descriptor.name, "tool-v1.1.0-linux.tar.gz");
        assert_eq!(assets[0].source, PathBuf::from("/data/tool/tool-v1.1.0-linux.tar.gz"));
        assert_eq!(assets[0].release, "v1.1.0");
    }

    #[test]
    fn test_all_assets_binds_configured_ones() {
        let releases = releases();
        let rules: RuleTable =
            vec![("*.zip".to_string(), ActionSpec::bare(Action::Unpack))].into_iter().collect();
        let all = all_assets(Path::new("/p"), &releases[0], &rules).unwrap();
        assert_eq!(all.len(), 3);
        assert!(all[0].1.is_none());
        assert_eq!(all[1].1.as_ref().unwrap().pattern, "*.zip");
    }

    #[test]
    fn test_assets_with_path_names_are_ignored() {
        let data = json!({
            "tag_name": "v1.0.0",
            "assets": [
                {"name": "../evil.tar.gz", "url": "https://api.github.com/assets/1"},
                {"name": "sub/dir.tar.gz", "url": "https://api.github.com/assets/2"},
                {"name": "good.tar.gz", "url": "https://api.github.com/assets/3"},
            ]
        });
        let release = Release::from_record(data).unwrap();
        let rules: RuleTable = vec![
            ("*evil*".to_string(), ActionSpec::bare(Action::Unpack)),
            ("*.tar.gz".to_string(), ActionSpec::bare(Action::Unpack)),
        ]
        .into_iter()
        .collect();

        let assets = match_assets("tool", Path::new("/p"), &release, &rules).unwrap();
        assert_eq!(assets.len(), 1);
        assert_eq!(assets[0].source, PathBuf::from("/p/good.tar.gz"));
        let bound: Vec<bool> = all_assets(Path::new("/p"), &release, &rules)
            .unwrap()
            .iter()
            .map(|(_, asset)| asset.is_some())
            .collect();
        assert_eq!(bound, [false, false, true]);
        assert_eq!(
            source_path(Path::new("/p"), "good.tar.gz"),
            Some(PathBuf::from("/p/good.tar.gz"))
        );
        assert_eq!(source_path(Path::new("/p"), ".."), None);
    }

    #[test]
    fn test_needs_download() {
        let dir = tempfile::tempdir().unwrap();
        let releases = releases();
        let rules: RuleTable =
            vec![("*.zip".to_string(), ActionSpec::bare(Action::Unpack))].into_iter().collect();
        let asset = match_assets("tool", dir.path(), &releases[2], &rules).unwrap().remove(0);

        assert!(asset.needs_download(None));
        std::fs::write(&asset.source, b"zip").unwrap();
        let mut cache = FetchCache { release: Some("v1.0.0".to_string()), ..FetchCache::default() };
        assert!(asset.needs_download(Some(&cache)));
        cache.release = Some("v1.1.0".to_string());
        assert!(!asset.needs_download(Some(&cache)));
    }

    #[test]
    fn test_descriptor_display() {
        let assets = releases()[0].assets().unwrap();
        assert_eq!(assets[0].to_string(), "tool-v3.0.0-linux.tar.gz (2.3 MB, 7 downloads)");
        assert_eq!(
            assets[1].to_string(),
            "tool-v3.0.0-windows.zip \"Windows build\" (999 Bytes, 1 downloads)"
        );
    }
}
