use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use anyhow::{Context, Result};
use regex::Regex;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::{debug, warn};
use crate::error::ConfigError;

/// Release rule that selects the newest release that is neither draft nor prerelease.
pub const RELEASE_LATEST: &str = "latest";
/// Release rule that selects the newest non-draft release, prereleases included.
pub const RELEASE_PRE: &str = "pre";

/// One of the install actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Action {
    Unpack,
    Bin,
    Link,
    Delete,
    Record,
}

impl Action {
    /// All actions, in the order they run when given as a mapping.
    pub const ALL: [Action; 5] =
        [Action::Unpack, Action::Bin, Action::Link, Action::Delete, Action::Record];

    pub fn name(&self) -> &'static str {
        match self {
            Action::Unpack => "unpack",
            Action::Bin => "bin",
            Action::Link => "link",
            Action::Delete => "delete",
            Action::Record => "record",
        }
    }

    /// Whether the action can't do anything without an argument.
    pub fn requires_argument(&self) -> bool {
        matches!(self, Action::Link | Action::Record)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Action::ALL
            .into_iter()
            .find(|action| action.name() == s)
            .ok_or_else(|| s.to_string())
    }
}

/// A normalized action with its optional argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub action: Action,
    pub arg: Option<String>,
}

/// What to do with a file, as written in the configuration.
///
/// ```toml
/// "*.tar.gz" = "unpack"                 # Bare
/// "tool" = { bin = "tool2" }            # WithArg
/// "tool.zip" = ["unpack", "delete"]     # List
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ActionSpec {
    Bare(String),
    List(Vec<String>),
    WithArg(BTreeMap<String, String>),
}

impl ActionSpec {
    pub fn bare(action: Action) -> Self {
        ActionSpec::Bare(action.name().to_string())
    }

    pub fn with_arg(action: Action, arg: &str) -> Self {
        ActionSpec::WithArg(BTreeMap::from([(action.name().to_string(), arg.to_string())]))
    }

    /// Normalizes into the sequence of steps to run.
    ///
    /// Unknown action names are skipped with a warning. Mappings run in the order of
    /// [`Action::ALL`], lists in the given order.
    ///
    /// # Errors
    /// Fails for empty specs, repeated actions and `link`/`record` without argument.
    pub fn steps(&self) -> Result<Vec<Step>, ConfigError> {
        let named: Vec<(&str, Option<&str>)> = match self {
            ActionSpec::Bare(name) => vec![(name.as_str(), None)],
            ActionSpec::List(names) => names.iter().map(|name| (name.as_str(), None)).collect(),
            ActionSpec::WithArg(map) => {
                map.iter().map(|(name, arg)| (name.as_str(), Some(arg.as_str()))).collect()
            }
        };
        if named.is_empty() || named.iter().all(|(name, _)| name.trim().is_empty()) {
            return Err(ConfigError::EmptyActionSpec);
        }

        let mut steps: Vec<Step> = Vec::new();
        for (name, arg) in named {
            let action = match name.parse::<Action>() {
                Ok(action) => action,
                Err(unknown) => {
                    warn!("Skipping unknown install action {unknown}={}", arg.unwrap_or(""));
                    continue;
                }
            };
            if steps.iter().any(|step| step.action == action) {
                return Err(ConfigError::DuplicateAction(name.to_string()));
            }
            if action.requires_argument() && arg.is_none() {
                return Err(ConfigError::MissingArgument(name.to_string()));
            }
            steps.push(Step { action, arg: arg.map(str::to_string) });
        }
        if let ActionSpec::WithArg(_) = self {
            steps.sort_by_key(|step| step.action);
        }
        Ok(steps)
    }
}

impl fmt::Display for ActionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionSpec::Bare(name) => f.write_str(name),
            ActionSpec::List(names) => f.write_str(&names.join(",")),
            ActionSpec::WithArg(map) => {
                let parts: Vec<String> = map.iter().map(|(k, v)| format!("{k}:{v}")).collect();
                f.write_str(&parts.join(" "))
            }
        }
    }
}

impl FromStr for ActionSpec {
    type Err = ConfigError;

    /// Parses the command line form: `bin`, `bin:name` or `unpack,delete`.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        let spec = if let Some((action, arg)) = s.split_once(':') {
            ActionSpec::WithArg(BTreeMap::from([(action.trim().to_string(), arg.to_string())]))
        } else if s.contains(',') {
            ActionSpec::List(s.split(',').map(|a| a.trim().to_string()).collect())
        } else {
            ActionSpec::Bare(s.to_string())
        };
        spec.steps()?;
        Ok(spec)
    }
}

/// An ordered table of glob pattern → action spec.
///
/// Order matters: when several patterns match, the first one wins for classification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleTable(Vec<(String, ActionSpec)>);

impl RuleTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ActionSpec)> {
        self.0.iter().map(|(pattern, spec)| (pattern.as_str(), spec))
    }

    pub fn get(&self, pattern: &str) -> Option<&ActionSpec> {
        self.iter().find(|(p, _)| *p == pattern).map(|(_, spec)| spec)
    }

    /// Inserts or replaces the rule for `pattern`, keeping its position if it exists.
    pub fn insert(&mut self, pattern: &str, spec: ActionSpec) {
        match self.0.iter_mut().find(|(p, _)| p == pattern) {
            Some(entry) => entry.1 = spec,
            None => self.0.push((pattern.to_string(), spec)),
        }
    }

    /// All rules whose pattern matches `candidate`, in table order.
    pub fn matching<'a>(
        &'a self,
        candidate: &'a str,
    ) -> impl Iterator<Item = (&'a str, &'a ActionSpec)> + 'a {
        self.iter().filter(move |(pattern, _)| crate::util::glob_matches(pattern, candidate))
    }

    pub fn first_match<'a>(&'a self, candidate: &'a str) -> Option<(&'a str, &'a ActionSpec)> {
        self.matching(candidate).next()
    }
}

impl FromIterator<(String, ActionSpec)> for RuleTable {
    fn from_iter<T: IntoIterator<Item = (String, ActionSpec)>>(iter: T) -> Self {
        let mut table = RuleTable::new();
        for (pattern, spec) in iter {
            table.insert(&pattern, spec);
        }
        table
    }
}

impl Serialize for RuleTable {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (pattern, spec) in &self.0 {
            map.serialize_entry(pattern, spec)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for RuleTable {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct RuleTableVisitor;

        impl<'de> Visitor<'de> for RuleTableVisitor {
            type Value = RuleTable;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a table of glob pattern = action spec")
            }

            fn visit_map<A: MapAccess<'de>>(
                self,
                mut access: A,
            ) -> std::result::Result<RuleTable, A::Error> {
                let mut table = RuleTable::new();
                while let Some((pattern, spec)) = access.next_entry::<String, ActionSpec>()? {
                    table.insert(&pattern, spec);
                }
                Ok(table)
            }
        }

        deserializer.deserialize_map(RuleTableVisitor)
    }
}

/// Configuration of a single project, one table in `projects.toml`.
///
/// ```toml
/// [broot]
/// url = "https://github.com/Canop/broot"
/// release = "latest"
/// postinstall = "broot --print-shell-function zsh > ~/.zsh/br.zsh"
///
/// [broot.assets]
/// "*.zip" = "unpack"
///
/// [broot.install]
/// "*-linux-musl/broot" = "bin"
/// "broot.1" = { link = "~/.local/man/" }
/// ```
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ProjectConfig {
    /// URL of the GitHub project.
    pub url: String,
    /// `latest`, `pre`, or a glob pattern matched against release tags.
    #[serde(default = "default_release")]
    pub release: String,
    /// Script run after installation, see [`crate::script`].
    #[serde(default, alias = "post-install", skip_serializing_if = "Option::is_none")]
    pub postinstall: Option<String>,
    /// Asset name pattern → what to do with the downloaded asset.
    #[serde(default, skip_serializing_if = "RuleTable::is_empty")]
    pub assets: RuleTable,
    /// Project relative path pattern → what to do with files produced by installation.
    #[serde(default, skip_serializing_if = "RuleTable::is_empty")]
    pub install: RuleTable,
}

fn default_release() -> String {
    RELEASE_LATEST.to_string()
}

impl ProjectConfig {
    pub fn new(url: &str) -> Self {
        ProjectConfig {
            url: url.to_string(),
            release: default_release(),
            postinstall: None,
            assets: RuleTable::new(),
            install: RuleTable::new(),
        }
    }

    /// Checks everything that can be checked without network access.
    ///
    /// # Errors
    /// The first configuration problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        parse_github_url(&self.url)?;
        if self.release != RELEASE_LATEST && self.release != RELEASE_PRE {
            check_pattern(&self.release)?;
        }
        for (pattern, spec) in self.assets.iter().chain(self.install.iter()) {
            check_pattern(pattern)?;
            spec.steps()?;
        }
        Ok(())
    }

    /// Adds or updates an asset rule.
    ///
    /// `previous` names the rule being reconfigured. A new `pattern` replaces the previous
    /// key in place; the previous spec is carried over unless a new `spec` is given, which
    /// replaces it as a whole (individual actions are never merged). A rule that already
    /// exists under the new pattern is dropped in favour of the reconfigured one.
    ///
    /// # Errors
    /// Fails for invalid patterns or specs, and when a new rule would have no spec.
    pub fn configure_asset(
        &mut self,
        previous: Option<&str>,
        pattern: Option<&str>,
        spec: Option<ActionSpec>,
    ) -> Result<(), ConfigError> {
        let key = pattern.or(previous).ok_or_else(|| ConfigError::InvalidPattern {
            pattern: String::new(),
            reason: "no pattern given".to_string(),
        })?;
        check_pattern(key)?;
        let old_spec = previous.and_then(|p| self.assets.get(p).cloned());
        let new_spec = spec.or(old_spec).ok_or(ConfigError::EmptyActionSpec)?;
        new_spec.steps()?;

        match previous {
            Some(previous) if self.assets.get(previous).is_some() => {
                let rules = std::mem::take(&mut self.assets.0);
                for (p, s) in rules {
                    if p == previous {
                        self.assets.0.push((key.to_string(), new_spec.clone()));
                    } else if p != key {
                        self.assets.0.push((p, s));
                    }
                }
            }
            _ => self.assets.insert(key, new_spec),
        }
        debug!("configured asset {key}");
        Ok(())
    }
}

fn check_pattern(pattern: &str) -> Result<(), ConfigError> {
    glob::Pattern::new(pattern).map(|_| ()).map_err(|e| ConfigError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: e.msg.to_string(),
    })
}

/// Looks for user and repository in a GitHub URL or a `user/repo` string.
///
/// Returns `(user, repo)`.
pub fn parse_github_url(url: &str) -> Result<(String, String), ConfigError> {
    let invalid = || ConfigError::InvalidUrl(url.to_string());
    let full = Regex::new(r"^https?://(?:[^/]+\.)?github\.com/([^/?#\s]+)/([^/?#\s]+)")
        .map_err(|_| invalid())?;
    let short = Regex::new(r"^([^/\s:]+)/([^/\s]+)$").map_err(|_| invalid())?;
    let caps = full.captures(url).or_else(|| short.captures(url)).ok_or_else(invalid)?;
    let repo = caps[2].trim_end_matches(".git").to_string();
    Ok((caps[1].to_string(), repo))
}

/// Canonical project URL for a GitHub `user/repo`.
pub fn github_url(user: &str, repo: &str) -> String {
    format!("https://github.com/{user}/{repo}")
}

/// Represents the contents of `projects.toml`: project name → configuration.
#[derive(Deserialize, Serialize, Debug, Default, Clone, PartialEq)]
#[serde(transparent)]
pub struct ProjectsFile {
    pub projects: BTreeMap<String, ProjectConfig>,
}

impl ProjectsFile {
    /// Loads the projects file, or an empty one if it does not exist.
    ///
    /// # Errors
    /// Returns an error if the file exists but can't be read or deserialized.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<ProjectsFile> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(ProjectsFile::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Could not read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Could not parse {}", path.display()))
    }

    /// Saves the projects to the given file path in pretty TOML format.
    ///
    /// # Errors
    /// Returns an error if the file can't be written or serialization fails.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let toml_str = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_str)?;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ProjectConfig> {
        self.projects.get(name)
    }

    /// Adds a project, named after its repository unless a name is given.
    ///
    /// Returns the name used.
    ///
    /// # Errors
    /// Fails for invalid URLs, and if the name is taken by a project with a different URL.
    pub fn add(&mut self, name: Option<&str>, mut config: ProjectConfig) -> Result<String> {
        let (user, repo) = parse_github_url(&config.url)?;
        config.url = github_url(&user, &repo);
        config.validate()?;
        let name = name.unwrap_or(&repo).to_string();
        if let Some(existing) = self.projects.get(&name) {
            if existing.url != config.url {
                anyhow::bail!(
                    "Project {name} already exists with URL {} instead of {}. Please provide an explicit name.",
                    existing.url,
                    config.url
                );
            }
            if existing != &config {
                warn!("Project {name}: overwriting previous configuration");
            }
        }
        self.projects.insert(name.clone(), config);
        Ok(name)
    }

    /// Removes a project. If the project does not exist, nothing happens.
    pub fn remove(&mut self, name: &str) -> Option<ProjectConfig> {
        self.projects.remove(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    const BROOT: &str = r#"
[broot]
url = "https://github.com/Canop/broot"
release = "v1.*"
post-install = "broot --print-shell-function zsh > ~/.zsh/br.zsh"

[broot.assets]
"*.zip" = "unpack"

[broot.install]
"*-linux-musl/broot" = "bin"
"broot.1" = { link = "~/.local/man/" }
"*.md" = ["record-me", "delete"]
"#;

    #[test]
    fn test_parse_project_config() {
        let file: ProjectsFile = toml::from_str(BROOT).unwrap();
        let broot = file.get("broot").unwrap();
        assert_eq!(broot.release, "v1.*");
        assert_eq!(
            broot.postinstall.as_deref(),
            Some("broot --print-shell-function zsh > ~/.zsh/br.zsh")
        );
        assert_eq!(broot.assets.get("*.zip"), Some(&ActionSpec::bare(Action::Unpack)));
        assert_eq!(
            broot.install.get("broot.1"),
            Some(&ActionSpec::with_arg(Action::Link, "~/.local/man/"))
        );
        broot.validate().unwrap();
    }

    #[test]
    fn test_rule_table_keeps_document_order() {
        let file: ProjectsFile = toml::from_str(BROOT).unwrap();
        let patterns: Vec<&str> =
            file.get("broot").unwrap().install.iter().map(|(p, _)| p).collect();
        assert_eq!(patterns, vec!["*-linux-musl/broot", "broot.1", "*.md"]);
    }

    #[test]
    fn test_first_match_in_table_order() {
        let file: ProjectsFile = toml::from_str(BROOT).unwrap();
        let install = &file.get("broot").unwrap().install;
        let candidate = format!("{}/broot", "x86_64-linux-musl");
        let (pattern, spec) = install.first_match(&candidate).unwrap();
        assert_eq!(pattern, "*-linux-musl/broot");
        assert_eq!(spec, &ActionSpec::bare(Action::Bin));
        assert!(install.first_match("README.txt").is_none());
    }

    #[test]
    fn test_steps_normalization() {
        assert_eq!(
            ActionSpec::bare(Action::Bin).steps().unwrap(),
            vec![Step { action: Action::Bin, arg: None }]
        );

        let mapping = ActionSpec::WithArg(BTreeMap::from([
            ("link".to_string(), "~/x".to_string()),
            ("unpack".to_string(), "dir".to_string()),
        ]));
        let actions: Vec<Action> = mapping.steps().unwrap().iter().map(|s| s.action).collect();
        assert_eq!(actions, vec![Action::Unpack, Action::Link]);

        let list = ActionSpec::List(vec!["delete".to_string(), "unpack".to_string()]);
        let actions: Vec<Action> = list.steps().unwrap().iter().map(|s| s.action).collect();
        assert_eq!(actions, vec![Action::Delete, Action::Unpack]);
    }

    #[test]
    fn test_unknown_actions_are_skipped() {
        let spec = ActionSpec::List(vec!["record-me".to_string(), "delete".to_string()]);
        assert_eq!(spec.steps().unwrap(), vec![Step { action: Action::Delete, arg: None }]);
        assert_eq!(ActionSpec::Bare("register".to_string()).steps().unwrap(), vec![]);
    }

    #[test]
    fn test_ambiguous_specs_fail() {
        assert_eq!(ActionSpec::List(vec![]).steps(), Err(ConfigError::EmptyActionSpec));
        assert_eq!(
            ActionSpec::List(vec!["bin".to_string(), "bin".to_string()]).steps(),
            Err(ConfigError::DuplicateAction("bin".to_string()))
        );
        assert_eq!(
            ActionSpec::bare(Action::Link).steps(),
            Err(ConfigError::MissingArgument("link".to_string()))
        );
    }

    #[test]
    fn test_action_spec_from_cli_syntax() {
        assert_eq!("bin".parse::<ActionSpec>().unwrap(), ActionSpec::bare(Action::Bin));
        assert_eq!(
            "bin:rg".parse::<ActionSpec>().unwrap(),
            ActionSpec::with_arg(Action::Bin, "rg")
        );
        assert_eq!(
            "unpack,delete".parse::<ActionSpec>().unwrap(),
            ActionSpec::List(vec!["unpack".to_string(), "delete".to_string()])
        );
        assert!("link".parse::<ActionSpec>().is_err());
    }

    #[test]
    fn test_parse_github_url() {
        let expected = ("rgburke".to_string(), "grv".to_string());
        assert_eq!(parse_github_url("rgburke/grv").unwrap(), expected);
        assert_eq!(parse_github_url("https://github.com/rgburke/grv").unwrap(), expected);
        assert_eq!(
            parse_github_url("https://github.com/rgburke/grv/releases/tag/v0.3.2").unwrap(),
            expected
        );
        assert!(matches!(parse_github_url("grv"), Err(ConfigError::InvalidUrl(_))));
        assert!(parse_github_url("https://gitlab.com/a/b").is_err());
    }

    #[test]
    fn test_invalid_release_pattern_fails_validation() {
        let mut config = ProjectConfig::new("a/b");
        config.release = "v[1".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::InvalidPattern { .. })));
    }

    #[test]
    fn test_configure_asset_renames_and_keeps_spec() {
        let mut config = ProjectConfig::new("a/b");
        config.assets.insert("tool-*-linux.tar.gz", ActionSpec::bare(Action::Unpack));
        config.assets.insert("*.sha256", ActionSpec::bare(Action::Record));

        config.configure_asset(Some("tool-*-linux.tar.gz"), Some("*-linux.tar.gz"), None).unwrap();
        let rules: Vec<(&str, &ActionSpec)> = config.assets.iter().collect();
        assert_eq!(
            rules,
            vec![
                ("*-linux.tar.gz", &ActionSpec::bare(Action::Unpack)),
                ("*.sha256", &ActionSpec::bare(Action::Record)),
            ]
        );

        config
            .configure_asset(Some("*-linux.tar.gz"), None, Some(ActionSpec::bare(Action::Bin)))
            .unwrap();
        assert_eq!(config.assets.get("*-linux.tar.gz"), Some(&ActionSpec::bare(Action::Bin)));
        assert_eq!(config.assets.len(), 2);
    }

    #[test]
    fn test_projects_file_add_and_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("projects.toml");
        let mut file = ProjectsFile::load_or_default(&path).unwrap();
        assert!(file.projects.is_empty());

        let mut config = ProjectConfig::new("https://github.com/BurntSushi/ripgrep/releases");
        config.assets.insert("*x86_64-unknown-linux-musl.tar.gz", ActionSpec::bare(Action::Unpack));
        config.install.insert("*/rg", ActionSpec::bare(Action::Bin));
        let name = file.add(None, config).unwrap();
        assert_eq!(name, "ripgrep");
        file.save(&path).unwrap();

        let loaded = ProjectsFile::load_or_default(&path).unwrap();
        assert_eq!(loaded, file);
        assert_eq!(loaded.get("ripgrep").unwrap().url, "https://github.com/BurntSushi/ripgrep");

        let clash = ProjectConfig::new("someone/ripgrep");
        assert!(file.add(None, clash).is_err());
    }
}
