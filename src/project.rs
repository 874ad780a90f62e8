//! The lifecycle of one configured project: refresh release metadata, download the
//! configured assets, install them and uninstall exactly what was installed.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use anyhow::{bail, Context, Result};
use chrono::Utc;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;
use crate::config::{parse_github_url, ActionSpec, ProjectConfig, RELEASE_LATEST};
use crate::fetch::{
    FetchCache, FetchOutcome, FetchTarget, Fetcher, ACCEPT_GITHUB_JSON, ACCEPT_OCTET_STREAM,
};
use crate::global::settings::Layout;
use crate::installer::Installer;
use crate::pattern::identifying_pattern;
use crate::release::{self, Asset, AssetDescriptor, Release};
use crate::script::run_script;
use crate::state::{load_json_or_default, save_json, InstalledRelease, ProjectState};
use crate::util::{ensure_state_dir, path_depth, project_relative, resolve_in, STATE_DIR_NAME};

pub const STATE_FILE: &str = "state.json";
pub const RELEASES_FILE: &str = "releases.json";
pub const ASSETS_FILE: &str = "assets.json";

pub struct Project {
    pub name: String,
    pub config: ProjectConfig,
    pub user: String,
    pub repo: String,
    directory: PathBuf,
    layout: Layout,
    fetcher: Fetcher,
    pub state: ProjectState,
    release_cache: FetchCache,
    asset_cache: BTreeMap<String, FetchCache>,
}

impl Project {
    /// Opens a project, validating its configuration and creating its directory.
    ///
    /// # Errors
    /// [`crate::error::ConfigError`] for invalid configurations, I/O errors for the directory.
    pub fn open(
        name: &str,
        config: ProjectConfig,
        layout: &Layout,
        fetcher: Fetcher,
    ) -> Result<Self> {
        config.validate().with_context(|| format!("Invalid configuration for project {name}"))?;
        let (user, repo) = parse_github_url(&config.url)?;
        let directory = layout.project_directory(name);
        fs::create_dir_all(&directory)
            .with_context(|| {
                format!("Could not create project directory {}", directory.display())
            })?;
        let directory = directory.canonicalize()?;
        let state_dir = ensure_state_dir(&directory)?;

        Ok(Self {
            name: name.to_string(),
            config,
            user,
            repo,
            state: load_json_or_default(state_dir.join(STATE_FILE)),
            release_cache: load_json_or_default(state_dir.join(RELEASES_FILE)),
            asset_cache: load_json_or_default(state_dir.join(ASSETS_FILE)),
            directory,
            layout: layout.clone(),
            fetcher,
        })
    }

    /// The canonical project directory.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn state_dir(&self) -> PathBuf {
        self.directory.join(STATE_DIR_NAME)
    }

    /// Persists state, release cache and asset cache.
    pub fn save(&self) -> Result<()> {
        let state_dir = self.state_dir();
        save_json(&self.state, state_dir.join(STATE_FILE))?;
        save_json(&self.release_cache, state_dir.join(RELEASES_FILE))?;
        save_json(&self.asset_cache, state_dir.join(ASSETS_FILE))
    }

    fn needs_update(&self) -> bool {
        self.state.updated.is_none()
    }

    pub fn update_url(&self) -> String {
        let url = format!("{}/repos/{}/{}/releases", self.layout.api_url, self.user, self.repo);
        if self.config.release == RELEASE_LATEST {
            url + "/latest"
        } else {
            url
        }
    }

    /// Refreshes the release metadata if the server has something new.
    ///
    /// Returns `true` if the selected release differs from the installed one.
    pub fn update(&mut self) -> Result<bool> {
        let result = self.refresh_releases();
        self.state.updated = Some(Utc::now());
        self.save()?;
        result
    }

    fn refresh_releases(&mut self) -> Result<bool> {
        let url = self.update_url();
        let outcome = self
            .fetcher
            .fetch_if_newer(
                &url,
                &mut self.release_cache,
                FetchTarget::Data,
                Some(ACCEPT_GITHUB_JSON),
            )
            .with_context(|| format!("Updating {} failed", self.name))?;
        if outcome == FetchOutcome::NotModified {
            debug!("{}: Releases not updated", self.name);
            return Ok(false);
        }

        match self.select_release()? {
            Some(release) => {
                let installed = self.state.installed.as_ref().map(|i| i.version.as_str());
                let is_new = installed != Some(release.version.as_str());
                if is_new {
                    info!("{}: New release {release} available", self.name);
                }
                self.state.candidate = Some(release.version);
                Ok(is_new)
            }
            None => {
                warn!("{}: No release matching {} found", self.name, self.config.release);
                self.state.candidate = None;
                Ok(false)
            }
        }
    }

    /// Cached releases, newest first.
    pub fn releases(&self) -> Result<Vec<Release>> {
        release::releases_from_data(self.release_cache.data.as_ref())
    }

    /// The cached release the configured rule picks, if any.
    pub fn select_release(&self) -> Result<Option<Release>> {
        let releases = self.releases()?;
        Ok(release::select_release(&self.config.release, &releases).cloned())
    }

    /// The configured assets of the selected release.
    pub fn get_assets(&self) -> Result<Vec<Asset>> {
        match self.select_release()? {
            Some(release) => {
                release::match_assets(&self.name, &self.directory, &release, &self.config.assets)
            }
            None => Ok(Vec::new()),
        }
    }

    /// Every asset of the selected release, bound to its rule if one matches.
    pub fn all_assets(&self) -> Result<Vec<(AssetDescriptor, Option<Asset>)>> {
        match self.select_release()? {
            Some(release) => release::all_assets(&self.directory, &release, &self.config.assets),
            None => Ok(Vec::new()),
        }
    }

    /// Whether the cached download of `asset` is missing or from another release.
    pub fn needs_download(&self, asset: &Asset) -> bool {
        asset.needs_download(self.asset_cache.get(&asset.descriptor.url))
    }

    /// Downloads all configured assets that changed. Returns `true` if any did.
    ///
    /// A failing asset is logged and does not keep the others from downloading.
    pub fn download(&mut self) -> Result<bool> {
        if self.needs_update() {
            self.update()?;
        }
        let mut changed = false;
        for asset in self.get_assets()? {
            match self.download_asset(&asset) {
                Ok(updated) => changed |= updated,
                Err(e) => {
                    error!("Failed to download {} for {}: {e:#}", asset.descriptor.name, self.name)
                }
            }
        }
        self.save()?;
        Ok(changed)
    }

    fn download_asset(&mut self, asset: &Asset) -> Result<bool> {
        let cache = self.asset_cache.entry(asset.descriptor.url.clone()).or_default();
        let outcome = self.fetcher.fetch_if_newer(
            &asset.descriptor.url,
            cache,
            FetchTarget::File(&asset.source),
            Some(ACCEPT_OCTET_STREAM),
        )?;
        if outcome == FetchOutcome::NotModified {
            return Ok(false);
        }
        cache.release = Some(asset.release.clone());
        self.state.installed_files.register(&self.directory, [&asset.source]);
        info!("{}: Downloaded {asset}", self.name);
        Ok(true)
    }

    /// Downloads and installs the selected release.
    ///
    /// Actions only run if an asset changed, if nothing has been installed yet or if
    /// `force` is set. The post-install script runs after the actions.
    pub fn install(&mut self, force: bool) -> Result<()> {
        if self.needs_update() {
            self.update()?;
        }
        let changed = self.download()?;
        let Some(release) = self.select_release()? else {
            bail!(
                "No release matching {} found for project {}. Maybe run `getrel add` again",
                self.config.release,
                self.name
            );
        };

        if changed || force || self.state.installed.is_none() {
            let assets = self.get_assets()?;
            if assets.is_empty() {
                warn!(
                    "Project {} has no assets to install. Maybe rerun `getrel add {}`",
                    self.name,
                    self.config.url
                );
            }
            let sources: Vec<(&Path, &ActionSpec)> =
                assets.iter().map(|asset| (asset.source.as_path(), &asset.spec)).collect();
            let mut installer = Installer::new(
                &self.name,
                &self.directory,
                &self.layout.bin_dir,
                &self.config.install,
                &mut self.state.installed_files,
            );
            installer.install(sources, Vec::new());

            if let Some(script) = &self.config.postinstall {
                debug!("Running postinstall script for {}:\n{script}", self.name);
                let outcome = run_script(script, &self.directory, &self.name, true)?;
                if !outcome.status.success() {
                    warn!("{}: postinstall script exited with {}", self.name, outcome.status);
                }
                self.state.installed_files.register(&self.directory, &outcome.new_files);
            }
            info!("{}: Installed {release}", self.name);
        } else {
            info!("{}: {release} is already installed", self.name);
        }

        self.state.installed = Some(InstalledRelease::from(&release));
        self.save()
    }

    /// Registered files plus unregistered files found in the project directory.
    pub fn get_installed(&self) -> Result<Vec<ProjectFile>> {
        let assets = self.get_assets().unwrap_or_else(|e| {
            debug!("{}: Cannot determine assets: {e:#}", self.name);
            Vec::new()
        });
        let registered: HashSet<&str> =
            self.state.installed_files.list().iter().map(String::as_str).collect();

        let mut files: Vec<ProjectFile> = self
            .state
            .installed_files
            .list()
            .iter()
            .map(|entry| self.project_file(Path::new(entry), &assets, false))
            .collect();

        let unregistered = WalkDir::new(&self.directory)
            .min_depth(1)
            .into_iter()
            .filter_entry(|entry| entry.file_name() != STATE_DIR_NAME)
            .filter_map(|entry| entry.ok())
            .filter(|entry| !entry.file_type().is_dir())
            .map(|entry| entry.into_path())
            .filter(|path| !registered.contains(project_relative(&self.directory, path).as_str()))
            .collect::<BTreeSet<_>>();
        files.extend(unregistered.iter().map(|path| self.project_file(path, &assets, true)));
        Ok(files)
    }

    fn project_file(&self, path: &Path, assets: &[Asset], unregistered: bool) -> ProjectFile {
        let path = resolve_in(&self.directory, path);
        let relative = project_relative(&self.directory, &path);
        let external = !path.starts_with(&self.directory);
        let asset = assets.iter().find(|asset| asset.source == path).cloned();
        let install_spec = match &asset {
            Some(asset) => Some(asset.spec.clone()),
            None if !external => {
                self.config.install.first_match(&relative).map(|(_, spec)| spec.clone())
            }
            None => None,
        };
        let boring = !(external || unregistered || asset.is_some() || install_spec.is_some());
        ProjectFile { path, relative, external, asset, install_spec, unregistered, boring }
    }

    /// Removes every installed file (and unregistered files in the project directory),
    /// then the directories that became empty.
    ///
    /// Missing files are skipped with a warning, so uninstalling twice is harmless.
    pub fn uninstall(&mut self, keep_assets: bool) -> Result<()> {
        let mut files = self.get_installed()?;
        files.sort_by_key(|file| Reverse(path_depth(&file.path)));

        let mut count = 0;
        let mut parents: BTreeSet<PathBuf> = BTreeSet::new();
        for file in &files {
            if keep_assets && file.asset.is_some() {
                continue;
            }
            parents.extend(
                file.path
                    .ancestors()
                    .skip(1)
                    .take_while(|parent| {
                        *parent != self.directory && parent.starts_with(&self.directory)
                    })
                    .map(Path::to_path_buf),
            );
            let removed = match fs::symlink_metadata(&file.path) {
                Ok(meta) if meta.is_dir() => fs::remove_dir(&file.path).map(|_| true),
                Ok(_) => fs::remove_file(&file.path).map(|_| true),
                Err(_) => {
                    warn!(
                        "{file} (belonging to {}) does not exist, so uninstalling it is a no-op",
                        self.name
                    );
                    Ok(false)
                }
            };
            match removed {
                Ok(removed) => {
                    if removed {
                        count += 1;
                        debug!("Uninstalled {file}");
                    }
                    self.state.installed_files.unregister(&self.directory, [&file.path]);
                }
                Err(e) => error!("Unable to delete {file} ({e}) while uninstalling {}", self.name),
            }
        }

        let mut parents: Vec<PathBuf> = parents.into_iter().collect();
        parents.sort_by_key(|parent| Reverse(path_depth(parent)));
        for parent in parents.iter().filter(|parent| parent.exists()) {
            match fs::remove_dir(parent) {
                Ok(()) => count += 1,
                Err(_) => info!("Keeping non-empty directory {}", parent.display()),
            }
        }

        self.state.installed = None;
        self.save()?;
        info!(
            "Removed {count} files and directories of project {}, {} assets",
            self.name,
            if keep_assets { "keeping" } else { "including" }
        );
        Ok(())
    }

    /// A release rule that selects `tag` among the cached releases, or the literal tag.
    pub fn suggest_release_pattern(&self, tag: &str) -> Result<String> {
        let tags: Vec<String> =
            self.releases()?.into_iter().map(|release| release.version).collect();
        Ok(identifying_pattern(tag, &tags, None).unwrap_or_else(|e| {
            debug!("{e}");
            glob::Pattern::escape(tag)
        }))
    }

    /// An asset rule that selects `asset_name` among the assets of the selected release,
    /// ignoring the version, or the literal name.
    pub fn suggest_asset_pattern(&self, asset_name: &str) -> Result<String> {
        let Some(release) = self.select_release()? else {
            return Ok(glob::Pattern::escape(asset_name));
        };
        let names: Vec<String> = release.assets()?.into_iter().map(|asset| asset.name).collect();
        Ok(identifying_pattern(asset_name, &names, Some(&release.version)).unwrap_or_else(|e| {
            debug!("{e}");
            glob::Pattern::escape(asset_name)
        }))
    }
}

impl fmt::Display for Project {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// A file belonging to a project, classified for display.
#[derive(Debug, Clone)]
pub struct ProjectFile {
    pub path: PathBuf,
    /// Relative to the project directory, absolute if external.
    pub relative: String,
    pub external: bool,
    /// The configured asset this file was downloaded as.
    pub asset: Option<Asset>,
    /// The asset's spec or the first matching install rule.
    pub install_spec: Option<ActionSpec>,
    /// Found in the project directory but not in the registry.
    pub unregistered: bool,
    pub boring: bool,
}

impl fmt::Display for ProjectFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.relative)
    }
}
