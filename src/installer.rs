use std::collections::{HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use tracing::{debug, error, info, warn};
use crate::archive;
use crate::config::{Action, ActionSpec, RuleTable, Step};
use crate::state::InstalledFiles;
use crate::util::{
    expand_path, is_inside, path_depth, project_relative, resolve_in, set_executable,
    STATE_DIR_NAME,
};

/// Runs install actions for one project.
///
/// All relative paths are resolved against the project directory, which is passed
/// in rather than taken from the process working directory.
pub struct Installer<'a> {
    project: &'a str,
    directory: &'a Path,
    bin_dir: &'a Path,
    rules: &'a RuleTable,
    installed: &'a mut InstalledFiles,
}

impl<'a> Installer<'a> {
    /// `directory` must be canonical.
    pub fn new(
        project: &'a str,
        directory: &'a Path,
        bin_dir: &'a Path,
        rules: &'a RuleTable,
        installed: &'a mut InstalledFiles,
    ) -> Self {
        Self { project, directory, bin_dir, rules, installed }
    }

    /// Installs the given sources with their action specs, then keeps applying the
    /// project's install rules to every path produced until nothing new comes up.
    ///
    /// `extra` paths only go through the install rules. A path is processed at most
    /// once per call. Failing actions are logged and do not stop the others.
    pub fn install<'s>(
        &mut self,
        sources: impl IntoIterator<Item = (&'s Path, &'s ActionSpec)>,
        extra: Vec<PathBuf>,
    ) {
        let mut queue: VecDeque<PathBuf> = VecDeque::new();
        for (source, spec) in sources {
            debug!("{}: Running {spec} for {}", self.project, source.display());
            match self.run(spec, source) {
                Ok(produced) => queue.extend(produced),
                Err(e) => error!("{}: Failed to install {}: {e:#}", self.project, source.display()),
            }
        }
        queue.extend(extra);

        let rules = self.rules;
        let mut visited: HashSet<String> = HashSet::new();
        while let Some(path) = queue.pop_front() {
            let absolute = resolve_in(self.directory, &path);
            if !absolute.starts_with(self.directory) {
                continue;
            }
            let relative = project_relative(self.directory, &absolute);
            if !visited.insert(relative.clone()) {
                debug!("{}: {relative} has already been processed", self.project);
                continue;
            }
            for (pattern, spec) in rules.matching(&relative) {
                debug!("{}: Identified install rule {pattern}={spec} for {relative}", self.project);
                match self.run(spec, &absolute) {
                    Ok(produced) => queue.extend(produced),
                    Err(e) => error!(
                        "{}: Install rule {pattern} failed for {relative}: {e:#}",
                        self.project
                    ),
                }
            }
        }
    }

    /// Runs every step of `spec` on `source` and returns the paths the steps produced.
    pub fn run(&mut self, spec: &ActionSpec, source: &Path) -> Result<Vec<PathBuf>> {
        let source = resolve_in(self.directory, source);
        let mut produced = Vec::new();
        for Step { action, arg } in spec.steps()? {
            let arg = arg.as_deref();
            let new_sources = match action {
                Action::Unpack => self.unpack(&source, arg)?,
                Action::Bin => self.bin(&source, arg)?,
                Action::Link => self.link(&source, arg.unwrap_or_default())?,
                Action::Delete => self.delete(&source, arg)?,
                Action::Record => self.record(&source, arg.unwrap_or_default())?,
            };
            produced.extend(new_sources);
        }
        debug!("{}: {spec} for {} produced {produced:?}", self.project, source.display());
        Ok(produced)
    }

    fn expand(&self, arg: &str, source: &Path) -> Result<PathBuf> {
        let source_name =
            source.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        let vars = [
            ("PROJECT", self.project.to_string()),
            ("PROJECT_DIR", self.directory.to_string_lossy().into_owned()),
            ("SOURCE", source_name),
        ];
        expand_path(arg, &vars)
    }

    /// Expands `pattern` and globs it, relative to the project directory unless absolute.
    fn expand_glob(&self, pattern: &str, source: &Path) -> Result<Vec<PathBuf>> {
        let expanded = self.expand(pattern, source)?;
        let full = if expanded.is_absolute() {
            expanded.to_string_lossy().into_owned()
        } else {
            let base = glob::Pattern::escape(&self.directory.to_string_lossy());
            format!("{base}/{}", expanded.to_string_lossy())
        };
        let paths = glob::glob(&full)
            .with_context(|| format!("Invalid glob pattern {pattern}"))?
            .filter_map(|entry| match entry {
                Ok(path) => Some(path),
                Err(e) => {
                    warn!("{}: Cannot read {}: {e}", self.project, e.path().display());
                    None
                }
            })
            .filter(|path| !self.is_state_path(path))
            .collect();
        Ok(paths)
    }

    /// Whether `path` lies in the project's state directory.
    fn is_state_path(&self, path: &Path) -> bool {
        resolve_in(self.directory, path)
            .strip_prefix(self.directory)
            .is_ok_and(|relative| relative.components().any(|c| c.as_os_str() == STATE_DIR_NAME))
    }

    /// Symlinks `target` to `source`. A target ending with a separator or naming a
    /// directory gets the source's file name appended.
    pub fn link(&mut self, source: &Path, target: &str) -> Result<Vec<PathBuf>> {
        let link = self.expand(target, source)?;
        let into_dir = target.ends_with('/') || target.ends_with(std::path::MAIN_SEPARATOR);
        self.place_link(source, resolve_in(self.directory, &link), into_dir)
    }

    /// Makes `source` executable and links it as `name` (default: its file stem),
    /// relative names being placed in the bin directory.
    pub fn bin(&mut self, source: &Path, name: Option<&str>) -> Result<Vec<PathBuf>> {
        set_executable(source)?;
        let stem = source.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
        let name = name.unwrap_or(&stem);
        let expanded = self.expand(name, source)?;
        let link = if expanded.is_absolute() { expanded } else { self.bin_dir.join(expanded) };
        self.place_link(source, link, name.ends_with('/'))
    }

    fn place_link(&mut self, source: &Path, link: PathBuf, into_dir: bool) -> Result<Vec<PathBuf>> {
        let link = match source.file_name() {
            Some(name) if into_dir || link.is_dir() => link.join(name),
            _ => link,
        };
        match fs::symlink_metadata(&link) {
            Ok(meta) if meta.file_type().is_symlink() => {
                let previous = fs::read_link(&link).unwrap_or_default();
                warn!(
                    "Overwriting link {} (which pointed to {}) with {}",
                    link.display(),
                    previous.display(),
                    source.display()
                );
                fs::remove_file(&link)
                    .with_context(|| format!("Could not remove {}", link.display()))?;
            }
            Ok(_) => {
                error!(
                    "{}: Refusing to overwrite {} with {}",
                    self.project,
                    link.display(),
                    source.display()
                );
                return Ok(Vec::new());
            }
            Err(_) => {}
        }
        if let Some(parent) = link.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Could not create directory {}", parent.display()))?;
        }
        create_symlink(source, &link)?;
        self.installed.register(self.directory, [&link]);
        info!("Linked {} from {}", source.display(), link.display());
        Ok(vec![link])
    }

    /// Unpacks the archive `source` into `target` (default: next to the source).
    pub fn unpack(&mut self, source: &Path, target: Option<&str>) -> Result<Vec<PathBuf>> {
        let Some(kind) = archive::detect(source)? else {
            error!(
                "{}: {} could not be identified as an archive, not unpacked",
                self.project,
                source.display()
            );
            return Ok(Vec::new());
        };
        let target = match target {
            Some(target) => resolve_in(self.directory, &self.expand(target, source)?),
            None => source.parent().unwrap_or(self.directory).to_path_buf(),
        };
        let members = archive::extract(source, kind, &target)?;
        self.installed.register(self.directory, &members);
        Ok(members)
    }

    /// Deletes the files matching `pattern`, or `source` itself.
    ///
    /// Only files inside the project directory or registered as installed are touched;
    /// deeper paths go first so that directories are empty when their turn comes.
    pub fn delete(&mut self, source: &Path, pattern: Option<&str>) -> Result<Vec<PathBuf>> {
        let candidates = match pattern {
            Some(pattern) => self.expand_glob(pattern, source)?,
            None => vec![source.to_path_buf()],
        };
        let mut safe: Vec<PathBuf> = candidates
            .into_iter()
            .filter(|candidate| !self.is_state_path(candidate))
            .filter(|candidate| {
                let allowed = is_inside(self.directory, candidate)
                    || self.installed.contains(self.directory, candidate);
                if !allowed {
                    warn!(
                        "{}: Not deleting {}, it does not belong to the project",
                        self.project,
                        candidate.display()
                    );
                }
                allowed
            })
            .collect();
        safe.sort_by_key(|path| std::cmp::Reverse(path_depth(path)));

        let mut deleted = Vec::new();
        for candidate in safe {
            let result = match fs::symlink_metadata(&candidate) {
                Ok(meta) if meta.is_dir() => fs::remove_dir(&candidate),
                Ok(_) => fs::remove_file(&candidate),
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => {
                    self.installed.unregister(self.directory, [&candidate]);
                    deleted.push(candidate);
                }
                Err(e) => warn!("{}: Cannot delete {}: {e}", self.project, candidate.display()),
            }
        }
        let names: Vec<String> = deleted.iter().map(|p| p.display().to_string()).collect();
        info!("{}: Deleted {} files: {}", self.project, deleted.len(), names.join(", "));
        Ok(Vec::new())
    }

    /// Registers the files matching `pattern` as installed without touching them.
    pub fn record(&mut self, source: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
        let files = self.expand_glob(pattern, source)?;
        debug!("{}: Recording {} files for {pattern}", self.project, files.len());
        self.installed.register(self.directory, &files);
        Ok(Vec::new())
    }
}

#[cfg(unix)]
fn create_symlink(target: &Path, link: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, link)
        .with_context(|| format!("Could not link {} to {}", link.display(), target.display()))
}

#[cfg(windows)]
fn create_symlink(target: &Path, link: &Path) -> Result<()> {
    std::os::windows::fs::symlink_file(target, link)
        .with_context(|| format!("Could not link {} to {}", link.display(), target.display()))
}
