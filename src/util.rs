use std::path::{Component, Path, PathBuf};
use anyhow::{Context, Result};
use directories::BaseDirs;
use regex::{Captures, Regex};
use tracing::warn;

/// Name of the per-project directory that holds `state.json`, `releases.json` and `assets.json`.
pub const STATE_DIR_NAME: &str = ".getrel";

/// Ensures the state directory exists under the given project directory.
///
/// Returns the full path to the state directory.
pub fn ensure_state_dir<P: AsRef<Path>>(project_dir: P) -> Result<PathBuf> {
    let path = project_dir.as_ref().join(STATE_DIR_NAME);
    std::fs::create_dir_all(&path)
        .with_context(|| format!("Could not create state directory {}", path.display()))?;
    Ok(path)
}

/// Returns the user's home directory, if it can be determined.
pub fn home_dir() -> Option<PathBuf> {
    BaseDirs::new().map(|dirs| dirs.home_dir().to_path_buf())
}

/// Expands a leading `~` and `$VAR` / `${VAR}` references.
///
/// Variables are looked up in `vars` first, then in the process environment.
/// References that cannot be resolved are left untouched.
pub fn expand_path(input: &str, vars: &[(&str, String)]) -> Result<PathBuf> {
    let tilde_expanded = match home_dir() {
        Some(home) if input == "~" => home.to_string_lossy().into_owned(),
        Some(home) if input.starts_with("~/") || input.starts_with("~\\") => {
            format!("{}{}", home.to_string_lossy(), &input[1..])
        }
        _ => input.to_string(),
    };

    let re = Regex::new(r"\$(?:\{([^}]+)\}|(\w+))")?;
    let expanded = re.replace_all(&tilde_expanded, |caps: &Captures| {
        let name = caps.get(1).or_else(|| caps.get(2)).map(|m| m.as_str()).unwrap_or("");
        vars.iter()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value.clone())
            .or_else(|| std::env::var(name).ok())
            .unwrap_or_else(|| caps[0].to_string())
    });
    Ok(PathBuf::from(expanded.into_owned()))
}

/// Removes `.` components and folds `..` into its parent without touching the filesystem.
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut result = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !result.pop() {
                    result.push(component);
                }
            }
            other => result.push(other),
        }
    }
    result
}

/// Returns an absolute path for `path`, resolving relative paths against `directory`.
///
/// Symlinks in the parent directories are resolved, the final component is kept
/// as is so that a symlink we created is never replaced by its target.
pub fn resolve_in(directory: &Path, path: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        directory.join(path)
    };
    let normalized = normalize_lexically(&joined);
    match (normalized.parent(), normalized.file_name()) {
        (Some(parent), Some(name)) => match parent.canonicalize() {
            Ok(parent) => parent.join(name),
            Err(_) => normalized,
        },
        _ => normalized,
    }
}

/// Checks whether `path` (after resolution) lives inside `directory`.
pub fn is_inside(directory: &Path, path: &Path) -> bool {
    resolve_in(directory, path).starts_with(directory)
}

/// Renders `path` relative to `directory`, or as an absolute path if it is outside.
///
/// `directory` is expected to be canonical.
pub fn project_relative(directory: &Path, path: &Path) -> String {
    let resolved = resolve_in(directory, path);
    match resolved.strip_prefix(directory) {
        Ok(rel) if rel.as_os_str().is_empty() => ".".to_string(),
        Ok(rel) => rel.to_string_lossy().into_owned(),
        Err(_) => resolved.to_string_lossy().into_owned(),
    }
}

/// Number of components of a path, used to process deeper paths first.
pub fn path_depth(path: &Path) -> usize {
    path.components().count()
}

/// Shell-style glob match (`*` also matches path separators).
///
/// Invalid patterns never match.
pub fn glob_matches(pattern: &str, candidate: &str) -> bool {
    match glob::Pattern::new(pattern) {
        Ok(pattern) => pattern.matches(candidate),
        Err(e) => {
            warn!("Ignoring invalid glob pattern {pattern:?}: {e}");
            false
        }
    }
}

/// Marks a file as executable (mode `0755`) on Unix.
#[cfg(unix)]
pub fn set_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .with_context(|| format!("Could not make {} executable", path.display()))
}
/// No executable bit on Windows; the extension decides.
#[cfg(windows)]
pub fn set_executable(_path: &Path) -> Result<()> {
    Ok(())
}
/// Checks if a given path is an executable file on Unix.
#[cfg(unix)]
pub fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}
/// Checks if a given path has a Windows executable extension (.exe, .bat, .cmd).
#[cfg(windows)]
pub fn is_executable(path: &Path) -> bool {
    if let Some(ext) = path.extension().and_then(|ext| ext.to_str()) {
        let ext = ext.to_ascii_lowercase();
        matches!(ext.as_str(), "exe" | "bat" | "cmd")
    } else {
        false
    }
}

/// Formats a byte count for humans, e.g. `1.5 MB`.
pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["kB", "MB", "GB", "TB", "PB"];
    if bytes < 1000 {
        return format!("{bytes} Bytes");
    }
    let mut size = bytes as f64;
    let mut unit = "Bytes";
    for next in UNITS {
        if size < 1000.0 {
            break;
        }
        size /= 1000.0;
        unit = next;
    }
    format!("{size:.1} {unit}")
}
