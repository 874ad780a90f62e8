use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Output, Stdio};
use anyhow::{Context, Result};
use tracing::{debug, error, info};
use walkdir::WalkDir;
use crate::util::{resolve_in, STATE_DIR_NAME};

/// Result of a post-install script run.
#[derive(Debug)]
pub struct ScriptOutcome {
    pub status: ExitStatus,
    /// Files that appeared in the project directory, plus existing paths printed
    /// on stdout if output was captured.
    pub new_files: Vec<PathBuf>,
}

/// Runs `script` in `directory` with `PROJECT` and `PROJECT_DIR` set.
///
/// A script starting with `#!` is written to an executable temporary file and run
/// directly, anything else goes through the shell. With `capture`, each non-empty
/// stdout line naming an existing file is reported as new, and stderr is logged.
pub fn run_script(
    script: &str,
    directory: &Path,
    project: &str,
    capture: bool,
) -> Result<ScriptOutcome> {
    let before = snapshot(directory);

    let output = if script.starts_with("#!") {
        let mut file = tempfile::NamedTempFile::new().context("Could not create script file")?;
        file.write_all(script.as_bytes())?;
        let path = file.into_temp_path();
        make_private_executable(&path)?;
        let mut command = Command::new(path.as_os_str());
        execute(&mut command, directory, project, capture)?
    } else {
        execute(&mut shell_command(script), directory, project, capture)?
    };

    let after = snapshot(directory);
    let mut new_files: Vec<PathBuf> = after.difference(&before).cloned().collect();

    if capture {
        let stdout = String::from_utf8_lossy(&output.stdout);
        for line in stdout.lines().map(str::trim).filter(|line| !line.is_empty()) {
            let path = resolve_in(directory, Path::new(line));
            if path.exists() && !new_files.contains(&path) {
                new_files.push(path);
            }
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim_end();
        if !stderr.is_empty() {
            if output.status.success() {
                info!("{project}: {stderr}");
            } else {
                error!("{project}: {stderr}");
            }
        }
    }
    debug!("{project}: Script exited with {}, new files: {new_files:?}", output.status);
    Ok(ScriptOutcome { status: output.status, new_files })
}

fn execute(
    command: &mut Command,
    directory: &Path,
    project: &str,
    capture: bool,
) -> Result<Output> {
    command
        .current_dir(directory)
        .env("PROJECT", project)
        .env("PROJECT_DIR", directory);
    if capture {
        command.stdin(Stdio::null()).output().context("Could not run script")
    } else {
        let status = command.status().context("Could not run script")?;
        Ok(Output { status, stdout: Vec::new(), stderr: Vec::new() })
    }
}

#[cfg(unix)]
fn shell_command(script: &str) -> Command {
    let mut command = Command::new("sh");
    command.arg("-c").arg(script);
    command
}

#[cfg(windows)]
fn shell_command(script: &str) -> Command {
    let mut command = Command::new("cmd");
    command.arg("/C").arg(script);
    command
}

#[cfg(unix)]
fn make_private_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
        .with_context(|| format!("Could not make {} executable", path.display()))
}

#[cfg(windows)]
fn make_private_executable(_path: &Path) -> Result<()> {
    Ok(())
}

/// All paths below `directory`, except the state directory.
fn snapshot(directory: &Path) -> BTreeSet<PathBuf> {
    WalkDir::new(directory)
        .min_depth(1)
        .into_iter()
        .filter_entry(|entry| entry.file_name() != STATE_DIR_NAME)
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.into_path())
        .collect()
}
