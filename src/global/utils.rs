use std::path::PathBuf;
use anyhow::{anyhow, Result};
use directories::ProjectDirs;

/// Overrides the configuration directory (settings.toml, projects.toml).
pub const CONFIG_DIR_ENV: &str = "GETREL_CONFIG_DIR";
/// Overrides the data directory that holds the project directories.
pub const DATA_DIR_ENV: &str = "GETREL_DATA_DIR";

pub fn get_global_config_dir() -> Result<PathBuf> {
    if let Some(dir) = std::env::var_os(CONFIG_DIR_ENV) {
        return Ok(PathBuf::from(dir));
    }
    let (config_dir, _) = get_global_dirs()?;
    Ok(config_dir)
}

pub fn get_global_data_dir() -> Result<PathBuf> {
    if let Some(dir) = std::env::var_os(DATA_DIR_ENV) {
        return Ok(PathBuf::from(dir));
    }
    let (_, data_dir) = get_global_dirs()?;
    Ok(data_dir)
}

pub fn get_settings_file() -> Result<PathBuf> {
    Ok(get_global_config_dir()?.join("settings.toml"))
}

pub fn get_projects_file() -> Result<PathBuf> {
    Ok(get_global_config_dir()?.join("projects.toml"))
}

pub fn get_global_dirs() -> Result<(PathBuf, PathBuf)> {
    let proj_dirs = ProjectDirs::from("", "", "getrel")
        .ok_or_else(|| anyhow!("Could not get project directories"))?;

    let config_dir = proj_dirs.config_dir().to_path_buf();
    let data_dir = proj_dirs.data_dir().to_path_buf();

    Ok((config_dir, data_dir))
}
