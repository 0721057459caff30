//! Configuration and data directories for mailvault tools
//!
//! Job files and other settings live in the shared config directory
//! (~/.config/mailvault/); the default store root lives under the
//! platform data directory (~/.local/share/mailvault/ on Linux).
//!
//! Call [`init`] at application startup to bootstrap the config directory.

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};

const APP_DIR: &str = "mailvault";

/// Default jobs filename inside the config directory.
pub const JOBS_FILE: &str = "jobs.json";

/// Initialize the config directory, creating it if needed.
pub fn init() -> Result<PathBuf> {
    ensure_config_dir()
}

/// The shared config directory (~/.config/mailvault/).
pub fn config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_DIR))
}

/// Path of a file inside the config directory.
pub fn config_path(filename: &str) -> Option<PathBuf> {
    config_dir().map(|dir| dir.join(filename))
}

/// Default jobs file path (~/.config/mailvault/jobs.json).
pub fn jobs_path() -> Option<PathBuf> {
    config_path(JOBS_FILE)
}

/// Default store root (~/.local/share/mailvault/store on Linux).
pub fn default_store_dir() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join(APP_DIR).join("store"))
}

/// Whether a file exists inside the config directory.
pub fn config_exists(filename: &str) -> bool {
    config_path(filename).is_some_and(|path| path.exists())
}

/// Load and parse a JSON file from an arbitrary path.
pub fn load_json_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Load and parse a JSON file from the config directory.
pub fn load_json<T: DeserializeOwned>(filename: &str) -> Result<T> {
    let path = config_path(filename).context("Could not determine config directory")?;
    load_json_file(&path)
}

/// Save a value as pretty-printed JSON inside the config directory.
pub fn save_json<T: Serialize>(filename: &str, value: &T) -> Result<()> {
    let dir = ensure_config_dir()?;
    let path = dir.join(filename);
    let content = serde_json::to_string_pretty(value)?;
    std::fs::write(&path, content)
        .with_context(|| format!("Failed to write config file: {}", path.display()))?;
    Ok(())
}

/// Ensure the config directory exists.
pub fn ensure_config_dir() -> Result<PathBuf> {
    let dir = config_dir().context("Could not determine config directory")?;
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;
    Ok(dir)
}
