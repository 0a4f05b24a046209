//! Configuration file handling for imap-backup
//!
//! Provides utilities for locating the shared config directory
//! (~/.imap-backup/), reading and writing JSON files there, and checking
//! that sensitive files are not readable by other users.

pub mod permissions;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};

pub use permissions::{
    PRIVATE_DIR_MODE, PRIVATE_FILE_MODE, PermissionError, check_permissions, file_mode,
    make_private_dir, make_private_file,
};

/// Name of the config directory inside the user's home
const CONFIG_DIR_NAME: &str = ".imap-backup";

/// Default configuration filename
pub const CONFIG_FILE: &str = "config.json";

/// Get the config directory (~/.imap-backup/)
pub fn config_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|p| p.join(CONFIG_DIR_NAME))
}

/// Get the path to a file within the config directory
pub fn config_path(filename: &str) -> Option<PathBuf> {
    config_dir().map(|p| p.join(filename))
}

/// Default path of the main configuration file
pub fn default_config_path() -> Option<PathBuf> {
    config_path(CONFIG_FILE)
}

/// Load and parse a JSON file from an arbitrary path
pub fn load_json_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Load a sensitive JSON file after checking it is private to its owner
pub fn load_private_json_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    check_permissions(path, PRIVATE_FILE_MODE)?;
    load_json_file(path)
}

/// Save a value as pretty JSON, restricting the file and its directory to the owner
pub fn save_private_json_file<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;
        make_private_dir(dir)?;
    }

    let content = serde_json::to_string_pretty(value)?;
    std::fs::write(path, content)
        .with_context(|| format!("Failed to write config file: {}", path.display()))?;
    make_private_file(path)
}
