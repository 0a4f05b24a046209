//! Account model representing one backed-up IMAP account

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};

use super::DownloadStrategy;

/// Account settings as stored in the configuration file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountSettings {
    pub username: String,
    pub password: String,
    /// Directory holding this account's backup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<PathBuf>,
    /// Folders to back up (or to skip, with `folder_blacklist`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folders: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub folder_blacklist: bool,
    /// Remove local folders and messages that are gone from the server
    #[serde(default, skip_serializing_if = "is_false")]
    pub mirror_mode: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    /// Transport-specific connection settings, passed through untouched
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_connection_options"
    )]
    pub connection_options: Option<serde_json::Value>,
    /// Number of messages requested per fetch
    #[serde(
        default = "default_multi_fetch_size",
        skip_serializing_if = "is_one",
        deserialize_with = "deserialize_multi_fetch_size"
    )]
    pub multi_fetch_size: usize,
    /// Overrides the configuration-wide strategy
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "DownloadStrategy::deserialize_lenient"
    )]
    pub download_strategy: Option<DownloadStrategy>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub reset_seen_flags_after_fetch: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

fn is_one(value: &usize) -> bool {
    *value == 1
}

fn default_multi_fetch_size() -> usize {
    1
}

/// Interpret a configured batch size
///
/// Positive integers (or numeric strings) are used as they are; anything
/// else becomes 1.
pub fn normalize_multi_fetch_size(value: &serde_json::Value) -> usize {
    let size = match value {
        serde_json::Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.trunc() as i64)),
        serde_json::Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    match size {
        Some(n) if n > 0 => n as usize,
        _ => 1,
    }
}

fn deserialize_multi_fetch_size<'de, D>(deserializer: D) -> Result<usize, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(normalize_multi_fetch_size(&value))
}

/// Accept either a JSON object or a string containing one
fn deserialize_connection_options<'de, D>(
    deserializer: D,
) -> Result<Option<serde_json::Value>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.map(|v| match v {
        serde_json::Value::String(s) => {
            serde_json::from_str(&s).unwrap_or(serde_json::Value::String(s))
        }
        other => other,
    }))
}

impl AccountSettings {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            local_path: None,
            folders: None,
            folder_blacklist: false,
            mirror_mode: false,
            server: None,
            connection_options: None,
            multi_fetch_size: 1,
            download_strategy: None,
            reset_seen_flags_after_fetch: false,
        }
    }

    pub fn with_local_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.local_path = Some(path.into());
        self
    }

    pub fn with_folders(mut self, folders: Vec<String>) -> Self {
        self.folders = Some(folders);
        self
    }

    pub fn with_multi_fetch_size(mut self, size: usize) -> Self {
        self.multi_fetch_size = size.max(1);
        self
    }

    pub fn with_download_strategy(mut self, strategy: DownloadStrategy) -> Self {
        self.download_strategy = Some(strategy);
        self
    }
}

/// A configured account with change tracking
///
/// Edits go through [`Account::settings_mut`]; the account is modified when
/// its settings differ from the snapshot taken at load (or the last
/// [`Account::clear_changes`]).
#[derive(Debug, Clone)]
pub struct Account {
    settings: AccountSettings,
    original: Option<AccountSettings>,
    marked_for_deletion: bool,
    global_strategy: DownloadStrategy,
}

impl Account {
    /// An account as loaded from configuration (unmodified)
    pub fn new(settings: AccountSettings) -> Self {
        Self {
            original: Some(settings.clone()),
            settings,
            marked_for_deletion: false,
            global_strategy: DownloadStrategy::default(),
        }
    }

    /// A new account that has never been saved (modified)
    pub fn unsaved(settings: AccountSettings) -> Self {
        Self {
            original: None,
            ..Self::new(settings)
        }
    }

    pub fn settings(&self) -> &AccountSettings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut AccountSettings {
        &mut self.settings
    }

    pub fn username(&self) -> &str {
        &self.settings.username
    }

    pub fn password(&self) -> &str {
        &self.settings.password
    }

    pub fn mirror_mode(&self) -> bool {
        self.settings.mirror_mode
    }

    /// Backup directory, defaulting to ~/.imap-backup/<username with @ as _>
    pub fn local_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.settings.local_path {
            return Ok(path.clone());
        }
        config::config_path(&self.settings.username.replace('@', "_"))
            .context("Could not determine default backup directory")
    }

    pub fn multi_fetch_size(&self) -> usize {
        self.settings.multi_fetch_size.max(1)
    }

    /// The account's own strategy, or the configuration-wide one
    pub fn download_strategy(&self) -> DownloadStrategy {
        self.settings.download_strategy.unwrap_or(self.global_strategy)
    }

    pub(crate) fn set_global_strategy(&mut self, strategy: DownloadStrategy) {
        self.global_strategy = strategy;
    }

    /// Whether a server folder should be backed up
    pub fn wants_folder(&self, name: &str) -> bool {
        match &self.settings.folders {
            Some(folders) if !folders.is_empty() => {
                let listed = folders.iter().any(|f| f == name);
                listed != self.settings.folder_blacklist
            }
            _ => true,
        }
    }

    pub fn modified(&self) -> bool {
        self.original.as_ref() != Some(&self.settings)
    }

    pub fn clear_changes(&mut self) {
        self.original = Some(self.settings.clone());
    }

    pub fn mark_for_deletion(&mut self) {
        self.marked_for_deletion = true;
    }

    pub fn marked_for_deletion(&self) -> bool {
        self.marked_for_deletion
    }
}
