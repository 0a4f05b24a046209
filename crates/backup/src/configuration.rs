//! The configuration file: global download strategy plus account list
//!
//! The file holds credentials, so it is checked against owner-only
//! permissions before it is read and restricted again whenever it is saved.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::models::{Account, AccountSettings, DownloadStrategy};

/// Version written to new configuration files
pub const VERSION: &str = "2.1";

#[derive(Debug, Deserialize)]
struct ConfigurationFile {
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    download_strategy: serde_json::Value,
    #[serde(default)]
    accounts: Vec<AccountSettings>,
}

#[derive(Debug, Serialize)]
struct ConfigurationFileRef<'a> {
    version: &'a str,
    download_strategy: DownloadStrategy,
    accounts: Vec<&'a AccountSettings>,
}

/// Loaded configuration with change tracking
#[derive(Debug)]
pub struct Configuration {
    path: PathBuf,
    version: String,
    download_strategy: DownloadStrategy,
    original_strategy: DownloadStrategy,
    accounts: Vec<Account>,
}

impl Configuration {
    /// Load from `path`
    ///
    /// A missing file gives an empty configuration. An existing file must
    /// not be readable by group or others.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.exists() {
            return Ok(Self::empty(path));
        }

        let file: ConfigurationFile = config::load_private_json_file(&path)?;
        let download_strategy = DownloadStrategy::from_config_value(&file.download_strategy);
        let accounts = file
            .accounts
            .into_iter()
            .map(|settings| {
                let mut account = Account::new(settings);
                account.set_global_strategy(download_strategy);
                account
            })
            .collect();

        Ok(Self {
            path,
            version: file.version.unwrap_or_else(|| VERSION.to_string()),
            download_strategy,
            original_strategy: download_strategy,
            accounts,
        })
    }

    /// Load ~/.imap-backup/config.json
    pub fn load_default() -> Result<Self> {
        let path =
            config::default_config_path().context("Could not determine config directory")?;
        Self::load(path)
    }

    fn empty(path: PathBuf) -> Self {
        Self {
            path,
            version: VERSION.to_string(),
            download_strategy: DownloadStrategy::default(),
            original_strategy: DownloadStrategy::default(),
            accounts: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn accounts(&self) -> &[Account] {
        &self.accounts
    }

    pub fn accounts_mut(&mut self) -> &mut [Account] {
        &mut self.accounts
    }

    pub fn account(&self, username: &str) -> Option<&Account> {
        self.accounts.iter().find(|a| a.username() == username)
    }

    pub fn account_mut(&mut self, username: &str) -> Option<&mut Account> {
        self.accounts.iter_mut().find(|a| a.username() == username)
    }

    /// Add a new, not yet saved account
    pub fn add_account(&mut self, settings: AccountSettings) -> &mut Account {
        let mut account = Account::unsaved(settings);
        account.set_global_strategy(self.download_strategy);
        self.accounts.push(account);
        let last = self.accounts.len() - 1;
        &mut self.accounts[last]
    }

    pub fn download_strategy(&self) -> DownloadStrategy {
        self.download_strategy
    }

    pub fn set_download_strategy(&mut self, strategy: DownloadStrategy) {
        self.download_strategy = strategy;
        for account in &mut self.accounts {
            account.set_global_strategy(strategy);
        }
    }

    pub fn modified(&self) -> bool {
        self.download_strategy != self.original_strategy
            || self
                .accounts
                .iter()
                .any(|a| a.modified() || a.marked_for_deletion())
    }

    /// Write the file, dropping accounts marked for deletion
    pub fn save(&mut self) -> Result<()> {
        self.accounts.retain(|a| !a.marked_for_deletion());
        self.version = VERSION.to_string();

        let file = ConfigurationFileRef {
            version: &self.version,
            download_strategy: self.download_strategy,
            accounts: self.accounts.iter().map(|a| a.settings()).collect(),
        };
        config::save_private_json_file(&self.path, &file)
            .with_context(|| format!("Failed to save configuration {}", self.path.display()))?;

        for account in &mut self.accounts {
            account.clear_changes();
        }
        self.original_strategy = self.download_strategy;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn write_config(path: &Path, value: serde_json::Value) {
        std::fs::write(path, serde_json::to_string(&value).unwrap()).unwrap();
        config::make_private_file(path).unwrap();
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let config = Configuration::load(dir.path().join("config.json")).unwrap();
        assert!(config.accounts().is_empty());
        assert_eq!(config.version(), VERSION);
        assert_eq!(config.download_strategy(), DownloadStrategy::DelayMetadata);
        assert!(!config.modified());
    }

    #[test]
    fn test_load_accounts_and_strategy() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        write_config(
            &path,
            json!({
                "version": "2.0",
                "download_strategy": "delay_all",
                "accounts": [
                    {"username": "a@example.com", "password": "1"},
                    {"username": "b@example.com", "password": "2", "download_strategy": "direct"}
                ]
            }),
        );

        let config = Configuration::load(&path).unwrap();
        assert_eq!(config.version(), "2.0");
        assert_eq!(config.accounts().len(), 2);
        assert_eq!(
            config.account("a@example.com").unwrap().download_strategy(),
            DownloadStrategy::DelayAll
        );
        assert_eq!(
            config.account("b@example.com").unwrap().download_strategy(),
            DownloadStrategy::Direct
        );
        assert!(!config.modified());
    }

    #[test]
    fn test_legacy_strategy_values_normalize() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        for value in [json!(true), json!("unknown"), json!(null)] {
            write_config(&path, json!({"download_strategy": value, "accounts": []}));
            let config = Configuration::load(&path).unwrap();
            assert_eq!(config.download_strategy(), DownloadStrategy::DelayMetadata);
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_load_rejects_open_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        write_config(&path, json!({"accounts": []}));
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        let err = Configuration::load(&path).unwrap_err();
        let permission = err.downcast_ref::<config::PermissionError>().unwrap();
        assert_eq!(permission.actual, 0o644);
        assert!(err.to_string().contains("0600"));
    }

    #[test]
    fn test_modified_tracking() {
        let dir = tempdir().unwrap();
        let mut config = Configuration::load(dir.path().join("config.json")).unwrap();

        config.set_download_strategy(DownloadStrategy::Direct);
        assert!(config.modified());
        config.set_download_strategy(DownloadStrategy::DelayMetadata);
        assert!(!config.modified());

        config.add_account(AccountSettings::new("user", "pwd"));
        assert!(config.modified());
    }

    #[test]
    fn test_save_round_trip_and_clears_changes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let mut config = Configuration::load(&path).unwrap();
        config.set_download_strategy(DownloadStrategy::DelayAll);
        config
            .add_account(AccountSettings::new("keep", "1"))
            .settings_mut()
            .multi_fetch_size = 4;
        config.add_account(AccountSettings::new("drop", "2"));
        config.account_mut("drop").unwrap().mark_for_deletion();

        config.save().unwrap();
        assert!(!config.modified());
        assert_eq!(config.accounts().len(), 1);

        let reloaded = Configuration::load(&path).unwrap();
        assert_eq!(reloaded.download_strategy(), DownloadStrategy::DelayAll);
        assert_eq!(reloaded.accounts().len(), 1);
        let account = reloaded.account("keep").unwrap();
        assert_eq!(account.multi_fetch_size(), 4);
        assert_eq!(account.download_strategy(), DownloadStrategy::DelayAll);
    }

    #[cfg(unix)]
    #[test]
    fn test_save_sets_private_modes() {
        let dir = tempdir().unwrap();
        let config_dir = dir.path().join("conf");
        let path = config_dir.join("config.json");
        let mut config = Configuration::load(&path).unwrap();
        config.add_account(AccountSettings::new("user", "pwd"));
        config.save().unwrap();

        assert_eq!(config::file_mode(&path).unwrap(), Some(0o600));
        assert_eq!(config::file_mode(&config_dir).unwrap(), Some(0o700));
    }
}
