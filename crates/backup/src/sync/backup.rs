//! Back up every wanted folder of an account

use std::collections::HashSet;

use anyhow::{Context, Result};
use rayon::prelude::*;

use super::downloader::Downloader;
use super::mirror::MIRROR_EXTENSION;
use crate::folder_mapper::serialized_folders;
use crate::logging::Logger;
use crate::models::Account;
use crate::remote::RemoteAccount;
use crate::storage::{Serializer, check_folder_name, with_suffix};

/// Statistics from a backup run
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BackupStats {
    /// Folders that were downloaded
    pub folders: usize,
    /// Messages added to local stores
    pub downloaded: usize,
    /// Malformed fetch entries that were skipped
    pub skipped: usize,
    /// UIDs that could not be fetched
    pub failed: usize,
    /// Names old stores were moved to after a UID validity change
    pub renamed: Vec<String>,
    /// Local folders removed because they are gone from the server
    pub deleted: Vec<String>,
}

/// One backup run for one account
pub struct Backup<'a> {
    account: &'a Account,
    logger: Logger,
}

impl<'a> Backup<'a> {
    pub fn new(account: &'a Account, logger: Logger) -> Self {
        Self { account, logger }
    }

    /// Download new messages from every wanted folder on `remote`
    ///
    /// Folders listed by the server but not selectable are skipped. Each
    /// folder is committed batch by batch, so an error leaves every earlier
    /// batch in place for the next run.
    pub fn run(&self, remote: &dyn RemoteAccount) -> Result<BackupStats> {
        let local_path = self.account.local_path()?;
        let strategy = self.account.download_strategy();
        let mut stats = BackupStats::default();

        let names: Vec<String> = remote
            .list_folders()
            .context("Failed to list remote folders")?
            .into_iter()
            .filter(|name| self.account.wants_folder(name))
            .collect();
        self.logger.debug(format_args!(
            "[{}] backing up {} folders",
            self.account.username(),
            names.len()
        ));

        for name in &names {
            if let Err(e) = check_folder_name(name) {
                self.logger.warn(format_args!("{} - skipping", e));
                continue;
            }
            let folder = remote.folder(name);
            if !folder.exists()? {
                self.logger.info(format_args!("[{}] not found on server - skipping", name));
                continue;
            }

            let mut serializer =
                Serializer::open(&local_path, name, strategy, self.logger.clone())?;
            let uid_validity = folder.uid_validity()?;
            if let Some(renamed) = serializer.apply_uid_validity(uid_validity)? {
                stats.renamed.push(renamed);
            }

            let result = Downloader::new(
                folder.as_ref(),
                &mut serializer,
                self.account.multi_fetch_size(),
                self.logger.clone(),
            )
            .run()
            .with_context(|| format!("Failed to back up folder '{}'", name))?;

            stats.folders += 1;
            stats.downloaded += result.downloaded;
            stats.skipped += result.skipped;
            stats.failed += result.failed;
        }

        if self.account.mirror_mode() {
            stats.deleted = self.delete_stale_folders(&names)?;
        }

        Ok(stats)
    }

    /// Remove local stores of wanted folders that the server no longer has
    fn delete_stale_folders(&self, remote_names: &[String]) -> Result<Vec<String>> {
        let local_path = self.account.local_path()?;
        let remote: HashSet<&str> = remote_names.iter().map(String::as_str).collect();
        let mut deleted = Vec::new();

        for name in serialized_folders(&local_path)? {
            if remote.contains(name.as_str()) || !self.account.wants_folder(&name) {
                continue;
            }
            let mut serializer = Serializer::open(
                &local_path,
                &name,
                self.account.download_strategy(),
                self.logger.clone(),
            )?;
            serializer.delete()?;
            let mirror = with_suffix(&serializer.folder_path(), MIRROR_EXTENSION);
            if mirror.exists() {
                std::fs::remove_file(&mirror)
                    .with_context(|| format!("Failed to remove {}", mirror.display()))?;
            }
            self.logger
                .info(format_args!("[{}] removed, no longer on server", name));
            deleted.push(name);
        }

        Ok(deleted)
    }
}

/// Back up several accounts at once
///
/// Accounts write to disjoint directories, so they run in parallel. Results
/// come back in the order of `jobs`.
pub fn backup_accounts(
    jobs: &[(&Account, &dyn RemoteAccount)],
    logger: &Logger,
) -> Vec<Result<BackupStats>> {
    jobs.par_iter()
        .map(|(account, remote)| {
            Backup::new(account, logger.clone())
                .run(*remote)
                .with_context(|| format!("Backup of {} failed", account.username()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::MemoryLog;
    use crate::models::{AccountSettings, DownloadStrategy};
    use crate::remote::InMemoryRemote;
    use std::path::Path;
    use tempfile::tempdir;

    fn account(local_path: &Path) -> Account {
        Account::new(
            AccountSettings::new("user@example.com", "pwd")
                .with_local_path(local_path)
                .with_multi_fetch_size(2),
        )
    }

    fn remote() -> InMemoryRemote {
        let remote = InMemoryRemote::new("/");
        remote.add_folder("INBOX", 10).unwrap();
        remote.add_folder("Sent", 20).unwrap();
        for uid in 1..=3 {
            remote
                .add_message("INBOX", uid, format!("Subject: {}\r\n\r\nhi\r\n", uid).as_bytes(), &[])
                .unwrap();
        }
        remote
            .add_message("Sent", 7, b"Subject: sent\r\n\r\nbye\r\n", &["\\Seen"])
            .unwrap();
        remote
    }

    fn open(local_path: &Path, folder: &str) -> Serializer {
        Serializer::open(local_path, folder, DownloadStrategy::default(), Logger::global()).unwrap()
    }

    #[test]
    fn test_backup_all_folders() {
        let dir = tempdir().unwrap();
        let local_path = dir.path().join("backup");
        let account = account(&local_path);

        let stats = Backup::new(&account, Logger::global()).run(&remote()).unwrap();

        assert_eq!(stats.folders, 2);
        assert_eq!(stats.downloaded, 4);
        assert_eq!(open(&local_path, "INBOX").uids(), vec![1, 2, 3]);
        assert_eq!(open(&local_path, "INBOX").uid_validity(), Some(10));
        let sent = open(&local_path, "Sent");
        assert_eq!(sent.get(7).unwrap().unwrap().flags, vec!["\\Seen"]);
    }

    #[test]
    fn test_second_run_is_incremental() {
        let dir = tempdir().unwrap();
        let local_path = dir.path().join("backup");
        let account = account(&local_path);
        let remote = remote();

        Backup::new(&account, Logger::global()).run(&remote).unwrap();
        remote.add_message("INBOX", 4, b"Subject: 4\r\n\r\nnew\r\n", &[]).unwrap();
        let stats = Backup::new(&account, Logger::global()).run(&remote).unwrap();

        assert_eq!(stats.downloaded, 1);
        assert_eq!(open(&local_path, "INBOX").uids(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_folder_filter() {
        let dir = tempdir().unwrap();
        let local_path = dir.path().join("backup");
        let mut account = account(&local_path);
        account.settings_mut().folders = Some(vec!["Sent".to_string()]);

        let stats = Backup::new(&account, Logger::global()).run(&remote()).unwrap();

        assert_eq!(stats.folders, 1);
        assert_eq!(serialized_folders(&local_path).unwrap(), vec!["Sent"]);
    }

    #[test]
    fn test_uid_validity_change_moves_old_store() {
        let dir = tempdir().unwrap();
        let local_path = dir.path().join("backup");
        let account = account(&local_path);
        let remote = remote();
        Backup::new(&account, Logger::global()).run(&remote).unwrap();

        remote.set_uid_validity("INBOX", 11).unwrap();
        let stats = Backup::new(&account, Logger::global()).run(&remote).unwrap();

        assert_eq!(stats.renamed, vec!["INBOX-10"]);
        assert_eq!(stats.downloaded, 3);
        assert_eq!(open(&local_path, "INBOX-10").uids(), vec![1, 2, 3]);
        assert_eq!(open(&local_path, "INBOX").uid_validity(), Some(11));
    }

    #[test]
    fn test_mirror_mode_removes_stale_folders() {
        let dir = tempdir().unwrap();
        let local_path = dir.path().join("backup");
        let mut account = account(&local_path);
        account.settings_mut().mirror_mode = true;
        let log = MemoryLog::new();

        Backup::new(&account, Logger::global()).run(&remote()).unwrap();
        let sent_mirror = local_path.join("Sent.mirror");
        let inbox_mirror = local_path.join("INBOX.mirror");
        std::fs::write(&sent_mirror, "{}").unwrap();
        std::fs::write(&inbox_mirror, "{}").unwrap();

        let smaller = InMemoryRemote::new("/");
        smaller.add_folder("INBOX", 10).unwrap();
        let stats = Backup::new(&account, Logger::new(log.clone()))
            .run(&smaller)
            .unwrap();

        assert_eq!(stats.deleted, vec!["Sent"]);
        assert_eq!(serialized_folders(&local_path).unwrap(), vec!["INBOX"]);
        assert!(log.contains("[Sent] removed"));
        assert!(!sent_mirror.exists());
        assert!(inbox_mirror.exists());
    }

    #[test]
    fn test_unstorable_folder_names_are_skipped() {
        let dir = tempdir().unwrap();
        let local_path = dir.path().join("backup");
        let account = account(&local_path);
        let server = InMemoryRemote::new("/");
        server.add_folder("INBOX", 1).unwrap();
        server.add_message("INBOX", 1, b"Subject: a\r\n\r\na\r\n", &[]).unwrap();
        server.add_folder("../escape", 1).unwrap();
        server.add_message("../escape", 1, b"Subject: b\r\n\r\nb\r\n", &[]).unwrap();
        let log = MemoryLog::new();

        let stats = Backup::new(&account, Logger::new(log.clone()))
            .run(&server)
            .unwrap();

        assert_eq!(stats.folders, 1);
        assert_eq!(stats.downloaded, 1);
        assert!(log.contains("Folder name '../escape' cannot be stored locally - skipping"));
        assert!(!dir.path().join("escape.imap").exists());
        assert_eq!(serialized_folders(&local_path).unwrap(), vec!["INBOX"]);
    }

    #[test]
    fn test_backup_accounts_in_parallel() {
        let dir = tempdir().unwrap();
        let first = account(&dir.path().join("first"));
        let second = Account::new(
            AccountSettings::new("other@example.com", "pwd")
                .with_local_path(dir.path().join("second")),
        );
        let remote_a = remote();
        let remote_b = InMemoryRemote::new(".");
        remote_b.add_folder("INBOX", 1).unwrap();
        remote_b.add_message("INBOX", 1, b"Subject: b\r\n\r\nb\r\n", &[]).unwrap();

        let remote_a: &dyn RemoteAccount = &remote_a;
        let remote_b: &dyn RemoteAccount = &remote_b;
        let results = backup_accounts(
            &[(&first, remote_a), (&second, remote_b)],
            &Logger::global(),
        );

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].as_ref().unwrap().downloaded, 4);
        assert_eq!(results[1].as_ref().unwrap().downloaded, 1);
    }
}
