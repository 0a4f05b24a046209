//! Copy a backed-up account to another server
//!
//! Which stored messages have already been uploaded is recorded per folder
//! in a `<folder>.mirror` file next to the store, keyed by destination so
//! one backup can feed several mirrors.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::backup::{Backup, BackupStats};
use crate::folder_mapper::FolderMapper;
use crate::logging::Logger;
use crate::models::Account;
use crate::remote::{RemoteAccount, RemoteFolder};
use crate::storage::{Serializer, with_suffix};

/// Suffix of the per-folder upload record
pub const MIRROR_EXTENSION: &str = "mirror";

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct MirrorEntry {
    source_uid_validity: Option<u32>,
    destination_uid_validity: Option<u32>,
    /// Source UID to destination UID
    #[serde(default)]
    map: BTreeMap<u32, u32>,
}

/// Source to destination UID map of one folder and one destination
#[derive(Debug)]
pub struct MirrorMap {
    path: PathBuf,
    destination: String,
    entries: BTreeMap<String, MirrorEntry>,
}

impl MirrorMap {
    /// Load the record at `path`; a missing file is an empty map
    pub fn load(path: impl Into<PathBuf>, destination: &str) -> Result<Self> {
        let path = path.into();
        let entries = if path.exists() {
            config::load_json_file(&path)?
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            path,
            destination: destination.to_string(),
            entries,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn entry(&self) -> Option<&MirrorEntry> {
        self.entries.get(&self.destination)
    }

    fn entry_mut(&mut self) -> &mut MirrorEntry {
        self.entries.entry(self.destination.clone()).or_default()
    }

    /// Forget the map if either folder's UIDs were renumbered
    ///
    /// Returns true if an existing map was discarded.
    pub fn check_uid_validities(&mut self, source: Option<u32>, destination: u32) -> bool {
        let entry = self.entry_mut();
        let changed = entry.source_uid_validity != source
            || entry.destination_uid_validity != Some(destination);
        let discarded = changed && !entry.map.is_empty();
        if changed {
            *entry = MirrorEntry {
                source_uid_validity: source,
                destination_uid_validity: Some(destination),
                map: BTreeMap::new(),
            };
        }
        discarded
    }

    pub fn destination_uid(&self, source_uid: u32) -> Option<u32> {
        self.entry()?.map.get(&source_uid).copied()
    }

    pub fn map_uids(&mut self, source_uid: u32, destination_uid: u32) {
        self.entry_mut().map.insert(source_uid, destination_uid);
    }

    pub fn save(&self) -> Result<()> {
        let content = serde_json::to_string_pretty(&self.entries)?;
        std::fs::write(&self.path, content)
            .with_context(|| format!("Failed to write {}", self.path.display()))?;
        config::make_private_file(&self.path)
    }
}

/// Statistics from a mirror run
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MirrorStats {
    pub backup: BackupStats,
    /// Folders visited on the destination
    pub folders: usize,
    /// Folders that had to be created
    pub created: usize,
    /// Messages uploaded
    pub appended: usize,
}

/// Backs up a source account and uploads the result to a destination
pub struct Mirror<'a> {
    source: &'a Account,
    destination_key: String,
    mapper: FolderMapper,
    logger: Logger,
}

impl<'a> Mirror<'a> {
    /// `destination_key` names the destination in the `.mirror` files,
    /// usually its username
    pub fn new(
        source: &'a Account,
        destination_key: impl Into<String>,
        mapper: FolderMapper,
        logger: Logger,
    ) -> Self {
        Self {
            source,
            destination_key: destination_key.into(),
            mapper: mapper.with_logger(logger.clone()),
            logger,
        }
    }

    pub fn run(
        &self,
        source: &dyn RemoteAccount,
        destination: &dyn RemoteAccount,
    ) -> Result<MirrorStats> {
        let mut stats = MirrorStats {
            backup: Backup::new(self.source, self.logger.clone()).run(source)?,
            ..MirrorStats::default()
        };

        for mapping in self.mapper.each() {
            let mapping = mapping?;
            let folder = destination.folder(&mapping.destination_name);
            if !folder.exists()? {
                self.logger.info(format_args!(
                    "[{}] creating destination folder",
                    mapping.destination_name
                ));
                folder.create()?;
                stats.created += 1;
            }

            stats.appended += self
                .upload(&mapping.serializer, folder.as_ref())
                .with_context(|| {
                    format!(
                        "Failed to mirror '{}' to '{}'",
                        mapping.source_name, mapping.destination_name
                    )
                })?;
            stats.folders += 1;
        }

        Ok(stats)
    }

    fn upload(&self, serializer: &Serializer, folder: &dyn RemoteFolder) -> Result<usize> {
        let path = with_suffix(&serializer.folder_path(), MIRROR_EXTENSION);
        let mut map = MirrorMap::load(path, &self.destination_key)?;
        if map.check_uid_validities(serializer.uid_validity(), folder.uid_validity()?) {
            self.logger.warn(format_args!(
                "[{}] UID validity changed, uploading all messages again",
                folder.name()
            ));
        }

        let missing: Vec<u32> = serializer
            .uids()
            .into_iter()
            .filter(|uid| map.destination_uid(*uid).is_none())
            .collect();
        self.logger.debug(format_args!(
            "[{}] {} messages to upload",
            folder.name(),
            missing.len()
        ));

        let mut appended = 0;
        for message in serializer.each_message(&missing)? {
            let destination_uid = folder.append(&message.body, &message.flags)?;
            map.map_uids(message.uid, destination_uid);
            map.save()?;
            appended += 1;
        }
        if appended == 0 {
            map.save()?;
        }

        Ok(appended)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AccountSettings;
    use crate::remote::InMemoryRemote;
    use tempfile::tempdir;

    fn source_remote() -> InMemoryRemote {
        let remote = InMemoryRemote::new("/");
        remote.add_folder("INBOX", 3).unwrap();
        remote.add_folder("INBOX/Work", 4).unwrap();
        remote
            .add_message("INBOX", 1, b"Subject: one\r\n\r\n1\r\n", &["\\Seen"])
            .unwrap();
        remote
            .add_message("INBOX/Work", 5, b"Subject: five\r\n\r\n5\r\n", &[])
            .unwrap();
        remote
    }

    fn mirror(account: &Account) -> Mirror<'_> {
        let mapper = FolderMapper::new(account.local_path().unwrap())
            .with_source("", "/")
            .with_destination("", ".");
        Mirror::new(account, "dest@example.com", mapper, Logger::global())
    }

    #[test]
    fn test_mirror_map_load_missing() {
        let dir = tempdir().unwrap();
        let map = MirrorMap::load(dir.path().join("INBOX.mirror"), "dest").unwrap();
        assert_eq!(map.destination_uid(1), None);
    }

    #[test]
    fn test_mirror_map_save_format() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("INBOX.mirror");
        let mut map = MirrorMap::load(&path, "dest").unwrap();
        map.check_uid_validities(Some(3), 9);
        map.map_uids(1, 100);
        map.save().unwrap();

        let saved: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(
            saved,
            serde_json::json!({
                "dest": {
                    "source_uid_validity": 3,
                    "destination_uid_validity": 9,
                    "map": {"1": 100}
                }
            })
        );

        let reloaded = MirrorMap::load(&path, "dest").unwrap();
        assert_eq!(reloaded.destination_uid(1), Some(100));
    }

    #[test]
    fn test_mirror_map_discarded_on_validity_change() {
        let dir = tempdir().unwrap();
        let mut map = MirrorMap::load(dir.path().join("x.mirror"), "dest").unwrap();
        assert!(!map.check_uid_validities(Some(3), 9));
        map.map_uids(1, 100);

        assert!(!map.check_uid_validities(Some(3), 9));
        assert_eq!(map.destination_uid(1), Some(100));

        assert!(map.check_uid_validities(Some(3), 10));
        assert_eq!(map.destination_uid(1), None);
    }

    #[test]
    fn test_mirror_creates_folders_and_uploads() {
        let dir = tempdir().unwrap();
        let account = Account::new(
            AccountSettings::new("src@example.com", "pwd").with_local_path(dir.path().join("src")),
        );
        let source = source_remote();
        let destination = InMemoryRemote::new(".");

        let stats = mirror(&account).run(&source, &destination).unwrap();

        assert_eq!(stats.backup.downloaded, 2);
        assert_eq!(stats.created, 2);
        assert_eq!(stats.appended, 2);
        let inbox = destination.messages("INBOX").unwrap();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].2, vec!["\\Seen"]);
        assert_eq!(destination.messages("INBOX.Work").unwrap().len(), 1);
        assert!(dir.path().join("src").join("INBOX.mirror").exists());
    }

    #[test]
    fn test_mirror_only_uploads_new_messages() {
        let dir = tempdir().unwrap();
        let account = Account::new(
            AccountSettings::new("src@example.com", "pwd").with_local_path(dir.path().join("src")),
        );
        let source = source_remote();
        let destination = InMemoryRemote::new(".");
        mirror(&account).run(&source, &destination).unwrap();

        source
            .add_message("INBOX", 2, b"Subject: two\r\n\r\n2\r\n", &[])
            .unwrap();
        let stats = mirror(&account).run(&source, &destination).unwrap();

        assert_eq!(stats.created, 0);
        assert_eq!(stats.appended, 1);
        assert_eq!(destination.messages("INBOX").unwrap().len(), 2);
        assert_eq!(destination.messages("INBOX.Work").unwrap().len(), 1);
    }
}
