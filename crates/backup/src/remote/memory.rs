//! In-memory remote account
//!
//! Behaves like a small IMAP server held in process memory. Used by the
//! tests and for dry runs, with knobs to reproduce the server behaviour the
//! downloader has to cope with (rejected large batches, broken messages).

use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, RwLock};

use anyhow::{Result, anyhow, bail};

use super::{FetchResult, FetchedMessage, RemoteAccount, RemoteFolder};

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Vec<u8>,
    flags: Vec<String>,
}

#[derive(Debug, Clone)]
struct MemoryFolder {
    uid_validity: u32,
    next_uid: u32,
    messages: BTreeMap<u32, StoredMessage>,
}

impl MemoryFolder {
    fn new(uid_validity: u32) -> Self {
        Self {
            uid_validity,
            next_uid: 1,
            messages: BTreeMap::new(),
        }
    }
}

/// Remote account backed by in-memory folders
pub struct InMemoryRemote {
    delimiter: String,
    folders: RwLock<BTreeMap<String, MemoryFolder>>,
    /// Batches with more UIDs than this are rejected as a whole
    max_batch_size: Option<usize>,
    /// UIDs whose fetch always fails
    unfetchable: HashSet<u32>,
    /// UIDs returned without a body
    bodiless: HashSet<u32>,
    /// UIDs returned without their UID
    uidless: HashSet<u32>,
    fetch_log: Mutex<Vec<(String, Vec<u32>)>>,
}

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow!("in-memory remote lock poisoned")
}

impl InMemoryRemote {
    pub fn new(delimiter: impl Into<String>) -> Self {
        Self {
            delimiter: delimiter.into(),
            folders: RwLock::new(BTreeMap::new()),
            max_batch_size: None,
            unfetchable: HashSet::new(),
            bodiless: HashSet::new(),
            uidless: HashSet::new(),
            fetch_log: Mutex::new(Vec::new()),
        }
    }

    /// Reject any batch fetch of more than `size` UIDs
    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = Some(size);
        self
    }

    /// Make every fetch that includes `uid` fail
    pub fn with_unfetchable(mut self, uid: u32) -> Self {
        self.unfetchable.insert(uid);
        self
    }

    /// Return `uid` without its body
    pub fn with_bodiless(mut self, uid: u32) -> Self {
        self.bodiless.insert(uid);
        self
    }

    /// Return `uid` with its body but without the UID itself
    pub fn with_uidless(mut self, uid: u32) -> Self {
        self.uidless.insert(uid);
        self
    }

    pub fn add_folder(&self, name: &str, uid_validity: u32) -> Result<()> {
        let mut folders = self.folders.write().map_err(poisoned)?;
        folders
            .entry(name.to_string())
            .or_insert_with(|| MemoryFolder::new(uid_validity));
        Ok(())
    }

    /// Store a message under a specific UID
    pub fn add_message(&self, folder: &str, uid: u32, body: &[u8], flags: &[&str]) -> Result<()> {
        let mut folders = self.folders.write().map_err(poisoned)?;
        let folder = folders
            .get_mut(folder)
            .ok_or_else(|| anyhow!("No such folder: {}", folder))?;
        folder.messages.insert(
            uid,
            StoredMessage {
                body: body.to_vec(),
                flags: flags.iter().map(|f| f.to_string()).collect(),
            },
        );
        folder.next_uid = folder.next_uid.max(uid + 1);
        Ok(())
    }

    /// Change a folder's UID validity, as a server does after renumbering
    pub fn set_uid_validity(&self, folder: &str, uid_validity: u32) -> Result<()> {
        let mut folders = self.folders.write().map_err(poisoned)?;
        let folder = folders
            .get_mut(folder)
            .ok_or_else(|| anyhow!("No such folder: {}", folder))?;
        folder.uid_validity = uid_validity;
        Ok(())
    }

    /// Bodies and flags of a folder's messages, in UID order
    pub fn messages(&self, folder: &str) -> Result<Vec<(u32, Vec<u8>, Vec<String>)>> {
        let folders = self.folders.read().map_err(poisoned)?;
        let folder = folders
            .get(folder)
            .ok_or_else(|| anyhow!("No such folder: {}", folder))?;
        Ok(folder
            .messages
            .iter()
            .map(|(uid, m)| (*uid, m.body.clone(), m.flags.clone()))
            .collect())
    }

    /// Every batch requested so far, as (folder, uids)
    pub fn fetch_log(&self) -> Vec<(String, Vec<u32>)> {
        self.fetch_log
            .lock()
            .map(|log| log.clone())
            .unwrap_or_default()
    }

    fn record_fetch(&self, folder: &str, uids: &[u32]) -> Result<()> {
        self.fetch_log
            .lock()
            .map_err(poisoned)?
            .push((folder.to_string(), uids.to_vec()));
        Ok(())
    }
}

impl RemoteAccount for InMemoryRemote {
    fn delimiter(&self) -> &str {
        &self.delimiter
    }

    fn list_folders(&self) -> Result<Vec<String>> {
        let folders = self.folders.read().map_err(poisoned)?;
        Ok(folders.keys().cloned().collect())
    }

    fn folder<'a>(&'a self, name: &str) -> Box<dyn RemoteFolder + 'a> {
        Box::new(MemoryFolderHandle {
            remote: self,
            name: name.to_string(),
        })
    }
}

struct MemoryFolderHandle<'a> {
    remote: &'a InMemoryRemote,
    name: String,
}

impl MemoryFolderHandle<'_> {
    fn with_folder<T>(&self, f: impl FnOnce(&MemoryFolder) -> T) -> Result<T> {
        let folders = self.remote.folders.read().map_err(poisoned)?;
        match folders.get(&self.name) {
            Some(folder) => Ok(f(folder)),
            None => bail!("Folder '{}' does not exist", self.name),
        }
    }
}

impl RemoteFolder for MemoryFolderHandle<'_> {
    fn name(&self) -> &str {
        &self.name
    }

    fn exists(&self) -> Result<bool> {
        let folders = self.remote.folders.read().map_err(poisoned)?;
        Ok(folders.contains_key(&self.name))
    }

    fn uid_validity(&self) -> Result<u32> {
        self.with_folder(|f| f.uid_validity)
    }

    fn uids(&self) -> Result<Vec<u32>> {
        self.with_folder(|f| f.messages.keys().copied().collect())
    }

    fn fetch_multi(&self, uids: &[u32]) -> Result<FetchResult> {
        self.remote.record_fetch(&self.name, uids)?;

        if self.remote.max_batch_size.is_some_and(|max| uids.len() > max)
            || uids.iter().any(|uid| self.remote.unfetchable.contains(uid))
        {
            return Ok(FetchResult::Failed);
        }

        self.with_folder(|folder| {
            let fetched = uids
                .iter()
                .filter_map(|uid| folder.messages.get(uid).map(|m| (*uid, m)))
                .map(|(uid, m)| FetchedMessage {
                    uid: (!self.remote.uidless.contains(&uid)).then_some(uid),
                    body: (!self.remote.bodiless.contains(&uid)).then(|| m.body.clone()),
                    flags: m.flags.clone(),
                })
                .collect();
            FetchResult::Fetched(fetched)
        })
    }

    fn create(&self) -> Result<()> {
        self.remote.add_folder(&self.name, 1)
    }

    fn append(&self, message: &[u8], flags: &[String]) -> Result<u32> {
        let mut folders = self.remote.folders.write().map_err(poisoned)?;
        let folder = folders
            .get_mut(&self.name)
            .ok_or_else(|| anyhow!("Folder '{}' does not exist", self.name))?;
        let uid = folder.next_uid;
        folder.next_uid += 1;
        folder.messages.insert(
            uid,
            StoredMessage {
                body: message.to_vec(),
                flags: flags.to_vec(),
            },
        );
        Ok(uid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_folder_listing_and_uids() {
        let remote = InMemoryRemote::new("/");
        remote.add_folder("INBOX", 5).unwrap();
        remote.add_message("INBOX", 3, b"three", &[]).unwrap();
        remote.add_message("INBOX", 1, b"one", &["\\Seen"]).unwrap();

        assert_eq!(remote.list_folders().unwrap(), vec!["INBOX"]);
        let folder = remote.folder("INBOX");
        assert!(folder.exists().unwrap());
        assert_eq!(folder.uid_validity().unwrap(), 5);
        assert_eq!(folder.uids().unwrap(), vec![1, 3]);
    }

    #[test]
    fn test_missing_folder() {
        let remote = InMemoryRemote::new("/");
        let folder = remote.folder("Nope");
        assert!(!folder.exists().unwrap());
        assert!(folder.uids().is_err());
    }

    #[test]
    fn test_batch_limit() {
        let remote = InMemoryRemote::new("/").with_max_batch_size(1);
        remote.add_folder("INBOX", 1).unwrap();
        remote.add_message("INBOX", 1, b"one", &[]).unwrap();
        remote.add_message("INBOX", 2, b"two", &[]).unwrap();

        let folder = remote.folder("INBOX");
        assert_eq!(folder.fetch_multi(&[1, 2]).unwrap(), FetchResult::Failed);
        assert_eq!(
            folder.fetch_multi(&[2]).unwrap(),
            FetchResult::Fetched(vec![FetchedMessage::new(2, "two")])
        );
        assert_eq!(remote.fetch_log().len(), 2);
    }

    #[test]
    fn test_append_assigns_uids() {
        let remote = InMemoryRemote::new(".");
        let folder = remote.folder("Archive");
        folder.create().unwrap();

        assert_eq!(folder.append(b"a", &[]).unwrap(), 1);
        assert_eq!(folder.append(b"b", &["\\Seen".into()]).unwrap(), 2);
        assert_eq!(remote.messages("Archive").unwrap()[1].2, vec!["\\Seen"]);
    }
}
