//! Metadata index for a folder's body log
//!
//! The `.imap` file records, in body-log order, each message's UID, byte
//! length and flags, along with the folder's UID validity. Offsets are
//! derived from the lengths: the index, not the body log, decides where
//! each message lives.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Current on-disk format version
pub const METADATA_VERSION: u32 = 3;

/// Problems with the content of a metadata index
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MetadataError {
    #[error("UID {0} is already present in the index")]
    DuplicateUid(u32),
    #[error("Unsupported metadata version {0} (expected {METADATA_VERSION})")]
    UnsupportedVersion(u32),
}

/// One indexed message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub uid: u32,
    pub offset: u64,
    pub length: u64,
    #[serde(default)]
    pub flags: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct IndexFile {
    version: u32,
    uid_validity: Option<u32>,
    #[serde(default)]
    messages: Vec<IndexEntry>,
}

/// In-memory view of a `.imap` file
#[derive(Debug)]
pub struct Metadata {
    path: PathBuf,
    uid_validity: Option<u32>,
    messages: Vec<IndexEntry>,
    known: HashSet<u32>,
}

impl Metadata {
    /// Load the index at `path`, or start an empty one if it does not exist
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut metadata = Self {
            path,
            uid_validity: None,
            messages: Vec::new(),
            known: HashSet::new(),
        };

        if !metadata.path.exists() {
            return Ok(metadata);
        }

        let content = fs::read_to_string(&metadata.path)
            .with_context(|| format!("Failed to read {}", metadata.path.display()))?;
        let file: IndexFile = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", metadata.path.display()))?;

        if file.version != METADATA_VERSION {
            return Err(MetadataError::UnsupportedVersion(file.version).into());
        }

        metadata.uid_validity = file.uid_validity;
        for entry in file.messages {
            metadata
                .append(entry.uid, entry.length, entry.flags)
                .with_context(|| format!("Corrupt index {}", metadata.path.display()))?;
        }

        Ok(metadata)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn uid_validity(&self) -> Option<u32> {
        self.uid_validity
    }

    pub fn set_uid_validity(&mut self, uid_validity: u32) {
        self.uid_validity = Some(uid_validity);
    }

    /// UIDs in body-log order
    pub fn uids(&self) -> Vec<u32> {
        self.messages.iter().map(|m| m.uid).collect()
    }

    pub fn contains(&self, uid: u32) -> bool {
        self.known.contains(&uid)
    }

    pub fn get(&self, uid: u32) -> Option<&IndexEntry> {
        if !self.contains(uid) {
            return None;
        }
        self.messages.iter().find(|m| m.uid == uid)
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Sum of all indexed message lengths
    pub fn total_length(&self) -> u64 {
        self.messages.last().map_or(0, |m| m.offset + m.length)
    }

    /// Add a message after the last indexed one
    pub fn append(&mut self, uid: u32, length: u64, flags: Vec<String>) -> Result<()> {
        if self.known.contains(&uid) {
            return Err(MetadataError::DuplicateUid(uid).into());
        }
        let offset = self.total_length();
        self.messages.push(IndexEntry {
            uid,
            offset,
            length,
            flags,
        });
        self.known.insert(uid);
        Ok(())
    }

    /// Drop every entry after the first `len`
    pub fn truncate(&mut self, len: usize) {
        for entry in self.messages.drain(len.min(self.messages.len())..) {
            self.known.remove(&entry.uid);
        }
    }

    /// Forget all messages and the UID validity
    pub fn reset(&mut self) {
        self.messages.clear();
        self.known.clear();
        self.uid_validity = None;
    }

    /// Write the index (temp file, then rename)
    pub fn save(&self) -> Result<()> {
        let file = IndexFile {
            version: METADATA_VERSION,
            uid_validity: self.uid_validity,
            messages: self.messages.clone(),
        };
        let content = serde_json::to_string(&file)?;

        let mut temp_path = self.path.clone().into_os_string();
        temp_path.push(".tmp");
        let temp_path = PathBuf::from(temp_path);

        fs::write(&temp_path, content)
            .with_context(|| format!("Failed to write {}", temp_path.display()))?;
        fs::rename(&temp_path, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }

    pub fn delete(&self) -> Result<()> {
        if self.exists() {
            fs::remove_file(&self.path)
                .with_context(|| format!("Failed to delete {}", self.path.display()))?;
        }
        Ok(())
    }

    pub fn rename(&mut self, new_path: PathBuf) -> Result<()> {
        if self.exists() {
            fs::rename(&self.path, &new_path).with_context(|| {
                format!("Failed to rename {} to {}", self.path.display(), new_path.display())
            })?;
        }
        self.path = new_path;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let metadata = Metadata::load(dir.path().join("INBOX.imap")).unwrap();
        assert!(metadata.is_empty());
        assert_eq!(metadata.uid_validity(), None);
        assert_eq!(metadata.total_length(), 0);
    }

    #[test]
    fn test_append_computes_offsets() {
        let dir = tempdir().unwrap();
        let mut metadata = Metadata::load(dir.path().join("INBOX.imap")).unwrap();

        metadata.append(5, 100, vec![]).unwrap();
        metadata.append(7, 40, vec!["\\Seen".into()]).unwrap();

        assert_eq!(metadata.get(7).unwrap().offset, 100);
        assert_eq!(metadata.total_length(), 140);
        assert_eq!(metadata.uids(), vec![5, 7]);
    }

    #[test]
    fn test_duplicate_uid_rejected() {
        let dir = tempdir().unwrap();
        let mut metadata = Metadata::load(dir.path().join("INBOX.imap")).unwrap();

        metadata.append(1, 10, vec![]).unwrap();
        let err = metadata.append(1, 10, vec![]).unwrap_err();

        assert_eq!(
            err.downcast_ref::<MetadataError>(),
            Some(&MetadataError::DuplicateUid(1))
        );
        assert_eq!(metadata.len(), 1);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("INBOX.imap");

        let mut metadata = Metadata::load(&path).unwrap();
        metadata.set_uid_validity(42);
        metadata.append(1, 10, vec!["\\Flagged".into()]).unwrap();
        metadata.append(2, 20, vec![]).unwrap();
        metadata.save().unwrap();

        let reloaded = Metadata::load(&path).unwrap();
        assert_eq!(reloaded.uid_validity(), Some(42));
        assert_eq!(reloaded.entries(), metadata.entries());
    }

    #[test]
    fn test_truncate() {
        let dir = tempdir().unwrap();
        let mut metadata = Metadata::load(dir.path().join("INBOX.imap")).unwrap();

        metadata.append(1, 10, vec![]).unwrap();
        metadata.append(2, 10, vec![]).unwrap();
        metadata.append(3, 10, vec![]).unwrap();
        metadata.truncate(1);

        assert_eq!(metadata.uids(), vec![1]);
        assert!(!metadata.contains(2));
        metadata.append(2, 10, vec![]).unwrap();
    }

    #[test]
    fn test_unsupported_version() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("INBOX.imap");
        fs::write(&path, r#"{"version": 1, "uid_validity": 1, "messages": []}"#).unwrap();

        let err = Metadata::load(&path).unwrap_err();
        assert_eq!(
            err.downcast_ref::<MetadataError>(),
            Some(&MetadataError::UnsupportedVersion(1))
        );
    }
}
