//! Enumerate backed-up folders and translate their names
//!
//! Folders are stored on disk with `/` as the hierarchy separator no matter
//! which delimiter the server uses. When a backup is mirrored or exported to
//! another account, each stored folder needs a name in the destination's
//! scheme: an optional source prefix is removed, an optional destination
//! prefix is added and the destination delimiter joins the segments.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use walkdir::WalkDir;

use crate::logging::Logger;
use crate::models::DownloadStrategy;
use crate::naming;
use crate::storage::{METADATA_EXTENSION, Serializer};

/// A stored folder together with its name in the destination scheme
#[derive(Debug)]
pub struct FolderMapping {
    pub serializer: Serializer,
    /// Canonical name, with `/` separating hierarchy levels
    pub source_name: String,
    pub destination_name: String,
}

/// Maps the folders under an account's backup directory to a new scheme
#[derive(Debug, Clone)]
pub struct FolderMapper {
    local_path: PathBuf,
    source_prefix: String,
    source_delimiter: String,
    destination_prefix: String,
    destination_delimiter: String,
    strategy: DownloadStrategy,
    logger: Logger,
}

impl FolderMapper {
    pub fn new(local_path: impl Into<PathBuf>) -> Self {
        Self {
            local_path: local_path.into(),
            source_prefix: String::new(),
            source_delimiter: "/".to_string(),
            destination_prefix: String::new(),
            destination_delimiter: "/".to_string(),
            strategy: DownloadStrategy::default(),
            logger: Logger::global(),
        }
    }

    /// Prefix and delimiter of the account the backup was taken from
    ///
    /// The delimiter is only used to trim a trailing delimiter from the
    /// prefix.
    pub fn with_source(mut self, prefix: &str, delimiter: &str) -> Self {
        self.source_prefix = trim_delimiter(prefix, delimiter);
        self.source_delimiter = delimiter.to_string();
        self
    }

    /// Prefix and delimiter of the account being written to
    pub fn with_destination(mut self, prefix: &str, delimiter: &str) -> Self {
        self.destination_prefix = trim_delimiter(prefix, delimiter);
        self.destination_delimiter = delimiter.to_string();
        self
    }

    /// Strategy for the stores handed out by [`FolderMapper::each`]
    pub fn with_strategy(mut self, strategy: DownloadStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_logger(mut self, logger: Logger) -> Self {
        self.logger = logger;
        self
    }

    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    pub fn source_delimiter(&self) -> &str {
        &self.source_delimiter
    }

    /// Every stored folder, opened, with its destination name
    ///
    /// The sequence is computed lazily from the directory tree, so calling
    /// this again picks up folders created since.
    pub fn each(&self) -> impl Iterator<Item = Result<FolderMapping>> + '_ {
        canonical_names(&self.local_path).map(move |name| {
            let source_name = name?;
            let serializer = Serializer::open(
                &self.local_path,
                &source_name,
                self.strategy,
                self.logger.clone(),
            )?;
            Ok(FolderMapping {
                serializer,
                destination_name: self.destination_name(&source_name),
                source_name,
            })
        })
    }

    /// Translate a canonical folder name into the destination scheme
    pub fn destination_name(&self, source_name: &str) -> String {
        let mut segments: Vec<&str> = source_name.split('/').collect();

        if !self.source_prefix.is_empty() && segments.first() == Some(&&*self.source_prefix) {
            segments.remove(0);
        }
        if !self.destination_prefix.is_empty() {
            segments.insert(0, &self.destination_prefix);
        }

        segments.join(self.destination_delimiter.as_str())
    }
}

fn trim_delimiter(prefix: &str, delimiter: &str) -> String {
    if delimiter.is_empty() {
        return prefix.to_string();
    }
    let mut trimmed = prefix;
    while let Some(rest) = trimmed.strip_suffix(delimiter) {
        trimmed = rest;
    }
    trimmed.to_string()
}

/// Canonical names of the folders stored under `local_path`, sorted
pub fn serialized_folders(local_path: &Path) -> Result<Vec<String>> {
    canonical_names(local_path).collect()
}

fn canonical_names(root: &Path) -> impl Iterator<Item = Result<String>> + '_ {
    root.exists()
        .then(|| WalkDir::new(root).sort_by_file_name().into_iter())
        .into_iter()
        .flatten()
        .filter_map(move |entry| match entry {
            Ok(entry) if entry.file_type().is_file() => canonical_name(root, entry.path()).map(Ok),
            Ok(_) => None,
            Err(e) => Some(
                Err(e).with_context(|| format!("Failed to list folders in {}", root.display())),
            ),
        })
}

/// `<root>/a/b%3a;c.imap` becomes `a/b:c`
fn canonical_name(root: &Path, path: &Path) -> Option<String> {
    if path.extension()? != METADATA_EXTENSION {
        return None;
    }
    let relative = path.strip_prefix(root).ok()?.with_extension("");
    let segments: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(naming::from_local_path(&segments.join("/")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store(root: &Path, folder: &str) {
        let mut serializer = Serializer::open(
            root,
            folder,
            DownloadStrategy::DelayMetadata,
            Logger::global(),
        )
        .unwrap();
        serializer
            .transaction(|s| s.append(1, b"Subject: hi\r\n\r\nbody\r\n", &[]))
            .unwrap();
    }

    #[test]
    fn test_destination_name_with_prefixes() {
        let mapper = FolderMapper::new("/unused")
            .with_source("INBOX", "/")
            .with_destination("Archive", ".");
        assert_eq!(mapper.destination_name("INBOX/2020/jan"), "Archive.2020.jan");
    }

    #[test]
    fn test_trailing_delimiters_are_trimmed() {
        let mapper = FolderMapper::new("/unused")
            .with_source("INBOX/", "/")
            .with_destination("Archive..", ".");
        assert_eq!(mapper.destination_name("INBOX/2020/jan"), "Archive.2020.jan");
    }

    #[test]
    fn test_source_prefix_matches_whole_segment_only() {
        let mapper = FolderMapper::new("/unused").with_source("INB", "/");
        assert_eq!(mapper.destination_name("INBOX/Sent"), "INBOX/Sent");

        let mapper = FolderMapper::new("/unused").with_source("Sent", "/");
        assert_eq!(mapper.destination_name("INBOX/Sent"), "INBOX/Sent");
    }

    #[test]
    fn test_empty_prefixes_only_change_delimiter() {
        let mapper = FolderMapper::new("/unused").with_destination("", ".");
        assert_eq!(mapper.destination_name("a/b/c"), "a.b.c");
        assert_eq!(mapper.destination_name("top"), "top");
    }

    #[test]
    fn test_prefix_only_folder() {
        let mapper = FolderMapper::new("/unused")
            .with_source("INBOX", "/")
            .with_destination("Archive", ".");
        assert_eq!(mapper.destination_name("INBOX"), "Archive");
    }

    #[test]
    fn test_serialized_folders() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("account");
        store(&root, "INBOX");
        store(&root, "INBOX/2020/jan");
        store(&root, "Work:Projects");
        std::fs::write(root.join("notes.txt"), "ignored").unwrap();

        let mut folders = serialized_folders(&root).unwrap();
        folders.sort();
        assert_eq!(folders, vec!["INBOX", "INBOX/2020/jan", "Work:Projects"]);
    }

    #[test]
    fn test_missing_root_has_no_folders() {
        let dir = tempdir().unwrap();
        assert!(serialized_folders(&dir.path().join("nope")).unwrap().is_empty());
    }

    #[test]
    fn test_each_opens_stores() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("account");
        store(&root, "INBOX/2020/jan");

        let mapper = FolderMapper::new(&root)
            .with_source("INBOX", "/")
            .with_destination("Archive", ".");
        let mappings: Vec<FolderMapping> = mapper.each().collect::<Result<_>>().unwrap();

        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].source_name, "INBOX/2020/jan");
        assert_eq!(mappings[0].destination_name, "Archive.2020.jan");
        assert_eq!(mappings[0].serializer.uids(), vec![1]);
    }

    #[test]
    fn test_each_is_restartable() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("account");
        store(&root, "INBOX");

        let mapper = FolderMapper::new(&root);
        assert_eq!(mapper.each().count(), 1);

        store(&root, "Sent");
        assert_eq!(mapper.each().count(), 2);
    }
}
