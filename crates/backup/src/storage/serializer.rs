//! Transactional store for one backed-up folder
//!
//! A folder is persisted as two files next to each other:
//!
//! ```text
//! <local_path>/
//!   INBOX.mbox          # append-only message bodies (mboxrd)
//!   INBOX.imap          # metadata index: uid validity, {uid, offset, length, flags}
//!   Lists/
//!     rust%3a;users.mbox
//!     rust%3a;users.imap
//! ```
//!
//! Messages are written inside a transaction. Bodies go to the `.mbox` file
//! (immediately, or at commit with [`DownloadStrategy::DelayAll`]) and their
//! index entries are staged in memory until [`Serializer::commit`]. If the
//! commit fails, the body log is truncated back to its length at
//! [`Serializer::begin_transaction`] and the index is left untouched, so a
//! reader never sees bytes without an index entry or the reverse.

use std::ffi::OsString;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use super::mbox::Mbox;
use super::mboxrd;
use super::metadata::Metadata;
use super::transaction::{StagedEntry, Transaction, TransactionData};
use crate::logging::Logger;
use crate::models::DownloadStrategy;
use crate::naming;

/// Body log suffix
pub const MBOX_EXTENSION: &str = "mbox";
/// Metadata index suffix
pub const METADATA_EXTENSION: &str = "imap";

/// A message read back from the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub uid: u32,
    pub flags: Vec<String>,
    /// Message with LF line endings
    pub body: Vec<u8>,
}

/// Body log and index disagree
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IntegrityError {
    #[error("'{folder}': body log is {actual} bytes, index expects {expected}")]
    LengthMismatch {
        folder: String,
        expected: u64,
        actual: u64,
    },
    #[error("'{folder}': message {uid} at offset {offset} does not start with an envelope line")]
    MissingEnvelope {
        folder: String,
        uid: u32,
        offset: u64,
    },
}

/// Append `.<extension>` to a path without replacing anything after a dot
pub(crate) fn with_suffix(base: &Path, extension: &str) -> PathBuf {
    let mut path: OsString = base.as_os_str().to_owned();
    path.push(".");
    path.push(extension);
    PathBuf::from(path)
}

/// The on-disk store of one folder
#[derive(Debug)]
pub struct Serializer {
    local_path: PathBuf,
    folder: String,
    mbox: Mbox,
    metadata: Metadata,
    strategy: DownloadStrategy,
    transaction: Transaction,
    logger: Logger,
}

impl Serializer {
    /// Open (or prepare) the store for `folder` under `local_path`
    ///
    /// `local_path` and any directories for nested folders are created with
    /// owner-only permissions if needed and must not be more open than that.
    /// A body log tail that is not covered by the index (left by an
    /// interrupted commit) is truncated. Index entries whose bytes are
    /// missing from a short body log are dropped.
    pub fn open(
        local_path: impl AsRef<Path>,
        folder: &str,
        strategy: DownloadStrategy,
        logger: Logger,
    ) -> Result<Self> {
        check_folder_name(folder)?;
        let local_path = local_path.as_ref().to_path_buf();
        ensure_private_dir(&local_path)?;

        let escaped = naming::to_local_path(folder);
        let mut dir = local_path.clone();
        if let Some((parents, _)) = escaped.rsplit_once('/') {
            for segment in parents.split('/') {
                dir.push(segment);
                ensure_private_dir(&dir)?;
            }
        }
        let base = local_path.join(&escaped);

        let mbox = Mbox::new(with_suffix(&base, MBOX_EXTENSION));
        let metadata = Metadata::load(with_suffix(&base, METADATA_EXTENSION))?;

        let mut serializer = Self {
            local_path,
            folder: folder.to_string(),
            mbox,
            metadata,
            strategy,
            transaction: Transaction::default(),
            logger,
        };
        serializer.repair()?;
        Ok(serializer)
    }

    pub fn folder(&self) -> &str {
        &self.folder
    }

    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    /// Path of the folder's files without any suffix
    pub fn folder_path(&self) -> PathBuf {
        self.local_path.join(naming::to_local_path(&self.folder))
    }

    pub fn mbox_path(&self) -> &Path {
        self.mbox.path()
    }

    pub fn metadata_path(&self) -> &Path {
        self.metadata.path()
    }

    pub fn strategy(&self) -> DownloadStrategy {
        self.strategy
    }

    /// UIDs present in the index, in body-log order
    pub fn uids(&self) -> Vec<u32> {
        self.metadata.uids()
    }

    pub fn uid_validity(&self) -> Option<u32> {
        self.metadata.uid_validity()
    }

    /// Size of the body log in bytes
    pub fn mbox_length(&self) -> Result<u64> {
        self.mbox.length()
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction.is_active()
    }

    /// Whether either file of this folder exists
    pub fn exists(&self) -> bool {
        self.mbox.exists() || self.metadata.exists()
    }

    // === Transactions ===

    /// Start a transaction
    ///
    /// Fails with [`TransactionStateError`](super::TransactionStateError) if
    /// one is already active.
    pub fn begin_transaction(&mut self) -> Result<()> {
        self.transaction.fail_in_transaction("begin_transaction")?;
        let mbox_length = self.mbox.length()?;
        self.transaction.begin(mbox_length, self.metadata.len())
    }

    /// Serialize a message into the body log and stage its index entry
    pub fn append(&mut self, uid: u32, message: &[u8], flags: &[String]) -> Result<()> {
        let data = self.transaction.active("append")?;
        let serialized = mboxrd::serialize(message);
        let length = serialized.len() as u64;

        if self.strategy == DownloadStrategy::DelayAll {
            data.pending_bytes.extend_from_slice(&serialized);
        } else if let Err(e) = self.mbox.append(&serialized) {
            // Drop any partial write so the log still matches the staged entries
            let expected = data.expected_mbox_length();
            if let Err(rewind) = self.mbox.rewind(expected) {
                self.logger.error(format_args!(
                    "[{}] failed to rewind body log after write error: {:#}",
                    self.folder, rewind
                ));
            }
            return Err(e);
        }

        data.staged.push(StagedEntry {
            uid,
            length,
            flags: flags.to_vec(),
        });
        Ok(())
    }

    /// Write every staged entry to the index
    ///
    /// On failure the store is returned to its state before the transaction
    /// began and the original error is returned.
    pub fn commit(&mut self) -> Result<()> {
        let data = self.transaction.finish("commit")?;

        if let Err(e) = self.flush(&data) {
            self.logger.warn(format_args!(
                "[{}] commit of {} messages failed, rolling back: {:#}",
                self.folder,
                data.staged.len(),
                e
            ));
            if let Err(restore) = self.restore(&data) {
                self.logger.error(format_args!(
                    "[{}] failed to restore body log: {:#}",
                    self.folder, restore
                ));
            }
            return Err(e);
        }

        Ok(())
    }

    /// Discard everything appended since the transaction began
    pub fn rollback(&mut self) -> Result<()> {
        let data = self.transaction.finish("rollback")?;
        self.restore(&data)
    }

    /// Begin a transaction that is rolled back unless explicitly committed
    pub fn scoped(&mut self) -> Result<TransactionGuard<'_>> {
        self.begin_transaction()?;
        Ok(TransactionGuard {
            serializer: self,
            finished: false,
        })
    }

    /// Run `body` inside a transaction
    ///
    /// Commits if `body` succeeds; rolls back if it fails or panics.
    pub fn transaction<T>(&mut self, body: impl FnOnce(&mut Serializer) -> Result<T>) -> Result<T> {
        let mut guard = self.scoped()?;
        let value = body(&mut *guard)?;
        guard.commit()?;
        Ok(value)
    }

    fn flush(&mut self, data: &TransactionData) -> Result<()> {
        if !data.pending_bytes.is_empty() {
            self.mbox.append(&data.pending_bytes)?;
        }
        for entry in &data.staged {
            self.metadata
                .append(entry.uid, entry.length, entry.flags.clone())?;
        }
        if !data.staged.is_empty() {
            self.metadata.save()?;
        }
        Ok(())
    }

    fn restore(&mut self, data: &TransactionData) -> Result<()> {
        self.metadata.truncate(data.metadata_length);
        self.mbox.rewind(data.mbox_length)
    }

    // === Reading ===

    /// Read a single message
    pub fn get(&self, uid: u32) -> Result<Option<StoredMessage>> {
        let Some(entry) = self.metadata.get(uid) else {
            return Ok(None);
        };
        let raw = self.mbox.read(entry.offset, entry.length)?;
        Ok(Some(StoredMessage {
            uid,
            flags: entry.flags.clone(),
            body: mboxrd::deserialize(&raw),
        }))
    }

    /// Read the given messages, skipping UIDs that are not stored
    pub fn each_message(&self, uids: &[u32]) -> Result<Vec<StoredMessage>> {
        let mut messages = Vec::with_capacity(uids.len());
        for &uid in uids {
            if let Some(message) = self.get(uid)? {
                messages.push(message);
            }
        }
        Ok(messages)
    }

    /// Read every stored message in body-log order
    pub fn messages(&self) -> Result<Vec<StoredMessage>> {
        self.each_message(&self.uids())
    }

    /// Verify that the index describes the body log exactly
    pub fn check_integrity(&self) -> Result<()> {
        let expected = self.metadata.total_length();
        let actual = self.mbox.length()?;
        if expected != actual {
            return Err(IntegrityError::LengthMismatch {
                folder: self.folder.clone(),
                expected,
                actual,
            }
            .into());
        }

        for entry in self.metadata.entries() {
            let start = self.mbox.read(entry.offset, 5)?;
            if !mboxrd::has_envelope(&start) {
                return Err(IntegrityError::MissingEnvelope {
                    folder: self.folder.clone(),
                    uid: entry.uid,
                    offset: entry.offset,
                }
                .into());
            }
        }
        Ok(())
    }

    // === Maintenance ===

    /// Record the server's UID validity
    ///
    /// If a different value is already stored and the folder has messages,
    /// the existing files are moved aside to `<folder>-<old validity>` and a
    /// fresh store is started. Returns the name the old data was moved to.
    pub fn apply_uid_validity(&mut self, uid_validity: u32) -> Result<Option<String>> {
        self.transaction.fail_in_transaction("apply_uid_validity")?;

        match self.metadata.uid_validity() {
            Some(current) if current == uid_validity => Ok(None),
            Some(current) if !self.metadata.is_empty() => {
                let renamed = self.move_aside(current)?;
                self.logger.warn(format_args!(
                    "[{}] UID validity changed from {} to {}, old backup moved to '{}'",
                    self.folder, current, uid_validity, renamed
                ));
                self.metadata.set_uid_validity(uid_validity);
                self.metadata.save()?;
                Ok(Some(renamed))
            }
            _ => {
                self.metadata.set_uid_validity(uid_validity);
                self.metadata.save()?;
                Ok(None)
            }
        }
    }

    /// Delete both files of this folder
    pub fn delete(&mut self) -> Result<()> {
        self.transaction.fail_in_transaction("delete")?;
        self.mbox.delete()?;
        self.metadata.delete()?;
        self.metadata.reset();
        Ok(())
    }

    fn move_aside(&mut self, old_uid_validity: u32) -> Result<String> {
        let mut candidate = format!("{}-{}", self.folder, old_uid_validity);
        let mut counter = 0;
        while self.files_exist_for(&candidate) {
            counter += 1;
            candidate = format!("{}-{}-{}", self.folder, old_uid_validity, counter);
        }

        let base = self.local_path.join(naming::to_local_path(&candidate));
        let current_mbox = self.mbox.path().to_path_buf();
        let current_metadata = self.metadata.path().to_path_buf();

        self.mbox.rename(with_suffix(&base, MBOX_EXTENSION))?;
        self.metadata.rename(with_suffix(&base, METADATA_EXTENSION))?;

        self.mbox = Mbox::new(current_mbox);
        self.metadata = Metadata::load(current_metadata)?;
        Ok(candidate)
    }

    fn files_exist_for(&self, folder: &str) -> bool {
        let base = self.local_path.join(naming::to_local_path(folder));
        with_suffix(&base, MBOX_EXTENSION).exists()
            || with_suffix(&base, METADATA_EXTENSION).exists()
    }

    fn repair(&mut self) -> Result<()> {
        let actual = self.mbox.length()?;

        if actual < self.metadata.total_length() {
            let keep = self
                .metadata
                .entries()
                .iter()
                .take_while(|e| e.offset + e.length <= actual)
                .count();
            self.logger.warn(format_args!(
                "[{}] body log is {} bytes shorter than the index, dropping {} index entries",
                self.folder,
                self.metadata.total_length() - actual,
                self.metadata.len() - keep
            ));
            self.metadata.truncate(keep);
            self.metadata.save()?;
        }

        let indexed = self.metadata.total_length();
        if actual > indexed {
            self.logger.warn(format_args!(
                "[{}] truncating {} unindexed bytes from body log",
                self.folder,
                actual - indexed
            ));
            self.mbox.rewind(indexed)?;
        }
        Ok(())
    }
}

/// A server folder name that cannot be stored under the backup directory
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Folder name '{0}' cannot be stored locally")]
pub struct InvalidFolderName(pub String);

/// Reject names that would escape the backup directory
///
/// Every `/`-separated segment must be non-empty and must not be `.` or
/// `..`.
pub fn check_folder_name(folder: &str) -> Result<()> {
    if folder
        .split('/')
        .any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return Err(InvalidFolderName(folder.to_string()).into());
    }
    Ok(())
}

fn ensure_private_dir(path: &Path) -> Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        config::make_private_dir(path)?;
    }
    config::check_permissions(path, config::PRIVATE_DIR_MODE)
}

/// An active transaction that rolls back when dropped uncommitted
pub struct TransactionGuard<'a> {
    serializer: &'a mut Serializer,
    finished: bool,
}

impl TransactionGuard<'_> {
    pub fn commit(mut self) -> Result<()> {
        self.finished = true;
        self.serializer.commit()
    }

    pub fn rollback(mut self) -> Result<()> {
        self.finished = true;
        self.serializer.rollback()
    }
}

impl Deref for TransactionGuard<'_> {
    type Target = Serializer;

    fn deref(&self) -> &Serializer {
        self.serializer
    }
}

impl DerefMut for TransactionGuard<'_> {
    fn deref_mut(&mut self) -> &mut Serializer {
        self.serializer
    }
}

impl Drop for TransactionGuard<'_> {
    fn drop(&mut self) {
        if self.finished || !self.serializer.in_transaction() {
            return;
        }
        if let Err(e) = self.serializer.rollback() {
            self.serializer.logger.error(format_args!(
                "[{}] rollback failed: {:#}",
                self.serializer.folder, e
            ));
        }
    }
}
