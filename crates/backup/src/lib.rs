//! Backup crate - incremental IMAP backup engine
//!
//! This crate provides the transport-independent parts of a mailbox backup:
//! - Folder name escaping for the file system (Naming)
//! - A transactional per-folder store: mboxrd body log plus JSON index
//! - An adaptive batch downloader that feeds the store
//! - Folder enumeration and name translation for mirroring
//! - Account and configuration file handling
//!
//! Servers are reached through the [`remote::RemoteAccount`] and
//! [`remote::RemoteFolder`] traits; the crate itself never speaks IMAP.

pub mod configuration;
pub mod folder_mapper;
pub mod logging;
pub mod models;
pub mod naming;
pub mod remote;
pub mod storage;
pub mod sync;

pub use configuration::Configuration;
pub use folder_mapper::{FolderMapper, FolderMapping, serialized_folders};
pub use logging::{Logger, MemoryLog};
pub use models::{Account, AccountSettings, DownloadStrategy};
pub use remote::{FetchResult, FetchedMessage, InMemoryRemote, RemoteAccount, RemoteFolder};
pub use storage::{
    InvalidFolderName, Serializer, StoredMessage, TransactionGuard, TransactionStateError,
};
pub use sync::{
    Backup, BackupStats, DownloadStats, Downloader, Mirror, MirrorMap, MirrorStats,
    backup_accounts,
};

pub use config::PermissionError;
