//! Backup and mirror runs
//!
//! Runs are incremental and can be repeated safely: only UIDs missing from
//! the local store are downloaded, and only messages missing from a
//! mirror's record are uploaded.

mod backup;
mod downloader;
mod mirror;

pub use backup::{Backup, BackupStats, backup_accounts};
pub use downloader::{DownloadStats, Downloader};
pub use mirror::{MIRROR_EXTENSION, Mirror, MirrorMap, MirrorStats};
