//! Remote mailbox capability
//!
//! The engine never speaks IMAP itself. It works against these traits, which
//! expose exactly the operations a backup or mirror run needs. One adapter
//! per transport implements them; [`InMemoryRemote`] is the in-process one.

mod memory;

use anyhow::Result;

pub use memory::InMemoryRemote;

/// One entry of a batch fetch
///
/// Servers occasionally return entries without a UID or body; such entries
/// are skipped by the downloader rather than treated as errors.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FetchedMessage {
    pub uid: Option<u32>,
    pub body: Option<Vec<u8>>,
    pub flags: Vec<String>,
}

impl FetchedMessage {
    pub fn new(uid: u32, body: impl Into<Vec<u8>>) -> Self {
        Self {
            uid: Some(uid),
            body: Some(body.into()),
            flags: Vec::new(),
        }
    }

    pub fn with_flags(mut self, flags: Vec<String>) -> Self {
        self.flags = flags;
        self
    }
}

/// Outcome of a batch fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchResult {
    /// Per-UID results, in server order
    Fetched(Vec<FetchedMessage>),
    /// The server rejected the batch as a whole
    Failed,
}

/// A folder on a remote server
pub trait RemoteFolder {
    /// Full folder name on the server
    fn name(&self) -> &str;

    fn exists(&self) -> Result<bool>;

    fn uid_validity(&self) -> Result<u32>;

    /// All UIDs, ascending
    fn uids(&self) -> Result<Vec<u32>>;

    /// Fetch bodies and flags for several UIDs at once
    fn fetch_multi(&self, uids: &[u32]) -> Result<FetchResult>;

    fn create(&self) -> Result<()>;

    /// Upload a message, returning its new UID
    fn append(&self, message: &[u8], flags: &[String]) -> Result<u32>;
}

/// A remote account
pub trait RemoteAccount: Send + Sync {
    /// Hierarchy delimiter used by the server
    fn delimiter(&self) -> &str;

    fn list_folders(&self) -> Result<Vec<String>>;

    fn folder<'a>(&'a self, name: &str) -> Box<dyn RemoteFolder + 'a>;
}
