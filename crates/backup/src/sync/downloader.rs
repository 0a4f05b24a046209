//! Incremental download of a remote folder into its local store

use std::collections::HashSet;

use anyhow::Result;

use crate::logging::Logger;
use crate::models::DownloadStrategy;
use crate::remote::{FetchResult, FetchedMessage, RemoteFolder};
use crate::storage::Serializer;

/// A batch fetch was rejected as a whole
///
/// Only used inside the downloader to restart with single-UID fetches.
#[derive(Debug, thiserror::Error)]
#[error("Multi fetch failed for UIDs {uids:?}")]
struct MultiFetchFailed {
    uids: Vec<u32>,
}

/// Statistics from a download run
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DownloadStats {
    /// UIDs on the server that were not stored locally
    pub pending: usize,
    /// Messages committed to the store
    pub downloaded: usize,
    /// Entries returned without UID or body
    pub skipped: usize,
    /// UIDs whose single fetch failed
    pub failed: usize,
    /// Batch size in effect when the run finished
    pub batch_size: usize,
}

/// Downloads messages missing from a local store
///
/// Missing UIDs are fetched in batches of `multi_fetch_size`. If the server
/// rejects a batch, the batch size drops to 1 for the rest of the run and
/// the run starts over.
pub struct Downloader<'a> {
    folder: &'a dyn RemoteFolder,
    serializer: &'a mut Serializer,
    multi_fetch_size: usize,
    logger: Logger,
}

impl<'a> Downloader<'a> {
    pub fn new(
        folder: &'a dyn RemoteFolder,
        serializer: &'a mut Serializer,
        multi_fetch_size: usize,
        logger: Logger,
    ) -> Self {
        Self {
            folder,
            serializer,
            multi_fetch_size: multi_fetch_size.max(1),
            logger,
        }
    }

    pub fn multi_fetch_size(&self) -> usize {
        self.multi_fetch_size
    }

    /// UIDs on the server but not in the store, in server order
    pub fn pending_uids(&self) -> Result<Vec<u32>> {
        let local: HashSet<u32> = self.serializer.uids().into_iter().collect();
        Ok(self
            .folder
            .uids()?
            .into_iter()
            .filter(|uid| !local.contains(uid))
            .collect())
    }

    pub fn run(&mut self) -> Result<DownloadStats> {
        let mut stats = DownloadStats::default();
        loop {
            match self.attempt(&mut stats) {
                Ok(()) => {
                    stats.batch_size = self.multi_fetch_size;
                    return Ok(stats);
                }
                Err(e) if e.downcast_ref::<MultiFetchFailed>().is_some() => {
                    self.debug(format_args!("{}, switching to single fetches", e));
                    self.multi_fetch_size = 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn attempt(&mut self, stats: &mut DownloadStats) -> Result<()> {
        let uids = self.pending_uids()?;
        let count = uids.len();
        stats.pending = stats.pending.max(count);
        self.debug(format_args!("{} new messages", count));

        for (i, block) in uids.chunks(self.multi_fetch_size).enumerate() {
            let entries = match self.folder.fetch_multi(block)? {
                FetchResult::Fetched(entries) => entries,
                FetchResult::Failed if self.multi_fetch_size > 1 => {
                    return Err(MultiFetchFailed {
                        uids: block.to_vec(),
                    }
                    .into());
                }
                FetchResult::Failed => {
                    self.logger.warn(format_args!(
                        "[{}] Fetch failed for UID {} - skipping",
                        self.folder.name(),
                        block[0]
                    ));
                    stats.failed += 1;
                    continue;
                }
            };

            let offset = i * self.multi_fetch_size + 1;
            let valid = self.valid_entries(entries, offset, count, stats);
            stats.downloaded += self.store(valid)?;
        }

        Ok(())
    }

    fn valid_entries(
        &self,
        entries: Vec<FetchedMessage>,
        offset: usize,
        count: usize,
        stats: &mut DownloadStats,
    ) -> Vec<(u32, Vec<u8>, Vec<String>)> {
        let mut valid = Vec::with_capacity(entries.len());
        for (j, entry) in entries.into_iter().enumerate() {
            match (entry.uid, entry.body) {
                (_, None) => {
                    self.info(format_args!("Fetch returned empty body - skipping"));
                    stats.skipped += 1;
                }
                (None, _) => {
                    self.info(format_args!("Fetch returned empty UID - skipping"));
                    stats.skipped += 1;
                }
                (Some(uid), Some(body)) => {
                    self.debug(format_args!(
                        "uid: {} ({}/{}) - {} bytes",
                        uid,
                        offset + j,
                        count,
                        body.len()
                    ));
                    valid.push((uid, body, entry.flags));
                }
            }
        }
        valid
    }

    /// Commit a batch according to the store's strategy
    fn store(&mut self, messages: Vec<(u32, Vec<u8>, Vec<String>)>) -> Result<usize> {
        if messages.is_empty() {
            return Ok(0);
        }
        let count = messages.len();

        if self.serializer.strategy() == DownloadStrategy::Direct {
            for (uid, body, flags) in &messages {
                self.serializer
                    .transaction(|s| s.append(*uid, body, flags))?;
            }
        } else {
            self.serializer.transaction(|s| {
                for (uid, body, flags) in &messages {
                    s.append(*uid, body, flags)?;
                }
                Ok(())
            })?;
        }

        Ok(count)
    }

    fn debug(&self, args: std::fmt::Arguments<'_>) {
        self.logger
            .debug(format_args!("[{}] {}", self.folder.name(), args));
    }

    fn info(&self, args: std::fmt::Arguments<'_>) {
        self.logger
            .info(format_args!("[{}] {}", self.folder.name(), args));
    }
}
