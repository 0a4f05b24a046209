//! Transaction state for a serializer

use anyhow::Result;

/// An operation was called in the wrong transaction state
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{operation}: {reason}")]
pub struct TransactionStateError {
    pub operation: &'static str,
    pub reason: &'static str,
}

impl TransactionStateError {
    fn nested(operation: &'static str) -> Self {
        Self {
            operation,
            reason: "nested transactions are not supported",
        }
    }

    fn outside(operation: &'static str) -> Self {
        Self {
            operation,
            reason: "called outside a transaction",
        }
    }
}

/// A message appended to the body log but not yet indexed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedEntry {
    pub uid: u32,
    pub length: u64,
    pub flags: Vec<String>,
}

/// Data held while a transaction is active
#[derive(Debug, Default)]
pub(crate) struct TransactionData {
    /// Body log length when the transaction began
    pub mbox_length: u64,
    /// Number of index entries when the transaction began
    pub metadata_length: usize,
    pub staged: Vec<StagedEntry>,
    /// Serialized messages not yet written to the body log (delay_all)
    pub pending_bytes: Vec<u8>,
}

impl TransactionData {
    /// Body log length once every staged entry is written
    pub fn expected_mbox_length(&self) -> u64 {
        self.mbox_length + self.staged.iter().map(|e| e.length).sum::<u64>()
    }
}

/// Idle (`None`) or active (`Some`)
#[derive(Debug, Default)]
pub(crate) struct Transaction {
    data: Option<TransactionData>,
}

impl Transaction {
    pub fn is_active(&self) -> bool {
        self.data.is_some()
    }

    pub fn begin(&mut self, mbox_length: u64, metadata_length: usize) -> Result<()> {
        if self.is_active() {
            return Err(TransactionStateError::nested("begin_transaction").into());
        }
        self.data = Some(TransactionData {
            mbox_length,
            metadata_length,
            ..Default::default()
        });
        Ok(())
    }

    pub fn fail_in_transaction(&self, operation: &'static str) -> Result<()> {
        if self.is_active() {
            return Err(TransactionStateError::nested(operation).into());
        }
        Ok(())
    }

    /// Borrow the active transaction's data
    pub fn active(&mut self, operation: &'static str) -> Result<&mut TransactionData> {
        self.data
            .as_mut()
            .ok_or_else(|| TransactionStateError::outside(operation).into())
    }

    /// End the transaction, returning its data
    pub fn finish(&mut self, operation: &'static str) -> Result<TransactionData> {
        self.data
            .take()
            .ok_or_else(|| TransactionStateError::outside(operation).into())
    }
}
