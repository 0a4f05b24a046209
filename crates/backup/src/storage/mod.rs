//! Local storage for backed-up folders
//!
//! Each folder is a [`Serializer`]: an append-only mboxrd body log paired
//! with a JSON metadata index, written through begin/commit/rollback
//! transactions.

mod mbox;
pub mod mboxrd;
mod metadata;
mod serializer;
mod transaction;

pub use mbox::Mbox;
pub use metadata::{IndexEntry, METADATA_VERSION, Metadata, MetadataError};
pub use serializer::{
    IntegrityError, InvalidFolderName, MBOX_EXTENSION, METADATA_EXTENSION, Serializer,
    StoredMessage, TransactionGuard, check_folder_name,
};
pub use transaction::{StagedEntry, TransactionStateError};

pub(crate) use serializer::with_suffix;
