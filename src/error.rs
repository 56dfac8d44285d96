//! Crate-wide error type and result alias.

use std::io;

use thiserror::Error;

use crate::mvcc::TxId;
use crate::pager::PageId;
use crate::storage::DocId;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, GaldrError>;

/// Errors surfaced by the storage and concurrency core.
#[derive(Debug, Error)]
pub enum GaldrError {
    /// Non-recoverable I/O from the pager or WAL.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A concurrent transaction committed a conflicting version first.
    /// The caller may retry with a fresh snapshot.
    #[error("write conflict on {collection}/{doc_id}: superseded by tx {conflicting_tx}")]
    WriteConflict {
        /// Collection holding the contested document.
        collection: String,
        /// Document the two transactions raced on.
        doc_id: DocId,
        /// Transaction that committed the conflicting version.
        conflicting_tx: TxId,
    },

    /// A unique secondary index refused a duplicate key.
    #[error("unique constraint violation on index {index}: key {key:02x?}")]
    UniqueConstraintViolation {
        /// Name of the offending index.
        index: String,
        /// Encoded key that already exists.
        key: Vec<u8>,
    },

    /// A slot locator resolved to storage a concurrent GC already removed.
    /// The caller holds a stale locator and must re-read via the version index.
    #[error("document slot {slot} on page {page_id} was deleted")]
    DocumentSlotDeleted {
        /// Page the stale locator pointed at.
        page_id: PageId,
        /// Slot index within that page.
        slot: u16,
    },

    /// CRC mismatch, bad page type, or out-of-range pointer. The database is
    /// marked read-only once this surfaces.
    #[error("storage corrupt{}: {reason}", format_page(.page_id))]
    StorageCorrupt {
        /// Page the corruption was detected on, when attributable.
        page_id: Option<PageId>,
        /// Human-readable description of the damage.
        reason: String,
    },

    /// WAL recovery could not reach a consistent state.
    #[error("recovery failed at frame {frame}: {reason}")]
    RecoveryFailed {
        /// Frame number recovery stopped at.
        frame: u32,
        /// Why the frame could not be applied.
        reason: String,
    },

    /// Caller misuse: bad configuration, zero doc id, closed handle.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl GaldrError {
    /// Corruption attributed to a specific page.
    pub fn corrupt_page(page_id: PageId, reason: impl Into<String>) -> Self {
        Self::StorageCorrupt {
            page_id: Some(page_id),
            reason: reason.into(),
        }
    }

    /// Corruption with no single offending page (file headers, WAL).
    pub fn corrupt(reason: impl Into<String>) -> Self {
        Self::StorageCorrupt {
            page_id: None,
            reason: reason.into(),
        }
    }

    /// True for errors that poison the database handle.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::StorageCorrupt { .. } | Self::RecoveryFailed { .. }
        )
    }
}

fn format_page(page_id: &Option<PageId>) -> String {
    match page_id {
        Some(id) => format!(" on page {id}"),
        None => String::new(),
    }
}
