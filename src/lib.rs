//! # GaldrDb — embedded single-file document database
//!
//! GaldrDb stores opaque byte documents in named collections, each addressed
//! by a 32-bit id, with snapshot-isolated transactions, WAL durability, and
//! B+ tree primary and secondary indexes.
//!
//! ## Quick start
//!
//! ```rust
//! use galdrdb::{Config, Database, CollectionSchema};
//!
//! # fn main() -> galdrdb::Result<()> {
//! # let dir = tempfile::tempdir().unwrap();
//! # let path = dir.path().join("example.gdb");
//! let db = Database::create(&path, Config::default())?;
//! db.create_collection(&CollectionSchema::plain("notes"))?;
//!
//! let mut tx = db.begin_transaction()?;
//! let id = tx.insert("notes", b"hello world".to_vec(), Vec::new())?;
//! tx.commit()?;
//!
//! let mut tx = db.begin_read_only_transaction()?;
//! assert_eq!(tx.get("notes", id)?, Some(b"hello world".to_vec()));
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **Pager**: fixed-size page I/O with an LRU cache, optional mmap reads,
//!   and optional AES-256-GCM at-rest encryption.
//! - **Allocation maps**: a one-bit-per-page bitmap and a two-bit
//!   free-space map over reserved page regions.
//! - **Document storage**: slotted pages for small documents, consecutive
//!   extent runs for large ones.
//! - **B+ trees**: crab-latched, integer-keyed primary and byte-string
//!   secondary indexes with duplicate posting lists.
//! - **MVCC**: an in-memory version index with commit-CSN visibility and
//!   first-committer-wins conflict detection.
//! - **WAL**: frame-based with per-frame CRC, commit flags, checkpointing,
//!   and crash recovery at open.

pub mod admin;
pub mod alloc;
pub mod btree;
pub mod config;
pub mod db;
pub mod error;
mod gc;
pub mod logging;
pub mod mvcc;
pub mod pager;
pub mod storage;
pub mod tx;

pub use admin::{CollectionStats, FragmentationEntry, Stats};
pub use btree::{encode_key, KeyComponent};
pub use config::{Config, EncryptionConfig};
pub use db::{CollectionSchema, Database, IndexSpec};
pub use error::{GaldrError, Result};
pub use gc::{GcStats, VacuumStats};
pub use mvcc::{Csn, TxId};
pub use storage::DocId;
pub use tx::{IndexKey, Transaction, TxState};
