//! B+ tree indexes.
//!
//! The primary tree maps document ids to slot locators; secondary trees map
//! sortable-encoded byte-string keys to duplicate posting lists. Both crab
//! their way down with per-page latches from [`latch`].

pub mod keys;
pub mod latch;
pub mod node;
pub mod primary;
pub mod secondary;

pub use keys::{encode_key, KeyComponent};
pub use latch::{LatchTable, LockStack, MAX_LATCH_DEPTH};
pub use node::{IndexEntry, OverflowPage, PostingValue, PrimaryNode, SecondaryNode};
pub use primary::PrimaryTree;
pub use secondary::{ScanBound, SecondaryTree};
