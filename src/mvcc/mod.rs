//! Multi-version concurrency control: snapshot visibility, the version
//! index, and transaction/commit sequencing.

pub mod manager;
pub mod version_index;

pub use manager::{Snapshot, TxManager};
pub use version_index::{CollectableVersion, Version, VersionIndex, VersionOperation};

/// Monotonic identifier assigned at transaction start.
pub type TxId = u64;

/// Commit sequence number; monotonic, assigned at commit, defines snapshot
/// visibility.
pub type Csn = u64;

/// Sentinel `deleted_csn` meaning "still live".
pub const CSN_LIVE: Csn = u64::MAX;
