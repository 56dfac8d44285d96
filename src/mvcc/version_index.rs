//! In-memory version index: `(collection, doc_id)` to version chain.
//!
//! Chains are singly linked newest-to-oldest. A version is visible to a
//! snapshot when it committed at or before the snapshot CSN and was not
//! superseded by then. `validate_and_install` is the single serialization
//! point for snapshot-isolation commit: under the index lock it re-checks
//! every read precondition, then installs all new heads atomically.
//!
//! A separate candidate set remembers every chain that has ever been
//! superseded or deleted, keeping garbage collection proportional to the
//! churn instead of the whole index.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{GaldrError, Result};
use crate::mvcc::{Csn, TxId, CSN_LIVE};
use crate::storage::{DocId, SlotPointer};

type ChainKey = (Arc<str>, DocId);

/// One committed version of a document.
#[derive(Debug)]
pub struct Version {
    /// Transaction that created this version.
    pub created_by: TxId,
    /// CSN this version became visible at. Zero for versions rebuilt from
    /// the primary tree at open.
    pub commit_csn: Csn,
    deleted_csn: AtomicU64,
    /// Physical location; `None` marks a delete tombstone.
    pub location: Option<SlotPointer>,
    /// Next-older version.
    pub previous: Option<Arc<Version>>,
}

impl Version {
    /// CSN this version stopped being current at; [`CSN_LIVE`] while live.
    pub fn deleted_csn(&self) -> Csn {
        self.deleted_csn.load(Ordering::Acquire)
    }

    /// Whether this version is still the current one.
    pub fn is_live(&self) -> bool {
        self.deleted_csn() == CSN_LIVE
    }

    /// Whether a snapshot at `csn` sees this version.
    pub fn visible_at(&self, csn: Csn) -> bool {
        self.commit_csn <= csn && self.deleted_csn() > csn
    }

    /// Whether the version marks a deletion.
    pub fn is_tombstone(&self) -> bool {
        self.location.is_none()
    }
}

/// One write a committing transaction asks the index to install.
#[derive(Clone, Debug)]
pub struct VersionOperation {
    /// Collection of the target document.
    pub collection: Arc<str>,
    /// Target document id.
    pub doc_id: DocId,
    /// New physical location; `None` installs a tombstone.
    pub location: Option<SlotPointer>,
    /// Creator TxId of the version the transaction read, for updates and
    /// deletes. First-committer-wins checks against this.
    pub read_version_tx: Option<TxId>,
    /// The op expects no live version (plain inserts, supplied-id inserts).
    pub expect_absent: bool,
}

/// A version GC may reclaim, with the storage it held.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CollectableVersion {
    /// Collection of the owning document.
    pub collection: Arc<str>,
    /// Owning document id.
    pub doc_id: DocId,
    /// Slot storage to free, unless another surviving version shares it.
    pub location: Option<SlotPointer>,
}

#[derive(Default)]
struct Inner {
    chains: HashMap<ChainKey, Arc<Version>>,
    candidates: HashSet<ChainKey>,
}

/// The version index. One mutex guards the map and the candidate set.
#[derive(Default)]
pub struct VersionIndex {
    inner: Mutex<Inner>,
}

impl VersionIndex {
    /// Empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Head version regardless of visibility.
    pub fn get_latest(&self, collection: &str, doc_id: DocId) -> Option<Arc<Version>> {
        let inner = self.inner.lock();
        inner
            .chains
            .get(&(Arc::from(collection), doc_id))
            .map(Arc::clone)
    }

    /// First version visible at `snapshot`, skipping tombstones.
    pub fn get_visible(
        &self,
        collection: &str,
        doc_id: DocId,
        snapshot: Csn,
    ) -> Option<Arc<Version>> {
        let inner = self.inner.lock();
        let head = inner.chains.get(&(Arc::from(collection), doc_id))?;
        visible_in_chain(head, snapshot)
    }

    /// Every document of `collection` with a visible version at `snapshot`.
    pub fn get_all_visible(&self, collection: &str, snapshot: Csn) -> Vec<(DocId, Arc<Version>)> {
        let inner = self.inner.lock();
        let mut out: Vec<(DocId, Arc<Version>)> = inner
            .chains
            .iter()
            .filter(|((coll, _), _)| coll.as_ref() == collection)
            .filter_map(|((_, doc_id), head)| {
                visible_in_chain(head, snapshot).map(|v| (*doc_id, v))
            })
            .collect();
        out.sort_by_key(|(doc_id, _)| *doc_id);
        out
    }

    /// Visible versions for a specific id set at `snapshot`.
    pub fn get_visible_for_ids(
        &self,
        collection: &str,
        ids: &[DocId],
        snapshot: Csn,
    ) -> Vec<(DocId, Arc<Version>)> {
        let inner = self.inner.lock();
        let coll: Arc<str> = Arc::from(collection);
        ids.iter()
            .filter_map(|&doc_id| {
                let head = inner.chains.get(&(Arc::clone(&coll), doc_id))?;
                visible_in_chain(head, snapshot).map(|v| (doc_id, v))
            })
            .collect()
    }

    /// Chain length for a document (diagnostics and GC tests).
    pub fn version_count(&self, collection: &str, doc_id: DocId) -> usize {
        let inner = self.inner.lock();
        let mut count = 0;
        let mut cursor = inner
            .chains
            .get(&(Arc::from(collection), doc_id))
            .map(Arc::clone);
        while let Some(v) = cursor {
            count += 1;
            cursor = v.previous.clone();
        }
        count
    }

    /// Checks every op's read precondition against the current heads.
    /// Raises `WriteConflict` naming the competing transaction on failure.
    pub fn validate(&self, ops: &[VersionOperation]) -> Result<()> {
        let inner = self.inner.lock();
        validate_locked(&inner, ops)
    }

    /// Atomic validate-and-install: the serialization point for commit.
    /// All ops install under one lock hold, superseding old heads at `csn`.
    pub fn validate_and_install(
        &self,
        tx_id: TxId,
        csn: Csn,
        ops: &[VersionOperation],
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        validate_locked(&inner, ops)?;

        for op in ops {
            let key = (Arc::clone(&op.collection), op.doc_id);
            let old_head = inner.chains.get(&key).map(Arc::clone);
            if let Some(old) = &old_head {
                old.deleted_csn.store(csn, Ordering::Release);
            }
            let version = Arc::new(Version {
                created_by: tx_id,
                commit_csn: csn,
                deleted_csn: AtomicU64::new(CSN_LIVE),
                location: op.location,
                previous: old_head.clone(),
            });
            inner.chains.insert(key.clone(), version);
            if old_head.is_some() || op.location.is_none() {
                inner.candidates.insert(key);
            }
        }
        Ok(())
    }

    /// Installs a single version rebuilt from the primary tree at open.
    pub fn install_initial(&self, collection: Arc<str>, doc_id: DocId, location: SlotPointer) {
        let mut inner = self.inner.lock();
        inner.chains.insert(
            (collection, doc_id),
            Arc::new(Version {
                created_by: 0,
                commit_csn: 0,
                deleted_csn: AtomicU64::new(CSN_LIVE),
                location: Some(location),
                previous: None,
            }),
        );
    }

    /// Splices `target` out of a chain. GC-only; `target` is matched by
    /// creator and CSN.
    pub fn unlink(&self, collection: &str, doc_id: DocId, target: &Version) -> bool {
        let mut inner = self.inner.lock();
        let key: ChainKey = (Arc::from(collection), doc_id);
        let Some(head) = inner.chains.get(&key).map(Arc::clone) else {
            return false;
        };
        let survivors: Vec<Arc<Version>> = chain_to_vec(&head)
            .into_iter()
            .filter(|v| !(v.created_by == target.created_by && v.commit_csn == target.commit_csn))
            .collect();
        if survivors.is_empty() {
            inner.chains.remove(&key);
            return true;
        }
        let rebuilt = rebuild_chain(&survivors);
        inner.chains.insert(key, rebuilt);
        true
    }

    /// Walks the candidate set reclaiming versions no live snapshot can see.
    /// Chains are pruned in place; the freed versions' storage locations are
    /// returned (already filtered against survivors sharing a slot).
    pub fn collect_garbage(&self, oldest_snapshot: Csn) -> Vec<CollectableVersion> {
        let mut inner = self.inner.lock();
        let mut freed = Vec::new();
        let keys: Vec<ChainKey> = inner.candidates.iter().cloned().collect();

        for key in keys {
            let Some(head) = inner.chains.get(&key).map(Arc::clone) else {
                inner.candidates.remove(&key);
                continue;
            };
            let versions = chain_to_vec(&head);
            let mut survivors = Vec::new();
            let mut collected = Vec::new();
            for v in versions {
                let deleted = v.deleted_csn();
                // Invisible to every snapshot at or above the horizon. A
                // tombstone head falls out once the horizon passes it.
                let dead_history = deleted != CSN_LIVE && deleted <= oldest_snapshot;
                let dead_tombstone = v.is_tombstone() && v.commit_csn <= oldest_snapshot;
                if dead_history || dead_tombstone {
                    collected.push(v);
                } else {
                    survivors.push(v);
                }
            }
            if collected.is_empty() {
                if survivors.len() <= 1 && survivors.iter().all(|v| !v.is_tombstone()) {
                    inner.candidates.remove(&key);
                }
                continue;
            }

            let survivor_locations: HashSet<SlotPointer> =
                survivors.iter().filter_map(|v| v.location).collect();
            for v in &collected {
                freed.push(CollectableVersion {
                    collection: Arc::clone(&key.0),
                    doc_id: key.1,
                    location: v
                        .location
                        .filter(|loc| !survivor_locations.contains(loc)),
                });
            }

            if survivors.is_empty() {
                inner.chains.remove(&key);
                inner.candidates.remove(&key);
            } else {
                let rebuilt = rebuild_chain(&survivors);
                inner.chains.insert(key.clone(), rebuilt);
                if survivors.len() <= 1 && survivors.iter().all(|v| !v.is_tombstone()) {
                    inner.candidates.remove(&key);
                }
            }
        }
        freed
    }

    /// Every storage location referenced by any chain version, current or
    /// superseded. Verification uses this to tell pinned history apart from
    /// leaked pages.
    pub fn all_locations(&self) -> Vec<SlotPointer> {
        let inner = self.inner.lock();
        let mut out = Vec::new();
        for head in inner.chains.values() {
            let mut cursor = Some(Arc::clone(head));
            while let Some(v) = cursor {
                if let Some(loc) = v.location {
                    out.push(loc);
                }
                cursor = v.previous.clone();
            }
        }
        out
    }

    /// Chains currently tracked (diagnostics).
    pub fn chain_count(&self) -> usize {
        self.inner.lock().chains.len()
    }

    /// Candidate chains awaiting GC (diagnostics).
    pub fn candidate_count(&self) -> usize {
        self.inner.lock().candidates.len()
    }
}

fn visible_in_chain(head: &Arc<Version>, snapshot: Csn) -> Option<Arc<Version>> {
    let mut cursor = Some(Arc::clone(head));
    while let Some(v) = cursor {
        if v.visible_at(snapshot) {
            return if v.is_tombstone() { None } else { Some(v) };
        }
        cursor = v.previous.clone();
    }
    None
}

fn validate_locked(inner: &Inner, ops: &[VersionOperation]) -> Result<()> {
    for op in ops {
        let key = (Arc::clone(&op.collection), op.doc_id);
        let head = inner.chains.get(&key);
        if op.expect_absent {
            if let Some(head) = head {
                if head.is_live() && !head.is_tombstone() {
                    return Err(GaldrError::WriteConflict {
                        collection: op.collection.to_string(),
                        doc_id: op.doc_id,
                        conflicting_tx: head.created_by,
                    });
                }
            }
            continue;
        }
        if let Some(expected) = op.read_version_tx {
            match head {
                Some(head) if head.created_by == expected && !head.is_tombstone() => {}
                Some(head) => {
                    return Err(GaldrError::WriteConflict {
                        collection: op.collection.to_string(),
                        doc_id: op.doc_id,
                        conflicting_tx: head.created_by,
                    });
                }
                None => {
                    return Err(GaldrError::WriteConflict {
                        collection: op.collection.to_string(),
                        doc_id: op.doc_id,
                        conflicting_tx: 0,
                    });
                }
            }
        }
    }
    Ok(())
}

fn chain_to_vec(head: &Arc<Version>) -> Vec<Arc<Version>> {
    let mut out = Vec::new();
    let mut cursor = Some(Arc::clone(head));
    while let Some(v) = cursor {
        cursor = v.previous.clone();
        out.push(v);
    }
    out
}

/// Relinks surviving versions (given newest-first) into a fresh chain.
fn rebuild_chain(survivors: &[Arc<Version>]) -> Arc<Version> {
    let mut prev: Option<Arc<Version>> = None;
    for v in survivors.iter().rev() {
        prev = Some(Arc::new(Version {
            created_by: v.created_by,
            commit_csn: v.commit_csn,
            deleted_csn: AtomicU64::new(v.deleted_csn()),
            location: v.location,
            previous: prev,
        }));
    }
    prev.expect("survivors is non-empty")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coll() -> Arc<str> {
        Arc::from("docs")
    }

    fn loc(n: u32) -> SlotPointer {
        SlotPointer {
            page_id: n,
            slot: 0,
        }
    }

    fn insert_op(doc_id: DocId, location: SlotPointer) -> VersionOperation {
        VersionOperation {
            collection: coll(),
            doc_id,
            location: Some(location),
            read_version_tx: None,
            expect_absent: true,
        }
    }

    fn update_op(doc_id: DocId, location: SlotPointer, read_tx: TxId) -> VersionOperation {
        VersionOperation {
            collection: coll(),
            doc_id,
            location: Some(location),
            read_version_tx: Some(read_tx),
            expect_absent: false,
        }
    }

    fn delete_op(doc_id: DocId, read_tx: TxId) -> VersionOperation {
        VersionOperation {
            collection: coll(),
            doc_id,
            location: None,
            read_version_tx: Some(read_tx),
            expect_absent: false,
        }
    }

    #[test]
    fn snapshot_visibility_walks_the_chain() {
        let index = VersionIndex::new();
        index
            .validate_and_install(1, 10, &[insert_op(7, loc(100))])
            .expect("insert");
        index
            .validate_and_install(2, 20, &[update_op(7, loc(200), 1)])
            .expect("update");

        assert!(index.get_visible("docs", 7, 9).is_none(), "before creation");
        let v10 = index.get_visible("docs", 7, 10).expect("at 10");
        assert_eq!(v10.location, Some(loc(100)));
        let v15 = index.get_visible("docs", 7, 15).expect("at 15");
        assert_eq!(v15.location, Some(loc(100)));
        let v20 = index.get_visible("docs", 7, 20).expect("at 20");
        assert_eq!(v20.location, Some(loc(200)));
        assert_eq!(index.version_count("docs", 7), 2);
    }

    #[test]
    fn exactly_one_version_visible_per_snapshot() {
        let index = VersionIndex::new();
        index
            .validate_and_install(1, 1, &[insert_op(3, loc(1))])
            .expect("v1");
        index
            .validate_and_install(2, 2, &[update_op(3, loc(2), 1)])
            .expect("v2");
        index
            .validate_and_install(3, 3, &[update_op(3, loc(3), 2)])
            .expect("v3");

        for snapshot in 0..5u64 {
            let visible: Vec<_> = (1..=3u32)
                .filter_map(|n| {
                    index
                        .get_visible("docs", 3, snapshot)
                        .filter(|v| v.location == Some(loc(n)))
                })
                .collect();
            assert!(visible.len() <= 1, "snapshot {snapshot} sees {}", visible.len());
        }
    }

    #[test]
    fn first_committer_wins() {
        let index = VersionIndex::new();
        index
            .validate_and_install(1, 10, &[insert_op(7, loc(1))])
            .expect("seed");

        // Both writers read the version created by tx 1. The first install
        // succeeds; the second must name the winner.
        index
            .validate_and_install(5, 11, &[update_op(7, loc(2), 1)])
            .expect("first committer");
        match index.validate_and_install(6, 12, &[update_op(7, loc(3), 1)]) {
            Err(GaldrError::WriteConflict {
                collection,
                doc_id,
                conflicting_tx,
            }) => {
                assert_eq!(collection, "docs");
                assert_eq!(doc_id, 7);
                assert_eq!(conflicting_tx, 5);
            }
            other => panic!("expected WriteConflict, got {other:?}"),
        }
    }

    #[test]
    fn insert_conflicts_with_live_document() {
        let index = VersionIndex::new();
        index
            .validate_and_install(1, 1, &[insert_op(9, loc(1))])
            .expect("insert");
        assert!(matches!(
            index.validate_and_install(2, 2, &[insert_op(9, loc(2))]),
            Err(GaldrError::WriteConflict { conflicting_tx: 1, .. })
        ));

        // After a committed delete the id is reusable.
        index
            .validate_and_install(3, 3, &[delete_op(9, 1)])
            .expect("delete");
        index
            .validate_and_install(4, 4, &[insert_op(9, loc(3))])
            .expect("reinsert");
    }

    #[test]
    fn tombstone_hides_the_document() {
        let index = VersionIndex::new();
        index
            .validate_and_install(1, 1, &[insert_op(4, loc(1))])
            .expect("insert");
        index
            .validate_and_install(2, 5, &[delete_op(4, 1)])
            .expect("delete");

        assert!(index.get_visible("docs", 4, 4).is_some(), "pre-delete snapshot");
        assert!(index.get_visible("docs", 4, 5).is_none(), "post-delete snapshot");
        assert!(index.get_latest("docs", 4).expect("head").is_tombstone());
    }

    #[test]
    fn gc_reclaims_history_below_the_horizon() {
        let index = VersionIndex::new();
        index
            .validate_and_install(1, 1, &[insert_op(2, loc(1))])
            .expect("insert");
        for i in 2..=10u64 {
            index
                .validate_and_install(i, i, &[update_op(2, loc(i as u32), i - 1)])
                .expect("update");
        }
        assert_eq!(index.version_count("docs", 2), 10);

        let freed = index.collect_garbage(10);
        assert_eq!(freed.len(), 9, "all superseded versions free");
        assert!(freed.iter().all(|c| c.location.is_some()));
        assert_eq!(index.version_count("docs", 2), 1);
        assert_eq!(index.candidate_count(), 0);

        // Nothing left to collect on a second pass.
        assert!(index.collect_garbage(10).is_empty());
    }

    #[test]
    fn gc_respects_old_snapshots() {
        let index = VersionIndex::new();
        index
            .validate_and_install(1, 1, &[insert_op(2, loc(1))])
            .expect("insert");
        index
            .validate_and_install(2, 5, &[update_op(2, loc(2), 1)])
            .expect("update");

        // A snapshot at 3 still needs the first version.
        assert!(index.collect_garbage(3).is_empty());
        let old = index.get_visible("docs", 2, 3).expect("old version");
        assert_eq!(old.location, Some(loc(1)));

        let freed = index.collect_garbage(5);
        assert_eq!(freed.len(), 1);
    }

    #[test]
    fn fully_dead_chain_disappears() {
        let index = VersionIndex::new();
        index
            .validate_and_install(1, 1, &[insert_op(8, loc(1))])
            .expect("insert");
        index
            .validate_and_install(2, 2, &[delete_op(8, 1)])
            .expect("delete");

        let freed = index.collect_garbage(2);
        assert_eq!(freed.len(), 2, "old version and tombstone both collect");
        assert_eq!(index.chain_count(), 0);
        assert!(index.get_latest("docs", 8).is_none());
    }

    #[test]
    fn shared_locations_are_not_freed_twice() {
        let index = VersionIndex::new();
        index
            .validate_and_install(1, 1, &[insert_op(5, loc(77))])
            .expect("insert");
        // Same location carried forward (e.g. metadata-only supersede).
        index
            .validate_and_install(2, 2, &[update_op(5, loc(77), 1)])
            .expect("update");

        let freed = index.collect_garbage(2);
        assert_eq!(freed.len(), 1);
        assert_eq!(freed[0].location, None, "survivor still references the slot");
    }

    #[test]
    fn unlink_splices_a_specific_version() {
        let index = VersionIndex::new();
        index
            .validate_and_install(1, 1, &[insert_op(6, loc(1))])
            .expect("insert");
        index
            .validate_and_install(2, 2, &[update_op(6, loc(2), 1)])
            .expect("update");

        let old = index
            .get_visible("docs", 6, 1)
            .expect("old version handle");
        assert!(index.unlink("docs", 6, &old));
        assert_eq!(index.version_count("docs", 6), 1);
        let head = index.get_latest("docs", 6).expect("head survives");
        assert_eq!(head.location, Some(loc(2)));
    }
}
