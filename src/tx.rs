//! Transactions: private read and write sets over a shared snapshot.
//!
//! A transaction is a short-lived value borrowing the database core. Reads
//! resolve against the write set first (read-your-own-writes), then the
//! version index at the snapshot CSN fixed at begin. Writes accumulate in
//! insertion order and touch shared storage only inside commit, which the
//! database serializes.

use std::collections::HashMap;
use std::sync::Arc;

use crate::btree::{ScanBound, SecondaryTree};
use crate::db::Database;
use crate::error::{GaldrError, Result};
use crate::mvcc::{Snapshot, TxId};
use crate::storage::catalog::Catalog;
use crate::storage::{docs, DocId, SlotPointer};

/// Lifecycle state of a transaction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TxState {
    /// Accepting operations.
    Active,
    /// Commit finished.
    Committed,
    /// Rolled back (explicitly or by drop).
    RolledBack,
}

/// One index key emitted by the document codec for an indexed field.
/// `key: None` encodes a null field: it is not stored in the index and never
/// participates in unique checks.
#[derive(Clone, Debug)]
pub struct IndexKey {
    /// Target index name.
    pub index: String,
    /// Sortable-encoded key bytes, or `None` for null.
    pub key: Option<Vec<u8>>,
}

impl IndexKey {
    /// Convenience constructor.
    pub fn new(index: impl Into<String>, key: Option<Vec<u8>>) -> Self {
        Self {
            index: index.into(),
            key,
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) enum WriteOp {
    Insert {
        bytes: Vec<u8>,
        keys: Vec<IndexKey>,
    },
    Update {
        bytes: Vec<u8>,
        keys: Vec<IndexKey>,
        old_keys: Vec<IndexKey>,
        read_tx: TxId,
        prev_location: SlotPointer,
    },
    Delete {
        old_keys: Vec<IndexKey>,
        read_tx: TxId,
        prev_location: SlotPointer,
    },
}

#[derive(Clone, Debug)]
pub(crate) struct WriteEntry {
    pub collection: Arc<str>,
    pub doc_id: DocId,
    pub op: WriteOp,
}

/// Everything commit needs once the transaction hands over control.
pub(crate) struct CommitParts {
    pub snapshot: Snapshot,
    pub write_set: Vec<WriteEntry>,
}

/// A transaction over a [`Database`].
pub struct Transaction<'db> {
    db: &'db Database,
    snapshot: Snapshot,
    catalog: Arc<Catalog>,
    read_only: bool,
    state: TxState,
    write_set: Vec<WriteEntry>,
    write_index: HashMap<(Arc<str>, DocId), usize>,
    read_set: HashMap<(Arc<str>, DocId), TxId>,
}

impl<'db> Transaction<'db> {
    pub(crate) fn new(db: &'db Database, snapshot: Snapshot, read_only: bool) -> Self {
        Self {
            db,
            snapshot,
            catalog: db.catalog_snapshot(),
            read_only,
            state: TxState::Active,
            write_set: Vec::new(),
            write_index: HashMap::new(),
            read_set: HashMap::new(),
        }
    }

    /// Transaction id.
    pub fn id(&self) -> TxId {
        self.snapshot.tx_id
    }

    /// Snapshot CSN this transaction reads at.
    pub fn snapshot_csn(&self) -> u64 {
        self.snapshot.csn
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TxState {
        self.state
    }

    fn ensure_active(&self) -> Result<()> {
        if self.state != TxState::Active {
            return Err(GaldrError::InvalidArgument(
                "transaction is no longer active".into(),
            ));
        }
        self.db.check_usable()
    }

    fn ensure_writable(&self) -> Result<()> {
        self.ensure_active()?;
        if self.read_only {
            return Err(GaldrError::InvalidArgument(
                "transaction is read-only".into(),
            ));
        }
        self.db.check_writable()
    }

    fn coll_key(&self, collection: &str, doc_id: DocId) -> Result<(Arc<str>, DocId)> {
        let meta = self.catalog.require(collection)?;
        Ok((Arc::clone(&meta.name), doc_id))
    }

    /// Reads a document at this transaction's snapshot. Own writes win.
    pub fn get(&mut self, collection: &str, doc_id: DocId) -> Result<Option<Vec<u8>>> {
        self.ensure_active()?;
        let key = self.coll_key(collection, doc_id)?;

        if let Some(&idx) = self.write_index.get(&key) {
            return Ok(match &self.write_set[idx].op {
                WriteOp::Insert { bytes, .. } | WriteOp::Update { bytes, .. } => {
                    Some(bytes.clone())
                }
                WriteOp::Delete { .. } => None,
            });
        }

        let Some(version) = self
            .db
            .versions()
            .get_visible(collection, doc_id, self.snapshot.csn)
        else {
            return Ok(None);
        };
        let location = version
            .location
            .ok_or_else(|| GaldrError::corrupt("visible version without storage"))?;
        let bytes = docs::read_document(self.db.pager(), location)?;
        self.read_set.insert(key, version.created_by);
        Ok(Some(bytes))
    }

    /// Reads several documents at once.
    pub fn get_many(
        &mut self,
        collection: &str,
        ids: &[DocId],
    ) -> Result<Vec<(DocId, Vec<u8>)>> {
        let mut out = Vec::with_capacity(ids.len());
        for &id in ids {
            if let Some(bytes) = self.get(collection, id)? {
                out.push((id, bytes));
            }
        }
        Ok(out)
    }

    /// Inserts a document, assigning the next id from the collection.
    pub fn insert(
        &mut self,
        collection: &str,
        bytes: Vec<u8>,
        keys: Vec<IndexKey>,
    ) -> Result<DocId> {
        self.ensure_writable()?;
        let doc_id = self.db.reserve_doc_id(&self.catalog, collection)?;
        self.insert_with_id(collection, doc_id, bytes, keys)?;
        Ok(doc_id)
    }

    /// Inserts a document under a caller-supplied id. Fails if a live
    /// version already exists.
    pub fn insert_with_id(
        &mut self,
        collection: &str,
        doc_id: DocId,
        bytes: Vec<u8>,
        keys: Vec<IndexKey>,
    ) -> Result<()> {
        self.ensure_writable()?;
        if doc_id == 0 {
            return Err(GaldrError::InvalidArgument("document id zero is reserved".into()));
        }
        let key = self.coll_key(collection, doc_id)?;

        if let Some(&idx) = self.write_index.get(&key) {
            // Delete-then-reinsert inside one transaction nets to an update
            // of the committed version.
            let entry = &self.write_set[idx];
            if let WriteOp::Delete {
                old_keys,
                read_tx,
                prev_location,
            } = &entry.op
            {
                let merged = WriteOp::Update {
                    bytes,
                    keys,
                    old_keys: old_keys.clone(),
                    read_tx: *read_tx,
                    prev_location: *prev_location,
                };
                self.write_set[idx].op = merged;
                return Ok(());
            }
            return Err(GaldrError::InvalidArgument(format!(
                "document {doc_id} already written in this transaction"
            )));
        }

        if let Some(head) = self.db.versions().get_latest(collection, doc_id) {
            if head.is_live() && !head.is_tombstone() {
                return Err(GaldrError::WriteConflict {
                    collection: collection.to_string(),
                    doc_id,
                    conflicting_tx: head.created_by,
                });
            }
        }
        self.db.note_supplied_id(collection, doc_id);

        self.push_entry(WriteEntry {
            collection: key.0,
            doc_id,
            op: WriteOp::Insert { bytes, keys },
        });
        Ok(())
    }

    /// Replaces a document's bytes and index keys. `old_keys` are the keys
    /// the codec derived from the currently visible bytes.
    pub fn update(
        &mut self,
        collection: &str,
        doc_id: DocId,
        bytes: Vec<u8>,
        keys: Vec<IndexKey>,
        old_keys: Vec<IndexKey>,
    ) -> Result<()> {
        self.ensure_writable()?;
        if doc_id == 0 {
            return Err(GaldrError::InvalidArgument("document id zero is reserved".into()));
        }
        let key = self.coll_key(collection, doc_id)?;

        if let Some(&idx) = self.write_index.get(&key) {
            let entry = &mut self.write_set[idx];
            match &mut entry.op {
                WriteOp::Insert { bytes: b, keys: k } => {
                    *b = bytes;
                    *k = keys;
                    return Ok(());
                }
                WriteOp::Update { bytes: b, keys: k, .. } => {
                    *b = bytes;
                    *k = keys;
                    return Ok(());
                }
                WriteOp::Delete { .. } => {
                    return Err(GaldrError::InvalidArgument(format!(
                        "document {doc_id} deleted earlier in this transaction"
                    )));
                }
            }
        }

        let version = self
            .db
            .versions()
            .get_visible(collection, doc_id, self.snapshot.csn)
            .ok_or_else(|| {
                GaldrError::InvalidArgument(format!(
                    "update of {collection}/{doc_id} which is not visible at this snapshot"
                ))
            })?;
        let prev_location = version
            .location
            .ok_or_else(|| GaldrError::corrupt("visible version without storage"))?;
        self.read_set.insert(key.clone(), version.created_by);

        self.push_entry(WriteEntry {
            collection: key.0,
            doc_id,
            op: WriteOp::Update {
                bytes,
                keys,
                old_keys,
                read_tx: version.created_by,
                prev_location,
            },
        });
        Ok(())
    }

    /// Deletes a document. `old_keys` mirror [`update`](Self::update).
    pub fn delete(
        &mut self,
        collection: &str,
        doc_id: DocId,
        old_keys: Vec<IndexKey>,
    ) -> Result<()> {
        self.ensure_writable()?;
        if doc_id == 0 {
            return Err(GaldrError::InvalidArgument("document id zero is reserved".into()));
        }
        let key = self.coll_key(collection, doc_id)?;

        if let Some(&idx) = self.write_index.get(&key) {
            let entry = &self.write_set[idx];
            match &entry.op {
                WriteOp::Insert { .. } => {
                    // Insert-then-delete nets to nothing.
                    self.remove_entry(idx);
                    return Ok(());
                }
                WriteOp::Update {
                    old_keys: original_old,
                    read_tx,
                    prev_location,
                    ..
                } => {
                    let merged = WriteOp::Delete {
                        old_keys: original_old.clone(),
                        read_tx: *read_tx,
                        prev_location: *prev_location,
                    };
                    self.write_set[idx].op = merged;
                    return Ok(());
                }
                WriteOp::Delete { .. } => {
                    return Err(GaldrError::InvalidArgument(format!(
                        "document {doc_id} deleted earlier in this transaction"
                    )));
                }
            }
        }

        let version = self
            .db
            .versions()
            .get_visible(collection, doc_id, self.snapshot.csn)
            .ok_or_else(|| {
                GaldrError::InvalidArgument(format!(
                    "delete of {collection}/{doc_id} which is not visible at this snapshot"
                ))
            })?;
        let prev_location = version
            .location
            .ok_or_else(|| GaldrError::corrupt("visible version without storage"))?;
        self.read_set.insert(key.clone(), version.created_by);

        self.push_entry(WriteEntry {
            collection: key.0,
            doc_id,
            op: WriteOp::Delete {
                old_keys,
                read_tx: version.created_by,
                prev_location,
            },
        });
        Ok(())
    }

    /// Every visible document in id order, own writes folded in.
    pub fn scan(&mut self, collection: &str) -> Result<Vec<(DocId, Vec<u8>)>> {
        self.scan_range(collection, 0, DocId::MAX)
    }

    /// Visible documents with `lo <= id <= hi`, own writes folded in.
    pub fn scan_range(
        &mut self,
        collection: &str,
        lo: DocId,
        hi: DocId,
    ) -> Result<Vec<(DocId, Vec<u8>)>> {
        self.ensure_active()?;
        self.catalog.require(collection)?;

        let mut rows: Vec<(DocId, Vec<u8>)> = Vec::new();
        for (doc_id, version) in self
            .db
            .versions()
            .get_all_visible(collection, self.snapshot.csn)
        {
            if doc_id < lo || doc_id > hi {
                continue;
            }
            let key = (Arc::clone(version_collection(&self.catalog, collection)?), doc_id);
            if let Some(&idx) = self.write_index.get(&key) {
                match &self.write_set[idx].op {
                    WriteOp::Insert { bytes, .. } | WriteOp::Update { bytes, .. } => {
                        rows.push((doc_id, bytes.clone()));
                    }
                    WriteOp::Delete { .. } => {}
                }
                continue;
            }
            let location = version
                .location
                .ok_or_else(|| GaldrError::corrupt("visible version without storage"))?;
            rows.push((doc_id, docs::read_document(self.db.pager(), location)?));
        }

        // Own inserts not yet committed are invisible to the version index.
        for entry in &self.write_set {
            if entry.collection.as_ref() != collection
                || entry.doc_id < lo
                || entry.doc_id > hi
            {
                continue;
            }
            if let WriteOp::Insert { bytes, .. } = &entry.op {
                rows.push((entry.doc_id, bytes.clone()));
            }
        }
        rows.sort_by_key(|(id, _)| *id);
        rows.dedup_by_key(|(id, _)| *id);
        Ok(rows)
    }

    /// Documents matching an exact secondary-index key, filtered to this
    /// snapshot. Reflects committed index state only.
    pub fn index_exact(
        &mut self,
        collection: &str,
        index: &str,
        key: &[u8],
    ) -> Result<Vec<(DocId, Vec<u8>)>> {
        self.ensure_active()?;
        let root = self.index_root(collection, index)?;
        let tree = SecondaryTree::new(
            self.db.pager(),
            self.db.latches(),
            root,
            self.db.secondary_order(),
        );
        let entries = tree.exact(key)?;
        self.materialize_index_hits(collection, entries)
    }

    /// Documents whose index key starts with `prefix` (leftmost-prefix
    /// access for composite indexes), in key order.
    pub fn index_prefix(
        &mut self,
        collection: &str,
        index: &str,
        prefix: &[u8],
    ) -> Result<Vec<(DocId, Vec<u8>)>> {
        self.ensure_active()?;
        let root = self.index_root(collection, index)?;
        let tree = SecondaryTree::new(
            self.db.pager(),
            self.db.latches(),
            root,
            self.db.secondary_order(),
        );
        let hits = tree.prefix(prefix)?;
        let entries: Vec<_> = hits.into_iter().flat_map(|(_, e)| e).collect();
        self.materialize_index_hits(collection, entries)
    }

    /// Documents with index keys in the given range, in key order.
    /// `inclusive` applies to both bounds.
    pub fn index_range(
        &mut self,
        collection: &str,
        index: &str,
        lo: Option<&[u8]>,
        hi: Option<&[u8]>,
        inclusive: bool,
    ) -> Result<Vec<(DocId, Vec<u8>)>> {
        self.ensure_active()?;
        let root = self.index_root(collection, index)?;
        let tree = SecondaryTree::new(
            self.db.pager(),
            self.db.latches(),
            root,
            self.db.secondary_order(),
        );
        let lo_bound = match (lo, inclusive) {
            (None, _) => ScanBound::Unbounded,
            (Some(b), true) => ScanBound::Included(b),
            (Some(b), false) => ScanBound::Excluded(b),
        };
        let hi_bound = match (hi, inclusive) {
            (None, _) => ScanBound::Unbounded,
            (Some(b), true) => ScanBound::Included(b),
            (Some(b), false) => ScanBound::Excluded(b),
        };
        let hits = tree.range(lo_bound, hi_bound)?;
        let entries: Vec<_> = hits.into_iter().flat_map(|(_, e)| e).collect();
        self.materialize_index_hits(collection, entries)
    }

    /// Filters index postings by snapshot visibility: an entry counts only
    /// when the visible version is the exact version the entry indexed.
    fn materialize_index_hits(
        &mut self,
        collection: &str,
        entries: Vec<crate::btree::IndexEntry>,
    ) -> Result<Vec<(DocId, Vec<u8>)>> {
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            let Some(version) =
                self.db
                    .versions()
                    .get_visible(collection, entry.doc_id, self.snapshot.csn)
            else {
                continue;
            };
            if version.location != Some(entry.ptr) {
                continue;
            }
            out.push((entry.doc_id, docs::read_document(self.db.pager(), entry.ptr)?));
        }
        Ok(out)
    }

    fn index_root(&self, collection: &str, index: &str) -> Result<crate::pager::PageId> {
        let meta = self.catalog.require(collection)?;
        let def = meta.index(index).ok_or_else(|| {
            GaldrError::InvalidArgument(format!("unknown index {index:?} on {collection:?}"))
        })?;
        Ok(def.root_page)
    }

    fn push_entry(&mut self, entry: WriteEntry) {
        let key = (Arc::clone(&entry.collection), entry.doc_id);
        self.write_index.insert(key, self.write_set.len());
        self.write_set.push(entry);
    }

    fn remove_entry(&mut self, idx: usize) {
        let entry = self.write_set.remove(idx);
        self.write_index
            .remove(&(Arc::clone(&entry.collection), entry.doc_id));
        for (i, e) in self.write_set.iter().enumerate().skip(idx) {
            self.write_index
                .insert((Arc::clone(&e.collection), e.doc_id), i);
        }
    }

    /// Number of pending writes.
    pub fn pending_writes(&self) -> usize {
        self.write_set.len()
    }

    /// Three-phase commit: storage writes, atomic version install, WAL
    /// commit. Consumes the transaction.
    pub fn commit(mut self) -> Result<()> {
        self.ensure_active()?;
        if !self.write_set.is_empty() {
            self.ensure_writable()?;
        }
        let parts = CommitParts {
            snapshot: self.snapshot,
            write_set: std::mem::take(&mut self.write_set),
        };
        let result = self.db.commit_transaction(parts);
        self.state = match result {
            Ok(()) => TxState::Committed,
            Err(_) => TxState::RolledBack,
        };
        result
    }

    /// Discards the write set; no frames reach the WAL.
    pub fn rollback(mut self) -> Result<()> {
        self.ensure_active()?;
        self.db.rollback_transaction(self.snapshot.tx_id);
        self.state = TxState::RolledBack;
        Ok(())
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.state == TxState::Active {
            self.db.rollback_transaction(self.snapshot.tx_id);
            self.state = TxState::RolledBack;
        }
    }
}

fn version_collection<'c>(catalog: &'c Catalog, collection: &str) -> Result<&'c Arc<str>> {
    Ok(&catalog.require(collection)?.name)
}
