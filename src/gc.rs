//! Garbage collection, vacuum, and whole-file compaction.
//!
//! GC reclaims versions below the oldest live snapshot: the version index
//! unlinks them, then their slotted storage is freed under a WAL
//! transaction. Vacuum is the user-invoked full sweep: GC, page compaction,
//! dense tree rebuilds, and file truncation. `compact_to` streams the live
//! snapshot into a fresh database file.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::btree::{PostingValue, PrimaryNode, PrimaryTree, SecondaryNode, SecondaryTree};
use crate::db::{CollectionSchema, Database, IndexSpec};
use crate::error::{GaldrError, Result};
use crate::pager::{PageId, Pager};
use crate::storage::doc_page::DocPage;
use crate::storage::docs::DocStore;
use crate::storage::{page_type, DocId, SlotPointer};
use crate::tx::IndexKey;

/// Compaction pays off once this many bytes are reclaimable on a page.
pub const COMPACTION_MIN_GAIN: usize = 64;

/// Outcome of one garbage-collection pass.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct GcStats {
    /// Versions unlinked from their chains.
    pub collected_versions: usize,
    /// Document slots physically freed.
    pub freed_slots: usize,
}

/// Outcome of a vacuum sweep.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct VacuumStats {
    /// GC results of the leading pass.
    pub gc: GcStats,
    /// Document pages compacted in place.
    pub compacted_pages: usize,
    /// Trees rebuilt dense.
    pub rebuilt_trees: usize,
    /// Pages trimmed off the file tail.
    pub truncated_pages: u32,
}

impl Database {
    /// Collects versions invisible to every live snapshot and frees their
    /// storage. Safe to call at any time; a no-op when nothing is dead.
    pub fn run_gc(&self) -> Result<GcStats> {
        self.check_writable()?;
        let _guard = self.commit_lock.lock();

        let oldest = self.manager.oldest_active_snapshot_csn();
        let collectables = self.versions.collect_garbage(oldest);
        if collectables.is_empty() {
            return Ok(GcStats::default());
        }

        let snapshot = self.manager.begin();
        let tx_id = snapshot.tx_id;
        let mut alloc = self.allocator.lock();
        self.pager.start_tracking();

        let freed = (|| -> Result<usize> {
            let mut store = DocStore::new(&self.pager, &mut alloc);
            let mut freed = 0usize;
            let mut seen: HashSet<SlotPointer> = HashSet::new();
            for collectable in &collectables {
                let Some(location) = collectable.location else {
                    continue;
                };
                if !seen.insert(location) {
                    continue;
                }
                match store.free(location) {
                    Ok(()) => freed += 1,
                    // A prior pass already tombstoned the slot.
                    Err(GaldrError::DocumentSlotDeleted { .. }) => {}
                    Err(err) => return Err(err),
                }
            }
            alloc.persist(|page_id, image| self.pager.write(page_id, image))?;
            Ok(freed)
        })();

        let result = match freed {
            Ok(freed) => {
                let chain = self.meta_chain.lock().clone();
                self.log_and_flush(tx_id, &chain, alloc.geometry()).map(|()| GcStats {
                    collected_versions: collectables.len(),
                    freed_slots: freed,
                })
            }
            Err(err) => {
                self.pager.discard_tracked();
                Err(err)
            }
        };
        drop(alloc);
        self.manager.finish(tx_id);
        match result {
            Ok(stats) => {
                debug!(
                    collected = stats.collected_versions,
                    freed = stats.freed_slots,
                    oldest_snapshot = oldest,
                    "garbage collection pass"
                );
                Ok(stats)
            }
            Err(err) => {
                warn!(error = %err, "garbage collection failed");
                Err(err)
            }
        }
    }

    /// Full maintenance sweep: GC, in-place page compaction, dense tree
    /// rebuilds, and tail truncation.
    pub fn vacuum(&self) -> Result<VacuumStats> {
        let gc = self.run_gc()?;
        self.check_writable()?;
        let _guard = self.commit_lock.lock();

        let snapshot = self.manager.begin();
        let tx_id = snapshot.tx_id;
        let mut alloc = self.allocator.lock();
        self.pager.start_tracking();
        let catalog = self.catalog_snapshot();

        let swept = (|| -> Result<(usize, usize, u32)> {
            // Compact document pages whose logical/physical gap pays off.
            // Reachability keeps raw extent pages (no slot directory) out of
            // the sweep.
            let doc_pages = self.reachability()?.doc_pages;
            let mut compacted = 0usize;
            let mut ordered: Vec<PageId> = doc_pages.into_iter().collect();
            ordered.sort_unstable();
            for page_id in ordered {
                if !alloc.is_allocated(page_id) {
                    continue;
                }
                let image = self.pager.read(page_id)?;
                if image.first() != Some(&page_type::DOCUMENT) {
                    continue;
                }
                let mut copy = image.as_ref().clone();
                let page = DocPage::new(&mut copy, page_id)?;
                let gap = page.logical_free()?.saturating_sub(page.physical_free());
                if gap >= COMPACTION_MIN_GAIN {
                    let mut store = DocStore::new(&self.pager, &mut alloc);
                    if store.compact_page(page_id)? > 0 {
                        compacted += 1;
                    }
                }
            }

            // Rewrite every tree dense.
            let mut rebuilt = 0usize;
            for meta in catalog.iter() {
                self.rebuild_primary_dense(&mut alloc, meta.root_page)?;
                rebuilt += 1;
                for index in &meta.indexes {
                    self.rebuild_secondary_dense(&mut alloc, index.root_page)?;
                    rebuilt += 1;
                }
            }

            // Trim entirely-free trailing pages.
            let total = alloc.total_pages();
            let keep = alloc.highest_allocated().map(|p| p + 1).unwrap_or(1);
            let truncated = total.saturating_sub(keep);
            if truncated > 0 {
                alloc.shrink(keep)?;
                self.pager.set_length(keep)?;
            }

            alloc.persist(|page_id, image| self.pager.write(page_id, image))?;
            Ok((compacted, rebuilt, truncated))
        })();

        let result = match swept {
            Ok((compacted, rebuilt, truncated)) => self
                .refresh_header(&mut alloc, self.pager.page_size())
                .and_then(|()| {
                    let chain = self.meta_chain.lock().clone();
                    self.log_and_flush(tx_id, &chain, alloc.geometry())
                })
                .map(|()| VacuumStats {
                    gc,
                    compacted_pages: compacted,
                    rebuilt_trees: rebuilt,
                    truncated_pages: truncated,
                }),
            Err(err) => {
                self.pager.discard_tracked();
                Err(err)
            }
        };
        drop(alloc);
        self.manager.finish(tx_id);
        match &result {
            Ok(stats) => debug!(?stats, "vacuum complete"),
            Err(err) => {
                warn!(error = %err, "vacuum failed");
                self.poison_on_fatal(err);
            }
        }
        result
    }

    /// Writes a fresh database at `target` containing exactly the documents
    /// visible at the current snapshot, with rebuilt indexes.
    pub fn compact_to(&self, target: impl AsRef<Path>) -> Result<()> {
        self.check_usable()?;
        let mut dest_config = self.config().clone();
        dest_config.read_only = false;
        let dest = Database::create(target, dest_config)?;
        let mut tx = self.begin_read_only_transaction()?;
        let snapshot_csn = tx.snapshot_csn();
        let catalog = self.catalog_snapshot();

        for meta in catalog.iter() {
            let schema = CollectionSchema {
                name: meta.name.to_string(),
                indexes: meta
                    .indexes
                    .iter()
                    .map(|d| IndexSpec {
                        name: d.name.clone(),
                        unique: d.unique,
                    })
                    .collect(),
            };
            dest.create_collection(&schema)?;

            // Recover each live document's index keys from the committed
            // index state: an entry counts when the visible version is the
            // one it indexed.
            let mut keys_by_doc: HashMap<DocId, Vec<IndexKey>> = HashMap::new();
            for index in &meta.indexes {
                let tree = SecondaryTree::new(
                    &self.pager,
                    &self.latches,
                    index.root_page,
                    self.secondary_order(),
                );
                for (key, entries) in tree.scan_all()? {
                    for entry in entries {
                        let Some(version) =
                            self.versions
                                .get_visible(&meta.name, entry.doc_id, snapshot_csn)
                        else {
                            continue;
                        };
                        if version.location != Some(entry.ptr) {
                            continue;
                        }
                        keys_by_doc
                            .entry(entry.doc_id)
                            .or_default()
                            .push(IndexKey::new(index.name.clone(), Some(key.clone())));
                    }
                }
            }

            let rows = tx.scan(&meta.name)?;
            for chunk in rows.chunks(512) {
                let mut dtx = dest.begin_transaction()?;
                for (doc_id, bytes) in chunk {
                    let keys = keys_by_doc.remove(doc_id).unwrap_or_default();
                    dtx.insert_with_id(&meta.name, *doc_id, bytes.clone(), keys)?;
                }
                dtx.commit()?;
            }
        }

        drop(tx);
        dest.close()
    }

    /// Removes a collection: its documents, trees, and metadata entry.
    pub fn drop_collection(&self, name: &str) -> Result<()> {
        self.check_writable()?;
        let _guard = self.commit_lock.lock();

        let catalog_snapshot = self.catalog_snapshot();
        let Some(meta) = catalog_snapshot.get(name).cloned() else {
            return Err(GaldrError::InvalidArgument(format!(
                "unknown collection {name:?}"
            )));
        };

        let snapshot = self.manager.begin();
        let tx_id = snapshot.tx_id;
        let mut alloc = self.allocator.lock();
        self.pager.start_tracking();
        let mut catalog = (*catalog_snapshot).clone();

        let dropped = (|| -> Result<()> {
            let primary =
                PrimaryTree::new(&self.pager, &self.latches, meta.root_page, self.primary_order());
            let entries = primary.scan_all()?;
            {
                let mut store = DocStore::new(&self.pager, &mut alloc);
                let mut seen = HashSet::new();
                for (_, location) in &entries {
                    if seen.insert(*location) {
                        match store.free(*location) {
                            Ok(()) | Err(GaldrError::DocumentSlotDeleted { .. }) => {}
                            Err(err) => return Err(err),
                        }
                    }
                }
            }
            for page_id in collect_primary_pages(&self.pager, meta.root_page)? {
                alloc.deallocate(page_id);
            }
            for index in &meta.indexes {
                for page_id in collect_secondary_pages(&self.pager, index.root_page, true)? {
                    alloc.deallocate(page_id);
                }
            }
            catalog.remove(name);
            if let Some(chain) = self.rewrite_catalog_pages(&mut alloc, &catalog)? {
                *self.meta_chain.lock() = chain;
            }
            alloc.persist(|page_id, image| self.pager.write(page_id, image))?;
            Ok(())
        })();

        let result = dropped.and_then(|()| {
            let chain = self.meta_chain.lock().clone();
            self.log_and_flush(tx_id, &chain, alloc.geometry())?;
            *self.catalog.write() = Arc::new(catalog);
            self.drop_version_chains(name);
            Ok(())
        });
        if let Err(err) = &result {
            self.pager.discard_tracked();
            self.poison_on_fatal(err);
        }
        drop(alloc);
        self.manager.finish(tx_id);
        result
    }

    fn drop_version_chains(&self, collection: &str) {
        // Chains of the dropped collection linger harmlessly until GC; the
        // candidate walk removes them once their heads age out. Force the
        // issue by unlinking heads now.
        let visible = self.versions.get_all_visible(collection, u64::MAX);
        for (doc_id, head) in visible {
            self.versions.unlink(collection, doc_id, &head);
        }
    }

    /// Bulk-rebuilds a primary tree with every leaf packed to the order
    /// bound. The root page id is preserved.
    fn rebuild_primary_dense(
        &self,
        alloc: &mut crate::alloc::Allocator,
        root: PageId,
    ) -> Result<()> {
        let usable = self.pager.page_size();
        let order = self.primary_order();
        let max_keys = order - 1;
        let tree = PrimaryTree::new(&self.pager, &self.latches, root, order);
        let entries = tree.scan_all()?;
        let old_pages = collect_primary_pages(&self.pager, root)?;

        if entries.is_empty() {
            self.pager.write(root, PrimaryTree::empty_root_image(usable)?)?;
            free_except_root(alloc, &old_pages, root);
            return Ok(());
        }

        // Leaf level, packed full.
        let mut level: Vec<(DocId, PageId)> = Vec::new();
        let chunks: Vec<&[(DocId, SlotPointer)]> = entries.chunks(max_keys).collect();
        if chunks.len() == 1 {
            let mut leaf = PrimaryNode::new_leaf();
            for (key, value) in chunks[0] {
                leaf.keys.push(*key);
                leaf.values.push(*value);
            }
            self.pager.write(root, leaf.encode(usable)?)?;
            free_except_root(alloc, &old_pages, root);
            return Ok(());
        }
        let leaf_ids: Vec<PageId> = (0..chunks.len())
            .map(|_| alloc.allocate_page(&self.pager))
            .collect::<Result<_>>()?;
        for (i, chunk) in chunks.iter().enumerate() {
            let mut leaf = PrimaryNode::new_leaf();
            for (key, value) in *chunk {
                leaf.keys.push(*key);
                leaf.values.push(*value);
            }
            leaf.next_leaf = if i + 1 < leaf_ids.len() { leaf_ids[i + 1] } else { 0 };
            self.pager.write(leaf_ids[i], leaf.encode(usable)?)?;
            level.push((chunk[0].0, leaf_ids[i]));
        }

        // Internal levels until one node remains; it lands in the root page.
        loop {
            let groups: Vec<&[(DocId, PageId)]> = level.chunks(max_keys + 1).collect();
            if groups.len() == 1 {
                let node = primary_internal_from(groups[0]);
                self.pager.write(root, node.encode(usable)?)?;
                break;
            }
            let mut next_level = Vec::with_capacity(groups.len());
            for group in groups {
                let id = alloc.allocate_page(&self.pager)?;
                let node = primary_internal_from(group);
                self.pager.write(id, node.encode(usable)?)?;
                next_level.push((group[0].0, id));
            }
            level = next_level;
        }

        free_except_root(alloc, &old_pages, root);
        Ok(())
    }

    /// Bulk-rebuilds a secondary tree, byte-fit aware. Overflow chains are
    /// carried over untouched.
    fn rebuild_secondary_dense(
        &self,
        alloc: &mut crate::alloc::Allocator,
        root: PageId,
    ) -> Result<()> {
        let usable = self.pager.page_size();
        let max_keys = self.secondary_order() - 1;
        let leaves_src = collect_secondary_leaf_values(&self.pager, root)?;
        let old_pages = collect_secondary_pages(&self.pager, root, false)?;

        if leaves_src.is_empty() {
            self.pager
                .write(root, SecondaryTree::empty_root_image(usable)?)?;
            free_except_root(alloc, &old_pages, root);
            return Ok(());
        }

        // Pack leaves greedily under both the order and the byte budget.
        let mut leaves: Vec<SecondaryNode> = Vec::new();
        let mut current = SecondaryNode::new_leaf();
        for (key, value) in leaves_src {
            current.keys.push(key);
            current.values.push(value);
            if current.keys.len() >= max_keys || !current.fits(usable) {
                if !current.fits(usable) && current.keys.len() > 1 {
                    let key = current.keys.pop().expect("non-empty");
                    let value = current.values.pop().expect("non-empty");
                    leaves.push(std::mem::replace(&mut current, SecondaryNode::new_leaf()));
                    current.keys.push(key);
                    current.values.push(value);
                } else {
                    leaves.push(std::mem::replace(&mut current, SecondaryNode::new_leaf()));
                }
            }
        }
        if !current.keys.is_empty() {
            leaves.push(current);
        }

        if leaves.len() == 1 {
            self.pager.write(root, leaves[0].encode(usable)?)?;
            free_except_root(alloc, &old_pages, root);
            return Ok(());
        }
        let leaf_ids: Vec<PageId> = (0..leaves.len())
            .map(|_| alloc.allocate_page(&self.pager))
            .collect::<Result<_>>()?;
        let mut level: Vec<(Vec<u8>, PageId)> = Vec::with_capacity(leaves.len());
        for (i, mut leaf) in leaves.into_iter().enumerate() {
            leaf.next_leaf = if i + 1 < leaf_ids.len() { leaf_ids[i + 1] } else { 0 };
            level.push((leaf.keys[0].clone(), leaf_ids[i]));
            self.pager.write(leaf_ids[i], leaf.encode(usable)?)?;
        }

        loop {
            let groups: Vec<&[(Vec<u8>, PageId)]> = level.chunks(max_keys + 1).collect();
            if groups.len() == 1 {
                let node = secondary_internal_from(groups[0]);
                self.pager.write(root, node.encode(usable)?)?;
                break;
            }
            let mut next_level = Vec::with_capacity(groups.len());
            for group in groups {
                let id = alloc.allocate_page(&self.pager)?;
                let node = secondary_internal_from(group);
                self.pager.write(id, node.encode(usable)?)?;
                next_level.push((group[0].0.clone(), id));
            }
            level = next_level;
        }

        free_except_root(alloc, &old_pages, root);
        Ok(())
    }

}

fn primary_internal_from(group: &[(DocId, PageId)]) -> PrimaryNode {
    let children: Vec<PageId> = group.iter().map(|(_, id)| *id).collect();
    let keys: Vec<DocId> = group.iter().skip(1).map(|(min, _)| *min).collect();
    PrimaryNode::new_internal(keys, children)
}

fn secondary_internal_from(group: &[(Vec<u8>, PageId)]) -> SecondaryNode {
    let children: Vec<PageId> = group.iter().map(|(_, id)| *id).collect();
    let keys: Vec<Vec<u8>> = group.iter().skip(1).map(|(min, _)| min.clone()).collect();
    SecondaryNode::new_internal(keys, children)
}

fn free_except_root(alloc: &mut crate::alloc::Allocator, pages: &[PageId], root: PageId) {
    for &page_id in pages {
        if page_id != root {
            alloc.deallocate(page_id);
        }
    }
}

/// Every node page of a primary tree, root included.
pub(crate) fn collect_primary_pages(pager: &Pager, root: PageId) -> Result<Vec<PageId>> {
    let mut out = Vec::new();
    let mut stack = vec![root];
    while let Some(page_id) = stack.pop() {
        out.push(page_id);
        let node = PrimaryNode::decode(&pager.read(page_id)?, page_id)?;
        if !node.is_leaf {
            stack.extend_from_slice(&node.children);
        }
    }
    Ok(out)
}

/// Every node page of a secondary tree; overflow chain pages too when
/// `include_overflow` is set.
pub(crate) fn collect_secondary_pages(
    pager: &Pager,
    root: PageId,
    include_overflow: bool,
) -> Result<Vec<PageId>> {
    let mut out = Vec::new();
    let mut stack = vec![root];
    while let Some(page_id) = stack.pop() {
        out.push(page_id);
        let node = SecondaryNode::decode(&pager.read(page_id)?, page_id)?;
        if node.is_leaf {
            if include_overflow {
                for value in &node.values {
                    if let PostingValue::Overflow(head) = value {
                        let mut next = *head;
                        while next != 0 {
                            out.push(next);
                            let page =
                                crate::btree::OverflowPage::decode(&pager.read(next)?, next)?;
                            next = page.next;
                        }
                    }
                }
            }
        } else {
            stack.extend_from_slice(&node.children);
        }
    }
    Ok(out)
}

/// Key/value pairs of every secondary leaf, left to right.
fn collect_secondary_leaf_values(
    pager: &Pager,
    root: PageId,
) -> Result<Vec<(Vec<u8>, PostingValue)>> {
    // Find the leftmost leaf, then follow the sibling links.
    let mut page_id = root;
    let mut node = SecondaryNode::decode(&pager.read(page_id)?, page_id)?;
    while !node.is_leaf {
        page_id = node.children[0];
        node = SecondaryNode::decode(&pager.read(page_id)?, page_id)?;
    }
    let mut out = Vec::new();
    loop {
        for (key, value) in node.keys.iter().zip(&node.values) {
            out.push((key.clone(), value.clone()));
        }
        if node.next_leaf == 0 {
            return Ok(out);
        }
        page_id = node.next_leaf;
        node = SecondaryNode::decode(&pager.read(page_id)?, page_id)?;
    }
}
