//! Statistics, integrity verification, and fragmentation reporting.

use std::collections::HashSet;

use crate::btree::{PrimaryNode, SecondaryNode, SecondaryTree};
use crate::db::Database;
use crate::error::Result;
use crate::gc::{collect_primary_pages, collect_secondary_pages};
use crate::pager::PageId;
use crate::storage::doc_page::DocPage;
use crate::storage::page_type;

/// Per-collection counters.
#[derive(Clone, Debug)]
pub struct CollectionStats {
    /// Collection name.
    pub name: String,
    /// Committed document count.
    pub doc_count: u64,
    /// Secondary index count.
    pub index_count: usize,
}

/// Snapshot of database-wide counters.
#[derive(Clone, Debug)]
pub struct Stats {
    /// Configured on-disk page size.
    pub page_size: usize,
    /// Pages the file spans.
    pub total_pages: u32,
    /// Pages marked allocated.
    pub allocated_pages: u32,
    /// Document pages (head pages with slot directories).
    pub doc_pages: usize,
    /// Raw extent pages of multi-page documents.
    pub extent_pages: usize,
    /// B+ tree node pages, both flavors.
    pub tree_pages: usize,
    /// Secondary-index overflow chain pages.
    pub overflow_pages: usize,
    /// Bitmap and free-space-map pages.
    pub map_pages: usize,
    /// Collections-metadata pages.
    pub meta_pages: usize,
    /// WAL file size in bytes.
    pub wal_size: u64,
    /// Committed frames awaiting checkpoint.
    pub wal_committed_frames: u32,
    /// Page-cache hits since open.
    pub cache_hits: u64,
    /// Page-cache misses since open.
    pub cache_misses: u64,
    /// Version chains tracked in memory.
    pub version_chains: usize,
    /// Chains awaiting garbage collection.
    pub gc_candidates: usize,
    /// Per-collection counters.
    pub collections: Vec<CollectionStats>,
}

/// One fragmented document page.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FragmentationEntry {
    /// Page id.
    pub page_id: PageId,
    /// Bytes free between directory and payload.
    pub physical_free: usize,
    /// Physical free plus reclaimable hole bytes.
    pub logical_free: usize,
}

pub(crate) struct Reachability {
    pub(crate) doc_pages: HashSet<PageId>,
    pub(crate) extent_pages: HashSet<PageId>,
    pub(crate) tree_pages: HashSet<PageId>,
    pub(crate) overflow_pages: HashSet<PageId>,
}

impl Database {
    /// Database-wide counters.
    pub fn stats(&self) -> Result<Stats> {
        self.check_usable()?;
        let catalog = self.catalog_snapshot();
        let reach = self.reachability()?;
        let (allocated, total, map_pages) = {
            let alloc = self.allocator.lock();
            (
                alloc.allocated_count(),
                alloc.total_pages(),
                alloc.region_pages().count(),
            )
        };
        let (cache_hits, cache_misses) = self.pager.cache_counters();
        let (wal_size, wal_committed_frames) = self.wal_stats()?;

        Ok(Stats {
            page_size: self.pager.raw_page_size(),
            total_pages: total,
            allocated_pages: allocated,
            doc_pages: reach.doc_pages.len(),
            extent_pages: reach.extent_pages.len(),
            tree_pages: reach.tree_pages.len(),
            overflow_pages: reach.overflow_pages.len(),
            map_pages,
            meta_pages: self.meta_chain.lock().len(),
            wal_size,
            wal_committed_frames,
            cache_hits,
            cache_misses,
            version_chains: self.versions.chain_count(),
            gc_candidates: self.versions.candidate_count(),
            collections: catalog
                .iter()
                .map(|meta| CollectionStats {
                    name: meta.name.to_string(),
                    doc_count: meta.doc_count,
                    index_count: meta.indexes.len(),
                })
                .collect(),
        })
    }

    /// Walks the whole file checking structural invariants. Returns a list
    /// of findings; an intact database yields an empty list.
    pub fn verify(&self) -> Result<Vec<String>> {
        self.check_usable()?;
        let mut findings = Vec::new();
        let catalog = self.catalog_snapshot();
        let reach = self.reachability()?;

        let (total, is_allocated): (u32, Box<dyn Fn(PageId) -> bool>) = {
            let alloc = self.allocator.lock();
            let snapshot: HashSet<PageId> = (0..alloc.total_pages())
                .filter(|&p| alloc.is_allocated(p))
                .collect();
            (
                alloc.total_pages(),
                Box::new(move |p: PageId| snapshot.contains(&p)),
            )
        };

        // Every reachable page must be allocated.
        for set in [
            &reach.doc_pages,
            &reach.extent_pages,
            &reach.tree_pages,
            &reach.overflow_pages,
        ] {
            for &page_id in set.iter() {
                if !is_allocated(page_id) {
                    findings.push(format!("page {page_id} is referenced but not allocated"));
                }
            }
        }

        // Every allocated page must be accounted for.
        let reserved = {
            let alloc = self.allocator.lock();
            self.reserved_pages_for_admin(&alloc)
        };
        for page_id in 0..total {
            if !is_allocated(page_id) {
                continue;
            }
            let known = reserved.contains(&page_id)
                || reach.doc_pages.contains(&page_id)
                || reach.extent_pages.contains(&page_id)
                || reach.tree_pages.contains(&page_id)
                || reach.overflow_pages.contains(&page_id);
            if !known {
                findings.push(format!(
                    "page {page_id} is allocated but unreachable from any root"
                ));
            }
        }

        // Document page internals.
        for &page_id in &reach.doc_pages {
            let image = self.pager.read(page_id)?;
            if let Err(err) = DocPage::verify_checksum(&image, page_id) {
                findings.push(err.to_string());
                continue;
            }
            let mut copy = image.as_ref().clone();
            match DocPage::new(&mut copy, page_id) {
                Ok(page) => {
                    if page.free_space_offset() > page.free_space_end() {
                        findings.push(format!(
                            "page {page_id}: free space pointers inverted"
                        ));
                    }
                }
                Err(err) => findings.push(err.to_string()),
            }
        }

        // Tree node ordering and bounds.
        for &page_id in &reach.tree_pages {
            let image = self.pager.read(page_id)?;
            match image.first() {
                Some(&page_type::TREE_PRIMARY) => {
                    let node = PrimaryNode::decode(&image, page_id)?;
                    if node.keys.windows(2).any(|w| w[0] >= w[1]) {
                        findings.push(format!(
                            "primary node {page_id}: keys not strictly increasing"
                        ));
                    }
                    if node.keys.len() > self.primary_order() - 1 {
                        findings.push(format!(
                            "primary node {page_id}: {} keys exceeds the order bound",
                            node.keys.len()
                        ));
                    }
                }
                Some(&page_type::TREE_SECONDARY) => {
                    let node = SecondaryNode::decode(&image, page_id)?;
                    if node.keys.windows(2).any(|w| w[0] >= w[1]) {
                        findings.push(format!(
                            "secondary node {page_id}: keys not strictly increasing"
                        ));
                    }
                }
                other => findings.push(format!(
                    "tree page {page_id} has unexpected type {other:?}"
                )),
            }
        }

        // Unique indexes: no two live documents may share a key.
        for meta in catalog.iter() {
            for index in meta.indexes.iter().filter(|d| d.unique) {
                let tree = SecondaryTree::new(
                    &self.pager,
                    &self.latches,
                    index.root_page,
                    self.secondary_order(),
                );
                for (key, entries) in tree.scan_all()? {
                    let live = entries
                        .iter()
                        .filter(|e| {
                            self.versions
                                .get_latest(&meta.name, e.doc_id)
                                .map(|head| {
                                    head.is_live()
                                        && !head.is_tombstone()
                                        && head.location == Some(e.ptr)
                                })
                                .unwrap_or(false)
                        })
                        .count();
                    if live > 1 {
                        findings.push(format!(
                            "unique index {} on {}: key {key:02x?} held by {live} live documents",
                            index.name, meta.name
                        ));
                    }
                }
            }
        }

        Ok(findings)
    }

    /// Per-page logical vs physical free space for every document page.
    pub fn fragmentation(&self) -> Result<Vec<FragmentationEntry>> {
        self.check_usable()?;
        let reach = self.reachability()?;
        let mut out = Vec::with_capacity(reach.doc_pages.len());
        for &page_id in &reach.doc_pages {
            let image = self.pager.read(page_id)?;
            let mut copy = image.as_ref().clone();
            let page = DocPage::new(&mut copy, page_id)?;
            out.push(FragmentationEntry {
                page_id,
                physical_free: page.physical_free(),
                logical_free: page.logical_free()?,
            });
        }
        out.sort_by_key(|e| e.page_id);
        Ok(out)
    }

    fn wal_stats(&self) -> Result<(u64, u32)> {
        match self.wal_handle() {
            Some(wal) => {
                let wal = wal.lock();
                Ok((wal.size()?, wal.committed_frame_count()))
            }
            None => Ok((0, 0)),
        }
    }

    pub(crate) fn reachability(&self) -> Result<Reachability> {
        let catalog = self.catalog_snapshot();
        let mut reach = Reachability {
            doc_pages: HashSet::new(),
            extent_pages: HashSet::new(),
            tree_pages: HashSet::new(),
            overflow_pages: HashSet::new(),
        };

        for meta in catalog.iter() {
            let node_pages = collect_primary_pages(&self.pager, meta.root_page)?;
            reach.tree_pages.extend(node_pages.iter().copied());
            for index in &meta.indexes {
                let all = collect_secondary_pages(&self.pager, index.root_page, true)?;
                for page_id in all {
                    let image = self.pager.read(page_id)?;
                    if image.first() == Some(&page_type::INDEX_OVERFLOW) {
                        reach.overflow_pages.insert(page_id);
                    } else {
                        reach.tree_pages.insert(page_id);
                    }
                }
            }

            // Document and extent pages via the primary tree's locators.
            let tree = crate::btree::PrimaryTree::new(
                &self.pager,
                &self.latches,
                meta.root_page,
                self.primary_order(),
            );
            for (_, ptr) in tree.scan_all()? {
                reach.doc_pages.insert(ptr.page_id);
                let slot = crate::storage::docs::load_slot(&self.pager, ptr)?;
                if !slot.is_inline(ptr.page_id) {
                    reach.extent_pages.extend(slot.page_ids.iter().copied());
                }
            }
        }

        // Superseded versions still referenced by chains pin pages until GC.
        for ptr in self.versions.all_locations() {
            reach.doc_pages.insert(ptr.page_id);
            if let Ok(slot) = crate::storage::docs::load_slot(&self.pager, ptr) {
                if !slot.is_inline(ptr.page_id) {
                    reach.extent_pages.extend(slot.page_ids.iter().copied());
                }
            }
        }
        Ok(reach)
    }

    fn reserved_pages_for_admin(&self, alloc: &crate::alloc::Allocator) -> HashSet<PageId> {
        let mut reserved: HashSet<PageId> = alloc.region_pages().collect();
        reserved.insert(0);
        reserved.extend(self.meta_chain.lock().iter().copied());
        reserved
    }
}
