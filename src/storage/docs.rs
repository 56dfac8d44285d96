//! Document store: places opaque byte records across slotted pages.
//!
//! Small documents inline into a slotted page chosen via the free-space map;
//! documents larger than one page take a consecutive run of raw extent pages
//! plus a head slot recording the page list. All mutation happens under the
//! database commit lock; readers resolve locators against immutable page
//! snapshots.

use crate::alloc::{Allocator, SpaceLevel};
use crate::error::{GaldrError, Result};
use crate::pager::{PageId, Pager};
use crate::storage::doc_page::{DocPage, Slot, INLINE_SLOT_SIZE, SLOT_FIXED_SIZE};
use crate::storage::{page_type, SlotPointer};

/// FSM candidate probes before falling back to a fresh page.
const PLACEMENT_PROBES: usize = 8;

/// Mutating handle over document storage, used during commit and GC.
pub struct DocStore<'a> {
    pager: &'a Pager,
    alloc: &'a mut Allocator,
}

impl<'a> DocStore<'a> {
    /// Wraps the pager and allocator for a write pass.
    pub fn new(pager: &'a Pager, alloc: &'a mut Allocator) -> Self {
        Self { pager, alloc }
    }

    /// Stores `bytes`, returning the head-slot locator.
    pub fn insert(&mut self, bytes: &[u8]) -> Result<SlotPointer> {
        let usable = self.pager.page_size();
        if bytes.len() + INLINE_SLOT_SIZE <= usable - super::doc_page::DOC_HEADER_SIZE {
            self.insert_inline(bytes)
        } else {
            self.insert_extent(bytes)
        }
    }

    fn insert_inline(&mut self, bytes: &[u8]) -> Result<SlotPointer> {
        let needed = bytes.len() + INLINE_SLOT_SIZE;
        let page_id = self.place(needed)?;
        let mut image = self.page_image(page_id)?;
        let mut page = DocPage::new(&mut image, page_id)?;
        let slot = page.add_inline(bytes)?;
        let level = page.level()?;
        page.finalize();
        self.pager.write(page_id, image)?;
        self.alloc.set_level(page_id, level);
        Ok(SlotPointer { page_id, slot })
    }

    fn insert_extent(&mut self, bytes: &[u8]) -> Result<SlotPointer> {
        let usable = self.pager.page_size();
        let n_pages = bytes.len().div_ceil(usable) as u32;
        let start = self.alloc.allocate_run(self.pager, n_pages)?;
        let page_ids: Vec<PageId> = (start..start + n_pages).collect();

        for (i, chunk) in bytes.chunks(usable).enumerate() {
            let mut image = vec![0u8; usable];
            image[..chunk.len()].copy_from_slice(chunk);
            self.pager.write(page_ids[i], image)?;
        }

        let head_needed = SLOT_FIXED_SIZE + 4 * n_pages as usize;
        let head_page = self.place(head_needed)?;
        let mut image = self.page_image(head_page)?;
        let mut page = DocPage::new(&mut image, head_page)?;
        let slot = page.add_extent_head(&page_ids, bytes.len() as u32)?;
        let level = page.level()?;
        page.finalize();
        self.pager.write(head_page, image)?;
        self.alloc.set_level(head_page, level);
        Ok(SlotPointer {
            page_id: head_page,
            slot,
        })
    }

    /// Tombstones the slot and releases extent pages. When the head page has
    /// no live slots left it is returned to the free pool.
    pub fn free(&mut self, ptr: SlotPointer) -> Result<()> {
        let mut image = self.page_image(ptr.page_id)?;
        let mut page = DocPage::new(&mut image, ptr.page_id)?;
        let old = page.tombstone(ptr.slot)?;
        let live = page.live_count()?;
        let level = page.level()?;
        page.finalize();
        self.pager.write(ptr.page_id, image)?;

        if !old.is_inline(ptr.page_id) {
            for extent_page in &old.page_ids {
                self.alloc.deallocate(*extent_page);
            }
        }
        if live == 0 {
            self.alloc.deallocate(ptr.page_id);
        } else {
            self.alloc.set_level(ptr.page_id, level);
        }
        Ok(())
    }

    /// Compacts one document page, returning reclaimed bytes.
    pub fn compact_page(&mut self, page_id: PageId) -> Result<usize> {
        let mut image = self.page_image(page_id)?;
        let mut page = DocPage::new(&mut image, page_id)?;
        let reclaimed = page.compact()?;
        if reclaimed > 0 {
            let level = page.level()?;
            page.finalize();
            self.pager.write(page_id, image)?;
            self.alloc.set_level(page_id, level);
        }
        Ok(reclaimed)
    }

    /// Picks a document page guaranteed to fit `needed` bytes, preferring
    /// FSM candidates over allocating a fresh page.
    fn place(&mut self, needed: usize) -> Result<PageId> {
        let usable = self.pager.page_size();
        if let Some(min_level) = SpaceLevel::guaranteeing(needed, usable) {
            let mut hint = 0;
            for _ in 0..PLACEMENT_PROBES {
                let Some(candidate) = self.alloc.find_page_with_space(min_level, hint) else {
                    break;
                };
                if self.try_candidate(candidate, needed)? {
                    return Ok(candidate);
                }
                if candidate + 1 <= hint {
                    break; // wrapped; no further candidates
                }
                hint = candidate + 1;
            }
        }
        let page_id = self.alloc.allocate_page(self.pager)?;
        let mut image = vec![0u8; usable];
        DocPage::initialize(&mut image, page_id);
        let mut page = DocPage::new(&mut image, page_id)?;
        let level = page.level()?;
        page.finalize();
        self.pager.write(page_id, image)?;
        self.alloc.set_level(page_id, level);
        Ok(page_id)
    }

    /// The FSM is a coarse hint; confirm the candidate really is a document
    /// page with enough contiguous room.
    fn try_candidate(&mut self, page_id: PageId, needed: usize) -> Result<bool> {
        if !self.alloc.is_allocated(page_id) {
            return Ok(false);
        }
        let image = self.pager.read(page_id)?;
        if image.first() != Some(&page_type::DOCUMENT) {
            return Ok(false);
        }
        let mut copy = image.as_ref().clone();
        let mut page = DocPage::new(&mut copy, page_id)?;
        if page.physical_free() >= needed {
            return Ok(true);
        }
        // Logical space only helps after compaction.
        if page.logical_free()? >= needed {
            let reclaimed = page.compact()?;
            if reclaimed > 0 && page.physical_free() >= needed {
                let level = page.level()?;
                page.finalize();
                self.pager.write(page_id, copy)?;
                self.alloc.set_level(page_id, level);
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn page_image(&self, page_id: PageId) -> Result<Vec<u8>> {
        Ok(self.pager.read(page_id)?.as_ref().clone())
    }
}

/// Reads a document's bytes through its head-slot locator. Safe for
/// concurrent readers; page images are immutable snapshots.
pub fn read_document(pager: &Pager, ptr: SlotPointer) -> Result<Vec<u8>> {
    let image = pager.read(ptr.page_id)?;
    let mut copy = image.as_ref().clone();
    let page = DocPage::new(&mut copy, ptr.page_id)?;
    let slot = page.slot(ptr.slot)?;
    if slot.is_tombstone() {
        return Err(GaldrError::DocumentSlotDeleted {
            page_id: ptr.page_id,
            slot: ptr.slot,
        });
    }
    if slot.is_inline(ptr.page_id) {
        return Ok(page.read_inline(ptr.slot)?.to_vec());
    }
    read_extent(pager, &slot)
}

fn read_extent(pager: &Pager, slot: &Slot) -> Result<Vec<u8>> {
    let usable = pager.page_size();
    let total = slot.total_size as usize;
    let mut out = Vec::with_capacity(total);
    let mut remaining = total;
    for page_id in &slot.page_ids {
        if remaining == 0 {
            break;
        }
        let image = pager.read(*page_id)?;
        let take = remaining.min(usable);
        out.extend_from_slice(&image[..take]);
        remaining -= take;
    }
    if out.len() != total {
        return Err(GaldrError::corrupt(format!(
            "extent pages held {} bytes, head slot promises {total}",
            out.len()
        )));
    }
    Ok(out)
}

/// Snapshot view of a slot used by verification and vacuum.
pub fn load_slot(pager: &Pager, ptr: SlotPointer) -> Result<Slot> {
    let image = pager.read(ptr.page_id)?;
    let mut copy = image.as_ref().clone();
    let page = DocPage::new(&mut copy, ptr.page_id)?;
    page.slot(ptr.slot)
}
