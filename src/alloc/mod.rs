//! Allocation maps layered over the pager.
//!
//! The [`Bitmap`] records which pages are allocated; the [`FreeSpaceMap`]
//! quantizes how much room document pages have left. Both live in reserved
//! page regions and are mutated in memory; the dirty region pages are
//! WAL-logged as map chunks at commit. When the file runs out of free pages
//! the allocator extends it by a configured chunk, relocating a map region
//! to the file tail if it outgrows its reservation.

mod bitmap;
mod fsm;

pub use bitmap::Bitmap;
pub use fsm::{FreeSpaceMap, SpaceLevel};

use crate::error::{GaldrError, Result};
use crate::pager::{PageId, Pager};

/// Placement of the two map regions inside the file.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MapGeometry {
    /// First page of the bitmap region.
    pub bitmap_start: PageId,
    /// Pages reserved for the bitmap.
    pub bitmap_pages: u32,
    /// First page of the free-space-map region.
    pub fsm_start: PageId,
    /// Pages reserved for the free-space map.
    pub fsm_pages: u32,
}

/// Page allocator combining both maps.
pub struct Allocator {
    bitmap: Bitmap,
    fsm: FreeSpaceMap,
    geometry: MapGeometry,
    page_size: usize,
    expansion: u32,
    hint: PageId,
    geometry_changed: bool,
}

impl Allocator {
    /// Fresh allocator for a newly created file of `total_pages` pages.
    /// The caller marks the reserved pages allocated afterwards.
    pub fn create(
        total_pages: u32,
        page_size: usize,
        expansion: u32,
        geometry: MapGeometry,
    ) -> Self {
        let mut bitmap = Bitmap::new(total_pages, page_size);
        let mut fsm = FreeSpaceMap::new(total_pages, page_size);
        bitmap.mark_all_dirty();
        fsm.mark_all_dirty();
        Self {
            bitmap,
            fsm,
            geometry,
            page_size,
            expansion,
            hint: 0,
            geometry_changed: false,
        }
    }

    /// Loads both maps from their on-disk regions.
    pub fn load(
        pager: &Pager,
        total_pages: u32,
        expansion: u32,
        geometry: MapGeometry,
    ) -> Result<Self> {
        let page_size = pager.page_size();
        let mut bitmap_bytes = Vec::with_capacity(geometry.bitmap_pages as usize * page_size);
        for idx in 0..geometry.bitmap_pages {
            bitmap_bytes.extend_from_slice(&pager.read(geometry.bitmap_start + idx)?);
        }
        let mut fsm_bytes = Vec::with_capacity(geometry.fsm_pages as usize * page_size);
        for idx in 0..geometry.fsm_pages {
            fsm_bytes.extend_from_slice(&pager.read(geometry.fsm_start + idx)?);
        }
        Ok(Self {
            bitmap: Bitmap::from_bytes(&bitmap_bytes, total_pages, page_size),
            fsm: FreeSpaceMap::from_bytes(&fsm_bytes, total_pages, page_size),
            geometry,
            page_size,
            expansion,
            hint: 0,
            geometry_changed: false,
        })
    }

    /// Current region placement.
    pub fn geometry(&self) -> MapGeometry {
        self.geometry
    }

    /// True when a grow relocated a region; the caller must rewrite the
    /// header. Reading clears the flag.
    pub fn take_geometry_changed(&mut self) -> bool {
        std::mem::take(&mut self.geometry_changed)
    }

    /// Pages the maps currently cover.
    pub fn total_pages(&self) -> u32 {
        self.bitmap.capacity()
    }

    /// Count of allocated pages.
    pub fn allocated_count(&self) -> u32 {
        self.bitmap.allocated_count()
    }

    /// Whether `page_id` is allocated.
    pub fn is_allocated(&self, page_id: PageId) -> bool {
        self.bitmap.is_allocated(page_id)
    }

    /// Marks `page_id` allocated without searching (create-time reservation).
    pub fn reserve(&mut self, page_id: PageId) {
        self.bitmap.allocate(page_id);
    }

    /// Allocates one page, extending the file when none is free.
    pub fn allocate_page(&mut self, pager: &Pager) -> Result<PageId> {
        let id = match self.bitmap.find_free(self.hint) {
            Some(id) => id,
            None => {
                self.grow(pager)?;
                self.bitmap
                    .find_free(self.hint)
                    .ok_or_else(|| GaldrError::corrupt("no free page after file expansion"))?
            }
        };
        self.bitmap.allocate(id);
        self.fsm.set_level(id, SpaceLevel::Full);
        self.hint = id;
        Ok(id)
    }

    /// Allocates `len` consecutive pages for a document extent.
    pub fn allocate_run(&mut self, pager: &Pager, len: u32) -> Result<PageId> {
        loop {
            if let Some(start) = self.bitmap.find_free_run(len, self.hint) {
                for offset in 0..len {
                    self.bitmap.allocate(start + offset);
                    self.fsm.set_level(start + offset, SpaceLevel::Full);
                }
                self.hint = start + len - 1;
                return Ok(start);
            }
            self.grow_by(pager, self.expansion.max(len))?;
        }
    }

    /// Returns `page_id` to the free pool.
    pub fn deallocate(&mut self, page_id: PageId) {
        self.bitmap.deallocate(page_id);
        self.fsm.set_level(page_id, SpaceLevel::Full);
        if page_id < self.hint {
            self.hint = page_id;
        }
    }

    /// Free-space level of a document page.
    pub fn level(&self, page_id: PageId) -> SpaceLevel {
        self.fsm.level(page_id)
    }

    /// Records the level of a document page after a mutation.
    pub fn set_level(&mut self, page_id: PageId, level: SpaceLevel) {
        self.fsm.set_level(page_id, level);
    }

    /// Candidate document page with at least `min` free space.
    pub fn find_page_with_space(&self, min: SpaceLevel, hint: PageId) -> Option<PageId> {
        self.fsm.find_page_with_space(min, hint)
    }

    fn grow(&mut self, pager: &Pager) -> Result<()> {
        self.grow_by(pager, self.expansion)
    }

    /// Extends the file by at least `chunk` pages, resizing both maps and
    /// relocating any region that no longer fits its reservation.
    fn grow_by(&mut self, pager: &Pager, chunk: u32) -> Result<()> {
        let old_total = self.total_pages();
        let mut new_total = old_total
            .checked_add(chunk)
            .ok_or_else(|| GaldrError::corrupt("page id space exhausted"))?;

        // Converge on a total that leaves room for relocated map regions.
        let (bitmap_pages, fsm_pages) = loop {
            let need_bitmap = Bitmap::pages_needed(new_total, self.page_size);
            let need_fsm = FreeSpaceMap::pages_needed(new_total, self.page_size);
            let extra_bitmap = if need_bitmap > self.geometry.bitmap_pages {
                need_bitmap
            } else {
                0
            };
            let extra_fsm = if need_fsm > self.geometry.fsm_pages {
                need_fsm
            } else {
                0
            };
            let target = old_total + chunk + extra_bitmap + extra_fsm;
            if target <= new_total {
                break (need_bitmap, need_fsm);
            }
            new_total = target;
        };

        pager.set_length(new_total)?;
        self.bitmap.resize(new_total);
        self.fsm.resize(new_total);

        let mut cursor = old_total + chunk;
        if bitmap_pages > self.geometry.bitmap_pages {
            let old = self.geometry;
            self.geometry.bitmap_start = cursor;
            self.geometry.bitmap_pages = bitmap_pages;
            for offset in 0..bitmap_pages {
                self.bitmap.allocate(cursor + offset);
            }
            for offset in 0..old.bitmap_pages {
                self.bitmap.deallocate(old.bitmap_start + offset);
            }
            cursor += bitmap_pages;
            self.bitmap.mark_all_dirty();
            self.geometry_changed = true;
            tracing::debug!(
                from = old.bitmap_start,
                to = self.geometry.bitmap_start,
                pages = bitmap_pages,
                "bitmap region relocated"
            );
        }
        if fsm_pages > self.geometry.fsm_pages {
            let old = self.geometry;
            self.geometry.fsm_start = cursor;
            self.geometry.fsm_pages = fsm_pages;
            for offset in 0..fsm_pages {
                self.bitmap.allocate(cursor + offset);
            }
            for offset in 0..old.fsm_pages {
                self.bitmap.deallocate(old.fsm_start + offset);
            }
            self.fsm.mark_all_dirty();
            self.geometry_changed = true;
            tracing::debug!(
                from = old.fsm_start,
                to = self.geometry.fsm_start,
                pages = fsm_pages,
                "free-space map region relocated"
            );
        }
        Ok(())
    }

    /// Highest allocated page id, if any.
    pub fn highest_allocated(&self) -> Option<PageId> {
        self.bitmap.highest_allocated()
    }

    /// Shrinks coverage to `n_pages`; every page at or beyond the cut must
    /// already be free. Used by vacuum after trimming the file tail.
    pub fn shrink(&mut self, n_pages: u32) -> Result<()> {
        if let Some(high) = self.bitmap.highest_allocated() {
            if high >= n_pages {
                return Err(GaldrError::InvalidArgument(format!(
                    "cannot shrink to {n_pages} pages; page {high} is allocated"
                )));
            }
        }
        self.bitmap.resize(n_pages);
        self.fsm.resize(n_pages);
        self.bitmap.mark_all_dirty();
        self.fsm.mark_all_dirty();
        if self.hint >= n_pages {
            self.hint = 0;
        }
        Ok(())
    }

    /// Writes every dirty map page through `write`, clearing the dirty sets.
    pub fn persist<F>(&mut self, mut write: F) -> Result<()>
    where
        F: FnMut(PageId, Vec<u8>) -> Result<()>,
    {
        for idx in self.bitmap.take_dirty() {
            if idx < self.geometry.bitmap_pages {
                write(self.geometry.bitmap_start + idx, self.bitmap.encode_page(idx))?;
            }
        }
        for idx in self.fsm.take_dirty() {
            if idx < self.geometry.fsm_pages {
                write(self.geometry.fsm_start + idx, self.fsm.encode_page(idx))?;
            }
        }
        Ok(())
    }

    /// Map-region page ids, used by verification and vacuum to skip them.
    pub fn region_pages(&self) -> impl Iterator<Item = PageId> + '_ {
        let g = self.geometry;
        (g.bitmap_start..g.bitmap_start + g.bitmap_pages)
            .chain(g.fsm_start..g.fsm_start + g.fsm_pages)
    }
}
