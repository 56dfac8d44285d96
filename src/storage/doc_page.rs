//! Slotted document page.
//!
//! The slot directory grows up from the header; payload bytes grow down from
//! the page end. Each slot is a variable-length entry carrying the extent
//! page list for multi-page documents or the in-page offset for inline ones.
//! Tombstoned slots keep their index (locators stay stable) but give their
//! payload bytes back through compaction.

use crc32fast::hash as crc32;

use crate::alloc::SpaceLevel;
use crate::error::{GaldrError, Result};
use crate::pager::PageId;
use crate::storage::page_type;

/// Fixed header bytes at the start of every document page.
pub const DOC_HEADER_SIZE: usize = 12;
/// Fixed bytes of a slot entry before its page-id list.
pub const SLOT_FIXED_SIZE: usize = 10;
/// Directory bytes consumed by a single-page document's slot.
pub const INLINE_SLOT_SIZE: usize = SLOT_FIXED_SIZE + 4;

const SLOT_COUNT_OFFSET: usize = 2;
const FREE_OFFSET_OFFSET: usize = 4;
const FREE_END_OFFSET: usize = 6;
const CRC_OFFSET: usize = 8;

/// Decoded slot directory entry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Slot {
    /// Number of extent pages; zero marks a tombstone.
    pub page_count: u16,
    /// Total document size across the extent, or the inline length.
    pub total_size: u32,
    /// Payload offset within this page (inline slots only).
    pub offset: u16,
    /// Payload length within this page (inline slots only).
    pub length: u16,
    /// Extent page list; for inline slots this is the page itself.
    pub page_ids: Vec<PageId>,
}

impl Slot {
    /// Whether the slot has been deleted.
    pub fn is_tombstone(&self) -> bool {
        self.page_count == 0
    }

    /// Whether the document lives entirely in this page's payload region.
    pub fn is_inline(&self, own_page: PageId) -> bool {
        self.page_count == 1 && self.page_ids.first() == Some(&own_page)
    }

    fn entry_size(&self) -> usize {
        SLOT_FIXED_SIZE + 4 * self.page_ids.len()
    }
}

/// Mutable view over a document page buffer.
pub struct DocPage<'a> {
    data: &'a mut [u8],
    page_id: PageId,
}

impl<'a> DocPage<'a> {
    /// Formats `data` as an empty document page.
    pub fn initialize(data: &mut [u8], _page_id: PageId) {
        data.fill(0);
        data[0] = page_type::DOCUMENT;
        write_u16(data, SLOT_COUNT_OFFSET, 0);
        write_u16(data, FREE_OFFSET_OFFSET, DOC_HEADER_SIZE as u16);
        write_u16(data, FREE_END_OFFSET, data.len() as u16);
    }

    /// Wraps an existing document page, validating its header.
    pub fn new(data: &'a mut [u8], page_id: PageId) -> Result<Self> {
        if data.len() < DOC_HEADER_SIZE {
            return Err(GaldrError::corrupt_page(page_id, "page shorter than header"));
        }
        if data[0] != page_type::DOCUMENT {
            return Err(GaldrError::corrupt_page(
                page_id,
                format!("expected document page, found type {:#x}", data[0]),
            ));
        }
        let page = Self { data, page_id };
        let (offset, end) = (page.free_space_offset(), page.free_space_end());
        if offset > end || end as usize > page.data.len() || (offset as usize) < DOC_HEADER_SIZE {
            return Err(GaldrError::corrupt_page(
                page_id,
                "free space pointers out of range",
            ));
        }
        Ok(page)
    }

    /// Verifies the stored CRC32 of a page image.
    pub fn verify_checksum(data: &[u8], page_id: PageId) -> Result<()> {
        if data.len() < DOC_HEADER_SIZE {
            return Err(GaldrError::corrupt_page(page_id, "page shorter than header"));
        }
        let stored = u16_pair_u32(data, CRC_OFFSET);
        let mut copy = data.to_vec();
        copy[CRC_OFFSET..CRC_OFFSET + 4].fill(0);
        if crc32(&copy) != stored {
            return Err(GaldrError::corrupt_page(page_id, "document page checksum mismatch"));
        }
        Ok(())
    }

    /// Recomputes and stores the page CRC. Call after any mutation.
    pub fn finalize(&mut self) {
        self.data[CRC_OFFSET..CRC_OFFSET + 4].fill(0);
        let digest = crc32(self.data);
        self.data[CRC_OFFSET..CRC_OFFSET + 4].copy_from_slice(&digest.to_le_bytes());
    }

    /// Number of slots, tombstones included.
    pub fn slot_count(&self) -> u16 {
        read_u16(self.data, SLOT_COUNT_OFFSET)
    }

    /// End of the slot directory.
    pub fn free_space_offset(&self) -> u16 {
        read_u16(self.data, FREE_OFFSET_OFFSET)
    }

    /// Start of the payload region.
    pub fn free_space_end(&self) -> u16 {
        read_u16(self.data, FREE_END_OFFSET)
    }

    /// Bytes between the directory and the payload region.
    pub fn physical_free(&self) -> usize {
        self.free_space_end() as usize - self.free_space_offset() as usize
    }

    /// Payload bytes held by tombstoned slots, reclaimable by compaction.
    pub fn hole_bytes(&self) -> Result<usize> {
        let mut holes = 0usize;
        for idx in 0..self.slot_count() {
            let slot = self.slot(idx)?;
            if slot.is_tombstone() {
                holes += slot.length as usize;
            }
        }
        Ok(holes)
    }

    /// Physical free space plus reclaimable holes.
    pub fn logical_free(&self) -> Result<usize> {
        Ok(self.physical_free() + self.hole_bytes()?)
    }

    /// Free-space classification of this page.
    pub fn level(&self) -> Result<SpaceLevel> {
        Ok(SpaceLevel::classify(self.logical_free()?, self.data.len()))
    }

    /// Count of live (non-tombstone) slots.
    pub fn live_count(&self) -> Result<u16> {
        let mut live = 0;
        for idx in 0..self.slot_count() {
            if !self.slot(idx)?.is_tombstone() {
                live += 1;
            }
        }
        Ok(live)
    }

    /// Decodes the slot at `index`.
    pub fn slot(&self, index: u16) -> Result<Slot> {
        let pos = self.entry_pos(index)?;
        self.decode_slot_at(pos)
    }

    /// Whether an inline document of `payload_len` bytes fits.
    pub fn can_fit_inline(&self, payload_len: usize) -> bool {
        payload_len + INLINE_SLOT_SIZE <= self.physical_free()
    }

    /// Whether an extent head slot for `n_pages` pages fits.
    pub fn can_fit_head(&self, n_pages: usize) -> bool {
        SLOT_FIXED_SIZE + 4 * n_pages <= self.physical_free()
    }

    /// Appends an inline document, returning its slot index.
    pub fn add_inline(&mut self, bytes: &[u8]) -> Result<u16> {
        if !self.can_fit_inline(bytes.len()) {
            return Err(GaldrError::corrupt_page(self.page_id, "inline document does not fit"));
        }
        let new_end = self.free_space_end() as usize - bytes.len();
        self.data[new_end..new_end + bytes.len()].copy_from_slice(bytes);

        let slot = Slot {
            page_count: 1,
            total_size: bytes.len() as u32,
            offset: new_end as u16,
            length: bytes.len() as u16,
            page_ids: vec![self.page_id],
        };
        write_u16(self.data, FREE_END_OFFSET, new_end as u16);
        self.append_entry(&slot)
    }

    /// Appends a head slot for a multi-page extent.
    pub fn add_extent_head(&mut self, page_ids: &[PageId], total_size: u32) -> Result<u16> {
        if page_ids.is_empty() {
            return Err(GaldrError::InvalidArgument("extent needs at least one page".into()));
        }
        if !self.can_fit_head(page_ids.len()) {
            return Err(GaldrError::corrupt_page(self.page_id, "extent head slot does not fit"));
        }
        let slot = Slot {
            page_count: page_ids.len() as u16,
            total_size,
            offset: 0,
            length: 0,
            page_ids: page_ids.to_vec(),
        };
        self.append_entry(&slot)
    }

    /// Inline payload bytes of the slot at `index`.
    pub fn read_inline(&self, index: u16) -> Result<&[u8]> {
        let slot = self.slot(index)?;
        if slot.is_tombstone() {
            return Err(GaldrError::DocumentSlotDeleted {
                page_id: self.page_id,
                slot: index,
            });
        }
        if !slot.is_inline(self.page_id) {
            return Err(GaldrError::corrupt_page(self.page_id, "slot is not inline"));
        }
        let start = slot.offset as usize;
        let end = start + slot.length as usize;
        if start < DOC_HEADER_SIZE || end > self.data.len() {
            return Err(GaldrError::corrupt_page(self.page_id, "inline payload out of range"));
        }
        Ok(&self.data[start..end])
    }

    /// Tombstones the slot at `index`, returning what it held. The slot
    /// index stays valid; its payload becomes hole space.
    pub fn tombstone(&mut self, index: u16) -> Result<Slot> {
        let old = self.slot(index)?;
        if old.is_tombstone() {
            return Err(GaldrError::DocumentSlotDeleted {
                page_id: self.page_id,
                slot: index,
            });
        }
        let keep_len = if old.is_inline(self.page_id) { old.length } else { 0 };
        let replacement = Slot {
            page_count: 0,
            total_size: 0,
            offset: if keep_len > 0 { old.offset } else { 0 },
            length: keep_len,
            page_ids: Vec::new(),
        };
        self.replace_entry(index, &replacement)?;
        Ok(old)
    }

    /// Repacks live inline payloads against the high end of the page,
    /// zeroing holes. Idempotent; returns bytes reclaimed.
    pub fn compact(&mut self) -> Result<usize> {
        let count = self.slot_count();
        let mut slots = Vec::with_capacity(count as usize);
        for idx in 0..count {
            slots.push(self.slot(idx)?);
        }

        // Lift live inline payloads out before rewriting the region.
        let mut payloads: Vec<Option<Vec<u8>>> = Vec::with_capacity(slots.len());
        for slot in &slots {
            if !slot.is_tombstone() && slot.is_inline(self.page_id) {
                let start = slot.offset as usize;
                payloads.push(Some(self.data[start..start + slot.length as usize].to_vec()));
            } else {
                payloads.push(None);
            }
        }

        let before_end = self.free_space_end() as usize;
        let mut new_end = self.data.len();
        for (slot, payload) in slots.iter_mut().zip(payloads.iter()) {
            if let Some(bytes) = payload {
                new_end -= bytes.len();
                self.data[new_end..new_end + bytes.len()].copy_from_slice(bytes);
                slot.offset = new_end as u16;
            } else if slot.is_tombstone() {
                slot.offset = 0;
                slot.length = 0;
            }
        }
        let dir_end = self.free_space_offset() as usize;
        self.data[dir_end..new_end].fill(0);
        write_u16(self.data, FREE_END_OFFSET, new_end as u16);

        // Rewrite the directory with the updated offsets.
        let mut pos = DOC_HEADER_SIZE;
        for slot in &slots {
            pos = self.encode_slot_at(pos, slot);
        }

        Ok(new_end.saturating_sub(before_end))
    }

    fn entry_pos(&self, index: u16) -> Result<usize> {
        if index >= self.slot_count() {
            return Err(GaldrError::corrupt_page(
                self.page_id,
                format!("slot {index} out of range ({} slots)", self.slot_count()),
            ));
        }
        let mut pos = DOC_HEADER_SIZE;
        for _ in 0..index {
            let page_count = read_u16(self.data, pos) as usize;
            pos += SLOT_FIXED_SIZE + 4 * page_count;
        }
        Ok(pos)
    }

    fn decode_slot_at(&self, pos: usize) -> Result<Slot> {
        let dir_end = self.free_space_offset() as usize;
        if pos + SLOT_FIXED_SIZE > dir_end {
            return Err(GaldrError::corrupt_page(self.page_id, "slot entry beyond directory"));
        }
        let page_count = read_u16(self.data, pos);
        let total_size = u16_pair_u32(self.data, pos + 2);
        let offset = read_u16(self.data, pos + 6);
        let length = read_u16(self.data, pos + 8);
        let ids_end = pos + SLOT_FIXED_SIZE + 4 * page_count as usize;
        if ids_end > dir_end {
            return Err(GaldrError::corrupt_page(self.page_id, "slot page list beyond directory"));
        }
        let mut page_ids = Vec::with_capacity(page_count as usize);
        for i in 0..page_count as usize {
            let at = pos + SLOT_FIXED_SIZE + 4 * i;
            page_ids.push(u16_pair_u32(self.data, at));
        }
        Ok(Slot {
            page_count,
            total_size,
            offset,
            length,
            page_ids,
        })
    }

    fn append_entry(&mut self, slot: &Slot) -> Result<u16> {
        let pos = self.free_space_offset() as usize;
        let end = self.encode_slot_at(pos, slot);
        if end > self.free_space_end() as usize {
            return Err(GaldrError::corrupt_page(self.page_id, "slot directory overran payload"));
        }
        write_u16(self.data, FREE_OFFSET_OFFSET, end as u16);
        let index = self.slot_count();
        write_u16(self.data, SLOT_COUNT_OFFSET, index + 1);
        Ok(index)
    }

    /// Replaces the entry at `index`, shifting later entries when the entry
    /// size changes.
    fn replace_entry(&mut self, index: u16, slot: &Slot) -> Result<()> {
        let pos = self.entry_pos(index)?;
        let old = self.decode_slot_at(pos)?;
        let old_size = old.entry_size();
        let new_size = slot.entry_size();
        let dir_end = self.free_space_offset() as usize;

        if new_size != old_size {
            let tail_start = pos + old_size;
            self.data.copy_within(tail_start..dir_end, pos + new_size);
            let new_dir_end = dir_end - old_size + new_size;
            if new_size < old_size {
                self.data[new_dir_end..dir_end].fill(0);
            }
            write_u16(self.data, FREE_OFFSET_OFFSET, new_dir_end as u16);
        }
        self.encode_slot_at(pos, slot);
        Ok(())
    }

    fn encode_slot_at(&mut self, pos: usize, slot: &Slot) -> usize {
        write_u16(self.data, pos, slot.page_count);
        self.data[pos + 2..pos + 6].copy_from_slice(&slot.total_size.to_le_bytes());
        write_u16(self.data, pos + 6, slot.offset);
        write_u16(self.data, pos + 8, slot.length);
        for (i, id) in slot.page_ids.iter().enumerate() {
            let at = pos + SLOT_FIXED_SIZE + 4 * i;
            self.data[at..at + 4].copy_from_slice(&id.to_le_bytes());
        }
        pos + slot.entry_size()
    }
}

fn read_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes(data[offset..offset + 2].try_into().expect("2 bytes"))
}

fn write_u16(data: &mut [u8], offset: usize, value: u16) {
    data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn u16_pair_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(data[offset..offset + 4].try_into().expect("4 bytes"))
}
