//! B+ tree node page codecs.
//!
//! Both tree flavors share an 8-byte node header: page type, node type
//! (internal or leaf), key count, and the `next_leaf` link that strings
//! leaves together for range scans. Primary nodes hold fixed-size integer
//! keys; secondary nodes hold length-prefixed byte-string keys whose leaf
//! values are duplicate posting lists, spilling to an overflow chain when a
//! single key outgrows its leaf share.

use crate::error::{GaldrError, Result};
use crate::pager::PageId;
use crate::storage::{page_type, DocId, SlotPointer};

/// Bytes of the shared node header.
pub const NODE_HEADER_SIZE: usize = 8;

const NODE_INTERNAL: u8 = 0;
const NODE_LEAF: u8 = 1;

/// Bytes of one primary leaf value (`page_id` + `slot`).
pub const PRIMARY_VALUE_SIZE: usize = 6;
/// Bytes of one secondary posting entry (`doc_id` + locator).
pub const INDEX_ENTRY_SIZE: usize = 10;

/// A secondary index posting: the document and the exact version location
/// the entry was written for.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct IndexEntry {
    /// Document the key belongs to.
    pub doc_id: DocId,
    /// Location of the document version that carried this key.
    pub ptr: SlotPointer,
}

/// Leaf value of a secondary node: inline postings or the head of an
/// overflow chain.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PostingValue {
    /// Entries stored in the leaf itself.
    Inline(Vec<IndexEntry>),
    /// Head page of an overflow chain holding the entries.
    Overflow(PageId),
}

impl PostingValue {
    fn encoded_size(&self) -> usize {
        match self {
            Self::Inline(entries) => 1 + 2 + entries.len() * INDEX_ENTRY_SIZE,
            Self::Overflow(_) => 1 + 4,
        }
    }
}

/// In-memory form of a primary (integer-keyed) node.
#[derive(Clone, Debug, PartialEq)]
pub struct PrimaryNode {
    /// Leaf or internal.
    pub is_leaf: bool,
    /// Sorted keys.
    pub keys: Vec<DocId>,
    /// `keys.len() + 1` children (internal nodes only).
    pub children: Vec<PageId>,
    /// Per-key locators (leaf nodes only).
    pub values: Vec<SlotPointer>,
    /// Right sibling leaf, zero for none.
    pub next_leaf: PageId,
}

impl PrimaryNode {
    /// Empty leaf.
    pub fn new_leaf() -> Self {
        Self {
            is_leaf: true,
            keys: Vec::new(),
            children: Vec::new(),
            values: Vec::new(),
            next_leaf: 0,
        }
    }

    /// Internal node over existing children.
    pub fn new_internal(keys: Vec<DocId>, children: Vec<PageId>) -> Self {
        Self {
            is_leaf: false,
            keys,
            children,
            values: Vec::new(),
            next_leaf: 0,
        }
    }

    /// Child to descend into for `key`: first child whose separator is
    /// greater than the key.
    pub fn child_for(&self, key: DocId) -> PageId {
        let idx = self.keys.partition_point(|&k| k <= key);
        self.children[idx]
    }

    /// Serializes into a page image of `page_size` bytes.
    pub fn encode(&self, page_size: usize) -> Result<Vec<u8>> {
        let mut out = vec![0u8; page_size];
        out[0] = page_type::TREE_PRIMARY;
        out[1] = if self.is_leaf { NODE_LEAF } else { NODE_INTERNAL };
        out[2..4].copy_from_slice(&(self.keys.len() as u16).to_le_bytes());
        out[4..8].copy_from_slice(&self.next_leaf.to_le_bytes());

        let mut pos = NODE_HEADER_SIZE;
        for key in &self.keys {
            write_bytes(&mut out, &mut pos, &key.to_le_bytes())?;
        }
        if self.is_leaf {
            debug_assert_eq!(self.keys.len(), self.values.len());
            for value in &self.values {
                write_bytes(&mut out, &mut pos, &value.page_id.to_le_bytes())?;
                write_bytes(&mut out, &mut pos, &value.slot.to_le_bytes())?;
            }
        } else {
            debug_assert_eq!(self.keys.len() + 1, self.children.len());
            for child in &self.children {
                write_bytes(&mut out, &mut pos, &child.to_le_bytes())?;
            }
        }
        Ok(out)
    }

    /// Parses a page image.
    pub fn decode(data: &[u8], page_id: PageId) -> Result<Self> {
        if data.len() < NODE_HEADER_SIZE || data[0] != page_type::TREE_PRIMARY {
            return Err(GaldrError::corrupt_page(
                page_id,
                "expected a primary tree node",
            ));
        }
        let is_leaf = match data[1] {
            NODE_LEAF => true,
            NODE_INTERNAL => false,
            other => {
                return Err(GaldrError::corrupt_page(
                    page_id,
                    format!("unknown node type {other}"),
                ))
            }
        };
        let key_count = u16::from_le_bytes(data[2..4].try_into().expect("2 bytes")) as usize;
        let next_leaf = u32::from_le_bytes(data[4..8].try_into().expect("4 bytes"));

        let mut pos = NODE_HEADER_SIZE;
        let mut keys = Vec::with_capacity(key_count);
        for _ in 0..key_count {
            keys.push(read_u32(data, &mut pos, page_id)?);
        }
        let mut node = Self {
            is_leaf,
            keys,
            children: Vec::new(),
            values: Vec::new(),
            next_leaf,
        };
        if is_leaf {
            node.values.reserve(key_count);
            for _ in 0..key_count {
                let pid = read_u32(data, &mut pos, page_id)?;
                let slot = read_u16(data, &mut pos, page_id)?;
                node.values.push(SlotPointer { page_id: pid, slot });
            }
        } else {
            node.children.reserve(key_count + 1);
            for _ in 0..key_count + 1 {
                node.children.push(read_u32(data, &mut pos, page_id)?);
            }
        }
        Ok(node)
    }

    /// Largest key count a node of either type can hold in `page_size`.
    pub fn max_keys_for(page_size: usize) -> usize {
        let body = page_size - NODE_HEADER_SIZE;
        let leaf = body / (4 + PRIMARY_VALUE_SIZE);
        let internal = (body - 4) / 8;
        leaf.min(internal)
    }
}

/// In-memory form of a secondary (byte-string-keyed) node.
#[derive(Clone, Debug, PartialEq)]
pub struct SecondaryNode {
    /// Leaf or internal.
    pub is_leaf: bool,
    /// Sorted keys (lexicographic, length-second).
    pub keys: Vec<Vec<u8>>,
    /// `keys.len() + 1` children (internal nodes only).
    pub children: Vec<PageId>,
    /// Per-key posting values (leaf nodes only).
    pub values: Vec<PostingValue>,
    /// Right sibling leaf, zero for none.
    pub next_leaf: PageId,
}

impl SecondaryNode {
    /// Empty leaf.
    pub fn new_leaf() -> Self {
        Self {
            is_leaf: true,
            keys: Vec::new(),
            children: Vec::new(),
            values: Vec::new(),
            next_leaf: 0,
        }
    }

    /// Internal node over existing children.
    pub fn new_internal(keys: Vec<Vec<u8>>, children: Vec<PageId>) -> Self {
        Self {
            is_leaf: false,
            keys,
            children,
            values: Vec::new(),
            next_leaf: 0,
        }
    }

    /// Child to descend into for `key`.
    pub fn child_for(&self, key: &[u8]) -> PageId {
        let idx = self.keys.partition_point(|k| k.as_slice() <= key);
        self.children[idx]
    }

    /// Encoded byte size, for split decisions.
    pub fn encoded_size(&self) -> usize {
        let mut size = NODE_HEADER_SIZE;
        for key in &self.keys {
            size += 2 + key.len();
        }
        if self.is_leaf {
            for value in &self.values {
                size += value.encoded_size();
            }
        } else {
            size += (self.keys.len() + 1) * 4;
        }
        size
    }

    /// Whether the node serializes into `page_size` bytes.
    pub fn fits(&self, page_size: usize) -> bool {
        self.encoded_size() <= page_size
    }

    /// Serializes into a page image of `page_size` bytes.
    pub fn encode(&self, page_size: usize) -> Result<Vec<u8>> {
        let mut out = vec![0u8; page_size];
        out[0] = page_type::TREE_SECONDARY;
        out[1] = if self.is_leaf { NODE_LEAF } else { NODE_INTERNAL };
        out[2..4].copy_from_slice(&(self.keys.len() as u16).to_le_bytes());
        out[4..8].copy_from_slice(&self.next_leaf.to_le_bytes());

        let mut pos = NODE_HEADER_SIZE;
        if self.is_leaf {
            debug_assert_eq!(self.keys.len(), self.values.len());
            for (key, value) in self.keys.iter().zip(&self.values) {
                write_bytes(&mut out, &mut pos, &(key.len() as u16).to_le_bytes())?;
                write_bytes(&mut out, &mut pos, key)?;
                match value {
                    PostingValue::Inline(entries) => {
                        write_bytes(&mut out, &mut pos, &[0u8])?;
                        write_bytes(&mut out, &mut pos, &(entries.len() as u16).to_le_bytes())?;
                        for entry in entries {
                            write_bytes(&mut out, &mut pos, &entry.doc_id.to_le_bytes())?;
                            write_bytes(&mut out, &mut pos, &entry.ptr.page_id.to_le_bytes())?;
                            write_bytes(&mut out, &mut pos, &entry.ptr.slot.to_le_bytes())?;
                        }
                    }
                    PostingValue::Overflow(head) => {
                        write_bytes(&mut out, &mut pos, &[1u8])?;
                        write_bytes(&mut out, &mut pos, &head.to_le_bytes())?;
                    }
                }
            }
        } else {
            debug_assert_eq!(self.keys.len() + 1, self.children.len());
            for key in &self.keys {
                write_bytes(&mut out, &mut pos, &(key.len() as u16).to_le_bytes())?;
                write_bytes(&mut out, &mut pos, key)?;
            }
            for child in &self.children {
                write_bytes(&mut out, &mut pos, &child.to_le_bytes())?;
            }
        }
        Ok(out)
    }

    /// Parses a page image.
    pub fn decode(data: &[u8], page_id: PageId) -> Result<Self> {
        if data.len() < NODE_HEADER_SIZE || data[0] != page_type::TREE_SECONDARY {
            return Err(GaldrError::corrupt_page(
                page_id,
                "expected a secondary tree node",
            ));
        }
        let is_leaf = match data[1] {
            NODE_LEAF => true,
            NODE_INTERNAL => false,
            other => {
                return Err(GaldrError::corrupt_page(
                    page_id,
                    format!("unknown node type {other}"),
                ))
            }
        };
        let key_count = u16::from_le_bytes(data[2..4].try_into().expect("2 bytes")) as usize;
        let next_leaf = u32::from_le_bytes(data[4..8].try_into().expect("4 bytes"));

        let mut pos = NODE_HEADER_SIZE;
        let mut node = Self {
            is_leaf,
            keys: Vec::with_capacity(key_count),
            children: Vec::new(),
            values: Vec::new(),
            next_leaf,
        };
        if is_leaf {
            for _ in 0..key_count {
                let key_len = read_u16(data, &mut pos, page_id)? as usize;
                node.keys.push(read_slice(data, &mut pos, key_len, page_id)?.to_vec());
                let tag = read_slice(data, &mut pos, 1, page_id)?[0];
                match tag {
                    0 => {
                        let count = read_u16(data, &mut pos, page_id)? as usize;
                        let mut entries = Vec::with_capacity(count);
                        for _ in 0..count {
                            let doc_id = read_u32(data, &mut pos, page_id)?;
                            let pid = read_u32(data, &mut pos, page_id)?;
                            let slot = read_u16(data, &mut pos, page_id)?;
                            entries.push(IndexEntry {
                                doc_id,
                                ptr: SlotPointer { page_id: pid, slot },
                            });
                        }
                        node.values.push(PostingValue::Inline(entries));
                    }
                    1 => {
                        let head = read_u32(data, &mut pos, page_id)?;
                        node.values.push(PostingValue::Overflow(head));
                    }
                    other => {
                        return Err(GaldrError::corrupt_page(
                            page_id,
                            format!("unknown posting tag {other}"),
                        ))
                    }
                }
            }
        } else {
            for _ in 0..key_count {
                let key_len = read_u16(data, &mut pos, page_id)? as usize;
                node.keys.push(read_slice(data, &mut pos, key_len, page_id)?.to_vec());
            }
            node.children.reserve(key_count + 1);
            for _ in 0..key_count + 1 {
                node.children.push(read_u32(data, &mut pos, page_id)?);
            }
        }
        Ok(node)
    }
}

/// Overflow chain page for a secondary key's surplus postings.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OverflowPage {
    /// Postings held by this chain link.
    pub entries: Vec<IndexEntry>,
    /// Next chain page, zero for the tail.
    pub next: PageId,
}

impl OverflowPage {
    /// Entries one chain page can hold in `page_size`.
    pub fn capacity(page_size: usize) -> usize {
        (page_size - NODE_HEADER_SIZE) / INDEX_ENTRY_SIZE
    }

    /// Serializes into a page image of `page_size` bytes.
    pub fn encode(&self, page_size: usize) -> Result<Vec<u8>> {
        let mut out = vec![0u8; page_size];
        out[0] = page_type::INDEX_OVERFLOW;
        out[2..4].copy_from_slice(&(self.entries.len() as u16).to_le_bytes());
        out[4..8].copy_from_slice(&self.next.to_le_bytes());
        let mut pos = NODE_HEADER_SIZE;
        for entry in &self.entries {
            write_bytes(&mut out, &mut pos, &entry.doc_id.to_le_bytes())?;
            write_bytes(&mut out, &mut pos, &entry.ptr.page_id.to_le_bytes())?;
            write_bytes(&mut out, &mut pos, &entry.ptr.slot.to_le_bytes())?;
        }
        Ok(out)
    }

    /// Parses a page image.
    pub fn decode(data: &[u8], page_id: PageId) -> Result<Self> {
        if data.len() < NODE_HEADER_SIZE || data[0] != page_type::INDEX_OVERFLOW {
            return Err(GaldrError::corrupt_page(page_id, "expected an overflow page"));
        }
        let count = u16::from_le_bytes(data[2..4].try_into().expect("2 bytes")) as usize;
        let next = u32::from_le_bytes(data[4..8].try_into().expect("4 bytes"));
        let mut pos = NODE_HEADER_SIZE;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let doc_id = read_u32(data, &mut pos, page_id)?;
            let pid = read_u32(data, &mut pos, page_id)?;
            let slot = read_u16(data, &mut pos, page_id)?;
            entries.push(IndexEntry {
                doc_id,
                ptr: SlotPointer { page_id: pid, slot },
            });
        }
        Ok(Self { entries, next })
    }
}

fn write_bytes(out: &mut [u8], pos: &mut usize, bytes: &[u8]) -> Result<()> {
    let end = *pos + bytes.len();
    if end > out.len() {
        return Err(GaldrError::corrupt("tree node overran its page"));
    }
    out[*pos..end].copy_from_slice(bytes);
    *pos = end;
    Ok(())
}

fn read_slice<'a>(data: &'a [u8], pos: &mut usize, len: usize, page_id: PageId) -> Result<&'a [u8]> {
    let end = pos
        .checked_add(len)
        .filter(|&end| end <= data.len())
        .ok_or_else(|| GaldrError::corrupt_page(page_id, "tree node truncated"))?;
    let slice = &data[*pos..end];
    *pos = end;
    Ok(slice)
}

fn read_u16(data: &[u8], pos: &mut usize, page_id: PageId) -> Result<u16> {
    Ok(u16::from_le_bytes(
        read_slice(data, pos, 2, page_id)?.try_into().expect("2 bytes"),
    ))
}

fn read_u32(data: &[u8], pos: &mut usize, page_id: PageId) -> Result<u32> {
    Ok(u32::from_le_bytes(
        read_slice(data, pos, 4, page_id)?.try_into().expect("4 bytes"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primary_leaf_round_trip() {
        let node = PrimaryNode {
            is_leaf: true,
            keys: vec![3, 7, 12],
            children: Vec::new(),
            values: vec![
                SlotPointer { page_id: 4, slot: 0 },
                SlotPointer { page_id: 4, slot: 1 },
                SlotPointer { page_id: 9, slot: 2 },
            ],
            next_leaf: 15,
        };
        let image = node.encode(1024).expect("encode");
        assert_eq!(PrimaryNode::decode(&image, 1).expect("decode"), node);
    }

    #[test]
    fn primary_internal_round_trip_and_routing() {
        let node = PrimaryNode::new_internal(vec![10, 20], vec![100, 101, 102]);
        let image = node.encode(1024).expect("encode");
        let parsed = PrimaryNode::decode(&image, 1).expect("decode");
        assert_eq!(parsed, node);
        assert_eq!(parsed.child_for(5), 100);
        assert_eq!(parsed.child_for(10), 101, "equal key descends right");
        assert_eq!(parsed.child_for(19), 101);
        assert_eq!(parsed.child_for(20), 102);
    }

    #[test]
    fn primary_order_fits_the_page() {
        let order = PrimaryNode::max_keys_for(1024);
        let node = PrimaryNode {
            is_leaf: true,
            keys: (0..order as u32).collect(),
            children: Vec::new(),
            values: (0..order as u32)
                .map(|i| SlotPointer { page_id: i, slot: 0 })
                .collect(),
            next_leaf: 0,
        };
        node.encode(1024).expect("max-order leaf must fit");
    }

    #[test]
    fn secondary_leaf_round_trip_with_postings() {
        let node = SecondaryNode {
            is_leaf: true,
            keys: vec![b"alpha".to_vec(), b"beta".to_vec()],
            children: Vec::new(),
            values: vec![
                PostingValue::Inline(vec![
                    IndexEntry {
                        doc_id: 1,
                        ptr: SlotPointer { page_id: 30, slot: 0 },
                    },
                    IndexEntry {
                        doc_id: 8,
                        ptr: SlotPointer { page_id: 30, slot: 3 },
                    },
                ]),
                PostingValue::Overflow(77),
            ],
            next_leaf: 5,
        };
        let image = node.encode(1024).expect("encode");
        let parsed = SecondaryNode::decode(&image, 2).expect("decode");
        assert_eq!(parsed, node);
        assert_eq!(parsed.encoded_size(), node.encoded_size());
        assert!(node.fits(1024));
    }

    #[test]
    fn secondary_internal_round_trip_and_routing() {
        let node = SecondaryNode::new_internal(
            vec![b"m".to_vec(), b"t".to_vec()],
            vec![40, 41, 42],
        );
        let image = node.encode(1024).expect("encode");
        let parsed = SecondaryNode::decode(&image, 3).expect("decode");
        assert_eq!(parsed, node);
        assert_eq!(parsed.child_for(b"a"), 40);
        assert_eq!(parsed.child_for(b"m"), 41);
        assert_eq!(parsed.child_for(b"z"), 42);
    }

    #[test]
    fn overflow_page_round_trip() {
        let page = OverflowPage {
            entries: (0..5)
                .map(|i| IndexEntry {
                    doc_id: i,
                    ptr: SlotPointer {
                        page_id: 50 + i,
                        slot: i as u16,
                    },
                })
                .collect(),
            next: 91,
        };
        let image = page.encode(1024).expect("encode");
        assert_eq!(OverflowPage::decode(&image, 4).expect("decode"), page);
        assert_eq!(OverflowPage::capacity(1024), (1024 - 8) / 10);
    }
}
