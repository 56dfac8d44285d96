//! Collections metadata.
//!
//! One chained region of metadata pages stores, per collection: name, the
//! primary tree root, document count, the next document id, and the
//! secondary index definitions. The in-memory catalog is immutable and
//! swapped atomically after a commit that changes it.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{GaldrError, Result};
use crate::pager::{PageId, Pager};
use crate::storage::{page_type, DocId};

/// Metadata page header: type, flags, used bytes, next page in the chain.
const META_HEADER_SIZE: usize = 8;

/// Definition of one secondary index on a collection.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IndexDef {
    /// Index name, unique within the collection.
    pub name: String,
    /// Whether the index enforces key uniqueness.
    pub unique: bool,
    /// Root page of the index B+ tree.
    pub root_page: PageId,
}

/// Metadata for one collection.
#[derive(Clone, Debug)]
pub struct CollectionMeta {
    /// Collection name.
    pub name: Arc<str>,
    /// Root page of the primary B+ tree.
    pub root_page: PageId,
    /// Committed document count.
    pub doc_count: u64,
    /// Next document id to hand out; strictly greater than every committed id.
    pub next_id: DocId,
    /// Secondary index definitions.
    pub indexes: Vec<IndexDef>,
}

impl CollectionMeta {
    /// Looks up a secondary index by name.
    pub fn index(&self, name: &str) -> Option<&IndexDef> {
        self.indexes.iter().find(|idx| idx.name == name)
    }
}

/// Immutable snapshot of every collection's metadata.
#[derive(Clone, Debug, Default)]
pub struct Catalog {
    collections: BTreeMap<Arc<str>, CollectionMeta>,
}

impl Catalog {
    /// Empty catalog for a fresh database.
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up a collection by name.
    pub fn get(&self, name: &str) -> Option<&CollectionMeta> {
        self.collections.get(name)
    }

    /// Looks up a collection, erroring on absence.
    pub fn require(&self, name: &str) -> Result<&CollectionMeta> {
        self.get(name)
            .ok_or_else(|| GaldrError::InvalidArgument(format!("unknown collection {name:?}")))
    }

    /// Mutable access for the committing writer's private copy.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut CollectionMeta> {
        self.collections.get_mut(name)
    }

    /// Registers a collection.
    pub fn insert(&mut self, meta: CollectionMeta) {
        self.collections.insert(Arc::clone(&meta.name), meta);
    }

    /// Removes a collection, returning its metadata.
    pub fn remove(&mut self, name: &str) -> Option<CollectionMeta> {
        self.collections.remove(name)
    }

    /// Iterates collections in name order.
    pub fn iter(&self) -> impl Iterator<Item = &CollectionMeta> {
        self.collections.values()
    }

    /// Number of collections.
    pub fn len(&self) -> usize {
        self.collections.len()
    }

    /// Whether no collections exist.
    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }

    /// Serializes the catalog into a flat byte stream (page-agnostic).
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(self.collections.len() as u32).to_le_bytes());
        for meta in self.collections.values() {
            let name = meta.name.as_bytes();
            out.extend_from_slice(&(name.len() as u16).to_le_bytes());
            out.extend_from_slice(name);
            out.extend_from_slice(&meta.root_page.to_le_bytes());
            out.extend_from_slice(&meta.doc_count.to_le_bytes());
            out.extend_from_slice(&meta.next_id.to_le_bytes());
            out.extend_from_slice(&(meta.indexes.len() as u16).to_le_bytes());
            for index in &meta.indexes {
                let idx_name = index.name.as_bytes();
                out.extend_from_slice(&(idx_name.len() as u16).to_le_bytes());
                out.extend_from_slice(idx_name);
                out.push(u8::from(index.unique));
                out.extend_from_slice(&index.root_page.to_le_bytes());
            }
        }
        out
    }

    /// Parses the flat byte stream produced by [`encode`](Self::encode).
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(bytes);
        let count = cursor.u32()?;
        let mut catalog = Self::new();
        for _ in 0..count {
            let name_len = cursor.u16()? as usize;
            let name = cursor.str(name_len)?;
            let root_page = cursor.u32()?;
            let doc_count = cursor.u64()?;
            let next_id = cursor.u32()?;
            let index_count = cursor.u16()?;
            let mut indexes = Vec::with_capacity(index_count as usize);
            for _ in 0..index_count {
                let idx_name_len = cursor.u16()? as usize;
                let idx_name = cursor.str(idx_name_len)?;
                let unique = cursor.u8()? != 0;
                let idx_root = cursor.u32()?;
                indexes.push(IndexDef {
                    name: idx_name,
                    unique,
                    root_page: idx_root,
                });
            }
            catalog.insert(CollectionMeta {
                name: Arc::from(name.as_str()),
                root_page,
                doc_count,
                next_id,
                indexes,
            });
        }
        Ok(catalog)
    }

    /// Splits the encoded stream into page images chained through
    /// `page_ids`. Fails when the chain is too short; the caller allocates
    /// pages to match [`pages_needed`](Self::pages_needed) first.
    pub fn encode_pages(&self, page_ids: &[PageId], page_size: usize) -> Result<Vec<Vec<u8>>> {
        let payload = self.encode();
        let per_page = page_size - META_HEADER_SIZE;
        let needed = payload.len().div_ceil(per_page).max(1);
        if page_ids.len() < needed {
            return Err(GaldrError::InvalidArgument(format!(
                "catalog needs {needed} metadata pages, chain has {}",
                page_ids.len()
            )));
        }

        let mut pages = Vec::with_capacity(needed);
        let mut chunks = payload.chunks(per_page);
        for i in 0..needed {
            let chunk = chunks.next().unwrap_or(&[]);
            let mut image = vec![0u8; page_size];
            image[0] = page_type::META;
            image[2..4].copy_from_slice(&(chunk.len() as u16).to_le_bytes());
            let next = if i + 1 < needed { page_ids[i + 1] } else { 0 };
            image[4..8].copy_from_slice(&next.to_le_bytes());
            image[META_HEADER_SIZE..META_HEADER_SIZE + chunk.len()].copy_from_slice(chunk);
            pages.push(image);
        }
        Ok(pages)
    }

    /// Metadata pages required to hold the encoded catalog.
    pub fn pages_needed(&self, page_size: usize) -> usize {
        let per_page = page_size - META_HEADER_SIZE;
        self.encode().len().div_ceil(per_page).max(1)
    }

    /// Loads the catalog by following the metadata page chain from `head`.
    /// Returns the catalog and the chain's page ids.
    pub fn load(pager: &Pager, head: PageId) -> Result<(Self, Vec<PageId>)> {
        let mut payload = Vec::new();
        let mut chain = Vec::new();
        let mut next = head;
        while next != 0 {
            if chain.contains(&next) {
                return Err(GaldrError::corrupt_page(next, "metadata page chain loops"));
            }
            chain.push(next);
            let image = pager.read(next)?;
            if image[0] != page_type::META {
                return Err(GaldrError::corrupt_page(
                    next,
                    format!("expected metadata page, found type {:#x}", image[0]),
                ));
            }
            let used = u16::from_le_bytes(image[2..4].try_into().expect("2 bytes")) as usize;
            if META_HEADER_SIZE + used > image.len() {
                return Err(GaldrError::corrupt_page(next, "metadata page length out of range"));
            }
            payload.extend_from_slice(&image[META_HEADER_SIZE..META_HEADER_SIZE + used]);
            next = u32::from_le_bytes(image[4..8].try_into().expect("4 bytes"));
        }
        Ok((Self::decode(&payload)?, chain))
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| GaldrError::corrupt("metadata stream truncated"))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().expect("2 bytes")))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().expect("4 bytes")))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().expect("8 bytes")))
    }

    fn str(&mut self, n: usize) -> Result<String> {
        String::from_utf8(self.take(n)?.to_vec())
            .map_err(|_| GaldrError::corrupt("metadata name is not valid UTF-8"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pager::PagerOptions;
    use tempfile::NamedTempFile;

    fn sample() -> Catalog {
        let mut catalog = Catalog::new();
        catalog.insert(CollectionMeta {
            name: Arc::from("users"),
            root_page: 10,
            doc_count: 42,
            next_id: 43,
            indexes: vec![
                IndexDef {
                    name: "email".into(),
                    unique: true,
                    root_page: 11,
                },
                IndexDef {
                    name: "age_city".into(),
                    unique: false,
                    root_page: 12,
                },
            ],
        });
        catalog.insert(CollectionMeta {
            name: Arc::from("orders"),
            root_page: 20,
            doc_count: 0,
            next_id: 1,
            indexes: Vec::new(),
        });
        catalog
    }

    #[test]
    fn encode_decode_round_trip() {
        let catalog = sample();
        let decoded = Catalog::decode(&catalog.encode()).expect("decode");
        assert_eq!(decoded.len(), 2);
        let users = decoded.get("users").expect("users");
        assert_eq!(users.root_page, 10);
        assert_eq!(users.doc_count, 42);
        assert_eq!(users.next_id, 43);
        assert_eq!(users.indexes.len(), 2);
        assert!(users.index("email").expect("email").unique);
        assert!(!users.index("age_city").expect("age_city").unique);
        assert_eq!(decoded.get("orders").expect("orders").next_id, 1);
    }

    #[test]
    fn round_trips_through_chained_pages() {
        let tmp = NamedTempFile::new().expect("temp file");
        let pager = Pager::open(
            tmp.path(),
            PagerOptions {
                page_size: 1024,
                cache_pages: 8,
                use_mmap: false,
            },
            None,
        )
        .expect("open pager");
        pager.set_length(8).expect("length");

        // Enough collections to overflow one 1024-byte page.
        let mut catalog = Catalog::new();
        for i in 0..40 {
            catalog.insert(CollectionMeta {
                name: Arc::from(format!("collection_with_a_long_name_{i:03}").as_str()),
                root_page: 100 + i,
                doc_count: u64::from(i),
                next_id: i + 1,
                indexes: vec![IndexDef {
                    name: format!("index_{i:03}"),
                    unique: i % 2 == 0,
                    root_page: 200 + i,
                }],
            });
        }

        let needed = catalog.pages_needed(1024);
        assert!(needed > 1, "test expects a chained catalog, got {needed} page");
        let chain: Vec<PageId> = (3..3 + needed as u32).collect();
        let images = catalog.encode_pages(&chain, 1024).expect("encode pages");
        for (page_id, image) in chain.iter().zip(&images) {
            pager.write_direct(*page_id, image).expect("write");
        }

        let (loaded, loaded_chain) = Catalog::load(&pager, chain[0]).expect("load");
        assert_eq!(loaded_chain, chain);
        assert_eq!(loaded.len(), 40);
        let c7 = loaded.get("collection_with_a_long_name_007").expect("c7");
        assert_eq!(c7.root_page, 107);
        assert_eq!(c7.indexes[0].root_page, 207);
    }

    #[test]
    fn truncated_stream_is_corruption() {
        let catalog = sample();
        let mut bytes = catalog.encode();
        bytes.truncate(bytes.len() - 3);
        assert!(matches!(
            Catalog::decode(&bytes),
            Err(GaldrError::StorageCorrupt { .. })
        ));
    }
}
