//! Page I/O against the backing file.
//!
//! The pager owns the file handle and hands out fixed-size page images. Reads
//! go through a bounded LRU cache with an optional read-only memory-map fast
//! path; commit-time writes land in the cache as pinned dirty pages and reach
//! the main file only at checkpoint, after the WAL holds them. Direct writes
//! (file creation, recovery, checkpoint) bypass that discipline.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lru::LruCache;
use memmap2::Mmap;
use parking_lot::{Mutex, RwLock, RwLockUpgradableReadGuard};

use crate::error::{GaldrError, Result};

pub mod crypto;
pub mod wal;

pub use crypto::{PageCrypto, PAGE_CRYPTO_OVERHEAD};

/// Identifier of a fixed-size page in the main file.
pub type PageId = u32;

/// Pager construction options.
#[derive(Clone, Debug)]
pub struct PagerOptions {
    /// Raw on-disk page size.
    pub page_size: usize,
    /// LRU capacity in pages; zero disables caching of clean pages.
    pub cache_pages: usize,
    /// Attempt the memory-map read path.
    pub use_mmap: bool,
}

struct FileState {
    file: File,
    mmap: Option<Mmap>,
    page_count: u32,
}

struct PageCache {
    clean: Option<LruCache<PageId, Arc<Vec<u8>>>>,
    dirty: HashMap<PageId, Arc<Vec<u8>>>,
}

/// Page reader/writer shared across transactions.
pub struct Pager {
    state: Mutex<FileState>,
    cache: RwLock<PageCache>,
    tracking: Mutex<Option<Vec<(PageId, Option<Arc<Vec<u8>>>)>>>,
    crypto: Option<PageCrypto>,
    raw_page_size: usize,
    use_mmap: bool,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

impl Pager {
    /// Opens the backing file, creating it when absent.
    pub fn open(path: &Path, options: PagerOptions, crypto: Option<PageCrypto>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let file_len = file.metadata()?.len();
        if file_len % options.page_size as u64 != 0 {
            return Err(GaldrError::corrupt(
                "file length is not a multiple of the page size",
            ));
        }
        let page_count = u32::try_from(file_len / options.page_size as u64)
            .map_err(|_| GaldrError::corrupt("file larger than the page id space"))?;

        let clean = NonZeroUsize::new(options.cache_pages).map(LruCache::new);
        Ok(Self {
            state: Mutex::new(FileState {
                file,
                mmap: None,
                page_count,
            }),
            cache: RwLock::new(PageCache {
                clean,
                dirty: HashMap::new(),
            }),
            tracking: Mutex::new(None),
            crypto,
            raw_page_size: options.page_size,
            use_mmap: options.use_mmap,
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
        })
    }

    /// Usable bytes per page after the encryption trailer, if any.
    pub fn page_size(&self) -> usize {
        match self.crypto {
            Some(_) => self.raw_page_size - PAGE_CRYPTO_OVERHEAD,
            None => self.raw_page_size,
        }
    }

    /// Configured on-disk page size.
    pub fn raw_page_size(&self) -> usize {
        self.raw_page_size
    }

    /// Whether pages are sealed at rest.
    pub fn encrypted(&self) -> bool {
        self.crypto.is_some()
    }

    /// Logical number of pages in the file.
    pub fn page_count(&self) -> u32 {
        self.state.lock().page_count
    }

    /// (cache hits, cache misses) since open.
    pub fn cache_counters(&self) -> (u64, u64) {
        (
            self.cache_hits.load(Ordering::Relaxed),
            self.cache_misses.load(Ordering::Relaxed),
        )
    }

    /// Grows or shrinks the file to exactly `n_pages` pages.
    pub fn set_length(&self, n_pages: u32) -> Result<()> {
        let mut state = self.state.lock();
        state.file.set_len(n_pages as u64 * self.raw_page_size as u64)?;
        state.mmap = None;
        let shrunk = n_pages < state.page_count;
        state.page_count = n_pages;
        drop(state);

        if shrunk {
            let mut cache = self.cache.write();
            cache.dirty.retain(|&id, _| id < n_pages);
            if let Some(clean) = cache.clean.as_mut() {
                let stale: Vec<PageId> = clean
                    .iter()
                    .filter_map(|(&id, _)| (id >= n_pages).then_some(id))
                    .collect();
                for id in stale {
                    clean.pop(&id);
                }
            }
        }
        Ok(())
    }

    /// Reads a page image. Pages inside the file length that were never
    /// written come back zeroed.
    pub fn read(&self, page_id: PageId) -> Result<Arc<Vec<u8>>> {
        {
            let cache = self.cache.upgradable_read();
            if let Some(data) = cache.dirty.get(&page_id) {
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Arc::clone(data));
            }
            if cache
                .clean
                .as_ref()
                .is_some_and(|clean| clean.peek(&page_id).is_some())
            {
                let mut cache = RwLockUpgradableReadGuard::upgrade(cache);
                if let Some(data) = cache.clean.as_mut().and_then(|clean| clean.get(&page_id)) {
                    self.cache_hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(Arc::clone(data));
                }
            }
        }

        self.cache_misses.fetch_add(1, Ordering::Relaxed);
        let data = Arc::new(self.load_from_disk(page_id)?);
        let mut cache = self.cache.write();
        if let Some(clean) = cache.clean.as_mut() {
            clean.put(page_id, Arc::clone(&data));
        }
        Ok(data)
    }

    /// Stores a page image in the cache as a pinned dirty page. The bytes
    /// reach the main file at the next checkpoint; callers are responsible
    /// for WAL-logging them first.
    pub fn write(&self, page_id: PageId, data: Vec<u8>) -> Result<()> {
        self.check_len(page_id, data.len())?;
        {
            let mut state = self.state.lock();
            if page_id >= state.page_count {
                state.page_count = page_id + 1;
            }
        }
        let mut cache = self.cache.write();
        let prior = cache.dirty.get(&page_id).map(Arc::clone);
        if let Some(clean) = cache.clean.as_mut() {
            clean.pop(&page_id);
        }
        cache.dirty.insert(page_id, Arc::new(data));
        drop(cache);

        if let Some(tracked) = self.tracking.lock().as_mut() {
            // Record the pre-image once so a discarded batch can restore
            // the committed-but-unflushed state it overwrote.
            if !tracked.iter().any(|(id, _)| *id == page_id) {
                tracked.push((page_id, prior));
            }
        }
        Ok(())
    }

    /// Writes a page image straight to the main file, bypassing the dirty
    /// set. Used when building a fresh file, replaying the WAL, and at
    /// checkpoint.
    pub fn write_direct(&self, page_id: PageId, data: &[u8]) -> Result<()> {
        self.check_len(page_id, data.len())?;
        let raw = match &self.crypto {
            Some(crypto) if page_id != 0 => crypto.seal(page_id, data)?,
            _ => {
                let mut raw = data.to_vec();
                raw.resize(self.raw_page_size, 0);
                raw
            }
        };
        if raw.len() != self.raw_page_size {
            return Err(GaldrError::corrupt_page(
                page_id,
                "sealed page does not match the raw page size",
            ));
        }

        let mut state = self.state.lock();
        let offset = page_offset(page_id, self.raw_page_size)?;
        state.file.seek(SeekFrom::Start(offset))?;
        state.file.write_all(&raw)?;
        state.mmap = None;
        if page_id >= state.page_count {
            state.page_count = page_id + 1;
        }
        drop(state);

        let mut cache = self.cache.write();
        cache.dirty.remove(&page_id);
        if let Some(clean) = cache.clean.as_mut() {
            clean.put(page_id, Arc::new(data.to_vec()));
        }
        Ok(())
    }

    /// Flushes every pinned dirty page to the main file and returns how many
    /// were written. Does not sync.
    pub fn flush_dirty(&self) -> Result<usize> {
        let dirty: Vec<(PageId, Arc<Vec<u8>>)> = {
            let cache = self.cache.read();
            cache
                .dirty
                .iter()
                .map(|(&id, data)| (id, Arc::clone(data)))
                .collect()
        };
        for (page_id, data) in &dirty {
            self.write_direct(*page_id, data)?;
        }
        Ok(dirty.len())
    }

    /// Durably syncs the main file.
    pub fn sync(&self) -> Result<()> {
        self.state.lock().file.sync_data()?;
        Ok(())
    }

    /// Begins capturing the ids of pages passed to [`write`](Self::write).
    pub fn start_tracking(&self) {
        *self.tracking.lock() = Some(Vec::new());
    }

    /// Ends capture, returning the touched ids sorted and deduplicated.
    pub fn take_tracked(&self) -> Vec<PageId> {
        let tracked = self.tracking.lock().take().unwrap_or_default();
        let mut pages: Vec<PageId> = tracked.into_iter().map(|(id, _)| id).collect();
        pages.sort_unstable();
        pages.dedup();
        pages
    }

    /// Reverts every page touched by the active tracking session to its
    /// pre-batch cache state. Only correct while the commit lock is held, so
    /// no other writer has interleaved dirty pages.
    pub fn discard_tracked(&self) {
        let tracked = self.tracking.lock().take().unwrap_or_default();
        let mut cache = self.cache.write();
        for (page_id, prior) in tracked.into_iter().rev() {
            match prior {
                Some(image) => {
                    cache.dirty.insert(page_id, image);
                }
                None => {
                    cache.dirty.remove(&page_id);
                }
            }
        }
    }

    fn check_len(&self, page_id: PageId, len: usize) -> Result<()> {
        if len != self.page_size() {
            return Err(GaldrError::InvalidArgument(format!(
                "page {page_id} image is {len} bytes, expected {}",
                self.page_size()
            )));
        }
        Ok(())
    }

    fn load_from_disk(&self, page_id: PageId) -> Result<Vec<u8>> {
        let mut raw = vec![0u8; self.raw_page_size];
        let mut state = self.state.lock();
        if page_id >= state.page_count {
            return Err(GaldrError::InvalidArgument(format!(
                "page {page_id} beyond file length {}",
                state.page_count
            )));
        }
        let offset = page_offset(page_id, self.raw_page_size)? as usize;
        let file_len = state.file.metadata()?.len() as usize;
        if offset < file_len {
            self.ensure_mmap(&mut state)?;
            if let Some(mmap) = &state.mmap {
                let end = (offset + self.raw_page_size).min(mmap.len());
                raw[..end - offset].copy_from_slice(&mmap[offset..end]);
            } else {
                state.file.seek(SeekFrom::Start(offset as u64))?;
                let mut read = 0usize;
                while read < raw.len() {
                    let n = state.file.read(&mut raw[read..])?;
                    if n == 0 {
                        break;
                    }
                    read += n;
                }
            }
        }
        drop(state);

        match &self.crypto {
            Some(crypto) if page_id != 0 => {
                // A fresh page slot has never been sealed; it reads back as
                // an all-zero block and decodes to an all-zero page.
                if raw.iter().all(|&b| b == 0) {
                    Ok(vec![0u8; self.page_size()])
                } else {
                    crypto.open(page_id, &raw)
                }
            }
            Some(_) => {
                raw.truncate(self.page_size());
                Ok(raw)
            }
            None => Ok(raw),
        }
    }

    #[allow(unsafe_code)]
    fn ensure_mmap(&self, state: &mut FileState) -> Result<()> {
        if self.use_mmap && state.mmap.is_none() && state.page_count > 0 {
            // Mapping failure (platform limits, exotic filesystems) silently
            // falls back to buffered reads.
            state.mmap = unsafe { Mmap::map(&state.file).ok() };
        }
        Ok(())
    }
}

fn page_offset(page_id: PageId, page_size: usize) -> Result<u64> {
    u64::from(page_id)
        .checked_mul(page_size as u64)
        .ok_or_else(|| GaldrError::InvalidArgument("page offset overflow".into()))
}
