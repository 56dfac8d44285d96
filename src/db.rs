//! Database façade: lifecycle, commit orchestration, checkpoint, stats.
//!
//! The façade owns every subsystem. Commit is serialized under one lock and
//! runs in phases: conflict and unique prechecks (read-only), storage writes
//! into the pinned dirty cache, WAL seal and fsync, then the atomic version
//! install and catalog swap. Readers never take the commit lock; they
//! resolve visibility through the version index against immutable page
//! snapshots.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, warn};

use crate::alloc::{Allocator, Bitmap, FreeSpaceMap, MapGeometry};
use crate::btree::{IndexEntry, LatchTable, PrimaryTree, SecondaryTree};
use crate::config::Config;
use crate::error::{GaldrError, Result};
use crate::mvcc::{TxManager, TxId, VersionIndex, VersionOperation};
use crate::pager::wal::{FrameKind, Wal};
use crate::pager::{PageCrypto, PageId, Pager, PagerOptions};
use crate::storage::catalog::{Catalog, CollectionMeta, IndexDef};
use crate::storage::docs::DocStore;
use crate::storage::header::{Header, HeaderEncryption};
use crate::storage::{DocId, SlotPointer};
use crate::tx::{CommitParts, IndexKey, Transaction, WriteEntry, WriteOp};

/// Declared shape of one secondary index.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IndexSpec {
    /// Index name, unique within the collection.
    pub name: String,
    /// Whether the index enforces key uniqueness.
    pub unique: bool,
}

/// Declared shape of a collection, supplied by the type-metadata layer at
/// open or first use.
#[derive(Clone, Debug)]
pub struct CollectionSchema {
    /// Collection name.
    pub name: String,
    /// Secondary indexes to maintain.
    pub indexes: Vec<IndexSpec>,
}

impl CollectionSchema {
    /// Schema with no secondary indexes.
    pub fn plain(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            indexes: Vec::new(),
        }
    }
}

#[derive(Default)]
struct Poison {
    flag: AtomicBool,
    reason: Mutex<Option<String>>,
}

/// An embedded single-file document database.
pub struct Database {
    config: Config,
    path: PathBuf,
    pub(crate) pager: Pager,
    crypto: Option<PageCrypto>,
    wal: Option<Mutex<Wal>>,
    pub(crate) allocator: Mutex<Allocator>,
    pub(crate) catalog: RwLock<Arc<Catalog>>,
    pub(crate) meta_chain: Mutex<Vec<PageId>>,
    header: Mutex<Header>,
    pub(crate) versions: VersionIndex,
    pub(crate) manager: TxManager,
    pub(crate) latches: LatchTable,
    pub(crate) commit_lock: Mutex<()>,
    poison: Poison,
    id_reservations: Mutex<HashMap<Arc<str>, DocId>>,
    commits_since_gc: AtomicU64,
    primary_order: usize,
    secondary_order: usize,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").field("path", &self.path).finish_non_exhaustive()
    }
}

impl Database {
    /// Creates a new database file. Errors if `path` already exists.
    pub fn create(path: impl AsRef<Path>, config: Config) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            return Err(GaldrError::InvalidArgument(format!(
                "{} already exists",
                path.display()
            )));
        }
        config.validate()?;

        let crypto_fields = config.encryption.as_ref().map(|enc| {
            let salt = PageCrypto::generate_salt();
            let crypto = PageCrypto::derive(&enc.password, &salt, enc.kdf_iterations);
            (crypto, salt, enc.kdf_iterations)
        });
        let crypto = crypto_fields.as_ref().map(|(c, _, _)| c.clone());

        let pager = Pager::open(
            path,
            PagerOptions {
                page_size: config.page_size,
                cache_pages: config.page_cache_size,
                use_mmap: config.use_mmap,
            },
            crypto.clone(),
        )?;
        let usable = pager.page_size();

        // Converge the initial layout: the map regions must cover the pages
        // they themselves occupy.
        let expansion = config.expansion_page_count;
        let mut total = expansion.max(8);
        let (geometry, meta_page, data_start) = loop {
            let bitmap_pages = Bitmap::pages_needed(total, usable);
            let fsm_pages = FreeSpaceMap::pages_needed(total, usable);
            let meta_page = 1 + bitmap_pages + fsm_pages;
            let data_start = meta_page + 1;
            let needed = data_start + expansion;
            if needed <= total {
                break (
                    MapGeometry {
                        bitmap_start: 1,
                        bitmap_pages,
                        fsm_start: 1 + bitmap_pages,
                        fsm_pages,
                    },
                    meta_page,
                    data_start,
                );
            }
            total = needed;
        };

        pager.set_length(total)?;
        let mut allocator = Allocator::create(total, usable, expansion, geometry);
        for page in 0..data_start {
            allocator.reserve(page);
        }

        let mut header = Header::new(config.page_size, total, geometry, meta_page);
        header.mmap_hint = config.use_mmap;
        if let Some((crypto, salt, iterations)) = &crypto_fields {
            header.encryption = Some(HeaderEncryption {
                kdf_salt: *salt,
                kdf_iterations: *iterations,
                key_check: crypto.key_check(),
            });
        }
        let mut header_image = vec![0u8; usable];
        header.write(&mut header_image)?;
        pager.write_direct(0, &header_image)?;

        allocator.persist(|page_id, image| pager.write_direct(page_id, &image))?;
        let catalog = Catalog::new();
        for (page_id, image) in [meta_page]
            .iter()
            .zip(catalog.encode_pages(&[meta_page], usable)?)
        {
            pager.write_direct(*page_id, &image)?;
        }
        pager.sync()?;

        let wal = if config.use_wal {
            Some(Mutex::new(Wal::open(path, usable)?))
        } else {
            None
        };

        debug!(path = %path.display(), total_pages = total, "database created");
        Ok(Self {
            primary_order: PrimaryTree::default_order(usable),
            secondary_order: SecondaryTree::default_order(usable),
            config,
            path: path.to_path_buf(),
            pager,
            crypto,
            wal,
            allocator: Mutex::new(allocator),
            catalog: RwLock::new(Arc::new(catalog)),
            meta_chain: Mutex::new(vec![meta_page]),
            header: Mutex::new(header),
            versions: VersionIndex::new(),
            manager: TxManager::new(0, 0),
            latches: LatchTable::new(),
            commit_lock: Mutex::new(()),
            poison: Poison::default(),
            id_reservations: Mutex::new(HashMap::new()),
            commits_since_gc: AtomicU64::new(0),
        })
    }

    /// Opens an existing database: validates the header, runs WAL recovery,
    /// loads metadata, and rebuilds the version index from the primary trees.
    pub fn open(path: impl AsRef<Path>, config: Config) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(GaldrError::InvalidArgument(format!(
                "{} does not exist",
                path.display()
            )));
        }
        config.validate()?;

        // Page 0 is plaintext: bootstrap the header before the pager so the
        // stored page size and encryption parameters win over the config.
        let boot = read_boot_header(path)?;
        let page_size = boot.page_size as usize;

        let crypto = match (&boot.encryption, &config.encryption) {
            (Some(stored), Some(given)) => {
                let crypto =
                    PageCrypto::derive(&given.password, &stored.kdf_salt, stored.kdf_iterations);
                if crypto.key_check() != stored.key_check {
                    return Err(GaldrError::InvalidArgument(
                        "wrong password for encrypted database".into(),
                    ));
                }
                Some(crypto)
            }
            (Some(_), None) => {
                return Err(GaldrError::InvalidArgument(
                    "database is encrypted; a password is required".into(),
                ));
            }
            (None, Some(_)) => {
                return Err(GaldrError::InvalidArgument(
                    "database is not encrypted but a password was supplied".into(),
                ));
            }
            (None, None) => None,
        };

        let pager = Pager::open(
            path,
            PagerOptions {
                page_size,
                cache_pages: config.page_cache_size,
                use_mmap: config.use_mmap,
            },
            crypto.clone(),
        )?;
        let usable = pager.page_size();

        let wal = if config.use_wal {
            let mut wal = Wal::open(path, usable)?;
            let replayed = wal.replay(crypto.as_ref(), |_, page_id, data| {
                pager.write_direct(page_id, data)
            })?;
            if replayed > 0 {
                warn!(frames_replayed = replayed, "WAL recovery performed");
                pager.sync()?;
                wal.reset()?;
            }
            Some(Mutex::new(wal))
        } else {
            None
        };

        let mut header = Header::read(&pager.read(0)?)?
            .ok_or_else(|| GaldrError::corrupt_page(0, "header page is empty"))?;
        if pager.page_count() < header.total_page_count {
            pager.set_length(header.total_page_count)?;
        }

        let allocator = Allocator::load(
            &pager,
            header.total_page_count,
            config.expansion_page_count,
            header.maps,
        )?;
        let (mut catalog, meta_chain) = Catalog::load(&pager, header.collections_metadata_page)?;

        let manager = TxManager::new(header.last_committed_tx_id, 0);
        let latches = LatchTable::new();
        let versions = VersionIndex::new();
        let primary_order = PrimaryTree::default_order(usable);
        let mut reservations = HashMap::new();

        // Rebuild the version index by walking every primary tree; each key
        // gets one version with creator zero at CSN zero. `next_id` restores
        // to MAX(key)+1 unless the persisted counter is already ahead.
        let names: Vec<Arc<str>> = catalog.iter().map(|m| Arc::clone(&m.name)).collect();
        for name in names {
            let meta = catalog.get_mut(&name).expect("collection present");
            let tree = PrimaryTree::new(&pager, &latches, meta.root_page, primary_order);
            let entries = tree.scan_all()?;
            let max_key = entries.last().map(|(id, _)| *id).unwrap_or(0);
            meta.next_id = meta.next_id.max(max_key + 1);
            meta.doc_count = entries.len() as u64;
            reservations.insert(Arc::clone(&meta.name), meta.next_id);
            for (doc_id, location) in entries {
                versions.install_initial(Arc::clone(&name), doc_id, location);
            }
        }

        // The log was folded into the main file (or was empty); reflect that.
        header.last_commit_frame = 0;
        if let Some(wal) = &wal {
            header.wal_checksum = wal.lock().header_checksum();
        }
        header.mmap_hint = config.use_mmap;
        let mut header_image = vec![0u8; usable];
        header.write(&mut header_image)?;
        pager.write_direct(0, &header_image)?;
        pager.sync()?;

        debug!(
            path = %path.display(),
            collections = catalog.len(),
            chains = versions.chain_count(),
            "database opened"
        );
        Ok(Self {
            primary_order,
            secondary_order: SecondaryTree::default_order(usable),
            config,
            path: path.to_path_buf(),
            pager,
            crypto,
            wal,
            allocator: Mutex::new(allocator),
            catalog: RwLock::new(Arc::new(catalog)),
            meta_chain: Mutex::new(meta_chain),
            header: Mutex::new(header),
            versions,
            manager,
            latches,
            commit_lock: Mutex::new(()),
            poison: Poison::default(),
            id_reservations: Mutex::new(reservations),
            commits_since_gc: AtomicU64::new(0),
        })
    }

    /// Opens the file at `path`, creating it when absent.
    pub fn open_or_create(path: impl AsRef<Path>, config: Config) -> Result<Self> {
        if path.as_ref().exists() {
            Self::open(path, config)
        } else {
            Self::create(path, config)
        }
    }

    /// Path of the main file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Effective configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    // ----- accessors for the transaction layer -----

    pub(crate) fn pager(&self) -> &Pager {
        &self.pager
    }

    pub(crate) fn versions(&self) -> &VersionIndex {
        &self.versions
    }

    pub(crate) fn latches(&self) -> &LatchTable {
        &self.latches
    }

    pub(crate) fn primary_order(&self) -> usize {
        self.primary_order
    }

    pub(crate) fn secondary_order(&self) -> usize {
        self.secondary_order
    }

    pub(crate) fn catalog_snapshot(&self) -> Arc<Catalog> {
        Arc::clone(&self.catalog.read())
    }

    pub(crate) fn wal_handle(&self) -> Option<&Mutex<Wal>> {
        self.wal.as_ref()
    }

    pub(crate) fn check_usable(&self) -> Result<()> {
        if self.poison.flag.load(Ordering::Acquire) {
            let reason = self
                .poison
                .reason
                .lock()
                .clone()
                .unwrap_or_else(|| "unknown fatal error".into());
            return Err(GaldrError::corrupt(format!("database poisoned: {reason}")));
        }
        Ok(())
    }

    pub(crate) fn check_writable(&self) -> Result<()> {
        self.check_usable()?;
        if self.config.read_only {
            return Err(GaldrError::InvalidArgument(
                "database opened read-only".into(),
            ));
        }
        Ok(())
    }

    pub(crate) fn poison_on_fatal(&self, err: &GaldrError) {
        if err.is_fatal() && !self.poison.flag.swap(true, Ordering::AcqRel) {
            error!(error = %err, "fatal error; database handle poisoned");
            *self.poison.reason.lock() = Some(err.to_string());
        }
    }

    /// Hands out the next document id for a collection. Reservations are
    /// process-wide and never reused, even when the reserving transaction
    /// aborts.
    pub(crate) fn reserve_doc_id(&self, catalog: &Catalog, collection: &str) -> Result<DocId> {
        let meta = catalog.require(collection)?;
        let mut reservations = self.id_reservations.lock();
        let next = reservations
            .entry(Arc::clone(&meta.name))
            .or_insert(meta.next_id);
        let id = *next;
        *next += 1;
        Ok(id)
    }

    /// Keeps the reservation counter ahead of caller-supplied ids.
    pub(crate) fn note_supplied_id(&self, collection: &str, doc_id: DocId) {
        let mut reservations = self.id_reservations.lock();
        if let Some(next) = reservations.get_mut(collection) {
            if doc_id >= *next {
                *next = doc_id + 1;
            }
        } else {
            reservations.insert(Arc::from(collection), doc_id + 1);
        }
    }

    fn current_reservation(&self, collection: &str) -> Option<DocId> {
        self.id_reservations.lock().get(collection).copied()
    }

    // ----- transactions -----

    /// Starts a read-write transaction.
    pub fn begin_transaction(&self) -> Result<Transaction<'_>> {
        self.check_usable()?;
        Ok(Transaction::new(self, self.manager.begin(), false))
    }

    /// Starts a read-only transaction; its snapshot pins the GC horizon.
    pub fn begin_read_only_transaction(&self) -> Result<Transaction<'_>> {
        self.check_usable()?;
        Ok(Transaction::new(self, self.manager.begin(), true))
    }

    pub(crate) fn rollback_transaction(&self, tx_id: TxId) {
        self.manager.finish(tx_id);
    }

    /// Commit entry point. See the module docs for the phase structure.
    pub(crate) fn commit_transaction(&self, parts: CommitParts) -> Result<()> {
        let tx_id = parts.snapshot.tx_id;
        if parts.write_set.is_empty() {
            self.manager.finish(tx_id);
            return Ok(());
        }
        let result = self.commit_locked(&parts);
        self.manager.finish(tx_id);
        if let Err(err) = &result {
            self.poison_on_fatal(err);
        } else {
            self.after_commit();
        }
        result
    }

    fn commit_locked(&self, parts: &CommitParts) -> Result<()> {
        let tx_id = parts.snapshot.tx_id;
        let guard = self.commit_lock.lock();

        // Phase 1a: first-committer-wins precheck. Nothing is written yet,
        // so a conflict aborts for free.
        let preview = build_version_ops(&parts.write_set);
        self.versions.validate(&preview)?;

        // Phase 1b: unique-constraint precheck, still read-only.
        let catalog_snapshot = self.catalog_snapshot();
        self.check_unique_constraints(&catalog_snapshot, &parts.write_set)?;

        // Phase 2: storage writes into the pinned dirty cache.
        let mut alloc = self.allocator.lock();
        self.pager.start_tracking();
        let mut catalog = (*catalog_snapshot).clone();
        let applied = self.apply_write_set(&mut alloc, &mut catalog, &parts.write_set);
        let (ops, new_chain) = match applied {
            Ok(v) => v,
            Err(err) => {
                self.pager.discard_tracked();
                warn!(tx_id, error = %err, "commit storage phase failed; batch discarded");
                return Err(err);
            }
        };

        // Phase 3: seal the WAL (or flush directly when the WAL is off).
        let csn = self.manager.allocate_commit_csn();
        let effective_chain = new_chain
            .clone()
            .unwrap_or_else(|| self.meta_chain.lock().clone());
        if let Err(err) = self.log_and_flush(tx_id, &effective_chain, alloc.geometry()) {
            self.pager.discard_tracked();
            return Err(err);
        }

        // Phase 4: atomic install and metadata swap. Under the serialized
        // commit discipline the re-validation cannot fail; it is the
        // safety net behind the phase-1 precheck.
        self.versions.validate_and_install(tx_id, csn, &ops)?;
        *self.catalog.write() = Arc::new(catalog);
        if let Some(chain) = new_chain {
            *self.meta_chain.lock() = chain;
        }
        self.manager.publish_commit(csn);
        drop(alloc);
        drop(guard);
        Ok(())
    }

    /// Applies every write-set entry to storage in insertion order,
    /// returning the version ops to install and the new metadata chain when
    /// the catalog changed.
    fn apply_write_set(
        &self,
        alloc: &mut Allocator,
        catalog: &mut Catalog,
        write_set: &[WriteEntry],
    ) -> Result<(Vec<VersionOperation>, Option<Vec<PageId>>)> {
        let usable = self.pager.page_size();
        let mut ops = Vec::with_capacity(write_set.len());

        for entry in write_set {
            let meta = catalog.require(&entry.collection)?.clone();
            match &entry.op {
                WriteOp::Insert { bytes, keys } => {
                    let location = DocStore::new(&self.pager, alloc).insert(bytes)?;
                    let tree =
                        PrimaryTree::new(&self.pager, &self.latches, meta.root_page, self.primary_order);
                    tree.put(alloc, entry.doc_id, location)?;
                    self.apply_index_inserts(alloc, &meta, entry.doc_id, location, keys)?;
                    let m = catalog.get_mut(&entry.collection).expect("collection present");
                    m.doc_count += 1;
                    m.next_id = m.next_id.max(entry.doc_id + 1);
                    ops.push(VersionOperation {
                        collection: Arc::clone(&entry.collection),
                        doc_id: entry.doc_id,
                        location: Some(location),
                        read_version_tx: None,
                        expect_absent: true,
                    });
                }
                WriteOp::Update {
                    bytes,
                    keys,
                    old_keys,
                    read_tx,
                    prev_location,
                } => {
                    let location = DocStore::new(&self.pager, alloc).insert(bytes)?;
                    let tree =
                        PrimaryTree::new(&self.pager, &self.latches, meta.root_page, self.primary_order);
                    tree.put(alloc, entry.doc_id, location)?;
                    self.apply_index_removals(alloc, &meta, entry.doc_id, *prev_location, old_keys)?;
                    self.apply_index_inserts(alloc, &meta, entry.doc_id, location, keys)?;
                    ops.push(VersionOperation {
                        collection: Arc::clone(&entry.collection),
                        doc_id: entry.doc_id,
                        location: Some(location),
                        read_version_tx: Some(*read_tx),
                        expect_absent: false,
                    });
                }
                WriteOp::Delete {
                    old_keys,
                    read_tx,
                    prev_location,
                } => {
                    let tree =
                        PrimaryTree::new(&self.pager, &self.latches, meta.root_page, self.primary_order);
                    tree.remove(alloc, entry.doc_id)?;
                    self.apply_index_removals(alloc, &meta, entry.doc_id, *prev_location, old_keys)?;
                    let m = catalog.get_mut(&entry.collection).expect("collection present");
                    m.doc_count = m.doc_count.saturating_sub(1);
                    ops.push(VersionOperation {
                        collection: Arc::clone(&entry.collection),
                        doc_id: entry.doc_id,
                        location: None,
                        read_version_tx: Some(*read_tx),
                        expect_absent: false,
                    });
                }
            }
        }

        // Fold the id reservations into the persisted counters.
        let touched: HashSet<Arc<str>> = write_set
            .iter()
            .map(|e| Arc::clone(&e.collection))
            .collect();
        for name in &touched {
            if let Some(reserved) = self.current_reservation(name) {
                let m = catalog.get_mut(name).expect("collection present");
                m.next_id = m.next_id.max(reserved);
            }
        }

        let new_chain = self.rewrite_catalog_pages(alloc, catalog)?;
        alloc.persist(|page_id, image| self.pager.write(page_id, image))?;
        self.refresh_header(alloc, usable)?;
        Ok((ops, new_chain))
    }

    fn apply_index_inserts(
        &self,
        alloc: &mut Allocator,
        meta: &CollectionMeta,
        doc_id: DocId,
        location: SlotPointer,
        keys: &[IndexKey],
    ) -> Result<()> {
        for key in keys {
            let Some(bytes) = &key.key else { continue };
            let def = meta.index(&key.index).ok_or_else(|| {
                GaldrError::InvalidArgument(format!(
                    "unknown index {:?} on {:?}",
                    key.index, meta.name
                ))
            })?;
            let tree =
                SecondaryTree::new(&self.pager, &self.latches, def.root_page, self.secondary_order);
            tree.insert_entry(
                alloc,
                bytes,
                IndexEntry {
                    doc_id,
                    ptr: location,
                },
            )?;
        }
        Ok(())
    }

    fn apply_index_removals(
        &self,
        alloc: &mut Allocator,
        meta: &CollectionMeta,
        doc_id: DocId,
        prev_location: SlotPointer,
        old_keys: &[IndexKey],
    ) -> Result<()> {
        for key in old_keys {
            let Some(bytes) = &key.key else { continue };
            let def = meta.index(&key.index).ok_or_else(|| {
                GaldrError::InvalidArgument(format!(
                    "unknown index {:?} on {:?}",
                    key.index, meta.name
                ))
            })?;
            let tree =
                SecondaryTree::new(&self.pager, &self.latches, def.root_page, self.secondary_order);
            tree.remove_entry(
                alloc,
                bytes,
                IndexEntry {
                    doc_id,
                    ptr: prev_location,
                },
            )?;
        }
        Ok(())
    }

    /// Unique enforcement: an existing entry under the same key violates the
    /// constraint when it belongs to another document whose live head still
    /// carries the indexed version. Removals pending in this same write set
    /// are honored.
    fn check_unique_constraints(
        &self,
        catalog: &Catalog,
        write_set: &[WriteEntry],
    ) -> Result<()> {
        let mut pending_removals: HashSet<(Arc<str>, String, Vec<u8>, DocId)> = HashSet::new();
        for entry in write_set {
            let old_keys = match &entry.op {
                WriteOp::Update { old_keys, .. } | WriteOp::Delete { old_keys, .. } => old_keys,
                WriteOp::Insert { .. } => continue,
            };
            for key in old_keys {
                if let Some(bytes) = &key.key {
                    pending_removals.insert((
                        Arc::clone(&entry.collection),
                        key.index.clone(),
                        bytes.clone(),
                        entry.doc_id,
                    ));
                }
            }
        }

        let mut claimed: HashMap<(Arc<str>, String, Vec<u8>), DocId> = HashMap::new();
        for entry in write_set {
            let keys = match &entry.op {
                WriteOp::Insert { keys, .. } | WriteOp::Update { keys, .. } => keys,
                WriteOp::Delete { .. } => continue,
            };
            let meta = catalog.require(&entry.collection)?;
            for key in keys {
                let Some(bytes) = &key.key else { continue };
                let Some(def) = meta.index(&key.index) else {
                    return Err(GaldrError::InvalidArgument(format!(
                        "unknown index {:?} on {:?}",
                        key.index, meta.name
                    )));
                };
                if !def.unique {
                    continue;
                }

                let claim = (Arc::clone(&entry.collection), key.index.clone(), bytes.clone());
                if let Some(&other) = claimed.get(&claim) {
                    if other != entry.doc_id {
                        return Err(GaldrError::UniqueConstraintViolation {
                            index: key.index.clone(),
                            key: bytes.clone(),
                        });
                    }
                }
                claimed.insert(claim, entry.doc_id);

                let tree = SecondaryTree::new(
                    &self.pager,
                    &self.latches,
                    def.root_page,
                    self.secondary_order,
                );
                for existing in tree.exact(bytes)? {
                    if existing.doc_id == entry.doc_id {
                        continue;
                    }
                    if pending_removals.contains(&(
                        Arc::clone(&entry.collection),
                        key.index.clone(),
                        bytes.clone(),
                        existing.doc_id,
                    )) {
                        continue;
                    }
                    let Some(head) = self.versions.get_latest(&entry.collection, existing.doc_id)
                    else {
                        continue;
                    };
                    if head.is_live()
                        && !head.is_tombstone()
                        && head.location == Some(existing.ptr)
                    {
                        return Err(GaldrError::UniqueConstraintViolation {
                            index: key.index.clone(),
                            key: bytes.clone(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Re-encodes the catalog into its page chain, growing or shrinking the
    /// chain as needed. Returns the new chain when it changed.
    pub(crate) fn rewrite_catalog_pages(
        &self,
        alloc: &mut Allocator,
        catalog: &Catalog,
    ) -> Result<Option<Vec<PageId>>> {
        let usable = self.pager.page_size();
        let current = self.meta_chain.lock().clone();
        let needed = catalog.pages_needed(usable);
        let mut chain = current.clone();
        while chain.len() < needed {
            chain.push(alloc.allocate_page(&self.pager)?);
        }
        while chain.len() > needed {
            let id = chain.pop().expect("chain is non-empty");
            alloc.deallocate(id);
        }
        let images = catalog.encode_pages(&chain, usable)?;
        for (page_id, image) in chain.iter().zip(images) {
            self.pager.write(*page_id, image)?;
        }
        Ok(if chain == current { None } else { Some(chain) })
    }

    /// Rewrites the header page when the file grew or a map region moved.
    pub(crate) fn refresh_header(&self, alloc: &mut Allocator, usable: usize) -> Result<()> {
        let mut header = self.header.lock();
        let geometry_changed = alloc.take_geometry_changed();
        let total = alloc.total_pages();
        if !geometry_changed && header.total_page_count == total {
            return Ok(());
        }
        header.maps = alloc.geometry();
        header.total_page_count = total;
        let mut image = vec![0u8; usable];
        header.write(&mut image)?;
        self.pager.write(0, image)
    }

    /// Seals the tracked pages: WAL frames plus the commit flag and fsync,
    /// or a direct flush when the WAL is disabled. The caller supplies the
    /// metadata chain and map geometry it just wrote (the allocator lock is
    /// typically still held).
    pub(crate) fn log_and_flush(
        &self,
        tx_id: TxId,
        meta_chain: &[PageId],
        geometry: MapGeometry,
    ) -> Result<()> {
        let pages = self.pager.take_tracked();
        match &self.wal {
            Some(wal) => {
                let mut wal = wal.lock();
                wal.begin_tx(tx_id);
                for page_id in &pages {
                    let image = self.pager.read(*page_id)?;
                    let kind = frame_kind(*page_id, meta_chain, geometry);
                    wal.append_frame(tx_id, kind, *page_id, image)?;
                }
                wal.commit_tx(tx_id, self.crypto.as_ref())?;
                Ok(())
            }
            None => {
                self.pager.flush_dirty()?;
                self.pager.sync()
            }
        }
    }

    fn after_commit(&self) {
        let commits = self.commits_since_gc.fetch_add(1, Ordering::Relaxed) + 1;
        if self.config.auto_gc && commits >= self.config.gc_threshold {
            self.commits_since_gc.store(0, Ordering::Relaxed);
            if let Err(err) = self.run_gc() {
                warn!(error = %err, "automatic GC failed");
                self.poison_on_fatal(&err);
            }
        }
        if self.config.auto_checkpoint {
            let over_threshold = self
                .wal
                .as_ref()
                .map(|wal| {
                    wal.lock().committed_frame_count() >= self.config.wal_checkpoint_threshold
                })
                .unwrap_or(false);
            // A long-running snapshot keeps the horizon back; skip until the
            // log is free to truncate.
            if over_threshold && self.manager.active_count() == 0 {
                if let Err(err) = self.checkpoint() {
                    warn!(error = %err, "automatic checkpoint failed");
                    self.poison_on_fatal(&err);
                }
            }
        }
    }

    // ----- collection lifecycle -----

    /// Registers a collection (idempotent when the schema matches) and
    /// allocates its tree roots.
    pub fn create_collection(&self, schema: &CollectionSchema) -> Result<()> {
        self.check_writable()?;
        let guard = self.commit_lock.lock();

        let catalog_snapshot = self.catalog_snapshot();
        if let Some(existing) = catalog_snapshot.get(&schema.name) {
            let same = existing.indexes.len() == schema.indexes.len()
                && existing.indexes.iter().zip(&schema.indexes).all(|(a, b)| {
                    a.name == b.name && a.unique == b.unique
                });
            if same {
                return Ok(());
            }
            return Err(GaldrError::InvalidArgument(format!(
                "collection {:?} already exists with a different index set",
                schema.name
            )));
        }

        let snapshot = self.manager.begin();
        let tx_id = snapshot.tx_id;
        let usable = self.pager.page_size();
        let mut alloc = self.allocator.lock();
        self.pager.start_tracking();
        let mut catalog = (*catalog_snapshot).clone();

        let built = (|| -> Result<Option<Vec<PageId>>> {
            let root_page = alloc.allocate_page(&self.pager)?;
            self.pager
                .write(root_page, PrimaryTree::empty_root_image(usable)?)?;
            let mut indexes = Vec::with_capacity(schema.indexes.len());
            for spec in &schema.indexes {
                let index_root = alloc.allocate_page(&self.pager)?;
                self.pager
                    .write(index_root, SecondaryTree::empty_root_image(usable)?)?;
                indexes.push(IndexDef {
                    name: spec.name.clone(),
                    unique: spec.unique,
                    root_page: index_root,
                });
            }
            catalog.insert(CollectionMeta {
                name: Arc::from(schema.name.as_str()),
                root_page,
                doc_count: 0,
                next_id: 1,
                indexes,
            });
            let chain = self.rewrite_catalog_pages(&mut alloc, &catalog)?;
            alloc.persist(|page_id, image| self.pager.write(page_id, image))?;
            self.refresh_header(&mut alloc, usable)?;
            Ok(chain)
        })();

        let result = built.and_then(|chain| {
            let effective_chain = chain
                .clone()
                .unwrap_or_else(|| self.meta_chain.lock().clone());
            self.log_and_flush(tx_id, &effective_chain, alloc.geometry())?;
            *self.catalog.write() = Arc::new(catalog);
            if let Some(chain) = chain {
                *self.meta_chain.lock() = chain;
            }
            Ok(())
        });
        if let Err(err) = &result {
            self.pager.discard_tracked();
            self.poison_on_fatal(err);
        }
        drop(alloc);
        drop(guard);
        self.manager.finish(tx_id);
        result
    }

    /// Collections currently registered, in name order.
    pub fn collections(&self) -> Vec<String> {
        self.catalog.read().iter().map(|m| m.name.to_string()).collect()
    }

    /// Committed document count of a collection.
    pub fn doc_count(&self, collection: &str) -> Result<u64> {
        Ok(self.catalog.read().require(collection)?.doc_count)
    }

    /// Version-chain length for one document (diagnostics).
    pub fn get_version_count(&self, collection: &str, doc_id: DocId) -> usize {
        self.versions.version_count(collection, doc_id)
    }

    // ----- checkpoint and shutdown -----

    /// Copies every committed page image into the main file, syncs it, and
    /// truncates the WAL.
    pub fn checkpoint(&self) -> Result<()> {
        self.check_usable()?;
        if self.config.read_only {
            return Ok(());
        }
        let _guard = self.commit_lock.lock();
        let result = self.checkpoint_locked();
        if let Err(err) = &result {
            self.poison_on_fatal(err);
        }
        result
    }

    fn checkpoint_locked(&self) -> Result<()> {
        let flushed = self.pager.flush_dirty()?;
        self.pager.sync()?;

        let mut header = self.header.lock();
        if let Some(wal) = &self.wal {
            let mut wal = wal.lock();
            header.last_commit_frame = wal.committed_frame_count();
            wal.reset()?;
            header.wal_checksum = wal.header_checksum();
        }
        header.last_committed_tx_id = self.manager.highest_tx_id();
        let mut image = vec![0u8; self.pager.page_size()];
        header.write(&mut image)?;
        self.pager.write_direct(0, &image)?;
        self.pager.sync()?;
        debug!(pages_flushed = flushed, "checkpoint complete");
        Ok(())
    }

    /// Checkpoints and consumes the handle. The WAL ends up empty, so a
    /// subsequent open performs no recovery work.
    pub fn close(self) -> Result<()> {
        if self.poison.flag.load(Ordering::Acquire) || self.config.read_only {
            return Ok(());
        }
        self.checkpoint()
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if self.poison.flag.load(Ordering::Acquire) || self.config.read_only {
            return;
        }
        if let Err(err) = self.checkpoint() {
            warn!(error = %err, "checkpoint on drop failed; WAL recovery will finish the job");
        }
    }
}

fn frame_kind(page_id: PageId, meta_chain: &[PageId], geometry: MapGeometry) -> FrameKind {
    if page_id == 0 || meta_chain.contains(&page_id) {
        return FrameKind::Meta;
    }
    let in_bitmap = page_id >= geometry.bitmap_start
        && page_id < geometry.bitmap_start + geometry.bitmap_pages;
    let in_fsm =
        page_id >= geometry.fsm_start && page_id < geometry.fsm_start + geometry.fsm_pages;
    if in_bitmap || in_fsm {
        FrameKind::MapChunk
    } else {
        FrameKind::Page
    }
}

fn build_version_ops(write_set: &[WriteEntry]) -> Vec<VersionOperation> {
    write_set
        .iter()
        .map(|entry| match &entry.op {
            WriteOp::Insert { .. } => VersionOperation {
                collection: Arc::clone(&entry.collection),
                doc_id: entry.doc_id,
                location: None,
                read_version_tx: None,
                expect_absent: true,
            },
            WriteOp::Update { read_tx, .. } => VersionOperation {
                collection: Arc::clone(&entry.collection),
                doc_id: entry.doc_id,
                location: None,
                read_version_tx: Some(*read_tx),
                expect_absent: false,
            },
            WriteOp::Delete { read_tx, .. } => VersionOperation {
                collection: Arc::clone(&entry.collection),
                doc_id: entry.doc_id,
                location: None,
                read_version_tx: Some(*read_tx),
                expect_absent: false,
            },
        })
        .collect()
}

/// Reads the plaintext header fields straight from the file, before any
/// pager exists.
fn read_boot_header(path: &Path) -> Result<Header> {
    let mut file = fs::File::open(path)?;
    let mut buf = vec![0u8; crate::storage::header::HEADER_REGION_SIZE];
    let mut read = 0usize;
    while read < buf.len() {
        let n = file.read(&mut buf[read..])?;
        if n == 0 {
            break;
        }
        read += n;
    }
    if read < buf.len() {
        return Err(GaldrError::corrupt_page(0, "file too short for a header"));
    }
    Header::read(&buf)?.ok_or_else(|| GaldrError::corrupt_page(0, "header page is empty"))
}
