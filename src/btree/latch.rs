//! Per-page latches and the bounded crab-latch stack.
//!
//! B+ tree traversals couple latches: a child latch is acquired before the
//! parent's is released. Writers keep the latched suffix of ancestors whose
//! split or merge could still be reached; everything above a safe node is
//! released in depth order. Structural operations that need sibling latches
//! go through the release-and-reacquire-in-sorted-id-order primitive so no
//! two latches are ever claimed against the id order.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawRwLock, RwLock};
use smallvec::SmallVec;

use crate::error::{GaldrError, Result};
use crate::pager::PageId;

/// Maximum latched depth of one traversal.
pub const MAX_LATCH_DEPTH: usize = 32;

/// Table entries kept after a sweep; bounds the map without churning hot
/// latches.
const SWEEP_THRESHOLD: usize = 4096;

type ReadGuard = ArcRwLockReadGuard<RawRwLock, ()>;
type WriteGuard = ArcRwLockWriteGuard<RawRwLock, ()>;

enum Latch {
    Read(#[allow(dead_code)] ReadGuard),
    Write(#[allow(dead_code)] WriteGuard),
}

/// Shared registry of per-page read/write latches.
#[derive(Default)]
pub struct LatchTable {
    latches: Mutex<HashMap<PageId, Arc<RwLock<()>>>>,
}

impl LatchTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    fn latch_for(&self, page_id: PageId) -> Arc<RwLock<()>> {
        let mut table = self.latches.lock();
        if table.len() > SWEEP_THRESHOLD {
            // Drop latches nobody holds; guards keep an Arc, so a strong
            // count of one means only the table references it.
            table.retain(|_, latch| Arc::strong_count(latch) > 1);
        }
        Arc::clone(table.entry(page_id).or_default())
    }
}

/// Bounded stack of held latches along one root-to-leaf path.
pub struct LockStack<'t> {
    table: &'t LatchTable,
    entries: SmallVec<[(PageId, Latch); 8]>,
}

impl<'t> LockStack<'t> {
    /// Fresh stack over `table`.
    pub fn new(table: &'t LatchTable) -> Self {
        Self {
            table,
            entries: SmallVec::new(),
        }
    }

    /// Number of latches held.
    pub fn depth(&self) -> usize {
        self.entries.len()
    }

    /// Whether `page_id` is latched by this stack.
    pub fn holds(&self, page_id: PageId) -> bool {
        self.entries.iter().any(|(id, _)| *id == page_id)
    }

    /// Acquires a read latch on `page_id` and pushes it.
    pub fn acquire_read(&mut self, page_id: PageId) -> Result<()> {
        self.check_depth()?;
        let latch = self.table.latch_for(page_id);
        let guard = RwLock::read_arc(&latch);
        self.entries.push((page_id, Latch::Read(guard)));
        Ok(())
    }

    /// Acquires a write latch on `page_id` and pushes it.
    pub fn acquire_write(&mut self, page_id: PageId) -> Result<()> {
        self.check_depth()?;
        let latch = self.table.latch_for(page_id);
        let guard = RwLock::write_arc(&latch);
        self.entries.push((page_id, Latch::Write(guard)));
        Ok(())
    }

    /// Releases every held latch in depth order (deepest first).
    pub fn release_all(&mut self) {
        while self.entries.pop().is_some() {}
    }

    /// Releases everything except the most recently acquired latch.
    pub fn release_ancestors(&mut self) {
        if let Some(last) = self.entries.pop() {
            self.release_all();
            self.entries.push(last);
        }
    }

    /// Releases everything except the latch on `page_id`.
    pub fn release_all_except(&mut self, page_id: PageId) {
        self.entries.retain(|(id, _)| *id == page_id);
    }

    /// Releases the latch on `page_id`, if held.
    pub fn release(&mut self, page_id: PageId) {
        self.entries.retain(|(id, _)| *id != page_id);
    }

    /// Tries to write-latch `page_id`; pushes and returns true on success.
    pub fn try_acquire_write(&mut self, page_id: PageId) -> Result<bool> {
        self.check_depth()?;
        let latch = self.table.latch_for(page_id);
        match RwLock::try_write_arc(&latch) {
            Some(guard) => {
                self.entries.push((page_id, Latch::Write(guard)));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Releases any of `page_ids` currently held, then write-latches all of
    /// them in ascending page-id order: block on the lowest id, try the
    /// rest, back off and retry on contention. Used by merges and borrows
    /// that need sibling latches; leaf-chasing readers acquire in leaf
    /// order, so blocking here could close a wait cycle. An exhausted
    /// retry budget escalates to a write conflict the transaction layer
    /// retries uniformly.
    pub fn reacquire_write_sorted(&mut self, page_ids: &[PageId]) -> Result<()> {
        let mut sorted: SmallVec<[PageId; 4]> = page_ids.into();
        sorted.sort_unstable();
        sorted.dedup();
        for &id in &sorted {
            self.release(id);
        }

        const RETRY_BUDGET: usize = 1024;
        for _ in 0..RETRY_BUDGET {
            self.acquire_write(sorted[0])?;
            let mut blocked = false;
            for &id in &sorted[1..] {
                if !self.try_acquire_write(id)? {
                    blocked = true;
                    break;
                }
            }
            if !blocked {
                return Ok(());
            }
            for &id in &sorted {
                self.release(id);
            }
            std::thread::yield_now();
        }
        Err(GaldrError::WriteConflict {
            collection: String::new(),
            doc_id: 0,
            conflicting_tx: 0,
        })
    }

    fn check_depth(&self) -> Result<()> {
        if self.entries.len() >= MAX_LATCH_DEPTH {
            return Err(GaldrError::corrupt(format!(
                "latch stack exceeded depth {MAX_LATCH_DEPTH}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn readers_share_writers_exclude() {
        let table = Arc::new(LatchTable::new());
        let running = Arc::new(AtomicUsize::new(0));

        let mut stack_a = LockStack::new(&table);
        stack_a.acquire_read(7).expect("read a");
        let mut stack_b = LockStack::new(&table);
        stack_b.acquire_read(7).expect("concurrent read b");

        let table2 = Arc::clone(&table);
        let running2 = Arc::clone(&running);
        let writer = thread::spawn(move || {
            let mut stack = LockStack::new(&table2);
            stack.acquire_write(7).expect("write");
            running2.store(1, Ordering::SeqCst);
        });

        thread::sleep(std::time::Duration::from_millis(30));
        assert_eq!(running.load(Ordering::SeqCst), 0, "writer must wait for readers");
        stack_a.release_all();
        stack_b.release_all();
        writer.join().expect("join");
        assert_eq!(running.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn release_ancestors_keeps_only_the_leaf() {
        let table = LatchTable::new();
        let mut stack = LockStack::new(&table);
        stack.acquire_write(1).expect("root");
        stack.acquire_write(2).expect("inner");
        stack.acquire_write(3).expect("leaf");
        stack.release_ancestors();
        assert_eq!(stack.depth(), 1);
        assert!(stack.holds(3));
        assert!(!stack.holds(1));

        // Released pages are immediately writable by others.
        let mut other = LockStack::new(&table);
        other.acquire_write(1).expect("reacquire released root");
    }

    #[test]
    fn reacquire_sorted_orders_sibling_latches() {
        let table = LatchTable::new();
        let mut stack = LockStack::new(&table);
        stack.acquire_write(10).expect("parent");
        stack.acquire_write(9).expect("node");
        stack
            .reacquire_write_sorted(&[9, 5])
            .expect("sibling pair in id order");
        assert!(stack.holds(10) && stack.holds(9) && stack.holds(5));
        assert_eq!(stack.depth(), 3);
    }

    #[test]
    fn depth_is_bounded() {
        let table = LatchTable::new();
        let mut stack = LockStack::new(&table);
        for id in 0..MAX_LATCH_DEPTH as u32 {
            stack.acquire_read(id).expect("within bound");
        }
        assert!(stack.acquire_read(999).is_err());
    }
}
