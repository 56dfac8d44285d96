//! Secondary B+ tree: sortable-encoded byte-string keys to postings.
//!
//! Structure follows the primary tree (fixed root page, crab latching,
//! borrow/merge rebalancing) with two deviations the variable-length keys
//! force: split points and merges are byte-aware, and duplicate keys store a
//! posting list per distinct key, spilling to an overflow page chain when
//! one key's postings outgrow their leaf share.

use crate::alloc::Allocator;
use crate::btree::latch::{LatchTable, LockStack};
use crate::btree::node::{IndexEntry, OverflowPage, PostingValue, SecondaryNode};
use crate::error::{GaldrError, Result};
use crate::pager::{PageId, Pager};

/// Inclusive/exclusive bound for range scans.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScanBound<'a> {
    /// No bound on this side.
    Unbounded,
    /// Bound included in the scan.
    Included(&'a [u8]),
    /// Bound excluded from the scan.
    Excluded(&'a [u8]),
}

/// Byte-string-keyed tree handle.
pub struct SecondaryTree<'a> {
    pager: &'a Pager,
    latches: &'a LatchTable,
    root: PageId,
    order: usize,
}

impl<'a> SecondaryTree<'a> {
    /// Opens the tree rooted at `root`.
    pub fn new(pager: &'a Pager, latches: &'a LatchTable, root: PageId, order: usize) -> Self {
        debug_assert!(order >= 4);
        Self {
            pager,
            latches,
            root,
            order,
        }
    }

    /// Default branching order for a page size.
    pub fn default_order(page_size: usize) -> usize {
        (page_size / 32).max(8)
    }

    /// Page image of an empty root leaf.
    pub fn empty_root_image(page_size: usize) -> Result<Vec<u8>> {
        SecondaryNode::new_leaf().encode(page_size)
    }

    fn max_keys(&self) -> usize {
        self.order - 1
    }

    fn min_keys(&self) -> usize {
        (self.order - 1) / 2
    }

    fn max_key_len(&self) -> usize {
        self.pager.page_size() / 8
    }

    /// Largest posting list kept inline before spilling to overflow pages.
    fn max_inline_entries(&self) -> usize {
        ((self.pager.page_size() / 8).saturating_sub(5) / 10).max(2)
    }

    fn page_size(&self) -> usize {
        self.pager.page_size()
    }

    fn read_node(&self, page_id: PageId) -> Result<SecondaryNode> {
        SecondaryNode::decode(&self.pager.read(page_id)?, page_id)
    }

    fn write_node(&self, page_id: PageId, node: &SecondaryNode) -> Result<()> {
        self.pager.write(page_id, node.encode(self.page_size())?)
    }

    /// Whether an insert of `key` cannot overflow `node`.
    fn safe_for_insert(&self, node: &SecondaryNode, key_len: usize) -> bool {
        let worst = 2 + key_len + 1 + 2 + 10;
        node.keys.len() < self.max_keys() && node.encoded_size() + worst <= self.page_size()
    }

    /// All postings for an exact key, overflow chain included.
    pub fn exact(&self, key: &[u8]) -> Result<Vec<IndexEntry>> {
        let mut stack = LockStack::new(self.latches);
        stack.acquire_read(self.root)?;
        let mut id = self.root;
        let mut node = self.read_node(id)?;
        while !node.is_leaf {
            let child = node.child_for(key);
            stack.acquire_read(child)?;
            stack.release(id);
            id = child;
            node = self.read_node(id)?;
        }
        match node.keys.binary_search_by(|k| k.as_slice().cmp(key)) {
            Ok(idx) => self.load_posting(&node.values[idx]),
            Err(_) => Ok(Vec::new()),
        }
    }

    fn load_posting(&self, value: &PostingValue) -> Result<Vec<IndexEntry>> {
        match value {
            PostingValue::Inline(entries) => Ok(entries.clone()),
            PostingValue::Overflow(head) => {
                let mut out = Vec::new();
                let mut next = *head;
                while next != 0 {
                    let page = OverflowPage::decode(&self.pager.read(next)?, next)?;
                    out.extend_from_slice(&page.entries);
                    next = page.next;
                }
                Ok(out)
            }
        }
    }

    /// Adds one posting for `key`, creating the key if absent.
    pub fn insert_entry(
        &self,
        alloc: &mut Allocator,
        key: &[u8],
        entry: IndexEntry,
    ) -> Result<()> {
        if key.is_empty() || key.len() > self.max_key_len() {
            return Err(GaldrError::InvalidArgument(format!(
                "index key length {} outside 1..={}",
                key.len(),
                self.max_key_len()
            )));
        }

        let mut stack = LockStack::new(self.latches);
        stack.acquire_write(self.root)?;
        let mut path: Vec<(PageId, SecondaryNode)> =
            vec![(self.root, self.read_node(self.root)?)];
        loop {
            let node = &path.last().expect("path is never empty").1;
            if node.is_leaf {
                break;
            }
            let child = node.child_for(key);
            stack.acquire_write(child)?;
            let child_node = self.read_node(child)?;
            if self.safe_for_insert(&child_node, key.len()) {
                stack.release_all_except(child);
                path.clear();
            }
            path.push((child, child_node));
        }

        {
            let leaf = &mut path.last_mut().expect("leaf present").1;
            match leaf.keys.binary_search_by(|k| k.as_slice().cmp(key)) {
                Ok(idx) => {
                    let spilled = self.append_posting(alloc, &mut leaf.values[idx], entry)?;
                    if !spilled && !leaf.fits(self.page_size()) {
                        // Inline growth pushed the node over; force the
                        // posting out to an overflow chain instead of
                        // splitting on a duplicate key.
                        self.spill_posting(alloc, &mut leaf.values[idx])?;
                    }
                }
                Err(idx) => {
                    leaf.keys.insert(idx, key.to_vec());
                    leaf.values.insert(idx, PostingValue::Inline(vec![entry]));
                }
            }
        }

        let mut pending: Option<(Vec<u8>, PageId)> = None;
        let mut first = true;
        while let Some((id, mut node)) = path.pop() {
            if !first {
                if let Some((sep, right)) = pending.take() {
                    let idx = node.keys.partition_point(|k| k.as_slice() < sep.as_slice());
                    node.keys.insert(idx, sep);
                    node.children.insert(idx + 1, right);
                }
            }
            first = false;

            if node.keys.len() <= self.max_keys() && node.fits(self.page_size()) {
                self.write_node(id, &node)?;
                return Ok(());
            }
            if path.is_empty() {
                debug_assert_eq!(id, self.root);
                self.split_root(alloc, node)?;
                return Ok(());
            }
            pending = Some(self.split_nonroot(alloc, id, node)?);
        }
        Err(GaldrError::corrupt("secondary tree split lost its carry"))
    }

    /// Appends to a posting value. Returns true when the posting already
    /// lives in an overflow chain.
    fn append_posting(
        &self,
        alloc: &mut Allocator,
        value: &mut PostingValue,
        entry: IndexEntry,
    ) -> Result<bool> {
        match value {
            PostingValue::Inline(entries) => {
                entries.push(entry);
                if entries.len() > self.max_inline_entries() {
                    self.spill_posting(alloc, value)?;
                    return Ok(true);
                }
                Ok(false)
            }
            PostingValue::Overflow(head) => {
                // Prepend into the head page; link a fresh head when full.
                let mut page = OverflowPage::decode(&self.pager.read(*head)?, *head)?;
                if page.entries.len() < OverflowPage::capacity(self.page_size()) {
                    page.entries.push(entry);
                    self.pager.write(*head, page.encode(self.page_size())?)?;
                } else {
                    let new_head = alloc.allocate_page(self.pager)?;
                    let fresh = OverflowPage {
                        entries: vec![entry],
                        next: *head,
                    };
                    self.pager.write(new_head, fresh.encode(self.page_size())?)?;
                    *value = PostingValue::Overflow(new_head);
                }
                Ok(true)
            }
        }
    }

    /// Moves an inline posting out to a fresh overflow chain.
    fn spill_posting(&self, alloc: &mut Allocator, value: &mut PostingValue) -> Result<()> {
        let PostingValue::Inline(entries) = value else {
            return Ok(());
        };
        let entries = std::mem::take(entries);
        let capacity = OverflowPage::capacity(self.page_size());
        let mut head = 0u32;
        for chunk in entries.chunks(capacity).rev() {
            let page_id = alloc.allocate_page(self.pager)?;
            let page = OverflowPage {
                entries: chunk.to_vec(),
                next: head,
            };
            self.pager.write(page_id, page.encode(self.page_size())?)?;
            head = page_id;
        }
        *value = PostingValue::Overflow(head);
        Ok(())
    }

    /// Removes one posting for `key`. Returns true when the posting existed.
    /// The key disappears (with rebalancing) when its last posting goes.
    pub fn remove_entry(
        &self,
        alloc: &mut Allocator,
        key: &[u8],
        entry: IndexEntry,
    ) -> Result<bool> {
        let mut stack = LockStack::new(self.latches);
        stack.acquire_write(self.root)?;
        let mut path: Vec<(PageId, SecondaryNode)> =
            vec![(self.root, self.read_node(self.root)?)];
        loop {
            let node = &path.last().expect("path is never empty").1;
            if node.is_leaf {
                break;
            }
            let child = node.child_for(key);
            stack.acquire_write(child)?;
            let child_node = self.read_node(child)?;
            if child_node.keys.len() > self.min_keys() {
                stack.release_all_except(child);
                path.clear();
            }
            path.push((child, child_node));
        }

        let (removed, key_emptied) = {
            let leaf = &mut path.last_mut().expect("leaf present").1;
            let Ok(idx) = leaf.keys.binary_search_by(|k| k.as_slice().cmp(key)) else {
                return Ok(false);
            };
            let (removed, emptied) =
                self.remove_from_posting(alloc, &mut leaf.values[idx], entry)?;
            if emptied {
                leaf.keys.remove(idx);
                leaf.values.remove(idx);
            }
            (removed, emptied)
        };
        if !removed {
            return Ok(false);
        }
        if !key_emptied {
            let (id, node) = path.pop().expect("leaf present");
            self.write_node(id, &node)?;
            return Ok(true);
        }

        self.rebalance(alloc, &mut stack, path)?;
        Ok(true)
    }

    /// Removes an entry from a posting value; returns (removed, emptied).
    fn remove_from_posting(
        &self,
        alloc: &mut Allocator,
        value: &mut PostingValue,
        entry: IndexEntry,
    ) -> Result<(bool, bool)> {
        match value {
            PostingValue::Inline(entries) => {
                let before = entries.len();
                entries.retain(|e| *e != entry);
                let removed = entries.len() < before;
                Ok((removed, entries.is_empty()))
            }
            PostingValue::Overflow(head) => {
                let mut all = Vec::new();
                let mut chain = Vec::new();
                let mut next = *head;
                while next != 0 {
                    let page = OverflowPage::decode(&self.pager.read(next)?, next)?;
                    chain.push(next);
                    all.extend_from_slice(&page.entries);
                    next = page.next;
                }
                let before = all.len();
                all.retain(|e| *e != entry);
                let removed = all.len() < before;
                if !removed {
                    return Ok((false, false));
                }

                if all.is_empty() {
                    for page_id in chain {
                        alloc.deallocate(page_id);
                    }
                    return Ok((true, true));
                }
                if all.len() <= self.max_inline_entries() / 2 {
                    // Small enough to fold back into the leaf.
                    for page_id in chain {
                        alloc.deallocate(page_id);
                    }
                    *value = PostingValue::Inline(all);
                    return Ok((true, false));
                }

                // Rewrite the chain, trimming pages that emptied out.
                let capacity = OverflowPage::capacity(self.page_size());
                let needed = all.len().div_ceil(capacity);
                for page_id in chain.drain(needed..) {
                    alloc.deallocate(page_id);
                }
                for (i, chunk) in all.chunks(capacity).enumerate() {
                    let next = if i + 1 < needed { chain[i + 1] } else { 0 };
                    let page = OverflowPage {
                        entries: chunk.to_vec(),
                        next,
                    };
                    self.pager.write(chain[i], page.encode(self.page_size())?)?;
                }
                *head = chain[0];
                Ok((true, false))
            }
        }
    }

    fn split_nonroot(
        &self,
        alloc: &mut Allocator,
        id: PageId,
        mut node: SecondaryNode,
    ) -> Result<(Vec<u8>, PageId)> {
        let right_id = alloc.allocate_page(self.pager)?;
        let mid = split_point(&node);
        let (sep, right) = if node.is_leaf {
            let mut right = SecondaryNode::new_leaf();
            right.keys = node.keys.split_off(mid);
            right.values = node.values.split_off(mid);
            right.next_leaf = node.next_leaf;
            node.next_leaf = right_id;
            (right.keys[0].clone(), right)
        } else {
            let mut right = SecondaryNode::new_internal(
                node.keys.split_off(mid + 1),
                node.children.split_off(mid + 1),
            );
            let sep = node.keys.pop().expect("separator at split point");
            right.next_leaf = 0;
            (sep, right)
        };
        self.write_node(right_id, &right)?;
        self.write_node(id, &node)?;
        Ok((sep, right_id))
    }

    fn split_root(&self, alloc: &mut Allocator, mut node: SecondaryNode) -> Result<()> {
        let left_id = alloc.allocate_page(self.pager)?;
        let right_id = alloc.allocate_page(self.pager)?;
        let mid = split_point(&node);

        let sep = if node.is_leaf {
            let mut right = SecondaryNode::new_leaf();
            right.keys = node.keys.split_off(mid);
            right.values = node.values.split_off(mid);
            right.next_leaf = node.next_leaf;
            let mut left = SecondaryNode::new_leaf();
            left.keys = std::mem::take(&mut node.keys);
            left.values = std::mem::take(&mut node.values);
            left.next_leaf = right_id;
            let sep = right.keys[0].clone();
            self.write_node(left_id, &left)?;
            self.write_node(right_id, &right)?;
            sep
        } else {
            let right = SecondaryNode::new_internal(
                node.keys.split_off(mid + 1),
                node.children.split_off(mid + 1),
            );
            let sep = node.keys.pop().expect("separator at split point");
            let left = SecondaryNode::new_internal(
                std::mem::take(&mut node.keys),
                std::mem::take(&mut node.children),
            );
            self.write_node(left_id, &left)?;
            self.write_node(right_id, &right)?;
            sep
        };

        let new_root = SecondaryNode::new_internal(vec![sep], vec![left_id, right_id]);
        self.write_node(self.root, &new_root)
    }

    fn rebalance(
        &self,
        alloc: &mut Allocator,
        stack: &mut LockStack<'_>,
        mut path: Vec<(PageId, SecondaryNode)>,
    ) -> Result<()> {
        loop {
            let (id, node) = path.last().expect("path is never empty");
            let id = *id;

            if id == self.root {
                let node = path.pop().expect("root entry").1;
                if !node.is_leaf && node.keys.is_empty() && node.children.len() == 1 {
                    return self.collapse_root(alloc, stack, node);
                }
                return self.write_node(id, &node);
            }
            if node.keys.len() >= self.min_keys() {
                let (id, node) = path.pop().expect("entry");
                return self.write_node(id, &node);
            }

            let (node_id, node) = path.pop().expect("underflowing node");
            let parent = &mut path.last_mut().expect("parent latched").1;
            let child_idx = parent
                .children
                .iter()
                .position(|&c| c == node_id)
                .ok_or_else(|| {
                    GaldrError::corrupt_page(node_id, "node missing from its parent")
                })?;

            let mut node = node;
            let page_size = self.page_size();
            if child_idx > 0 {
                let left_id = parent.children[child_idx - 1];
                stack.reacquire_write_sorted(&[node_id, left_id])?;
                let mut left = self.read_node(left_id)?;
                if left.keys.len() > self.min_keys() {
                    borrow_from_left(parent, child_idx, &mut left, &mut node);
                    self.write_node(left_id, &left)?;
                    self.write_node(node_id, &node)?;
                    let (pid, pnode) = path.pop().expect("parent");
                    return self.write_node(pid, &pnode);
                }
                if merged_size(parent, child_idx - 1, &left, &node) <= page_size {
                    merge_into_left(parent, child_idx, &mut left, node);
                    self.write_node(left_id, &left)?;
                    alloc.deallocate(node_id);
                    continue;
                }
                // Neither borrow nor merge fits byte-wise; an under-full
                // node is the lesser evil for variable-length keys.
                self.write_node(node_id, &node)?;
                let (pid, pnode) = path.pop().expect("parent");
                return self.write_node(pid, &pnode);
            }

            let right_id = parent.children[child_idx + 1];
            stack.reacquire_write_sorted(&[node_id, right_id])?;
            let mut right = self.read_node(right_id)?;
            if right.keys.len() > self.min_keys() {
                borrow_from_right(parent, child_idx, &mut node, &mut right);
                self.write_node(node_id, &node)?;
                self.write_node(right_id, &right)?;
                let (pid, pnode) = path.pop().expect("parent");
                return self.write_node(pid, &pnode);
            }
            if merged_size(parent, child_idx, &node, &right) <= page_size {
                merge_right_into(parent, child_idx, &mut node, right);
                self.write_node(node_id, &node)?;
                alloc.deallocate(right_id);
                continue;
            }
            self.write_node(node_id, &node)?;
            let (pid, pnode) = path.pop().expect("parent");
            return self.write_node(pid, &pnode);
        }
    }

    fn collapse_root(
        &self,
        alloc: &mut Allocator,
        stack: &mut LockStack<'_>,
        root: SecondaryNode,
    ) -> Result<()> {
        let child_id = root.children[0];
        if !stack.holds(child_id) {
            stack.acquire_write(child_id)?;
        }
        let child = self.read_node(child_id)?;
        self.write_node(self.root, &child)?;
        alloc.deallocate(child_id);
        Ok(())
    }

    /// Ascending range scan; postings are materialized per key.
    pub fn range(
        &self,
        lo: ScanBound<'_>,
        hi: ScanBound<'_>,
    ) -> Result<Vec<(Vec<u8>, Vec<IndexEntry>)>> {
        let mut out = Vec::new();
        let mut stack = LockStack::new(self.latches);
        stack.acquire_read(self.root)?;
        let descent_key: &[u8] = match lo {
            ScanBound::Included(k) | ScanBound::Excluded(k) => k,
            ScanBound::Unbounded => &[],
        };
        let mut id = self.root;
        let mut node = self.read_node(id)?;
        while !node.is_leaf {
            let child = match lo {
                ScanBound::Unbounded => node.children[0],
                _ => node.child_for(descent_key),
            };
            stack.acquire_read(child)?;
            stack.release(id);
            id = child;
            node = self.read_node(id)?;
        }

        loop {
            for (idx, key) in node.keys.iter().enumerate() {
                let after_lo = match lo {
                    ScanBound::Unbounded => true,
                    ScanBound::Included(b) => key.as_slice() >= b,
                    ScanBound::Excluded(b) => key.as_slice() > b,
                };
                if !after_lo {
                    continue;
                }
                let before_hi = match hi {
                    ScanBound::Unbounded => true,
                    ScanBound::Included(b) => key.as_slice() <= b,
                    ScanBound::Excluded(b) => key.as_slice() < b,
                };
                if !before_hi {
                    return Ok(out);
                }
                out.push((key.clone(), self.load_posting(&node.values[idx])?));
            }
            if node.next_leaf == 0 {
                return Ok(out);
            }
            let next = node.next_leaf;
            stack.acquire_read(next)?;
            stack.release(id);
            id = next;
            node = self.read_node(id)?;
        }
    }

    /// Descending range scan (collected ascending, then reversed).
    pub fn range_desc(
        &self,
        lo: ScanBound<'_>,
        hi: ScanBound<'_>,
    ) -> Result<Vec<(Vec<u8>, Vec<IndexEntry>)>> {
        let mut out = self.range(lo, hi)?;
        out.reverse();
        Ok(out)
    }

    /// All keys starting with `prefix` — the leftmost-prefix access path for
    /// composite indexes.
    pub fn prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<IndexEntry>)>> {
        match crate::btree::keys::prefix_successor(prefix) {
            Some(upper) => self.range(ScanBound::Included(prefix), ScanBound::Excluded(&upper)),
            None => self.range(ScanBound::Included(prefix), ScanBound::Unbounded),
        }
    }

    /// Every `(key, postings)` pair in order.
    pub fn scan_all(&self) -> Result<Vec<(Vec<u8>, Vec<IndexEntry>)>> {
        self.range(ScanBound::Unbounded, ScanBound::Unbounded)
    }
}

/// Byte-aware split index: the smallest prefix holding at least half the
/// encoded weight, clamped so both sides keep at least one key.
fn split_point(node: &SecondaryNode) -> usize {
    let total = node.encoded_size();
    let mut acc = 0usize;
    for (idx, key) in node.keys.iter().enumerate() {
        acc += 2 + key.len();
        if node.is_leaf {
            acc += match &node.values[idx] {
                PostingValue::Inline(entries) => 3 + entries.len() * 10,
                PostingValue::Overflow(_) => 5,
            };
        } else {
            acc += 4;
        }
        if acc * 2 >= total {
            return idx.clamp(1, node.keys.len() - 1);
        }
    }
    node.keys.len() / 2
}

fn merged_size(
    parent: &SecondaryNode,
    sep_idx: usize,
    left: &SecondaryNode,
    right: &SecondaryNode,
) -> usize {
    let sep = if left.is_leaf {
        0
    } else {
        2 + parent.keys[sep_idx].len()
    };
    left.encoded_size() + right.encoded_size() - super::node::NODE_HEADER_SIZE + sep
}

fn borrow_from_left(
    parent: &mut SecondaryNode,
    child_idx: usize,
    left: &mut SecondaryNode,
    node: &mut SecondaryNode,
) {
    let sep_idx = child_idx - 1;
    if node.is_leaf {
        let key = left.keys.pop().expect("donor has spare keys");
        let value = left.values.pop().expect("donor has spare values");
        node.keys.insert(0, key);
        node.values.insert(0, value);
        parent.keys[sep_idx] = node.keys[0].clone();
    } else {
        let sep = std::mem::replace(
            &mut parent.keys[sep_idx],
            left.keys.pop().expect("donor has spare keys"),
        );
        node.keys.insert(0, sep);
        node.children
            .insert(0, left.children.pop().expect("donor has spare children"));
    }
}

fn borrow_from_right(
    parent: &mut SecondaryNode,
    child_idx: usize,
    node: &mut SecondaryNode,
    right: &mut SecondaryNode,
) {
    let sep_idx = child_idx;
    if node.is_leaf {
        let key = right.keys.remove(0);
        let value = right.values.remove(0);
        node.keys.push(key);
        node.values.push(value);
        parent.keys[sep_idx] = right.keys[0].clone();
    } else {
        let sep = std::mem::replace(&mut parent.keys[sep_idx], right.keys.remove(0));
        node.keys.push(sep);
        node.children.push(right.children.remove(0));
    }
}

fn merge_into_left(
    parent: &mut SecondaryNode,
    child_idx: usize,
    left: &mut SecondaryNode,
    mut node: SecondaryNode,
) {
    let sep_idx = child_idx - 1;
    if left.is_leaf {
        left.keys.append(&mut node.keys);
        left.values.append(&mut node.values);
        left.next_leaf = node.next_leaf;
    } else {
        left.keys.push(parent.keys[sep_idx].clone());
        left.keys.append(&mut node.keys);
        left.children.append(&mut node.children);
    }
    parent.keys.remove(sep_idx);
    parent.children.remove(child_idx);
}

fn merge_right_into(
    parent: &mut SecondaryNode,
    child_idx: usize,
    node: &mut SecondaryNode,
    mut right: SecondaryNode,
) {
    let sep_idx = child_idx;
    if node.is_leaf {
        node.keys.append(&mut right.keys);
        node.values.append(&mut right.values);
        node.next_leaf = right.next_leaf;
    } else {
        node.keys.push(parent.keys[sep_idx].clone());
        node.keys.append(&mut right.keys);
        node.children.append(&mut right.children);
    }
    parent.keys.remove(sep_idx);
    parent.children.remove(child_idx + 1);
}
