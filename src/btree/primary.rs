//! Primary B+ tree: document id to slot locator.
//!
//! Order-bounded, integer-keyed, crab-latched. The root page id is fixed for
//! the life of the collection: a root split redistributes into two fresh
//! children and the root becomes internal in place, so concurrent readers
//! entering at the root never chase a moved page.

use crate::alloc::Allocator;
use crate::btree::latch::{LatchTable, LockStack};
use crate::btree::node::PrimaryNode;
use crate::error::{GaldrError, Result};
use crate::pager::{PageId, Pager};
use crate::storage::{DocId, SlotPointer};

/// Integer-keyed tree handle. Cheap to construct per operation; all state
/// lives in pages.
pub struct PrimaryTree<'a> {
    pager: &'a Pager,
    latches: &'a LatchTable,
    root: PageId,
    order: usize,
}

impl<'a> PrimaryTree<'a> {
    /// Opens the tree rooted at `root` with branching order `order`.
    pub fn new(pager: &'a Pager, latches: &'a LatchTable, root: PageId, order: usize) -> Self {
        debug_assert!(order >= 4);
        Self {
            pager,
            latches,
            root,
            order,
        }
    }

    /// Largest order that keeps every node within one page.
    pub fn default_order(page_size: usize) -> usize {
        PrimaryNode::max_keys_for(page_size) + 1
    }

    /// Page image of an empty root leaf, written when a collection is made.
    pub fn empty_root_image(page_size: usize) -> Result<Vec<u8>> {
        PrimaryNode::new_leaf().encode(page_size)
    }

    fn max_keys(&self) -> usize {
        self.order - 1
    }

    // The classic non-root minimum. A ceiling bound would leave two minimal
    // internal siblings plus their pulled-down separator one key over the
    // order after a merge.
    fn min_keys(&self) -> usize {
        (self.order - 1) / 2
    }

    fn read_node(&self, page_id: PageId) -> Result<PrimaryNode> {
        PrimaryNode::decode(&self.pager.read(page_id)?, page_id)
    }

    fn write_node(&self, page_id: PageId, node: &PrimaryNode) -> Result<()> {
        self.pager.write(page_id, node.encode(self.pager.page_size())?)
    }

    /// Point lookup under read-crab latching.
    pub fn get(&self, key: DocId) -> Result<Option<SlotPointer>> {
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
        Ok(match node.keys.binary_search(&key) {
            Ok(idx) => Some(node.values[idx]),
            Err(_) => None,
        })
    }

    /// Inserts or overwrites `key`. Returns true when the key was new.
    pub fn put(&self, alloc: &mut Allocator, key: DocId, value: SlotPointer) -> Result<bool> {
        let mut stack = LockStack::new(self.latches);
        stack.acquire_write(self.root)?;
        let mut path: Vec<(PageId, PrimaryNode)> =
            vec![(self.root, self.read_node(self.root)?)];

        // Descend keeping the latched suffix of ancestors a split could
        // still reach; a safe child releases everything above it.
        loop {
            let node = &path.last().expect("path is never empty").1;
            if node.is_leaf {
                break;
            }
            let child = node.child_for(key);
            stack.acquire_write(child)?;
            let child_node = self.read_node(child)?;
            if child_node.keys.len() < self.max_keys() {
                stack.release_all_except(child);
                path.clear();
            }
            path.push((child, child_node));
        }

        let leaf = &mut path.last_mut().expect("leaf present").1;
        match leaf.keys.binary_search(&key) {
            Ok(idx) => {
                leaf.values[idx] = value;
                let (id, node) = path.last().expect("leaf present");
                self.write_node(*id, node)?;
                return Ok(false);
            }
            Err(idx) => {
                leaf.keys.insert(idx, key);
                leaf.values.insert(idx, value);
            }
        }

        let mut pending: Option<(DocId, PageId)> = None;
        let mut first = true;
        while let Some((id, mut node)) = path.pop() {
            if !first {
                if let Some((sep, right)) = pending.take() {
                    let idx = node.keys.partition_point(|&k| k < sep);
                    node.keys.insert(idx, sep);
                    node.children.insert(idx + 1, right);
                }
            }
            first = false;

            if node.keys.len() <= self.max_keys() {
                self.write_node(id, &node)?;
                return Ok(true);
            }
            if path.is_empty() {
                debug_assert_eq!(id, self.root, "unsafe chain always ends at the root");
                self.split_root(alloc, node)?;
                return Ok(true);
            }
            pending = Some(self.split_nonroot(alloc, id, node)?);
        }
        Err(GaldrError::corrupt("primary tree split lost its carry"))
    }

    fn split_nonroot(
        &self,
        alloc: &mut Allocator,
        id: PageId,
        mut node: PrimaryNode,
    ) -> Result<(DocId, PageId)> {
        let right_id = alloc.allocate_page(self.pager)?;
        let mid = node.keys.len() / 2;
        let (sep, right) = if node.is_leaf {
            let mut right = PrimaryNode::new_leaf();
            right.keys = node.keys.split_off(mid);
            right.values = node.values.split_off(mid);
            right.next_leaf = node.next_leaf;
            node.next_leaf = right_id;
            (right.keys[0], right)
        } else {
            let mut right = PrimaryNode::new_internal(
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

    /// The root page id never changes: its contents move into two fresh
    /// children and the root turns internal in place.
    fn split_root(&self, alloc: &mut Allocator, mut node: PrimaryNode) -> Result<()> {
        let left_id = alloc.allocate_page(self.pager)?;
        let right_id = alloc.allocate_page(self.pager)?;
        let mid = node.keys.len() / 2;

        let sep = if node.is_leaf {
            let mut right = PrimaryNode::new_leaf();
            right.keys = node.keys.split_off(mid);
            right.values = node.values.split_off(mid);
            right.next_leaf = node.next_leaf;
            let mut left = PrimaryNode::new_leaf();
            left.keys = std::mem::take(&mut node.keys);
            left.values = std::mem::take(&mut node.values);
            left.next_leaf = right_id;
            let sep = right.keys[0];
            self.write_node(left_id, &left)?;
            self.write_node(right_id, &right)?;
            sep
        } else {
            let right = PrimaryNode::new_internal(
                node.keys.split_off(mid + 1),
                node.children.split_off(mid + 1),
            );
            let sep = node.keys.pop().expect("separator at split point");
            let left = PrimaryNode::new_internal(
                std::mem::take(&mut node.keys),
                std::mem::take(&mut node.children),
            );
            self.write_node(left_id, &left)?;
            self.write_node(right_id, &right)?;
            sep
        };

        let new_root = PrimaryNode::new_internal(vec![sep], vec![left_id, right_id]);
        self.write_node(self.root, &new_root)
    }

    /// Removes `key`. Returns true when it was present.
    pub fn remove(&self, alloc: &mut Allocator, key: DocId) -> Result<bool> {
        let mut stack = LockStack::new(self.latches);
        stack.acquire_write(self.root)?;
        let mut path: Vec<(PageId, PrimaryNode)> =
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

        {
            let leaf = &mut path.last_mut().expect("leaf present").1;
            match leaf.keys.binary_search(&key) {
                Ok(idx) => {
                    leaf.keys.remove(idx);
                    leaf.values.remove(idx);
                }
                Err(_) => return Ok(false),
            }
        }

        self.rebalance(alloc, &mut stack, path)?;
        Ok(true)
    }

    /// Restores order bounds from the leaf upward through the latched path.
    fn rebalance(
        &self,
        alloc: &mut Allocator,
        stack: &mut LockStack<'_>,
        mut path: Vec<(PageId, PrimaryNode)>,
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

            // Underflow: the parent is latched (delete keeps ancestors of
            // minimal children), so sibling surgery is safe.
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
                // Merge node into its left sibling; the node's page is freed.
                merge_into_left(parent, child_idx, &mut left, node);
                self.write_node(left_id, &left)?;
                alloc.deallocate(node_id);
                continue;
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
            // Merge the right sibling into the node; the right page is freed.
            merge_right_into(parent, child_idx, &mut node, right);
            self.write_node(node_id, &node)?;
            alloc.deallocate(right_id);
        }
    }

    /// Root internal with a single child: pull the child's contents into the
    /// fixed root page and free the child.
    fn collapse_root(
        &self,
        alloc: &mut Allocator,
        stack: &mut LockStack<'_>,
        root: PrimaryNode,
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

    /// Ascending scan of `[lo, hi]`, following leaf links.
    pub fn range(&self, lo: DocId, hi: DocId) -> Result<Vec<(DocId, SlotPointer)>> {
        let mut out = Vec::new();
        if lo > hi {
            return Ok(out);
        }
        let mut stack = LockStack::new(self.latches);
        stack.acquire_read(self.root)?;
        let mut id = self.root;
        let mut node = self.read_node(id)?;
        while !node.is_leaf {
            let child = node.child_for(lo);
            stack.acquire_read(child)?;
            stack.release(id);
            id = child;
            node = self.read_node(id)?;
        }

        loop {
            for (idx, &key) in node.keys.iter().enumerate() {
                if key < lo {
                    continue;
                }
                if key > hi {
                    return Ok(out);
                }
                out.push((key, node.values[idx]));
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

    /// Descending scan: the layout stores no back links, so leaves are
    /// collected ascending and reversed.
    pub fn range_desc(&self, lo: DocId, hi: DocId) -> Result<Vec<(DocId, SlotPointer)>> {
        let mut out = self.range(lo, hi)?;
        out.reverse();
        Ok(out)
    }

    /// Largest key in the tree, if any.
    pub fn max_key(&self) -> Result<Option<DocId>> {
        let mut stack = LockStack::new(self.latches);
        stack.acquire_read(self.root)?;
        let mut id = self.root;
        let mut node = self.read_node(id)?;
        while !node.is_leaf {
            let child = *node.children.last().expect("internal node has children");
            stack.acquire_read(child)?;
            stack.release(id);
            id = child;
            node = self.read_node(id)?;
        }
        Ok(node.keys.last().copied())
    }

    /// Every entry in key order.
    pub fn scan_all(&self) -> Result<Vec<(DocId, SlotPointer)>> {
        self.range(0, DocId::MAX)
    }
}

fn borrow_from_left(
    parent: &mut PrimaryNode,
    child_idx: usize,
    left: &mut PrimaryNode,
    node: &mut PrimaryNode,
) {
    let sep_idx = child_idx - 1;
    if node.is_leaf {
        let key = left.keys.pop().expect("donor has spare keys");
        let value = left.values.pop().expect("donor has spare values");
        node.keys.insert(0, key);
        node.values.insert(0, value);
        parent.keys[sep_idx] = node.keys[0];
    } else {
        let sep = parent.keys[sep_idx];
        parent.keys[sep_idx] = left.keys.pop().expect("donor has spare keys");
        node.keys.insert(0, sep);
        node.children
            .insert(0, left.children.pop().expect("donor has spare children"));
    }
}

fn borrow_from_right(
    parent: &mut PrimaryNode,
    child_idx: usize,
    node: &mut PrimaryNode,
    right: &mut PrimaryNode,
) {
    let sep_idx = child_idx;
    if node.is_leaf {
        let key = right.keys.remove(0);
        let value = right.values.remove(0);
        node.keys.push(key);
        node.values.push(value);
        parent.keys[sep_idx] = right.keys[0];
    } else {
        let sep = parent.keys[sep_idx];
        parent.keys[sep_idx] = right.keys.remove(0);
        node.keys.push(sep);
        node.children.push(right.children.remove(0));
    }
}

fn merge_into_left(
    parent: &mut PrimaryNode,
    child_idx: usize,
    left: &mut PrimaryNode,
    mut node: PrimaryNode,
) {
    let sep_idx = child_idx - 1;
    if left.is_leaf {
        left.keys.append(&mut node.keys);
        left.values.append(&mut node.values);
        left.next_leaf = node.next_leaf;
    } else {
        left.keys.push(parent.keys[sep_idx]);
        left.keys.append(&mut node.keys);
        left.children.append(&mut node.children);
    }
    parent.keys.remove(sep_idx);
    parent.children.remove(child_idx);
}

fn merge_right_into(
    parent: &mut PrimaryNode,
    child_idx: usize,
    node: &mut PrimaryNode,
    mut right: PrimaryNode,
) {
    let sep_idx = child_idx;
    if node.is_leaf {
        node.keys.append(&mut right.keys);
        node.values.append(&mut right.values);
        node.next_leaf = right.next_leaf;
    } else {
        node.keys.push(parent.keys[sep_idx]);
        node.keys.append(&mut right.keys);
        node.children.append(&mut right.children);
    }
    parent.keys.remove(sep_idx);
    parent.children.remove(child_idx + 1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::MapGeometry;
    use crate::pager::PagerOptions;
    use tempfile::NamedTempFile;

    const PAGE: usize = 1024;

    struct Fixture {
        _tmp: NamedTempFile,
        pager: Pager,
        alloc: Allocator,
        latches: LatchTable,
        root: PageId,
    }

    fn fixture() -> Fixture {
        let tmp = NamedTempFile::new().expect("temp file");
        let pager = Pager::open(
            tmp.path(),
            PagerOptions {
                page_size: PAGE,
                cache_pages: 256,
                use_mmap: false,
            },
            None,
        )
        .expect("open pager");
        pager.set_length(128).expect("length");
        let mut alloc = Allocator::create(
            128,
            PAGE,
            64,
            MapGeometry {
                bitmap_start: 1,
                bitmap_pages: 1,
                fsm_start: 2,
                fsm_pages: 1,
            },
        );
        for id in 0..4 {
            alloc.reserve(id);
        }
        let root = alloc.allocate_page(&pager).expect("root page");
        pager
            .write(root, PrimaryTree::empty_root_image(PAGE).expect("image"))
            .expect("write root");
        Fixture {
            _tmp: tmp,
            pager,
            alloc,
            latches: LatchTable::new(),
            root,
        }
    }

    fn ptr(n: u32) -> SlotPointer {
        SlotPointer {
            page_id: 1000 + n,
            slot: (n % 7) as u16,
        }
    }

    #[test]
    fn insert_and_get_round_trip() {
        let mut fx = fixture();
        let tree = PrimaryTree::new(&fx.pager, &fx.latches, fx.root, 30);

        for key in [5u32, 1, 9, 3, 7] {
            assert!(tree.put(&mut fx.alloc, key, ptr(key)).expect("put"));
        }
        for key in [1u32, 3, 5, 7, 9] {
            assert_eq!(tree.get(key).expect("get"), Some(ptr(key)));
        }
        assert_eq!(tree.get(2).expect("get"), None);

        // Overwrite keeps the key unique.
        assert!(!tree.put(&mut fx.alloc, 5, ptr(99)).expect("overwrite"));
        assert_eq!(tree.get(5).expect("get"), Some(ptr(99)));
    }

    #[test]
    fn order_30_split_produces_two_linked_leaves() {
        let mut fx = fixture();
        let tree = PrimaryTree::new(&fx.pager, &fx.latches, fx.root, 30);

        for key in 1..=31u32 {
            tree.put(&mut fx.alloc, key, ptr(key)).expect("put");
        }

        let root = PrimaryNode::decode(&fx.pager.read(fx.root).expect("read"), fx.root)
            .expect("decode root");
        assert!(!root.is_leaf, "root turned internal");
        assert_eq!(root.children.len(), 2, "exactly two leaves");

        let left = PrimaryNode::decode(
            &fx.pager.read(root.children[0]).expect("read"),
            root.children[0],
        )
        .expect("decode left");
        let right = PrimaryNode::decode(
            &fx.pager.read(root.children[1]).expect("read"),
            root.children[1],
        )
        .expect("decode right");

        assert_eq!(left.keys, (1..=15u32).collect::<Vec<_>>());
        assert_eq!(right.keys, (16..=31u32).collect::<Vec<_>>());
        assert_eq!(left.next_leaf, root.children[1]);
        assert_eq!(right.next_leaf, 0);
    }

    #[test]
    fn thousands_of_keys_survive_in_order() {
        let mut fx = fixture();
        let tree = PrimaryTree::new(&fx.pager, &fx.latches, fx.root, 16);

        // Deterministic shuffle via multiplication mod a prime.
        let keys: Vec<u32> = (0..2000u32).map(|i| (i * 7919) % 2003).collect();
        for &key in &keys {
            tree.put(&mut fx.alloc, key, ptr(key)).expect("put");
        }
        let all = tree.scan_all().expect("scan");
        assert_eq!(all.len(), 2000);
        for pair in all.windows(2) {
            assert!(pair[0].0 < pair[1].0, "keys strictly increasing");
        }
        for &key in keys.iter().step_by(97) {
            assert_eq!(tree.get(key).expect("get"), Some(ptr(key)));
        }
    }

    #[test]
    fn range_scan_follows_leaf_links() {
        let mut fx = fixture();
        let tree = PrimaryTree::new(&fx.pager, &fx.latches, fx.root, 8);

        for key in (0..200u32).map(|i| i * 2) {
            tree.put(&mut fx.alloc, key, ptr(key)).expect("put");
        }
        let hits = tree.range(51, 101).expect("range");
        let expected: Vec<u32> = (52..=100).step_by(2).collect();
        assert_eq!(hits.iter().map(|(k, _)| *k).collect::<Vec<_>>(), expected);

        let desc = tree.range_desc(51, 101).expect("desc");
        let mut reversed = expected.clone();
        reversed.reverse();
        assert_eq!(desc.iter().map(|(k, _)| *k).collect::<Vec<_>>(), reversed);
    }

    #[test]
    fn deletes_rebalance_down_to_empty() {
        let mut fx = fixture();
        let tree = PrimaryTree::new(&fx.pager, &fx.latches, fx.root, 8);

        let keys: Vec<u32> = (1..=300u32).collect();
        for &key in &keys {
            tree.put(&mut fx.alloc, key, ptr(key)).expect("put");
        }
        // Remove in an order that exercises borrows and merges on both sides.
        for &key in keys.iter().step_by(2) {
            assert!(tree.remove(&mut fx.alloc, key).expect("remove even"));
        }
        for &key in keys.iter().skip(1).step_by(2) {
            assert!(tree.remove(&mut fx.alloc, key).expect("remove odd"));
        }
        assert!(!tree.remove(&mut fx.alloc, 150).expect("already gone"));
        assert_eq!(tree.scan_all().expect("scan"), Vec::new());
        assert_eq!(tree.max_key().expect("max"), None);

        // The tree still accepts inserts after collapsing to an empty root.
        tree.put(&mut fx.alloc, 42, ptr(42)).expect("put after drain");
        assert_eq!(tree.get(42).expect("get"), Some(ptr(42)));
    }

    #[test]
    fn delete_and_reinsert_interleaved() {
        let mut fx = fixture();
        let tree = PrimaryTree::new(&fx.pager, &fx.latches, fx.root, 6);

        for round in 0..5u32 {
            for key in 0..120u32 {
                tree.put(&mut fx.alloc, key, ptr(key + round)).expect("put");
            }
            for key in (0..120u32).filter(|k| k % 3 == round as u32 % 3) {
                tree.remove(&mut fx.alloc, key).expect("remove");
            }
        }
        let all = tree.scan_all().expect("scan");
        for pair in all.windows(2) {
            assert!(pair[0].0 < pair[1].0);
        }
        assert_eq!(all.len(), 80, "one third removed in the final round");
    }

    #[test]
    fn max_key_tracks_the_rightmost_leaf() {
        let mut fx = fixture();
        let tree = PrimaryTree::new(&fx.pager, &fx.latches, fx.root, 8);
        assert_eq!(tree.max_key().expect("empty"), None);
        for key in [500u32, 10, 900, 42] {
            tree.put(&mut fx.alloc, key, ptr(key)).expect("put");
        }
        assert_eq!(tree.max_key().expect("max"), Some(900));
    }
}
