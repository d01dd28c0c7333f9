//! B+ tree.
//!
//! One tree implementation backs both clustered table storage (row-id keys,
//! row payloads) and index storage (composite keys with a row-id tie-break,
//! row-id payloads). Keys are order-preserving byte strings (see [`key`]),
//! so every comparison is a plain byte compare.
//!
//! The tree is "max-key": an internal cell's separator equals the maximum
//! key in its child's subtree, and one extra rightmost child pointer covers
//! keys above every separator. Leaves of a tree form a singly linked list
//! in key order. Nodes carry their parent page for rebalance walks; the
//! tree is an arena of pages addressed by index, never by reference.

pub mod encoding;
pub mod key;

use crate::error::{Error, Result};
use crate::storage::page::{
    InternalCell, InternalNode, LeafCell, LeafNode, Node, Page, INTERNAL_CELL_OVERHEAD,
};
use crate::storage::PageStore;
use crate::types::PageId;

/// Defensive bound on tree depth; a deeper descent means a page cycle.
const MAX_DEPTH: usize = 64;

/// B+ tree handle over a page store. Cheap to construct per operation.
pub struct BTree<'a, S: PageStore> {
    store: &'a mut S,
    root: PageId,
    max_internal_cells: usize,
    min_internal_cells: usize,
}

/// Iteration state: a leaf page and a cell index within it.
#[derive(Debug, Clone)]
pub struct Cursor {
    leaf: PageId,
    idx: usize,
    done: bool,
}

impl<'a, S: PageStore> BTree<'a, S> {
    /// Open the tree rooted at `root`. `max_key_width` is the widest key
    /// this tree can store; it fixes the internal-node fan-out.
    pub fn new(store: &'a mut S, root: PageId, max_key_width: usize) -> Self {
        let space = Page::node_space(root);
        let max_internal_cells = (space / (INTERNAL_CELL_OVERHEAD + max_key_width)).max(4);
        BTree {
            store,
            root,
            max_internal_cells,
            min_internal_cells: (max_internal_cells / 2).max(1),
        }
    }

    pub fn root(&self) -> PageId {
        self.root
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    /// Find the payload stored under an exact key.
    pub fn search(&mut self, search_key: &[u8]) -> Result<Option<Vec<u8>>> {
        let leaf_id = self.descend(search_key)?;
        let page = self.store.page(leaf_id)?;
        let leaf = page.node()?.as_leaf()?;
        match leaf_position(leaf, search_key) {
            (idx, true) => Ok(Some(leaf.cells[idx].payload.clone())),
            _ => Ok(None),
        }
    }

    /// True when some stored key starts with `prefix`. Used for unique
    /// checks, where the prefix is an index key without its row-id tail.
    pub fn contains_prefix(&mut self, prefix: &[u8]) -> Result<bool> {
        let mut cursor = self.cursor_seek(prefix)?;
        match self.cursor_next(&mut cursor)? {
            Some(cell) => Ok(cell.key.starts_with(prefix)),
            None => Ok(false),
        }
    }

    /// Largest key in the tree, if any.
    pub fn max_key(&mut self) -> Result<Option<Vec<u8>>> {
        let leaf_id = self.descend_rightmost(self.root)?;
        let page = self.store.page(leaf_id)?;
        let leaf = page.node()?.as_leaf()?;
        Ok(leaf.cells.last().map(|c| c.key.clone()))
    }

    fn descend(&mut self, search_key: &[u8]) -> Result<PageId> {
        let mut id = self.root;
        for _ in 0..MAX_DEPTH {
            self.store.cancel().check()?;
            let page = self.store.page(id)?;
            match page.node()? {
                Node::Leaf(_) => return Ok(id),
                Node::Internal(node) => {
                    let idx = node
                        .cells
                        .partition_point(|c| c.key.as_slice() < search_key);
                    id = if idx < node.cells.len() {
                        node.cells[idx].child
                    } else {
                        node.right_child
                    };
                }
            }
        }
        Err(Error::corrupt("tree deeper than MAX_DEPTH"))
    }

    fn descend_rightmost(&mut self, from: PageId) -> Result<PageId> {
        let mut id = from;
        for _ in 0..MAX_DEPTH {
            self.store.cancel().check()?;
            let page = self.store.page(id)?;
            match page.node()? {
                Node::Leaf(_) => return Ok(id),
                Node::Internal(node) => id = node.right_child,
            }
        }
        Err(Error::corrupt("tree deeper than MAX_DEPTH"))
    }

    // ------------------------------------------------------------------
    // Cursors
    // ------------------------------------------------------------------

    /// Cursor positioned at the smallest key.
    pub fn cursor_first(&mut self) -> Result<Cursor> {
        let mut id = self.root;
        for _ in 0..MAX_DEPTH {
            let page = self.store.page(id)?;
            match page.node()? {
                Node::Leaf(_) => {
                    return Ok(Cursor {
                        leaf: id,
                        idx: 0,
                        done: false,
                    })
                }
                Node::Internal(node) => {
                    id = node
                        .cells
                        .first()
                        .map(|c| c.child)
                        .unwrap_or(node.right_child);
                }
            }
        }
        Err(Error::corrupt("tree deeper than MAX_DEPTH"))
    }

    /// Cursor positioned at the first cell whose key is `>= search_key`.
    pub fn cursor_seek(&mut self, search_key: &[u8]) -> Result<Cursor> {
        let leaf_id = self.descend(search_key)?;
        let page = self.store.page(leaf_id)?;
        let leaf = page.node()?.as_leaf()?;
        let idx = leaf
            .cells
            .partition_point(|c| c.key.as_slice() < search_key);
        Ok(Cursor {
            leaf: leaf_id,
            idx,
            done: false,
        })
    }

    /// Produce the cell under the cursor and advance, following the leaf
    /// sibling chain at page boundaries.
    pub fn cursor_next(&mut self, cursor: &mut Cursor) -> Result<Option<LeafCell>> {
        loop {
            if cursor.done {
                return Ok(None);
            }
            self.store.cancel().check()?;
            let page = self.store.page(cursor.leaf)?;
            let leaf = page.node()?.as_leaf()?;
            if cursor.idx < leaf.cells.len() {
                let cell = leaf.cells[cursor.idx].clone();
                cursor.idx += 1;
                return Ok(Some(cell));
            }
            if leaf.right_sibling == 0 {
                cursor.done = true;
            } else {
                cursor.leaf = leaf.right_sibling;
                cursor.idx = 0;
            }
        }
    }

    // ------------------------------------------------------------------
    // Insert
    // ------------------------------------------------------------------

    /// Insert a cell, replacing the payload when the exact key is already
    /// present. Duplicate policy for unique indexes lives with the caller,
    /// which knows the row-id tail width and the index name to report.
    pub fn insert(&mut self, new_key: &[u8], payload: Vec<u8>) -> Result<()> {
        let leaf_id = self.descend(new_key)?;
        let overflows = {
            let space = Page::node_space(leaf_id);
            let page = self.store.page_mut(leaf_id)?;
            let leaf = page.node_mut()?.as_leaf_mut()?;
            let (idx, exact) = leaf_position(leaf, new_key);
            if exact {
                leaf.cells[idx].payload = payload;
            } else {
                leaf.cells.insert(
                    idx,
                    LeafCell {
                        key: new_key.to_vec(),
                        payload,
                    },
                );
            }
            leaf.used_bytes() > space
        };
        if overflows {
            self.split_leaf(leaf_id)?;
        }
        Ok(())
    }

    fn split_leaf(&mut self, id: PageId) -> Result<()> {
        let (is_root, parent, mut cells, right_sibling) = {
            let page = self.store.page(id)?;
            let leaf = page.node()?.as_leaf()?;
            (
                leaf.is_root,
                leaf.parent,
                leaf.cells.clone(),
                leaf.right_sibling,
            )
        };
        let split_at = cells.len().div_ceil(2);
        let right_cells = cells.split_off(split_at);
        let left_max = cells
            .last()
            .ok_or_else(|| Error::corrupt("splitting an empty leaf"))?
            .key
            .clone();

        if is_root {
            // The root stays in place: its cells move into two fresh
            // children and the root becomes internal.
            let right_id = self.store.alloc_page(Page::Node(Node::Leaf(LeafNode {
                is_root: false,
                parent: id,
                right_sibling,
                version: 1,
                cells: right_cells,
            })))?;
            let left_id = self.store.alloc_page(Page::Node(Node::Leaf(LeafNode {
                is_root: false,
                parent: id,
                right_sibling: right_id,
                version: 1,
                cells,
            })))?;
            let page = self.store.page_mut(id)?;
            let version = page.version();
            *page.node_mut()? = Node::Internal(InternalNode {
                is_root: true,
                parent: 0,
                right_child: right_id,
                version,
                cells: vec![InternalCell {
                    key: left_max,
                    child: left_id,
                }],
            });
            return Ok(());
        }

        let right_id = self.store.alloc_page(Page::Node(Node::Leaf(LeafNode {
            is_root: false,
            parent,
            right_sibling,
            version: 1,
            cells: right_cells,
        })))?;
        {
            let page = self.store.page_mut(id)?;
            let leaf = page.node_mut()?.as_leaf_mut()?;
            leaf.cells = cells;
            leaf.right_sibling = right_id;
        }
        self.register_split(parent, id, right_id, left_max)
    }

    fn split_internal(&mut self, id: PageId) -> Result<()> {
        let (is_root, parent, mut cells, right_child) = {
            let page = self.store.page(id)?;
            let node = page.node()?.as_internal()?;
            (
                node.is_root,
                node.parent,
                node.cells.clone(),
                node.right_child,
            )
        };
        // n cells carry n+1 children; the left node takes ceil((n+1)/2) of
        // them and the promoted separator is consumed by the parent entry.
        let left_children = (cells.len() + 2) / 2;
        let right_cells = cells.split_off(left_children);
        let promoted = cells
            .pop()
            .ok_or_else(|| Error::corrupt("splitting an underfull internal node"))?;
        let left_right_child = promoted.child;
        let left_cells = cells;

        if is_root {
            let right_id = self
                .store
                .alloc_page(Page::Node(Node::Internal(InternalNode {
                    is_root: false,
                    parent: id,
                    right_child,
                    version: 1,
                    cells: right_cells.clone(),
                })))?;
            let left_id = self
                .store
                .alloc_page(Page::Node(Node::Internal(InternalNode {
                    is_root: false,
                    parent: id,
                    right_child: left_right_child,
                    version: 1,
                    cells: left_cells.clone(),
                })))?;
            self.reparent_children(&left_cells, left_right_child, left_id)?;
            self.reparent_children(&right_cells, right_child, right_id)?;
            let page = self.store.page_mut(id)?;
            let version = page.version();
            *page.node_mut()? = Node::Internal(InternalNode {
                is_root: true,
                parent: 0,
                right_child: right_id,
                version,
                cells: vec![InternalCell {
                    key: promoted.key,
                    child: left_id,
                }],
            });
            return Ok(());
        }

        let right_id = self
            .store
            .alloc_page(Page::Node(Node::Internal(InternalNode {
                is_root: false,
                parent,
                right_child,
                version: 1,
                cells: right_cells.clone(),
            })))?;
        self.reparent_children(&right_cells, right_child, right_id)?;
        {
            let page = self.store.page_mut(id)?;
            let node = page.node_mut()?.as_internal_mut()?;
            node.cells = left_cells;
            node.right_child = left_right_child;
        }
        self.register_split(parent, id, right_id, promoted.key)
    }

    /// After `left_id` split off `right_id`, wire both into the parent:
    /// the old entry for `left_id` keeps its separator (now the right
    /// node's max) and points at `right_id`; a new cell carries the left
    /// node's max. Splits propagate upward from here.
    fn register_split(
        &mut self,
        parent_id: PageId,
        left_id: PageId,
        right_id: PageId,
        left_max: Vec<u8>,
    ) -> Result<()> {
        let overflows = {
            let max_cells = self.max_internal_cells;
            let page = self.store.page_mut(parent_id)?;
            let node = page.node_mut()?.as_internal_mut()?;
            match child_position(node, left_id) {
                Some(idx) if idx < node.cells.len() => {
                    node.cells[idx].child = right_id;
                    node.cells.insert(
                        idx,
                        InternalCell {
                            key: left_max,
                            child: left_id,
                        },
                    );
                }
                Some(_) => {
                    node.right_child = right_id;
                    node.cells.push(InternalCell {
                        key: left_max,
                        child: left_id,
                    });
                }
                None => {
                    return Err(Error::corrupt("split child missing from parent"));
                }
            }
            node.cells.len() > max_cells
        };
        if overflows {
            self.split_internal(parent_id)?;
        }
        Ok(())
    }

    fn reparent_children(
        &mut self,
        cells: &[InternalCell],
        right_child: PageId,
        new_parent: PageId,
    ) -> Result<()> {
        for cell in cells {
            let page = self.store.page_mut(cell.child)?;
            page.node_mut()?.set_parent(new_parent);
        }
        let page = self.store.page_mut(right_child)?;
        page.node_mut()?.set_parent(new_parent);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------

    /// Remove the cell with exactly `del_key`. Returns whether it existed.
    pub fn delete(&mut self, del_key: &[u8]) -> Result<bool> {
        let leaf_id = self.descend(del_key)?;
        // Probe read-only first: a miss must not dirty the leaf.
        {
            let page = self.store.page(leaf_id)?;
            let leaf = page.node()?.as_leaf()?;
            if !leaf_position(leaf, del_key).1 {
                return Ok(false);
            }
        }
        let (removed_max, now_empty, underflow, is_root) = {
            let space = Page::node_space(leaf_id);
            let page = self.store.page_mut(leaf_id)?;
            let leaf = page.node_mut()?.as_leaf_mut()?;
            let (idx, exact) = leaf_position(leaf, del_key);
            if !exact {
                return Err(Error::corrupt("leaf cell vanished between probe and delete"));
            }
            leaf.cells.remove(idx);
            let removed_max = idx == leaf.cells.len();
            (
                removed_max,
                leaf.cells.is_empty(),
                leaf.used_bytes() < space / 2,
                leaf.is_root,
            )
        };
        if is_root {
            return Ok(true);
        }
        if removed_max && !now_empty {
            self.refresh_separators(leaf_id)?;
        }
        if underflow {
            self.rebalance(leaf_id)?;
        }
        Ok(true)
    }

    /// Walk from `child` toward the root, rewriting every separator that
    /// should equal the subtree max along the right-child spine.
    fn refresh_separators(&mut self, start: PageId) -> Result<()> {
        let mut child = start;
        for _ in 0..MAX_DEPTH {
            let (is_root, parent_id) = {
                let page = self.store.page(child)?;
                let node = page.node()?;
                (node.is_root(), node.parent())
            };
            if is_root {
                return Ok(());
            }
            let Some(child_max) = self.node_max_key(child)? else {
                return Ok(());
            };
            let was_right_child = {
                let page = self.store.page_mut(parent_id)?;
                let node = page.node_mut()?.as_internal_mut()?;
                match child_position(node, child) {
                    Some(idx) if idx < node.cells.len() => {
                        node.cells[idx].key = child_max;
                        false
                    }
                    Some(_) => true,
                    None => return Err(Error::corrupt("child missing from parent")),
                }
            };
            if !was_right_child {
                return Ok(());
            }
            child = parent_id;
        }
        Err(Error::corrupt("parent chain deeper than MAX_DEPTH"))
    }

    fn node_max_key(&mut self, id: PageId) -> Result<Option<Vec<u8>>> {
        let leaf_id = self.descend_rightmost(id)?;
        let page = self.store.page(leaf_id)?;
        Ok(page.node()?.as_leaf()?.cells.last().map(|c| c.key.clone()))
    }

    fn rebalance(&mut self, id: PageId) -> Result<()> {
        let parent_id = {
            let page = self.store.page(id)?;
            let node = page.node()?;
            if node.is_root() {
                return self.maybe_collapse_root();
            }
            node.parent()
        };
        let (position, left_sibling, right_sibling) = {
            let page = self.store.page(parent_id)?;
            let parent = page.node()?.as_internal()?;
            let idx = child_position(parent, id)
                .ok_or_else(|| Error::corrupt("child missing from parent"))?;
            let left = (idx > 0).then(|| child_at(parent, idx - 1));
            let right = (idx < parent.cells.len()).then(|| child_at(parent, idx + 1));
            (idx, left, right)
        };

        let is_leaf = matches!(self.store.page(id)?.node()?, Node::Leaf(_));
        if is_leaf {
            self.rebalance_leaf(id, parent_id, position, left_sibling, right_sibling)
        } else {
            self.rebalance_internal(id, parent_id, position, left_sibling, right_sibling)
        }
    }

    fn rebalance_leaf(
        &mut self,
        id: PageId,
        parent_id: PageId,
        position: usize,
        left_sibling: Option<PageId>,
        right_sibling: Option<PageId>,
    ) -> Result<()> {
        let space = Page::node_space(id);
        let my_used = self.leaf_used(id)?;

        if let Some(left) = left_sibling {
            if self.leaf_used(left)? + my_used <= Page::node_space(left) {
                return self.merge_leaves(left, id, parent_id, position - 1);
            }
        }
        if let Some(right) = right_sibling {
            if my_used + self.leaf_used(right)? <= space {
                return self.merge_leaves(id, right, parent_id, position);
            }
        }
        if let Some(left) = left_sibling {
            return self.borrow_leaf_from_left(left, id, parent_id, position - 1);
        }
        if let Some(right) = right_sibling {
            return self.borrow_leaf_from_right(id, right, parent_id, position);
        }
        // Only child; the parent can only be a collapsible root.
        self.maybe_collapse_root_from(parent_id)
    }

    fn rebalance_internal(
        &mut self,
        id: PageId,
        parent_id: PageId,
        position: usize,
        left_sibling: Option<PageId>,
        right_sibling: Option<PageId>,
    ) -> Result<()> {
        let my_len = self.internal_len(id)?;

        if let Some(left) = left_sibling {
            if self.internal_len(left)? + 1 + my_len <= self.max_internal_cells {
                return self.merge_internals(left, id, parent_id, position - 1);
            }
        }
        if let Some(right) = right_sibling {
            if my_len + 1 + self.internal_len(right)? <= self.max_internal_cells {
                return self.merge_internals(id, right, parent_id, position);
            }
        }
        if let Some(left) = left_sibling {
            return self.borrow_internal_from_left(left, id, parent_id, position - 1);
        }
        if let Some(right) = right_sibling {
            return self.borrow_internal_from_right(id, right, parent_id, position);
        }
        self.maybe_collapse_root_from(parent_id)
    }

    fn leaf_used(&mut self, id: PageId) -> Result<usize> {
        let page = self.store.page(id)?;
        Ok(page.node()?.as_leaf()?.used_bytes())
    }

    fn internal_len(&mut self, id: PageId) -> Result<usize> {
        let page = self.store.page(id)?;
        Ok(page.node()?.as_internal()?.cells.len())
    }

    /// Merge right leaf `b` into its left sibling `a`; `a_cell_idx` is the
    /// index of `a`'s separator cell in the parent.
    fn merge_leaves(
        &mut self,
        a: PageId,
        b: PageId,
        parent_id: PageId,
        a_cell_idx: usize,
    ) -> Result<()> {
        let (b_cells, b_right_sibling) = {
            let page = self.store.page(b)?;
            let leaf = page.node()?.as_leaf()?;
            (leaf.cells.clone(), leaf.right_sibling)
        };
        let merged_max = {
            let page = self.store.page_mut(a)?;
            let leaf = page.node_mut()?.as_leaf_mut()?;
            leaf.cells.extend(b_cells);
            leaf.right_sibling = b_right_sibling;
            leaf.cells.last().map(|c| c.key.clone())
        };
        self.store.free_page(b)?;
        self.remove_merged_entry(parent_id, a, b, a_cell_idx, merged_max)
    }

    fn merge_internals(
        &mut self,
        a: PageId,
        b: PageId,
        parent_id: PageId,
        a_cell_idx: usize,
    ) -> Result<()> {
        let a_separator = {
            let page = self.store.page(parent_id)?;
            page.node()?.as_internal()?.cells[a_cell_idx].key.clone()
        };
        let (b_cells, b_right_child) = {
            let page = self.store.page(b)?;
            let node = page.node()?.as_internal()?;
            (node.cells.clone(), node.right_child)
        };
        {
            let page = self.store.page_mut(a)?;
            let node = page.node_mut()?.as_internal_mut()?;
            let old_right = node.right_child;
            node.cells.push(InternalCell {
                key: a_separator,
                child: old_right,
            });
            node.cells.extend(b_cells.clone());
            node.right_child = b_right_child;
        }
        self.reparent_children(&b_cells, b_right_child, a)?;
        self.store.free_page(b)?;
        let merged_max = self.node_max_key(a)?;
        self.remove_merged_entry(parent_id, a, b, a_cell_idx, merged_max)
    }

    /// Drop `a`'s separator cell from the parent and point the entry that
    /// covered `b` at the merged node, then rebalance upward as needed.
    fn remove_merged_entry(
        &mut self,
        parent_id: PageId,
        a: PageId,
        b: PageId,
        a_cell_idx: usize,
        merged_max: Option<Vec<u8>>,
    ) -> Result<()> {
        let (is_root, empty_root, underflow) = {
            let min_cells = self.min_internal_cells;
            let page = self.store.page_mut(parent_id)?;
            let node = page.node_mut()?.as_internal_mut()?;
            node.cells.remove(a_cell_idx);
            if a_cell_idx < node.cells.len() && node.cells[a_cell_idx].child == b {
                node.cells[a_cell_idx].child = a;
                if let Some(max) = merged_max {
                    node.cells[a_cell_idx].key = max;
                }
            } else if node.right_child == b {
                node.right_child = a;
            } else {
                return Err(Error::corrupt("merged sibling missing from parent"));
            }
            (
                node.is_root,
                node.is_root && node.cells.is_empty(),
                !node.is_root && node.cells.len() < min_cells,
            )
        };
        self.refresh_separators(a)?;
        if empty_root {
            return self.collapse_root(parent_id);
        }
        if !is_root && underflow {
            return self.rebalance(parent_id);
        }
        Ok(())
    }

    fn borrow_leaf_from_left(
        &mut self,
        left: PageId,
        id: PageId,
        parent_id: PageId,
        left_cell_idx: usize,
    ) -> Result<()> {
        let space = Page::node_space(id);
        loop {
            if self.leaf_used(id)? >= space / 2 {
                break;
            }
            let moved = {
                let donor_space = Page::node_space(left);
                let page = self.store.page(left)?;
                let donor = page.node()?.as_leaf()?;
                let Some(last) = donor.cells.last() else {
                    break;
                };
                if donor.used_bytes() - last.size() < donor_space / 2 {
                    break;
                }
                last.clone()
            };
            {
                let page = self.store.page_mut(left)?;
                page.node_mut()?.as_leaf_mut()?.cells.pop();
            }
            {
                let page = self.store.page_mut(id)?;
                page.node_mut()?.as_leaf_mut()?.cells.insert(0, moved);
            }
        }
        // The donor's max shrank; rewrite its separator.
        let donor_max = {
            let page = self.store.page(left)?;
            page.node()?.as_leaf()?.cells.last().map(|c| c.key.clone())
        };
        if let Some(max) = donor_max {
            let page = self.store.page_mut(parent_id)?;
            page.node_mut()?.as_internal_mut()?.cells[left_cell_idx].key = max;
        }
        Ok(())
    }

    fn borrow_leaf_from_right(
        &mut self,
        id: PageId,
        right: PageId,
        parent_id: PageId,
        my_cell_idx: usize,
    ) -> Result<()> {
        let space = Page::node_space(id);
        loop {
            if self.leaf_used(id)? >= space / 2 {
                break;
            }
            let moved = {
                let donor_space = Page::node_space(right);
                let page = self.store.page(right)?;
                let donor = page.node()?.as_leaf()?;
                let Some(first) = donor.cells.first() else {
                    break;
                };
                if donor.used_bytes() - first.size() < donor_space / 2 {
                    break;
                }
                first.clone()
            };
            {
                let page = self.store.page_mut(right)?;
                page.node_mut()?.as_leaf_mut()?.cells.remove(0);
            }
            {
                let page = self.store.page_mut(id)?;
                page.node_mut()?.as_leaf_mut()?.cells.push(moved);
            }
        }
        // Our max grew; rewrite our separator.
        let my_max = {
            let page = self.store.page(id)?;
            page.node()?.as_leaf()?.cells.last().map(|c| c.key.clone())
        };
        if let Some(max) = my_max {
            let page = self.store.page_mut(parent_id)?;
            page.node_mut()?.as_internal_mut()?.cells[my_cell_idx].key = max;
        }
        Ok(())
    }

    fn borrow_internal_from_left(
        &mut self,
        left: PageId,
        id: PageId,
        parent_id: PageId,
        left_cell_idx: usize,
    ) -> Result<()> {
        while self.internal_len(id)? < self.min_internal_cells
            && self.internal_len(left)? > self.min_internal_cells
        {
            let left_separator = {
                let page = self.store.page(parent_id)?;
                page.node()?.as_internal()?.cells[left_cell_idx].key.clone()
            };
            let (donated_child, new_left_separator) = {
                let page = self.store.page_mut(left)?;
                let donor = page.node_mut()?.as_internal_mut()?;
                let donated = donor.right_child;
                let tail = donor
                    .cells
                    .pop()
                    .ok_or_else(|| Error::corrupt("borrowing from empty internal node"))?;
                donor.right_child = tail.child;
                (donated, tail.key)
            };
            {
                let page = self.store.page_mut(id)?;
                let node = page.node_mut()?.as_internal_mut()?;
                node.cells.insert(
                    0,
                    InternalCell {
                        key: left_separator,
                        child: donated_child,
                    },
                );
            }
            {
                let page = self.store.page_mut(donated_child)?;
                page.node_mut()?.set_parent(id);
            }
            {
                let page = self.store.page_mut(parent_id)?;
                page.node_mut()?.as_internal_mut()?.cells[left_cell_idx].key = new_left_separator;
            }
        }
        Ok(())
    }

    fn borrow_internal_from_right(
        &mut self,
        id: PageId,
        right: PageId,
        parent_id: PageId,
        my_cell_idx: usize,
    ) -> Result<()> {
        while self.internal_len(id)? < self.min_internal_cells
            && self.internal_len(right)? > self.min_internal_cells
        {
            let my_separator = {
                let page = self.store.page(parent_id)?;
                page.node()?.as_internal()?.cells[my_cell_idx].key.clone()
            };
            let (incoming, new_my_separator) = {
                let page = self.store.page_mut(right)?;
                let donor = page.node_mut()?.as_internal_mut()?;
                let head = donor.cells.remove(0);
                (head.child, head.key)
            };
            {
                let page = self.store.page_mut(id)?;
                let node = page.node_mut()?.as_internal_mut()?;
                let old_right = node.right_child;
                node.cells.push(InternalCell {
                    key: my_separator,
                    child: old_right,
                });
                node.right_child = incoming;
            }
            {
                let page = self.store.page_mut(incoming)?;
                page.node_mut()?.set_parent(id);
            }
            {
                let page = self.store.page_mut(parent_id)?;
                page.node_mut()?.as_internal_mut()?.cells[my_cell_idx].key = new_my_separator;
            }
        }
        Ok(())
    }

    fn maybe_collapse_root(&mut self) -> Result<()> {
        let collapse = {
            let page = self.store.page(self.root)?;
            match page.node()? {
                Node::Internal(node) => node.cells.is_empty(),
                Node::Leaf(_) => false,
            }
        };
        if collapse {
            self.collapse_root(self.root)?;
        }
        Ok(())
    }

    fn maybe_collapse_root_from(&mut self, id: PageId) -> Result<()> {
        let is_root = self.store.page(id)?.node()?.is_root();
        if is_root {
            self.maybe_collapse_root()
        } else {
            Ok(())
        }
    }

    /// An internal root with a single remaining child absorbs that child,
    /// keeping its own page index stable.
    fn collapse_root(&mut self, root_id: PageId) -> Result<()> {
        let only_child = {
            let page = self.store.page(root_id)?;
            let node = page.node()?.as_internal()?;
            if !node.cells.is_empty() {
                return Ok(());
            }
            node.right_child
        };
        let child_node = self.store.page(only_child)?.node()?.clone();
        let (cells_to_reparent, right_child) = match &child_node {
            Node::Internal(n) => (n.cells.clone(), Some(n.right_child)),
            Node::Leaf(_) => (Vec::new(), None),
        };
        {
            let page = self.store.page_mut(root_id)?;
            let version = page.version();
            let mut promoted = child_node;
            promoted.set_root(true);
            promoted.set_parent(0);
            promoted.set_version(version);
            if let Node::Leaf(leaf) = &mut promoted {
                leaf.right_sibling = 0;
            }
            *page.node_mut()? = promoted;
        }
        if let Some(rc) = right_child {
            self.reparent_children(&cells_to_reparent, rc, root_id)?;
        }
        self.store.free_page(only_child)
    }

    // ------------------------------------------------------------------
    // Whole-tree operations
    // ------------------------------------------------------------------

    /// Every node page of this tree, root included.
    pub fn collect_pages(&mut self) -> Result<Vec<PageId>> {
        let mut pages = Vec::new();
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            self.store.cancel().check()?;
            pages.push(id);
            let page = self.store.page(id)?;
            if let Node::Internal(node) = page.node()? {
                stack.extend(node.cells.iter().map(|c| c.child));
                stack.push(node.right_child);
            }
        }
        Ok(pages)
    }

    /// Free every page of the tree, root included, in ascending page order
    /// so the free list hands them back newest-first.
    pub fn free_all(&mut self) -> Result<()> {
        let mut pages = self.collect_pages()?;
        pages.sort_unstable();
        for id in pages {
            self.store.free_page(id)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Invariant checking (test support)
    // ------------------------------------------------------------------

    /// Verify structural invariants: key order within nodes, separator =
    /// max key of child subtree, uniform depth, parent pointers, sibling
    /// chain order, and fill bounds for non-root nodes.
    pub fn check_invariants(&mut self) -> Result<()> {
        let root = self.root;
        let summary = self.check_node(root, root, true)?;
        // The sibling chain must enumerate the same keys in order.
        let mut cursor = self.cursor_first()?;
        let mut chained = Vec::new();
        while let Some(cell) = self.cursor_next(&mut cursor)? {
            chained.push(cell.key);
        }
        if chained != summary.keys {
            return Err(Error::corrupt("leaf chain does not match tree order"));
        }
        Ok(())
    }

    fn check_node(
        &mut self,
        id: PageId,
        expect_parent: PageId,
        is_root: bool,
    ) -> Result<NodeCheck> {
        let node = self.store.page(id)?.node()?.clone();
        if node.is_root() != is_root {
            return Err(Error::corrupt("is_root flag mismatch"));
        }
        if !is_root && node.parent() != expect_parent {
            return Err(Error::corrupt("parent pointer mismatch"));
        }
        match node {
            Node::Leaf(leaf) => {
                let keys: Vec<Vec<u8>> = leaf.cells.iter().map(|c| c.key.clone()).collect();
                if keys.windows(2).any(|w| w[0] >= w[1]) {
                    return Err(Error::corrupt("leaf keys out of order"));
                }
                if !is_root && leaf.used_bytes() < Page::node_space(id) / 2 {
                    return Err(Error::corrupt("leaf below minimum fill"));
                }
                Ok(NodeCheck { depth: 1, keys })
            }
            Node::Internal(internal) => {
                if !is_root && internal.cells.len() < self.min_internal_cells {
                    return Err(Error::corrupt("internal node below minimum fill"));
                }
                if internal.cells.len() > self.max_internal_cells {
                    return Err(Error::corrupt("internal node above maximum fill"));
                }
                let mut keys = Vec::new();
                let mut depth = None;
                for cell in &internal.cells {
                    let child = self.check_node(cell.child, id, false)?;
                    if child.keys.last() != Some(&cell.key) {
                        return Err(Error::corrupt("separator is not the child subtree max"));
                    }
                    if *depth.get_or_insert(child.depth) != child.depth {
                        return Err(Error::corrupt("uneven tree depth"));
                    }
                    keys.extend(child.keys);
                }
                let rightmost = self.check_node(internal.right_child, id, false)?;
                if *depth.get_or_insert(rightmost.depth) != rightmost.depth {
                    return Err(Error::corrupt("uneven tree depth"));
                }
                keys.extend(rightmost.keys);
                if keys.windows(2).any(|w| w[0] >= w[1]) {
                    return Err(Error::corrupt("keys out of order across children"));
                }
                Ok(NodeCheck {
                    depth: depth.unwrap_or(1) + 1,
                    keys,
                })
            }
        }
    }
}

struct NodeCheck {
    depth: usize,
    keys: Vec<Vec<u8>>,
}

/// Binary search a leaf for `key`: position and whether it is an exact hit.
fn leaf_position(leaf: &LeafNode, search_key: &[u8]) -> (usize, bool) {
    let idx = leaf
        .cells
        .partition_point(|c| c.key.as_slice() < search_key);
    let exact = leaf
        .cells
        .get(idx)
        .map(|c| c.key.as_slice() == search_key)
        .unwrap_or(false);
    (idx, exact)
}

/// Index of `child` among a parent's children; `cells.len()` addresses the
/// rightmost child.
fn child_position(parent: &InternalNode, child: PageId) -> Option<usize> {
    for (i, cell) in parent.cells.iter().enumerate() {
        if cell.child == child {
            return Some(i);
        }
    }
    (parent.right_child == child).then_some(parent.cells.len())
}

fn child_at(parent: &InternalNode, idx: usize) -> PageId {
    if idx < parent.cells.len() {
        parent.cells[idx].child
    } else {
        parent.right_child
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::LeafNode;
    use crate::storage::testing::MemStore;
    use crate::types::{DataType, Value};

    fn new_tree(store: &mut MemStore) -> PageId {
        store
            .alloc_page(Page::Node(Node::Leaf(LeafNode::new_root())))
            .unwrap()
    }

    fn k(v: u64) -> Vec<u8> {
        key::encode_row_id(v)
    }

    fn payload(v: u64, len: usize) -> Vec<u8> {
        vec![(v & 0xff) as u8; len]
    }

    #[test]
    fn test_insert_search_single_leaf() {
        let mut store = MemStore::new();
        let root = new_tree(&mut store);
        let mut tree = BTree::new(&mut store, root, 8);
        for v in [5u64, 1, 9, 3] {
            tree.insert(&k(v), payload(v, 16)).unwrap();
        }
        assert_eq!(tree.search(&k(3)).unwrap(), Some(payload(3, 16)));
        assert_eq!(tree.search(&k(4)).unwrap(), None);
        tree.check_invariants().unwrap();
    }

    #[test]
    fn test_replace_existing_key() {
        let mut store = MemStore::new();
        let root = new_tree(&mut store);
        let mut tree = BTree::new(&mut store, root, 8);
        tree.insert(&k(1), payload(1, 8)).unwrap();
        tree.insert(&k(1), payload(2, 8)).unwrap();
        assert_eq!(tree.search(&k(1)).unwrap(), Some(payload(2, 8)));
        let mut cursor = tree.cursor_first().unwrap();
        let mut count = 0;
        while tree.cursor_next(&mut cursor).unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 1);
    }

    #[test]
    fn test_split_and_iterate_in_order() {
        let mut store = MemStore::new();
        let root = new_tree(&mut store);
        let mut tree = BTree::new(&mut store, root, 8);
        // Large payloads force splits after a handful of inserts.
        for v in 0..200u64 {
            let v = (v * 97) % 200; // scrambled insert order
            tree.insert(&k(v), payload(v, 256)).unwrap();
        }
        tree.check_invariants().unwrap();

        let mut cursor = tree.cursor_first().unwrap();
        let mut seen = Vec::new();
        while let Some(cell) = tree.cursor_next(&mut cursor).unwrap() {
            seen.push(key::decode_row_id(&cell.key).unwrap());
        }
        assert_eq!(seen, (0..200).collect::<Vec<_>>());
    }

    #[test]
    fn test_seek_cursor() {
        let mut store = MemStore::new();
        let root = new_tree(&mut store);
        let mut tree = BTree::new(&mut store, root, 8);
        for v in (0..100u64).map(|v| v * 2) {
            tree.insert(&k(v), payload(v, 128)).unwrap();
        }
        // Seek to an absent key lands on the next present one.
        let mut cursor = tree.cursor_seek(&k(31)).unwrap();
        let cell = tree.cursor_next(&mut cursor).unwrap().unwrap();
        assert_eq!(key::decode_row_id(&cell.key).unwrap(), 32);
    }

    #[test]
    fn test_delete_to_empty_and_reuse() {
        let mut store = MemStore::new();
        let root = new_tree(&mut store);
        let mut tree = BTree::new(&mut store, root, 8);
        for v in 0..300u64 {
            tree.insert(&k(v), payload(v, 200)).unwrap();
        }
        tree.check_invariants().unwrap();
        for v in 0..300u64 {
            assert!(tree.delete(&k(v)).unwrap(), "missing key {}", v);
            if v % 37 == 0 {
                tree.check_invariants().unwrap();
            }
        }
        tree.check_invariants().unwrap();
        assert_eq!(tree.max_key().unwrap(), None);
        assert!(!tree.delete(&k(0)).unwrap());

        // The collapsed tree is usable again.
        tree.insert(&k(7), payload(7, 64)).unwrap();
        assert_eq!(tree.search(&k(7)).unwrap(), Some(payload(7, 64)));
    }

    #[test]
    fn test_delete_descending_rebalances() {
        let mut store = MemStore::new();
        let root = new_tree(&mut store);
        let mut tree = BTree::new(&mut store, root, 8);
        for v in 0..400u64 {
            tree.insert(&k(v), payload(v, 150)).unwrap();
        }
        for v in (100..400u64).rev() {
            assert!(tree.delete(&k(v)).unwrap());
            if v % 50 == 0 {
                tree.check_invariants().unwrap();
            }
        }
        tree.check_invariants().unwrap();
        assert_eq!(
            tree.max_key()
                .unwrap()
                .map(|m| key::decode_row_id(&m).unwrap()),
            Some(99)
        );
    }

    #[test]
    fn test_contains_prefix() {
        let mut store = MemStore::new();
        let root = new_tree(&mut store);
        let mut tree = BTree::new(&mut store, root, 32);
        let kinds = [DataType::Varchar(10)];
        let full =
            key::encode_index_key(&kinds, &[Value::Text("bob".into())], 42).unwrap();
        tree.insert(&full, Vec::new()).unwrap();

        let hit = key::encode_index_prefix(&kinds, &[Value::Text("bob".into())]).unwrap();
        let miss = key::encode_index_prefix(&kinds, &[Value::Text("alice".into())]).unwrap();
        assert!(tree.contains_prefix(&hit).unwrap());
        assert!(!tree.contains_prefix(&miss).unwrap());
    }

    #[test]
    fn test_free_all_releases_every_page() {
        let mut store = MemStore::new();
        let root = new_tree(&mut store);
        let mut tree = BTree::new(&mut store, root, 8);
        for v in 0..200u64 {
            tree.insert(&k(v), payload(v, 300)).unwrap();
        }
        tree.free_all().unwrap();
        assert_eq!(store.live_pages(), 0);
    }

    #[test]
    fn test_max_key() {
        let mut store = MemStore::new();
        let root = new_tree(&mut store);
        let mut tree = BTree::new(&mut store, root, 8);
        assert_eq!(tree.max_key().unwrap(), None);
        for v in 0..50u64 {
            tree.insert(&k(v), payload(v, 100)).unwrap();
        }
        assert_eq!(tree.max_key().unwrap(), Some(k(49)));
    }

    #[test]
    fn test_cancellation_surfaces() {
        let mut store = MemStore::new();
        let root = new_tree(&mut store);
        {
            let mut tree = BTree::new(&mut store, root, 8);
            tree.insert(&k(1), payload(1, 8)).unwrap();
        }
        store.cancel_token().cancel();
        let mut tree = BTree::new(&mut store, root, 8);
        assert!(matches!(
            tree.search(&k(1)),
            Err(crate::error::Error::Cancelled)
        ));
    }
}
