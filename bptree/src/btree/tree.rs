//! B+Tree engine over `u64` keys and byte values.
//!
//! Index nodes store, for every child, the largest key reachable through that
//! child. Lookups descend into the first child whose key is at least the
//! target (or the last child), so the rightmost path also absorbs keys larger
//! than anything stored so far.
//!
//! Structural changes are iterative:
//!
//! - A node holding more than `order` keys after an insert is split, and the
//!   split walks up the parent chain until a parent has room, growing a new
//!   root when it passes the old one.
//! - A non-root node holding fewer than `order / 2` keys after a delete
//!   borrows an entry from a sibling or merges into one, and the fix-up walks
//!   up the path recorded during descent.
//!
//! # Invariants (after every completed operation)
//!
//! - Keys within a node are strictly ascending
//! - No node holds more than `order` keys; no non-root node fewer than `order / 2`
//! - `keys[i]` of an index node equals the maximum key under `children[i]`
//! - Every child's `parent` is the index node that lists it
//! - Nodes on the same floor form a doubly linked `next`/`prev` chain in key order

use std::fmt;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

use crate::btree::node::{Node, NodeError};
use crate::btree::node_pool::{NodePool, PooledNode};
use crate::btree::recovery;
use crate::btree::store::NodeStore;
use crate::config::{ConfigError, TreeConfig};
use crate::storage::allocator::FreeSpaceAllocator;
use crate::storage::file::{FileError, TreeFile};
use crate::storage::page::{INVALID_OFFSET, Offset, PageGeometry};

/// Error type for tree operations.
#[derive(Debug)]
pub enum TreeError {
    /// `insert` found the key already present.
    KeyAlreadyExists(u64),
    /// The key is not in the tree.
    KeyNotFound(u64),
    /// The file does not hold a well-formed tree.
    InvalidFormat(String),
    /// A value longer than `u32::MAX` bytes.
    ValueTooLarge(usize),
    /// File I/O error.
    File(FileError),
    /// Node decoding error.
    Node(NodeError),
    /// Invalid configuration.
    Config(ConfigError),
}

impl fmt::Display for TreeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KeyAlreadyExists(key) => write!(f, "key {key} already exists"),
            Self::KeyNotFound(key) => write!(f, "key {key} not found"),
            Self::InvalidFormat(message) => write!(f, "invalid tree format: {message}"),
            Self::ValueTooLarge(len) => {
                write!(f, "value of {len} bytes exceeds the maximum of {} bytes", u32::MAX)
            }
            Self::File(e) => write!(f, "file error: {e}"),
            Self::Node(e) => write!(f, "node error: {e}"),
            Self::Config(e) => write!(f, "config error: {e}"),
        }
    }
}

impl std::error::Error for TreeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::File(e) => Some(e),
            Self::Node(e) => Some(e),
            Self::Config(e) => Some(e),
            _ => None,
        }
    }
}

impl From<FileError> for TreeError {
    fn from(e: FileError) -> Self {
        Self::File(e)
    }
}

impl From<NodeError> for TreeError {
    fn from(e: NodeError) -> Self {
        Self::Node(e)
    }
}

impl From<ConfigError> for TreeError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<io::Error> for TreeError {
    fn from(e: io::Error) -> Self {
        Self::File(FileError::Io(e))
    }
}

/// Point-in-time counters describing a tree and its file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeStats {
    /// Logical file size in bytes.
    pub file_size: u64,
    /// Index pages on the allocator's free list.
    pub free_index_pages: usize,
    /// Data pages on the allocator's free list.
    pub free_data_pages: usize,
    /// Number of floors; 0 for an empty tree.
    pub height: usize,
    /// Offset of the root node, `INVALID_OFFSET` for an empty tree.
    pub root: Offset,
}

/// A persistent B+Tree stored in a single file.
#[derive(Debug)]
pub struct BPlusTree {
    store: NodeStore,
    root: Offset,
    order: usize,
}

impl BPlusTree {
    /// Open (or create) the tree at `path` with the default configuration.
    pub fn open(path: &Path) -> Result<Self, TreeError> {
        Self::open_with_config(path, &TreeConfig::default())
    }

    /// Open (or create) the tree at `path`.
    ///
    /// An empty file is a fresh tree. Otherwise the root is located and the
    /// free lists are rebuilt by scanning the file.
    pub fn open_with_config(path: &Path, config: &TreeConfig) -> Result<Self, TreeError> {
        Self::open_with_pool(path, config, NodePool::new(config.pool_capacity))
    }

    /// Open the tree at `path`, drawing nodes from a pool shared with other trees.
    pub fn open_with_pool(
        path: &Path,
        config: &TreeConfig,
        pool: Arc<NodePool>,
    ) -> Result<Self, TreeError> {
        config.validate()?;

        let file = TreeFile::open(path)?;
        let geometry = PageGeometry::new(
            config.index_page_size,
            config.data_page_size,
            file.block_size()?,
        );
        let file_len = file.len()?;
        let allocator = FreeSpaceAllocator::new(geometry, file_len, config.max_free_blocks);
        let mut store = NodeStore::new(file, allocator, geometry, pool);

        let root = if file_len == 0 {
            INVALID_OFFSET
        } else {
            let root = recovery::locate_root(&store)?;
            recovery::rebuild_free_lists(&mut store, config.max_free_blocks)?;
            root
        };

        tracing::info!(
            "opened {} ({file_len} bytes, root {root:#x}, order {})",
            path.display(),
            config.order
        );

        Ok(Self {
            store,
            root,
            order: config.order,
        })
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.store.file().path()
    }

    /// Maximum number of keys per node.
    #[must_use]
    pub const fn order(&self) -> usize {
        self.order
    }

    /// Look up the value stored under `key`.
    pub fn find(&self, key: u64) -> Result<Vec<u8>, TreeError> {
        if self.root == INVALID_OFFSET {
            return Err(TreeError::KeyNotFound(key));
        }

        let leaf = self.descend(key, &mut Vec::new())?;
        match leaf.search(key) {
            Ok(index) => Ok(leaf.records[index].clone()),
            Err(_) => Err(TreeError::KeyNotFound(key)),
        }
    }

    /// Insert `value` under a key that must not exist yet.
    pub fn insert(&mut self, key: u64, value: &[u8]) -> Result<(), TreeError> {
        self.insert_or_update_with(key, |existing| match existing {
            Some(_) => Err(TreeError::KeyAlreadyExists(key)),
            None => Ok(value.to_vec()),
        })
    }

    /// Replace the value of an existing key.
    pub fn update(&mut self, key: u64, value: &[u8]) -> Result<(), TreeError> {
        self.insert_or_update_with(key, |existing| match existing {
            Some(_) => Ok(value.to_vec()),
            None => Err(TreeError::KeyNotFound(key)),
        })
    }

    /// Store `value` under `key`, overwriting any existing value.
    pub fn insert_or_update(&mut self, key: u64, value: &[u8]) -> Result<(), TreeError> {
        self.insert_or_update_with(key, |_| Ok(value.to_vec()))
    }

    /// Store the value computed by `combine` under `key`.
    ///
    /// `combine` receives the current value (`None` when the key is absent)
    /// and returns the value to store. An error from `combine` is returned
    /// unchanged and leaves the tree untouched.
    pub fn insert_or_update_with<F>(&mut self, key: u64, combine: F) -> Result<(), TreeError>
    where
        F: FnOnce(Option<&[u8]>) -> Result<Vec<u8>, TreeError>,
    {
        if self.root == INVALID_OFFSET {
            let value = check_value_len(combine(None)?)?;
            let mut leaf = self.store.new_data_node()?;
            leaf.keys.push(key);
            leaf.records.push(value);
            self.store.flush(&mut leaf)?;
            self.root = leaf.self_offset;
            tracing::debug!("created root leaf at {}", self.root);
            return Ok(());
        }

        let mut leaf = self.descend(key, &mut Vec::new())?;
        match leaf.search(key) {
            Ok(index) => {
                let value = check_value_len(combine(Some(&leaf.records[index]))?)?;
                leaf.records[index] = value;
                self.store.flush(&mut leaf)
            }
            Err(index) => {
                let value = check_value_len(combine(None)?)?;
                leaf.keys.insert(index, key);
                leaf.records.insert(index, value);

                if leaf.len() > self.order {
                    return self.split(leaf);
                }
                self.store.flush(&mut leaf)?;
                if index + 1 == leaf.len() {
                    self.propagate_max(&leaf)?;
                }
                Ok(())
            }
        }
    }

    /// Remove `key` and its value.
    pub fn delete(&mut self, key: u64) -> Result<(), TreeError> {
        if self.root == INVALID_OFFSET {
            return Err(TreeError::KeyNotFound(key));
        }

        let mut path = Vec::new();
        let mut leaf = self.descend(key, &mut path)?;
        let Ok(index) = leaf.search(key) else {
            return Err(TreeError::KeyNotFound(key));
        };
        leaf.keys.remove(index);
        leaf.records.remove(index);

        if index == leaf.len() && !leaf.is_empty() && leaf.self_offset != self.root {
            self.propagate_max(&leaf)?;
        }
        self.rebalance(leaf, path)
    }

    /// Flush file contents to disk.
    pub fn sync(&self) -> Result<(), TreeError> {
        Ok(self.store.file().sync()?)
    }

    /// Sync and close the tree.
    pub fn close(self) -> Result<(), TreeError> {
        let result = self.sync();
        tracing::info!("closed {}", self.path().display());
        result
    }

    /// Forward cursor over all entries in key order.
    #[must_use]
    pub const fn iter(&self) -> TreeCursor<'_> {
        TreeCursor {
            tree: self,
            leaf: None,
            index: 0,
            started: false,
        }
    }

    /// Number of entries, counted by walking the leaf chain.
    pub fn len(&self) -> Result<usize, TreeError> {
        let mut count = 0;
        let mut offset = self.leftmost_leaf()?;
        while offset != INVALID_OFFSET {
            let leaf = self.store.checkout(offset)?;
            count += leaf.len();
            offset = leaf.next;
        }
        Ok(count)
    }

    /// Whether the tree holds no entries.
    pub fn is_empty(&self) -> Result<bool, TreeError> {
        if self.root == INVALID_OFFSET {
            return Ok(true);
        }
        let root = self.store.checkout(self.root)?;
        Ok(root.is_leaf && root.is_empty())
    }

    /// File size, free-list lengths, height and root offset.
    pub fn stats(&self) -> Result<TreeStats, TreeError> {
        let allocator = self.store.allocator();
        Ok(TreeStats {
            file_size: allocator.file_size(),
            free_index_pages: allocator.free_index_pages().len(),
            free_data_pages: allocator.free_data_pages().len(),
            height: self.height()?,
            root: self.root,
        })
    }

    /// Keys of every node, floor by floor from the root down.
    pub fn levels(&self) -> Result<Vec<Vec<Vec<u64>>>, TreeError> {
        let mut floors = Vec::new();
        if self.root == INVALID_OFFSET {
            return Ok(floors);
        }

        let mut current = vec![self.root];
        while !current.is_empty() {
            let mut floor = Vec::with_capacity(current.len());
            let mut below = Vec::new();
            for offset in current {
                let node = self.store.checkout(offset)?;
                floor.push(node.keys.clone());
                if !node.is_leaf {
                    below.extend_from_slice(&node.children);
                }
            }
            floors.push(floor);
            current = below;
        }
        Ok(floors)
    }

    /// Write a level-order dump of the keys, one line per floor.
    pub fn debug_print(&self, out: &mut impl Write) -> Result<(), TreeError> {
        for (floor, nodes) in self.levels()?.iter().enumerate() {
            let nodes: Vec<String> = nodes.iter().map(|keys| format!("{keys:?}")).collect();
            writeln!(out, "floor {floor:>3}: {}", nodes.join(", "))?;
        }
        Ok(())
    }

    /// Descend from the root to the leaf responsible for `key`, recording
    /// the offsets of the index nodes passed on the way.
    fn descend(&self, key: u64, path: &mut Vec<Offset>) -> Result<PooledNode, TreeError> {
        let mut node = self.store.checkout(self.root)?;
        loop {
            if !node.active {
                return Err(TreeError::InvalidFormat(format!(
                    "inactive page {} reached from the root",
                    node.self_offset
                )));
            }
            if node.is_leaf {
                return Ok(node);
            }
            if node.children.is_empty() {
                return Err(TreeError::InvalidFormat(format!(
                    "index page {} has no children",
                    node.self_offset
                )));
            }

            path.push(node.self_offset);
            let child = node.children[node.child_index_for(key)];
            node = self.store.checkout(child)?;
        }
    }

    fn leftmost_leaf(&self) -> Result<Offset, TreeError> {
        if self.root == INVALID_OFFSET {
            return Ok(INVALID_OFFSET);
        }
        Ok(self.descend(0, &mut Vec::new())?.self_offset)
    }

    fn height(&self) -> Result<usize, TreeError> {
        if self.root == INVALID_OFFSET {
            return Ok(0);
        }
        let mut path = Vec::new();
        self.descend(0, &mut path)?;
        Ok(path.len() + 1)
    }

    /// Push `node`'s maximum key into its ancestors.
    ///
    /// Walks up while the updated entry is its parent's last one, since only
    /// then does the parent's own maximum change too.
    fn propagate_max(&mut self, node: &Node) -> Result<(), TreeError> {
        let Some(max) = node.max_key() else {
            return Ok(());
        };
        let mut child = node.self_offset;
        let mut parent_offset = node.parent;

        while parent_offset != INVALID_OFFSET {
            let mut parent = self.store.checkout(parent_offset)?;
            let position = parent
                .position_of_child(child)
                .ok_or_else(|| orphan_error(child, parent_offset))?;
            if parent.keys[position] == max {
                break;
            }
            parent.keys[position] = max;
            self.store.flush(&mut parent)?;

            if position + 1 != parent.len() {
                break;
            }
            child = parent.self_offset;
            parent_offset = parent.parent;
        }
        Ok(())
    }

    /// Split the overfull `node`, and every ancestor that overflows in turn.
    fn split(&mut self, mut node: PooledNode) -> Result<(), TreeError> {
        loop {
            // ceil((order + 1) / 2) keys stay on the left.
            let at = (self.order + 2) / 2;
            let mut right = if node.is_leaf {
                self.store.new_data_node()?
            } else {
                self.store.new_index_node()?
            };
            node.split_into(&mut right, at);
            let (left_max, right_max) = match (node.max_key(), right.max_key()) {
                (Some(left), Some(right)) => (left, right),
                _ => {
                    return Err(TreeError::InvalidFormat(format!(
                        "split of node {} left an empty half",
                        node.self_offset
                    )));
                }
            };

            right.prev = node.self_offset;
            right.next = node.next;
            if node.next != INVALID_OFFSET {
                let mut next = self.store.checkout(node.next)?;
                next.prev = right.self_offset;
                self.store.flush(&mut next)?;
            }
            node.next = right.self_offset;

            let mut parent = if node.parent == INVALID_OFFSET {
                let mut root = self.store.new_index_node()?;
                root.keys.push(left_max);
                root.children.push(node.self_offset);
                node.parent = root.self_offset;
                self.root = root.self_offset;
                tracing::debug!("new root {} above {}", root.self_offset, node.self_offset);
                root
            } else {
                self.store.checkout(node.parent)?
            };
            let position = parent
                .position_of_child(node.self_offset)
                .ok_or_else(|| orphan_error(node.self_offset, parent.self_offset))?;
            parent.keys[position] = left_max;
            parent.keys.insert(position + 1, right_max);
            parent.children.insert(position + 1, right.self_offset);
            right.parent = parent.self_offset;

            if !right.is_leaf {
                for &child in &right.children {
                    let mut child = self.store.checkout(child)?;
                    child.parent = right.self_offset;
                    self.store.flush(&mut child)?;
                }
            }
            self.store.flush(&mut node)?;
            self.store.flush(&mut right)?;
            tracing::debug!(
                "split {} at {at}: {} keys stay, {} move to {}",
                node.self_offset,
                node.len(),
                right.len(),
                right.self_offset
            );

            if parent.len() <= self.order {
                self.store.flush(&mut parent)?;
                return self.propagate_max(&parent);
            }
            node = parent;
        }
    }

    /// Restore the minimum fill of `node` after a removal, walking up `path`.
    fn rebalance(&mut self, mut node: PooledNode, mut path: Vec<Offset>) -> Result<(), TreeError> {
        let min = self.order / 2;
        loop {
            if node.self_offset == self.root {
                if !node.is_leaf && node.len() == 1 {
                    return self.collapse_root(&node);
                }
                return self.store.flush(&mut node);
            }
            if node.len() >= min {
                return self.store.flush(&mut node);
            }

            let parent_offset = path.pop().unwrap_or(INVALID_OFFSET);
            if parent_offset != node.parent {
                return Err(TreeError::InvalidFormat(format!(
                    "node {} lists parent {} but was reached from {parent_offset}",
                    node.self_offset, node.parent
                )));
            }

            let mut next = self.checkout_sibling(node.next)?;
            let mut prev = self.checkout_sibling(node.prev)?;

            if let Some(next) = next.as_mut().filter(|next| next.len() > min) {
                self.borrow_from_next(&mut node, next)?;
                return Ok(());
            }
            if let Some(prev) = prev.as_mut().filter(|prev| prev.len() > min) {
                self.borrow_from_prev(&mut node, prev)?;
                return Ok(());
            }

            if let Some(mut next) = next {
                self.merge_into_next(&mut node, &mut next, prev.as_deref_mut())?;
            } else if let Some(mut prev) = prev {
                self.merge_into_prev(&mut node, &mut prev)?;
            } else {
                return Err(TreeError::InvalidFormat(format!(
                    "non-root node {} has no siblings",
                    node.self_offset
                )));
            }
            self.store.release(&node)?;

            let mut parent = self.store.checkout(parent_offset)?;
            let position = parent
                .position_of_child(node.self_offset)
                .ok_or_else(|| orphan_error(node.self_offset, parent_offset))?;
            parent.keys.remove(position);
            parent.children.remove(position);
            if position == parent.len() && !parent.is_empty() && parent.self_offset != self.root {
                self.store.flush(&mut parent)?;
                self.propagate_max(&parent)?;
            }
            node = parent;
        }
    }

    fn checkout_sibling(&self, offset: Offset) -> Result<Option<PooledNode>, TreeError> {
        if offset == INVALID_OFFSET {
            return Ok(None);
        }
        self.store.checkout(offset).map(Some)
    }

    fn borrow_from_next(&mut self, node: &mut Node, next: &mut Node) -> Result<(), TreeError> {
        node.keys.push(next.keys.remove(0));
        if node.is_leaf {
            node.records.push(next.records.remove(0));
        } else {
            let child = next.children.remove(0);
            node.children.push(child);
            self.reparent(child, node.self_offset)?;
        }
        tracing::debug!("node {} borrowed from next {}", node.self_offset, next.self_offset);

        self.store.flush(next)?;
        self.store.flush(node)?;
        self.propagate_max(node)
    }

    fn borrow_from_prev(&mut self, node: &mut Node, prev: &mut Node) -> Result<(), TreeError> {
        let key = prev.keys.pop().ok_or_else(|| empty_sibling_error(prev.self_offset))?;
        node.keys.insert(0, key);
        if node.is_leaf {
            let record = prev
                .records
                .pop()
                .ok_or_else(|| empty_sibling_error(prev.self_offset))?;
            node.records.insert(0, record);
        } else {
            let child = prev
                .children
                .pop()
                .ok_or_else(|| empty_sibling_error(prev.self_offset))?;
            node.children.insert(0, child);
            self.reparent(child, node.self_offset)?;
        }
        tracing::debug!("node {} borrowed from prev {}", node.self_offset, prev.self_offset);

        self.store.flush(prev)?;
        self.store.flush(node)?;
        self.propagate_max(prev)?;
        self.propagate_max(node)
    }

    /// Move all of `node`'s entries to the front of `next` and unlink `node`.
    fn merge_into_next(
        &mut self,
        node: &mut Node,
        next: &mut Node,
        prev: Option<&mut Node>,
    ) -> Result<(), TreeError> {
        if !node.is_leaf {
            for &child in &node.children {
                self.reparent(child, next.self_offset)?;
            }
        }
        // node ++ next, then hand the combined entries to next.
        node.absorb(next);
        std::mem::swap(&mut next.keys, &mut node.keys);
        std::mem::swap(&mut next.records, &mut node.records);
        std::mem::swap(&mut next.children, &mut node.children);

        next.prev = node.prev;
        if let Some(prev) = prev {
            prev.next = next.self_offset;
            self.store.flush(prev)?;
        }
        tracing::debug!("merged {} into next {}", node.self_offset, next.self_offset);
        self.store.flush(next)
    }

    /// Append all of `node`'s entries to `prev` and unlink `node`.
    fn merge_into_prev(&mut self, node: &mut Node, prev: &mut Node) -> Result<(), TreeError> {
        if !node.is_leaf {
            for &child in &node.children {
                self.reparent(child, prev.self_offset)?;
            }
        }
        prev.absorb(node);
        prev.next = node.next;
        tracing::debug!("merged {} into prev {}", node.self_offset, prev.self_offset);

        self.store.flush(prev)?;
        self.propagate_max(prev)
    }

    /// Replace a single-child index root with its child.
    fn collapse_root(&mut self, root: &Node) -> Result<(), TreeError> {
        let mut child = self.store.checkout(root.children[0])?;
        child.parent = INVALID_OFFSET;
        child.next = INVALID_OFFSET;
        child.prev = INVALID_OFFSET;
        self.store.flush(&mut child)?;
        self.store.release(root)?;
        self.root = child.self_offset;
        tracing::debug!("root collapsed from {} to {}", root.self_offset, self.root);
        Ok(())
    }

    fn reparent(&mut self, child: Offset, parent: Offset) -> Result<(), TreeError> {
        let mut child = self.store.checkout(child)?;
        child.parent = parent;
        self.store.flush(&mut child)
    }
}

fn check_value_len(value: Vec<u8>) -> Result<Vec<u8>, TreeError> {
    if value.len() as u64 > u64::from(u32::MAX) {
        return Err(TreeError::ValueTooLarge(value.len()));
    }
    Ok(value)
}

fn empty_sibling_error(offset: Offset) -> TreeError {
    TreeError::InvalidFormat(format!("sibling {offset} has no entry to lend"))
}

fn orphan_error(child: Offset, parent: Offset) -> TreeError {
    TreeError::InvalidFormat(format!("node {child} is not listed by its parent {parent}"))
}

/// Forward cursor over a tree's entries in key order.
pub struct TreeCursor<'a> {
    tree: &'a BPlusTree,
    leaf: Option<PooledNode>,
    index: usize,
    started: bool,
}

impl TreeCursor<'_> {
    /// Get the next entry.
    pub fn next_entry(&mut self) -> Result<Option<(u64, Vec<u8>)>, TreeError> {
        if !self.started {
            self.started = true;
            let first = self.tree.leftmost_leaf()?;
            if first != INVALID_OFFSET {
                self.leaf = Some(self.tree.store.checkout(first)?);
            }
        }

        loop {
            let Some(leaf) = &self.leaf else {
                return Ok(None);
            };

            if self.index < leaf.len() {
                let entry = (leaf.keys[self.index], leaf.records[self.index].clone());
                self.index += 1;
                return Ok(Some(entry));
            }

            let next = leaf.next;
            self.index = 0;
            self.leaf = None;
            if next != INVALID_OFFSET {
                self.leaf = Some(self.tree.store.checkout(next)?);
            }
        }
    }
}

impl<'a> IntoIterator for &'a BPlusTree {
    type Item = Result<(u64, Vec<u8>), TreeError>;
    type IntoIter = TreeCursor<'a>;

    fn into_iter(self) -> TreeCursor<'a> {
        self.iter()
    }
}

impl Iterator for TreeCursor<'_> {
    type Item = Result<(u64, Vec<u8>), TreeError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry().transpose()
    }
}
