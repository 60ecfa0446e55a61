//! Node I/O on top of the tree file.
//!
//! `NodeStore` owns the file, the free-space allocator and the node pool, and
//! is the only place that turns nodes into bytes on disk and back:
//!
//! - `checkout` loads a node (following its Extend page) into a pooled node
//! - `flush` writes a node back, splitting an oversized leaf across an Extend
//!   page and resizing or freeing that page as the leaf changes
//! - `new_index_node` / `new_data_node` allocate pages for new nodes
//! - `release` returns a node's pages to the allocator
//!
//! Every free page starts with a record the recovery scan can parse: either
//! zeroes (never written) or an inactive marker written here. The marker's
//! type always matches the free list the page sits in, so the scan strides
//! over it by the right amount.

// Page sizes are small powers of two; they fit in usize.
#![allow(clippy::cast_possible_truncation)]

use std::sync::Arc;

use crate::btree::node::{LEN_PREFIX_SIZE, Node, NodeError};
use crate::btree::node_pool::{NodePool, PooledNode};
use crate::btree::overflow::plan_extend_split;
use crate::btree::tree::TreeError;
use crate::storage::allocator::FreeSpaceAllocator;
use crate::storage::file::TreeFile;
use crate::storage::page::{INVALID_OFFSET, Offset, PageGeometry, PageType};

/// What the recovery scan found at an offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotHeader {
    /// Zero length prefix: the slot was never written.
    Unwritten,
    /// A page record.
    Page {
        active: bool,
        page_type: PageType,
        parent: Offset,
        /// Bytes the page occupies on disk.
        footprint: u64,
    },
}

/// Loads, writes, allocates and frees nodes.
#[derive(Debug)]
pub struct NodeStore {
    file: TreeFile,
    allocator: FreeSpaceAllocator,
    geometry: PageGeometry,
    pool: Arc<NodePool>,
}

impl NodeStore {
    #[must_use]
    pub const fn new(
        file: TreeFile,
        allocator: FreeSpaceAllocator,
        geometry: PageGeometry,
        pool: Arc<NodePool>,
    ) -> Self {
        Self {
            file,
            allocator,
            geometry,
            pool,
        }
    }

    #[must_use]
    pub const fn file(&self) -> &TreeFile {
        &self.file
    }

    #[must_use]
    pub const fn geometry(&self) -> &PageGeometry {
        &self.geometry
    }

    #[must_use]
    pub const fn allocator(&self) -> &FreeSpaceAllocator {
        &self.allocator
    }

    pub const fn allocator_mut(&mut self) -> &mut FreeSpaceAllocator {
        &mut self.allocator
    }

    #[must_use]
    pub const fn pool(&self) -> &Arc<NodePool> {
        &self.pool
    }

    /// Check out a node: fresh for `INVALID_OFFSET`, otherwise loaded from disk.
    pub fn checkout(&self, offset: Offset) -> Result<PooledNode, TreeError> {
        let mut node = self.pool.checkout();
        if offset != INVALID_OFFSET {
            self.read_node(offset, &mut node)?;
        }
        Ok(node)
    }

    /// Allocate an index page and return an active, empty index node for it.
    pub fn new_index_node(&mut self) -> Result<PooledNode, TreeError> {
        let offset = self.allocator.alloc_index_page();
        self.sync_allocation()?;

        let mut node = self.pool.checkout();
        node.active = true;
        node.page_type = PageType::Index;
        node.self_offset = offset;
        Ok(node)
    }

    /// Allocate a data page and return an active, empty leaf for it.
    pub fn new_data_node(&mut self) -> Result<PooledNode, TreeError> {
        let offset = self.allocator.alloc_data_page();
        self.sync_allocation()?;

        let mut node = self.pool.checkout();
        node.active = true;
        node.page_type = PageType::Data;
        node.is_leaf = true;
        node.self_offset = offset;
        Ok(node)
    }

    /// Write `node` at its offset.
    ///
    /// A leaf that does not fit in one data page keeps its leading entries in
    /// the data page and the rest in an Extend page. `node` is updated with
    /// the Extend page it ends up chained to, if any.
    pub fn flush(&mut self, node: &mut Node) -> Result<(), TreeError> {
        match node.page_type {
            PageType::Index => {
                let capacity = self.geometry.index_page_size() as usize;
                let buf = node
                    .encode(capacity)
                    .map_err(|_| NodeError::IndexPageOverflow {
                        offset: node.self_offset,
                        len: node.encoded_len(),
                    })?;
                self.write(&buf, node.self_offset)
            }
            PageType::Data => self.flush_leaf(node),
            PageType::Extend => Err(TreeError::InvalidFormat(format!(
                "extend page at {} flushed directly",
                node.self_offset
            ))),
        }
    }

    /// Mark `node`'s page (and its Extend page) inactive and free them.
    ///
    /// Freeing an index page may merge it with free neighbours into a data
    /// page, which is re-marked before returning.
    pub fn release(&mut self, node: &Node) -> Result<(), TreeError> {
        if node.extend_page != INVALID_OFFSET {
            self.free_extend(node.extend_page, node.extend_pages)?;
        }

        self.write_marker(node.page_type, node.self_offset)?;
        match node.page_type {
            PageType::Index => self.allocator.free_index_page(node.self_offset),
            PageType::Data => self.allocator.free_data_page(node.self_offset),
            PageType::Extend => self
                .allocator
                .free_extend_pages(node.self_offset, node.extend_pages),
        }
        self.sync_allocation()
    }

    /// Read the record at `offset` without following its Extend page.
    pub fn read_header(&self, offset: Offset, node: &mut Node) -> Result<SlotHeader, TreeError> {
        let Some(body) = self.read_body(offset)? else {
            return Ok(SlotHeader::Unwritten);
        };
        node.decode(&body)?;
        self.check_budget(offset, node.page_type, body.len())?;

        let footprint = if node.page_type == PageType::Extend {
            let pages = self
                .geometry
                .extend_pages_for((LEN_PREFIX_SIZE + body.len()) as u64);
            self.geometry.footprint(PageType::Extend, pages)
        } else {
            self.geometry.footprint(node.page_type, 0)
        };

        Ok(SlotHeader::Page {
            active: node.active,
            page_type: node.page_type,
            parent: node.parent,
            footprint,
        })
    }

    /// Grow the physical file to the allocator's size and write the markers
    /// the allocator queued for slots that changed granularity.
    pub fn sync_allocation(&mut self) -> Result<(), TreeError> {
        self.file.grow_to(self.allocator.file_size())?;
        for (offset, page_type) in self.allocator.take_pending_markers() {
            self.write_marker(page_type, offset)?;
        }
        Ok(())
    }

    fn flush_leaf(&mut self, node: &mut Node) -> Result<(), TreeError> {
        let data_page_size = self.geometry.data_page_size() as usize;
        let old_extend = node.extend_page;
        let old_pages = node.extend_pages;

        node.extend_page = INVALID_OFFSET;
        if let Ok(buf) = node.encode(data_page_size) {
            self.write(&buf, node.self_offset)?;
            node.extend_pages = 0;
            if old_extend != INVALID_OFFSET {
                tracing::debug!(
                    "leaf {} fits its data page again, freeing extend page {old_extend}",
                    node.self_offset
                );
                self.free_extend(old_extend, old_pages)?;
            }
            return Ok(());
        }

        let plan = plan_extend_split(node, &self.geometry);
        let extend = if old_extend != INVALID_OFFSET && old_pages == plan.pages {
            old_extend
        } else {
            if old_extend != INVALID_OFFSET {
                self.free_extend(old_extend, old_pages)?;
            }
            let offset = self.allocator.alloc_extend_pages(plan.pages);
            self.sync_allocation()?;
            tracing::debug!(
                "leaf {} moved to extend page {offset} ({} data pages)",
                node.self_offset,
                plan.pages
            );
            offset
        };

        let mut tail = self.pool.checkout();
        tail.active = true;
        tail.page_type = PageType::Extend;
        tail.is_leaf = true;
        tail.self_offset = extend;
        tail.parent = node.self_offset;
        node.split_into(&mut tail, plan.head);
        node.extend_page = extend;
        node.extend_pages = plan.pages;

        let extent = (plan.pages * self.geometry.data_page_size()) as usize;
        let tail_buf = tail.encode(extent);
        let head_buf = node.encode(data_page_size);
        node.absorb(&mut tail);

        let (Ok(tail_buf), Ok(head_buf)) = (tail_buf, head_buf) else {
            return Err(TreeError::InvalidFormat(format!(
                "leaf {} does not fit its data page and extend page",
                node.self_offset
            )));
        };
        self.write(&tail_buf, extend)?;
        self.write(&head_buf, node.self_offset)
    }

    fn free_extend(&mut self, offset: Offset, pages: u64) -> Result<(), TreeError> {
        let data_page_size = self.geometry.data_page_size();
        for page in 0..pages.max(1) {
            self.write_marker(PageType::Data, offset + page * data_page_size)?;
        }
        self.allocator.free_extend_pages(offset, pages);
        Ok(())
    }

    fn write_marker(&self, page_type: PageType, offset: Offset) -> Result<(), TreeError> {
        let mut marker = self.pool.checkout();
        marker.mark_inactive(page_type, offset);
        let buf = marker
            .encode(usize::MAX)
            .map_err(|_| TreeError::InvalidFormat(format!("marker at {offset} does not encode")))?;
        self.write(&buf, offset)
    }

    fn write(&self, buf: &[u8], offset: Offset) -> Result<(), TreeError> {
        Ok(self.file.write_at(buf, offset)?)
    }

    fn read_node(&self, offset: Offset, node: &mut Node) -> Result<(), TreeError> {
        let body = self
            .read_body(offset)?
            .ok_or_else(|| TreeError::InvalidFormat(format!("no page at offset {offset}")))?;
        node.decode(&body)?;
        self.check_budget(offset, node.page_type, body.len())?;
        if node.self_offset != offset {
            return Err(TreeError::InvalidFormat(format!(
                "page at {offset} claims to live at {}",
                node.self_offset
            )));
        }

        if node.active && node.is_leaf && node.extend_page != INVALID_OFFSET {
            let extend = node.extend_page;
            let body = self.read_body(extend)?.ok_or_else(|| {
                TreeError::InvalidFormat(format!("missing extend page {extend} of leaf {offset}"))
            })?;

            let mut tail = self.pool.checkout();
            tail.decode(&body)?;
            if tail.page_type != PageType::Extend || !tail.active {
                return Err(TreeError::InvalidFormat(format!(
                    "page {extend} chained from leaf {offset} is not an active extend page"
                )));
            }
            node.keys.append(&mut tail.keys);
            node.records.append(&mut tail.records);
            node.extend_pages = self
                .geometry
                .extend_pages_for((LEN_PREFIX_SIZE + body.len()) as u64);
        }
        Ok(())
    }

    /// Read the record body at `offset`; `None` if the slot was never written.
    fn read_body(&self, offset: Offset) -> Result<Option<Vec<u8>>, TreeError> {
        let mut prefix = [0u8; LEN_PREFIX_SIZE];
        self.file.read_at(&mut prefix, offset)?;
        let len = u64::from_le_bytes(prefix);
        if len == 0 {
            return Ok(None);
        }

        let available = self
            .file
            .len()?
            .saturating_sub(offset + LEN_PREFIX_SIZE as u64);
        if len > available {
            return Err(NodeError::LengthExceedsPage {
                offset,
                len,
                budget: available,
            }
            .into());
        }

        let mut body = vec![0u8; len as usize];
        self.file
            .read_at(&mut body, offset + LEN_PREFIX_SIZE as u64)?;
        Ok(Some(body))
    }

    fn check_budget(
        &self,
        offset: Offset,
        page_type: PageType,
        body_len: usize,
    ) -> Result<(), TreeError> {
        let budget = match page_type {
            PageType::Index => self.geometry.index_page_size(),
            PageType::Data => self.geometry.data_page_size(),
            PageType::Extend => return Ok(()),
        };
        let len = (LEN_PREFIX_SIZE + body_len) as u64;
        if len > budget {
            return Err(NodeError::LengthExceedsPage {
                offset,
                len,
                budget,
            }
            .into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::node_pool::DEFAULT_POOL_CAPACITY;
    use crate::storage::allocator::DEFAULT_MAX_FREE_BLOCKS;
    use tempfile::tempdir;

    fn create_store() -> (tempfile::TempDir, NodeStore) {
        let dir = tempdir().expect("create temp dir");
        let file = TreeFile::open(&dir.path().join("store.bpt")).expect("open file");
        let geometry = PageGeometry::default();
        let allocator = FreeSpaceAllocator::new(geometry, 0, DEFAULT_MAX_FREE_BLOCKS);
        let store = NodeStore::new(file, allocator, geometry, NodePool::new(DEFAULT_POOL_CAPACITY));
        (dir, store)
    }

    #[test]
    fn test_store_leaf_roundtrip() {
        let (_dir, mut store) = create_store();
        let mut leaf = store.new_data_node().expect("alloc leaf");
        leaf.keys.extend([1, 2, 3]);
        leaf.records.extend([b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        store.flush(&mut leaf).expect("flush");

        let loaded = store.checkout(leaf.self_offset).expect("load");
        assert_eq!(*loaded, *leaf);
        assert_eq!(loaded.extend_page, INVALID_OFFSET);
    }

    #[test]
    fn test_store_oversized_leaf_uses_extend_page() {
        let (_dir, mut store) = create_store();
        let mut leaf = store.new_data_node().expect("alloc leaf");
        for key in 0..5 {
            leaf.keys.push(key);
            leaf.records.push(vec![key as u8; 3000]);
        }
        store.flush(&mut leaf).expect("flush");
        assert_ne!(leaf.extend_page, INVALID_OFFSET);
        assert_eq!(leaf.extend_pages, 2);
        assert_eq!(leaf.len(), 5, "flush keeps the logical leaf intact");

        let loaded = store.checkout(leaf.self_offset).expect("load");
        assert_eq!(loaded.keys, vec![0, 1, 2, 3, 4]);
        assert_eq!(loaded.records[4], vec![4u8; 3000]);
        assert_eq!(loaded.extend_page, leaf.extend_page);
        assert_eq!(loaded.extend_pages, 2);
    }

    #[test]
    fn test_store_extend_page_reused_when_size_matches() {
        let (_dir, mut store) = create_store();
        let mut leaf = store.new_data_node().expect("alloc leaf");
        leaf.keys.push(1);
        leaf.records.push(vec![1; 1000]);
        store.flush(&mut leaf).expect("flush");
        let first = leaf.extend_page;
        assert_ne!(first, INVALID_OFFSET);

        leaf.records[0] = vec![2; 1200];
        store.flush(&mut leaf).expect("flush again");
        assert_eq!(leaf.extend_page, first);

        // Growing past one data page moves the tail to a two-page run.
        leaf.records[0] = vec![3; 9000];
        store.flush(&mut leaf).expect("flush larger");
        assert_eq!(leaf.extend_pages, 2);
        let data_pages = store.allocator().free_data_pages();
        assert!(!data_pages.contains(&leaf.extend_page));
        assert!(!data_pages.contains(&(leaf.extend_page + 8192)));

        let loaded = store.checkout(leaf.self_offset).expect("load");
        assert_eq!(loaded.records[0], vec![3; 9000]);
    }

    #[test]
    fn test_store_extend_page_freed_when_leaf_shrinks() {
        let (_dir, mut store) = create_store();
        let mut leaf = store.new_data_node().expect("alloc leaf");
        leaf.keys.push(1);
        leaf.records.push(vec![1; 500]);
        store.flush(&mut leaf).expect("flush");
        let extend = leaf.extend_page;

        leaf.records[0] = b"small".to_vec();
        store.flush(&mut leaf).expect("flush small");
        assert_eq!(leaf.extend_page, INVALID_OFFSET);
        assert!(store.allocator().free_data_pages().contains(&extend));

        let mut scratch = Node::default();
        let found = store.read_header(extend, &mut scratch).expect("read header");
        assert!(matches!(found, SlotHeader::Page { active: false, .. }));
    }

    #[test]
    fn test_store_release_marks_inactive() {
        let (_dir, mut store) = create_store();
        let mut node = store.new_index_node().expect("alloc index");
        node.keys.push(9);
        node.children.push(8192);
        store.flush(&mut node).expect("flush");

        store.release(&node).expect("release");
        // The freed slot and its carved neighbour merge back into a data page,
        // and the lead slot's marker now covers both.
        assert_eq!(store.allocator().free_data_pages()[0], node.self_offset);
        assert!(store.allocator().free_index_pages().is_empty());

        let mut scratch = Node::default();
        let found = store.read_header(node.self_offset, &mut scratch).expect("read header");
        assert_eq!(
            found,
            SlotHeader::Page {
                active: false,
                page_type: PageType::Data,
                parent: INVALID_OFFSET,
                footprint: 8192,
            }
        );
    }

    #[test]
    fn test_store_carved_slots_get_markers() {
        let (_dir, mut store) = create_store();
        let node = store.new_index_node().expect("alloc index");
        let sibling = node.self_offset + 4096;
        assert!(store.allocator().free_index_pages().contains(&sibling));

        let mut scratch = Node::default();
        let found = store.read_header(sibling, &mut scratch).expect("read header");
        assert!(matches!(
            found,
            SlotHeader::Page {
                active: false,
                page_type: PageType::Index,
                ..
            }
        ));
    }

    #[test]
    fn test_store_unwritten_slot() {
        let (_dir, mut store) = create_store();
        let _leaf = store.new_data_node().expect("alloc leaf");
        assert!(store.file().len().expect("len") >= 8192);

        let mut scratch = Node::default();
        assert_eq!(store.read_header(0, &mut scratch).expect("read header"), SlotHeader::Unwritten);
    }

    #[test]
    fn test_store_rejects_oversized_length() {
        let (_dir, mut store) = create_store();
        let leaf = store.new_data_node().expect("alloc leaf");
        store
            .file()
            .write_at(&u64::MAX.to_le_bytes(), leaf.self_offset)
            .expect("corrupt");

        let err = store.checkout(leaf.self_offset).expect_err("should fail");
        assert!(matches!(
            err,
            TreeError::Node(NodeError::LengthExceedsPage { .. })
        ));
    }

    #[test]
    fn test_store_pool_balanced() {
        let (_dir, mut store) = create_store();
        {
            let mut leaf = store.new_data_node().expect("alloc leaf");
            leaf.keys.push(1);
            leaf.records.push(vec![0; 400]);
            store.flush(&mut leaf).expect("flush");
            let _loaded = store.checkout(leaf.self_offset).expect("load");
        }
        assert_eq!(store.pool().outstanding(), 0);
    }
}
