//! Rediscovering a tree from its file on open.
//!
//! The file carries no header, so opening a non-empty file scans it page by
//! page. Every slot starts with either zeroes (never written) or a page record,
//! and each record's type and length tell how far to step to the next one.
//!
//! # Recovery Process
//!
//! 1. Scan from offset 0 to the first active page
//! 2. Follow `parent` pointers from it up to the root
//! 3. Scan the whole file again, staging every inactive or unwritten slot
//! 4. Follow the pointers of every active page; any page they reach that the
//!    scan strode over is live, and its slots are never staged
//! 5. Sort the staged slots into the allocator's free lists and re-mark them

use std::collections::HashSet;

use crate::btree::node::Node;
use crate::btree::store::{NodeStore, SlotHeader};
use crate::btree::tree::TreeError;
use crate::storage::page::{INVALID_OFFSET, Offset};

/// Counters from a free-list rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecoveryResult {
    /// Number of records (and unwritten slots) visited.
    pub pages_scanned: usize,
    /// Number of active pages skipped.
    pub active_pages: usize,
    /// Number of index-page-sized slots handed to the allocator.
    pub free_slots: usize,
    /// Live pages reached only through another page's pointers.
    pub hidden_pages: usize,
}

/// Find the root of the tree stored in `store`'s file.
///
/// # Errors
///
/// `InvalidFormat` if the file holds no active page, if a parent pointer
/// leads to an inactive page, or if the parent chain does not terminate.
pub fn locate_root(store: &NodeStore) -> Result<Offset, TreeError> {
    let mut node = Node::default();
    let mut first_active = None;
    scan(store, &mut node, |offset, header, _| {
        if matches!(header, SlotHeader::Page { active: true, .. }) {
            first_active = Some(offset);
            return false;
        }
        true
    })?;

    let Some(mut offset) = first_active else {
        return Err(TreeError::InvalidFormat(
            "file holds no active page".to_string(),
        ));
    };

    let max_steps = store.file().len()? / store.geometry().index_page_size() + 1;
    for _ in 0..max_steps {
        let SlotHeader::Page { active, parent, .. } = store.read_header(offset, &mut node)? else {
            return Err(TreeError::InvalidFormat(format!(
                "parent chain reaches unwritten slot {offset}"
            )));
        };
        if !active {
            return Err(TreeError::InvalidFormat(format!(
                "parent chain reaches inactive page {offset}"
            )));
        }
        if parent == INVALID_OFFSET {
            tracing::debug!("located root at {offset}");
            return Ok(offset);
        }
        offset = parent;
    }

    Err(TreeError::InvalidFormat(format!(
        "parent chain does not terminate after {max_steps} steps"
    )))
}

/// Rebuild the allocator's free lists from the inactive and unwritten slots
/// in the file, then pad them to `max_free_blocks`.
///
/// A slot is never staged if an active page's child, parent, sibling or
/// extend pointer leads to a live page covering it, even when a stale marker
/// made the scan stride over that page.
pub fn rebuild_free_lists(
    store: &mut NodeStore,
    max_free_blocks: usize,
) -> Result<RecoveryResult, TreeError> {
    let file_len = store.file().len()?;
    let index_page_size = store.geometry().index_page_size();
    let mut result = RecoveryResult::default();
    let mut free = Vec::new();
    let mut seen = HashSet::new();
    let mut pending = Vec::new();

    let mut node = Node::default();
    scan(store, &mut node, |offset, header, node| {
        result.pages_scanned += 1;
        match header {
            SlotHeader::Unwritten => free.push(offset),
            SlotHeader::Page { active: true, .. } => {
                result.active_pages += 1;
                seen.insert(offset);
                pending.extend(references(node));
            }
            SlotHeader::Page {
                active: false,
                footprint,
                ..
            } => {
                for slot in 0..footprint / index_page_size {
                    free.push(offset + slot * index_page_size);
                }
            }
        }
        true
    })?;

    let mut hidden = Vec::new();
    while let Some(offset) = pending.pop() {
        if offset.saturating_add(index_page_size) > file_len || !seen.insert(offset) {
            continue;
        }
        if let SlotHeader::Page {
            active: true,
            footprint,
            ..
        } = store.read_header(offset, &mut node)?
        {
            tracing::warn!("live page {offset} was hidden from the scan by a stale marker");
            hidden.push(offset..offset + footprint);
            pending.extend(references(&node));
        }
    }
    free.retain(|slot| !hidden.iter().any(|range| range.contains(slot)));
    result.hidden_pages = hidden.len();
    result.active_pages += hidden.len();

    let allocator = store.allocator_mut();
    for &offset in &free {
        allocator.stage(offset);
    }
    allocator.pad(max_free_blocks);
    store.sync_allocation()?;

    result.free_slots = free.len();
    tracing::info!(
        "recovered free lists: {} records scanned, {} active, {} free slots",
        result.pages_scanned,
        result.active_pages,
        result.free_slots
    );
    Ok(result)
}

/// Every page `node` points at.
fn references(node: &Node) -> impl Iterator<Item = Offset> + '_ {
    let extend = if node.is_leaf { node.extend_page } else { INVALID_OFFSET };
    node.children
        .iter()
        .copied()
        .chain([node.parent, node.next, node.prev, extend])
        .filter(|&offset| offset != INVALID_OFFSET)
}

/// Visit every record from offset 0 until `visit` returns `false` or the
/// file ends. `visit` sees the decoded record for written slots.
pub(crate) fn scan(
    store: &NodeStore,
    node: &mut Node,
    mut visit: impl FnMut(Offset, SlotHeader, &Node) -> bool,
) -> Result<(), TreeError> {
    let file_len = store.file().len()?;
    let index_page_size = store.geometry().index_page_size();

    let mut offset = 0;
    while offset + index_page_size <= file_len {
        let header = store.read_header(offset, node)?;
        if !visit(offset, header, node) {
            break;
        }
        offset += match header {
            SlotHeader::Unwritten => index_page_size,
            SlotHeader::Page { footprint, .. } => footprint,
        };
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::node_pool::{DEFAULT_POOL_CAPACITY, NodePool};
    use crate::storage::allocator::{DEFAULT_MAX_FREE_BLOCKS, FreeSpaceAllocator};
    use crate::storage::file::TreeFile;
    use crate::storage::page::{PageGeometry, PageType};
    use std::path::Path;
    use tempfile::tempdir;

    fn open_store(path: &Path) -> NodeStore {
        let file = TreeFile::open(path).expect("open file");
        let geometry = PageGeometry::default();
        let file_len = file.len().expect("len");
        let allocator = FreeSpaceAllocator::new(geometry, file_len, DEFAULT_MAX_FREE_BLOCKS);
        NodeStore::new(file, allocator, geometry, NodePool::new(DEFAULT_POOL_CAPACITY))
    }

    /// Root index node over two leaves, the second one with an extend page.
    fn build_small_tree(store: &mut NodeStore) -> (Offset, Offset, Offset) {
        let mut left = store.new_data_node().expect("left leaf");
        let mut right = store.new_data_node().expect("right leaf");
        let mut root = store.new_index_node().expect("root");

        left.keys.extend([1, 2]);
        left.records.extend([b"a".to_vec(), b"b".to_vec()]);
        right.keys.extend([3, 4]);
        right.records.extend([vec![3; 6000], vec![4; 6000]]);
        left.next = right.self_offset;
        right.prev = left.self_offset;
        left.parent = root.self_offset;
        right.parent = root.self_offset;
        root.keys.extend([2, 4]);
        root.children.extend([left.self_offset, right.self_offset]);

        store.flush(&mut left).expect("flush left");
        store.flush(&mut right).expect("flush right");
        store.flush(&mut root).expect("flush root");
        store.file().sync().expect("sync");
        (root.self_offset, left.self_offset, right.self_offset)
    }

    #[test]
    fn test_recovery_locates_root() {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("tree.bpt");
        let (root, _, _) = build_small_tree(&mut open_store(&path));

        let store = open_store(&path);
        assert_eq!(locate_root(&store).expect("locate root"), root);
    }

    #[test]
    fn test_recovery_root_found_through_extend_page() {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("tree.bpt");
        let mut store = open_store(&path);

        // Free the lowest data page so the extend page lands below its leaf.
        let placeholder = store.new_data_node().expect("placeholder");
        let mut root = store.new_index_node().expect("root");
        let mut leaf = store.new_data_node().expect("leaf");
        store.release(&placeholder).expect("release placeholder");

        leaf.parent = root.self_offset;
        leaf.keys.push(9);
        leaf.records.push(vec![9; 5000]);
        root.keys.push(9);
        root.children.push(leaf.self_offset);
        store.flush(&mut leaf).expect("flush leaf");
        store.flush(&mut root).expect("flush root");
        assert_eq!(leaf.extend_page, placeholder.self_offset);
        assert!(leaf.extend_page < leaf.self_offset);

        let reopened = open_store(&path);
        assert_eq!(locate_root(&reopened).expect("locate root"), root.self_offset);
    }

    #[test]
    fn test_recovery_no_active_page() {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("tree.bpt");
        {
            let mut store = open_store(&path);
            let leaf = store.new_data_node().expect("leaf");
            store.release(&leaf).expect("release");
        }

        let store = open_store(&path);
        let err = locate_root(&store).expect_err("no root");
        assert!(matches!(err, TreeError::InvalidFormat(_)));
    }

    #[test]
    fn test_recovery_rejects_parent_cycle() {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("tree.bpt");
        {
            let mut store = open_store(&path);
            let mut a = store.new_data_node().expect("a");
            let mut b = store.new_data_node().expect("b");
            a.parent = b.self_offset;
            b.parent = a.self_offset;
            store.flush(&mut a).expect("flush a");
            store.flush(&mut b).expect("flush b");
        }

        let store = open_store(&path);
        let err = locate_root(&store).expect_err("cycle");
        assert!(matches!(err, TreeError::InvalidFormat(_)));
    }

    #[test]
    fn test_recovery_rebuilds_free_lists() {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("tree.bpt");
        let (_, left, right) = {
            let mut store = open_store(&path);
            let offsets = build_small_tree(&mut store);
            let spare = store.new_data_node().expect("spare");
            store.release(&spare).expect("release spare");
            offsets
        };

        let mut store = open_store(&path);
        let result = rebuild_free_lists(&mut store, DEFAULT_MAX_FREE_BLOCKS).expect("rebuild");
        assert_eq!(result.active_pages, 4, "two leaves, one extend page, one root");
        assert_eq!(result.hidden_pages, 0);
        assert!(result.free_slots > 0);

        let allocator = store.allocator();
        for offset in [left, right] {
            assert!(!allocator.free_data_pages().contains(&offset));
            assert!(!allocator.free_index_pages().contains(&offset));
        }

        // Allocations after recovery never land on live pages.
        let root = locate_root(&store).expect("locate root");
        for _ in 0..20 {
            let node = store.new_data_node().expect("alloc");
            assert!(![left, right, root].contains(&node.self_offset));
        }
    }

    #[test]
    fn test_recovery_marks_stale_slots() {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("tree.bpt");
        let released = {
            let mut store = open_store(&path);
            let mut keep = store.new_data_node().expect("keep");
            keep.keys.push(1);
            keep.records.push(b"x".to_vec());
            store.flush(&mut keep).expect("flush keep");
            let gone = store.new_data_node().expect("gone");
            store.release(&gone).expect("release");
            gone.self_offset
        };

        let mut store = open_store(&path);
        rebuild_free_lists(&mut store, DEFAULT_MAX_FREE_BLOCKS).expect("rebuild");

        // A freed data page carved into index pages leaves every slot parseable.
        let first = store.new_index_node().expect("index");
        let second = store.new_index_node().expect("index");
        assert_eq!(first.self_offset, released);
        assert_eq!(second.self_offset, released + 4096);
        let mut scratch = Node::default();
        assert!(matches!(
            store.read_header(second.self_offset, &mut scratch).expect("read header"),
            SlotHeader::Page { active: false, .. } | SlotHeader::Unwritten
        ));
    }

    #[test]
    fn test_recovery_keeps_page_hidden_by_stale_marker() {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("tree.bpt");
        let (root, leaf) = {
            let mut store = open_store(&path);
            let stale = store.new_index_node().expect("stale slot");
            let mut root = store.new_index_node().expect("root");
            let mut leaf = store.new_data_node().expect("leaf");
            assert_eq!(root.self_offset, stale.self_offset + 4096);

            leaf.parent = root.self_offset;
            leaf.keys.push(5);
            leaf.records.push(b"five".to_vec());
            root.keys.push(5);
            root.children.push(leaf.self_offset);
            store.flush(&mut leaf).expect("flush leaf");
            store.flush(&mut root).expect("flush root");

            // A data-page marker left in the slot before the root spans it.
            let mut marker = Node::default();
            marker.mark_inactive(PageType::Data, stale.self_offset);
            let buf = marker.encode(4096).expect("encode marker");
            store.file().write_at(&buf, stale.self_offset).expect("write marker");
            (root.self_offset, leaf.self_offset)
        };

        let mut store = open_store(&path);
        assert_eq!(locate_root(&store).expect("locate root"), root);
        let result = rebuild_free_lists(&mut store, DEFAULT_MAX_FREE_BLOCKS).expect("rebuild");
        assert_eq!(result.hidden_pages, 1);
        assert_eq!(result.active_pages, 2);
        assert!(!store.allocator().free_index_pages().contains(&root));
        assert!(!store.allocator().free_data_pages().contains(&root));

        let mut scratch = Node::default();
        let header = store.read_header(root, &mut scratch).expect("read header");
        assert!(matches!(header, SlotHeader::Page { active: true, .. }));
        let header = store.read_header(root - 4096, &mut scratch).expect("read header");
        assert!(matches!(
            header,
            SlotHeader::Page {
                active: false,
                page_type: PageType::Index,
                ..
            }
        ));
        drop(store);

        // The re-marked slot no longer hides the root from the next scan.
        let mut store = open_store(&path);
        let result = rebuild_free_lists(&mut store, DEFAULT_MAX_FREE_BLOCKS).expect("rebuild");
        assert_eq!(result.hidden_pages, 0);
        assert_eq!(result.active_pages, 2);
        assert_eq!(store.checkout(leaf).expect("load leaf").records, vec![b"five".to_vec()]);
    }
}
