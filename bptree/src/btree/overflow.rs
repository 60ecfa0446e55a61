//! Splitting an oversized leaf between its data page and an Extend page.
//!
//! A leaf whose record does not fit in one data page keeps as many leading
//! entries as fit in the data page and moves the rest into a single Extend
//! page:
//!
//! ```text
//!   data page (dataPageSize)              Extend page (n * dataPageSize)
//! +----------------------------+        +-----------------------------------+
//! | header | keys[..h] | recs  | -----> | header | keys[h..] | recs (u32 len)|
//! +----------------------------+ extend +-----------------------------------+
//! ```
//!
//! The Extend page is sized to the tail it holds, so its footprint can always
//! be recovered from its declared length.

use crate::btree::node::{FIXED_BODY_SIZE, LEN_PREFIX_SIZE, MAX_INLINE_RECORD_LEN, Node};
use crate::storage::page::PageGeometry;

/// Where to cut a leaf and how large its Extend page must be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtendPlan {
    /// Number of leading entries kept on the data page.
    pub head: usize,
    /// Encoded size of the Extend record, including its length prefix.
    pub tail_len: usize,
    /// Size of the Extend page in data pages.
    pub pages: u64,
}

/// Plan the split of `leaf` across its data page and an Extend page.
///
/// The head may be empty when even the first record cannot stay inline.
#[must_use]
pub fn plan_extend_split(leaf: &Node, geometry: &PageGeometry) -> ExtendPlan {
    let capacity = usize::try_from(geometry.data_page_size()).unwrap_or(usize::MAX);

    let mut used = LEN_PREFIX_SIZE + FIXED_BODY_SIZE;
    let mut head = 0;
    for record in &leaf.records {
        if record.len() > MAX_INLINE_RECORD_LEN {
            break;
        }
        let entry = 8 + 1 + record.len();
        if used + entry > capacity {
            break;
        }
        used += entry;
        head += 1;
    }

    let tail_len = LEN_PREFIX_SIZE
        + FIXED_BODY_SIZE
        + leaf.records[head..]
            .iter()
            .map(|record| 8 + 4 + record.len())
            .sum::<usize>();

    ExtendPlan {
        head,
        tail_len,
        pages: geometry.extend_pages_for(tail_len as u64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::PageType;

    fn leaf_with(records: Vec<Vec<u8>>) -> Node {
        Node {
            active: true,
            is_leaf: true,
            keys: (0..records.len() as u64).collect(),
            records,
            ..Node::default()
        }
    }

    /// Encode the head and tail exactly as the store does and check the plan.
    fn check_plan(leaf: &Node, plan: ExtendPlan, geometry: &PageGeometry) {
        let mut head = leaf.clone();
        let mut tail = Node {
            page_type: PageType::Extend,
            is_leaf: true,
            ..Node::default()
        };
        head.split_into(&mut tail, plan.head);

        let data_page = usize::try_from(geometry.data_page_size()).expect("usize");
        head.encode(data_page).expect("head fits in a data page");
        assert_eq!(tail.encoded_len(), plan.tail_len);
        let extent = usize::try_from(plan.pages * geometry.data_page_size()).expect("usize");
        tail.encode(extent).expect("tail fits in the extend page");
    }

    #[test]
    fn test_plan_many_small_records() {
        let geometry = PageGeometry::default();
        let leaf = leaf_with(vec![vec![7; 200]; 60]);
        let plan = plan_extend_split(&leaf, &geometry);

        // (8192 - 54) / (8 + 1 + 200) = 38 entries fit inline.
        assert_eq!(plan.head, 38);
        assert_eq!(plan.pages, 1);
        check_plan(&leaf, plan, &geometry);
    }

    #[test]
    fn test_plan_stops_at_long_record() {
        let geometry = PageGeometry::default();
        let leaf = leaf_with(vec![vec![1; 10], vec![2; 300], vec![3; 10]]);
        let plan = plan_extend_split(&leaf, &geometry);

        assert_eq!(plan.head, 1);
        check_plan(&leaf, plan, &geometry);
    }

    #[test]
    fn test_plan_empty_head() {
        let geometry = PageGeometry::default();
        let leaf = leaf_with(vec![vec![9; 20_000], vec![1; 5]]);
        let plan = plan_extend_split(&leaf, &geometry);

        assert_eq!(plan.head, 0);
        assert_eq!(plan.pages, 3);
        check_plan(&leaf, plan, &geometry);
    }
}
